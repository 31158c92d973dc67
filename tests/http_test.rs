use std::sync::Arc;

use lingogate::config::{Config, RateLimitConfig};
use lingogate::server::AppState;
use lingogate::translate::stub::StubFactory;
use lingogate::translate::LanguagePair;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

struct TestServer {
    base: String,
    shutdown: CancellationToken,
    http: reqwest::Client,
}

impl TestServer {
    async fn start(config: Config, factory: StubFactory) -> Self {
        let state = AppState::new(&config, Arc::new(factory)).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(lingogate::serve(listener, state, shutdown.clone()));
        Self {
            base: format!("http://{addr}"),
            shutdown,
            http: reqwest::Client::new(),
        }
    }

    async fn translate(&self, body: Value) -> (u16, Option<String>, Value) {
        let resp = self
            .http
            .post(format!("{}/translate", self.base))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get("retry-after")
            .map(|v| v.to_str().unwrap().to_string());
        (status, retry_after, resp.json().await.unwrap())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn hola() -> StubFactory {
    StubFactory::new().with_phrase("Hello", "Hola")
}

#[tokio::test]
async fn translates_hello_to_hola() {
    let server = TestServer::start(Config::default(), hola()).await;
    let (status, _, body) = server
        .translate(json!({"text": "Hello", "source_language": "en", "target_language": "es"}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(
        body,
        json!({"translated_text": "Hola", "source_language": "en", "target_language": "es"})
    );
}

#[tokio::test]
async fn missing_languages_use_defaults() {
    let server = TestServer::start(Config::default(), hola()).await;
    let (status, _, body) = server.translate(json!({"text": "Hello"})).await;
    assert_eq!(status, 200);
    assert_eq!(body["source_language"], "en");
    assert_eq!(body["target_language"], "es");
}

#[tokio::test]
async fn empty_text_is_rejected() {
    let server = TestServer::start(Config::default(), hola()).await;
    let (status, _, body) = server
        .translate(json!({"text": "", "source_language": "en", "target_language": "es"}))
        .await;
    assert_eq!(status, 400);
    assert_eq!(body, json!({"error": "No text provided"}));

    let (status, _, body) = server.translate(json!({"source_language": "en"})).await;
    assert_eq!(status, 400);
    assert_eq!(body, json!({"error": "No text provided"}));
}

#[tokio::test]
async fn identical_languages_are_rejected() {
    let server = TestServer::start(Config::default(), hola()).await;
    let (status, _, body) = server
        .translate(json!({"text": "Hi", "source_language": "en", "target_language": "en"}))
        .await;
    assert_eq!(status, 400);
    assert_eq!(
        body,
        json!({"error": "Source and target languages must be different"})
    );
}

#[tokio::test]
async fn over_length_text_is_rejected_whatever_the_languages() {
    let server = TestServer::start(Config::default(), hola()).await;
    let long = "a".repeat(1001);
    for (src, tgt) in [("en", "es"), ("en", "en"), ("xx", "yy")] {
        let (status, _, body) = server
            .translate(json!({"text": long, "source_language": src, "target_language": tgt}))
            .await;
        assert_eq!(status, 400);
        assert_eq!(body, json!({"error": "Text exceeds maximum length of 1000"}));
    }
}

#[tokio::test]
async fn unsupported_pair_is_a_client_error() {
    let factory = hola().with_unsupported(LanguagePair::new("en", "tlh"));
    let server = TestServer::start(Config::default(), factory).await;
    let (status, _, body) = server
        .translate(json!({"text": "Hello", "source_language": "en", "target_language": "tlh"}))
        .await;
    assert_eq!(status, 400);
    assert_eq!(body, json!({"error": "Unsupported language pair: en-tlh"}));
}

#[tokio::test]
async fn backend_outage_is_a_server_error() {
    let server = TestServer::start(Config::default(), hola().with_failing_builds(1)).await;
    let req = json!({"text": "Hello", "source_language": "en", "target_language": "es"});

    let (status, _, body) = server.translate(req.clone()).await;
    assert_eq!(status, 500);
    assert_eq!(body, json!({"error": "Internal server error"}));

    // Failure was not cached.
    let (status, _, _) = server.translate(req).await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn eleventh_request_in_a_minute_gets_429() {
    let server = TestServer::start(Config::default(), hola()).await;
    let req = json!({"text": "Hello", "source_language": "en", "target_language": "es"});
    for _ in 0..10 {
        let (status, _, _) = server.translate(req.clone()).await;
        assert_eq!(status, 200);
    }
    let (status, retry_after, body) = server.translate(req).await;
    assert_eq!(status, 429);
    assert_eq!(body, json!({"error": "Rate limit exceeded: 10 per 1 minute"}));
    let secs: u64 = retry_after.expect("Retry-After header").parse().unwrap();
    assert!((1..=60).contains(&secs));
}

#[tokio::test]
async fn malformed_json_is_a_structured_400() {
    let server = TestServer::start(Config::default(), hola()).await;
    let resp = server
        .http
        .post(format!("{}/translate", server.base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"error": "Invalid JSON payload"}));
}

#[tokio::test]
async fn malformed_bodies_count_against_the_quota() {
    let config = Config {
        rate_limits: RateLimitConfig {
            per_day: 100,
            per_minute: 10,
            translate_per_minute: 1,
        },
        ..Config::default()
    };
    let server = TestServer::start(config, hola()).await;
    let resp = server
        .http
        .post(format!("{}/translate", server.base))
        .header("content-type", "application/json")
        .body("not json at all")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let (status, _, _) = server.translate(json!({"text": "Hello"})).await;
    assert_eq!(status, 429);
}

#[tokio::test]
async fn health_and_metrics_report_state() {
    let server = TestServer::start(Config::default(), hola()).await;
    server.translate(json!({"text": "Hello"})).await;
    server.translate(json!({"text": "Hello"})).await;

    let health: Value = server
        .http
        .get(format!("{}/health", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["cached_engines"], 1);
    assert_eq!(health["cache_capacity"], 5);
    assert_eq!(health["tracked_clients"], 1);

    let metrics: Value = server
        .http
        .get(format!("{}/metrics", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["counters"]["engine_cache_miss"], 1);
    assert_eq!(metrics["counters"]["engine_cache_hit"], 1);
    assert_eq!(metrics["counters"]["requests_translated"], 2);
    assert_eq!(metrics["histograms"]["t_request_done"]["count"], 2);
}

#[tokio::test]
async fn cors_headers_are_present() {
    let server = TestServer::start(Config::default(), hola()).await;
    let resp = server
        .http
        .post(format!("{}/translate", server.base))
        .header("origin", "http://example.com")
        .json(&json!({"text": "Hello"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(
        resp.headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );
}
