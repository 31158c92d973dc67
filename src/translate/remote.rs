//! Remote inference backend speaking the Hugging Face Inference API shape.
//! Building an engine checks `GET {base}/models/{model_id}`; translating posts
//! `{"inputs", "parameters": {"max_length"}}` to the same URL and reads
//! `[{"translation_text"}]`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Engine, EngineError, EngineFactory, EngineLoadError, LanguagePair};

/// Builds [`RemoteEngine`]s that share one pooled HTTP client.
pub struct RemoteEngineFactory {
    http: reqwest::Client,
    base_url: String,
    model_base_path: String,
    token: Option<Arc<str>>,
}

impl RemoteEngineFactory {
    pub fn new(
        base_url: &str,
        model_base_path: &str,
        token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(8)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model_base_path: model_base_path.to_string(),
            token: token.map(Arc::from),
        })
    }

    fn model_url(&self, pair: &LanguagePair) -> String {
        format!("{}/models/{}", self.base_url, pair.model_id(&self.model_base_path))
    }
}

fn authorized(req: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
    match token {
        Some(token) => req.bearer_auth(token),
        None => req,
    }
}

#[async_trait]
impl EngineFactory for RemoteEngineFactory {
    async fn build(&self, pair: &LanguagePair) -> Result<Arc<dyn Engine>, EngineLoadError> {
        let url = self.model_url(pair);
        debug!(url = %url, "probing model");

        let resp = authorized(self.http.get(&url), self.token.as_deref())
            .send()
            .await
            .map_err(|e| EngineLoadError::unavailable(pair.clone(), e.to_string()))?;

        match resp.status() {
            s if s.is_success() => Ok(Arc::new(RemoteEngine {
                http: self.http.clone(),
                url,
                token: self.token.clone(),
            })),
            StatusCode::NOT_FOUND => Err(EngineLoadError::unsupported(
                pair.clone(),
                format!("model {} not found", pair.model_id(&self.model_base_path)),
            )),
            s => Err(EngineLoadError::unavailable(
                pair.clone(),
                format!("model lookup returned {s}"),
            )),
        }
    }
}

#[derive(Serialize)]
struct InferenceRequest<'a> {
    inputs: &'a str,
    parameters: InferenceParameters,
}

#[derive(Serialize)]
struct InferenceParameters {
    max_length: usize,
}

#[derive(Deserialize)]
struct InferenceOutput {
    translation_text: String,
}

/// One model endpoint. Stateless on our side, so concurrent calls are fine.
pub struct RemoteEngine {
    http: reqwest::Client,
    url: String,
    token: Option<Arc<str>>,
}

#[async_trait]
impl Engine for RemoteEngine {
    async fn translate(&self, text: &str, max_length: usize) -> Result<String, EngineError> {
        let body = InferenceRequest {
            inputs: text,
            parameters: InferenceParameters { max_length },
        };
        let resp = authorized(self.http.post(&self.url), self.token.as_deref())
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Backend(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            warn!(url = %self.url, status = status.as_u16(), "inference call failed");
            return Err(EngineError::Backend(format!(
                "unexpected status {}: {}",
                status,
                body_text.chars().take(200).collect::<String>()
            )));
        }

        let outputs: Vec<InferenceOutput> = resp
            .json()
            .await
            .map_err(|e| EngineError::Backend(format!("malformed inference response: {e}")))?;
        outputs
            .into_iter()
            .next()
            .map(|o| o.translation_text)
            .ok_or(EngineError::EmptyOutput)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_url_joins_base_and_model_id() {
        let factory = RemoteEngineFactory::new(
            "http://localhost:8080/",
            "Helsinki-NLP/opus-mt",
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            factory.model_url(&LanguagePair::new("en", "es")),
            "http://localhost:8080/models/Helsinki-NLP/opus-mt-en-es"
        );
    }

    #[test]
    fn request_body_shape() {
        let body = InferenceRequest {
            inputs: "Hello",
            parameters: InferenceParameters { max_length: 400 },
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({"inputs": "Hello", "parameters": {"max_length": 400}})
        );
    }
}
