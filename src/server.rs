//! HTTP surface: `POST /translate`, `GET /metrics`, `GET /health`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info_span, warn, Instrument};

use crate::config::{Config, ConfigError};
use crate::dispatcher::Dispatcher;
use crate::metrics::{MetricsRegistry, MetricsSnapshot};
use crate::translate::{EngineFactory, TranslateError, TranslationRequest, TranslationResult};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Arc<MetricsRegistry>,
    default_source_lang: Arc<str>,
    default_target_lang: Arc<str>,
}

impl AppState {
    pub fn new(config: &Config, factory: Arc<dyn EngineFactory>) -> Result<Self, ConfigError> {
        let metrics = Arc::new(MetricsRegistry::new());
        let dispatcher = Dispatcher::from_config(config, factory, Arc::clone(&metrics))?;
        Ok(Self {
            dispatcher: Arc::new(dispatcher),
            metrics,
            default_source_lang: Arc::from(config.default_source_lang.as_str()),
            default_target_lang: Arc::from(config.default_target_lang.as_str()),
        })
    }
}

// ─── Wire types ──────────────────────────────────────────────

#[derive(Deserialize)]
struct TranslateBody {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    source_language: Option<String>,
    #[serde(default)]
    target_language: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

impl IntoResponse for TranslateError {
    fn into_response(self) -> Response {
        let status = match &self {
            TranslateError::Invalid(_) => StatusCode::BAD_REQUEST,
            TranslateError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            TranslateError::EngineLoad(e) if e.is_client_fault() => StatusCode::BAD_REQUEST,
            TranslateError::EngineLoad(_) | TranslateError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let mut resp = error_response(status, self.public_message());
        if let TranslateError::RateLimited(e) = &self {
            resp.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(e.retry_after_secs()));
        }
        resp
    }
}

// ─── Routes ──────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/translate", post(translate))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Handlers ────────────────────────────────────────────────

async fn translate(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Result<Json<TranslateBody>, JsonRejection>,
) -> Result<Json<TranslationResult>, Response> {
    let client = addr.ip().to_string();
    let request_id = uuid::Uuid::new_v4();
    let span = info_span!("translate", %request_id, client = %client);

    async move {
        let Json(body) = match body {
            Ok(body) => body,
            Err(rejection) => {
                // Malformed bodies still count against the client's quota.
                if let Err(e) = state.dispatcher.admit(&client) {
                    return Err(TranslateError::from(e).into_response());
                }
                warn!(error = %rejection.body_text(), "malformed_request_body");
                return Err(error_response(StatusCode::BAD_REQUEST, "Invalid JSON payload"));
            }
        };

        let request = TranslationRequest {
            text: body.text.unwrap_or_default(),
            source_lang: body
                .source_language
                .unwrap_or_else(|| state.default_source_lang.to_string()),
            target_lang: body
                .target_language
                .unwrap_or_else(|| state.default_target_lang.to_string()),
        };

        state
            .dispatcher
            .handle(&client, request)
            .await
            .map(Json)
            .map_err(IntoResponse::into_response)
    }
    .instrument(span)
    .await
}

async fn metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    cached_engines: usize,
    cache_capacity: usize,
    tracked_clients: usize,
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        cached_engines: state.dispatcher.cache().len(),
        cache_capacity: state.dispatcher.cache().capacity(),
        tracked_clients: state.dispatcher.limiter().tracked_clients(),
    })
}
