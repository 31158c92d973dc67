//! Translation engines: the capability trait, the factory that builds one
//! engine per language pair, and the request/result/error types that flow
//! through the dispatcher.

pub mod cache;
pub mod remote;
pub mod stub;
pub mod validate;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ratelimit::RateLimitExceeded;
use validate::ValidationError;

/// Ordered (source, target) language pair. Addresses one engine in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LanguagePair {
    pub source: String,
    pub target: String,
}

impl LanguagePair {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }

    /// Model identifier for this pair: `{base}-{source}-{target}`.
    pub fn model_id(&self, base: &str) -> String {
        format!("{}-{}-{}", base, self.source, self.target)
    }
}

impl fmt::Display for LanguagePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.source, self.target)
    }
}

/// Translation request, after defaults have been applied to missing languages.
#[derive(Debug, Clone)]
pub struct TranslationRequest {
    pub text: String,
    pub source_lang: String,
    pub target_lang: String,
}

/// Successful translation, serialized as the `/translate` response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationResult {
    pub translated_text: String,
    pub source_language: String,
    pub target_language: String,
}

/// Failure while invoking an already-built engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("engine backend error: {0}")]
    Backend(String),
    #[error("engine returned no translation")]
    EmptyOutput,
}

/// Why a factory could not produce an engine for a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadFailure {
    /// No model exists for the pair. The caller asked for something we cannot serve.
    Unsupported,
    /// The backend failed (network, disk, 5xx). Retrying later may succeed.
    Unavailable,
    /// Construction exceeded the build timeout.
    TimedOut,
}

impl fmt::Display for LoadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadFailure::Unsupported => write!(f, "unsupported"),
            LoadFailure::Unavailable => write!(f, "unavailable"),
            LoadFailure::TimedOut => write!(f, "timed out"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to load engine for {pair} ({kind}): {cause}")]
pub struct EngineLoadError {
    pub pair: LanguagePair,
    pub kind: LoadFailure,
    pub cause: String,
}

impl EngineLoadError {
    pub fn unsupported(pair: LanguagePair, cause: impl Into<String>) -> Self {
        Self {
            pair,
            kind: LoadFailure::Unsupported,
            cause: cause.into(),
        }
    }

    pub fn unavailable(pair: LanguagePair, cause: impl Into<String>) -> Self {
        Self {
            pair,
            kind: LoadFailure::Unavailable,
            cause: cause.into(),
        }
    }

    pub fn timed_out(pair: LanguagePair, after: Duration) -> Self {
        Self {
            pair,
            kind: LoadFailure::TimedOut,
            cause: format!("no engine after {}s", after.as_secs_f64()),
        }
    }

    /// True when the failure is the caller's fault (unsupported pair).
    pub fn is_client_fault(&self) -> bool {
        self.kind == LoadFailure::Unsupported
    }
}

/// Everything that can stop a `/translate` request.
#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),
    #[error(transparent)]
    EngineLoad(#[from] EngineLoadError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl TranslateError {
    /// Message safe to show the client. Server-side causes stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            TranslateError::Invalid(e) => e.to_string(),
            TranslateError::RateLimited(e) => format!("Rate limit exceeded: {}", e.quota),
            TranslateError::EngineLoad(e) if e.is_client_fault() => {
                format!("Unsupported language pair: {}", e.pair)
            }
            TranslateError::EngineLoad(_) | TranslateError::Internal(_) => {
                "Internal server error".to_string()
            }
        }
    }
}

/// One translation direction. Built once, then shared by every request for its pair.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn translate(&self, text: &str, max_length: usize) -> Result<String, EngineError>;
}

/// Builds engines. Construction is slow and may fail.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn build(&self, pair: &LanguagePair) -> Result<Arc<dyn Engine>, EngineLoadError>;
}

/// Serializes calls on one engine handle, for backends that are not safe to
/// invoke concurrently.
pub struct SerializedEngine {
    inner: Arc<dyn Engine>,
    gate: tokio::sync::Mutex<()>,
}

impl SerializedEngine {
    pub fn new(inner: Arc<dyn Engine>) -> Self {
        Self {
            inner,
            gate: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl Engine for SerializedEngine {
    async fn translate(&self, text: &str, max_length: usize) -> Result<String, EngineError> {
        let _turn = self.gate.lock().await;
        self.inner.translate(text, max_length).await
    }
}

/// Factory adapter that wraps every engine it builds in a [`SerializedEngine`].
pub struct SerializingFactory {
    inner: Arc<dyn EngineFactory>,
}

impl SerializingFactory {
    pub fn new(inner: Arc<dyn EngineFactory>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl EngineFactory for SerializingFactory {
    async fn build(&self, pair: &LanguagePair) -> Result<Arc<dyn Engine>, EngineLoadError> {
        let engine = self.inner.build(pair).await?;
        Ok(Arc::new(SerializedEngine::new(engine)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn model_id_follows_base_template() {
        let pair = LanguagePair::new("en", "es");
        assert_eq!(pair.model_id("Helsinki-NLP/opus-mt"), "Helsinki-NLP/opus-mt-en-es");
        assert_eq!(pair.to_string(), "en-es");
    }

    #[test]
    fn public_message_hides_server_faults() {
        let pair = LanguagePair::new("en", "xx");
        let unsupported = TranslateError::from(EngineLoadError::unsupported(pair.clone(), "404"));
        assert_eq!(unsupported.public_message(), "Unsupported language pair: en-xx");

        let down = TranslateError::from(EngineLoadError::unavailable(pair, "connection refused"));
        assert_eq!(down.public_message(), "Internal server error");

        let internal = TranslateError::Internal("boom".into());
        assert_eq!(internal.public_message(), "Internal server error");
    }

    /// Records the highest number of overlapping calls it has seen.
    struct OverlapCounter {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Engine for OverlapCounter {
        async fn translate(&self, text: &str, _max_length: usize) -> Result<String, EngineError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(text.to_string())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn serialized_engine_never_overlaps_calls() {
        let counter = Arc::new(OverlapCounter {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let engine = Arc::new(SerializedEngine::new(counter.clone()));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let engine = Arc::clone(&engine);
            tasks.push(tokio::spawn(async move {
                engine.translate(&format!("t{i}"), 400).await
            }));
        }
        for t in tasks {
            assert!(t.await.unwrap().is_ok());
        }
        assert_eq!(counter.peak.load(Ordering::SeqCst), 1);
    }
}
