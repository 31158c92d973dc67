//! Request pipeline: admit → validate → resolve engine → invoke → result.
//! Each stage short-circuits with its own `TranslateError` variant.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::{Config, ConfigError, TRANSLATE_ROUTE};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::ratelimit::{RateLimitExceeded, RateLimiter};
use crate::translate::cache::EngineCache;
use crate::translate::validate::Validator;
use crate::translate::{
    EngineFactory, LanguagePair, SerializingFactory, TranslateError, TranslationRequest,
    TranslationResult,
};

pub struct Dispatcher {
    limiter: Arc<RateLimiter>,
    validator: Validator,
    cache: EngineCache,
    metrics: Arc<MetricsRegistry>,
    max_output_length: usize,
    invoke_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        limiter: Arc<RateLimiter>,
        validator: Validator,
        cache: EngineCache,
        metrics: Arc<MetricsRegistry>,
        max_output_length: usize,
        invoke_timeout: Duration,
    ) -> Self {
        Self {
            limiter,
            validator,
            cache,
            metrics,
            max_output_length,
            invoke_timeout,
        }
    }

    /// Wire every component from `config` around `factory`.
    pub fn from_config(
        config: &Config,
        factory: Arc<dyn EngineFactory>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let factory: Arc<dyn EngineFactory> = if config.serialize_engine_calls {
            Arc::new(SerializingFactory::new(factory))
        } else {
            factory
        };
        let cache = EngineCache::new(
            factory,
            config.capacity()?,
            config.build_timeout,
            Arc::clone(&metrics),
        );
        Ok(Self::new(
            Arc::new(config.rate_limits.build_limiter()),
            Validator::new(config.max_text_length),
            cache,
            metrics,
            config.max_output_length,
            config.invoke_timeout,
        ))
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn cache(&self) -> &EngineCache {
        &self.cache
    }

    /// Admission check alone, for requests rejected before they reach `handle`.
    pub fn admit(&self, client: &str) -> Result<(), RateLimitExceeded> {
        match self.limiter.admit(client, TRANSLATE_ROUTE) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.metrics.incr(metric_names::RATE_LIMITED);
                warn!(
                    client,
                    limit = %e.quota,
                    retry_after_secs = e.retry_after_secs(),
                    "rate_limited"
                );
                Err(e)
            }
        }
    }

    /// Run one request through the pipeline. Request time is recorded
    /// whichever stage ends it.
    pub async fn handle(
        &self,
        client: &str,
        request: TranslationRequest,
    ) -> Result<TranslationResult, TranslateError> {
        let request_span = self.metrics.span(metric_names::REQUEST_DONE);
        let outcome = self.process(client, request).await;
        request_span.finish();
        outcome
    }

    async fn process(
        &self,
        client: &str,
        request: TranslationRequest,
    ) -> Result<TranslationResult, TranslateError> {
        self.admit(client)?;

        if let Err(e) =
            self.validator
                .validate(&request.text, &request.source_lang, &request.target_lang)
        {
            self.metrics.incr(metric_names::VALIDATION_REJECTED);
            info!(reason = %e, "validation_rejected");
            return Err(e.into());
        }

        let pair = LanguagePair::new(request.source_lang, request.target_lang);
        let engine = self.cache.resolve(&pair).await?;

        let invoke_span = self.metrics.span(metric_names::ENGINE_INVOKE);
        let call = engine.translate(&request.text, self.max_output_length);
        let translated = match tokio::time::timeout(self.invoke_timeout, call).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                error!(pair = %pair, error = %e, "translation_failed");
                return Err(TranslateError::Internal(e.to_string()));
            }
            Err(_) => {
                error!(
                    pair = %pair,
                    timeout_secs = self.invoke_timeout.as_secs_f64(),
                    "translation_timed_out"
                );
                return Err(TranslateError::Internal("engine invocation timed out".into()));
            }
        };
        let invoke_us = invoke_span.finish();

        self.metrics.incr(metric_names::TRANSLATED);
        info!(
            pair = %pair,
            input_chars = request.text.chars().count(),
            output_chars = translated.chars().count(),
            invoke_ms = invoke_us / 1000.0,
            "translation_succeeded"
        );

        Ok(TranslationResult {
            translated_text: translated,
            source_language: pair.source,
            target_language: pair.target,
        })
    }
}
