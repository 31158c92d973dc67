//! Service configuration: defaults, environment overrides, validation.

use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::ratelimit::{Quota, RateLimiter};

/// Route name the translate quotas are registered under.
pub const TRANSLATE_ROUTE: &str = "/translate";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub per_day: u32,
    pub per_minute: u32,
    /// Extra per-minute ceiling on `/translate` only.
    pub translate_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_day: 100,
            per_minute: 10,
            translate_per_minute: 10,
        }
    }
}

impl RateLimitConfig {
    pub fn build_limiter(&self) -> RateLimiter {
        RateLimiter::new(vec![
            Quota::per_day(self.per_day),
            Quota::per_minute(self.per_minute),
        ])
        .with_route(TRANSLATE_ROUTE, vec![Quota::per_minute(self.translate_per_minute)])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub default_source_lang: String,
    pub default_target_lang: String,
    /// Upper bound on input length, in characters.
    pub max_text_length: usize,
    /// Prefix for model ids: `{model_base_path}-{src}-{tgt}`.
    pub model_base_path: String,
    pub cache_capacity: usize,
    /// Passed to every engine call as its output length cap.
    pub max_output_length: usize,
    pub rate_limits: RateLimitConfig,
    pub build_timeout: Duration,
    pub invoke_timeout: Duration,
    /// How often idle rate-limit buckets are swept.
    pub sweep_interval: Duration,
    /// Serialize calls on each engine handle.
    pub serialize_engine_calls: bool,
    pub inference_url: String,
    pub inference_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_source_lang: "en".into(),
            default_target_lang: "es".into(),
            max_text_length: 1000,
            model_base_path: "Helsinki-NLP/opus-mt".into(),
            cache_capacity: 5,
            max_output_length: 400,
            rate_limits: RateLimitConfig::default(),
            build_timeout: Duration::from_secs(120),
            invoke_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(300),
            serialize_engine_calls: false,
            inference_url: "https://api-inference.huggingface.co".into(),
            inference_token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

impl Config {
    /// Defaults overridden by process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each known key.
    /// Values that fail to parse keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Config::default();

        Self {
            default_source_lang: lookup("DEFAULT_SOURCE_LANG").unwrap_or(d.default_source_lang),
            default_target_lang: lookup("DEFAULT_TARGET_LANG").unwrap_or(d.default_target_lang),
            max_text_length: parse_or(&lookup, "MAX_TEXT_LENGTH", d.max_text_length),
            model_base_path: lookup("MODEL_BASE_PATH").unwrap_or(d.model_base_path),
            cache_capacity: parse_or(&lookup, "ENGINE_CACHE_CAPACITY", d.cache_capacity),
            max_output_length: parse_or(&lookup, "MAX_OUTPUT_LENGTH", d.max_output_length),
            rate_limits: RateLimitConfig {
                per_day: parse_or(&lookup, "RATE_LIMIT_PER_DAY", d.rate_limits.per_day),
                per_minute: parse_or(&lookup, "RATE_LIMIT_PER_MINUTE", d.rate_limits.per_minute),
                translate_per_minute: parse_or(
                    &lookup,
                    "RATE_LIMIT_TRANSLATE_PER_MINUTE",
                    d.rate_limits.translate_per_minute,
                ),
            },
            build_timeout: secs_or(&lookup, "ENGINE_BUILD_TIMEOUT_SECS", d.build_timeout),
            invoke_timeout: secs_or(&lookup, "ENGINE_INVOKE_TIMEOUT_SECS", d.invoke_timeout),
            sweep_interval: secs_or(&lookup, "RATE_LIMIT_SWEEP_SECS", d.sweep_interval),
            serialize_engine_calls: parse_flag(&lookup, "SERIALIZE_ENGINE_CALLS", d.serialize_engine_calls),
            inference_url: lookup("INFERENCE_URL").unwrap_or(d.inference_url),
            inference_token: lookup("INFERENCE_TOKEN").filter(|t| !t.is_empty()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("MAX_TEXT_LENGTH", self.max_text_length as u64),
            ("ENGINE_CACHE_CAPACITY", self.cache_capacity as u64),
            ("MAX_OUTPUT_LENGTH", self.max_output_length as u64),
            ("RATE_LIMIT_PER_DAY", self.rate_limits.per_day as u64),
            ("RATE_LIMIT_PER_MINUTE", self.rate_limits.per_minute as u64),
            ("RATE_LIMIT_TRANSLATE_PER_MINUTE", self.rate_limits.translate_per_minute as u64),
            ("ENGINE_BUILD_TIMEOUT_SECS", self.build_timeout.as_secs()),
            ("ENGINE_INVOKE_TIMEOUT_SECS", self.invoke_timeout.as_secs()),
            ("RATE_LIMIT_SWEEP_SECS", self.sweep_interval.as_secs()),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero(*name));
        }
        let non_empty = [
            ("DEFAULT_SOURCE_LANG", &self.default_source_lang),
            ("DEFAULT_TARGET_LANG", &self.default_target_lang),
            ("MODEL_BASE_PATH", &self.model_base_path),
            ("INFERENCE_URL", &self.inference_url),
        ];
        if let Some((name, _)) = non_empty.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(ConfigError::Empty(*name));
        }
        Ok(())
    }

    pub fn capacity(&self) -> Result<NonZeroUsize, ConfigError> {
        NonZeroUsize::new(self.cache_capacity).ok_or(ConfigError::Zero("ENGINE_CACHE_CAPACITY"))
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "unparsable config value, using default");
                default
            }
        },
    }
}

fn secs_or<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    Duration::from_secs(parse_or(lookup, key, default.as_secs()))
}

fn parse_flag<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => default,
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                warn!(key, value = %v, "unparsable flag, using default");
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_match_service_contract() {
        let c = Config::default();
        assert_eq!(c.default_source_lang, "en");
        assert_eq!(c.default_target_lang, "es");
        assert_eq!(c.max_text_length, 1000);
        assert_eq!(c.cache_capacity, 5);
        assert_eq!(c.max_output_length, 400);
        assert_eq!(c.rate_limits, RateLimitConfig::default());
        assert!(c.validate().is_ok());
    }

    #[test]
    fn env_overrides_apply() {
        let c = from_pairs(&[
            ("DEFAULT_TARGET_LANG", "fr"),
            ("MAX_TEXT_LENGTH", "250"),
            ("RATE_LIMIT_TRANSLATE_PER_MINUTE", "3"),
            ("SERIALIZE_ENGINE_CALLS", "yes"),
            ("INFERENCE_TOKEN", "hf_abc"),
        ]);
        assert_eq!(c.default_target_lang, "fr");
        assert_eq!(c.max_text_length, 250);
        assert_eq!(c.rate_limits.translate_per_minute, 3);
        assert!(c.serialize_engine_calls);
        assert_eq!(c.inference_token.as_deref(), Some("hf_abc"));
    }

    #[test]
    fn garbage_values_keep_defaults() {
        let c = from_pairs(&[("ENGINE_CACHE_CAPACITY", "lots"), ("SERIALIZE_ENGINE_CALLS", "maybe")]);
        assert_eq!(c.cache_capacity, 5);
        assert!(!c.serialize_engine_calls);
    }

    #[test]
    fn zero_capacity_fails_validation() {
        let c = from_pairs(&[("ENGINE_CACHE_CAPACITY", "0")]);
        assert_eq!(c.validate(), Err(ConfigError::Zero("ENGINE_CACHE_CAPACITY")));
        assert!(c.capacity().is_err());
    }

    #[test]
    fn empty_language_fails_validation() {
        let c = from_pairs(&[("DEFAULT_SOURCE_LANG", " ")]);
        assert_eq!(c.validate(), Err(ConfigError::Empty("DEFAULT_SOURCE_LANG")));
    }

    #[test]
    fn limiter_carries_route_quota() {
        let rl = RateLimitConfig {
            per_day: 100,
            per_minute: 10,
            translate_per_minute: 2,
        }
        .build_limiter();
        let t0 = std::time::Instant::now();
        rl.admit_at("c", TRANSLATE_ROUTE, t0).unwrap();
        rl.admit_at("c", TRANSLATE_ROUTE, t0).unwrap();
        assert!(rl.admit_at("c", TRANSLATE_ROUTE, t0).is_err());
    }
}
