//! In-process engine and factory for tests and local runs.
//! The factory counts builds and can be scripted to be slow, fail, or reject
//! pairs; engines answer from a phrasebook or echo `[src-tgt] text`, optionally
//! after a delay.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{Engine, EngineError, EngineFactory, EngineLoadError, LanguagePair};

pub struct StubEngine {
    pair: LanguagePair,
    phrases: Arc<HashMap<String, String>>,
    failing: bool,
    delay: Duration,
}

#[async_trait]
impl Engine for StubEngine {
    async fn translate(&self, text: &str, max_length: usize) -> Result<String, EngineError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing {
            return Err(EngineError::Backend("stub engine failure".into()));
        }
        let out = match self.phrases.get(text) {
            Some(phrase) => phrase.clone(),
            None => format!("[{}] {}", self.pair, text),
        };
        Ok(out.chars().take(max_length).collect())
    }
}

pub struct StubFactory {
    phrases: Arc<HashMap<String, String>>,
    unsupported: HashSet<LanguagePair>,
    build_delay: Duration,
    failing_builds: AtomicUsize,
    failing_engines: bool,
    translate_delay: Duration,
    builds: AtomicUsize,
    active_builds: AtomicUsize,
    peak_builds: AtomicUsize,
}

impl Default for StubFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl StubFactory {
    pub fn new() -> Self {
        Self {
            phrases: Arc::new(HashMap::new()),
            unsupported: HashSet::new(),
            build_delay: Duration::ZERO,
            failing_builds: AtomicUsize::new(0),
            failing_engines: false,
            translate_delay: Duration::ZERO,
            builds: AtomicUsize::new(0),
            active_builds: AtomicUsize::new(0),
            peak_builds: AtomicUsize::new(0),
        }
    }

    /// Engines translate `from` to exactly `to`.
    pub fn with_phrase(mut self, from: &str, to: &str) -> Self {
        Arc::make_mut(&mut self.phrases).insert(from.to_string(), to.to_string());
        self
    }

    /// Building `pair` fails as unsupported.
    pub fn with_unsupported(mut self, pair: LanguagePair) -> Self {
        self.unsupported.insert(pair);
        self
    }

    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = delay;
        self
    }

    /// The next `n` builds fail as unavailable.
    pub fn with_failing_builds(self, n: usize) -> Self {
        self.failing_builds.store(n, Ordering::SeqCst);
        self
    }

    /// Every engine built fails on `translate`.
    pub fn with_failing_engines(mut self) -> Self {
        self.failing_engines = true;
        self
    }

    /// Every engine built sleeps this long before answering.
    pub fn with_translate_delay(mut self, delay: Duration) -> Self {
        self.translate_delay = delay;
        self
    }

    /// Total calls to `build`, successful or not.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Highest number of builds that were running at the same time.
    pub fn peak_concurrent_builds(&self) -> usize {
        self.peak_builds.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.failing_builds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Counts a build as running until dropped, even if the build is cancelled.
struct ActiveBuild<'a> {
    active: &'a AtomicUsize,
    count: usize,
}

impl<'a> ActiveBuild<'a> {
    fn enter(active: &'a AtomicUsize) -> Self {
        let count = active.fetch_add(1, Ordering::SeqCst) + 1;
        Self { active, count }
    }
}

impl Drop for ActiveBuild<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl EngineFactory for StubFactory {
    async fn build(&self, pair: &LanguagePair) -> Result<Arc<dyn Engine>, EngineLoadError> {
        self.builds.fetch_add(1, Ordering::SeqCst);

        {
            let active = ActiveBuild::enter(&self.active_builds);
            self.peak_builds.fetch_max(active.count, Ordering::SeqCst);
            if !self.build_delay.is_zero() {
                tokio::time::sleep(self.build_delay).await;
            }
        }

        if self.unsupported.contains(pair) {
            return Err(EngineLoadError::unsupported(pair.clone(), "no such model"));
        }
        if self.take_failure() {
            return Err(EngineLoadError::unavailable(pair.clone(), "stub build failure"));
        }
        Ok(Arc::new(StubEngine {
            pair: pair.clone(),
            phrases: Arc::clone(&self.phrases),
            failing: self.failing_engines,
            delay: self.translate_delay,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn phrasebook_then_echo() {
        let factory = StubFactory::new().with_phrase("Hello", "Hola");
        let engine = factory.build(&LanguagePair::new("en", "es")).await.unwrap();
        assert_eq!(engine.translate("Hello", 400).await.unwrap(), "Hola");
        assert_eq!(engine.translate("Bye", 400).await.unwrap(), "[en-es] Bye");
        assert_eq!(engine.translate("Bye", 4).await.unwrap(), "[en-");
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed() {
        let factory = StubFactory::new().with_failing_builds(1);
        let pair = LanguagePair::new("en", "de");
        assert!(factory.build(&pair).await.is_err());
        assert!(factory.build(&pair).await.is_ok());
        assert_eq!(factory.builds(), 2);
    }

    #[tokio::test]
    async fn cancelled_build_is_not_counted_as_running() {
        let factory = StubFactory::new().with_build_delay(Duration::from_millis(100));
        let pair = LanguagePair::new("en", "es");

        let cut_short = tokio::time::timeout(Duration::from_millis(10), factory.build(&pair)).await;
        assert!(cut_short.is_err());

        factory.build(&pair).await.unwrap();
        assert_eq!(factory.peak_concurrent_builds(), 1);
        assert_eq!(factory.builds(), 2);
    }

    #[tokio::test]
    async fn translate_delay_holds_the_answer_back() {
        let factory = StubFactory::new().with_translate_delay(Duration::from_millis(100));
        let engine = factory.build(&LanguagePair::new("en", "es")).await.unwrap();
        let early = tokio::time::timeout(Duration::from_millis(10), engine.translate("Hi", 400)).await;
        assert!(early.is_err());
        assert_eq!(engine.translate("Hi", 400).await.unwrap(), "[en-es] Hi");
    }
}
