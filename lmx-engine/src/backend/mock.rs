//! Scriptable in-memory backend for tests and dry runs.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use super::{
    Backend, BackendFactory, BackendKind, ChatMessage, GenerationOutput, GenerationParams,
    TokenStream,
};
use crate::error::{EngineError, Result};
use crate::loader::LoadSpec;

/// Behaviour knobs shared by every handle a [`MockBackendFactory`] builds.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    pub reply: String,
    pub delay: Duration,
    pub fail_generate: bool,
    /// Reply with empty text (fails the canary).
    pub empty_reply: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            reply: "OK".into(),
            delay: Duration::ZERO,
            fail_generate: false,
            empty_reply: false,
        }
    }
}

pub struct MockBackend {
    behavior: MockBehavior,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl MockBackend {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            calls: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn text(&self) -> String {
        if self.behavior.empty_reply {
            String::new()
        } else {
            self.behavior.reply.clone()
        }
    }
}

/// Tracks concurrent calls so tests can read the peak.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(active: &Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(active.clone())
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn generate(
        &self,
        _messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<GenerationOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _active = ActiveGuard::enter(&self.active, &self.peak);
        if !self.behavior.delay.is_zero() {
            tokio::time::sleep(self.behavior.delay).await;
        }
        if self.behavior.fail_generate {
            return Err(EngineError::inference("mock backend failure"));
        }
        let text = self.text();
        let words = text.split_whitespace().count() as u32;
        Ok(GenerationOutput {
            completion_tokens: params.max_tokens.map_or(words, |m| words.min(m)),
            prompt_tokens: 1,
            text,
            finish_reason: Some("stop".into()),
        })
    }

    async fn stream(
        &self,
        _messages: &[ChatMessage],
        _params: &GenerationParams,
    ) -> Result<TokenStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.behavior.fail_generate {
            return Err(EngineError::inference("mock backend failure"));
        }
        let tokens: Vec<String> = self
            .text()
            .split_inclusive(' ')
            .map(str::to_string)
            .collect();
        let delay = self.behavior.delay;
        let guard = ActiveGuard::enter(&self.active, &self.peak);
        let stream = futures::stream::unfold(
            (tokens.into_iter(), guard),
            move |(mut it, guard)| async move {
                let token = it.next()?;
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Some((Ok(token), (it, guard)))
            },
        );
        Ok(Box::pin(stream))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Factory handing out [`MockBackend`]s that share counters.
pub struct MockBackendFactory {
    behavior: std::sync::Mutex<MockBehavior>,
    fail_create: AtomicBool,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
    created: AtomicUsize,
}

impl MockBackendFactory {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior: std::sync::Mutex::new(behavior),
            fail_create: AtomicBool::new(false),
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            calls: Arc::new(AtomicUsize::new(0)),
            created: AtomicUsize::new(0),
        }
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock().unwrap_or_else(|e| e.into_inner()) = behavior;
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Most generation calls observed at once across all handles.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn active_calls(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl Default for MockBackendFactory {
    fn default() -> Self {
        Self::new(MockBehavior::default())
    }
}

#[async_trait]
impl BackendFactory for MockBackendFactory {
    async fn create(&self, _kind: BackendKind, _spec: &LoadSpec) -> Result<Arc<dyn Backend>> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(EngineError::backend("mock runtime refused to start"));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().unwrap_or_else(|e| e.into_inner()).clone();
        Ok(Arc::new(MockBackend {
            behavior,
            active: self.active.clone(),
            peak: self.peak.clone(),
            calls: self.calls.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn backend_version(&self, _kind: BackendKind) -> String {
        "mock-1".into()
    }
}
