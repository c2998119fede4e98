#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::Notify;

use drommage::analysis::CommitRef;
use drommage::dispatch::registry::{ProviderDescriptor, Registry, TransportKind};
use drommage::dispatch::{ProviderBackend, ProviderRequest, ProviderResult};
use drommage::error::{FailureReason, ProviderFailure};
use drommage::orchestrator::Orchestrator;
use drommage::prompts::PromptResolver;
use drommage::scheduler::{AnalysisContext, Scheduler};
use drommage::store::Store;

/// Scripted backend. Counts probes, entries, and sends.
pub struct FakeBackend {
    pub up: bool,
    pub delay: Duration,
    pub fail: Option<FailureReason>,
    /// When set, `invoke` parks here before passing the send gate.
    pub hold: Option<Arc<Notify>>,
    pub text: String,
    pub entered: AtomicUsize,
    pub sent: AtomicUsize,
}

impl FakeBackend {
    fn base() -> Self {
        Self {
            up: true,
            delay: Duration::ZERO,
            fail: None,
            hold: None,
            text: "Refactors the parser without behavior change.".into(),
            entered: AtomicUsize::new(0),
            sent: AtomicUsize::new(0),
        }
    }

    pub fn healthy() -> Arc<Self> {
        Arc::new(Self::base())
    }

    pub fn down() -> Arc<Self> {
        Arc::new(Self {
            up: false,
            ..Self::base()
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::base()
        })
    }

    pub fn failing(reason: FailureReason) -> Arc<Self> {
        Arc::new(Self {
            fail: Some(reason),
            ..Self::base()
        })
    }

    pub fn held(hold: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            hold: Some(hold),
            ..Self::base()
        })
    }

    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

impl ProviderBackend for FakeBackend {
    fn probe(&self) -> BoxFuture<'_, bool> {
        let up = self.up;
        async move { up }.boxed()
    }

    fn invoke<'a>(
        &'a self,
        req: &'a ProviderRequest,
    ) -> BoxFuture<'a, Result<ProviderResult, ProviderFailure>> {
        async move {
            let start = Instant::now();
            self.entered.fetch_add(1, Ordering::SeqCst);
            if let Some(hold) = &self.hold {
                hold.notified().await;
            }
            if !req.gate.begin_send() {
                return Err(ProviderFailure::new("fake", FailureReason::Cancelled, "gate closed"));
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if let Some(reason) = self.fail {
                return Err(ProviderFailure::new("fake", reason, "scripted failure"));
            }
            Ok(ProviderResult {
                text: self.text.clone(),
                model: req.model.clone(),
                provider: "fake".into(),
                prompt_tokens: Some(120),
                completion_tokens: Some(30),
                latency_ms: start.elapsed().as_millis() as u64,
            })
        }
        .boxed()
    }
}

pub fn descriptor(name: &str, priority: u32) -> ProviderDescriptor {
    ProviderDescriptor::new(name, TransportKind::GenericHttp, "http://fake.invalid", "fake-model", priority)
}

pub fn entry(
    descriptor: ProviderDescriptor,
    backend: Arc<FakeBackend>,
) -> (ProviderDescriptor, Arc<dyn ProviderBackend>) {
    (descriptor, backend as Arc<dyn ProviderBackend>)
}

pub fn commit(hash: &str) -> CommitRef {
    CommitRef {
        hash: hash.into(),
        message: "fix(parser): handle empty input\n\nGuards against a panic on blank files.".into(),
        author: "Dev Example".into(),
        timestamp: "2025-03-01T10:00:00+00:00".into(),
        changed_paths: vec!["src/parser.rs".into(), "tests/parser.rs".into()],
        insertions: 14,
        deletions: 3,
    }
}

/// Orchestrator over an in-memory store. Must be called inside a tokio runtime.
pub fn orchestrator(
    entries: Vec<(ProviderDescriptor, Arc<dyn ProviderBackend>)>,
    workers: usize,
) -> Orchestrator {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let scheduler = Scheduler::new(store, workers).unwrap();
    let ctx = AnalysisContext::new(Registry::with_backends(entries), PromptResolver::default());
    Orchestrator::with_parts(scheduler, ctx, 3)
}

/// Unique scratch directory under the system temp dir.
pub fn temp_dir(name: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("drommage-{name}-{}-{nanos}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Poll `cond` every 10ms until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
