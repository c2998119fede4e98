//! Single-flight scheduling of analyses.
//!
//! At most one computation runs per `(commit, mode)` key. Later requests for a
//! key that is already in flight join the existing ticket and observe the same
//! outcome through its watch channel. Ticket removal and outcome publication
//! happen under the table lock, so no request can slip in between them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sha2::{Digest, Sha256};
use tokio::sync::{Semaphore, watch};

use crate::analysis::{AnalysisMode, AnalysisPayload, CommitRef, PATTERN_PROVIDER, Version};
use crate::config::Config;
use crate::dispatch::SendGate;
use crate::dispatch::registry::Registry;
use crate::error::DrommageError;
use crate::pattern::PatternAnalyzer;
use crate::prompts::{PromptResolver, render_template};
use crate::store::{Store, UsageDelta};

/// What every waiter on a ticket eventually sees.
pub type Outcome = Result<Version, Arc<DrommageError>>;

type Key = (String, AnalysisMode);

/// Immutable per-run dependencies. Replaced wholesale on reload; a worker keeps
/// the snapshot it was started with.
pub struct AnalysisContext {
    pub registry: Registry,
    pub prompts: PromptResolver,
}

impl AnalysisContext {
    pub fn new(registry: Registry, prompts: PromptResolver) -> Self {
        Self { registry, prompts }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            registry: Registry::from_descriptors(config.providers.clone()),
            prompts: PromptResolver::new(config.templates.clone()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Skip the cache and compute a new version.
    pub force_refresh: bool,
    /// Prompt template name; the mode default when absent.
    pub template: Option<String>,
}

/// Non-blocking view of a handle.
#[derive(Debug, Clone)]
pub enum Poll {
    Pending,
    Done(Version),
    Failed(Arc<DrommageError>),
}

impl From<&Outcome> for Poll {
    fn from(outcome: &Outcome) -> Self {
        match outcome {
            Ok(v) => Poll::Done(v.clone()),
            Err(e) => Poll::Failed(e.clone()),
        }
    }
}

enum HandleState {
    Ready(Outcome),
    Watching(watch::Receiver<Option<Outcome>>),
}

/// A caller's interest in one `(commit, mode)` result.
pub struct Handle {
    commit: String,
    mode: AnalysisMode,
    /// Ticket joined or created; `None` for cache hits.
    ticket: Option<u64>,
    waiter: u64,
    state: HandleState,
}

impl Handle {
    pub fn commit(&self) -> &str {
        &self.commit
    }

    pub fn mode(&self) -> AnalysisMode {
        self.mode
    }

    /// True when the handle was answered from the cache without scheduling work.
    pub fn is_cached(&self) -> bool {
        matches!(self.state, HandleState::Ready(_))
    }

    pub fn poll(&self) -> Poll {
        match &self.state {
            HandleState::Ready(outcome) => outcome.into(),
            HandleState::Watching(rx) => match &*rx.borrow() {
                None => Poll::Pending,
                Some(outcome) => outcome.into(),
            },
        }
    }

    /// Wait for the outcome. Used by batch callers; interactive callers poll.
    pub async fn wait(&self) -> Outcome {
        let mut rx = match &self.state {
            HandleState::Ready(outcome) => return outcome.clone(),
            HandleState::Watching(rx) => rx.clone(),
        };
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if rx.changed().await.is_err() {
                let last = rx.borrow().clone();
                return last.unwrap_or_else(|| {
                    Err(Arc::new(DrommageError::Internal(
                        "analysis worker exited without a result".into(),
                    )))
                });
            }
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("commit", &self.commit)
            .field("mode", &self.mode)
            .field("ticket", &self.ticket)
            .field("cached", &self.is_cached())
            .finish()
    }
}

struct Ticket {
    id: u64,
    waiters: HashSet<u64>,
    tx: watch::Sender<Option<Outcome>>,
    gate: SendGate,
}

struct Inner {
    tickets: Mutex<HashMap<Key, Ticket>>,
    store: Arc<Store>,
    workers: Arc<Semaphore>,
    runtime: tokio::runtime::Handle,
    next_id: AtomicU64,
    pattern: PatternAnalyzer,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Bind to the current tokio runtime.
    pub fn new(store: Arc<Store>, max_workers: usize) -> Result<Self, DrommageError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| DrommageError::Internal("scheduler requires a tokio runtime".into()))?;
        Ok(Self::with_runtime(store, max_workers, runtime))
    }

    /// Workers are spawned on `runtime`, so `request` works from non-async code.
    pub fn with_runtime(store: Arc<Store>, max_workers: usize, runtime: tokio::runtime::Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                tickets: Mutex::new(HashMap::new()),
                store,
                workers: Arc::new(Semaphore::new(max_workers.max(1))),
                runtime,
                next_id: AtomicU64::new(1),
                pattern: PatternAnalyzer::new(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.inner.store
    }

    /// Returns immediately. A cached version yields a completed handle unless
    /// `force_refresh` is set; an in-flight key is joined; otherwise a worker
    /// is started.
    pub fn request(
        &self,
        commit: &CommitRef,
        mode: AnalysisMode,
        options: RequestOptions,
        ctx: Arc<AnalysisContext>,
    ) -> Result<Handle, DrommageError> {
        let key: Key = (commit.hash.clone(), mode);
        let mut tickets = self.inner.lock_tickets();

        if !options.force_refresh
            && let Some(version) = self.inner.store.get_latest(&commit.hash, mode)?
        {
            return Ok(Handle {
                commit: commit.hash.clone(),
                mode,
                ticket: None,
                waiter: 0,
                state: HandleState::Ready(Ok(version)),
            });
        }

        let waiter = self.inner.next_id();

        if let Some(ticket) = tickets.get_mut(&key) {
            ticket.waiters.insert(waiter);
            tracing::debug!(
                commit = %commit.short_hash(),
                mode = %mode,
                waiters = ticket.waiters.len(),
                "joined in-flight analysis"
            );
            return Ok(Handle {
                commit: commit.hash.clone(),
                mode,
                ticket: Some(ticket.id),
                waiter,
                state: HandleState::Watching(ticket.tx.subscribe()),
            });
        }

        let id = self.inner.next_id();
        let (tx, rx) = watch::channel(None);
        let gate = SendGate::new();
        tickets.insert(
            key.clone(),
            Ticket {
                id,
                waiters: HashSet::from([waiter]),
                tx,
                gate: gate.clone(),
            },
        );
        drop(tickets);

        tracing::info!(commit = %commit.short_hash(), mode = %mode, "analysis scheduled");

        let inner = self.inner.clone();
        let commit_owned = commit.clone();
        self.inner.runtime.spawn(async move {
            inner
                .run(key, id, commit_owned, options.template, ctx, gate)
                .await;
        });

        Ok(Handle {
            commit: commit.hash.clone(),
            mode,
            ticket: Some(id),
            waiter,
            state: HandleState::Watching(rx),
        })
    }

    pub fn poll(&self, handle: &Handle) -> Poll {
        handle.poll()
    }

    /// Drop this handle's interest. When it was the last waiter on a provider
    /// analysis that has not been sent yet, the work is cancelled and the key
    /// becomes free. Returns true if work was cancelled.
    pub fn abandon(&self, handle: &Handle) -> bool {
        let Some(ticket_id) = handle.ticket else {
            return false;
        };
        let key: Key = (handle.commit.clone(), handle.mode);
        let mut tickets = self.inner.lock_tickets();

        let Some(ticket) = tickets.get_mut(&key) else {
            return false;
        };
        if ticket.id != ticket_id {
            return false;
        }
        ticket.waiters.remove(&handle.waiter);
        if !ticket.waiters.is_empty() || !handle.mode.uses_provider() {
            return false;
        }

        if ticket.gate.try_cancel() {
            if let Some(ticket) = tickets.remove(&key) {
                ticket
                    .tx
                    .send_replace(Some(Err(Arc::new(DrommageError::Cancelled))));
            }
            tracing::info!(commit = %handle.commit, mode = %handle.mode, "analysis abandoned before send");
            true
        } else {
            tracing::debug!(
                commit = %handle.commit,
                mode = %handle.mode,
                "abandoned after send, letting it finish"
            );
            false
        }
    }

    pub fn in_flight(&self, commit: &str, mode: AnalysisMode) -> bool {
        self.inner
            .lock_tickets()
            .contains_key(&(commit.to_string(), mode))
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.lock_tickets().len()
    }

    /// Modes with a ticket open for `commit`.
    pub fn pending_modes(&self, commit: &str) -> Vec<AnalysisMode> {
        let tickets = self.inner.lock_tickets();
        AnalysisMode::ALL
            .into_iter()
            .filter(|m| tickets.contains_key(&(commit.to_string(), *m)))
            .collect()
    }
}

impl Inner {
    /// A poisoned table is still structurally valid; keep serving.
    fn lock_tickets(&self) -> MutexGuard<'_, HashMap<Key, Ticket>> {
        self.tickets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Remove the ticket (if it is still ours) and publish, in one critical section.
    fn complete(&self, key: &Key, id: u64, outcome: Outcome) {
        let mut tickets = self.lock_tickets();
        if tickets.get(key).is_some_and(|t| t.id == id)
            && let Some(ticket) = tickets.remove(key)
        {
            ticket.tx.send_replace(Some(outcome));
        }
    }

    async fn run(
        self: Arc<Self>,
        key: Key,
        id: u64,
        commit: CommitRef,
        template: Option<String>,
        ctx: Arc<AnalysisContext>,
        gate: SendGate,
    ) {
        let mode = key.1;
        let mut guard = CompletionGuard {
            inner: &self,
            key: key.clone(),
            id,
            done: false,
        };

        let outcome = self
            .compute(&commit, mode, template.as_deref(), &ctx, &gate)
            .await
            .map_err(Arc::new);

        match &outcome {
            Ok(v) => tracing::info!(
                commit = %commit.short_hash(),
                mode = %mode,
                version = v.number,
                provider = %v.provider,
                "analysis complete"
            ),
            Err(e) if matches!(**e, DrommageError::Cancelled) => {
                tracing::debug!(commit = %commit.short_hash(), mode = %mode, "analysis cancelled");
            }
            Err(e) => tracing::warn!(
                commit = %commit.short_hash(),
                mode = %mode,
                reason = e.reason_code(),
                "analysis failed: {e}"
            ),
        }

        guard.finish(outcome);
    }

    async fn compute(
        &self,
        commit: &CommitRef,
        mode: AnalysisMode,
        template: Option<&str>,
        ctx: &AnalysisContext,
        gate: &SendGate,
    ) -> Result<Version, DrommageError> {
        let permit = if mode.uses_provider() {
            tokio::select! {
                biased;
                _ = gate.cancelled() => return Err(DrommageError::Cancelled),
                permit = self.workers.clone().acquire_owned() => permit,
            }
        } else {
            self.workers.clone().acquire_owned().await
        };
        let _permit =
            permit.map_err(|_| DrommageError::Internal("worker pool closed".into()))?;

        let (provider, payload, usage) = match mode {
            AnalysisMode::Pattern => (PATTERN_PROVIDER.to_string(), self.pattern.analyze(commit), None),
            AnalysisMode::Brief | AnalysisMode::Deep => {
                consult(commit, mode, template, ctx, gate).await?
            }
        };

        let store = self.store.clone();
        let hash = commit.hash.clone();
        tokio::task::spawn_blocking(move || store.append(&hash, mode, &provider, &payload, usage))
            .await
            .map_err(|e| DrommageError::Internal(format!("cache write task failed: {e}")))?
    }
}

/// Render the prompt, dispatch with fallback, and shape the payload.
async fn consult(
    commit: &CommitRef,
    mode: AnalysisMode,
    template: Option<&str>,
    ctx: &AnalysisContext,
    gate: &SendGate,
) -> Result<(String, AnalysisPayload, Option<UsageDelta>), DrommageError> {
    let template = ctx.prompts.select(mode, template)?;
    let prompt = render_template(template, commit)?;
    let fingerprint = hex::encode(Sha256::digest(prompt.as_bytes()));

    let dispatched = ctx.registry.run_with_fallback(mode, &prompt, gate).await?;
    let result = &dispatched.result;

    let mut payload = AnalysisPayload::from_model_text(mode, &result.text);
    let tokens = result.total_tokens();
    let cost = ctx
        .registry
        .get(&result.provider)
        .map(|p| p.descriptor.estimate_cost(tokens.unwrap_or(0)))
        .unwrap_or(0.0);

    let meta = &mut payload.metadata;
    meta.insert("model".into(), result.model.clone().into());
    meta.insert("latency_ms".into(), result.latency_ms.into());
    if let Some(n) = result.prompt_tokens {
        meta.insert("prompt_tokens".into(), n.into());
    }
    if let Some(n) = result.completion_tokens {
        meta.insert("completion_tokens".into(), n.into());
    }
    if let Some(n) = tokens {
        meta.insert("total_tokens".into(), n.into());
    }
    meta.insert("cost_estimate".into(), cost.into());
    meta.insert("template".into(), template.name.clone().into());
    meta.insert("prompt_sha256".into(), fingerprint.into());
    if !dispatched.failed_attempts.is_empty() {
        meta.insert(
            "failed_attempts".into(),
            serde_json::to_value(&dispatched.failed_attempts).unwrap_or_default(),
        );
    }

    let usage = UsageDelta {
        tokens: tokens.unwrap_or(0),
        cost,
        latency_ms: result.latency_ms,
    };
    Ok((result.provider.clone(), payload, Some(usage)))
}

/// Publishes a failure if the worker is dropped before finishing (panic or
/// runtime shutdown), so waiters never hang and the key is released.
struct CompletionGuard<'a> {
    inner: &'a Inner,
    key: Key,
    id: u64,
    done: bool,
}

impl CompletionGuard<'_> {
    fn finish(&mut self, outcome: Outcome) {
        self.done = true;
        self.inner.complete(&self.key, self.id, outcome);
    }
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            tracing::error!(commit = %self.key.0, mode = %self.key.1, "analysis worker stopped early");
            self.inner.complete(
                &self.key,
                self.id,
                Err(Arc::new(DrommageError::Internal(
                    "analysis worker stopped before finishing".into(),
                ))),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(hash: &str) -> CommitRef {
        CommitRef {
            hash: hash.into(),
            message: "fix: tidy parser".into(),
            author: "dev".into(),
            timestamp: "2025-01-01T00:00:00Z".into(),
            changed_paths: vec!["src/parser.rs".into()],
            insertions: 5,
            deletions: 2,
        }
    }

    fn setup() -> (Scheduler, Arc<AnalysisContext>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let scheduler = Scheduler::new(store, 2).unwrap();
        let ctx = Arc::new(AnalysisContext::new(
            Registry::with_backends(vec![]),
            PromptResolver::default(),
        ));
        (scheduler, ctx)
    }

    #[tokio::test]
    async fn pattern_result_is_cached_after_first_run() {
        let (s, ctx) = setup();
        let c = commit("abc123");
        let h = s
            .request(&c, AnalysisMode::Pattern, RequestOptions::default(), ctx.clone())
            .unwrap();
        assert!(!h.is_cached());
        let v = h.wait().await.unwrap();
        assert_eq!(v.number, 1);
        assert_eq!(v.provider, PATTERN_PROVIDER);

        let again = s
            .request(&c, AnalysisMode::Pattern, RequestOptions::default(), ctx)
            .unwrap();
        assert!(again.is_cached());
        match s.poll(&again) {
            Poll::Done(v) => assert_eq!(v.number, 1),
            other => panic!("expected cached version, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_ticket() {
        let (s, ctx) = setup();
        let c = commit("abc123");
        // Current-thread runtime: the worker cannot run until we yield.
        let a = s
            .request(&c, AnalysisMode::Pattern, RequestOptions::default(), ctx.clone())
            .unwrap();
        let b = s
            .request(&c, AnalysisMode::Pattern, RequestOptions::default(), ctx)
            .unwrap();
        assert!(matches!(s.poll(&a), Poll::Pending));
        assert!(s.in_flight("abc123", AnalysisMode::Pattern));
        assert_eq!(s.in_flight_count(), 1);

        let (va, vb) = (a.wait().await.unwrap(), b.wait().await.unwrap());
        assert_eq!(va.number, 1);
        assert_eq!(va, vb);
        assert!(!s.in_flight("abc123", AnalysisMode::Pattern));
        assert_eq!(s.store().list_versions("abc123", AnalysisMode::Pattern).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn force_refresh_appends_new_version() {
        let (s, ctx) = setup();
        let c = commit("abc123");
        s.request(&c, AnalysisMode::Pattern, RequestOptions::default(), ctx.clone())
            .unwrap()
            .wait()
            .await
            .unwrap();
        let forced = RequestOptions {
            force_refresh: true,
            ..Default::default()
        };
        let v2 = s
            .request(&c, AnalysisMode::Pattern, forced, ctx)
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(v2.number, 2);
    }

    #[tokio::test]
    async fn pattern_work_is_not_cancellable() {
        let (s, ctx) = setup();
        let c = commit("abc123");
        let h = s
            .request(&c, AnalysisMode::Pattern, RequestOptions::default(), ctx)
            .unwrap();
        assert!(!s.abandon(&h));
        assert_eq!(h.wait().await.unwrap().number, 1);
    }

    #[tokio::test]
    async fn provider_mode_without_providers_fails() {
        let (s, ctx) = setup();
        let h = s
            .request(&commit("abc123"), AnalysisMode::Brief, RequestOptions::default(), ctx)
            .unwrap();
        let err = h.wait().await.unwrap_err();
        assert_eq!(err.reason_code(), "no_provider_available");
        assert!(matches!(s.poll(&h), Poll::Failed(_)));
        assert_eq!(s.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn pending_modes_lists_open_tickets() {
        let (s, ctx) = setup();
        let c = commit("abc123");
        let h = s
            .request(&c, AnalysisMode::Pattern, RequestOptions::default(), ctx)
            .unwrap();
        assert_eq!(s.pending_modes("abc123"), vec![AnalysisMode::Pattern]);
        h.wait().await.unwrap();
        assert!(s.pending_modes("abc123").is_empty());
    }

    #[test]
    fn new_outside_runtime_is_an_error() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        assert!(Scheduler::new(store, 1).is_err());
    }
}
