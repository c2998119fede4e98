//! Front-end facing API: mode toggling, triggering, status, and cache access.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::analysis::{AnalysisMode, CommitRef, Session, Version};
use crate::config::Config;
use crate::dispatch::registry::ProviderStatus;
use crate::error::DrommageError;
use crate::prompts::PromptTemplate;
use crate::scheduler::{AnalysisContext, Handle, Poll, RequestOptions, Scheduler};
use crate::store::{ClearScope, ProviderUsage, Store, StoreStats};

/// Per-mode state shown next to a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ModeStatus {
    Absent,
    Cached { version: u32 },
    Pending,
}

/// Template catalog entry plus anything that failed validation.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateCatalog {
    pub templates: Vec<PromptTemplate>,
    pub categories: BTreeMap<String, Vec<String>>,
    pub rejected: Vec<RejectedTemplate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectedTemplate {
    pub name: String,
    pub errors: Vec<String>,
}

pub struct Orchestrator {
    scheduler: Scheduler,
    context: RwLock<Arc<AnalysisContext>>,
    keep_versions: RwLock<usize>,
}

impl Orchestrator {
    /// Must be called inside a tokio runtime; workers are spawned on it.
    pub fn new(config: &Config, store: Arc<Store>) -> Result<Self, DrommageError> {
        let scheduler = Scheduler::new(store, config.scheduler.max_workers)?;
        Ok(Self::with_parts(
            scheduler,
            AnalysisContext::from_config(config),
            config.cache.keep_versions,
        ))
    }

    pub fn with_parts(scheduler: Scheduler, context: AnalysisContext, keep_versions: usize) -> Self {
        Self {
            scheduler,
            context: RwLock::new(Arc::new(context)),
            keep_versions: RwLock::new(keep_versions),
        }
    }

    fn context(&self) -> Arc<AnalysisContext> {
        match self.context.read() {
            Ok(ctx) => ctx.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn store(&self) -> &Arc<Store> {
        self.scheduler.store()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn current_mode(&self, session: &Session) -> AnalysisMode {
        session.mode()
    }

    /// Cycle the session's mode. Never schedules work.
    pub fn advance_mode(&self, session: &mut Session) -> AnalysisMode {
        session.advance()
    }

    /// Returns immediately with a handle to poll.
    pub fn trigger(
        &self,
        commit: &CommitRef,
        mode: AnalysisMode,
        options: RequestOptions,
    ) -> Result<Handle, DrommageError> {
        self.scheduler.request(commit, mode, options, self.context())
    }

    pub fn poll(&self, handle: &Handle) -> Poll {
        self.scheduler.poll(handle)
    }

    pub fn abandon(&self, handle: &Handle) -> bool {
        self.scheduler.abandon(handle)
    }

    /// `trigger` for async callers. The cache lookup reads the store under the
    /// ticket lock, so it runs on the blocking pool.
    pub async fn submit(
        &self,
        commit: &CommitRef,
        mode: AnalysisMode,
        options: RequestOptions,
    ) -> Result<Handle, DrommageError> {
        let scheduler = self.scheduler.clone();
        let ctx = self.context();
        let commit = commit.clone();
        tokio::task::spawn_blocking(move || scheduler.request(&commit, mode, options, ctx))
            .await
            .map_err(|e| DrommageError::Internal(format!("trigger task failed: {e}")))?
    }

    /// Submit and wait for the result.
    pub async fn resolve(
        &self,
        commit: &CommitRef,
        mode: AnalysisMode,
        options: RequestOptions,
    ) -> Result<Version, Arc<DrommageError>> {
        let handle = self.submit(commit, mode, options).await.map_err(Arc::new)?;
        handle.wait().await
    }

    /// Status of every mode for a commit. An open ticket wins over a cached version.
    pub fn status_snapshot(&self, commit_hash: &str) -> Result<BTreeMap<AnalysisMode, ModeStatus>, DrommageError> {
        let pending = self.scheduler.pending_modes(commit_hash);
        let mut out = BTreeMap::new();
        for mode in AnalysisMode::ALL {
            let status = if pending.contains(&mode) {
                ModeStatus::Pending
            } else {
                match self.store().get_latest(commit_hash, mode)? {
                    Some(v) => ModeStatus::Cached { version: v.number },
                    None => ModeStatus::Absent,
                }
            };
            out.insert(mode, status);
        }
        Ok(out)
    }

    pub fn get_latest(&self, commit_hash: &str, mode: AnalysisMode) -> Result<Option<Version>, DrommageError> {
        self.store().get_latest(commit_hash, mode)
    }

    pub fn list_versions(&self, commit_hash: &str, mode: AnalysisMode) -> Result<Vec<Version>, DrommageError> {
        self.store().list_versions(commit_hash, mode)
    }

    pub fn get_version(
        &self,
        commit_hash: &str,
        mode: AnalysisMode,
        number: u32,
    ) -> Result<Option<Version>, DrommageError> {
        self.store().get_version(commit_hash, mode, number)
    }

    pub fn clear(&self, scope: &ClearScope) -> Result<usize, DrommageError> {
        self.store().clear(scope)
    }

    /// Prune old versions. `None` uses the configured `keep_versions`.
    pub fn cleanup(&self, keep: Option<usize>) -> Result<usize, DrommageError> {
        let keep = keep.unwrap_or_else(|| self.keep_versions());
        self.store().cleanup(keep)
    }

    pub fn keep_versions(&self) -> usize {
        self.keep_versions
            .read()
            .map(|k| *k)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }

    pub fn stats(&self) -> Result<StoreStats, DrommageError> {
        self.store().stats()
    }

    pub fn provider_usage(&self) -> Result<Vec<ProviderUsage>, DrommageError> {
        self.store().provider_usage()
    }

    pub async fn provider_status(&self) -> Vec<ProviderStatus> {
        let ctx = self.context();
        ctx.registry.status().await
    }

    pub fn templates(&self) -> TemplateCatalog {
        let ctx = self.context();
        TemplateCatalog {
            templates: ctx.prompts.list().into_iter().cloned().collect(),
            categories: ctx.prompts.categories(),
            rejected: ctx
                .prompts
                .rejected()
                .iter()
                .map(|(name, errors)| RejectedTemplate {
                    name: name.clone(),
                    errors: errors.iter().map(|e| e.to_string()).collect(),
                })
                .collect(),
        }
    }

    /// Swap in providers and templates from `config`. Work already running
    /// keeps the context it started with.
    pub fn reload(&self, config: &Config) {
        let fresh = Arc::new(AnalysisContext::from_config(config));
        match self.context.write() {
            Ok(mut ctx) => *ctx = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
        match self.keep_versions.write() {
            Ok(mut k) => *k = config.cache.keep_versions,
            Err(poisoned) => *poisoned.into_inner() = config.cache.keep_versions,
        }
        tracing::info!(providers = config.providers.len(), "configuration reloaded");
    }
}
