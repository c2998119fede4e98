use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::join_all;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Implementation, ServerCapabilities, ServerInfo};
use rmcp::{ErrorData as McpError, ServerHandler, tool, tool_handler, tool_router};
use serde::Serialize;

use crate::analysis::{AnalysisMode, CommitRef, Version};
use crate::config::Config;
use crate::dispatch::registry::ProviderStatus;
use crate::error::DrommageError;
use crate::git::GitLog;
use crate::orchestrator::{ModeStatus, Orchestrator};
use crate::response::{ToolMetadata, ToolResponse};
use crate::scheduler::{Poll, RequestOptions};
use crate::store::{ClearScope, ProviderUsage, Store};
use crate::tools::analyze::{
    AnalyzeRequest, BatchItem, HistoryRequest, MAX_BATCH, StatusRequest, TriggerRequest,
    TriggerResponse,
};
use crate::tools::cache::CacheRequest;
use crate::tools::enums::{CacheAction, OutputFormat};

#[derive(Clone)]
pub struct DrommageServer {
    orchestrator: Arc<Orchestrator>,
    git: GitLog,
    repo_root: Arc<PathBuf>,
    tool_router: ToolRouter<Self>,
}

#[derive(Serialize)]
struct StatusResponse<'a> {
    commit: &'a str,
    short: &'a str,
    modes: BTreeMap<AnalysisMode, ModeStatus>,
}

#[derive(Serialize)]
struct ProvidersResponse {
    providers: Vec<ProviderStatus>,
    usage: Vec<ProviderUsage>,
}

fn elapsed(start: Instant) -> f64 {
    start.elapsed().as_secs_f64()
}

/// Error envelope for a failed tool call. Never an MCP-level error.
fn failure(tool: &str, start: Instant, err: &DrommageError) -> CallToolResult {
    tracing::warn!(tool, reason = err.reason_code(), "{err}");
    ToolResponse::error(
        err.user_message(),
        ToolMetadata::new(tool, elapsed(start)).with_reason(err.reason_code()),
    )
    .into_call_tool_result()
}

fn invalid(tool: &str, start: Instant, message: impl Into<String>) -> CallToolResult {
    ToolResponse::error(
        message.into(),
        ToolMetadata::new(tool, elapsed(start)).with_reason("invalid_request"),
    )
    .into_call_tool_result()
}

fn render_version(tool: &str, start: Instant, version: &Version, format: OutputFormat) -> CallToolResult {
    let meta = ToolMetadata::new(tool, elapsed(start)).with_provider(version.provider.clone());
    let response = match format {
        OutputFormat::Json => ToolResponse::json(version, meta),
        OutputFormat::Text => ToolResponse::text(version.to_text(), meta),
    };
    response.into_call_tool_result()
}

#[tool_router]
impl DrommageServer {
    /// Open the repository's cache and build the orchestrator. Must run inside a tokio runtime.
    pub fn new(config: &Config, repo_root: PathBuf) -> Result<Self, DrommageError> {
        let store = Arc::new(Store::open(&config.db_path(&repo_root))?);
        let orchestrator = Arc::new(Orchestrator::new(config, store)?);
        Ok(Self::from_parts(orchestrator, GitLog::new(repo_root.clone()), repo_root))
    }

    pub fn from_parts(orchestrator: Arc<Orchestrator>, git: GitLog, repo_root: PathBuf) -> Self {
        Self {
            orchestrator,
            git,
            repo_root: Arc::new(repo_root),
            tool_router: Self::tool_router(),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Run a store-bound call off the async executor.
    async fn blocking<T, F>(&self, f: F) -> Result<T, DrommageError>
    where
        T: Send + 'static,
        F: FnOnce(&Orchestrator) -> Result<T, DrommageError> + Send + 'static,
    {
        let orchestrator = self.orchestrator.clone();
        tokio::task::spawn_blocking(move || f(orchestrator.as_ref()))
            .await
            .map_err(|e| DrommageError::Internal(format!("store task failed: {e}")))?
    }

    #[tool(
        name = "analyze",
        description = "Analyze a commit (or a batch via `recent` / `since`) and return the latest cached version, computing one if needed. Modes: pattern (instant, no model), brief, deep.",
        annotations(read_only_hint = true)
    )]
    async fn analyze(
        &self,
        Parameters(req): Parameters<AnalyzeRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let mode = req.mode_or_default();
        let format = req.format.unwrap_or_default();
        let options = RequestOptions {
            force_refresh: req.force_refresh.unwrap_or(false),
            template: req.template.clone(),
        };

        if req.is_batch() {
            return Ok(self.analyze_batch(&req, mode, options, format, start).await);
        }

        let Some(rev) = req.commit.as_deref() else {
            return Ok(invalid(
                "analyze",
                start,
                "one of `commit`, `recent`, or `since` is required",
            ));
        };
        let commit = match self.git.show(rev).await {
            Ok(c) => c,
            Err(e) => return Ok(failure("analyze", start, &e)),
        };

        match self.orchestrator.resolve(&commit, mode, options).await {
            Ok(version) => Ok(render_version("analyze", start, &version, format)),
            Err(e) => Ok(failure("analyze", start, &e)),
        }
    }

    async fn analyze_batch(
        &self,
        req: &AnalyzeRequest,
        mode: AnalysisMode,
        options: RequestOptions,
        format: OutputFormat,
        start: Instant,
    ) -> CallToolResult {
        let listed = match (req.recent, req.since.as_deref()) {
            (Some(n), _) => self.git.recent(n.clamp(1, MAX_BATCH)).await,
            (None, Some(date)) => self.git.since(date).await,
            (None, None) => Ok(Vec::new()),
        };
        let mut commits: Vec<CommitRef> = match listed {
            Ok(c) => c,
            Err(e) => return failure("analyze", start, &e),
        };
        commits.truncate(MAX_BATCH);

        // Trigger everything first so the worker pool sees the whole batch.
        let mut handles = Vec::with_capacity(commits.len());
        for c in &commits {
            let handle = self.orchestrator.submit(c, mode, options.clone()).await;
            handles.push(handle.map_err(Arc::new));
        }
        let waits = handles.iter().map(|h| async move {
            match h {
                Ok(handle) => handle.wait().await,
                Err(e) => Err(e.clone()),
            }
        });
        let outcomes = join_all(waits).await;

        let items: Vec<BatchItem> = commits
            .iter()
            .zip(outcomes)
            .map(|(c, outcome)| match outcome {
                Ok(version) => BatchItem {
                    commit: c.hash.clone(),
                    version: Some(version),
                    error: None,
                    reason: None,
                },
                Err(e) => BatchItem {
                    commit: c.hash.clone(),
                    version: None,
                    error: Some(e.user_message()),
                    reason: Some(e.reason_code()),
                },
            })
            .collect();

        let failed = items.iter().filter(|i| i.error.is_some()).count();
        tracing::info!(commits = items.len(), failed, mode = %mode, "batch analysis finished");

        let meta = ToolMetadata::new("analyze", elapsed(start));
        let response = match format {
            OutputFormat::Json => ToolResponse::json(&items, meta),
            OutputFormat::Text => {
                let blocks: Vec<String> = items
                    .iter()
                    .map(|item| match (&item.version, &item.error) {
                        (Some(v), _) => v.to_text(),
                        (None, Some(err)) => format!("{}: {err}", item.commit),
                        (None, None) => item.commit.clone(),
                    })
                    .collect();
                ToolResponse::text(blocks.join("\n\n---\n\n"), meta)
            }
        };
        response.into_call_tool_result()
    }

    #[tool(
        name = "trigger",
        description = "Start an analysis in the background and return immediately. Poll with `status`; fetch results with `history` or `analyze`.",
        annotations(read_only_hint = false)
    )]
    async fn trigger(
        &self,
        Parameters(req): Parameters<TriggerRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let commit = match self.git.show(&req.commit).await {
            Ok(c) => c,
            Err(e) => return Ok(failure("trigger", start, &e)),
        };
        let options = RequestOptions {
            force_refresh: req.force_refresh.unwrap_or(false),
            template: req.template,
        };
        let handle = match self.orchestrator.submit(&commit, req.mode, options).await {
            Ok(h) => h,
            Err(e) => return Ok(failure("trigger", start, &e)),
        };

        let (state, version) = match self.orchestrator.poll(&handle) {
            Poll::Done(v) if handle.is_cached() => ("cached", Some(v.number)),
            Poll::Done(v) => ("done", Some(v.number)),
            Poll::Pending => ("pending", None),
            Poll::Failed(e) => return Ok(failure("trigger", start, &e)),
        };
        let body = TriggerResponse {
            commit: commit.hash,
            mode: req.mode,
            state,
            version,
        };
        Ok(ToolResponse::json(&body, ToolMetadata::new("trigger", elapsed(start))).into_call_tool_result())
    }

    #[tool(
        name = "status",
        description = "Per-mode state of a commit: absent, cached (with latest version number), or pending.",
        annotations(read_only_hint = true)
    )]
    async fn status(
        &self,
        Parameters(req): Parameters<StatusRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let commit = match self.git.show(&req.commit).await {
            Ok(c) => c,
            Err(e) => return Ok(failure("status", start, &e)),
        };
        let hash = commit.hash.clone();
        let modes = match self.blocking(move |o| o.status_snapshot(&hash)).await {
            Ok(m) => m,
            Err(e) => return Ok(failure("status", start, &e)),
        };
        let body = StatusResponse {
            commit: &commit.hash,
            short: commit.short_hash(),
            modes,
        };
        Ok(ToolResponse::json(&body, ToolMetadata::new("status", elapsed(start))).into_call_tool_result())
    }

    #[tool(
        name = "history",
        description = "All stored versions of a commit's analysis in one mode, oldest first, or a single version by number.",
        annotations(read_only_hint = true)
    )]
    async fn history(
        &self,
        Parameters(req): Parameters<HistoryRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let commit = match self.git.show(&req.commit).await {
            Ok(c) => c,
            Err(e) => return Ok(failure("history", start, &e)),
        };
        let mode = req.mode;
        let hash = commit.hash.clone();

        if let Some(number) = req.version {
            return Ok(match self.blocking(move |o| o.get_version(&hash, mode, number)).await {
                Ok(Some(v)) => render_version("history", start, &v, OutputFormat::Json),
                Ok(None) => ToolResponse::error(
                    format!("no {mode} version {number} for {}", commit.short_hash()),
                    ToolMetadata::new("history", elapsed(start)).with_reason("not_found"),
                )
                .into_call_tool_result(),
                Err(e) => failure("history", start, &e),
            });
        }

        match self.blocking(move |o| o.list_versions(&hash, mode)).await {
            Ok(versions) => Ok(
                ToolResponse::json(&versions, ToolMetadata::new("history", elapsed(start)))
                    .into_call_tool_result(),
            ),
            Err(e) => Ok(failure("history", start, &e)),
        }
    }

    #[tool(
        name = "providers",
        description = "Configured analysis providers in priority order with live availability, plus accumulated usage (calls, tokens, cost).",
        annotations(read_only_hint = true)
    )]
    async fn providers(&self) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let providers = self.orchestrator.provider_status().await;
        let usage = match self.blocking(|o| o.provider_usage()).await {
            Ok(u) => u,
            Err(e) => return Ok(failure("providers", start, &e)),
        };
        let body = ProvidersResponse { providers, usage };
        Ok(ToolResponse::json(&body, ToolMetadata::new("providers", elapsed(start))).into_call_tool_result())
    }

    #[tool(
        name = "templates",
        description = "Prompt templates by category, including user templates from config and any that were rejected with their validation errors.",
        annotations(read_only_hint = true)
    )]
    async fn templates(&self) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let catalog = self.orchestrator.templates();
        Ok(ToolResponse::json(&catalog, ToolMetadata::new("templates", elapsed(start))).into_call_tool_result())
    }

    #[tool(
        name = "cache",
        description = "Inspect or maintain the analysis cache. Actions: stats, clear (by commit and/or mode, or all: true), cleanup (keep newest N versions per key), usage.",
        annotations(destructive_hint = true)
    )]
    async fn cache(
        &self,
        Parameters(req): Parameters<CacheRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let meta = || ToolMetadata::new("cache", elapsed(start));

        let result = match req.action {
            CacheAction::Stats => self
                .blocking(|o| o.stats())
                .await
                .map(|s| ToolResponse::json(&s, meta())),
            CacheAction::Usage => self
                .blocking(|o| o.provider_usage())
                .await
                .map(|u| ToolResponse::json(&u, meta())),
            CacheAction::Cleanup => {
                let keep = req.keep;
                self.blocking(move |o| o.cleanup(keep))
                    .await
                    .map(|n| ToolResponse::json(&serde_json::json!({ "deleted": n }), meta()))
            }
            CacheAction::Clear => {
                let mut scope = match req.clear_scope() {
                    Ok(s) => s,
                    Err(msg) => return Ok(invalid("cache", start, msg)),
                };
                scope = self.expand_scope(scope).await;
                self.blocking(move |o| o.clear(&scope))
                    .await
                    .map(|n| ToolResponse::json(&serde_json::json!({ "deleted": n }), meta()))
            }
        };

        match result {
            Ok(response) => Ok(response.into_call_tool_result()),
            Err(e) => Ok(failure("cache", start, &e)),
        }
    }

    /// Short hashes in a clear scope are expanded through git when possible.
    /// Commits no longer in the repository are matched verbatim.
    async fn expand_scope(&self, scope: ClearScope) -> ClearScope {
        let full = |rev: String| async move {
            match self.git.show(&rev).await {
                Ok(c) => c.hash,
                Err(_) => rev,
            }
        };
        match scope {
            ClearScope::Commit(rev) => ClearScope::Commit(full(rev).await),
            ClearScope::Key { commit, mode } => ClearScope::Key {
                commit: full(commit).await,
                mode,
            },
            other => other,
        }
    }

    #[tool(
        name = "reload",
        description = "Re-read .drommage/config.toml. Providers and templates are replaced for new work; running analyses finish with the old settings.",
        annotations(read_only_hint = false)
    )]
    async fn reload(&self) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let config = match Config::load(&self.repo_root) {
            Ok(c) => c,
            Err(e) => return Ok(failure("reload", start, &e)),
        };
        self.orchestrator.reload(&config);
        let catalog = self.orchestrator.templates();
        let body = serde_json::json!({
            "providers": config.providers.len(),
            "templates": catalog.templates.len(),
            "rejected_templates": catalog.rejected,
            "keep_versions": self.orchestrator.keep_versions(),
        });
        Ok(ToolResponse::json(&body, ToolMetadata::new("reload", elapsed(start))).into_call_tool_result())
    }
}

#[tool_handler]
impl ServerHandler for DrommageServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: "drommage".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "Drommage: versioned commit analysis for the current git repository.\n\n\
                 Workflow:\n\
                 1. Call `analyze` with a commit (hash or revision) and a mode. Pattern is instant; \
                    brief and deep consult the configured providers.\n\
                 2. For slow analyses call `trigger`, then `status` until the mode is cached.\n\
                 3. `history` lists every stored version; `force_refresh` adds a new one.\n\
                 4. `providers` and `templates` show what is configured; `cache` maintains the store.\n\n\
                 Every result is JSON with `status`; failures carry `metadata.reason`."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
