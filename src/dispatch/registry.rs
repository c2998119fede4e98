use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::analysis::AnalysisMode;
use crate::dispatch::generic::GenericHttpBackend;
use crate::dispatch::http::{CloudApiBackend, PROBE_TIMEOUT, build_client, header_list};
use crate::dispatch::ollama::OllamaBackend;
use crate::dispatch::{ProviderBackend, ProviderRequest, ProviderResult, SendGate};
use crate::error::{DrommageError, FailureReason, ProviderFailure};

/// Max concurrent outbound provider requests per process.
const HTTP_MAX_CONCURRENT: usize = 8;

/// How long a probe answer is trusted before probing again.
pub const PROBE_TTL: Duration = Duration::from_secs(30);

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Which transport a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Ollama-style daemon on the local machine.
    #[serde(alias = "ollama")]
    LocalDaemon,
    /// OpenAI-compatible chat completions with a bearer credential.
    #[serde(alias = "openai")]
    CloudApi,
    /// Anything that accepts `{model, prompt}` and answers with text.
    #[serde(alias = "http")]
    GenericHttp,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalDaemon => "local_daemon",
            Self::CloudApi => "cloud_api",
            Self::GenericHttp => "generic_http",
        }
    }
}

/// One configured provider. Loaded from the `[[providers]]` config tables.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub name: String,
    #[serde(alias = "type")]
    pub kind: TransportKind,
    pub endpoint: String,
    pub model: String,
    /// Lower is preferred.
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Name of the env var holding the credential. The value itself is never stored.
    #[serde(default, alias = "api_key_env")]
    pub credential_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_modes")]
    pub modes: Vec<AnalysisMode>,
    #[serde(default)]
    pub cost_per_1k_tokens: f64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_priority() -> u32 {
    100
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_modes() -> Vec<AnalysisMode> {
    vec![AnalysisMode::Brief, AnalysisMode::Deep]
}

impl ProviderDescriptor {
    pub fn new(name: &str, kind: TransportKind, endpoint: &str, model: &str, priority: u32) -> Self {
        Self {
            name: name.to_string(),
            kind,
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            priority,
            enabled: true,
            credential_env: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            modes: default_modes(),
            cost_per_1k_tokens: 0.0,
            headers: BTreeMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// Pattern mode never goes to a provider, whatever `modes` says.
    pub fn supports(&self, mode: AnalysisMode) -> bool {
        mode.uses_provider() && self.modes.contains(&mode)
    }

    pub fn estimate_cost(&self, tokens: u64) -> f64 {
        tokens as f64 / 1000.0 * self.cost_per_1k_tokens
    }
}

impl std::fmt::Debug for ProviderDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Header values often carry credentials.
        let headers: Vec<&String> = self.headers.keys().collect();
        f.debug_struct("ProviderDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .field("credential_env", &self.credential_env)
            .field("timeout_secs", &self.timeout_secs)
            .field("modes", &self.modes)
            .field("headers", &headers)
            .finish()
    }
}

/// A descriptor bound to the backend that talks to it.
pub struct Provider {
    pub descriptor: ProviderDescriptor,
    backend: Arc<dyn ProviderBackend>,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl Provider {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

/// Snapshot of one provider for status listings.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub kind: TransportKind,
    pub endpoint: String,
    pub model: String,
    pub priority: u32,
    pub enabled: bool,
    pub available: bool,
    pub modes: Vec<AnalysisMode>,
}

/// Successful dispatch plus any attempt that failed before it.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub result: ProviderResult,
    pub failed_attempts: Vec<ProviderFailure>,
}

pub struct Registry {
    /// Sorted by priority; ties keep registration order.
    providers: Vec<Arc<Provider>>,
    probe_cache: Mutex<HashMap<String, (bool, Instant)>>,
    probe_ttl: Duration,
    semaphore: Semaphore,
}

impl Registry {
    /// Build backends for each descriptor. Duplicate names keep the first entry.
    pub fn from_descriptors(descriptors: Vec<ProviderDescriptor>) -> Self {
        let client = build_client();
        let entries = descriptors
            .into_iter()
            .map(|d| {
                let headers = header_list(&d.headers);
                let backend: Arc<dyn ProviderBackend> = match d.kind {
                    TransportKind::LocalDaemon => Arc::new(OllamaBackend::new(
                        client.clone(),
                        &d.name,
                        &d.endpoint,
                        &d.model,
                    )),
                    TransportKind::CloudApi => Arc::new(CloudApiBackend::new(
                        client.clone(),
                        &d.name,
                        &d.endpoint,
                        d.credential_env.clone(),
                        headers,
                    )),
                    TransportKind::GenericHttp => Arc::new(GenericHttpBackend::new(
                        client.clone(),
                        &d.name,
                        &d.endpoint,
                        headers,
                    )),
                };
                (d, backend)
            })
            .collect();
        Self::with_backends(entries)
    }

    /// Register providers with explicit backends.
    pub fn with_backends(entries: Vec<(ProviderDescriptor, Arc<dyn ProviderBackend>)>) -> Self {
        let mut seen = HashSet::new();
        let mut providers: Vec<Arc<Provider>> = Vec::with_capacity(entries.len());
        for (descriptor, backend) in entries {
            if descriptor.name.trim().is_empty() {
                tracing::warn!("skipping provider with empty name");
                continue;
            }
            if !seen.insert(descriptor.name.clone()) {
                tracing::warn!(provider = %descriptor.name, "duplicate provider name, keeping first");
                continue;
            }
            providers.push(Arc::new(Provider { descriptor, backend }));
        }
        // Stable: equal priorities stay in registration order.
        providers.sort_by_key(|p| p.descriptor.priority);

        Self {
            providers,
            probe_cache: Mutex::new(HashMap::new()),
            probe_ttl: PROBE_TTL,
            semaphore: Semaphore::new(HTTP_MAX_CONCURRENT),
        }
    }

    pub fn with_probe_ttl(mut self, ttl: Duration) -> Self {
        self.probe_ttl = ttl;
        self
    }

    /// Returns the number of outbound request permits (for testing).
    pub fn semaphore_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn all(&self) -> &[Arc<Provider>] {
        &self.providers
    }

    pub fn get(&self, name: &str) -> Option<Arc<Provider>> {
        self.providers.iter().find(|p| p.name() == name).cloned()
    }

    /// Enabled providers, most preferred first.
    pub fn list_enabled(&self) -> Vec<Arc<Provider>> {
        self.providers
            .iter()
            .filter(|p| p.descriptor.enabled)
            .cloned()
            .collect()
    }

    /// Liveness check. Never errors; cached for the probe TTL.
    pub async fn probe(&self, provider: &Provider) -> bool {
        if !provider.descriptor.enabled {
            return false;
        }
        let name = provider.name();
        if let Some(cached) = self.cached_probe(name) {
            return cached;
        }

        let available = tokio::time::timeout(PROBE_TIMEOUT, provider.backend.probe())
            .await
            .unwrap_or(false);
        tracing::debug!(provider = name, available, "probed provider");

        if let Ok(mut cache) = self.probe_cache.lock() {
            cache.insert(name.to_string(), (available, Instant::now()));
        }
        available
    }

    fn cached_probe(&self, name: &str) -> Option<bool> {
        let cache = self.probe_cache.lock().ok()?;
        let (available, at) = cache.get(name)?;
        (at.elapsed() < self.probe_ttl).then_some(*available)
    }

    fn forget_probe(&self, name: &str) {
        if let Ok(mut cache) = self.probe_cache.lock() {
            cache.remove(name);
        }
    }

    /// First enabled provider, by priority, that supports `mode` and probes available.
    pub async fn select_for(&self, mode: AnalysisMode) -> Result<Arc<Provider>, DrommageError> {
        self.next_available(mode, 0)
            .await
            .map(|(_, p)| p)
            .ok_or(DrommageError::NoProviderAvailable { mode })
    }

    async fn next_available(&self, mode: AnalysisMode, from: usize) -> Option<(usize, Arc<Provider>)> {
        for (idx, provider) in self.providers.iter().enumerate().skip(from) {
            if !provider.descriptor.enabled || !provider.descriptor.supports(mode) {
                continue;
            }
            if self.probe(provider).await {
                return Some((idx, provider.clone()));
            }
        }
        None
    }

    /// One call with the provider's own timeout.
    ///
    /// Waiting for an outbound permit is abandoned if the gate is cancelled
    /// first. The provider timeout covers only the call itself.
    pub async fn invoke(
        &self,
        provider: &Provider,
        prompt: &str,
        gate: &SendGate,
    ) -> Result<ProviderResult, ProviderFailure> {
        let name = provider.name();
        let _permit = tokio::select! {
            biased;
            _ = gate.cancelled() => {
                return Err(ProviderFailure::new(name, FailureReason::Cancelled, "abandoned while queued"));
            }
            permit = self.semaphore.acquire() => permit.map_err(|_| {
                ProviderFailure::new(name, FailureReason::Unreachable, "dispatch is shutting down")
            })?,
        };

        let timeout = provider.descriptor.timeout();
        let req = ProviderRequest {
            prompt: prompt.to_string(),
            model: provider.descriptor.model.clone(),
            deadline: Instant::now() + timeout,
            gate: gate.clone(),
        };

        let start = Instant::now();
        let result = match tokio::time::timeout(timeout, provider.backend.invoke(&req)).await {
            Ok(r) => r,
            Err(_) => Err(ProviderFailure::new(
                name,
                FailureReason::Timeout,
                format!("no response within {}s", timeout.as_secs()),
            )),
        };
        // Attribute to the registered name, whatever the backend reported.
        let result = result.map(|mut r| {
            r.provider = name.to_string();
            r
        });

        match &result {
            Ok(r) => tracing::info!(
                provider = name,
                model = %r.model,
                latency_ms = start.elapsed().as_millis() as u64,
                "provider call succeeded"
            ),
            Err(f) if f.reason == FailureReason::Cancelled => {
                tracing::debug!(provider = name, "provider call cancelled before send");
            }
            Err(f) => {
                tracing::warn!(provider = name, reason = %f.reason, "provider call failed: {}", f.message);
                // Next selection re-probes instead of trusting a stale "available".
                self.forget_probe(name);
            }
        }
        result
    }

    /// Select, invoke, and on failure retry exactly once with the next
    /// available provider in priority order.
    pub async fn run_with_fallback(
        &self,
        mode: AnalysisMode,
        prompt: &str,
        gate: &SendGate,
    ) -> Result<Dispatched, DrommageError> {
        let (first_idx, first) = self
            .next_available(mode, 0)
            .await
            .ok_or(DrommageError::NoProviderAvailable { mode })?;

        let mut failed_attempts = Vec::new();
        match self.invoke(&first, prompt, gate).await {
            Ok(result) => {
                return Ok(Dispatched {
                    result,
                    failed_attempts,
                });
            }
            Err(f) if f.reason == FailureReason::Cancelled => return Err(DrommageError::Cancelled),
            Err(f) => failed_attempts.push(f),
        }

        if let Some((_, second)) = self.next_available(mode, first_idx + 1).await {
            tracing::info!(from = first.name(), to = second.name(), "falling back");
            match self.invoke(&second, prompt, gate).await {
                Ok(result) => {
                    return Ok(Dispatched {
                        result,
                        failed_attempts,
                    });
                }
                Err(f) if f.reason == FailureReason::Cancelled => {
                    return Err(DrommageError::Cancelled);
                }
                Err(f) => failed_attempts.push(f),
            }
        }

        Err(DrommageError::AllProvidersExhausted {
            attempts: failed_attempts,
        })
    }

    /// Every registered provider with its current availability.
    pub async fn status(&self) -> Vec<ProviderStatus> {
        let probes = self.providers.iter().map(|p| self.probe(p));
        let available = futures_util::future::join_all(probes).await;
        self.providers
            .iter()
            .zip(available)
            .map(|(p, available)| ProviderStatus {
                name: p.descriptor.name.clone(),
                kind: p.descriptor.kind,
                endpoint: p.descriptor.endpoint.clone(),
                model: p.descriptor.model.clone(),
                priority: p.descriptor.priority,
                enabled: p.descriptor.enabled,
                available,
                modes: p.descriptor.modes.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures_util::FutureExt;
    use futures_util::future::BoxFuture;

    use super::*;

    struct Fake {
        up: bool,
        delay: Duration,
        fail: Option<FailureReason>,
        probes: AtomicUsize,
        calls: AtomicUsize,
    }

    impl Fake {
        fn new(up: bool) -> Arc<Self> {
            Arc::new(Self {
                up,
                delay: Duration::ZERO,
                fail: None,
                probes: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(reason: FailureReason) -> Arc<Self> {
            Arc::new(Self {
                fail: Some(reason),
                ..Self::plain()
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                ..Self::plain()
            })
        }

        fn plain() -> Self {
            Self {
                up: true,
                delay: Duration::ZERO,
                fail: None,
                probes: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ProviderBackend for Fake {
        fn probe(&self) -> BoxFuture<'_, bool> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            let up = self.up;
            async move { up }.boxed()
        }

        fn invoke<'a>(
            &'a self,
            req: &'a ProviderRequest,
        ) -> BoxFuture<'a, Result<ProviderResult, ProviderFailure>> {
            async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                if let Some(reason) = self.fail {
                    return Err(ProviderFailure::new("fake", reason, "scripted"));
                }
                Ok(ProviderResult {
                    text: format!("echo: {}", req.prompt),
                    model: req.model.clone(),
                    provider: req.model.clone(),
                    prompt_tokens: Some(3),
                    completion_tokens: Some(4),
                    latency_ms: 0,
                })
            }
            .boxed()
        }
    }

    fn e(d: ProviderDescriptor, fake: Arc<Fake>) -> (ProviderDescriptor, Arc<dyn ProviderBackend>) {
        (d, fake as Arc<dyn ProviderBackend>)
    }

    fn desc(name: &str, priority: u32) -> ProviderDescriptor {
        ProviderDescriptor::new(name, TransportKind::GenericHttp, "http://unused", name, priority)
    }

    #[test]
    fn list_enabled_orders_by_priority_then_registration() {
        let mut off = desc("off", 0);
        off.enabled = false;
        let reg = Registry::with_backends(vec![
            e(desc("c", 2), Fake::new(true)),
            e(desc("a", 1), Fake::new(true)),
            e(off, Fake::new(true)),
            e(desc("b", 1), Fake::new(true)),
        ]);
        let names: Vec<String> = reg
            .list_enabled()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn duplicate_names_keep_first() {
        let reg = Registry::with_backends(vec![
            e(desc("a", 5), Fake::new(true)),
            e(desc("a", 1), Fake::new(true)),
        ]);
        assert_eq!(reg.all().len(), 1);
        assert_eq!(reg.all()[0].descriptor.priority, 5);
    }

    #[tokio::test]
    async fn select_skips_disabled_provider() {
        let mut a = desc("a", 1);
        a.enabled = false;
        let reg = Registry::with_backends(vec![
            e(a, Fake::new(true)),
            e(desc("b", 2), Fake::new(true)),
        ]);
        let chosen = reg.select_for(AnalysisMode::Brief).await.unwrap();
        assert_eq!(chosen.name(), "b");
    }

    #[tokio::test]
    async fn select_for_pattern_has_no_provider() {
        let mut a = desc("a", 1);
        a.modes = AnalysisMode::ALL.to_vec();
        let reg = Registry::with_backends(vec![e(a, Fake::new(true))]);
        let err = reg.select_for(AnalysisMode::Pattern).await.unwrap_err();
        assert!(matches!(
            err,
            DrommageError::NoProviderAvailable {
                mode: AnalysisMode::Pattern
            }
        ));
    }

    #[tokio::test]
    async fn select_respects_mode_support() {
        let mut a = desc("a", 1);
        a.modes = vec![AnalysisMode::Brief];
        let reg = Registry::with_backends(vec![
            e(a, Fake::new(true)),
            e(desc("b", 2), Fake::new(true)),
        ]);
        assert_eq!(reg.select_for(AnalysisMode::Brief).await.unwrap().name(), "a");
        assert_eq!(reg.select_for(AnalysisMode::Deep).await.unwrap().name(), "b");
    }

    #[tokio::test]
    async fn probe_is_cached_within_ttl() {
        let fake = Fake::new(true);
        let reg = Registry::with_backends(vec![e(desc("a", 1), fake.clone())]);
        let p = reg.get("a").unwrap();
        assert!(reg.probe(&p).await);
        assert!(reg.probe(&p).await);
        assert_eq!(fake.probes.load(Ordering::SeqCst), 1);

        let reg = Registry::with_backends(vec![e(desc("a", 1), fake.clone())])
            .with_probe_ttl(Duration::ZERO);
        let p = reg.get("a").unwrap();
        reg.probe(&p).await;
        reg.probe(&p).await;
        assert_eq!(fake.probes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn invoke_times_out() {
        let mut a = desc("a", 1);
        a.timeout_secs = 1;
        let reg = Registry::with_backends(vec![e(a, Fake::slow(Duration::from_secs(5)))]);
        let p = reg.get("a").unwrap();
        let err = reg.invoke(&p, "hi", &SendGate::new()).await.unwrap_err();
        assert_eq!(err.reason, FailureReason::Timeout);
        assert_eq!(err.provider, "a");
        assert_eq!(reg.semaphore_permits(), HTTP_MAX_CONCURRENT);
    }

    #[tokio::test]
    async fn fallback_retries_exactly_once() {
        let third = Fake::new(true);
        let reg = Registry::with_backends(vec![
            e(desc("a", 1), Fake::failing(FailureReason::Unreachable)),
            e(desc("b", 2), Fake::failing(FailureReason::RateLimited)),
            e(desc("c", 3), third.clone()),
        ]);
        let err = reg
            .run_with_fallback(AnalysisMode::Brief, "p", &SendGate::new())
            .await
            .unwrap_err();
        match err {
            DrommageError::AllProvidersExhausted { attempts } => {
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].reason, FailureReason::Unreachable);
                assert_eq!(attempts[1].reason, FailureReason::RateLimited);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(third.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fallback_reports_failed_first_attempt() {
        let reg = Registry::with_backends(vec![
            e(desc("a", 1), Fake::failing(FailureReason::AuthRejected)),
            e(desc("b", 2), Fake::new(true)),
        ]);
        let out = reg
            .run_with_fallback(AnalysisMode::Deep, "p", &SendGate::new())
            .await
            .unwrap();
        assert_eq!(out.result.provider, "b");
        assert_eq!(out.failed_attempts.len(), 1);
        assert_eq!(out.failed_attempts[0].reason, FailureReason::AuthRejected);
    }

    #[tokio::test]
    async fn cancelled_gate_stops_before_invoke() {
        let fake = Fake::new(true);
        let reg = Registry::with_backends(vec![e(desc("a", 1), fake.clone())]);
        let gate = SendGate::new();
        assert!(gate.try_cancel());
        let err = reg
            .run_with_fallback(AnalysisMode::Brief, "p", &gate)
            .await
            .unwrap_err();
        assert!(matches!(err, DrommageError::Cancelled));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn status_lists_every_provider() {
        let mut off = desc("off", 3);
        off.enabled = false;
        let reg = Registry::with_backends(vec![
            e(desc("up", 1), Fake::new(true)),
            e(desc("down", 2), Fake::new(false)),
            e(off, Fake::new(true)),
        ]);
        let status = reg.status().await;
        let summary: Vec<(&str, bool, bool)> = status
            .iter()
            .map(|s| (s.name.as_str(), s.enabled, s.available))
            .collect();
        assert_eq!(
            summary,
            vec![("up", true, true), ("down", true, false), ("off", false, false)]
        );
    }

    #[test]
    fn descriptor_parses_aliases_and_defaults() {
        let d: ProviderDescriptor = toml::from_str(
            r#"
            name = "local"
            type = "ollama"
            endpoint = "http://localhost:11434"
            model = "mistral:latest"
            "#,
        )
        .unwrap();
        assert_eq!(d.kind, TransportKind::LocalDaemon);
        assert_eq!(d.priority, 100);
        assert!(d.enabled);
        assert_eq!(d.timeout_secs, 30);
        assert_eq!(d.modes, vec![AnalysisMode::Brief, AnalysisMode::Deep]);
    }

    #[test]
    fn debug_redacts_header_values() {
        let mut d = desc("a", 1);
        d.headers.insert("Authorization".into(), "Bearer sk-secret".into());
        let dbg = format!("{d:?}");
        assert!(dbg.contains("Authorization"));
        assert!(!dbg.contains("sk-secret"));
    }
}
