//! Local-daemon backend (Ollama HTTP API).

use std::time::Instant;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use reqwest::Client;
use serde::Deserialize;

use crate::dispatch::http::{PROBE_TIMEOUT, post_json};
use crate::dispatch::{ProviderBackend, ProviderRequest, ProviderResult};
use crate::error::{FailureReason, ProviderFailure};

#[derive(Deserialize)]
struct Tags {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

#[derive(Deserialize)]
struct Generate {
    #[serde(default)]
    response: String,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

pub struct OllamaBackend {
    client: Client,
    provider: String,
    endpoint: String,
    model: String,
}

impl OllamaBackend {
    pub fn new(client: Client, provider: &str, endpoint: &str, model: &str) -> Self {
        Self {
            client,
            provider: provider.to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    /// `mistral` matches an installed `mistral:latest` and vice versa.
    fn has_model(&self, installed: &[TagEntry]) -> bool {
        let base = self.model.split(':').next().unwrap_or(&self.model);
        installed.iter().any(|m| {
            m.name == self.model || m.name.split(':').next().unwrap_or(&m.name) == base
        })
    }

    async fn check(&self) -> bool {
        let url = format!("{}/api/tags", self.endpoint);
        let resp = match self.client.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                tracing::debug!(provider = %self.provider, status = %r.status(), "probe rejected");
                return false;
            }
            Err(e) => {
                tracing::debug!(provider = %self.provider, "probe failed: {e}");
                return false;
            }
        };
        match resp.json::<Tags>().await {
            Ok(tags) => {
                let found = self.has_model(&tags.models);
                if !found {
                    tracing::info!(
                        provider = %self.provider,
                        model = %self.model,
                        "daemon is up but model is not installed"
                    );
                }
                found
            }
            Err(_) => false,
        }
    }

    async fn generate(&self, req: &ProviderRequest) -> Result<ProviderResult, ProviderFailure> {
        let start = Instant::now();
        let url = format!("{}/api/generate", self.endpoint);
        let body = serde_json::json!({
            "model": req.model,
            "prompt": req.prompt,
            "stream": false,
        });

        let bytes = post_json(&self.client, &self.provider, &url, &[], &body, req).await?;

        let parsed: Generate = serde_json::from_slice(&bytes).map_err(|e| {
            ProviderFailure::new(
                &self.provider,
                FailureReason::MalformedResponse,
                format!("failed to parse response: {e}"),
            )
        })?;
        if parsed.response.trim().is_empty() {
            return Err(ProviderFailure::new(
                &self.provider,
                FailureReason::MalformedResponse,
                "empty response",
            ));
        }

        Ok(ProviderResult {
            text: parsed.response,
            model: req.model.clone(),
            provider: self.provider.clone(),
            prompt_tokens: parsed.prompt_eval_count,
            completion_tokens: parsed.eval_count,
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }
}

impl ProviderBackend for OllamaBackend {
    fn probe(&self) -> BoxFuture<'_, bool> {
        self.check().boxed()
    }

    fn invoke<'a>(
        &'a self,
        req: &'a ProviderRequest,
    ) -> BoxFuture<'a, Result<ProviderResult, ProviderFailure>> {
        self.generate(req).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::http::build_client;

    #[test]
    fn model_tag_matching() {
        let b = OllamaBackend::new(build_client(), "ollama", "http://localhost:11434/", "mistral");
        let installed = vec![TagEntry {
            name: "mistral:latest".into(),
        }];
        assert!(b.has_model(&installed));

        let b = OllamaBackend::new(build_client(), "ollama", "http://localhost:11434", "llama3:8b");
        assert!(!b.has_model(&installed));
        assert_eq!(b.endpoint, "http://localhost:11434");
    }
}
