//! Generic HTTP backend: POST `{model, prompt}` and read back a text field.

use std::time::Instant;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use reqwest::Client;

use crate::dispatch::http::{PROBE_TIMEOUT, post_json};
use crate::dispatch::{ProviderBackend, ProviderRequest, ProviderResult};
use crate::error::{FailureReason, ProviderFailure};

/// Response fields tried in order.
const TEXT_FIELDS: &[&str] = &["text", "response", "content", "output"];

pub struct GenericHttpBackend {
    client: Client,
    provider: String,
    endpoint: String,
    headers: Vec<(String, String)>,
}

impl GenericHttpBackend {
    pub fn new(client: Client, provider: &str, endpoint: &str, headers: Vec<(String, String)>) -> Self {
        Self {
            client,
            provider: provider.to_string(),
            endpoint: endpoint.to_string(),
            headers,
        }
    }

    async fn check(&self) -> bool {
        let mut builder = self.client.get(&self.endpoint).timeout(PROBE_TIMEOUT);
        for (k, v) in &self.headers {
            builder = builder.header(k, v);
        }
        match builder.send().await {
            // Any answer short of a server error means something is listening.
            Ok(r) => !r.status().is_server_error(),
            Err(e) => {
                tracing::debug!(provider = %self.provider, "probe failed: {e}");
                false
            }
        }
    }

    async fn call(&self, req: &ProviderRequest) -> Result<ProviderResult, ProviderFailure> {
        let start = Instant::now();
        let body = serde_json::json!({
            "model": req.model,
            "prompt": req.prompt,
        });

        let bytes = post_json(&self.client, &self.provider, &self.endpoint, &self.headers, &body, req)
            .await?;

        let text = extract_text(&bytes).ok_or_else(|| {
            ProviderFailure::new(
                &self.provider,
                FailureReason::MalformedResponse,
                "response carried no text field",
            )
        })?;

        Ok(ProviderResult {
            text,
            model: req.model.clone(),
            provider: self.provider.clone(),
            prompt_tokens: None,
            completion_tokens: None,
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// JSON object with a known text field, or a bare non-empty text body.
fn extract_text(bytes: &[u8]) -> Option<String> {
    match serde_json::from_slice::<serde_json::Value>(bytes) {
        Ok(serde_json::Value::Object(map)) => TEXT_FIELDS
            .iter()
            .find_map(|f| {
                map.get(*f)
                    .and_then(|v| v.as_str())
                    .filter(|t| !t.trim().is_empty())
            })
            .map(str::to_string),
        Ok(serde_json::Value::String(s)) => Some(s).filter(|t| !t.trim().is_empty()),
        Ok(_) => None,
        Err(_) => std::str::from_utf8(bytes)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
    }
}

impl ProviderBackend for GenericHttpBackend {
    fn probe(&self) -> BoxFuture<'_, bool> {
        self.check().boxed()
    }

    fn invoke<'a>(
        &'a self,
        req: &'a ProviderRequest,
    ) -> BoxFuture<'a, Result<ProviderResult, ProviderFailure>> {
        self.call(req).boxed()
    }
}
