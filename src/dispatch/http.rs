//! Shared HTTP plumbing plus the cloud-API (OpenAI-compatible) backend.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;

use crate::dispatch::{ProviderBackend, ProviderRequest, ProviderResult};
use crate::error::{FailureReason, ProviderFailure};

pub const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// Probe requests get a short fixed budget regardless of provider timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub fn build_client() -> Client {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(4)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("failed to build tuned HTTP client, using defaults: {e}");
            Client::new()
        })
}

/// Remaining time until the request deadline, or a Timeout failure if spent.
pub(crate) fn remaining(req: &ProviderRequest, provider: &str) -> Result<Duration, ProviderFailure> {
    req.deadline
        .checked_duration_since(Instant::now())
        .filter(|d| *d > Duration::from_millis(10))
        .ok_or_else(|| ProviderFailure::new(provider, FailureReason::Timeout, "deadline already passed"))
}

/// Map a non-success status to a failure. Returns None for 2xx.
pub(crate) fn classify_status(provider: &str, status: StatusCode) -> Option<ProviderFailure> {
    if status.is_success() {
        return None;
    }
    let reason = if status == StatusCode::TOO_MANY_REQUESTS {
        FailureReason::RateLimited
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        FailureReason::AuthRejected
    } else if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        FailureReason::Timeout
    } else if status.is_server_error() {
        FailureReason::Unreachable
    } else {
        FailureReason::MalformedResponse
    };
    Some(ProviderFailure::new(provider, reason, format!("HTTP {status}")))
}

/// Map a transport error. Never lets a raw reqwest error escape.
pub(crate) fn classify_transport(provider: &str, e: &reqwest::Error) -> ProviderFailure {
    let reason = if e.is_timeout() {
        FailureReason::Timeout
    } else if e.is_decode() || e.is_body() {
        FailureReason::MalformedResponse
    } else {
        FailureReason::Unreachable
    };
    ProviderFailure::new(provider, reason, e.to_string())
}

/// Read a response body, enforcing `MAX_RESPONSE_BYTES`.
pub(crate) async fn read_capped(provider: &str, response: Response) -> Result<Vec<u8>, ProviderFailure> {
    if let Some(len) = response.content_length()
        && len as usize > MAX_RESPONSE_BYTES
    {
        return Err(ProviderFailure::new(
            provider,
            FailureReason::MalformedResponse,
            format!("response too large: {len} bytes (max {MAX_RESPONSE_BYTES})"),
        ));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| classify_transport(provider, &e))?;
    if bytes.len() > MAX_RESPONSE_BYTES {
        return Err(ProviderFailure::new(
            provider,
            FailureReason::MalformedResponse,
            format!(
                "response too large: {} bytes (max {MAX_RESPONSE_BYTES})",
                bytes.len()
            ),
        ));
    }
    Ok(bytes.to_vec())
}

/// POST a JSON body and return the capped success body.
///
/// The send gate is checked immediately before the request leaves the process.
pub(crate) async fn post_json(
    client: &Client,
    provider: &str,
    url: &str,
    headers: &[(String, String)],
    body: &serde_json::Value,
    req: &ProviderRequest,
) -> Result<Vec<u8>, ProviderFailure> {
    let timeout = remaining(req, provider)?;

    let mut builder = client.post(url).timeout(timeout).json(body);
    for (k, v) in headers {
        builder = builder.header(k, v);
    }

    if !req.gate.begin_send() {
        return Err(ProviderFailure::new(
            provider,
            FailureReason::Cancelled,
            "abandoned before send",
        ));
    }

    let response = builder
        .send()
        .await
        .map_err(|e| classify_transport(provider, &e))?;

    if let Some(failure) = classify_status(provider, response.status()) {
        tracing::warn!(provider, status = %response.status(), "provider returned error status");
        return Err(failure);
    }

    read_capped(provider, response).await
}

pub(crate) fn header_list(headers: &BTreeMap<String, String>) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Cloud API backend (OpenAI-compatible chat completions)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

pub struct CloudApiBackend {
    client: Client,
    provider: String,
    /// Base URL, e.g. `https://api.openai.com/v1`.
    endpoint: String,
    credential_env: Option<String>,
    headers: Vec<(String, String)>,
}

impl CloudApiBackend {
    pub fn new(
        client: Client,
        provider: &str,
        endpoint: &str,
        credential_env: Option<String>,
        headers: Vec<(String, String)>,
    ) -> Self {
        Self {
            client,
            provider: provider.to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            credential_env,
            headers,
        }
    }

    fn api_key(&self) -> Option<String> {
        let var = self.credential_env.as_deref()?;
        std::env::var(var).ok().filter(|k| !k.trim().is_empty())
    }

    fn url(&self) -> String {
        if self.endpoint.ends_with("/chat/completions") {
            self.endpoint.clone()
        } else {
            format!("{}/chat/completions", self.endpoint)
        }
    }

    async fn query(&self, req: &ProviderRequest) -> Result<ProviderResult, ProviderFailure> {
        let start = Instant::now();

        let api_key = self.api_key().ok_or_else(|| {
            ProviderFailure::new(
                &self.provider,
                FailureReason::AuthRejected,
                format!(
                    "credential env {} not set",
                    self.credential_env.as_deref().unwrap_or("<none>")
                ),
            )
        })?;

        let body = serde_json::json!({
            "model": req.model,
            "messages": [{"role": "user", "content": req.prompt}]
        });

        let mut headers = self.headers.clone();
        headers.push(("Authorization".to_string(), format!("Bearer {api_key}")));

        let bytes = post_json(&self.client, &self.provider, &self.url(), &headers, &body, req).await?;

        let completion: ChatCompletion = serde_json::from_slice(&bytes).map_err(|e| {
            ProviderFailure::new(
                &self.provider,
                FailureReason::MalformedResponse,
                format!("failed to parse response: {e}"),
            )
        })?;

        let usage = completion.usage;
        let text = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                ProviderFailure::new(
                    &self.provider,
                    FailureReason::MalformedResponse,
                    "empty choices or null content",
                )
            })?;

        Ok(ProviderResult {
            text,
            model: req.model.clone(),
            provider: self.provider.clone(),
            prompt_tokens: usage.as_ref().and_then(|u| u.prompt_tokens),
            completion_tokens: usage.as_ref().and_then(|u| u.completion_tokens),
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }
}

impl ProviderBackend for CloudApiBackend {
    /// Cloud probes never hit the network: a present credential is enough.
    fn probe(&self) -> BoxFuture<'_, bool> {
        let available = self.api_key().is_some();
        async move { available }.boxed()
    }

    fn invoke<'a>(
        &'a self,
        req: &'a ProviderRequest,
    ) -> BoxFuture<'a, Result<ProviderResult, ProviderFailure>> {
        self.query(req).boxed()
    }
}
