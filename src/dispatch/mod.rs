pub mod generic;
pub mod http;
pub mod ollama;
pub mod registry;

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderFailure;

/// What every backend accepts.
#[derive(Clone)]
pub struct ProviderRequest {
    pub prompt: String,
    pub model: String,
    pub deadline: Instant,
    /// Shared with the scheduler ticket; checked right before the request is sent.
    pub gate: SendGate,
}

/// What every backend returns on success.
#[derive(Debug, Clone)]
pub struct ProviderResult {
    pub text: String,
    pub model: String,
    pub provider: String,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub latency_ms: u64,
}

impl ProviderResult {
    pub fn total_tokens(&self) -> Option<u64> {
        match (self.prompt_tokens, self.completion_tokens) {
            (None, None) => None,
            (p, c) => Some(p.unwrap_or(0) + c.unwrap_or(0)),
        }
    }
}

/// Capability interface implemented once per transport kind.
///
/// Returns boxed futures so the registry can hold `Arc<dyn ProviderBackend>`.
pub trait ProviderBackend: Send + Sync {
    /// Cheap liveness / credential check. Must not error; `false` on any failure.
    fn probe(&self) -> BoxFuture<'_, bool>;

    /// Perform the call. Transport errors must be mapped to a `ProviderFailure`.
    fn invoke<'a>(
        &'a self,
        req: &'a ProviderRequest,
    ) -> BoxFuture<'a, Result<ProviderResult, ProviderFailure>>;
}

const GATE_OPEN: u8 = 0;
const GATE_SENT: u8 = 1;
const GATE_CANCELLED: u8 = 2;

/// Point-of-no-return marker for a single analysis.
///
/// Abandonment can cancel work only while the gate is open. Once a backend has
/// passed `begin_send`, the remote cost is being paid and the gate stays sent.
#[derive(Clone, Debug, Default)]
pub struct SendGate {
    state: Arc<AtomicU8>,
    token: CancellationToken,
}

impl SendGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by a backend right before bytes go over the wire.
    /// Returns false if the work was cancelled first.
    pub fn begin_send(&self) -> bool {
        match self.state.compare_exchange(
            GATE_OPEN,
            GATE_SENT,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(current) => current == GATE_SENT,
        }
    }

    /// Cancel if nothing has been sent yet. Returns true if cancellation took effect.
    pub fn try_cancel(&self) -> bool {
        let won = self
            .state
            .compare_exchange(
                GATE_OPEN,
                GATE_CANCELLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            self.token.cancel();
        }
        won
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == GATE_CANCELLED
    }

    pub fn is_sent(&self) -> bool {
        self.state.load(Ordering::Acquire) == GATE_SENT
    }

    /// Resolves when `try_cancel` succeeds.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}
