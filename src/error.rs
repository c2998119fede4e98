use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::analysis::AnalysisMode;

/// Why a single provider attempt failed. Drives the one-step fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    Unreachable,
    AuthRejected,
    MalformedResponse,
    RateLimited,
    /// Abandoned by every waiter before the request went over the wire.
    Cancelled,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Unreachable => "unreachable",
            Self::AuthRejected => "auth_rejected",
            Self::MalformedResponse => "malformed_response",
            Self::RateLimited => "rate_limited",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed provider attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{provider}: {reason}: {message}")]
pub struct ProviderFailure {
    pub provider: String,
    pub reason: FailureReason,
    pub message: String,
}

impl ProviderFailure {
    pub fn new(provider: &str, reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            reason,
            message: message.into(),
        }
    }
}

/// Authoring-time template problems. Never raised for missing commit data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template {template}: placeholder {{{placeholder}}} is not a declared variable")]
    UndeclaredPlaceholder { template: String, placeholder: String },

    #[error("template {template}: unbalanced brace at byte {offset}")]
    UnbalancedBrace { template: String, offset: usize },

    #[error("template {template}: empty placeholder at byte {offset}")]
    EmptyPlaceholder { template: String, offset: usize },

    #[error("unknown template: {0}")]
    Unknown(String),

    #[error("template {0} was rejected by validation")]
    Rejected(String),

    #[error("template {template} is for {template_mode} analysis, not {requested}")]
    ModeMismatch {
        template: String,
        template_mode: AnalysisMode,
        requested: AnalysisMode,
    },
}

#[derive(Debug, Error)]
pub enum DrommageError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("no provider available for {mode} analysis")]
    NoProviderAvailable { mode: AnalysisMode },

    #[error("all providers exhausted after {} attempt(s)", .attempts.len())]
    AllProvidersExhausted { attempts: Vec<ProviderFailure> },

    #[error("provider failure: {0}")]
    Provider(#[from] ProviderFailure),

    #[error("corrupt cache entry {commit}/{mode} v{version}: {message}")]
    CacheCorruption {
        commit: String,
        mode: AnalysisMode,
        version: u32,
        message: String,
    },

    #[error("store error: {0}")]
    Store(#[from] duckdb::Error),

    #[error(transparent)]
    Migration(#[from] crate::store::schema::MigrationError),

    #[error("git error: {0}")]
    Git(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("analysis cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}

impl DrommageError {
    /// Stable snake_case code for structured outcomes.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Template(_) => "template_error",
            Self::NoProviderAvailable { .. } => "no_provider_available",
            Self::AllProvidersExhausted { .. } => "all_providers_exhausted",
            Self::Provider(f) => f.reason.as_str(),
            Self::CacheCorruption { .. } => "cache_corruption",
            Self::Store(_) | Self::Migration(_) => "store_error",
            Self::Git(_) => "git_error",
            Self::Config(_) => "config_error",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }

    /// Returns true when a later identical request could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(f) => matches!(
                f.reason,
                FailureReason::Timeout | FailureReason::Unreachable | FailureReason::RateLimited
            ),
            Self::AllProvidersExhausted { attempts } => attempts.iter().any(|f| {
                matches!(
                    f.reason,
                    FailureReason::Timeout
                        | FailureReason::Unreachable
                        | FailureReason::RateLimited
                )
            }),
            Self::NoProviderAvailable { .. } | Self::Cancelled => true,
            _ => false,
        }
    }

    /// Short message safe to show in a status line or return to an MCP client.
    /// Does not leak endpoints or upstream bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::Template(e) => e.to_string(),
            Self::NoProviderAvailable { mode } => {
                format!("no provider configured or reachable for {mode} analysis")
            }
            Self::AllProvidersExhausted { attempts } => {
                let tried: Vec<String> = attempts
                    .iter()
                    .map(|f| format!("{} ({})", f.provider, f.reason))
                    .collect();
                format!("all providers failed: {}", tried.join(", "))
            }
            Self::Provider(f) => format!("{} failed: {}", f.provider, f.reason),
            Self::CacheCorruption {
                commit,
                mode,
                version,
                ..
            } => format!("cached {mode} analysis v{version} for {commit} is unreadable"),
            Self::Store(_) | Self::Migration(_) => "analysis cache unavailable".to_string(),
            Self::Git(msg) => format!("git: {msg}"),
            Self::Config(msg) => format!("config: {msg}"),
            Self::Cancelled => "analysis cancelled".to_string(),
            Self::Internal(msg) => msg.clone(),
        }
    }
}

pub type Result<T, E = DrommageError> = std::result::Result<T, E>;
