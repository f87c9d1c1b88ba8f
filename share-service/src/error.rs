//! Error taxonomy for linking and reconciliation.

use service_core::retry::{RetryHint, Retryable};
use std::time::Duration;
use thiserror::Error;

/// Every outcome the core surfaces to callers. Transport failures are always
/// folded into one of these variants before leaving the client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ShareError {
    #[error("Credential rejected by media server")]
    Unauthorized,

    #[error("Rate limited, retry after {}s", .retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Unknown library: {0}")]
    UnknownLibrary(String),

    #[error("Authorization code expired")]
    PinExpired,

    #[error("Authorization cancelled")]
    Cancelled,

    #[error("Authorization superseded by a newer request")]
    Superseded,

    #[error("No pending authorization with id {0}")]
    UnknownPin(String),

    #[error("Sharing policy names account {0} under conflicting keys")]
    DuplicateAccount(String),

    #[error("Operation already in progress")]
    Busy,

    #[error("No media server account linked")]
    NotLinked,

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ShareError {
    /// Whether a later attempt may succeed without any change on our side.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited { .. })
    }

    /// Short guidance suitable for rendering in a UI or CLI.
    pub fn guidance(&self) -> &'static str {
        match self {
            Self::Unauthorized | Self::NotLinked => "Re-authorize your media server account.",
            Self::PinExpired => "The code expired, request a new one.",
            Self::Cancelled | Self::Superseded => "Authorization was cancelled, start again.",
            Self::UnknownPin(_) => "No authorization is pending, request a new code.",
            Self::RateLimited { .. } | Self::Transient(_) | Self::Busy => {
                "The media server is busy, try again shortly."
            }
            Self::UnknownLibrary(_) => "Check the library names in the sharing policy.",
            Self::DuplicateAccount(_) => "List each account once in the sharing policy.",
            Self::Malformed(_) | Self::Rejected { .. } => {
                "The media server returned an unexpected response."
            }
            Self::Store(_) | Self::Config(_) => "Internal error, contact the administrator.",
        }
    }

    /// Label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::RateLimited { .. } => "rate_limited",
            Self::Transient(_) => "transient",
            Self::Malformed(_) => "malformed",
            Self::Rejected { .. } => "rejected",
            Self::UnknownLibrary(_) => "unknown_library",
            Self::DuplicateAccount(_) => "duplicate_account",
            Self::PinExpired => "expired",
            Self::Cancelled => "cancelled",
            Self::Superseded => "superseded",
            Self::UnknownPin(_) => "unknown_pin",
            Self::Busy => "busy",
            Self::NotLinked => "not_linked",
            Self::Store(_) => "store",
            Self::Config(_) => "config",
        }
    }
}

impl Retryable for ShareError {
    fn retry_hint(&self) -> RetryHint {
        match self {
            Self::Transient(_) => RetryHint::Backoff,
            Self::RateLimited { retry_after } => RetryHint::After(*retry_after),
            _ => RetryHint::Never,
        }
    }
}

impl From<reqwest::Error> for ShareError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            // Timeouts and connect failures count as transient.
            Self::Transient(err.to_string())
        }
    }
}

impl From<service_core::error::AppError> for ShareError {
    fn from(err: service_core::error::AppError) -> Self {
        Self::Store(err.to_string())
    }
}
