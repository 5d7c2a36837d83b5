//! The external send gateway boundary.
//!
//! Delivery ultimately happens through a third-party provider the service
//! treats as opaque: hand it a recipient and a body, get back a provider
//! reference or a typed failure. The trait keeps the worker loop independent
//! of any concrete provider; implementations live in submodules
//! ([`http`] for real traffic, [`memory`] for tests and bare-config runs).

use std::{future::Future, pin::Pin};

use snafu::Snafu;

pub mod http;
pub mod memory;

/// Provider-assigned identifier for an accepted send, recorded on the
/// tracking ledger for audit.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProviderReference(pub String);

impl std::fmt::Display for ProviderReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Typed gateway failure. The split drives the worker's retry decision:
/// transient failures are retried up to the attempt budget, permanent ones
/// dead-letter immediately.
#[derive(Debug, Clone, Snafu)]
pub enum SendError {
    /// Timeout, rate limit, network failure, 5xx-class response. Worth
    /// retrying.
    #[snafu(display("transient gateway failure: {message}"))]
    Transient { message: String },

    /// Invalid recipient, rejected payload. Retrying cannot help.
    #[snafu(display("permanent gateway failure: {message}"))]
    Permanent { message: String },
}

impl SendError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// A message-send provider.
///
/// Implementations must be cheap to share across worker tasks; the send
/// future owns its inputs so the worker can bound it with a timeout without
/// borrowing from the envelope.
pub trait Gateway: Send + Sync + 'static {
    fn send(
        &self,
        recipient: &str,
        body: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderReference, SendError>> + Send + 'static>>;
}
