//! Error taxonomy shared by the signing, publishing and telemetry layers.

use std::time::Duration;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by `tunestr`.
///
/// `Config` is fatal and only produced before the watch loop starts.
/// `Signing` and `SigningTimeout` are per-track and recoverable.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or invalid settings, or an identity that cannot sign.
    #[error("configuration error: {0}")]
    Config(String),

    /// The signing backend was unreachable, rejected the event or answered
    /// with something unusable.
    #[error("signing failed: {0}")]
    Signing(String),

    /// The remote signer did not answer in time.
    #[error("signing timed out after {0:?}")]
    SigningTimeout(Duration),

    /// Malformed or undecryptable key material.
    #[error("invalid key: {0}")]
    Key(String),

    /// Relay connection failures, isolated per connection.
    #[error("relay {url}: {reason}")]
    Relay { url: String, reason: String },

    /// Media player connection or protocol failures.
    #[error("telemetry error: {0}")]
    Telemetry(String),

    #[error("key store error: {0}")]
    KeyStore(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn relay(url: &str, reason: impl ToString) -> Self {
        Error::Relay {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}
