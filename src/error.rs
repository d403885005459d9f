use thiserror::Error;

use crate::crypto::CryptoError;
use crate::media::MediaError;
use crate::sdp::SdpError;
use crate::signal::SignalError;

/// Errors surfaced by the public API.
#[derive(Debug, Error)]
pub enum CallError {
    /// Signaling errors.
    #[error("{0}")]
    Signal(#[from] SignalError),

    /// Session body errors.
    #[error("{0}")]
    Sdp(#[from] SdpError),

    /// Media session errors.
    #[error("{0}")]
    Media(#[from] MediaError),

    /// Key handling errors.
    #[error("{0}")]
    Crypto(#[from] CryptoError),

    /// Other IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}
