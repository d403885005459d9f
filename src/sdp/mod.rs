//! The compact session body describing negotiated media.
//!
//! SDP shaped, but only what this system negotiates: session id, connection
//! address, one of two fixed audio profiles, the fixed video profile, ports and
//! optional media keys.

use thiserror::Error;

mod data;
pub use data::{AudioProfile, MediaLine, SessionBody, VIDEO_CLOCK_RATE, VIDEO_PT};

mod parser;

/// Errors from parsing session bodies.
#[derive(Debug, Error)]
pub enum SdpError {
    /// The body doesn't follow the grammar.
    #[error("body parse: {0}")]
    Parse(String),

    /// The body parsed but can't be used.
    #[error("body inconsistent: {0}")]
    Inconsistent(String),
}
