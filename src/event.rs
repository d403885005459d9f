use std::fmt;

use serde::{Deserialize, Serialize};

use crate::signal::{DialogId, MediaParams};

/// Audio or video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    /// Audio bearer.
    Audio,
    /// Video bearer.
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Why a call ended, as told to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectCause {
    /// Orderly hangup by either side.
    NormalClearing,
    /// The called party is busy.
    UserBusy,
    /// Nobody answered in time.
    NoAnswer,
    /// The called number doesn't exist.
    Unallocated,
    /// The called party or the server refused the call.
    CallRejected,
    /// The network or transport failed.
    NetworkFailure,
    /// The called party or a service is temporarily unavailable.
    Unavailable,
    /// Anything not mapped to a specific cause.
    Other,
}

/// One record surfaced by the signaling engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEvent {
    /// The dialog the event concerns.
    pub dialog: DialogId,
    /// The remote party.
    pub party: String,
    /// What happened.
    pub kind: CallEventKind,
}

/// The fixed vocabulary of call events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEventKind {
    /// A new inbound call is ringing here.
    Setup {
        /// Display name from the caller's From header, if any.
        display_name: Option<String>,
        /// Whether the offer carries a video line.
        video: bool,
        /// The media parameters the caller offered.
        remote: MediaParams,
        /// Higher-level payload embedded in the setup, if any.
        payload: Option<Vec<u8>>,
    },
    /// The remote end is ringing.
    Alert,
    /// The outbound call was answered.
    Connect {
        /// Our media parameters.
        local: MediaParams,
        /// The peer's media parameters.
        remote: MediaParams,
    },
    /// The call is gone.
    Release {
        /// Cause told to the application.
        cause: DisconnectCause,
        /// The signaling status code that caused the release, if any.
        code: Option<u16>,
    },
}

/// Receiver of everything the core reports to the application.
///
/// Call events come from the signaling thread or the caller's thread, media
/// callbacks from the receive thread of each [`MediaSession`][crate::MediaSession].
pub trait EventSink: Send + Sync {
    /// A call event.
    fn on_call_event(&self, event: CallEvent);

    /// Ordered media payload. `None` is the final callback of a media session,
    /// signalling that its receive processing has stopped.
    fn on_media(&self, kind: MediaKind, payload: Option<&[u8]>) {
        let _ = (kind, payload);
    }

    /// Periodic receive bitrate of a media session in kbit/s.
    fn on_bitrate(&self, kind: MediaKind, kbps: f64) {
        let _ = (kind, kbps);
    }
}
