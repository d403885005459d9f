//! Call signaling: registration, the dialog table and the SIP-like text protocol.
//!
//! [`Signaling`] is the protocol state machine. It performs no IO: every operation
//! returns the messages to transmit and the events to surface. [`SignalingEngine`]
//! drives it with a [`TransportSocket`][crate::TransportSocket], an
//! [`EventSink`][crate::EventSink] and a receive thread.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::MediaConfig;
use crate::event::{CallEvent, MediaKind};
use crate::rtp::Pt;
use crate::sdp::{SdpError, SessionBody};

mod auth;
pub use auth::{Credentials, DigestChallenge};

mod cause;
pub use cause::CauseTable;

mod core;
pub use self::core::Signaling;

mod dialog;

mod engine;
pub use engine::SignalingEngine;

mod ids;
pub use ids::IdGen;

mod message;
pub use message::{Headers, Message, Method, NameAddr, Request, Response, Uri};

mod parser;

mod ports;
pub use ports::PortAllocator;

mod register;

/// Errors from signaling.
#[derive(Debug, Error)]
pub enum SignalError {
    /// A message that doesn't follow the grammar.
    #[error("parse: {0}")]
    Parse(String),

    /// A message lacking a header we can't do without.
    #[error("missing header: {0}")]
    MissingHeader(&'static str),

    /// A session body we can't use.
    #[error("{0}")]
    Body(#[from] SdpError),

    /// No dialog for the party.
    #[error("no dialog for party: {0}")]
    NoDialog(String),

    /// The dialog is not in a state that allows the operation.
    #[error("dialog in wrong state: {0}")]
    InvalidState(String),

    /// An empty or otherwise unusable party identifier.
    #[error("invalid party identifier")]
    InvalidParty,

    /// The engine thread could not be started, or a send failed.
    #[error("transport: {0}")]
    Transport(#[from] io::Error),
}

/// Opaque call identifier, the Call-ID of the dialog.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId(String);

impl DialogId {
    /// The Call-ID text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for DialogId {
    fn from(v: String) -> Self {
        DialogId(v)
    }
}

impl From<&str> for DialogId {
    fn from(v: &str) -> Self {
        DialogId(v.to_string())
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Media parameters of one side of a call, as carried in the session body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaParams {
    /// Connection address.
    pub addr: IpAddr,
    /// Audio RTP port.
    pub audio_port: u16,
    /// Audio payload type.
    pub audio_pt: Pt,
    /// Audio media key.
    pub audio_key: Option<String>,
    /// Video RTP port, if the side has video.
    pub video_port: Option<u16>,
    /// Video media key.
    pub video_key: Option<String>,
}

impl MediaParams {
    /// Read the parameters out of a session body.
    pub fn from_body(body: &SessionBody) -> Result<Self, SdpError> {
        let audio = body
            .audio()
            .ok_or_else(|| SdpError::Inconsistent("no audio line".into()))?;
        let video = body.video();

        Ok(MediaParams {
            addr: body.addr,
            audio_port: audio.port,
            audio_pt: audio.pt,
            audio_key: audio.key.clone(),
            video_port: video.map(|v| v.port),
            video_key: video.and_then(|v| v.key.clone()),
        })
    }

    /// Port and key for a media kind.
    pub fn get(&self, kind: MediaKind) -> Option<(u16, Option<&str>)> {
        match kind {
            MediaKind::Audio => Some((self.audio_port, self.audio_key.as_deref())),
            MediaKind::Video => self
                .video_port
                .map(|p| (p, self.video_key.as_deref())),
        }
    }
}

/// The result of answering an inbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// The dialog answered.
    pub dialog: DialogId,
    /// Our media parameters.
    pub local: MediaParams,
    /// The caller's media parameters.
    pub remote: MediaParams,
}

impl Negotiated {
    /// The [`MediaConfig`] for one media kind, if both sides have it.
    pub fn media_config(&self, kind: MediaKind) -> Option<MediaConfig> {
        media_config(&self.local, &self.remote, kind)
    }
}

/// The [`MediaConfig`] for one kind given both sides' parameters.
pub fn media_config(
    local: &MediaParams,
    remote: &MediaParams,
    kind: MediaKind,
) -> Option<MediaConfig> {
    let (local_port, local_key) = local.get(kind)?;
    let (remote_port, remote_key) = remote.get(kind)?;

    let mut config = MediaConfig::new(kind, local_port, SocketAddr::new(remote.addr, remote_port));
    if kind == MediaKind::Audio {
        config = config.set_payload_type(remote.audio_pt);
    }

    // Keys only apply when both sides sent one.
    if let (Some(l), Some(r)) = (local_key, remote_key) {
        config = config.set_keys(Some(l.to_string()), Some(r.to_string()));
    }

    Some(config)
}

/// Kind of call, deciding the destination prefix and failure handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CallVariant {
    /// A call to one party.
    #[default]
    Individual,
    /// A call to a talk group.
    Group,
    /// A one-way broadcast to a group.
    Broadcast,
}

impl CallVariant {
    /// Prefix put in front of the called party in the request URI.
    pub fn prefix(&self) -> &'static str {
        match self {
            CallVariant::Individual => "",
            CallVariant::Group => "grp_",
            CallVariant::Broadcast => "bc_",
        }
    }

    /// Whether a failure response to the setup is acknowledged.
    ///
    /// The broadcast server doesn't wait for an ACK and treats one as a new
    /// transaction.
    pub fn acks_failure(&self) -> bool {
        !matches!(self, CallVariant::Broadcast)
    }
}

/// Parameters of an outbound call.
///
/// ```
/// # use callcore::{CallVariant, SetupRequest};
/// let req = SetupRequest::new("3001")
///     .set_variant(CallVariant::Group)
///     .set_video(true);
/// ```
#[derive(Debug, Clone)]
pub struct SetupRequest {
    called: String,
    calling: Option<String>,
    domain: Option<String>,
    video: bool,
    variant: CallVariant,
    payload: Option<Vec<u8>>,
}

impl SetupRequest {
    /// Call `called`.
    pub fn new(called: impl Into<String>) -> Self {
        SetupRequest {
            called: called.into(),
            calling: None,
            domain: None,
            video: false,
            variant: CallVariant::default(),
            payload: None,
        }
    }

    /// Present the call as coming from this user instead of the configured one.
    pub fn set_calling(mut self, calling: impl Into<String>) -> Self {
        self.calling = Some(calling.into());
        self
    }

    /// Use this domain in the request URI instead of the configured one.
    pub fn set_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Offer a video line besides audio.
    pub fn set_video(mut self, video: bool) -> Self {
        self.video = video;
        self
    }

    /// Kind of call.
    pub fn set_variant(mut self, variant: CallVariant) -> Self {
        self.variant = variant;
        self
    }

    /// Higher-level payload embedded in the setup.
    pub fn set_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// The called party.
    pub fn called(&self) -> &str {
        &self.called
    }
}

/// One message to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    /// Where to.
    pub dest: SocketAddr,
    /// What.
    pub message: Message,
}

/// What an operation of the state machine produced.
#[derive(Debug, Default)]
pub struct Effects {
    /// Messages to send, in order.
    pub transmit: Vec<Transmit>,
    /// Events to surface, in order.
    pub events: Vec<CallEvent>,
}

impl Effects {
    fn send(&mut self, dest: SocketAddr, message: impl Into<Message>) {
        self.transmit.push(Transmit {
            dest,
            message: message.into(),
        });
    }
}

/// Outcome of processing one inbound message.
#[derive(Debug, Default)]
pub struct Incoming {
    /// Replies and follow-up requests sent in response.
    pub replies: Vec<Transmit>,
    /// Events surfaced.
    pub events: Vec<CallEvent>,
}

impl From<Effects> for Incoming {
    fn from(e: Effects) -> Self {
        Incoming {
            replies: e.transmit,
            events: e.events,
        }
    }
}
