//! Call signaling and RTP media transport for a dispatcher console.
//!
//! The crate has two halves that meet at the negotiated media parameters:
//!
//! * [`SignalingEngine`] registers with the VOIP server, keeps the table of active
//!   call dialogs and translates between application call operations and a SIP-like
//!   text protocol. The protocol handling itself lives in a sans-IO state machine,
//!   [`signal::Signaling`], which only returns messages to transmit and events to
//!   surface. The engine wraps it with a [`TransportSocket`] and a receive thread.
//! * [`MediaSession`] carries one RTP bearer leg (audio or video) over UDP once a
//!   call is connected. It owns a receive thread that delivers payloads to the
//!   [`EventSink`] in sequence order, within a bounded reordering window.
//!
//! # Placing a call
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use callcore::*;
//! # struct Sink;
//! # impl EventSink for Sink {
//! #     fn on_call_event(&self, _: CallEvent) {}
//! # }
//! let config = EngineConfig::new()
//!     .set_user("1001")
//!     .set_password("secret")
//!     .set_domain("dispatch.example")
//!     .set_server_addr("10.0.0.1:5060".parse().unwrap());
//!
//! let transport = UdpTransport::bind_with_retries("0.0.0.0:5060".parse().unwrap(), 3).unwrap();
//! let engine = SignalingEngine::new(config, Arc::new(transport), Arc::new(Sink));
//! engine.start().unwrap();
//! engine.register().unwrap();
//!
//! let id = engine.setup_call(SetupRequest::new("2001")).unwrap();
//! ```
//!
//! When the peer answers, the sink receives [`CallEventKind::Connect`] with the
//! local and remote [`MediaParams`]. Those are used to start a [`MediaSession`]
//! per media kind.
//!
//! # Logging
//!
//! All logging goes through [`tracing`]. Party identifiers and addresses are wrapped
//! in a redacting type when the `pii` feature is enabled.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::new_without_default)]

#[macro_use]
extern crate tracing;

mod config;
pub use config::{EngineConfig, MediaConfig};

mod error;
pub use error::CallError;

mod event;
pub use event::{CallEvent, CallEventKind, DisconnectCause, EventSink, MediaKind};

pub mod crypto;
pub use crypto::{KeySource, MediaCipher, OsKeySource};

pub mod net;
pub use net::{TransportSocket, UdpTransport};

pub mod rtp;

pub mod sdp;

pub mod media;
pub use media::{MediaSession, SessionState};

pub mod signal;
pub use signal::{CallVariant, DialogId, MediaParams, Negotiated, SetupRequest};
pub use signal::{Incoming, SignalingEngine};

mod util;
