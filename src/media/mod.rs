//! One RTP bearer leg of a connected call.
//!
//! A [`MediaSession`] goes through the states
//!
//! ```text
//! CREATED -> RUNNING -> STOPPING -> ENDED
//! ```
//!
//! `start()` binds the media port N and the control port N+1 and spawns the
//! receive thread. `stop()` (or a BYE from the peer) moves the session to
//! STOPPING. The thread notices within one packet time, delivers a final `None`
//! payload to the sink unless the session was silenced, and marks the session
//! ENDED. Dropping the session waits for ENDED, bounded by a deadline.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::MediaConfig;
use crate::crypto::{CryptoError, MediaCipher};
use crate::event::EventSink;
use crate::rtp::Ssrc;
use crate::util::Pii;

mod receiver;
mod sender;
use sender::Sender;

/// Shortest time `Drop` waits for the receive thread to end.
const MIN_TEARDOWN_WAIT: Duration = Duration::from_secs(2);

/// Errors from media sessions.
#[derive(Debug, Error)]
pub enum MediaError {
    /// The session is not RUNNING. Nothing was sent.
    #[error("media session is not running")]
    NotRunning,

    /// `start()` was called on a session that isn't CREATED.
    #[error("media session already started")]
    AlreadyStarted,

    /// Media ports must be even, RTCP takes the odd port above.
    #[error("media port must be even: {0}")]
    OddPort(u16),

    /// Keys were negotiated but no cipher was installed.
    #[error("keys negotiated but no cipher installed")]
    NoCipher,

    /// The cipher refused the keys.
    #[error("{0}")]
    Crypto(#[from] CryptoError),

    /// Socket errors, passed on as they are.
    #[error("{0}")]
    Io(#[from] io::Error),
}

/// Lifecycle state of a [`MediaSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Configured, nothing bound yet.
    Created,
    /// Receive loop running, sending allowed.
    Running,
    /// Stop requested or peer ended, waiting for the loop to exit.
    Stopping,
    /// Loop exited, sockets released.
    Ended,
}

/// State shared between the session handle and its receive thread.
pub(crate) struct Shared {
    config: MediaConfig,
    sink: Arc<dyn EventSink>,
    state: Mutex<SessionState>,
    state_changed: Condvar,
    local_port: AtomicU16,
    sender: Mutex<Option<Sender>>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        // A poisoned lock only means a sink panicked on the receive thread.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    pub fn set_state(&self, state: SessionState) {
        *self.lock_state() = state;
        self.state_changed.notify_all();
    }

    /// Move from `from` to `to`, if currently in `from`.
    pub fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let mut lock = self.lock_state();
        if *lock != from {
            return false;
        }
        *lock = to;
        self.state_changed.notify_all();
        true
    }

    pub fn local_port(&self) -> u16 {
        self.local_port.load(Ordering::Acquire)
    }

    /// Run `f` on the sender under the per-session lock.
    pub fn with_sender<T: Default>(&self, f: impl FnOnce(&mut Sender) -> T) -> T {
        let mut lock = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        lock.as_mut().map(f).unwrap_or_default()
    }

    /// Wait until ENDED or `deadline`. Returns whether ENDED was reached.
    fn wait_ended(&self, deadline: Instant) -> bool {
        let mut lock = self.lock_state();
        while *lock != SessionState::Ended {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            lock = match self.state_changed.wait_timeout(lock, deadline - now) {
                Ok((l, _)) => l,
                Err(e) => e.into_inner().0,
            };
        }
        true
    }
}

/// One RTP bearer leg (audio or video).
pub struct MediaSession {
    shared: Arc<Shared>,
    cipher: Option<Box<dyn MediaCipher>>,
    handle: Option<JoinHandle<()>>,
}

impl MediaSession {
    /// A session in CREATED state. Nothing is bound until [`MediaSession::start`].
    pub fn new(config: MediaConfig, sink: Arc<dyn EventSink>) -> Self {
        let local_port = config.local_port();
        MediaSession {
            shared: Arc::new(Shared {
                config,
                sink,
                state: Mutex::new(SessionState::Created),
                state_changed: Condvar::new(),
                local_port: AtomicU16::new(local_port),
                sender: Mutex::new(None),
            }),
            cipher: None,
            handle: None,
        }
    }

    /// Install the cipher for negotiated keys. Must happen before `start()`.
    pub fn set_cipher(&mut self, cipher: Box<dyn MediaCipher>) {
        self.cipher = Some(cipher);
    }

    /// Bind the sockets and start the receive thread.
    ///
    /// On failure the session is ENDED and stays unusable. Nothing else is
    /// affected.
    pub fn start(&mut self) -> Result<(), MediaError> {
        if self.shared.state() != SessionState::Created {
            return Err(MediaError::AlreadyStarted);
        }

        match self.do_start() {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    "Media {} on port {} failed to start: {}",
                    self.shared.config.kind(),
                    self.shared.config.local_port(),
                    e
                );
                self.shared.set_state(SessionState::Ended);
                Err(e)
            }
        }
    }

    fn do_start(&mut self) -> Result<(), MediaError> {
        let config = &self.shared.config;

        let port = config.local_port();
        if port % 2 != 0 {
            return Err(MediaError::OddPort(port));
        }

        let mut cipher = self.cipher.take();
        if let (Some(local), Some(remote)) = (config.local_key(), config.remote_key()) {
            let Some(c) = &mut cipher else {
                return Err(MediaError::NoCipher);
            };
            c.setup(local, remote)?;
        }

        let bind_ip = Ipv4Addr::UNSPECIFIED;
        let rtp = UdpSocket::bind(SocketAddr::from((bind_ip, port)))?;
        let rtcp = UdpSocket::bind(SocketAddr::from((bind_ip, port + 1)))?;

        rtp.set_read_timeout(Some(config.packet_time().max(Duration::from_millis(1))))?;
        let rtp_rx = rtp.try_clone()?;
        let rtcp_rx = rtcp.try_clone()?;
        rtcp_rx.set_nonblocking(true)?;

        *self.shared.sender.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(Sender::new(rtp, rtcp, config.clone(), cipher));

        self.shared.set_state(SessionState::Running);

        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(format!("media-{}-{}", config.kind(), port))
            .spawn(move || receiver::run(shared, rtp_rx, rtcp_rx));

        match handle {
            Ok(h) => self.handle = Some(h),
            Err(e) => {
                *self.shared.sender.lock().unwrap_or_else(|e| e.into_inner()) = None;
                return Err(e.into());
            }
        }

        info!(
            "Media {} running {} -> {}",
            config.kind(),
            port,
            Pii(config.remote_addr())
        );

        Ok(())
    }

    /// Send one frame of media.
    ///
    /// Runs the control step first (a report goes out when one is due), then sends
    /// one RTP packet at the current timestamp and advances the timestamp by one
    /// frame. Socket errors are returned unmodified.
    pub fn send(&self, data: &[u8], marker: bool) -> Result<usize, MediaError> {
        if self.shared.state() != SessionState::Running {
            return Err(MediaError::NotRunning);
        }

        let mut lock = self.shared.sender.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = lock.as_mut() else {
            return Err(MediaError::NotRunning);
        };

        // stop() takes the sender lock after leaving RUNNING.
        if self.shared.state() != SessionState::Running {
            return Err(MediaError::NotRunning);
        }

        sender.control_step(Instant::now());
        Ok(sender.send_rtp(data, marker)?)
    }

    /// Ask the receive loop to end and tell the peer with a BYE.
    ///
    /// Returns immediately. The loop notices within one packet time.
    pub fn stop(&self) {
        if self
            .shared
            .transition(SessionState::Created, SessionState::Ended)
        {
            return;
        }

        if self
            .shared
            .transition(SessionState::Running, SessionState::Stopping)
        {
            debug!("Media {} stopping", self.shared.config.kind());
            self.shared.with_sender(|s| s.send_bye());
        }
    }

    /// Suppress the final `None` callback of the receive loop.
    ///
    /// Used when a call is torn down defensively and the application must not
    /// hear about this leg again. Clears the local port.
    pub fn silence(&self) {
        self.shared.local_port.store(0, Ordering::Release);
    }

    /// Whether the session is RUNNING.
    pub fn is_running(&self) -> bool {
        self.shared.state() == SessionState::Running
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// The local RTP port, or 0 once silenced.
    pub fn local_port(&self) -> u16 {
        self.shared.local_port()
    }

    /// Our SSRC, once started.
    pub fn ssrc(&self) -> Option<Ssrc> {
        let lock = self.shared.sender.lock().unwrap_or_else(|e| e.into_inner());
        lock.as_ref().map(|s| s.ssrc())
    }

    /// The RTP timestamp the next packet will carry, once started.
    pub fn timestamp(&self) -> Option<u32> {
        let lock = self.shared.sender.lock().unwrap_or_else(|e| e.into_inner());
        lock.as_ref().map(|s| s.timestamp())
    }

    /// The configuration of this session.
    pub fn config(&self) -> &MediaConfig {
        &self.shared.config
    }

    fn teardown_wait(&self) -> Duration {
        (self.shared.config.packet_time() * 10).max(MIN_TEARDOWN_WAIT)
    }
}

impl Drop for MediaSession {
    fn drop(&mut self) {
        self.stop();

        let Some(handle) = self.handle.take() else {
            return;
        };

        let deadline = Instant::now() + self.teardown_wait();
        if self.shared.wait_ended(deadline) {
            let _ = handle.join();
        } else {
            warn!(
                "Media {} receive thread did not end in time, detaching",
                self.shared.config.kind()
            );
        }

        // Closes the send sockets.
        *self.shared.sender.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}
