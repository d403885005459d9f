use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::crypto::{KeyGen, KeySource};
use crate::event::EventSink;
use crate::net::{TransportSocket, DATAGRAM_MTU};
use crate::util::Pii;

use super::core::Signaling;
use super::{DialogId, Effects, Incoming, Negotiated, SetupRequest, SignalError};

/// How long one receive waits before the thread checks for shutdown and timers.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Pause after a receive error, so a broken socket doesn't spin the thread.
const ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// The signaling engine.
///
/// Owns the [`Signaling`] state machine behind one lock, the transport and the
/// event sink. Outbound operations run on the caller's thread. Inbound messages
/// and the registration refresh run on the engine thread started by
/// [`SignalingEngine::start`]. The lock is never held while sending or while
/// calling the sink.
pub struct SignalingEngine {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    signaling: Mutex<Signaling>,
    transport: Arc<dyn TransportSocket>,
    sink: Arc<dyn EventSink>,
    running: AtomicBool,
}

impl SignalingEngine {
    /// Create an engine drawing media keys from the OS RNG.
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn TransportSocket>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self::with_key_source(config, transport, sink, KeyGen::default())
    }

    /// Create an engine with a specific key generator.
    pub fn with_key_source(
        config: EngineConfig,
        transport: Arc<dyn TransportSocket>,
        sink: Arc<dyn EventSink>,
        keys: KeyGen,
    ) -> Self {
        let local_addr = config
            .local_addr()
            .or_else(|| transport.local_addr().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 5060)));

        SignalingEngine {
            inner: Arc::new(Inner {
                signaling: Mutex::new(Signaling::new(config, local_addr, keys)),
                transport,
                sink,
                running: AtomicBool::new(false),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Create an engine drawing media keys from `source`.
    pub fn with_source(
        config: EngineConfig,
        transport: Arc<dyn TransportSocket>,
        sink: Arc<dyn EventSink>,
        source: Box<dyn KeySource>,
    ) -> Self {
        Self::with_key_source(config, transport, sink, KeyGen::new(source))
    }

    /// Start the engine thread. Starting twice is a no-op.
    pub fn start(&self) -> Result<(), SignalError> {
        let mut handle = lock(&self.handle);
        if handle.is_some() {
            return Ok(());
        }

        self.inner.running.store(true, Ordering::Release);

        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name("signaling".into())
            .spawn(move || inner.run());

        match spawned {
            Ok(h) => {
                *handle = Some(h);
                Ok(())
            }
            Err(e) => {
                self.inner.running.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Stop and join the engine thread. Dialogs are left as they are.
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::Release);
        let handle = lock(&self.handle).take();
        if let Some(h) = handle {
            if h.join().is_err() {
                warn!("Signaling thread panicked");
            }
        }
    }

    /// Register with the server.
    pub fn register(&self) -> Result<(), SignalError> {
        let effects = self.inner.signaling().register();
        self.inner.apply(effects)?;
        Ok(())
    }

    /// Remove our binding at the server.
    pub fn unregister(&self) -> Result<(), SignalError> {
        let effects = self.inner.signaling().unregister();
        self.inner.apply(effects)?;
        Ok(())
    }

    /// Whether the server accepted our binding.
    pub fn is_registered(&self) -> bool {
        self.inner.signaling().is_registered()
    }

    /// Place a call.
    ///
    /// On a transport failure the dialog is erased, RELEASE with
    /// [`NetworkFailure`][crate::DisconnectCause::NetworkFailure] is surfaced and the
    /// error returned.
    pub fn setup_call(&self, req: SetupRequest) -> Result<DialogId, SignalError> {
        let (id, effects) = self.inner.signaling().setup_call(req)?;

        if let Err(e) = self.inner.apply(effects) {
            warn!("Setup {} failed: {}", id, e);
            let effects = self.inner.signaling().abort_setup(&id);
            self.inner.deliver(effects);
            return Err(e.into());
        }

        Ok(id)
    }

    /// Answer a ringing inbound call.
    pub fn connect_call(&self, party: &str) -> Result<Negotiated, SignalError> {
        let (negotiated, effects) = self.inner.signaling().connect_call(party)?;
        self.inner.apply(effects)?;
        Ok(negotiated)
    }

    /// End the call with the party. `false` if there was no dialog.
    pub fn release_call(&self, party: &str) -> bool {
        let (found, effects) = self.inner.signaling().release_call(party);
        if let Err(e) = self.inner.apply(effects) {
            // The dialog is gone locally either way.
            warn!("Release of {} not sent: {}", Pii(party), e);
        }
        found
    }

    /// Update local and/or server addressing.
    pub fn reregister(
        &self,
        new_local: Option<SocketAddr>,
        new_server: Option<SocketAddr>,
    ) -> Result<(), SignalError> {
        let effects = self.inner.signaling().reregister(new_local, new_server);
        self.inner.apply(effects)?;
        Ok(())
    }

    /// Handle one inbound message as if it arrived from `from`.
    ///
    /// The engine thread calls this for everything it receives. Replies are sent and
    /// events delivered before returning, the returned value is what was done.
    pub fn process_incoming(&self, raw: &[u8], from: SocketAddr) -> Incoming {
        self.inner.process_incoming(raw, from)
    }

    /// Whether a dialog exists for the party.
    pub fn has_dialog(&self, party: &str) -> bool {
        self.inner.signaling().has_dialog(party)
    }

    /// Number of active dialogs.
    pub fn dialog_count(&self) -> usize {
        self.inner.signaling().dialog_count()
    }
}

impl Drop for SignalingEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn signaling(&self) -> MutexGuard<'_, Signaling> {
        lock(&self.signaling)
    }

    fn run(&self) {
        let mut buf = vec![0_u8; DATAGRAM_MTU];
        debug!("Signaling thread started");

        while self.running.load(Ordering::Acquire) {
            match self.transport.recv_from(&mut buf, RECV_TIMEOUT) {
                Ok(Some((n, from))) => {
                    self.process_incoming(&buf[..n], from);
                }
                Ok(None) => {}
                Err(e) => {
                    debug!("Signaling receive error: {}", e);
                    thread::sleep(ERROR_BACKOFF);
                }
            }

            let effects = self.signaling().poll(Instant::now());
            if let Err(e) = self.apply(effects) {
                warn!("Registration refresh not sent: {}", e);
            }
        }

        debug!("Signaling thread stopped");
    }

    fn process_incoming(&self, raw: &[u8], from: SocketAddr) -> Incoming {
        let incoming = self
            .signaling()
            .process_incoming(raw, from, Instant::now());

        for t in &incoming.replies {
            if let Err(e) = self.transport.send_to(&t.message.to_bytes(), t.dest) {
                warn!("Reply to {} not sent: {}", Pii(t.dest), e);
            }
        }
        for event in &incoming.events {
            self.sink.on_call_event(event.clone());
        }

        incoming
    }

    /// Send everything, then deliver the events. The first send error is returned
    /// after the remaining messages were attempted.
    fn apply(&self, effects: Effects) -> io::Result<()> {
        let mut result = Ok(());

        for t in &effects.transmit {
            if let Err(e) = self.transport.send_to(&t.message.to_bytes(), t.dest) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        // Events of a failed send are still true, e.g. the release of a replaced
        // dialog.
        self.deliver(effects);

        result
    }

    fn deliver(&self, effects: Effects) {
        for event in effects.events {
            self.sink.on_call_event(event);
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A poisoned lock means a sink panicked. The state itself is consistent
    // between operations.
    m.lock().unwrap_or_else(|e| e.into_inner())
}
