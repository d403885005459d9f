use std::net::UdpSocket;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::net::is_timeout;
use crate::rtp::{ControlPacket, RtpHeader, Sequencer, DATAGRAM_MAX_PACKET_SIZE};

use super::{SessionState, Shared};

/// Receive throughput over a reporting interval.
#[derive(Debug)]
pub(crate) struct BitrateMeter {
    interval: Duration,
    since: Instant,
    bytes: u64,
}

impl BitrateMeter {
    pub fn new(interval: Duration, now: Instant) -> Self {
        BitrateMeter {
            interval,
            since: now,
            bytes: 0,
        }
    }

    pub fn add(&mut self, bytes: usize) {
        self.bytes += bytes as u64;
    }

    /// kbit/s since the last report, once the interval has passed. Resets the counter.
    pub fn poll(&mut self, now: Instant) -> Option<f64> {
        let elapsed = now.saturating_duration_since(self.since);
        if elapsed < self.interval || elapsed.is_zero() {
            return None;
        }

        // bits per millisecond is kbit/s
        let kbps = (self.bytes * 8) as f64 / elapsed.as_millis().max(1) as f64;

        self.bytes = 0;
        self.since = now;

        Some(kbps)
    }
}

/// The receive loop of a media session. Runs on the session's own thread until
/// the state leaves RUNNING.
pub(crate) fn run(shared: Arc<Shared>, rtp: UdpSocket, rtcp: UdpSocket) {
    let config = &shared.config;
    let kind = config.kind();

    let mut sequencer = Sequencer::new(config.reorder_capacity());
    let mut meter = BitrateMeter::new(config.stats_interval(), Instant::now());
    let mut buf = vec![0_u8; DATAGRAM_MAX_PACKET_SIZE];

    debug!("Media {} receive loop started", kind);

    while shared.state() == SessionState::Running {
        let now = Instant::now();

        shared.with_sender(|s| s.control_step(now));

        match rtp.recv(&mut buf) {
            Ok(n) => {
                if let Some(header) = RtpHeader::parse(&buf[..n]) {
                    let mut payload = header.payload(&buf[..n]).to_vec();

                    if shared.with_sender(|s| s.accept(&header, &mut payload)) {
                        meter.add(n);

                        sequencer.recv(header.sequence_number, payload, |_, p| {
                            shared.sink.on_media(kind, Some(&p));
                        });
                    }
                }
            }
            Err(e) if is_timeout(&e) => {}
            Err(e) => {
                // ICMP port unreachable shows up here while the peer isn't up yet.
                trace!("Media {} receive error: {}", kind, e);
            }
        }

        drain_control(&shared, &rtcp, &mut buf);

        if let Some(kbps) = meter.poll(Instant::now()) {
            shared.sink.on_bitrate(kind, kbps);
        }
    }

    debug!(
        "Media {} receive loop exiting, {} staged dropped",
        kind,
        sequencer.buffer().len()
    );
    drop(sequencer);

    if shared.local_port() != 0 {
        shared.sink.on_media(kind, None);
    }

    shared.set_state(SessionState::Ended);
}

/// Read whatever RTCP is queued. A BYE from the peer ends the session.
fn drain_control(shared: &Shared, rtcp: &UdpSocket, buf: &mut [u8]) {
    loop {
        let n = match rtcp.recv(buf) {
            Ok(n) => n,
            Err(e) if is_timeout(&e) => return,
            Err(e) => {
                trace!("RTCP receive error: {}", e);
                return;
            }
        };

        for packet in ControlPacket::parse_compound(&buf[..n]) {
            if let ControlPacket::Goodbye(_) = packet {
                info!("Media {} peer sent BYE", shared.config.kind());
                shared.transition(SessionState::Running, SessionState::Stopping);
            }
        }
    }
}
