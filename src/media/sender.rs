use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Instant;

use crate::config::MediaConfig;
use crate::crypto::MediaCipher;
use crate::rtp::{ntp_now, ControlPacket, ReceptionStats, ReportSchedule, REPORT_INTERVAL};
use crate::rtp::{RtpHeader, SenderInfo, Ssrc, RTP_HEADER_LEN};

/// The send half of a media session, plus everything else that isn't safe to
/// touch from two threads at once. Lives behind the per-session lock.
pub(crate) struct Sender {
    rtp: UdpSocket,
    rtcp: UdpSocket,
    remote_rtp: SocketAddr,
    remote_rtcp: SocketAddr,
    ssrc: Ssrc,
    config: MediaConfig,
    seq_no: u16,
    timestamp: u32,
    packet_count: u32,
    octet_count: u32,
    schedule: ReportSchedule,
    reception: ReceptionStats,
    cipher: Option<Box<dyn MediaCipher>>,
    buf: Vec<u8>,
}

impl Sender {
    pub fn new(
        rtp: UdpSocket,
        rtcp: UdpSocket,
        config: MediaConfig,
        cipher: Option<Box<dyn MediaCipher>>,
    ) -> Self {
        let remote_rtp = config.remote_addr();
        let mut remote_rtcp = remote_rtp;
        remote_rtcp.set_port(remote_rtp.port().wrapping_add(1));

        Sender {
            rtp,
            rtcp,
            remote_rtp,
            remote_rtcp,
            ssrc: Ssrc::new(),
            config,
            seq_no: fastrand::u16(..),
            timestamp: fastrand::u32(..),
            packet_count: 0,
            octet_count: 0,
            schedule: ReportSchedule::new(REPORT_INTERVAL),
            reception: ReceptionStats::default(),
            cipher,
            buf: Vec::with_capacity(1500),
        }
    }

    pub fn ssrc(&self) -> Ssrc {
        self.ssrc
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Emit a report if one is due. SR once we have sent media, RR before that.
    pub fn control_step(&mut self, now: Instant) {
        if !self.schedule.poll(now) {
            return;
        }

        let reports = self.reception.report().into_iter().collect();

        let packet = if self.packet_count > 0 {
            ControlPacket::SenderReport {
                info: SenderInfo {
                    ssrc: self.ssrc,
                    ntp_time: ntp_now(),
                    rtp_time: self.timestamp,
                    packet_count: self.packet_count,
                    octet_count: self.octet_count,
                },
                reports,
            }
        } else {
            ControlPacket::ReceiverReport {
                ssrc: self.ssrc,
                reports,
            }
        };

        self.send_control(&packet);
    }

    /// Send the session end notice.
    pub fn send_bye(&mut self) {
        let packet = ControlPacket::Goodbye(vec![self.ssrc]);
        self.send_control(&packet);
    }

    fn send_control(&mut self, packet: &ControlPacket) {
        self.buf.clear();
        packet.write_to(&mut self.buf);

        // Reports are housekeeping, a lost one is not worth failing for.
        if let Err(e) = self.rtcp.send_to(&self.buf, self.remote_rtcp) {
            debug!("Failed to send RTCP: {}", e);
        }
    }

    /// Send one RTP packet at the current timestamp, then advance the timestamp
    /// by one frame.
    pub fn send_rtp(&mut self, data: &[u8], marker: bool) -> io::Result<usize> {
        let mut header =
            RtpHeader::new(self.config.payload_type(), self.seq_no, self.timestamp, self.ssrc);
        header.marker = marker;

        let mut payload = data.to_vec();
        if let Some(cipher) = &mut self.cipher {
            cipher.encrypt(&mut payload);
        }

        self.buf.clear();
        self.buf.resize(RTP_HEADER_LEN, 0);
        header.write_to(&mut self.buf);
        self.buf.extend_from_slice(&payload);

        let n = self.rtp.send_to(&self.buf, self.remote_rtp)?;

        self.seq_no = self.seq_no.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(self.config.frame_ticks());
        self.packet_count = self.packet_count.wrapping_add(1);
        self.octet_count = self.octet_count.wrapping_add(data.len() as u32);

        Ok(n)
    }

    /// Decrypt a received payload and count it for reception reports. `false` if
    /// the payload should be dropped.
    pub fn accept(&mut self, header: &RtpHeader, payload: &mut Vec<u8>) -> bool {
        if let Some(cipher) = &mut self.cipher {
            if let Err(e) = cipher.decrypt(payload) {
                trace!("Drop undecryptable payload: {}", e);
                return false;
            }
        }
        self.reception.update(header.ssrc, header.sequence_number);
        true
    }
}
