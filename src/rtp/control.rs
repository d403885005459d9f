//! The subset of RTCP a media session emits and understands.
//!
//! Sender reports when we have sent media, receiver reports otherwise, and
//! BYE as the session end notice. See [RFC 3550 6.4](https://www.rfc-editor.org/rfc/rfc3550#section-6.4).

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::Ssrc;

/// Seconds between 1900-01-01 and 1970-01-01.
const NTP_EPOCH_OFFSET: u64 = 2_208_988_800;

/// Minimum interval between two reports.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(5);

const PT_SR: u8 = 200;
const PT_RR: u8 = 201;
const PT_BYE: u8 = 203;

/// Information about the stream we send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderInfo {
    /// Our SSRC.
    pub ssrc: Ssrc,
    /// 64 bit NTP timestamp of the report.
    pub ntp_time: u64,
    /// RTP timestamp corresponding to `ntp_time`.
    pub rtp_time: u32,
    /// Packets sent so far.
    pub packet_count: u32,
    /// Payload octets sent so far.
    pub octet_count: u32,
}

/// A report block about one stream we receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceptionReport {
    /// SSRC of the stream reported on.
    pub ssrc: Ssrc,
    /// Fraction lost since the previous report, in 1/256.
    pub fraction_lost: u8,
    /// Cumulative packets lost, 24 bits.
    pub packets_lost: u32,
    /// Extended highest sequence number received.
    pub max_seq: u32,
    /// Interarrival jitter.
    pub jitter: u32,
    /// Middle 32 bits of the NTP time of the last SR received.
    pub last_sr_time: u32,
    /// Delay since the last SR in 1/65536 seconds.
    pub last_sr_delay: u32,
}

/// One RTCP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacket {
    /// SR
    SenderReport {
        /// Sender info.
        info: SenderInfo,
        /// Reports about the streams we receive.
        reports: Vec<ReceptionReport>,
    },
    /// RR
    ReceiverReport {
        /// Our SSRC.
        ssrc: Ssrc,
        /// Reports about the streams we receive.
        reports: Vec<ReceptionReport>,
    },
    /// BYE, the session end notice.
    Goodbye(Vec<Ssrc>),
}

impl ControlPacket {
    fn words(&self) -> usize {
        match self {
            ControlPacket::SenderReport { reports, .. } => 1 + 6 + 6 * reports.len(),
            ControlPacket::ReceiverReport { reports, .. } => 1 + 1 + 6 * reports.len(),
            ControlPacket::Goodbye(ssrcs) => 1 + ssrcs.len(),
        }
    }

    /// Serialize the packet to the end of `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        let (count, pt) = match self {
            ControlPacket::SenderReport { reports, .. } => (reports.len(), PT_SR),
            ControlPacket::ReceiverReport { reports, .. } => (reports.len(), PT_RR),
            ControlPacket::Goodbye(ssrcs) => (ssrcs.len(), PT_BYE),
        };

        buf.push(0b10_0_00000 | (count.min(31) as u8));
        buf.push(pt);
        buf.extend_from_slice(&((self.words() - 1) as u16).to_be_bytes());

        match self {
            ControlPacket::SenderReport { info, reports } => {
                buf.extend_from_slice(&info.ssrc.to_be_bytes());
                buf.extend_from_slice(&info.ntp_time.to_be_bytes());
                buf.extend_from_slice(&info.rtp_time.to_be_bytes());
                buf.extend_from_slice(&info.packet_count.to_be_bytes());
                buf.extend_from_slice(&info.octet_count.to_be_bytes());
                reports.iter().for_each(|r| r.write_to(buf));
            }
            ControlPacket::ReceiverReport { ssrc, reports } => {
                buf.extend_from_slice(&ssrc.to_be_bytes());
                reports.iter().for_each(|r| r.write_to(buf));
            }
            ControlPacket::Goodbye(ssrcs) => {
                for s in ssrcs {
                    buf.extend_from_slice(&s.to_be_bytes());
                }
            }
        }
    }

    /// Parse a compound RTCP packet. Unknown packet types are skipped.
    pub fn parse_compound(mut buf: &[u8]) -> Vec<ControlPacket> {
        let mut out = vec![];

        while buf.len() >= 4 {
            if buf[0] >> 6 != 2 {
                trace!("RTCP version is not 2");
                break;
            }
            let count = (buf[0] & 0b1_1111) as usize;
            let pt = buf[1];
            let len = (u16::from_be_bytes([buf[2], buf[3]]) as usize + 1) * 4;
            if buf.len() < len {
                trace!("RTCP length larger than packet {} > {}", len, buf.len());
                break;
            }

            if let Some(p) = Self::parse_one(pt, count, &buf[4..len]) {
                out.push(p);
            }

            buf = &buf[len..];
        }

        out
    }

    fn parse_one(pt: u8, count: usize, body: &[u8]) -> Option<ControlPacket> {
        let read_u32 = |b: &[u8], at: usize| -> u32 {
            u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
        };

        match pt {
            PT_SR => {
                if body.len() < 24 + 24 * count {
                    return None;
                }
                let info = SenderInfo {
                    ssrc: read_u32(body, 0).into(),
                    ntp_time: (read_u32(body, 4) as u64) << 32 | read_u32(body, 8) as u64,
                    rtp_time: read_u32(body, 12),
                    packet_count: read_u32(body, 16),
                    octet_count: read_u32(body, 20),
                };
                let reports = ReceptionReport::parse_list(&body[24..], count);
                Some(ControlPacket::SenderReport { info, reports })
            }
            PT_RR => {
                if body.len() < 4 + 24 * count {
                    return None;
                }
                let ssrc = read_u32(body, 0).into();
                let reports = ReceptionReport::parse_list(&body[4..], count);
                Some(ControlPacket::ReceiverReport { ssrc, reports })
            }
            PT_BYE => {
                if body.len() < 4 * count {
                    return None;
                }
                let ssrcs = (0..count).map(|i| read_u32(body, i * 4).into()).collect();
                Some(ControlPacket::Goodbye(ssrcs))
            }
            _ => {
                trace!("Ignoring RTCP packet type: {}", pt);
                None
            }
        }
    }
}

impl ReceptionReport {
    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        let lost = (self.fraction_lost as u32) << 24 | (self.packets_lost & 0x00ff_ffff);
        buf.extend_from_slice(&lost.to_be_bytes());
        buf.extend_from_slice(&self.max_seq.to_be_bytes());
        buf.extend_from_slice(&self.jitter.to_be_bytes());
        buf.extend_from_slice(&self.last_sr_time.to_be_bytes());
        buf.extend_from_slice(&self.last_sr_delay.to_be_bytes());
    }

    fn parse_list(buf: &[u8], count: usize) -> Vec<ReceptionReport> {
        buf.chunks_exact(24)
            .take(count)
            .map(|b| {
                let w = |i: usize| u32::from_be_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]);
                ReceptionReport {
                    ssrc: w(0).into(),
                    fraction_lost: b[4],
                    packets_lost: w(4) & 0x00ff_ffff,
                    max_seq: w(8),
                    jitter: w(12),
                    last_sr_time: w(16),
                    last_sr_delay: w(20),
                }
            })
            .collect()
    }
}

/// Receive side counters for building reception reports.
#[derive(Debug, Default)]
pub struct ReceptionStats {
    ssrc: Option<Ssrc>,
    base_seq: u64,
    max_ext_seq: Option<u64>,
    received: u64,
    expected_prior: u64,
    received_prior: u64,
}

impl ReceptionStats {
    /// Account for one received RTP packet.
    pub fn update(&mut self, ssrc: Ssrc, seq: u16) {
        if self.ssrc != Some(ssrc) {
            *self = ReceptionStats {
                ssrc: Some(ssrc),
                base_seq: seq as u64,
                ..Default::default()
            };
        }

        let ext = extend_u16(self.max_ext_seq, seq);
        if self.max_ext_seq.map(|m| ext > m).unwrap_or(true) {
            self.max_ext_seq = Some(ext);
        }
        self.received += 1;
    }

    /// A report block covering everything since the previous call, if anything
    /// was received at all.
    pub fn report(&mut self) -> Option<ReceptionReport> {
        let ssrc = self.ssrc?;
        let max = self.max_ext_seq?;

        let expected = max - self.base_seq + 1;
        let lost = expected.saturating_sub(self.received);

        let expected_interval = expected - self.expected_prior;
        let received_interval = self.received - self.received_prior;
        self.expected_prior = expected;
        self.received_prior = self.received;

        let lost_interval = expected_interval.saturating_sub(received_interval);
        let fraction_lost = if expected_interval == 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval).min(255) as u8
        };

        Some(ReceptionReport {
            ssrc,
            fraction_lost,
            packets_lost: lost.min(0x00ff_ffff) as u32,
            max_seq: max as u32,
            ..Default::default()
        })
    }
}

/// Decides when the next report is due.
#[derive(Debug)]
pub struct ReportSchedule {
    interval: Duration,
    last: Option<Instant>,
}

impl ReportSchedule {
    /// A schedule with the given minimum interval.
    pub fn new(interval: Duration) -> Self {
        ReportSchedule {
            interval,
            last: None,
        }
    }

    /// Whether a report is due at `now`. Marks it as sent when it is.
    pub fn poll(&mut self, now: Instant) -> bool {
        let due = match self.last {
            None => true,
            Some(l) => now.saturating_duration_since(l) >= self.interval,
        };
        if due {
            self.last = Some(now);
        }
        due
    }
}

/// Current wall clock as 64 bit NTP time.
pub fn ntp_now() -> u64 {
    let since = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = since.as_secs() + NTP_EPOCH_OFFSET;
    let frac = ((since.subsec_nanos() as u64) << 32) / 1_000_000_000;
    secs << 32 | frac
}

/// "extend" a 16 bit sequence number into 64 bits by using the knowledge of
/// the previous such sequence number.
pub fn extend_u16(prev_ext_seq: Option<u64>, seq: u16) -> u64 {
    const MAX: u64 = 65_536;
    const HALF: u64 = MAX / 2;

    let seq = seq as u64;

    let Some(prev_index) = prev_ext_seq else {
        return seq;
    };

    let roc = (prev_index >> 16) as i64; // how many wrap-arounds.
    let prev_seq = prev_index & (MAX - 1);

    let v = if prev_seq < HALF {
        if seq > HALF + prev_seq {
            roc - 1
        } else {
            roc
        }
    } else if prev_seq > seq + HALF {
        roc + 1
    } else {
        roc
    };

    if v < 0 {
        return 0;
    }

    (v as u64) * MAX + seq
}
