#![allow(clippy::unusual_byte_groupings)]

use super::{Pt, Ssrc};

/// Length of an RTP header without CSRCs or extensions.
pub const RTP_HEADER_LEN: usize = 12;

/// Parsed header from an RTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// Always 2
    pub version: u8,
    /// Whether the RTP packet has padding to be an equal of 4 bytes.
    pub has_padding: bool,
    /// For video, this marker signifies the end of a frame.
    /// For audio, it marks the beginning of a talkspurt.
    pub marker: bool,
    /// Type of payload being carried, as negotiated in the session body.
    pub payload_type: Pt,
    /// Sequence number increasing by 1 for each RTP packet.
    pub sequence_number: u16,
    /// Timestamp in media time.
    pub timestamp: u32,
    /// Sender source identifier.
    pub ssrc: Ssrc,
    /// Length of header including CSRCs and skipped extensions.
    pub header_len: usize,
}

impl RtpHeader {
    /// Header for an outgoing packet.
    pub fn new(payload_type: Pt, sequence_number: u16, timestamp: u32, ssrc: Ssrc) -> Self {
        RtpHeader {
            version: 2,
            has_padding: false,
            marker: false,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            header_len: RTP_HEADER_LEN,
        }
    }

    /// Write the 12 byte header. Never writes CSRCs or extensions.
    pub fn write_to(&self, buf: &mut [u8]) -> usize {
        buf[0] = 0b10_0_0_0000 | if self.has_padding { 1 << 5 } else { 0 };

        buf[1] = *self.payload_type & 0b0111_1111 | if self.marker { 1 << 7 } else { 0 };

        buf[2..4].copy_from_slice(&self.sequence_number.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        RTP_HEADER_LEN
    }

    /// Parse a header. Extensions are skipped, not interpreted.
    pub fn parse(buf: &[u8]) -> Option<RtpHeader> {
        let orig_len = buf.len();
        if buf.len() < RTP_HEADER_LEN {
            trace!("RTP header too short < 12: {}", buf.len());
            return None;
        }

        let version = (buf[0] & 0b1100_0000) >> 6;
        if version != 2 {
            trace!("RTP version is not 2");
            return None;
        }
        let has_padding = buf[0] & 0b0010_0000 > 0;
        let has_extension = buf[0] & 0b0001_0000 > 0;
        let csrc_count = (buf[0] & 0b0000_1111) as usize;
        let marker = buf[1] & 0b1000_0000 > 0;
        let payload_type = (buf[1] & 0b0111_1111).into();
        let sequence_number = u16::from_be_bytes([buf[2], buf[3]]);
        let timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        let buf: &[u8] = &buf[RTP_HEADER_LEN..];

        let csrc_len = 4 * csrc_count;
        if buf.len() < csrc_len {
            trace!("RTP header invalid, not enough csrc");
            return None;
        }
        let buf: &[u8] = &buf[csrc_len..];

        let rest = if !has_extension {
            buf
        } else {
            if buf.len() < 4 {
                trace!("RTP bad header extension");
                return None;
            }
            let ext_len = u16::from_be_bytes([buf[2], buf[3]]) as usize * 4;
            let buf: &[u8] = &buf[4..];

            if buf.len() < ext_len {
                trace!("RTP ext len larger than header {} > {}", buf.len(), ext_len);
                return None;
            }
            &buf[ext_len..]
        };

        Some(RtpHeader {
            version,
            has_padding,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc: ssrc.into(),
            header_len: orig_len - rest.len(),
        })
    }

    /// The payload of a packet with this header, padding removed.
    pub fn payload<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        let body = &buf[self.header_len.min(buf.len())..];
        if !self.has_padding || body.is_empty() {
            return body;
        }
        let pad_len = body[body.len() - 1] as usize;
        &body[..body.len().saturating_sub(pad_len)]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_then_parse() {
        let mut h = RtpHeader::new(8.into(), 65_535, 160, 0x1234_5678.into());
        h.marker = true;

        let mut buf = [0_u8; 16];
        let n = h.write_to(&mut buf);
        buf[12..16].copy_from_slice(&[1, 2, 3, 4]);

        assert_eq!(n, 12);
        let parsed = RtpHeader::parse(&buf).unwrap();
        assert_eq!(parsed, h);
        assert_eq!(parsed.payload(&buf), &[1, 2, 3, 4]);
    }

    #[test]
    fn skips_csrc_and_extension() {
        let mut buf = vec![0b1001_0001, 0x08, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1];
        buf.extend_from_slice(&[0, 0, 0, 9]); // csrc
        buf.extend_from_slice(&[0xbe, 0xde, 0, 1, 0x10, 0xff, 0, 0]); // one word ext
        buf.extend_from_slice(&[7, 7]);

        let parsed = RtpHeader::parse(&buf).unwrap();
        assert_eq!(parsed.header_len, 24);
        assert_eq!(parsed.payload(&buf), &[7, 7]);
    }

    #[test]
    fn strips_padding() {
        let mut buf = [0_u8; 16];
        RtpHeader::new(0.into(), 1, 0, 1.into()).write_to(&mut buf);
        buf[0] |= 1 << 5;
        buf[12] = 42;
        buf[15] = 3;

        let parsed = RtpHeader::parse(&buf).unwrap();
        assert_eq!(parsed.payload(&buf), &[42]);
    }

    #[test]
    fn rejects_short_and_bad_version() {
        assert!(RtpHeader::parse(&[0x80; 11]).is_none());
        assert!(RtpHeader::parse(&[0x40; 12]).is_none());
    }
}
