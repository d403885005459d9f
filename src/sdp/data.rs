use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::crypto::CRYPTO_SUITE;
use crate::event::MediaKind;
use crate::rtp::{Pt, SessionId};

use super::parser::body_parser;
use super::SdpError;

/// Payload type of the fixed video profile.
pub const VIDEO_PT: u8 = 96;

/// Clock rate of the fixed video profile.
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// The two fixed audio profiles. Which one is offered is a static config flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioProfile {
    /// G.711 A-law.
    Pcma,
    /// G.711 µ-law.
    Pcmu,
}

impl AudioProfile {
    /// Static payload type.
    pub fn pt(&self) -> Pt {
        match self {
            AudioProfile::Pcma => 8.into(),
            AudioProfile::Pcmu => 0.into(),
        }
    }

    /// Encoding name in `a=rtpmap`.
    pub fn encoding(&self) -> &'static str {
        match self {
            AudioProfile::Pcma => "PCMA",
            AudioProfile::Pcmu => "PCMU",
        }
    }

    /// Media clock rate.
    pub fn clock_rate(&self) -> u32 {
        8000
    }

    /// Packet time in milliseconds.
    pub fn ptime(&self) -> u32 {
        20
    }
}

/// The compact session body carried in setup and accept messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBody {
    /// Session id from the `o=` line.
    pub session_id: SessionId,
    /// Session version from the `o=` line.
    pub version: u64,
    /// Connection address.
    pub addr: IpAddr,
    /// Media lines in order.
    pub media: Vec<MediaLine>,
}

/// One `m=` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaLine {
    /// Audio or video.
    pub kind: MediaKind,
    /// RTP port. RTCP is on the port above.
    pub port: u16,
    /// Payload type.
    pub pt: Pt,
    /// Encoding name from `a=rtpmap`.
    pub encoding: String,
    /// Clock rate from `a=rtpmap`.
    pub clock_rate: u32,
    /// Packet time from `a=ptime`.
    pub ptime: Option<u32>,
    /// Media key from `a=crypto`, untouched.
    pub key: Option<String>,
}

impl SessionBody {
    /// Parse a body.
    pub fn parse(input: &str) -> Result<SessionBody, SdpError> {
        use combine::EasyParser;

        let (body, _) = body_parser()
            .easy_parse(input)
            .map_err(|e| SdpError::Parse(e.to_string()))?;

        if body.audio().is_none() {
            return Err(SdpError::Inconsistent("no audio line".into()));
        }

        Ok(body)
    }

    /// The audio line.
    pub fn audio(&self) -> Option<&MediaLine> {
        self.media.iter().find(|m| m.kind == MediaKind::Audio)
    }

    /// The video line, if any.
    pub fn video(&self) -> Option<&MediaLine> {
        self.media.iter().find(|m| m.kind == MediaKind::Video)
    }
}

impl MediaLine {
    /// A line for the given audio profile.
    pub fn audio(profile: AudioProfile, port: u16, key: Option<String>) -> Self {
        MediaLine {
            kind: MediaKind::Audio,
            port,
            pt: profile.pt(),
            encoding: profile.encoding().into(),
            clock_rate: profile.clock_rate(),
            ptime: Some(profile.ptime()),
            key,
        }
    }

    /// A line for the fixed video profile.
    pub fn video(port: u16, key: Option<String>) -> Self {
        MediaLine {
            kind: MediaKind::Video,
            port,
            pt: VIDEO_PT.into(),
            encoding: "H264".into(),
            clock_rate: VIDEO_CLOCK_RATE,
            ptime: None,
            key,
        }
    }
}

impl fmt::Display for SessionBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ip = match self.addr {
            IpAddr::V4(_) => "IP4",
            IpAddr::V6(_) => "IP6",
        };
        write!(f, "v=0\r\n")?;
        write!(
            f,
            "o=- {} {} IN {} {}\r\n",
            self.session_id, self.version, ip, self.addr
        )?;
        write!(f, "s=-\r\n")?;
        write!(f, "c=IN {} {}\r\n", ip, self.addr)?;
        write!(f, "t=0 0\r\n")?;
        for m in &self.media {
            write!(f, "{m}")?;
        }
        Ok(())
    }
}

impl fmt::Display for MediaLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = if self.key.is_some() {
            "RTP/SAVP"
        } else {
            "RTP/AVP"
        };
        write!(f, "m={} {} {} {}\r\n", self.kind, self.port, proto, self.pt)?;
        write!(
            f,
            "a=rtpmap:{} {}/{}\r\n",
            self.pt, self.encoding, self.clock_rate
        )?;
        if let Some(ptime) = self.ptime {
            write!(f, "a=ptime:{}\r\n", ptime)?;
        }
        if let Some(key) = &self.key {
            write!(f, "a=crypto:1 {} inline:{}\r\n", CRYPTO_SUITE, key)?;
        }
        write!(f, "a=sendrecv\r\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn body(video: bool, keys: bool) -> SessionBody {
        let key = |s: &str| keys.then(|| s.to_string());
        let mut media = vec![MediaLine::audio(AudioProfile::Pcma, 40000, key("YWJj"))];
        if video {
            media.push(MediaLine::video(40002, key("ZGVm")));
        }
        SessionBody {
            session_id: 4711.into(),
            version: 1,
            addr: "10.0.0.5".parse().unwrap(),
            media,
        }
    }

    #[test]
    fn serialize_audio_only() {
        assert_eq!(
            body(false, false).to_string(),
            "v=0\r\n\
            o=- 4711 1 IN IP4 10.0.0.5\r\n\
            s=-\r\n\
            c=IN IP4 10.0.0.5\r\n\
            t=0 0\r\n\
            m=audio 40000 RTP/AVP 8\r\n\
            a=rtpmap:8 PCMA/8000\r\n\
            a=ptime:20\r\n\
            a=sendrecv\r\n"
        );
    }

    #[test]
    fn parse_what_we_write() {
        for (video, keys) in [(false, false), (true, false), (true, true)] {
            let b = body(video, keys);
            assert_eq!(SessionBody::parse(&b.to_string()).unwrap(), b);
        }
    }

    #[test]
    fn keys_pass_through_untouched() {
        let b = SessionBody::parse(&body(true, true).to_string()).unwrap();
        assert_eq!(b.audio().unwrap().key.as_deref(), Some("YWJj"));
        assert_eq!(b.video().unwrap().key.as_deref(), Some("ZGVm"));
    }

    #[test]
    fn no_audio_is_inconsistent() {
        let s = "v=0\r\no=- 1 1 IN IP4 1.2.3.4\r\ns=-\r\nt=0 0\r\n\
            m=video 5000 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n";
        assert!(matches!(
            SessionBody::parse(s),
            Err(SdpError::Inconsistent(_))
        ));
    }
}
