use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use callcore::crypto::CryptoError;
use callcore::media::MediaError;
use callcore::rtp::{ControlPacket, RtpHeader, Ssrc};
use callcore::{MediaCipher, MediaConfig, MediaKind, MediaSession, SessionState};

mod common;
use common::*;

fn audio(local: u16, remote: u16) -> MediaConfig {
    let remote: SocketAddr = ([127, 0, 0, 1], remote).into();
    MediaConfig::new(MediaKind::Audio, local, remote)
}

fn payloads(sink: &RecordingSink) -> Vec<Vec<u8>> {
    sink.media().into_iter().filter_map(|(_, p)| p).collect()
}

fn finals(sink: &RecordingSink) -> usize {
    sink.media().iter().filter(|(_, p)| p.is_none()).count()
}

#[test]
pub fn send_and_receive_between_sessions() {
    init_log();

    let port_a = free_port_pair();
    let port_b = free_port_pair();
    let sink_a = Arc::new(RecordingSink::default());
    let sink_b = Arc::new(RecordingSink::default());

    let mut a = MediaSession::new(audio(port_a, port_b), sink_a.clone());
    let mut b = MediaSession::new(audio(port_b, port_a), sink_b.clone());

    assert!(matches!(a.send(b"early", false), Err(MediaError::NotRunning)));
    assert_eq!(a.state(), SessionState::Created);

    a.start().unwrap();
    b.start().unwrap();
    assert!(a.is_running());
    assert!(matches!(a.start(), Err(MediaError::AlreadyStarted)));

    let ts = a.timestamp().unwrap();
    for i in 1..=5_u8 {
        a.send(&[i; 160], i == 1).unwrap();
    }
    assert_eq!(a.timestamp().unwrap(), ts.wrapping_add(5 * 160));

    assert!(wait_for(|| payloads(&sink_b).len() == 5));
    let got: Vec<u8> = payloads(&sink_b).iter().map(|p| p[0]).collect();
    assert_eq!(got, vec![1, 2, 3, 4, 5]);

    // Stopping A tells B, both deliver their final callback once.
    a.stop();
    assert!(matches!(a.send(b"late", false), Err(MediaError::NotRunning)));
    assert!(wait_for(|| a.state() == SessionState::Ended));
    assert!(wait_for(|| b.state() == SessionState::Ended));
    assert_eq!(finals(&sink_a), 1);
    assert_eq!(finals(&sink_b), 1);

    drop(a);
    drop(b);
    assert_eq!(finals(&sink_a), 1);
}

#[test]
pub fn reordered_packets_are_delivered_in_order() {
    let port = free_port_pair();
    let sink = Arc::new(RecordingSink::default());
    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();

    let mut session = MediaSession::new(
        audio(port, peer.local_addr().unwrap().port()),
        sink.clone(),
    );
    session.start().unwrap();

    let dest: SocketAddr = ([127, 0, 0, 1], port).into();
    let ssrc = Ssrc::from(7);
    for seq in [100_u16, 102, 101, 103] {
        let header = RtpHeader::new(8.into(), seq, seq as u32 * 160, ssrc);
        let mut buf = vec![0_u8; 12];
        header.write_to(&mut buf);
        buf.push(seq as u8);
        peer.send_to(&buf, dest).unwrap();
    }

    assert!(wait_for(|| payloads(&sink).len() == 4));
    let got: Vec<u8> = payloads(&sink).iter().map(|p| p[0]).collect();
    assert_eq!(got, vec![100, 101, 102, 103]);
}

#[test]
pub fn stop_sends_goodbye() {
    let port = free_port_pair();
    let sink = Arc::new(RecordingSink::default());

    let peer_rtp = UdpSocket::bind("127.0.0.1:0").unwrap();
    let peer_port = peer_rtp.local_addr().unwrap().port();
    let Ok(peer_rtcp) = UdpSocket::bind(("127.0.0.1", peer_port + 1)) else {
        // Port above is taken, nothing to observe.
        return;
    };
    peer_rtcp
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    let mut session = MediaSession::new(audio(port, peer_port), sink.clone());
    session.start().unwrap();
    let ssrc = session.ssrc().unwrap();
    session.stop();

    // A receiver report may arrive first.
    let mut buf = [0_u8; 1500];
    let mut saw_bye = false;
    while let Ok(n) = peer_rtcp.recv(&mut buf) {
        let packets = ControlPacket::parse_compound(&buf[..n]);
        if packets.contains(&ControlPacket::Goodbye(vec![ssrc])) {
            saw_bye = true;
            break;
        }
    }
    assert!(saw_bye);
}

#[test]
pub fn send_after_stop_transmits_nothing() {
    let port = free_port_pair();
    let sink = Arc::new(RecordingSink::default());

    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
    let peer_port = peer.local_addr().unwrap().port();

    let mut session = MediaSession::new(audio(port, peer_port), sink);
    session.start().unwrap();

    let mut buf = [0_u8; 1500];
    session.send(b"before", false).unwrap();
    let n = peer.recv(&mut buf).unwrap();
    assert_eq!(&buf[12..n], b"before");

    session.stop();
    assert!(matches!(session.send(b"after", false), Err(MediaError::NotRunning)));
    assert!(peer.recv(&mut buf).is_err());

    assert!(wait_for(|| session.state() == SessionState::Ended));
    assert!(matches!(session.send(b"after", false), Err(MediaError::NotRunning)));
    assert!(peer.recv(&mut buf).is_err());
}

#[test]
pub fn silenced_session_ends_quietly() {
    let port = free_port_pair();
    let sink = Arc::new(RecordingSink::default());

    let mut session = MediaSession::new(audio(port, 9), sink.clone());
    session.start().unwrap();
    session.silence();
    assert_eq!(session.local_port(), 0);

    session.stop();
    assert!(wait_for(|| session.state() == SessionState::Ended));
    assert_eq!(finals(&sink), 0);
}

#[test]
pub fn stop_before_start() {
    let sink = Arc::new(RecordingSink::default());
    let mut session = MediaSession::new(audio(free_port_pair(), 9), sink.clone());

    session.stop();
    assert_eq!(session.state(), SessionState::Ended);
    assert!(matches!(session.start(), Err(MediaError::AlreadyStarted)));
    assert!(sink.media().is_empty());
}

#[test]
pub fn odd_port_is_refused() {
    let sink = Arc::new(RecordingSink::default());
    let mut session = MediaSession::new(audio(40_001, 9), sink);

    assert!(matches!(session.start(), Err(MediaError::OddPort(40_001))));
    assert_eq!(session.state(), SessionState::Ended);
}

#[test]
pub fn keys_need_a_cipher() {
    let sink = Arc::new(RecordingSink::default());
    let config = audio(free_port_pair(), 9).set_keys(Some("a".into()), Some("b".into()));
    let mut session = MediaSession::new(config, sink);

    assert!(matches!(session.start(), Err(MediaError::NoCipher)));
}

/// XOR with one byte. Enough to tell encrypted from plain.
struct Xor(u8);

impl MediaCipher for Xor {
    fn setup(&mut self, local_key: &str, remote_key: &str) -> Result<(), CryptoError> {
        if local_key.is_empty() || remote_key.is_empty() {
            return Err(CryptoError::Setup("empty key".into()));
        }
        Ok(())
    }

    fn encrypt(&mut self, payload: &mut Vec<u8>) {
        payload.iter_mut().for_each(|b| *b ^= self.0);
    }

    fn decrypt(&mut self, payload: &mut Vec<u8>) -> Result<(), CryptoError> {
        payload.iter_mut().for_each(|b| *b ^= self.0);
        Ok(())
    }
}

#[test]
pub fn cipher_applies_both_ways() {
    let port_a = free_port_pair();
    let port_b = free_port_pair();
    let sink_b = Arc::new(RecordingSink::default());
    let keys = |c: MediaConfig| c.set_keys(Some("l".into()), Some("r".into()));

    let mut a = MediaSession::new(
        keys(audio(port_a, port_b)),
        Arc::new(RecordingSink::default()),
    );
    let mut b = MediaSession::new(keys(audio(port_b, port_a)), sink_b.clone());
    a.set_cipher(Box::new(Xor(0x5a)));
    b.set_cipher(Box::new(Xor(0x5a)));
    a.start().unwrap();
    b.start().unwrap();

    a.send(b"hello", false).unwrap();
    assert!(wait_for(|| payloads(&sink_b).len() == 1));
    assert_eq!(payloads(&sink_b)[0], b"hello");
}

#[test]
pub fn cipher_setup_failure_ends_session() {
    let config = audio(free_port_pair(), 9).set_keys(Some("".into()), Some("r".into()));
    let mut session = MediaSession::new(config, Arc::new(RecordingSink::default()));
    session.set_cipher(Box::new(Xor(1)));

    assert!(matches!(session.start(), Err(MediaError::Crypto(_))));
    assert_eq!(session.state(), SessionState::Ended);
}
