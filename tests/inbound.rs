use std::time::Instant;

use callcore::signal::{Method, SignalError};
use callcore::{CallEventKind, DisconnectCause, MediaKind, SetupRequest};

mod common;
use common::*;

fn codes(inc: &callcore::Incoming) -> Vec<u16> {
    inc.replies
        .iter()
        .map(|t| as_response(&t.message).code)
        .collect()
}

fn with_header(raw: Vec<u8>, line: &str) -> Vec<u8> {
    let text = String::from_utf8(raw).unwrap();
    text.replacen("Content-Type:", &format!("{line}\r\nContent-Type:"), 1)
        .into_bytes()
}

fn without_header(raw: Vec<u8>, name: &str) -> Vec<u8> {
    let text = String::from_utf8(raw).unwrap();
    text.split("\r\n")
        .filter(|l| !l.starts_with(name))
        .collect::<Vec<_>>()
        .join("\r\n")
        .into_bytes()
}

#[test]
pub fn inbound_call_answered_and_ended_by_peer() {
    init_log();

    let mut s = signaling(config());
    let now = Instant::now();

    let inc = s.process_incoming(&invite("in-1", "2001", "1001", 1), server(), now);
    assert_eq!(codes(&inc), vec![100, 180]);
    let ringing = as_response(&inc.replies[1].message);
    assert!(ringing.headers.to_addr().unwrap().tag.is_some());

    assert_eq!(inc.events.len(), 1);
    assert_eq!(inc.events[0].party, "2001");
    assert_eq!(inc.events[0].dialog.as_str(), "in-1");
    let CallEventKind::Setup {
        display_name,
        video,
        remote,
        payload,
    } = &inc.events[0].kind
    else {
        panic!("expected SETUP");
    };
    assert_eq!(display_name.as_deref(), Some("Unit 2001"));
    assert!(!video);
    assert_eq!(remote.audio_port, 50000);
    assert!(payload.is_none());

    let (negotiated, e) = s.connect_call("2001").unwrap();
    let ok = as_response(&e.transmit[0].message);
    assert_eq!(ok.code, 200);
    assert!(ok.body.contains("m=audio"));
    assert!(ok.headers.contact().is_some());

    let media = negotiated.media_config(MediaKind::Audio).unwrap();
    assert_eq!(media.remote_addr(), "10.0.0.9:50000".parse().unwrap());
    assert_eq!(media.local_port(), negotiated.local.audio_port);
    assert_eq!(media.local_key(), None);
    assert!(negotiated.media_config(MediaKind::Video).is_none());

    assert!(!s.is_confirmed("2001"));
    s.process_incoming(&peer_request("ACK", "in-1", "2001", 1), server(), now);
    assert!(s.is_confirmed("2001"));

    // Retransmitted INVITE gets the 200 again.
    let inc = s.process_incoming(&invite("in-1", "2001", "1001", 1), server(), now);
    assert_eq!(codes(&inc), vec![200]);
    assert!(inc.events.is_empty());

    // A refresh gets the current media.
    let inc = s.process_incoming(&invite("in-1", "2001", "1001", 2), server(), now);
    assert_eq!(codes(&inc), vec![200]);
    assert!(as_response(&inc.replies[0].message).body.contains("m=audio"));

    let inc = s.process_incoming(&peer_request("BYE", "in-1", "2001", 3), server(), now);
    assert_eq!(codes(&inc), vec![200]);
    assert_eq!(
        inc.events[0].kind,
        CallEventKind::Release {
            cause: DisconnectCause::NormalClearing,
            code: None
        }
    );
    assert!(!s.has_dialog("2001"));
}

#[test]
pub fn peer_cancel_while_ringing() {
    let mut s = signaling(config());
    let now = Instant::now();

    s.process_incoming(&invite("in-2", "2001", "1001", 1), server(), now);
    let inc = s.process_incoming(&peer_request("CANCEL", "in-2", "2001", 1), server(), now);

    assert_eq!(codes(&inc), vec![200, 487]);
    let terminated = as_response(&inc.replies[1].message);
    assert_eq!(terminated.headers.cseq(), Some((1, Method::Invite)));
    assert_eq!(inc.events.len(), 1);
    assert!(!s.has_dialog("2001"));
}

#[test]
pub fn cancel_after_answer_is_ignored() {
    let mut s = signaling(config());
    let now = Instant::now();

    s.process_incoming(&invite("in-3", "2001", "1001", 1), server(), now);
    s.connect_call("2001").unwrap();

    let inc = s.process_incoming(&peer_request("CANCEL", "in-3", "2001", 1), server(), now);
    assert_eq!(codes(&inc), vec![200]);
    assert!(inc.events.is_empty());
    assert!(s.has_dialog("2001"));
}

#[test]
pub fn end_with_other_call_id_leaves_dialog() {
    let mut s = signaling(config());
    let now = Instant::now();

    s.process_incoming(&invite("in-1", "2001", "1001", 1), server(), now);

    for method in ["CANCEL", "BYE"] {
        let inc = s.process_incoming(&peer_request(method, "other-id", "2001", 1), server(), now);
        assert_eq!(codes(&inc), vec![200]);
        assert!(inc.events.is_empty());
        assert!(s.has_dialog("2001"));
        assert_eq!(s.dialog_id("2001").unwrap().as_str(), "in-1");
    }

    // The dialog is still ringing and can be answered.
    let (_, e) = s.connect_call("2001").unwrap();
    assert_eq!(as_response(&e.transmit[0].message).code, 200);
}

#[test]
pub fn local_decline_of_ringing_call() {
    let mut s = signaling(config());
    let now = Instant::now();

    s.process_incoming(&invite("in-4", "2001", "1001", 1), server(), now);
    let (found, e) = s.release_call("2001");

    assert!(found);
    assert_eq!(as_response(&e.transmit[0].message).code, 603);
    assert!(e.events.is_empty());
    assert!(!s.has_dialog("2001"));
}

#[test]
pub fn duplicate_setup_from_same_party_replaces_dialog() {
    init_log();

    let mut s = signaling(config());
    let now = Instant::now();

    s.process_incoming(&invite("in-5", "2001", "1001", 1), server(), now);
    let inc = s.process_incoming(&invite("in-6", "2001", "1001", 1), server(), now);

    assert_eq!(codes(&inc), vec![100, 180]);
    assert_eq!(inc.events.len(), 2);
    assert_eq!(inc.events[0].dialog.as_str(), "in-5");
    assert!(matches!(
        inc.events[0].kind,
        CallEventKind::Release {
            cause: DisconnectCause::NormalClearing,
            ..
        }
    ));
    assert_eq!(inc.events[1].dialog.as_str(), "in-6");
    assert!(matches!(inc.events[1].kind, CallEventKind::Setup { .. }));

    assert_eq!(s.dialog_count(), 1);
    assert_eq!(s.dialog_id("2001").unwrap().as_str(), "in-6");

    // The replaced dialog is gone for the peer too.
    let inc = s.process_incoming(&peer_request("BYE", "in-5", "2001", 2), server(), now);
    assert_eq!(codes(&inc), vec![200]);
    assert!(inc.events.is_empty());
    assert!(s.has_dialog("2001"));
}

#[test]
pub fn reinvite_while_ringing_is_refused() {
    let mut s = signaling(config());
    let now = Instant::now();

    s.process_incoming(&invite("in-7", "2001", "1001", 1), server(), now);
    let inc = s.process_incoming(&invite("in-7", "2001", "1001", 2), server(), now);
    assert_eq!(codes(&inc), vec![491]);

    let inc = s.process_incoming(&invite("in-7", "2001", "1001", 2), server(), now);
    assert_eq!(codes(&inc), vec![491]);

    // A retransmission of the original setup gets the 180 again.
    let inc = s.process_incoming(&invite("in-7", "2001", "1001", 1), server(), now);
    assert_eq!(codes(&inc), vec![180]);
    assert!(inc.events.is_empty());
}

#[test]
pub fn embedded_payload_surfaces() {
    let mut s = signaling(config());
    let raw = with_header(
        invite("in-8", "2001", "1001", 1),
        "X-Payload: cHJpb3JpdHk9MQ==",
    );
    let inc = s.process_incoming(&raw, server(), Instant::now());
    let CallEventKind::Setup { payload, .. } = &inc.events[0].kind else {
        panic!("expected SETUP");
    };
    assert_eq!(payload.as_deref(), Some(&b"priority=1"[..]));
    assert_eq!(s.payload("2001"), Some(&b"priority=1"[..]));
}

#[test]
pub fn malformed_setup_is_rejected() {
    let mut s = signaling(config());
    let now = Instant::now();

    let raw = without_header(invite("in-9", "2001", "1001", 1), "Call-ID");
    let inc = s.process_incoming(&raw, server(), now);
    assert_eq!(codes(&inc), vec![400]);

    let raw = without_header(invite("in-9", "2001", "1001", 1), "From");
    let inc = s.process_incoming(&raw, server(), now);
    assert_eq!(codes(&inc), vec![400]);

    let raw = with_header(invite("in-9", "2001", "1001", 1), "X-Payload: ***");
    let inc = s.process_incoming(&raw, server(), now);
    assert_eq!(codes(&inc), vec![400]);

    assert!(inc.events.is_empty());
    assert_eq!(s.dialog_count(), 0);
}

#[test]
pub fn foreign_target() {
    let mut s = signaling(config());
    let inc = s.process_incoming(&invite("in-10", "2001", "1555", 1), server(), Instant::now());
    assert_eq!(codes(&inc), vec![404]);
    assert_eq!(s.dialog_count(), 0);

    let mut s = signaling(config().set_unregister_foreign(true));
    let inc = s.process_incoming(&invite("in-10", "2001", "1555", 1), server(), Instant::now());
    assert_eq!(inc.replies.len(), 2);
    assert_eq!(as_response(&inc.replies[0].message).code, 404);

    let unregister = as_request(&inc.replies[1].message);
    assert_eq!(inc.replies[1].dest, server());
    assert_eq!(unregister.method, Method::Register);
    assert_eq!(unregister.headers.get("Contact"), Some("*"));
    assert_eq!(unregister.headers.expires(), Some(0));
    assert_eq!(unregister.headers.to_addr().unwrap().uri.user(), "1555");
}

#[test]
pub fn alias_target_is_ours() {
    let mut s = signaling(config().add_alias("9000"));
    let inc = s.process_incoming(&invite("in-11", "2001", "9000", 1), server(), Instant::now());
    assert_eq!(codes(&inc), vec![100, 180]);
}

#[test]
pub fn other_requests() {
    let mut s = signaling(config());
    let now = Instant::now();

    let inc = s.process_incoming(&peer_request("OPTIONS", "o-1", "2001", 1), server(), now);
    assert_eq!(codes(&inc), vec![200]);
    assert!(as_response(&inc.replies[0].message)
        .headers
        .get("Allow")
        .unwrap()
        .contains("INVITE"));

    let inc = s.process_incoming(&peer_request("MESSAGE", "m-1", "2001", 1), server(), now);
    assert_eq!(codes(&inc), vec![501]);

    let inc = s.process_incoming(&peer_request("BYE", "nope", "2001", 1), server(), now);
    assert_eq!(codes(&inc), vec![200]);
    assert!(inc.events.is_empty());

    let inc = s.process_incoming(b"\x00\x01garbage", server(), now);
    assert!(inc.replies.is_empty() && inc.events.is_empty());
}

#[test]
pub fn connect_requires_ringing_inbound() {
    let mut s = signaling(config());

    assert!(matches!(
        s.connect_call("2001"),
        Err(SignalError::NoDialog(_))
    ));

    s.setup_call(SetupRequest::new("2001")).unwrap();
    assert!(matches!(
        s.connect_call("2001"),
        Err(SignalError::InvalidState(_))
    ));
    assert!(s.has_dialog("2001"));
}

#[test]
pub fn answer_only_encrypts_what_was_offered() {
    let mut s = signaling(config().set_encryption(true));
    let now = Instant::now();

    s.process_incoming(&invite("in-12", "2001", "1001", 1), server(), now);
    let (negotiated, e) = s.connect_call("2001").unwrap();

    assert_eq!(negotiated.local.audio_key, None);
    assert!(!as_response(&e.transmit[0].message).body.contains("a=crypto"));
}
