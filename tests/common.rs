#![allow(unused)]
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Once};
use std::thread;
use std::time::Duration;

use callcore::crypto::KeyGen;
use callcore::signal::{Message, Request, Response, Signaling};
use callcore::{CallEvent, EngineConfig, EventSink, MediaKind, TransportSocket};

pub const SERVER: &str = "10.0.0.1:5060";
pub const LOCAL: &str = "10.0.0.2:5060";

pub fn server() -> SocketAddr {
    SERVER.parse().unwrap()
}

pub fn local() -> SocketAddr {
    LOCAL.parse().unwrap()
}

pub fn config() -> EngineConfig {
    EngineConfig::new()
        .set_user("1001")
        .set_password("secret")
        .set_domain("dispatch")
        .set_server_addr(server())
        .set_local_addr(local())
}

pub fn signaling(config: EngineConfig) -> Signaling {
    Signaling::new(config, local(), KeyGen::default())
}

/// A session body as a peer would offer it.
pub fn peer_body(port: u16, video: bool) -> String {
    let mut s = format!(
        "v=0\r\n\
         o=- 99 1 IN IP4 10.0.0.9\r\n\
         s=-\r\n\
         c=IN IP4 10.0.0.9\r\n\
         t=0 0\r\n\
         m=audio {port} RTP/AVP 8\r\n\
         a=rtpmap:8 PCMA/8000\r\n\
         a=ptime:20\r\n\
         a=sendrecv\r\n"
    );
    if video {
        s.push_str(&format!(
            "m=video {} RTP/AVP 96\r\n\
             a=rtpmap:96 H264/90000\r\n\
             a=sendrecv\r\n",
            port + 2
        ));
    }
    s
}

/// An unsolicited INVITE from `from_user` to `to_user`.
pub fn invite(call_id: &str, from_user: &str, to_user: &str, cseq: u32) -> Vec<u8> {
    let body = peer_body(50000, false);
    format!(
        "INVITE sip:{to_user}@10.0.0.2 SIP/2.0\r\n\
         Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK{call_id}{cseq}\r\n\
         From: \"Unit {from_user}\" <sip:{from_user}@dispatch>;tag=peer{from_user}\r\n\
         To: <sip:{to_user}@dispatch>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: {cseq} INVITE\r\n\
         Contact: <sip:{from_user}@10.0.0.1:5060>\r\n\
         Content-Type: application/sdp\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {body}",
        body.len()
    )
    .into_bytes()
}

/// A request without body from the peer side of an existing call.
pub fn peer_request(method: &str, call_id: &str, from_user: &str, cseq: u32) -> Vec<u8> {
    format!(
        "{method} sip:1001@10.0.0.2 SIP/2.0\r\n\
         Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK{method}{cseq}\r\n\
         From: <sip:{from_user}@dispatch>;tag=peer{from_user}\r\n\
         To: <sip:1001@dispatch>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: {cseq} {method}\r\n\
         Content-Length: 0\r\n\
         \r\n"
    )
    .into_bytes()
}

/// The server's response to a request we sent.
pub fn reply(req: &Request, code: u16, body: Option<String>) -> Vec<u8> {
    let mut resp = Response::for_request(req, code, Some("srv"));
    if let Some(body) = body {
        resp.headers.push("Content-Type", "application/sdp");
        resp.body = body;
    }
    Message::from(resp).to_bytes()
}

pub fn as_request(m: &Message) -> &Request {
    match m {
        Message::Request(r) => r,
        m => panic!("not a request: {m}"),
    }
}

pub fn as_response(m: &Message) -> &Response {
    match m {
        Message::Response(r) => r,
        m => panic!("not a response: {m}"),
    }
}

/// Transport that records what is sent and never receives anything.
#[derive(Default)]
pub struct MockTransport {
    pub sent: Mutex<Vec<(Message, SocketAddr)>>,
    pub fail: AtomicBool,
}

impl MockTransport {
    pub fn failing() -> Self {
        let t = MockTransport::default();
        t.fail.store(true, Ordering::Relaxed);
        t
    }

    pub fn take(&self) -> Vec<(Message, SocketAddr)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl TransportSocket for MockTransport {
    fn send_to(&self, data: &[u8], dest: SocketAddr) -> io::Result<usize> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::Other, "network down"));
        }
        let message = Message::parse(data).expect("engine sends parsable messages");
        self.sent.lock().unwrap().push((message, dest));
        Ok(data.len())
    }

    fn recv_from(
        &self,
        _buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        thread::sleep(timeout.min(Duration::from_millis(10)));
        Ok(None)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(local())
    }
}

/// Sink recording everything it is told.
#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<CallEvent>>,
    pub media: Mutex<Vec<(MediaKind, Option<Vec<u8>>)>>,
    pub bitrate: Mutex<Vec<(MediaKind, f64)>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<CallEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn media(&self) -> Vec<(MediaKind, Option<Vec<u8>>)> {
        self.media.lock().unwrap().clone()
    }
}

impl EventSink for RecordingSink {
    fn on_call_event(&self, event: CallEvent) {
        self.events.lock().unwrap().push(event);
    }

    fn on_media(&self, kind: MediaKind, payload: Option<&[u8]>) {
        self.media
            .lock()
            .unwrap()
            .push((kind, payload.map(|p| p.to_vec())));
    }

    fn on_bitrate(&self, kind: MediaKind, kbps: f64) {
        self.bitrate.lock().unwrap().push((kind, kbps));
    }
}

pub fn init_log() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    static START: Once = Once::new();

    START.call_once(|| {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(env_filter)
            .init();
    });
}

/// An even port N with N and N+1 free on all interfaces, at the time of asking.
pub fn free_port_pair() -> u16 {
    use std::net::UdpSocket;

    for _ in 0..200 {
        let port = 20_000 + 2 * fastrand::u16(..20_000);
        let rtp = UdpSocket::bind(("0.0.0.0", port));
        let rtcp = UdpSocket::bind(("0.0.0.0", port + 1));
        if rtp.is_ok() && rtcp.is_ok() {
            return port;
        }
    }
    panic!("no free port pair");
}

/// Wait until `f` holds, for at most two seconds.
pub fn wait_for(mut f: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while std::time::Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    f()
}
