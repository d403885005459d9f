//! The transport capability the signaling engine sends and receives through.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::thread;
use std::time::Duration;

use crate::util::Pii;

/// Largest signaling datagram we read.
pub const DATAGRAM_MTU: usize = 8192;

/// Delay between bind attempts in [`UdpTransport::bind_with_retries`].
const BIND_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Byte oriented transport for signaling messages.
///
/// The engine only needs to send to an address and to receive with a timeout
/// that doesn't corrupt state when it expires.
pub trait TransportSocket: Send + Sync {
    /// Send one message to `dest`.
    fn send_to(&self, data: &[u8], dest: SocketAddr) -> io::Result<usize>;

    /// Receive one message. `Ok(None)` when nothing arrived within `timeout`.
    fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>>;

    /// The local address of the transport.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// [`TransportSocket`] over a UDP socket.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind to the given address.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        Ok(UdpTransport { socket })
    }

    /// Bind, retrying up to `attempts` times when the address is busy.
    pub fn bind_with_retries(addr: SocketAddr, attempts: usize) -> io::Result<Self> {
        let mut attempt = 1;
        loop {
            match Self::bind(addr) {
                Ok(t) => return Ok(t),
                Err(e) if attempt < attempts.max(1) => {
                    warn!(
                        "Bind {} failed (attempt {}/{}): {}",
                        Pii(addr),
                        attempt,
                        attempts,
                        e
                    );
                    attempt += 1;
                    thread::sleep(BIND_RETRY_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl TransportSocket for UdpTransport {
    fn send_to(&self, data: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, dest)
    }

    fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        // A zero timeout means blocking forever to std.
        self.socket
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        match self.socket.recv_from(buf) {
            Ok(v) => Ok(Some(v)),
            Err(e) if is_timeout(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// Whether a receive error is just an expired timeout.
pub(crate) fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn udp_send_and_timeout() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        let mut buf = [0; 64];
        let got = b.recv_from(&mut buf, Duration::from_millis(10)).unwrap();
        assert!(got.is_none());

        a.send_to(b"OPTIONS", b.local_addr().unwrap()).unwrap();
        let (n, from) = b
            .recv_from(&mut buf, Duration::from_secs(2))
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"OPTIONS");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[test]
    fn bind_with_retries_gives_up() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let taken = a.local_addr().unwrap();
        assert!(UdpTransport::bind_with_retries(taken, 1).is_err());
    }
}
