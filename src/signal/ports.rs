/// Round-robin allocator of even RTP ports.
///
/// The odd port above each allocated port is left for RTCP. After the top of the
/// range the allocator wraps to the bottom. Ports are not tracked as in use, the
/// range is expected to be much larger than the number of concurrent legs.
#[derive(Debug)]
pub struct PortAllocator {
    min: u16,
    max: u16,
    next: u16,
}

impl PortAllocator {
    /// Allocate from the inclusive range `min..=max`.
    pub fn new(min: u16, max: u16) -> Self {
        let min = min.saturating_add(min % 2).min(u16::MAX - 1);
        // The RTCP port of the top port must fit.
        let max = max.min(u16::MAX - 1).max(min);
        PortAllocator {
            min,
            max,
            next: min,
        }
    }

    /// The next even port.
    pub fn next_port(&mut self) -> u16 {
        let port = self.next;
        self.next = match self.next.checked_add(2) {
            Some(p) if p <= self.max => p,
            _ => self.min,
        };
        port
    }
}
