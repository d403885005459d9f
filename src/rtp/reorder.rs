use std::collections::BTreeMap;
use std::time::Duration;

use super::seq_distance;

/// Bounded staging area for RTP payloads that arrived ahead of a missing
/// predecessor.
///
/// Entries are keyed by sequence number. Besides the key order the buffer
/// remembers the order entries were staged in, which is the order they are
/// released in on a [`flush`][ReorderBuffer::flush].
#[derive(Debug)]
pub struct ReorderBuffer {
    capacity: usize,
    staged: BTreeMap<u16, Staged>,
    inserted: u64,
}

#[derive(Debug)]
struct Staged {
    order: u64,
    payload: Vec<u8>,
}

impl ReorderBuffer {
    /// A buffer holding at most `capacity` entries. A zero capacity is raised to 1.
    pub fn new(capacity: usize) -> Self {
        ReorderBuffer {
            capacity: capacity.max(1),
            staged: BTreeMap::new(),
            inserted: 0,
        }
    }

    /// A buffer sized to hold `max_delay` worth of packets.
    pub fn with_delay(max_delay: Duration, packet_time: Duration) -> Self {
        let ptime = packet_time.as_millis().max(1);
        Self::new((max_delay.as_millis() / ptime) as usize)
    }

    /// Maximum number of staged entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of staged entries.
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    /// Whether nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Whether the buffer reached its capacity and must be forced forward.
    pub fn is_full(&self) -> bool {
        self.staged.len() >= self.capacity
    }

    /// Stage a payload. Returns `false` if the sequence number is already staged.
    ///
    /// The payload is owned by the buffer until it is taken out again.
    pub fn stage(&mut self, seq: u16, payload: Vec<u8>) -> bool {
        if self.staged.contains_key(&seq) {
            return false;
        }
        self.inserted += 1;
        self.staged.insert(
            seq,
            Staged {
                order: self.inserted,
                payload,
            },
        );
        true
    }

    /// The lowest staged sequence number at or after `expected` in 16-bit
    /// sequence space.
    pub fn lowest(&self, expected: u16) -> Option<u16> {
        self.staged
            .keys()
            .copied()
            .min_by_key(|s| seq_distance(expected, *s) as u16)
    }

    /// Take the entry for `seq`, if staged.
    pub fn take(&mut self, seq: u16) -> Option<Vec<u8>> {
        self.staged.remove(&seq).map(|s| s.payload)
    }

    /// Take everything out, in the order the entries were staged.
    pub fn flush(&mut self) -> Vec<(u16, Vec<u8>)> {
        let mut all: Vec<_> = std::mem::take(&mut self.staged).into_iter().collect();
        all.sort_by_key(|(_, s)| s.order);
        all.into_iter().map(|(seq, s)| (seq, s.payload)).collect()
    }
}

/// Receive side sequencing of one media session.
///
/// Decides for every arriving payload whether it is delivered now, staged, or
/// discarded, and drains the [`ReorderBuffer`] as predecessors show up. The
/// latency is bounded: once the buffer is full the delivery marker skips ahead
/// to the lowest staged packet instead of waiting for the missing ones.
#[derive(Debug)]
pub struct Sequencer {
    last: Option<u16>,
    buffer: ReorderBuffer,
}

impl Sequencer {
    /// A sequencer with a reorder buffer of `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Sequencer {
            last: None,
            buffer: ReorderBuffer::new(capacity),
        }
    }

    /// Highest contiguous delivered sequence number.
    pub fn last_delivered(&self) -> Option<u16> {
        self.last
    }

    /// The staging buffer.
    pub fn buffer(&self) -> &ReorderBuffer {
        &self.buffer
    }

    /// Handle one arriving payload. Every payload that becomes deliverable is
    /// passed to `deliver`, in delivery order.
    pub fn recv(&mut self, seq: u16, payload: Vec<u8>, mut deliver: impl FnMut(u16, Vec<u8>)) {
        if payload.is_empty() {
            trace!("Discard empty payload: {}", seq);
            return;
        }

        let Some(last) = self.last else {
            self.last = Some(seq);
            deliver(seq, payload);
            return;
        };

        let expected = last.wrapping_add(1);
        let distance = seq_distance(expected, seq);

        if distance < 0 {
            trace!("Discard old packet: {} <= {}", seq, last);
            return;
        }

        if seq < last {
            // Wrapped past 65535. Whatever is staged belongs before the wrap.
            if !self.buffer.is_empty() {
                debug!("Sequence rollover, flush {} staged", self.buffer.len());
            }
            for (s, p) in self.buffer.flush() {
                deliver(s, p);
            }
            self.last = Some(seq.wrapping_sub(1));
        }

        let expected = self.last.map(|l| l.wrapping_add(1)).unwrap_or(seq);

        if seq == expected {
            self.last = Some(seq);
            deliver(seq, payload);
        } else if !self.buffer.stage(seq, payload) {
            trace!("Discard duplicate staged packet: {}", seq);
        }

        self.drain(&mut deliver);
    }

    fn drain(&mut self, deliver: &mut impl FnMut(u16, Vec<u8>)) {
        loop {
            let Some(last) = self.last else {
                return;
            };
            let next = last.wrapping_add(1);

            if let Some(p) = self.buffer.take(next) {
                self.last = Some(next);
                deliver(next, p);
                continue;
            }

            if !self.buffer.is_full() {
                return;
            }

            // Give up on the missing packets.
            let Some(lowest) = self.buffer.lowest(next) else {
                return;
            };
            debug!("Reorder buffer full, skip {} -> {}", next, lowest);
            self.last = Some(lowest.wrapping_sub(1));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn feed(seq: &mut Sequencer, order: &[u16]) -> Vec<u16> {
        let mut out = vec![];
        for s in order {
            seq.recv(*s, vec![*s as u8 | 1], |s, _| out.push(s));
        }
        out
    }

    #[test]
    fn delivers_in_order() {
        let mut s = Sequencer::new(10);
        assert_eq!(feed(&mut s, &[1, 2, 4, 3, 5]), vec![1, 2, 3, 4, 5]);
        assert!(s.buffer().is_empty());
        assert_eq!(s.last_delivered(), Some(5));
    }

    #[test]
    fn holds_early_until_gap_filled() {
        let mut s = Sequencer::new(10);
        assert_eq!(feed(&mut s, &[1, 2, 4]), vec![1, 2]);
        assert_eq!(s.buffer().len(), 1);
        assert_eq!(feed(&mut s, &[3]), vec![3, 4]);
    }

    #[test]
    fn full_buffer_forces_advance() {
        let mut s = Sequencer::new(2);
        assert_eq!(feed(&mut s, &[1, 2, 5]), vec![1, 2]);
        assert_eq!(feed(&mut s, &[6]), vec![5, 6]);
        // the skipped ones are now too old
        assert_eq!(feed(&mut s, &[3, 4]), Vec::<u16>::new());
    }

    #[test]
    fn rollover_flushes_staged_in_insertion_order() {
        let mut s = Sequencer::new(10);
        assert_eq!(feed(&mut s, &[65_531, 65_535, 65_533]), vec![65_531]);
        assert_eq!(s.buffer().len(), 2);

        assert_eq!(feed(&mut s, &[0]), vec![65_535, 65_533, 0]);
        assert!(s.buffer().is_empty());
        assert_eq!(feed(&mut s, &[1]), vec![1]);
    }

    #[test]
    fn plain_rollover() {
        let mut s = Sequencer::new(10);
        assert_eq!(feed(&mut s, &[65_534, 65_535, 0, 1]), vec![65_534, 65_535, 0, 1]);
    }

    #[test]
    fn discards_old_duplicate_and_empty() {
        let mut s = Sequencer::new(10);
        assert_eq!(feed(&mut s, &[10, 11]), vec![10, 11]);
        assert_eq!(feed(&mut s, &[9, 11]), Vec::<u16>::new());

        let mut out = vec![];
        s.recv(12, vec![], |s, _| out.push(s));
        assert!(out.is_empty());
        assert_eq!(s.last_delivered(), Some(11));
    }

    #[test]
    fn first_packet_is_delivered_whatever_its_number() {
        let mut s = Sequencer::new(10);
        assert_eq!(feed(&mut s, &[40_000]), vec![40_000]);
    }

    #[test]
    fn capacity_from_delay() {
        let b = ReorderBuffer::with_delay(Duration::from_millis(200), Duration::from_millis(20));
        assert_eq!(b.capacity(), 10);
        let b = ReorderBuffer::with_delay(Duration::ZERO, Duration::from_millis(20));
        assert_eq!(b.capacity(), 1);
    }

    #[test]
    fn flush_keeps_insertion_order() {
        let mut b = ReorderBuffer::new(5);
        b.stage(9, vec![9]);
        b.stage(3, vec![3]);
        assert!(!b.stage(3, vec![33]));
        b.stage(7, vec![7]);

        let seqs: Vec<_> = b.flush().into_iter().map(|(s, _)| s).collect();
        assert_eq!(seqs, vec![9, 3, 7]);
        assert!(b.is_empty());
    }

    #[test]
    fn lowest_is_relative_to_expected() {
        let mut b = ReorderBuffer::new(5);
        b.stage(65_535, vec![1]);
        b.stage(2, vec![1]);
        assert_eq!(b.lowest(65_534), Some(65_535));
        assert_eq!(b.lowest(1), Some(2));
    }
}
