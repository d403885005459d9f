use std::time::{Duration, Instant};

/// Registration state towards the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegState {
    /// Not registered, nothing pending.
    Unregistered,
    /// REGISTER sent, waiting for the answer.
    Pending,
    /// Registered until `expires`.
    Registered {
        /// When the binding lapses at the server.
        expires: Instant,
        /// When we send the refresh.
        refresh_at: Instant,
    },
}

/// The registration lifecycle. Refreshes at half the granted expiry.
#[derive(Debug)]
pub struct Registration {
    /// Call-ID shared by every REGISTER of this binding.
    pub call_id: String,
    pub from_tag: String,
    pub cseq: u32,
    pub state: RegState,
    /// Whether the last REGISTER sent asked to remove the binding.
    pub removing: bool,
}

impl Registration {
    pub fn new(call_id: String, from_tag: String) -> Self {
        Registration {
            call_id,
            from_tag,
            cseq: 0,
            state: RegState::Unregistered,
            removing: false,
        }
    }

    pub fn next_cseq(&mut self) -> u32 {
        self.cseq += 1;
        self.cseq
    }

    pub fn is_registered(&self) -> bool {
        matches!(self.state, RegState::Registered { .. })
    }

    /// The server accepted the binding for `granted`.
    pub fn accepted(&mut self, granted: Duration, now: Instant) {
        if self.removing || granted.is_zero() {
            self.state = RegState::Unregistered;
            return;
        }
        self.state = RegState::Registered {
            expires: now + granted,
            refresh_at: now + granted / 2,
        };
    }

    /// A REGISTER went out. A live binding stays registered until it lapses,
    /// the refresh is not due again before then.
    pub fn sent(&mut self, removing: bool) {
        self.removing = removing;
        self.state = match self.state {
            RegState::Registered { expires, .. } if !removing => RegState::Registered {
                expires,
                refresh_at: expires,
            },
            _ => RegState::Pending,
        };
    }

    pub fn failed(&mut self) {
        self.state = RegState::Unregistered;
    }

    /// Whether a refresh is due.
    pub fn refresh_due(&self, now: Instant) -> bool {
        match self.state {
            RegState::Registered { refresh_at, .. } => now >= refresh_at,
            _ => false,
        }
    }
}
