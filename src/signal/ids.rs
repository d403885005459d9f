use crate::rtp::SessionId;

/// Identifier generation owned by one engine.
///
/// Random parts come from `fastrand`, the running counter keeps ids of one engine
/// distinct even if the random parts collide.
#[derive(Debug)]
pub struct IdGen {
    host: String,
    counter: u64,
    session: u64,
}

impl IdGen {
    /// Ids for an engine reachable at `host`.
    pub fn new(host: impl Into<String>) -> Self {
        IdGen {
            host: host.into(),
            counter: 0,
            // Leave headroom so session ids never wrap.
            session: fastrand::u64(..u32::MAX as u64),
        }
    }

    fn next(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    /// A new Call-ID.
    pub fn call_id(&mut self) -> String {
        let n = self.next();
        format!("{:08x}{:04x}@{}", fastrand::u32(..), n & 0xffff, self.host)
    }

    /// A new Via branch with the magic cookie.
    pub fn branch(&mut self) -> String {
        let n = self.next();
        format!("z9hG4bK{:08x}{:x}", fastrand::u32(..), n)
    }

    /// A new From/To tag.
    pub fn tag(&mut self) -> String {
        format!("{:08x}", fastrand::u32(..))
    }

    /// The next session body id.
    pub fn session_id(&mut self) -> SessionId {
        self.session += 1;
        self.session.into()
    }

    /// Change the host part of future Call-IDs.
    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = host.into();
    }
}
