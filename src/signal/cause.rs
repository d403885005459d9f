use std::collections::HashMap;

use crate::event::DisconnectCause;

/// Total mapping from failure status codes to [`DisconnectCause`].
///
/// Unmapped codes give [`DisconnectCause::Other`]. The defaults cover the codes
/// gateways commonly send, anything else comes from configuration.
#[derive(Debug, Clone)]
pub struct CauseTable {
    map: HashMap<u16, DisconnectCause>,
}

impl CauseTable {
    /// The default table with `overrides` applied on top.
    pub fn new(overrides: &HashMap<u16, DisconnectCause>) -> Self {
        use DisconnectCause::*;

        let mut map: HashMap<u16, DisconnectCause> = [
            (403, CallRejected),
            (404, Unallocated),
            (408, NoAnswer),
            (410, Unallocated),
            (480, Unavailable),
            (484, Unallocated),
            (486, UserBusy),
            (487, NormalClearing),
            (488, CallRejected),
            (500, NetworkFailure),
            (502, NetworkFailure),
            (503, Unavailable),
            (504, NetworkFailure),
            (600, UserBusy),
            (603, CallRejected),
            (604, Unallocated),
            (606, CallRejected),
        ]
        .into_iter()
        .collect();

        map.extend(overrides.iter().map(|(k, v)| (*k, *v)));

        CauseTable { map }
    }

    /// Cause for a status code.
    pub fn lookup(&self, code: u16) -> DisconnectCause {
        self.map.get(&code).copied().unwrap_or(DisconnectCause::Other)
    }
}

impl Default for CauseTable {
    fn default() -> Self {
        CauseTable::new(&HashMap::new())
    }
}
