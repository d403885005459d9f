use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

macro_rules! num_id {
    ($(#[$m:meta])* $id:ident, $t:ident) => {
        $(#[$m])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[derive(Serialize, Deserialize)]
        pub struct $id($t);

        impl $id {
            /// A random value.
            pub fn new() -> Self {
                $id(fastrand::$t(..))
            }
        }

        impl Deref for $id {
            type Target = $t;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl From<$t> for $id {
            fn from(v: $t) -> Self {
                $id(v)
            }
        }

        impl fmt::Display for $id {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

num_id!(
    /// Synchronization source of an RTP stream.
    Ssrc,
    u32
);
num_id!(
    /// RTP payload type.
    Pt,
    u8
);
num_id!(
    /// Session id of a session body.
    SessionId,
    u64
);

/// Signed distance from `from` to `to` in 16-bit sequence space.
///
/// Positive when `to` is ahead of `from`, taking wrap-around into account.
pub fn seq_distance(from: u16, to: u16) -> i16 {
    to.wrapping_sub(from) as i16
}
