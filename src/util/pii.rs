//! Redacting wrapper for party identifiers, URIs and addresses in logs.
//!
//! With the `pii` feature enabled a wrapped value formats as `{REDACTED}`.
//! Use it for debug and above; trace logs are not expected in production.

use std::fmt;
use std::ops::Deref;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pii<T>(pub T);

impl<T: fmt::Display> fmt::Display for Pii<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if cfg!(feature = "pii") {
            write!(f, "{{REDACTED}}")
        } else {
            self.0.fmt(f)
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Pii<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if cfg!(feature = "pii") {
            write!(f, "{{REDACTED}}")
        } else {
            self.0.fmt(f)
        }
    }
}

impl<T> Deref for Pii<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn party_display() {
        let party = Pii("2001");

        #[cfg(feature = "pii")]
        assert_eq!(party.to_string(), "{REDACTED}");

        #[cfg(not(feature = "pii"))]
        assert_eq!(party.to_string(), "2001");
    }

    #[test]
    fn debug_follows_display() {
        let addr: std::net::SocketAddr = "10.0.0.1:5060".parse().unwrap();

        #[cfg(feature = "pii")]
        assert_eq!(format!("{:?}", Pii(addr)), "{REDACTED}");

        #[cfg(not(feature = "pii"))]
        assert_eq!(format!("{:?}", Pii(addr)), "10.0.0.1:5060");
    }
}
