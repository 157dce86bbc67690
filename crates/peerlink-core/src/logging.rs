//! Logging helpers that keep sensitive data out of log output.
//!
//! Rendezvous addresses identify peers, so they are shortened before being
//! attached to `tracing` fields. Key material is never logged at all;
//! [`RedactedBytes`] lets call sites still say how large a blob was.

use std::fmt;

/// Shortened rendezvous address: scheme is dropped and only the first and
/// last few characters of the host survive.
pub struct RedactedAddress<'a>(pub &'a str);

impl<'a> fmt::Display for RedactedAddress<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = host_part(self.0);
        if host.len() > 16 && host.is_char_boundary(6) && host.is_char_boundary(host.len() - 10) {
            write!(f, "{}...{}", &host[..6], &host[host.len() - 10..])
        } else if host.len() > 16 {
            write!(f, "[REDACTED ADDRESS]")
        } else {
            // Short names are test or loopback addresses.
            write!(f, "{}", host)
        }
    }
}

impl<'a> fmt::Debug for RedactedAddress<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Redact a byte slice, showing only its length.
pub struct RedactedBytes<'a>(pub &'a [u8]);

impl<'a> fmt::Display for RedactedBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())
    }
}

impl<'a> fmt::Debug for RedactedBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Host portion of a rendezvous address (`ws://host:port/path` -> `host`).
fn host_part(address: &str) -> &str {
    let rest = address
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(address);
    let rest = rest.split('/').next().unwrap_or(rest);
    rest.split(':').next().unwrap_or(rest)
}
