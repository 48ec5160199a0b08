//! Local port selection for the SSH forward.
//!
//! The search is best-effort: the trial listener is dropped before the
//! forward binds the port, so another process can claim it in between.
//! Callers surface that case as a forwarding failure.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, TcpListener};
use std::ops::Range;

use rand::Rng;

use crate::errors::CoreError;

/// Candidate range: above the privileged ports, excluding 65535.
pub const PORT_RANGE: Range<u16> = 1024..65535;

/// Retry budget used when the caller does not supply one.
pub const DEFAULT_PORT_ATTEMPTS: u32 = 64;

/// Pick a random port in [`PORT_RANGE`] that can currently be bound on the
/// loopback interface.
///
/// Connection strings name `localhost`, which may resolve to `::1` first, so
/// a candidate must also be free on the IPv6 loopback when the host has one.
///
/// Gives up with [`CoreError::PortExhausted`] after `max_attempts` failed binds.
pub fn acquire_free_port(max_attempts: u32) -> Result<u16, CoreError> {
    let mut rng = rand::thread_rng();
    for attempt in 1..=max_attempts {
        let candidate = rng.gen_range(PORT_RANGE);
        match loopback_bindable(candidate) {
            Ok(()) => {
                tracing::debug!(port = candidate, attempt, "Selected free local port");
                return Ok(candidate);
            }
            Err(e) => {
                tracing::trace!(port = candidate, attempt, "Port unavailable: {}", e);
            }
        }
    }
    Err(CoreError::PortExhausted {
        attempts: max_attempts,
    })
}

/// Trial-bind `port` on `127.0.0.1` and, unless it is taken there, on `::1`.
/// A missing IPv6 loopback is not a failure.
fn loopback_bindable(port: u16) -> io::Result<()> {
    let _v4 = TcpListener::bind((Ipv4Addr::LOCALHOST, port))?;
    match TcpListener::bind((Ipv6Addr::LOCALHOST, port)) {
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => Err(e),
        _ => Ok(()),
    }
}
