//! Free port discovery
//!
//! Binds an ephemeral listener on port 0, reads back the port the OS
//! assigned, then drops the socket so the real listener can rebind it.
//! The window between release and rebind is racy, so callers that need a
//! specific port re-run the allocation when the rebind fails.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use tracing::debug;

/// Upper bound on bind/release cycles before giving up
pub const PORT_ACQUIRE_ATTEMPTS_MAX: usize = 50;

/// Error returned when no port could be acquired
#[derive(Debug)]
pub enum PortError {
    /// Every attempt failed to bind or came back with port 0
    NoFreePort {
        attempts: usize,
        last_error: Option<io::Error>,
    },
}

impl std::fmt::Display for PortError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortError::NoFreePort { attempts, last_error } => {
                write!(
                    f,
                    "Could not find a free permitted port on the machine after {} attempts",
                    attempts
                )?;
                if let Some(e) = last_error {
                    write!(f, " (last error: {})", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for PortError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PortError::NoFreePort { last_error, .. } => last_error
                .as_ref()
                .map(|e| e as &(dyn std::error::Error + 'static)),
        }
    }
}

/// Find a non-occupied port on the loopback interface
pub fn acquire_free_port() -> Result<u16, PortError> {
    acquire_free_port_on(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Find a non-occupied port on `host`
pub fn acquire_free_port_on(host: IpAddr) -> Result<u16, PortError> {
    let mut last_error = None;

    for attempt in 1..=PORT_ACQUIRE_ATTEMPTS_MAX {
        // The listener is dropped at the end of the match arm, releasing the port
        match TcpListener::bind(SocketAddr::new(host, 0)).and_then(|l| l.local_addr()) {
            Ok(addr) if addr.port() != 0 => {
                debug!("Acquired free port {} on attempt {}", addr.port(), attempt);
                return Ok(addr.port());
            }
            Ok(_) => {}
            Err(e) => last_error = Some(e),
        }
    }

    Err(PortError::NoFreePort {
        attempts: PORT_ACQUIRE_ATTEMPTS_MAX,
        last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquired_port_is_nonzero_and_rebindable() {
        let port = acquire_free_port().unwrap();
        assert_ne!(port, 0);

        let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[test]
    fn test_sequential_acquisitions_differ_while_first_is_held() {
        let p1 = acquire_free_port().unwrap();
        // Hold p1 so the OS cannot hand it out again
        let _held = TcpListener::bind(("127.0.0.1", p1)).unwrap();
        let p2 = acquire_free_port().unwrap();

        assert_ne!(p1, 0);
        assert_ne!(p2, 0);
        assert_ne!(p1, p2);
    }

    #[test]
    fn test_no_free_port_display() {
        let err = PortError::NoFreePort {
            attempts: PORT_ACQUIRE_ATTEMPTS_MAX,
            last_error: None,
        };
        assert!(err.to_string().contains("50 attempts"));
    }
}
