//! Local port allocation for tunnel listeners
//!
//! A port counts as free when a connection attempt to it on 127.0.0.1 is
//! refused. Probing and binding are separate steps, so [`PortAllocator::bind`]
//! reserves the probed port process-wide and moves on to the next candidate
//! when the bind loses a race with another process.

use std::collections::HashSet;
use std::io;
use std::ops::RangeInclusive;
use std::sync::{Mutex, OnceLock, PoisonError};

use tokio::net::{TcpListener, TcpStream};

use pgb_core::BrokerError;

/// First port tried for tunnel listeners
pub const DEFAULT_PORT_START: u16 = 29168;

/// Number of ports scanned after the start port
pub const DEFAULT_PORT_LIMIT: u16 = 500;

/// Ports handed to live tunnels in this process
fn reserved_ports() -> &'static Mutex<HashSet<u16>> {
    static RESERVED: OnceLock<Mutex<HashSet<u16>>> = OnceLock::new();
    RESERVED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Check whether a TCP port on localhost refuses connections
pub async fn is_port_available(port: u16) -> bool {
    match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(_) => false,
        Err(e) => e.kind() == io::ErrorKind::ConnectionRefused,
    }
}

/// Return the first free port in `[start, start + limit]`
pub async fn available_port(start: u16, limit: u16) -> Result<u16, BrokerError> {
    let end = start.saturating_add(limit);
    for port in start..=end {
        if is_port_available(port).await {
            return Ok(port);
        }
    }
    Err(BrokerError::PortExhausted { start, end })
}

/// Claim on a local port, released on drop
#[derive(Debug)]
pub struct PortReservation {
    port: u16,
}

impl PortReservation {
    fn acquire(port: u16) -> Option<Self> {
        let mut reserved = reserved_ports()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        reserved.insert(port).then_some(Self { port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        reserved_ports()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.port);
    }
}

/// Hands out bound listeners from a fixed port range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAllocator {
    start: u16,
    limit: u16,
}

impl PortAllocator {
    pub fn new(start: u16, limit: u16) -> Self {
        Self { start, limit }
    }

    /// Ports this allocator may hand out
    pub fn range(&self) -> RangeInclusive<u16> {
        self.start..=self.start.saturating_add(self.limit)
    }

    /// Find a free port, reserve it and bind a listener on 127.0.0.1.
    ///
    /// A port that is reserved by another tunnel, or whose bind fails with
    /// "address in use", is skipped and the scan continues after it.
    pub async fn bind(&self) -> Result<(TcpListener, PortReservation), BrokerError> {
        let end = *self.range().end();
        let mut next = self.start;

        while next <= end {
            let port = available_port(next, end - next).await.map_err(|_| {
                BrokerError::PortExhausted {
                    start: self.start,
                    end,
                }
            })?;

            if let Some(reservation) = PortReservation::acquire(port) {
                match TcpListener::bind(("127.0.0.1", port)).await {
                    Ok(listener) => return Ok((listener, reservation)),
                    Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                        tracing::debug!("Port {} was taken between probe and bind", port);
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if port == end {
                break;
            }
            next = port + 1;
        }

        Err(BrokerError::PortExhausted {
            start: self.start,
            end,
        })
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_START, DEFAULT_PORT_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_port_in_use_is_not_available() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(!is_port_available(port).await);
        drop(listener);
        assert!(is_port_available(port).await);
    }

    #[tokio::test]
    async fn test_available_port_skips_busy_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let busy = listener.local_addr().unwrap().port();

        match available_port(busy, 0).await {
            Err(BrokerError::PortExhausted { start, end }) => {
                assert_eq!(start, busy);
                assert_eq!(end, busy);
            }
            other => panic!("expected PortExhausted, got {:?}", other),
        }

        if busy < u16::MAX {
            let port = available_port(busy, 1).await.unwrap();
            assert_eq!(port, busy + 1);
        }
    }

    #[tokio::test]
    async fn test_bind_never_hands_out_same_port_twice() {
        let allocator = PortAllocator::new(38200, 20);

        let (first, first_reservation) = allocator.bind().await.unwrap();
        let (second, second_reservation) = allocator.bind().await.unwrap();

        assert_ne!(first_reservation.port(), second_reservation.port());
        assert_eq!(first.local_addr().unwrap().port(), first_reservation.port());
        assert_eq!(second.local_addr().unwrap().port(), second_reservation.port());
    }

    #[tokio::test]
    async fn test_bind_skips_reserved_port() {
        let reservation = PortReservation::acquire(38260).unwrap();
        assert!(PortReservation::acquire(38260).is_none());

        let allocator = PortAllocator::new(38260, 5);
        let (_listener, other) = allocator.bind().await.unwrap();
        assert_ne!(other.port(), reservation.port());

        drop(reservation);
        assert!(PortReservation::acquire(38260).is_some());
    }

    #[tokio::test]
    async fn test_bind_exhausted_range() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let busy = listener.local_addr().unwrap().port();

        let allocator = PortAllocator::new(busy, 0);
        assert!(matches!(
            allocator.bind().await,
            Err(BrokerError::PortExhausted { .. })
        ));
    }
}
