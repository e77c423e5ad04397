//! Local port allocation.
//!
//! Finds a port the managed backing store can listen on. Probing binds a
//! listener and drops it straight away, so the answer is advisory: another
//! process may grab the port before the store binds it, and the caller is
//! expected to retry with a fresh allocation when that happens.

use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::ops::RangeInclusive;

use crate::error::PortError;

/// Bind-and-release port prober.
#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    host: IpAddr,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::localhost()
    }
}

/// Bindable and busy ports found by [`PortAllocator::scan`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortReport {
    pub available: Vec<u16>,
    pub busy: Vec<u16>,
}

impl PortReport {
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.available.is_empty()
    }
}

impl PortAllocator {
    #[must_use]
    pub const fn new(host: IpAddr) -> Self {
        Self { host }
    }

    /// Probe on the IPv4 loopback address.
    #[must_use]
    pub const fn localhost() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[must_use]
    pub const fn host(&self) -> IpAddr {
        self.host
    }

    /// Whether a listener could bind `port` right now.
    pub fn is_bindable(&self, port: u16) -> bool {
        if port == 0 {
            return false;
        }
        TcpListener::bind((self.host, port)).is_ok()
    }

    /// Pick a port for the backing store.
    ///
    /// A bindable `preferred` port is returned as is, even when it lies
    /// outside `range`. Otherwise the range is scanned in ascending order
    /// and the first bindable port wins.
    pub fn allocate(
        &self,
        preferred: Option<u16>,
        range: RangeInclusive<u16>,
    ) -> Result<u16, PortError> {
        let (lo, hi) = (*range.start(), *range.end());
        if lo == 0 || lo > hi {
            return Err(PortError::InvalidRange { lo, hi });
        }

        if let Some(port) = preferred {
            if self.is_bindable(port) {
                return Ok(port);
            }
            log::debug!("Preferred port {} is not available", port);
        }

        log::debug!("Searching for available port in range {}-{}", lo, hi);
        range
            .filter(|port| Some(*port) != preferred)
            .find(|port| self.is_bindable(*port))
            .ok_or(PortError::NoPortAvailable { lo, hi })
    }

    /// Probe every port in `range` and report which are free.
    pub fn scan(&self, range: RangeInclusive<u16>) -> PortReport {
        let (available, busy) = range
            .filter(|port| *port != 0)
            .partition(|port| self.is_bindable(*port));
        PortReport { available, busy }
    }
}

/// Allocate on the loopback address; see [`PortAllocator::allocate`].
pub fn allocate(preferred: Option<u16>, range: RangeInclusive<u16>) -> Result<u16, PortError> {
    PortAllocator::localhost().allocate(preferred, range)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hold an OS-assigned loopback port for the duration of a test.
    fn occupied_port() -> (TcpListener, u16) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn range_after(port: u16, width: u16) -> RangeInclusive<u16> {
        port..=port.saturating_add(width)
    }

    #[test]
    fn test_occupied_port_is_not_bindable() {
        let (_listener, port) = occupied_port();
        assert!(!PortAllocator::localhost().is_bindable(port));
    }

    #[test]
    fn test_port_zero_is_never_bindable() {
        assert!(!PortAllocator::localhost().is_bindable(0));
    }

    #[test]
    fn test_free_preferred_port_is_returned() {
        let (listener, port) = occupied_port();
        drop(listener);
        let allocated = allocate(Some(port), range_after(port, 20)).unwrap();
        assert_eq!(allocated, port);
    }

    #[test]
    fn test_busy_preferred_port_falls_back_to_range() {
        let (_listener, port) = occupied_port();
        let range = range_after(port, 50);
        let allocated = allocate(Some(port), range.clone()).unwrap();
        assert_ne!(allocated, port);
        assert!(range.contains(&allocated));
        assert!(allocated > port);
    }

    #[test]
    fn test_allocated_port_is_bindable() {
        let (_listener, port) = occupied_port();
        let allocated = allocate(Some(port), range_after(port, 50)).unwrap();
        assert!(TcpListener::bind((Ipv4Addr::LOCALHOST, allocated)).is_ok());
    }

    #[test]
    fn test_exhausted_range() {
        let (_listener, port) = occupied_port();
        let err = allocate(None, port..=port).unwrap_err();
        assert_eq!(err, PortError::NoPortAvailable { lo: port, hi: port });
    }

    #[test]
    fn test_invalid_range() {
        assert_eq!(
            allocate(None, 9000..=8000).unwrap_err(),
            PortError::InvalidRange { lo: 9000, hi: 8000 }
        );
        assert_eq!(
            allocate(None, 0..=10).unwrap_err(),
            PortError::InvalidRange { lo: 0, hi: 10 }
        );
    }

    #[test]
    fn test_scan_reports_busy_port() {
        let (_listener, port) = occupied_port();
        let report = PortAllocator::localhost().scan(port..=port);
        assert_eq!(report.busy, vec![port]);
        assert!(report.is_exhausted());
    }
}
