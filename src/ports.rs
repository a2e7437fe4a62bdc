use std::net::{SocketAddr, TcpListener};
use std::ops::RangeInclusive;

use rand::Rng;
use tracing::{info, warn};

/// Find an available port inside the given range.
///
/// Random probing first so concurrent allocations spread out, then a
/// sequential sweep from a random offset so a nearly-full range is still
/// searched exhaustively. Availability is decided by the bind probe alone;
/// two racing allocations are settled when the eventual server binds.
pub fn find_available_port(range: RangeInclusive<u16>) -> Option<u16> {
    let (start, end) = (*range.start(), *range.end());
    if start > end {
        return None;
    }
    let span = (end - start) as u32 + 1;
    let mut rng = rand::rng();

    let random_probes = (span / 2).clamp(1, 250);
    for _ in 0..random_probes {
        let port = rng.random_range(start..=end);
        if is_port_available(port) {
            info!("allocated port {}", port);
            return Some(port);
        }
    }

    let offset = rng.random_range(0..span);
    for i in 0..span {
        let port = start + ((offset + i) % span) as u16;
        if is_port_available(port) {
            info!("allocated port {}", port);
            return Some(port);
        }
    }

    warn!("no available port in range {}-{}", start, end);
    None
}

/// Check whether a port can currently be bound.
pub fn is_port_available(port: u16) -> bool {
    // Probe the wildcard address, which is what dev-servers bind.
    TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_available_port_in_range() {
        let port = find_available_port(60000..=61000).expect("some port free");
        assert!((60000..=61000).contains(&port));
    }

    #[test]
    fn test_occupied_port_is_reported_unavailable() {
        let listener = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_available(port));
        drop(listener);
    }

    #[test]
    fn test_empty_range_yields_none() {
        assert_eq!(find_available_port(2..=1), None);
    }

    #[test]
    fn test_fully_occupied_range_yields_none() {
        let listener = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_eq!(find_available_port(port..=port), None);
    }
}
