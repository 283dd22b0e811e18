//! Active discovery: range parsing and bounded concurrent sweeps.

use super::{DiscoveryCoordinator, DiscoveryError, DiscoveryReport, ProbeOrigin};
use futures::stream::{self, StreamExt};
use std::net::{IpAddr, Ipv4Addr};
use tracing::info;

/// Widest CIDR prefix accepted for a sweep (65 534 hosts).
const MIN_PREFIX: u32 = 16;

impl DiscoveryCoordinator {
    /// Probes every address in `hosts`, at most `max_concurrent_probes` at a time.
    pub(super) async fn sweep(&self, hosts: &[IpAddr]) -> DiscoveryReport {
        info!(
            "Probing {} addresses ({} at a time)",
            hosts.len(),
            self.max_concurrent_probes
        );

        let outcomes = stream::iter(hosts.iter().copied())
            .map(|host| self.probe(host, ProbeOrigin::Sweep))
            .buffer_unordered(self.max_concurrent_probes)
            .collect::<Vec<_>>()
            .await;

        let mut report = DiscoveryReport::default();
        for outcome in outcomes {
            report.add(outcome);
        }
        info!(
            "Sweep done: {} probed, {} registered, {} failed",
            report.probed, report.registered, report.failed
        );
        report
    }
}

/// Expands a range string into addresses.
///
/// Supported formats:
/// - `192.168.1.0/24` (CIDR, host bits of the base are ignored; network and broadcast
///   addresses are skipped for prefixes up to /30)
/// - `192.168.1.10-20` (last octet range, inclusive)
/// - `192.168.1.7` or any IPv6 address (single)
pub fn parse_range(range: &str) -> Result<Vec<IpAddr>, DiscoveryError> {
    let range = range.trim();
    let invalid = || DiscoveryError::InvalidRange(range.to_string());

    if let Some((base, prefix)) = range.split_once('/') {
        let base: Ipv4Addr = base.parse().map_err(|_| invalid())?;
        let prefix: u32 = prefix.parse().map_err(|_| invalid())?;
        if !(MIN_PREFIX..=32).contains(&prefix) {
            return Err(invalid());
        }

        let size = 1u32 << (32 - prefix);
        let network = u32::from(base) & !(size - 1);
        let broadcast = network | (size - 1);
        let (first, last) = if size > 2 {
            (network + 1, broadcast - 1)
        } else {
            (network, broadcast)
        };
        Ok((first..=last)
            .map(|n| IpAddr::V4(Ipv4Addr::from(n)))
            .collect())
    } else if let Some((base, end)) = range.split_once('-') {
        let base: Ipv4Addr = base.parse().map_err(|_| invalid())?;
        let end: u8 = end.parse().map_err(|_| invalid())?;
        let [a, b, c, start] = base.octets();
        if end < start {
            return Err(invalid());
        }
        Ok((start..=end)
            .map(|d| IpAddr::V4(Ipv4Addr::new(a, b, c, d)))
            .collect())
    } else {
        let single: IpAddr = range.parse().map_err(|_| invalid())?;
        Ok(vec![single])
    }
}
