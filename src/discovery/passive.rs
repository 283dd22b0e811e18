//! Passive discovery over mDNS announcements.

use super::{DiscoveryCoordinator, DiscoveryError, ProbeOrigin};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

impl DiscoveryCoordinator {
    /// Browses the cast service type until `shutdown` fires.
    pub fn start_passive(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>, DiscoveryError> {
        let mdns = ServiceDaemon::new().map_err(|e| DiscoveryError::Mdns(e.to_string()))?;
        let receiver = match mdns.browse(&self.service_type) {
            Ok(receiver) => receiver,
            Err(e) => {
                let _ = mdns.shutdown();
                return Err(DiscoveryError::Mdns(e.to_string()));
            }
        };
        info!("Listening for {} announcements", self.service_type);

        let coordinator = Arc::clone(self);
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = receiver.recv_async() => match event {
                        Ok(ServiceEvent::ServiceResolved(service)) => {
                            let hosts = announced_hosts(service.get_addresses_v4());
                            debug!("Announcement from {} at {:?}", service.get_fullname(), hosts);
                            let coordinator = Arc::clone(&coordinator);
                            tokio::spawn(async move { coordinator.on_announcement(hosts).await });
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("mDNS browse ended: {}", e);
                            break;
                        }
                    }
                }
            }

            if let Err(e) = mdns.stop_browse(&coordinator.service_type) {
                debug!("Failed to stop mDNS browse cleanly: {}", e);
            }
            let _ = mdns.shutdown();
        }))
    }

    /// Registers every announced address that is not known yet.
    pub(super) async fn on_announcement(&self, hosts: Vec<IpAddr>) -> usize {
        let mut registered = 0;
        for host in hosts {
            if self.registry.contains(host).await {
                continue;
            }
            if self.probe(host, ProbeOrigin::Announcement).await == super::ProbeOutcome::Registered
            {
                registered += 1;
            }
        }
        registered
    }
}

/// IPv4 addresses of an announcement, in a stable order.
fn announced_hosts<'a>(addresses: impl IntoIterator<Item = &'a Ipv4Addr>) -> Vec<IpAddr> {
    let mut hosts: Vec<IpAddr> = addresses.into_iter().map(|addr| IpAddr::V4(*addr)).collect();
    hosts.sort();
    hosts
}
