//! Host and name indices over live device handles.

use super::handle::{DeviceHandle, DeviceSummary};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Default)]
struct Indices {
    by_host: HashMap<IpAddr, Arc<DeviceHandle>>,
    by_name: HashMap<String, Arc<DeviceHandle>>,
}

/// Every device the bridge can talk to.
///
/// Both indices sit behind a single lock so they are always updated together.
/// Entries are never evicted; a host is only ever replaced by a newer handle for the
/// same host.
#[derive(Default)]
pub struct DeviceRegistry {
    indices: RwLock<Indices>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `handle`, replacing any handle for the same host.
    ///
    /// Returns the replaced handle, whose status watch has already been stopped.
    /// When the host changes its name, the old name is dropped from the name index or
    /// re-pointed at another host still announcing it.
    pub async fn register(&self, handle: Arc<DeviceHandle>) -> Option<Arc<DeviceHandle>> {
        let host = handle.host();
        let name = handle.name().to_string();

        let mut indices = self.indices.write().await;
        let replaced = indices.by_host.insert(host, Arc::clone(&handle));

        if let Some(old) = &replaced {
            old.shutdown();
            let old_name = old.name();
            let owns_old_name = indices
                .by_name
                .get(old_name)
                .is_some_and(|current| current.host() == host);
            if old_name != name && owns_old_name {
                let successor = indices
                    .by_host
                    .values()
                    .filter(|other| other.host() != host && other.name() == old_name)
                    .min_by_key(|other| other.host())
                    .cloned();
                match successor {
                    Some(other) => {
                        debug!("Name {} now points at {}", old_name, other.host());
                        indices.by_name.insert(old_name.to_string(), other);
                    }
                    None => {
                        indices.by_name.remove(old_name);
                    }
                }
            }
        }

        if let Some(previous) = indices.by_name.get(&name) {
            if previous.host() != host {
                warn!(
                    "Name {} moves from {} to {}",
                    name,
                    previous.host(),
                    host
                );
            }
        }
        indices.by_name.insert(name.clone(), handle);
        info!("Registered {} at {}", name, host);

        replaced
    }

    /// Resolves a device token to the handles it addresses.
    ///
    /// The empty token addresses every device, ordered by host. Otherwise the token is
    /// tried as an address first and as a display name second.
    pub async fn resolve(&self, token: &str) -> Vec<Arc<DeviceHandle>> {
        let indices = self.indices.read().await;

        if token.is_empty() {
            let mut all: Vec<_> = indices.by_host.values().cloned().collect();
            all.sort_by_key(|handle| handle.host());
            return all;
        }

        if let Ok(host) = token.parse::<IpAddr>() {
            if let Some(handle) = indices.by_host.get(&host) {
                return vec![Arc::clone(handle)];
            }
        }

        if let Some(handle) = indices.by_name.get(token) {
            return vec![Arc::clone(handle)];
        }

        warn!("{} not found", token);
        Vec::new()
    }

    pub async fn contains(&self, host: IpAddr) -> bool {
        self.indices.read().await.by_host.contains_key(&host)
    }

    /// Registered hosts in ascending order.
    pub async fn hosts(&self) -> Vec<IpAddr> {
        let mut hosts: Vec<_> = self.indices.read().await.by_host.keys().copied().collect();
        hosts.sort();
        hosts
    }

    pub async fn devices(&self) -> Vec<DeviceSummary> {
        let indices = self.indices.read().await;
        let mut devices: Vec<_> = indices
            .by_host
            .values()
            .map(|handle| handle.summary())
            .collect();
        devices.sort_by_key(|summary| summary.host);
        devices
    }

    pub async fn len(&self) -> usize {
        self.indices.read().await.by_host.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stops every status watch.
    pub async fn shutdown(&self) {
        for handle in self.indices.read().await.by_host.values() {
            handle.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::handle::DeviceProbe;
    use crate::device::testing::MockConnector;
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    async fn handle(connector: &Arc<MockConnector>, host: &str) -> Arc<DeviceHandle> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let probe = DeviceProbe::create(host.parse().unwrap())
            .connect(connector.clone())
            .await
            .unwrap();
        Arc::new(probe.into_handle(tx).unwrap())
    }

    fn ip(host: &str) -> IpAddr {
        host.parse().unwrap()
    }

    #[tokio::test]
    async fn reregistration_overwrites_and_cleans_the_old_name() {
        let connector = Arc::new(MockConnector::new().with_device("10.0.0.2", "Kitchen"));
        let registry = DeviceRegistry::new();
        registry.register(handle(&connector, "10.0.0.2").await).await;

        connector.rename("10.0.0.2", "Pantry");
        let replaced = registry.register(handle(&connector, "10.0.0.2").await).await;

        assert_eq!(replaced.unwrap().name(), "Kitchen");
        assert_eq!(registry.len().await, 1);
        assert!(registry.resolve("Kitchen").await.is_empty());
        let found = registry.resolve("Pantry").await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].host(), ip("10.0.0.2"));
    }

    #[tokio::test]
    async fn old_name_moves_to_a_host_still_using_it() {
        let connector = Arc::new(
            MockConnector::new()
                .with_device("10.0.0.2", "Speaker")
                .with_device("10.0.0.3", "Speaker"),
        );
        let registry = DeviceRegistry::new();
        registry.register(handle(&connector, "10.0.0.3").await).await;
        registry.register(handle(&connector, "10.0.0.2").await).await;
        assert_eq!(registry.resolve("Speaker").await[0].host(), ip("10.0.0.2"));

        connector.rename("10.0.0.2", "Bedroom");
        registry.register(handle(&connector, "10.0.0.2").await).await;

        assert_eq!(registry.resolve("Speaker").await[0].host(), ip("10.0.0.3"));
        assert_eq!(registry.resolve("Bedroom").await[0].host(), ip("10.0.0.2"));
    }

    #[tokio::test]
    async fn empty_token_resolves_every_device() {
        let connector = Arc::new(
            MockConnector::new()
                .with_device("10.0.0.9", "A")
                .with_device("10.0.0.1", "B")
                .with_device("10.0.0.5", "C"),
        );
        let registry = DeviceRegistry::new();
        for host in ["10.0.0.9", "10.0.0.1", "10.0.0.5"] {
            registry.register(handle(&connector, host).await).await;
        }

        let all = registry.resolve("").await;
        let hosts: HashSet<_> = all.iter().map(|h| h.host()).collect();
        let expected: HashSet<_> = registry.hosts().await.into_iter().collect();
        assert_eq!(hosts, expected);
        assert_eq!(all[0].host(), ip("10.0.0.1"));
    }

    #[tokio::test]
    async fn address_wins_over_name_and_unknown_is_empty() {
        let connector = Arc::new(MockConnector::new().with_device("10.0.0.7", "Den"));
        let registry = DeviceRegistry::new();
        registry.register(handle(&connector, "10.0.0.7").await).await;

        assert_eq!(registry.resolve("10.0.0.7").await.len(), 1);
        assert_eq!(registry.resolve("Den").await.len(), 1);
        assert!(registry.resolve("10.0.0.8").await.is_empty());
        assert!(registry.resolve("Attic").await.is_empty());
        assert!(registry.contains(ip("10.0.0.7")).await);
    }
}
