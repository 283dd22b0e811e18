//! # Device Discovery
//!
//! Finds cast devices and registers them, tolerating any number of dead addresses.
//!
//! ## Modes
//!
//! Two modes can run independently or together:
//!
//! - **passive**: browse mDNS announcements for the cast service type and register
//!   every announced address not already known. Runs until shutdown.
//! - **active**: enumerate configured address ranges and probe every address, at most
//!   `max_concurrent_probes` at a time.
//!
//! ```text
//! mDNS announcement ──┐
//!                     ├──► probe(host) ──► DeviceProbe ──connect──► DeviceHandle ──► DeviceRegistry
//! range sweep ────────┘        │
//!                              └─ failure ──► registration_error in history
//! ```
//!
//! Rescans re-probe without evicting anything: a device that disappeared stays
//! registered until its address is taken over by a new registration.

pub mod active;
pub mod passive;

pub use active::parse_range;

use crate::device::{
    DeviceConnector, DeviceError, DeviceNotification, DeviceProbe, DeviceRegistry,
};
use crate::history::{EventKind, HistoryPayload, HistoryStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const CAST_SERVICE_TYPE: &str = "_googlecast._tcp.local.";

/// Discovery errors
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// Neither passive nor active discovery is configured
    #[error("No discovery mode configured: enable mdns or list at least one subnet")]
    NoDiscoveryMode,

    /// A range string is not CIDR, dash range or a single address
    #[error("Invalid address range: {0}")]
    InvalidRange(String),

    /// The mDNS daemon could not be started or browsed
    #[error("mDNS error: {0}")]
    Mdns(String),
}

/// `[discovery]` section of the configuration file
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DiscoverySettings {
    pub mdns: bool,
    pub service_type: String,
    pub subnets: Vec<String>,
    pub max_concurrent_probes: usize,
    pub status_poll_secs: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            mdns: true,
            service_type: CAST_SERVICE_TYPE.to_string(),
            subnets: Vec::new(),
            max_concurrent_probes: 50,
            status_poll_secs: 5,
        }
    }
}

impl DiscoverySettings {
    /// Checks the mode selection and expands every range.
    pub fn targets(&self) -> Result<Vec<IpAddr>, DiscoveryError> {
        if !self.mdns && self.subnets.is_empty() {
            return Err(DiscoveryError::NoDiscoveryMode);
        }

        let mut targets = BTreeSet::new();
        for range in &self.subnets {
            targets.extend(parse_range(range)?);
        }
        Ok(targets.into_iter().collect())
    }
}

/// Outcome of one discovery pass.
#[derive(Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub probed: usize,
    pub registered: usize,
    pub failed: usize,
}

impl DiscoveryReport {
    fn add(&mut self, outcome: ProbeOutcome) {
        self.probed += 1;
        match outcome {
            ProbeOutcome::Registered => self.registered += 1,
            ProbeOutcome::Failed => self.failed += 1,
            ProbeOutcome::Skipped => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeOutcome {
    Registered,
    Failed,
    /// Another probe for the same host was already running
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeOrigin {
    Announcement,
    Sweep,
}

pub struct DiscoveryCoordinator {
    mdns: bool,
    service_type: String,
    targets: Vec<IpAddr>,
    max_concurrent_probes: usize,
    poll_interval: Duration,
    connector: Arc<dyn DeviceConnector>,
    registry: Arc<DeviceRegistry>,
    history: Arc<HistoryStore>,
    events: mpsc::UnboundedSender<DeviceNotification>,
    in_flight: Mutex<HashSet<IpAddr>>,
    rescanning: AtomicBool,
}

impl DiscoveryCoordinator {
    /// Validates `settings` before any network work happens.
    pub fn new(
        settings: &DiscoverySettings,
        connector: Arc<dyn DeviceConnector>,
        registry: Arc<DeviceRegistry>,
        history: Arc<HistoryStore>,
        events: mpsc::UnboundedSender<DeviceNotification>,
    ) -> Result<Self, DiscoveryError> {
        let targets = settings.targets()?;
        info!(
            "Discovery: mdns={} active targets={} max probes={}",
            settings.mdns,
            targets.len(),
            settings.max_concurrent_probes
        );

        Ok(Self {
            mdns: settings.mdns,
            service_type: settings.service_type.clone(),
            targets,
            max_concurrent_probes: settings.max_concurrent_probes.max(1),
            poll_interval: Duration::from_secs(settings.status_poll_secs.max(1)),
            connector,
            registry,
            history,
            events,
            in_flight: Mutex::new(HashSet::new()),
            rescanning: AtomicBool::new(false),
        })
    }

    /// Starts the passive listener if enabled, then runs one active sweep in the
    /// background. Returns as soon as the listener is up.
    pub fn spawn_discover(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<DiscoveryReport>, DiscoveryError> {
        self.listen(shutdown)?;

        let coordinator = Arc::clone(self);
        Ok(tokio::spawn(async move {
            if coordinator.targets.is_empty() {
                return DiscoveryReport::default();
            }
            coordinator.sweep(&coordinator.targets).await
        }))
    }

    /// An mDNS failure is only fatal when there is no range to fall back on.
    fn listen(self: &Arc<Self>, shutdown: CancellationToken) -> Result<(), DiscoveryError> {
        if !self.mdns {
            return Ok(());
        }
        match self.start_passive(shutdown) {
            Ok(_) => Ok(()),
            Err(e) if !self.targets.is_empty() => {
                warn!(
                    "Passive discovery unavailable, sweeping {} addresses only: {}",
                    self.targets.len(),
                    e
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Re-probes the configured ranges and every registered host.
    pub async fn rescan(&self) -> DiscoveryReport {
        let mut hosts: BTreeSet<IpAddr> = self.targets.iter().copied().collect();
        hosts.extend(self.registry.hosts().await);
        let hosts: Vec<_> = hosts.into_iter().collect();
        info!("Rescanning {} addresses", hosts.len());
        self.sweep(&hosts).await
    }

    /// Runs [`rescan`](Self::rescan) in the background unless one is already running.
    pub fn spawn_rescan(self: &Arc<Self>) -> Option<JoinHandle<DiscoveryReport>> {
        if self.rescanning.swap(true, Ordering::SeqCst) {
            warn!("Rescan already in progress");
            return None;
        }
        let coordinator = Arc::clone(self);
        Some(tokio::spawn(async move {
            let report = coordinator.rescan().await;
            coordinator.rescanning.store(false, Ordering::SeqCst);
            info!(
                "Rescan done: {} probed, {} registered, {} failed",
                report.probed, report.registered, report.failed
            );
            report
        }))
    }

    async fn probe(&self, host: IpAddr, origin: ProbeOrigin) -> ProbeOutcome {
        if !self.claim(host) {
            debug!("Probe for {} already running", host);
            return ProbeOutcome::Skipped;
        }
        let result = self.register_host(host).await;
        self.release(host);

        match result {
            Ok(()) => ProbeOutcome::Registered,
            Err(e) => {
                debug!("Could not register {}: {}", host, e);
                // An empty address in a swept range is not worth a history slot.
                let silent =
                    origin == ProbeOrigin::Sweep && matches!(e, DeviceError::Unreachable(_));
                if !silent {
                    self.history.record(
                        host,
                        EventKind::RegistrationError,
                        HistoryPayload::Error(e.to_string()),
                    );
                }
                ProbeOutcome::Failed
            }
        }
    }

    async fn register_host(&self, host: IpAddr) -> Result<(), DeviceError> {
        let probe = DeviceProbe::create(host)
            .connect(Arc::clone(&self.connector))
            .await?;
        let handle = Arc::new(probe.into_handle(self.events.clone())?);

        self.registry.register(Arc::clone(&handle)).await;
        handle.announce();
        handle.spawn_status_watch(self.poll_interval);
        Ok(())
    }

    fn claim(&self, host: IpAddr) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host)
    }

    fn release(&self, host: IpAddr) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&host);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::MockConnector;

    struct Fixture {
        connector: Arc<MockConnector>,
        registry: Arc<DeviceRegistry>,
        history: Arc<HistoryStore>,
        coordinator: Arc<DiscoveryCoordinator>,
        _events: mpsc::UnboundedReceiver<DeviceNotification>,
    }

    fn fixture(connector: MockConnector, settings: DiscoverySettings) -> Fixture {
        let connector = Arc::new(connector);
        let registry = Arc::new(DeviceRegistry::new());
        let history = Arc::new(HistoryStore::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = DiscoveryCoordinator::new(
            &settings,
            connector.clone(),
            registry.clone(),
            history.clone(),
            tx,
        )
        .unwrap();
        Fixture {
            connector,
            registry,
            history,
            coordinator: Arc::new(coordinator),
            _events: rx,
        }
    }

    async fn discover(coordinator: &Arc<DiscoveryCoordinator>) -> DiscoveryReport {
        coordinator
            .spawn_discover(CancellationToken::new())
            .unwrap()
            .await
            .unwrap()
    }

    fn active(ranges: &[&str], max_concurrent_probes: usize) -> DiscoverySettings {
        DiscoverySettings {
            mdns: false,
            subnets: ranges.iter().map(|r| r.to_string()).collect(),
            max_concurrent_probes,
            status_poll_secs: 3600,
            ..Default::default()
        }
    }

    #[test]
    fn neither_mode_is_a_configuration_error() {
        let settings = DiscoverySettings {
            mdns: false,
            ..Default::default()
        };
        assert!(matches!(settings.targets(), Err(DiscoveryError::NoDiscoveryMode)));
    }

    #[test]
    fn bad_range_is_rejected_up_front() {
        let settings = active(&["10.0.0.300"], 5);
        assert!(matches!(settings.targets(), Err(DiscoveryError::InvalidRange(_))));
    }

    #[test]
    fn overlapping_ranges_are_probed_once() {
        let settings = active(&["10.0.0.1-4", "10.0.0.3"], 5);
        assert_eq!(settings.targets().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn sweep_registers_only_reachable_hosts() {
        let f = fixture(
            MockConnector::new().with_device("10.0.0.3", "Kitchen"),
            active(&["10.0.0.1-4"], 50),
        );

        let report = discover(&f.coordinator).await;

        assert_eq!(
            report,
            DiscoveryReport {
                probed: 4,
                registered: 1,
                failed: 3
            }
        );
        assert_eq!(f.registry.len().await, 1);
        assert_eq!(f.registry.resolve("Kitchen").await[0].host().to_string(), "10.0.0.3");
        assert!(f.history.is_empty());
        assert!(f.coordinator.in_flight.lock().unwrap().is_empty());
        f.registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn initial_sweep_runs_in_the_background() {
        let f = fixture(
            MockConnector::new()
                .with_device("10.0.0.2", "Kitchen")
                .with_delay(Duration::from_millis(200)),
            active(&["10.0.0.2"], 5),
        );

        let sweep = f.coordinator.spawn_discover(CancellationToken::new()).unwrap();
        assert!(!sweep.is_finished());
        assert!(f.registry.is_empty().await);

        assert_eq!(sweep.await.unwrap().registered, 1);
        assert_eq!(f.registry.len().await, 1);
        f.registry.shutdown().await;
    }

    #[tokio::test]
    async fn broken_mdns_falls_back_to_the_ranges() {
        let settings = DiscoverySettings {
            mdns: true,
            service_type: "not-a-service-type".to_string(),
            ..active(&["10.0.0.2"], 5)
        };
        let f = fixture(MockConnector::new().with_device("10.0.0.2", "Kitchen"), settings);

        assert_eq!(discover(&f.coordinator).await.registered, 1);
        f.registry.shutdown().await;
    }

    #[tokio::test]
    async fn broken_mdns_without_ranges_is_fatal() {
        let settings = DiscoverySettings {
            mdns: true,
            service_type: "not-a-service-type".to_string(),
            ..active(&[], 5)
        };
        let f = fixture(MockConnector::new(), settings);

        let result = f.coordinator.spawn_discover(CancellationToken::new());

        assert!(matches!(result, Err(DiscoveryError::Mdns(_))));
    }

    #[tokio::test]
    async fn failed_handshake_is_recorded() {
        let f = fixture(
            MockConnector::new().with_broken("10.0.0.2"),
            active(&["10.0.0.2"], 50),
        );

        let report = discover(&f.coordinator).await;

        assert_eq!(report.failed, 1);
        assert!(f.registry.is_empty().await);
        let record = f
            .history
            .get("10.0.0.2".parse().unwrap(), EventKind::RegistrationError)
            .unwrap();
        assert!(matches!(record.payload, HistoryPayload::Error(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn probes_stay_within_the_concurrency_bound() {
        let f = fixture(
            MockConnector::new().with_delay(Duration::from_millis(30)),
            active(&["10.0.1.1-24"], 4),
        );

        let report = discover(&f.coordinator).await;

        assert_eq!(report.probed, 24);
        assert!(f.connector.peak_concurrency() <= 4);
        assert!(f.connector.peak_concurrency() >= 1);
    }

    #[tokio::test]
    async fn rescan_does_not_evict_vanished_devices() {
        let f = fixture(
            MockConnector::new().with_device("10.0.0.5", "Den"),
            active(&["10.0.0.5"], 5),
        );
        discover(&f.coordinator).await;
        f.connector.forget("10.0.0.5");

        let report = f.coordinator.spawn_rescan().unwrap().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(f.registry.len().await, 1);
        f.registry.shutdown().await;
    }
}
