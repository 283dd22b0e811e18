//! # Bridge Context
//!
//! The one object built at startup. It owns the history, the registry, the discovery
//! coordinator and the dispatcher, and moves device events onto the bus.
//!
//! ## Why This Module Exists
//!
//! Devices report status changes, the bus publishes them, and bus messages command
//! the devices. Wiring those directly would make the registry and the bus reference
//! each other. Instead devices push [`DeviceNotification`]s into a channel and the
//! event pump here, which owns the publisher, records and publishes them.
//!
//! ```text
//! DeviceHandle ──mpsc──► event pump ──► HistoryStore
//!                                  └──► BusPublisher: P/<name>/event/<kind> (JSON, retained)
//! ```

use crate::command::playlist::PlaylistResolver;
use crate::command::{default_routes, CommandDispatcher, DispatchError, DispatchOutcome};
use crate::config::AppConfig;
use crate::device::{DeviceConnector, DeviceNotification, DeviceRegistry, DeviceSummary};
use crate::discovery::{DiscoveryCoordinator, DiscoveryReport};
use crate::history::{HistoryEntry, HistoryStore};
use crate::mqtt::{BusPublisher, MqttConfig};
use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Bridge {
    mqtt: MqttConfig,
    history: Arc<HistoryStore>,
    registry: Arc<DeviceRegistry>,
    discovery: Arc<DiscoveryCoordinator>,
    dispatcher: Arc<CommandDispatcher>,
}

impl Bridge {
    /// Validates the configuration and wires every component.
    ///
    /// The returned receiver carries device notifications and must be handed to
    /// [`spawn_event_pump`](Self::spawn_event_pump).
    pub fn new(
        config: &AppConfig,
        connector: Arc<dyn DeviceConnector>,
        playlists: Arc<dyn PlaylistResolver>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DeviceNotification>)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let history = Arc::new(HistoryStore::new());
        let registry = Arc::new(DeviceRegistry::new());

        let discovery = Arc::new(DiscoveryCoordinator::new(
            &config.discovery,
            connector,
            Arc::clone(&registry),
            Arc::clone(&history),
            events_tx,
        )?);

        let router = default_routes(&config.mqtt.topic_prefix)?;
        let dispatcher = Arc::new(CommandDispatcher::new(
            router,
            Arc::clone(&registry),
            Arc::clone(&history),
            Arc::clone(&discovery),
            playlists,
            config.playback.clone(),
        ));

        let bridge = Bridge {
            mqtt: config.mqtt.clone(),
            history,
            registry,
            discovery,
            dispatcher,
        };
        Ok((bridge, events_rx))
    }

    /// Starts passive discovery and launches the first active sweep.
    ///
    /// The sweep runs in the background so the bus event loop keeps draining
    /// the announcements it produces.
    pub fn start(&self, shutdown: CancellationToken) -> Result<JoinHandle<DiscoveryReport>> {
        let sweep = self.discovery.spawn_discover(shutdown)?;
        Ok(tokio::spawn(async move {
            let report = sweep.await.unwrap_or_else(|e| {
                warn!("Initial sweep aborted: {}", e);
                DiscoveryReport::default()
            });
            info!(
                "Initial discovery: {} probed, {} registered, {} failed",
                report.probed, report.registered, report.failed
            );
            report
        }))
    }

    /// Records every device notification and publishes it as retained JSON.
    pub fn spawn_event_pump(
        &self,
        mut events: mpsc::UnboundedReceiver<DeviceNotification>,
        publisher: Arc<dyn BusPublisher>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let history = Arc::clone(&self.history);
        let mqtt = self.mqtt.clone();

        tokio::spawn(async move {
            loop {
                let notification = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    notification = events.recv() => match notification {
                        Some(notification) => notification,
                        None => break,
                    },
                };

                let kind = notification.event.kind();
                let payload = notification.event.into_payload();
                let topic = mqtt.event_topic(&notification.name, kind.as_str());

                match serde_json::to_string(&payload) {
                    Ok(json) => {
                        if let Err(e) = publisher.publish(&topic, &json, true) {
                            warn!("Could not publish {}: {}", topic, e);
                        }
                    }
                    Err(e) => warn!("Could not encode {} for {}: {}", kind, notification.host, e),
                }
                history.record(notification.host, kind, payload);
            }
            debug!("Event pump stopped");
        })
    }

    pub fn history_snapshot(&self) -> Vec<HistoryEntry> {
        self.history.snapshot()
    }

    pub async fn devices(&self) -> Vec<DeviceSummary> {
        self.registry.devices().await
    }

    pub async fn dispatch_named(
        &self,
        action: &str,
        token: &str,
        argument: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.dispatcher.dispatch_named(action, token, argument).await
    }

    pub fn dispatcher(&self) -> Arc<CommandDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Subscription filters for the bus handler.
    pub fn filters(&self) -> Vec<String> {
        self.dispatcher.router().filters()
    }

    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}
