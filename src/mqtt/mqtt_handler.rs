use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::MqttConfig;
use super::message_manager::InboundMessage;

/// Bus errors
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    /// The request could not be queued for the event loop
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// The connection to the broker failed
    #[error("MQTT connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
}

#[derive(Clone, Default, Debug, PartialEq, Eq, serde::Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Reconnecting,
}

#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct MQTTStatus {
    pub connection_state: ConnectionState,
    pub last_error: Option<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<chrono::DateTime<chrono::Local>>,
}

pub type SharedStatus = Arc<Mutex<MQTTStatus>>;

fn update_status(status: &SharedStatus, f: impl FnOnce(&mut MQTTStatus)) {
    let mut status = status.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut status);
}

/// Outbound side of the bus.
pub trait BusPublisher: Send + Sync {
    fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), MqttError>;
}

/// Inbound side of the bus: receives every publish, one at a time.
pub trait MessageSink: Send + Sync {
    fn deliver<'a>(&'a self, message: &'a InboundMessage) -> BoxFuture<'a, ()>;
}

/// Queues publishes on the shared [`AsyncClient`]; never waits on the network.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    dry_run: bool,
    status: SharedStatus,
}

impl BusPublisher for MqttPublisher {
    fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), MqttError> {
        if self.dry_run {
            info!("DRYRUN {} {}", topic, payload);
            return Ok(());
        }
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload.as_bytes().to_vec())?;
        update_status(&self.status, |s| {
            s.messages_sent += 1;
            s.last_activity = Some(chrono::Local::now());
        });
        Ok(())
    }
}

pub struct MqttHandler {
    config: MqttConfig,
    client: AsyncClient,
    eventloop: EventLoop,
    filters: Vec<String>,
    publisher: MqttPublisher,
    status: SharedStatus,
}

impl MqttHandler {
    /// Builds the client with a retained `"0"` last will on the status topic.
    ///
    /// Nothing touches the network until [`connect`](Self::connect).
    pub fn new(config: &MqttConfig, filters: Vec<String>) -> Self {
        let mut mqtt_options =
            MqttOptions::new(config.client_name.clone(), config.broker.clone(), config.port);
        mqtt_options
            .set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)))
            .set_last_will(LastWill::new(
                config.status_topic(),
                "0",
                QoS::AtLeastOnce,
                true,
            ));

        let (client, eventloop) = AsyncClient::new(mqtt_options, 64);
        let status = SharedStatus::default();
        let publisher = MqttPublisher {
            client: client.clone(),
            dry_run: config.dry_run,
            status: Arc::clone(&status),
        };

        MqttHandler {
            config: config.clone(),
            client,
            eventloop,
            filters,
            publisher,
            status,
        }
    }

    pub fn publisher(&self) -> MqttPublisher {
        self.publisher.clone()
    }

    pub fn status(&self) -> SharedStatus {
        Arc::clone(&self.status)
    }

    /// Polls until the broker acknowledges the connection.
    ///
    /// An error here means the broker was unreachable at startup.
    pub async fn connect(&mut self) -> Result<(), MqttError> {
        info!(
            "Connecting to {}:{} as {}",
            self.config.broker, self.config.port, self.config.client_name
        );
        update_status(&self.status, |s| s.connection_state = ConnectionState::Connecting);

        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    self.on_connected();
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => {
                    update_status(&self.status, |s| {
                        s.connection_state = ConnectionState::Failed;
                        s.last_error = Some(e.to_string());
                    });
                    return Err(e.into());
                }
            }
        }
    }

    /// Drives the event loop until `shutdown` fires.
    ///
    /// Each inbound publish is delivered and awaited before the next poll, so messages
    /// are handled strictly in arrival order. Connection errors are logged and polling
    /// continues; rumqttc reconnects on the next poll.
    pub async fn run(mut self, sink: Arc<dyn MessageSink>, shutdown: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = InboundMessage::from_publish(&publish.topic, &publish.payload);
                    debug!("Received {}", message);
                    update_status(&self.status, |s| {
                        s.messages_received += 1;
                        s.last_activity = Some(message.timestamp());
                    });
                    sink.deliver(&message).await;
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Reconnected to {}", self.config.broker);
                    self.on_connected();
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT error: {}", e);
                    update_status(&self.status, |s| {
                        s.connection_state = ConnectionState::Reconnecting;
                        s.last_error = Some(e.to_string());
                    });
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        self.disconnect().await;
    }

    /// Announces liveness and re-issues every subscription.
    fn on_connected(&self) {
        update_status(&self.status, |s| {
            s.connection_state = ConnectionState::Connected;
            s.last_error = None;
        });

        if let Err(e) = self.publisher.publish(&self.config.status_topic(), "1", true) {
            warn!("Could not publish status: {}", e);
        }
        for filter in &self.filters {
            debug!("Subscribing to {}", filter);
            if let Err(e) = self.client.try_subscribe(filter.as_str(), QoS::AtMostOnce) {
                warn!("Could not subscribe to {}: {}", filter, e);
            }
        }
    }

    /// Clears the liveness flag and flushes the disconnect.
    async fn disconnect(&mut self) {
        let _ = self.publisher.publish(&self.config.status_topic(), "0", true);
        if self.client.try_disconnect().is_err() {
            return;
        }

        let flush = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(Duration::from_secs(2), flush).await.is_err() {
            debug!("Broker did not confirm the disconnect");
        }
        update_status(&self.status, |s| s.connection_state = ConnectionState::Disconnected);
        info!("Disconnected from {}", self.config.broker);
    }
}
