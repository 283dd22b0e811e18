//! Device handle with statum typestate for the connection handshake
//!
//! A device goes through a short compile-time checked lifecycle before it can be
//! registered, followed by a runtime playback state once it is live.
//!
//! # State Machine
//!
//! ```text
//! DeviceProbe<Discovered> ──connect()──► DeviceProbe<Connected> ──into_handle()──► DeviceHandle
//!        │                                                                        │
//!        └─ handshake failed: probe consumed, nothing retained      Connected ─► Idle | Playing | Error
//! ```
//!
//! # Architecture
//!
//! ```text
//! Dispatcher ──► DeviceHandle ──spawn_blocking──► DeviceControl (blocking collaborator)
//!                     │
//!                 status watch ──► DeviceNotification ──► event pump (history + bus)
//! ```

use super::control::{DeviceConnector, DeviceControl, DeviceError, DeviceEvent, DeviceNotification};
use super::status::{ConnectionStatus, DeviceInfo};
use crate::history::EventKind;
use serde::Serialize;
use statum::{machine, state};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handshake states using statum
#[state]
#[derive(Debug, Clone)]
pub enum ProbeState {
    Discovered, // Address known, nothing opened yet
    Connected,  // Control channel open, identity read
}

/// One connection attempt against one address.
#[machine]
pub struct DeviceProbe<S: ProbeState> {
    host: IpAddr,
    control: Option<Box<dyn DeviceControl>>,
}

impl<S: ProbeState> DeviceProbe<S> {
    pub fn host(&self) -> IpAddr {
        self.host
    }
}

impl DeviceProbe<Discovered> {
    pub fn create(host: IpAddr) -> Self {
        debug!("Probing {}", host);
        Self::new(host, None)
    }

    /// Opens the control channel and waits until the device is ready.
    ///
    /// The blocking handshake runs on tokio's blocking pool so a slow device never
    /// stalls the runtime. On failure the probe is consumed.
    pub async fn connect(
        mut self,
        connector: Arc<dyn DeviceConnector>,
    ) -> Result<DeviceProbe<Connected>, DeviceError> {
        let host = self.host();
        let control = tokio::task::spawn_blocking(move || connector.connect(host))
            .await
            .map_err(|e| DeviceError::Worker(format!("handshake with {}: {}", host, e)))??;

        info!("found device: {} at {}", control.info().name, host);
        self.control = Some(control);
        Ok(self.transition())
    }
}

impl DeviceProbe<Connected> {
    /// Wraps the open channel into a registrable handle.
    pub fn into_handle(
        self,
        events: mpsc::UnboundedSender<DeviceNotification>,
    ) -> Result<DeviceHandle, DeviceError> {
        let control = self.control.ok_or_else(|| {
            DeviceError::Protocol(format!("probe for {} lost its control channel", self.host))
        })?;
        Ok(DeviceHandle::from_control(self.host, control, events))
    }
}

/// Runtime state of a live handle
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Connected,
    Idle,
    Playing,
    Error,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackState::Connected => write!(f, "connected"),
            PlaybackState::Idle => write!(f, "idle"),
            PlaybackState::Playing => write!(f, "playing"),
            PlaybackState::Error => write!(f, "error"),
        }
    }
}

/// Read-only view of a handle for the status surface.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct DeviceSummary {
    pub host: IpAddr,
    pub name: String,
    pub model: Option<String>,
    pub state: PlaybackState,
}

/// A registered device.
///
/// Identity (`host`, `name`) is fixed at construction. The control channel sits behind
/// a mutex so that commands and status polls against the same device never overlap.
pub struct DeviceHandle {
    host: IpAddr,
    info: DeviceInfo,
    control: Arc<Mutex<Box<dyn DeviceControl>>>,
    state: Mutex<PlaybackState>,
    /// A page from `load_url` is on screen; an idle media channel does not end it.
    showing_page: AtomicBool,
    events: mpsc::UnboundedSender<DeviceNotification>,
    watch: CancellationToken,
}

impl DeviceHandle {
    fn from_control(
        host: IpAddr,
        control: Box<dyn DeviceControl>,
        events: mpsc::UnboundedSender<DeviceNotification>,
    ) -> Self {
        Self {
            host,
            info: control.info().clone(),
            control: Arc::new(Mutex::new(control)),
            state: Mutex::new(PlaybackState::Connected),
            showing_page: AtomicBool::new(false),
            events,
            watch: CancellationToken::new(),
        }
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn state(&self) -> PlaybackState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            host: self.host,
            name: self.info.name.clone(),
            model: self.info.model.clone(),
            state: self.state(),
        }
    }

    /// Plays `url`; the empty URL is the stop sentinel.
    pub async fn play_media(&self, url: &str, mime: &str) -> Result<(), DeviceError> {
        info!("PLAY {} {} on {}", url, mime, self.host);
        let (url, mime) = (url.to_string(), mime.to_string());
        let stopping = url.is_empty();
        let result = self
            .run("play_media", move |control| control.play_media(&url, &mime))
            .await;
        if result.is_ok() {
            self.showing_page.store(false, Ordering::SeqCst);
        }
        let next = if stopping {
            PlaybackState::Idle
        } else {
            PlaybackState::Playing
        };
        self.settle(result, Some(next))
    }

    pub async fn set_volume(&self, level: f32) -> Result<(), DeviceError> {
        let result = self
            .run("set_volume", move |control| control.set_volume(level))
            .await;
        self.settle(result, None)
    }

    pub async fn queue_next(&self) -> Result<(), DeviceError> {
        let result = self.run("queue_next", |control| control.queue_next()).await;
        self.settle(result, None)
    }

    pub async fn load_url(&self, url: &str) -> Result<(), DeviceError> {
        let url = url.to_string();
        let result = self
            .run("load_url", move |control| control.load_url(&url))
            .await;
        match &result {
            Ok(()) => self.showing_page.store(true, Ordering::SeqCst),
            Err(e) => self.emit(DeviceEvent::LaunchError(e.to_string())),
        }
        self.settle(result, Some(PlaybackState::Playing))
    }

    pub async fn poll_status(&self) -> Result<Vec<DeviceEvent>, DeviceError> {
        self.run("poll_status", |control| control.poll_status())
            .await
    }

    /// Publishes the identity read during the handshake.
    pub fn announce(&self) {
        self.emit(DeviceEvent::Identity(self.info.clone()));
    }

    /// Stops the status watch; the handle itself stays usable.
    pub fn shutdown(&self) {
        self.watch.cancel();
    }

    /// Polls the device every `every` and emits only snapshots that changed.
    ///
    /// The first poll happens immediately. A failing poll emits one `LOST` connection
    /// status; the next successful poll emits `CONNECTED` again.
    pub fn spawn_status_watch(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let handle = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_seen: HashMap<EventKind, DeviceEvent> = HashMap::new();
            let mut connected = true;

            loop {
                tokio::select! {
                    _ = handle.watch.cancelled() => {
                        debug!("Status watch for {} stopped", handle.host);
                        break;
                    }
                    _ = ticker.tick() => {}
                }

                match handle.poll_status().await {
                    Ok(events) => {
                        if !connected {
                            connected = true;
                            info!("{} is reachable again", handle.host);
                            handle.emit(DeviceEvent::Connection(ConnectionStatus::connected()));
                        }
                        for event in events {
                            if last_seen.get(&event.kind()) == Some(&event) {
                                continue;
                            }
                            last_seen.insert(event.kind(), event.clone());
                            handle.apply(&event);
                            handle.emit(event);
                        }
                    }
                    Err(e) => {
                        if connected {
                            connected = false;
                            warn!("Lost contact with {}: {}", handle.host, e);
                            handle.emit(DeviceEvent::Connection(ConnectionStatus::lost(
                                e.to_string(),
                            )));
                        }
                    }
                }
            }
        })
    }

    async fn run<T, F>(&self, operation: &'static str, f: F) -> Result<T, DeviceError>
    where
        F: FnOnce(&mut Box<dyn DeviceControl>) -> Result<T, DeviceError> + Send + 'static,
        T: Send + 'static,
    {
        let control = Arc::clone(&self.control);
        let host = self.host;
        tokio::task::spawn_blocking(move || {
            let mut guard = control.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        })
        .await
        .map_err(|e| DeviceError::Worker(format!("{} on {}: {}", operation, host, e)))?
    }

    fn settle(
        &self,
        result: Result<(), DeviceError>,
        next: Option<PlaybackState>,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &result {
            Ok(()) => {
                if let Some(next) = next {
                    *state = next;
                }
            }
            Err(_) => *state = PlaybackState::Error,
        }
        result
    }

    fn apply(&self, event: &DeviceEvent) {
        if let DeviceEvent::Media(status) = event {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == PlaybackState::Playing
                && status.is_idle()
                && !self.showing_page.load(Ordering::SeqCst)
            {
                debug!("{} finished playing", self.host);
                *state = PlaybackState::Idle;
            }
        }
    }

    fn emit(&self, event: DeviceEvent) {
        let notification = DeviceNotification {
            host: self.host,
            name: self.info.name.clone(),
            event,
        };
        if self.events.send(notification).is_err() {
            debug!("Event pump gone, dropping event from {}", self.host);
        }
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("host", &self.host)
            .field("name", &self.info.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::status::MediaStatus;
    use crate::device::testing::{Call, MockConnector};

    fn host(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    async fn live_handle(
        connector: &Arc<MockConnector>,
        last: u8,
    ) -> (Arc<DeviceHandle>, mpsc::UnboundedReceiver<DeviceNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let probe = DeviceProbe::create(host(last))
            .connect(connector.clone())
            .await
            .expect("reachable device");
        (Arc::new(probe.into_handle(tx).unwrap()), rx)
    }

    #[tokio::test]
    async fn handshake_failure_consumes_the_probe() {
        let connector = Arc::new(MockConnector::new());
        let result = DeviceProbe::create(host(1)).connect(connector).await;
        assert!(matches!(result, Err(DeviceError::Unreachable(_))));
    }

    #[tokio::test]
    async fn play_then_stop_walks_the_state_machine() {
        let connector = Arc::new(MockConnector::new().with_device("10.0.0.2", "Kitchen"));
        let (handle, _rx) = live_handle(&connector, 2).await;
        assert_eq!(handle.name(), "Kitchen");
        assert_eq!(handle.state(), PlaybackState::Connected);

        handle.play_media("http://x/a.mp3", "audio/mpeg").await.unwrap();
        assert_eq!(handle.state(), PlaybackState::Playing);

        handle.play_media("", "").await.unwrap();
        assert_eq!(handle.state(), PlaybackState::Idle);

        assert_eq!(
            connector.calls_for(host(2)),
            vec![
                Call::Play {
                    url: "http://x/a.mp3".into(),
                    mime: "audio/mpeg".into()
                },
                Call::Play {
                    url: String::new(),
                    mime: String::new()
                },
            ]
        );
    }

    #[tokio::test]
    async fn failed_command_moves_to_error_and_recovers() {
        let connector = Arc::new(MockConnector::new().with_device("10.0.0.3", "Den"));
        let (handle, _rx) = live_handle(&connector, 3).await;

        connector.fail_commands(true);
        assert!(handle.play_media("http://x/a.mp3", "audio/mpeg").await.is_err());
        assert_eq!(handle.state(), PlaybackState::Error);

        connector.fail_commands(false);
        handle.play_media("http://x/b.mp3", "audio/mpeg").await.unwrap();
        assert_eq!(handle.state(), PlaybackState::Playing);
    }

    #[tokio::test]
    async fn status_watch_emits_changes_and_ends_playback_on_idle() {
        let connector = Arc::new(MockConnector::new().with_device("10.0.0.4", "Office"));
        let (handle, mut rx) = live_handle(&connector, 4).await;
        handle.play_media("http://x/a.mp3", "audio/mpeg").await.unwrap();

        connector.set_media_status(MediaStatus::idle());
        let watch = handle.spawn_status_watch(Duration::from_secs(3600));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let kinds = [first.event.kind(), second.event.kind()];
        assert!(kinds.contains(&EventKind::CastStatus));
        assert!(kinds.contains(&EventKind::MediaStatus));
        assert_eq!(first.name, "Office");
        assert_eq!(handle.state(), PlaybackState::Idle);

        handle.shutdown();
        watch.await.unwrap();
    }

    #[tokio::test]
    async fn idle_media_does_not_end_a_loaded_page() {
        let connector = Arc::new(MockConnector::new().with_device("10.0.0.6", "Hall"));
        let (handle, mut rx) = live_handle(&connector, 6).await;
        handle.load_url("http://dash/board").await.unwrap();

        connector.set_media_status(MediaStatus::idle());
        let watch = handle.spawn_status_watch(Duration::from_secs(3600));
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        assert_eq!(handle.state(), PlaybackState::Playing);
        handle.shutdown();
        watch.await.unwrap();

        // Media played after the page ends on idle again.
        handle.play_media("http://x/a.mp3", "audio/mpeg").await.unwrap();
        handle.apply(&DeviceEvent::Media(MediaStatus::idle()));
        assert_eq!(handle.state(), PlaybackState::Idle);
    }

    #[tokio::test]
    async fn lost_device_is_reported_once() {
        let connector = Arc::new(MockConnector::new().with_device("10.0.0.5", "Hall"));
        let (handle, mut rx) = live_handle(&connector, 5).await;
        connector.fail_commands(true);

        let watch = handle.spawn_status_watch(Duration::from_millis(10));
        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.event.kind(), EventKind::ConnectionStatus);

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown();
        watch.await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
