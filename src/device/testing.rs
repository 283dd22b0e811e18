//! In-crate test doubles for the device, bus and playlist collaborators.

use super::control::{DeviceConnector, DeviceControl, DeviceError, DeviceEvent};
use super::status::{CastStatus, DeviceInfo, MediaStatus};
use crate::command::playlist::{PlaylistError, PlaylistResolver};
use crate::mqtt::{BusPublisher, MqttError};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A command received by a [`MockControl`]. Status polls are not recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Play { url: String, mime: String },
    Stop,
    Volume(f32),
    QueueNext,
    LoadUrl(String),
}

#[derive(Default)]
struct MockState {
    devices: HashMap<IpAddr, String>,
    broken: HashSet<IpAddr>,
    calls: Vec<(IpAddr, Call)>,
    fail_commands: bool,
    failing_hosts: HashSet<IpAddr>,
    media: MediaStatus,
    connects: usize,
}

/// Connector over a fixed table of fake devices.
///
/// Unknown addresses are unreachable, addresses added with [`with_broken`] answer but
/// fail the handshake.
///
/// [`with_broken`]: MockConnector::with_broken
#[derive(Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(self, host: &str, name: &str) -> Self {
        self.rename(host, name);
        self
    }

    pub fn with_broken(self, host: &str) -> Self {
        self.lock().broken.insert(parse(host));
        self
    }

    /// Every handshake sleeps this long on the blocking pool.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Changes the name the device at `host` reports on its next handshake.
    pub fn rename(&self, host: &str, name: &str) {
        self.lock().devices.insert(parse(host), name.to_string());
    }

    /// Makes `host` unreachable for every later handshake.
    pub fn forget(&self, host: &str) {
        self.lock().devices.remove(&parse(host));
    }

    pub fn fail_commands(&self, fail: bool) {
        self.lock().fail_commands = fail;
    }

    /// Makes commands fail on `host` only.
    pub fn fail_host(&self, host: &str) {
        self.lock().failing_hosts.insert(parse(host));
    }

    pub fn set_media_status(&self, status: MediaStatus) {
        self.lock().media = status;
    }

    pub fn calls(&self) -> Vec<(IpAddr, Call)> {
        self.lock().calls.clone()
    }

    pub fn calls_for(&self, host: IpAddr) -> Vec<Call> {
        self.lock()
            .calls
            .iter()
            .filter(|(h, _)| *h == host)
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    /// Highest number of handshakes that were running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

impl DeviceConnector for MockConnector {
    fn connect(&self, host: IpAddr) -> Result<Box<dyn DeviceControl>, DeviceError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut state = self.lock();
        state.connects += 1;
        if state.broken.contains(&host) {
            return Err(DeviceError::Protocol(format!("{} rejected the handshake", host)));
        }
        let name = state
            .devices
            .get(&host)
            .cloned()
            .ok_or_else(|| DeviceError::Unreachable(format!("{}: connection refused", host)))?;

        Ok(Box::new(MockControl {
            host,
            info: DeviceInfo {
                name,
                model: Some("Mock Cast".to_string()),
                ..Default::default()
            },
            state: Arc::clone(&self.state),
        }))
    }
}

pub struct MockControl {
    host: IpAddr,
    info: DeviceInfo,
    state: Arc<Mutex<MockState>>,
}

impl MockControl {
    fn record(&mut self, call: Call) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_commands || state.failing_hosts.contains(&self.host) {
            return Err(DeviceError::Protocol("mock command failure".to_string()));
        }
        state.calls.push((self.host, call));
        Ok(())
    }
}

impl DeviceControl for MockControl {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn play_media(&mut self, url: &str, mime: &str) -> Result<(), DeviceError> {
        self.record(Call::Play {
            url: url.to_string(),
            mime: mime.to_string(),
        })
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.record(Call::Stop)
    }

    fn set_volume(&mut self, level: f32) -> Result<(), DeviceError> {
        self.record(Call::Volume(level))
    }

    fn queue_next(&mut self) -> Result<(), DeviceError> {
        self.record(Call::QueueNext)
    }

    fn load_url(&mut self, url: &str) -> Result<(), DeviceError> {
        self.record(Call::LoadUrl(url.to_string()))
    }

    fn poll_status(&mut self) -> Result<Vec<DeviceEvent>, DeviceError> {
        let state = self.state.lock().unwrap();
        if state.fail_commands {
            return Err(DeviceError::Unreachable(format!("{} stopped answering", self.host)));
        }
        Ok(vec![
            DeviceEvent::Cast(CastStatus {
                app_id: Some("CC1AD845".to_string()),
                display_name: Some("Default Media Receiver".to_string()),
                running_apps: vec!["CC1AD845".to_string()],
                ..Default::default()
            }),
            DeviceEvent::Media(state.media.clone()),
        ])
    }
}

/// Bus publisher that keeps everything it was asked to send.
#[derive(Default)]
pub struct RecordingPublisher {
    sent: Mutex<Vec<(String, String, bool)>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<(String, String, bool)> {
        self.sent.lock().unwrap().clone()
    }
}

impl BusPublisher for RecordingPublisher {
    fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), MqttError> {
        self.sent
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_string(), retain));
        Ok(())
    }
}

/// Playlist resolver over a fixed table; `None` entries are empty playlists.
#[derive(Default)]
pub struct StaticPlaylists {
    table: HashMap<String, Option<String>>,
    lookups: AtomicUsize,
}

impl StaticPlaylists {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, url: &str, first_entry: Option<&str>) -> Self {
        self.table
            .insert(url.to_string(), first_entry.map(str::to_string));
        self
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl PlaylistResolver for StaticPlaylists {
    fn first_entry<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Option<String>, PlaylistError>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let result = self
            .table
            .get(url)
            .cloned()
            .ok_or_else(|| PlaylistError::Fetch(format!("{} not found", url)));
        async move { result }.boxed()
    }
}

fn parse(host: &str) -> IpAddr {
    host.parse().unwrap()
}
