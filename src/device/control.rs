//! Interface to the device-control collaborator.
//!
//! The bridge never speaks the cast protocol directly. It talks to a
//! [`DeviceConnector`] to open a control channel for an address and to the resulting
//! [`DeviceControl`] for playback commands and status polling. All calls are blocking
//! and are driven from tokio's blocking pool by [`DeviceHandle`](super::DeviceHandle).

use std::net::IpAddr;

use super::status::{CastStatus, ConnectionStatus, DeviceInfo, MediaStatus};
use crate::history::{EventKind, HistoryPayload};

/// Errors reported by a device backend
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Nothing answered at the address (refused, timed out, unroutable)
    #[error("Device unreachable: {0}")]
    Unreachable(String),

    /// Something answered but the cast handshake or a command failed
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The identity endpoint could not be read
    #[error("Identity error: {0}")]
    Identity(String),

    /// The backend does not implement this operation
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    /// The blocking worker running the operation died
    #[error("Worker error: {0}")]
    Worker(String),
}

/// An open control channel to a single device.
pub trait DeviceControl: Send {
    /// Identity read during the handshake
    fn info(&self) -> &DeviceInfo;

    /// Loads and starts `url`. An empty `url` stops playback instead.
    fn play_media(&mut self, url: &str, mime: &str) -> Result<(), DeviceError>;

    fn stop(&mut self) -> Result<(), DeviceError>;

    /// `level` is in the device range `0.0..=1.0`
    fn set_volume(&mut self, level: f32) -> Result<(), DeviceError>;

    fn queue_next(&mut self) -> Result<(), DeviceError>;

    /// Shows a web page on the device's screen
    fn load_url(&mut self, url: &str) -> Result<(), DeviceError>;

    /// Current receiver and media status
    fn poll_status(&mut self) -> Result<Vec<DeviceEvent>, DeviceError>;
}

/// Opens control channels; one connector is shared by all discovery workers.
pub trait DeviceConnector: Send + Sync + 'static {
    /// Connects, waits until the device is ready and reads its identity.
    fn connect(&self, host: IpAddr) -> Result<Box<dyn DeviceControl>, DeviceError>;
}

/// Something a device reported.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceEvent {
    Identity(DeviceInfo),
    Cast(CastStatus),
    Media(MediaStatus),
    Connection(ConnectionStatus),
    LaunchError(String),
}

impl DeviceEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DeviceEvent::Identity(_) => EventKind::DeviceStatus,
            DeviceEvent::Cast(_) => EventKind::CastStatus,
            DeviceEvent::Media(_) => EventKind::MediaStatus,
            DeviceEvent::Connection(_) => EventKind::ConnectionStatus,
            DeviceEvent::LaunchError(_) => EventKind::LaunchError,
        }
    }

    pub fn into_payload(self) -> HistoryPayload {
        match self {
            DeviceEvent::Identity(info) => HistoryPayload::Device(info),
            DeviceEvent::Cast(status) => HistoryPayload::Cast(status),
            DeviceEvent::Media(status) => HistoryPayload::Media(status),
            DeviceEvent::Connection(status) => HistoryPayload::Connection(status),
            DeviceEvent::LaunchError(message) => HistoryPayload::Error(message),
        }
    }
}

/// A [`DeviceEvent`] tagged with the device it came from.
#[derive(Clone, Debug)]
pub struct DeviceNotification {
    pub host: IpAddr,
    pub name: String,
    pub event: DeviceEvent,
}
