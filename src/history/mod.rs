//! # Event History
//!
//! Keeps the latest record of every kind of event per device so the status page can
//! show what each device last reported and what was last asked of it.
//!
//! ## Storage Model
//!
//! Records are keyed by `(host, kind)` and each key holds exactly one record: a new
//! record for the same key overwrites the previous one. The store is therefore a
//! bounded map (devices × event kinds), not an ever-growing log. Nothing survives a
//! restart.
//!
//! ```text
//! (192.168.1.20, cast_status)  ──► (21/06/03 10:12:01, CastStatus {...})
//! (192.168.1.20, play_url)     ──► (21/06/03 10:11:58, "http://radio/stream.mp3")
//! (192.168.1.31, registration_error) ──► (..., "connection refused")
//! ```
//!
//! ## Thread Safety
//!
//! Writers are the device event pump, the dispatcher and the discovery workers;
//! readers are the status page. A `std::sync::RwLock` is enough since no lock is held
//! across an await point.

pub mod fields;

pub use fields::{prune, FieldValue, StatusFields};

use crate::device::status::{CastStatus, ConnectionStatus, DeviceInfo, MediaStatus};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// What a history record is about.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CastStatus,
    CommandError,
    ConnectionStatus,
    DeviceStatus,
    LaunchError,
    LoadUrl,
    MediaStatus,
    PlayUrl,
    QueueNext,
    RegistrationError,
    SetVolume,
    StopMedia,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CastStatus => "cast_status",
            EventKind::CommandError => "command_error",
            EventKind::ConnectionStatus => "connection_status",
            EventKind::DeviceStatus => "device_status",
            EventKind::LaunchError => "launch_error",
            EventKind::LoadUrl => "load_url",
            EventKind::MediaStatus => "media_status",
            EventKind::PlayUrl => "play_url",
            EventKind::QueueNext => "queue_next",
            EventKind::RegistrationError => "registration_error",
            EventKind::SetVolume => "set_volume",
            EventKind::StopMedia => "stop_media",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything that can be stored in a history slot.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum HistoryPayload {
    Device(DeviceInfo),
    Cast(CastStatus),
    Media(MediaStatus),
    Connection(ConnectionStatus),
    /// Raw action record, e.g. the URL that was sent to the device
    Action(String),
    /// Registration, launch or command failure
    Error(String),
}

impl StatusFields for HistoryPayload {
    fn type_name(&self) -> &'static str {
        match self {
            HistoryPayload::Device(info) => info.type_name(),
            HistoryPayload::Cast(status) => status.type_name(),
            HistoryPayload::Media(status) => status.type_name(),
            HistoryPayload::Connection(status) => status.type_name(),
            HistoryPayload::Action(_) => "Action",
            HistoryPayload::Error(_) => "Error",
        }
    }

    fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        match self {
            HistoryPayload::Device(info) => info.fields(),
            HistoryPayload::Cast(status) => status.fields(),
            HistoryPayload::Media(status) => status.fields(),
            HistoryPayload::Connection(status) => status.fields(),
            HistoryPayload::Action(value) => vec![("value", value.as_str().into())],
            HistoryPayload::Error(message) => vec![("error", message.as_str().into())],
        }
    }
}

/// Value side of one history slot.
#[derive(Clone, Debug, PartialEq)]
pub struct HistoryRecord {
    pub timestamp: DateTime<Local>,
    pub payload: HistoryPayload,
}

/// A slot as returned by [`HistoryStore::snapshot`].
#[derive(Clone, Debug)]
pub struct HistoryEntry {
    pub host: IpAddr,
    pub kind: EventKind,
    pub timestamp: DateTime<Local>,
    pub payload: HistoryPayload,
}

impl HistoryEntry {
    /// Pruned attributes of the payload, ready for rendering.
    pub fn display_fields(&self) -> Vec<(&'static str, FieldValue)> {
        prune(self.payload.fields())
    }
}

#[derive(Debug, Default)]
pub struct HistoryStore {
    log: RwLock<BTreeMap<(IpAddr, EventKind), HistoryRecord>>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the `(host, kind)` slot with `(now, payload)`.
    ///
    /// The stored timestamp never goes backwards for a slot, even if the wall clock does.
    pub fn record(&self, host: IpAddr, kind: EventKind, payload: HistoryPayload) {
        let mut now = Local::now();
        debug!("{} {} {}", host, kind, now.format("%y/%m/%d %H:%M:%S"));

        let mut log = self.log.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = log.get(&(host, kind)) {
            if previous.timestamp > now {
                now = previous.timestamp;
            }
        }
        log.insert(
            (host, kind),
            HistoryRecord {
                timestamp: now,
                payload,
            },
        );
    }

    pub fn get(&self, host: IpAddr, kind: EventKind) -> Option<HistoryRecord> {
        self.log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(host, kind))
            .cloned()
    }

    /// All slots ordered by `(host, kind)`.
    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|((host, kind), record)| HistoryEntry {
                host: *host,
                kind: *kind,
                timestamp: record.timestamp,
                payload: record.payload.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.log.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(last: u8) -> IpAddr {
        IpAddr::from([192, 168, 1, last])
    }

    #[test]
    fn record_overwrites_the_same_slot() {
        let history = HistoryStore::new();
        history.record(host(2), EventKind::PlayUrl, HistoryPayload::Action("a".into()));
        let first = history.get(host(2), EventKind::PlayUrl).unwrap();

        history.record(host(2), EventKind::PlayUrl, HistoryPayload::Action("b".into()));

        let snapshot = history.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].payload, HistoryPayload::Action("b".into()));
        assert!(snapshot[0].timestamp >= first.timestamp);
    }

    #[test]
    fn snapshot_is_ordered_by_host_then_kind() {
        let history = HistoryStore::new();
        history.record(host(9), EventKind::CastStatus, HistoryPayload::Action("x".into()));
        history.record(host(3), EventKind::PlayUrl, HistoryPayload::Action("y".into()));
        history.record(host(3), EventKind::CastStatus, HistoryPayload::Action("z".into()));

        let keys: Vec<_> = history
            .snapshot()
            .into_iter()
            .map(|entry| (entry.host, entry.kind))
            .collect();
        assert_eq!(
            keys,
            vec![
                (host(3), EventKind::CastStatus),
                (host(3), EventKind::PlayUrl),
                (host(9), EventKind::CastStatus),
            ]
        );
    }

    #[test]
    fn display_fields_do_not_mutate_the_record() {
        let history = HistoryStore::new();
        let status = MediaStatus {
            player_state: Some("PLAYING".into()),
            ..Default::default()
        };
        history.record(host(4), EventKind::MediaStatus, HistoryPayload::Media(status.clone()));

        let entry = &history.snapshot()[0];
        let fields = entry.display_fields();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].0, "player_state");

        let stored = history.get(host(4), EventKind::MediaStatus).unwrap();
        assert_eq!(stored.payload, HistoryPayload::Media(status));
    }

    #[test]
    fn kinds_render_in_snake_case() {
        assert_eq!(EventKind::RegistrationError.to_string(), "registration_error");
        assert_eq!(
            serde_json::to_string(&EventKind::MediaStatus).unwrap(),
            "\"media_status\""
        );
    }
}
