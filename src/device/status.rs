//! Snapshot types reported by a cast device.
//!
//! These are plain data: the device backend fills them in, the history store keeps the
//! latest one per device, and the bus publishes them as JSON.

use serde::Serialize;

use crate::history::{FieldValue, StatusFields};

/// Identity read from the device during the handshake.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct DeviceInfo {
    /// Friendly name configured by the owner ("Living Room")
    pub name: String,
    pub model: Option<String>,
    pub manufacturer: Option<String>,
    pub uuid: Option<String>,
    pub cast_type: Option<String>,
}

impl StatusFields for DeviceInfo {
    fn type_name(&self) -> &'static str {
        "DeviceInfo"
    }

    fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("name", self.name.as_str().into()),
            ("model", self.model.clone().into()),
            ("manufacturer", self.manufacturer.clone().into()),
            ("uuid", self.uuid.clone().into()),
            ("cast_type", self.cast_type.clone().into()),
        ]
    }
}

/// Receiver status: what app runs on the device and at what volume.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct CastStatus {
    pub app_id: Option<String>,
    pub display_name: Option<String>,
    pub status_text: Option<String>,
    pub session_id: Option<String>,
    pub transport_id: Option<String>,
    pub volume_level: Option<f32>,
    pub volume_muted: Option<bool>,
    /// Every app id currently running, the first one is reported above
    pub running_apps: Vec<String>,
}

impl StatusFields for CastStatus {
    fn type_name(&self) -> &'static str {
        "CastStatus"
    }

    fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("app_id", self.app_id.clone().into()),
            ("display_name", self.display_name.clone().into()),
            ("status_text", self.status_text.clone().into()),
            ("session_id", self.session_id.clone().into()),
            ("transport_id", self.transport_id.clone().into()),
            ("volume_level", self.volume_level.into()),
            ("volume_muted", self.volume_muted.into()),
            ("running_apps", self.running_apps.clone().into()),
        ]
    }
}

/// Media player status of the running receiver app.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct MediaStatus {
    pub player_state: Option<String>,
    pub idle_reason: Option<String>,
    pub content_id: Option<String>,
    pub content_type: Option<String>,
    pub current_time: Option<f32>,
    pub duration: Option<f32>,
    pub media_session_id: Option<i32>,
}

impl MediaStatus {
    /// Status reported when no receiver app is running at all.
    pub fn idle() -> Self {
        Self {
            player_state: Some("IDLE".to_string()),
            ..Default::default()
        }
    }

    pub fn is_idle(&self) -> bool {
        self.player_state
            .as_deref()
            .is_some_and(|state| state.eq_ignore_ascii_case("idle"))
    }
}

impl StatusFields for MediaStatus {
    fn type_name(&self) -> &'static str {
        "MediaStatus"
    }

    fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("player_state", self.player_state.clone().into()),
            ("idle_reason", self.idle_reason.clone().into()),
            ("content_id", self.content_id.clone().into()),
            ("content_type", self.content_type.clone().into()),
            ("current_time", self.current_time.into()),
            ("duration", self.duration.into()),
            (
                "media_session_id",
                self.media_session_id.map(f64::from).into(),
            ),
        ]
    }
}

/// Reachability of the control channel as last observed.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ConnectionStatus {
    /// `CONNECTED` or `LOST`
    pub status: String,
    pub detail: Option<String>,
}

impl ConnectionStatus {
    pub fn connected() -> Self {
        Self {
            status: "CONNECTED".to_string(),
            detail: None,
        }
    }

    pub fn lost(detail: impl Into<String>) -> Self {
        Self {
            status: "LOST".to_string(),
            detail: Some(detail.into()),
        }
    }
}

impl StatusFields for ConnectionStatus {
    fn type_name(&self) -> &'static str {
        "ConnectionStatus"
    }

    fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        vec![
            ("status", self.status.as_str().into()),
            ("detail", self.detail.clone().into()),
        ]
    }
}
