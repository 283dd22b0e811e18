//! Google Cast backend built on `rust_cast`.
//!
//! Every operation opens a fresh TLS connection to the device. `CastDevice` borrows
//! its socket for its whole life, so keeping one around would tie the control object
//! to a single thread; reconnecting per call keeps [`CastControl`] `Send` and lets the
//! handle drive it from tokio's blocking pool.
//!
//! Identity comes from the device's `eureka_info` HTTP endpoint, which carries the
//! friendly name, model and UDN.

use super::control::{DeviceConnector, DeviceControl, DeviceError, DeviceEvent};
use super::status::{CastStatus, DeviceInfo, MediaStatus};
use rust_cast::channels::media::{IdleReason, Media, PlayerState, StreamType};
use rust_cast::channels::receiver::{Application, CastDeviceApp};
use rust_cast::CastDevice;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::Once;
use std::time::Duration;
use tracing::{debug, info};

const CAST_PORT: u16 = 8009;
const DEFAULT_DESTINATION_ID: &str = "receiver-0";
const DEFAULT_MEDIA_RECEIVER_ID: &str = "CC1AD845";
/// Receiver that renders a web page full screen
const URL_CAST_APP_ID: &str = "5CB45E5A";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const IDENTITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Installs the rustls crypto provider once per process.
fn ensure_crypto_provider_initialized() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::CryptoProvider::install_default(
            rustls::crypto::aws_lc_rs::default_provider(),
        );
    });
}

#[derive(Debug, Default, Deserialize)]
struct EurekaInfo {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    device_info: EurekaDeviceInfo,
}

#[derive(Debug, Default, Deserialize)]
struct EurekaDeviceInfo {
    manufacturer: Option<String>,
    model_name: Option<String>,
    ssdp_udn: Option<String>,
}

/// Opens [`CastControl`]s on port 8009.
#[derive(Debug, Default, Clone)]
pub struct CastConnector;

impl CastConnector {
    pub fn new() -> Self {
        Self
    }

    fn read_identity(&self, host: IpAddr) -> Result<DeviceInfo, DeviceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(IDENTITY_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| DeviceError::Identity(e.to_string()))?;

        let urls = [
            format!("https://{}:8443/setup/eureka_info?params=name,device_info", host),
            format!("http://{}:8008/setup/eureka_info?params=name,device_info", host),
        ];

        let mut last_error = String::from("no identity endpoint answered");
        for url in &urls {
            match client
                .get(url)
                .send()
                .and_then(|response| response.error_for_status())
                .and_then(|response| response.json::<EurekaInfo>())
            {
                Ok(eureka) => return Ok(identity_from(host, eureka)),
                Err(e) => {
                    debug!("{} failed: {}", url, e);
                    last_error = e.to_string();
                }
            }
        }
        Err(DeviceError::Identity(last_error))
    }
}

impl DeviceConnector for CastConnector {
    fn connect(&self, host: IpAddr) -> Result<Box<dyn DeviceControl>, DeviceError> {
        TcpStream::connect_timeout(&SocketAddr::new(host, CAST_PORT), CONNECT_TIMEOUT)
            .map_err(|e| DeviceError::Unreachable(format!("{}: {}", host, e)))?;

        let mut control = CastControl {
            host: host.to_string(),
            port: CAST_PORT,
            info: DeviceInfo::default(),
            session: None,
        };

        // Ready means the receiver answers a status request on a fresh channel.
        let device = control.open()?;
        device.receiver.get_status().map_err(protocol)?;

        control.info = self.read_identity(host)?;
        Ok(Box::new(control))
    }
}

fn identity_from(host: IpAddr, eureka: EurekaInfo) -> DeviceInfo {
    let model = eureka.device_info.model_name;
    let cast_type = model.as_deref().map(|model| {
        if model.contains("Group") {
            "group"
        } else if model.contains("Home") || model.contains("Audio") {
            "audio"
        } else {
            "cast"
        }
        .to_string()
    });

    DeviceInfo {
        name: eureka.name.unwrap_or_else(|| host.to_string()),
        model,
        manufacturer: eureka.device_info.manufacturer,
        uuid: eureka.device_info.ssdp_udn,
        cast_type,
    }
}

#[derive(Debug, Clone)]
struct CastSession {
    transport_id: String,
    session_id: String,
    media_session_id: Option<i32>,
}

/// Control channel to one cast device.
pub struct CastControl {
    host: String,
    port: u16,
    info: DeviceInfo,
    session: Option<CastSession>,
}

impl CastControl {
    fn open(&self) -> Result<CastDevice<'static>, DeviceError> {
        ensure_crypto_provider_initialized();

        let device = CastDevice::connect_without_host_verification(self.host.clone(), self.port)
            .map_err(|e| DeviceError::Unreachable(format!("{}: {}", self.host, e)))?;
        device
            .connection
            .connect(DEFAULT_DESTINATION_ID)
            .map_err(protocol)?;
        device.heartbeat.ping().map_err(protocol)?;
        Ok(device)
    }

    /// Finds `app_id` running on the device or launches it, then joins its transport.
    fn join_app(
        &mut self,
        device: &CastDevice<'static>,
        app_id: &str,
    ) -> Result<CastSession, DeviceError> {
        let status = device.receiver.get_status().map_err(protocol)?;
        let app = match status.applications.into_iter().find(|app| app.app_id == app_id) {
            Some(app) => app,
            None => {
                debug!("Launching {} on {}", app_id, self.host);
                let launch = if app_id == DEFAULT_MEDIA_RECEIVER_ID {
                    CastDeviceApp::DefaultMediaReceiver
                } else {
                    CastDeviceApp::Custom(app_id.to_string())
                };
                device.receiver.launch_app(&launch).map_err(protocol)?
            }
        };

        device
            .connection
            .connect(app.transport_id.clone())
            .map_err(protocol)?;

        let media_session_id = self.cached_media_session(&app.session_id);
        let session = CastSession {
            transport_id: app.transport_id,
            session_id: app.session_id,
            media_session_id,
        };
        self.session = Some(session.clone());
        Ok(session)
    }

    /// Media session loaded by this control, if `session_id` is still the running app.
    fn cached_media_session(&self, session_id: &str) -> Option<i32> {
        self.session
            .as_ref()
            .filter(|session| session.session_id == session_id)
            .and_then(|session| session.media_session_id)
    }

    fn load(&mut self, app_id: &str, url: &str, mime: &str) -> Result<(), DeviceError> {
        let device = self.open()?;
        let session = self.join_app(&device, app_id)?;

        let media = Media {
            content_id: url.to_string(),
            content_type: mime.to_string(),
            stream_type: StreamType::Buffered,
            duration: None,
            metadata: None,
        };
        let status = device
            .media
            .load(session.transport_id.clone(), session.session_id.clone(), &media)
            .map_err(protocol)?;

        if let (Some(entry), Some(current)) = (status.entries.first(), self.session.as_mut()) {
            debug!("Media loaded with session ID: {}", entry.media_session_id);
            current.media_session_id = Some(entry.media_session_id);
        }
        Ok(())
    }
}

impl DeviceControl for CastControl {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn play_media(&mut self, url: &str, mime: &str) -> Result<(), DeviceError> {
        if url.is_empty() {
            return self.stop();
        }
        self.load(DEFAULT_MEDIA_RECEIVER_ID, url, mime)
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        let device = self.open()?;
        let status = device.receiver.get_status().map_err(protocol)?;
        let Some(app) = status
            .applications
            .iter()
            .find(|app| app.app_id == DEFAULT_MEDIA_RECEIVER_ID)
        else {
            debug!("Nothing playing on {}", self.host);
            return Ok(());
        };

        device
            .connection
            .connect(app.transport_id.clone())
            .map_err(protocol)?;

        // Another sender may have replaced our media since the load.
        let cached = self.cached_media_session(&app.session_id);
        let stopped = cached.is_some_and(|id| {
            device
                .media
                .stop(app.transport_id.clone(), id)
                .inspect_err(|e| debug!("Cached media session {} on {} is stale: {}", id, self.host, e))
                .is_ok()
        });
        if !stopped {
            let media = device
                .media
                .get_status(app.transport_id.clone(), None)
                .map_err(protocol)?;
            if let Some(entry) = media.entries.first() {
                device
                    .media
                    .stop(app.transport_id.clone(), entry.media_session_id)
                    .map_err(protocol)?;
            }
        }

        if let Some(session) = self.session.as_mut() {
            session.media_session_id = None;
        }
        Ok(())
    }

    fn set_volume(&mut self, level: f32) -> Result<(), DeviceError> {
        let device = self.open()?;
        device
            .receiver
            .set_volume(level.clamp(0.0, 1.0))
            .map_err(protocol)?;
        Ok(())
    }

    fn queue_next(&mut self) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported("queue_next"))
    }

    fn load_url(&mut self, url: &str) -> Result<(), DeviceError> {
        info!("Casting page {} to {}", url, self.host);
        self.load(URL_CAST_APP_ID, url, "text/html")
    }

    fn poll_status(&mut self) -> Result<Vec<DeviceEvent>, DeviceError> {
        let device = self.open()?;
        let status = device.receiver.get_status().map_err(protocol)?;
        let cast = cast_status(&status.applications, status.volume.level, status.volume.muted);

        let media_app = status
            .applications
            .iter()
            .find(|app| app.app_id == DEFAULT_MEDIA_RECEIVER_ID);
        let media = match media_app {
            Some(app) => {
                device
                    .connection
                    .connect(app.transport_id.clone())
                    .map_err(protocol)?;
                let media = device
                    .media
                    .get_status(app.transport_id.clone(), None)
                    .map_err(protocol)?;
                media.entries.first().map_or_else(MediaStatus::idle, |entry| MediaStatus {
                    player_state: Some(player_state(&entry.player_state).to_string()),
                    idle_reason: entry
                        .idle_reason
                        .as_ref()
                        .map(idle_reason),
                    content_id: entry.media.as_ref().map(|m| m.content_id.clone()),
                    content_type: entry.media.as_ref().map(|m| m.content_type.clone()),
                    current_time: entry.current_time,
                    duration: entry.media.as_ref().and_then(|m| m.duration),
                    media_session_id: Some(entry.media_session_id),
                })
            }
            None => MediaStatus::idle(),
        };

        Ok(vec![DeviceEvent::Cast(cast), DeviceEvent::Media(media)])
    }
}

fn cast_status(apps: &[Application], level: Option<f32>, muted: Option<bool>) -> CastStatus {
    let first = apps.first();
    CastStatus {
        app_id: first.map(|app| app.app_id.clone()),
        display_name: first.map(|app| app.display_name.clone()),
        status_text: first.map(|app| app.status_text.clone()),
        session_id: first.map(|app| app.session_id.clone()),
        transport_id: first.map(|app| app.transport_id.clone()),
        volume_level: level,
        volume_muted: muted,
        running_apps: apps.iter().map(|app| app.app_id.clone()).collect(),
    }
}

fn player_state(state: &PlayerState) -> &'static str {
    match state {
        PlayerState::Idle => "IDLE",
        PlayerState::Playing => "PLAYING",
        PlayerState::Buffering => "BUFFERING",
        PlayerState::Paused => "PAUSED",
    }
}

fn idle_reason(reason: &IdleReason) -> String {
    format!("{:?}", reason).to_uppercase()
}

fn protocol(error: rust_cast::errors::Error) -> DeviceError {
    DeviceError::Protocol(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_prefers_the_friendly_name() {
        let eureka: EurekaInfo = serde_json::from_str(
            r#"{"name":"Living Room","device_info":{"manufacturer":"Google Inc.","model_name":"Google Home","ssdp_udn":"abc-123"}}"#,
        )
        .unwrap();
        let info = identity_from("10.0.0.2".parse().unwrap(), eureka);
        assert_eq!(info.name, "Living Room");
        assert_eq!(info.cast_type.as_deref(), Some("audio"));
        assert_eq!(info.uuid.as_deref(), Some("abc-123"));
    }

    #[test]
    fn identity_falls_back_to_the_address() {
        let eureka: EurekaInfo = serde_json::from_str("{}").unwrap();
        let info = identity_from("10.0.0.3".parse().unwrap(), eureka);
        assert_eq!(info.name, "10.0.0.3");
        assert_eq!(info.model, None);
    }

    fn control_with(session: Option<CastSession>) -> CastControl {
        CastControl {
            host: "10.0.0.2".to_string(),
            port: CAST_PORT,
            info: DeviceInfo::default(),
            session,
        }
    }

    #[test]
    fn cached_media_session_needs_the_same_app_session() {
        let control = control_with(Some(CastSession {
            transport_id: "web-7".to_string(),
            session_id: "abc".to_string(),
            media_session_id: Some(4),
        }));
        assert_eq!(control.cached_media_session("abc"), Some(4));
        assert_eq!(control.cached_media_session("def"), None);

        let loaded_nothing = control_with(Some(CastSession {
            transport_id: "web-7".to_string(),
            session_id: "abc".to_string(),
            media_session_id: None,
        }));
        assert_eq!(loaded_nothing.cached_media_session("abc"), None);
        assert_eq!(control_with(None).cached_media_session("abc"), None);
    }

    #[test]
    fn closed_port_is_unreachable() {
        // TEST-NET-1 is never routed
        let result = CastConnector::new().connect("192.0.2.1".parse().unwrap());
        assert!(matches!(result, Err(DeviceError::Unreachable(_))));
    }
}
