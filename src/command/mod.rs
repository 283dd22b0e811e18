//! # Command Dispatch
//!
//! Turns inbound bus messages into device operations.
//!
//! ```text
//! InboundMessage ──► TopicRouter ──► ActionKind ──► Action::parse(payload)
//!                                        │                │
//!                        device token ───┴──► DeviceRegistry::resolve ──► DeviceHandle ops
//! ```
//!
//! ## Failure Boundary
//!
//! Nothing raised while handling a message reaches the bus event loop. Malformed
//! payloads and device failures are logged with the action name and recorded as
//! `command_error` for every affected host. In a broadcast, one failing device does not
//! keep the others from receiving the command.

pub mod playlist;

use crate::device::{DeviceError, DeviceHandle, DeviceRegistry};
use crate::discovery::DiscoveryCoordinator;
use crate::history::{EventKind, HistoryPayload, HistoryStore};
use crate::mqtt::{InboundMessage, MessageSink, TopicError, TopicRouter};
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use playlist::{is_playlist, PlaylistError, PlaylistResolver};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Every action the bridge understands, as named in topics.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Rescan,
    PlayMedia,
    Alarm,
    StopMedia,
    LoadUrl,
    SetVolume,
    QueueNext,
}

impl ActionKind {
    /// Routing order
    pub const ALL: [ActionKind; 7] = [
        ActionKind::Rescan,
        ActionKind::PlayMedia,
        ActionKind::Alarm,
        ActionKind::StopMedia,
        ActionKind::LoadUrl,
        ActionKind::SetVolume,
        ActionKind::QueueNext,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Rescan => "rescan",
            ActionKind::PlayMedia => "play_media",
            ActionKind::Alarm => "alarm",
            ActionKind::StopMedia => "stop_media",
            ActionKind::LoadUrl => "load_url",
            ActionKind::SetVolume => "set_volume",
            ActionKind::QueueNext => "queue_next",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DispatchError::UnknownAction(s.to_string()))
    }
}

/// `[playback]` section of the configuration file
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PlaybackSettings {
    pub default_mime: String,
    /// Played by `alarm` when the message carries no URL
    pub alarm_url: Option<String>,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            default_mime: "audio/mpeg".to_string(),
            alarm_url: None,
        }
    }
}

/// Dispatch errors
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("{0} needs an argument")]
    MissingArgument(ActionKind),

    #[error("Invalid argument for {action}: {value:?}")]
    InvalidArgument { action: ActionKind, value: String },

    #[error(transparent)]
    Playlist(#[from] PlaylistError),
}

/// A parsed command with its typed argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Rescan,
    /// An empty `url` stops playback
    PlayMedia { url: String, mime: String },
    Alarm { url: String },
    StopMedia,
    LoadUrl { url: String },
    SetVolume { level: f32 },
    QueueNext,
}

impl Action {
    pub fn parse(
        kind: ActionKind,
        payload: &str,
        playback: &PlaybackSettings,
    ) -> Result<Self, DispatchError> {
        let payload = payload.trim();
        match kind {
            ActionKind::Rescan => Ok(Action::Rescan),
            ActionKind::PlayMedia => {
                let mut parts = payload.split_whitespace();
                let url = parts.next().unwrap_or_default().to_string();
                let mime = parts
                    .next()
                    .map_or_else(|| playback.default_mime.clone(), str::to_string);
                Ok(Action::PlayMedia { url, mime })
            }
            ActionKind::Alarm => {
                let url = if payload.is_empty() {
                    playback
                        .alarm_url
                        .clone()
                        .filter(|url| !url.is_empty())
                        .ok_or(DispatchError::MissingArgument(kind))?
                } else {
                    payload.to_string()
                };
                Ok(Action::Alarm { url })
            }
            ActionKind::StopMedia => Ok(Action::StopMedia),
            ActionKind::LoadUrl => {
                if payload.is_empty() {
                    return Err(DispatchError::MissingArgument(kind));
                }
                Ok(Action::LoadUrl {
                    url: payload.to_string(),
                })
            }
            ActionKind::SetVolume => {
                let level = payload
                    .parse::<f32>()
                    .ok()
                    .filter(|level| level.is_finite())
                    .ok_or_else(|| DispatchError::InvalidArgument {
                        action: kind,
                        value: payload.to_string(),
                    })?;
                Ok(Action::SetVolume { level })
            }
            ActionKind::QueueNext => Ok(Action::QueueNext),
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Rescan => ActionKind::Rescan,
            Action::PlayMedia { .. } => ActionKind::PlayMedia,
            Action::Alarm { .. } => ActionKind::Alarm,
            Action::StopMedia => ActionKind::StopMedia,
            Action::LoadUrl { .. } => ActionKind::LoadUrl,
            Action::SetVolume { .. } => ActionKind::SetVolume,
            Action::QueueNext => ActionKind::QueueNext,
        }
    }

    /// History slot and value recorded when the action is sent to a device.
    fn history_record(&self) -> Option<(EventKind, String)> {
        match self {
            Action::Rescan => None,
            Action::PlayMedia { url, .. } | Action::Alarm { url } => {
                Some((EventKind::PlayUrl, url.clone()))
            }
            Action::StopMedia => Some((EventKind::StopMedia, String::new())),
            Action::LoadUrl { url } => Some((EventKind::LoadUrl, url.clone())),
            Action::SetVolume { level } => Some((EventKind::SetVolume, level.to_string())),
            Action::QueueNext => Some((EventKind::QueueNext, String::new())),
        }
    }
}

/// What happened to one dispatched command.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub action: ActionKind,
    pub succeeded: Vec<IpAddr>,
    pub failed: Vec<IpAddr>,
}

impl DispatchOutcome {
    fn empty(action: ActionKind) -> Self {
        Self {
            action,
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

/// The table for prefix `P`: `P/+/action/<name>` for every [`ActionKind`].
pub fn default_routes(prefix: &str) -> Result<TopicRouter<ActionKind>, TopicError> {
    crate::mqtt::topic::validate_prefix(prefix)?;
    ActionKind::ALL
        .into_iter()
        .try_fold(TopicRouter::new(), |router, kind| {
            router.route(&format!("{}/+/action/{}", prefix, kind), kind)
        })
}

/// The segment right before the trailing `action/<name>` pair; empty means everyone.
pub fn device_token<'a>(segments: &[&'a str]) -> &'a str {
    segments
        .len()
        .checked_sub(3)
        .and_then(|i| segments.get(i).copied())
        .unwrap_or_default()
}

pub struct CommandDispatcher {
    router: TopicRouter<ActionKind>,
    registry: Arc<DeviceRegistry>,
    history: Arc<HistoryStore>,
    discovery: Arc<DiscoveryCoordinator>,
    playlists: Arc<dyn PlaylistResolver>,
    playback: PlaybackSettings,
}

impl CommandDispatcher {
    pub fn new(
        router: TopicRouter<ActionKind>,
        registry: Arc<DeviceRegistry>,
        history: Arc<HistoryStore>,
        discovery: Arc<DiscoveryCoordinator>,
        playlists: Arc<dyn PlaylistResolver>,
        playback: PlaybackSettings,
    ) -> Self {
        Self {
            router,
            registry,
            history,
            discovery,
            playlists,
            playback,
        }
    }

    pub fn router(&self) -> &TopicRouter<ActionKind> {
        &self.router
    }

    /// Routes one bus message. Returns `None` when no route matched or the command
    /// was rejected.
    pub async fn handle_message(&self, message: &InboundMessage) -> Option<DispatchOutcome> {
        let segments = message.segments();
        let kind = self.router.match_topic(&segments)?;
        let token = device_token(&segments);

        match self.dispatch(kind, token, message.payload()).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!("{} for {:?} failed: {}", kind, token, e);
                None
            }
        }
    }

    /// Parses `action` by name and dispatches it like a bus message.
    pub async fn dispatch_named(
        &self,
        action: &str,
        token: &str,
        argument: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        let kind = action.parse::<ActionKind>()?;
        self.dispatch(kind, token, argument).await
    }

    pub async fn dispatch(
        &self,
        kind: ActionKind,
        token: &str,
        payload: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        info!("{} {:?} {:?}", kind, token, payload);

        if kind == ActionKind::Rescan {
            self.discovery.spawn_rescan();
            return Ok(DispatchOutcome::empty(kind));
        }

        let targets = self.registry.resolve(token).await;
        if targets.is_empty() {
            return Ok(DispatchOutcome::empty(kind));
        }

        let action = match self.prepare(kind, payload).await {
            Ok(Some(action)) => action,
            Ok(None) => return Ok(DispatchOutcome::empty(kind)),
            Err(e) => {
                for handle in &targets {
                    self.record_failure(handle.host(), kind, &e);
                }
                return Err(e);
            }
        };

        let action = &action;
        let results = future::join_all(
            targets
                .iter()
                .map(|handle| async move { (handle.host(), self.run_on(handle, action).await) }),
        )
        .await;

        let mut outcome = DispatchOutcome::empty(kind);
        for (host, result) in results {
            match result {
                Ok(()) => outcome.succeeded.push(host),
                Err(e) => {
                    self.record_failure(host, kind, &e);
                    outcome.failed.push(host);
                }
            }
        }
        Ok(outcome)
    }

    /// Parses the payload and expands playlists. `None` means there is nothing to do.
    async fn prepare(
        &self,
        kind: ActionKind,
        payload: &str,
    ) -> Result<Option<Action>, DispatchError> {
        let action = Action::parse(kind, payload, &self.playback)?;
        let action = match action {
            Action::PlayMedia { url, mime } if is_playlist(&url) => {
                match self.expand(&url).await? {
                    Some(url) => Action::PlayMedia { url, mime },
                    None => return Ok(None),
                }
            }
            Action::Alarm { url } if is_playlist(&url) => match self.expand(&url).await? {
                Some(url) => Action::Alarm { url },
                None => return Ok(None),
            },
            action => action,
        };
        Ok(Some(action))
    }

    async fn expand(&self, url: &str) -> Result<Option<String>, DispatchError> {
        let entry = self.playlists.first_entry(url).await?;
        match &entry {
            Some(first) => info!("Songs [{}]: {}", url, first),
            None => info!("Playlist {} is empty, nothing to play", url),
        }
        Ok(entry)
    }

    async fn run_on(&self, handle: &DeviceHandle, action: &Action) -> Result<(), DeviceError> {
        if let Some((kind, value)) = action.history_record() {
            self.history
                .record(handle.host(), kind, HistoryPayload::Action(value));
        }

        match action {
            Action::Rescan => Ok(()),
            Action::PlayMedia { url, mime } => handle.play_media(url, mime).await,
            Action::Alarm { url } => handle.play_media(url, &self.playback.default_mime).await,
            Action::StopMedia => handle.play_media("", "").await,
            Action::LoadUrl { url } => handle.load_url(url).await,
            Action::SetVolume { level } => handle.set_volume(*level).await,
            Action::QueueNext => handle.queue_next().await,
        }
    }

    fn record_failure(&self, host: IpAddr, kind: ActionKind, error: &dyn fmt::Display) {
        warn!("{} on {} failed: {}", kind, host, error);
        self.history.record(
            host,
            EventKind::CommandError,
            HistoryPayload::Error(format!("{}: {}", kind, error)),
        );
    }
}

impl MessageSink for CommandDispatcher {
    fn deliver<'a>(&'a self, message: &'a InboundMessage) -> BoxFuture<'a, ()> {
        async move {
            if self.handle_message(message).await.is_none() {
                debug!("Nothing done for {}", message.topic());
            }
        }
        .boxed()
    }
}
