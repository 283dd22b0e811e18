//! Debug status page.
//!
//! `GET /` shows the bus connection, the registered devices and the history table.
//! `POST /action/{action}/{device}` runs a command through the same path as a bus
//! message; the request body is the argument and the device `_all` targets every device.

use crate::bridge::Bridge;
use crate::command::DispatchOutcome;
use crate::device::DeviceSummary;
use crate::history::{HistoryEntry, StatusFields};
use crate::mqtt::{MQTTStatus, SharedStatus};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::fmt::Write;
use std::sync::{Arc, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Device token meaning "every registered device" in the URL path.
pub const ALL_DEVICES: &str = "_all";

#[derive(Clone)]
struct PageState {
    bridge: Arc<Bridge>,
    bus: SharedStatus,
}

pub fn router(bridge: Arc<Bridge>, bus: SharedStatus) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/action/{action}/{device}", post(action))
        .with_state(PageState { bridge, bus })
}

/// Serves the page on `host:port` until `shutdown` fires.
pub async fn serve(
    bridge: Arc<Bridge>,
    bus: SharedStatus,
    host: &str,
    port: u16,
    shutdown: CancellationToken,
) -> color_eyre::Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!("Status page on http://{}", listener.local_addr()?);

    axum::serve(listener, router(bridge, bus))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Status page stopped");
    Ok(())
}

async fn index(State(state): State<PageState>) -> Html<String> {
    let history = state.bridge.history_snapshot();
    let devices = state.bridge.devices().await;
    let bus = state
        .bus
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    Html(render_page(&history, &devices, &bus))
}

async fn action(
    State(state): State<PageState>,
    Path((action, device)): Path<(String, String)>,
    body: String,
) -> Response {
    let token = if device == ALL_DEVICES { "" } else { device.as_str() };
    debug!("Page request {} for {:?}", action, token);

    match state.bridge.dispatch_named(&action, token, body.trim()).await {
        Ok(outcome) => Json::<DispatchOutcome>(outcome).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// The whole page as one HTML document.
pub fn render_page(history: &[HistoryEntry], devices: &[DeviceSummary], bus: &MQTTStatus) -> String {
    let mut html = String::from(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>mqtt2cast</title></head><body>\n",
    );

    let _ = writeln!(html, "<h1>mqtt2cast</h1>");
    let _ = writeln!(
        html,
        "<p>Bus: {:?}, {} received, {} sent{}</p>",
        bus.connection_state,
        bus.messages_received,
        bus.messages_sent,
        bus.last_error
            .as_deref()
            .map(|e| format!(", last error: {}", escape(e)))
            .unwrap_or_default()
    );

    let _ = writeln!(html, "<h2>Devices</h2>\n<table>");
    let _ = writeln!(html, "<tr><th>Host</th><th>Name</th><th>Model</th><th>State</th></tr>");
    for device in devices {
        let _ = writeln!(
            html,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            device.host,
            escape(&device.name),
            escape(device.model.as_deref().unwrap_or("")),
            device.state
        );
    }
    let _ = writeln!(html, "</table>");

    let _ = writeln!(html, "<h2>History</h2>\n<table>");
    let _ = writeln!(html, "<tr><th>Host</th><th>Event</th><th>Time</th><th>Details</th></tr>");
    for entry in history {
        let details = entry
            .display_fields()
            .into_iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(
            html,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}({})</td></tr>",
            entry.host,
            entry.kind,
            entry.timestamp.format("%y/%m/%d %H:%M:%S"),
            entry.payload.type_name(),
            escape(&details)
        );
    }
    let _ = writeln!(html, "</table>\n</body></html>");
    html
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PlaybackState;
    use crate::history::{EventKind, HistoryPayload};
    use crate::mqtt::ConnectionState;

    #[test]
    fn escapes_markup() {
        assert_eq!(escape("<a href=\"x\">&'"), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;");
        assert_eq!(escape("Kitchen"), "Kitchen");
    }

    #[test]
    fn page_lists_devices_and_history() {
        let devices = vec![DeviceSummary {
            host: "10.0.0.2".parse().unwrap(),
            name: "<Kitchen>".to_string(),
            model: Some("Chromecast Audio".to_string()),
            state: PlaybackState::Playing,
        }];
        let history = vec![HistoryEntry {
            host: "10.0.0.2".parse().unwrap(),
            kind: EventKind::PlayUrl,
            timestamp: chrono::Local::now(),
            payload: HistoryPayload::Action("http://x/a.mp3?a=1&b=2".to_string()),
        }];
        let bus = MQTTStatus {
            connection_state: ConnectionState::Connected,
            messages_received: 3,
            ..Default::default()
        };

        let html = render_page(&history, &devices, &bus);

        assert!(html.contains("Bus: Connected, 3 received, 0 sent</p>"));
        assert!(html.contains("<td>&lt;Kitchen&gt;</td>"));
        assert!(html.contains("<td>playing</td>"));
        assert!(html.contains("<td>play_url</td>"));
        assert!(html.contains("Action(value=&quot;http://x/a.mp3?a=1&amp;b=2&quot;)"));
        assert!(!html.contains("<Kitchen>"));
    }

    #[test]
    fn empty_page_still_renders_tables() {
        let html = render_page(&[], &[], &MQTTStatus::default());
        assert!(html.contains("Bus: Disconnected"));
        assert_eq!(html.matches("<table>").count(), 2);
    }
}
