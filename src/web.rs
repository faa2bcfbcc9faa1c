//! HTTP control panel.
//!
//! A small axum API over the shared [`AppState`]: submit or cancel a card
//! write, list discovered devices, and serve the embedded control page.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::Html,
    routing::get,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::manager::AppState;
use crate::registry::DEFAULT_DISCOVERY_WINDOW;

const CONTROL_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>sonotag</title></head>
<body>
<h1>sonotag</h1>
<form action="/write">
  <input type="hidden" name="type" value="PLAY">
  <label>Track URI <input name="url"></label>
  <button>Write PLAY card</button>
</form>
<form action="/write">
  <input type="hidden" name="type" value="LOCATION">
  <label>Serial <input name="location"></label>
  <button>Write LOCATION card</button>
</form>
<p>
  <a href="/write?type=STOP">Write STOP card</a> |
  <a href="/write?type=LOCK">Write LOCK card</a> |
  <a href="/writecancel">Cancel pending write</a> |
  <a href="/locations">Devices</a>
</p>
</body>
</html>
"#;

#[derive(Clone)]
struct PanelState {
    app: Arc<AppState>,
    name: Arc<str>,
}

#[derive(Debug, Deserialize)]
struct WriteQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
    url: Option<String>,
    location: Option<String>,
}

/// Build the control-panel router over the shared state.
pub fn router(app: Arc<AppState>, name: &str) -> Router {
    let state = PanelState {
        app,
        name: name.into(),
    };

    Router::new()
        .route("/", get(handle_root))
        .route("/write", get(handle_write))
        .route("/writecancel", get(handle_write_cancel))
        .route("/locations", get(handle_locations))
        .route("/name", get(handle_name))
        .with_state(state)
}

/// Bind the control panel and serve it from a background task.
///
/// Returns the bound address; pass port 0 for automatic selection.
pub async fn serve(app: Arc<AppState>, name: &str, port: u16) -> Result<SocketAddr> {
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    let local_addr = listener.local_addr()?;

    info!(addr = %local_addr, "control panel listening");

    let panel = router(app, name);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, panel).await {
            error!(error = %e, "control panel server error");
        }
    });

    Ok(local_addr)
}

async fn handle_root() -> Html<&'static str> {
    Html(CONTROL_PAGE)
}

async fn handle_write(
    State(state): State<PanelState>,
    Query(query): Query<WriteQuery>,
) -> StatusCode {
    let command = match query.kind.as_deref() {
        Some("PLAY") => query.url.map(|url| format!("PLAY {url}")),
        Some("LOCATION") => query.location.map(|serial| format!("LOCATION {serial}")),
        Some("STOP") => Some("STOP".to_string()),
        Some("LOCK") => Some("LOCK".to_string()),
        _ => None,
    };

    match command {
        Some(command) => {
            debug!(%command, "submitting card write");
            state
                .app
                .session
                .lock()
                .await
                .submit_write(command.into_bytes());
            StatusCode::OK
        }
        None => {
            warn!(kind = ?query.kind, "invalid write request");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn handle_write_cancel(State(state): State<PanelState>) -> StatusCode {
    state.app.session.lock().await.cancel_write();
    StatusCode::OK
}

/// Refresh discovery, then list devices as a serial → room-name map.
async fn handle_locations(State(state): State<PanelState>) -> Json<BTreeMap<String, String>> {
    let mut registry = state.app.registry.lock().await;

    if let Err(e) = registry.discover(DEFAULT_DISCOVERY_WINDOW).await {
        warn!(error = %e, "discovery for /locations failed");
    }

    let locations = registry
        .devices()
        .iter()
        .map(|d| (d.serial.clone(), d.room_name.clone()))
        .collect();

    Json(locations)
}

async fn handle_name(State(state): State<PanelState>) -> String {
    state.name.to_string()
}
