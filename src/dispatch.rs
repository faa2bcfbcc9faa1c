//! Command parsing and routing.
//!
//! A card carries a short ASCII command, `VERB` or `VERB ARGUMENT`. The
//! [`Dispatcher`] splits the buffer at the first space and routes the verb
//! to the registry or the control client. It owns the lock gate: while
//! locked, every command except `LOCK` itself is a no-op.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ConfigStore;
use crate::control::{ControlClient, UNRESOLVED_SERVICE_ID};
use crate::registry::Registry;
use crate::session::CommandSink;

/// The one music service currently supported for `PLAY` URIs.
pub const DEFAULT_SERVICE_NAME: &str = "spotify";

/// Routes card commands to the registry and control client.
pub struct Dispatcher<C: ConfigStore> {
    control: ControlClient,
    registry: Arc<Mutex<Registry>>,
    config: Arc<Mutex<C>>,
    service_id: i32,
    locked: bool,
}

impl<C: ConfigStore> Dispatcher<C> {
    pub fn new(
        control: ControlClient,
        registry: Arc<Mutex<Registry>>,
        config: Arc<Mutex<C>>,
    ) -> Self {
        Self {
            control,
            registry,
            config,
            service_id: UNRESOLVED_SERVICE_ID,
            locked: false,
        }
    }

    /// Whether the lock gate is currently set.
    pub fn locked(&self) -> bool {
        self.locked
    }

    pub fn service_id(&self) -> i32 {
        self.service_id
    }

    /// Resolve the music-service id against the active device. Done once at
    /// startup; `PLAY` uses the cached id from then on.
    pub async fn resolve_service(&mut self, service_name: &str) {
        let registry = self.registry.lock().await;
        self.service_id = self
            .control
            .resolve_service_id(registry.active(), service_name)
            .await;
    }

    /// Re-select the device stored in config, if any.
    pub async fn restore_stored_location(&self) {
        let serial = self.config.lock().await.current_serial().to_string();
        if serial.is_empty() {
            return;
        }
        info!(%serial, "using last stored device");
        let mut registry = self.registry.lock().await;
        if !registry.select_active(&serial) {
            info!(%serial, "stored device not discovered yet");
        }
    }

    /// Persist the active device's serial when it differs from the stored
    /// one. Harmless to call when nothing changed.
    pub async fn sync_stored_location(&self) {
        let registry = self.registry.lock().await;
        let Some(active) = registry.active() else {
            return;
        };

        let mut config = self.config.lock().await;
        if config.current_serial() != active.serial {
            info!(serial = %active.serial, "saving location change");
            if let Err(e) = config.persist(&active.serial) {
                warn!(error = %e, "failed to persist location change");
            }
        }
    }

    async fn handle_play(&self, uri: &str) {
        info!(uri, "PLAY command");
        let registry = self.registry.lock().await;
        let device = registry.active();
        self.control.queue_uri(device, self.service_id, uri).await;
        self.control.play(device).await;
    }

    async fn handle_location(&self, serial: &str) {
        info!(serial, "LOCATION command");
        let selected = {
            let mut registry = self.registry.lock().await;
            registry.select_active(serial)
        };
        if selected {
            self.sync_stored_location().await;
        }
    }

    async fn handle_stop(&self) {
        info!("STOP command");
        let registry = self.registry.lock().await;
        self.control.stop(registry.active()).await;
    }

    fn handle_lock(&mut self) {
        self.locked = !self.locked;
        info!(
            state = if self.locked { "LOCKED" } else { "UNLOCKED" },
            "LOCK command"
        );
    }
}

impl<C: ConfigStore + Send> CommandSink for Dispatcher<C> {
    async fn handle_command(&mut self, card_uid: &[u8], payload: &[u8]) {
        // Card content is zero-padded out to the read length.
        let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
        let text = String::from_utf8_lossy(&payload[..end]);

        debug!(uid = ?card_uid, command = %text, "card command received");

        let (verb, argument) = match text.split_once(' ') {
            Some((verb, argument)) if !argument.is_empty() => (verb, Some(argument)),
            Some((verb, _)) => (verb, None),
            None => (text.as_ref(), None),
        };

        match (verb, argument) {
            ("LOCK", _) => self.handle_lock(),
            _ if self.locked => debug!(verb, "locked, ignoring command"),
            ("PLAY", Some(uri)) => self.handle_play(uri).await,
            ("LOCATION", Some(serial)) => self.handle_location(serial).await,
            ("STOP", _) => self.handle_stop().await,
            _ => debug!(verb, "unrecognized command"),
        }
    }
}
