//! Wiring and the cooperative control loop.
//!
//! [`AppState`] holds the pieces shared between the loop and the control
//! panel; the [`Controller`] runs startup (initial discovery, service-id
//! resolution, stored-location restore) and then the steady-state loop of
//! card polls and periodic re-discovery. All mutating access to the registry
//! and the card session is serialized through the `AppState` mutexes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::Result;
use crate::config::ConfigStore;
use crate::dispatch::Dispatcher;
use crate::registry::{DEFAULT_DISCOVERY_WINDOW, Registry};
use crate::session::CardSession;
use crate::tag::CardReader;

/// How often the registry is refreshed with a new discovery round.
pub const DISCOVER_PERIOD: Duration = Duration::from_secs(2 * 60);

/// Delay between card polls.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// State shared between the control loop and the control panel.
///
/// The inner handles are independently cloneable so the dispatcher can hold
/// its own reference to the registry.
pub struct AppState {
    pub session: Arc<Mutex<CardSession>>,
    pub registry: Arc<Mutex<Registry>>,
}

impl AppState {
    pub fn new(session: CardSession, registry: Registry) -> Arc<Self> {
        Arc::new(Self {
            session: Arc::new(Mutex::new(session)),
            registry: Arc::new(Mutex::new(registry)),
        })
    }
}

/// Owns the reader and dispatcher and drives the main loop.
pub struct Controller<R: CardReader, C: ConfigStore> {
    state: Arc<AppState>,
    reader: R,
    dispatcher: Dispatcher<C>,
    service_name: String,
    last_discovery: Instant,
}

impl<R: CardReader, C: ConfigStore + Send> Controller<R, C> {
    pub fn new(
        state: Arc<AppState>,
        reader: R,
        dispatcher: Dispatcher<C>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            state,
            reader,
            dispatcher,
            service_name: service_name.into(),
            last_discovery: Instant::now(),
        }
    }

    /// Run the startup sequence: one discovery round, service-id
    /// resolution, and re-selection of the stored device.
    pub async fn start(&mut self) -> Result<()> {
        info!("starting up");

        {
            let mut registry = self.state.registry.lock().await;
            registry.discover(DEFAULT_DISCOVERY_WINDOW).await?;
        }
        self.last_discovery = Instant::now();

        self.dispatcher.resolve_service(&self.service_name).await;
        self.dispatcher.restore_stored_location().await;

        info!("startup completed");
        Ok(())
    }

    /// Run the steady-state loop; never returns.
    pub async fn run(&mut self) {
        loop {
            {
                let mut session = self.state.session.lock().await;
                session.poll(&mut self.reader, &mut self.dispatcher).await;
            }

            // Normally a location change is persisted by the LOCATION
            // handler itself; this catches selections made elsewhere.
            self.dispatcher.sync_stored_location().await;

            if self.last_discovery.elapsed() >= DISCOVER_PERIOD {
                self.last_discovery += DISCOVER_PERIOD;
                info!("running periodic discovery");
                let mut registry = self.state.registry.lock().await;
                if let Err(e) = registry.discover(DEFAULT_DISCOVERY_WINDOW).await {
                    warn!(error = %e, "periodic discovery failed");
                }
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
