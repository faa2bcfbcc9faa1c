//! # sonotag
//!
//! A contactless card carries a short text command (`PLAY <uri>`,
//! `LOCATION <serial>`, `STOP`, `LOCK`) which, once read back, is routed to
//! a playback device discovered on the local network and controlled over its
//! remote-control protocol.
//!
//! The pipeline: encode the command onto the card's data blocks, read it
//! back on the next presentation, parse it, and dispatch it against the
//! registry's active device.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tokio::sync::Mutex;
//! use sonotag::{
//!     AppState, CardSession, ControlClient, Controller, Dispatcher,
//!     FileConfigStore, Registry, web,
//! };
//!
//! #[tokio::main]
//! async fn main() -> sonotag::Result<()> {
//!     let state = AppState::new(CardSession::new(), Registry::new()?);
//!     let config = Arc::new(Mutex::new(FileConfigStore::load("sonotag.toml")));
//!
//!     let dispatcher = Dispatcher::new(
//!         ControlClient::new()?,
//!         state.registry.clone(),
//!         config,
//!     );
//!     let mut controller = Controller::new(state.clone(), reader, dispatcher, "spotify");
//!
//!     web::serve(state, "musicbox", 80).await?;
//!     controller.start().await?;
//!     controller.run().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod manager;
pub mod registry;
pub mod session;
pub mod tag;
pub mod web;

pub use config::{ConfigStore, FileConfigStore, MemoryConfigStore, StoredConfig};
pub use control::{CONTROL_PORT, ControlClient, UNRESOLVED_SERVICE_ID};
pub use dispatch::{DEFAULT_SERVICE_NAME, Dispatcher};
pub use error::Error;
pub use manager::{AppState, Controller};
pub use registry::{DeviceRecord, Registry};
pub use session::{CardSession, CommandSink, PollOutcome};
pub use tag::{BlockAddress, CardKey, CardReader, ChipFamily, DetectedCard, MemoryCard};

/// Result type for sonotag operations.
pub type Result<T> = std::result::Result<T, Error>;
