//! Virtual-card walkthrough.
//!
//! Drives the whole pipeline (encode a command onto a card, read it back,
//! dispatch it) against an in-memory card, with no reader hardware and no
//! players on the network.
//!
//! Run with: RUST_LOG=sonotag=debug cargo run --example virtual_card

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::info;

use sonotag::{
    AppState, CardSession, ControlClient, Dispatcher, MemoryCard, MemoryConfigStore, Registry, web,
};

#[tokio::main]
async fn main() -> sonotag::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("sonotag=info,virtual_card=info")
            }),
        )
        .init();

    let state = AppState::new(CardSession::new(), Registry::new()?);
    let config = Arc::new(Mutex::new(MemoryConfigStore::default()));
    let mut dispatcher = Dispatcher::new(ControlClient::new()?, state.registry.clone(), config);

    let panel_addr = web::serve(state.clone(), "musicbox", 0).await?;
    info!(addr = %panel_addr, "control panel up");

    // One short discovery round; with no players on the network this simply
    // reports zero new devices.
    let found = {
        let mut registry = state.registry.lock().await;
        registry.discover(Duration::from_millis(500)).await?
    };
    info!(found, "discovery round finished");

    let mut card = MemoryCard::classic_1k(&[0xDE, 0xAD, 0xBE, 0xEF]);

    // Write a LOCK card and present it.
    {
        let mut session = state.session.lock().await;
        session.submit_write(b"LOCK".to_vec());
        card.present();
        let outcome = session.poll(&mut card, &mut dispatcher).await;
        info!(?outcome, "card written");
    }

    // Present the card again: the command is read back and dispatched,
    // toggling the lock gate.
    {
        let mut session = state.session.lock().await;
        card.present();
        let outcome = session.poll(&mut card, &mut dispatcher).await;
        info!(?outcome, locked = dispatcher.locked(), "card read");
    }

    // A PLAY card while locked is a no-op; unlock and try again, which then
    // fails softly because no device is active.
    {
        let mut session = state.session.lock().await;
        for command in ["PLAY spotify:track:4uLU6hMCjMI75M1A2tKUQC", "LOCK"] {
            session.submit_write(command.as_bytes().to_vec());
            card.present();
            session.poll(&mut card, &mut dispatcher).await;
            card.present();
            session.poll(&mut card, &mut dispatcher).await;
        }
        session.submit_write(b"PLAY spotify:track:4uLU6hMCjMI75M1A2tKUQC".to_vec());
        card.present();
        session.poll(&mut card, &mut dispatcher).await;
        card.present();
        session.poll(&mut card, &mut dispatcher).await;
    }

    info!(locked = dispatcher.locked(), "walkthrough finished");
    Ok(())
}
