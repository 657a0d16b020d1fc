//! Command-line front end for the voice session engine.
//!
//! Connects the real microphone, speaker, and live endpoint to a
//! `SessionController`, starts one tutoring session, and runs until the
//! remote ends it or the user hits ctrl-c.

use anyhow::{Context as _, Result};
use std::sync::Arc;
use tracing::info;
use tutorlive::capture::CpalCapture;
use tutorlive::config::EngineConfig;
use tutorlive::context::ConversationContext;
use tutorlive::controller::SessionController;
use tutorlive::events::SessionState;
use tutorlive::live_api::LiveConnector;
use tutorlive::playback::CpalOutput;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tutorlive=info".into()),
        )
        .init();

    let api_key = std::env::var("GEMINI_API_KEY").context("GEMINI_API_KEY must be set")?;
    let config = EngineConfig::from_api_key(&api_key);

    let subject = std::env::args().nth(1).unwrap_or_else(|| "general study help".to_string());
    let context = ConversationContext::new(&subject);
    info!(%subject, "starting voice session");

    let connector = Arc::new(LiveConnector::new(config.url.clone()));
    let controller = SessionController::new(
        config,
        Arc::new(CpalCapture),
        Arc::new(CpalOutput),
        connector,
    );

    let mut status = controller.status();
    controller.start(context);

    let mut was_active = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = *status.borrow();
                info!(state = ?snapshot.state, audible = snapshot.is_audible, "session status");
                match snapshot.state {
                    SessionState::Error | SessionState::PermissionDenied => break,
                    SessionState::Idle if was_active => break,
                    SessionState::Idle => {}
                    _ => was_active = true,
                }
            }
        }
    }

    controller.stop().await;
    Ok(())
}
