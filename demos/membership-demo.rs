//! Minimal end-to-end wiring of the Membership Manager against a toy,
//! in-process server. Since `matrixrtc_membership` only ever consumes an
//! already-authenticated `matrix_sdk::Room` (account login is out of
//! scope), this demo stands in its own small `ClientFacade` rather than
//! performing a real login, the way `echo-bot.rs` demonstrated
//! matrixbot-ezlogin by running against a real homeserver session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::Result;
use matrixrtc_membership::{
    ClientFacade, Config, DelayedEventAction, FacadeError, Manager, SystemClock,
};
use serde_json::Value as JsonValue;
use tracing::info;
use tracing_subscriber::{EnvFilter, prelude::*};

#[derive(clap::Parser)]
struct Args {
    #[clap(long, default_value = "@alice:example.org")]
    user_id: String,
    #[clap(long, default_value = "DEMO_DEVICE")]
    device_id: String,
    #[clap(long, default_value_t = 8)]
    run_seconds: u64,
}

/// A toy server: every call succeeds after a small simulated round-trip,
/// printing what would have been sent over the wire.
struct ToyServerFacade {
    user_id: String,
    device_id: String,
    next_delay_id: AtomicU64,
}

#[async_trait::async_trait]
impl ClientFacade for ToyServerFacade {
    fn user_id(&self) -> std::result::Result<String, FacadeError> {
        Ok(self.user_id.clone())
    }

    fn device_id(&self) -> std::result::Result<String, FacadeError> {
        Ok(self.device_id.clone())
    }

    fn room_version(&self) -> String {
        "11".to_owned()
    }

    async fn send_state_event(
        &self,
        event_type: &str,
        state_key: &str,
        content: JsonValue,
    ) -> std::result::Result<(), FacadeError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        info!(event_type, state_key, %content, "sent state event");
        Ok(())
    }

    async fn send_delayed_state_event(
        &self,
        delay_ms: u64,
        event_type: &str,
        state_key: &str,
        _content: JsonValue,
    ) -> std::result::Result<String, FacadeError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let delay_id = self.next_delay_id.fetch_add(1, Ordering::SeqCst).to_string();
        info!(event_type, state_key, delay_ms, delay_id, "registered scheduled leave");
        Ok(delay_id)
    }

    async fn update_delayed_event(
        &self,
        delay_id: &str,
        action: DelayedEventAction,
    ) -> std::result::Result<(), FacadeError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        info!(delay_id, ?action, "updated scheduled leave");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::registry()
        .with(tracing_error::ErrorLayer::default())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,membership_demo=debug")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Args = clap::Parser::parse();

    let facade = Arc::new(ToyServerFacade {
        user_id: args.user_id.clone(),
        device_id: args.device_id.clone(),
        next_delay_id: AtomicU64::new(0),
    });

    let mut config = Config::default();
    config.membership_event_expiry_ms = 60_000;
    config.delayed_leave_event_delay_ms = 4_000;
    config.delayed_leave_event_restart_ms = 2_000;

    let (manager, _task) = Manager::spawn(
        facade,
        SystemClock,
        config,
        args.user_id,
        args.device_id,
        "11".to_owned(),
        String::new(),
        Vec::new(),
    );

    info!("joining session");
    manager.join();

    tokio::time::sleep(Duration::from_secs(args.run_seconds)).await;

    info!("leaving session");
    let left = manager.leave(Some(5_000)).await;
    info!(left, "left session");

    Ok(())
}
