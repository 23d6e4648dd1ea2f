//! Hearth sync entry point: sign in, keep the cache live, log what changes.

use hearth_core::Domain;
use hearth_sync::config::SyncConfig;
use hearth_sync::error::{SyncError, SyncResult};
use hearth_sync::telemetry;
use hearth_sync::{ChannelState, HouseholdClient};
use std::sync::Arc;
use tracing::{error, info};

const EMAIL_ENV: &str = "HEARTH_EMAIL";
const PASSWORD_ENV: &str = "HEARTH_PASSWORD";

#[tokio::main(flavor = "current_thread")]
async fn main() -> SyncResult<()> {
    let config = SyncConfig::load()?;
    if let Err(err) = telemetry::init_tracing(&config.logging) {
        eprintln!("{}", err);
    }

    let client = Arc::new(HouseholdClient::new(&config)?);
    let tasks = client.start();

    let email = std::env::var(EMAIL_ENV)
        .map_err(|_| SyncError::InvalidLogin(format!("{} is not set", EMAIL_ENV)))?;
    let password = std::env::var(PASSWORD_ENV)
        .map_err(|_| SyncError::InvalidLogin(format!("{} is not set", PASSWORD_ENV)))?;

    match client.login(&email, &password).await {
        Ok(Some(report)) => info!(
            failed = ?report.failed_domains(),
            "Initial load finished"
        ),
        Ok(None) => info!("Signed in without a household"),
        Err(err) => {
            error!(error = %err, "Login failed");
            tasks.abort();
            return Err(err);
        }
    }
    log_summary(&client);

    let mut state_rx = client.realtime().watch_state();
    let mut last_loaded = None;
    loop {
        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *state_rx.borrow_and_update();
                info!(state = %state, "Realtime state");
                if state == ChannelState::Connected {
                    log_summary(&client);
                }
            }
            _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {
                let loaded = client.cache().select(|s| s.loaded_at);
                if loaded != last_loaded {
                    last_loaded = loaded;
                    log_summary(&client);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    client.logout();
    tasks.abort();
    Ok(())
}

fn log_summary(client: &HouseholdClient) {
    client.cache().select(|snapshot| {
        for domain in Domain::ALL {
            info!(domain = %domain, count = snapshot.len(domain), "Cached");
        }
    });
}
