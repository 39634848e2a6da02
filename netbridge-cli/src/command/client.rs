//! Client role: dial the server, keep the tunnel alive, serve the local
//! front-end.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use netbridge::proxy::{self, ProxyState};
use netbridge::{Config, Session, SessionOptions, Status};
use tracing::{error, info, warn};

#[derive(Debug, clap::Args)]
pub struct Args {
    #[clap(flatten)]
    pub config: super::ConfigArgs,
}

const INITIAL_BACKOFF_MS: u64 = 1000;
const MAX_BACKOFF_MS: u64 = 60000;
const BACKOFF_MULTIPLIER: f64 = 2.0;

pub async fn execute(config: Config) -> Result<()> {
    let socket_url = config
        .socket_url
        .clone()
        .ok_or_else(|| anyhow!("SOCKET_URL is mandatory for the client role"))?;
    let config = Arc::new(config);
    let state = ProxyState::new(config.clone())?;

    // Local HTTP front-end; requests entering here travel the tunnel.
    let front_end = tokio::spawn(proxy::serve(state.clone()));

    let mut backoff_ms = INITIAL_BACKOFF_MS;
    let mut first_connect = true;

    loop {
        if !first_connect {
            info!(backoff_ms, "reconnecting");
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        }
        first_connect = false;

        match connect_and_run(&socket_url, &config, &state).await {
            Ok(()) => {
                info!("tunnel closed gracefully");
                break;
            }
            Err(err) => {
                error!(error = %err, "tunnel error");
                backoff_ms = ((backoff_ms as f64) * BACKOFF_MULTIPLIER) as u64;
                if backoff_ms > MAX_BACKOFF_MS {
                    backoff_ms = MAX_BACKOFF_MS;
                }
            }
        }
    }

    front_end.abort();
    Ok(())
}

/// One tunnel lifetime: dial, wire the session into the proxy state, then
/// block until Ctrl-C (graceful) or disconnect (error, caller reconnects).
async fn connect_and_run(socket_url: &str, config: &Config, state: &ProxyState) -> Result<()> {
    let options = SessionOptions {
        auth_secret: config.secret.clone(),
        ..config.session.clone()
    };
    let session = Session::dial(socket_url, options).await?;
    state.install_session(session.clone()).await;

    let mut status = session.subscribe_status();
    if session.is_closed() {
        return Err(anyhow!("tunnel disconnected"));
    }
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down tunnel");
                session.close().await;
                return Ok(());
            }
            event = status.recv() => match event {
                Ok(Status::Connected) => {}
                Ok(Status::Error(message)) => warn!(%message, "session error"),
                Ok(Status::Disconnected) | Err(_) => return Err(anyhow!("tunnel disconnected")),
            }
        }
    }
}
