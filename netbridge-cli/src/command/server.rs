//! Server role: public HTTP front-end plus the tunnel upgrade endpoint.

use std::sync::Arc;

use anyhow::Result;
use netbridge::proxy::{self, ProxyState};
use netbridge::Config;
use tracing::info;

#[derive(Debug, clap::Args)]
pub struct Args {
    #[clap(flatten)]
    pub config: super::ConfigArgs,
}

pub async fn execute(config: Config) -> Result<()> {
    let state = ProxyState::new(Arc::new(config))?;

    tokio::select! {
        result = proxy::serve(state) => result.map_err(Into::into),
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}
