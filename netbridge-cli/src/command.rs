pub mod client;
pub mod server;

use std::time::Duration;

use netbridge::{Overrides, Role};

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Run the public-facing tunnel server
    Server(server::Args),

    /// Run the tunnel client behind the firewall
    Client(client::Args),
}

/// Configuration flags shared by both roles; flags override env values.
#[derive(Debug, clap::Args)]
pub struct ConfigArgs {
    /// HTTP listen port (default: 8080 server, 8081 client)
    #[arg(long)]
    pub port: Option<u16>,

    /// WebSocket URL to dial (mandatory for the client role)
    #[arg(long)]
    pub socket_url: Option<String>,

    /// Upstream base URL used by --proxy-type server
    #[arg(long)]
    pub server_url: Option<String>,

    /// Default target host when X-Forwarded-Host is absent
    #[arg(long)]
    pub forwarded_host: Option<String>,

    /// Default target scheme when X-Forwarded-Proto is absent
    #[arg(long)]
    pub forwarded_proto: Option<String>,

    /// Shared auth token (X-Auth-SECRET header / WebSocket Authorization)
    #[arg(long)]
    pub secret: Option<String>,

    /// Comma-separated allow-list entries
    #[arg(long)]
    pub white_list: Option<String>,

    /// Forwarding mode: wss, server, or proxy
    #[arg(long)]
    pub proxy_type: Option<String>,

    /// Seconds to wait for a tunnelled response
    #[arg(long)]
    pub request_timeout: Option<u64>,

    /// Skip outbound TLS certificate verification
    #[arg(long)]
    pub insecure_skip_verify: bool,
}

impl ConfigArgs {
    pub fn to_overrides(&self, role: Role) -> netbridge::Result<Overrides> {
        Ok(Overrides {
            role: Some(role),
            port: self.port,
            socket_url: self.socket_url.clone(),
            server_url: self.server_url.clone(),
            forwarded_host: self.forwarded_host.clone(),
            forwarded_proto: self.forwarded_proto.clone(),
            secret: self.secret.clone(),
            white_list: self.white_list.as_deref().map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|entry| !entry.is_empty())
                    .map(str::to_string)
                    .collect()
            }),
            proxy_mode: self.proxy_type.as_deref().map(str::parse).transpose()?,
            request_timeout: self.request_timeout.map(Duration::from_secs),
            insecure_skip_verify: self.insecure_skip_verify.then_some(true),
            ..Overrides::default()
        })
    }
}
