//! Environment-driven configuration with caller overrides.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::session::SessionOptions;

/// Which end of the tunnel this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "server" => Ok(Role::Server),
            "client" => Ok(Role::Client),
            other => Err(Error::Config(format!("unknown tunnel type '{other}'"))),
        }
    }
}

/// How the front-end forwards an inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    /// Route through the WebSocket tunnel (default).
    Wss,
    /// Forward directly to the configured `SERVER_URL`.
    Server,
    /// Forward directly to the `X-Forwarded-*` target.
    Proxy,
}

impl FromStr for ProxyMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "wss" => Ok(ProxyMode::Wss),
            "server" => Ok(ProxyMode::Server),
            "proxy" => Ok(ProxyMode::Proxy),
            other => Err(Error::Config(format!("unknown proxy type '{other}'"))),
        }
    }
}

/// Logging knobs, consumed by the CLI when installing the subscriber.
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub level: String,
    pub json: bool,
    pub file: Option<PathBuf>,
}

/// Resolved configuration. Values come from the environment (after a
/// best-effort `.env` load), with caller overrides taking precedence.
#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub port: u16,
    /// WebSocket URL the client dials. Mandatory for the client role.
    pub socket_url: Option<String>,
    /// Upstream base URL used by `ProxyMode::Server`.
    pub server_url: Option<String>,
    /// Default target host when the caller sends no `X-Forwarded-Host`.
    pub forwarded_host: Option<String>,
    /// Default target scheme when the caller sends no `X-Forwarded-Proto`.
    pub forwarded_proto: Option<String>,
    pub ssl_cert_file: Option<PathBuf>,
    pub ssl_key_file: Option<PathBuf>,
    pub request_ca_file: Option<PathBuf>,
    pub insecure_skip_verify: bool,
    pub secret: Option<String>,
    pub white_list: Vec<String>,
    pub proxy_mode: ProxyMode,
    /// Bounds both the outbound HTTP client and the front-end's wait for a
    /// tunnelled response.
    pub request_timeout: Duration,
    pub log: LogOptions,
    pub session: SessionOptions,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            role: Role::Client,
            port: 8081,
            socket_url: None,
            server_url: None,
            forwarded_host: None,
            forwarded_proto: None,
            ssl_cert_file: None,
            ssl_key_file: None,
            request_ca_file: None,
            insecure_skip_verify: false,
            secret: None,
            white_list: Vec::new(),
            proxy_mode: ProxyMode::Wss,
            request_timeout: Duration::from_secs(30),
            log: LogOptions {
                level: "info".to_string(),
                json: false,
                file: None,
            },
            session: SessionOptions::default(),
        }
    }
}

/// Partial configuration; unset fields fall back to the next source.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub role: Option<Role>,
    pub port: Option<u16>,
    pub socket_url: Option<String>,
    pub server_url: Option<String>,
    pub forwarded_host: Option<String>,
    pub forwarded_proto: Option<String>,
    pub ssl_cert_file: Option<PathBuf>,
    pub ssl_key_file: Option<PathBuf>,
    pub request_ca_file: Option<PathBuf>,
    pub insecure_skip_verify: Option<bool>,
    pub secret: Option<String>,
    pub white_list: Option<Vec<String>>,
    pub proxy_mode: Option<ProxyMode>,
    pub request_timeout: Option<Duration>,
    pub log_level: Option<String>,
    pub log_json: Option<bool>,
    pub log_file: Option<PathBuf>,
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Overrides {
    /// Snapshot the process environment into an override set.
    pub fn from_env() -> Result<Self> {
        let port = match var("PORT") {
            Some(raw) => Some(
                raw.parse::<u16>()
                    .map_err(|_| Error::Config(format!("PORT '{raw}' is not a valid port")))?,
            ),
            None => None,
        };
        let request_timeout = match var("REQUEST_TIMEOUT") {
            Some(raw) => Some(Duration::from_secs(raw.parse::<u64>().map_err(|_| {
                Error::Config(format!("REQUEST_TIMEOUT '{raw}' is not a number of seconds"))
            })?)),
            None => None,
        };

        Ok(Overrides {
            role: var("TUNNEL_TYPE").map(|v| v.parse()).transpose()?,
            port,
            socket_url: var("SOCKET_URL"),
            server_url: var("SERVER_URL"),
            forwarded_host: var("X_FORWARDED_HOST"),
            forwarded_proto: var("X_FORWARDED_PROTO"),
            ssl_cert_file: var("SSL_CERT_FILE").map(PathBuf::from),
            ssl_key_file: var("SSL_KEY_FILE").map(PathBuf::from),
            request_ca_file: var("REQUEST_CA_FILE").map(PathBuf::from),
            insecure_skip_verify: var("INSECURE_SKIP_VERIFY").map(|v| v == "true"),
            secret: var("SECRET"),
            white_list: var("WHITE_LIST").map(|v| split_list(&v)),
            proxy_mode: var("PROXY_TYPE").map(|v| v.parse()).transpose()?,
            request_timeout,
            log_level: var("LOG_LEVEL"),
            log_json: var("LOG_JSON").map(|v| v == "true"),
            log_file: var("LOG_FILE").map(PathBuf::from),
        })
    }
}

impl Config {
    /// Load `.env`, snapshot the environment, and resolve with `user` on top.
    pub fn load(user: Overrides) -> Result<Config> {
        dotenvy::dotenv().ok();
        Config::resolve(Overrides::from_env()?, user)
    }

    /// Merge two override layers into a validated configuration.
    /// `user` wins over `env`; defaults fill the rest.
    pub fn resolve(env: Overrides, user: Overrides) -> Result<Config> {
        let defaults = Config::default();
        let role = user.role.or(env.role).unwrap_or(defaults.role);
        let port = user.port.or(env.port).unwrap_or(match role {
            Role::Server => 8080,
            Role::Client => 8081,
        });

        let config = Config {
            role,
            port,
            socket_url: user.socket_url.or(env.socket_url),
            server_url: user.server_url.or(env.server_url),
            forwarded_host: user.forwarded_host.or(env.forwarded_host),
            forwarded_proto: user.forwarded_proto.or(env.forwarded_proto),
            ssl_cert_file: user.ssl_cert_file.or(env.ssl_cert_file),
            ssl_key_file: user.ssl_key_file.or(env.ssl_key_file),
            request_ca_file: user.request_ca_file.or(env.request_ca_file),
            insecure_skip_verify: user
                .insecure_skip_verify
                .or(env.insecure_skip_verify)
                .unwrap_or(false),
            secret: user.secret.or(env.secret),
            white_list: user.white_list.or(env.white_list).unwrap_or_default(),
            proxy_mode: user
                .proxy_mode
                .or(env.proxy_mode)
                .unwrap_or(defaults.proxy_mode),
            request_timeout: user
                .request_timeout
                .or(env.request_timeout)
                .unwrap_or(defaults.request_timeout),
            log: LogOptions {
                level: user
                    .log_level
                    .or(env.log_level)
                    .unwrap_or_else(|| defaults.log.level.clone()),
                json: user.log_json.or(env.log_json).unwrap_or(false),
                file: user.log_file.or(env.log_file),
            },
            session: defaults.session,
        };

        if config.role == Role::Client && config.socket_url.is_none() {
            return Err(Error::Config(
                "SOCKET_URL is mandatory for the client role".to_string(),
            ));
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_env() -> Overrides {
        Overrides {
            socket_url: Some("ws://localhost:8080/_ws".to_string()),
            ..Overrides::default()
        }
    }

    #[test]
    fn defaults_fill_unset_fields() {
        let config = Config::resolve(client_env(), Overrides::default()).unwrap();
        assert_eq!(config.role, Role::Client);
        assert_eq!(config.port, 8081);
        assert_eq!(config.proxy_mode, ProxyMode::Wss);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn server_role_changes_default_port() {
        let env = Overrides {
            role: Some(Role::Server),
            ..Overrides::default()
        };
        let config = Config::resolve(env, Overrides::default()).unwrap();
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn user_overrides_win_over_env() {
        let env = Overrides {
            port: Some(9000),
            secret: Some("from-env".to_string()),
            ..client_env()
        };
        let user = Overrides {
            port: Some(9001),
            secret: Some("from-user".to_string()),
            ..Overrides::default()
        };
        let config = Config::resolve(env, user).unwrap();
        assert_eq!(config.port, 9001);
        assert_eq!(config.secret.as_deref(), Some("from-user"));
    }

    #[test]
    fn client_without_socket_url_is_rejected() {
        let err = Config::resolve(Overrides::default(), Overrides::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn white_list_splits_and_trims() {
        assert_eq!(
            split_list("api.allowed.test, 10.0.0., ,"),
            vec!["api.allowed.test".to_string(), "10.0.0.".to_string()]
        );
    }

    #[test]
    fn unknown_enum_values_are_rejected() {
        assert!("gateway".parse::<Role>().is_err());
        assert!("tcp".parse::<ProxyMode>().is_err());
        assert_eq!("server".parse::<Role>().unwrap(), Role::Server);
        assert_eq!("proxy".parse::<ProxyMode>().unwrap(), ProxyMode::Proxy);
    }
}
