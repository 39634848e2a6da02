//! Bidirectional HTTP reverse tunnel over a single WebSocket.
//!
//! A publicly reachable **server** exposes an HTTP endpoint and forwards
//! each inbound request over a persistent WebSocket to a **client** behind
//! NAT; the client performs the request against an origin it can reach and
//! streams the response back. Both roles run the same machinery — a
//! [`session::Session`] carrying framed messages, a [`correlator::Correlator`]
//! matching responses to in-flight requests, an [`executor::RequestExecutor`]
//! serving the peer's requests, and a [`proxy`] front-end feeding the tunnel.

pub mod config;
pub mod correlator;
pub mod error;
pub mod executor;
pub mod protocol;
pub mod proxy;
pub mod router;
pub mod session;

pub use config::{Config, LogOptions, Overrides, ProxyMode, Role};
pub use error::{Error, Result, WaitError};
pub use protocol::{Message, Topic};
pub use router::Status;
pub use session::{Session, SessionOptions};
