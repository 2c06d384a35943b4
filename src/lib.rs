//! A SOCKS5 relay core
//!
//! ## SOCKS5 Implementation
//!
//! - Features:
//!     - CONNECT over IPv4
//!     - No Authentication
//!     - Username/Password Authentication
//!     - Sans-IO client and server state machines
//!     - Session table with handle indices, per-target limits and statistics
//!     - Lookup of established upstream sessions by destination
//!     - Time-out based session reaping
//!     - Async relay runtime using tokio
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use socks_relay::{Relay, RelayConfig, SessionTable, auth::UserPass};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let table = Arc::new(SessionTable::new(RelayConfig::default())?);
//!     let mut relay = Relay::new("127.0.0.1:1080", table)
//!         .with_auth(Some(UserPass::new("alice", "wonder")));
//!     relay.run().await
//! }
//! ```

pub mod address;
pub mod auth;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;
pub mod stats;
pub mod table;

// Re-export main types at crate root for convenience
pub use auth::UserPass;
pub use codec::{CodecError, Decoded};
pub use config::{Endpoint, ProxyProtocol, RelayConfig, TargetId};
pub use error::{Error, Result};
pub use protocol::{AuthMethod, Command, ReplyCode, Version};
pub use relay::Relay;
pub use session::{Handle, Progress, Role, Session, SessionId, SessionState};
pub use stats::{ServerStatsSnapshot, TargetStats};
pub use table::SessionTable;
