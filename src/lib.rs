//! A multiplexed relay tunnel over websocket
//!
//! Three roles cooperate so that a TCP connection opened on one
//! private network can be serviced by an endpoint reachable only from
//! a second private network, with only outbound connections from both
//! private sides:
//!
//! - [`RelayServer`] (`server-server`) runs on a publicly reachable
//!   host, classifies every inbound websocket by its first control
//!   frame, and pairs entrance-side and exit-side data channels by
//!   serial number.
//! - [`ExitAgent`] (`client-server`) registers a named slot with the
//!   relay over a long-lived command channel, dials the real targets,
//!   and opens data channels back to the relay.
//! - [`EntranceAgent`] (`client-client`) listens on a local TCP port
//!   and tunnels every accepted connection through the relay to the
//!   exit agent behind its slot.
//!
//! Control messages are comma-separated text frames (see
//! [`protocol`]); payload bytes ride binary frames through the
//! byte-stream adapter in [`conn`]. All state is in-memory.
//!
//! # Example
//! ```no_run
//! use wsrelay::RelayServer;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut relay = RelayServer::new("0.0.0.0:8899").with_prefix("/tun");
//!     relay.run().await
//! }
//! ```

pub mod conn;
pub mod entrance;
pub mod exit;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod socks5;

// Re-export main types at crate root for convenience
pub use conn::WsConn;
pub use entrance::EntranceAgent;
pub use exit::ExitAgent;
pub use relay::{RelayHandle, RelayServer};
