//! A small SOCKS5 server (RFC 1928, CONNECT only) generic over any
//! `AsyncRead + AsyncWrite` duplex, so a session can ride a plain
//! `TcpStream` or a tunneled data channel equally well. The exit agent
//! drives it with a [`crate::conn::WsConn`] when a target named `s5`
//! is requested.
//!
//! - No-auth and username/password (RFC 1929) negotiation
//! - BIND and UDP ASSOCIATE answer `CommandNotSupported`

pub mod address;
pub mod auth;
pub mod commands;
pub mod protocol;
pub mod server;

// Re-export the entry points at module root for convenience
pub use auth::UserPass;
pub use server::serve;
