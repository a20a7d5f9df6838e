use crate::socks5::auth::{UserPass, negotiate_auth};
use crate::socks5::commands::handle_socks_request;
use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, copy_bidirectional};
use tracing::info;

/// serve runs the full SOCKS5 protocol flow over one duplex stream:
/// auth negotiation, CONNECT handling, then bidirectional proxying
/// until either side closes
pub async fn serve<S>(mut stream: S, auth_config: Option<Arc<UserPass>>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Negotiate authentication with client
    negotiate_auth(&mut stream, &auth_config).await?;

    // Handle connection request from client
    let mut outbound = handle_socks_request(&mut stream).await?;

    // Proxy
    let (from_client, from_server) = copy_bidirectional(&mut stream, &mut outbound).await?;

    info!(
        "socks5 session closed: {} bytes from client, {} bytes from server",
        from_client, from_server
    );

    Ok(())
}
