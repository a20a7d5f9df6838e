use crate::conn;
use crate::protocol::Command;
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info};

/// EntranceAgent listens on a local TCP port and tunnels every accepted
/// connection through the relay to the exit agent registered under its
/// slot. Serial numbers are namespaced by slot name so several
/// entrances can share one slot without colliding.
pub struct EntranceAgent {
    pub listen_addr: String,
    relay_url: String,
    slot: String,
    target: String,
    serial_seed: AtomicU64,
    listener: Option<TcpListener>,
}

/// EntranceAgent implementation block
impl EntranceAgent {
    /// new is a constructor for the EntranceAgent type
    pub fn new(
        listen_addr: impl Into<String>,
        relay_url: impl Into<String>,
        slot: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            relay_url: relay_url.into(),
            slot: slot.into(),
            target: target.into(),
            serial_seed: AtomicU64::new(0),
            listener: None,
        }
    }

    /// bind to the listen address, panics when called twice
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if self.listener.is_some() {
            panic!("bind can only be called once");
        }

        let listener = TcpListener::bind(&self.listen_addr).await?;
        let addr = listener.local_addr()?;

        info!(
            "entrance listening on {addr}, slot [{}] -> {}",
            self.slot, self.target
        );

        self.listener = Some(listener);
        Ok(addr)
    }

    /// run handles spinup and tunnels incoming connections
    pub async fn run(&mut self) -> Result<()> {
        if self.listener.is_none() {
            self.bind().await?;
        }
        let listener = self.listener.take().unwrap();

        loop {
            let (inbound, peer_addr) = listener.accept().await?;

            let seq = self.serial_seed.fetch_add(1, Ordering::Relaxed) + 1;
            let serial = format!("{}-{seq}", self.slot);

            let request = Command::Tunnel {
                slot: self.slot.clone(),
                serial: serial.clone(),
                target: self.target.clone(),
            };
            let relay_url = self.relay_url.clone();

            tokio::spawn(async move {
                info!("new client: {peer_addr}, serial [{serial}]");
                tunnel_connection(inbound, relay_url, request, serial).await;
            });
        }
    }
}

/// tunnel_connection opens a client-data channel for one accepted
/// connection and bridges the two until either side closes. A refused
/// or failed handshake just drops the local connection, no retry.
async fn tunnel_connection(
    mut inbound: TcpStream,
    relay_url: String,
    request: Command,
    serial: String,
) {
    let mut data = match conn::connect(&relay_url, &request.to_string()).await {
        Ok(data) => data,
        Err(e) => {
            error!("tunnel for [{serial}] failed: {e}");
            return;
        }
    };

    match copy_bidirectional(&mut inbound, &mut data).await {
        Ok((sent, received)) => {
            info!("tunnel [{serial}] closed: {sent} bytes sent, {received} bytes received")
        }
        Err(e) => info!("tunnel [{serial}] closed: {e}"),
    }
    data.close().await;
}
