use crate::conn::{self, ClientConn};
use crate::protocol::{CODE_DIAL_FAILED, Command, Reply, SOCKS5_TARGET};
use crate::socks5;
use anyhow::{Result, bail};
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tracing::{error, info, warn};

/// ExitAgent registers one slot with the relay over a long-lived
/// command channel and services relayed connection requests: for each
/// `server-data` command it dials the real target (or serves it through
/// the embedded SOCKS5 server) and opens a fresh data channel back to
/// the relay carrying the resulting bytes.
pub struct ExitAgent {
    pub relay_url: String,
    pub slot: String,
}

/// ExitAgent implementation block
impl ExitAgent {
    /// new is a constructor for the ExitAgent type
    pub fn new(relay_url: impl Into<String>, slot: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            slot: slot.into(),
        }
    }

    /// run registers the slot and serves command-channel requests until
    /// the channel dies. No automatic re-registration happens here;
    /// restarting a dead agent is the operator's job.
    pub async fn run(&self) -> Result<()> {
        let register = Command::Register {
            slot: self.slot.clone(),
        };
        let mut chan = conn::connect(&self.relay_url, &register.to_string()).await?;
        info!("registered slot [{}] at {}", self.slot, self.relay_url);

        loop {
            let Some(msg) = chan.recv_text().await? else {
                bail!("command channel closed by relay");
            };

            match Command::parse(&msg) {
                Some(Command::Heartbeat) => {
                    chan.send_text(&Reply::Ok.to_string()).await?;
                }
                Some(Command::Dial { serial, target }) => {
                    self.handle_dial(&mut chan, serial, target).await?;
                }
                _ => {
                    warn!("invalid command on channel: [{msg}]");
                }
            }
        }
    }

    /// handle_dial answers one relayed connection request. The reply
    /// goes out on the command channel before the data channel is
    /// opened, so the relay's slot loop is never blocked on the dial's
    /// data path.
    async fn handle_dial(&self, chan: &mut ClientConn, serial: String, target: String) -> Result<()> {
        if target == SOCKS5_TARGET {
            chan.send_text(&Reply::Ok.to_string()).await?;
            let relay_url = self.relay_url.clone();
            tokio::spawn(async move {
                match open_data_channel(&relay_url, &serial).await {
                    Ok(data) => {
                        info!("serving [{serial}] through local socks5");
                        if let Err(e) = socks5::serve(data, None).await {
                            error!("socks5 session [{serial}] failed: {e}");
                        }
                    }
                    Err(e) => error!("open data channel for [{serial}] failed: {e}"),
                }
            });
            return Ok(());
        }

        match TcpStream::connect(&target).await {
            Ok(outbound) => {
                chan.send_text(&Reply::Ok.to_string()).await?;
                info!("connected to {target} for [{serial}]");
                let relay_url = self.relay_url.clone();
                tokio::spawn(async move {
                    bridge_target(&relay_url, &serial, outbound).await;
                });
            }
            Err(e) => {
                error!("connect to {target} failed: {e}");
                chan.send_text(&Reply::FailCode(CODE_DIAL_FAILED).to_string())
                    .await?;
            }
        }
        Ok(())
    }
}

/// open_data_channel dials the relay with a `server-data,<serial>`
/// claim for the pending handshake
async fn open_data_channel(relay_url: &str, serial: &str) -> Result<ClientConn> {
    let claim = Command::OpenData {
        serial: serial.to_string(),
    };
    conn::connect(relay_url, &claim.to_string()).await
}

/// bridge_target couples a freshly opened data channel with the dialed
/// target stream; both sides close when the copy resolves
async fn bridge_target(relay_url: &str, serial: &str, mut outbound: TcpStream) {
    let mut data = match open_data_channel(relay_url, serial).await {
        Ok(data) => data,
        Err(e) => {
            error!("open data channel for [{serial}] failed: {e}");
            return;
        }
    };

    match copy_bidirectional(&mut outbound, &mut data).await {
        Ok((to_relay, from_relay)) => info!(
            "data channel [{serial}] closed: {to_relay} bytes up, {from_relay} bytes down"
        ),
        Err(e) => info!("data channel [{serial}] closed: {e}"),
    }
    data.close().await;
}
