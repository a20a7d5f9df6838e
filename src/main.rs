use anyhow::{Result, anyhow};
use clap::{Parser, ValueEnum};
use tracing::info;
use wsrelay::{EntranceAgent, ExitAgent, RelayServer};

/// Mode selects which of the three tunnel roles this process runs
#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    /// Publicly reachable relay
    #[value(name = "server-server", alias = "ss")]
    Relay,
    /// Tunnel exit: registers a slot and dials targets
    #[value(name = "client-server", alias = "cs")]
    Exit,
    /// Tunnel entrance: local listener feeding the relay
    #[value(name = "client-client", alias = "cc")]
    Entrance,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "A multiplexed relay tunnel over websocket", long_about = None)]
struct Args {
    /// Work mode
    #[arg(short, long, value_enum, default_value = "server-server")]
    mode: Mode,

    /// Listen port (relay and entrance modes)
    #[arg(short, long, default_value_t = 8899)]
    port: u16,

    /// URI prefix for the relay's endpoints, begin with /
    #[arg(long, default_value = "/tun")]
    prefix: String,

    /// Directory served under <prefix>/static/ (relay mode)
    #[arg(long)]
    static_dir: Option<String>,

    /// Relay websocket address, e.g. ws://host:8899/tun/ws
    #[arg(short = 'w', long)]
    ws: Option<String>,

    /// Slot name (exit and entrance modes)
    #[arg(short, long)]
    slot: Option<String>,

    /// Target address, host:port or "s5" (entrance mode)
    #[arg(short, long)]
    to: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Initialize tracing subscriber
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    match args.mode {
        Mode::Relay => {
            let mut server =
                RelayServer::new(format!("0.0.0.0:{}", args.port)).with_prefix(args.prefix);
            if let Some(dir) = args.static_dir {
                server = server.with_static_dir(dir);
            }
            server.run().await
        }
        Mode::Exit => {
            let ws = required(args.ws, "--ws")?;
            let slot = required(args.slot, "--slot")?;
            let agent = ExitAgent::new(ws, slot);
            agent.run().await
        }
        Mode::Entrance => {
            let ws = required(args.ws, "--ws")?;
            let slot = required(args.slot, "--slot")?;
            let to = required(args.to, "--to")?;
            info!("tunneling local port {} -> slot [{slot}] -> {to}", args.port);
            let mut agent =
                EntranceAgent::new(format!("0.0.0.0:{}", args.port), ws, slot, to);
            agent.run().await
        }
    }
}

/// required unwraps an option the selected mode cannot run without
fn required(value: Option<String>, flag: &str) -> Result<String> {
    value.ok_or_else(|| anyhow!("[ERR] {flag} is required for this mode"))
}
