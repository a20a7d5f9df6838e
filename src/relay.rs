use crate::conn::{Rewind, WsConn};
use crate::protocol::{CODE_NOT_FOUND, Command, Reply};
use crate::registry::Registry;
use anyhow::{Result, bail};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, copy_bidirectional};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info, warn};

/// Command-channel heartbeat period
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(10);

/// Consecutive heartbeat non-acks tolerated before a slot is torn down
const MAX_MISSED_HEARTBEATS: u32 = 2;

/// How long an unclaimed pending handshake may sit before it is reaped
const PENDING_TTL: Duration = Duration::from_secs(60);

/// Upper bound on one HTTP request head
const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// A relay-side (accepted) websocket connection; the request head was
/// already sniffed off the socket, so the handshake reads it replayed
type ServerConn = WsConn<Rewind<TcpStream>>;

/// SlotHandle is the registry entry for one registered exit agent; the
/// event channel feeds that slot's command loop
#[derive(Clone)]
struct SlotHandle {
    events: mpsc::UnboundedSender<SlotEvent>,
}

/// SlotEvent drives a slot's command loop
enum SlotEvent {
    /// An entrance agent wants a tunnel; ask the exit agent to dial
    Connect { serial: String, target: String },
    /// Deregister the slot and drop its command channel
    Quit,
}

/// Pending is an entrance-side data channel waiting for its exit-side
/// counterpart
struct Pending {
    created: Instant,
    conn: ServerConn,
}

/// RelayState holds the three registries shared by every connection
/// handler (live slots, unclaimed handshakes, paired connections) and
/// the sequence that keys pair bookkeeping
pub struct RelayState {
    slots: Registry<SlotHandle>,
    pending: Registry<Pending>,
    pairs: Registry<Instant>,
    pair_seq: AtomicU64,
}

/// RelayHandle is a cheap clone of the relay's shared state, exposing
/// counters and slot eviction for operators and tests
#[derive(Clone)]
pub struct RelayHandle {
    state: Arc<RelayState>,
}

/// RelayHandle implementation block
impl RelayHandle {
    /// slots returns the number of registered slots
    pub fn slots(&self) -> usize {
        self.state.slots.len()
    }

    /// pending returns the number of unclaimed pending handshakes
    pub fn pending(&self) -> usize {
        self.state.pending.len()
    }

    /// paired returns the number of live paired connections
    pub fn paired(&self) -> usize {
        self.state.pairs.len()
    }

    /// evict_slot asks a slot's command loop to quit; returns false
    /// when no such slot is registered
    pub fn evict_slot(&self, name: &str) -> bool {
        match self.state.slots.get(name) {
            Some(handle) => handle.events.send(SlotEvent::Quit).is_ok(),
            None => false,
        }
    }
}

/// RouteConfig carries the relay's HTTP-path layout into the
/// per-connection handshake callback
struct RouteConfig {
    ws_path: String,
    ping_path: String,
    static_prefix: String,
    static_dir: Option<PathBuf>,
}

/// RelayServer is the publicly reachable middle of the tunnel. It
/// accepts websocket connections on `<prefix>/ws`, classifies each by
/// its first frame, and brokers entrance-side and exit-side data
/// channels into paired byte streams.
pub struct RelayServer {
    pub listen_addr: String,
    prefix: String,
    static_dir: Option<PathBuf>,
    heartbeat_period: Duration,
    state: Arc<RelayState>,
    listener: Option<TcpListener>,
}

/// RelayServer implementation block
impl RelayServer {
    /// new is a constructor for the RelayServer type
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            prefix: String::new(),
            static_dir: None,
            heartbeat_period: HEARTBEAT_PERIOD,
            state: Arc::new(RelayState {
                slots: Registry::new(),
                pending: Registry::new(),
                pairs: Registry::new(),
                pair_seq: AtomicU64::new(0),
            }),
            listener: None,
        }
    }

    /// with_prefix sets the URI prefix under which /ws, /ping, and
    /// /static/ are served
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// with_static_dir enables the static-file path, rooted at dir
    pub fn with_static_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.static_dir = Some(dir.into());
        self
    }

    /// with_heartbeat_period overrides the command-channel heartbeat
    /// interval
    pub fn with_heartbeat_period(mut self, period: Duration) -> Self {
        self.heartbeat_period = period;
        self
    }

    /// handle returns a clone of the shared state for inspection
    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// bind to the listen address, panics when called twice
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if self.listener.is_some() {
            panic!("bind can only be called once");
        }

        let listener = TcpListener::bind(&self.listen_addr).await?;
        let addr = listener.local_addr()?;

        info!("relay listening on {addr} with prefix [{}]", self.prefix);

        self.listener = Some(listener);
        Ok(addr)
    }

    /// run handles server spinup and listens for incoming connections
    pub async fn run(&mut self) -> Result<()> {
        if self.listener.is_none() {
            self.bind().await?;
        }
        let listener = self.listener.take().unwrap();

        let routes = Arc::new(RouteConfig {
            ws_path: format!("{}/ws", self.prefix),
            ping_path: format!("{}/ping", self.prefix),
            static_prefix: format!("{}/static/", self.prefix),
            static_dir: self.static_dir.clone(),
        });

        let heartbeat_period = self.heartbeat_period;
        loop {
            let (inbound, peer_addr) = listener.accept().await?;

            let state = Arc::clone(&self.state);
            let routes = Arc::clone(&routes);

            tokio::spawn(async move {
                if let Err(e) =
                    handle_connection(inbound, peer_addr, state, routes, heartbeat_period).await
                {
                    error!("connection error from {peer_addr}: {e}");
                }
            });
        }
    }
}

/// plain_response builds a non-upgrade HTTP answer for the handshake
/// callback's reject path
fn plain_response(status: StatusCode, body: String) -> ErrorResponse {
    tokio_tungstenite::tungstenite::http::Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Some(body))
        .expect("failed to build static response")
}

/// route_request admits websocket upgrades on the tunnel path and
/// rejects upgrade attempts anywhere else; non-upgrade requests never
/// reach this callback
fn route_request(req: &Request, response: Response, routes: &RouteConfig) -> Result<Response, ErrorResponse> {
    if req.uri().path() == routes.ws_path {
        Ok(response)
    } else {
        Err(plain_response(StatusCode::NOT_FOUND, "not found".to_string()))
    }
}

/// RequestHead is the parsed head of one inbound HTTP request
struct RequestHead {
    path: String,
    header_lines: Vec<String>,
    upgrade: bool,
}

/// read_request_head reads one HTTP request head, through the blank
/// line, so the connection can be classified before any websocket
/// handshake runs. Everything read is returned for replay.
async fn read_request_head(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut raw = Vec::new();
    let mut chunk = [0u8; 1024];
    while !raw.windows(4).any(|w| w == b"\r\n\r\n") {
        if raw.len() > MAX_REQUEST_HEAD {
            bail!("request head exceeds {MAX_REQUEST_HEAD} bytes");
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            bail!("connection closed before the request head completed");
        }
        raw.extend_from_slice(&chunk[..n]);
    }
    Ok(raw)
}

/// parse_request_head extracts the path, raw header lines, and whether
/// the request asks for a websocket upgrade
fn parse_request_head(raw: &[u8]) -> Option<RequestHead> {
    let end = raw.windows(4).position(|w| w == b"\r\n\r\n")?;
    let text = std::str::from_utf8(&raw[..end]).ok()?;

    let mut lines = text.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let _method = parts.next()?;
    let path = parts.next()?.split('?').next()?.to_string();

    let mut header_lines = Vec::new();
    let mut upgrade = false;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("upgrade")
                && value.trim().eq_ignore_ascii_case("websocket")
            {
                upgrade = true;
            }
        }
        header_lines.push(line.to_string());
    }

    Some(RequestHead {
        path,
        header_lines,
        upgrade,
    })
}

/// serve_plain_http answers the relay's non-upgrade surface: the ping
/// diagnostic, files under the static prefix, 404 for everything else
async fn serve_plain_http(
    mut stream: TcpStream,
    head: RequestHead,
    routes: &RouteConfig,
    peer_addr: SocketAddr,
) -> Result<()> {
    debug!("plain http request from {peer_addr}: {}", head.path);

    if head.path == routes.ping_path {
        let mut lines = vec!["hello:".to_string()];
        lines.extend(head.header_lines);
        let body = lines.join("\n").into_bytes();
        return write_plain_http(&mut stream, StatusCode::OK, "text/plain; charset=utf-8", &body)
            .await;
    }

    if let Some(file) = head.path.strip_prefix(&routes.static_prefix) {
        if let Some(dir) = &routes.static_dir {
            if !file.is_empty() && !file.contains("..") {
                if let Ok(body) = tokio::fs::read(dir.join(file)).await {
                    return write_plain_http(
                        &mut stream,
                        StatusCode::OK,
                        "application/octet-stream",
                        &body,
                    )
                    .await;
                }
            }
        }
    }

    write_plain_http(
        &mut stream,
        StatusCode::NOT_FOUND,
        "text/plain; charset=utf-8",
        b"not found",
    )
    .await
}

/// write_plain_http writes one close-delimited HTTP response
async fn write_plain_http(
    stream: &mut TcpStream,
    status: StatusCode,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        body.len(),
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.shutdown().await?;
    Ok(())
}

/// handle_connection sniffs the request head to split the plain-HTTP
/// surface from websocket upgrades, then dispatches upgraded
/// connections by their classification frame
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<RelayState>,
    routes: Arc<RouteConfig>,
    heartbeat_period: Duration,
) -> Result<()> {
    let raw = read_request_head(&mut stream).await?;
    let Some(head) = parse_request_head(&raw) else {
        bail!("malformed request head from {peer_addr}");
    };

    if !head.upgrade {
        return serve_plain_http(stream, head, &routes, peer_addr).await;
    }

    let callback =
        move |req: &Request, response: Response| route_request(req, response, &routes);
    let ws = match accept_hdr_async(Rewind::new(raw, stream), callback).await {
        Ok(ws) => ws,
        Err(e) => {
            // Upgrade attempts on a wrong path end up here after their
            // 404 has been written
            debug!("handshake with {peer_addr} ended: {e}");
            return Ok(());
        }
    };

    info!("new websocket connection from {peer_addr}");
    let mut conn = WsConn::new(ws);

    let Some(first) = conn.recv_text().await? else {
        return Ok(());
    };

    match Command::parse(&first) {
        Some(Command::Register { slot }) => {
            serve_slot(conn, slot, state, heartbeat_period).await
        }
        Some(Command::OpenData { serial }) => claim_pending(conn, serial, state).await,
        Some(Command::Tunnel {
            slot,
            serial,
            target,
        }) => route_tunnel(conn, slot, serial, target, state).await,
        _ => {
            warn!("invalid first frame from {peer_addr}: [{first}]");
            conn.close().await;
            Ok(())
        }
    }
}

/// serve_slot registers a command channel under a slot name and runs
/// its command loop until the slot dies
async fn serve_slot(
    mut conn: ServerConn,
    slot: String,
    state: Arc<RelayState>,
    heartbeat_period: Duration,
) -> Result<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = SlotHandle { events: tx };
    if state.slots.insert(&slot, handle).is_err() {
        warn!("slot [{slot}] already registered, rejecting");
        let _ = conn.send_text(&Reply::Fail.to_string()).await;
        conn.close().await;
        return Ok(());
    }
    if let Err(e) = conn.send_text(&Reply::Ok.to_string()).await {
        state.slots.remove(&slot);
        return Err(e);
    }
    info!("slot [{slot}] registered");
    slot_loop(conn, rx, slot, state, heartbeat_period).await;
    Ok(())
}

/// slot_loop owns one slot's command channel. It relays connect events
/// to the exit agent and probes liveness in the idle gaps; it is the
/// only writer on the channel, so each blocking request sees its own
/// reply.
async fn slot_loop(
    mut conn: ServerConn,
    mut events: mpsc::UnboundedReceiver<SlotEvent>,
    slot: String,
    state: Arc<RelayState>,
    heartbeat_period: Duration,
) {
    let started = Instant::now();
    let mut missed = 0u32;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SlotEvent::Connect { serial, target }) => {
                    let request = Command::Dial {
                        serial: serial.clone(),
                        target: target.clone(),
                    };
                    match conn.req(&request.to_string()).await {
                        Ok(reply) if Reply::is_ok(&reply) => missed = 0,
                        Ok(reply) => {
                            error!("exit agent refused [{serial}] -> {target}: {reply}");
                            discard_pending(&state, &serial).await;
                        }
                        Err(e) => {
                            error!("command channel for slot [{slot}] failed: {e}");
                            discard_pending(&state, &serial).await;
                            break;
                        }
                    }
                }
                Some(SlotEvent::Quit) | None => break,
            },
            _ = time::sleep(heartbeat_period) => {
                match conn.req(&Command::Heartbeat.to_string()).await {
                    Ok(reply) if Reply::is_ok(&reply) => missed = 0,
                    Ok(reply) => {
                        debug!("heartbeat on slot [{slot}] answered [{reply}]");
                        missed += 1;
                        if missed > MAX_MISSED_HEARTBEATS {
                            error!("slot [{slot}] missed {missed} heartbeats");
                            break;
                        }
                    }
                    Err(e) => {
                        error!("heartbeat on slot [{slot}] failed: {e}");
                        break;
                    }
                }
            }
        }
    }
    state.slots.remove(&slot);
    conn.close().await;
    warn!("slot [{slot}] exited after {:?}", started.elapsed());
}

/// discard_pending removes a pending handshake and closes its
/// entrance-side channel
async fn discard_pending(state: &RelayState, serial: &str) {
    if let Some(pending) = state.pending.remove(serial) {
        let mut conn = pending.conn;
        conn.close().await;
    }
}

/// claim_pending matches an exit-side data channel to its waiting
/// entrance-side counterpart and runs the paired byte copy. Both
/// halves are closed exactly once, when the copy future resolves.
async fn claim_pending(mut conn: ServerConn, serial: String, state: Arc<RelayState>) -> Result<()> {
    let Some(pending) = state.pending.remove(&serial) else {
        warn!("server-data [{serial}] but serial not found");
        let _ = conn
            .send_text(&Reply::FailCode(CODE_NOT_FOUND).to_string())
            .await;
        conn.close().await;
        return Ok(());
    };
    let mut entrance = pending.conn;

    if let Err(e) = conn.send_text(&Reply::Ok.to_string()).await {
        entrance.close().await;
        return Err(e);
    }
    if let Err(e) = entrance.send_text(&Reply::Ok.to_string()).await {
        error!("notifying entrance side of [{serial}] failed: {e}");
        conn.close().await;
        return Err(e);
    }

    // Serials may be reused while an earlier pair is still draining,
    // so pair bookkeeping gets its own unique key
    let pair_key = format!(
        "{serial}#{}",
        state.pair_seq.fetch_add(1, Ordering::Relaxed)
    );
    if state.pairs.insert(&pair_key, Instant::now()).is_err() {
        warn!("pair key [{pair_key}] collided");
    }
    info!(
        "paired connection [{serial}] after {:?} pending",
        pending.created.elapsed()
    );

    let result = copy_bidirectional(&mut entrance, &mut conn).await;
    entrance.close().await;
    conn.close().await;
    state.pairs.remove(&pair_key);

    match result {
        Ok((from_entrance, from_exit)) => info!(
            "pair [{serial}] closed: {from_entrance} bytes in, {from_exit} bytes out"
        ),
        Err(e) => info!("pair [{serial}] closed: {e}"),
    }
    Ok(())
}

/// route_tunnel parks an entrance-side data channel as a pending
/// handshake and signals the slot's command loop; pairing completes
/// asynchronously when the exit agent's server-data claim arrives
async fn route_tunnel(
    mut conn: ServerConn,
    slot: String,
    serial: String,
    target: String,
    state: Arc<RelayState>,
) -> Result<()> {
    let Some(handle) = state.slots.get(&slot) else {
        warn!("client-data for unknown slot [{slot}]");
        let _ = conn
            .send_text(&Reply::FailCode(CODE_NOT_FOUND).to_string())
            .await;
        conn.close().await;
        return Ok(());
    };

    let pending = Pending {
        created: Instant::now(),
        conn,
    };
    if let Err(rejected) = state.pending.insert(&serial, pending) {
        warn!("serial [{serial}] already pending, rejecting");
        let mut conn = rejected.conn;
        let _ = conn.send_text(&Reply::Fail.to_string()).await;
        conn.close().await;
        return Ok(());
    }

    info!("new client-data for slot [{slot}] serial [{serial}] -> {target}");

    let event = SlotEvent::Connect {
        serial: serial.clone(),
        target,
    };
    if handle.events.send(event).is_err() {
        // The slot vanished between lookup and push
        discard_pending(&state, &serial).await;
        return Ok(());
    }

    // Reap the handshake if no exit agent ever claims it
    tokio::spawn(async move {
        time::sleep(PENDING_TTL).await;
        if let Some(stale) = state.pending.remove(&serial) {
            warn!(
                "pending handshake [{serial}] expired after {:?}",
                stale.created.elapsed()
            );
            let mut conn = stale.conn;
            conn.close().await;
        }
    });
    Ok(())
}
