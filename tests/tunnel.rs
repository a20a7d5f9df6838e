//! End-to-end tests: a real relay, exit agent, and entrance agent on
//! loopback ports, with raw websocket clients poking at the relay's
//! control plane where the agents would hide the interesting replies.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use wsrelay::conn::WsConn;
use wsrelay::{EntranceAgent, ExitAgent, RelayHandle, RelayServer};

/// Starts a relay on an ephemeral port; returns its ws URL, socket
/// address, and handle
async fn start_relay() -> (String, SocketAddr, RelayHandle) {
    let mut server = RelayServer::new("127.0.0.1:0").with_prefix("/tun");
    let addr = server.bind().await.unwrap();
    let handle = server.handle();
    tokio::spawn(async move { server.run().await });
    (format!("ws://{addr}/tun/ws"), addr, handle)
}

/// Issues one plain HTTP GET, curl-style, and returns the status line
/// and body
async fn http_get(addr: SocketAddr, path: &str) -> (String, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request =
        format!("GET {path} HTTP/1.1\r\nHost: relay\r\nUser-Agent: curl/8.5.0\r\nAccept: */*\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut raw))
        .await
        .expect("http response timed out")
        .unwrap();

    let end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response has no header terminator");
    let status = String::from_utf8_lossy(&raw[..end])
        .lines()
        .next()
        .unwrap_or_default()
        .to_string();
    (status, raw[end + 4..].to_vec())
}

/// Starts a TCP echo server on an ephemeral port
async fn start_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut conn, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let (mut reader, mut writer) = conn.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// Polls a condition for up to five seconds
async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time");
}

/// Starts an exit agent and waits until its slot is registered
async fn start_exit(url: &str, slot: &str, relay: &RelayHandle) {
    let slots_before = relay.slots();
    let exit = ExitAgent::new(url.to_string(), slot.to_string());
    tokio::spawn(async move { exit.run().await });
    wait_for(|| relay.slots() > slots_before).await;
}

/// Starts an entrance agent and returns its local listen address
async fn start_entrance(url: &str, slot: &str, target: &str) -> SocketAddr {
    let mut entrance =
        EntranceAgent::new("127.0.0.1:0", url.to_string(), slot.to_string(), target.to_string());
    let addr = entrance.bind().await.unwrap();
    tokio::spawn(async move { entrance.run().await });
    addr
}

#[tokio::test]
async fn tunnels_bytes_end_to_end() {
    let (url, _addr, relay) = start_relay().await;
    let echo = start_echo().await;
    start_exit(&url, "t1", &relay).await;
    let local = start_entrance(&url, "t1", &echo.to_string()).await;

    let mut client = TcpStream::connect(local).await.unwrap();
    client.write_all(b"ping").await.unwrap();

    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .expect("echo reply timed out")
        .unwrap();
    assert_eq!(&buf, b"ping");
    assert_eq!(relay.paired(), 1);
}

#[tokio::test]
async fn multiplexes_concurrent_tunnels() {
    let (url, _addr, relay) = start_relay().await;
    let echo = start_echo().await;
    start_exit(&url, "mux", &relay).await;
    let local = start_entrance(&url, "mux", &echo.to_string()).await;

    let mut tasks = Vec::new();
    for i in 0..4u8 {
        tasks.push(tokio::spawn(async move {
            let mut client = TcpStream::connect(local).await.unwrap();
            let payload = vec![i; 64];
            client.write_all(&payload).await.unwrap();
            let mut buf = vec![0u8; 64];
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, payload);
        }));
    }
    for task in tasks {
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn second_registration_of_a_slot_is_rejected() {
    let (url, _addr, relay) = start_relay().await;

    let (ws, _) = connect_async(&url).await.unwrap();
    let mut first = WsConn::new(ws);
    assert_eq!(first.req("server-server,dup").await.unwrap(), "res,OK");

    let (ws, _) = connect_async(&url).await.unwrap();
    let mut second = WsConn::new(ws);
    assert_eq!(second.req("server-server,dup").await.unwrap(), "res,FAIL");

    assert_eq!(relay.slots(), 1);
}

#[tokio::test]
async fn claiming_an_unknown_serial_fails() {
    let (url, _addr, relay) = start_relay().await;

    let (ws, _) = connect_async(&url).await.unwrap();
    let mut conn = WsConn::new(ws);
    assert_eq!(conn.req("server-data,nope").await.unwrap(), "res,FAIL-1043");
    assert_eq!(relay.paired(), 0);
}

#[tokio::test]
async fn tunneling_to_an_unknown_slot_fails() {
    let (url, _addr, relay) = start_relay().await;

    let (ws, _) = connect_async(&url).await.unwrap();
    let mut conn = WsConn::new(ws);
    assert_eq!(
        conn.req("client-data,ghost,g-1,127.0.0.1:1").await.unwrap(),
        "res,FAIL-1043"
    );
    assert_eq!(relay.pending(), 0);
}

#[tokio::test]
async fn dead_target_closes_the_local_connection() {
    let (url, _addr, relay) = start_relay().await;
    start_exit(&url, "t2", &relay).await;

    // A loopback port with nothing listening on it
    let parked = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = parked.local_addr().unwrap();
    drop(parked);

    let local = start_entrance(&url, "t2", &dead.to_string()).await;

    let mut client = TcpStream::connect(local).await.unwrap();
    let mut buf = [0u8; 1];
    let read = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("local connection was not closed in time");
    assert!(matches!(read, Ok(0) | Err(_)));

    wait_for(|| relay.paired() == 0 && relay.pending() == 0).await;
}

#[tokio::test]
async fn evicting_a_slot_deregisters_it() {
    let (url, _addr, relay) = start_relay().await;

    let exit = ExitAgent::new(url.clone(), "t3");
    let exit_task = tokio::spawn(async move { exit.run().await });
    wait_for(|| relay.slots() == 1).await;

    assert!(relay.evict_slot("t3"));
    wait_for(|| relay.slots() == 0).await;

    // The exit agent's command channel dies with the slot
    let result = timeout(Duration::from_secs(5), exit_task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_err());
    assert!(!relay.evict_slot("t3"));
}

#[tokio::test]
async fn plain_http_ping_echoes_request_headers() {
    let (_url, addr, _relay) = start_relay().await;

    let (status, body) = http_get(addr, "/tun/ping").await;
    assert!(status.contains("200"), "unexpected status: {status}");

    let text = String::from_utf8(body).unwrap();
    assert!(text.starts_with("hello:"), "unexpected body: {text}");
    assert!(text.contains("User-Agent: curl/8.5.0"));
}

#[tokio::test]
async fn serves_static_files_as_raw_bytes() {
    let dir = std::env::temp_dir().join(format!("wsrelay-static-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("note.txt"), "hello static").unwrap();
    std::fs::write(dir.join("blob.bin"), [0x00u8, 0xff, 0xfe, 0x01]).unwrap();

    let mut server = RelayServer::new("127.0.0.1:0")
        .with_prefix("/tun")
        .with_static_dir(&dir);
    let addr = server.bind().await.unwrap();
    tokio::spawn(async move { server.run().await });

    let (status, body) = http_get(addr, "/tun/static/note.txt").await;
    assert!(status.contains("200"), "unexpected status: {status}");
    assert_eq!(body, b"hello static");

    // Non-UTF-8 content must come through byte for byte
    let (status, body) = http_get(addr, "/tun/static/blob.bin").await;
    assert!(status.contains("200"), "unexpected status: {status}");
    assert_eq!(body, [0x00, 0xff, 0xfe, 0x01]);

    let (status, _) = http_get(addr, "/tun/static/missing.txt").await;
    assert!(status.contains("404"));

    let (status, _) = http_get(addr, "/tun/static/../secret").await;
    assert!(status.contains("404"));

    let (status, _) = http_get(addr, "/nope").await;
    assert!(status.contains("404"));
}

#[tokio::test]
async fn failed_heartbeats_tear_down_the_slot() {
    let mut server = RelayServer::new("127.0.0.1:0")
        .with_prefix("/tun")
        .with_heartbeat_period(Duration::from_millis(50));
    let addr = server.bind().await.unwrap();
    let relay = server.handle();
    tokio::spawn(async move { server.run().await });
    let url = format!("ws://{addr}/tun/ws");

    let (ws, _) = connect_async(&url).await.unwrap();
    let mut agent = WsConn::new(ws);
    assert_eq!(agent.req("server-server,flaky").await.unwrap(), "res,OK");

    // Refuse three heartbeats in a row
    for _ in 0..3 {
        let msg = timeout(Duration::from_secs(5), agent.recv_text())
            .await
            .expect("heartbeat timed out")
            .unwrap()
            .unwrap();
        assert_eq!(msg, "heart-beat");
        agent.send_text("res,FAIL").await.unwrap();
    }

    wait_for(|| relay.slots() == 0).await;

    let (ws, _) = connect_async(&url).await.unwrap();
    let mut client = WsConn::new(ws);
    assert_eq!(
        client.req("client-data,flaky,f-1,127.0.0.1:1").await.unwrap(),
        "res,FAIL-1043"
    );
}

#[tokio::test]
async fn reused_serials_keep_the_pair_counter_truthful() {
    let (url, _addr, relay) = start_relay().await;

    let (ws, _) = connect_async(&url).await.unwrap();
    let mut agent = WsConn::new(ws);
    assert_eq!(agent.req("server-server,reuse").await.unwrap(), "res,OK");

    // Two live pairs under the same serial number
    let mut entrances = Vec::new();
    let mut exits = Vec::new();
    for _ in 0..2 {
        let (ws, _) = connect_async(&url).await.unwrap();
        let mut entrance = WsConn::new(ws);
        entrance
            .send_text("client-data,reuse,dup-1,unused:1")
            .await
            .unwrap();

        let dial = timeout(Duration::from_secs(5), agent.recv_text())
            .await
            .expect("dial request timed out")
            .unwrap()
            .unwrap();
        assert_eq!(dial, "server-data,dup-1,unused:1");
        agent.send_text("res,OK").await.unwrap();

        let (ws, _) = connect_async(&url).await.unwrap();
        let mut exit = WsConn::new(ws);
        assert_eq!(exit.req("server-data,dup-1").await.unwrap(), "res,OK");

        let ok = timeout(Duration::from_secs(5), entrance.recv_text())
            .await
            .expect("pairing reply timed out")
            .unwrap()
            .unwrap();
        assert_eq!(ok, "res,OK");

        entrances.push(entrance);
        exits.push(exit);
    }
    wait_for(|| relay.paired() == 2).await;

    // Tearing down the first pair must not evict the second's entry
    entrances[0].close().await;
    exits[0].close().await;
    wait_for(|| relay.paired() == 1).await;
}

#[tokio::test]
async fn serves_socks5_through_the_tunnel() {
    let (url, _addr, relay) = start_relay().await;
    let echo = start_echo().await;
    start_exit(&url, "s5slot", &relay).await;
    let local = start_entrance(&url, "s5slot", "s5").await;

    let mut client = TcpStream::connect(local).await.unwrap();

    // Greeting: SOCKS5, one method, no-auth
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut choice = [0u8; 2];
    timeout(Duration::from_secs(5), client.read_exact(&mut choice))
        .await
        .expect("socks5 greeting timed out")
        .unwrap();
    assert_eq!(choice, [0x05, 0x00]);

    // CONNECT to the echo server by IPv4 address
    let SocketAddr::V4(echo_v4) = echo else {
        panic!("echo server should bind IPv4")
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&echo_v4.ip().octets());
    request.extend_from_slice(&echo_v4.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    timeout(Duration::from_secs(5), client.read_exact(&mut reply))
        .await
        .expect("socks5 connect reply timed out")
        .unwrap();
    assert_eq!(reply[0], 0x05);
    assert_eq!(reply[1], 0x00, "connect should succeed");

    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .expect("echo through socks5 timed out")
        .unwrap();
    assert_eq!(&buf, b"ping");
}
