use crate::protocol::Reply;
use anyhow::{Context, Result, anyhow, bail};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::io;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll, ready};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// A dialed (client-side) websocket connection
pub type ClientConn = WsConn<MaybeTlsStream<TcpStream>>;

/// WsConn adapts a message-framed websocket to byte-stream semantics.
///
/// Reads hand out frame payloads in caller-sized pieces: a frame larger
/// than the caller's buffer is buffered and drained by subsequent
/// reads, so stream-oriented consumers (TCP bridging, SOCKS5, SSH) can
/// ride over it unmodified. Each write becomes one binary frame.
/// Control-plane exchanges go through [`WsConn::req`] instead of the
/// byte-stream interface.
pub struct WsConn<S> {
    inner: WebSocketStream<S>,
    remain: Vec<u8>,
}

/// WsConn implementation block
impl<S> WsConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// new wraps an established websocket connection
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            remain: Vec::new(),
        }
    }

    /// send_text sends one text control frame and flushes it
    pub async fn send_text(&mut self, msg: &str) -> Result<()> {
        self.inner.send(Message::Text(msg.to_string())).await?;
        Ok(())
    }

    /// recv_text receives the next data frame as text; Ok(None) means
    /// the peer closed the connection
    pub async fn recv_text(&mut self) -> Result<Option<String>> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(data))) => return Ok(Some(String::from_utf8(data)?)),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// req sends one text control message and blocks for exactly one
    /// reply frame. Command-channel use only; never call this
    /// concurrently with bulk reads or writes on the same connection.
    pub async fn req(&mut self, msg: &str) -> Result<String> {
        self.send_text(msg).await?;
        self.recv_text()
            .await?
            .ok_or_else(|| anyhow!("connection closed while awaiting reply to [{msg}]"))
    }

    /// close performs a best-effort websocket close; safe to call after
    /// a transport error or a previous close
    pub async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}

/// ws_io_err converts a websocket error into the io::Error surface that
/// AsyncRead/AsyncWrite callers expect
fn ws_io_err(err: WsError) -> io::Error {
    match err {
        WsError::Io(e) => e,
        other => io::Error::other(other),
    }
}

impl<S> AsyncRead for WsConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.remain.is_empty() {
                let n = this.remain.len().min(buf.remaining());
                buf.put_slice(&this.remain[..n]);
                this.remain.drain(..n);
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => this.remain = data,
                Some(Ok(Message::Text(text))) => this.remain = text.into_bytes(),
                // Close frame or stream end is EOF for the byte stream
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    return Poll::Ready(Ok(()));
                }
                Some(Err(e)) => return Poll::Ready(Err(ws_io_err(e))),
            }
        }
    }
}

impl<S> AsyncWrite for WsConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(ws_io_err)?;
        Pin::new(&mut this.inner)
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(ws_io_err)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.inner).poll_flush(cx)) {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(ws_io_err(e))),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.inner).poll_close(cx)) {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(ws_io_err(e))),
        }
    }
}

/// Rewind replays bytes already read from a stream before handing the
/// rest through. The relay uses it to sniff an HTTP request head and
/// still run the websocket handshake over the same connection.
pub struct Rewind<S> {
    head: Vec<u8>,
    inner: S,
}

/// Rewind implementation block
impl<S> Rewind<S> {
    /// new wraps a stream whose first reads must yield head
    pub fn new(head: Vec<u8>, inner: S) -> Self {
        Self { head, inner }
    }
}

impl<S> AsyncRead for Rewind<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.head.is_empty() {
            let n = this.head.len().min(buf.remaining());
            buf.put_slice(&this.head[..n]);
            this.head.drain(..n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for Rewind<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// connect dials the relay's websocket endpoint, issues the
/// classification request, and requires a `res,OK` answer before
/// handing the connection back
pub async fn connect(url: &str, request: &str) -> Result<ClientConn> {
    let (ws, _) = connect_async(url)
        .await
        .with_context(|| format!("websocket dial failed: {url}"))?;
    let mut conn = WsConn::new(ws);
    let reply = conn.req(request).await?;
    if !Reply::is_ok(&reply) {
        conn.close().await;
        bail!("relay rejected [{request}]: {reply}");
    }
    Ok(conn)
}
