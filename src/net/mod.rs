//! Message-framed connections.
//!
//! A [`Conn`] wraps a TCP (optionally TLS) stream in a task that frames
//! inbound bytes on a terminator byte chosen at construction (`|` for the
//! legacy protocol, `\n` for ADC), delivers whole messages to the owner
//! through an event channel, and accepts commands for sending, raw-range
//! receiving and file streaming. Every successful read and write feeds the
//! per-connection rate counters and the process-global [`NetStats`] pair.

mod sendfile;

use crate::util::{NetStats, RateCalc};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Period of the idle/keepalive check.
pub const TIMER_PERIOD: Duration = Duration::from_secs(5);
/// Idle time after which a keepalive message is sent (keepalive enabled).
pub const KEEPALIVE_IDLE: Duration = Duration::from_secs(120);
/// Idle time after which the connection times out (keepalive disabled).
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Input buffer cap in message mode; exceeding it is a fatal receive error.
pub const MAX_MSG_BUF: usize = 1024 * 1024;

const FILE_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnErrorKind {
    Connect,
    Receive,
    Send,
}

impl std::fmt::Display for ConnErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Receive => write!(f, "receive"),
            Self::Send => write!(f, "send"),
        }
    }
}

/// Events delivered to the connection's owner, in order.
#[derive(Debug)]
pub enum ConnEvent {
    /// The outbound connect (and TLS handshake, if any) completed.
    Connected { remote: SocketAddr },
    /// One whole message, terminator stripped. Empty keepalive messages are
    /// not delivered.
    Message(Vec<u8>),
    /// A chunk of a raw receive range.
    RawData(Vec<u8>),
    /// The requested raw range has been fully delivered.
    RawDone,
    /// The requested file has been fully streamed into the socket.
    FileSent,
    /// Fatal; the owner is expected to drop the connection. No further
    /// events follow.
    Error { kind: ConnErrorKind, msg: String },
}

#[derive(Debug)]
enum ConnCmd {
    Send(Vec<u8>),
    SendFile {
        path: PathBuf,
        offset: u64,
        length: u64,
    },
    RecvRaw(u64),
    SetKeepalive(bool),
    Disconnect,
}

/// Shared rate counters, readable from the owner while the task runs.
#[derive(Debug, Default)]
pub struct ConnRates {
    pub rx: Mutex<RateCalc>,
    pub tx: Mutex<RateCalc>,
}

#[derive(Debug, Clone)]
pub struct Conn {
    cmd: mpsc::UnboundedSender<ConnCmd>,
    rates: Arc<ConnRates>,
}

impl Conn {
    /// Queues a framed message; the terminator is appended on the wire.
    /// Returns immediately; completion timing is not observable.
    pub fn send(&self, msg: Vec<u8>) {
        let _ = self.cmd.send(ConnCmd::Send(msg));
    }

    /// Streams `length` bytes of a file into the socket with no framing.
    pub fn send_file(&self, path: PathBuf, offset: u64, length: u64) {
        let _ = self.cmd.send(ConnCmd::SendFile {
            path,
            offset,
            length,
        });
    }

    /// The next `length` inbound bytes bypass framing and are delivered as
    /// [`ConnEvent::RawData`] chunks followed by [`ConnEvent::RawDone`].
    pub fn recv_raw(&self, length: u64) {
        let _ = self.cmd.send(ConnCmd::RecvRaw(length));
    }

    pub fn set_keepalive(&self, on: bool) {
        let _ = self.cmd.send(ConnCmd::SetKeepalive(on));
    }

    /// Tears the connection down. When called while the connect is still in
    /// flight, the connect error callback is suppressed.
    pub fn disconnect(&self) {
        let _ = self.cmd.send(ConnCmd::Disconnect);
    }

    pub fn rx_rate(&self) -> u64 {
        self.rates.rx.lock().expect("rate lock").rate()
    }

    pub fn tx_rate(&self) -> u64 {
        self.rates.tx.lock().expect("rate lock").rate()
    }

    /// Opens an outbound connection. Events arrive on the returned channel;
    /// the first is either `Connected` or a `Connect` error.
    pub fn connect(
        addr: SocketAddr,
        tls: Option<(tokio_native_tls::TlsConnector, String)>,
        terminator: u8,
        stats: Arc<NetStats>,
    ) -> (Conn, mpsc::UnboundedReceiver<ConnEvent>) {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let rates = Arc::new(ConnRates::default());
        let task_rates = rates.clone();
        tokio::spawn(async move {
            let stream = tokio::select! {
                biased;
                cmd = cmd_rx.recv() => {
                    // Only Disconnect makes sense before the stream exists;
                    // it cancels the attempt without an error event.
                    if matches!(cmd, Some(ConnCmd::Disconnect) | None) {
                        return;
                    }
                    let _ = ev_tx.send(ConnEvent::Error {
                        kind: ConnErrorKind::Connect,
                        msg: "command before connection established".into(),
                    });
                    return;
                }
                result = async {
                    let tcp = TcpStream::connect(addr).await?;
                    Ok::<TcpStream, std::io::Error>(tcp)
                } => match result {
                    Ok(tcp) => match tls {
                        None => ConnStream::Plain(tcp),
                        Some((connector, domain)) => {
                            match connector.connect(&domain, tcp).await {
                                Ok(s) => ConnStream::Tls(Box::new(s)),
                                Err(err) => {
                                    let _ = ev_tx.send(ConnEvent::Error {
                                        kind: ConnErrorKind::Connect,
                                        msg: format!("TLS handshake failed: {err}"),
                                    });
                                    return;
                                }
                            }
                        }
                    },
                    Err(err) => {
                        let _ = ev_tx.send(ConnEvent::Error {
                            kind: ConnErrorKind::Connect,
                            msg: err.to_string(),
                        });
                        return;
                    }
                },
            };
            let _ = ev_tx.send(ConnEvent::Connected { remote: addr });
            run_conn(stream, cmd_rx, ev_tx, terminator, stats, task_rates).await;
        });
        (Conn { cmd: cmd_tx, rates }, ev_rx)
    }

    /// Wraps an accepted stream (listener side).
    pub fn from_stream(
        stream: ConnStream,
        terminator: u8,
        stats: Arc<NetStats>,
    ) -> (Conn, mpsc::UnboundedReceiver<ConnEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let rates = Arc::new(ConnRates::default());
        let task_rates = rates.clone();
        tokio::spawn(async move {
            run_conn(stream, cmd_rx, ev_tx, terminator, stats, task_rates).await;
        });
        (Conn { cmd: cmd_tx, rates }, ev_rx)
    }
}

/// Plain or TLS transport under a connection.
pub enum ConnStream {
    Plain(TcpStream),
    Tls(Box<tokio_native_tls::TlsStream<TcpStream>>),
}

impl std::fmt::Debug for ConnStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain(_) => write!(f, "ConnStream::Plain"),
            Self::Tls(_) => write!(f, "ConnStream::Tls"),
        }
    }
}

impl AsyncRead for ConnStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ConnStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// What the 5-second timer decides to do.
#[derive(Debug, PartialEq, Eq)]
enum IdleAction {
    Nothing,
    SendKeepalive,
    Timeout,
}

fn idle_action(keepalive: bool, idle: Duration) -> IdleAction {
    if keepalive {
        if idle >= KEEPALIVE_IDLE {
            IdleAction::SendKeepalive
        } else {
            IdleAction::Nothing
        }
    } else if idle >= IDLE_TIMEOUT {
        IdleAction::Timeout
    } else {
        IdleAction::Nothing
    }
}

struct ConnState {
    stream: ConnStream,
    ev: mpsc::UnboundedSender<ConnEvent>,
    terminator: u8,
    stats: Arc<NetStats>,
    rates: Arc<ConnRates>,
    buf: Vec<u8>,
    raw_left: u64,
    keepalive: bool,
    last_io: Instant,
}

impl ConnState {
    fn account_rx(&mut self, n: usize) {
        self.last_io = Instant::now();
        self.stats.add_rx(n as u64);
        self.rates.rx.lock().expect("rate lock").add(n as u64);
    }

    fn account_tx(&mut self, n: usize) {
        self.last_io = Instant::now();
        self.stats.add_tx(n as u64);
        self.rates.tx.lock().expect("rate lock").add(n as u64);
    }

    fn fail(&self, kind: ConnErrorKind, msg: impl Into<String>) {
        let _ = self.ev.send(ConnEvent::Error {
            kind,
            msg: msg.into(),
        });
    }

    async fn write(&mut self, data: &[u8]) -> bool {
        match self.stream.write_all(data).await {
            Ok(()) => {
                self.account_tx(data.len());
                true
            }
            Err(err) => {
                self.fail(ConnErrorKind::Send, err.to_string());
                false
            }
        }
    }

    /// Distributes freshly read (or previously buffered) bytes between the
    /// raw range and message framing. Returns false on a fatal error.
    fn dispatch_input(&mut self, data: &[u8]) -> bool {
        let mut rest = data;
        while !rest.is_empty() {
            if self.raw_left > 0 {
                let take = (self.raw_left.min(rest.len() as u64)) as usize;
                let _ = self.ev.send(ConnEvent::RawData(rest[..take].to_vec()));
                self.raw_left -= take as u64;
                if self.raw_left == 0 {
                    let _ = self.ev.send(ConnEvent::RawDone);
                }
                rest = &rest[take..];
                continue;
            }
            // Message mode: collect up to the next terminator.
            match rest.iter().position(|&b| b == self.terminator) {
                Some(pos) => {
                    let mut msg = std::mem::take(&mut self.buf);
                    msg.extend_from_slice(&rest[..pos]);
                    rest = &rest[pos + 1..];
                    if !msg.is_empty() {
                        let _ = self.ev.send(ConnEvent::Message(msg));
                    }
                }
                None => {
                    if self.buf.len() + rest.len() > MAX_MSG_BUF {
                        self.fail(
                            ConnErrorKind::Receive,
                            "message exceeds the 1 MiB input buffer",
                        );
                        return false;
                    }
                    self.buf.extend_from_slice(rest);
                    rest = &[];
                }
            }
        }
        true
    }

    /// Re-runs framing over bytes that were already buffered when a raw
    /// receive started.
    fn drain_buffered_into_raw(&mut self) -> bool {
        if self.raw_left == 0 || self.buf.is_empty() {
            return true;
        }
        let buffered = std::mem::take(&mut self.buf);
        self.dispatch_input(&buffered)
    }

    async fn send_file(&mut self, path: PathBuf, offset: u64, length: u64) -> bool {
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(err) => {
                self.fail(
                    ConnErrorKind::Send,
                    format!("cannot open '{}': {err}", path.display()),
                );
                return false;
            }
        };
        if let Err(err) = file.seek(std::io::SeekFrom::Start(offset)).await {
            self.fail(ConnErrorKind::Send, err.to_string());
            return false;
        }

        // Kernel fast path first; on an unsupported-operation error fall back
        // to plain read+write for the rest of the range.
        let mut left = length;
        if let ConnStream::Plain(tcp) = &mut self.stream {
            match sendfile::send(tcp, &mut file, offset, left).await {
                Ok(sent) => {
                    self.account_tx(sent as usize);
                    left -= sent;
                    if left == 0 {
                        let _ = self.ev.send(ConnEvent::FileSent);
                        return true;
                    }
                    if let Err(err) = file.seek(std::io::SeekFrom::Start(offset + sent)).await {
                        self.fail(ConnErrorKind::Send, err.to_string());
                        return false;
                    }
                }
                Err(sendfile::SendfileError::Unsupported) => {}
                Err(sendfile::SendfileError::Io(err)) => {
                    self.fail(ConnErrorKind::Send, err.to_string());
                    return false;
                }
            }
        }

        let mut chunk = vec![0u8; FILE_CHUNK];
        while left > 0 {
            let want = (left.min(FILE_CHUNK as u64)) as usize;
            let n = match file.read(&mut chunk[..want]).await {
                Ok(0) => {
                    self.fail(
                        ConnErrorKind::Send,
                        format!("'{}' ended before the requested range", path.display()),
                    );
                    return false;
                }
                Ok(n) => n,
                Err(err) => {
                    self.fail(ConnErrorKind::Send, err.to_string());
                    return false;
                }
            };
            if !self.write(&chunk[..n]).await {
                return false;
            }
            left -= n as u64;
        }
        let _ = self.ev.send(ConnEvent::FileSent);
        true
    }
}

async fn run_conn(
    stream: ConnStream,
    mut cmd_rx: mpsc::UnboundedReceiver<ConnCmd>,
    ev: mpsc::UnboundedSender<ConnEvent>,
    terminator: u8,
    stats: Arc<NetStats>,
    rates: Arc<ConnRates>,
) {
    let mut state = ConnState {
        stream,
        ev,
        terminator,
        stats,
        rates,
        buf: Vec::new(),
        raw_left: 0,
        keepalive: false,
        last_io: Instant::now(),
    };
    let mut timer = tokio::time::interval(TIMER_PERIOD);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut read_buf = vec![0u8; 64 * 1024];

    loop {
        tokio::select! {
            _ = timer.tick() => {
                match idle_action(state.keepalive, state.last_io.elapsed()) {
                    IdleAction::Nothing => {}
                    IdleAction::SendKeepalive => {
                        if !state.write(&[terminator]).await {
                            return;
                        }
                    }
                    IdleAction::Timeout => {
                        state.fail(ConnErrorKind::Receive, "idle timeout");
                        return;
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ConnCmd::Send(mut msg)) => {
                        msg.push(terminator);
                        if !state.write(&msg).await {
                            return;
                        }
                    }
                    Some(ConnCmd::SendFile { path, offset, length }) => {
                        if !state.send_file(path, offset, length).await {
                            return;
                        }
                    }
                    Some(ConnCmd::RecvRaw(len)) => {
                        state.raw_left = len;
                        if len == 0 {
                            let _ = state.ev.send(ConnEvent::RawDone);
                        } else if !state.drain_buffered_into_raw() {
                            return;
                        }
                    }
                    Some(ConnCmd::SetKeepalive(on)) => state.keepalive = on,
                    Some(ConnCmd::Disconnect) | None => {
                        let _ = state.stream.shutdown().await;
                        return;
                    }
                }
            }
            result = state.stream.read(&mut read_buf) => {
                match result {
                    Ok(0) => {
                        state.fail(ConnErrorKind::Receive, "remote closed the connection");
                        return;
                    }
                    Ok(n) => {
                        state.account_rx(n);
                        let data = read_buf[..n].to_vec();
                        if !state.dispatch_input(&data) {
                            return;
                        }
                    }
                    Err(err) => {
                        state.fail(ConnErrorKind::Receive, err.to_string());
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair(terminator: u8) -> (Conn, mpsc::UnboundedReceiver<ConnEvent>, Conn, mpsc::UnboundedReceiver<ConnEvent>) {
        let stats = NetStats::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (a, mut a_rx) = Conn::connect(addr, None, terminator, stats.clone());
        let (accepted, _) = listener.accept().await.expect("accept");
        let (b, b_rx) = Conn::from_stream(ConnStream::Plain(accepted), terminator, stats);
        match a_rx.recv().await.expect("event") {
            ConnEvent::Connected { .. } => {}
            other => panic!("expected Connected, got {other:?}"),
        }
        (a, a_rx, b, b_rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ConnEvent>) -> ConnEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event timeout")
            .expect("channel open")
    }

    #[tokio::test]
    async fn framed_messages_roundtrip() {
        let (a, _a_rx, _b, mut b_rx) = pair(b'|').await;
        a.send(b"$Hello there".to_vec());
        a.send(b"$Second".to_vec());
        match next_event(&mut b_rx).await {
            ConnEvent::Message(m) => assert_eq!(m, b"$Hello there"),
            other => panic!("unexpected {other:?}"),
        }
        match next_event(&mut b_rx).await {
            ConnEvent::Message(m) => assert_eq!(m, b"$Second"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_keepalive_messages_are_swallowed() {
        let (a, _a_rx, _b, mut b_rx) = pair(b'\n').await;
        a.send(Vec::new()); // empty frame
        a.send(b"real".to_vec());
        match next_event(&mut b_rx).await {
            ConnEvent::Message(m) => assert_eq!(m, b"real"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn raw_range_consumes_buffered_bytes_first() {
        // Drive the wire directly so part of the raw range is already
        // buffered as unframed message bytes when recv_raw is issued.
        let stats = NetStats::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (b, mut b_rx) = Conn::connect(addr, None, b'\n', stats);
        let (mut wire, _) = listener.accept().await.expect("accept");
        match next_event(&mut b_rx).await {
            ConnEvent::Connected { .. } => {}
            other => panic!("expected Connected, got {other:?}"),
        }

        let payload = vec![0xabu8; 3000];
        wire.write_all(b"CSND\n").await.expect("frame");
        wire.write_all(&payload[..1500]).await.expect("head");
        match next_event(&mut b_rx).await {
            ConnEvent::Message(m) => assert_eq!(m, b"CSND"),
            other => panic!("unexpected {other:?}"),
        }
        // Let the head land in b's message buffer before switching modes.
        tokio::time::sleep(Duration::from_millis(100)).await;
        b.recv_raw(3000);
        wire.write_all(&payload[1500..]).await.expect("tail");
        let mut got = Vec::new();
        loop {
            match next_event(&mut b_rx).await {
                ConnEvent::RawData(chunk) => got.extend_from_slice(&chunk),
                ConnEvent::RawDone => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn overflow_is_fatal() {
        let (a, _a_rx, _b, mut b_rx) = pair(b'|').await;
        // One unterminated message larger than the cap.
        let big = vec![b'x'; MAX_MSG_BUF + 16];
        a.send(big); // send appends a terminator, but the cap trips first
        loop {
            match next_event(&mut b_rx).await {
                ConnEvent::Error { kind, .. } => {
                    assert_eq!(kind, ConnErrorKind::Receive);
                    break;
                }
                ConnEvent::Message(_) => panic!("oversized message was delivered"),
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn cancelled_connect_is_silent() {
        // Reserved port with no listener backlog consumption: connect to a
        // non-routable address so the attempt hangs, then cancel.
        let stats = NetStats::new();
        let addr: SocketAddr = "10.255.255.1:4111".parse().unwrap();
        let (conn, mut rx) = Conn::connect(addr, None, b'|', stats);
        conn.disconnect();
        let got = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        match got {
            Ok(None) | Err(_) => {} // closed without events, or still silent
            Ok(Some(ev)) => panic!("unexpected event after cancel: {ev:?}"),
        }
    }

    #[tokio::test]
    async fn send_file_streams_the_range() {
        let mut dir = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        dir.push(format!("rust-dc-net-sendfile-{nanos}"));
        std::fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("payload.bin");
        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 241) as u8).collect();
        std::fs::write(&path, &content).expect("write");

        let (a, mut a_rx, b, mut b_rx) = pair(b'|').await;
        b.recv_raw(100_000);
        a.send_file(path, 50_000, 100_000);
        let mut got = Vec::new();
        loop {
            match next_event(&mut b_rx).await {
                ConnEvent::RawData(chunk) => got.extend_from_slice(&chunk),
                ConnEvent::RawDone => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(got, content[50_000..150_000]);
        match next_event(&mut a_rx).await {
            ConnEvent::FileSent => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(a.tx_rate() > 0 || a.rates.tx.lock().unwrap().total() >= 100_000);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn idle_rules() {
        assert_eq!(
            idle_action(false, Duration::from_secs(29)),
            IdleAction::Nothing
        );
        assert_eq!(
            idle_action(false, Duration::from_secs(30)),
            IdleAction::Timeout
        );
        assert_eq!(
            idle_action(true, Duration::from_secs(119)),
            IdleAction::Nothing
        );
        assert_eq!(
            idle_action(true, Duration::from_secs(120)),
            IdleAction::SendKeepalive
        );
    }
}
