//! Listener multiplexer: collapses per-hub TCP/UDP/TLS bind requests into a
//! minimum set of listening sockets.
//!
//! Resolution rules: an exact match (same type and port, same or wildcard
//! address) is reused; a TCP/TLS clash on the same port is a configuration
//! error that aborts all listeners; a new wildcard bind absorbs existing
//! interface-specific binds of the same type and port. Sockets are created
//! only after the whole request set resolves.

use rand::Rng;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;

const LISTEN_BACKLOG: i32 = 5;
const UDP_BUF: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindType {
    Tcp,
    Udp,
    Tls,
}

impl std::fmt::Display for BindType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
            Self::Tls => write!(f, "TLS"),
        }
    }
}

/// One hub's wish for a listening socket. Port 0 selects the process-wide
/// random port for the type.
#[derive(Debug, Clone, Copy)]
pub struct BindRequest {
    pub hub: u64,
    pub kind: BindType,
    pub ip: Ipv4Addr,
    pub port: u16,
}

/// The three per-type ports drawn once at startup and reused whenever a
/// configured port is zero.
#[derive(Debug, Clone, Copy)]
pub struct RandomPorts {
    pub tcp: u16,
    pub udp: u16,
    pub tls: u16,
}

impl RandomPorts {
    /// Draws independent ports in [1025, 65534]; TLS is redrawn until it
    /// differs from TCP.
    pub fn draw() -> Self {
        let mut rng = rand::thread_rng();
        let tcp = rng.gen_range(1025..=65534);
        let udp = rng.gen_range(1025..=65534);
        let tls = loop {
            let p = rng.gen_range(1025..=65534);
            if p != tcp {
                break p;
            }
        };
        Self { tcp, udp, tls }
    }

    fn for_type(&self, kind: BindType) -> u16 {
        match kind {
            BindType::Tcp => self.tcp,
            BindType::Udp => self.udp,
            BindType::Tls => self.tls,
        }
    }
}

/// A resolved bind: one socket-to-be, shared by one or more hubs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenBind {
    pub kind: BindType,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub hubs: Vec<u64>,
}

impl ListenBind {
    fn is_wildcard(&self) -> bool {
        self.ip.is_unspecified()
    }
}

#[derive(Debug)]
pub enum ListenError {
    /// Unresolvable TCP/TLS clash; all listeners are torn down.
    Conflict {
        requested: String,
        existing: String,
    },
    Bind {
        what: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ListenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conflict {
                requested,
                existing,
            } => write!(
                f,
                "active configuration error: {requested} conflicts with {existing}; \
                 switching to passive mode"
            ),
            Self::Bind { what, source } => {
                write!(f, "cannot listen on {what}: {source}; switching to passive mode")
            }
        }
    }
}

impl std::error::Error for ListenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind { source, .. } => Some(source),
            Self::Conflict { .. } => None,
        }
    }
}

/// Flavor of a received UDP datagram, selected by its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFlavor {
    /// `U...`, messages split on `\n`.
    Adc,
    /// `$...`, messages split on `|`.
    Nmdc,
}

#[derive(Debug)]
pub enum ListenerEvent {
    /// An accepted peer connection, tagged with the TLS-or-plain flavor of
    /// the bind it arrived on.
    IncomingTcp {
        stream: TcpStream,
        tls: bool,
        port: u16,
    },
    /// One protocol message from a UDP datagram (multi-message datagrams are
    /// split before delivery), destined for the search-result ingester.
    UdpMessage {
        from: SocketAddr,
        flavor: PacketFlavor,
        msg: Vec<u8>,
    },
    /// A hard socket error tore all listeners down; passive mode is now in
    /// effect. The owner should call [`ListenerSet::stop`] and notify hubs.
    Stopped { reason: String },
}

/// Pure resolution of a request set into a minimal bind set.
pub fn resolve_binds(
    requests: &[BindRequest],
    random: &RandomPorts,
) -> Result<Vec<ListenBind>, ListenError> {
    let mut binds: Vec<ListenBind> = Vec::new();
    'next_request: for req in requests {
        let port = if req.port == 0 {
            random.for_type(req.kind)
        } else {
            req.port
        };
        for bind in &mut binds {
            // Same? Just re-use.
            if bind.kind == req.kind
                && bind.port == port
                && (bind.ip == req.ip || bind.is_wildcard())
            {
                if !bind.hubs.contains(&req.hub) {
                    bind.hubs.push(req.hub);
                }
                continue 'next_request;
            }
            // Clashing port but stream-type mismatch? Conflict.
            let clash = matches!(
                (req.kind, bind.kind),
                (BindType::Tcp, BindType::Tls) | (BindType::Tls, BindType::Tcp)
            );
            if clash
                && bind.port == port
                && (bind.is_wildcard() || req.ip.is_unspecified() || bind.ip == req.ip)
            {
                return Err(ListenError::Conflict {
                    requested: format!("{} {}:{}", req.kind, req.ip, port),
                    existing: format!("{} {}:{}", bind.kind, bind.ip, bind.port),
                });
            }
        }

        let new_bind = ListenBind {
            kind: req.kind,
            ip: req.ip,
            port,
            hubs: vec![req.hub],
        };
        // A wildcard bind absorbs interface-specific ones of the same type
        // and port.
        if new_bind.is_wildcard() {
            let mut absorbed = new_bind;
            binds.retain_mut(|bind| {
                if bind.kind == absorbed.kind && bind.port == absorbed.port {
                    tracing::debug!(port = bind.port, %bind.ip, "merging bind into wildcard");
                    for hub in bind.hubs.drain(..) {
                        if !absorbed.hubs.contains(&hub) {
                            absorbed.hubs.push(hub);
                        }
                    }
                    false
                } else {
                    true
                }
            });
            binds.push(absorbed);
        } else {
            binds.push(new_bind);
        }
    }
    Ok(binds)
}

enum BoundSocket {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

fn create_socket(bind: &ListenBind) -> Result<BoundSocket, ListenError> {
    use socket2::{Domain, Protocol, Socket, Type};
    let what = format!("{} {}:{}", bind.kind, bind.ip, bind.port);
    let make = |type_, proto| -> std::io::Result<Socket> {
        let sock = Socket::new(Domain::IPV4, type_, Some(proto))?;
        sock.set_reuse_address(true)?;
        sock.set_nonblocking(true)?;
        sock.bind(&SocketAddrV4::new(bind.ip, bind.port).into())?;
        Ok(sock)
    };
    match bind.kind {
        BindType::Tcp | BindType::Tls => {
            let sock = make(Type::STREAM, Protocol::TCP)
                .and_then(|s| s.listen(LISTEN_BACKLOG).map(|()| s))
                .map_err(|source| ListenError::Bind {
                    what: what.clone(),
                    source,
                })?;
            let listener =
                TcpListener::from_std(sock.into()).map_err(|source| ListenError::Bind {
                    what,
                    source,
                })?;
            Ok(BoundSocket::Tcp(listener))
        }
        BindType::Udp => {
            let sock = make(Type::DGRAM, Protocol::UDP).map_err(|source| ListenError::Bind {
                what: what.clone(),
                source,
            })?;
            let socket = UdpSocket::from_std(sock.into()).map_err(|source| ListenError::Bind {
                what,
                source,
            })?;
            Ok(BoundSocket::Udp(socket))
        }
    }
}

/// The live listener set. Owns the pump tasks; dropping or [`Self::stop`]
/// closes every socket.
#[derive(Debug)]
pub struct ListenerSet {
    events: mpsc::UnboundedSender<ListenerEvent>,
    random: RandomPorts,
    binds: Vec<ListenBind>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ListenerSet {
    pub fn new(random: RandomPorts, events: mpsc::UnboundedSender<ListenerEvent>) -> Self {
        Self {
            events,
            random,
            binds: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub fn random_ports(&self) -> RandomPorts {
        self.random
    }

    /// Current bind set (empty while passive).
    pub fn binds(&self) -> &[ListenBind] {
        &self.binds
    }

    /// Replaces the active set with one resolved from `requests`. Any error
    /// leaves the set stopped (passive mode).
    pub fn refresh(&mut self, requests: &[BindRequest]) -> Result<(), ListenError> {
        self.stop();
        let resolved = resolve_binds(requests, &self.random)?;
        let mut sockets = Vec::with_capacity(resolved.len());
        for bind in &resolved {
            match create_socket(bind) {
                Ok(sock) => sockets.push(sock),
                Err(err) => {
                    // Abandon ship; a partially activated configuration is
                    // worse than passive mode.
                    self.stop();
                    return Err(err);
                }
            }
        }
        for (bind, sock) in resolved.iter().zip(sockets) {
            let events = self.events.clone();
            let task = match sock {
                BoundSocket::Tcp(listener) => {
                    let tls = bind.kind == BindType::Tls;
                    let port = bind.port;
                    tokio::spawn(tcp_pump(listener, tls, port, events))
                }
                BoundSocket::Udp(socket) => tokio::spawn(udp_pump(socket, events)),
            };
            self.tasks.push(task);
            tracing::debug!(kind = %bind.kind, ip = %bind.ip, port = bind.port,
                hubs = bind.hubs.len(), "listening");
        }
        self.binds = resolved;
        Ok(())
    }

    /// Closes all sockets and clears the bind set.
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.binds.clear();
    }
}

impl Drop for ListenerSet {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_soft(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    ) || err.raw_os_error() == Some(libc::ECONNABORTED)
}

async fn tcp_pump(
    listener: TcpListener,
    tls: bool,
    port: u16,
    events: mpsc::UnboundedSender<ListenerEvent>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tracing::debug!(%addr, tls, "incoming connection");
                if events
                    .send(ListenerEvent::IncomingTcp { stream, tls, port })
                    .is_err()
                {
                    return;
                }
            }
            Err(err) if is_soft(&err) => continue,
            Err(err) => {
                let _ = events.send(ListenerEvent::Stopped {
                    reason: format!("TCP accept error on port {port}: {err}"),
                });
                return;
            }
        }
    }
}

async fn udp_pump(socket: UdpSocket, events: mpsc::UnboundedSender<ListenerEvent>) {
    let mut buf = vec![0u8; UDP_BUF];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                dispatch_datagram(&buf[..n], from, &events);
            }
            Err(err) if is_soft(&err) => continue,
            Err(err) => {
                let _ = events.send(ListenerEvent::Stopped {
                    reason: format!("UDP read error: {err}"),
                });
                return;
            }
        }
    }
}

/// Splits a datagram into protocol messages by flavor and forwards each.
fn dispatch_datagram(
    data: &[u8],
    from: SocketAddr,
    events: &mpsc::UnboundedSender<ListenerEvent>,
) {
    let (flavor, sep) = match data.first() {
        Some(b'U') => (PacketFlavor::Adc, b'\n'),
        Some(b'$') => (PacketFlavor::Nmdc, b'|'),
        _ => {
            tracing::debug!(%from, len = data.len(), "dropping unrecognized UDP packet");
            return;
        }
    };
    for msg in data.split(|&b| b == sep) {
        if msg.is_empty() {
            continue;
        }
        let _ = events.send(ListenerEvent::UdpMessage {
            from,
            flavor,
            msg: msg.to_vec(),
        });
    }
}
