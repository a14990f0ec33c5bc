use std::{collections::HashMap, io, mem, net::SocketAddr};

use mio::{Events, Interest, Poll, Token, net::TcpListener};
use tracing::{debug, info, warn};

use crate::connection::{ConnState, Connection};

const LISTEN_TOKEN: Token = Token(0);
const LISTEN_BACKLOG: i32 = 64;

/// A connection-lifecycle event surfaced to the caller's dispatch layer.
/// `Frame` carries an owned payload (rather than a borrowed slice into a
/// reusable read buffer) because it must outlive this poll iteration to
/// cross into the dispatch-pool queue (§4.5); this is a deliberate
/// departure from a zero-copy borrow-and-reuse design.
pub enum PollEvent {
    Accept { token: Token, peer_addr: SocketAddr },
    Disconnect { token: Token },
    Frame { token: Token, payload: Vec<u8> },
}

/// Binds a non-blocking TCP listener with `SO_REUSEADDR` and an explicit
/// accept backlog of 64 (§6), which `mio::net::TcpListener::bind` does not
/// expose.
fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    use socket2::{Domain, Socket, Type};

    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    let std_listener = std::net::TcpListener::from(socket);
    Ok(TcpListener::from_std(std_listener))
}

/// Best-effort `SO_RCVBUF`/`SO_SNDBUF` hint applied to each accepted socket
/// (§3 ServerConfig "socket buffer size hint"). Unix-only, matching the
/// rest of the workspace's platform-specific tuning (`xiangqi-utils`'s
/// thread-priority code is similarly gated); a failure here is logged and
/// otherwise ignored; it never affects connection acceptance.
#[cfg(unix)]
fn apply_socket_buf_hint(stream: &mio::net::TcpStream, bytes: usize) {
    use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};

    let raw = stream.as_raw_fd();
    let socket = unsafe { socket2::Socket::from_raw_fd(raw) };
    if let Err(err) = socket.set_recv_buffer_size(bytes) {
        warn!(%err, bytes, "failed to set SO_RCVBUF");
    }
    if let Err(err) = socket.set_send_buffer_size(bytes) {
        warn!(%err, bytes, "failed to set SO_SNDBUF");
    }
    // `Socket` would close `raw` on drop; hand the fd back to the stream
    // that actually owns it.
    let _ = socket.into_raw_fd();
}

#[cfg(not(unix))]
fn apply_socket_buf_hint(_stream: &mio::net::TcpStream, _bytes: usize) {}

/// Accept-only mio event loop: owns the listening socket and every accepted
/// `Connection`, generalized from a fuller connect/reconnect manager down to
/// the server side this protocol needs (§4.3/§4.4).
pub struct ConnectionManager {
    poll: Poll,
    listener: TcpListener,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    events: Events,
    socket_buf_hint: Option<usize>,
}

impl ConnectionManager {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        Self::bind_with_socket_buf(addr, None)
    }

    /// As `bind`, but applies `socket_buf_hint` (§3 ServerConfig) as a
    /// best-effort `SO_RCVBUF`/`SO_SNDBUF` hint on every accepted socket.
    pub fn bind_with_socket_buf(addr: SocketAddr, socket_buf_hint: Option<usize>) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = bind_listener(addr)?;
        poll.registry()
            .register(&mut listener, LISTEN_TOKEN, Interest::READABLE)?;
        info!(%addr, backlog = LISTEN_BACKLOG, "listening");
        Ok(Self {
            poll,
            listener,
            connections: HashMap::new(),
            next_token: 1,
            events: Events::with_capacity(1024),
            socket_buf_hint,
        })
    }

    fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Blocks for up to `timeout` (the dispatch loop's mailbox-drain cadence,
    /// ~100ms per §4.4) waiting for readiness, then drives every ready
    /// connection and appends the resulting events to `out`.
    pub fn poll(&mut self, timeout: Option<std::time::Duration>, out: &mut Vec<PollEvent>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let events = mem::replace(&mut self.events, Events::with_capacity(1024));
        for ev in events.iter() {
            if ev.token() == LISTEN_TOKEN {
                self.accept_all(out);
                continue;
            }
            self.drive(ev.token(), ev, out);
        }
        self.events = events;
        Ok(())
    }

    fn accept_all(&mut self, out: &mut Vec<PollEvent>) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    if let Some(bytes) = self.socket_buf_hint {
                        apply_socket_buf_hint(&stream, bytes);
                    }
                    let token = self.next_token();
                    let mut conn = match Connection::new(stream, peer_addr, token) {
                        Ok(c) => c,
                        Err(err) => {
                            warn!(%peer_addr, %err, "failed to prepare accepted socket");
                            continue;
                        }
                    };
                    if let Err(err) = conn.register(self.poll.registry()) {
                        warn!(%peer_addr, %err, "failed to register accepted socket");
                        continue;
                    }
                    debug!(%peer_addr, ?token, "accepted connection");
                    self.connections.insert(token, conn);
                    out.push(PollEvent::Accept { token, peer_addr });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!(%err, "accept failed");
                    return;
                }
            }
        }
    }

    fn drive(&mut self, token: Token, ev: &mio::event::Event, out: &mut Vec<PollEvent>) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };

        let mut frames = Vec::new();
        let read_state = conn.poll_read(ev, &mut |payload| frames.push(payload));
        for payload in frames {
            out.push(PollEvent::Frame { token, payload });
        }

        let write_state = if read_state == ConnState::Alive {
            conn.drain_backlog(ev, self.poll.registry())
        } else {
            ConnState::Disconnected
        };

        if read_state == ConnState::Disconnected || write_state == ConnState::Disconnected {
            self.disconnect(token, out);
        }
    }

    fn disconnect(&mut self, token: Token, out: &mut Vec<PollEvent>) {
        if let Some(mut conn) = self.connections.remove(&token) {
            conn.close(self.poll.registry());
            out.push(PollEvent::Disconnect { token });
        }
    }

    /// Enqueues `payload` as one frame to `token`'s outbound backlog.
    /// Returns `false` if the connection is unknown (already gone).
    pub fn send(&mut self, token: Token, payload: &[u8]) -> bool {
        let registry = self.poll.registry();
        let Some(conn) = self.connections.get_mut(&token) else {
            return false;
        };
        if conn.enqueue_frame(registry, payload) == ConnState::Disconnected {
            self.connections.remove(&token).map(|mut c| c.close(registry));
        }
        true
    }

    pub fn disconnect_peer(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            conn.close(self.poll.registry());
        }
    }

    pub fn peer_addr(&self, token: Token) -> Option<SocketAddr> {
        self.connections.get(&token).map(Connection::peer_addr)
    }
}
