use std::{collections::VecDeque, io::Write, net::SocketAddr};

use mio::{Interest, Registry, Token, event::Event, net::TcpStream};
use tracing::{debug, warn};

use crate::frame::{FrameError, FrameReader, ReadOutcome, encode_frame};

#[derive(Debug, PartialEq, Eq)]
pub enum ConnState {
    Alive,
    Disconnected,
}

/// One accepted TCP connection: inbound frame reassembly plus an outbound
/// write backlog so the event-loop thread remains the only writer on the
/// socket (§4.9).
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    token: Token,
    reader: FrameReader,
    backlog: VecDeque<Vec<u8>>,
    writable_armed: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, token: Token) -> std::io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            peer_addr,
            token,
            reader: FrameReader::default(),
            backlog: VecDeque::new(),
            writable_armed: false,
        })
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Drains as many complete frames as are currently available, calling
    /// `on_frame` for each. Returns `Disconnected` on peer-close, oversized
    /// frame, or any transport error other than "would block" (§4.1).
    pub fn poll_read<F>(&mut self, ev: &Event, on_frame: &mut F) -> ConnState
    where
        F: FnMut(Vec<u8>),
    {
        if !ev.is_readable() {
            return ConnState::Alive;
        }
        loop {
            match self.reader.read_frame(&mut self.stream) {
                Ok(ReadOutcome::Frame(frame)) => on_frame(frame),
                Ok(ReadOutcome::WouldBlock) => return ConnState::Alive,
                Err(FrameError::PeerClosed) => return ConnState::Disconnected,
                Err(FrameError::FrameTooLarge) => {
                    warn!(peer = %self.peer_addr, "oversized frame, disconnecting");
                    return ConnState::Disconnected;
                }
                Err(FrameError::TransportError(err)) => {
                    debug!(peer = %self.peer_addr, %err, "read error, disconnecting");
                    return ConnState::Disconnected;
                }
            }
        }
    }

    /// Writes `payload` as one frame, immediately if the backlog is empty
    /// and the socket accepts it in one shot, otherwise queues the
    /// remainder and arms `WRITABLE` interest so `drain_backlog` flushes it
    /// once the socket is writable again.
    pub fn enqueue_frame(&mut self, registry: &Registry, payload: &[u8]) -> ConnState {
        let framed = encode_frame(payload);

        if !self.backlog.is_empty() {
            return self.push_back(registry, framed);
        }

        match self.stream.write(&framed) {
            Ok(0) => {
                warn!(peer = %self.peer_addr, "write returned 0, disconnecting");
                ConnState::Disconnected
            }
            Ok(n) if n == framed.len() => ConnState::Alive,
            Ok(n) => self.push_front(registry, framed[n..].to_vec()),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                self.push_back(registry, framed)
            }
            Err(err) => {
                warn!(peer = %self.peer_addr, %err, "write failed, disconnecting");
                ConnState::Disconnected
            }
        }
    }

    /// Flushes backlog entries until the socket would block, the backlog
    /// empties, or a write fails.
    pub fn drain_backlog(&mut self, ev: &Event, registry: &Registry) -> ConnState {
        if !ev.is_writable() {
            return ConnState::Alive;
        }
        while let Some(front) = self.backlog.front_mut() {
            match self.stream.write(front) {
                Ok(0) => return ConnState::Disconnected,
                Ok(n) if n == front.len() => {
                    self.backlog.pop_front();
                }
                Ok(n) => {
                    front.drain(..n);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(peer = %self.peer_addr, %err, "backlog write failed");
                    return ConnState::Disconnected;
                }
            }
        }

        if self.backlog.is_empty() && self.writable_armed {
            if let Err(err) = registry.reregister(&mut self.stream, self.token, Interest::READABLE)
            {
                debug!(peer = %self.peer_addr, %err, "reregister readable-only failed");
                return ConnState::Disconnected;
            }
            self.writable_armed = false;
        }
        ConnState::Alive
    }

    fn push_back(&mut self, registry: &Registry, data: Vec<u8>) -> ConnState {
        self.backlog.push_back(data);
        self.arm_writable(registry)
    }

    fn push_front(&mut self, registry: &Registry, data: Vec<u8>) -> ConnState {
        self.backlog.push_front(data);
        self.arm_writable(registry)
    }

    fn arm_writable(&mut self, registry: &Registry) -> ConnState {
        if !self.writable_armed {
            if let Err(err) = registry.reregister(
                &mut self.stream,
                self.token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                debug!(peer = %self.peer_addr, %err, "arm writable failed");
                return ConnState::Disconnected;
            }
            self.writable_armed = true;
        }
        ConnState::Alive
    }

    pub fn register(&mut self, registry: &Registry) -> std::io::Result<()> {
        registry.register(&mut self.stream, self.token, Interest::READABLE)
    }

    pub fn close(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}
