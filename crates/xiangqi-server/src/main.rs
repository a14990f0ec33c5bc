//! The `server [port]` binary (§6): CLI/env/default config resolution,
//! `tracing-subscriber` install, SIGPIPE handling, and the single event
//! loop thread that wires the connection manager, dispatch pool, engine,
//! and outbound mailbox into a running process (§2 "Flow", §4.4).

mod config;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use xiangqi_engine::{DispatchPool, Engine, InMemoryCache, InMemoryStore, OutboundMailbox, find_engine};
use xiangqi_proto::MessageKind;
use xiangqi_wire::{ConnectionManager, PollEvent, Token};

use config::ServerConfig;

/// The AI-mailbox/readiness poll cadence (§4.4): "The timeout is the
/// AI-mailbox polling interval; under load the mailbox drains on every
/// wake anyway."
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Ignores SIGPIPE process-wide (§5 "SIGPIPE") so a write to a half-closed
/// socket returns `EPIPE` instead of killing the process — this matters
/// most when the AI subprocess dies mid-write on its own pipe.
fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Set by `handle_shutdown_signal` (async-signal-safe: a single atomic
/// store), observed by the event loop on its next wake (§5 "Cancellation /
/// timeouts": "Server shutdown raises a flag that the event loop observes
/// on its next wake").
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_shutdown_signal(_signum: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_shutdown_handler() {
    unsafe {
        libc::signal(libc::SIGINT, handle_shutdown_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_shutdown_signal as libc::sighandler_t);
    }
}

fn init_tracing(filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter.to_owned()))
        .init();
}

fn token_to_handle(token: Token) -> i64 {
    token.0 as i64
}

fn handle_to_token(handle: i64) -> Token {
    Token(handle as usize)
}

fn main() {
    let config = ServerConfig::resolve();
    init_tracing(&config.log_filter);
    ignore_sigpipe();
    install_shutdown_handler();

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse().expect("valid bind address");
    let mut conn_manager = ConnectionManager::bind_with_socket_buf(addr, config.socket_buf).unwrap_or_else(|e| {
        eprintln!("failed to bind {addr}: {e}");
        std::process::exit(1);
    });

    let engine_path = find_engine(config.engine_path.as_deref());
    info!(?engine_path, workers = config.worker_count, "resolved server config");

    let engine = Arc::new(Engine::new(engine_path, Arc::new(InMemoryStore::new()), Arc::new(InMemoryCache::new())));
    let mailbox = Arc::new(OutboundMailbox::default());

    let dispatch_engine = Arc::clone(&engine);
    let dispatch_mailbox = Arc::clone(&mailbox);
    let pool = DispatchPool::start(config.worker_count, move |handle, payload| {
        route_message(&dispatch_engine, &dispatch_mailbox, handle, &payload);
    });

    let mut events = Vec::new();
    loop {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            info!("shutdown requested, draining dispatch pool and engine");
            break;
        }
        events.clear();

        // Step 1 (§4.4): drain the outbound mailbox first, so background
        // producers (the AI bridge's reply, an opponent fan-out queued from
        // a different worker) are flushed before this wake's readiness
        // events are serviced, preserving single-writer-per-socket.
        for outbound in mailbox.drain() {
            let token = handle_to_token(outbound.destination);
            conn_manager.send(token, outbound.message.encode().as_bytes());
        }

        if let Err(e) = conn_manager.poll(Some(POLL_TIMEOUT), &mut events) {
            warn!(%e, "poll failed");
            continue;
        }

        // Step 2: every wake (including a bare poll timeout with zero
        // readiness events) is also the quick-match pool's periodic sweep
        // (§4.6) — sending it straight through `conn_manager.send` rather
        // than the mailbox is safe since this is still the event loop
        // thread.
        for (destination, message) in engine.tick() {
            conn_manager.send(handle_to_token(destination), message.encode().as_bytes());
        }

        for event in events.drain(..) {
            match event {
                PollEvent::Accept { token, peer_addr } => {
                    debug!(%peer_addr, ?token, "session accepted");
                    engine.on_connect(token_to_handle(token));
                }
                PollEvent::Disconnect { token } => {
                    debug!(?token, "connection torn down");
                    for (destination, message) in engine.on_disconnect(token_to_handle(token)) {
                        conn_manager.send(handle_to_token(destination), message.encode().as_bytes());
                    }
                }
                PollEvent::Frame { token, payload } => {
                    pool.enqueue(token_to_handle(token), payload);
                }
            }
        }
    }

    pool.shutdown();
    engine.shutdown();
    drop(conn_manager);
}

/// Runs on a dispatch worker thread (§4.5): parses one frame body, routes
/// it through the engine, and posts every resulting effect to the outbound
/// mailbox. Writes never happen on this thread — only the event loop
/// thread ever calls `ConnectionManager::send` (§4.9 design note: "may
/// choose to always route through the mailbox for uniformity").
fn route_message(engine: &Engine, mailbox: &OutboundMailbox, handle: i64, payload: &[u8]) {
    let body = String::from_utf8_lossy(payload);
    let effects = match MessageKind::parse(&body) {
        Ok(msg) => engine.handle_message(handle, msg),
        Err(e) => {
            debug!(%e, handle, "malformed frame body");
            vec![(handle, MessageKind::Error { message: e.to_string() })]
        }
    };
    for (destination, message) in effects {
        mailbox.enqueue_or_drop(destination, message);
    }
}
