//! Session/challenge state machine, game session manager, dispatch pool,
//! AI bridge, outbound mailbox, and the external-collaborator traits
//! (persistence, session cache) that the `xiangqi-server` binary wires
//! together into a running process (§4.5–§4.9).

pub mod ai;
pub mod dispatch;
pub mod error;
pub mod game;
pub mod mailbox;
pub mod matchmaking;
pub mod persistence;
pub mod registry;

mod engine;

pub use ai::{AiBridge, AiGameTracker, EngineTransport, ProcessTransport, find_engine};
pub use dispatch::DispatchPool;
pub use engine::{Effect, Engine};
pub use error::ServerError;
pub use mailbox::{Outbound, OutboundMailbox};
pub use matchmaking::QuickMatchPool;
pub use persistence::{DocumentStore, InMemoryCache, InMemoryStore, SessionCache};
pub use registry::{ConnHandle, Registry};
