//! Length-prefixed framing (§4.1) and a mio-based, accept-only connection
//! manager (§4.3/§4.4) for the session/game-flow engine.

mod connection;
mod frame;
mod listener;

pub use connection::{ConnState, Connection};
pub use frame::{FrameError, FrameReader, MAX_FRAME_LEN, ReadOutcome, encode_frame};
pub use listener::{ConnectionManager, PollEvent};
pub use mio::Token;
