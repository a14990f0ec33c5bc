//! The wire-level message schema (`[command token] [json body]?`) and its
//! typed payloads.

mod coord;
mod error;
mod message;

pub use coord::Coord;
pub use error::ProtocolError;
pub use message::{
    AiMatchPayload, ChallengeCancelPayload, ChallengeRequestPayload, ChallengeResponsePayload,
    Difficulty, DrawResponsePayload, FriendRequestPayload, FriendResponsePayload, GameEndPayload,
    GameHistoryPayload, GameStartPayload, InvalidMovePayload, LoginPayload, MessageKind,
    MovePayload, RematchResponsePayload, ReplayRequestPayload, UnfriendPayload, UserStatsPayload,
};
