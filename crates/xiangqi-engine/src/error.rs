use thiserror::Error;
use xiangqi_proto::ProtocolError;
use xiangqi_wire::FrameError;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("please LOGIN first")]
    NotAuthenticated,
    #[error("Username already in use")]
    UsernameTaken,
    #[error("username does not match your session")]
    IdentityMismatch,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Not your turn or wrong piece")]
    NotYourTurn,
    #[error("you are not in a game")]
    NotInGame,
    #[error("you are already in a game")]
    AlreadyInGame,
    #[error("game is not in progress")]
    GameNotInProgress,
    #[error("no draw offer to respond to")]
    NoPendingDrawOffer,
    #[error("cannot accept your own draw offer")]
    OwnDrawOffer,
    #[error("invalid move coordinates")]
    InvalidCoordinates,
    #[error("no piece at the origin square")]
    NoPieceAtOrigin,
    #[error("origin and destination must differ")]
    TrivialMove,
    #[error("already waiting for a quick match")]
    AlreadyQueued,
}

#[derive(Debug, Error)]
pub enum PeerUnavailable {
    #[error("user '{0}' is not online")]
    UserOffline(String),
    #[error("that challenge is no longer valid")]
    StaleChallenge,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine binary not found")]
    BinaryNotFound,
    #[error("engine process failed to start: {0}")]
    SpawnFailed(String),
    #[error("engine not ready")]
    NotReady,
    #[error("engine query timed out")]
    Timeout,
    #[error("could not parse a bestmove from engine output")]
    UnparseableReply,
    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("record not found")]
    NotFound,
    #[error("persistence backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("key not found or expired")]
    Miss,
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
}

/// Aggregates every leaf error into the one type handler bodies return.
/// `message()` renders the human-readable text carried in `ERROR {message}`
/// or `INVALID_MOVE {reason}`.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Peer(#[from] PeerUnavailable),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl ServerError {
    /// Whether this error should be reported as `INVALID_MOVE {reason}`
    /// rather than a generic `ERROR {message}` (§7).
    pub fn is_invalid_move(&self) -> bool {
        matches!(
            self,
            ServerError::State(
                StateError::NotYourTurn
                    | StateError::InvalidCoordinates
                    | StateError::NoPieceAtOrigin
                    | StateError::TrivialMove
            )
        )
    }

    pub fn message(&self) -> String {
        self.to_string()
    }
}
