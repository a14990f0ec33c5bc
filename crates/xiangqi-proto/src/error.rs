use thiserror::Error;

/// Fail-closed parse failures for a single frame body. Every variant renders
/// to the human-readable text sent back in an `ERROR {message}` frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown command '{0}'")]
    UnknownToken(String),

    #[error("malformed JSON payload: {0}")]
    MalformedJson(#[from] serde_json::Error),

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' has the wrong type")]
    WrongFieldType { field: &'static str },

    #[error("'{0}' requires a JSON payload")]
    MissingPayload(&'static str),
}
