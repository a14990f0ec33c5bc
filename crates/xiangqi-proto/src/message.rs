use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Coord, ProtocolError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    /// Search depth passed to the engine's `go depth <d>` command.
    pub fn depth(self) -> u32 {
        match self {
            Difficulty::Easy => 3,
            Difficulty::Medium => 5,
            Difficulty::Hard => 8,
        }
    }

    /// Soft per-query time budget; the bridge's hard deadline adds slack on
    /// top of this (see the AI bridge's query timeout).
    pub fn soft_time_ms(self) -> u64 {
        match self {
            Difficulty::Easy => 500,
            Difficulty::Medium => 1_000,
            Difficulty::Hard => 2_000,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Difficulty::Easy => "ai_easy",
            Difficulty::Medium => "ai_medium",
            Difficulty::Hard => "ai_hard",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoginPayload {
    pub username: String,
    pub password: String,
}

/// Shared by `CHALLENGE_REQUEST` and `CHALLENGE_CANCEL`: the client fills
/// `to_user`, a server forward fills `from_user` (never both).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChallengeRequestPayload {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub to_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub from_user: Option<String>,
}

pub type ChallengeCancelPayload = ChallengeRequestPayload;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChallengeResponsePayload {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub to_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub from_user: Option<String>,
    pub accept: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AiMatchPayload {
    pub gamemode: Difficulty,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GameStartPayload {
    pub opponent: String,
    pub game_mode: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub opponent_data: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MovePayload {
    pub piece: String,
    pub from: Coord,
    pub to: Coord,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvalidMovePayload {
    pub reason: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GameEndPayload {
    pub win_side: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DrawResponsePayload {
    pub accept_draw: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RematchResponsePayload {
    pub accept_rematch: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserStatsPayload {
    pub target_username: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub time_control: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GameHistoryPayload {
    pub target_username: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplayRequestPayload {
    pub game_id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FriendRequestPayload {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub to_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub from_user: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FriendResponsePayload {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub to_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub from_user: Option<String>,
    pub accept: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnfriendPayload {
    pub to_user: String,
}

/// The full tagged-union message schema. Each variant corresponds to one
/// command token on the wire; the parse side is fail-closed (§4.2): an
/// unrecognised token or a payload missing/mistyping a required field
/// produces a `ProtocolError` rather than a partially-populated variant.
#[derive(Clone, Debug)]
pub enum MessageKind {
    Login(LoginPayload),
    Register(LoginPayload),
    Authenticated,
    Logout { username: String },
    PlayerList,
    UserStats(UserStatsPayload),
    LeaderBoard,
    ChallengeRequest(ChallengeRequestPayload),
    ChallengeCancel(ChallengeCancelPayload),
    ChallengeResponse(ChallengeResponsePayload),
    QuickMatching,
    CancelQm,
    AiMatch(AiMatchPayload),
    GameStart(GameStartPayload),
    Move(MovePayload),
    InvalidMove(InvalidMovePayload),
    SuggestMoveRequest,
    SuggestMoveReply(MovePayload),
    GameEnd(GameEndPayload),
    Resign,
    DrawRequest,
    RematchRequest,
    DrawResponse(DrawResponsePayload),
    RematchResponse(RematchResponsePayload),
    Chat { message: String },
    RequestAddFriend(FriendRequestPayload),
    ResponseAddFriend(FriendResponsePayload),
    Unfriend(UnfriendPayload),
    GameHistory(GameHistoryPayload),
    ReplayRequest(ReplayRequestPayload),
    Info(Value),
    Error { message: String },
}

impl MessageKind {
    /// The ASCII command token for this kind, as it appears on the wire.
    pub fn token(&self) -> &'static str {
        match self {
            MessageKind::Login(_) => "LOGIN",
            MessageKind::Register(_) => "REGISTER",
            MessageKind::Authenticated => "AUTHENTICATED",
            MessageKind::Logout { .. } => "LOGOUT",
            MessageKind::PlayerList => "PLAYER_LIST",
            MessageKind::UserStats(_) => "USER_STATS",
            MessageKind::LeaderBoard => "LEADER_BOARD",
            MessageKind::ChallengeRequest(_) => "CHALLENGE_REQUEST",
            MessageKind::ChallengeCancel(_) => "CHALLENGE_CANCEL",
            MessageKind::ChallengeResponse(_) => "CHALLENGE_RESPONSE",
            MessageKind::QuickMatching => "QUICK_MATCHING",
            MessageKind::CancelQm => "CANCEL_QM",
            MessageKind::AiMatch(_) => "AI_MATCH",
            MessageKind::GameStart(_) => "GAME_START",
            MessageKind::Move(_) => "MOVE",
            MessageKind::InvalidMove(_) => "INVALID_MOVE",
            MessageKind::SuggestMoveRequest | MessageKind::SuggestMoveReply(_) => "SUGGEST_MOVE",
            MessageKind::GameEnd(_) => "GAME_END",
            MessageKind::Resign => "RESIGN",
            MessageKind::DrawRequest => "DRAW_REQUEST",
            MessageKind::RematchRequest => "REMATCH_REQUEST",
            MessageKind::DrawResponse(_) => "DRAW_RESPONSE",
            MessageKind::RematchResponse(_) => "REMATCH_RESPONSE",
            MessageKind::Chat { .. } => "MESSAGE",
            MessageKind::RequestAddFriend(_) => "REQUEST_ADD_FRIEND",
            MessageKind::ResponseAddFriend(_) => "RESPONSE_ADD_FRIEND",
            MessageKind::Unfriend(_) => "UNFRIEND",
            MessageKind::GameHistory(_) => "GAME_HISTORY",
            MessageKind::ReplayRequest(_) => "REPLAY_REQUEST",
            MessageKind::Info(_) => "INFO",
            MessageKind::Error { .. } => "ERROR",
        }
    }

    /// Parses one frame body (`TOKEN` or `TOKEN {json}`) into a typed
    /// message. Fails closed on any unknown token or malformed/missing
    /// field per §4.2.
    pub fn parse(body: &str) -> Result<Self, ProtocolError> {
        let (token, rest) = match body.split_once(' ') {
            Some((t, r)) => (t, r.trim_start()),
            None => (body, ""),
        };

        let json = |field_owner: &'static str| -> Result<Value, ProtocolError> {
            if rest.is_empty() {
                return Err(ProtocolError::MissingPayload(field_owner));
            }
            serde_json::from_str(rest).map_err(ProtocolError::from)
        };

        match token {
            "LOGIN" => Ok(MessageKind::Login(from_value(json("LOGIN")?)?)),
            "REGISTER" => Ok(MessageKind::Register(from_value(json("REGISTER")?)?)),
            "AUTHENTICATED" => Ok(MessageKind::Authenticated),
            "LOGOUT" => {
                let v = json("LOGOUT")?;
                let username = field_str(&v, "username")?;
                Ok(MessageKind::Logout { username })
            }
            "PLAYER_LIST" => Ok(MessageKind::PlayerList),
            "USER_STATS" => Ok(MessageKind::UserStats(from_value(json("USER_STATS")?)?)),
            "LEADER_BOARD" => Ok(MessageKind::LeaderBoard),
            "CHALLENGE_REQUEST" => Ok(MessageKind::ChallengeRequest(parse_optional(rest)?)),
            "CHALLENGE_CANCEL" => Ok(MessageKind::ChallengeCancel(parse_optional(rest)?)),
            "CHALLENGE_RESPONSE" => {
                Ok(MessageKind::ChallengeResponse(from_value(json("CHALLENGE_RESPONSE")?)?))
            }
            "QUICK_MATCHING" => Ok(MessageKind::QuickMatching),
            "CANCEL_QM" => Ok(MessageKind::CancelQm),
            "AI_MATCH" => Ok(MessageKind::AiMatch(from_value(json("AI_MATCH")?)?)),
            "GAME_START" => Ok(MessageKind::GameStart(from_value(json("GAME_START")?)?)),
            "MOVE" => Ok(MessageKind::Move(from_value(json("MOVE")?)?)),
            "INVALID_MOVE" => Ok(MessageKind::InvalidMove(from_value(json("INVALID_MOVE")?)?)),
            "SUGGEST_MOVE" => {
                if rest.is_empty() {
                    Ok(MessageKind::SuggestMoveRequest)
                } else {
                    Ok(MessageKind::SuggestMoveReply(from_value(json("SUGGEST_MOVE")?)?))
                }
            }
            "GAME_END" => Ok(MessageKind::GameEnd(from_value(json("GAME_END")?)?)),
            "RESIGN" => Ok(MessageKind::Resign),
            "DRAW_REQUEST" => Ok(MessageKind::DrawRequest),
            "REMATCH_REQUEST" => Ok(MessageKind::RematchRequest),
            "DRAW_RESPONSE" => Ok(MessageKind::DrawResponse(from_value(json("DRAW_RESPONSE")?)?)),
            "REMATCH_RESPONSE" => {
                Ok(MessageKind::RematchResponse(from_value(json("REMATCH_RESPONSE")?)?))
            }
            "MESSAGE" => {
                let v = json("MESSAGE")?;
                let message = field_str(&v, "message")?;
                Ok(MessageKind::Chat { message })
            }
            "REQUEST_ADD_FRIEND" => Ok(MessageKind::RequestAddFriend(parse_optional(rest)?)),
            "RESPONSE_ADD_FRIEND" => {
                Ok(MessageKind::ResponseAddFriend(from_value(json("RESPONSE_ADD_FRIEND")?)?))
            }
            "UNFRIEND" => Ok(MessageKind::Unfriend(from_value(json("UNFRIEND")?)?)),
            "GAME_HISTORY" => Ok(MessageKind::GameHistory(from_value(json("GAME_HISTORY")?)?)),
            "REPLAY_REQUEST" => {
                Ok(MessageKind::ReplayRequest(from_value(json("REPLAY_REQUEST")?)?))
            }
            "INFO" => Ok(MessageKind::Info(json("INFO")?)),
            "ERROR" => {
                let v = json("ERROR")?;
                let message = field_str(&v, "message")?;
                Ok(MessageKind::Error { message })
            }
            other => Err(ProtocolError::UnknownToken(other.to_owned())),
        }
    }

    /// Renders this message back to its wire form: `TOKEN` or `TOKEN {json}`.
    pub fn encode(&self) -> String {
        let token = self.token();
        match self.payload_json() {
            Some(json) => format!("{token} {json}"),
            None => token.to_owned(),
        }
    }

    fn payload_json(&self) -> Option<Value> {
        match self {
            MessageKind::Login(p) | MessageKind::Register(p) => Some(to_value(p)),
            MessageKind::Authenticated
            | MessageKind::PlayerList
            | MessageKind::LeaderBoard
            | MessageKind::QuickMatching
            | MessageKind::CancelQm
            | MessageKind::SuggestMoveRequest
            | MessageKind::Resign
            | MessageKind::DrawRequest
            | MessageKind::RematchRequest => None,
            MessageKind::Logout { username } => Some(serde_json::json!({ "username": username })),
            MessageKind::UserStats(p) => Some(to_value(p)),
            MessageKind::ChallengeRequest(p) | MessageKind::ChallengeCancel(p) => Some(to_value(p)),
            MessageKind::ChallengeResponse(p) => Some(to_value(p)),
            MessageKind::AiMatch(p) => Some(to_value(p)),
            MessageKind::GameStart(p) => Some(to_value(p)),
            MessageKind::Move(p) | MessageKind::SuggestMoveReply(p) => Some(to_value(p)),
            MessageKind::InvalidMove(p) => Some(to_value(p)),
            MessageKind::GameEnd(p) => Some(to_value(p)),
            MessageKind::DrawResponse(p) => Some(to_value(p)),
            MessageKind::RematchResponse(p) => Some(to_value(p)),
            MessageKind::Chat { message } => Some(serde_json::json!({ "message": message })),
            MessageKind::RequestAddFriend(p) => Some(to_value(p)),
            MessageKind::ResponseAddFriend(p) => Some(to_value(p)),
            MessageKind::Unfriend(p) => Some(to_value(p)),
            MessageKind::GameHistory(p) => Some(to_value(p)),
            MessageKind::ReplayRequest(p) => Some(to_value(p)),
            MessageKind::Info(v) => Some(v.clone()),
            MessageKind::Error { message } => Some(serde_json::json!({ "message": message })),
        }
    }
}

fn to_value<T: Serialize>(p: &T) -> Value {
    serde_json::to_value(p).expect("payload types always serialise")
}

fn from_value<T: for<'de> Deserialize<'de>>(v: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(v).map_err(ProtocolError::from)
}

fn field_str(v: &Value, field: &'static str) -> Result<String, ProtocolError> {
    v.get(field)
        .ok_or(ProtocolError::MissingField(field))?
        .as_str()
        .ok_or(ProtocolError::WrongFieldType { field })
        .map(str::to_owned)
}

/// Parses `{to_user}` / `{from_user}`-shaped payloads that also tolerate an
/// empty body (used by forwarded CHALLENGE_REQUEST/CHALLENGE_CANCEL variants
/// where only one side of the pair is ever populated).
fn parse_optional<T: for<'de> Deserialize<'de> + Default>(rest: &str) -> Result<T, ProtocolError> {
    if rest.is_empty() { Ok(T::default()) } else { from_value(serde_json::from_str(rest)?) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_login() {
        let msg = MessageKind::parse(r#"LOGIN {"username":"alice","password":"x"}"#).unwrap();
        match msg {
            MessageKind::Login(p) => {
                assert_eq!(p.username, "alice");
                assert_eq!(p.password, "x");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_token_is_rejected() {
        assert!(matches!(
            MessageKind::parse("NOT_A_REAL_COMMAND"),
            Err(ProtocolError::UnknownToken(_))
        ));
    }

    #[test]
    fn missing_field_is_rejected() {
        let err = MessageKind::parse(r#"LOGIN {"username":"alice"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedJson(_)));
    }

    #[test]
    fn move_round_trips() {
        let original = MessageKind::Move(MovePayload {
            piece: "P".to_owned(),
            from: Coord { row: 3, col: 0 },
            to: Coord { row: 4, col: 0 },
        });
        let wire = original.encode();
        let parsed = MessageKind::parse(&wire).unwrap();
        match parsed {
            MessageKind::Move(p) => {
                assert_eq!(p.piece, "P");
                assert_eq!(p.from, Coord { row: 3, col: 0 });
                assert_eq!(p.to, Coord { row: 4, col: 0 });
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn challenge_request_forward_only_emits_from_user() {
        let msg = MessageKind::ChallengeRequest(ChallengeRequestPayload {
            to_user: None,
            from_user: Some("alice".to_owned()),
        });
        assert_eq!(msg.encode(), r#"CHALLENGE_REQUEST {"from_user":"alice"}"#);
    }

    #[test]
    fn empty_payload_kinds_encode_without_body() {
        assert_eq!(MessageKind::Resign.encode(), "RESIGN");
        assert_eq!(MessageKind::parse("RESIGN").unwrap().token(), "RESIGN");
    }
}
