use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use xiangqi_proto::{Coord, MovePayload};
use xiangqi_timing::Instant;

use crate::error::StateError;

pub const STARTING_XFEN: &str = "rnbakabnr/9/1c5c1/p1p1p1p1p/9/9/P1P1P1P1P/1C5C1/9/RNBAKABNR w - - 0 1";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    Red,
    Black,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Red => Side::Black,
            Side::Black => Side::Red,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Red => "red",
            Side::Black => "black",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeControl {
    Bullet,
    Blitz,
    Classical,
}

impl TimeControl {
    pub fn parse(s: &str) -> TimeControl {
        match s {
            "bullet" => TimeControl::Bullet,
            "classical" => TimeControl::Classical,
            _ => TimeControl::Blitz,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimeControl::Bullet => "bullet",
            TimeControl::Blitz => "blitz",
            TimeControl::Classical => "classical",
        }
    }

    /// `(initial_seconds, increment_seconds)`.
    pub fn clock(self) -> (u32, u32) {
        match self {
            TimeControl::Bullet => (180, 2),
            TimeControl::Blitz => (300, 3),
            TimeControl::Classical => (900, 5),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GameResult {
    RedWin,
    BlackWin,
    Draw,
}

impl GameResult {
    pub fn win_side(self) -> &'static str {
        match self {
            GameResult::RedWin => "red",
            GameResult::BlackWin => "black",
            GameResult::Draw => "draw",
        }
    }

    /// Actual score contributed to `red`'s Elo update; `black`'s is `1 - this`.
    pub fn red_score(self) -> f64 {
        match self {
            GameResult::RedWin => 1.0,
            GameResult::BlackWin => 0.0,
            GameResult::Draw => 0.5,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GameStatus {
    InProgress,
    Completed,
    Abandoned,
}

#[derive(Clone, Debug)]
pub struct Move {
    pub seq: u32,
    pub author: String,
    pub from: Coord,
    pub to: Coord,
    pub piece: String,
    pub captured: String,
    pub notation: String,
    pub xfen_after: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub time_taken_secs: u32,
}

pub struct ActiveGame {
    pub id: String,
    pub red: String,
    pub black: String,
    pub xfen: String,
    pub whose_turn: Side,
    pub moves: Vec<Move>,
    pub time_control: TimeControl,
    pub red_time_remaining: u32,
    pub black_time_remaining: u32,
    pub increment: u32,
    pub rated: bool,
    pub status: GameStatus,
    pub result: Option<GameResult>,
    pub pending_draw_offer_by: Option<String>,
    pub pending_draw_offer_at: Option<DateTime<Utc>>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub is_ai_game: bool,
    board: Vec<Vec<Option<char>>>,
    /// Wall-clock mark of the instant `whose_turn`'s clock started running;
    /// reset on every accepted move (§4.7 MOVE: "deduct consumed time from
    /// the mover's clock"). Dead-reckoned rather than client-reported so a
    /// dishonest client cannot under-report its own elapsed time.
    turn_started: Instant,
}

impl ActiveGame {
    pub fn player_side(&self, username: &str) -> Option<Side> {
        if self.red == username {
            Some(Side::Red)
        } else if self.black == username {
            Some(Side::Black)
        } else {
            None
        }
    }

    pub fn username_for(&self, side: Side) -> &str {
        match side {
            Side::Red => &self.red,
            Side::Black => &self.black,
        }
    }

    pub fn opponent_of(&self, username: &str) -> Option<&str> {
        self.player_side(username).map(|s| self.username_for(s.opposite()))
    }
}

fn fresh_id(counter: &mut u64) -> String {
    *counter += 1;
    format!("g{counter}")
}

fn in_bounds(c: Coord) -> bool {
    c.in_bounds()
}

/// Expands an XFEN board field (the part before the first space) into a
/// 10x9 grid of occupants, used only for the origin-occupancy/color sanity
/// check in `apply_move` (§4.7 MOVE preconditions) — not a move-generator.
///
/// XFEN ranks run top (black's back rank) to bottom (red's back rank), but
/// the wire coordinate convention (`crates/xiangqi-proto/src/coord.rs`) puts
/// red at the low rows and black at the high ones, so rank index `i` lands
/// at `row = 9 - i`.
fn parse_board(xfen: &str) -> Vec<Vec<Option<char>>> {
    let board_field = xfen.split(' ').next().unwrap_or(xfen);
    let mut ranks: Vec<Vec<Option<char>>> = board_field
        .split('/')
        .map(|row| {
            let mut cells = Vec::with_capacity(9);
            for ch in row.chars() {
                if let Some(run) = ch.to_digit(10) {
                    for _ in 0..run {
                        cells.push(None);
                    }
                } else {
                    cells.push(Some(ch));
                }
            }
            cells
        })
        .collect();
    ranks.reverse();
    ranks
}

fn piece_side(piece: char) -> Side {
    if piece.is_ascii_uppercase() { Side::Red } else { Side::Black }
}

/// Owns every active game and the reverse `username -> game_id` lookup
/// (one entry per player, §4.7). Protected by a single coarse lock in the
/// registry/dispatch layer, as the spec's lock-ordering section describes;
/// this type itself is not internally synchronized.
pub struct GameManager {
    games: HashMap<String, ActiveGame>,
    by_player: HashMap<String, String>,
    next_id: u64,
}

impl Default for GameManager {
    fn default() -> Self {
        Self::new()
    }
}

impl GameManager {
    pub fn new() -> Self {
        Self { games: HashMap::new(), by_player: HashMap::new(), next_id: 0 }
    }

    pub fn get(&self, game_id: &str) -> Option<&ActiveGame> {
        self.games.get(game_id)
    }

    pub fn game_for_player(&self, username: &str) -> Option<&ActiveGame> {
        self.by_player.get(username).and_then(|id| self.games.get(id))
    }

    pub fn game_id_for_player(&self, username: &str) -> Option<&str> {
        self.by_player.get(username).map(String::as_str)
    }

    /// Creates a fresh game between `red`/`black`. Side assignment is the
    /// caller's responsibility (coin-flip for quick-match, fixed for direct
    /// challenge accept, per §4.6).
    pub fn create_game(
        &mut self,
        red: &str,
        black: &str,
        time_control: TimeControl,
        rated: bool,
        is_ai_game: bool,
    ) -> &ActiveGame {
        let id = fresh_id(&mut self.next_id);
        let (initial, increment) = time_control.clock();
        let game = ActiveGame {
            id: id.clone(),
            red: red.to_owned(),
            black: black.to_owned(),
            xfen: STARTING_XFEN.to_owned(),
            whose_turn: Side::Red,
            moves: Vec::new(),
            time_control,
            red_time_remaining: initial,
            black_time_remaining: initial,
            increment,
            rated,
            status: GameStatus::InProgress,
            result: None,
            pending_draw_offer_by: None,
            pending_draw_offer_at: None,
            start_time: Utc::now(),
            end_time: None,
            is_ai_game,
            board: parse_board(STARTING_XFEN),
            turn_started: Instant::now(),
        };
        info!(game_id = %id, %red, %black, rated, "game created");
        self.by_player.insert(red.to_owned(), id.clone());
        self.by_player.insert(black.to_owned(), id.clone());
        self.games.insert(id.clone(), game);
        self.games.get(&id).expect("just inserted")
    }

    /// Validates and applies a move. Returns the mover's opponent username
    /// and whether this was the game's AI opponent on success.
    ///
    /// The time consumed off the mover's clock is dead-reckoned from
    /// `turn_started` rather than taken as an argument, so it reflects
    /// actual wall-clock elapsed time regardless of what (if anything) the
    /// client claims (§4.7 MOVE).
    pub fn apply_move(&mut self, username: &str, payload: &MovePayload) -> Result<MoveOutcome, StateError> {
        let game_id = self.by_player.get(username).cloned().ok_or(StateError::NotInGame)?;
        let game = self.games.get_mut(&game_id).ok_or(StateError::NotInGame)?;

        if game.status != GameStatus::InProgress {
            return Err(StateError::GameNotInProgress);
        }
        let side = game.player_side(username).ok_or(StateError::NotInGame)?;
        if side != game.whose_turn {
            return Err(StateError::NotYourTurn);
        }
        if !in_bounds(payload.from) || !in_bounds(payload.to) {
            return Err(StateError::InvalidCoordinates);
        }
        if payload.from == payload.to {
            return Err(StateError::TrivialMove);
        }
        let origin = game.board[payload.from.row as usize][payload.from.col as usize];
        match origin {
            Some(piece) if piece_side(piece) == side => {}
            _ => return Err(StateError::NoPieceAtOrigin),
        }

        let seq = game.moves.len() as u32 + 1;
        let time_taken_secs = game.turn_started.elapsed().as_secs_f64().round() as u32;
        let (clock, other_clock) = match side {
            Side::Red => (&mut game.red_time_remaining, &mut game.black_time_remaining),
            Side::Black => (&mut game.black_time_remaining, &mut game.red_time_remaining),
        };
        let _ = other_clock;
        *clock = clock.saturating_sub(time_taken_secs) + game.increment;

        game.board[payload.to.row as usize][payload.to.col as usize] = origin;
        game.board[payload.from.row as usize][payload.from.col as usize] = None;

        game.moves.push(Move {
            seq,
            author: username.to_owned(),
            from: payload.from,
            to: payload.to,
            piece: payload.piece.clone(),
            captured: String::new(),
            notation: String::new(),
            xfen_after: None,
            timestamp: Utc::now(),
            time_taken_secs,
        });
        game.whose_turn = side.opposite();
        game.turn_started = Instant::now();
        debug!(game_id = %game.id, %username, seq, time_taken_secs, "move applied");

        let opponent = game.opponent_of(username).map(str::to_owned);
        Ok(MoveOutcome { game_id, is_ai_game: game.is_ai_game, opponent, time_taken_secs })
    }

    pub fn offer_draw(&mut self, username: &str) -> Result<(String, String), StateError> {
        let game_id = self.by_player.get(username).cloned().ok_or(StateError::NotInGame)?;
        let game = self.games.get_mut(&game_id).ok_or(StateError::NotInGame)?;
        if game.status != GameStatus::InProgress {
            return Err(StateError::GameNotInProgress);
        }
        let opponent = game.opponent_of(username).ok_or(StateError::NotInGame)?.to_owned();
        game.pending_draw_offer_by = Some(username.to_owned());
        game.pending_draw_offer_at = Some(Utc::now());
        Ok((game_id, opponent))
    }

    /// Draw offers expire after this long; a stale offer is treated as if
    /// none were pending (§4.7 DRAW_REQUEST "set a TTL (5 minutes)").
    const DRAW_OFFER_TTL_SECS: i64 = 300;

    pub fn respond_draw(
        &mut self,
        username: &str,
        accept: bool,
    ) -> Result<DrawOutcome, StateError> {
        let game_id = self.by_player.get(username).cloned().ok_or(StateError::NotInGame)?;
        let game = self.games.get_mut(&game_id).ok_or(StateError::NotInGame)?;
        let offerer = match &game.pending_draw_offer_by {
            Some(u) if u != username => u.clone(),
            _ => return Err(StateError::NoPendingDrawOffer),
        };
        if let Some(offered_at) = game.pending_draw_offer_at {
            if (Utc::now() - offered_at).num_seconds() > Self::DRAW_OFFER_TTL_SECS {
                game.pending_draw_offer_by = None;
                game.pending_draw_offer_at = None;
                return Err(StateError::NoPendingDrawOffer);
            }
        }
        game.pending_draw_offer_by = None;
        game.pending_draw_offer_at = None;
        if accept {
            Ok(DrawOutcome::Accepted(game_id))
        } else {
            Ok(DrawOutcome::Declined(offerer))
        }
    }

    pub fn resign(&mut self, username: &str) -> Result<String, StateError> {
        let game_id = self.by_player.get(username).cloned().ok_or(StateError::NotInGame)?;
        let game = self.games.get(&game_id).ok_or(StateError::NotInGame)?;
        let side = game.player_side(username).ok_or(StateError::NotInGame)?;
        let result = match side {
            Side::Red => GameResult::BlackWin,
            Side::Black => GameResult::RedWin,
        };
        self.terminate(&game_id, GameStatus::Completed, result);
        Ok(game_id)
    }

    /// Terminates the game abruptly for `username`'s disconnect, if they
    /// were in one: the remaining side wins, status is `abandoned` rather
    /// than `completed` (§4.7).
    pub fn abandon_for_disconnect(&mut self, username: &str) -> Option<(String, String)> {
        let game_id = self.by_player.get(username)?.clone();
        let game = self.games.get(&game_id)?;
        let side = game.player_side(username)?;
        let remaining = game.opponent_of(username)?.to_owned();
        let result = match side {
            Side::Red => GameResult::BlackWin,
            Side::Black => GameResult::RedWin,
        };
        self.terminate(&game_id, GameStatus::Abandoned, result);
        Some((game_id, remaining))
    }

    fn terminate(&mut self, game_id: &str, status: GameStatus, result: GameResult) {
        let Some(game) = self.games.get_mut(game_id) else {
            return;
        };
        if game.status != GameStatus::InProgress {
            warn!(game_id, "terminate called on a non-active game, ignoring");
            return;
        }
        game.status = status;
        game.result = Some(result);
        game.end_time = Some(Utc::now());
        self.by_player.remove(&game.red);
        self.by_player.remove(&game.black);
        info!(game_id, result = result.win_side(), "game terminated");
    }

    pub fn terminate_draw(&mut self, game_id: &str) {
        self.terminate(game_id, GameStatus::Completed, GameResult::Draw);
    }

    /// `GAME_END` reported directly by a client (checkmate/stalemate), per
    /// the state-machine summary in §4.7.
    pub fn terminate_reported(&mut self, username: &str, win_side: &str) -> Option<(String, String)> {
        let game_id = self.by_player.get(username)?.clone();
        let game = self.games.get(&game_id)?;
        let opponent = game.opponent_of(username)?.to_owned();
        let result = match win_side {
            "red" => GameResult::RedWin,
            "black" => GameResult::BlackWin,
            _ => GameResult::Draw,
        };
        self.terminate(&game_id, GameStatus::Completed, result);
        Some((game_id, opponent))
    }
}

pub struct MoveOutcome {
    pub game_id: String,
    pub is_ai_game: bool,
    pub opponent: Option<String>,
    pub time_taken_secs: u32,
}

pub enum DrawOutcome {
    Accepted(String),
    Declined(String),
}

/// K=32 logistic Elo update, the concrete default the rating-update hook
/// exercises in tests and in standalone operation (§4.7).
pub fn elo_update(red_rating: i32, black_rating: i32, result: GameResult) -> (i32, i32) {
    const K: f64 = 32.0;
    let red_expected = 1.0 / (1.0 + 10f64.powf((black_rating - red_rating) as f64 / 400.0));
    let black_expected = 1.0 - red_expected;
    let red_actual = result.red_score();
    let black_actual = 1.0 - red_actual;
    let red_new = red_rating + (K * (red_actual - red_expected)) as i32;
    let black_new = black_rating + (K * (black_actual - black_expected)) as i32;
    (red_new, black_new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_flips_turn_and_increments_count() {
        let mut gm = GameManager::new();
        gm.create_game("alice", "bob", TimeControl::Blitz, true, false);
        // row 3 holds a red pawn in the starting position; red moves first.
        let mv = MovePayload { piece: "P".into(), from: Coord { row: 3, col: 0 }, to: Coord { row: 4, col: 0 } };
        gm.apply_move("alice", &mv).unwrap();
        let game = gm.game_for_player("alice").unwrap();
        assert_eq!(game.whose_turn, Side::Black);
        assert_eq!(game.moves.len(), 1);
    }

    #[test]
    fn wrong_turn_is_rejected() {
        let mut gm = GameManager::new();
        gm.create_game("alice", "bob", TimeControl::Blitz, true, false);
        let mv = MovePayload { piece: "p".into(), from: Coord { row: 6, col: 0 }, to: Coord { row: 5, col: 0 } };
        let err = gm.apply_move("bob", &mv).unwrap_err();
        assert!(matches!(err, StateError::NotYourTurn));
    }

    #[test]
    fn move_from_an_empty_square_is_rejected() {
        let mut gm = GameManager::new();
        gm.create_game("alice", "bob", TimeControl::Blitz, true, false);
        // row 4 is empty in the starting position.
        let mv = MovePayload { piece: "P".into(), from: Coord { row: 4, col: 0 }, to: Coord { row: 3, col: 0 } };
        let err = gm.apply_move("alice", &mv).unwrap_err();
        assert!(matches!(err, StateError::NoPieceAtOrigin));
    }

    #[test]
    fn move_of_the_opponents_piece_is_rejected() {
        let mut gm = GameManager::new();
        gm.create_game("alice", "bob", TimeControl::Blitz, true, false);
        // row 6 holds a black pawn; it is red's (alice's) turn to move.
        let mv = MovePayload { piece: "p".into(), from: Coord { row: 6, col: 0 }, to: Coord { row: 5, col: 0 } };
        let err = gm.apply_move("alice", &mv).unwrap_err();
        assert!(matches!(err, StateError::NoPieceAtOrigin));
    }

    #[test]
    fn terminal_game_does_not_mutate_further() {
        let mut gm = GameManager::new();
        gm.create_game("alice", "bob", TimeControl::Blitz, true, false);
        gm.resign("alice").unwrap();
        let mv = MovePayload { piece: "p".into(), from: Coord { row: 6, col: 0 }, to: Coord { row: 5, col: 0 } };
        let err = gm.apply_move("bob", &mv).unwrap_err();
        assert!(matches!(err, StateError::NotInGame));
    }

    #[test]
    fn elo_favourite_gains_less_on_win() {
        let (fav_new, dog_new) = elo_update(1600, 1200, GameResult::RedWin);
        assert!(fav_new - 1600 < dog_new.abs_diff(1200) as i32);
        assert!(fav_new > 1600);
        assert!(dog_new < 1200);
    }

    #[test]
    fn draw_offer_requires_opponent_response() {
        let mut gm = GameManager::new();
        gm.create_game("alice", "bob", TimeControl::Blitz, true, false);
        gm.offer_draw("alice").unwrap();
        let err = gm.respond_draw("alice", true).unwrap_err();
        assert!(matches!(err, StateError::NoPendingDrawOffer));
        match gm.respond_draw("bob", true).unwrap() {
            DrawOutcome::Accepted(_) => {}
            DrawOutcome::Declined(_) => panic!("expected accepted"),
        }
    }
}
