use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::error::{CacheError, PersistenceError};
use crate::game::{ActiveGame, GameResult, Move, elo_update};

/// A persisted player record (§6 "Collaborator traits").
#[derive(Clone, Debug)]
pub struct UserRecord {
    pub username: String,
    pub password_hash: String,
    pub rating: i32,
    pub games_played: u32,
    pub games_won: u32,
    pub online: bool,
    pub created_at: DateTime<Utc>,
}

/// A persisted completed or in-progress game, as written once at creation
/// and appended to as moves land (§6).
#[derive(Clone, Debug)]
pub struct GameRecord {
    pub id: String,
    pub red: String,
    pub black: String,
    pub moves: Vec<Move>,
    pub result: Option<GameResult>,
    pub rated: bool,
}

/// Abstracts the durable store behind the game/session state machine (§6).
/// The server never talks to Mongo (or whatever the deployment chooses)
/// directly: it calls through this trait, so tests and the in-memory
/// default substitute for a real backend without touching `engine.rs`.
///
/// Every method takes `&self`: implementations are expected to carry their
/// own interior synchronization (a connection pool, a mutex over an
/// in-memory map), mirroring how the collaborator traits in the teacher's
/// `flux-communication` crate hide their backing transport behind a shared
/// reference rather than requiring exclusive access.
pub trait DocumentStore: Send + Sync {
    fn create_user(&self, username: &str, password_hash: &str) -> Result<(), PersistenceError>;
    fn find_user_by_name(&self, username: &str) -> Result<Option<UserRecord>, PersistenceError>;
    fn update_online_status(&self, username: &str, online: bool) -> Result<(), PersistenceError>;

    fn create_game(&self, game: &ActiveGame) -> Result<(), PersistenceError>;
    fn find_game_by_id(&self, game_id: &str) -> Result<Option<GameRecord>, PersistenceError>;
    fn append_move_and_update(&self, game_id: &str, mv: &Move) -> Result<(), PersistenceError>;
    fn end_game(&self, game_id: &str, result: GameResult) -> Result<(), PersistenceError>;

    fn find_games_by_user(&self, username: &str) -> Result<Vec<GameRecord>, PersistenceError>;
    fn update_player_stats(&self, username: &str, rating: i32, won: bool) -> Result<(), PersistenceError>;
    fn get_player_rating(&self, username: &str) -> Result<i32, PersistenceError>;
    fn find_random_opponent(&self, exclude: &str) -> Result<Option<String>, PersistenceError>;
}

/// Abstracts a session-scoped, TTL-bearing cache and its pub/sub channel
/// (§6). The real deployment reaches for Redis; tests and the in-memory
/// default use a bare mutexed map with no actual expiry enforcement.
pub trait SessionCache: Send + Sync {
    fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), CacheError>;
    fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    fn del(&self, key: &str) -> Result<(), CacheError>;
    fn publish(&self, channel: &str, message: &str) -> Result<(), CacheError>;
}

const DEFAULT_STARTING_RATING: i32 = 1200;

#[derive(Default)]
struct InMemoryStoreState {
    users: HashMap<String, UserRecord>,
    games: HashMap<String, GameRecord>,
}

/// In-process default for `DocumentStore`, used when no external database
/// is configured and exercised directly by the engine's unit tests.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<InMemoryStoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for InMemoryStore {
    fn create_user(&self, username: &str, password_hash: &str) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().expect("store mutex poisoned");
        if state.users.contains_key(username) {
            return Err(PersistenceError::Unavailable(format!("user '{username}' already exists")));
        }
        state.users.insert(
            username.to_owned(),
            UserRecord {
                username: username.to_owned(),
                password_hash: password_hash.to_owned(),
                rating: DEFAULT_STARTING_RATING,
                games_played: 0,
                games_won: 0,
                online: false,
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn find_user_by_name(&self, username: &str) -> Result<Option<UserRecord>, PersistenceError> {
        Ok(self.state.lock().expect("store mutex poisoned").users.get(username).cloned())
    }

    fn update_online_status(&self, username: &str, online: bool) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().expect("store mutex poisoned");
        let user = state.users.get_mut(username).ok_or(PersistenceError::NotFound)?;
        user.online = online;
        Ok(())
    }

    fn create_game(&self, game: &ActiveGame) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().expect("store mutex poisoned");
        state.games.insert(
            game.id.clone(),
            GameRecord {
                id: game.id.clone(),
                red: game.red.clone(),
                black: game.black.clone(),
                moves: Vec::new(),
                result: None,
                rated: game.rated,
            },
        );
        Ok(())
    }

    fn find_game_by_id(&self, game_id: &str) -> Result<Option<GameRecord>, PersistenceError> {
        Ok(self.state.lock().expect("store mutex poisoned").games.get(game_id).cloned())
    }

    fn append_move_and_update(&self, game_id: &str, mv: &Move) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().expect("store mutex poisoned");
        let record = state.games.get_mut(game_id).ok_or(PersistenceError::NotFound)?;
        record.moves.push(mv.clone());
        Ok(())
    }

    fn end_game(&self, game_id: &str, result: GameResult) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().expect("store mutex poisoned");
        let record = state.games.get_mut(game_id).ok_or(PersistenceError::NotFound)?;
        record.result = Some(result);
        Ok(())
    }

    fn find_games_by_user(&self, username: &str) -> Result<Vec<GameRecord>, PersistenceError> {
        let state = self.state.lock().expect("store mutex poisoned");
        Ok(state
            .games
            .values()
            .filter(|g| g.red == username || g.black == username)
            .cloned()
            .collect())
    }

    fn update_player_stats(&self, username: &str, rating: i32, won: bool) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().expect("store mutex poisoned");
        let user = state.users.get_mut(username).ok_or(PersistenceError::NotFound)?;
        user.rating = rating;
        user.games_played += 1;
        if won {
            user.games_won += 1;
        }
        Ok(())
    }

    fn get_player_rating(&self, username: &str) -> Result<i32, PersistenceError> {
        let state = self.state.lock().expect("store mutex poisoned");
        Ok(state.users.get(username).map_or(DEFAULT_STARTING_RATING, |u| u.rating))
    }

    fn find_random_opponent(&self, exclude: &str) -> Result<Option<String>, PersistenceError> {
        let state = self.state.lock().expect("store mutex poisoned");
        Ok(state.users.keys().find(|&u| u != exclude).cloned())
    }
}

/// In-process default for `SessionCache`: a mutexed map with no real TTL
/// expiry and a `publish` that is a no-op (no subscribers exist without a
/// real pub/sub backend).
#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionCache for InMemoryCache {
    fn set(&self, key: &str, value: &str, _ttl_secs: u64) -> Result<(), CacheError> {
        self.entries.lock().expect("cache mutex poisoned").insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.entries.lock().expect("cache mutex poisoned").get(key).cloned())
    }

    fn del(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().expect("cache mutex poisoned").remove(key);
        Ok(())
    }

    fn publish(&self, _channel: &str, _message: &str) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Applies the K=32 Elo update for a finished rated game and persists both
/// players' new ratings (§4.7 "Rating update hook"). A no-op for unrated
/// games.
pub fn rating_update_hook(
    store: &dyn DocumentStore,
    red: &str,
    black: &str,
    result: GameResult,
    rated: bool,
) -> Result<(), PersistenceError> {
    if !rated {
        return Ok(());
    }
    let red_rating = store.get_player_rating(red)?;
    let black_rating = store.get_player_rating(black)?;
    let (red_new, black_new) = elo_update(red_rating, black_rating, result);
    store.update_player_stats(red, red_new, matches!(result, GameResult::RedWin))?;
    store.update_player_stats(black, black_new, matches!(result, GameResult::BlackWin))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use xiangqi_proto::Coord;

    #[test]
    fn rating_hook_updates_both_players_on_win() {
        let store = InMemoryStore::new();
        store.create_user("alice", "hash").unwrap();
        store.create_user("bob", "hash").unwrap();
        rating_update_hook(&store, "alice", "bob", GameResult::RedWin, true).unwrap();
        let alice = store.find_user_by_name("alice").unwrap().unwrap();
        let bob = store.find_user_by_name("bob").unwrap().unwrap();
        assert!(alice.rating > DEFAULT_STARTING_RATING);
        assert!(bob.rating < DEFAULT_STARTING_RATING);
        assert_eq!(alice.games_won, 1);
        assert_eq!(bob.games_won, 0);
    }

    #[test]
    fn rating_hook_is_a_no_op_for_unrated_games() {
        let store = InMemoryStore::new();
        store.create_user("alice", "hash").unwrap();
        store.create_user("bob", "hash").unwrap();
        rating_update_hook(&store, "alice", "bob", GameResult::RedWin, false).unwrap();
        assert_eq!(store.find_user_by_name("alice").unwrap().unwrap().rating, DEFAULT_STARTING_RATING);
    }

    #[test]
    fn append_move_requires_existing_game() {
        let store = InMemoryStore::new();
        let mv = Move {
            seq: 1,
            author: "alice".into(),
            from: Coord { row: 0, col: 0 },
            to: Coord { row: 1, col: 0 },
            piece: "R".into(),
            captured: String::new(),
            notation: String::new(),
            xfen_after: None,
            timestamp: Utc::now(),
            time_taken_secs: 1,
        };
        let err = store.append_move_and_update("no-such-game", &mv).unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound));
    }
}
