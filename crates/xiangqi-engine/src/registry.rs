use std::collections::HashMap;

use tracing::{debug, info};

use crate::error::AuthError;
use crate::game::Side;

/// Opaque connection handle (§3). `-1` is the sentinel used for "no
/// opponent" / "opponent is the AI" (§3 Session, GLOSSARY).
pub type ConnHandle = i64;

pub const NO_OPPONENT: ConnHandle = -1;

/// The server's in-memory record about a connected client, authenticated or
/// not (§3 Session).
#[derive(Clone, Debug)]
pub struct Session {
    pub handle: ConnHandle,
    pub username: String,
    pub in_game: bool,
    pub opponent: ConnHandle,
    /// The opponent of the most recently finished game, kept around after
    /// `end_game` clears `opponent` so a post-game REMATCH_REQUEST still has
    /// someone to reach (§4.7: "not a third code path, just Creation invoked
    /// with the two usernames reversed").
    pub last_opponent: ConnHandle,
    pub side: Option<Side>,
    pub avatar_id: i64,
}

impl Session {
    fn anonymous(handle: ConnHandle) -> Self {
        Self {
            handle,
            username: String::new(),
            in_game: false,
            opponent: NO_OPPONENT,
            last_opponent: NO_OPPONENT,
            side: None,
            avatar_id: 0,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        !self.username.is_empty()
    }
}

/// Process-wide mapping of connection handle <-> session and username <->
/// connection handle (§4.3). All mutations take one lock (the caller is
/// expected to hold a `Mutex<Registry>`); this type is not internally
/// synchronized, matching the lock-ordering discipline in §5 (registry lock
/// taken first, then the game lock, then the AI mutex, never the reverse).
#[derive(Default)]
pub struct Registry {
    sessions: HashMap<ConnHandle, Session>,
    by_username: HashMap<String, ConnHandle>,
}

/// Returned by `disconnect`/`logout` so the caller can notify an opponent
/// and abandon a game without re-entering the registry lock (§4.3, §4.7).
pub struct Departure {
    pub session: Session,
    pub opponent: Option<ConnHandle>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, handle: ConnHandle) {
        self.sessions.insert(handle, Session::anonymous(handle));
    }

    pub fn get(&self, handle: ConnHandle) -> Option<&Session> {
        self.sessions.get(&handle)
    }

    pub fn get_mut(&mut self, handle: ConnHandle) -> Option<&mut Session> {
        self.sessions.get_mut(&handle)
    }

    pub fn handle_for(&self, username: &str) -> Option<ConnHandle> {
        self.by_username.get(username).copied()
    }

    pub fn session_for(&self, username: &str) -> Option<&Session> {
        self.handle_for(username).and_then(|h| self.sessions.get(&h))
    }

    /// Binds `username` to `handle`. Rejects a collision with a different
    /// live handle (§4.3's username-collision policy); re-login of the same
    /// handle under a new name releases the old binding first.
    pub fn login(&mut self, handle: ConnHandle, username: &str) -> Result<(), AuthError> {
        if let Some(&existing) = self.by_username.get(username) {
            if existing != handle {
                return Err(AuthError::UsernameTaken);
            }
            return Ok(());
        }
        let Some(session) = self.sessions.get_mut(&handle) else {
            return Err(AuthError::UsernameTaken);
        };
        if !session.username.is_empty() {
            self.by_username.remove(&session.username);
        }
        session.username = username.to_owned();
        self.by_username.insert(username.to_owned(), handle);
        info!(%username, ?handle, "login");
        Ok(())
    }

    /// Checks the protocol-level authorization rule: a `username` field
    /// carried in a message must agree with the sender's bound identity
    /// (§4.3).
    pub fn authorize(&self, handle: ConnHandle, claimed_username: &str) -> Result<(), AuthError> {
        match self.sessions.get(&handle) {
            Some(s) if s.username.is_empty() => Err(AuthError::NotAuthenticated),
            Some(s) if s.username == claimed_username => Ok(()),
            Some(_) => Err(AuthError::IdentityMismatch),
            None => Err(AuthError::NotAuthenticated),
        }
    }

    pub fn require_authenticated(&self, handle: ConnHandle) -> Result<&Session, AuthError> {
        match self.sessions.get(&handle) {
            Some(s) if s.is_authenticated() => Ok(s),
            _ => Err(AuthError::NotAuthenticated),
        }
    }

    /// Cross-links two sessions as opponents and marks both `in_game`
    /// (§4.6 CHALLENGE_RESPONSE / quick-match pairing).
    pub fn start_game(&mut self, a: ConnHandle, a_side: Side, b: ConnHandle, b_side: Side) {
        if let Some(s) = self.sessions.get_mut(&a) {
            s.in_game = true;
            s.opponent = b;
            s.last_opponent = b;
            s.side = Some(a_side);
        }
        if let Some(s) = self.sessions.get_mut(&b) {
            s.in_game = true;
            s.opponent = a;
            s.last_opponent = a;
            s.side = Some(b_side);
        }
    }

    /// Marks a session in a game against the AI (opponent handle is the
    /// `-1` sentinel, §3/§4.6 AI_MATCH).
    pub fn start_ai_game(&mut self, handle: ConnHandle, side: Side) {
        if let Some(s) = self.sessions.get_mut(&handle) {
            s.in_game = true;
            s.opponent = NO_OPPONENT;
            s.side = Some(side);
        }
    }

    /// Clears the in-game linkage on both sides after a game ends, leaving
    /// the sessions bound but idle.
    pub fn end_game(&mut self, handle: ConnHandle) {
        let opponent = self.sessions.get(&handle).map(|s| s.opponent);
        if let Some(s) = self.sessions.get_mut(&handle) {
            s.in_game = false;
            s.opponent = NO_OPPONENT;
            s.side = None;
        }
        if let Some(opponent) = opponent {
            if opponent != NO_OPPONENT {
                if let Some(s) = self.sessions.get_mut(&opponent) {
                    s.in_game = false;
                    s.opponent = NO_OPPONENT;
                    s.side = None;
                }
            }
        }
    }

    /// Tears down `handle`'s session: unbinds the username and, if it was
    /// `in_game`, clears the opponent's linkage too, returning the opponent
    /// handle so the caller can notify it and abandon the game (§4.3).
    pub fn disconnect(&mut self, handle: ConnHandle) -> Option<Departure> {
        let session = self.sessions.remove(&handle)?;
        if !session.username.is_empty() {
            if self.by_username.get(&session.username) == Some(&handle) {
                self.by_username.remove(&session.username);
            }
        }
        let opponent = if session.in_game && session.opponent != NO_OPPONENT {
            if let Some(opp) = self.sessions.get_mut(&session.opponent) {
                opp.in_game = false;
                opp.opponent = NO_OPPONENT;
                opp.side = None;
            }
            Some(session.opponent)
        } else {
            None
        };
        debug!(handle, username = %session.username, "session removed");
        Some(Departure { session, opponent })
    }

    /// Unbinds `handle`'s username without destroying the session, clearing
    /// game linkage the same way `disconnect` does (§4.6 LOGOUT: "unbind;
    /// if in a game, abandon it, same effect as peer disconnect"). The
    /// connection stays registered and may log back in under a new name.
    pub fn logout(&mut self, handle: ConnHandle) -> Option<Departure> {
        let session = self.sessions.get(&handle)?.clone();
        if session.username.is_empty() {
            return None;
        }
        if self.by_username.get(&session.username) == Some(&handle) {
            self.by_username.remove(&session.username);
        }
        let opponent = if session.in_game && session.opponent != NO_OPPONENT {
            if let Some(opp) = self.sessions.get_mut(&session.opponent) {
                opp.in_game = false;
                opp.opponent = NO_OPPONENT;
                opp.side = None;
            }
            Some(session.opponent)
        } else {
            None
        };
        if let Some(s) = self.sessions.get_mut(&handle) {
            s.username.clear();
            s.in_game = false;
            s.opponent = NO_OPPONENT;
            s.side = None;
        }
        info!(handle, "logout");
        Some(Departure { session, opponent })
    }

    pub fn player_count(&self) -> usize {
        self.by_username.len()
    }

    pub fn usernames(&self) -> impl Iterator<Item = &str> {
        self.by_username.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_rejects_collision_from_a_different_handle() {
        let mut reg = Registry::new();
        reg.accept(1);
        reg.accept(2);
        reg.login(1, "alice").unwrap();
        let err = reg.login(2, "alice").unwrap_err();
        assert!(matches!(err, AuthError::UsernameTaken));
    }

    #[test]
    fn disconnect_clears_opponent_linkage_exactly_once() {
        let mut reg = Registry::new();
        reg.accept(1);
        reg.accept(2);
        reg.login(1, "alice").unwrap();
        reg.login(2, "bob").unwrap();
        reg.start_game(1, Side::Red, 2, Side::Black);

        let departure = reg.disconnect(1).unwrap();
        assert_eq!(departure.opponent, Some(2));
        assert!(!reg.get(2).unwrap().in_game);

        // Re-entering the disconnect path for an already-removed handle is a
        // no-op, so the opponent is only ever notified once.
        assert!(reg.disconnect(1).is_none());
    }

    #[test]
    fn identity_mismatch_is_rejected() {
        let mut reg = Registry::new();
        reg.accept(1);
        reg.login(1, "alice").unwrap();
        assert!(matches!(reg.authorize(1, "alice"), Ok(())));
        assert!(matches!(reg.authorize(1, "mallory"), Err(AuthError::IdentityMismatch)));
    }
}
