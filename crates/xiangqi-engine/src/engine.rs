use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rand::Rng;
use tracing::{info, warn};
use xiangqi_proto::{
    AiMatchPayload, ChallengeRequestPayload, ChallengeResponsePayload, DrawResponsePayload,
    GameEndPayload, GameStartPayload, LoginPayload, MessageKind, MovePayload, RematchResponsePayload,
};

use crate::ai::AiBridge;
use crate::error::{AuthError, PeerUnavailable, ServerError, StateError};
use crate::game::{DrawOutcome, GameManager, GameResult, Side, TimeControl};
use crate::matchmaking::{Paired, QuickMatchPool};
use crate::persistence::{DocumentStore, SessionCache, rating_update_hook};
use crate::registry::{ConnHandle, Departure, NO_OPPONENT, Registry};

/// One outbound effect of handling a message: deliver `message` to
/// `destination`. The caller (a dispatch worker) is responsible for routing
/// every returned effect to the outbound mailbox, uniformly, per §4.9's
/// design note permitting uniform mailbox routing for simplicity.
pub type Effect = (ConnHandle, MessageKind);

fn info(destination: ConnHandle, body: serde_json::Value) -> Effect {
    (destination, MessageKind::Info(body))
}

fn error(destination: ConnHandle, message: impl Into<String>) -> Effect {
    (destination, MessageKind::Error { message: message.into() })
}

fn ai_bot_name(human_username: &str) -> String {
    format!("#ai:{human_username}")
}

/// Whether a `MOVE` rejection should be reported as `INVALID_MOVE {reason}`
/// rather than a generic `ERROR`, for the leaf `StateError` cases this
/// handler actually sees.
fn is_invalid_move_reason(e: &StateError) -> bool {
    matches!(
        e,
        StateError::NotYourTurn | StateError::InvalidCoordinates | StateError::NoPieceAtOrigin | StateError::TrivialMove
    )
}

/// Ties the registry, game manager, quick-match pool, AI bridge, and
/// persistence collaborators together into the single entry point the
/// dispatch pool calls into for every parsed message (§2 "Flow").
///
/// Deliberately free of any socket or mailbox type: `handle_message` is a
/// pure function of its locked-internal state plus the incoming message,
/// returning every outbound effect as data. This is what makes it testable
/// without a running event loop.
pub struct Engine {
    registry: Mutex<Registry>,
    games: Mutex<GameManager>,
    quick_match: Mutex<QuickMatchPool>,
    ai: AiBridge,
    store: Arc<dyn DocumentStore>,
    cache: Arc<dyn SessionCache>,
}

impl Engine {
    pub fn new(engine_path: PathBuf, store: Arc<dyn DocumentStore>, cache: Arc<dyn SessionCache>) -> Self {
        Self {
            registry: Mutex::new(Registry::new()),
            games: Mutex::new(GameManager::new()),
            quick_match: Mutex::new(QuickMatchPool::new()),
            ai: AiBridge::new(engine_path),
            store,
            cache,
        }
    }

    pub fn on_connect(&self, handle: ConnHandle) {
        self.registry.lock().expect("registry mutex poisoned").accept(handle);
    }

    /// Tears the connection down: unbinds its session, abandons any active
    /// game, and returns the single `INFO {"opponent_disconnected"}` effect
    /// owed to the opponent, if any (§4.3, testable property 6).
    pub fn on_disconnect(&self, handle: ConnHandle) -> Vec<Effect> {
        let departure = self.registry.lock().expect("registry mutex poisoned").disconnect(handle);
        let Some(Departure { session, opponent }) = departure else {
            return Vec::new();
        };
        let _ = self.store.update_online_status(&session.username, false);

        let mut effects = Vec::new();
        if let Some(opp) = opponent {
            effects.push(info(opp, serde_json::json!({"opponent_disconnected": true})));
        }
        if !session.username.is_empty() {
            if let Some((game_id, _remaining)) =
                self.games.lock().expect("game mutex poisoned").abandon_for_disconnect(&session.username)
            {
                self.finish_termination(&game_id, None, &mut effects);
            }
            self.quick_match.lock().expect("quick-match mutex poisoned").cancel(&session.username);
        }
        effects
    }

    /// The single routing point for every parsed message (§2 "Flow").
    pub fn handle_message(&self, handle: ConnHandle, msg: MessageKind) -> Vec<Effect> {
        match msg {
            MessageKind::Login(p) => self.handle_login(handle, p, false),
            MessageKind::Register(p) => self.handle_login(handle, p, true),
            MessageKind::Logout { username } => self.handle_logout(handle, &username),
            MessageKind::ChallengeRequest(p) => self.handle_challenge_request(handle, p),
            MessageKind::ChallengeCancel(p) => self.handle_challenge_cancel(handle, p),
            MessageKind::ChallengeResponse(p) => self.handle_challenge_response(handle, p),
            MessageKind::QuickMatching => self.handle_quick_matching(handle),
            MessageKind::CancelQm => self.handle_cancel_qm(handle),
            MessageKind::AiMatch(p) => self.handle_ai_match(handle, p),
            MessageKind::Move(p) => self.handle_move(handle, p),
            MessageKind::SuggestMoveRequest => self.handle_suggest_move(handle),
            MessageKind::DrawRequest => self.handle_draw_request(handle),
            MessageKind::DrawResponse(p) => self.handle_draw_response(handle, p),
            MessageKind::RematchRequest => self.handle_rematch_request(handle),
            MessageKind::RematchResponse(p) => self.handle_rematch_response(handle, p),
            MessageKind::Resign => self.handle_resign(handle),
            MessageKind::GameEnd(p) => self.handle_game_end_reported(handle, p),
            // Friend-graph/chat/history/stat kinds are schema-only per §4.2:
            // fail-closed auth check, then a stub acknowledgment.
            MessageKind::PlayerList => self.handle_player_list(handle),
            MessageKind::Chat { .. }
            | MessageKind::UserStats(_)
            | MessageKind::LeaderBoard
            | MessageKind::RequestAddFriend(_)
            | MessageKind::ResponseAddFriend(_)
            | MessageKind::Unfriend(_)
            | MessageKind::GameHistory(_)
            | MessageKind::ReplayRequest(_) => self.handle_schema_only(handle),
            // Server-originated or reply-only kinds never arrive as the
            // *initial* message in a dispatch job; receiving one here is a
            // malformed client and is rejected rather than acted upon.
            MessageKind::Authenticated
            | MessageKind::GameStart(_)
            | MessageKind::InvalidMove(_)
            | MessageKind::SuggestMoveReply(_)
            | MessageKind::Info(_)
            | MessageKind::Error { .. } => {
                vec![error(handle, "unexpected server-originated message")]
            }
        }
    }

    fn handle_login(&self, handle: ConnHandle, payload: LoginPayload, is_register: bool) -> Vec<Effect> {
        if is_register {
            if let Err(e) = self.store.create_user(&payload.username, &payload.password) {
                return vec![error(handle, e.to_string())];
            }
        }
        let mut registry = self.registry.lock().expect("registry mutex poisoned");
        match registry.login(handle, &payload.username) {
            Ok(()) => {
                drop(registry);
                let _ = self.store.update_online_status(&payload.username, true);
                vec![(handle, MessageKind::Authenticated)]
            }
            Err(e) => vec![error(handle, e.to_string())],
        }
    }

    fn handle_logout(&self, handle: ConnHandle, claimed_username: &str) -> Vec<Effect> {
        if let Err(e) = self.authorize(handle, claimed_username) {
            return vec![error(handle, e.to_string())];
        }
        let departure = self.registry.lock().expect("registry mutex poisoned").logout(handle);
        let Some(Departure { session, opponent }) = departure else {
            return Vec::new();
        };
        let _ = self.store.update_online_status(&session.username, false);

        let mut effects = Vec::new();
        if let Some(opp) = opponent {
            effects.push(info(opp, serde_json::json!({"opponent_disconnected": true})));
        }
        if let Some((game_id, _remaining)) =
            self.games.lock().expect("game mutex poisoned").abandon_for_disconnect(&session.username)
        {
            self.finish_termination(&game_id, None, &mut effects);
        }
        self.quick_match.lock().expect("quick-match mutex poisoned").cancel(&session.username);
        effects
    }

    fn handle_player_list(&self, handle: ConnHandle) -> Vec<Effect> {
        if self.registry.lock().expect("registry mutex poisoned").require_authenticated(handle).is_err() {
            return vec![error(handle, AuthError::NotAuthenticated.to_string())];
        }
        let names: Vec<String> =
            self.registry.lock().expect("registry mutex poisoned").usernames().map(str::to_owned).collect();
        vec![info(handle, serde_json::json!({"players": names}))]
    }

    fn handle_schema_only(&self, handle: ConnHandle) -> Vec<Effect> {
        if self.registry.lock().expect("registry mutex poisoned").require_authenticated(handle).is_err() {
            return vec![error(handle, AuthError::NotAuthenticated.to_string())];
        }
        vec![info(handle, serde_json::json!({"acknowledged": true}))]
    }

    fn authorize(&self, handle: ConnHandle, claimed_username: &str) -> Result<(), AuthError> {
        self.registry.lock().expect("registry mutex poisoned").authorize(handle, claimed_username)
    }

    fn handle_challenge_request(&self, handle: ConnHandle, payload: ChallengeRequestPayload) -> Vec<Effect> {
        let registry = self.registry.lock().expect("registry mutex poisoned");
        let Ok(sender) = registry.require_authenticated(handle) else {
            return vec![error(handle, AuthError::NotAuthenticated.to_string())];
        };
        let sender_name = sender.username.clone();
        let Some(to_user) = payload.to_user else {
            return vec![error(handle, "CHALLENGE_REQUEST requires to_user")];
        };
        let Some(target) = registry.session_for(&to_user) else {
            return vec![error(handle, PeerUnavailable::UserOffline(to_user).to_string())];
        };
        if target.handle == handle {
            return vec![error(handle, "cannot challenge yourself")];
        }
        let target_handle = target.handle;
        drop(registry);

        vec![
            (
                target_handle,
                MessageKind::ChallengeRequest(ChallengeRequestPayload {
                    to_user: None,
                    from_user: Some(sender_name),
                }),
            ),
            info(handle, serde_json::json!({"challenge_sent": true, "target": to_user})),
        ]
    }

    fn handle_challenge_cancel(&self, handle: ConnHandle, payload: ChallengeRequestPayload) -> Vec<Effect> {
        let registry = self.registry.lock().expect("registry mutex poisoned");
        let Ok(sender) = registry.require_authenticated(handle) else {
            return vec![error(handle, AuthError::NotAuthenticated.to_string())];
        };
        let sender_name = sender.username.clone();
        let mut effects = Vec::new();
        if let Some(to_user) = payload.to_user {
            if let Some(target) = registry.session_for(&to_user) {
                effects.push((
                    target.handle,
                    MessageKind::ChallengeCancel(ChallengeRequestPayload {
                        to_user: None,
                        from_user: Some(sender_name),
                    }),
                ));
            }
        }
        effects.push(info(handle, serde_json::json!({"challenge_cancelled": true})));
        effects
    }

    fn handle_challenge_response(&self, handle: ConnHandle, payload: ChallengeResponsePayload) -> Vec<Effect> {
        let registry = self.registry.lock().expect("registry mutex poisoned");
        let Ok(accepter) = registry.require_authenticated(handle) else {
            return vec![error(handle, AuthError::NotAuthenticated.to_string())];
        };
        let accepter_name = accepter.username.clone();
        let Some(challenger_name) = payload.to_user.clone() else {
            return vec![error(handle, "CHALLENGE_RESPONSE requires to_user")];
        };
        let Some(challenger) = registry.session_for(&challenger_name) else {
            return vec![error(handle, PeerUnavailable::StaleChallenge.to_string())];
        };
        let challenger_handle = challenger.handle;
        drop(registry);

        if !payload.accept {
            return vec![
                (
                    challenger_handle,
                    MessageKind::ChallengeResponse(ChallengeResponsePayload {
                        to_user: None,
                        from_user: Some(accepter_name),
                        accept: false,
                    }),
                ),
                info(handle, serde_json::json!({"challenge_declined": true})),
            ];
        }

        self.start_game(challenger_handle, &challenger_name, handle, &accepter_name, TimeControl::Blitz, true, false)
    }

    /// Shared by challenge-accept and quick-match pairing: creates the game
    /// record, cross-links both sessions, and emits `GAME_START` to each
    /// side (§4.6 CHALLENGE_RESPONSE / "proceeds exactly as an accepted
    /// challenge").
    fn start_game(
        &self,
        a_handle: ConnHandle,
        a_name: &str,
        b_handle: ConnHandle,
        b_name: &str,
        time_control: TimeControl,
        rated: bool,
        coin_flip_colors: bool,
    ) -> Vec<Effect> {
        let (red_handle, red_name, black_handle, black_name) = if coin_flip_colors
            && rand::thread_rng().gen_bool(0.5)
        {
            (b_handle, b_name, a_handle, a_name)
        } else {
            (a_handle, a_name, b_handle, b_name)
        };

        self.games.lock().expect("game mutex poisoned").create_game(red_name, black_name, time_control, rated, false);
        self.registry.lock().expect("registry mutex poisoned").start_game(
            red_handle,
            Side::Red,
            black_handle,
            Side::Black,
        );
        let _ = self.store.create_game(
            self.games
                .lock()
                .expect("game mutex poisoned")
                .game_for_player(red_name)
                .expect("just created"),
        );

        vec![
            (
                red_handle,
                MessageKind::GameStart(GameStartPayload {
                    opponent: black_name.to_owned(),
                    game_mode: time_control.as_str().to_owned(),
                    opponent_data: None,
                }),
            ),
            (
                black_handle,
                MessageKind::GameStart(GameStartPayload {
                    opponent: red_name.to_owned(),
                    game_mode: time_control.as_str().to_owned(),
                    opponent_data: None,
                }),
            ),
        ]
    }

    fn handle_quick_matching(&self, handle: ConnHandle) -> Vec<Effect> {
        let registry = self.registry.lock().expect("registry mutex poisoned");
        let Ok(session) = registry.require_authenticated(handle) else {
            return vec![error(handle, AuthError::NotAuthenticated.to_string())];
        };
        if session.in_game {
            return vec![error(handle, StateError::AlreadyInGame.to_string())];
        }
        let username = session.username.clone();
        drop(registry);

        let rating = self.store.get_player_rating(&username).unwrap_or(1200);
        let mut qm = self.quick_match.lock().expect("quick-match mutex poisoned");
        if let Err(e) = qm.enqueue(&username, handle, TimeControl::Blitz, true, rating) {
            return vec![error(handle, e.to_string())];
        }
        let paired = qm.find_pair();
        drop(qm);

        match paired {
            Some(Paired { a, b, time_control, rated }) => {
                self.start_game(a.1, &a.0, b.1, &b.0, time_control, rated, true)
            }
            None => Vec::new(),
        }
    }

    fn handle_cancel_qm(&self, handle: ConnHandle) -> Vec<Effect> {
        if let Some(username) = self.registry.lock().expect("registry mutex poisoned").get(handle).map(|s| s.username.clone()) {
            self.quick_match.lock().expect("quick-match mutex poisoned").cancel(&username);
        }
        vec![info(handle, serde_json::json!({"quick_match_cancelled": true}))]
    }

    fn handle_ai_match(&self, handle: ConnHandle, payload: AiMatchPayload) -> Vec<Effect> {
        let registry = self.registry.lock().expect("registry mutex poisoned");
        let Ok(session) = registry.require_authenticated(handle) else {
            return vec![error(handle, AuthError::NotAuthenticated.to_string())];
        };
        if session.in_game {
            return vec![error(handle, StateError::AlreadyInGame.to_string())];
        }
        let username = session.username.clone();
        drop(registry);

        // The AI "player" needs a username unique per game so GameManager's
        // by_player index (one entry per real user) doesn't collide across
        // concurrent AI games; a human username is already unique, so
        // deriving from it suffices without a separate bot-identity scheme.
        let bot_name = ai_bot_name(&username);
        let game = self.games.lock().expect("game mutex poisoned").create_game(
            &username,
            &bot_name,
            TimeControl::Blitz,
            false,
            true,
        );
        let game_id = game.id.clone();
        let initial_fen = game.xfen.clone();
        self.registry.lock().expect("registry mutex poisoned").start_ai_game(handle, Side::Red);
        self.ai.register_game(&game_id, &initial_fen, payload.gamemode);
        info!(%username, tag = payload.gamemode.tag(), "AI game started");

        vec![(
            handle,
            MessageKind::GameStart(GameStartPayload {
                opponent: String::new(),
                game_mode: payload.gamemode.tag().to_owned(),
                opponent_data: None,
            }),
        )]
    }

    fn handle_move(&self, handle: ConnHandle, payload: MovePayload) -> Vec<Effect> {
        let registry = self.registry.lock().expect("registry mutex poisoned");
        let Ok(session) = registry.require_authenticated(handle) else {
            return vec![error(handle, AuthError::NotAuthenticated.to_string())];
        };
        let username = session.username.clone();
        let opponent_handle = session.opponent;
        drop(registry);

        let outcome = match self.games.lock().expect("game mutex poisoned").apply_move(&username, &payload) {
            Ok(o) => o,
            Err(e) if is_invalid_move_reason(&e) => {
                return vec![(handle, MessageKind::InvalidMove(xiangqi_proto::InvalidMovePayload { reason: e.to_string() }))];
            }
            Err(e) => return vec![error(handle, e.to_string())],
        };
        let _ = self.store.append_move_and_update(
            &outcome.game_id,
            &crate::game::Move {
                seq: 0,
                author: username.clone(),
                from: payload.from,
                to: payload.to,
                piece: payload.piece.clone(),
                captured: String::new(),
                notation: String::new(),
                xfen_after: None,
                timestamp: chrono::Utc::now(),
                time_taken_secs: outcome.time_taken_secs,
            },
        );

        let mut effects = vec![(handle, MessageKind::Move(payload.clone()))];
        if outcome.is_ai_game {
            self.ai.apply_human_move(&outcome.game_id, payload.from, payload.to);
            match self.ai.get_best_move_real(&outcome.game_id) {
                Ok(ai_move) => {
                    let bot_name = ai_bot_name(&username);
                    if let Err(e) = self.games.lock().expect("game mutex poisoned").apply_move(&bot_name, &ai_move) {
                        warn!(?e, "AI's own move rejected by the game manager");
                    }
                    effects.push((handle, MessageKind::Move(ai_move)));
                }
                Err(e) => warn!(?e, game_id = %outcome.game_id, "AI query failed, human receives no reply"),
            }
        } else if opponent_handle != NO_OPPONENT {
            effects.push((opponent_handle, MessageKind::Move(payload)));
        }
        effects
    }

    fn handle_suggest_move(&self, handle: ConnHandle) -> Vec<Effect> {
        let registry = self.registry.lock().expect("registry mutex poisoned");
        let Ok(session) = registry.require_authenticated(handle) else {
            return vec![error(handle, AuthError::NotAuthenticated.to_string())];
        };
        let username = session.username.clone();
        drop(registry);

        let position = self
            .games
            .lock()
            .expect("game mutex poisoned")
            .game_for_player(&username)
            .map(|g| format!("position fen {}", g.xfen))
            .unwrap_or_else(|| format!("position fen {}", crate::game::STARTING_XFEN));

        match self.ai.suggest_move_real(&position) {
            Ok(mv) => vec![(handle, MessageKind::SuggestMoveReply(mv))],
            Err(e) => vec![error(handle, e.to_string())],
        }
    }

    fn handle_draw_request(&self, handle: ConnHandle) -> Vec<Effect> {
        let username = match self.authenticated_username(handle) {
            Ok(u) => u,
            Err(e) => return vec![error(handle, e.to_string())],
        };
        let registry = self.registry.lock().expect("registry mutex poisoned");
        let Some(opponent_handle) = registry.get(handle).map(|s| s.opponent) else {
            return vec![error(handle, StateError::NotInGame.to_string())];
        };
        drop(registry);
        if opponent_handle == NO_OPPONENT {
            return vec![error(handle, "no opponent to offer a draw to")];
        }

        match self.games.lock().expect("game mutex poisoned").offer_draw(&username) {
            Ok(_) => vec![(opponent_handle, MessageKind::DrawRequest)],
            Err(e) => vec![error(handle, e.to_string())],
        }
    }

    fn handle_draw_response(&self, handle: ConnHandle, payload: DrawResponsePayload) -> Vec<Effect> {
        let username = match self.authenticated_username(handle) {
            Ok(u) => u,
            Err(e) => return vec![error(handle, e.to_string())],
        };
        let outcome = match self.games.lock().expect("game mutex poisoned").respond_draw(&username, payload.accept_draw) {
            Ok(o) => o,
            Err(e) => return vec![error(handle, e.to_string())],
        };

        match outcome {
            DrawOutcome::Accepted(game_id) => {
                self.games.lock().expect("game mutex poisoned").terminate_draw(&game_id);
                let mut effects = Vec::new();
                self.finish_termination(&game_id, Some(GameResult::Draw), &mut effects);
                effects
            }
            DrawOutcome::Declined(offerer) => {
                let Some(offerer_handle) = self.registry.lock().expect("registry mutex poisoned").handle_for(&offerer) else {
                    return Vec::new();
                };
                vec![(offerer_handle, MessageKind::DrawResponse(DrawResponsePayload { accept_draw: false }))]
            }
        }
    }

    fn handle_rematch_request(&self, handle: ConnHandle) -> Vec<Effect> {
        let registry = self.registry.lock().expect("registry mutex poisoned");
        let Some(opponent_handle) = registry.get(handle).map(|s| s.last_opponent) else {
            return vec![error(handle, StateError::NotInGame.to_string())];
        };
        if opponent_handle == NO_OPPONENT {
            return vec![error(handle, "no opponent to rematch")];
        }
        vec![(opponent_handle, MessageKind::RematchRequest)]
    }

    /// An accepted REMATCH_RESPONSE is not a third code path: it creates a
    /// fresh `ActiveGame` via the ordinary creation path, with the two
    /// usernames reversed relative to the game that just ended (§4.7).
    fn handle_rematch_response(&self, handle: ConnHandle, payload: RematchResponsePayload) -> Vec<Effect> {
        let registry = self.registry.lock().expect("registry mutex poisoned");
        let Ok(accepter) = registry.require_authenticated(handle) else {
            return vec![error(handle, AuthError::NotAuthenticated.to_string())];
        };
        let accepter_name = accepter.username.clone();
        let Some(opponent_handle) = registry.get(handle).map(|s| s.last_opponent) else {
            return vec![error(handle, StateError::NotInGame.to_string())];
        };
        if opponent_handle == NO_OPPONENT {
            return vec![error(handle, "no opponent to rematch")];
        }
        let Some(opponent_name) = registry.get(opponent_handle).map(|s| s.username.clone()) else {
            return vec![error(handle, PeerUnavailable::StaleChallenge.to_string())];
        };
        drop(registry);

        if !payload.accept_rematch {
            return vec![(
                opponent_handle,
                MessageKind::RematchResponse(RematchResponsePayload { accept_rematch: false }),
            )];
        }

        self.start_game(handle, &accepter_name, opponent_handle, &opponent_name, TimeControl::Blitz, true, false)
    }

    fn handle_resign(&self, handle: ConnHandle) -> Vec<Effect> {
        let username = match self.authenticated_username(handle) {
            Ok(u) => u,
            Err(e) => return vec![error(handle, e.to_string())],
        };
        let game_id = match self.games.lock().expect("game mutex poisoned").resign(&username) {
            Ok(id) => id,
            Err(e) => return vec![error(handle, e.to_string())],
        };
        let mut effects = Vec::new();
        self.finish_termination(&game_id, None, &mut effects);
        effects
    }

    fn handle_game_end_reported(&self, handle: ConnHandle, payload: GameEndPayload) -> Vec<Effect> {
        let username = match self.authenticated_username(handle) {
            Ok(u) => u,
            Err(e) => return vec![error(handle, e.to_string())],
        };
        let Some((game_id, _opponent)) =
            self.games.lock().expect("game mutex poisoned").terminate_reported(&username, &payload.win_side)
        else {
            return vec![error(handle, StateError::NotInGame.to_string())];
        };
        let mut effects = Vec::new();
        self.finish_termination(&game_id, None, &mut effects);
        effects
    }

    /// Renders `GAME_END` to both sides still present in the registry,
    /// invokes the rating hook if rated, clears registry linkage, and drops
    /// the AI tracker if this was an AI game (§4.7 Termination). The game's
    /// own `red`/`black` fields are the source of truth for who to notify —
    /// the record outlives its `by_player` lookup entries once terminated.
    fn finish_termination(&self, game_id: &str, forced_result: Option<GameResult>, effects: &mut Vec<Effect>) {
        let (win_side, rated, is_ai_game, red, black) = {
            let games = self.games.lock().expect("game mutex poisoned");
            match games.get(game_id) {
                Some(g) => (
                    forced_result.map_or_else(|| g.result.map_or("draw", GameResult::win_side).to_owned(), |r| r.win_side().to_owned()),
                    g.rated,
                    g.is_ai_game,
                    g.red.clone(),
                    g.black.clone(),
                ),
                None => return,
            }
        };

        if is_ai_game {
            self.ai.drop_game(game_id);
        }

        let mut registry = self.registry.lock().expect("registry mutex poisoned");
        for player in [&red, &black] {
            if let Some(h) = registry.handle_for(player) {
                registry.end_game(h);
                effects.push((h, MessageKind::GameEnd(GameEndPayload { win_side: win_side.clone() })));
            }
        }
        drop(registry);

        if rated {
            let result = match win_side.as_str() {
                "red" => GameResult::RedWin,
                "black" => GameResult::BlackWin,
                _ => GameResult::Draw,
            };
            if let Err(e) = rating_update_hook(self.store.as_ref(), &red, &black, result, true) {
                warn!(?e, game_id, "rating hook failed");
            }
            let _ = self.store.end_game(game_id, result);
        }
    }

    fn authenticated_username(&self, handle: ConnHandle) -> Result<String, ServerError> {
        let registry = self.registry.lock().expect("registry mutex poisoned");
        registry.require_authenticated(handle).map(|s| s.username.clone()).map_err(ServerError::from)
    }

    pub fn cache(&self) -> &dyn SessionCache {
        self.cache.as_ref()
    }

    /// Periodic housekeeping driven by the event loop's poll timeout rather
    /// than any inbound frame: currently just expiring stale quick-match
    /// waiters (§4.6) so a user who queues and walks away isn't paired with
    /// a partner hours later.
    pub fn tick(&self) -> Vec<Effect> {
        let expired = self.quick_match.lock().expect("quick-match mutex poisoned").sweep_expired();
        expired
            .into_iter()
            .map(|(_, handle)| info(handle, serde_json::json!({"quick_match_expired": true})))
            .collect()
    }

    /// Shuts down the AI engine subprocess (§4.8 "Shutdown"). Called once
    /// from the binary's shutdown path; safe to call even if no AI game was
    /// ever played, since the bridge lazily spawns on first query.
    pub fn shutdown(&self) {
        self.ai.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryCache, InMemoryStore};
    use xiangqi_proto::{Coord, Difficulty};

    fn fresh_engine() -> Engine {
        Engine::new(PathBuf::from("pikafish"), Arc::new(InMemoryStore::new()), Arc::new(InMemoryCache::new()))
    }

    #[test]
    fn login_then_challenge_flow_starts_a_game() {
        let engine = fresh_engine();
        engine.on_connect(1);
        engine.on_connect(2);
        let effects = engine.handle_message(1, MessageKind::Login(LoginPayload { username: "alice".into(), password: "x".into() }));
        assert!(matches!(effects[0].1, MessageKind::Authenticated));
        engine.handle_message(2, MessageKind::Login(LoginPayload { username: "bob".into(), password: "y".into() }));

        let effects = engine.handle_message(
            1,
            MessageKind::ChallengeRequest(ChallengeRequestPayload { to_user: Some("bob".into()), from_user: None }),
        );
        assert_eq!(effects.len(), 2);

        let effects = engine.handle_message(
            2,
            MessageKind::ChallengeResponse(ChallengeResponsePayload { to_user: Some("alice".into()), from_user: None, accept: true }),
        );
        assert_eq!(effects.len(), 2);
        assert!(effects.iter().all(|(_, m)| matches!(m, MessageKind::GameStart(_))));
    }

    #[test]
    fn login_collision_is_rejected() {
        let engine = fresh_engine();
        engine.on_connect(1);
        engine.on_connect(2);
        engine.handle_message(1, MessageKind::Login(LoginPayload { username: "alice".into(), password: "x".into() }));
        let effects = engine.handle_message(2, MessageKind::Login(LoginPayload { username: "alice".into(), password: "y".into() }));
        assert!(matches!(&effects[0].1, MessageKind::Error { .. }));
    }

    #[test]
    fn turn_enforcement_rejects_out_of_turn_move() {
        let engine = fresh_engine();
        engine.on_connect(1);
        engine.on_connect(2);
        engine.handle_message(1, MessageKind::Login(LoginPayload { username: "alice".into(), password: "x".into() }));
        engine.handle_message(2, MessageKind::Login(LoginPayload { username: "bob".into(), password: "y".into() }));
        engine.handle_message(1, MessageKind::ChallengeRequest(ChallengeRequestPayload { to_user: Some("bob".into()), from_user: None }));
        engine.handle_message(2, MessageKind::ChallengeResponse(ChallengeResponsePayload { to_user: Some("alice".into()), from_user: None, accept: true }));

        let mv = MovePayload { piece: "p".into(), from: Coord { row: 6, col: 0 }, to: Coord { row: 5, col: 0 } };
        let effects = engine.handle_message(2, MessageKind::Move(mv));
        assert!(matches!(&effects[0].1, MessageKind::InvalidMove(_)));
    }

    #[test]
    fn disconnect_notifies_opponent_exactly_once() {
        let engine = fresh_engine();
        engine.on_connect(1);
        engine.on_connect(2);
        engine.handle_message(1, MessageKind::Login(LoginPayload { username: "alice".into(), password: "x".into() }));
        engine.handle_message(2, MessageKind::Login(LoginPayload { username: "bob".into(), password: "y".into() }));
        engine.handle_message(1, MessageKind::ChallengeRequest(ChallengeRequestPayload { to_user: Some("bob".into()), from_user: None }));
        engine.handle_message(2, MessageKind::ChallengeResponse(ChallengeResponsePayload { to_user: Some("alice".into()), from_user: None, accept: true }));

        let effects = engine.on_disconnect(1);
        assert!(effects.iter().any(|(h, m)| *h == 2 && matches!(m, MessageKind::Info(_))));
        let effects_again = engine.on_disconnect(1);
        assert!(effects_again.is_empty());
    }

    #[test]
    fn ai_match_registers_a_tracker() {
        let engine = fresh_engine();
        engine.on_connect(1);
        engine.handle_message(1, MessageKind::Login(LoginPayload { username: "alice".into(), password: "x".into() }));
        let effects = engine.handle_message(1, MessageKind::AiMatch(AiMatchPayload { gamemode: Difficulty::Easy }));
        assert!(matches!(&effects[0].1, MessageKind::GameStart(p) if p.game_mode == "ai_easy"));
    }

    #[test]
    fn accepted_rematch_starts_a_fresh_game_after_the_first_one_ends() {
        let engine = fresh_engine();
        engine.on_connect(1);
        engine.on_connect(2);
        engine.handle_message(1, MessageKind::Login(LoginPayload { username: "alice".into(), password: "x".into() }));
        engine.handle_message(2, MessageKind::Login(LoginPayload { username: "bob".into(), password: "y".into() }));
        engine.handle_message(1, MessageKind::ChallengeRequest(ChallengeRequestPayload { to_user: Some("bob".into()), from_user: None }));
        engine.handle_message(2, MessageKind::ChallengeResponse(ChallengeResponsePayload { to_user: Some("alice".into()), from_user: None, accept: true }));

        // Resigning ends the game and clears `opponent` on both sessions, but
        // `last_opponent` survives so a rematch is still reachable.
        engine.handle_message(1, MessageKind::Resign);

        let effects = engine.handle_message(2, MessageKind::RematchRequest);
        assert!(effects.iter().any(|(h, m)| *h == 1 && matches!(m, MessageKind::RematchRequest)));

        let effects = engine.handle_message(1, MessageKind::RematchResponse(RematchResponsePayload { accept_rematch: true }));
        assert_eq!(effects.len(), 2);
        assert!(effects.iter().all(|(_, m)| matches!(m, MessageKind::GameStart(_))));
    }

    #[test]
    fn declined_rematch_forwards_the_decline_without_starting_a_game() {
        let engine = fresh_engine();
        engine.on_connect(1);
        engine.on_connect(2);
        engine.handle_message(1, MessageKind::Login(LoginPayload { username: "alice".into(), password: "x".into() }));
        engine.handle_message(2, MessageKind::Login(LoginPayload { username: "bob".into(), password: "y".into() }));
        engine.handle_message(1, MessageKind::ChallengeRequest(ChallengeRequestPayload { to_user: Some("bob".into()), from_user: None }));
        engine.handle_message(2, MessageKind::ChallengeResponse(ChallengeResponsePayload { to_user: Some("alice".into()), from_user: None, accept: true }));
        engine.handle_message(1, MessageKind::Resign);
        engine.handle_message(2, MessageKind::RematchRequest);

        let effects = engine.handle_message(1, MessageKind::RematchResponse(RematchResponsePayload { accept_rematch: false }));
        assert_eq!(effects.len(), 1);
        assert_eq!(effects[0].0, 2);
        assert!(matches!(&effects[0].1, MessageKind::RematchResponse(p) if !p.accept_rematch));
    }

    #[test]
    fn draw_request_against_an_ai_opponent_is_rejected_not_misrouted() {
        let engine = fresh_engine();
        engine.on_connect(1);
        engine.handle_message(1, MessageKind::Login(LoginPayload { username: "alice".into(), password: "x".into() }));
        engine.handle_message(1, MessageKind::AiMatch(AiMatchPayload { gamemode: Difficulty::Easy }));

        let effects = engine.handle_message(1, MessageKind::DrawRequest);
        assert_eq!(effects.len(), 1);
        assert_eq!(effects[0].0, 1);
        assert!(matches!(&effects[0].1, MessageKind::Error { .. }));
    }

    #[test]
    fn tick_is_a_noop_with_no_quick_match_waiters() {
        let engine = fresh_engine();
        assert!(engine.tick().is_empty());

        engine.on_connect(1);
        engine.handle_message(1, MessageKind::Login(LoginPayload { username: "alice".into(), password: "x".into() }));
        engine.handle_message(1, MessageKind::QuickMatching);
        assert!(engine.tick().is_empty());
    }
}
