use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Mutex;
use std::thread;
use std::time::Duration as StdDuration;

use tracing::{debug, info, warn};
use xiangqi_proto::{Coord, Difficulty, MovePayload};

use crate::error::EngineError;
use crate::game::Side;

/// A transport the bridge speaks UCI over. Abstracted behind a trait so
/// tests can substitute a deterministic fake that never spawns the real
/// `pikafish` binary (§4.8 "Engine process I/O as a typed collaborator").
pub trait EngineTransport: Send {
    fn send_line(&mut self, line: &str) -> Result<(), EngineError>;
    /// Blocks for up to `timeout` waiting for the next line of engine
    /// output. `Ok(None)` means the deadline elapsed with nothing read.
    fn recv_line(&mut self, timeout: StdDuration) -> Result<Option<String>, EngineError>;
    fn alive(&mut self) -> bool;
}

/// A real `pikafish`-like UCI subprocess. Reading is delegated to a
/// dedicated background thread that pushes whole lines onto an mpsc
/// channel, which is the idiomatic Rust equivalent of the original source's
/// `fcntl(O_NONBLOCK)` + polling read loop (§4.8): it gives the caller a
/// blocking-with-deadline `recv_timeout` instead of a busy-poll.
pub struct ProcessTransport {
    child: Child,
    stdin: ChildStdin,
    lines: Receiver<String>,
    reader: Option<thread::JoinHandle<()>>,
}

impl ProcessTransport {
    pub fn spawn(engine_path: &Path) -> Result<Self, EngineError> {
        let mut child = Command::new(engine_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| EngineError::SpawnFailed(e.to_string()))?;

        let stdin = child.stdin.take().ok_or_else(|| EngineError::SpawnFailed("no stdin".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| EngineError::SpawnFailed("no stdout".into()))?;

        let (tx, rx) = mpsc::channel();
        let reader = thread::Builder::new()
            .name("xiangqi-engine-reader".into())
            .spawn(move || {
                let mut lines = BufReader::new(stdout).lines();
                while let Some(Ok(line)) = lines.next() {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| EngineError::SpawnFailed(e.to_string()))?;

        Ok(Self { child, stdin, lines: rx, reader: Some(reader) })
    }
}

impl EngineTransport for ProcessTransport {
    fn send_line(&mut self, line: &str) -> Result<(), EngineError> {
        writeln!(self.stdin, "{line}").map_err(EngineError::from)?;
        self.stdin.flush().map_err(EngineError::from)
    }

    fn recv_line(&mut self, timeout: StdDuration) -> Result<Option<String>, EngineError> {
        match self.lines.recv_timeout(timeout) {
            Ok(line) => Ok(Some(line)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::NotReady),
        }
    }

    fn alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        let _ = self.stdin.write_all(b"quit\n");
        let _ = self.stdin.flush();
        thread::sleep(StdDuration::from_millis(100));
        if matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

/// Locates the engine binary per §4.8: an explicit path, then
/// executable-relative `./pikafish`, then `$PATH`.
pub fn find_engine(user_path: Option<&str>) -> PathBuf {
    if let Some(p) = user_path {
        if p.contains('/') && Path::new(p).is_file() {
            return PathBuf::from(p);
        }
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join("pikafish");
            if candidate.is_file() {
                return candidate;
            }
        }
    }
    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join("pikafish");
            if candidate.is_file() {
                return candidate;
            }
        }
    }
    PathBuf::from(user_path.unwrap_or("pikafish"))
}

/// Per-AI-game position tracker (§3 AIGame, §4.8 "Per-game tracker").
pub struct AiGameTracker {
    pub initial_fen: String,
    pub moves: Vec<String>,
    pub whose_turn: Side,
    pub difficulty: Difficulty,
}

impl AiGameTracker {
    pub fn new(initial_fen: String, difficulty: Difficulty) -> Self {
        Self { initial_fen, moves: Vec::new(), whose_turn: Side::Red, difficulty }
    }

    pub fn position_string(&self) -> String {
        if self.moves.is_empty() {
            format!("position fen {}", self.initial_fen)
        } else {
            format!("position fen {} moves {}", self.initial_fen, self.moves.join(" "))
        }
    }

    pub fn apply_move(&mut self, uci: &str) {
        self.moves.push(uci.to_owned());
        self.whose_turn = self.whose_turn.opposite();
    }
}

/// Converts a `{row, col}` pair to UCI file/rank (`a..i`, `0..9`), per §4.2.
pub fn coord_to_uci(from: Coord, to: Coord) -> String {
    format!(
        "{}{}{}{}",
        (b'a' + from.col as u8) as char,
        from.row,
        (b'a' + to.col as u8) as char,
        to.row
    )
}

/// Parses a four-character UCI move token back into `{from, to}`
/// coordinates. Returns `None` on malformed input (§4.8 Query).
pub fn uci_to_coords(uci: &str) -> Option<(Coord, Coord)> {
    let bytes = uci.as_bytes();
    if bytes.len() < 4 {
        return None;
    }
    let parse_file = |b: u8| -> Option<i32> {
        if (b'a'..=b'i').contains(&b) { Some((b - b'a') as i32) } else { None }
    };
    let parse_rank = |b: u8| -> Option<i32> {
        if (b'0'..=b'9').contains(&b) { Some((b - b'0') as i32) } else { None }
    };
    let from_col = parse_file(bytes[0])?;
    let from_row = parse_rank(bytes[1])?;
    let to_col = parse_file(bytes[2])?;
    let to_row = parse_rank(bytes[3])?;
    Some((Coord { row: from_row, col: from_col }, Coord { row: to_row, col: to_col }))
}

struct Inner<T: EngineTransport> {
    transport: Option<T>,
    ready: bool,
    games: HashMap<String, AiGameTracker>,
}

/// Wraps one long-lived UCI engine subprocess (§3 AIEngine, §4.8). All
/// queries serialize through `inner`'s mutex: at most one UCI dialogue runs
/// at a time, matching the invariant in §3.
pub struct AiBridge<T: EngineTransport = ProcessTransport> {
    engine_path: PathBuf,
    inner: Mutex<Inner<T>>,
}

/// `uciok`/`readyok` handshake timeouts (§4.8 Initialization).
const UCIOK_TIMEOUT: StdDuration = StdDuration::from_secs(3);
const READYOK_TIMEOUT: StdDuration = StdDuration::from_secs(2);

impl<T: EngineTransport> AiBridge<T> {
    fn from_parts(engine_path: PathBuf, transport: Option<T>, ready: bool) -> Self {
        Self {
            engine_path,
            inner: Mutex::new(Inner { transport, ready, games: HashMap::new() }),
        }
    }

    /// Registers a fresh per-game tracker for `game_id` (§4.8 "Per-game
    /// tracker", created on `AI_MATCH`).
    pub fn register_game(&self, game_id: &str, initial_fen: &str, difficulty: Difficulty) {
        let mut inner = self.inner.lock().expect("AI bridge mutex poisoned");
        inner.games.insert(game_id.to_owned(), AiGameTracker::new(initial_fen.to_owned(), difficulty));
    }

    /// Drops the per-game tracker on game-end (§4.7 Termination).
    pub fn drop_game(&self, game_id: &str) {
        let mut inner = self.inner.lock().expect("AI bridge mutex poisoned");
        inner.games.remove(game_id);
    }

    pub fn has_game(&self, game_id: &str) -> bool {
        self.inner.lock().expect("AI bridge mutex poisoned").games.contains_key(game_id)
    }

    /// Records the human's move into the tracker so the next query's
    /// `position ... moves ...` string includes it, and returns the query
    /// deadline for the tracked difficulty.
    pub fn apply_human_move(&self, game_id: &str, from: Coord, to: Coord) {
        let mut inner = self.inner.lock().expect("AI bridge mutex poisoned");
        if let Some(tracker) = inner.games.get_mut(game_id) {
            tracker.apply_move(&coord_to_uci(from, to));
        }
    }

    fn ensure_ready(inner: &mut Inner<T>, engine_path: &Path, spawn: impl FnOnce(&Path) -> Result<T, EngineError>) -> Result<(), EngineError> {
        if inner.ready {
            if let Some(t) = inner.transport.as_mut() {
                if t.alive() {
                    return Ok(());
                }
            }
            inner.ready = false;
        }

        let mut transport = spawn(engine_path)?;
        transport.send_line("uci")?;
        if !wait_for(&mut transport, "uciok", UCIOK_TIMEOUT)? {
            return Err(EngineError::Timeout);
        }
        transport.send_line("isready")?;
        if !wait_for(&mut transport, "readyok", READYOK_TIMEOUT)? {
            return Err(EngineError::Timeout);
        }
        inner.transport = Some(transport);
        inner.ready = true;
        info!("engine ready");
        Ok(())
    }

    /// Runs one `position ...` + `go depth <d>` dialogue and parses the
    /// `bestmove` reply (§4.8 Query). On a detected failure, marks the
    /// bridge not-ready and retries exactly one re-initialize before giving
    /// up with `EngineError` (DESIGN.md's bounded lazy-retry resolution).
    fn query(&self, position: &str, difficulty: Difficulty, spawn: impl Fn(&Path) -> Result<T, EngineError>) -> Result<String, EngineError> {
        let mut inner = self.inner.lock().expect("AI bridge mutex poisoned");

        let mut attempt = || -> Result<String, EngineError> {
            Self::ensure_ready(&mut inner, &self.engine_path, &spawn)?;
            let transport = inner.transport.as_mut().ok_or(EngineError::NotReady)?;
            transport.send_line(position)?;
            transport.send_line(&format!("go depth {}", difficulty.depth()))?;
            let deadline = StdDuration::from_millis(difficulty.soft_time_ms() + 1_000);
            read_bestmove(transport, deadline)
        };

        match attempt() {
            Ok(mv) => Ok(mv),
            Err(_first_err) => {
                inner.ready = false;
                inner.transport = None;
                warn!("engine query failed, retrying initialization once");
                attempt()
            }
        }
    }

    /// `get_best_move(position, difficulty)`: the human's opponent's next
    /// move for the game's tracked difficulty tier.
    pub fn get_best_move(&self, game_id: &str, spawn: impl Fn(&Path) -> Result<T, EngineError>) -> Result<MovePayload, EngineError> {
        let (position, difficulty) = {
            let inner = self.inner.lock().expect("AI bridge mutex poisoned");
            let tracker = inner.games.get(game_id).ok_or(EngineError::NotReady)?;
            (tracker.position_string(), tracker.difficulty)
        };
        let uci = self.query(&position, difficulty, spawn)?;
        let (from, to) = uci_to_coords(&uci).ok_or(EngineError::UnparseableReply)?;
        {
            let mut inner = self.inner.lock().expect("AI bridge mutex poisoned");
            if let Some(tracker) = inner.games.get_mut(game_id) {
                tracker.apply_move(&uci);
            }
        }
        Ok(MovePayload { piece: String::new(), from, to })
    }

    /// `suggest_move(position)`: a one-shot `hard`-tier query not tied to an
    /// AI game's tracker (§4.8 SUGGEST_MOVE).
    pub fn suggest_move(&self, position_string: &str, spawn: impl Fn(&Path) -> Result<T, EngineError>) -> Result<MovePayload, EngineError> {
        let uci = self.query(position_string, Difficulty::Hard, spawn)?;
        let (from, to) = uci_to_coords(&uci).ok_or(EngineError::UnparseableReply)?;
        Ok(MovePayload { piece: String::new(), from, to })
    }

    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().expect("AI bridge mutex poisoned");
        inner.transport = None;
        inner.ready = false;
        inner.games.clear();
    }
}

impl AiBridge<ProcessTransport> {
    pub fn new(engine_path: PathBuf) -> Self {
        Self::from_parts(engine_path, None, false)
    }

    /// Convenience over `get_best_move`/`suggest_move` that spawns the real
    /// subprocess via `ProcessTransport::spawn`.
    pub fn get_best_move_real(&self, game_id: &str) -> Result<MovePayload, EngineError> {
        self.get_best_move(game_id, ProcessTransport::spawn)
    }

    pub fn suggest_move_real(&self, position_string: &str) -> Result<MovePayload, EngineError> {
        self.suggest_move(position_string, ProcessTransport::spawn)
    }
}

#[cfg(test)]
impl<T: EngineTransport> AiBridge<T> {
    /// Test-only constructor that takes an already-connected fake
    /// transport, skipping the spawn step entirely.
    pub fn with_transport(engine_path: PathBuf, transport: T) -> Self {
        Self::from_parts(engine_path, Some(transport), true)
    }
}

fn wait_for<T: EngineTransport>(transport: &mut T, needle: &str, timeout: StdDuration) -> Result<bool, EngineError> {
    let start = std::time::Instant::now();
    loop {
        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Ok(false);
        }
        match transport.recv_line(remaining)? {
            Some(line) if line.contains(needle) => return Ok(true),
            Some(_) => continue,
            None => return Ok(false),
        }
    }
}

fn read_bestmove<T: EngineTransport>(transport: &mut T, timeout: StdDuration) -> Result<String, EngineError> {
    let start = std::time::Instant::now();
    loop {
        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Err(EngineError::Timeout);
        }
        match transport.recv_line(remaining)? {
            Some(line) if line.starts_with("bestmove") => {
                let mv = line.split_whitespace().nth(1).ok_or(EngineError::UnparseableReply)?;
                debug!(mv, "engine bestmove");
                return Ok(mv.to_owned());
            }
            Some(_) => continue,
            None => return Err(EngineError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use super::*;

    struct FakeTransport {
        scripted: StdMutex<VecDeque<String>>,
        alive: bool,
    }

    impl FakeTransport {
        fn new(lines: &[&str]) -> Self {
            Self { scripted: StdMutex::new(lines.iter().map(|s| s.to_string()).collect()), alive: true }
        }
    }

    impl EngineTransport for FakeTransport {
        fn send_line(&mut self, _line: &str) -> Result<(), EngineError> {
            Ok(())
        }

        fn recv_line(&mut self, _timeout: StdDuration) -> Result<Option<String>, EngineError> {
            Ok(self.scripted.lock().unwrap().pop_front())
        }

        fn alive(&mut self) -> bool {
            self.alive
        }
    }

    #[test]
    fn uci_round_trips_coords() {
        let uci = coord_to_uci(Coord { row: 3, col: 0 }, Coord { row: 4, col: 0 });
        assert_eq!(uci, "a3a4");
        let (from, to) = uci_to_coords(&uci).unwrap();
        assert_eq!(from, Coord { row: 3, col: 0 });
        assert_eq!(to, Coord { row: 4, col: 0 });
    }

    #[test]
    fn get_best_move_parses_bestmove_line() {
        let transport = FakeTransport::new(&["uciok", "readyok", "info depth 1", "bestmove a0a1"]);
        let bridge: AiBridge<FakeTransport> =
            AiBridge::with_transport(PathBuf::from("fake"), transport);
        bridge.register_game("g1", crate::game::STARTING_XFEN, Difficulty::Easy);
        let mv = bridge.get_best_move("g1", |_p| unreachable!("ready already")).unwrap();
        assert_eq!(mv.from, Coord { row: 0, col: 0 });
        assert_eq!(mv.to, Coord { row: 1, col: 0 });
    }

    #[test]
    fn timeout_with_no_bestmove_is_reported() {
        let transport = FakeTransport::new(&["uciok", "readyok", "info depth 1"]);
        let bridge: AiBridge<FakeTransport> =
            AiBridge::with_transport(PathBuf::from("fake"), transport);
        bridge.register_game("g1", crate::game::STARTING_XFEN, Difficulty::Easy);
        let err = bridge.get_best_move("g1", |_p| unreachable!("ready already")).unwrap_err();
        assert!(matches!(err, EngineError::Timeout));
    }

    #[test]
    fn find_engine_resolves_an_explicit_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script_path = dir.path().join("pikafish");
        std::fs::write(&script_path, "#!/bin/sh\nexit 0\n").expect("write stub");
        let resolved = find_engine(Some(script_path.to_str().expect("utf8 path")));
        assert_eq!(resolved, script_path);
    }

    /// Exercises the real `ProcessTransport` spawn/handshake/query path
    /// end-to-end against a shell script standing in for the engine binary,
    /// rather than the `FakeTransport` used by the tests above (§4.8
    /// Initialization/Query).
    #[test]
    #[cfg(unix)]
    fn real_subprocess_transport_handshakes_and_returns_a_move() {
        use std::fs;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let script_path = dir.path().join("pikafish");
        fs::write(
            &script_path,
            "#!/bin/sh\nwhile read -r line; do\n  case \"$line\" in\n    uci) echo uciok ;;\n    isready) echo readyok ;;\n    go*) echo 'bestmove a0a1' ;;\n  esac\ndone\n",
        )
        .expect("write fake engine script");
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755)).expect("chmod +x");

        let bridge: AiBridge<ProcessTransport> = AiBridge::new(script_path);
        bridge.register_game("g1", crate::game::STARTING_XFEN, Difficulty::Easy);
        let mv = bridge.get_best_move_real("g1").expect("engine query");
        assert_eq!(mv.from, Coord { row: 0, col: 0 });
        assert_eq!(mv.to, Coord { row: 1, col: 0 });
        bridge.shutdown();
    }
}
