use xiangqi_timing::{Duration, Instant};

use crate::error::StateError;
use crate::game::TimeControl;
use crate::registry::ConnHandle;

/// One waiting `QUICK_MATCHING` entry (§4.6 "Quick-match waiting pool").
#[derive(Clone, Debug)]
struct Waiter {
    username: String,
    handle: ConnHandle,
    time_control: TimeControl,
    rated: bool,
    rating: i32,
    requested_at: Instant,
}

/// Rating window within which two waiters are considered a compatible pair
/// (§4.6).
pub const RATING_WINDOW: i32 = 200;

/// A waiter still unpaired after this long is dropped from the pool on the
/// next sweep rather than left queued indefinitely (§4.6's periodic wake).
pub const WAIT_TTL_SECS: u64 = 120;

/// A process-wide list of users waiting for `QUICK_MATCHING`, scanned for a
/// compatible pair each time a new waiter arrives and on the event loop's
/// periodic wake. Protected by a lock taken after the registry lock, never
/// before (§4.6, §5's lock ordering) — this type itself holds no lock.
#[derive(Default)]
pub struct QuickMatchPool {
    waiters: Vec<Waiter>,
}

pub struct Paired {
    pub a: (String, ConnHandle),
    pub b: (String, ConnHandle),
    pub time_control: TimeControl,
    pub rated: bool,
}

impl QuickMatchPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `username` to the pool. Rejects a user already waiting.
    pub fn enqueue(
        &mut self,
        username: &str,
        handle: ConnHandle,
        time_control: TimeControl,
        rated: bool,
        rating: i32,
    ) -> Result<(), StateError> {
        if self.waiters.iter().any(|w| w.username == username) {
            return Err(StateError::AlreadyQueued);
        }
        self.waiters.push(Waiter {
            username: username.to_owned(),
            handle,
            time_control,
            rated,
            rating,
            requested_at: Instant::now(),
        });
        Ok(())
    }

    /// Removes `username` from the pool, if present. Idempotent: returning
    /// whether an entry was actually removed is informational only, the
    /// caller acknowledges either way (§4.6 `CANCEL_QM`).
    pub fn cancel(&mut self, username: &str) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|w| w.username != username);
        self.waiters.len() != before
    }

    pub fn is_waiting(&self, username: &str) -> bool {
        self.waiters.iter().any(|w| w.username == username)
    }

    /// Drops waiters that have been queued longer than `WAIT_TTL_SECS`,
    /// returning the handles they should be notified on so the caller can
    /// send them a `CANCEL_QM`-equivalent acknowledgement.
    pub fn sweep_expired(&mut self) -> Vec<(String, ConnHandle)> {
        let ttl = Duration::from_secs(WAIT_TTL_SECS);
        let mut expired = Vec::new();
        self.waiters.retain(|w| {
            if w.requested_at.elapsed() > ttl {
                expired.push((w.username.clone(), w.handle));
                false
            } else {
                true
            }
        });
        expired
    }

    /// Scans for the first pair within `RATING_WINDOW` of each other with a
    /// matching time-control class, removing both and returning the pairing
    /// for the caller to proceed with exactly as an accepted challenge
    /// (§4.6).
    pub fn find_pair(&mut self) -> Option<Paired> {
        for i in 0..self.waiters.len() {
            for j in (i + 1)..self.waiters.len() {
                let (a, b) = (&self.waiters[i], &self.waiters[j]);
                if a.time_control == b.time_control && (a.rating - b.rating).abs() <= RATING_WINDOW {
                    let b = self.waiters.remove(j);
                    let a = self.waiters.remove(i);
                    return Some(Paired {
                        a: (a.username, a.handle),
                        b: (b.username, b.handle),
                        time_control: a.time_control,
                        rated: a.rated && b.rated,
                    });
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_waiters_within_rating_window() {
        let mut pool = QuickMatchPool::new();
        pool.enqueue("alice", 1, TimeControl::Blitz, true, 1500).unwrap();
        pool.enqueue("bob", 2, TimeControl::Blitz, true, 1620).unwrap();
        let paired = pool.find_pair().unwrap();
        assert_eq!(paired.time_control, TimeControl::Blitz);
        assert!(pool.find_pair().is_none());
    }

    #[test]
    fn does_not_pair_outside_rating_window() {
        let mut pool = QuickMatchPool::new();
        pool.enqueue("alice", 1, TimeControl::Blitz, true, 1000).unwrap();
        pool.enqueue("bob", 2, TimeControl::Blitz, true, 1800).unwrap();
        assert!(pool.find_pair().is_none());
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut pool = QuickMatchPool::new();
        pool.enqueue("alice", 1, TimeControl::Blitz, true, 1500).unwrap();
        assert!(pool.cancel("alice"));
        assert!(!pool.cancel("alice"));
    }

    #[test]
    fn double_queue_is_rejected() {
        let mut pool = QuickMatchPool::new();
        pool.enqueue("alice", 1, TimeControl::Blitz, true, 1500).unwrap();
        assert!(matches!(
            pool.enqueue("alice", 1, TimeControl::Blitz, true, 1500),
            Err(StateError::AlreadyQueued)
        ));
    }

    #[test]
    fn sweep_expired_leaves_fresh_waiters_alone() {
        let mut pool = QuickMatchPool::new();
        pool.enqueue("alice", 1, TimeControl::Blitz, true, 1500).unwrap();
        assert!(pool.sweep_expired().is_empty());
        assert!(pool.is_waiting("alice"));
    }

    #[test]
    fn sweep_expired_drops_stale_waiters_and_reports_them() {
        let mut pool = QuickMatchPool::new();
        pool.enqueue("alice", 7, TimeControl::Blitz, true, 1500).unwrap();
        pool.waiters[0].requested_at = Instant::ZERO;
        let expired = pool.sweep_expired();
        assert_eq!(expired, vec![("alice".to_owned(), 7)]);
        assert!(!pool.is_waiting("alice"));
    }
}
