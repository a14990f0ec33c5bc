use crate::Duration;

/// Monotonic instant. Unlike `std::time::Instant`, this type has a `ZERO`
/// value usable as a sentinel "never happened" default, so a `Repeater`
/// seeded with it fires immediately on its first `fired()`/`maybe()` call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Instant(Option<std::time::Instant>);

impl Instant {
    pub const ZERO: Self = Self(None);

    pub fn now() -> Self {
        Self(Some(std::time::Instant::now()))
    }

    /// Time elapsed since this instant. `ZERO` reports an elapsed duration
    /// larger than any realistic interval, so timers seeded with it fire
    /// immediately.
    pub fn elapsed(self) -> Duration {
        match self.0 {
            Some(t) => Duration::from(t.elapsed()),
            None => Duration::from_secs(u64::MAX / 2),
        }
    }
}
