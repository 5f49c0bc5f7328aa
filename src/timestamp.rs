use std::fmt;
use std::ops::Add;
use std::time::{Duration, Instant};

/// Monotonic point in time recorded when a poll returns.
///
/// Passed to message callbacks so the embedder can measure queueing delay.
/// Display formatting is left to the embedder; this type only guarantees
/// monotonic arithmetic.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(Instant);

impl Timestamp {
    pub fn now() -> Self {
        Timestamp(Instant::now())
    }

    /// Time elapsed since this timestamp was taken.
    pub fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }

    /// Duration from `earlier` to `self`; zero if `earlier` is later.
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        self.0.saturating_duration_since(earlier.0)
    }

    pub(crate) fn instant(&self) -> Instant {
        self.0
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 + rhs)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Timestamp").field(&self.0).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        let a = Timestamp::now();
        let b = a + Duration::from_millis(5);
        assert!(a < b);
        assert_eq!(b.duration_since(a), Duration::from_millis(5));
        assert_eq!(a.duration_since(b), Duration::ZERO);
    }
}
