//! Request orchestration
//!
//! Turns "send this request, maybe several times, to maybe many destinations"
//! into "collect correlated responses within a deadline". The orchestrator is
//! protocol-agnostic: callers supply exchanges carrying a request and a
//! [`Codec`](crate::codec::Codec), and get the same exchanges back with
//! whatever responses matched.
//!
//! - [`UdpOrchestrator`] shares one socket per source address and supports
//!   broadcast discovery
//! - [`TcpOrchestrator`] opens one connection per request, capped per
//!   destination authority
//!
//! Neither spawns tasks of its own. Each invocation creates one private reply
//! bus and waits on it only with deadlines taken from an [`AttemptSchedule`].

pub mod tcp;
pub mod udp;

use std::time::Duration;

pub use tcp::{TcpExchange, TcpOrchestrator};
pub use udp::{Delivery, UdpExchange, UdpOrchestrator};

/// Ordered wait durations, one send-then-wait round each
///
/// # Example
/// ```rust
/// use portmap::orchestrator::AttemptSchedule;
/// use std::time::Duration;
///
/// let schedule = AttemptSchedule::exponential(4, Duration::from_millis(250));
/// assert_eq!(schedule.total(), Duration::from_millis(3750));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttemptSchedule {
    durations: Vec<Duration>,
}

impl AttemptSchedule {
    /// `attempts` rounds starting at `base`, doubling each round
    pub fn exponential(attempts: usize, base: Duration) -> Self {
        let mut durations = Vec::with_capacity(attempts);
        let mut wait = base;
        for _ in 0..attempts {
            durations.push(wait);
            wait = wait.saturating_mul(2);
        }
        Self { durations }
    }

    /// Rounds with exactly the given waits
    pub fn fixed(durations: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            durations: durations.into_iter().collect(),
        }
    }

    /// Wait of every round, in order
    pub fn durations(&self) -> &[Duration] {
        &self.durations
    }

    /// Number of rounds
    pub fn len(&self) -> usize {
        self.durations.len()
    }

    /// Whether there are no rounds at all
    pub fn is_empty(&self) -> bool {
        self.durations.is_empty()
    }

    /// Sum of all waits; the longest an orchestration can take
    pub fn total(&self) -> Duration {
        self.durations
            .iter()
            .fold(Duration::ZERO, |total, wait| total.saturating_add(*wait))
    }

    /// Iterate over the waits
    pub fn iter(&self) -> std::slice::Iter<'_, Duration> {
        self.durations.iter()
    }
}

impl From<Vec<Duration>> for AttemptSchedule {
    fn from(durations: Vec<Duration>) -> Self {
        Self { durations }
    }
}

impl<'a> IntoIterator for &'a AttemptSchedule {
    type Item = &'a Duration;
    type IntoIter = std::slice::Iter<'a, Duration>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
