//! Deferred reclamation of closed connections.
//!
//! Closing a connection only marks its record. The sweeper removes records
//! once they have been closed for longer than the grace period, so an
//! application still draining a socket never sees its record vanish.

use std::time::{Duration, Instant};

use crate::connection::{Connection, ConnectionTable};

/// Default time between sweeps
pub const DEFAULT_HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(10);

/// Default time a closed record is kept
pub const DEFAULT_CONNECTION_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Sweeper {
    interval: Duration,
    grace: Duration,
    last_swept: Option<Instant>,
}

impl Default for Sweeper {
    fn default() -> Self {
        Self::new(DEFAULT_HOUSEKEEPING_INTERVAL, DEFAULT_CONNECTION_GRACE)
    }
}

impl Sweeper {
    pub fn new(interval: Duration, grace: Duration) -> Self {
        Self {
            interval,
            grace,
            last_swept: None,
        }
    }

    /// Whether enough time has passed since the last sweep.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_swept {
            None => true,
            Some(last) => now.saturating_duration_since(last) > self.interval,
        }
    }

    /// Remove closed records older than the grace period.
    ///
    /// Returns `None` if no sweep was due. The caller must release the
    /// backend resources of the returned records while still holding the
    /// lock that protects `table`.
    pub fn sweep(&mut self, table: &mut ConnectionTable, now: Instant) -> Option<Vec<Connection>> {
        if !self.is_due(now) {
            return None;
        }
        let grace = self.grace;
        let reclaimed = table.reclaim(|c| c.closed_for(now).is_some_and(|age| age > grace));
        self.last_swept = Some(now);
        Some(reclaimed)
    }
}
