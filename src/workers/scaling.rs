use super::STARTUP_ATTEMPTS;

/// How many workers to start when a new request arrives.
///
/// `pending_including_new` counts the requests already parked in the queue
/// plus the one being registered. Once pending demand reaches half of the
/// supply (starting plus ready workers), supply is grown to twice the demand.
pub fn workers_to_create(starting: usize, ready: usize, pending_including_new: usize) -> usize {
    let supply = starting + ready;
    let demand = 2 * pending_including_new;
    // demand >= supply is `pending >= supply / 2` without integer truncation.
    if demand >= supply {
        demand - supply
    } else {
        0
    }
}

/// Bounded retry budget for bringing a single worker slot up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartupRetryPolicy {
    pub max_attempts: u32,
}

impl StartupRetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Whether another attempt follows the failed attempt number `attempt`
    /// (1-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn attempts_left(&self, attempt: u32) -> u32 {
        self.max_attempts.saturating_sub(attempt)
    }
}

impl Default for StartupRetryPolicy {
    fn default() -> Self {
        Self::new(STARTUP_ATTEMPTS)
    }
}
