use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Trips after a run of consecutive failures and rejects calls while open.
/// After `open_for` elapses one probe call is let through; its outcome
/// closes the breaker again or re-opens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    open_for: Duration,
    state: Mutex<BreakerState>,
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_for: Duration) -> Self {
        CircuitBreaker {
            failure_threshold,
            open_for,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Whether a call may proceed right now.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.opened_at {
            None => true,
            Some(opened_at) => {
                if opened_at.elapsed() >= self.open_for {
                    // half-open: admit one probe, stay armed
                    state.opened_at = Some(Instant::now());
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        state.consecutive_failures = 0;
        state.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.failure_threshold {
            state.opened_at = Some(Instant::now());
        }
    }

    pub fn is_open(&self) -> bool {
        let state = self.state.lock().unwrap();
        match state.opened_at {
            None => false,
            Some(opened_at) => opened_at.elapsed() < self.open_for,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        CircuitBreaker::new(3, Duration::from_secs(30))
    }
}
