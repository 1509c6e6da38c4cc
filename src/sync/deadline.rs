use crate::error::SyncError;
use std::thread;
use std::time::{Duration, Instant};

/// Per-record time budget, checked before every external call and inside
/// every backoff sleep.
#[derive(Debug, Clone)]
pub struct Deadline {
    started: Instant,
    limit: Duration,
}

impl Deadline {
    pub fn new(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.started.elapsed())
    }

    fn exceeded(&self, stage: &str) -> SyncError {
        SyncError::TimeoutExceeded {
            stage: stage.to_string(),
            limit_secs: self.limit.as_secs(),
        }
    }

    pub fn check(&self, stage: &str) -> Result<(), SyncError> {
        if self.remaining().is_zero() {
            return Err(self.exceeded(stage));
        }
        Ok(())
    }

    /// Sleep for `wait`, or fail at once if the budget cannot cover it.
    pub fn sleep(&self, wait: Duration, stage: &str) -> Result<(), SyncError> {
        if wait >= self.remaining() {
            return Err(self.exceeded(stage));
        }
        thread::sleep(wait);
        Ok(())
    }

    /// Cap a per-request timeout at what is left of the budget.
    pub fn cap(&self, request: Duration) -> Duration {
        request.min(self.remaining())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_deadline_passes_checks() {
        let deadline = Deadline::new(Duration::from_secs(60));
        deadline.check("fetch").expect("within budget");
        assert_eq!(deadline.cap(Duration::from_secs(5)), Duration::from_secs(5));
        assert!(deadline.cap(Duration::from_secs(600)) <= Duration::from_secs(60));
    }

    #[test]
    fn exhausted_deadline_reports_stage() {
        let deadline = Deadline::new(Duration::ZERO);
        let err = deadline.check("push").expect_err("expired");
        assert!(matches!(err, SyncError::TimeoutExceeded { ref stage, .. } if stage == "push"));
    }

    #[test]
    fn sleep_longer_than_budget_fails_without_waiting() {
        let deadline = Deadline::new(Duration::from_millis(50));
        let before = Instant::now();
        assert!(deadline.sleep(Duration::from_secs(30), "backoff").is_err());
        assert!(before.elapsed() < Duration::from_secs(1));
        deadline
            .sleep(Duration::from_millis(1), "backoff")
            .expect("short sleep fits");
    }
}
