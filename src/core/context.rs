//! Per-request scope: overall deadline plus a cancellation token.
//!
//! Every suspending call in the pipeline runs through [`RequestScope::run`], so a
//! stage either finishes, hits the deadline, or observes cancellation at its next
//! suspension point.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScopeError {
    #[error("request deadline exceeded")]
    DeadlineExceeded,
    #[error("request cancelled")]
    Cancelled,
}

/// Scoped context handle passed down the pipeline
#[derive(Debug, Clone)]
pub struct RequestScope {
    deadline: Instant,
    timeout: Duration,
    token: CancellationToken,
}

impl RequestScope {
    pub fn new(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            timeout,
            token: CancellationToken::new(),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Time left before the deadline, zero once it has passed
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Await `fut` bounded by the deadline and the cancellation token
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, ScopeError>
    where
        F: Future,
    {
        if self.token.is_cancelled() {
            return Err(ScopeError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(ScopeError::Cancelled),
            result = tokio::time::timeout_at(self.deadline, fut) => {
                result.map_err(|_| ScopeError::DeadlineExceeded)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_completes_within_deadline() {
        let scope = RequestScope::new(Duration::from_secs(1));
        let value = scope.run(async { 42 }).await;
        assert_eq!(value, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reports_deadline() {
        let scope = RequestScope::new(Duration::from_millis(50));
        let result = scope
            .run(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert_eq!(result, Err(ScopeError::DeadlineExceeded));
        assert_eq!(scope.remaining(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_run_observes_cancellation() {
        let scope = RequestScope::new(Duration::from_secs(30));
        scope.cancel();
        let result = scope.run(async { 1 }).await;
        assert_eq!(result, Err(ScopeError::Cancelled));
    }
}
