//! Session Timer
//!
//! One deadline per streaming session. The connection task arms it with the
//! first-byte timeout, re-arms it with the inactivity timeout on every chunk
//! and disarms it when the session ends, so no timer outlives its session.

use std::time::Duration;

use tokio::time::Instant;

/// Re-armable deadline polled from a `select!` loop
#[derive(Debug, Default)]
pub struct SessionTimer {
    deadline: Option<Instant>,
}

impl SessionTimer {
    /// Create a disarmed timer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) to fire `timeout` from now
    pub fn arm(&mut self, timeout: Duration) {
        self.deadline = Some(Instant::now() + timeout);
    }

    /// Disarm; [`fired`](Self::fired) will never resolve
    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    /// Whether a deadline is set
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolve when the deadline passes
    pub async fn fired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_armed_timer_fires() {
        let mut timer = SessionTimer::new();
        timer.arm(Duration::from_secs(30));
        let start = Instant::now();
        timer.fired().await;
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_timer_never_fires() {
        let mut timer = SessionTimer::new();
        timer.arm(Duration::from_millis(10));
        timer.disarm();
        assert!(!timer.is_armed());

        let result = tokio::time::timeout(Duration::from_secs(60), timer.fired()).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_pushes_deadline_back() {
        let mut timer = SessionTimer::new();
        timer.arm(Duration::from_secs(1));
        tokio::time::advance(Duration::from_millis(900)).await;
        timer.arm(Duration::from_secs(1));

        let early = tokio::time::timeout(Duration::from_millis(500), timer.fired()).await;
        assert!(early.is_err());
    }
}
