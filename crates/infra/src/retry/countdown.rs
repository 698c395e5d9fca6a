//! Resettable idle countdown.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::{Instant, sleep_until};

/// Fires once `timeout` has elapsed since the last [`IdleCountdown::reset`]
/// (or since creation).
///
/// Resets may come from any task while another one awaits
/// [`IdleCountdown::expired`]; the waiter re-checks the deadline each time it
/// wakes, so a reset that races the expiry simply pushes it out.
#[derive(Debug)]
pub struct IdleCountdown {
    timeout: Duration,
    deadline: Mutex<Instant>,
}

impl IdleCountdown {
    /// Create an armed countdown.
    pub fn start(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: Mutex::new(Instant::now() + timeout),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Push the deadline out to `timeout` from now.
    pub fn reset(&self) {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now() + self.timeout;
    }

    fn deadline(&self) -> Instant {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Completes once the countdown runs out without being reset.
    pub async fn expired(&self) {
        loop {
            let deadline = self.deadline();
            sleep_until(deadline).await;
            if Instant::now() >= self.deadline() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn assert_elapsed(started: Instant, expected: Duration) {
        let elapsed = started.elapsed();
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(5),
            "elapsed {elapsed:?}, expected {expected:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expires_after_timeout_of_silence() {
        let countdown = IdleCountdown::start(Duration::from_secs(45));
        let started = Instant::now();
        countdown.expired().await;
        assert_elapsed(started, Duration::from_secs(45));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_pushes_the_deadline_out() {
        let countdown = Arc::new(IdleCountdown::start(Duration::from_secs(45)));
        let started = Instant::now();

        let resetter = {
            let countdown = countdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                countdown.reset();
            })
        };

        countdown.expired().await;
        resetter.await.unwrap();
        assert_elapsed(started, Duration::from_secs(75));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_at_the_deadline_wins() {
        let countdown = Arc::new(IdleCountdown::start(Duration::from_secs(10)));
        let started = Instant::now();

        tokio::time::sleep(Duration::from_secs(10)).await;
        countdown.reset();
        countdown.expired().await;
        assert_elapsed(started, Duration::from_secs(20));
    }
}
