//! Wanduhr auf Basis von `tokio::time::Instant`
//!
//! Läuft mit der pausierbaren Tokio-Uhr, damit Dauer und Timeouts in Tests
//! aus derselben Zeitquelle kommen.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct CallClock {
    base_wall: DateTime<Utc>,
    base_instant: Instant,
}

impl CallClock {
    pub fn new() -> Self {
        Self {
            base_wall: Utc::now(),
            base_instant: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        match chrono::Duration::from_std(self.base_instant.elapsed()) {
            Ok(elapsed) => self.base_wall + elapsed,
            Err(_) => Utc::now(),
        }
    }
}

impl Default for CallClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_follows_paused_tokio_time() {
        let clock = CallClock::new();
        let before = clock.now();

        tokio::time::advance(Duration::from_secs(42)).await;

        let elapsed = clock.now().signed_duration_since(before);
        assert_eq!(elapsed.num_seconds(), 42);
    }
}
