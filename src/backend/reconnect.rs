//! Reconnection backoff.

use std::time::Duration;

use rand::Rng;

use crate::config::{EngineSettings, SessionConfig};

/// `min(min_backoff << attempt, max_backoff)`, without jitter.
pub fn base_delay(settings: &EngineSettings, attempt: u32) -> Duration {
    let min = settings.min_backoff_ms;
    let max = settings.max_backoff_ms;
    let scaled = 1u64
        .checked_shl(attempt)
        .and_then(|factor| min.checked_mul(factor))
        .unwrap_or(u64::MAX);
    Duration::from_millis(scaled.min(max))
}

fn jitter(settings: &EngineSettings) -> Duration {
    if settings.max_jitter_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=settings.max_jitter_ms))
}

/// Scheduler bookkeeping, owned by the supervisor task.
#[derive(Debug)]
pub struct ReconnectState {
    attempts: u32,
    cap: u32,
    /// Configuration for the next attempt; replaced by STS upgrades.
    pub last_config: Option<SessionConfig>,
    pub network_available: bool,
    /// Set by an explicit disconnect, cleared by the next connect.
    pub user_initiated: bool,
}

impl ReconnectState {
    pub fn new(settings: &EngineSettings) -> Self {
        Self {
            attempts: 0,
            cap: settings.attempt_cap,
            last_config: None,
            network_available: true,
            user_initiated: false,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Count one more attempt, saturating at the cap.
    pub fn record_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1).min(self.cap);
    }

    /// Delay before the next attempt. A forced delay wins over backoff.
    pub fn next_delay(&self, settings: &EngineSettings, forced: Option<Duration>) -> Duration {
        match forced {
            Some(delay) => delay,
            None => base_delay(settings, self.attempts) + jitter(settings),
        }
    }
}
