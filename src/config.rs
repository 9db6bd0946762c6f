//! Session configuration.
//!
//! Defaults match the dashboard's timings. Every field can be overridden with
//! the `with_*` setters or from the environment via [`SessionConfig::from_env`].

use std::time::Duration;
use tracing::warn;

use crate::unlock::UnlockRules;

/// Timings and rules for one document session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Quiet period before the idle autosave fires
    pub idle_save_wait: Duration,
    /// Period of the heartbeat autosave
    pub heartbeat_interval: Duration,
    /// Minimum spacing of change intake runs
    pub change_throttle: Duration,
    /// Changes ignored after binding a new subject
    pub switch_suppression: Duration,
    /// Changes ignored after applying a loaded or pushed document
    pub echo_suppression: Duration,
    /// One display frame, the mirror's batching window
    pub frame_interval: Duration,
    pub unlock: UnlockRules,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_save_wait: Duration::from_millis(3000),
            heartbeat_interval: Duration::from_secs(30),
            change_throttle: Duration::from_millis(50),
            switch_suppression: Duration::from_millis(350),
            echo_suppression: Duration::from_millis(250),
            frame_interval: Duration::from_millis(16),
            unlock: UnlockRules::default(),
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by `CANVAS_IDLE_SAVE_MS`, `CANVAS_HEARTBEAT_MS`,
    /// `CANVAS_CHANGE_THROTTLE_MS` and `CANVAS_PHONE_PREFIXES` (comma separated)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(wait) = env_millis("CANVAS_IDLE_SAVE_MS") {
            config.idle_save_wait = wait;
        }
        if let Some(period) = env_millis("CANVAS_HEARTBEAT_MS") {
            config.heartbeat_interval = period;
        }
        if let Some(throttle) = env_millis("CANVAS_CHANGE_THROTTLE_MS") {
            config.change_throttle = throttle;
        }
        if let Ok(prefixes) = std::env::var("CANVAS_PHONE_PREFIXES") {
            config.unlock.phone_prefixes = prefixes
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }

        config
    }

    pub fn with_idle_save_wait(mut self, wait: Duration) -> Self {
        self.idle_save_wait = wait;
        self
    }

    pub fn with_heartbeat_interval(mut self, period: Duration) -> Self {
        self.heartbeat_interval = period;
        self
    }

    pub fn with_change_throttle(mut self, throttle: Duration) -> Self {
        self.change_throttle = throttle;
        self
    }

    pub fn with_switch_suppression(mut self, window: Duration) -> Self {
        self.switch_suppression = window;
        self
    }

    pub fn with_echo_suppression(mut self, window: Duration) -> Self {
        self.echo_suppression = window;
        self
    }

    pub fn with_frame_interval(mut self, frame: Duration) -> Self {
        self.frame_interval = frame;
        self
    }

    pub fn with_unlock_rules(mut self, rules: UnlockRules) -> Self {
        self.unlock = rules;
        self
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(0) => {
            warn!("Ignoring {}=0: must be positive", key);
            None
        }
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(e) => {
            warn!("Ignoring {}={:?}: {}", key, raw, e);
            None
        }
    }
}
