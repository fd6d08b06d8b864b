//! Consul locker configuration

use std::fmt::{Display, Formatter};
use std::time::Duration;

use jicama_locker::config::duration;
use serde::{Deserialize, Serialize};

pub const DEFAULT_ADDRESS: &str = "localhost:8500";
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_TIMER: Duration = Duration::from_secs(2);
pub const DEFAULT_DELAY: Duration = Duration::from_secs(15);
pub const MAX_DELAY: Duration = Duration::from_secs(60);

/// Config section for the consul locker.
///
/// Duration values are human strings ("10s"). Unset fields are filled by
/// `set_defaults`, which `init` calls before the first backend request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ConsulLockerConfig {
    /// Address of the consul agent.
    pub address: String,

    /// Session TTL; the session is invalidated if not renewed within it.
    #[serde(with = "duration")]
    pub session_ttl: Option<Duration>,

    /// Lock delay: grace period after a session invalidation before the
    /// released keys become acquirable again. Clamped to at most 60s; an
    /// explicit zero disables it.
    #[serde(with = "duration")]
    pub delay: Option<Duration>,

    /// Backoff between failed acquisition attempts.
    #[serde(with = "duration")]
    pub retry_timer: Option<Duration>,

    /// How often a held session is refreshed. Must be shorter than the
    /// session TTL; forced to half the TTL otherwise.
    #[serde(with = "duration")]
    pub renew_period: Option<Duration>,

    /// Verbose contention logging.
    pub debug: bool,
}

impl ConsulLockerConfig {
    pub fn set_defaults(&mut self) {
        if self.address.is_empty() {
            self.address = DEFAULT_ADDRESS.to_string();
        }
        let ttl = match self.session_ttl {
            Some(ttl) if !ttl.is_zero() => ttl,
            _ => DEFAULT_SESSION_TTL,
        };
        self.session_ttl = Some(ttl);
        match self.retry_timer {
            Some(t) if !t.is_zero() => {}
            _ => self.retry_timer = Some(DEFAULT_RETRY_TIMER),
        }
        match self.renew_period {
            Some(p) if !p.is_zero() && p < ttl => {}
            _ => self.renew_period = Some(ttl / 2),
        }
        let delay = self.delay.unwrap_or(DEFAULT_DELAY);
        self.delay = Some(delay.min(MAX_DELAY));
    }

    pub fn session_ttl(&self) -> Duration {
        self.session_ttl.unwrap_or(DEFAULT_SESSION_TTL)
    }

    pub fn retry_timer(&self) -> Duration {
        self.retry_timer.unwrap_or(DEFAULT_RETRY_TIMER)
    }

    pub fn renew_period(&self) -> Duration {
        self.renew_period.unwrap_or(DEFAULT_SESSION_TTL / 2)
    }

    pub fn delay(&self) -> Duration {
        self.delay.unwrap_or(DEFAULT_DELAY)
    }
}

impl Display for ConsulLockerConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => write!(f, "{s}"),
            Err(_) => Ok(()),
        }
    }
}
