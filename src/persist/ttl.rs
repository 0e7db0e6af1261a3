//! Expiry derivation from domain lifespan rules.
//!
//! Every aggregate carries a creation time and a last-activity time. Two
//! candidate deadlines are derived from them (max lifespan and idle timeout);
//! the effective deadline is the earlier of the enabled ones. A rule value
//! `<= 0` means "not enforced".

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifespan and idle limits for one kind of aggregate, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifespanRules {
    /// Maximum time since creation.
    pub max_lifespan_secs: i64,
    /// Maximum time since last activity.
    pub idle_timeout_secs: i64,
    /// Replaces `max_lifespan_secs` for remember-me aggregates when enabled.
    pub remember_me_max_lifespan_secs: i64,
    /// Replaces `idle_timeout_secs` for remember-me aggregates when enabled.
    pub remember_me_idle_timeout_secs: i64,
    /// Added to the idle deadline to absorb clock skew between nodes.
    pub idle_grace_secs: i64,
}

impl LifespanRules {
    pub fn new(max_lifespan_secs: i64, idle_timeout_secs: i64) -> Self {
        Self {
            max_lifespan_secs,
            idle_timeout_secs,
            ..Self::default()
        }
    }

    /// No limit at all; the aggregate never expires.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_remember_me(mut self, max_lifespan_secs: i64, idle_timeout_secs: i64) -> Self {
        self.remember_me_max_lifespan_secs = max_lifespan_secs;
        self.remember_me_idle_timeout_secs = idle_timeout_secs;
        self
    }

    pub fn with_idle_grace(mut self, grace_secs: i64) -> Self {
        self.idle_grace_secs = grace_secs;
        self
    }

    fn lifespan_for(&self, remember_me: bool) -> i64 {
        if remember_me && self.remember_me_max_lifespan_secs > 0 {
            self.remember_me_max_lifespan_secs
        } else {
            self.max_lifespan_secs
        }
    }

    fn idle_for(&self, remember_me: bool) -> i64 {
        if remember_me && self.remember_me_idle_timeout_secs > 0 {
            self.remember_me_idle_timeout_secs
        } else {
            self.idle_timeout_secs
        }
    }

    /// Returns `true` if at least one rule applies to such an aggregate.
    pub fn is_bounded(&self, remember_me: bool) -> bool {
        self.lifespan_for(remember_me) > 0 || self.idle_for(remember_me) > 0
    }
}

/// Time inputs of one aggregate snapshot, in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifetime {
    pub created_ms: i64,
    pub last_activity_ms: i64,
    pub remember_me: bool,
}

impl Lifetime {
    pub fn new(created_ms: i64, last_activity_ms: i64) -> Self {
        Self {
            created_ms,
            last_activity_ms,
            remember_me: false,
        }
    }

    pub fn remember_me(mut self, remember_me: bool) -> Self {
        self.remember_me = remember_me;
        self
    }
}

/// What the store should do with a freshly computed snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// No rule is enabled; store without expiry (if the aggregate allows it).
    Never,
    /// The deadline is at or before now; delete instead of writing.
    Expired,
    /// Store with this TTL, in whole seconds (always `>= 1`).
    After(u64),
}

impl Expiry {
    /// TTL to pass to the store for a write; `None` for no expiry.
    pub fn store_ttl(&self) -> Option<Duration> {
        match self {
            Expiry::After(secs) => Some(Duration::from_secs(*secs)),
            Expiry::Never | Expiry::Expired => None,
        }
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, Expiry::Expired)
    }
}

/// Absolute deadline in epoch milliseconds, `None` when nothing is enforced.
pub fn expiry_deadline_ms(rules: &LifespanRules, lifetime: &Lifetime) -> Option<i64> {
    let lifespan_secs = rules.lifespan_for(lifetime.remember_me);
    let idle_secs = rules.idle_for(lifetime.remember_me);

    let lifespan_deadline = (lifespan_secs > 0)
        .then(|| lifetime.created_ms.saturating_add(lifespan_secs.saturating_mul(1000)));
    let idle_deadline = (idle_secs > 0).then(|| {
        let grace_secs = rules.idle_grace_secs.max(0);
        lifetime
            .last_activity_ms
            .saturating_add(idle_secs.saturating_add(grace_secs).saturating_mul(1000))
    });

    match (lifespan_deadline, idle_deadline) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Compute the store TTL of a snapshot at `now_ms`.
///
/// Remaining time is rounded up to whole seconds and never reported as a
/// positive value below 1.
pub fn compute_expiry_seconds(rules: &LifespanRules, lifetime: &Lifetime, now_ms: i64) -> Expiry {
    let Some(deadline_ms) = expiry_deadline_ms(rules, lifetime) else {
        return Expiry::Never;
    };

    let remaining_ms = deadline_ms.saturating_sub(now_ms);
    let Ok(remaining_ms) = u64::try_from(remaining_ms) else {
        return Expiry::Expired;
    };
    if remaining_ms == 0 {
        return Expiry::Expired;
    }

    Expiry::After(remaining_ms.div_ceil(1000).max(1))
}
