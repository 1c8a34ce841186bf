//! Notification cooldown state
//!
//! A claim is taken before sending and rolled back if delivery fails, so two
//! concurrent findings with the same identity can never both pass the check.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};

use crate::model::{FindingType, Level};

/// Identity a cooldown applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ThrottleKey {
    /// Shared by every channel
    Shared {
        finding_type: FindingType,
        level: Level,
    },
    /// Tracked per channel
    Channel {
        channel: String,
        finding_type: FindingType,
        level: Level,
    },
}

/// A successful check-and-set, undone by [`Throttle::rollback`]
#[derive(Debug)]
pub struct Claim {
    key: ThrottleKey,
    previous: Option<DateTime<Utc>>,
    claimed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct Throttle {
    last_sent: Mutex<HashMap<ThrottleKey, DateTime<Utc>>>,
}

impl Throttle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` unless it was sent within `window` before `now`
    pub fn try_claim(&self, key: ThrottleKey, window: Duration, now: DateTime<Utc>) -> Option<Claim> {
        let mut last_sent = self.lock();
        let previous = last_sent.get(&key).copied();
        if let Some(sent_at) = previous {
            if now - sent_at < window {
                return None;
            }
        }
        last_sent.insert(key.clone(), now);
        Some(Claim {
            key,
            previous,
            claimed_at: now,
        })
    }

    /// Restore the timestamp a claim replaced, unless a newer claim exists
    pub fn rollback(&self, claim: Claim) {
        let mut last_sent = self.lock();
        if last_sent.get(&claim.key) != Some(&claim.claimed_at) {
            return;
        }
        match claim.previous {
            Some(previous) => {
                last_sent.insert(claim.key, previous);
            }
            None => {
                last_sent.remove(&claim.key);
            }
        }
    }

    pub fn last_sent(&self, key: &ThrottleKey) -> Option<DateTime<Utc>> {
        self.lock().get(key).copied()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ThrottleKey, DateTime<Utc>>> {
        self.last_sent.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key() -> ThrottleKey {
        ThrottleKey::Shared {
            finding_type: FindingType::Blocking,
            level: Level::Critical,
        }
    }

    #[test]
    fn test_window_suppresses_then_allows() {
        let throttle = Throttle::new();
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let window = Duration::minutes(10);

        assert!(throttle.try_claim(key(), window, t0).is_some());
        assert!(throttle.try_claim(key(), window, t0 + Duration::minutes(9)).is_none());
        assert!(throttle.try_claim(key(), window, t0 + Duration::minutes(10)).is_some());
    }

    #[test]
    fn test_rollback_restores_previous() {
        let throttle = Throttle::new();
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let window = Duration::minutes(10);

        let claim = throttle.try_claim(key(), window, t0).unwrap();
        throttle.rollback(claim);
        assert_eq!(throttle.last_sent(&key()), None);
        assert!(throttle.try_claim(key(), window, t0).is_some());
    }

    #[test]
    fn test_rollback_does_not_clobber_newer_claim() {
        let throttle = Throttle::new();
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let window = Duration::minutes(1);

        let stale = throttle.try_claim(key(), window, t0).unwrap();
        let newer_at = t0 + Duration::minutes(2);
        let _newer = throttle.try_claim(key(), window, newer_at).unwrap();
        throttle.rollback(stale);
        assert_eq!(throttle.last_sent(&key()), Some(newer_at));
    }

    #[test]
    fn test_channel_keys_are_independent() {
        let throttle = Throttle::new();
        let now = Utc::now();
        let window = Duration::minutes(10);
        let for_channel = |channel: &str| ThrottleKey::Channel {
            channel: channel.to_string(),
            finding_type: FindingType::HighCpu,
            level: Level::Warning,
        };

        assert!(throttle.try_claim(for_channel("email"), window, now).is_some());
        assert!(throttle.try_claim(for_channel("slack"), window, now).is_some());
        assert!(throttle.try_claim(for_channel("email"), window, now).is_none());
    }
}
