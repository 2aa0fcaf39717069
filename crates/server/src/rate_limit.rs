use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// Upper bound on tracked keys so an attacker cycling usernames cannot grow
// the map without bound.
const MAX_TRACKED_KEYS: usize = 16_384;

/// Sliding-window counter keyed by login identity. Shields the credential
/// check from brute-force bursts; it is not an account lockout.
#[derive(Clone)]
pub struct LoginLimiter {
    attempts: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
    window: Duration,
    limit: u32,
}

impl LoginLimiter {
    pub fn new(window: Duration, limit: u32) -> Self {
        Self {
            attempts: Arc::new(Mutex::new(HashMap::new())),
            window,
            limit,
        }
    }

    /// Record an attempt for `key` and report whether it is allowed. A
    /// zero limit disables limiting.
    pub fn allow(&self, key: &str) -> bool {
        if self.limit == 0 {
            return true;
        }

        let now = Instant::now();
        let mut attempts = match self.attempts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let window = self.window;
        attempts.retain(|_, events| {
            drop_expired(events, now, window);
            !events.is_empty()
        });

        let events = attempts.entry(key.to_string()).or_default();
        if events.len() >= self.limit as usize {
            return false;
        }
        events.push_back(now);

        if attempts.len() > MAX_TRACKED_KEYS {
            let mut overflow = attempts.len() - MAX_TRACKED_KEYS;
            let keys: Vec<String> = attempts.keys().cloned().collect();
            for key in keys {
                if overflow == 0 {
                    break;
                }
                if attempts.remove(&key).is_some() {
                    overflow -= 1;
                }
            }
        }

        true
    }
}

fn drop_expired(events: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = events.front() {
        if now.duration_since(*oldest) > window {
            events.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn limiter_rejects_once_limit_is_reached() {
        let limiter = LoginLimiter::new(Duration::from_secs(60), 2);
        assert!(limiter.allow("viewer"));
        assert!(limiter.allow("viewer"));
        assert!(!limiter.allow("viewer"));
        // Independent keys are unaffected.
        assert!(limiter.allow("admin"));
    }

    #[test]
    fn limiter_recovers_after_the_window() {
        let limiter = LoginLimiter::new(Duration::from_millis(5), 1);
        assert!(limiter.allow("viewer"));
        assert!(!limiter.allow("viewer"));
        thread::sleep(Duration::from_millis(10));
        assert!(limiter.allow("viewer"));
    }

    #[test]
    fn zero_limit_disables_limiting() {
        let limiter = LoginLimiter::new(Duration::from_secs(60), 0);
        for _ in 0..100 {
            assert!(limiter.allow("viewer"));
        }
    }
}
