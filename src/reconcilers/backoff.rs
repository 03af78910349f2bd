use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

/// Exponential requeue delays for objects that keep failing.
///
/// Each consecutive failure doubles the delay, up to a maximum. A successful
/// reconcile resets the object. Objects that stop failing without ever
/// succeeding, e.g. because they were deleted, are forgotten once they have
/// been quiet for twice the maximum delay.
#[derive(Debug, Default)]
pub struct Backoff {
    failures: Mutex<HashMap<String, Failures>>,
}

#[derive(Debug)]
struct Failures {
    count: u32,
    last: Instant,
}

impl Backoff {
    /// Record a failure of `key` and return how long to wait before retrying
    pub fn next(&self, key: &str, base: Duration, max: Duration) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let forget_after = max.saturating_mul(2);
        failures.retain(|k, f| k == key || now.duration_since(f.last) <= forget_after);

        let entry = failures.entry(key.to_string()).or_insert(Failures {
            count: 0,
            last: now,
        });

        let delay = base.saturating_mul(2u32.saturating_pow(entry.count)).min(max);
        entry.count = entry.count.saturating_add(1);
        entry.last = now;

        delay
    }

    pub fn reset(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Number of objects currently backing off
    #[cfg(test)]
    pub fn tracked(&self) -> usize {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_max_and_resets() {
        let backoff = Backoff::default();
        let (base, max) = (Duration::from_secs(1), Duration::from_secs(10));

        let delays: Vec<_> = (0..6)
            .map(|_| backoff.next("Interface/default/po1", base, max).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);

        // Other objects are tracked separately
        assert_eq!(backoff.next("Interface/default/po2", base, max), base);

        backoff.reset("Interface/default/po1");
        assert_eq!(backoff.next("Interface/default/po1", base, max), base);
    }

    #[test]
    fn survives_many_failures() {
        let backoff = Backoff::default();
        for _ in 0..100 {
            backoff.next("x", Duration::from_secs(1), Duration::from_secs(300));
        }
        assert_eq!(
            backoff.next("x", Duration::from_secs(1), Duration::from_secs(300)),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn quiet_objects_are_forgotten() {
        let backoff = Backoff::default();
        let (base, max) = (Duration::from_millis(1), Duration::from_millis(5));

        backoff.next("Interface/default/deleted", base, max);
        backoff.next("Interface/default/deleted", base, max);
        assert_eq!(backoff.tracked(), 1);

        std::thread::sleep(Duration::from_millis(30));
        backoff.next("Interface/default/eth1", base, max);
        assert_eq!(backoff.tracked(), 1);

        // Starting over from the base delay
        assert_eq!(backoff.next("Interface/default/deleted", base, max), base);
    }
}
