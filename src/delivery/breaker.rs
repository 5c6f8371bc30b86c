use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct HostState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: DateTime<Utc>,
}

/// Per-host delivery gate. A host that keeps failing is taken out of the
/// MX rotation until `reset_timeout` has passed, after which a single
/// probe decides whether it comes back.
///
/// State is process-local and never persisted; a restart simply re-probes.
pub struct CircuitBreaker {
    hosts: Mutex<HashMap<String, HostState>>,
    threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    pub const DEFAULT_THRESHOLD: u32 = 5;

    pub fn new(threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            hosts: Mutex::new(HashMap::new()),
            threshold,
            reset_timeout,
        }
    }

    pub fn allow(&self, host: &str) -> bool {
        self.allow_at(host, Utc::now())
    }

    pub fn record_success(&self, host: &str) {
        self.record_success_at(host, Utc::now())
    }

    pub fn record_failure(&self, host: &str) {
        self.record_failure_at(host, Utc::now())
    }

    pub fn allow_at(&self, host: &str, now: DateTime<Utc>) -> bool {
        let mut hosts = self.hosts.lock().expect("circuit breaker mutex poisoned");

        let Some(entry) = hosts.get_mut(host) else {
            return true;
        };

        match entry.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if now - entry.last_failure >= self.reset_timeout {
                    entry.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success_at(&self, host: &str, _now: DateTime<Utc>) {
        let mut hosts = self.hosts.lock().expect("circuit breaker mutex poisoned");

        if let Some(entry) = hosts.get_mut(host) {
            entry.state = CircuitState::Closed;
            entry.consecutive_failures = 0;
        }
    }

    pub fn record_failure_at(&self, host: &str, now: DateTime<Utc>) {
        let mut hosts = self.hosts.lock().expect("circuit breaker mutex poisoned");

        let entry = hosts.entry(host.to_string()).or_insert(HostState {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: now,
        });

        entry.last_failure = now;

        match entry.state {
            CircuitState::HalfOpen => {
                // the probe failed, back to open
                entry.state = CircuitState::Open;
            }
            CircuitState::Closed => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= self.threshold {
                    entry.state = CircuitState::Open;
                }
            }
            CircuitState::Open => {}
        }
    }

    #[cfg(test)]
    fn state_of(&self, host: &str) -> Option<(CircuitState, u32)> {
        self.hosts
            .lock()
            .unwrap()
            .get(host)
            .map(|entry| (entry.state, entry.consecutive_failures))
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD, Duration::minutes(5))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn minutes(m: i64) -> Duration {
        Duration::minutes(m)
    }

    #[test]
    fn unknown_hosts_are_allowed() {
        let breaker = CircuitBreaker::default();
        assert!(breaker.allow("mx.example.com"));
    }

    #[test]
    fn trips_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(3, minutes(5));
        let now = Utc::now();

        for _ in 0..3 {
            breaker.record_failure_at("mx", now);
        }

        assert!(!breaker.allow_at("mx", now));
        assert_eq!(breaker.state_of("mx").unwrap().0, CircuitState::Open);
    }

    #[test]
    fn success_resets_the_failure_count() {
        let breaker = CircuitBreaker::new(3, minutes(5));
        let now = Utc::now();

        breaker.record_failure_at("mx", now);
        breaker.record_failure_at("mx", now);
        breaker.record_success_at("mx", now);
        breaker.record_failure_at("mx", now);

        assert!(breaker.allow_at("mx", now));
        assert_eq!(breaker.state_of("mx").unwrap().1, 1);
    }

    #[test]
    fn recovers_through_half_open_on_success() {
        let breaker = CircuitBreaker::new(3, minutes(5));
        let now = Utc::now();

        for _ in 0..3 {
            breaker.record_failure_at("mx", now);
        }
        assert!(!breaker.allow_at("mx", now));

        // reset timeout elapsed: one probe is let through
        let later = now + minutes(6);
        assert!(breaker.allow_at("mx", later));
        assert_eq!(breaker.state_of("mx").unwrap().0, CircuitState::HalfOpen);

        breaker.record_success_at("mx", later);
        assert_eq!(breaker.state_of("mx").unwrap(), (CircuitState::Closed, 0));
        assert!(breaker.allow_at("mx", later));
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(2, minutes(5));
        let now = Utc::now();

        breaker.record_failure_at("mx", now);
        breaker.record_failure_at("mx", now);

        let later = now + minutes(6);
        assert!(breaker.allow_at("mx", later));
        breaker.record_failure_at("mx", later);

        assert_eq!(breaker.state_of("mx").unwrap().0, CircuitState::Open);
        assert!(!breaker.allow_at("mx", later + minutes(1)));
        // and the clock restarts from the probe failure
        assert!(breaker.allow_at("mx", later + minutes(6)));
    }

    #[test]
    fn hosts_are_independent() {
        let breaker = CircuitBreaker::new(1, minutes(5));
        let now = Utc::now();

        breaker.record_failure_at("mx-a", now);
        assert!(!breaker.allow_at("mx-a", now));
        assert!(breaker.allow_at("mx-b", now));
    }
}
