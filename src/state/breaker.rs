//! Consecutive-failure circuit breaker.

use std::sync::Mutex;

struct Inner {
    count: u32,
    paused: bool,
}

/// Thread-safe consecutive-failure counter with a pause threshold.
pub struct CircuitBreaker {
    threshold: u32,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            inner: Mutex::new(Inner {
                count: 0,
                paused: false,
            }),
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.count += 1;
        if inner.count >= self.threshold {
            inner.paused = true;
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.count = 0;
        inner.paused = false;
    }

    /// Explicitly clear both the counter and the paused flag.
    pub fn reset(&self) {
        self.record_success();
    }

    /// Restore the counter from a checkpoint; recomputes the paused flag.
    pub fn set(&self, count: u32) {
        let mut inner = self.lock();
        inner.count = count;
        inner.paused = count >= self.threshold;
    }

    pub fn should_pause(&self) -> bool {
        self.lock().paused
    }

    pub fn count(&self) -> u32 {
        self.lock().count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pauses_at_threshold() {
        let breaker = CircuitBreaker::new(3);
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.should_pause());
        breaker.record_failure();
        assert!(breaker.should_pause());
        assert_eq!(breaker.count(), 3);
    }

    #[test]
    fn success_resets_count_and_pause() {
        let breaker = CircuitBreaker::new(2);
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.should_pause());
        breaker.record_success();
        assert!(!breaker.should_pause());
        assert_eq!(breaker.count(), 0);
    }

    #[test]
    fn set_recomputes_paused() {
        let breaker = CircuitBreaker::new(3);
        breaker.set(5);
        assert!(breaker.should_pause());
        breaker.set(1);
        assert!(!breaker.should_pause());
    }

    #[test]
    fn reset_clears_both() {
        let breaker = CircuitBreaker::new(1);
        breaker.record_failure();
        assert!(breaker.should_pause());
        breaker.reset();
        assert!(!breaker.should_pause());
        assert_eq!(breaker.count(), 0);
    }

    #[test]
    fn threshold_boundary_holds_for_any_count() {
        let threshold = 4;
        let breaker = CircuitBreaker::new(threshold);
        for n in 1..=8u32 {
            breaker.record_failure();
            assert_eq!(breaker.should_pause(), n >= threshold);
        }
    }
}
