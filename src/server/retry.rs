//! Consecutive-failure accounting for the listen loop.

use std::sync::atomic::{AtomicU32, Ordering};

/// Counts listener failures in a row. Any successful start resets it.
#[derive(Debug)]
pub(crate) struct FailureCounter {
    consecutive: AtomicU32,
    limit: u32,
}

impl FailureCounter {
    pub(crate) fn new(limit: u32) -> Self {
        Self {
            consecutive: AtomicU32::new(0),
            limit,
        }
    }

    /// Records one failure and returns the new streak length.
    pub(crate) fn record_failure(&self) -> u32 {
        self.consecutive.fetch_add(1, Ordering::AcqRel).saturating_add(1)
    }

    pub(crate) fn record_success(&self) {
        self.consecutive.store(0, Ordering::Release);
    }

    pub(crate) fn consecutive(&self) -> u32 {
        self.consecutive.load(Ordering::Acquire)
    }

    pub(crate) fn limit(&self) -> u32 {
        self.limit
    }

    /// True once the streak has reached the limit.
    pub(crate) fn exhausted(&self) -> bool {
        self.consecutive() >= self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_at_limit() {
        let counter = FailureCounter::new(3);
        assert_eq!(counter.record_failure(), 1);
        assert_eq!(counter.record_failure(), 2);
        assert!(!counter.exhausted());
        assert_eq!(counter.record_failure(), 3);
        assert!(counter.exhausted());
    }

    #[test]
    fn success_resets_the_streak() {
        let counter = FailureCounter::new(2);
        counter.record_failure();
        counter.record_success();
        assert_eq!(counter.consecutive(), 0);
        counter.record_failure();
        assert!(!counter.exhausted());
    }

    #[test]
    fn zero_limit_is_exhausted_immediately() {
        let counter = FailureCounter::new(0);
        assert!(counter.exhausted());
    }
}
