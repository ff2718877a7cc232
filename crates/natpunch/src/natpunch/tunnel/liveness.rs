use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Never reached `Ready`; only the creation grace period applies.
    Pending,
    Alive,
    Dead,
}

/// Last-received bookkeeping for one session.
///
/// Written by the receive task, read by timer tasks. Timestamps are stored as
/// nanoseconds since `epoch` so the hot path is a single atomic store.
#[derive(Debug)]
pub struct Liveness {
    epoch: Instant,
    last_rx_nanos: AtomicU64,
    ready: AtomicBool,
    timeout: Duration,
}

impl Liveness {
    pub fn new(timeout: Duration) -> Self {
        Self::starting_at(Instant::now(), timeout)
    }

    pub fn starting_at(epoch: Instant, timeout: Duration) -> Self {
        Self {
            epoch,
            last_rx_nanos: AtomicU64::new(0),
            ready: AtomicBool::new(false),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn created_at(&self) -> Instant {
        self.epoch
    }

    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    pub fn touch_at(&self, now: Instant) {
        let n = now.saturating_duration_since(self.epoch).as_nanos() as u64;
        self.last_rx_nanos.fetch_max(n, Ordering::Relaxed);
    }

    /// Marks the session ready and counts `now` as a receive. Returns `true`
    /// on the first transition.
    pub fn mark_ready_at(&self, now: Instant) -> bool {
        self.touch_at(now);
        !self.ready.swap(true, Ordering::AcqRel)
    }

    pub fn mark_ready(&self) -> bool {
        self.mark_ready_at(Instant::now())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn last_rx(&self) -> Instant {
        self.epoch + Duration::from_nanos(self.last_rx_nanos.load(Ordering::Relaxed))
    }

    pub fn idle_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_rx())
    }

    /// A ready session is dead once the gap since the last receive strictly
    /// exceeds the timeout.
    pub fn verdict_at(&self, now: Instant) -> Verdict {
        if !self.is_ready() {
            return Verdict::Pending;
        }
        if self.idle_at(now) > self.timeout {
            Verdict::Dead
        } else {
            Verdict::Alive
        }
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict_at(Instant::now())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Retry { failures: u32 },
    Exhausted { failures: u32 },
}

/// Consecutive-failure counter for the client reconnect loop.
///
/// `limit == 0` retries forever.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    limit: u32,
    failures: u32,
}

impl RetryBudget {
    pub fn new(limit: u32) -> Self {
        Self { limit, failures: 0 }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn record_failure(&mut self) -> Attempt {
        self.failures = self.failures.saturating_add(1);
        if self.limit != 0 && self.failures >= self.limit {
            Attempt::Exhausted {
                failures: self.failures,
            }
        } else {
            Attempt::Retry {
                failures: self.failures,
            }
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_only_strictly_after_timeout() {
        let t0 = Instant::now();
        let timeout = Duration::from_secs(15);
        let l = Liveness::starting_at(t0, timeout);

        assert_eq!(l.verdict_at(t0 + Duration::from_secs(60)), Verdict::Pending);

        assert!(l.mark_ready_at(t0));
        assert!(!l.mark_ready_at(t0));
        assert_eq!(l.verdict_at(t0 + Duration::from_secs(5)), Verdict::Alive);
        assert_eq!(l.verdict_at(t0 + timeout), Verdict::Alive);
        assert_eq!(
            l.verdict_at(t0 + timeout + Duration::from_millis(1)),
            Verdict::Dead
        );
    }

    #[test]
    fn touch_pushes_deadline() {
        let t0 = Instant::now();
        let l = Liveness::starting_at(t0, Duration::from_secs(10));
        l.mark_ready_at(t0);
        l.touch_at(t0 + Duration::from_secs(8));
        assert_eq!(l.verdict_at(t0 + Duration::from_secs(15)), Verdict::Alive);
        // An out-of-order older timestamp never moves the clock back.
        l.touch_at(t0 + Duration::from_secs(1));
        assert_eq!(l.idle_at(t0 + Duration::from_secs(15)), Duration::from_secs(7));
        assert_eq!(l.verdict_at(t0 + Duration::from_secs(19)), Verdict::Dead);
    }

    #[test]
    fn budget_exhausts_after_exact_limit() {
        let mut b = RetryBudget::new(3);
        assert_eq!(b.record_failure(), Attempt::Retry { failures: 1 });
        assert_eq!(b.record_failure(), Attempt::Retry { failures: 2 });
        assert_eq!(b.record_failure(), Attempt::Exhausted { failures: 3 });
    }

    #[test]
    fn budget_resets_on_success() {
        let mut b = RetryBudget::new(3);
        b.record_failure();
        b.record_failure();
        b.reset();
        assert_eq!(b.failures(), 0);
        assert_eq!(b.record_failure(), Attempt::Retry { failures: 1 });
    }

    #[test]
    fn zero_limit_is_unbounded() {
        let mut b = RetryBudget::new(0);
        for _ in 0..1000 {
            assert!(matches!(b.record_failure(), Attempt::Retry { .. }));
        }
    }
}
