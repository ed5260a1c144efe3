use std::pin::pin;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{LimiterError, RateLimiter, CONCURRENCY};

#[derive(Default)]
struct Slots {
    /// Zero means unlimited.
    volume: i64,
    in_use: i64,
    timeout: Duration,
}

/// At most `volume` requests in flight. Permits return through `release`.
#[derive(Default)]
pub struct ConcurrencyLimiter {
    slots: Mutex<Slots>,
    freed: Notify,
}

impl ConcurrencyLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_use(&self) -> i64 {
        self.slots.lock().in_use
    }
}

#[async_trait]
impl RateLimiter for ConcurrencyLimiter {
    fn take(&self) -> Result<(), LimiterError> {
        let mut slots = self.slots.lock();
        if slots.volume > 0 && slots.in_use >= slots.volume {
            return Err(LimiterError::NoToken);
        }
        slots.in_use += 1;
        Ok(())
    }

    async fn take_with_timeout(&self, timeout: Duration) -> Result<(), LimiterError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut notified = pin!(self.freed.notified());
            notified.as_mut().enable();

            if self.take().is_ok() {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(LimiterError::NoToken);
            }
        }
    }

    /// Only `volume` applies. A non-positive volume removes the limit.
    fn set_rate(&self, volume: i64, _speed: i64) {
        self.slots.lock().volume = volume.max(0);
        self.freed.notify_waiters();
    }

    fn volume(&self) -> i64 {
        self.slots.lock().volume
    }

    fn speed(&self) -> i64 {
        -1
    }

    fn timeout(&self) -> Duration {
        self.slots.lock().timeout
    }

    fn set_timeout(&self, timeout: Duration) {
        self.slots.lock().timeout = timeout;
    }

    fn release(&self) {
        {
            let mut slots = self.slots.lock();
            slots.in_use = (slots.in_use - 1).max(0);
        }
        self.freed.notify_one();
    }

    fn kind(&self) -> &'static str {
        CONCURRENCY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_slots_exhaust_and_release() {
        let limiter = ConcurrencyLimiter::new();
        limiter.set_rate(2, 0);

        assert!(limiter.take().is_ok());
        assert!(limiter.take().is_ok());
        assert_eq!(limiter.take(), Err(LimiterError::NoToken));

        limiter.release();
        assert!(limiter.take().is_ok());
        assert_eq!(limiter.in_use(), 2);
        assert_eq!(limiter.speed(), -1);
    }

    #[test]
    fn test_unlimited_by_default() {
        let limiter = ConcurrencyLimiter::new();
        for _ in 0..100 {
            assert!(limiter.take().is_ok());
        }
    }

    #[test]
    fn test_release_never_underflows() {
        let limiter = ConcurrencyLimiter::new();
        limiter.release();
        assert_eq!(limiter.in_use(), 0);
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let limiter = Arc::new(ConcurrencyLimiter::new());
        limiter.set_rate(1, 0);
        limiter.take().unwrap();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.take_with_timeout(Duration::from_secs(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        limiter.release();

        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_waiter_times_out() {
        let limiter = ConcurrencyLimiter::new();
        limiter.set_rate(1, 0);
        limiter.take().unwrap();

        let result = limiter.take_with_timeout(Duration::from_millis(30)).await;
        assert_eq!(result, Err(LimiterError::NoToken));
    }
}
