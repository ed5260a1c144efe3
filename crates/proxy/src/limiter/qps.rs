use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use parking_lot::RwLock;

use super::{LimiterError, RateLimiter, QPS};

type Bucket = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Default)]
struct State {
    /// `None` until a rate is set: every request passes.
    bucket: Option<Arc<Bucket>>,
    volume: i64,
    speed: i64,
    timeout: Duration,
}

/// Token bucket refilled at `speed` tokens per second up to `volume` tokens.
#[derive(Default)]
pub struct QpsLimiter {
    state: RwLock<State>,
}

impl QpsLimiter {
    /// An unlimited limiter.
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(&self) -> Option<Arc<Bucket>> {
        self.state.read().bucket.clone()
    }
}

fn clamp(value: i64) -> Option<NonZeroU32> {
    NonZeroU32::new(value.clamp(0, u32::MAX as i64) as u32)
}

#[async_trait]
impl RateLimiter for QpsLimiter {
    fn take(&self) -> Result<(), LimiterError> {
        match self.bucket() {
            Some(bucket) => bucket.check().map_err(|_| LimiterError::NoToken),
            None => Ok(()),
        }
    }

    async fn take_with_timeout(&self, timeout: Duration) -> Result<(), LimiterError> {
        let Some(bucket) = self.bucket() else {
            return Ok(());
        };
        if timeout.is_zero() {
            return bucket.check().map_err(|_| LimiterError::NoToken);
        }
        tokio::time::timeout(timeout, bucket.until_ready())
            .await
            .map_err(|_| LimiterError::NoToken)
    }

    /// A non-positive `speed` removes the limit. A non-positive `volume`
    /// defaults the burst to one second worth of tokens.
    fn set_rate(&self, volume: i64, speed: i64) {
        let mut state = self.state.write();
        match clamp(speed) {
            Some(per_second) => {
                let burst = clamp(volume).unwrap_or(per_second);
                let quota = Quota::per_second(per_second).allow_burst(burst);
                state.bucket = Some(Arc::new(Bucket::direct(quota)));
                state.volume = burst.get() as i64;
                state.speed = per_second.get() as i64;
            }
            None => {
                state.bucket = None;
                state.volume = 0;
                state.speed = 0;
            }
        }
    }

    fn volume(&self) -> i64 {
        self.state.read().volume
    }

    fn speed(&self) -> i64 {
        self.state.read().speed
    }

    fn timeout(&self) -> Duration {
        self.state.read().timeout
    }

    fn set_timeout(&self, timeout: Duration) {
        self.state.write().timeout = timeout;
    }

    fn kind(&self) -> &'static str {
        QPS
    }
}
