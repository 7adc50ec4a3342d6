//! Process-wide request spacing per destination host.
//!
//! Every worker talking to the same host shares one limiter slot queue, so the
//! aggregate request rate stays under the configured ceiling no matter how
//! many targets are configured or how short their intervals are.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return the wait required before executing.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// Leaky-bucket style limiter keyed by host.
#[derive(Debug)]
pub struct HostRateLimiter {
    interval: Duration,
    hosts: Mutex<HashMap<String, Arc<Mutex<IntervalLimiter>>>>,
}

impl HostRateLimiter {
    /// Create a limiter admitting at most one request per `interval` per host.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    async fn limiter_for(&self, host: &str) -> Arc<Mutex<IntervalLimiter>> {
        let mut map = self.hosts.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(IntervalLimiter::new(self.interval))))
            .clone()
    }

    /// Wait until a request to `host` may be issued.
    ///
    /// The slot is reserved before sleeping, so a caller that gets cancelled
    /// while waiting still consumes its slot.
    pub async fn acquire(&self, host: &str) {
        let wait = {
            let limiter = self.limiter_for(host).await;
            let mut guard = limiter.lock().await;
            guard.reserve()
        };
        if wait > Duration::ZERO {
            sleep(wait).await;
        }
    }
}
