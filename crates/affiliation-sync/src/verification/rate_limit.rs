use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Sliding-window request counter: at most `max_requests` per trailing `window`.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    timestamps: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        let max_requests = usize::try_from(max_requests.max(1)).unwrap_or(usize::MAX);
        Self {
            max_requests,
            window,
            timestamps: VecDeque::with_capacity(max_requests.min(1024)),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.timestamps.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn can_make_request(&mut self) -> bool {
        self.can_make_request_at(Instant::now())
    }

    pub fn can_make_request_at(&mut self, now: Instant) -> bool {
        self.prune(now);
        self.timestamps.len() < self.max_requests
    }

    /// Must be called exactly once per outbound call, right before it is issued.
    pub fn record_request(&mut self) {
        self.record_request_at(Instant::now());
    }

    pub fn record_request_at(&mut self, now: Instant) {
        self.timestamps.push_back(now);
    }

    pub fn wait_time(&mut self) -> Duration {
        self.wait_time_at(Instant::now())
    }

    /// Time until the oldest request leaves the window, or zero below capacity.
    pub fn wait_time_at(&mut self, now: Instant) -> Duration {
        if self.can_make_request_at(now) {
            return Duration::ZERO;
        }
        self.timestamps
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Requests still counted against the window.
    pub fn in_flight_at(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.timestamps.len()
    }
}

/// Single-writer wrapper enforcing check, wait, record ordering.
#[derive(Debug)]
pub struct SharedRateLimiter {
    inner: Mutex<RateLimiter>,
}

impl SharedRateLimiter {
    pub fn new(limiter: RateLimiter) -> Self {
        Self {
            inner: Mutex::new(limiter),
        }
    }

    /// Suspends until a slot is free, then records the request.
    ///
    /// The check and the record happen under one lock acquisition, so two
    /// callers can never both claim the last slot.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut limiter = self.inner.lock().await;
                let now = Instant::now();
                if limiter.can_make_request_at(now) {
                    limiter.record_request_at(now);
                    return;
                }
                limiter.wait_time_at(now)
            };
            debug!(wait_ms = wait.as_millis() as u64, "lookup rate limit reached, waiting");
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    pub async fn in_flight(&self) -> usize {
        self.inner.lock().await.in_flight_at(Instant::now())
    }
}
