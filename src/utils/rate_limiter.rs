use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, warn};

/// Errors surfaced to callers waiting on the limiter
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateLimiterError {
    /// The limiter was reset while the caller was queued
    #[error("rate limiter was reset while waiting for a token")]
    Reset,
}

/// Token-bucket rate limiter.
///
/// Tokens refill continuously at `refill_per_second` up to `capacity`.
/// Callers that find the bucket empty queue up in FIFO order and are woken
/// by a single drain loop per limiter.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

struct Inner {
    capacity: f64,
    refill_per_second: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    waiters: VecDeque<oneshot::Sender<()>>,
    draining: bool,
}

impl BucketState {
    fn refill(&mut self, capacity: f64, refill_per_second: f64) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_second).min(capacity);
        self.last_refill = now;
    }
}

impl RateLimiter {
    /// Create a full bucket
    pub fn new(capacity: u32, refill_per_second: f64) -> Self {
        let capacity = capacity.max(1) as f64;
        Self {
            inner: Arc::new(Inner {
                capacity,
                refill_per_second,
                state: Mutex::new(BucketState {
                    tokens: capacity,
                    last_refill: Instant::now(),
                    waiters: VecDeque::new(),
                    draining: false,
                }),
            }),
        }
    }

    /// Wait until a token is available and consume it.
    ///
    /// Only fails when [`RateLimiter::reset`] abandons the queued caller.
    pub async fn acquire(&self) -> Result<(), RateLimiterError> {
        let rx = {
            let mut state = self.inner.state.lock().await;
            state.refill(self.inner.capacity, self.inner.refill_per_second);

            // Queued callers go first so a newcomer cannot overtake them
            if state.waiters.is_empty() && state.tokens >= 1.0 {
                state.tokens -= 1.0;
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);

            if !state.draining {
                state.draining = true;
                let inner = self.inner.clone();
                tokio::spawn(async move { inner.drain().await });
            }

            rx
        };

        rx.await.map_err(|_| RateLimiterError::Reset)
    }

    /// Whole tokens currently available
    pub async fn available_tokens(&self) -> u32 {
        let mut state = self.inner.state.lock().await;
        state.refill(self.inner.capacity, self.inner.refill_per_second);
        state.tokens.floor() as u32
    }

    /// Number of callers queued for a token
    pub async fn waiting(&self) -> usize {
        self.inner.state.lock().await.waiters.len()
    }

    /// Refill to capacity and abandon every queued caller with
    /// [`RateLimiterError::Reset`].
    pub async fn reset(&self) {
        let mut state = self.inner.state.lock().await;
        let abandoned = state.waiters.len();
        state.waiters.clear();
        state.tokens = self.inner.capacity;
        state.last_refill = Instant::now();

        if abandoned > 0 {
            warn!("Rate limiter reset abandoned {} waiting callers", abandoned);
        }
    }

    pub fn capacity(&self) -> u32 {
        self.inner.capacity as u32
    }
}

impl Inner {
    fn retry_interval(&self) -> Duration {
        let ms = (1000.0 / self.refill_per_second).ceil().max(1.0);
        Duration::from_millis(ms as u64)
    }

    async fn drain(&self) {
        loop {
            {
                let mut state = self.state.lock().await;
                state.refill(self.capacity, self.refill_per_second);

                while state.tokens >= 1.0 {
                    let Some(waiter) = state.waiters.pop_front() else {
                        break;
                    };
                    // A dropped receiver means the caller gave up; keep the token
                    if waiter.send(()).is_ok() {
                        state.tokens -= 1.0;
                    }
                }

                if state.waiters.is_empty() {
                    state.draining = false;
                    debug!("Rate limiter drain loop finished");
                    return;
                }
            }

            sleep(self.retry_interval()).await;
        }
    }
}
