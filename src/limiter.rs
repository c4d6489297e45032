//! Token-bucket-style rate limiter gating new outbound SSH connections.
//!
//! Guarantees that successive completions of [`RateLimiter::wait`] are
//! separated by at least `1 / rate` and that waiters are served strictly
//! FIFO. The state machine runs inside one dedicated task that owns all
//! the mutable state, so `wait()` callers never need a lock — they just
//! send a request and await the reply, keeping every mutation of
//! `last_released`/the waiter queue run-to-completion between suspension
//! points.

use std::time::Duration;

use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};

/// Handle to a running rate limiter. Cheap to clone; all clones share the
/// same dispatcher task.
#[derive(Clone)]
pub struct RateLimiter {
    requests: mpsc::UnboundedSender<oneshot::Sender<()>>,
}

impl RateLimiter {
    /// Spawn the dispatcher task and return a handle. `rate` is releases
    /// per second; must be positive.
    pub fn spawn(rate: f64) -> Self {
        assert!(rate > 0.0, "rate limiter requires a positive rate");
        let delay = Duration::from_secs_f64(1.0 / rate);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(rx, delay));
        RateLimiter { requests: tx }
    }

    /// Suspend the caller until the limiter releases it. Returns
    /// immediately if no waiter is currently ahead of it and the minimum
    /// inter-release interval has already elapsed.
    pub async fn wait(&self) {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(tx).is_err() {
            // Dispatcher task is gone (shutdown); nothing left to gate.
            return;
        }
        // A dropped sender (dispatcher exited) is treated the same as an
        // immediate release — there is no limiter left to enforce.
        let _ = rx.await;
    }
}

/// The dispatcher owns `last_released` and the FIFO queue of waiters.
/// Waiters that are cancelled (their `oneshot::Receiver` dropped) are
/// skipped without disturbing FIFO order for the rest of the queue.
async fn dispatch(mut requests: mpsc::UnboundedReceiver<oneshot::Sender<()>>, delay: Duration) {
    let mut last_released: Option<Instant> = None;
    let mut queue: std::collections::VecDeque<oneshot::Sender<()>> = Default::default();

    loop {
        // Drain any requests that arrived since we last looked, without
        // blocking if none are pending yet and the queue is non-empty.
        loop {
            match requests.try_recv() {
                Ok(tx) => queue.push_back(tx),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if queue.is_empty() {
                        return;
                    }
                    break;
                }
            }
        }

        if queue.is_empty() {
            match requests.recv().await {
                Some(tx) => queue.push_back(tx),
                None => return,
            }
            continue;
        }

        let now = Instant::now();
        let ready_at = last_released.map(|t| t + delay).unwrap_or(now);
        if ready_at > now {
            tokio::time::sleep_until(ready_at).await;
        }

        // Pop the oldest non-cancelled waiter; cancelled heads are
        // skipped and never count as a release.
        while let Some(tx) = queue.pop_front() {
            if tx.send(()).is_ok() {
                last_released = Some(Instant::now());
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn first_wait_is_immediate() {
        let limiter = RateLimiter::spawn(1.0);
        let start = Instant::now();
        limiter.wait().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn successive_waits_are_spaced_by_delay() {
        let limiter = RateLimiter::spawn(10.0); // 100ms delay
        limiter.wait().await;
        let start = Instant::now();
        limiter.wait().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(95), "elapsed={elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_served_fifo() {
        let limiter = RateLimiter::spawn(1000.0);
        limiter.wait().await; // consume the immediate slot

        let l1 = limiter.clone();
        let l2 = limiter.clone();
        let order = std::sync::Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();

        let t1 = tokio::spawn(async move {
            l1.wait().await;
            o1.lock().await.push(1);
        });
        // Ensure t1's request is enqueued before t2's.
        tokio::task::yield_now().await;
        let t2 = tokio::spawn(async move {
            l2.wait().await;
            o2.lock().await.push(2);
        });

        tokio::time::advance(Duration::from_secs(1)).await;
        t1.await.unwrap();
        t2.await.unwrap();

        assert_eq!(*order.lock().await, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_is_skipped() {
        let limiter = RateLimiter::spawn(1000.0);
        limiter.wait().await;

        let l1 = limiter.clone();
        let cancelled = tokio::spawn(async move {
            l1.wait().await;
        });
        tokio::task::yield_now().await;
        cancelled.abort();

        let l2 = limiter.clone();
        tokio::time::timeout(Duration::from_secs(1), l2.wait())
            .await
            .expect("second waiter must still be released");
    }
}
