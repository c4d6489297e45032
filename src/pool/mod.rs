//! The warm pool of authenticated SSH sessions.
//!
//! FIFO waiters, a set of in-flight builder tasks, and a `debt`
//! rebalance formula (`debt = size - reserve + waiters - builders`) that
//! keeps exactly `size` entries worth of reserve-plus-in-flight-work
//! alive at quiescence. A builder that finishes hands its fresh entry
//! straight to the oldest waiter if one exists, otherwise it joins
//! `reserve`; an entry handed to [`Pool::borrow`] is never returned —
//! dropping the guard just drops the entry.
//!
//! The connector is abstracted behind the [`Connector`] trait so the
//! scheduling logic below is unit-testable without a real SSH server.

pub mod ssh;

use std::{collections::VecDeque, future::Future, pin::Pin, sync::Arc, time::Duration};

use tokio::{
    sync::{oneshot, Mutex},
    task::JoinHandle,
};

use crate::{error::BoxError, limiter::RateLimiter};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Builds one pool item end-to-end. Implemented by [`ssh::SshConnector`]
/// for the real pool; test connectors implement it directly.
pub trait Connector: Send + Sync + 'static {
    type Item: Send + 'static;

    fn connect(&self) -> BoxFuture<'_, Result<Self::Item, BoxError>>;
}

struct PoolState<T> {
    reserve: VecDeque<T>,
    waiters: VecDeque<oneshot::Sender<T>>,
    builders: Vec<(u64, JoinHandle<()>)>,
    next_builder_id: u64,
    stopped: bool,
}

impl<T> PoolState<T> {
    fn new() -> Self {
        PoolState {
            reserve: VecDeque::new(),
            waiters: VecDeque::new(),
            builders: Vec::new(),
            next_builder_id: 0,
            stopped: false,
        }
    }
}

pub struct Pool<C: Connector> {
    connector: C,
    size: usize,
    backoff: Duration,
    connect_timeout: Duration,
    limiter: RateLimiter,
    state: Mutex<PoolState<C::Item>>,
}

impl<C: Connector> Pool<C> {
    pub fn new(
        connector: C,
        size: usize,
        backoff: Duration,
        connect_timeout: Duration,
        limiter: RateLimiter,
    ) -> Arc<Self> {
        Arc::new(Pool {
            connector,
            size,
            backoff,
            connect_timeout,
            limiter,
            state: Mutex::new(PoolState::new()),
        })
    }

    /// Begin maintaining the pool: spawns builder tasks up to `size`.
    /// Does not block for any of them to finish.
    pub async fn start(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        self.rebalance(&mut state);
    }

    /// Cancel every builder, await their termination, then drop every
    /// reserve entry (each item's own `Drop` tears it down).
    ///
    /// A builder racing `stop()` can still be past its connect and
    /// mid-way through acquiring `state` to hand off or join `reserve`
    /// when the snapshot below is taken, so its entry would land in
    /// `reserve` only after this function has already looked at it. The
    /// lock is re-acquired and `reserve` drained a second time, after
    /// every builder handle has been awaited, to catch that entry too.
    pub async fn stop(self: &Arc<Self>) {
        let builders = {
            let mut state = self.state.lock().await;
            state.stopped = true;
            std::mem::take(&mut state.builders)
        };
        for (_, handle) in &builders {
            handle.abort();
        }
        for (_, handle) in builders {
            match handle.await {
                Ok(()) | Err(_) => {}
            }
        }

        let reserve = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.reserve)
        };
        drop(reserve);
    }

    /// `debt = size - reserve + waiters - builders`; spawn `max(0,
    /// debt)` builders. Must be called with `state` already locked —
    /// every mutation of reserve/waiters/builders ends with a call to
    /// this so the invariant is restored immediately.
    fn rebalance(self: &Arc<Self>, state: &mut PoolState<C::Item>) {
        if state.stopped {
            return;
        }
        let debt = self.size as i64 - state.reserve.len() as i64 + state.waiters.len() as i64
            - state.builders.len() as i64;
        for _ in 0..debt.max(0) {
            let id = state.next_builder_id;
            state.next_builder_id += 1;
            let handle = tokio::spawn(build_conn_task(self.clone(), id));
            state.builders.push((id, handle));
        }
    }

    async fn get(self: &Arc<Self>) -> C::Item {
        let mut state = self.state.lock().await;
        if let Some(item) = state.reserve.pop_front() {
            self.rebalance(&mut state);
            return item;
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        self.rebalance(&mut state);
        drop(state);
        rx.await
            .expect("pool dropped while a borrow was waiting for an entry")
    }

    /// Borrow one entry. Suspends while the pool is exhausted. The
    /// returned guard never returns its entry to `reserve` — dropping
    /// it (successfully used or not) is the entry's last participation
    /// in the pool.
    pub async fn borrow(self: &Arc<Self>) -> Borrowed<C::Item> {
        Borrowed {
            item: Some(self.get().await),
        }
    }

    #[cfg(test)]
    async fn snapshot(&self) -> (usize, usize, usize) {
        let state = self.state.lock().await;
        (state.reserve.len(), state.waiters.len(), state.builders.len())
    }
}

async fn build_conn_task<C: Connector>(pool: Arc<Pool<C>>, id: u64) {
    let mut item = loop {
        pool.limiter.wait().await;
        match tokio::time::timeout(pool.connect_timeout, pool.connector.connect()).await {
            Ok(Ok(item)) => break item,
            Ok(Err(err)) => {
                tracing::warn!(%err, "pool builder connect failed, backing off");
                tokio::time::sleep(pool.backoff).await;
            }
            Err(_) => {
                tracing::warn!("pool builder connect timed out, backing off");
                tokio::time::sleep(pool.backoff).await;
            }
        }
    };

    let mut state = pool.state.lock().await;
    let mut delivered = false;
    while let Some(tx) = state.waiters.pop_front() {
        match tx.send(item) {
            Ok(()) => {
                delivered = true;
                break;
            }
            Err(returned) => item = returned,
        }
    }
    if !delivered {
        state.reserve.push_back(item);
    }
    state.builders.retain(|(bid, _)| *bid != id);
    pool.rebalance(&mut state);
}

/// RAII handle to one borrowed pool entry. Never puts the entry back;
/// dropping it (after success or failure) just drops the item, relying
/// on the item's own `Drop` to close it.
pub struct Borrowed<T> {
    item: Option<T>,
}

impl<T> std::ops::Deref for Borrowed<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.item.as_ref().expect("borrowed item already taken")
    }
}

impl<T> std::ops::DerefMut for Borrowed<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("borrowed item already taken")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct CountingConnector {
        next: AtomicU32,
    }

    impl Connector for CountingConnector {
        type Item = u32;
        fn connect(&self) -> BoxFuture<'_, Result<u32, BoxError>> {
            let id = self.next.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(id) })
        }
    }

    fn fast_limiter() -> RateLimiter {
        RateLimiter::spawn(1_000_000.0)
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn pool_reaches_target_size_at_quiescence() {
        let pool = Pool::new(
            CountingConnector { next: AtomicU32::new(0) },
            3,
            Duration::from_millis(10),
            Duration::from_secs(1),
            fast_limiter(),
        );
        pool.start().await;
        settle().await;

        let (reserve, waiters, builders) = pool.snapshot().await;
        assert_eq!(reserve, 3);
        assert_eq!(waiters, 0);
        assert_eq!(builders, 0);
    }

    #[tokio::test]
    async fn borrowed_entry_is_never_returned_to_reserve() {
        let pool = Pool::new(
            CountingConnector { next: AtomicU32::new(0) },
            1,
            Duration::from_millis(10),
            Duration::from_secs(1),
            fast_limiter(),
        );
        pool.start().await;
        settle().await;
        assert_eq!(pool.snapshot().await.0, 1);

        let borrowed = pool.borrow().await;
        assert_eq!(pool.snapshot().await.0, 0);
        drop(borrowed);
        settle().await;

        // a replacement builder is spawned and reserve refills to N;
        // the dropped entry is gone, not recycled.
        assert_eq!(pool.snapshot().await.0, 1);
    }

    #[tokio::test]
    async fn waiters_are_served_fifo_on_pool_exhaustion() {
        let pool = Pool::new(
            CountingConnector { next: AtomicU32::new(0) },
            1,
            Duration::from_millis(10),
            Duration::from_secs(1),
            fast_limiter(),
        );
        pool.start().await;
        settle().await;

        let first = pool.borrow().await; // drains the only reserve entry
        assert_eq!(pool.snapshot().await.0, 0);

        let order: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let p1 = pool.clone();
        let t1 = tokio::spawn(async move {
            let _b = p1.borrow().await;
            o1.lock().await.push(1);
        });
        tokio::task::yield_now().await;
        let o2 = order.clone();
        let p2 = pool.clone();
        let t2 = tokio::spawn(async move {
            let _b = p2.borrow().await;
            o2.lock().await.push(2);
        });

        settle().await;
        drop(first); // replacement builder delivers to the oldest waiter

        t1.await.unwrap();
        // give the second waiter's builder a chance too
        settle().await;
        t2.await.unwrap();

        assert_eq!(*order.lock().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn stop_cancels_builders_and_drops_reserve() {
        let pool = Pool::new(
            CountingConnector { next: AtomicU32::new(0) },
            5,
            Duration::from_millis(10),
            Duration::from_secs(1),
            fast_limiter(),
        );
        pool.start().await;
        settle().await;
        assert_eq!(pool.snapshot().await.0, 5);

        pool.stop().await;
        let (reserve, _waiters, builders) = pool.snapshot().await;
        assert_eq!(reserve, 0);
        assert_eq!(builders, 0);
    }
}
