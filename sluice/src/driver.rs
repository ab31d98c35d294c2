//! Runtime driver abstraction (spec §5, §9).
//!
//! The source this crate is modeled on generated async/sync twin classes by
//! rewriting cooperative suspension points at build time. That has no clean
//! Rust analogue and isn't needed here: instead, every admission runs
//! against a neutral algorithm parameterized over a `Driver`, and I/O is
//! funneled through it. Two concrete drivers are provided, matching the two
//! runtime flavors named in spec §5:
//!
//! - [`ThreadPoolDriver`]: cascade's concurrent child/parent writes are
//!   spawned onto the Tokio thread pool and joined. Appropriate when
//!   admissions are expected to run across many worker threads.
//! - [`CooperativeDriver`]: the same two writes are polled concurrently
//!   within the calling task, with no extra thread spawned. Appropriate for
//!   a single-threaded runtime (e.g. a `tokio::task::LocalSet` or a
//!   `#[tokio::main(flavor = "current_thread")]` binary).
//!
//! Both present identical public semantics: the caller gets back the same
//! `(A, B)` pair either way, and the only user-visible difference is where
//! the work actually executes.

use std::future::Future;

use futures::future::{join, BoxFuture};

/// Concurrency strategy selector for the cascade fan-out, mirroring the
/// config surface named in spec §6 (`cascade-parallel concurrency strategy
/// enum for the sync flavor`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConcurrencyStrategy {
    /// Pick [`ThreadPoolDriver`] if a multi-threaded Tokio runtime is
    /// detected, otherwise [`CooperativeDriver`]. The crate does not attempt
    /// to auto-detect this itself — it is resolved by the host application
    /// at `Limiter` construction time.
    #[default]
    Auto,
    CooperativeGreenlets,
    ThreadPool,
    /// No concurrency: child then parent, strictly sequential. Used when the
    /// entity cache is unpopulated for a new entity (spec §5, "Scheduling").
    Serial,
}

/// Joins two independent store operations, matching whichever runtime
/// flavor the implementer represents.
pub trait Driver: Send + Sync + 'static {
    fn join2<A, B, FutA, FutB>(&self, a: FutA, b: FutB) -> BoxFuture<'static, (A, B)>
    where
        FutA: Future<Output = A> + Send + 'static,
        FutB: Future<Output = B> + Send + 'static,
        A: Send + 'static,
        B: Send + 'static;

    /// Runs the two futures one after another: child first, then parent.
    /// Used for the first admission against a newly seen entity, where the
    /// entity cache must be populated by the child's result before the
    /// parent lookup can even be constructed (spec §5, "Scheduling").
    fn serial2<A, B, FutA, FutB>(&self, a: FutA, b: FutB) -> BoxFuture<'static, (A, B)>
    where
        FutA: Future<Output = A> + Send + 'static,
        FutB: Future<Output = B> + Send + 'static,
        A: Send + 'static,
        B: Send + 'static,
    {
        Box::pin(async move {
            let ra = a.await;
            let rb = b.await;
            (ra, rb)
        })
    }
}

/// Spawns both futures onto the Tokio thread pool and joins their results.
/// Matches the "parallel-threads flavor" of spec §5: each admission may
/// block on the store without stalling other workers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadPoolDriver;

impl Driver for ThreadPoolDriver {
    fn join2<A, B, FutA, FutB>(&self, a: FutA, b: FutB) -> BoxFuture<'static, (A, B)>
    where
        FutA: Future<Output = A> + Send + 'static,
        FutB: Future<Output = B> + Send + 'static,
        A: Send + 'static,
        B: Send + 'static,
    {
        Box::pin(async move {
            let ha = tokio::spawn(a);
            let hb = tokio::spawn(b);
            let (ra, rb) = tokio::join!(ha, hb);
            (
                ra.expect("cascade child task panicked"),
                rb.expect("cascade parent task panicked"),
            )
        })
    }
}

/// Polls both futures concurrently within the calling task, spawning
/// nothing. Matches the "single-threaded cooperative flavor" of spec §5:
/// admissions suspend at I/O points but never leave the current thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct CooperativeDriver;

impl Driver for CooperativeDriver {
    fn join2<A, B, FutA, FutB>(&self, a: FutA, b: FutB) -> BoxFuture<'static, (A, B)>
    where
        FutA: Future<Output = A> + Send + 'static,
        FutB: Future<Output = B> + Send + 'static,
        A: Send + 'static,
        B: Send + 'static,
    {
        Box::pin(join(a, b))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    async fn one() -> i32 {
        1
    }

    async fn two() -> i32 {
        2
    }

    #[tokio::test]
    async fn thread_pool_driver_joins_both() {
        let driver = ThreadPoolDriver;
        let (a, b) = driver.join2(one(), two()).await;
        assert_eq!((a, b), (1, 2));
    }

    #[tokio::test]
    async fn cooperative_driver_joins_both() {
        let driver = CooperativeDriver;
        let (a, b) = driver.join2(one(), two()).await;
        assert_eq!((a, b), (1, 2));
    }

    #[tokio::test]
    async fn serial_runs_child_before_parent() {
        use std::sync::Arc;

        let driver = CooperativeDriver;
        let order = Arc::new(tokio::sync::Mutex::new(Vec::<&'static str>::new()));
        let order_a = order.clone();
        let order_b = order.clone();
        let (r1, r2) = driver
            .serial2(
                async move {
                    order_a.lock().await.push("child");
                    1
                },
                async move {
                    order_b.lock().await.push("parent");
                    2
                },
            )
            .await;
        assert_eq!((r1, r2), (1, 2));
        assert_eq!(*order.lock().await, vec!["child", "parent"]);
    }
}
