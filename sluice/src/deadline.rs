//! Caller-supplied deadline for one admission call (spec §5 "Cancellation
//! and timeouts", §9).
//!
//! Mirrors the `tokio::time::timeout` idiom already used around individual
//! suspension points elsewhere in this corpus (e.g. a rate limiter wrapping
//! a single bucket wait in `timeout(Duration::from_millis(100), ...)`):
//! here the same wrapping is applied at every store-facing suspension point
//! inside the admission protocol, against one deadline shared across the
//! whole call.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Error, Result};

/// An absolute point in time past which an admission must stop attempting
/// further suspension points and fail with `UNAVAILABLE` rather than
/// continue. `Deadline::none()` (the default) never expires.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Self {
        Self(None)
    }

    /// A deadline `duration` from now.
    pub fn after(duration: Duration) -> Self {
        Self(Some(Instant::now() + duration))
    }

    fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }

    /// Runs `fut`, short-circuiting with `UNAVAILABLE` if the deadline has
    /// already passed, and racing it against the deadline otherwise. Every
    /// store-facing suspension point in the admission call chain goes
    /// through this instead of awaiting the store future bare.
    pub async fn guard<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.remaining() {
            None => fut.await,
            Some(remaining) if remaining.is_zero() => {
                Err(Error::unavailable("admission deadline exceeded"))
            }
            Some(remaining) => match tokio::time::timeout(remaining, fut).await {
                Ok(result) => result,
                Err(_) => Err(Error::unavailable("admission deadline exceeded")),
            },
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn no_deadline_never_expires() {
        let d = Deadline::none();
        assert!(!d.is_expired());
        let result: Result<i32> = d.guard(async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn already_past_deadline_short_circuits_without_polling_the_future() {
        let d = Deadline::after(Duration::from_millis(0));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(d.is_expired());
        let result: Result<i32> = d.guard(async { Ok(7) }).await;
        assert!(matches!(result, Err(Error::Unavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_reached_mid_wait_times_out() {
        let d = Deadline::after(Duration::from_millis(10));
        let result: Result<i32> = d
            .guard(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(7)
            })
            .await;
        assert!(matches!(result, Err(Error::Unavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_not_yet_reached_lets_the_future_finish() {
        let d = Deadline::after(Duration::from_millis(50));
        let result: Result<i32> = d
            .guard(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(7)
            })
            .await;
        assert_eq!(result.unwrap(), 7);
    }
}
