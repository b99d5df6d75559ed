use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};

use apphc_backend::BackendResult;

/// Run `check` every `tick` until it yields a value or `budget` is spent.
///
/// Returns `Ok(None)` on timeout. Backend errors end the wait immediately.
pub(crate) async fn poll_until<T, F, Fut>(budget: Duration, tick: Duration, mut check: F) -> BackendResult<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BackendResult<Option<T>>>,
{
    let started = Instant::now();
    loop {
        if let Some(value) = check().await? {
            return Ok(Some(value));
        }
        if started.elapsed() >= budget {
            return Ok(None);
        }
        sleep(tick).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn returns_first_value() {
        let calls = AtomicU32::new(0);
        let found = poll_until(Duration::from_secs(10), Duration::from_secs(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok((n == 3).then_some(n)) }
        })
        .await
        .unwrap();
        assert_eq!(found, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget() {
        let started = Instant::now();
        let found: Option<()> = poll_until(Duration::from_secs(5), Duration::from_secs(1), || async { Ok(None) })
            .await
            .unwrap();
        assert!(found.is_none());
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }
}
