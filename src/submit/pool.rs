//! Bounded fan-in of logical task results

use futures::stream::{self, StreamExt};
use std::future::Future;

/// Await `futures` with at most `limit` in flight; results keep input order
pub async fn gather_ordered<I, F, T>(futures: I, limit: usize) -> Vec<T>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = T>,
{
    stream::iter(futures)
        .buffered(limit.max(1))
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_order_kept_and_limit_respected() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let futures = (0..8u64).map(|i| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                // later tasks finish first
                tokio::time::sleep(Duration::from_secs(10 - i)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                i
            }
        });

        let results = gather_ordered(futures, 3).await;
        assert_eq!(results, (0..8).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_zero_limit_still_progresses() {
        let results = gather_ordered((0..3).map(|i| async move { i * 2 }), 0).await;
        assert_eq!(results, vec![0, 2, 4]);
    }
}
