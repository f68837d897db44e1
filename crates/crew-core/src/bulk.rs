//! Bounded fan-out for bulk operations
//!
//! Bulk session operations (bulk delete, bulk PR creation) parallelize
//! their per-worktree I/O with a fixed worker cap so the git/process layer
//! is not overwhelmed, then join before the caller resumes sequential
//! state mutation. Workers must only touch independent external resources;
//! the shared session map is mutated by the caller after the join.

use std::future::Future;

use tokio::task::JoinSet;
use tracing::warn;

/// Default worker cap for bulk operations
pub const DEFAULT_FAN_OUT_LIMIT: usize = 10;

/// Run `f` over `items` with at most `limit` workers in flight.
///
/// Acts as a completion barrier: returns only when every worker finished.
/// Results come back in input order; a worker that panicked leaves `None`
/// in its slot.
pub async fn fan_out<T, R, F, Fut>(items: Vec<T>, limit: usize, f: F) -> Vec<Option<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = R> + Send + 'static,
{
    let limit = limit.max(1);
    let total = items.len();
    let mut results: Vec<Option<R>> = Vec::with_capacity(total);
    results.resize_with(total, || None);

    let mut set: JoinSet<(usize, R)> = JoinSet::new();
    let mut pending = items.into_iter().enumerate();

    loop {
        while set.len() < limit {
            let Some((index, item)) = pending.next() else {
                break;
            };
            let fut = f(item);
            set.spawn(async move { (index, fut.await) });
        }
        match set.join_next().await {
            Some(Ok((index, result))) => results[index] = Some(result),
            Some(Err(e)) => warn!("fan-out worker failed: {}", e),
            None => break,
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_preserve_input_order() {
        let results = fan_out(vec![3u64, 1, 2], 2, |n| async move {
            // Later inputs finish earlier
            tokio::time::sleep(Duration::from_millis(n * 10)).await;
            n * 100
        })
        .await;
        let results: Vec<u64> = results.into_iter().flatten().collect();
        assert_eq!(results, vec![300, 100, 200]);
    }

    #[tokio::test]
    async fn test_concurrency_is_capped() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let items: Vec<usize> = (0..20).collect();
        let limit = 4;
        let current_clone = current.clone();
        let peak_clone = peak.clone();
        fan_out(items, limit, move |_| {
            let current = current_clone.clone();
            let peak = peak_clone.clone();
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await;

        assert!(peak.load(Ordering::SeqCst) <= limit);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let results = fan_out(Vec::<u8>::new(), 8, |n| async move { n }).await;
        assert!(results.is_empty());
    }
}
