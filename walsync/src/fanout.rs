//! Capped parallel execution over per-instance work.
//!
//! Both daemons fan out across instances with the same discipline: at most
//! [`MAX_WORKERS`] futures in flight, results collected in input order, and
//! each worker owning exactly one instance's resources.

use futures::stream::FuturesOrdered;
use futures::StreamExt;
use std::future::Future;

/// Hard cap on concurrently probed / orchestrated instances.
pub const MAX_WORKERS: usize = 32;

/// Drive `futures` with at most [`MAX_WORKERS`] in flight and return all
/// outputs in input order.
pub async fn run_all<T, F>(futures: Vec<F>) -> Vec<T>
where
    F: Future<Output = T>,
{
    let mut pending = FuturesOrdered::new();
    let mut results = Vec::with_capacity(futures.len());
    let mut iter = futures.into_iter();

    loop {
        let added = match iter.next() {
            Some(fut) => {
                pending.push_back(fut);
                true
            }
            None => false,
        };
        if !added || pending.len() >= MAX_WORKERS {
            match pending.next().await {
                Some(result) => results.push(result),
                None => break,
            }
        }
    }
    results
}

/// Like [`run_all`], but the first `Err` aborts the remaining work: in-flight
/// futures are dropped (subprocesses spawned with `kill_on_drop` go with
/// them) and queued ones never start.
pub async fn try_run_all<T, F>(futures: Vec<F>) -> anyhow::Result<Vec<T>>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let mut pending = FuturesOrdered::new();
    let mut results = Vec::with_capacity(futures.len());
    let mut iter = futures.into_iter();

    loop {
        let added = match iter.next() {
            Some(fut) => {
                pending.push_back(fut);
                true
            }
            None => false,
        };
        if !added || pending.len() >= MAX_WORKERS {
            match pending.next().await {
                Some(result) => results.push(result?),
                None => break,
            }
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn preserves_input_order() {
        let futures: Vec<_> = (0..100u64)
            .map(|i| async move {
                // Finish out of order.
                tokio::time::sleep(std::time::Duration::from_millis(100 - i)).await;
                i
            })
            .collect();
        let results = run_all(futures).await;
        assert_eq!(results, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn respects_worker_cap() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let futures: Vec<_> = (0..200)
            .map(|_| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .collect();
        run_all(futures).await;
        assert!(peak.load(Ordering::SeqCst) <= MAX_WORKERS);
    }

    #[tokio::test]
    async fn first_error_wins_and_cancels() {
        let completed = Arc::new(AtomicUsize::new(0));
        let futures: Vec<_> = (0..50usize)
            .map(|i| {
                let completed = completed.clone();
                async move {
                    if i == 3 {
                        anyhow::bail!("instance {i} failed");
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok(i)
                }
            })
            .collect();
        let err = try_run_all(futures).await.unwrap_err();
        assert!(err.to_string().contains("instance 3"));
        // Later work was dropped, not run to completion.
        assert!(completed.load(Ordering::SeqCst) < 50);
    }
}
