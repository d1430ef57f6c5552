//! Bounded-concurrency fan-out for independent tasks.
//!
//! Used by the review phase: one task per reviewer model, at most `limit`
//! in flight. Submission order determines queue order (a permit is acquired
//! before each task is spawned, and tokio's semaphore is FIFO); completion
//! order is unconstrained. Each task's outcome is collected independently —
//! one failure never cancels or blocks the others.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::trace;

/// Default cap on simultaneously in-flight tasks. Reviewer fan-out is the
/// only genuinely parallel external call site; unbounded fan-out risks
/// provider-side throttling.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Run `tasks` with at most `limit` executing concurrently.
///
/// Returns one outcome per task, in submission order, once all have
/// resolved. As each task finishes the next queued one starts immediately.
/// Dropping the returned future aborts any tasks still in flight.
pub async fn run_limited<T, E, Fut>(tasks: Vec<Fut>, limit: usize) -> Result<Vec<Result<T, E>>>
where
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let total = tasks.len();
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut set: JoinSet<(usize, Result<T, E>)> = JoinSet::new();

    for (index, task) in tasks.into_iter().enumerate() {
        // Acquire before spawning so queue order is submission order.
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .context("limiter semaphore closed")?;
        trace!(index, "task admitted");

        set.spawn(async move {
            let _permit = permit;
            (index, task.await)
        });
    }

    let mut outcomes: Vec<Option<Result<T, E>>> = std::iter::repeat_with(|| None)
        .take(total)
        .collect();

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, outcome)) => outcomes[index] = Some(outcome),
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => bail!("limiter task cancelled: {err}"),
        }
    }

    let mut results = Vec::with_capacity(total);
    for (index, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Some(result) => results.push(result),
            None => bail!("limiter task {index} never resolved"),
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn outcomes_preserve_submission_order() {
        // Later tasks finish first; outcomes must still be in input order.
        let tasks: Vec<_> = (0..5u64)
            .map(|i| async move {
                tokio::time::sleep(Duration::from_millis(50 - i * 10)).await;
                Ok::<_, String>(i)
            })
            .collect();

        let outcomes = run_limited(tasks, 5).await.unwrap();
        let values: Vec<u64> = outcomes.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn never_exceeds_the_limit() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                }
            })
            .collect();

        let outcomes = run_limited(tasks, 2).await.unwrap();
        assert_eq!(outcomes.len(), 5);
        assert!(peak.load(Ordering::SeqCst) <= 2, "more than 2 tasks in flight");
    }

    #[tokio::test]
    async fn one_failure_does_not_block_the_rest() {
        let tasks: Vec<_> = (0..4)
            .map(|i| async move {
                if i == 1 {
                    Err(format!("task {i} failed"))
                } else {
                    Ok(i)
                }
            })
            .collect();

        let outcomes = run_limited(tasks, 2).await.unwrap();
        assert_eq!(outcomes.len(), 4);
        assert_eq!(outcomes[0].as_ref().unwrap(), &0);
        assert!(outcomes[1].is_err());
        assert_eq!(outcomes[2].as_ref().unwrap(), &2);
        assert_eq!(outcomes[3].as_ref().unwrap(), &3);
    }

    #[tokio::test]
    async fn empty_task_list_resolves_immediately() {
        let tasks: Vec<std::future::Ready<Result<(), String>>> = Vec::new();
        let outcomes = run_limited(tasks, 3).await.unwrap();
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn limit_of_one_serializes_tasks() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                }
            })
            .collect();

        run_limited(tasks, 1).await.unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
