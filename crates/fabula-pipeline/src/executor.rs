//! Bounded-concurrency execution of independent deferred tasks.
//!
//! A single orchestrating task drives a [`FuturesUnordered`]: at most
//! `limit` tasks are unsettled at any time, results come back in input
//! order, and the first failure stops new starts while already-running
//! tasks drain.  Nothing is spawned, so task futures borrow freely from
//! the caller's stack and need no locks.

use std::future::Future;

use futures::stream::{FuturesUnordered, StreamExt};

use fabula_types::{FabulaError, Result};

/// Run `tasks` with at most `limit` in flight at once.
///
/// `on_progress(completed, total)` fires after each successful completion,
/// not after each start.  On the first failure no new tasks start,
/// in-flight siblings run to completion (their results are still saved by
/// the tasks themselves), and the first error is returned once everything
/// settles.  Per-task retry for transient upstream errors is the task's own
/// responsibility, never the executor's.
pub async fn run_limited<T, F, Fut, P>(
    tasks: Vec<F>,
    limit: usize,
    mut on_progress: P,
) -> Result<Vec<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: FnMut(usize, usize),
{
    let total = tasks.len();
    let limit = limit.max(1);

    let mut slots: Vec<Option<T>> = Vec::with_capacity(total);
    slots.resize_with(total, || None);

    let mut queue = tasks.into_iter().enumerate();
    let mut in_flight = FuturesUnordered::new();
    let mut completed = 0usize;
    let mut first_error: Option<FabulaError> = None;

    for _ in 0..limit {
        match queue.next() {
            Some((index, task)) => in_flight.push(with_index(index, task())),
            None => break,
        }
    }

    while let Some((index, outcome)) = in_flight.next().await {
        match outcome {
            Ok(value) => {
                slots[index] = Some(value);
                completed += 1;
                on_progress(completed, total);
                if first_error.is_none() {
                    if let Some((next_index, task)) = queue.next() {
                        in_flight.push(with_index(next_index, task()));
                    }
                }
            }
            Err(e) => {
                tracing::warn!(task = index, error = %e, "Task failed; draining in-flight siblings");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }

    slots
        .into_iter()
        .map(|slot| slot.ok_or_else(|| FabulaError::Other("task result slot left empty".into())))
        .collect()
}

/// Tag a task future with its input position so results can be re-ordered.
/// Both push sites go through here so the queue stays homogeneous.
async fn with_index<T, Fut>(index: usize, fut: Fut) -> (usize, Result<T>)
where
    Fut: Future<Output = Result<T>>,
{
    (index, fut.await)
}
