//! Bounded fan-out with settled semantics.
//!
//! [`settle_bounded`] runs one task per input with at most `limit` in flight
//! and waits for *all* of them. A failure or panic in one task never cancels
//! its siblings; every outcome comes back tagged with the input's index, in
//! input order.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::AppError;

/// Outcome of one input of a bounded fan-out.
#[derive(Debug)]
pub struct Settled<T> {
    /// Position of the input this outcome belongs to.
    pub index: usize,
    pub result: Result<T, AppError>,
}

impl<T> Settled<T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Run `task` over every input with at most `limit` tasks in flight.
///
/// Returns one [`Settled`] per input, sorted by index. A panicking task
/// settles as [`AppError::Generic`].
pub async fn settle_bounded<I, T, F, Fut>(inputs: I, limit: usize, task: F) -> Vec<Settled<T>>
where
    I: IntoIterator,
    I::Item: Send + 'static,
    T: Send + 'static,
    F: Fn(I::Item) -> Fut,
    Fut: Future<Output = Result<T, AppError>> + Send + 'static,
{
    let slots = Arc::new(Semaphore::new(limit.max(1)));
    let mut tasks = JoinSet::new();
    let mut indices = HashMap::new();
    let mut settled = Vec::new();

    for (index, input) in inputs.into_iter().enumerate() {
        // The semaphore is never closed, so this only fails if it was dropped.
        let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
            break;
        };
        let fut = task(input);
        let handle = tasks.spawn(async move {
            let result = fut.await;
            drop(permit);
            result
        });
        indices.insert(handle.id(), index);
    }

    while let Some(joined) = tasks.join_next_with_id().await {
        match joined {
            Ok((id, result)) => {
                if let Some(index) = indices.remove(&id) {
                    settled.push(Settled { index, result });
                }
            }
            Err(e) => {
                if let Some(index) = indices.remove(&e.id()) {
                    tracing::error!(index, error = %e, "Bounded task panicked");
                    settled.push(Settled {
                        index,
                        result: Err(AppError::Generic(format!("task panicked: {e}"))),
                    });
                }
            }
        }
    }

    settled.sort_by_key(|s| s.index);
    settled
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_limit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let results = settle_bounded(0..20u64, 3, |n| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10 + n % 4)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(n)
            }
        })
        .await;

        assert_eq!(results.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn results_are_index_ordered_regardless_of_completion_order() {
        let results = settle_bounded(vec![30u64, 10, 20], 3, |ms| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ms)
        })
        .await;

        let values: Vec<_> = results
            .iter()
            .map(|s| (s.index, *s.result.as_ref().unwrap()))
            .collect();
        assert_eq!(values, vec![(0, 30), (1, 10), (2, 20)]);
    }

    #[tokio::test]
    async fn failures_and_panics_are_isolated() {
        let results = settle_bounded(0..4u32, 2, |n| async move {
            match n {
                1 => Err(AppError::NetworkError("down".into())),
                2 => panic!("boom"),
                _ => Ok(n),
            }
        })
        .await;

        assert_eq!(results.len(), 4);
        assert!(results[0].is_ok());
        assert!(matches!(results[1].result, Err(AppError::NetworkError(_))));
        assert!(matches!(results[2].result, Err(AppError::Generic(_))));
        assert_eq!(*results[3].result.as_ref().unwrap(), 3);
    }

    #[tokio::test]
    async fn empty_input_settles_immediately() {
        let results = settle_bounded(Vec::<u32>::new(), 4, |n| async move { Ok(n) }).await;
        assert!(results.is_empty());
    }
}
