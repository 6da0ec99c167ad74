//! Waiting on groups of futures.

use std::time::Duration;

use futures::stream::{self, FuturesUnordered, Stream, StreamExt};
use tokio::time::Instant;

use crate::error::ClientError;
use crate::future::{FutureStatus, TaskFuture};

/// When [`wait`] returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReturnWhen {
    #[default]
    AllCompleted,
    FirstCompleted,
    /// The first failure, or all done if nothing fails.
    FirstException,
}

#[derive(Debug, Default)]
pub struct WaitResult {
    pub done: Vec<TaskFuture>,
    pub not_done: Vec<TaskFuture>,
}

fn satisfied(futures: &[TaskFuture], return_when: ReturnWhen) -> bool {
    match return_when {
        ReturnWhen::AllCompleted => futures.iter().all(TaskFuture::done),
        ReturnWhen::FirstCompleted => futures.is_empty() || futures.iter().any(TaskFuture::done),
        ReturnWhen::FirstException => {
            futures.iter().all(TaskFuture::done)
                || futures
                    .iter()
                    .any(|f| matches!(f.status(), FutureStatus::Error(_)))
        }
    }
}

/// Wait until `return_when` holds for `futures`.
///
/// A timeout is not an error: whatever finished so far is returned in
/// `done` and the rest in `not_done`.
pub async fn wait(futures: &[TaskFuture], timeout: Option<Duration>, return_when: ReturnWhen) -> WaitResult {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut pending: FuturesUnordered<_> = futures
        .iter()
        .filter(|f| !f.done())
        .cloned()
        .map(|f| async move { f.wait().await })
        .collect();

    while !satisfied(futures, return_when) {
        let next = pending.next();
        let finished = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, next).await {
                Ok(finished) => finished,
                Err(_) => break,
            },
            None => next.await,
        };
        if finished.is_none() {
            break;
        }
    }

    let (done, not_done) = futures.iter().cloned().partition(TaskFuture::done);
    WaitResult { done, not_done }
}

/// Yield `futures` in the order they become done.
///
/// Failed and cancelled futures are yielded like finished ones. Once
/// `timeout` has passed since the call the stream yields one
/// [`ClientError::Timeout`] and ends.
pub fn as_completed(
    futures: &[TaskFuture],
    timeout: Option<Duration>,
) -> impl Stream<Item = Result<TaskFuture, ClientError>> {
    let deadline = timeout.map(|t| (Instant::now() + t, t));
    let pending: FuturesUnordered<_> = futures
        .iter()
        .cloned()
        .map(|f| async move {
            f.wait().await;
            f
        })
        .collect();

    stream::unfold(Some(pending), move |pending| async move {
        let mut pending = pending?;
        let next = match deadline {
            Some((at, limit)) => match tokio::time::timeout_at(at, pending.next()).await {
                Ok(next) => next,
                Err(_) => return Some((Err(ClientError::Timeout(limit)), None)),
            },
            None => pending.next().await,
        };
        next.map(|future| (Ok(future), Some(pending)))
    })
}
