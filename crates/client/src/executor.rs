//! Executor facade over a [`Client`].
//!
//! An executor submits with a fixed set of options, hands results back as a
//! lazy stream from [`Executor::map`], and can be shut down. Dropping an
//! executor that was not shut down cancels its unfinished work.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::stream::{self, Stream};
use hive_core::{stimulus_id, Address, Arg, Function, ToScheduler};
use serde_json::Value;
use tracing::{debug, info};

use crate::client::{Client, SubmitOptions};
use crate::error::ClientError;
use crate::future::{lock, TaskFuture, WeakFuture};

/// Option names [`Client::get_executor`] understands.
pub const EXECUTOR_OPTIONS: [&str; 6] = [
    "allow_other_workers",
    "priority",
    "pure",
    "resources",
    "retries",
    "workers",
];

// ── Options ─────────────────────────────────────────────────────────

fn invalid(name: &str, reason: &str) -> ClientError {
    ClientError::InvalidOption {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

/// Turn loosely typed executor options into [`SubmitOptions`].
///
/// Every unrecognised name is reported at once, sorted.
pub fn parse_options(options: BTreeMap<String, Value>) -> Result<SubmitOptions, ClientError> {
    let unsupported: Vec<String> = options
        .keys()
        .filter(|name| !EXECUTOR_OPTIONS.contains(&name.as_str()))
        .cloned()
        .collect();
    if !unsupported.is_empty() {
        return Err(ClientError::UnsupportedOptions(unsupported));
    }

    let mut parsed = SubmitOptions::default();
    for (name, value) in &options {
        match name.as_str() {
            "pure" => {
                parsed.pure = value.as_bool().ok_or_else(|| invalid(name, "expected a bool"))?;
            }
            "allow_other_workers" => {
                parsed.allow_other_workers =
                    value.as_bool().ok_or_else(|| invalid(name, "expected a bool"))?;
            }
            "retries" => {
                let retries = value
                    .as_u64()
                    .ok_or_else(|| invalid(name, "expected a non-negative integer"))?;
                parsed.retries =
                    u32::try_from(retries).map_err(|_| invalid(name, "too many retries"))?;
            }
            "priority" => {
                parsed.priority = value.as_i64().ok_or_else(|| invalid(name, "expected an integer"))?;
            }
            "workers" => parsed.workers = Some(parse_workers(name, value)?),
            "resources" => {
                let resources = value
                    .as_object()
                    .ok_or_else(|| invalid(name, "expected a map of amounts"))?;
                for (resource, amount) in resources {
                    let amount = amount
                        .as_f64()
                        .ok_or_else(|| invalid(name, "amounts must be numbers"))?;
                    parsed.resources.insert(resource.clone(), amount);
                }
            }
            _ => {}
        }
    }
    Ok(parsed)
}

fn parse_workers(name: &str, value: &Value) -> Result<Vec<Address>, ClientError> {
    match value {
        Value::String(address) => Ok(vec![Address::new(address.as_str())]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(Address::new)
                    .ok_or_else(|| invalid(name, "worker addresses must be strings"))
            })
            .collect(),
        _ => Err(invalid(name, "expected an address or a list of addresses")),
    }
}

// ── Executor ────────────────────────────────────────────────────────

pub struct Executor {
    client: Client,
    options: SubmitOptions,
    submitted: Mutex<Vec<WeakFuture>>,
    shut_down: AtomicBool,
}

impl Executor {
    pub(crate) fn new(client: Client, options: BTreeMap<String, Value>) -> Result<Self, ClientError> {
        Ok(Self::with_options(client, parse_options(options)?))
    }

    pub(crate) fn with_options(client: Client, options: SubmitOptions) -> Self {
        Self {
            client,
            options,
            submitted: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &SubmitOptions {
        &self.options
    }

    pub fn submit(&self, function: &Function, args: Vec<Arg>) -> Result<TaskFuture, ClientError> {
        self.submit_with(function, args, BTreeMap::new())
    }

    pub fn submit_with(
        &self,
        function: &Function,
        args: Vec<Arg>,
        kwargs: BTreeMap<String, Arg>,
    ) -> Result<TaskFuture, ClientError> {
        self.ensure_running()?;
        let future = self.client.submit_with(function, args, kwargs, &self.options)?;
        self.remember(std::slice::from_ref(&future));
        Ok(future)
    }

    /// Submit every call up front and yield the results lazily, in input
    /// order.
    ///
    /// `timeout` bounds the wait for each element.
    pub fn map(
        &self,
        function: &Function,
        iterables: Vec<Vec<Arg>>,
        timeout: Option<Duration>,
    ) -> Result<MapResults, ClientError> {
        self.ensure_running()?;
        let futures = self.client.map(function, iterables, &self.options)?;
        self.remember(&futures);
        Ok(MapResults {
            pending: futures.into(),
            timeout,
            exhausted: false,
        })
    }

    /// Refuse further submissions. With `wait`, block until everything
    /// submitted so far is done; otherwise cancel what is still pending.
    pub async fn shutdown(&self, wait: bool) -> Result<(), ClientError> {
        self.shut_down.store(true, Ordering::SeqCst);
        let live = self.live_futures();
        if wait {
            for future in &live {
                future.wait().await;
            }
        } else {
            self.client.cancel(&live, false).await?;
        }
        info!(client = %self.client.address(), wait, futures = live.len(), "executor shut down");
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), ClientError> {
        if self.is_shut_down() {
            Err(ClientError::ExecutorShutdown)
        } else {
            Ok(())
        }
    }

    fn remember(&self, futures: &[TaskFuture]) {
        let mut submitted = lock(&self.submitted);
        submitted.extend(futures.iter().map(TaskFuture::downgrade));
    }

    /// Submitted futures somebody still holds.
    fn live_futures(&self) -> Vec<TaskFuture> {
        lock(&self.submitted)
            .iter()
            .filter_map(WeakFuture::upgrade)
            .collect()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let keys: Vec<_> = self
            .live_futures()
            .iter()
            .filter(|future| !future.done())
            .map(|future| future.key().clone())
            .collect();
        if keys.is_empty() || self.client.is_closed() {
            return;
        }
        debug!(client = %self.client.address(), keys = keys.len(), "executor dropped, cancelling pending work");
        let msg = ToScheduler::CancelKeys {
            keys,
            force: false,
            stimulus_id: stimulus_id("executor-drop"),
        };
        if let Err(e) = self.client.inner().send(&msg) {
            debug!(error = %e, "could not cancel executor work");
        }
    }
}

// ── Lazy map results ────────────────────────────────────────────────

/// Results of [`Executor::map`], consumed front to back.
///
/// Dropping it releases every element not yet delivered.
#[derive(Debug)]
pub struct MapResults {
    pending: VecDeque<TaskFuture>,
    timeout: Option<Duration>,
    exhausted: bool,
}

impl MapResults {
    /// Elements not delivered yet.
    pub fn remaining(&self) -> usize {
        if self.exhausted {
            0
        } else {
            self.pending.len()
        }
    }

    /// The next result in input order.
    ///
    /// A timeout ends the sequence; the elements behind it are released
    /// when `self` is dropped.
    pub async fn next(&mut self) -> Option<Result<Value, ClientError>> {
        if self.exhausted {
            return None;
        }
        let result = self.pending.front()?.result(self.timeout).await;
        match result {
            Err(e) if e.is_timeout() => {
                self.exhausted = true;
                Some(Err(e))
            }
            other => {
                self.pending.pop_front();
                Some(other)
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Value, ClientError>> {
        stream::unfold(self, |mut results| async move {
            let next = results.next().await?;
            Some((next, results))
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn options(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn unsupported_options_are_listed_sorted() {
        let err = parse_options(options(&[
            ("foo", json!(1)),
            ("pure", json!(true)),
            ("bar", json!(2)),
        ]))
        .unwrap_err();
        match &err {
            ClientError::UnsupportedOptions(names) => assert_eq!(names, &["bar", "foo"]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            err.to_string(),
            r#"unsupported arguments to executor: ["bar", "foo"]"#
        );
    }

    #[test]
    fn recognised_options_are_applied() {
        let parsed = parse_options(options(&[
            ("pure", json!(false)),
            ("retries", json!(3)),
            ("workers", json!(["inproc://w1"])),
            ("allow_other_workers", json!(true)),
            ("priority", json!(5)),
            ("resources", json!({"GPU": 1})),
        ]))
        .unwrap();
        assert!(!parsed.pure);
        assert_eq!(parsed.retries, 3);
        assert_eq!(parsed.workers, Some(vec![Address::inproc("w1")]));
        assert!(parsed.allow_other_workers);
        assert_eq!(parsed.priority, 5);
        assert_eq!(parsed.resources.get("GPU"), Some(&1.0));
    }

    #[test]
    fn a_single_worker_address_is_accepted() {
        let parsed = parse_options(options(&[("workers", json!("inproc://w1"))])).unwrap();
        assert_eq!(parsed.workers, Some(vec![Address::inproc("w1")]));
    }

    #[test]
    fn mistyped_values_are_rejected() {
        let err = parse_options(options(&[("retries", json!("many"))])).unwrap_err();
        assert!(matches!(err, ClientError::InvalidOption { ref name, .. } if name == "retries"));
    }

    #[test]
    fn defaults_match_submit_defaults() {
        assert_eq!(parse_options(BTreeMap::new()).unwrap(), SubmitOptions::default());
    }
}
