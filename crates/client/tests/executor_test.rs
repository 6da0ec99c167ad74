use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use hive_client::{as_completed, wait, Client, ClientError, LocalCluster, ReturnWhen};
use hive_core::{Arg, Function, FunctionRegistry, HiveConfig, TaskCall, TaskError};
use serde_json::{json, Value};

const WAIT: Duration = Duration::from_secs(20);

// ── Helpers ─────────────────────────────────────────────────────────

struct Functions {
    inc: Function,
    slowinc: Function,
    slowdec: Function,
    throws: Function,
    sleep: Function,
    random: Function,
}

fn delay_of(call: &TaskCall) -> Result<f64, TaskError> {
    match call.args().get(1) {
        Some(delay) => delay
            .as_f64()
            .ok_or_else(|| TaskError::argument("delay must be a number")),
        None => call.kwarg_f64_or("delay", 0.02),
    }
}

fn functions() -> Functions {
    let counter = Arc::new(AtomicU64::new(0));
    Functions {
        inc: Function::new("inc", |call: &TaskCall| Ok(Value::from(call.arg_i64(0)? + 1))),
        slowinc: Function::new("slowinc", |call: &TaskCall| {
            std::thread::sleep(Duration::from_secs_f64(delay_of(call)?));
            Ok(Value::from(call.arg_i64(0)? + 1))
        }),
        slowdec: Function::new("slowdec", |call: &TaskCall| {
            std::thread::sleep(Duration::from_secs_f64(delay_of(call)?));
            Ok(Value::from(call.arg_i64(0)? - 1))
        }),
        throws: Function::new("throws", |_: &TaskCall| {
            Err(TaskError::new("RuntimeError", "hello!"))
        }),
        sleep: Function::new("sleep", |call: &TaskCall| {
            std::thread::sleep(Duration::from_secs_f64(call.arg_f64(0)?));
            Ok(Value::Null)
        }),
        random: Function::new("random", move |_: &TaskCall| {
            Ok(Value::from(counter.fetch_add(1, Ordering::SeqCst)))
        }),
    }
}

/// Fails with "one", then "two", then returns 42.
fn varying(name: &str) -> Function {
    let calls = Arc::new(AtomicU64::new(0));
    Function::new(name, move |_: &TaskCall| match calls.fetch_add(1, Ordering::SeqCst) {
        0 => Err(TaskError::new("ZeroDivisionError", "one")),
        1 => Err(TaskError::new("ZeroDivisionError", "two")),
        _ => Ok(Value::from(42)),
    })
}

fn config() -> HiveConfig {
    let mut config = HiveConfig::default();
    config.scheduler.validate = true;
    config.worker.nthreads = 2;
    config
}

async fn start(n_workers: usize) -> (LocalCluster, Client) {
    let cluster = LocalCluster::start(&FunctionRegistry::new(), n_workers, config()).unwrap();
    let client = cluster.client().await.unwrap();
    client.wait_for_workers(n_workers, Some(WAIT)).await.unwrap();
    (cluster, client)
}

fn delay(seconds: f64) -> BTreeMap<String, Arg> {
    BTreeMap::from([("delay".to_string(), Arg::from(seconds))])
}

async fn processing_count(client: &Client) -> usize {
    client.processing().await.unwrap().values().map(Vec::len).sum()
}

async fn shutdown(cluster: LocalCluster, client: Client) {
    client.close().await;
    cluster.close().await;
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn submit_returns_results_and_errors() {
    let (cluster, client) = start(2).await;
    let f = functions();
    let e = client.executor();

    let future = e.submit(&f.inc, vec![Arg::from(10)]).unwrap();
    assert_eq!(future.result(Some(WAIT)).await.unwrap(), json!(11));

    let future = e.submit_with(&f.slowinc, vec![Arg::from(11)], delay(0.1)).unwrap();
    assert_eq!(future.result(Some(WAIT)).await.unwrap(), json!(12));

    let future = e.submit(&f.throws, vec![Arg::from(Value::Null)]).unwrap();
    let err = future.result(Some(WAIT)).await.unwrap_err();
    let error = err.task_error().unwrap();
    assert_eq!(error.type_name, "RuntimeError");
    assert_eq!(error.message, "hello!");
    assert_eq!(future.exception(Some(WAIT)).await.unwrap(), Some(error.clone()));

    drop(e);
    shutdown(cluster, client).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn as_completed_yields_every_future() {
    let (cluster, client) = start(2).await;
    let f = functions();
    let e = client.get_executor([("pure", json!(false))]).unwrap();

    let futures: Vec<_> = (0..10)
        .map(|i| e.submit_with(&f.slowinc, vec![Arg::from(i)], delay(0.02)).unwrap())
        .collect();
    let stream = as_completed(&futures, Some(WAIT));
    tokio::pin!(stream);
    let mut results = Vec::new();
    while let Some(future) = stream.next().await {
        results.push(future.unwrap().result(None).await.unwrap());
    }
    results.sort_by_key(|v| v.as_i64());
    assert_eq!(results, (1..=10).map(Value::from).collect::<Vec<_>>());

    drop(e);
    shutdown(cluster, client).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wait_honours_timeouts_and_return_when() {
    let (cluster, client) = start(2).await;
    let f = functions();
    let e = client.get_executor([("pure", json!(false))]).unwrap();
    let n = 10;

    let futures: Vec<_> = (0..n)
        .map(|i| e.submit_with(&f.slowinc, vec![Arg::from(i)], delay(0.05)).unwrap())
        .collect();
    let res = wait(&futures, Some(Duration::from_millis(10)), ReturnWhen::AllCompleted).await;
    assert!(!res.not_done.is_empty());
    let res = wait(&futures, Some(WAIT), ReturnWhen::AllCompleted).await;
    assert!(res.not_done.is_empty());
    assert_eq!(processing_count(&client).await, 0);

    let futures: Vec<_> = (0..n)
        .map(|i| e.submit_with(&f.slowinc, vec![Arg::from(i)], delay(0.05)).unwrap())
        .collect();
    let res = wait(&futures, Some(WAIT), ReturnWhen::FirstCompleted).await;
    assert!(!res.not_done.is_empty());
    assert!(!res.done.is_empty());
    wait(&futures, Some(WAIT), ReturnWhen::AllCompleted).await;

    let mut futures: Vec<_> = (0..n)
        .map(|i| e.submit_with(&f.slowinc, vec![Arg::from(i)], delay(0.05)).unwrap())
        .collect();
    futures.push(e.submit(&f.throws, vec![Arg::from(Value::Null)]).unwrap());
    futures.extend((0..n).map(|i| e.submit_with(&f.slowdec, vec![Arg::from(i)], delay(0.05)).unwrap()));
    let res = wait(&futures, Some(WAIT), ReturnWhen::FirstException).await;
    assert!(!res.not_done.is_empty());
    let mut errors = 0;
    for future in &res.done {
        if let Err(e) = future.result(None).await {
            assert_eq!(e.task_error().unwrap().type_name, "RuntimeError");
            errors += 1;
        }
    }
    assert_eq!(errors, 1);

    drop(e);
    shutdown(cluster, client).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_future_raises_and_finished_one_keeps_its_result() {
    let (cluster, client) = start(1).await;
    let f = functions();
    let e = client.executor();

    let started = Instant::now();
    let slow = e.submit(&f.sleep, vec![Arg::from(1.0)]).unwrap();
    slow.cancel().await.unwrap();
    assert!(slow.cancelled());
    assert!(slow.done());
    let err = slow.result(Some(WAIT)).await.unwrap_err();
    assert!(err.is_cancelled());
    assert!(started.elapsed() < Duration::from_millis(900));

    let quick = e.submit(&f.inc, vec![Arg::from(1)]).unwrap();
    assert_eq!(quick.result(Some(WAIT)).await.unwrap(), json!(2));
    quick.cancel().await.unwrap();
    assert!(!quick.cancelled());
    assert_eq!(quick.result(Some(WAIT)).await.unwrap(), json!(2));

    drop(e);
    shutdown(cluster, client).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_future_counts_as_done_in_wait() {
    let (cluster, client) = start(1).await;
    let f = functions();
    let e = client.get_executor([("pure", json!(false))]).unwrap();

    let futures: Vec<_> = (0..10)
        .map(|i| e.submit_with(&f.slowinc, vec![Arg::from(i)], delay(0.2)).unwrap())
        .collect();
    futures[3].cancel().await.unwrap();
    let res = wait(&futures, Some(WAIT), ReturnWhen::FirstCompleted).await;
    assert!(res.done.contains(&futures[3]));
    assert!(futures[3].cancelled());

    drop(e);
    shutdown(cluster, client).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_future_is_yielded_by_as_completed() {
    let (cluster, client) = start(1).await;
    let f = functions();
    let e = client.get_executor([("pure", json!(false))]).unwrap();

    let futures: Vec<_> = (0..10)
        .map(|i| e.submit_with(&f.slowinc, vec![Arg::from(i)], delay(0.02)).unwrap())
        .collect();
    futures[3].cancel().await.unwrap();

    let stream = as_completed(&futures, Some(WAIT));
    tokio::pin!(stream);
    let mut yielded = Vec::new();
    while let Some(future) = stream.next().await {
        yielded.push(future.unwrap());
    }
    assert_eq!(yielded.len(), 10);
    assert!(yielded.iter().any(|future| future == &futures[3] && future.cancelled()));

    drop(e);
    shutdown(cluster, client).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn map_yields_lazily_in_input_order() {
    let (cluster, client) = start(2).await;
    let f = functions();
    let e = client.executor();

    let inputs: Vec<Arg> = (0..10).map(Arg::from).collect();
    let results: Vec<_> = e
        .map(&f.inc, vec![inputs], Some(WAIT))
        .unwrap()
        .into_stream()
        .map(Result::unwrap)
        .collect()
        .await;
    assert_eq!(results, (1..=10).map(Value::from).collect::<Vec<_>>());

    // Two iterables are zipped.
    let mut results = e
        .map(
            &f.slowinc,
            vec![vec![Arg::from(1), Arg::from(2)], vec![Arg::from(0.01), Arg::from(0.01)]],
            Some(WAIT),
        )
        .unwrap();
    assert_eq!(results.remaining(), 2);
    assert_eq!(results.next().await.unwrap().unwrap(), json!(2));
    assert_eq!(results.next().await.unwrap().unwrap(), json!(3));
    assert!(results.next().await.is_none());

    drop(e);
    shutdown(cluster, client).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn map_timeout_applies_per_element() {
    let (cluster, client) = start(2).await;
    let f = functions();
    let e = client.executor();

    let delays = [0.0, 0.0, 3.0, 0.0];
    let mut results = e
        .map(
            &f.slowinc,
            vec![
                (0..4).map(Arg::from).collect(),
                delays.iter().copied().map(Arg::from).collect(),
            ],
            Some(Duration::from_millis(800)),
        )
        .unwrap();
    assert_eq!(results.next().await.unwrap().unwrap(), json!(1));
    assert_eq!(results.next().await.unwrap().unwrap(), json!(2));
    let err = results.next().await.unwrap().unwrap_err();
    assert!(err.is_timeout());
    assert!(results.next().await.is_none());
    assert_eq!(results.remaining(), 0);

    drop(results);
    drop(e);
    shutdown(cluster, client).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropping_a_map_releases_the_rest() {
    let (cluster, client) = start(1).await;
    let f = functions();
    let e = client.executor();

    let n = 20;
    let mut results = e
        .map(
            &f.slowinc,
            vec![(0..n).map(Arg::from).collect(), vec![Arg::from(0.1); n as usize]],
            Some(WAIT),
        )
        .unwrap();
    assert_eq!(results.next().await.unwrap().unwrap(), json!(1));
    drop(results);

    let deadline = Instant::now() + WAIT;
    while processing_count(&client).await > 0 {
        assert!(Instant::now() < deadline, "tasks still processing");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    drop(e);
    shutdown(cluster, client).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unsupported_arguments_are_rejected() {
    let (cluster, client) = start(1).await;

    let err = client
        .get_executor([("foo", json!(1)), ("pure", json!(true)), ("bar", json!(2))])
        .err()
        .unwrap();
    assert_eq!(
        err.to_string(),
        r#"unsupported arguments to executor: ["bar", "foo"]"#
    );

    shutdown(cluster, client).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pure_submissions_share_a_result() {
    let (cluster, client) = start(2).await;
    let f = functions();

    let pure = client.get_executor([("pure", json!(true))]).unwrap();
    let a = pure.submit(&f.random, vec![]).unwrap();
    let b = pure.submit(&f.random, vec![]).unwrap();
    assert_eq!(a.key(), b.key());
    assert_eq!(
        a.result(Some(WAIT)).await.unwrap(),
        b.result(Some(WAIT)).await.unwrap()
    );

    let impure = client.get_executor([("pure", json!(false))]).unwrap();
    let a = impure.submit(&f.random, vec![]).unwrap();
    let b = impure.submit(&f.random, vec![]).unwrap();
    assert_ne!(a.key(), b.key());
    assert_ne!(
        a.result(Some(WAIT)).await.unwrap(),
        b.result(Some(WAIT)).await.unwrap()
    );

    drop((pure, impure));
    shutdown(cluster, client).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_option_restricts_placement() {
    let (cluster, client) = start(2).await;
    let f = functions();
    let workers = cluster.workers();
    let target = workers[0].clone();

    let e = client
        .get_executor([("workers", json!([target.as_str()])), ("pure", json!(false))])
        .unwrap();
    let futures: Vec<_> = (0..10)
        .map(|i| e.submit_with(&f.slowinc, vec![Arg::from(i)], delay(0.01)).unwrap())
        .collect();
    let res = wait(&futures, Some(WAIT), ReturnWhen::AllCompleted).await;
    assert!(res.not_done.is_empty());

    let has_what = client.has_what().await.unwrap();
    let on_target = has_what.get(&target).cloned().unwrap_or_default();
    assert_eq!(on_target.len(), 10);
    for future in &futures {
        assert!(on_target.contains(future.key()));
    }
    assert!(has_what.get(&workers[1]).map_or(true, Vec::is_empty));

    drop(e);
    shutdown(cluster, client).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retries_surface_the_last_attempt() {
    let (cluster, client) = start(1).await;

    let e = client
        .get_executor([("retries", json!(5)), ("pure", json!(false))])
        .unwrap();
    let future = e.submit(&varying("varying-5"), vec![]).unwrap();
    assert_eq!(future.result(Some(WAIT)).await.unwrap(), json!(42));

    let e = client.get_executor([("retries", json!(2))]).unwrap();
    let future = e.submit(&varying("varying-2"), vec![]).unwrap();
    assert_eq!(future.result(Some(WAIT)).await.unwrap(), json!(42));

    let e = client.get_executor([("retries", json!(1))]).unwrap();
    let future = e.submit(&varying("varying-1"), vec![]).unwrap();
    let err = future.result(Some(WAIT)).await.unwrap_err();
    assert_eq!(err.task_error().unwrap().message, "two");

    let e = client.get_executor([("retries", json!(0))]).unwrap();
    let future = e.submit(&varying("varying-0"), vec![]).unwrap();
    let err = future.result(Some(WAIT)).await.unwrap_err();
    let error = err.task_error().unwrap();
    assert_eq!(error.type_name, "ZeroDivisionError");
    assert_eq!(error.message, "one");

    drop(e);
    shutdown(cluster, client).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_with_wait_blocks_until_done() {
    let (cluster, client) = start(1).await;
    let f = functions();
    let e = client.executor();

    let started = Instant::now();
    let future = e.submit(&f.sleep, vec![Arg::from(0.3)]).unwrap();
    e.shutdown(true).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(future.done());
    assert_eq!(future.result(Some(WAIT)).await.unwrap(), Value::Null);

    let err = e.submit(&f.inc, vec![Arg::from(1)]).unwrap_err();
    assert!(matches!(err, ClientError::ExecutorShutdown));

    drop(e);
    shutdown(cluster, client).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_without_wait_cancels_pending_work() {
    let (cluster, client) = start(1).await;
    let f = functions();
    let e = client.executor();

    let started = Instant::now();
    let future = e.submit(&f.sleep, vec![Arg::from(1.0)]).unwrap();
    e.shutdown(false).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(900));
    assert!(future.cancelled());

    let err = e.map(&f.inc, vec![vec![Arg::from(1)]], None).unwrap_err();
    assert!(matches!(err, ClientError::ExecutorShutdown));

    drop(e);
    shutdown(cluster, client).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropping_an_executor_cancels_unfinished_work() {
    let (cluster, client) = start(1).await;
    let f = functions();

    let future = {
        let e = client.executor();
        e.submit(&f.sleep, vec![Arg::from(1.0)]).unwrap()
    };
    let err = future.result(Some(WAIT)).await.unwrap_err();
    assert!(err.is_cancelled());

    shutdown(cluster, client).await;
}
