use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use hive_comm::{Endpoint, Network};
use hive_core::protocol::{DataResponse, SchedulerQuery, SchedulerReply, ToClient, ToScheduler, ToWorker};
use hive_core::{
    Address, Arg, Function, FunctionRegistry, Restrictions, RunSpec, SchedulerConfig, TaskCall,
    TaskError, TaskKey, TaskSpec, WorkerConfig,
};
use hive_scheduler::SchedulerServer;
use hive_worker::{WorkerBuilder, WorkerExit, WorkerHandle};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

const WAIT: Duration = Duration::from_secs(10);

// ── Helpers ─────────────────────────────────────────────────────────

fn registry() -> FunctionRegistry {
    let registry = FunctionRegistry::new();
    let functions = [
        Function::new("inc", |call: &TaskCall| Ok(Value::from(call.arg_i64(0)? + 1))),
        Function::new("add", |call: &TaskCall| {
            let items = call
                .arg(0)?
                .as_array()
                .ok_or_else(|| TaskError::argument("expected a list"))?;
            Ok(Value::from(items.iter().filter_map(Value::as_i64).sum::<i64>()))
        }),
        Function::new("fail", |_: &TaskCall| Err(TaskError::new("ValueError", "bad input"))),
    ];
    for function in &functions {
        registry.register(function).unwrap();
    }
    registry
}

fn config() -> SchedulerConfig {
    SchedulerConfig {
        validate: true,
        ..SchedulerConfig::default()
    }
}

fn start_worker(net: &Network, registry: &FunctionRegistry, name: &str) -> WorkerHandle {
    WorkerBuilder::new(net, registry)
        .address(Address::inproc(name))
        .config(WorkerConfig {
            nthreads: 1,
            ..WorkerConfig::default()
        })
        .start()
        .unwrap()
}

fn key(k: &str) -> TaskKey {
    TaskKey::new(k)
}

fn task(k: &str, function: &str, arg: impl Into<Arg>) -> TaskSpec {
    TaskSpec::new(key(k), RunSpec::new(function, vec![arg.into()], BTreeMap::new()))
}

fn only_on(spec: TaskSpec, worker: &str) -> TaskSpec {
    spec.with_restrictions(Restrictions {
        workers: Some(BTreeSet::from([Address::inproc(worker)])),
        ..Restrictions::default()
    })
}

fn submit(client: &Endpoint, tasks: Vec<TaskSpec>, wanted: &[&str]) {
    let msg = ToScheduler::SubmitGraph {
        tasks,
        wanted: wanted.iter().map(|k| key(k)).collect(),
        stimulus_id: "submit".into(),
    };
    client
        .handle()
        .send(&Address::scheduler(), msg.op(), &msg)
        .unwrap();
}

/// Issue a request while polling the endpoint so the reply gets routed.
async fn request<T, R>(ep: &mut Endpoint, to: &Address, op: &str, payload: &T) -> R
where
    T: Serialize,
    R: DeserializeOwned,
{
    let handle = ep.handle();
    let req = handle.request(to, op, payload, WAIT);
    tokio::pin!(req);
    loop {
        tokio::select! {
            reply = &mut req => return reply.unwrap(),
            _ = ep.recv() => {}
        }
    }
}

async fn query(ep: &mut Endpoint, query: SchedulerQuery) -> SchedulerReply {
    let msg = ToScheduler::Query(query);
    request(ep, &Address::scheduler(), msg.op(), &msg).await
}

/// Skip client messages until one matches.
async fn wait_for(ep: &mut Endpoint, matches: impl Fn(&ToClient) -> bool) -> ToClient {
    loop {
        let message = tokio::time::timeout(WAIT, ep.recv()).await.unwrap().unwrap();
        let msg: ToClient = message.decode().unwrap();
        if matches(&msg) {
            return msg;
        }
    }
}

/// Fetch `k` from whichever worker holds it.
async fn fetch(ep: &mut Endpoint, k: &str) -> Value {
    let holders = match query(ep, SchedulerQuery::WhoHas { keys: Some(vec![key(k)]) }).await {
        SchedulerReply::WhoHas(who_has) => who_has.get(&key(k)).cloned().unwrap_or_default(),
        other => panic!("unexpected {other:?}"),
    };
    let holder = holders.first().cloned().unwrap();
    let msg = ToWorker::GetData { keys: vec![key(k)] };
    let mut response: DataResponse = request(ep, &holder, msg.op(), &msg).await;
    response.data.remove(&key(k)).unwrap()
}

async fn wait_for_workers(ep: &mut Endpoint, n: usize) {
    loop {
        if let SchedulerReply::Workers(infos) = query(ep, SchedulerQuery::Workers).await {
            if infos.len() >= n {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn chain_is_computed_on_a_worker() {
    let net = Network::default();
    let scheduler = SchedulerServer::start(&net, config()).unwrap();
    let worker = start_worker(&net, &registry(), "w1");
    let mut client = net.listen(Address::inproc("client")).unwrap();

    submit(&client, vec![task("x", "inc", 1), task("y", "inc", key("x"))], &["y"]);
    let msg = wait_for(&mut client, |m| matches!(m, ToClient::KeyInMemory { .. })).await;
    assert_eq!(msg, ToClient::KeyInMemory { key: key("y") });
    assert_eq!(fetch(&mut client, "y").await, Value::from(3));

    assert_eq!(worker.close().await, WorkerExit::Closed);
    scheduler.close().await;
}

#[tokio::test]
async fn dependencies_move_between_workers() {
    let net = Network::default();
    let scheduler = SchedulerServer::start(&net, config()).unwrap();
    let registry = registry();
    let w1 = start_worker(&net, &registry, "w1");
    let w2 = start_worker(&net, &registry, "w2");
    let mut client = net.listen(Address::inproc("client")).unwrap();

    let total = TaskSpec::new(
        key("total"),
        RunSpec::new("add", vec![Arg::keys([&key("a"), &key("b")])], BTreeMap::new()),
    );
    submit(
        &client,
        vec![only_on(task("a", "inc", 1), "w1"), only_on(task("b", "inc", 10), "w2"), total],
        &["total"],
    );
    wait_for(&mut client, |m| matches!(m, ToClient::KeyInMemory { key } if key == &TaskKey::new("total"))).await;
    assert_eq!(fetch(&mut client, "total").await, Value::from(13));

    w1.close().await;
    w2.close().await;
    scheduler.close().await;
}

#[tokio::test]
async fn task_error_reaches_the_client() {
    let net = Network::default();
    let scheduler = SchedulerServer::start(&net, config()).unwrap();
    let _worker = start_worker(&net, &registry(), "w1");
    let mut client = net.listen(Address::inproc("client")).unwrap();

    submit(&client, vec![task("bad", "fail", 1), task("after", "inc", key("bad"))], &["after"]);
    match wait_for(&mut client, |m| matches!(m, ToClient::TaskErred { .. })).await {
        ToClient::TaskErred { key: k, error, blame } => {
            assert_eq!(k, key("after"));
            assert_eq!(blame, key("bad"));
            assert_eq!(error.type_name, "ValueError");
        }
        other => panic!("unexpected {other:?}"),
    }
    scheduler.close().await;
}

#[tokio::test]
async fn unknown_function_is_a_task_error() {
    let net = Network::default();
    let scheduler = SchedulerServer::start(&net, config()).unwrap();
    let _worker = start_worker(&net, &registry(), "w1");
    let mut client = net.listen(Address::inproc("client")).unwrap();

    submit(&client, vec![task("x", "nope", 1)], &["x"]);
    match wait_for(&mut client, |m| matches!(m, ToClient::TaskErred { .. })).await {
        ToClient::TaskErred { error, .. } => assert_eq!(error.type_name, "LookupError"),
        other => panic!("unexpected {other:?}"),
    }
    scheduler.close().await;
}

#[tokio::test]
async fn lost_results_are_recomputed_elsewhere() {
    let net = Network::default();
    let scheduler = SchedulerServer::start(&net, config()).unwrap();
    let registry = registry();
    let _w1 = start_worker(&net, &registry, "w1");
    let mut client = net.listen(Address::inproc("client")).unwrap();

    submit(&client, vec![task("x", "inc", 1)], &["x"]);
    wait_for(&mut client, |m| matches!(m, ToClient::KeyInMemory { .. })).await;

    let _w2 = start_worker(&net, &registry, "w2");
    wait_for_workers(&mut client, 2).await;
    net.kill(&Address::inproc("w1"));

    wait_for(&mut client, |m| matches!(m, ToClient::KeyInMemory { .. })).await;
    assert_eq!(fetch(&mut client, "x").await, Value::from(2));
    scheduler.close().await;
}

#[tokio::test]
async fn scheduler_shutdown_terminates_the_worker() {
    let net = Network::default();
    let scheduler = SchedulerServer::start(&net, config()).unwrap();
    let mut worker = start_worker(&net, &registry(), "w1");
    let mut client = net.listen(Address::inproc("client")).unwrap();
    wait_for_workers(&mut client, 1).await;

    scheduler.close().await;
    let exit = tokio::time::timeout(WAIT, worker.closed()).await.unwrap();
    assert_eq!(exit, WorkerExit::Terminated("scheduler closing".into()));
}

#[tokio::test]
async fn closed_worker_leaves_the_cluster() {
    let net = Network::default();
    let scheduler = SchedulerServer::start(&net, config()).unwrap();
    let worker = start_worker(&net, &registry(), "w1");
    let mut client = net.listen(Address::inproc("client")).unwrap();
    wait_for_workers(&mut client, 1).await;

    assert_eq!(worker.close().await, WorkerExit::Closed);
    match query(&mut client, SchedulerQuery::Workers).await {
        SchedulerReply::Workers(infos) => assert!(infos.is_empty()),
        other => panic!("unexpected {other:?}"),
    }
    scheduler.close().await;
}
