use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use hive_core::protocol::{SchedulerQuery, SchedulerReply, ToClient, ToWorker};
use hive_core::{Address, Arg, Restrictions, RunSpec, SchedulerConfig, TaskError, TaskKey, TaskSpec, TaskStatus};

use crate::state::{Outbox, SchedulerState};

const SID: &str = "test";

// ── Helpers ─────────────────────────────────────────────────────────

fn scheduler() -> SchedulerState {
    SchedulerState::new(SchedulerConfig {
        validate: true,
        ..SchedulerConfig::default()
    })
}

fn client() -> Address {
    Address::inproc("client")
}

fn key(k: &str) -> TaskKey {
    TaskKey::new(k)
}

fn inc(k: &str, arg: impl Into<Arg>) -> TaskSpec {
    TaskSpec::new(key(k), RunSpec::new("inc", vec![arg.into()], BTreeMap::new()))
}

fn add_worker(s: &mut SchedulerState, name: &str) -> Address {
    let address = Address::inproc(name);
    s.add_worker(&address, 1, BTreeMap::new(), Instant::now(), SID);
    address
}

fn computes(outbox: &Outbox) -> Vec<(Address, TaskKey)> {
    outbox
        .workers
        .iter()
        .filter_map(|(to, msg)| match msg {
            ToWorker::ComputeTask { key, .. } => Some((to.clone(), key.clone())),
            _ => None,
        })
        .collect()
}

fn frees(outbox: &Outbox) -> Vec<(Address, TaskKey)> {
    outbox
        .workers
        .iter()
        .flat_map(|(to, msg)| match msg {
            ToWorker::FreeKeys { keys, .. } => {
                keys.iter().map(|k| (to.clone(), k.clone())).collect()
            }
            _ => Vec::new(),
        })
        .collect()
}

fn state_of(s: &SchedulerState, k: &str) -> Option<TaskStatus> {
    s.task(&key(k)).map(|ts| ts.state)
}

fn check(s: &SchedulerState) {
    if let Err(e) = s.validate() {
        panic!("{e}");
    }
}

// ── Happy path ──────────────────────────────────────────────────────

#[test]
fn chain_runs_in_dependency_order() {
    let mut s = scheduler();
    let w = add_worker(&mut s, "w1");
    s.submit_graph(&client(), vec![inc("x", 1), inc("y", key("x"))], vec![key("y")], SID);
    check(&s);

    let out = s.take_outbox();
    assert_eq!(computes(&out), vec![(w.clone(), key("x"))]);
    assert_eq!(state_of(&s, "y"), Some(TaskStatus::Waiting));

    s.task_finished(&w, &key("x"), 8, 10, SID);
    check(&s);
    let out = s.take_outbox();
    assert_eq!(computes(&out), vec![(w.clone(), key("y"))]);
    match &out.workers[0].1 {
        ToWorker::ComputeTask { who_has, nbytes, .. } => {
            assert_eq!(who_has[&key("x")], vec![w.clone()]);
            assert_eq!(nbytes[&key("x")], 8);
        }
        other => panic!("unexpected {other:?}"),
    }

    s.task_finished(&w, &key("y"), 8, 10, SID);
    check(&s);
    let out = s.take_outbox();
    assert_eq!(
        out.clients,
        vec![(client(), ToClient::KeyInMemory { key: key("y") })]
    );
    // x is no longer needed by anyone once y holds its result.
    assert_eq!(frees(&out), vec![(w.clone(), key("x"))]);
    assert_eq!(state_of(&s, "x"), Some(TaskStatus::Released));
}

#[test]
fn releasing_the_last_future_forgets_the_graph() {
    let mut s = scheduler();
    let w = add_worker(&mut s, "w1");
    s.submit_graph(&client(), vec![inc("x", 1), inc("y", key("x"))], vec![key("y")], SID);
    s.task_finished(&w, &key("x"), 8, 10, SID);
    s.task_finished(&w, &key("y"), 8, 10, SID);
    s.take_outbox();

    s.client_releases_keys(&client(), &[key("y")], SID);
    check(&s);
    assert_eq!(s.tasks().count(), 0);
    assert_eq!(frees(&s.take_outbox()), vec![(w, key("y"))]);
}

#[test]
fn resubmitting_a_finished_key_reports_it_immediately() {
    let mut s = scheduler();
    let w = add_worker(&mut s, "w1");
    s.submit_graph(&client(), vec![inc("x", 1)], vec![key("x")], SID);
    s.task_finished(&w, &key("x"), 8, 10, SID);
    s.take_outbox();

    let other = Address::inproc("other-client");
    s.submit_graph(&other, vec![inc("x", 1)], vec![key("x")], SID);
    check(&s);
    let out = s.take_outbox();
    assert!(computes(&out).is_empty());
    assert_eq!(out.clients, vec![(other, ToClient::KeyInMemory { key: key("x") })]);
}

#[test]
fn unwanted_submitted_tasks_are_forgotten() {
    let mut s = scheduler();
    add_worker(&mut s, "w1");
    s.submit_graph(&client(), vec![inc("x", 1), inc("lonely", 2)], vec![key("x")], SID);
    check(&s);
    assert!(s.task(&key("lonely")).is_none());
    assert!(s.task(&key("x")).is_some());
}

// ── Placement ───────────────────────────────────────────────────────

#[test]
fn tasks_wait_for_a_worker() {
    let mut s = scheduler();
    s.submit_graph(&client(), vec![inc("x", 1)], vec![key("x")], SID);
    check(&s);
    assert_eq!(state_of(&s, "x"), Some(TaskStatus::NoWorker));
    assert!(computes(&s.take_outbox()).is_empty());

    let w = add_worker(&mut s, "w1");
    check(&s);
    assert_eq!(state_of(&s, "x"), Some(TaskStatus::Processing));
    assert_eq!(computes(&s.take_outbox()), vec![(w, key("x"))]);
}

#[test]
fn placement_prefers_the_worker_holding_dependencies() {
    let mut s = scheduler();
    add_worker(&mut s, "w1");
    let w2 = add_worker(&mut s, "w2");
    let pinned = inc("x", 1).with_restrictions(Restrictions {
        workers: Some(BTreeSet::from([w2.clone()])),
        ..Restrictions::default()
    });
    s.submit_graph(&client(), vec![pinned], vec![key("x")], SID);
    s.task_finished(&w2, &key("x"), 8, 10, SID);
    s.take_outbox();

    s.submit_graph(&client(), vec![inc("y", key("x"))], vec![key("y")], SID);
    check(&s);
    assert_eq!(computes(&s.take_outbox()), vec![(w2, key("y"))]);
}

#[test]
fn resource_restrictions_limit_placement() {
    let mut s = scheduler();
    add_worker(&mut s, "cpu");
    let gpu_task = inc("x", 1).with_restrictions(Restrictions {
        resources: BTreeMap::from([("GPU".to_string(), 1.0)]),
        ..Restrictions::default()
    });
    s.submit_graph(&client(), vec![gpu_task], vec![key("x")], SID);
    check(&s);
    assert_eq!(state_of(&s, "x"), Some(TaskStatus::NoWorker));

    let gpu = Address::inproc("gpu");
    s.add_worker(
        &gpu,
        1,
        BTreeMap::from([("GPU".to_string(), 2.0)]),
        Instant::now(),
        SID,
    );
    check(&s);
    assert_eq!(computes(&s.take_outbox()), vec![(gpu, key("x"))]);
}

#[test]
fn seceded_tasks_do_not_count_toward_occupancy() {
    let mut s = scheduler();
    let w = add_worker(&mut s, "w1");
    s.submit_graph(&client(), vec![inc("x", 1)], vec![key("x")], SID);
    assert!(s.worker(&w).unwrap().occupancy > 0.0);

    s.long_running(&w, &key("x"));
    assert_eq!(s.worker(&w).unwrap().occupancy, 0.0);
    check(&s);
}

// ── Failures ────────────────────────────────────────────────────────

#[test]
fn errors_propagate_to_dependents_with_blame() {
    let mut s = scheduler();
    let w = add_worker(&mut s, "w1");
    s.submit_graph(&client(), vec![inc("x", 1), inc("y", key("x"))], vec![key("y")], SID);
    s.take_outbox();

    let error = TaskError::new("ZeroDivisionError", "one");
    s.task_erred(&w, &key("x"), error.clone(), SID);
    check(&s);
    assert_eq!(state_of(&s, "x"), Some(TaskStatus::Erred));
    assert_eq!(state_of(&s, "y"), Some(TaskStatus::Erred));
    assert_eq!(
        s.take_outbox().clients,
        vec![(
            client(),
            ToClient::TaskErred {
                key: key("y"),
                error,
                blame: key("x"),
            }
        )]
    );
}

#[test]
fn retries_reschedule_before_failing() {
    let mut s = scheduler();
    let w = add_worker(&mut s, "w1");
    s.submit_graph(&client(), vec![inc("x", 1).with_retries(1)], vec![key("x")], SID);
    s.take_outbox();

    s.task_erred(&w, &key("x"), TaskError::new("ValueError", "flaky"), SID);
    check(&s);
    let out = s.take_outbox();
    assert!(out.clients.is_empty());
    assert_eq!(computes(&out), vec![(w.clone(), key("x"))]);
    assert_eq!(s.task(&key("x")).unwrap().retries_remaining, 0);

    s.task_erred(&w, &key("x"), TaskError::new("ValueError", "flaky"), SID);
    check(&s);
    assert_eq!(state_of(&s, "x"), Some(TaskStatus::Erred));
    assert_eq!(s.take_outbox().clients.len(), 1);
}

#[test]
fn stale_reports_are_ignored() {
    let mut s = scheduler();
    let w1 = add_worker(&mut s, "w1");
    s.submit_graph(&client(), vec![inc("x", 1)], vec![key("x")], SID);
    s.take_outbox();

    let ghost = Address::inproc("ghost");
    s.task_finished(&ghost, &key("x"), 8, 10, SID);
    s.task_erred(&ghost, &key("x"), TaskError::new("E", "e"), SID);
    check(&s);
    assert_eq!(state_of(&s, "x"), Some(TaskStatus::Processing));
    assert!(s.take_outbox().is_empty());

    s.task_finished(&w1, &key("x"), 8, 10, SID);
    s.task_finished(&w1, &key("x"), 8, 10, SID);
    check(&s);
    assert_eq!(s.task(&key("x")).unwrap().who_has.len(), 1);
}

#[test]
fn dead_worker_tasks_are_rescheduled() {
    let mut s = scheduler();
    let w1 = add_worker(&mut s, "w1");
    s.submit_graph(&client(), vec![inc("x", 1)], vec![key("x")], SID);
    s.take_outbox();
    let w2 = add_worker(&mut s, "w2");

    assert!(s.remove_worker(&w1, "test", SID));
    check(&s);
    let out = s.take_outbox();
    assert!(matches!(&out.workers[0], (to, ToWorker::WorkerRemoved { address, .. }) if to == &w2 && address == &w1));
    assert_eq!(computes(&out), vec![(w2, key("x"))]);
    assert_eq!(s.task(&key("x")).unwrap().suspicious, 1);
    assert!(!s.remove_worker(&w1, "again", SID));
}

#[test]
fn task_killing_too_many_workers_errs() {
    let mut s = SchedulerState::new(SchedulerConfig {
        validate: true,
        allowed_failures: 1,
        ..SchedulerConfig::default()
    });
    let w1 = add_worker(&mut s, "w1");
    s.submit_graph(&client(), vec![inc("x", 1)], vec![key("x")], SID);
    let w2 = add_worker(&mut s, "w2");
    s.remove_worker(&w1, "crash", SID);
    s.take_outbox();

    s.remove_worker(&w2, "crash", SID);
    check(&s);
    assert_eq!(state_of(&s, "x"), Some(TaskStatus::Erred));
    let out = s.take_outbox();
    match &out.clients[..] {
        [(_, ToClient::TaskErred { error, blame, .. })] => {
            assert!(error.is_killed_worker());
            assert_eq!(blame, &key("x"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn lost_results_are_recomputed() {
    let mut s = scheduler();
    let w1 = add_worker(&mut s, "w1");
    s.submit_graph(&client(), vec![inc("x", 1)], vec![key("x")], SID);
    s.task_finished(&w1, &key("x"), 8, 10, SID);
    let w2 = add_worker(&mut s, "w2");
    s.take_outbox();

    s.remove_worker(&w1, "crash", SID);
    check(&s);
    let out = s.take_outbox();
    assert_eq!(out.clients, vec![(client(), ToClient::LostData { key: key("x") })]);
    assert_eq!(computes(&out), vec![(w2, key("x"))]);
}

#[test]
fn missing_replicas_are_pruned() {
    let mut s = scheduler();
    let w1 = add_worker(&mut s, "w1");
    let w2 = add_worker(&mut s, "w2");
    s.submit_graph(&client(), vec![inc("x", 1)], vec![key("x")], SID);
    let holder = s.task(&key("x")).unwrap().processing_on.clone().unwrap();
    let other = if holder == w1 { w2.clone() } else { w1.clone() };
    s.task_finished(&holder, &key("x"), 8, 10, SID);
    s.add_keys(&other, &[key("x")], SID);
    check(&s);
    assert_eq!(s.task(&key("x")).unwrap().who_has.len(), 2);
    s.take_outbox();

    s.missing_data(&key("x"), &holder, SID);
    check(&s);
    assert_eq!(state_of(&s, "x"), Some(TaskStatus::Memory));
    assert_eq!(frees(&s.take_outbox()), vec![(holder, key("x"))]);

    s.missing_data(&key("x"), &other, SID);
    check(&s);
    assert_eq!(state_of(&s, "x"), Some(TaskStatus::Processing));
}

#[test]
fn placeholders_without_data_err_as_lost() {
    let mut s = scheduler();
    add_worker(&mut s, "w1");
    s.submit_graph(
        &client(),
        vec![TaskSpec::placeholder(key("gone")), inc("y", key("gone"))],
        vec![key("y")],
        SID,
    );
    check(&s);
    match &s.take_outbox().clients[..] {
        [(_, ToClient::TaskErred { error, blame, .. })] => {
            assert_eq!(error.type_name, "LostData");
            assert_eq!(blame, &key("gone"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

// ── Cancellation, restart, clients ──────────────────────────────────

#[test]
fn cancel_releases_the_task_and_tells_the_client() {
    let mut s = scheduler();
    let w = add_worker(&mut s, "w1");
    s.submit_graph(&client(), vec![inc("x", 1), inc("y", key("x"))], vec![key("x"), key("y")], SID);
    s.take_outbox();

    s.cancel_keys(&client(), &[key("x")], false, SID);
    check(&s);
    let out = s.take_outbox();
    let cancelled: Vec<TaskKey> = out
        .clients
        .iter()
        .flat_map(|(_, msg)| match msg {
            ToClient::CancelledKeys { keys } => keys.clone(),
            _ => Vec::new(),
        })
        .collect();
    assert_eq!(cancelled, vec![key("y"), key("x")]);
    assert_eq!(frees(&out), vec![(w, key("x"))]);
    assert_eq!(s.tasks().count(), 0);
    assert!(s.client(&client()).unwrap().wants_what.is_empty());
}

#[test]
fn cancel_leaves_keys_other_clients_want() {
    let mut s = scheduler();
    add_worker(&mut s, "w1");
    let other = Address::inproc("other-client");
    s.submit_graph(&client(), vec![inc("x", 1)], vec![key("x")], SID);
    s.submit_graph(&other, vec![inc("x", 1)], vec![key("x")], SID);
    s.take_outbox();

    s.cancel_keys(&client(), &[key("x")], false, SID);
    check(&s);
    assert_eq!(state_of(&s, "x"), Some(TaskStatus::Processing));
    assert!(s.task(&key("x")).unwrap().who_wants.contains(&other));
}

#[test]
fn closing_a_client_releases_its_keys() {
    let mut s = scheduler();
    add_worker(&mut s, "w1");
    s.submit_graph(&client(), vec![inc("x", 1)], vec![key("x")], SID);
    s.remove_client(&client(), SID);
    check(&s);
    assert!(!s.is_client(&client()));
    assert_eq!(s.tasks().count(), 0);
}

#[test]
fn restart_terminates_workers_and_clears_tasks() {
    let mut s = scheduler();
    let w1 = add_worker(&mut s, "w1");
    let w2 = add_worker(&mut s, "w2");
    s.submit_graph(&client(), vec![inc("x", 1)], vec![key("x")], SID);
    s.take_outbox();

    assert_eq!(s.restart(SID), 2);
    check(&s);
    assert_eq!(s.tasks().count(), 0);
    assert_eq!(s.workers().count(), 0);
    let out = s.take_outbox();
    let terminated: Vec<&Address> = out
        .workers
        .iter()
        .filter(|(_, msg)| matches!(msg, ToWorker::Terminate { .. }))
        .map(|(to, _)| to)
        .collect();
    assert_eq!(terminated, vec![&w1, &w2]);
    assert_eq!(
        out.clients,
        vec![(client(), ToClient::CancelledKeys { keys: vec![key("x")] })]
    );
}

#[test]
fn restart_forgets_clients_until_they_submit_again() {
    let mut s = scheduler();
    add_worker(&mut s, "w1");
    s.add_client(&client());
    s.submit_graph(&client(), vec![inc("x", 1)], vec![key("x")], SID);

    s.restart(SID);
    check(&s);
    assert!(!s.is_client(&client()));

    add_worker(&mut s, "w2");
    s.submit_graph(&client(), vec![inc("y", 1)], vec![key("y")], SID);
    check(&s);
    assert!(s.is_client(&client()));
    assert_eq!(
        s.client(&client()).unwrap().wants_what,
        BTreeSet::from([key("y")])
    );
}

// ── Liveness & introspection ────────────────────────────────────────

#[test]
fn silent_workers_expire() {
    let mut s = scheduler();
    let w = add_worker(&mut s, "w1");
    let start = Instant::now();
    assert!(s.heartbeat(&w, Default::default(), start));
    assert!(!s.heartbeat(&Address::inproc("ghost"), Default::default(), start));

    let ttl = s.config().worker_ttl();
    assert!(s.expired_workers(start + ttl / 2).is_empty());
    assert_eq!(s.expired_workers(start + ttl + Duration::from_millis(1)), vec![w]);
}

#[test]
fn queries_reflect_state() {
    let mut s = scheduler();
    let w = add_worker(&mut s, "w1");
    s.submit_graph(&client(), vec![inc("x", 1), inc("y", 2)], vec![key("x"), key("y")], SID);
    s.task_finished(&w, &key("x"), 8, 10, SID);

    match s.query(&SchedulerQuery::TaskStates) {
        SchedulerReply::TaskStates(states) => {
            assert_eq!(states[&key("x")], TaskStatus::Memory);
            assert_eq!(states[&key("y")], TaskStatus::Processing);
        }
        other => panic!("unexpected {other:?}"),
    }
    match s.query(&SchedulerQuery::WhoHas { keys: Some(vec![key("x")]) }) {
        SchedulerReply::WhoHas(who_has) => assert_eq!(who_has[&key("x")], vec![w.clone()]),
        other => panic!("unexpected {other:?}"),
    }
    match s.query(&SchedulerQuery::Processing) {
        SchedulerReply::Processing(p) => assert_eq!(p[&w], vec![key("y")]),
        other => panic!("unexpected {other:?}"),
    }
    match s.query(&SchedulerQuery::Workers) {
        SchedulerReply::Workers(infos) => assert_eq!(infos[0].memory_keys, 1),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn story_records_every_transition() {
    let mut s = scheduler();
    let w = add_worker(&mut s, "w1");
    s.submit_graph(&client(), vec![inc("x", 1)], vec![key("x")], "submit-1");
    s.task_finished(&w, &key("x"), 8, 25, "finished-1");

    let story: Vec<(TaskStatus, TaskStatus)> = s
        .story(&key("x"))
        .iter()
        .map(|r| (r.start, r.finish))
        .collect();
    assert_eq!(
        story,
        vec![
            (TaskStatus::Released, TaskStatus::Waiting),
            (TaskStatus::Waiting, TaskStatus::Processing),
            (TaskStatus::Processing, TaskStatus::Memory),
        ]
    );
    assert_eq!(s.story(&key("x"))[2].stimulus_id, "finished-1");
    assert_eq!(s.prefix("inc").unwrap().duration_average_ms, Some(25.0));
}
