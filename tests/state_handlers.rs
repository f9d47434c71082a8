// tests/state_handlers.rs

//! Flow-level state handlers: ordering, substitution, and per-task context
//! overrides at dispatch time.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use serde_json::json;

use flowdag::{Flow, FlowRunOpts, FlowRunner, State, Task};
use flowdag_test_utils::builders::return_states;
use flowdag_test_utils::init_tracing;

type TestResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::test]
async fn flow_handlers_see_each_transition_in_order() -> TestResult {
    init_tracing();

    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let first_log = Arc::clone(&log);
    let second_log = Arc::clone(&log);

    let flow = Flow::builder("audited")
        .task(Task::builder("t").run(|_, _| Ok(json!(1))).build())
        .state_handler(move |_, old, new| {
            first_log
                .lock()
                .unwrap()
                .push(format!("first:{}->{}", old.name(), new.name()));
            new
        })
        .state_handler(move |_, old, new| {
            second_log
                .lock()
                .unwrap()
                .push(format!("second:{}->{}", old.name(), new.name()));
            new
        })
        .build()?;

    let state = FlowRunner::new(Arc::new(flow))
        .run(FlowRunOpts::default())
        .await?;
    assert!(state.is_successful());

    let entries = log.lock().unwrap().clone();
    assert_eq!(
        entries,
        vec![
            "first:Pending->Running".to_string(),
            "second:Pending->Running".to_string(),
            "first:Running->Success".to_string(),
            "second:Running->Success".to_string(),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn a_flow_handler_may_substitute_the_final_state() -> TestResult {
    init_tracing();

    let flow = Flow::builder("vetoed")
        .task(Task::builder("t").run(|_, _| Ok(json!(1))).build())
        .state_handler(|_, _, new| {
            if new.is_successful() {
                State::failed("vetoed by policy")
            } else {
                new
            }
        })
        .build()?;

    let state = FlowRunner::new(Arc::new(flow))
        .run(FlowRunOpts::default())
        .await?;

    assert!(state.is_failed());
    assert_eq!(state.message.as_deref(), Some("vetoed by policy"));
    Ok(())
}

#[tokio::test]
async fn per_task_context_overrides_the_run_context() -> TestResult {
    init_tracing();

    let reader = |key: &'static str| {
        move |_: &flowdag::Inputs, ctx: &flowdag::RunContext| {
            Ok(ctx.get(key).cloned().unwrap_or(json!(null)))
        }
    };

    let flow = Flow::builder("ctxs")
        .task(Task::builder("plain").run(reader("who")).build())
        .task(Task::builder("special").run(reader("who")).build())
        .build()?;

    let state = FlowRunner::new(Arc::new(flow))
        .run(FlowRunOpts {
            context: flowdag::RunContext::from_entries([("who", json!("everyone"))]),
            task_contexts: HashMap::from([(
                "special".to_string(),
                BTreeMap::from([("who".to_string(), json!("just me"))]),
            )]),
            return_tasks: BTreeSet::from(["plain".to_string(), "special".to_string()]),
            ..Default::default()
        })
        .await?;

    let returned = return_states(&state);
    assert_eq!(
        returned.get("plain").and_then(|s| s.result_value()),
        Some(&json!("everyone"))
    );
    assert_eq!(
        returned.get("special").and_then(|s| s.result_value()),
        Some(&json!("just me"))
    );
    Ok(())
}

#[tokio::test]
async fn finished_flow_state_short_circuits_the_run() -> TestResult {
    init_tracing();

    let flow = Flow::builder("done")
        .task(Task::builder("t").run(|_, _| panic!("must not run")).build())
        .build()?;

    let done = State::success(Some(json!("already")));
    let state = FlowRunner::new(Arc::new(flow))
        .run(FlowRunOpts {
            state: Some(done.clone()),
            ..Default::default()
        })
        .await?;

    assert_eq!(state, done);
    Ok(())
}
