// tests/throttle_limits.rs

//! Tag-queue throttling caps concurrent execution per tag.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use flowdag::{EngineError, Flow, FlowRunOpts, FlowRunner, ParallelExecutor, Task};
use flowdag_test_utils::init_tracing;
use flowdag_test_utils::recording::ConcurrencyProbe;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn tagged_sleeper(name: &str, probe: &ConcurrencyProbe) -> Task {
    Task::builder(name)
        .tag("db")
        .state_handler(probe.handler())
        .run_future(|_, _| async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(json!("done"))
        })
        .build()
}

#[tokio::test]
async fn no_more_than_the_budget_runs_at_once() -> TestResult {
    init_tracing();

    let probe = ConcurrencyProbe::new();
    let mut builder = Flow::builder("throttled").throttle("db", 2);
    let mut names = BTreeSet::new();
    for i in 0..5 {
        let name = format!("t{i}");
        builder = builder.task(tagged_sleeper(&name, &probe));
        names.insert(name);
    }
    let flow = Arc::new(builder.build()?);

    let state = FlowRunner::new(flow)
        .run(FlowRunOpts {
            return_tasks: names.clone(),
            executor: Arc::new(ParallelExecutor::new()),
            ..Default::default()
        })
        .await?;

    assert!(state.is_successful(), "flow ended as {state}");
    assert!(
        probe.max_running() <= 2,
        "throttle exceeded: {} tasks ran at once",
        probe.max_running()
    );
    assert_eq!(probe.currently_running(), 0);

    let returned = flowdag_test_utils::builders::return_states(&state);
    assert_eq!(returned.len(), 5);
    assert!(returned.values().all(|s| s.is_successful()));
    Ok(())
}

#[tokio::test]
async fn zero_throttle_budget_is_rejected_before_dispatch() -> TestResult {
    init_tracing();

    let flow = Arc::new(
        Flow::builder("bad-throttle")
            .task(Task::builder("t").tag("db").build())
            .throttle("db", 0)
            .build()?,
    );

    let err = FlowRunner::new(flow)
        .run(FlowRunOpts::default())
        .await
        .expect_err("zero budget must be rejected");

    assert!(matches!(err, EngineError::Config(msg) if msg.contains("\"db\"")));
    Ok(())
}

#[tokio::test]
async fn caller_throttle_overrides_the_flow_default() -> TestResult {
    init_tracing();

    let probe = ConcurrencyProbe::new();
    let mut builder = Flow::builder("override").throttle("db", 4);
    for i in 0..4 {
        builder = builder.task(tagged_sleeper(&format!("t{i}"), &probe));
    }
    let flow = Arc::new(builder.build()?);

    let state = FlowRunner::new(flow)
        .run(FlowRunOpts {
            throttle: Some([("db".to_string(), 1)].into_iter().collect()),
            executor: Arc::new(ParallelExecutor::new()),
            ..Default::default()
        })
        .await?;

    assert!(state.is_successful());
    assert!(
        probe.max_running() <= 1,
        "override ignored: {} tasks ran at once",
        probe.max_running()
    );
    Ok(())
}
