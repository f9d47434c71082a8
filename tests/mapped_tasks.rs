// tests/mapped_tasks.rs

//! Mapped fan-out: elementwise execution, sequence states, and how mapped
//! children count individually during classification.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value};

use flowdag::{Edge, Flow, FlowRunOpts, FlowRunner, ParallelExecutor, StateKind, Task};
use flowdag_test_utils::builders::{const_task, return_states};
use flowdag_test_utils::init_tracing;

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// 100 / x, failing on x == 2.
fn divider(name: &str) -> Task {
    Task::builder(name)
        .mapped(true)
        .run(|inputs, _| {
            let x = inputs.get("x").and_then(Value::as_i64).unwrap_or(0);
            if x == 2 {
                Err(anyhow::anyhow!("cannot handle {x}"))
            } else {
                Ok(json!(100 / x))
            }
        })
        .build()
}

fn fanout_flow() -> flowdag::Result<Flow> {
    Flow::builder("fanout")
        .task(const_task("nums", json!([1, 2, 5])))
        .task(divider("inv"))
        .task(Task::builder("check").run(|_, _| Ok(json!("checked"))).build())
        .edge(Edge::new("nums", "inv").with_key("x").mapped())
        .edge(Edge::new("inv", "check").with_key("xs"))
        .build()
}

#[tokio::test]
async fn failed_child_trips_the_downstream_trigger() -> TestResult {
    init_tracing();

    let runner = FlowRunner::new(Arc::new(fanout_flow()?));
    let state = runner
        .run(FlowRunOpts {
            return_tasks: BTreeSet::from(["inv".to_string(), "check".to_string()]),
            ..Default::default()
        })
        .await?;

    // The failed element makes the reference (terminal) task TriggerFailed,
    // which fails the flow.
    assert!(state.is_failed(), "flow ended as {state}");

    let returned = return_states(&state);
    let inv = returned.get("inv").expect("inv returned");
    let children = inv.children().expect("inv should be a sequence state");
    assert_eq!(children.len(), 3);
    assert!(children[0].is_successful());
    assert!(children[1].is_failed());
    assert!(children[2].is_successful());
    assert_eq!(children[0].result_value(), Some(&json!(100)));
    assert_eq!(children[2].result_value(), Some(&json!(20)));

    assert!(matches!(
        returned.get("check").map(|s| &s.kind),
        Some(StateKind::TriggerFailed)
    ));
    Ok(())
}

#[tokio::test]
async fn all_successful_children_feed_the_downstream_as_a_sequence() -> TestResult {
    init_tracing();

    let flow = Flow::builder("gather")
        .task(const_task("nums", json!([1, 4, 5])))
        .task(divider("inv"))
        .task(
            Task::builder("sum")
                .run(|inputs, _| {
                    let total: i64 = inputs
                        .get("xs")
                        .and_then(Value::as_array)
                        .map(|xs| xs.iter().filter_map(Value::as_i64).sum())
                        .unwrap_or(0);
                    Ok(json!(total))
                })
                .build(),
        )
        .edge(Edge::new("nums", "inv").with_key("x").mapped())
        .edge(Edge::new("inv", "sum").with_key("xs"))
        .build()?;

    let state = FlowRunner::new(Arc::new(flow))
        .run(FlowRunOpts {
            return_tasks: BTreeSet::from(["sum".to_string()]),
            executor: Arc::new(ParallelExecutor::new()),
            ..Default::default()
        })
        .await?;

    assert!(state.is_successful(), "flow ended as {state}");
    let returned = return_states(&state);
    // 100/1 + 100/4 + 100/5
    assert_eq!(
        returned.get("sum").and_then(|s| s.result_value()),
        Some(&json!(145))
    );
    Ok(())
}

#[tokio::test]
async fn mapped_downstream_of_mapped_upstream_runs_per_child() -> TestResult {
    init_tracing();

    let doubler = Task::builder("double")
        .mapped(true)
        .run(|inputs, _| {
            let x = inputs.get("x").and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(x * 2))
        })
        .build();

    let flow = Flow::builder("two-stage")
        .task(const_task("nums", json!([1, 2, 5])))
        .task(divider("inv"))
        .task(doubler)
        .edge(Edge::new("nums", "inv").with_key("x").mapped())
        .edge(Edge::new("inv", "double").with_key("x").mapped())
        .build()?;

    let state = FlowRunner::new(Arc::new(flow))
        .run(FlowRunOpts {
            return_tasks: BTreeSet::from(["double".to_string()]),
            ..Default::default()
        })
        .await?;

    let returned = return_states(&state);
    let double = returned.get("double").expect("double returned");
    let children = double.children().expect("sequence state");
    assert_eq!(children.len(), 3);

    // The child above the failed element trigger-fails; the others double
    // their upstream child's result.
    assert_eq!(children[0].result_value(), Some(&json!(200)));
    assert!(matches!(children[1].kind, StateKind::TriggerFailed));
    assert_eq!(children[2].result_value(), Some(&json!(40)));

    // And the flow as a whole fails, because the mapped terminal task has a
    // failed child in the reference set.
    assert!(state.is_failed());
    Ok(())
}

#[tokio::test]
async fn mapping_over_a_non_sequence_fails_cleanly() -> TestResult {
    init_tracing();

    let flow = Flow::builder("bad-fanout")
        .task(const_task("scalar", json!(3)))
        .task(divider("inv"))
        .edge(Edge::new("scalar", "inv").with_key("x").mapped())
        .build()?;

    let state = FlowRunner::new(Arc::new(flow))
        .run(FlowRunOpts {
            return_tasks: BTreeSet::from(["inv".to_string()]),
            ..Default::default()
        })
        .await?;

    assert!(state.is_failed(), "flow ended as {state}");
    let returned = return_states(&state);
    assert!(returned.get("inv").map(|s| s.is_failed()).unwrap_or(false));
    Ok(())
}
