// tests/linear_flow.rs

//! A linear chain A -> B -> C where values flow through keyed edges.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value};

use flowdag::{context, Edge, Flow, FlowRunOpts, FlowRunner, ParallelExecutor, Task};
use flowdag_test_utils::builders::return_states;
use flowdag_test_utils::init_tracing;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn chain_flow() -> flowdag::Result<Flow> {
    Flow::builder("chain")
        .version("3")
        .task(Task::builder("a").run(|_, _| Ok(json!(1))).build())
        .task(
            Task::builder("b")
                .run(|inputs, _| {
                    let x = inputs.get("x").and_then(Value::as_i64).unwrap_or(0);
                    Ok(json!(x + 1))
                })
                .build(),
        )
        .task(
            Task::builder("c")
                .run(|inputs, _| {
                    let x = inputs.get("x").and_then(Value::as_i64).unwrap_or(0);
                    Ok(json!(x * 10))
                })
                .build(),
        )
        .edge(Edge::new("a", "b").with_key("x"))
        .edge(Edge::new("b", "c").with_key("x"))
        .build()
}

#[tokio::test]
async fn chain_succeeds_and_returns_terminal_state() -> TestResult {
    init_tracing();

    let runner = FlowRunner::new(Arc::new(chain_flow()?));
    let state = runner
        .run(FlowRunOpts {
            return_tasks: BTreeSet::from(["c".to_string()]),
            ..Default::default()
        })
        .await?;

    assert!(state.is_successful(), "flow ended as {state}");
    assert_eq!(
        state.message.as_deref(),
        Some("All reference tasks succeeded.")
    );

    let returned = return_states(&state);
    let c = returned.get("c").expect("c should be returned");
    assert!(c.is_successful());
    assert_eq!(c.result_value(), Some(&json!(20)));
    Ok(())
}

#[tokio::test]
async fn chain_succeeds_on_the_parallel_executor_too() -> TestResult {
    init_tracing();

    let runner = FlowRunner::new(Arc::new(chain_flow()?));
    let state = runner
        .run(FlowRunOpts {
            return_tasks: BTreeSet::from(["c".to_string()]),
            executor: Arc::new(ParallelExecutor::new()),
            ..Default::default()
        })
        .await?;

    assert!(state.is_successful());
    let returned = return_states(&state);
    assert_eq!(
        returned.get("c").and_then(|s| s.result_value()),
        Some(&json!(20))
    );
    Ok(())
}

#[tokio::test]
async fn tasks_observe_the_run_context() -> TestResult {
    init_tracing();

    let flow = Flow::builder("ctx-flow")
        .version("7")
        .task(
            Task::builder("observer")
                .run(|_, ctx| {
                    Ok(json!({
                        "flow": ctx.get_str(context::FLOW_NAME),
                        "version": ctx.get_str(context::FLOW_VERSION),
                        "param": ctx
                            .get(context::PARAMETERS)
                            .and_then(|p| p.get("answer"))
                            .cloned(),
                        "executor": ctx.get_str(context::EXECUTOR_ID),
                    }))
                })
                .build(),
        )
        .build()?;

    let runner = FlowRunner::new(Arc::new(flow));
    let state = runner
        .run(FlowRunOpts {
            return_tasks: BTreeSet::from(["observer".to_string()]),
            parameters: [("answer".to_string(), json!(42))].into_iter().collect(),
            ..Default::default()
        })
        .await?;

    let returned = return_states(&state);
    let seen = returned
        .get("observer")
        .and_then(|s| s.result_value())
        .expect("observer result");

    assert_eq!(seen["flow"], json!("ctx-flow"));
    assert_eq!(seen["version"], json!("7"));
    assert_eq!(seen["param"], json!(42));
    assert!(seen["executor"].as_str().unwrap().starts_with("local-"));
    Ok(())
}
