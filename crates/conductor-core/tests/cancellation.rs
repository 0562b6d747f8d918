mod common;

use std::time::Duration;

use common::{scheduler, Behavior, ScriptedWorker, Tracker};
use conductor_core::workflow::StageState;
use conductor_core::{ErrorKind, RecoveryPolicy, RunOptions, StageSpec, WorkflowStatus, WorkflowTemplate};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn pipeline() -> WorkflowTemplate {
    WorkflowTemplate::new(
        "pipeline",
        vec![
            StageSpec::new("extract", "fast"),
            StageSpec::new("analyse", "slow").depends_on(["extract"]),
            StageSpec::new("report", "fast").depends_on(["analyse"]),
        ],
    )
}

#[tokio::test(start_paused = true)]
async fn external_cancel_keeps_finished_and_skips_pending() {
    let tracker = Tracker::new();
    let fast = ScriptedWorker::new("fast", &tracker).delay_ms(10).build();
    let slow = ScriptedWorker::new("slow", &tracker).delay_ms(60_000).build();
    let scheduler = scheduler(&[&fast, &slow]);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let instance = scheduler
        .run_with_cancel(pipeline(), json!({}), RunOptions::default(), cancel)
        .await;

    assert_eq!(instance.status(), WorkflowStatus::Completed);
    assert_eq!(instance.stage_state("extract"), Some(StageState::Succeeded));
    assert!(instance.result("extract").unwrap().succeeded);

    assert_eq!(instance.stage_state("analyse"), Some(StageState::Failed));
    assert_eq!(instance.stage_state("report"), Some(StageState::Skipped));
    assert_eq!(fast.calls(), 1);

    let cancelled: Vec<_> = instance.errors_of_kind(ErrorKind::Cancelled).collect();
    assert_eq!(cancelled.len(), 2);
    assert_eq!(cancelled[0].stage.as_deref(), Some("analyse"));
    assert_eq!(cancelled[1].stage.as_deref(), Some("report"));
    assert_eq!(cancelled[1].message, "workflow cancelled");
    assert!(!tracker.events().contains(&"end:analyse".to_string()));
}

#[tokio::test(start_paused = true)]
async fn cancel_before_start_skips_everything() {
    let tracker = Tracker::new();
    let fast = ScriptedWorker::new("fast", &tracker).build();
    let slow = ScriptedWorker::new("slow", &tracker).build();
    let scheduler = scheduler(&[&fast, &slow]);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let instance = scheduler
        .run_with_cancel(pipeline(), json!({}), RunOptions::default(), cancel)
        .await;

    assert_eq!(instance.status(), WorkflowStatus::Completed);
    assert!(instance
        .stage_states()
        .values()
        .all(|s| *s == StageState::Skipped));
    assert_eq!(fast.calls() + slow.calls(), 0);
    assert!(!instance.overall_success());
}

#[tokio::test(start_paused = true)]
async fn global_timeout_cancels_in_flight_work() {
    let tracker = Tracker::new();
    let fast = ScriptedWorker::new("fast", &tracker).delay_ms(10).build();
    let slow = ScriptedWorker::new("slow", &tracker).behavior(Behavior::Hang).build();
    let scheduler = scheduler(&[&fast, &slow]);

    let instance = scheduler
        .run(
            pipeline(),
            json!({}),
            RunOptions::default().global_timeout(Duration::from_millis(500)),
        )
        .await;

    assert_eq!(instance.status(), WorkflowStatus::Completed);
    assert_eq!(instance.stage_state("extract"), Some(StageState::Succeeded));
    assert_eq!(instance.stage_state("analyse"), Some(StageState::Failed));
    assert_eq!(instance.stage_state("report"), Some(StageState::Skipped));

    let skipped = instance
        .errors_of_kind(ErrorKind::Cancelled)
        .find(|e| e.stage.as_deref() == Some("report"))
        .unwrap();
    assert_eq!(skipped.message, "global timeout exceeded");

    // The run ends close to the global timeout, not the stage timeout.
    let elapsed = instance.report().unwrap().total_elapsed;
    assert!(elapsed < Duration::from_secs(5), "{:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn cancel_interrupts_recovery_backoff() {
    let tracker = Tracker::new();
    let flaky = ScriptedWorker::new("fast", &tracker)
        .behavior(Behavior::AlwaysFail)
        .policy(RecoveryPolicy::bounded_backoff(Duration::from_secs(10), 3))
        .build();
    let scheduler = scheduler(&[&flaky]);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let template = WorkflowTemplate::new("backoff", vec![StageSpec::new("s", "fast")]);
    let instance = scheduler
        .run_with_cancel(template, json!({}), RunOptions::default(), cancel)
        .await;

    assert_eq!(flaky.calls(), 1);
    assert_eq!(instance.stage_state("s"), Some(StageState::Failed));
    let last = instance.errors().last().unwrap();
    assert_eq!(last.kind, ErrorKind::Cancelled);
    assert!(last.message.contains("backoff"));
}
