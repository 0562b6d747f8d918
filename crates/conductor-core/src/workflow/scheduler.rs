//! Scheduler: plans a template into waves and executes them.
//!
//! ```text
//!            ┌──────────── orchestrator (sole writer of the instance) ───────────┐
//!            │                                                                    │
//! template ──► preflight ──► plan ──► wave 0 ──► wave 1 ──► … ──► aggregate ──► instance
//!                │                      │  ▲
//!                │ Failed               │  │ StageOutcome (JoinSet) + StageEvent (mpsc)
//!                ▼                      ▼  │
//!             instance             stage tasks ──► attempt task ──► Worker::execute
//!                                  (semaphore)     (timeout, abort on expiry)
//! ```
//!
//! Stage tasks never touch the instance: they return an immutable
//! [`StageOutcome`] which the orchestrator merges. Waves run strictly in
//! sequence; stages within a wave run concurrently, optionally capped by
//! `max_concurrency`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::CoordinatorConfig;
use crate::error::{ErrorKind, ErrorRecord};
use crate::worker::{ExecutionContext, WorkerHandle, WorkerRegistry, WorkerResult};
use crate::workflow::aggregator::WorkflowAggregator;
use crate::workflow::gates::QualityGateValidator;
use crate::workflow::graph::TaskGraph;
use crate::workflow::instance::{StageState, WorkflowInstance, WorkflowStatus};
use crate::workflow::recovery::StageFailure;
use crate::workflow::schema::{StageSpec, WorkflowTemplate};

const REASON_CANCELLED: &str = "workflow cancelled";
const REASON_GLOBAL_TIMEOUT: &str = "global timeout exceeded";

/// Per-run knobs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOptions {
    /// Stages of one wave running at once (0 = unbounded).
    pub max_concurrency: usize,
    /// Wall-clock limit for the whole run.
    pub global_timeout: Option<Duration>,
}

impl RunOptions {
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency,
            global_timeout: config.global_timeout(),
        }
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    pub fn global_timeout(mut self, timeout: Duration) -> Self {
        self.global_timeout = Some(timeout);
        self
    }
}

/// Progress reported by a stage task while it is still running.
#[derive(Debug)]
enum StageEvent {
    Retrying { stage: String, retry: u32 },
}

/// Final, immutable report of one stage task.
#[derive(Debug)]
struct StageOutcome {
    stage: String,
    state: StageState,
    result: Option<WorkerResult>,
    errors: Vec<ErrorRecord>,
    retries: u32,
    elapsed: Duration,
}

impl StageOutcome {
    fn not_started(stage: String) -> Self {
        Self {
            stage,
            state: StageState::Skipped,
            result: None,
            errors: Vec::new(),
            retries: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// Everything a stage task owns.
struct StageJob {
    stage: StageSpec,
    handle: WorkerHandle,
    input: Value,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<StageEvent>,
    limiter: Option<Arc<Semaphore>>,
    max_backoff: Duration,
}

pub struct Scheduler {
    registry: Arc<WorkerRegistry>,
    config: CoordinatorConfig,
    aggregator: WorkflowAggregator,
}

impl Scheduler {
    pub fn new(registry: Arc<WorkerRegistry>, config: CoordinatorConfig) -> Self {
        let aggregator = WorkflowAggregator::new(config.aggregation.clone());
        Self {
            registry,
            config,
            aggregator,
        }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Run options derived from the configuration.
    pub fn default_options(&self) -> RunOptions {
        RunOptions::from_config(&self.config)
    }

    /// Run `template` to completion.
    pub async fn run(
        &self,
        template: impl Into<Arc<WorkflowTemplate>>,
        input: Value,
        options: RunOptions,
    ) -> WorkflowInstance {
        self.run_with_cancel(template, input, options, CancellationToken::new())
            .await
    }

    /// Run `template`, stopping early when `cancel` fires. Completed stages
    /// keep their results, in-flight stages fail as `cancelled`, and stages
    /// not yet started are skipped.
    pub async fn run_with_cancel(
        &self,
        template: impl Into<Arc<WorkflowTemplate>>,
        input: Value,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> WorkflowInstance {
        let template = template.into();
        let started = Instant::now();
        let mut instance = WorkflowInstance::new(Arc::clone(&template));

        tracing::info!(
            "[Scheduler] Starting {} ({} v{}, {} stage(s))",
            instance.id(),
            template.name,
            template.version,
            template.stages.len()
        );

        let problems = self.preflight(&template, &input);
        if !problems.is_empty() {
            for problem in problems {
                tracing::error!("[Scheduler] {}: {}", instance.id(), problem);
                instance.record_error(ErrorRecord::new(None, ErrorKind::TemplateError, problem));
            }
            instance.set_status(WorkflowStatus::Failed);
            return instance;
        }

        let plan = TaskGraph::new(&template).plan();
        for edge in &plan.broken_edges {
            instance.record_error(ErrorRecord::for_stage(
                &edge.stage,
                ErrorKind::CycleBreakWarning,
                format!(
                    "dependency on '{}' dropped to break a dependency cycle",
                    edge.dependency
                ),
            ));
        }
        instance.set_plan(plan.clone());
        instance.set_status(WorkflowStatus::Running);

        let run_token = cancel.child_token();
        let global_deadline = options.global_timeout.map(|d| started + d);
        let global_timer = sleep_until_opt(global_deadline);
        tokio::pin!(global_timer);
        let mut timer_fired = false;

        let limiter = (options.max_concurrency > 0)
            .then(|| Arc::new(Semaphore::new(options.max_concurrency)));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        for (wave_index, wave) in plan.waves.iter().enumerate() {
            if !timer_fired && global_deadline.is_some_and(|d| Instant::now() >= d) {
                timer_fired = true;
                run_token.cancel();
            }

            tracing::debug!(
                "[Scheduler] {} wave {}: {:?}",
                instance.id(),
                wave_index,
                wave
            );

            let mut tasks = JoinSet::new();
            for name in wave {
                let Some(stage) = template.stage(name) else {
                    continue;
                };

                if run_token.is_cancelled() {
                    skip_cancelled(&mut instance, name, cancel_reason(&cancel));
                    continue;
                }

                let deps = plan.effective_dependencies(name);
                let unmet: Vec<String> = deps
                    .iter()
                    .filter(|d| instance.stage_state(d) != Some(StageState::Succeeded))
                    .map(|d| {
                        let state = instance
                            .stage_state(d)
                            .map_or_else(|| "unknown".to_string(), |s| s.to_string());
                        format!("'{}' ({})", d, state)
                    })
                    .collect();
                if !unmet.is_empty() {
                    tracing::warn!(
                        "[Scheduler] Skipping {}: dependencies did not succeed: {}",
                        name,
                        unmet.join(", ")
                    );
                    instance.set_stage_state(name, StageState::Skipped);
                    instance.record_error(ErrorRecord::for_stage(
                        name,
                        ErrorKind::DependencyFailure,
                        format!("dependencies did not succeed: {}", unmet.join(", ")),
                    ));
                    continue;
                }

                // Preflight guarantees every stage's worker is registered.
                let Some(handle) = self.registry.get(&stage.worker_id) else {
                    continue;
                };

                instance.set_stage_state(name, StageState::Running);
                tasks.spawn(run_stage(StageJob {
                    stage: stage.clone(),
                    handle: handle.clone(),
                    input: stage_input(&input, stage, deps, &instance),
                    cancel: run_token.clone(),
                    events: events_tx.clone(),
                    limiter: limiter.clone(),
                    max_backoff: self.config.max_backoff(),
                }));
            }

            loop {
                tokio::select! {
                    biased;

                    Some(event) = events_rx.recv() => apply_event(&mut instance, event),

                    _ = &mut global_timer, if !timer_fired => {
                        timer_fired = true;
                        tracing::warn!(
                            "[Scheduler] {} exceeded its global timeout, cancelling",
                            instance.id()
                        );
                        run_token.cancel();
                    }

                    joined = tasks.join_next() => match joined {
                        Some(Ok(outcome)) => self.merge_outcome(&mut instance, outcome, &cancel),
                        Some(Err(e)) => {
                            tracing::error!("[Scheduler] Stage task aborted: {}", e);
                        }
                        None => break,
                    },
                }
            }

            // A stage task that died without reporting leaves its stage running.
            for name in wave {
                if instance.stage_state(name).is_some_and(|s| !s.is_terminal() && s != StageState::Pending) {
                    instance.set_stage_state(name, StageState::Failed);
                    instance.record_error(ErrorRecord::for_stage(
                        name,
                        ErrorKind::WorkerInternalError,
                        "stage task terminated without reporting an outcome",
                    ));
                }
            }
        }

        let total_elapsed = started.elapsed();
        let report = self.aggregator.aggregate(
            &instance,
            |worker_id| self.weight_of(worker_id),
            total_elapsed,
        );
        instance.set_report(report);
        instance.set_status(WorkflowStatus::Completed);

        tracing::info!(
            "[Scheduler] {} completed in {}ms (overall_success={})",
            instance.id(),
            total_elapsed.as_millis(),
            instance.overall_success()
        );
        instance
    }

    /// Template-level checks. A non-empty result fails the run before any
    /// stage executes.
    fn preflight(&self, template: &WorkflowTemplate, input: &Value) -> Vec<String> {
        let mut problems = Vec::new();
        if let Err(e) = template.validate() {
            problems.push(e.to_string());
        }
        for stage in &template.stages {
            if !self.registry.contains(&stage.worker_id) {
                problems.push(
                    crate::error::CoordinationError::UnknownWorker {
                        stage: stage.name.clone(),
                        worker_id: stage.worker_id.clone(),
                    }
                    .to_string(),
                );
            }
        }
        if let Err(e) = template.validate_input(input) {
            problems.push(e.to_string());
        }
        problems
    }

    fn weight_of(&self, worker_id: &str) -> f64 {
        match self.config.worker_weights.get(worker_id) {
            Some(w) if w.is_finite() => w.clamp(0.0, 1.0),
            _ => self.registry.get(worker_id).map_or(1.0, WorkerHandle::weight),
        }
    }

    fn merge_outcome(
        &self,
        instance: &mut WorkflowInstance,
        outcome: StageOutcome,
        cancel: &CancellationToken,
    ) {
        let StageOutcome {
            stage: name,
            state,
            result,
            errors,
            retries,
            elapsed,
        } = outcome;

        if state == StageState::Skipped && result.is_none() {
            skip_cancelled(instance, &name, cancel_reason(cancel));
            return;
        }

        tracing::info!(
            "[Scheduler] {} {} in {}ms (retries={})",
            name,
            state,
            elapsed.as_millis(),
            retries
        );

        instance.set_stage_state(&name, state);
        instance.record_timing(&name, elapsed);
        instance.record_retries(&name, retries);
        for e in errors {
            instance.record_error(e);
        }

        let Some(result) = result else {
            return;
        };
        if let Some(stage) = instance.template().stage(&name).cloned() {
            if let Some(gate) = QualityGateValidator::evaluate(&stage, &result) {
                if !gate.passed && result.succeeded {
                    instance.record_error(ErrorRecord::for_stage(
                        &name,
                        ErrorKind::QualityGateMiss,
                        format!(
                            "gate '{}' observed {:.3} below threshold {:.3}",
                            gate.gate_id, gate.observed, gate.threshold
                        ),
                    ));
                }
                instance.record_gate(&name, gate);
            }
        }
        instance.record_result(&name, result);
    }
}

fn apply_event(instance: &mut WorkflowInstance, event: StageEvent) {
    match event {
        StageEvent::Retrying { stage, retry } => {
            // Events can trail the stage's final outcome.
            if instance.stage_state(&stage).is_some_and(|s| !s.is_terminal()) {
                instance.set_stage_state(&stage, StageState::Retried(retry));
            }
        }
    }
}

fn cancel_reason(external: &CancellationToken) -> &'static str {
    if external.is_cancelled() {
        REASON_CANCELLED
    } else {
        REASON_GLOBAL_TIMEOUT
    }
}

fn skip_cancelled(instance: &mut WorkflowInstance, stage: &str, reason: &str) {
    tracing::info!("[Scheduler] Skipping {}: {}", stage, reason);
    instance.set_stage_state(stage, StageState::Skipped);
    instance.record_error(ErrorRecord::for_stage(stage, ErrorKind::Cancelled, reason));
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Run input merged with the stage's params and one `<dep>_result` entry
/// per dependency payload. A non-object run input is passed as `input`.
fn stage_input(
    run_input: &Value,
    stage: &StageSpec,
    deps: &[String],
    instance: &WorkflowInstance,
) -> Value {
    let mut obj = match run_input {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("input".to_string(), other.clone());
            map
        }
    };
    for (k, v) in &stage.params {
        obj.insert(k.clone(), v.clone());
    }
    for dep in deps {
        if let Some(result) = instance.result(dep) {
            obj.insert(format!("{}_result", dep), result.payload.clone());
        }
    }
    Value::Object(obj)
}

// ─── Stage task ─────────────────────────────────────────────────────────────

enum Attempt {
    Finished(WorkerResult),
    Panicked(String),
    TimedOut,
    Cancelled,
}

async fn run_stage(job: StageJob) -> StageOutcome {
    let StageJob {
        stage,
        handle,
        mut input,
        cancel,
        events,
        limiter,
        max_backoff,
    } = job;

    let _permit = match limiter {
        Some(sem) => tokio::select! {
            _ = cancel.cancelled() => return StageOutcome::not_started(stage.name),
            permit = sem.acquire_owned() => match permit {
                Ok(p) => Some(p),
                Err(_) => return StageOutcome::not_started(stage.name),
            },
        },
        None => None,
    };
    if cancel.is_cancelled() {
        return StageOutcome::not_started(stage.name);
    }

    let started = Instant::now();
    let worker = Arc::clone(handle.worker());
    let policy = handle.policy().clone();
    let mut errors = Vec::new();
    let mut retries = 0;
    let mut attempt = 1;

    let (state, result) = loop {
        if let Err(e) = worker.validate(&input) {
            tracing::warn!("[Scheduler] {} input rejected: {}", stage.name, e);
            errors.push(
                ErrorRecord::for_stage(&stage.name, ErrorKind::ValidationError, e.to_string())
                    .with_attempt(attempt),
            );
            break (StageState::Failed, WorkerResult::failure(e.to_string()));
        }

        let (result, failure) = match handle.breaker().map(|b| b.check()) {
            Some(Err(open)) => (
                WorkerResult::failure(open.to_string()),
                Some((ErrorKind::WorkerInternalError, open.to_string())),
            ),
            _ => execute_attempt(&handle, &stage, input.clone(), attempt, &cancel).await,
        };

        let Some((kind, message)) = failure else {
            break (StageState::Succeeded, result);
        };

        tracing::warn!(
            "[Scheduler] {} attempt {} failed ({}): {}",
            stage.name,
            attempt,
            kind,
            message
        );
        errors.push(
            ErrorRecord::for_stage(&stage.name, kind, message.clone()).with_attempt(attempt),
        );
        if kind == ErrorKind::Cancelled {
            break (StageState::Failed, result);
        }

        let failure = StageFailure {
            kind,
            message,
            attempt,
        };
        let Some(retry) =
            policy.attempt_recovery(&stage, &failure, &input, worker.as_ref(), max_backoff)
        else {
            break (StageState::Failed, result);
        };

        retries += 1;
        let _ = events.send(StageEvent::Retrying {
            stage: stage.name.clone(),
            retry: retries,
        });

        if !retry.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(retry.delay) => {}
                _ = cancel.cancelled() => {
                    errors.push(
                        ErrorRecord::for_stage(
                            &stage.name,
                            ErrorKind::Cancelled,
                            "cancelled during recovery backoff",
                        )
                        .with_attempt(attempt + 1),
                    );
                    break (StageState::Failed, result);
                }
            }
        }

        input = retry.input;
        attempt += 1;
    };

    StageOutcome {
        stage: stage.name,
        state,
        result: Some(result.normalized()),
        errors,
        retries,
        elapsed: started.elapsed(),
    }
}

/// One bounded invocation of the worker. Returns the (normalized) result
/// and, for a failed attempt, its classification and message.
async fn execute_attempt(
    handle: &WorkerHandle,
    stage: &StageSpec,
    input: Value,
    attempt: u32,
    cancel: &CancellationToken,
) -> (WorkerResult, Option<(ErrorKind, String)>) {
    let timeout = stage.timeout_duration();
    let started = Instant::now();
    let deadline = started + timeout;
    let attempt_token = cancel.child_token();
    let ctx = ExecutionContext {
        stage: stage.name.clone(),
        attempt,
        deadline,
        cancel: attempt_token.clone(),
    };

    let worker = Arc::clone(handle.worker());
    let mut task = tokio::spawn(async move { worker.execute(input, ctx).await });

    let outcome = tokio::select! {
        joined = tokio::time::timeout_at(deadline, &mut task) => match joined {
            Ok(Ok(result)) => Attempt::Finished(result),
            Ok(Err(e)) => Attempt::Panicked(e.to_string()),
            Err(_) => Attempt::TimedOut,
        },
        _ = cancel.cancelled() => Attempt::Cancelled,
    };

    if matches!(outcome, Attempt::TimedOut | Attempt::Cancelled) {
        attempt_token.cancel();
        task.abort();
    }
    let elapsed = started.elapsed();

    match outcome {
        Attempt::Finished(result) => {
            let result = result.with_elapsed(elapsed).normalized();
            handle.record_attempt(result.succeeded, elapsed);
            if result.succeeded {
                (result, None)
            } else {
                let message = result.error_summary();
                (result, Some((ErrorKind::WorkerInternalError, message)))
            }
        }
        Attempt::Panicked(e) => {
            handle.record_attempt(false, elapsed);
            let message = format!("worker panicked: {}", e);
            (
                WorkerResult::failure(message.clone()).with_elapsed(elapsed),
                Some((ErrorKind::WorkerInternalError, message)),
            )
        }
        Attempt::TimedOut => {
            handle.record_attempt(false, elapsed);
            let message = format!("timed out after {}ms", timeout.as_millis());
            (
                WorkerResult::failure(message.clone()).with_elapsed(elapsed),
                Some((ErrorKind::TimeoutError, message)),
            )
        }
        Attempt::Cancelled => {
            handle.abandon_attempt();
            (
                WorkerResult::failure("attempt cancelled").with_elapsed(elapsed),
                Some((ErrorKind::Cancelled, "attempt cancelled".to_string())),
            )
        }
    }
}
