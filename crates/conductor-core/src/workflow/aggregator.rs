//! Workflow aggregator: the run's final verdict and performance report.
//!
//! `Completed` only says the scheduler finished. Whether the business
//! result is trustworthy is `overall_success`:
//!
//! ```text
//! overall_success = agent_success_rate    >= min_success_rate     (0.8)
//!               AND quality_gate_pass_rate >= min_gate_pass_rate  (0.8)
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::AggregationConfig;
use crate::error::ErrorKind;
use crate::workflow::instance::{StageState, WorkflowInstance};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Impact {
    High,
    Medium,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub stage: String,
    #[serde(with = "crate::duration_ms")]
    pub elapsed: Duration,
    /// `elapsed / mean stage elapsed`.
    pub ratio: f64,
    pub impact: Impact,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: String,
    #[serde(with = "crate::duration_ms")]
    pub elapsed: Duration,
}

/// Confidence buckets over succeeded stages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityDistribution {
    /// `>= 0.9`
    pub excellent: usize,
    /// `>= 0.8`
    pub good: usize,
    /// `>= 0.7`
    pub acceptable: usize,
    pub poor: usize,
}

impl QualityDistribution {
    fn add(&mut self, confidence: f64) {
        if confidence >= 0.9 {
            self.excellent += 1;
        } else if confidence >= 0.8 {
            self.good += 1;
        } else if confidence >= 0.7 {
            self.acceptable += 1;
        } else {
            self.poor += 1;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub total_stages: usize,
    pub succeeded_stages: usize,
    pub failed_stages: usize,
    pub skipped_stages: usize,

    pub agent_success_rate: f64,
    /// Mean of `weight × confidence` over stages with a result.
    pub overall_confidence: f64,
    pub gates_evaluated: usize,
    pub gates_passed: usize,
    pub quality_gate_pass_rate: f64,
    pub overall_success: bool,

    #[serde(with = "crate::duration_ms")]
    pub total_elapsed: Duration,
    pub bottlenecks: Vec<Bottleneck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fastest_stage: Option<StageTiming>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slowest_stage: Option<StageTiming>,
    /// `1 − variance / mean²` of stage times, clamped to `[0, 1]`.
    pub load_balance_score: f64,
    pub quality_distribution: QualityDistribution,

    pub retry_counts: BTreeMap<String, u32>,
    pub total_retries: u32,
    pub error_counts: BTreeMap<String, usize>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowAggregator {
    config: AggregationConfig,
}

impl WorkflowAggregator {
    pub fn new(config: AggregationConfig) -> Self {
        Self { config }
    }

    /// Build the report for a finished run. `weight_of` maps a worker id to
    /// its confidence weight.
    pub fn aggregate<F>(
        &self,
        instance: &WorkflowInstance,
        weight_of: F,
        total_elapsed: Duration,
    ) -> WorkflowReport
    where
        F: Fn(&str) -> f64,
    {
        let cfg = &self.config;
        let states = instance.stage_states();
        let total_stages = states.len();
        let count = |want: StageState| states.values().filter(|s| **s == want).count();
        let succeeded_stages = count(StageState::Succeeded);
        let failed_stages = count(StageState::Failed);
        let skipped_stages = count(StageState::Skipped);

        let agent_success_rate = ratio(succeeded_stages, total_stages, 0.0);

        // Mean of weight × confidence over every stage that produced a
        // result, i.e. Σ(w·c)/n. The weight discounts a worker's confidence;
        // it does not re-weight the mean. Failed results carry confidence 0,
        // so a run with no success scores 0.
        let mut weighted = Vec::new();
        let mut distribution = QualityDistribution::default();
        for stage in &instance.template().stages {
            let Some(result) = instance.result(&stage.name) else {
                continue;
            };
            weighted.push(weight_of(&stage.worker_id) * result.confidence);
            if result.succeeded {
                distribution.add(result.confidence);
            }
        }
        let overall_confidence = if weighted.is_empty() {
            0.0
        } else {
            (weighted.iter().sum::<f64>() / weighted.len() as f64).clamp(0.0, 1.0)
        };

        let gates_evaluated = instance.gate_outcomes().len();
        let gates_passed = instance.gate_outcomes().values().filter(|g| g.passed).count();
        let quality_gate_pass_rate = ratio(gates_passed, gates_evaluated, 1.0);

        let overall_success = agent_success_rate >= cfg.min_success_rate
            && quality_gate_pass_rate >= cfg.min_gate_pass_rate;

        // Timing analysis over stages that actually ran.
        let timings: Vec<(&String, Duration)> =
            instance.timings().iter().map(|(k, v)| (k, *v)).collect();
        let bottlenecks = self.bottlenecks(&timings);
        let fastest_stage = timings
            .iter()
            .min_by_key(|(_, d)| *d)
            .map(|(s, d)| StageTiming { stage: (*s).clone(), elapsed: *d });
        let slowest_stage = timings
            .iter()
            .max_by_key(|(_, d)| *d)
            .map(|(s, d)| StageTiming { stage: (*s).clone(), elapsed: *d });
        let load_balance_score = load_balance(&timings);

        let retry_counts = instance.retry_counts().clone();
        let total_retries = retry_counts.values().sum();

        let mut error_counts = BTreeMap::new();
        for e in instance.errors() {
            *error_counts.entry(e.kind.to_string()).or_insert(0) += 1;
        }

        let mut report = WorkflowReport {
            total_stages,
            succeeded_stages,
            failed_stages,
            skipped_stages,
            agent_success_rate,
            overall_confidence,
            gates_evaluated,
            gates_passed,
            quality_gate_pass_rate,
            overall_success,
            total_elapsed,
            bottlenecks,
            fastest_stage,
            slowest_stage,
            load_balance_score,
            quality_distribution: distribution,
            retry_counts,
            total_retries,
            error_counts,
            recommendations: Vec::new(),
        };
        report.recommendations = self.recommendations(instance, &report);

        tracing::info!(
            "[Aggregator] {}: success_rate={:.2} confidence={:.2} gate_pass_rate={:.2} overall_success={}",
            instance.id(),
            report.agent_success_rate,
            report.overall_confidence,
            report.quality_gate_pass_rate,
            report.overall_success
        );
        report
    }

    fn bottlenecks(&self, timings: &[(&String, Duration)]) -> Vec<Bottleneck> {
        if timings.is_empty() {
            return Vec::new();
        }
        let secs: Vec<f64> = timings.iter().map(|(_, d)| d.as_secs_f64()).collect();
        let mean = secs.iter().sum::<f64>() / secs.len() as f64;
        if mean <= 0.0 {
            return Vec::new();
        }
        let max = secs.iter().cloned().fold(0.0_f64, f64::max);

        let mut out: Vec<Bottleneck> = timings
            .iter()
            .zip(&secs)
            .filter(|(_, s)| **s > self.config.bottleneck_factor * mean)
            .map(|((stage, elapsed), s)| Bottleneck {
                stage: (*stage).clone(),
                elapsed: *elapsed,
                ratio: s / mean,
                impact: if *s >= max { Impact::High } else { Impact::Medium },
            })
            .collect();
        out.sort_by(|a, b| b.elapsed.cmp(&a.elapsed));
        out
    }

    fn recommendations(&self, instance: &WorkflowInstance, report: &WorkflowReport) -> Vec<String> {
        let cfg = &self.config;
        let mut recs = Vec::new();

        if report.agent_success_rate < cfg.reliability_warning_rate {
            let failed: Vec<&str> = instance
                .stage_states()
                .iter()
                .filter(|(_, s)| matches!(s, StageState::Failed | StageState::Skipped))
                .map(|(name, _)| name.as_str())
                .collect();
            recs.push(format!(
                "Improve stage reliability: {} of {} stage(s) did not succeed ({})",
                report.total_stages - report.succeeded_stages,
                report.total_stages,
                failed.join(", ")
            ));
        }

        if report.overall_confidence < cfg.low_confidence_threshold {
            recs.push(format!(
                "Overall confidence {:.2} is below {:.2}; review low-confidence stage outputs",
                report.overall_confidence, cfg.low_confidence_threshold
            ));
        }

        // A failed stage's miss is covered by the reliability advice above.
        for (stage, outcome) in instance.gate_outcomes() {
            if !outcome.passed && instance.stage_state(stage) == Some(StageState::Succeeded) {
                recs.push(format!(
                    "Stage {} failed its quality gate '{}' ({} = {:.2} < {:.2}); consider relaxing its threshold or reviewing its input",
                    stage, outcome.gate_id, outcome.metric, outcome.observed, outcome.threshold
                ));
            }
        }

        for b in &report.bottlenecks {
            recs.push(format!(
                "Stage {} is a bottleneck ({}ms, {:.1}x the mean stage time); consider optimizing or splitting it",
                b.stage,
                b.elapsed.as_millis(),
                b.ratio
            ));
        }

        if report.total_retries > cfg.excessive_retry_count {
            let retried: Vec<String> = report
                .retry_counts
                .iter()
                .map(|(s, n)| format!("{} x{}", s, n))
                .collect();
            recs.push(format!(
                "High error recovery usage: {} retries ({}); investigate flaky workers",
                report.total_retries,
                retried.join(", ")
            ));
        }

        if instance.errors_of_kind(ErrorKind::CycleBreakWarning).next().is_some() {
            let edges: Vec<String> =
                instance.plan().broken_edges.iter().map(ToString::to_string).collect();
            recs.push(format!(
                "Template has a dependency cycle; broken edge(s): {}",
                edges.join(", ")
            ));
        }

        recs
    }
}

fn ratio(num: usize, den: usize, empty: f64) -> f64 {
    if den == 0 {
        empty
    } else {
        num as f64 / den as f64
    }
}

fn load_balance(timings: &[(&String, Duration)]) -> f64 {
    if timings.len() < 2 {
        return 1.0;
    }
    let secs: Vec<f64> = timings.iter().map(|(_, d)| d.as_secs_f64()).collect();
    let n = secs.len() as f64;
    let mean = secs.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        return 1.0;
    }
    let variance = secs.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    (1.0 - variance / (mean * mean)).clamp(0.0, 1.0)
}
