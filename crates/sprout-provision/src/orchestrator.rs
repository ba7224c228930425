//! Step selection and fail-fast execution

use std::fmt;
use std::time::{Duration, Instant};

use crate::catalogue::{Catalogue, Phase, Step, StepContext};
use crate::config::NodeConfig;
use crate::error::{ProvisionError, Result};
use crate::runlog::{EventKind, StepEvent};

/// Where a step ended up in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Skipped,
    Failed,
    /// Not attempted because an earlier step failed
    NotRun,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::NotRun => "not run",
        })
    }
}

/// Outcome of one step
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub id: &'static str,
    pub name: &'static str,
    pub phase: Phase,
    pub status: StepStatus,
    pub elapsed: Option<Duration>,
    /// Message, skip reason or error text
    pub detail: Option<String>,
}

/// The step that stopped the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub id: &'static str,
    pub phase: Phase,
    pub error: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step '{}' ({}) failed: {}", self.id, self.phase, self.error)
    }
}

/// Result of a whole run
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub records: Vec<StepRecord>,
    pub failure: Option<Failure>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    pub fn record(&self, id: &str) -> Option<&StepRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn status(&self, id: &str) -> Option<StepStatus> {
        self.record(id).map(|r| r.status)
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }

    pub fn elapsed(&self) -> Duration {
        self.records.iter().filter_map(|r| r.elapsed).sum()
    }
}

/// Receives step transitions as they happen
pub trait ProgressSink {
    fn event(&mut self, event: &StepEvent);
}

impl ProgressSink for Vec<StepEvent> {
    fn event(&mut self, event: &StepEvent) {
        self.push(event.clone());
    }
}

/// Operator-supplied enabled/disabled step lists
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepFilter {
    enabled: Vec<String>,
    disabled: Vec<String>,
}

impl StepFilter {
    pub fn new(
        enabled: impl IntoIterator<Item = impl Into<String>>,
        disabled: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            enabled: enabled.into_iter().map(Into::into).collect(),
            disabled: disabled.into_iter().map(Into::into).collect(),
        }
    }

    /// Build from `ENABLED_STEPS` / `DISABLED_STEPS`, rejecting conflicts and unknown ids
    pub fn from_config(config: &NodeConfig, catalogue: &Catalogue) -> Result<Self> {
        let filter = Self::new(&config.enabled_steps, &config.disabled_steps);
        let errors = filter.errors(catalogue);
        if errors.is_empty() {
            Ok(filter)
        } else {
            Err(ProvisionError::Config(errors))
        }
    }

    /// Every problem with the lists, in the order they were written
    pub fn errors(&self, catalogue: &Catalogue) -> Vec<String> {
        let mut errors = Vec::new();
        for id in &self.enabled {
            if self.disabled.contains(id) {
                errors.push(format!("step '{id}' is both enabled and disabled"));
            }
        }
        for (key, ids) in [
            ("ENABLED_STEPS", &self.enabled),
            ("DISABLED_STEPS", &self.disabled),
        ] {
            for id in ids.iter().filter(|id| !catalogue.contains(id)) {
                errors.push(format!("unknown step '{id}' in {key}"));
            }
        }
        errors
    }

    /// Reason the filter excludes `id`, if it does
    pub fn exclusion(&self, id: &str) -> Option<&'static str> {
        if !self.enabled.is_empty() {
            (!self.enabled.iter().any(|e| e == id)).then_some("not in ENABLED_STEPS")
        } else if self.disabled.iter().any(|d| d == id) {
            Some("listed in DISABLED_STEPS")
        } else {
            None
        }
    }
}

/// A validated plan ready to execute
#[derive(Debug, Clone)]
pub struct Orchestrator {
    catalogue: Catalogue,
    filter: StepFilter,
}

impl Orchestrator {
    /// Check the configuration against the catalogue.
    ///
    /// All problems are reported together; nothing runs when any exist.
    pub fn plan(catalogue: Catalogue, config: &NodeConfig) -> Result<Self> {
        let filter = StepFilter::new(&config.enabled_steps, &config.disabled_steps);
        let mut errors = filter.errors(&catalogue);
        errors.extend(config.validate());
        if !errors.is_empty() {
            return Err(ProvisionError::Config(errors));
        }
        Ok(Self { catalogue, filter })
    }

    pub fn catalogue(&self) -> &Catalogue {
        &self.catalogue
    }

    /// Why `step` would be skipped for `config`, before running anything
    pub fn skip_reason(&self, step: &Step, config: &NodeConfig) -> Option<&'static str> {
        self.filter
            .exclusion(step.id)
            .or_else(|| step.skip_reason(config))
    }

    /// Execute the plan, stopping at the first failure
    pub fn run(&self, ctx: &mut StepContext<'_>, sink: &mut dyn ProgressSink) -> RunReport {
        let steps = self.catalogue.steps();
        let mut report = RunReport {
            records: steps
                .iter()
                .map(|s| StepRecord {
                    id: s.id,
                    name: s.name,
                    phase: s.phase,
                    status: StepStatus::Pending,
                    elapsed: None,
                    detail: None,
                })
                .collect(),
            failure: None,
        };

        tracing::info!(steps = steps.len(), mode = %ctx.exec.mode(), "starting run");
        for step in steps {
            emit(sink, StepEvent::new(EventKind::Plan, step.id, step.phase, step.name));
        }

        for (step, record) in steps.iter().zip(report.records.iter_mut()) {
            if let Some(failure) = &report.failure {
                record.status = StepStatus::NotRun;
                let detail = format!("not attempted after '{}' failed", failure.id);
                emit(sink, StepEvent::new(EventKind::NotRun, step.id, step.phase, &detail));
                record.detail = Some(detail);
                continue;
            }

            if let Some(reason) = self.skip_reason(step, ctx.config) {
                record.status = StepStatus::Skipped;
                record.detail = Some(reason.to_string());
                emit(sink, StepEvent::new(EventKind::Skip, step.id, step.phase, reason));
                continue;
            }

            record.status = StepStatus::Running;
            emit(
                sink,
                StepEvent::new(EventKind::Start, step.id, step.phase, step.description),
            );
            let started = Instant::now();
            let result = (step.action)(ctx);
            record.elapsed = Some(started.elapsed());

            match result {
                Ok(outcome) => {
                    record.status = StepStatus::Completed;
                    let detail = outcome.message.unwrap_or_default();
                    emit(sink, StepEvent::new(EventKind::Done, step.id, step.phase, &detail));
                    record.detail = (!detail.is_empty()).then_some(detail);
                }
                Err(e) => {
                    record.status = StepStatus::Failed;
                    let error = e.to_string();
                    emit(sink, StepEvent::new(EventKind::Fail, step.id, step.phase, &error));
                    record.detail = Some(error.clone());
                    report.failure = Some(Failure {
                        id: step.id,
                        phase: step.phase,
                        error,
                    });
                }
            }
        }

        let summary = format!(
            "{} completed, {} skipped, {} failed, {} not run",
            report.count(StepStatus::Completed),
            report.count(StepStatus::Skipped),
            report.count(StepStatus::Failed),
            report.count(StepStatus::NotRun),
        );
        emit(sink, StepEvent::complete(summary));
        report
    }
}

fn emit(sink: &mut dyn ProgressSink, event: StepEvent) {
    if event.kind == EventKind::Fail {
        tracing::error!("{event}");
    } else {
        tracing::info!("{event}");
    }
    sink.event(&event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::{StepOutcome, StepResult};
    use crate::disks::SelectAll;
    use crate::exec::{MockExecutor, MockFixture};

    fn ok_step(_: &mut StepContext<'_>) -> StepResult {
        Ok(StepOutcome::message("fine"))
    }

    fn failing_step(_: &mut StepContext<'_>) -> StepResult {
        Err(ProvisionError::step("boom"))
    }

    fn step(id: &'static str, action: fn(&mut StepContext<'_>) -> StepResult) -> Step {
        Step {
            id,
            name: id,
            description: id,
            phase: Phase::PreCluster,
            skip: None,
            action,
        }
    }

    fn catalogue() -> Catalogue {
        Catalogue::new(vec![
            step("A", ok_step),
            step("B", ok_step),
            step("C", ok_step),
            step("D", ok_step),
        ])
        .unwrap()
    }

    fn config(enabled: &[&str], disabled: &[&str]) -> NodeConfig {
        let mut config = NodeConfig::test_config();
        config.enabled_steps = enabled.iter().map(ToString::to_string).collect();
        config.disabled_steps = disabled.iter().map(ToString::to_string).collect();
        config
    }

    #[test]
    fn test_enabled_list_keeps_catalogue_order() {
        let config = config(&["C", "A"], &[]);
        let orchestrator = Orchestrator::plan(catalogue(), &config).unwrap();
        let exec = MockExecutor::new(MockFixture::new());
        let mut ctx = StepContext::new(&config, &exec, &SelectAll);
        let mut events: Vec<StepEvent> = Vec::new();
        let report = orchestrator.run(&mut ctx, &mut events);

        let started: Vec<_> = events
            .iter()
            .filter(|e| e.kind == EventKind::Start)
            .map(|e| e.step.as_str())
            .collect();
        assert_eq!(started, vec!["A", "C"]);
        assert_eq!(
            report.record("B").unwrap().detail.as_deref(),
            Some("not in ENABLED_STEPS")
        );
    }

    #[test]
    fn test_disabled_list_skips() {
        let config = config(&[], &["B"]);
        let orchestrator = Orchestrator::plan(catalogue(), &config).unwrap();
        let exec = MockExecutor::new(MockFixture::new());
        let mut ctx = StepContext::new(&config, &exec, &SelectAll);
        let report = orchestrator.run(&mut ctx, &mut Vec::new());
        assert_eq!(report.status("B"), Some(StepStatus::Skipped));
        assert_eq!(report.count(StepStatus::Completed), 3);
    }

    #[test]
    fn test_unknown_ids_reported_together() {
        let config = config(&["A", "nope"], &["B", "also-nope"]);
        let Err(ProvisionError::Config(errors)) = Orchestrator::plan(catalogue(), &config) else {
            panic!("expected configuration error");
        };
        assert_eq!(
            errors,
            vec![
                "unknown step 'nope' in ENABLED_STEPS",
                "unknown step 'also-nope' in DISABLED_STEPS",
            ]
        );
    }

    #[test]
    fn test_failure_stops_run() {
        let catalogue = Catalogue::new(vec![
            step("A", ok_step),
            step("B", failing_step),
            step("C", ok_step),
            step("D", ok_step),
        ])
        .unwrap();
        let config = config(&[], &[]);
        let orchestrator = Orchestrator::plan(catalogue, &config).unwrap();
        let exec = MockExecutor::new(MockFixture::new());
        let mut ctx = StepContext::new(&config, &exec, &SelectAll);
        let mut events: Vec<StepEvent> = Vec::new();
        let report = orchestrator.run(&mut ctx, &mut events);

        assert_eq!(
            report.failure,
            Some(Failure {
                id: "B",
                phase: Phase::PreCluster,
                error: "boom".into()
            })
        );
        assert_eq!(report.status("C"), Some(StepStatus::NotRun));
        assert_eq!(report.status("D"), Some(StepStatus::NotRun));
        assert!(report.record("C").unwrap().elapsed.is_none());
        assert!(
            !events
                .iter()
                .any(|e| e.kind == EventKind::Start && (e.step == "C" || e.step == "D"))
        );
        assert_eq!(events.last().unwrap().kind, EventKind::Complete);
    }

    #[test]
    fn test_plan_includes_config_validation() {
        let mut config = config(&[], &[]);
        config.first_node = false;
        let err = Orchestrator::plan(catalogue(), &config).unwrap_err();
        assert!(err.to_string().contains("SERVER_IP"));
    }
}
