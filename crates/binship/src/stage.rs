//! The stage contract and the linear graph that drives stages in order.

use std::time::Instant;

use anyhow::{Result, anyhow};
use binship_process::StopReason;
use binship_types::{EventType, StageOutcome, StageRecord, TerminalState};

use crate::context::RunContext;
use crate::error::{PipelineError, describe_stop, stop_reason};

pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// One step of the pipeline.
pub trait Stage {
    fn name(&self) -> &'static str;

    /// Why this stage is a no-op for the run, if it is.
    fn skip_reason(&self, _ctx: &RunContext) -> Option<String> {
        None
    }

    fn run(&mut self, ctx: &RunContext, reporter: &mut dyn Reporter) -> Result<()>;
}

#[derive(Debug)]
pub struct GraphOutcome {
    pub records: Vec<StageRecord>,
    pub state: TerminalState,
    pub error: Option<PipelineError>,
}

/// Stages in dependency order.
#[derive(Default)]
pub struct StageGraph<'a> {
    stages: Vec<Box<dyn Stage + 'a>>,
}

impl<'a> StageGraph<'a> {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn then(mut self, stage: impl Stage + 'a) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every stage in order.
    ///
    /// A stage error ends the graph: later stages are never entered. Errors
    /// recorded under fail-soft let the graph finish and then turn the
    /// terminal state into `Failed`.
    pub fn execute(&mut self, ctx: &RunContext, reporter: &mut dyn Reporter) -> GraphOutcome {
        let mut records = Vec::with_capacity(self.stages.len());

        for stage in &mut self.stages {
            let name = stage.name();

            if let Some(reason) = ctx.cancel.stop_reason() {
                return stopped(records, name, reason);
            }

            if let Some(reason) = stage.skip_reason(ctx) {
                reporter.info(&format!("{name}: skipped: {reason}"));
                ctx.record(name, EventType::StageSkipped {
                    reason: reason.clone(),
                });
                records.push(StageRecord {
                    stage: name.to_string(),
                    outcome: StageOutcome::Skipped { reason },
                });
                continue;
            }

            reporter.info(&format!("{name}: running"));
            ctx.record(name, EventType::StageStarted);
            let started = Instant::now();

            match stage.run(ctx, reporter) {
                Ok(()) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    ctx.record(name, EventType::StageFinished { elapsed_ms });
                    records.push(StageRecord {
                        stage: name.to_string(),
                        outcome: StageOutcome::Ran { elapsed_ms },
                    });
                }
                Err(error) => {
                    let message = format!("{error:#}");
                    reporter.error(&format!("{name}: {message}"));
                    ctx.record(name, EventType::StageFailed {
                        message: message.clone(),
                    });
                    records.push(StageRecord {
                        stage: name.to_string(),
                        outcome: StageOutcome::Failed {
                            message: message.clone(),
                        },
                    });

                    if let Some(reason) = stop_reason(&error, &ctx.cancel) {
                        return stopped(records, name, reason);
                    }
                    return GraphOutcome {
                        records,
                        state: TerminalState::Failed {
                            stage: Some(name.to_string()),
                            message,
                        },
                        error: Some(PipelineError::Stage {
                            stage: name.to_string(),
                            error,
                        }),
                    };
                }
            }
        }

        let recorded = ctx.errors.list();
        if let Some(first) = recorded.first() {
            let message = format!(
                "{} error(s) recorded, first in {}: {}",
                recorded.len(),
                first.stage,
                first.message
            );
            return GraphOutcome {
                records,
                state: TerminalState::Failed {
                    stage: Some(first.stage.clone()),
                    message: message.clone(),
                },
                error: Some(PipelineError::Stage {
                    stage: first.stage.clone(),
                    error: anyhow!(message),
                }),
            };
        }

        GraphOutcome {
            records,
            state: TerminalState::Completed,
            error: None,
        }
    }
}

fn stopped(records: Vec<StageRecord>, stage: &str, reason: StopReason) -> GraphOutcome {
    let error = match reason {
        StopReason::DeadlineExceeded => PipelineError::Timeout {
            stage: stage.to_string(),
        },
        StopReason::Cancelled => PipelineError::Cancelled {
            stage: stage.to_string(),
        },
    };
    GraphOutcome {
        records,
        state: TerminalState::Cancelled {
            stage: Some(stage.to_string()),
            reason: describe_stop(reason).to_string(),
        },
        error: Some(error),
    }
}
