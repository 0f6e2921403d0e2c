//! Run event logging for binship.
//!
//! An append-only JSONL log of what happened during a run: stages entered,
//! skipped and finished, build units started and completed, hooks executed
//! and the terminal state. The orchestrator writes it to
//! `<dist>/events.jsonl` when the run ends.
//!
//! # Example
//!
//! ```
//! use binship_events::EventLog;
//! use binship_types::{EventType, RunEvent};
//!
//! let mut log = EventLog::new();
//! log.record(RunEvent::now("build", EventType::StageStarted));
//! assert_eq!(log.events_for_stage("build").len(), 1);
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use binship_types::{EventType, RunEvent, TerminalState};

/// Default events file name
pub const EVENTS_FILE: &str = "events.jsonl";

/// Get the events file path for a dist directory
pub fn events_path(dist_dir: &Path) -> PathBuf {
    dist_dir.join(EVENTS_FILE)
}

/// Append-only event log for a pipeline run.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<RunEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: RunEvent) {
        self.events.push(event);
    }

    /// Write the log to `path`, one JSON object per line, replacing any
    /// log a previous run left there.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }
        fs::write(path, self.to_jsonl()?)
            .with_context(|| format!("failed to write events file {}", path.display()))
    }

    /// Load a log written by [`EventLog::write_to_file`]; a missing file is
    /// an empty log.
    pub fn read_from_file(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read events file {}", path.display()));
            }
        };
        Self::from_jsonl(&content)
            .with_context(|| format!("invalid events file {}", path.display()))
    }

    pub fn to_jsonl(&self) -> Result<String> {
        let mut out = String::new();
        for event in &self.events {
            let line = serde_json::to_string(event).with_context(|| {
                format!(
                    "failed to serialize {} event of stage {}",
                    event_name(&event.event_type),
                    event.stage
                )
            })?;
            out.push_str(&line);
            out.push('\n');
        }
        Ok(out)
    }

    /// Parse JSON lines. Blank lines are ignored; nothing may follow the
    /// `run_finished` event.
    pub fn from_jsonl(content: &str) -> Result<Self> {
        let mut log = Self::new();
        let mut finished = false;
        for (idx, line) in content.lines().enumerate() {
            let lineno = idx + 1;
            if line.trim().is_empty() {
                continue;
            }
            let event: RunEvent = serde_json::from_str(line)
                .with_context(|| format!("line {lineno}: failed to parse event JSON"))?;
            if finished {
                bail!(
                    "line {lineno}: {} event after run_finished",
                    event_name(&event.event_type)
                );
            }
            finished = matches!(event.event_type, EventType::RunFinished { .. });
            log.record(event);
        }
        Ok(log)
    }

    /// State recorded by the closing `run_finished` event, if the run got that far.
    pub fn terminal_state(&self) -> Option<&TerminalState> {
        match self.events.last().map(|e| &e.event_type) {
            Some(EventType::RunFinished { state }) => Some(state),
            _ => None,
        }
    }

    pub fn events_for_stage(&self, stage: &str) -> Vec<&RunEvent> {
        self.events.iter().filter(|e| e.stage == stage).collect()
    }

    /// Units that reported `unit_started`, in order.
    pub fn started_units(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match &e.event_type {
                EventType::UnitStarted { unit } => Some(unit.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Units that reported `unit_failed`, with their messages.
    pub fn failed_units(&self) -> Vec<(&str, &str)> {
        self.events
            .iter()
            .filter_map(|e| match &e.event_type {
                EventType::UnitFailed { unit, message } => Some((unit.as_str(), message.as_str())),
                _ => None,
            })
            .collect()
    }

    pub fn all_events(&self) -> &[RunEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// The `type` tag an event is serialized with.
fn event_name(event: &EventType) -> &'static str {
    match event {
        EventType::RunStarted { .. } => "run_started",
        EventType::StageStarted => "stage_started",
        EventType::StageSkipped { .. } => "stage_skipped",
        EventType::StageFinished { .. } => "stage_finished",
        EventType::StageFailed { .. } => "stage_failed",
        EventType::UnitStarted { .. } => "unit_started",
        EventType::UnitFinished { .. } => "unit_finished",
        EventType::UnitFailed { .. } => "unit_failed",
        EventType::HookExecuted { .. } => "hook_executed",
        EventType::RunFinished { .. } => "run_finished",
    }
}
