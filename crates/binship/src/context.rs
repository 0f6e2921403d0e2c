//! The per-run execution context and the single place where command-line
//! options are turned into it.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use binship_config::Project;
use binship_events::EventLog;
use binship_git::VersionControl;
use binship_process::CancelToken;
use binship_types::{Artifact, ArtifactKind, EventType, FailurePolicy, RunEvent, VersionInfo};
use serde::{Deserialize, Serialize};

use crate::error::ContextError;
use crate::template::TemplateVars;
use crate::version::{SnapshotMode, VersionResolver};

/// Execution modifiers as given on the command line.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub config: Option<PathBuf>,
    pub snapshot: bool,
    pub snapshot_auto: bool,
    pub skip_validate: bool,
    pub skip_post_hooks: bool,
    pub skip_publish: bool,
    pub skip_sign: bool,
    pub skip_docker: bool,
    /// `None` means one worker per available CPU.
    pub parallelism: Option<usize>,
    pub rm_dist: bool,
    pub timeout: Option<Duration>,
    pub fail_soft: bool,
    pub deprecated: bool,
}

/// Append-only, thread-safe artifact registry.
#[derive(Debug, Default)]
pub struct Artifacts {
    items: Mutex<Vec<Artifact>>,
}

impl Artifacts {
    pub fn add(&self, artifact: Artifact) {
        if let Ok(mut items) = self.items.lock() {
            items.push(artifact);
        }
    }

    pub fn list(&self) -> Vec<Artifact> {
        self.items.lock().map(|i| i.clone()).unwrap_or_default()
    }

    pub fn by_kind(&self, kind: ArtifactKind) -> Vec<Artifact> {
        self.items
            .lock()
            .map(|i| i.iter().filter(|a| a.kind == kind).cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|i| i.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: String,
    pub message: String,
}

/// Failures recorded under fail-soft instead of aborting the run.
#[derive(Debug, Default)]
pub struct ErrorLog {
    items: Mutex<Vec<StageFailure>>,
}

impl ErrorLog {
    pub fn add(&self, stage: &str, message: impl Into<String>) {
        if let Ok(mut items) = self.items.lock() {
            items.push(StageFailure {
                stage: stage.to_string(),
                message: message.into(),
            });
        }
    }

    pub fn list(&self) -> Vec<StageFailure> {
        self.items.lock().map(|i| i.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|i| i.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared state for one run. Built once by [`build_context`], then only read
/// (or appended to) by stages.
#[derive(Debug)]
pub struct RunContext {
    pub config: Project,
    pub root: PathBuf,
    /// Absolute output directory.
    pub dist: PathBuf,
    pub version: VersionInfo,
    pub snapshot: bool,
    pub skip_validate: bool,
    pub skip_post_build_hooks: bool,
    pub skip_token_check: bool,
    pub skip_publish: bool,
    pub skip_sign: bool,
    pub skip_docker: bool,
    pub rm_dist: bool,
    pub parallelism: usize,
    pub timeout: Option<Duration>,
    pub failure_policy: FailurePolicy,
    pub deprecated: bool,
    pub artifacts: Artifacts,
    pub errors: ErrorLog,
    pub cancel: CancelToken,
    pub events: Mutex<EventLog>,
    pub release_notes: Mutex<Option<String>>,
}

impl RunContext {
    /// Variables for templates evaluated in this run.
    pub fn template_vars(&self) -> TemplateVars {
        TemplateVars::for_release(&self.config.project_name, &self.version, self.snapshot)
            .with("dist", self.dist.display().to_string())
            .with_env(&self.config.env)
    }

    pub fn record(&self, stage: &str, event_type: EventType) {
        if let Ok(mut log) = self.events.lock() {
            log.record(RunEvent::now(stage, event_type));
        }
    }

    pub fn fail_soft(&self) -> bool {
        self.failure_policy == FailurePolicy::FailSoft
    }

    pub fn release_notes(&self) -> Option<String> {
        self.release_notes.lock().ok().and_then(|n| n.clone())
    }

    pub fn set_release_notes(&self, notes: String) {
        if let Ok(mut slot) = self.release_notes.lock() {
            *slot = Some(notes);
        }
    }
}

/// Derive the run context from configuration, options and repository state.
///
/// Direct flags are applied first; the implications (`snapshot` ⇒
/// skip validate and token check, `skip_post_hooks` ⇒ skip token check) are
/// applied after them, so the order options were given in never matters.
pub fn build_context(
    config: Project,
    root: &Path,
    opts: &BuildOptions,
    vcs: &dyn VersionControl,
) -> Result<RunContext, ContextError> {
    config.validate()?;

    let parallelism = match opts.parallelism {
        Some(0) => return Err(ContextError::InvalidParallelism),
        Some(n) => n,
        None => num_cpus::get().max(1),
    };

    let mode = if opts.snapshot {
        SnapshotMode::Forced
    } else if opts.snapshot_auto {
        SnapshotMode::Auto
    } else {
        SnapshotMode::Off
    };
    let resolution = VersionResolver::new(vcs)
        .with_snapshot_template(config.snapshot.name_template.clone())
        .allow_untagged(opts.skip_validate)
        .resolve(mode)?;

    let mut skip_validate = opts.skip_validate;
    let skip_post_build_hooks = opts.skip_post_hooks;
    let mut skip_token_check = false;

    if resolution.snapshot {
        skip_validate = true;
        skip_token_check = true;
    }
    if opts.skip_post_hooks {
        skip_token_check = true;
    }

    let cancel = match opts.timeout {
        Some(budget) => CancelToken::with_timeout(budget),
        None => CancelToken::new(),
    };

    let dist = root.join(config.dist_dir());

    Ok(RunContext {
        root: root.to_path_buf(),
        dist,
        version: resolution.info,
        snapshot: resolution.snapshot,
        skip_validate,
        skip_post_build_hooks,
        skip_token_check,
        skip_publish: opts.skip_publish,
        skip_sign: opts.skip_sign,
        skip_docker: opts.skip_docker,
        rm_dist: opts.rm_dist,
        parallelism,
        timeout: opts.timeout,
        failure_policy: if opts.fail_soft {
            FailurePolicy::FailSoft
        } else {
            FailurePolicy::FailFast
        },
        deprecated: opts.deprecated,
        artifacts: Artifacts::default(),
        errors: ErrorLog::default(),
        cancel,
        events: Mutex::new(EventLog::new()),
        release_notes: Mutex::new(None),
        config,
    })
}
