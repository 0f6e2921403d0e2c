//! Top-level driver: configuration, context, dist, stage graph, run records.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use binship_config::{ConfigError, Project};
use binship_events::events_path;
use binship_git::{SystemGit, VersionControl};
use binship_types::{Artifact, EventType, StageRecord, TerminalState, VersionInfo};
use chrono::{DateTime, Utc};

use crate::build::{CargoCompiler, Compiler};
use crate::context::{BuildOptions, RunContext, StageFailure, build_context};
use crate::dist::{self, RunMetadata};
use crate::error::PipelineError;
use crate::stage::{GraphOutcome, Reporter};
use crate::stages::{build_graph, release_graph};

/// What a finished (or aborted) run looked like.
#[derive(Debug)]
pub struct RunReport {
    pub state: TerminalState,
    pub stages: Vec<StageRecord>,
    pub artifacts: Vec<Artifact>,
    /// `None` when the run ended before the version was resolved.
    pub version: Option<VersionInfo>,
    pub snapshot: bool,
    pub dist: Option<PathBuf>,
    pub error: Option<PipelineError>,
    pub errors: Vec<StageFailure>,
}

impl RunReport {
    fn aborted(error: PipelineError) -> Self {
        Self {
            state: TerminalState::Failed {
                stage: None,
                message: error.to_string(),
            },
            stages: Vec::new(),
            artifacts: Vec::new(),
            version: None,
            snapshot: false,
            dist: None,
            error: Some(error),
            errors: Vec::new(),
        }
    }

    /// 0 completed, 1 failed, 2 configuration error, 124 cancelled.
    pub fn exit_code(&self) -> i32 {
        match &self.state {
            TerminalState::Completed => 0,
            TerminalState::Cancelled { .. } => 124,
            TerminalState::Failed { .. } => {
                if self.error.as_ref().is_some_and(PipelineError::is_configuration) {
                    2
                } else {
                    1
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pipeline {
    Release,
    BuildOnly,
}

pub struct Orchestrator {
    root: PathBuf,
    vcs: Box<dyn VersionControl>,
    compiler: Box<dyn Compiler>,
}

impl Orchestrator {
    pub fn new(
        root: impl Into<PathBuf>,
        vcs: Box<dyn VersionControl>,
        compiler: Box<dyn Compiler>,
    ) -> Self {
        Self {
            root: root.into(),
            vcs,
            compiler,
        }
    }

    /// Git from `PATH` (or `BINSHIP_GIT_BIN`) and cargo as the compiler.
    pub fn system(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self::new(
            root.clone(),
            Box::new(SystemGit::open(root)),
            Box::new(CargoCompiler),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load and validate the configuration without running anything.
    pub fn check(
        &self,
        config: Option<&Path>,
        deprecated: bool,
        reporter: &mut dyn Reporter,
    ) -> Result<Project, ConfigError> {
        let project = Project::load(&self.root, config)?;
        report_deprecations(&project, deprecated, reporter);
        Ok(project)
    }

    /// Every stage: build, archive, checksum, sign, docker, changelog, publish.
    pub fn run(&self, opts: &BuildOptions, reporter: &mut dyn Reporter) -> RunReport {
        self.execute(Pipeline::Release, opts, reporter)
    }

    /// Only the stages up to the build: binaries, no packaging or publishing.
    pub fn build_only(&self, opts: &BuildOptions, reporter: &mut dyn Reporter) -> RunReport {
        self.execute(Pipeline::BuildOnly, opts, reporter)
    }

    fn execute(
        &self,
        pipeline: Pipeline,
        opts: &BuildOptions,
        reporter: &mut dyn Reporter,
    ) -> RunReport {
        let started_at = Utc::now();

        let project = match self.check(opts.config.as_deref(), opts.deprecated, reporter) {
            Ok(project) => project,
            Err(e) => {
                reporter.error(&e.to_string());
                return RunReport::aborted(e.into());
            }
        };

        let ctx = match build_context(project, &self.root, opts, self.vcs.as_ref()) {
            Ok(ctx) => ctx,
            Err(e) => {
                let error = PipelineError::from(e);
                reporter.error(&error.to_string());
                return RunReport::aborted(error);
            }
        };
        reporter.info(&format!(
            "{} {} ({}, parallelism {})",
            ctx.config.project_name,
            ctx.version.version,
            if ctx.snapshot { "snapshot" } else { "release" },
            ctx.parallelism
        ));

        if let Err(e) = dist::prepare(&ctx.dist, ctx.rm_dist) {
            let error = PipelineError::Setup(e);
            reporter.error(&error.to_string());
            return RunReport::aborted(error);
        }

        ctx.record(
            "run",
            EventType::RunStarted {
                version: ctx.version.version.clone(),
                snapshot: ctx.snapshot,
            },
        );

        let mut graph = match pipeline {
            Pipeline::Release => release_graph(self.vcs.as_ref(), self.compiler.as_ref()),
            Pipeline::BuildOnly => build_graph(self.vcs.as_ref(), self.compiler.as_ref()),
        };
        let outcome = graph.execute(&ctx, reporter);

        ctx.record(
            "run",
            EventType::RunFinished {
                state: outcome.state.clone(),
            },
        );
        if let Err(e) = write_records(&ctx, &outcome, started_at) {
            reporter.warn(&format!("failed to write run records: {e:#}"));
        }

        match &outcome.state {
            TerminalState::Completed => reporter.info(&format!(
                "completed in {}: {} artifacts in {}",
                elapsed(started_at),
                ctx.artifacts.len(),
                ctx.dist.display()
            )),
            TerminalState::Failed { message, .. } => reporter.error(&format!("failed: {message}")),
            TerminalState::Cancelled { reason, .. } => {
                reporter.error(&format!("cancelled: {reason}"))
            }
        }

        RunReport {
            state: outcome.state,
            stages: outcome.records,
            artifacts: ctx.artifacts.list(),
            version: Some(ctx.version.clone()),
            snapshot: ctx.snapshot,
            dist: Some(ctx.dist.clone()),
            error: outcome.error,
            errors: ctx.errors.list(),
        }
    }
}

fn report_deprecations(project: &Project, deprecated: bool, reporter: &mut dyn Reporter) {
    let notices = project.deprecations();
    if notices.is_empty() {
        return;
    }
    if deprecated {
        for notice in &notices {
            reporter.warn(&format!("DEPRECATED: {notice}"));
        }
    } else {
        reporter.warn(&format!(
            "configuration uses {} deprecated option(s), run with --deprecated for details",
            notices.len()
        ));
    }
}

/// Wall time since `started_at`, rounded to milliseconds.
fn elapsed(started_at: DateTime<Utc>) -> String {
    let ms = (Utc::now() - started_at).num_milliseconds().max(0) as u64;
    humantime::format_duration(Duration::from_millis(ms)).to_string()
}

fn write_records(
    ctx: &RunContext,
    outcome: &GraphOutcome,
    started_at: DateTime<Utc>,
) -> Result<()> {
    dist::write_artifacts(&ctx.dist, &ctx.artifacts.list())?;
    dist::write_metadata(
        &ctx.dist,
        &RunMetadata {
            project_name: ctx.config.project_name.clone(),
            version: ctx.version.clone(),
            snapshot: ctx.snapshot,
            started_at,
            finished_at: Utc::now(),
            state: outcome.state.clone(),
            stages: outcome.records.clone(),
            errors: ctx.errors.list(),
        },
    )?;
    if let Ok(events) = ctx.events.lock() {
        events.write_to_file(&events_path(&ctx.dist))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use binship_events::EventLog;
    use binship_git::MemoryRepo;
    use binship_types::{ArtifactKind, StageOutcome};
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::build::BuildUnit;
    use crate::stage::test_support::CollectingReporter;

    /// Writes a fake binary instead of compiling.
    struct StubCompiler;

    impl Compiler for StubCompiler {
        fn compile(&self, unit: &BuildUnit, _ctx: &RunContext, out_dir: &Path) -> Result<PathBuf> {
            let path = out_dir.join(unit.binary_name());
            fs::write(&path, unit.id.as_bytes())?;
            Ok(path)
        }
    }

    fn project_dir(config: &str) -> TempDir {
        let td = tempdir().unwrap();
        fs::create_dir_all(td.path().join("src")).unwrap();
        fs::write(td.path().join("src/main.rs"), "fn main() {}\n").unwrap();
        fs::write(td.path().join(".binship.toml"), config).unwrap();
        td
    }

    fn orchestrator(root: &Path, repo: MemoryRepo) -> Orchestrator {
        Orchestrator::new(root, Box::new(repo), Box::new(StubCompiler))
    }

    const BINARY_CONFIG: &str = r#"
project_name = "tool"

[[builds]]
os = ["linux", "darwin"]
arch = ["amd64"]

[archive]
format = "binary"
"#;

    #[test]
    fn snapshot_run_completes_and_writes_records() {
        let td = project_dir(BINARY_CONFIG);
        let mut reporter = CollectingReporter::default();
        let report = orchestrator(td.path(), MemoryRepo::unavailable()).run(
            &BuildOptions {
                snapshot: true,
                parallelism: Some(2),
                ..BuildOptions::default()
            },
            &mut reporter,
        );

        assert_eq!(report.state, TerminalState::Completed, "{:?}", reporter.errors);
        assert_eq!(report.exit_code(), 0);
        assert!(report.snapshot);

        let kinds = |k: ArtifactKind| report.artifacts.iter().filter(|a| a.kind == k).count();
        assert_eq!(kinds(ArtifactKind::Binary), 2);
        assert_eq!(kinds(ArtifactKind::Archive), 2);
        assert_eq!(kinds(ArtifactKind::Checksum), 1);

        let skipped: Vec<_> = report
            .stages
            .iter()
            .filter(|r| r.outcome.is_skipped())
            .map(|r| r.stage.as_str())
            .collect();
        assert_eq!(
            skipped,
            vec!["env", "validate", "before", "sign", "docker", "changelog", "publish"]
        );

        let dist = td.path().join("dist");
        assert_eq!(dist::read_artifacts(&dist).unwrap(), report.artifacts);
        let metadata = dist::read_metadata(&dist).unwrap();
        assert_eq!(metadata.state, TerminalState::Completed);
        assert_eq!(metadata.version.version, "0.0.0-SNAPSHOT-none");
        let events = EventLog::read_from_file(&events_path(&dist)).unwrap();
        assert_eq!(events.started_units().len(), 2);
        assert!(matches!(
            events.all_events().last().map(|e| &e.event_type),
            Some(EventType::RunFinished { .. })
        ));
    }

    #[test]
    fn unknown_field_fails_before_any_stage() {
        let td = project_dir("foo = 1\n");
        let mut reporter = CollectingReporter::default();
        let report = orchestrator(td.path(), MemoryRepo::tagged("v1.0.0"))
            .run(&BuildOptions::default(), &mut reporter);

        assert_eq!(
            report.state,
            TerminalState::Failed {
                stage: None,
                message: "line 1: field foo not found in type Project".to_string()
            }
        );
        assert!(report.stages.is_empty());
        assert_eq!(report.exit_code(), 2);
        assert!(!td.path().join("dist").exists());
    }

    #[test]
    fn zero_parallelism_is_a_configuration_error() {
        let td = project_dir(BINARY_CONFIG);
        let report = orchestrator(td.path(), MemoryRepo::default()).run(
            &BuildOptions {
                snapshot: true,
                parallelism: Some(0),
                ..BuildOptions::default()
            },
            &mut CollectingReporter::default(),
        );
        assert_eq!(report.exit_code(), 2);
    }

    #[test]
    fn non_empty_dist_needs_rm_dist() {
        let td = project_dir(BINARY_CONFIG);
        fs::create_dir_all(td.path().join("dist")).unwrap();
        fs::write(td.path().join("dist/stale"), "x").unwrap();
        let opts = BuildOptions {
            snapshot: true,
            ..BuildOptions::default()
        };

        let report = orchestrator(td.path(), MemoryRepo::default())
            .run(&opts, &mut CollectingReporter::default());
        assert_eq!(report.exit_code(), 1);
        assert!(matches!(report.error, Some(PipelineError::Setup(_))));

        let report = orchestrator(td.path(), MemoryRepo::default()).run(
            &BuildOptions {
                rm_dist: true,
                ..opts
            },
            &mut CollectingReporter::default(),
        );
        assert!(report.state.is_success());
        assert!(!td.path().join("dist/stale").exists());
    }

    #[test]
    fn release_without_tag_fails_with_hint() {
        let td = project_dir(BINARY_CONFIG);
        let report = orchestrator(td.path(), MemoryRepo::default())
            .run(&BuildOptions::default(), &mut CollectingReporter::default());
        assert_eq!(report.exit_code(), 1);
        assert!(matches!(
            report.state,
            TerminalState::Failed { ref message, .. } if message.contains("--snapshot")
        ));
    }

    #[test]
    fn build_only_stops_after_build() {
        let td = project_dir(BINARY_CONFIG);
        let report = orchestrator(td.path(), MemoryRepo::default()).build_only(
            &BuildOptions {
                snapshot: true,
                ..BuildOptions::default()
            },
            &mut CollectingReporter::default(),
        );
        assert!(report.state.is_success());
        let names: Vec<_> = report.stages.iter().map(|r| r.stage.as_str()).collect();
        assert_eq!(names, vec!["env", "validate", "before", "build"]);
        assert!(
            report
                .artifacts
                .iter()
                .all(|a| a.kind == ArtifactKind::Binary)
        );
    }

    #[test]
    fn broken_entry_point_fails_the_build_stage() {
        let td = project_dir(BINARY_CONFIG);
        fs::write(td.path().join("src/main.rs"), "fn main( {}\n").unwrap();
        let report = orchestrator(td.path(), MemoryRepo::default()).run(
            &BuildOptions {
                snapshot: true,
                ..BuildOptions::default()
            },
            &mut CollectingReporter::default(),
        );
        match &report.state {
            TerminalState::Failed { stage, message } => {
                assert_eq!(stage.as_deref(), Some("build"));
                assert!(message.contains("main.rs:1:"), "{message}");
            }
            other => panic!("unexpected state: {other:?}"),
        }
        assert!(report.artifacts.is_empty());
        assert!(matches!(
            report.stages.last().map(|r| &r.outcome),
            Some(StageOutcome::Failed { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn deadline_during_hooks_cancels_the_run() {
        let td = project_dir(&format!(
            "{BINARY_CONFIG}\n[before]\nhooks = [\"sleep 20\"]\n"
        ));
        let started = std::time::Instant::now();
        let report = orchestrator(td.path(), MemoryRepo::default()).run(
            &BuildOptions {
                snapshot: true,
                timeout: Some(Duration::from_millis(300)),
                ..BuildOptions::default()
            },
            &mut CollectingReporter::default(),
        );
        assert!(matches!(report.state, TerminalState::Cancelled { .. }));
        assert_eq!(report.exit_code(), 124);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(
            report
                .artifacts
                .iter()
                .all(|a| a.kind != ArtifactKind::Binary)
        );
    }

    #[test]
    fn deprecated_options_are_reported() {
        let td = project_dir("project_name = \"tool\"\ndist = \"out\"\n");
        let orch = orchestrator(td.path(), MemoryRepo::default());

        let mut reporter = CollectingReporter::default();
        orch.check(None, false, &mut reporter).unwrap();
        assert_eq!(reporter.warns.len(), 1);
        assert!(reporter.warns[0].contains("--deprecated"));

        let mut reporter = CollectingReporter::default();
        orch.check(None, true, &mut reporter).unwrap();
        assert!(reporter.warns[0].starts_with("DEPRECATED: "));
    }

    fn git(dir: &Path, args: &[&str]) {
        let out = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("git");
        assert!(out.status.success(), "git {args:?}: {}", String::from_utf8_lossy(&out.stderr));
    }

    fn init_repo(dir: &Path) {
        git(dir, &["init", "-q"]);
        git(dir, &["config", "user.email", "test@example.com"]);
        git(dir, &["config", "user.name", "Test User"]);
        git(dir, &["config", "commit.gpgsign", "false"]);
        git(dir, &["config", "tag.gpgsign", "false"]);
    }

    fn unvalidated_release(root: &Path) -> (RunReport, String) {
        let orch = Orchestrator::new(
            root,
            Box::new(SystemGit::open(root).with_program("git")),
            Box::new(StubCompiler),
        );
        let mut reporter = CollectingReporter::default();
        let report = orch.run(
            &BuildOptions {
                skip_validate: true,
                skip_publish: true,
                ..BuildOptions::default()
            },
            &mut reporter,
        );
        assert_eq!(report.state, TerminalState::Completed, "{:?}", reporter.errors);
        let changelog = fs::read_to_string(root.join("dist/CHANGELOG.md")).unwrap();
        (report, changelog)
    }

    #[test]
    fn unvalidated_release_without_any_tag_logs_all_commits() {
        let td = project_dir(BINARY_CONFIG);
        init_repo(td.path());
        git(td.path(), &["commit", "-q", "--allow-empty", "-m", "feat: first"]);

        let (report, changelog) = unvalidated_release(td.path());
        assert!(!report.snapshot);
        assert_eq!(report.version.as_ref().map(|v| v.version.as_str()), Some("0.0.0"));
        assert!(changelog.contains("feat: first"), "{changelog}");
    }

    #[test]
    fn unvalidated_release_after_stale_tag_logs_newer_commits() {
        let td = project_dir(BINARY_CONFIG);
        init_repo(td.path());
        git(td.path(), &["commit", "-q", "--allow-empty", "-m", "feat: first"]);
        git(td.path(), &["tag", "v1.0.0"]);
        git(td.path(), &["commit", "-q", "--allow-empty", "-m", "fix: after the tag"]);

        let (report, changelog) = unvalidated_release(td.path());
        assert_eq!(report.version.as_ref().map(|v| v.version.as_str()), Some("1.0.0"));
        assert!(changelog.contains("fix: after the tag"), "{changelog}");
        assert!(!changelog.contains("feat: first"), "{changelog}");
    }
}
