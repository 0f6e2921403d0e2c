use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use binship::{BuildOptions, CONFIG_FILE, Orchestrator, Project, Reporter, RunReport};

#[derive(Parser, Debug)]
#[command(name = "binship", version)]
#[command(about = "Cross-compile, package, sign and publish Rust binaries")]
struct Cli {
    /// Project root (default: current directory)
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Project file (default: <root>/.binship.toml)
    #[arg(long, short = 'f', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile every configured platform into the dist directory; no packaging or publishing.
    Build(RunArgs),
    /// Run the whole pipeline: build, archive, checksum, sign, docker, changelog, publish.
    Release(RunArgs),
    /// Parse and validate the project file, then print the build matrix.
    Check {
        /// Print each deprecated option instead of a summary.
        #[arg(long)]
        deprecated: bool,
    },
    /// Write a starter project file.
    Init,
    /// Print shell completions to stdout.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Build a snapshot: no tag required, nothing published.
    #[arg(long)]
    snapshot: bool,

    /// Snapshot unless HEAD is a clean, tagged commit.
    #[arg(long, conflicts_with = "snapshot")]
    snapshot_auto: bool,

    /// Skip the git state checks.
    #[arg(long)]
    skip_validate: bool,

    /// Skip per-build post hooks (also skips the token check).
    #[arg(long)]
    skip_post_hooks: bool,

    #[arg(long)]
    skip_publish: bool,

    #[arg(long)]
    skip_sign: bool,

    #[arg(long)]
    skip_docker: bool,

    /// Concurrent build units (default: number of CPUs).
    #[arg(long, short = 'p')]
    parallelism: Option<usize>,

    /// Remove a non-empty dist directory first.
    #[arg(long)]
    rm_dist: bool,

    /// Deadline for the whole run (e.g. 30m, 90s).
    #[arg(long)]
    timeout: Option<String>,

    /// Keep going after publish and hook failures; the run still fails at the end.
    #[arg(long)]
    fail_soft: bool,

    /// Print each deprecated option instead of a summary.
    #[arg(long)]
    deprecated: bool,
}

impl RunArgs {
    fn into_options(self, config: Option<PathBuf>) -> Result<BuildOptions> {
        Ok(BuildOptions {
            config,
            snapshot: self.snapshot,
            snapshot_auto: self.snapshot_auto,
            skip_validate: self.skip_validate,
            skip_post_hooks: self.skip_post_hooks,
            skip_publish: self.skip_publish,
            skip_sign: self.skip_sign,
            skip_docker: self.skip_docker,
            parallelism: self.parallelism,
            rm_dist: self.rm_dist,
            timeout: self.timeout.as_deref().map(parse_duration).transpose()?,
            fail_soft: self.fail_soft,
            deprecated: self.deprecated,
        })
    }
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut reporter = CliReporter;

    match cli.cmd {
        Commands::Build(args) => {
            let opts = args.into_options(cli.config)?;
            let report = Orchestrator::system(&cli.root).build_only(&opts, &mut reporter);
            finish(&report);
        }
        Commands::Release(args) => {
            let opts = args.into_options(cli.config)?;
            let report = Orchestrator::system(&cli.root).run(&opts, &mut reporter);
            finish(&report);
        }
        Commands::Check { deprecated } => {
            let orchestrator = Orchestrator::system(&cli.root);
            match orchestrator.check(cli.config.as_deref(), deprecated, &mut reporter) {
                Ok(project) => print_check(&project),
                Err(e) => {
                    reporter.error(&e.to_string());
                    std::process::exit(2);
                }
            }
        }
        Commands::Init => {
            let path = init(&cli.root, cli.config.as_deref())?;
            reporter.info(&format!("wrote {}", path.display()));
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "binship", &mut io::stdout());
        }
    }

    Ok(())
}

fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s).with_context(|| format!("invalid duration: {s}"))
}

/// Print the report and exit with its code when the run did not complete.
fn finish(report: &RunReport) {
    print_report(report);
    let code = report.exit_code();
    if code != 0 {
        std::process::exit(code);
    }
}

fn print_report(report: &RunReport) {
    if let Some(version) = &report.version {
        let kind = if report.snapshot { "snapshot" } else { "release" };
        println!("version: {} ({kind})", version.version);
    }
    println!("state:   {}", report.state);
    if let Some(dist) = &report.dist {
        println!("dist:    {}", dist.display());
    }
    if report.stages.is_empty() {
        return;
    }
    println!();

    for record in &report.stages {
        println!("{:<10} {}", record.stage, record.outcome);
    }
    if !report.artifacts.is_empty() {
        println!();
        for artifact in &report.artifacts {
            println!("{:<12} {}", artifact.kind.to_string(), artifact.name);
        }
    }
    for failure in &report.errors {
        println!("error in {}: {}", failure.stage, failure.message);
    }
}

fn print_check(project: &Project) {
    println!("project: {}", project.project_name);
    println!("dist: {}", project.dist_dir().display());
    for build in &project.builds {
        if build.skip {
            println!("build {}: skipped", build.id);
            continue;
        }
        let platforms: Vec<String> = build.platforms().iter().map(|p| p.id()).collect();
        println!("build {}: {}", build.id, platforms.join(", "));
    }
}

/// Write the starter project file, refusing to overwrite one.
fn init(root: &Path, config: Option<&Path>) -> Result<PathBuf> {
    let path = match config {
        Some(p) if p.is_absolute() => p.to_path_buf(),
        Some(p) => root.join(p),
        None => root.join(CONFIG_FILE),
    };
    if path.exists() {
        bail!("{} already exists", path.display());
    }

    let name = root
        .canonicalize()
        .with_context(|| format!("failed to resolve {}", root.display()))?
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string());
    fs::write(&path, Project::default_toml_template(&name))
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}
