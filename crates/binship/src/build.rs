//! Build matrix expansion and bounded-parallel compilation.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, mpsc};
use std::thread;

use anyhow::{Context, Result, bail};
use binship_config::{Build, Project};
use binship_process::{CommandSpec, StopReason, resolve_dir, run};
use binship_types::{Artifact, ArtifactKind, EventType, FailurePolicy, Platform};

use crate::context::RunContext;
use crate::error::BuildError;
use crate::hooks::{HookEnv, HookRunner};
use crate::stage::Reporter;
use crate::template::TemplateVars;

const STAGE: &str = "build";

/// One `(build, platform)` cell of the matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildUnit {
    /// `<build id>_<os>_<arch>[_<variant>]`
    pub id: String,
    pub build: Build,
    pub platform: Platform,
}

impl BuildUnit {
    pub fn new(build: &Build, platform: Platform) -> Self {
        Self {
            id: format!("{}_{}", build.id, platform.id()),
            build: build.clone(),
            platform,
        }
    }

    /// File name of the produced executable.
    pub fn binary_name(&self) -> String {
        format!("{}{}", self.build.binary, self.platform.binary_suffix())
    }
}

/// Every unit the project declares, in declaration order.
pub fn expand(project: &Project) -> Vec<BuildUnit> {
    project
        .builds
        .iter()
        .filter(|b| !b.skip)
        .flat_map(|b| {
            b.platforms()
                .into_iter()
                .map(move |p| BuildUnit::new(b, p))
        })
        .collect()
}

/// Turns one unit into an executable inside `out_dir`.
pub trait Compiler: Send + Sync {
    fn compile(&self, unit: &BuildUnit, ctx: &RunContext, out_dir: &Path) -> Result<PathBuf>;
}

/// Runs `<command> build --release --target <triple> --bin <binary>` and
/// copies the result out of the cargo target directory.
#[derive(Debug, Clone, Default)]
pub struct CargoCompiler;

impl Compiler for CargoCompiler {
    fn compile(&self, unit: &BuildUnit, ctx: &RunContext, out_dir: &Path) -> Result<PathBuf> {
        let build = &unit.build;
        let triple = unit
            .platform
            .rust_target()
            .with_context(|| format!("no rust target for {}", unit.platform))?;
        let project_dir = resolve_dir(&ctx.root, build.dir.as_deref());
        let vars = unit_vars(ctx, unit);

        let mut spec = CommandSpec::new(vars.render(&build.command))
            .args(["build", "--release", "--target", triple, "--bin"])
            .arg(build.binary.clone())
            .current_dir(&project_dir)
            .envs(&vars.render_map(&ctx.config.env))
            .envs(&vars.render_map(&build.env));
        if let Some(variant) = &unit.platform.variant {
            spec = spec.args(["--features", variant.as_str()]);
        }
        spec = spec.args(vars.render_all(&build.flags));

        let out = run(&spec, &ctx.cancel)?;
        if !out.success() {
            bail!("`{spec}` failed with {}:\n{}", out.status_text(), out.combined);
        }

        let target_dir = spec
            .env
            .get("CARGO_TARGET_DIR")
            .cloned()
            .or_else(|| std::env::var("CARGO_TARGET_DIR").ok())
            .map(|d| resolve_dir(&project_dir, Some(Path::new(&d))))
            .unwrap_or_else(|| project_dir.join("target"));
        let built = target_dir
            .join(triple)
            .join("release")
            .join(unit.binary_name());
        let dest = out_dir.join(unit.binary_name());
        fs::copy(&built, &dest).with_context(|| {
            format!(
                "failed to copy {} to {}",
                built.display(),
                dest.display()
            )
        })?;
        Ok(dest)
    }
}

/// Parse `path` as a Rust source file.
///
/// Errors read `failed to parse <file>:<line>:<col>: <message>`.
pub fn check_entry_point(path: &Path) -> Result<(), String> {
    let src = fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    syn::parse_file(&src).map(|_| ()).map_err(|e| {
        let start = e.span().start();
        format!(
            "failed to parse {}:{}:{}: {e}",
            path.display(),
            start.line,
            start.column + 1
        )
    })
}

fn unit_vars(ctx: &RunContext, unit: &BuildUnit) -> TemplateVars {
    ctx.template_vars()
        .with_platform(&unit.platform)
        .with("binary", &unit.build.binary)
        .with("build_id", &unit.build.id)
}

pub struct BuildMatrixExecutor<'a> {
    compiler: &'a dyn Compiler,
}

impl<'a> BuildMatrixExecutor<'a> {
    pub fn new(compiler: &'a dyn Compiler) -> Self {
        Self { compiler }
    }

    /// Build every unit of the project's matrix.
    ///
    /// At most `ctx.parallelism` units compile at once. Every unit ends with
    /// exactly one artifact or one recorded error, unless the run is stopped
    /// first, in which case the unfinished ones are counted as pending.
    pub fn build(
        &self,
        ctx: &RunContext,
        reporter: &mut dyn Reporter,
    ) -> Result<Vec<Artifact>, BuildError> {
        let units = expand(&ctx.config);
        let total = units.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        // Entry points are checked once per build, before anything compiles.
        let mut entry_errors: BTreeMap<String, String> = BTreeMap::new();
        for build in ctx.config.builds.iter().filter(|b| !b.skip) {
            let dir = resolve_dir(&ctx.root, build.dir.as_deref());
            let main = resolve_dir(&dir, Some(build.main.as_path()));
            if let Err(message) = check_entry_point(&main) {
                entry_errors.insert(build.id.clone(), message);
            }
        }

        let queue = Mutex::new(units.into_iter().collect::<VecDeque<_>>());
        let stop = AtomicBool::new(false);
        let workers = ctx.parallelism.clamp(1, total);
        let (tx, rx) = mpsc::channel::<(BuildUnit, Result<Artifact, String>)>();

        let mut built = Vec::new();
        let mut failures: Vec<(String, String)> = Vec::new();
        let mut finished = 0usize;

        thread::scope(|s| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                let stop = &stop;
                let entry_errors = &entry_errors;
                s.spawn(move || {
                    loop {
                        if stop.load(Ordering::SeqCst) || ctx.cancel.stop_reason().is_some() {
                            break;
                        }
                        let Some(unit) = queue.lock().ok().and_then(|mut q| q.pop_front()) else {
                            break;
                        };
                        ctx.record(
                            STAGE,
                            EventType::UnitStarted {
                                unit: unit.id.clone(),
                            },
                        );
                        let result = match entry_errors.get(&unit.build.id) {
                            Some(message) => Err(message.clone()),
                            None => self.build_unit(ctx, &unit),
                        };
                        if result.is_err() && ctx.failure_policy == FailurePolicy::FailFast {
                            stop.store(true, Ordering::SeqCst);
                        }
                        if tx.send((unit, result)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);

            for (unit, result) in rx {
                finished += 1;
                match result {
                    Ok(artifact) => {
                        reporter.info(&format!(
                            "build: {} -> {}",
                            unit.id,
                            artifact.path.display()
                        ));
                        ctx.record(
                            STAGE,
                            EventType::UnitFinished {
                                unit: unit.id.clone(),
                                artifact: artifact.path.display().to_string(),
                            },
                        );
                        ctx.artifacts.add(artifact.clone());
                        built.push(artifact);
                    }
                    Err(message) => {
                        // A unit killed by the run's deadline is not a unit failure.
                        if ctx.cancel.stop_reason().is_some() {
                            finished -= 1;
                            continue;
                        }
                        ctx.record(
                            STAGE,
                            EventType::UnitFailed {
                                unit: unit.id.clone(),
                                message: message.clone(),
                            },
                        );
                        if ctx.fail_soft() {
                            let error = BuildError::Unit {
                                unit: unit.id.clone(),
                                message: message.clone(),
                            }
                            .to_string();
                            reporter.error(&error);
                            ctx.errors.add(STAGE, error);
                        }
                        failures.push((unit.id, message));
                    }
                }
            }
        });

        let pending = total - finished;
        if pending > 0
            && let Some(reason) = ctx.cancel.stop_reason()
        {
            return Err(match reason {
                StopReason::DeadlineExceeded => BuildError::TimedOut { pending, total },
                StopReason::Cancelled => BuildError::Cancelled { pending, total },
            });
        }

        if !failures.is_empty() {
            match ctx.failure_policy {
                FailurePolicy::FailFast => {
                    let (unit, message) = failures.swap_remove(0);
                    return Err(BuildError::Unit { unit, message });
                }
                FailurePolicy::FailSoft if built.is_empty() => {
                    let (unit, message) = &failures[0];
                    return Err(BuildError::Aggregate {
                        total,
                        first: format!("{unit}: {message}"),
                    });
                }
                FailurePolicy::FailSoft => {}
            }
        }

        Ok(built)
    }

    fn build_unit(&self, ctx: &RunContext, unit: &BuildUnit) -> Result<Artifact, String> {
        let out_dir = ctx.dist.join(&unit.id);
        fs::create_dir_all(&out_dir)
            .map_err(|e| format!("failed to create {}: {e}", out_dir.display()))?;

        let vars = unit_vars(ctx, unit);
        let hook_env = HookEnv::for_stage(STAGE, ctx)
            .with_vars(vars)
            .with_env(&unit.build.env)
            .with_policy(FailurePolicy::FailFast);
        let hook_env = HookEnv {
            dir: resolve_dir(&ctx.root, unit.build.dir.as_deref()),
            ..hook_env
        };

        HookRunner::run(&unit.build.hooks.pre, &hook_env, ctx, false)
            .map_err(|e| format!("pre hook: {e}"))?;

        let path = self
            .compiler
            .compile(unit, ctx, &out_dir)
            .map_err(|e| format!("{e:#}"))?;

        HookRunner::run(
            &unit.build.hooks.post,
            &hook_env,
            ctx,
            ctx.skip_post_build_hooks,
        )
        .map_err(|e| format!("post hook: {e}"))?;

        Ok(Artifact::new(ArtifactKind::Binary, unit.binary_name(), path)
            .with_platform(unit.platform.clone())
            .with_build_id(unit.build.id.clone())
            .with_extra("unit", unit.id.clone())
            .with_extra("binary", unit.build.binary.clone()))
    }
}
