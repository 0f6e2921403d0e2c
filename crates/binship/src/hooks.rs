//! Sequential execution of user hooks.

use std::collections::BTreeMap;
use std::path::PathBuf;

use binship_config::Hook;
use binship_process::{CommandSpec, resolve_dir, run};
use binship_types::{EventType, FailurePolicy};

use crate::context::RunContext;
use crate::error::{HookError, describe_stop};
use crate::template::TemplateVars;

/// Where and with what a hook sequence runs.
#[derive(Debug, Clone)]
pub struct HookEnv {
    /// Stage name used for events and fail-soft records.
    pub stage: String,
    pub vars: TemplateVars,
    /// Overlay applied on top of the project `env`.
    pub env: BTreeMap<String, String>,
    /// Base directory for hooks without their own `dir`.
    pub dir: PathBuf,
    pub policy: FailurePolicy,
}

impl HookEnv {
    /// Hooks for `stage` using the run's variables, root and failure policy.
    pub fn for_stage(stage: &str, ctx: &RunContext) -> Self {
        Self {
            stage: stage.to_string(),
            vars: ctx.template_vars(),
            env: BTreeMap::new(),
            dir: ctx.root.clone(),
            policy: ctx.failure_policy,
        }
    }

    pub fn with_vars(mut self, vars: TemplateVars) -> Self {
        self.vars = vars;
        self
    }

    pub fn with_env(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookRun {
    pub cmd: String,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub output: String,
    /// The hook asked for its output to be shown.
    pub echo: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookReport {
    pub skipped: bool,
    pub runs: Vec<HookRun>,
}

impl HookReport {
    pub fn failures(&self) -> usize {
        self.runs.iter().filter(|r| !r.success).count()
    }
}

pub struct HookRunner;

impl HookRunner {
    /// Run `hooks` in order.
    ///
    /// With `skip` nothing is executed. Under fail-fast the first failing hook
    /// ends the sequence; under fail-soft failures go to `ctx.errors` and the
    /// remaining hooks still run. A hook stopped by the run's cancel token
    /// always ends the sequence.
    pub fn run(
        hooks: &[Hook],
        env: &HookEnv,
        ctx: &RunContext,
        skip: bool,
    ) -> Result<HookReport, HookError> {
        let mut report = HookReport {
            skipped: skip,
            runs: Vec::new(),
        };
        if skip {
            return Ok(report);
        }

        for hook in hooks {
            let cmd = env.vars.render(&hook.cmd);
            let dir = resolve_dir(&env.dir, hook.dir.as_deref());
            let spec = CommandSpec::shell(cmd.clone())
                .current_dir(dir)
                .envs(&env.vars.render_map(&ctx.config.env))
                .envs(&env.vars.render_map(&env.env))
                .envs(&env.vars.render_map(&hook.env))
                .timeout(hook.timeout);

            let failure = match run(&spec, &ctx.cancel) {
                Err(e) => {
                    let err = HookError::Spawn {
                        cmd: cmd.clone(),
                        message: format!("{e:#}"),
                    };
                    report.runs.push(HookRun {
                        cmd: cmd.clone(),
                        exit_code: None,
                        success: false,
                        output: String::new(),
                        echo: hook.output,
                    });
                    err
                }
                Ok(out) => {
                    ctx.record(
                        &env.stage,
                        EventType::HookExecuted {
                            cmd: cmd.clone(),
                            exit_code: out.exit_code.unwrap_or(-1),
                        },
                    );

                    if let Some(reason) = ctx.cancel.stop_reason()
                        && out.stopped()
                    {
                        return Err(HookError::Interrupted {
                            cmd,
                            reason: describe_stop(reason).to_string(),
                        });
                    }

                    let success = out.success();
                    report.runs.push(HookRun {
                        cmd: cmd.clone(),
                        exit_code: out.exit_code,
                        success,
                        output: out.combined.clone(),
                        echo: hook.output,
                    });
                    if success {
                        continue;
                    }
                    HookError::Failed {
                        cmd: cmd.clone(),
                        status: out.status_text(),
                        output: out.combined,
                    }
                }
            };

            match env.policy {
                FailurePolicy::FailFast => return Err(failure),
                FailurePolicy::FailSoft => ctx.errors.add(&env.stage, failure.to_string()),
            }
        }

        Ok(report)
    }
}
