use anyhow::Result;

use crate::context::RunContext;
use crate::hooks::{HookEnv, HookRunner};
use crate::stage::{Reporter, Stage};

/// Global `[before] hooks`.
pub struct BeforeStage;

impl Stage for BeforeStage {
    fn name(&self) -> &'static str {
        "before"
    }

    fn skip_reason(&self, ctx: &RunContext) -> Option<String> {
        ctx.config
            .before
            .hooks
            .is_empty()
            .then(|| "no hooks configured".to_string())
    }

    fn run(&mut self, ctx: &RunContext, reporter: &mut dyn Reporter) -> Result<()> {
        let report = HookRunner::run(
            &ctx.config.before.hooks,
            &HookEnv::for_stage(self.name(), ctx),
            ctx,
            false,
        )?;
        for run in &report.runs {
            if run.success {
                reporter.info(&format!("before: {}", run.cmd));
            } else {
                reporter.error(&format!("before: {} failed", run.cmd));
            }
            if run.echo {
                for line in run.output.lines() {
                    reporter.info(&format!("  {line}"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;

    use binship_config::Hook;
    use tempfile::tempdir;

    use super::*;
    use crate::context::test_support::{project, snapshot_context};
    use crate::stage::test_support::CollectingReporter;

    #[test]
    fn runs_hooks_and_echoes_requested_output() {
        let td = tempdir().unwrap();
        let mut p = project("tool", td.path());
        p.before.hooks = vec![
            Hook::new("touch generated.rs"),
            Hook {
                output: true,
                ..Hook::new("echo ${project} ${version}")
            },
        ];
        let ctx = snapshot_context(p, td.path());
        let mut reporter = CollectingReporter::default();

        assert_eq!(BeforeStage.skip_reason(&ctx), None);
        BeforeStage.run(&ctx, &mut reporter).unwrap();

        assert!(fs::metadata(td.path().join("generated.rs")).is_ok());
        assert!(
            reporter
                .infos
                .contains(&"  tool 0.0.0-SNAPSHOT-0123456".to_string())
        );
    }

    #[test]
    fn failing_hook_fails_the_stage() {
        let td = tempdir().unwrap();
        let mut p = project("tool", td.path());
        p.before.hooks = vec![Hook::new("echo nope >&2; exit 4")];
        let ctx = snapshot_context(p, td.path());
        let err = BeforeStage
            .run(&ctx, &mut CollectingReporter::default())
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "hook failed: echo nope >&2; exit 4: exit status 4\nnope\n"
        );
    }

    #[test]
    fn skipped_without_hooks() {
        let td = tempdir().unwrap();
        let ctx = snapshot_context(project("tool", td.path()), td.path());
        assert_eq!(
            BeforeStage.skip_reason(&ctx).as_deref(),
            Some("no hooks configured")
        );
    }
}
