use anyhow::{Result, bail};

use crate::context::RunContext;
use crate::stage::{Reporter, Stage};

/// Checks that the publish token is present before anything is built.
pub struct EnvStage;

impl Stage for EnvStage {
    fn name(&self) -> &'static str {
        "env"
    }

    fn skip_reason(&self, ctx: &RunContext) -> Option<String> {
        if ctx.skip_token_check {
            Some("token check disabled".to_string())
        } else if ctx.skip_publish {
            Some("--skip-publish is set".to_string())
        } else if !ctx.config.needs_token() {
            Some("nothing to publish".to_string())
        } else {
            None
        }
    }

    fn run(&mut self, ctx: &RunContext, reporter: &mut dyn Reporter) -> Result<()> {
        let var = &ctx.config.release.token_env;
        match token_from_env(var) {
            Some(_) => {
                reporter.info(&format!("env: using token from {var}"));
                Ok(())
            }
            None => bail!("missing {var}: set it to publish, or run with --snapshot or --skip-publish"),
        }
    }
}

fn token_from_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use binship_config::Publisher;
    use binship_git::MemoryRepo;
    use serial_test::serial;

    use super::*;
    use crate::context::test_support::project;
    use crate::context::{BuildOptions, build_context};
    use crate::stage::test_support::CollectingReporter;

    const VAR: &str = "BINSHIP_ENV_STAGE_TEST_TOKEN";

    fn release_ctx(opts: BuildOptions) -> RunContext {
        let root = Path::new("/work/tool");
        let mut p = project("tool", root);
        p.release.token_env = VAR.to_string();
        p.publishers = vec![Publisher {
            name: "upload".to_string(),
            cmd: "true".to_string(),
            dir: None,
            env: Default::default(),
            artifacts: Default::default(),
        }];
        build_context(p, root, &opts, &MemoryRepo::tagged("v1.0.0")).unwrap()
    }

    #[test]
    #[serial]
    fn missing_token_fails() {
        temp_env::with_var(VAR, None::<&str>, || {
            let ctx = release_ctx(BuildOptions::default());
            assert_eq!(EnvStage.skip_reason(&ctx), None);
            let err = EnvStage
                .run(&ctx, &mut CollectingReporter::default())
                .unwrap_err();
            assert!(err.to_string().starts_with(&format!("missing {VAR}")));
        });
    }

    #[test]
    #[serial]
    fn blank_token_counts_as_missing() {
        temp_env::with_var(VAR, Some("  "), || {
            let ctx = release_ctx(BuildOptions::default());
            assert!(EnvStage.run(&ctx, &mut CollectingReporter::default()).is_err());
        });
    }

    #[test]
    #[serial]
    fn present_token_passes() {
        temp_env::with_var(VAR, Some("ghp_secret"), || {
            let ctx = release_ctx(BuildOptions::default());
            let mut reporter = CollectingReporter::default();
            EnvStage.run(&ctx, &mut reporter).unwrap();
            assert!(!reporter.infos.iter().any(|m| m.contains("ghp_secret")));
        });
    }

    #[test]
    fn skipped_for_snapshots_and_post_hook_skips() {
        let ctx = release_ctx(BuildOptions {
            snapshot: true,
            ..BuildOptions::default()
        });
        assert!(EnvStage.skip_reason(&ctx).is_some());

        let ctx = release_ctx(BuildOptions {
            skip_validate: true,
            skip_post_hooks: true,
            ..BuildOptions::default()
        });
        assert!(EnvStage.skip_reason(&ctx).is_some());
    }

    #[test]
    fn skipped_without_publishers() {
        let root = Path::new("/work/tool");
        let ctx = build_context(
            project("tool", root),
            root,
            &BuildOptions::default(),
            &MemoryRepo::tagged("v1.0.0"),
        )
        .unwrap();
        assert_eq!(
            EnvStage.skip_reason(&ctx).as_deref(),
            Some("nothing to publish")
        );
    }
}
