use anyhow::{Result, bail};
use binship_config::Publisher;
use binship_process::{CommandSpec, resolve_dir, run};
use binship_types::Artifact;

use crate::context::RunContext;
use crate::stage::{Reporter, Stage};

/// Runs each `[[publishers]]` command once per matching artifact.
///
/// The artifact is exposed as `${artifact_path}`, `${artifact_name}`,
/// `${artifact_kind}` and the platform variables, and through the
/// `ARTIFACT_PATH`, `ARTIFACT_NAME`, `ARTIFACT_KIND`, `ARTIFACT_OS` and
/// `ARTIFACT_ARCH` environment variables.
pub struct PublishStage;

impl Stage for PublishStage {
    fn name(&self) -> &'static str {
        "publish"
    }

    fn skip_reason(&self, ctx: &RunContext) -> Option<String> {
        if ctx.snapshot {
            Some("not available for snapshots".to_string())
        } else if ctx.skip_publish {
            Some("--skip-publish is set".to_string())
        } else if ctx.config.publishers.is_empty() {
            Some("no publishers configured".to_string())
        } else {
            None
        }
    }

    fn run(&mut self, ctx: &RunContext, reporter: &mut dyn Reporter) -> Result<()> {
        let artifacts = ctx.artifacts.list();
        for publisher in &ctx.config.publishers {
            let selected: Vec<&Artifact> = artifacts
                .iter()
                .filter(|a| publisher.artifacts.matches(a.kind))
                .collect();
            if selected.is_empty() {
                reporter.warn(&format!("publish: {}: no matching artifacts", publisher.name));
                continue;
            }

            for artifact in selected {
                let spec = publish_command(ctx, publisher, artifact);
                let out = run(&spec, &ctx.cancel)?;
                if out.success() {
                    reporter.info(&format!("publish: {}: {}", publisher.name, artifact.name));
                    continue;
                }

                let message = format!(
                    "{}: publishing {} failed with {}:\n{}",
                    publisher.name,
                    artifact.name,
                    out.status_text(),
                    out.combined
                );
                if out.stopped() || !ctx.fail_soft() {
                    bail!(message);
                }
                reporter.error(&format!("publish: {message}"));
                ctx.errors.add(self.name(), message);
            }
        }
        Ok(())
    }
}

fn publish_command(ctx: &RunContext, publisher: &Publisher, artifact: &Artifact) -> CommandSpec {
    let mut vars = ctx
        .template_vars()
        .with("artifact_path", artifact.path.display().to_string())
        .with("artifact_name", &artifact.name)
        .with("artifact_kind", artifact.kind.to_string());
    let (os, arch) = match &artifact.platform {
        Some(p) => (p.os.clone(), p.arch.clone()),
        None => (String::new(), String::new()),
    };
    if let Some(platform) = &artifact.platform {
        vars = vars.with_platform(platform);
    }

    let mut spec = CommandSpec::shell(vars.render(&publisher.cmd))
        .current_dir(resolve_dir(&ctx.root, publisher.dir.as_deref()))
        .envs(&vars.render_map(&ctx.config.env))
        .envs(&vars.render_map(&publisher.env))
        .env("ARTIFACT_PATH", artifact.path.display().to_string())
        .env("ARTIFACT_NAME", artifact.name.clone())
        .env("ARTIFACT_KIND", artifact.kind.to_string())
        .env("ARTIFACT_OS", os)
        .env("ARTIFACT_ARCH", arch);
    if let Some(notes) = ctx.release_notes() {
        spec = spec.env("RELEASE_NOTES", notes);
    }
    spec
}
