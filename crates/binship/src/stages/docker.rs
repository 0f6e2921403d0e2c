use anyhow::{Context, Result, bail};
use binship_config::Docker;
use binship_process::{CommandSpec, command_exists, resolve_dir, run};
use binship_types::{Artifact, ArtifactKind};

use crate::context::RunContext;
use crate::stage::{Reporter, Stage};

/// `docker build` for every `[[dockers]]` entry.
pub struct DockerStage;

impl Stage for DockerStage {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn skip_reason(&self, ctx: &RunContext) -> Option<String> {
        if ctx.skip_docker {
            Some("--skip-docker is set".to_string())
        } else if ctx.config.dockers.is_empty() {
            Some("no dockers configured".to_string())
        } else {
            None
        }
    }

    fn run(&mut self, ctx: &RunContext, reporter: &mut dyn Reporter) -> Result<()> {
        for (idx, docker) in ctx.config.dockers.iter().enumerate() {
            let (spec, tags) = docker_command(ctx, docker)
                .with_context(|| format!("dockers[{idx}]"))?;
            if !command_exists(&spec.program) {
                bail!("{} not found in PATH", spec.program);
            }

            let out = run(&spec, &ctx.cancel)?;
            if !out.success() {
                bail!("`{spec}` failed with {}:\n{}", out.status_text(), out.combined);
            }

            let context = spec.args.last().cloned().unwrap_or_default();
            for tag in tags {
                reporter.info(&format!("docker: {tag}"));
                ctx.artifacts.add(
                    Artifact::new(ArtifactKind::DockerImage, tag, &context)
                        .with_extra("dockerfile", docker.dockerfile.display().to_string()),
                );
            }
        }
        Ok(())
    }
}

/// `<command> build -f <dockerfile> -t <tag>... [flags] <context>`
fn docker_command(ctx: &RunContext, docker: &Docker) -> Result<(CommandSpec, Vec<String>)> {
    let vars = ctx.template_vars();
    let tags = docker
        .image_templates
        .iter()
        .map(|t| vars.render_strict(t))
        .collect::<Result<Vec<_>>>()?;
    let context = resolve_dir(&ctx.root, docker.context.as_deref());
    let dockerfile = resolve_dir(&ctx.root, Some(docker.dockerfile.as_path()));

    let mut spec = CommandSpec::new(vars.render(&docker.command))
        .arg("build")
        .arg("-f")
        .arg(dockerfile.display().to_string());
    for tag in &tags {
        spec = spec.arg("-t").arg(tag.clone());
    }
    let spec = spec
        .args(vars.render_all(&docker.build_flag_templates))
        .arg(context.display().to_string())
        .current_dir(&ctx.root)
        .envs(&vars.render_map(&ctx.config.env));
    Ok((spec, tags))
}
