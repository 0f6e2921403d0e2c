use std::path::Path;

use anyhow::{Context, Result, bail};
use binship_process::{CommandSpec, resolve_dir, run};
use binship_types::{Artifact, ArtifactKind};

use crate::context::RunContext;
use crate::stage::{Reporter, Stage};

/// Runs each `[[signs]]` command over the artifacts it selects.
pub struct SignStage;

impl Stage for SignStage {
    fn name(&self) -> &'static str {
        "sign"
    }

    fn skip_reason(&self, ctx: &RunContext) -> Option<String> {
        if ctx.skip_sign {
            Some("--skip-sign is set".to_string())
        } else if ctx.config.signs.is_empty() {
            Some("no signs configured".to_string())
        } else {
            None
        }
    }

    fn run(&mut self, ctx: &RunContext, reporter: &mut dyn Reporter) -> Result<()> {
        let recorded = ctx.artifacts.list();
        for (idx, sign) in ctx.config.signs.iter().enumerate() {
            let targets: Vec<&Artifact> = recorded
                .iter()
                .filter(|a| a.kind != ArtifactKind::Signature && sign.artifacts.matches(a.kind))
                .collect();
            if targets.is_empty() {
                reporter.warn(&format!("sign: signs[{idx}] matched no artifacts"));
                continue;
            }

            for artifact in targets {
                let mut vars = ctx
                    .template_vars()
                    .with("artifact", artifact.path.display().to_string())
                    .with("artifact_name", &artifact.name);
                if let Some(platform) = &artifact.platform {
                    vars = vars.with_platform(platform);
                }
                let signature = vars
                    .render_strict(&sign.signature)
                    .with_context(|| format!("signs[{idx}].signature"))?;
                let signature = resolve_dir(&ctx.dist, Some(Path::new(&signature)));
                let vars = vars.with("signature", signature.display().to_string());

                let spec = CommandSpec::new(vars.render(&sign.cmd))
                    .args(vars.render_all(&sign.args))
                    .current_dir(&ctx.dist)
                    .envs(&vars.render_map(&ctx.config.env))
                    .envs(&vars.render_map(&sign.env));
                let out = run(&spec, &ctx.cancel)?;
                if !out.success() {
                    bail!(
                        "signing {} failed: `{spec}` {}:\n{}",
                        artifact.name,
                        out.status_text(),
                        out.combined
                    );
                }

                let name = signature
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| format!("{}.sig", artifact.name));
                reporter.info(&format!("sign: {name}"));
                let mut record = Artifact::new(ArtifactKind::Signature, name, signature)
                    .with_extra("signs", artifact.name.clone());
                if let Some(platform) = artifact.platform.clone() {
                    record = record.with_platform(platform);
                }
                ctx.artifacts.add(record);
            }
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;

    use binship_config::{ArtifactFilter, Sign};
    use tempfile::tempdir;

    use super::*;
    use crate::context::test_support::{project, snapshot_context};
    use crate::context::{BuildOptions, build_context};
    use crate::stage::test_support::CollectingReporter;

    fn sign_with_sh(script: &str, filter: ArtifactFilter) -> Sign {
        Sign {
            cmd: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            artifacts: filter,
            ..Sign::default()
        }
    }

    fn with_artifact(ctx: &RunContext, kind: ArtifactKind, name: &str) {
        fs::create_dir_all(&ctx.dist).unwrap();
        let path = ctx.dist.join(name);
        fs::write(&path, name).unwrap();
        ctx.artifacts.add(Artifact::new(kind, name, path));
    }

    #[test]
    fn signs_selected_artifacts_and_records_signatures() {
        let td = tempdir().unwrap();
        let mut p = project("tool", td.path());
        p.signs = vec![sign_with_sh(
            "cp '${artifact}' '${signature}'",
            ArtifactFilter::Checksum,
        )];
        let ctx = snapshot_context(p, td.path());
        with_artifact(&ctx, ArtifactKind::Checksum, "checksums.txt");
        with_artifact(&ctx, ArtifactKind::Archive, "tool.tar.gz");

        SignStage
            .run(&ctx, &mut CollectingReporter::default())
            .unwrap();

        let sigs = ctx.artifacts.by_kind(ArtifactKind::Signature);
        assert_eq!(sigs.len(), 1);
        assert_eq!(sigs[0].name, "checksums.txt.sig");
        assert_eq!(sigs[0].extra["signs"], "checksums.txt");
        assert_eq!(
            fs::read_to_string(ctx.dist.join("checksums.txt.sig")).unwrap(),
            "checksums.txt"
        );
    }

    #[test]
    fn failing_signer_reports_output() {
        let td = tempdir().unwrap();
        let mut p = project("tool", td.path());
        p.signs = vec![sign_with_sh("echo 'no secret key' >&2; exit 2", ArtifactFilter::All)];
        let ctx = snapshot_context(p, td.path());
        with_artifact(&ctx, ArtifactKind::Archive, "tool.tar.gz");

        let err = SignStage
            .run(&ctx, &mut CollectingReporter::default())
            .unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("signing tool.tar.gz failed"));
        assert!(message.contains("exit status 2"));
        assert!(message.contains("no secret key"));
    }

    #[test]
    fn unmatched_filter_warns() {
        let td = tempdir().unwrap();
        let mut p = project("tool", td.path());
        p.signs = vec![sign_with_sh("true", ArtifactFilter::Binary)];
        let ctx = snapshot_context(p, td.path());
        let mut reporter = CollectingReporter::default();
        SignStage.run(&ctx, &mut reporter).unwrap();
        assert_eq!(reporter.warns, vec!["sign: signs[0] matched no artifacts"]);
    }

    #[test]
    fn skip_sign_flag() {
        let td = tempdir().unwrap();
        let mut p = project("tool", td.path());
        p.signs = vec![Sign::default()];
        let ctx = build_context(
            p,
            td.path(),
            &BuildOptions {
                snapshot: true,
                skip_sign: true,
                ..BuildOptions::default()
            },
            &binship_git::MemoryRepo::default(),
        )
        .unwrap();
        assert_eq!(
            SignStage.skip_reason(&ctx).as_deref(),
            Some("--skip-sign is set")
        );
    }
}
