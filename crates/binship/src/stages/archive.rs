use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use binship_config::ArchiveFormat;
use binship_process::{CommandSpec, command_exists, run};
use binship_types::{Artifact, ArtifactKind, Platform};

use crate::context::RunContext;
use crate::stage::{Reporter, Stage};

/// Packs the binaries of each platform into one archive.
pub struct ArchiveStage;

impl Stage for ArchiveStage {
    fn name(&self) -> &'static str {
        "archive"
    }

    fn skip_reason(&self, ctx: &RunContext) -> Option<String> {
        ctx.config
            .archive
            .skip
            .then(|| "archive.skip is set".to_string())
    }

    fn run(&mut self, ctx: &RunContext, reporter: &mut dyn Reporter) -> Result<()> {
        let mut groups: BTreeMap<Platform, Vec<Artifact>> = BTreeMap::new();
        for binary in ctx.artifacts.by_kind(ArtifactKind::Binary) {
            if let Some(platform) = binary.platform.clone() {
                groups.entry(platform).or_default().push(binary);
            }
        }
        if groups.is_empty() {
            reporter.warn("archive: no binaries to archive");
            return Ok(());
        }

        let mut names = BTreeSet::new();
        for (platform, binaries) in &groups {
            let format = ctx.config.archive.format_for(&platform.os);
            let vars = ctx.template_vars().with_platform(platform);
            let base = vars
                .render_strict(&ctx.config.archive.name_template)
                .context("archive.name_template")?;

            let produced = match format {
                ArchiveFormat::Binary => copy_binaries(ctx, &base, platform, binaries)?,
                ArchiveFormat::TarGz | ArchiveFormat::Zip => {
                    vec![pack(ctx, &base, format, binaries)?]
                }
            };

            for (name, path) in produced {
                if !names.insert(name.clone()) {
                    bail!("archive name {name} is produced by more than one platform, add ${{os}} and ${{arch}} to archive.name_template");
                }
                reporter.info(&format!("archive: {name}"));
                let mut artifact = Artifact::new(ArtifactKind::Archive, name, path)
                    .with_platform(platform.clone())
                    .with_extra("format", format_label(format));
                if let Some(build_id) = binaries[0].build_id.clone() {
                    artifact = artifact.with_build_id(build_id);
                }
                ctx.artifacts.add(artifact);
            }
        }
        Ok(())
    }
}

fn format_label(format: ArchiveFormat) -> &'static str {
    match format {
        ArchiveFormat::TarGz => "tar.gz",
        ArchiveFormat::Zip => "zip",
        ArchiveFormat::Binary => "binary",
    }
}

/// Raw binaries renamed after the template; one file per binary.
fn copy_binaries(
    ctx: &RunContext,
    base: &str,
    platform: &Platform,
    binaries: &[Artifact],
) -> Result<Vec<(String, std::path::PathBuf)>> {
    let mut out = Vec::new();
    for binary in binaries {
        let name = if binaries.len() == 1 {
            format!("{base}{}", platform.binary_suffix())
        } else {
            let bin = binary.extra.get("binary").map(String::as_str).unwrap_or("bin");
            format!("{base}_{bin}{}", platform.binary_suffix())
        };
        let dest = ctx.dist.join(&name);
        fs::copy(&binary.path, &dest).with_context(|| {
            format!("failed to copy {} to {}", binary.path.display(), dest.display())
        })?;
        out.push((name, dest));
    }
    Ok(out)
}

fn pack(
    ctx: &RunContext,
    base: &str,
    format: ArchiveFormat,
    binaries: &[Artifact],
) -> Result<(String, std::path::PathBuf)> {
    let tool = match format {
        ArchiveFormat::Zip => "zip",
        _ => "tar",
    };
    if !command_exists(tool) {
        bail!("{tool} not found in PATH, it is needed for {} archives", format_label(format));
    }

    let staging = ctx.dist.join(".staging").join(base);
    if staging.exists() {
        fs::remove_dir_all(&staging)
            .with_context(|| format!("failed to clean {}", staging.display()))?;
    }
    fs::create_dir_all(&staging)
        .with_context(|| format!("failed to create {}", staging.display()))?;

    let mut entries = BTreeSet::new();
    for binary in binaries {
        entries.insert(stage_file(&binary.path, &staging)?);
    }
    for file in &ctx.config.archive.files {
        let src = ctx.root.join(file);
        if !src.is_file() {
            bail!("archive file {} does not exist", src.display());
        }
        entries.insert(stage_file(&src, &staging)?);
    }

    let name = format!("{base}{}", format.extension());
    let dest = ctx.dist.join(&name);
    let spec = match format {
        ArchiveFormat::Zip => CommandSpec::new("zip").arg("-q").arg(dest.display().to_string()),
        _ => CommandSpec::new("tar")
            .arg("-czf")
            .arg(dest.display().to_string()),
    }
    .args(entries)
    .current_dir(&staging);

    let out = run(&spec, &ctx.cancel)?;
    if !out.success() {
        bail!("`{spec}` failed with {}:\n{}", out.status_text(), out.combined);
    }
    fs::remove_dir_all(&staging).ok();
    Ok((name, dest))
}

/// Copy `src` into `staging`, returning the entry name.
fn stage_file(src: &Path, staging: &Path) -> Result<String> {
    let name = src
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", src.display()))?;
    fs::copy(src, staging.join(&name))
        .with_context(|| format!("failed to stage {}", src.display()))?;
    Ok(name)
}
