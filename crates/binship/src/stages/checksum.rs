use std::fs::File;
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use binship_types::{Artifact, ArtifactKind};
use sha2::{Digest, Sha256};

use super::display_name;
use crate::context::RunContext;
use crate::dist::write_atomic;
use crate::stage::{Reporter, Stage};

/// Writes a `sha256sum`-compatible file for the archives (or, without
/// archives, the binaries).
pub struct ChecksumStage;

impl Stage for ChecksumStage {
    fn name(&self) -> &'static str {
        "checksum"
    }

    fn skip_reason(&self, ctx: &RunContext) -> Option<String> {
        ctx.config
            .checksum
            .skip
            .then(|| "checksum.skip is set".to_string())
    }

    fn run(&mut self, ctx: &RunContext, reporter: &mut dyn Reporter) -> Result<()> {
        let mut targets = ctx.artifacts.by_kind(ArtifactKind::Archive);
        if targets.is_empty() {
            targets = ctx.artifacts.by_kind(ArtifactKind::Binary);
        }
        if targets.is_empty() {
            reporter.warn("checksum: nothing to checksum");
            return Ok(());
        }

        let mut lines = Vec::with_capacity(targets.len());
        for artifact in &targets {
            let digest = sha256_file(&artifact.path)?;
            lines.push((display_name(&artifact.path, &ctx.dist), digest));
        }
        lines.sort();

        let name = ctx
            .template_vars()
            .render_strict(&ctx.config.checksum.name_template)
            .context("checksum.name_template")?;
        let path = ctx.dist.join(&name);
        let body: String = lines
            .iter()
            .map(|(file, digest)| format!("{digest}  {file}\n"))
            .collect();
        write_atomic(&path, body.as_bytes())?;

        reporter.info(&format!("checksum: {name} ({} files)", lines.len()));
        ctx.artifacts
            .add(Artifact::new(ArtifactKind::Checksum, name, path).with_extra("algorithm", "sha256"));
        Ok(())
    }
}

/// Lowercase hex SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(hex::encode(hasher.finalize()))
}
