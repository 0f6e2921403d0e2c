use anyhow::{Result, bail};
use binship_git::{VersionControl, VersionControlError};

use crate::context::RunContext;
use crate::stage::{Reporter, Stage};

/// Release preconditions: clean worktree, HEAD tagged with the resolved
/// version, and the expected remote.
pub struct ValidateStage<'v> {
    vcs: &'v dyn VersionControl,
}

impl<'v> ValidateStage<'v> {
    pub fn new(vcs: &'v dyn VersionControl) -> Self {
        Self { vcs }
    }
}

impl Stage for ValidateStage<'_> {
    fn name(&self) -> &'static str {
        "validate"
    }

    fn skip_reason(&self, ctx: &RunContext) -> Option<String> {
        if ctx.snapshot {
            Some("snapshot run".to_string())
        } else if ctx.skip_validate {
            Some("--skip-validate is set".to_string())
        } else {
            None
        }
    }

    fn run(&mut self, ctx: &RunContext, reporter: &mut dyn Reporter) -> Result<()> {
        if !self.vcs.is_clean()? {
            bail!("git is in a dirty state, commit or stash your changes, or use --snapshot");
        }

        match self.vcs.current_tag()? {
            Some(tag) if tag == ctx.version.tag => {}
            Some(tag) => bail!(
                "HEAD is tagged {tag} but the release resolved to {}",
                ctx.version.tag
            ),
            None => return Err(VersionControlError::NoTag.into()),
        }

        if let Some(expected) = &ctx.config.release.remote {
            match self.vcs.remote_url("origin")? {
                Some(url) if url.contains(expected.as_str()) => {}
                Some(url) => bail!("remote origin {url} does not match {expected}"),
                None => bail!("no origin remote, expected one matching {expected}"),
            }
        }

        reporter.info(&format!("validate: releasing {}", ctx.version.tag));
        Ok(())
    }
}
