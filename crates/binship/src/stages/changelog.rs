use std::fs;

use anyhow::{Context, Result};
use binship_config::{Changelog, ChangelogSort};
use binship_git::VersionControl;
use binship_types::{Artifact, ArtifactKind};
use regex::Regex;

use crate::context::RunContext;
use crate::stage::{Reporter, Stage};

pub const CHANGELOG_FILE: &str = "CHANGELOG.md";

/// Release notes from the commits since the previous tag.
pub struct ChangelogStage<'v> {
    vcs: &'v dyn VersionControl,
}

impl<'v> ChangelogStage<'v> {
    pub fn new(vcs: &'v dyn VersionControl) -> Self {
        Self { vcs }
    }
}

impl Stage for ChangelogStage<'_> {
    fn name(&self) -> &'static str {
        "changelog"
    }

    fn skip_reason(&self, ctx: &RunContext) -> Option<String> {
        if ctx.snapshot {
            Some("not available for snapshots".to_string())
        } else if ctx.config.changelog.skip {
            Some("changelog.skip is set".to_string())
        } else {
            None
        }
    }

    fn run(&mut self, ctx: &RunContext, reporter: &mut dyn Reporter) -> Result<()> {
        let to = if ctx.version.tag_on_head {
            ctx.version.tag.as_str()
        } else {
            "HEAD"
        };
        let entries = self
            .vcs
            .log_between(ctx.version.previous_tag.as_deref(), to)?;
        let notes = render_changelog(&entries, &ctx.config.changelog)?;

        let path = ctx.dist.join(CHANGELOG_FILE);
        fs::write(&path, &notes).with_context(|| format!("failed to write {}", path.display()))?;
        reporter.info(&format!(
            "changelog: {} commits since {}",
            notes.lines().filter(|l| l.starts_with("* ")).count(),
            ctx.version.previous_tag.as_deref().unwrap_or("the first commit")
        ));

        ctx.artifacts
            .add(Artifact::new(ArtifactKind::Changelog, CHANGELOG_FILE, path));
        ctx.set_release_notes(notes);
        Ok(())
    }
}

/// Markdown for `git log` lines of the form `<sha> <subject>`.
pub fn render_changelog(entries: &[String], config: &Changelog) -> Result<String> {
    let excludes = config
        .filters
        .exclude
        .iter()
        .map(|re| Regex::new(re).with_context(|| format!("invalid changelog filter {re:?}")))
        .collect::<Result<Vec<_>>>()?;

    let mut lines: Vec<&str> = entries
        .iter()
        .map(|e| e.trim())
        .filter(|e| !e.is_empty())
        .filter(|e| {
            let subject = e.split_once(' ').map(|(_, s)| s).unwrap_or(e);
            !excludes.iter().any(|re| re.is_match(subject))
        })
        .collect();

    let subject = |l: &&str| l.split_once(' ').map(|(_, s)| s.to_string()).unwrap_or_default();
    match config.sort {
        ChangelogSort::None => {}
        ChangelogSort::Asc => lines.sort_by_key(subject),
        ChangelogSort::Desc => {
            lines.sort_by_key(subject);
            lines.reverse();
        }
    }

    let mut out = String::from("## Changelog\n\n");
    for line in lines {
        out.push_str("* ");
        out.push_str(line);
        out.push('\n');
    }
    Ok(out)
}
