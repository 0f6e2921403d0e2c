//! Release identity resolution: release or snapshot, and which version.

use binship_config::DEFAULT_SNAPSHOT_TEMPLATE;
use binship_git::{VersionControl, VersionControlError};
use binship_types::VersionInfo;
use chrono::Utc;

use crate::template::TemplateVars;

/// How the run decides between a release and a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    /// `--snapshot`: always a snapshot, git optional.
    Forced,
    /// `--snapshot-auto`: a snapshot unless HEAD is a clean, tagged commit.
    Auto,
    /// Release run; HEAD must carry a version tag.
    Off,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub info: VersionInfo,
    pub snapshot: bool,
}

pub struct VersionResolver<'a> {
    vcs: &'a dyn VersionControl,
    snapshot_template: String,
    allow_untagged: bool,
}

impl<'a> VersionResolver<'a> {
    pub fn new(vcs: &'a dyn VersionControl) -> Self {
        Self {
            vcs,
            snapshot_template: DEFAULT_SNAPSHOT_TEMPLATE.to_string(),
            allow_untagged: false,
        }
    }

    pub fn with_snapshot_template(mut self, template: impl Into<String>) -> Self {
        self.snapshot_template = template.into();
        self
    }

    /// Let a release run proceed without a tag on HEAD (`--skip-validate`).
    pub fn allow_untagged(mut self, allow: bool) -> Self {
        self.allow_untagged = allow;
        self
    }

    pub fn resolve(&self, mode: SnapshotMode) -> Result<Resolution, VersionControlError> {
        match mode {
            SnapshotMode::Forced => Ok(self.snapshot()),
            SnapshotMode::Auto => {
                let tag = self.vcs.current_tag()?;
                let clean = self.vcs.is_clean()?;
                match tag {
                    Some(tag) if clean && parse_tag(&tag).is_ok() => self.release(tag),
                    _ => Ok(self.snapshot()),
                }
            }
            SnapshotMode::Off => match self.vcs.current_tag()? {
                Some(tag) => self.release(tag),
                None if self.allow_untagged => self.untagged_release(),
                None => Err(VersionControlError::NoTag),
            },
        }
    }

    fn release(&self, tag: String) -> Result<Resolution, VersionControlError> {
        let previous_tag = self.vcs.previous_tag(&tag).ok().flatten();
        self.release_info(tag, true, previous_tag)
    }

    /// HEAD has no tag: borrow the version of the last tag (or `v0.0.0`) and
    /// treat that tag as the start of the history since.
    fn untagged_release(&self) -> Result<Resolution, VersionControlError> {
        match self.vcs.latest_tag().ok().flatten() {
            Some(latest) => self.release_info(latest.clone(), false, Some(latest)),
            None => self.release_info("v0.0.0".to_string(), false, None),
        }
    }

    fn release_info(
        &self,
        tag: String,
        tag_on_head: bool,
        previous_tag: Option<String>,
    ) -> Result<Resolution, VersionControlError> {
        let version = parse_tag(&tag)?;
        let commit = self.vcs.head_commit()?;
        let date = self.vcs.commit_date()?;
        let remote_url = self.vcs.remote_url("origin").ok().flatten();

        Ok(Resolution {
            info: VersionInfo {
                version: version.to_string(),
                short_commit: short(&commit),
                commit,
                tag,
                tag_on_head,
                previous_tag,
                date,
                remote_url,
            },
            snapshot: false,
        })
    }

    /// Best effort: every query may fail without failing the run.
    fn snapshot(&self) -> Resolution {
        let mut info = VersionInfo::unknown(Utc::now());

        let last_tag = self
            .vcs
            .current_tag()
            .ok()
            .flatten()
            .or_else(|| self.vcs.latest_tag().ok().flatten());
        if let Some(tag) = last_tag
            && let Ok(v) = parse_tag(&tag)
        {
            info.version = v.to_string();
            info.previous_tag = Some(tag.clone());
            info.tag = tag;
        }
        if let Ok(commit) = self.vcs.head_commit() {
            info.short_commit = short(&commit);
            info.commit = commit;
        }
        if let Ok(date) = self.vcs.commit_date() {
            info.date = date;
        }
        info.remote_url = self.vcs.remote_url("origin").ok().flatten();

        let vars = TemplateVars::new()
            .with("version", &info.version)
            .with("tag", &info.tag)
            .with("commit", &info.commit)
            .with("short_commit", &info.short_commit)
            .with("timestamp", info.date.timestamp().to_string());
        info.version = vars.render(&self.snapshot_template);

        Resolution {
            info,
            snapshot: true,
        }
    }
}

/// Parse `vX.Y.Z` or `X.Y.Z`.
pub fn parse_tag(tag: &str) -> Result<semver::Version, VersionControlError> {
    let raw = tag.strip_prefix('v').unwrap_or(tag);
    semver::Version::parse(raw).map_err(|e| VersionControlError::MalformedTag {
        tag: tag.to_string(),
        message: e.to_string(),
    })
}

fn short(commit: &str) -> String {
    commit.chars().take(7).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use binship_git::MemoryRepo;

    #[test]
    fn forced_snapshot_works_without_git() {
        let repo = MemoryRepo::unavailable();
        let res = VersionResolver::new(&repo)
            .resolve(SnapshotMode::Forced)
            .unwrap();
        assert!(res.snapshot);
        assert_eq!(res.info.version, "0.0.0-SNAPSHOT-none");
        assert_eq!(res.info.commit, "none");
    }

    #[test]
    fn forced_snapshot_uses_last_tag_and_commit() {
        let mut repo = MemoryRepo::default();
        repo.latest_tag = Some("v1.2.0".to_string());
        let res = VersionResolver::new(&repo)
            .resolve(SnapshotMode::Forced)
            .unwrap();
        assert_eq!(res.info.version, "1.2.0-SNAPSHOT-0123456");
        assert_eq!(res.info.tag, "v1.2.0");
    }

    #[test]
    fn custom_snapshot_template() {
        let repo = MemoryRepo::default();
        let res = VersionResolver::new(&repo)
            .with_snapshot_template("${version}-dev+${short_commit}")
            .resolve(SnapshotMode::Forced)
            .unwrap();
        assert_eq!(res.info.version, "0.0.0-dev+0123456");
    }

    #[test]
    fn auto_clean_tagged_is_release() {
        let repo = MemoryRepo::tagged("v0.0.1").with_previous_tag("v0.0.0");
        let res = VersionResolver::new(&repo)
            .resolve(SnapshotMode::Auto)
            .unwrap();
        assert!(!res.snapshot);
        assert_eq!(res.info.version, "0.0.1");
        assert_eq!(res.info.tag, "v0.0.1");
        assert_eq!(res.info.previous_tag.as_deref(), Some("v0.0.0"));
        assert!(res.info.tag_on_head);
        assert_eq!(res.info.short_commit, "0123456");
    }

    #[test]
    fn auto_dirty_tagged_is_snapshot() {
        let repo = MemoryRepo::tagged("v0.0.1").dirty();
        let res = VersionResolver::new(&repo)
            .resolve(SnapshotMode::Auto)
            .unwrap();
        assert!(res.snapshot);
        assert_eq!(res.info.version, "0.0.1-SNAPSHOT-0123456");
    }

    #[test]
    fn auto_clean_untagged_is_snapshot() {
        let repo = MemoryRepo::default();
        let res = VersionResolver::new(&repo)
            .resolve(SnapshotMode::Auto)
            .unwrap();
        assert!(res.snapshot);
    }

    #[test]
    fn auto_outside_repository_fails() {
        let repo = MemoryRepo::unavailable();
        let err = VersionResolver::new(&repo)
            .resolve(SnapshotMode::Auto)
            .unwrap_err();
        assert!(matches!(err, VersionControlError::Query { .. }));
    }

    #[test]
    fn release_requires_a_tag() {
        let repo = MemoryRepo::default();
        let err = VersionResolver::new(&repo)
            .resolve(SnapshotMode::Off)
            .unwrap_err();
        assert_eq!(err, VersionControlError::NoTag);
    }

    #[test]
    fn release_without_tag_allowed_when_validation_skipped() {
        let mut repo = MemoryRepo::default();
        repo.latest_tag = Some("v2.0.0".to_string());
        let res = VersionResolver::new(&repo)
            .allow_untagged(true)
            .resolve(SnapshotMode::Off)
            .unwrap();
        assert!(!res.snapshot);
        assert_eq!(res.info.version, "2.0.0");
        assert!(!res.info.tag_on_head);
        assert_eq!(res.info.previous_tag.as_deref(), Some("v2.0.0"));

        let repo = MemoryRepo::default();
        let res = VersionResolver::new(&repo)
            .allow_untagged(true)
            .resolve(SnapshotMode::Off)
            .unwrap();
        assert_eq!(res.info.tag, "v0.0.0");
        assert!(!res.info.tag_on_head);
        assert_eq!(res.info.previous_tag, None);
    }

    #[test]
    fn malformed_tag_is_rejected() {
        let repo = MemoryRepo::tagged("release-one");
        let err = VersionResolver::new(&repo)
            .resolve(SnapshotMode::Off)
            .unwrap_err();
        assert!(matches!(err, VersionControlError::MalformedTag { ref tag, .. } if tag == "release-one"));
    }

    #[test]
    fn parse_tag_accepts_optional_prefix() {
        assert_eq!(parse_tag("v1.2.3").unwrap().to_string(), "1.2.3");
        assert_eq!(parse_tag("1.2.3-rc.1").unwrap().to_string(), "1.2.3-rc.1");
        assert!(parse_tag("v1.2").is_err());
    }
}
