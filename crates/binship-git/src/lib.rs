//! Version-control queries for binship.
//!
//! The release pipeline only needs a handful of facts from the repository:
//! the tag on HEAD, whether the worktree is clean, the remote URL, the
//! commit and its date, the previous tag and the commit subjects between two
//! refs. [`VersionControl`] captures those queries so the engine can be driven
//! by [`SystemGit`] in production and by [`MemoryRepo`] in tests.
//!
//! # Example
//!
//! ```
//! use binship_git::{MemoryRepo, VersionControl};
//!
//! let repo = MemoryRepo::tagged("v1.2.3");
//! assert_eq!(repo.current_tag().unwrap().as_deref(), Some("v1.2.3"));
//! assert!(repo.is_clean().unwrap());
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Environment variable overriding the git executable.
pub const GIT_BIN_ENV: &str = "BINSHIP_GIT_BIN";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VersionControlError {
    /// A git command could not be spawned or exited unsuccessfully.
    #[error("git {command} failed: {message}")]
    Query { command: String, message: String },

    #[error("git doesn't contain any tags, tag the release or use --snapshot")]
    NoTag,

    #[error("tag {tag} is not a valid semantic version: {message}")]
    MalformedTag { tag: String, message: String },
}

pub type VcsResult<T> = std::result::Result<T, VersionControlError>;

/// Repository queries the pipeline depends on.
pub trait VersionControl: Send + Sync {
    /// Highest version tag pointing at HEAD.
    fn current_tag(&self) -> VcsResult<Option<String>>;

    /// `true` when `git status --porcelain` prints nothing.
    fn is_clean(&self) -> VcsResult<bool>;

    fn remote_url(&self, remote: &str) -> VcsResult<Option<String>>;

    fn head_commit(&self) -> VcsResult<String>;

    fn commit_date(&self) -> VcsResult<DateTime<Utc>>;

    /// Most recent tag reachable from HEAD, whether or not HEAD carries it.
    fn latest_tag(&self) -> VcsResult<Option<String>>;

    /// Tag preceding `tag` in history.
    fn previous_tag(&self, tag: &str) -> VcsResult<Option<String>>;

    /// Commit lines (`<short sha> <subject>`) in `from..to`, or all of `to`
    /// when `from` is `None`.
    fn log_between(&self, from: Option<&str>, to: &str) -> VcsResult<Vec<String>>;
}

/// [`VersionControl`] backed by the `git` executable.
#[derive(Debug, Clone)]
pub struct SystemGit {
    root: PathBuf,
    program: PathBuf,
}

impl SystemGit {
    /// Query the repository at `root` using `git`, or the executable named
    /// by `BINSHIP_GIT_BIN` when set.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let program = env::var_os(GIT_BIN_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("git"));
        Self {
            root: root.into(),
            program,
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Run git and return trimmed stdout; spawn failures and non-zero exits
    /// become [`VersionControlError::Query`].
    fn git(&self, args: &[&str]) -> VcsResult<String> {
        let command = args.join(" ");
        let output = Command::new(&self.program)
            .args(args)
            .current_dir(&self.root)
            .output()
            .map_err(|e| VersionControlError::Query {
                command: command.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(VersionControlError::Query {
                command,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Like [`SystemGit::git`] but a non-zero exit means "no answer".
    fn git_opt(&self, args: &[&str]) -> VcsResult<Option<String>> {
        match self.git(args) {
            Ok(out) if out.is_empty() => Ok(None),
            Ok(out) => Ok(Some(out)),
            Err(VersionControlError::Query { message, .. })
                if !message.contains("not a git repository") =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// `git tag --points-at HEAD` before the first commit.
fn is_unborn_head(message: &str) -> bool {
    message.contains("malformed object name") && message.contains("HEAD")
}

impl VersionControl for SystemGit {
    fn current_tag(&self) -> VcsResult<Option<String>> {
        match self.git(&["tag", "--points-at", "HEAD", "--sort=-version:refname"]) {
            Ok(out) => Ok(out
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string)),
            // A repository without commits has nothing to tag yet.
            Err(VersionControlError::Query { message, .. }) if is_unborn_head(&message) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn is_clean(&self) -> VcsResult<bool> {
        Ok(self.git(&["status", "--porcelain"])?.is_empty())
    }

    fn remote_url(&self, remote: &str) -> VcsResult<Option<String>> {
        self.git_opt(&["remote", "get-url", remote])
    }

    fn head_commit(&self) -> VcsResult<String> {
        self.git(&["rev-parse", "HEAD"])
    }

    fn commit_date(&self) -> VcsResult<DateTime<Utc>> {
        let raw = self.git(&["log", "-1", "--format=%cI", "HEAD"])?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| VersionControlError::Query {
                command: "log -1 --format=%cI HEAD".to_string(),
                message: format!("unparseable commit date {raw:?}: {e}"),
            })
    }

    fn latest_tag(&self) -> VcsResult<Option<String>> {
        self.git_opt(&["describe", "--tags", "--abbrev=0", "HEAD"])
    }

    fn previous_tag(&self, tag: &str) -> VcsResult<Option<String>> {
        let rev = format!("{tag}^");
        self.git_opt(&["describe", "--tags", "--abbrev=0", &rev])
    }

    fn log_between(&self, from: Option<&str>, to: &str) -> VcsResult<Vec<String>> {
        let range = match from {
            Some(from) => format!("{from}..{to}"),
            None => to.to_string(),
        };
        let out = self.git(&["log", "--pretty=format:%h %s", &range])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// In-memory [`VersionControl`] with fixed answers.
#[derive(Debug, Clone)]
pub struct MemoryRepo {
    pub tag: Option<String>,
    pub latest_tag: Option<String>,
    pub previous_tag: Option<String>,
    pub clean: bool,
    pub commit: String,
    pub date: DateTime<Utc>,
    pub remote_url: Option<String>,
    pub log: Vec<String>,
    /// When false every query fails, as outside a repository.
    pub available: bool,
}

impl Default for MemoryRepo {
    fn default() -> Self {
        Self {
            tag: None,
            latest_tag: None,
            previous_tag: None,
            clean: true,
            commit: "0123456789abcdef0123456789abcdef01234567".to_string(),
            date: DateTime::<Utc>::UNIX_EPOCH,
            remote_url: None,
            log: Vec::new(),
            available: true,
        }
    }
}

impl MemoryRepo {
    /// Clean repository whose HEAD carries `tag`.
    pub fn tagged(tag: impl Into<String>) -> Self {
        let tag = tag.into();
        Self {
            latest_tag: Some(tag.clone()),
            tag: Some(tag),
            ..Self::default()
        }
    }

    /// A directory that is not a repository.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::default()
        }
    }

    pub fn dirty(mut self) -> Self {
        self.clean = false;
        self
    }

    pub fn with_remote(mut self, url: impl Into<String>) -> Self {
        self.remote_url = Some(url.into());
        self
    }

    pub fn with_previous_tag(mut self, tag: impl Into<String>) -> Self {
        self.previous_tag = Some(tag.into());
        self
    }

    pub fn with_log(mut self, lines: &[&str]) -> Self {
        self.log = lines.iter().map(|l| l.to_string()).collect();
        self
    }

    fn check(&self, command: &str) -> VcsResult<()> {
        if self.available {
            Ok(())
        } else {
            Err(VersionControlError::Query {
                command: command.to_string(),
                message: "fatal: not a git repository".to_string(),
            })
        }
    }
}

impl VersionControl for MemoryRepo {
    fn current_tag(&self) -> VcsResult<Option<String>> {
        self.check("tag")?;
        Ok(self.tag.clone())
    }

    fn is_clean(&self) -> VcsResult<bool> {
        self.check("status")?;
        Ok(self.clean)
    }

    fn remote_url(&self, _remote: &str) -> VcsResult<Option<String>> {
        self.check("remote")?;
        Ok(self.remote_url.clone())
    }

    fn head_commit(&self) -> VcsResult<String> {
        self.check("rev-parse")?;
        Ok(self.commit.clone())
    }

    fn commit_date(&self) -> VcsResult<DateTime<Utc>> {
        self.check("log")?;
        Ok(self.date)
    }

    fn latest_tag(&self) -> VcsResult<Option<String>> {
        self.check("describe")?;
        Ok(self.latest_tag.clone())
    }

    fn previous_tag(&self, _tag: &str) -> VcsResult<Option<String>> {
        self.check("describe")?;
        Ok(self.previous_tag.clone())
    }

    fn log_between(&self, _from: Option<&str>, _to: &str) -> VcsResult<Vec<String>> {
        self.check("log")?;
        Ok(self.log.clone())
    }
}
