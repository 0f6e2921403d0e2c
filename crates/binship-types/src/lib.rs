//! Core domain types for binship.
//!
//! This crate provides the types shared across the binship workspace:
//! artifacts produced by pipeline stages, build platforms, resolved version
//! information, stage outcomes and the run event vocabulary.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// How a fan-out (build matrix, hook sequence) reacts to a failing member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// The first failure stops the sequence and is returned to the caller.
    #[default]
    FailFast,
    /// Failures are recorded and the remaining members still run.
    FailSoft,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::FailFast => write!(f, "fail-fast"),
            FailurePolicy::FailSoft => write!(f, "fail-soft"),
        }
    }
}

/// Known `(os, arch)` pairs and the Rust target triple each one compiles to.
const TARGETS: &[(&str, &str, &str)] = &[
    ("linux", "amd64", "x86_64-unknown-linux-gnu"),
    ("linux", "arm64", "aarch64-unknown-linux-gnu"),
    ("linux", "386", "i686-unknown-linux-gnu"),
    ("linux", "armv7", "armv7-unknown-linux-gnueabihf"),
    ("darwin", "amd64", "x86_64-apple-darwin"),
    ("darwin", "arm64", "aarch64-apple-darwin"),
    ("windows", "amd64", "x86_64-pc-windows-msvc"),
    ("windows", "arm64", "aarch64-pc-windows-msvc"),
    ("windows", "386", "i686-pc-windows-msvc"),
    ("freebsd", "amd64", "x86_64-unknown-freebsd"),
];

/// A target platform a build unit compiles for.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub arch: String,
    /// Additional build dimension (a cargo feature set), if the build declares any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
            variant: None,
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    /// Stable identifier, e.g. `linux_amd64` or `linux_amd64_simd`.
    pub fn id(&self) -> String {
        match &self.variant {
            Some(v) => format!("{}_{}_{}", self.os, self.arch, v),
            None => format!("{}_{}", self.os, self.arch),
        }
    }

    /// Rust target triple for this platform, or `None` when the pair is unsupported.
    pub fn rust_target(&self) -> Option<&'static str> {
        TARGETS
            .iter()
            .find(|(os, arch, _)| *os == self.os && *arch == self.arch)
            .map(|(_, _, triple)| *triple)
    }

    /// Executable suffix for binaries built for this platform.
    pub fn binary_suffix(&self) -> &'static str {
        if self.os == "windows" { ".exe" } else { "" }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

/// Whether an `(os, arch)` pair has a known target triple.
pub fn is_supported_pair(os: &str, arch: &str) -> bool {
    TARGETS.iter().any(|(o, a, _)| *o == os && *a == arch)
}

/// Kind of file (or image) a stage recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Binary,
    Archive,
    Checksum,
    Signature,
    DockerImage,
    Changelog,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArtifactKind::Binary => "binary",
            ArtifactKind::Archive => "archive",
            ArtifactKind::Checksum => "checksum",
            ArtifactKind::Signature => "signature",
            ArtifactKind::DockerImage => "docker_image",
            ArtifactKind::Changelog => "changelog",
        };
        f.write_str(s)
    }
}

/// An output produced by a stage and recorded for consumption by later stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub path: PathBuf,
    pub kind: ArtifactKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    /// `id` of the `[[builds]]` entry this artifact descends from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
    /// Stage-specific metadata (checksum value, docker tag, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl Artifact {
    pub fn new(kind: ArtifactKind, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            kind,
            platform: None,
            build_id: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn with_build_id(mut self, build_id: impl Into<String>) -> Self {
        self.build_id = Some(build_id.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Release identity resolved once per run from version-control state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Semantic version without the leading `v`.
    pub version: String,
    pub tag: String,
    /// Whether HEAD carries `tag`. False when a release proceeds from an
    /// untagged commit, in which case `tag` only names the version.
    #[serde(default)]
    pub tag_on_head: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_tag: Option<String>,
    pub commit: String,
    pub short_commit: String,
    pub date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
}

impl VersionInfo {
    /// Placeholder identity used when version control is unavailable.
    pub fn unknown(date: DateTime<Utc>) -> Self {
        Self {
            version: "0.0.0".to_string(),
            tag: "v0.0.0".to_string(),
            tag_on_head: false,
            previous_tag: None,
            commit: "none".to_string(),
            short_commit: "none".to_string(),
            date,
            remote_url: None,
        }
    }
}

/// What happened to a stage when the graph reached it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    /// Stage logic was invoked and returned successfully.
    Ran { elapsed_ms: u64 },
    /// A governing flag or condition made the stage a no-op; its logic never ran.
    Skipped { reason: String },
    /// Stage logic was invoked and failed.
    Failed { message: String },
}

impl StageOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, StageOutcome::Skipped { .. })
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageOutcome::Ran { elapsed_ms } => write!(f, "ran ({elapsed_ms}ms)"),
            StageOutcome::Skipped { reason } => write!(f, "skipped: {reason}"),
            StageOutcome::Failed { .. } => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: String,
    #[serde(flatten)]
    pub outcome: StageOutcome,
}

/// Final state of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TerminalState {
    Completed,
    Failed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
        message: String,
    },
    Cancelled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
        reason: String,
    },
}

impl TerminalState {
    pub fn is_success(&self) -> bool {
        matches!(self, TerminalState::Completed)
    }
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalState::Completed => write!(f, "completed"),
            TerminalState::Failed { .. } => write!(f, "failed"),
            TerminalState::Cancelled { .. } => write!(f, "cancelled"),
        }
    }
}

/// Event types for the run event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    RunStarted { version: String, snapshot: bool },
    StageStarted,
    StageSkipped { reason: String },
    StageFinished { elapsed_ms: u64 },
    StageFailed { message: String },
    UnitStarted { unit: String },
    UnitFinished { unit: String, artifact: String },
    UnitFailed { unit: String, message: String },
    HookExecuted { cmd: String, exit_code: i32 },
    RunFinished { state: TerminalState },
}

/// A single entry in the run event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event_type: EventType,
    /// Stage this event relates to (or "run" for run-level events).
    pub stage: String,
}

impl RunEvent {
    pub fn now(stage: impl Into<String>, event_type: EventType) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            stage: stage.into(),
        }
    }
}

/// Serialize a duration as a human readable string (`1m 30s`).
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
}

/// Deserialize a duration from a human readable string (`90s`, `2m`).
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

pub fn serialize_opt_duration<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match duration {
        Some(d) => serialize_duration(d, serializer),
        None => serializer.serialize_none(),
    }
}

pub fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: Option<String> = Option::deserialize(deserializer)?;
    s.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
        .transpose()
}
