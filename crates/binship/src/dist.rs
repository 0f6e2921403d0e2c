//! The output directory: preparation and the run records written into it.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use binship_types::{Artifact, StageRecord, TerminalState, VersionInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::StageFailure;

pub const ARTIFACTS_FILE: &str = "artifacts.json";
pub const METADATA_FILE: &str = "metadata.json";

pub fn artifacts_path(dist: &Path) -> PathBuf {
    dist.join(ARTIFACTS_FILE)
}

pub fn metadata_path(dist: &Path) -> PathBuf {
    dist.join(METADATA_FILE)
}

/// Make `dist` an empty directory.
///
/// An existing non-empty directory is an error unless `rm_dist` is set, in
/// which case it is removed first.
pub fn prepare(dist: &Path, rm_dist: bool) -> Result<()> {
    if dist.exists() {
        if rm_dist {
            fs::remove_dir_all(dist)
                .with_context(|| format!("failed to remove {}", dist.display()))?;
        } else {
            let mut entries = fs::read_dir(dist)
                .with_context(|| format!("failed to read {}", dist.display()))?;
            if entries.next().is_some() {
                bail!(
                    "dist is not empty, remove it or use --rm-dist: {}",
                    dist.display()
                );
            }
        }
    }
    fs::create_dir_all(dist).with_context(|| format!("failed to create {}", dist.display()))
}

/// Summary of a finished run, written to `metadata.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub project_name: String,
    pub version: VersionInfo,
    pub snapshot: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub state: TerminalState,
    pub stages: Vec<StageRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<StageFailure>,
}

pub fn write_artifacts(dist: &Path, artifacts: &[Artifact]) -> Result<()> {
    write_json_atomic(&artifacts_path(dist), &artifacts)
}

pub fn read_artifacts(dist: &Path) -> Result<Vec<Artifact>> {
    let path = artifacts_path(dist);
    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn write_metadata(dist: &Path, metadata: &RunMetadata) -> Result<()> {
    write_json_atomic(&metadata_path(dist), metadata)
}

pub fn read_metadata(dist: &Path) -> Result<RunMetadata> {
    let path = metadata_path(dist);
    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value).context("failed to serialize JSON")?;
    write_atomic(path, &data)
}

/// Write through a temporary sibling and rename it into place.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    {
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("failed to create tmp file {}", tmp.display()))?;
        f.write_all(data)
            .with_context(|| format!("failed to write tmp file {}", tmp.display()))?;
        f.sync_all().ok();
    }

    fs::rename(&tmp, path).with_context(|| {
        format!(
            "failed to rename tmp file {} to {}",
            tmp.display(),
            path.display()
        )
    })
}

#[cfg(test)]
mod tests {
    use binship_types::{ArtifactKind, Platform, StageOutcome};
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn prepare_creates_missing_dist() {
        let td = tempdir().unwrap();
        let dist = td.path().join("dist");
        prepare(&dist, false).unwrap();
        assert!(dist.is_dir());
    }

    #[test]
    fn prepare_accepts_empty_dist() {
        let td = tempdir().unwrap();
        prepare(td.path(), false).unwrap();
    }

    #[test]
    fn prepare_rejects_non_empty_dist_without_rm_dist() {
        let td = tempdir().unwrap();
        let dist = td.path().join("dist");
        fs::create_dir_all(&dist).unwrap();
        fs::write(dist.join("old.tar.gz"), b"x").unwrap();

        let err = prepare(&dist, false).unwrap_err();
        assert!(
            err.to_string()
                .starts_with("dist is not empty, remove it or use --rm-dist")
        );
        assert!(dist.join("old.tar.gz").exists());
    }

    #[test]
    fn prepare_with_rm_dist_clears_previous_output() {
        let td = tempdir().unwrap();
        let dist = td.path().join("dist");
        fs::create_dir_all(dist.join("nested")).unwrap();
        fs::write(dist.join("nested/old"), b"x").unwrap();

        prepare(&dist, true).unwrap();
        assert!(dist.is_dir());
        assert_eq!(fs::read_dir(&dist).unwrap().count(), 0);
    }

    #[test]
    fn artifacts_file_round_trips() {
        let td = tempdir().unwrap();
        let artifacts = vec![
            Artifact::new(ArtifactKind::Binary, "app", td.path().join("app_linux_amd64/app"))
                .with_platform(Platform::new("linux", "amd64"))
                .with_build_id("app"),
        ];
        write_artifacts(td.path(), &artifacts).unwrap();
        assert_eq!(read_artifacts(td.path()).unwrap(), artifacts);
        assert!(!td.path().join("artifacts.json.tmp").exists());
    }

    #[test]
    fn metadata_flattens_terminal_state() {
        let td = tempdir().unwrap();
        let now = Utc::now();
        let metadata = RunMetadata {
            project_name: "app".to_string(),
            version: VersionInfo::unknown(now),
            snapshot: true,
            started_at: now,
            finished_at: now,
            state: TerminalState::Failed {
                stage: Some("build".to_string()),
                message: "failed to build app_linux_amd64: boom".to_string(),
            },
            stages: vec![StageRecord {
                stage: "build".to_string(),
                outcome: StageOutcome::Failed {
                    message: "boom".to_string(),
                },
            }],
            errors: Vec::new(),
        };
        write_metadata(td.path(), &metadata).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(metadata_path(td.path())).unwrap()).unwrap();
        assert_eq!(raw["state"], "failed");
        assert_eq!(raw["stage"], "build");
        assert_eq!(read_metadata(td.path()).unwrap(), metadata);
    }
}
