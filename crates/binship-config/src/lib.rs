//! Project configuration handling for binship.
//!
//! This crate loads the `.binship.toml` project file. Every table rejects
//! unknown keys, so a typo such as `foo = "bar"` fails with
//! `line 1: field foo not found in type Project` before any stage runs.
//!
//! # Example
//!
//! ```
//! use binship_config::Project;
//!
//! let project = Project::from_toml_str("project_name = \"demo\"").expect("parse");
//! assert_eq!(project.project_name, "demo");
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use binship_types::{ArtifactKind, Platform, deserialize_opt_duration, is_supported_pair};
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

mod error;

pub use error::{ConfigError, ConfigResult};

/// Default configuration file name
pub const CONFIG_FILE: &str = ".binship.toml";

pub const DEFAULT_DIST_DIR: &str = "dist";
pub const DEFAULT_ARCHIVE_TEMPLATE: &str = "${project}_${version}_${os}_${arch}";
pub const DEFAULT_CHECKSUM_TEMPLATE: &str = "${project}_${version}_checksums.txt";
pub const DEFAULT_SNAPSHOT_TEMPLATE: &str = "${version}-SNAPSHOT-${short_commit}";
pub const DEFAULT_TOKEN_ENV: &str = "GITHUB_TOKEN";

/// Get the config file path for a directory
pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

/// Root of the project document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Project {
    /// Name used in archive and checksum file names. Defaults to the project directory name.
    #[serde(default)]
    pub project_name: String,

    /// Output directory for every artifact.
    #[serde(default)]
    pub dist_dir: Option<PathBuf>,

    /// Deprecated spelling of `dist_dir`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dist: Option<PathBuf>,

    /// Environment applied to every hook, build and publisher.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub before: Before,

    #[serde(default)]
    pub builds: Vec<Build>,

    #[serde(default)]
    pub archive: Archive,

    #[serde(default)]
    pub checksum: Checksum,

    #[serde(default)]
    pub snapshot: Snapshot,

    #[serde(default)]
    pub signs: Vec<Sign>,

    #[serde(default)]
    pub dockers: Vec<Docker>,

    #[serde(default)]
    pub changelog: Changelog,

    #[serde(default)]
    pub release: Release,

    #[serde(default)]
    pub publishers: Vec<Publisher>,
}

/// Global hooks executed before the build stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Before {
    #[serde(default)]
    pub hooks: Vec<Hook>,
}

/// An external command run before or after a stage.
///
/// Accepts either a bare command string or a table:
///
/// ```toml
/// hooks = ["cargo fmt --check", { cmd = "make assets", dir = "web", output = true }]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Hook {
    pub cmd: String,
    pub dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Echo the command's output through the reporter even on success.
    pub output: bool,
    pub timeout: Option<Duration>,
}

impl Hook {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            ..Self::default()
        }
    }
}

impl<'de> Deserialize<'de> for Hook {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct HookVisitor;

        impl<'de> Visitor<'de> for HookVisitor {
            type Value = Hook;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a command string or a hook table")
            }

            fn visit_str<E: de::Error>(self, cmd: &str) -> Result<Hook, E> {
                Ok(Hook::new(cmd))
            }

            // Deserialize the table form directly so an unknown key surfaces
            // as serde's "unknown field" error rather than a variant mismatch.
            fn visit_map<A: MapAccess<'de>>(self, map: A) -> Result<Hook, A::Error> {
                HookTable::deserialize(de::value::MapAccessDeserializer::new(map)).map(Hook::from)
            }
        }

        deserializer.deserialize_any(HookVisitor)
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct HookTable {
    cmd: String,
    #[serde(default)]
    dir: Option<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    output: bool,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    timeout: Option<Duration>,
}

impl From<HookTable> for Hook {
    fn from(t: HookTable) -> Self {
        Hook {
            cmd: t.cmd,
            dir: t.dir,
            env: t.env,
            output: t.output,
            timeout: t.timeout,
        }
    }
}

/// Per-build hooks, run around the compilation of every unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildHooks {
    #[serde(default)]
    pub pre: Vec<Hook>,
    #[serde(default)]
    pub post: Vec<Hook>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IgnoredTarget {
    pub os: String,
    pub arch: String,
}

/// One declared binary and the matrix it compiles across.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Build {
    /// Unique id; defaults to the binary name.
    #[serde(default)]
    pub id: String,
    /// Cargo binary target name; defaults to `project_name`.
    #[serde(default)]
    pub binary: String,
    /// Entry point checked for syntax errors before compiling.
    #[serde(default = "default_main")]
    pub main: PathBuf,
    /// Cargo project directory, relative to the project root.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Compiler driver (`cargo`, `cross`, ...).
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_os")]
    pub os: Vec<String>,
    #[serde(default = "default_arch")]
    pub arch: Vec<String>,
    /// Extra build dimension: each entry is passed to `--features`.
    #[serde(default)]
    pub variants: Vec<String>,
    #[serde(default)]
    pub ignore: Vec<IgnoredTarget>,
    #[serde(default)]
    pub hooks: BuildHooks,
    #[serde(default)]
    pub skip: bool,
}

impl Default for Build {
    fn default() -> Self {
        Self {
            id: String::new(),
            binary: String::new(),
            main: default_main(),
            dir: None,
            command: default_command(),
            flags: Vec::new(),
            env: BTreeMap::new(),
            os: default_os(),
            arch: default_arch(),
            variants: Vec::new(),
            ignore: Vec::new(),
            hooks: BuildHooks::default(),
            skip: false,
        }
    }
}

impl Build {
    /// Platforms this build compiles for, in declaration order, with ignored
    /// and unsupported pairs removed.
    pub fn platforms(&self) -> Vec<Platform> {
        let mut out = Vec::new();
        for os in &self.os {
            for arch in &self.arch {
                if !is_supported_pair(os, arch) {
                    continue;
                }
                if self.ignore.iter().any(|i| &i.os == os && &i.arch == arch) {
                    continue;
                }
                if self.variants.is_empty() {
                    out.push(Platform::new(os.clone(), arch.clone()));
                } else {
                    for v in &self.variants {
                        out.push(Platform::new(os.clone(), arch.clone()).with_variant(v.clone()));
                    }
                }
            }
        }
        out
    }
}

fn default_main() -> PathBuf {
    PathBuf::from("src/main.rs")
}

fn default_command() -> String {
    "cargo".to_string()
}

fn default_os() -> Vec<String> {
    vec!["linux".to_string(), "darwin".to_string(), "windows".to_string()]
}

fn default_arch() -> Vec<String> {
    vec!["amd64".to_string(), "arm64".to_string()]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ArchiveFormat {
    #[default]
    #[serde(rename = "tar.gz")]
    TarGz,
    #[serde(rename = "zip")]
    Zip,
    /// Ship the raw binary without wrapping it.
    #[serde(rename = "binary")]
    Binary,
}

impl ArchiveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => ".tar.gz",
            ArchiveFormat::Zip => ".zip",
            ArchiveFormat::Binary => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FormatOverride {
    pub os: String,
    pub format: ArchiveFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Archive {
    #[serde(default)]
    pub format: ArchiveFormat,
    #[serde(default)]
    pub format_overrides: Vec<FormatOverride>,
    #[serde(default = "default_archive_template")]
    pub name_template: String,
    /// Extra files (relative to the project root) packed next to the binary.
    #[serde(default)]
    pub files: Vec<PathBuf>,
    #[serde(default)]
    pub skip: bool,
}

impl Default for Archive {
    fn default() -> Self {
        Self {
            format: ArchiveFormat::default(),
            format_overrides: Vec::new(),
            name_template: default_archive_template(),
            files: Vec::new(),
            skip: false,
        }
    }
}

impl Archive {
    pub fn format_for(&self, os: &str) -> ArchiveFormat {
        self.format_overrides
            .iter()
            .find(|o| o.os == os)
            .map(|o| o.format)
            .unwrap_or(self.format)
    }
}

fn default_archive_template() -> String {
    DEFAULT_ARCHIVE_TEMPLATE.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Checksum {
    #[serde(default = "default_checksum_template")]
    pub name_template: String,
    #[serde(default)]
    pub skip: bool,
}

impl Default for Checksum {
    fn default() -> Self {
        Self {
            name_template: default_checksum_template(),
            skip: false,
        }
    }
}

fn default_checksum_template() -> String {
    DEFAULT_CHECKSUM_TEMPLATE.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Snapshot {
    #[serde(default = "default_snapshot_template")]
    pub name_template: String,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            name_template: default_snapshot_template(),
        }
    }
}

fn default_snapshot_template() -> String {
    DEFAULT_SNAPSHOT_TEMPLATE.to_string()
}

/// Which recorded artifacts a sign or publish entry applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactFilter {
    None,
    All,
    #[default]
    Checksum,
    Archive,
    Binary,
}

impl ArtifactFilter {
    pub fn matches(&self, kind: ArtifactKind) -> bool {
        match self {
            ArtifactFilter::None => false,
            ArtifactFilter::All => matches!(
                kind,
                ArtifactKind::Binary
                    | ArtifactKind::Archive
                    | ArtifactKind::Checksum
                    | ArtifactKind::Signature
            ),
            ArtifactFilter::Checksum => kind == ArtifactKind::Checksum,
            ArtifactFilter::Archive => kind == ArtifactKind::Archive,
            ArtifactFilter::Binary => kind == ArtifactKind::Binary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Sign {
    #[serde(default = "default_sign_cmd")]
    pub cmd: String,
    #[serde(default = "default_sign_args")]
    pub args: Vec<String>,
    #[serde(default = "default_signature_template")]
    pub signature: String,
    #[serde(default)]
    pub artifacts: ArtifactFilter,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for Sign {
    fn default() -> Self {
        Self {
            cmd: default_sign_cmd(),
            args: default_sign_args(),
            signature: default_signature_template(),
            artifacts: ArtifactFilter::default(),
            env: BTreeMap::new(),
        }
    }
}

fn default_sign_cmd() -> String {
    "gpg".to_string()
}

fn default_sign_args() -> Vec<String> {
    ["--output", "${signature}", "--detach-sig", "${artifact}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_signature_template() -> String {
    "${artifact}.sig".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Docker {
    pub image_templates: Vec<String>,
    #[serde(default = "default_dockerfile")]
    pub dockerfile: PathBuf,
    /// Build context directory, relative to the project root.
    #[serde(default)]
    pub context: Option<PathBuf>,
    #[serde(default)]
    pub build_flag_templates: Vec<String>,
    #[serde(default = "default_docker_command")]
    pub command: String,
}

fn default_dockerfile() -> PathBuf {
    PathBuf::from("Dockerfile")
}

fn default_docker_command() -> String {
    "docker".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangelogSort {
    #[default]
    None,
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChangelogFilters {
    /// Regular expressions; matching commit subjects are dropped.
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Changelog {
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub sort: ChangelogSort,
    #[serde(default)]
    pub filters: ChangelogFilters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Release {
    /// Environment variable holding the publish token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Substring the `origin` remote URL must contain for a release run.
    #[serde(default)]
    pub remote: Option<String>,
    /// Whether publishing requires a token at all.
    #[serde(default)]
    pub disable: bool,
}

impl Default for Release {
    fn default() -> Self {
        Self {
            token_env: default_token_env(),
            remote: None,
            disable: false,
        }
    }
}

fn default_token_env() -> String {
    DEFAULT_TOKEN_ENV.to_string()
}

/// A user-defined publishing command, run once per matching artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Publisher {
    pub name: String,
    pub cmd: String,
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_publisher_artifacts")]
    pub artifacts: ArtifactFilter,
}

fn default_publisher_artifacts() -> ArtifactFilter {
    ArtifactFilter::All
}

impl Project {
    /// A single-build project named after `root`'s directory.
    pub fn default_for(root: &Path) -> Self {
        let mut project = Project {
            project_name: dir_name(root),
            builds: vec![Build::default()],
            ..Project::default()
        };
        project.fill_defaults(root);
        project
    }

    /// Parse a project document strictly, without filling defaults.
    pub fn from_toml_str(src: &str) -> ConfigResult<Self> {
        toml::from_str(src).map_err(|e| error::classify(src, &e))
    }

    /// Load the project for `root`.
    ///
    /// An explicit path must exist. Without one, `.binship.toml` in `root` is
    /// used when present and [`Project::default_for`] otherwise.
    pub fn load(root: &Path, explicit: Option<&Path>) -> ConfigResult<Self> {
        let path = match explicit {
            Some(p) if p.is_absolute() => Some(p.to_path_buf()),
            Some(p) => Some(root.join(p)),
            None => {
                let candidate = config_path(root);
                candidate.exists().then_some(candidate)
            }
        };

        let Some(path) = path else {
            return Ok(Self::default_for(root));
        };

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let mut project = Self::from_toml_str(&content)?;
        project.fill_defaults(root);
        project.validate()?;
        Ok(project)
    }

    /// Fill derived defaults (project name, build ids and binaries).
    pub fn fill_defaults(&mut self, root: &Path) {
        if self.project_name.is_empty() {
            self.project_name = dir_name(root);
        }
        if self.builds.is_empty() {
            self.builds.push(Build::default());
        }
        for build in &mut self.builds {
            if build.binary.is_empty() {
                build.binary = self.project_name.clone();
            }
            if build.id.is_empty() {
                build.id = build.binary.clone();
            }
        }
    }

    /// Effective output directory, relative to the project root.
    pub fn dist_dir(&self) -> PathBuf {
        self.dist_dir
            .clone()
            .or_else(|| self.dist.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DIST_DIR))
    }

    /// Notices for deprecated settings still in use.
    pub fn deprecations(&self) -> Vec<String> {
        let mut notices = Vec::new();
        if self.dist.is_some() {
            notices.push("`dist` is deprecated, use `dist_dir` instead".to_string());
        }
        notices
    }

    /// Validate semantic constraints the schema cannot express.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.project_name.trim().is_empty() {
            return Err(ConfigError::Invalid("project_name cannot be empty".into()));
        }

        let mut ids = BTreeSet::new();
        for build in &self.builds {
            if !ids.insert(build.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "found 2 builds with the id '{}', please fix your config",
                    build.id
                )));
            }
            if build.skip {
                continue;
            }
            if build.binary.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "builds[{}].binary cannot be empty",
                    build.id
                )));
            }
            if build.command.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "builds[{}].command cannot be empty",
                    build.id
                )));
            }
            if build.platforms().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "builds[{}] has no supported os/arch combination",
                    build.id
                )));
            }
            for hook in build.hooks.pre.iter().chain(&build.hooks.post) {
                validate_hook(hook, &format!("builds[{}].hooks", build.id))?;
            }
        }

        for hook in &self.before.hooks {
            validate_hook(hook, "before.hooks")?;
        }

        for (idx, docker) in self.dockers.iter().enumerate() {
            if docker.image_templates.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "dockers[{idx}].image_templates cannot be empty"
                )));
            }
        }

        for p in &self.publishers {
            if p.name.trim().is_empty() || p.cmd.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "publishers[].name and publishers[].cmd cannot be empty".into(),
                ));
            }
        }

        if self.release.token_env.trim().is_empty() {
            return Err(ConfigError::Invalid("release.token_env cannot be empty".into()));
        }

        Ok(())
    }

    /// Whether any stage will need a publish token.
    pub fn needs_token(&self) -> bool {
        !self.release.disable && !self.publishers.is_empty()
    }

    /// Generate a starter configuration file as a TOML string.
    pub fn default_toml_template(project_name: &str) -> String {
        format!(
            r#"# binship configuration file
project_name = "{project_name}"
dist_dir = "dist"

[before]
hooks = ["cargo fetch --locked"]

[[builds]]
binary = "{project_name}"
main = "src/main.rs"
os = ["linux", "darwin", "windows"]
arch = ["amd64", "arm64"]
ignore = [{{ os = "windows", arch = "arm64" }}]

[archive]
format = "tar.gz"
format_overrides = [{{ os = "windows", format = "zip" }}]
name_template = "{archive}"
files = []

[checksum]
name_template = "{checksum}"

[snapshot]
name_template = "{snapshot}"

[changelog]
sort = "asc"
filters = {{ exclude = ["^docs:", "^test:"] }}

[release]
token_env = "{token}"
"#,
            archive = DEFAULT_ARCHIVE_TEMPLATE,
            checksum = DEFAULT_CHECKSUM_TEMPLATE,
            snapshot = DEFAULT_SNAPSHOT_TEMPLATE,
            token = DEFAULT_TOKEN_ENV,
        )
    }
}

fn validate_hook(hook: &Hook, location: &str) -> ConfigResult<()> {
    if hook.cmd.trim().is_empty() {
        return Err(ConfigError::Invalid(format!(
            "{location}: hook command cannot be empty"
        )));
    }
    Ok(())
}

fn dir_name(root: &Path) -> String {
    root.canonicalize()
        .ok()
        .as_deref()
        .unwrap_or(root)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string())
}
