//! `${var}` interpolation for names, commands and paths.
//!
//! Supported variables:
//! - `${project}`, `${version}`, `${tag}`, `${previous_tag}`
//! - `${major}`, `${minor}`, `${patch}`, `${prerelease}`
//! - `${commit}`, `${short_commit}`, `${date}`, `${timestamp}`, `${snapshot}`
//! - `${dist}`
//! - `${os}`, `${arch}`, `${variant}`, `${target}`, `${ext}` (per platform)
//! - `${binary}`, `${build_id}` (per build)
//! - `${env.NAME}` - project `env` entry, then the process environment
//!
//! Unknown names are left untouched so shell syntax such as `${HOME}` reaches
//! the shell intact. [`TemplateVars::render_strict`] rejects them instead and
//! is used for file and image names.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use anyhow::{Result, bail};
use binship_types::{Platform, VersionInfo};
use regex::Regex;

static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}")
        .expect("valid template regex")
});

#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    vars: BTreeMap<String, String>,
    env: BTreeMap<String, String>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Variables describing a resolved release.
    pub fn for_release(project: &str, version: &VersionInfo, snapshot: bool) -> Self {
        let mut vars = Self::new();
        vars.set("project", project)
            .set("version", &version.version)
            .set("tag", &version.tag)
            .set("previous_tag", version.previous_tag.as_deref().unwrap_or(""))
            .set("commit", &version.commit)
            .set("short_commit", &version.short_commit)
            .set("date", version.date.to_rfc3339())
            .set("timestamp", version.date.timestamp().to_string())
            .set("snapshot", snapshot.to_string());
        if let Ok(v) = semver::Version::parse(&version.version) {
            vars.set("major", v.major.to_string())
                .set("minor", v.minor.to_string())
                .set("patch", v.patch.to_string())
                .set("prerelease", v.pre.as_str());
        }
        vars
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.vars.insert(key.to_string(), value.into());
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Entries visible as `${env.NAME}` ahead of the process environment.
    pub fn with_env(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn with_platform(self, platform: &Platform) -> Self {
        self.with("os", &platform.os)
            .with("arch", &platform.arch)
            .with("variant", platform.variant.as_deref().unwrap_or(""))
            .with("target", platform.rust_target().unwrap_or(""))
            .with("ext", platform.binary_suffix())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    fn resolve(&self, name: &str) -> Option<String> {
        if let Some(key) = name.strip_prefix("env.") {
            return Some(
                self.env
                    .get(key)
                    .cloned()
                    .or_else(|| std::env::var(key).ok())
                    .unwrap_or_default(),
            );
        }
        self.vars.get(name).cloned()
    }

    /// Interpolate known variables, leaving unknown ones as written.
    pub fn render(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let name = &caps[1];
                self.resolve(name).unwrap_or_else(|| format!("${{{name}}}"))
            })
            .into_owned()
    }

    /// Interpolate, failing on the first unknown variable.
    pub fn render_strict(&self, input: &str) -> Result<String> {
        if let Some(unknown) = self.unknown_vars(input).first() {
            bail!("template {input:?}: unknown variable ${{{unknown}}}");
        }
        Ok(self.render(input))
    }

    pub fn render_all(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.render(s)).collect()
    }

    pub fn render_map(&self, map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.render(v)))
            .collect()
    }

    /// Variable names in `input` this context cannot resolve.
    pub fn unknown_vars(&self, input: &str) -> Vec<String> {
        VAR_REGEX
            .captures_iter(input)
            .map(|caps| caps[1].to_string())
            .filter(|name| self.resolve(name).is_none())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn version() -> VersionInfo {
        VersionInfo {
            version: "1.4.2".to_string(),
            tag: "v1.4.2".to_string(),
            tag_on_head: true,
            previous_tag: Some("v1.4.1".to_string()),
            commit: "abcdef0123456789".to_string(),
            short_commit: "abcdef0".to_string(),
            date: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            remote_url: None,
        }
    }

    #[test]
    fn renders_release_variables() {
        let vars = TemplateVars::for_release("tool", &version(), false);
        assert_eq!(
            vars.render("${project}_${version}_${short_commit}"),
            "tool_1.4.2_abcdef0"
        );
        assert_eq!(vars.render("${major}.${minor}.${patch}"), "1.4.2");
        assert_eq!(vars.render("${previous_tag}..${tag}"), "v1.4.1..v1.4.2");
        assert_eq!(vars.render("${timestamp}"), "1709294400");
    }

    #[test]
    fn platform_variables() {
        let vars = TemplateVars::new()
            .with_platform(&Platform::new("windows", "amd64").with_variant("simd"));
        assert_eq!(
            vars.render("${os}-${arch}-${variant}${ext} ${target}"),
            "windows-amd64-simd.exe x86_64-pc-windows-msvc"
        );
    }

    #[test]
    fn unknown_variables_pass_through_render() {
        let vars = TemplateVars::new().with("version", "1.0.0");
        assert_eq!(
            vars.render("echo ${HOME} ${version}"),
            "echo ${HOME} 1.0.0"
        );
        assert_eq!(vars.unknown_vars("${HOME} ${version}"), vec!["HOME"]);
    }

    #[test]
    fn strict_render_rejects_unknown_variables() {
        let vars = TemplateVars::new().with("project", "tool");
        let err = vars.render_strict("${project}_${verison}").unwrap_err();
        assert!(err.to_string().contains("unknown variable ${verison}"));
        assert_eq!(vars.render_strict("${project}.txt").unwrap(), "tool.txt");
    }

    #[test]
    fn env_lookup_prefers_project_env() {
        let mut env = BTreeMap::new();
        env.insert("BINSHIP_TEMPLATE_TEST".to_string(), "from-config".to_string());
        let vars = TemplateVars::new().with_env(&env);
        assert_eq!(vars.render("${env.BINSHIP_TEMPLATE_TEST}"), "from-config");
        assert_eq!(vars.render("[${env.BINSHIP_SURELY_UNSET_VAR}]"), "[]");
    }

    #[test]
    fn snapshot_versions_expose_prerelease() {
        let mut info = version();
        info.version = "1.4.2-SNAPSHOT-abcdef0".to_string();
        let vars = TemplateVars::for_release("tool", &info, true);
        assert_eq!(vars.render("${prerelease}"), "SNAPSHOT-abcdef0");
        assert_eq!(vars.render("${snapshot}"), "true");
    }

    proptest! {
        #[test]
        fn text_without_placeholders_is_unchanged(s in "[^$]*") {
            let vars = TemplateVars::for_release("tool", &version(), false);
            prop_assert_eq!(vars.render(&s), s);
        }

        #[test]
        fn rendering_known_variables_is_idempotent(key in "[a-z]{1,8}", value in "[a-zA-Z0-9._-]{0,16}") {
            let vars = TemplateVars::new().with(&key, value.clone());
            let once = vars.render(&format!("<${{{key}}}>"));
            prop_assert_eq!(&once, &format!("<{value}>"));
            prop_assert_eq!(vars.render(&once), once.clone());
        }
    }
}
