//! Configuration errors and the mapping from raw TOML failures to them.

use std::ops::Range;
use std::path::PathBuf;

use thiserror::Error;
use toml_edit::{Document, InlineTable, Item, Table, Value};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: field {field} not found in type {type_name}")]
    UnknownField {
        line: usize,
        field: String,
        type_name: &'static str,
    },

    #[error("{message}")]
    Parse { message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Turn a deserialization failure into a [`ConfigError`], naming the
/// offending field and the schema type it was found in when serde rejected
/// an unknown key.
pub(crate) fn classify(src: &str, err: &toml::de::Error) -> ConfigError {
    let message = err.message();
    let Some(field) = unknown_field_name(message) else {
        return ConfigError::Parse {
            message: err.to_string().trim_end().to_string(),
        };
    };

    let offset = err.span().map(|s| s.start);
    let site = locate_key(src, &field, offset);
    let line_offset = offset
        .or_else(|| site.as_ref().and_then(|s| s.span.as_ref()).map(|r| r.start))
        .unwrap_or(0);

    ConfigError::UnknownField {
        line: line_of(src, line_offset),
        type_name: type_name_for(site.as_ref().map_or("", |s| s.table.as_str())),
        field,
    }
}

fn unknown_field_name(message: &str) -> Option<String> {
    let rest = message.split_once("unknown field `")?.1;
    let (name, _) = rest.split_once('`')?;
    Some(name.to_string())
}

fn line_of(src: &str, offset: usize) -> usize {
    let end = offset.min(src.len());
    src[..end].matches('\n').count() + 1
}

/// An occurrence of a key in the parsed document: the dotted path of the
/// table holding it (array positions dropped) and where the key was written.
#[derive(Debug)]
struct KeySite {
    table: String,
    span: Option<Range<usize>>,
}

/// Find the table that owns `field`. Among several tables using the same key
/// name, the one whose key covers (or sits closest to) `offset` wins.
fn locate_key(src: &str, field: &str, offset: Option<usize>) -> Option<KeySite> {
    let doc = Document::parse(src).ok()?;
    let mut sites = Vec::new();
    collect_table(doc.as_table(), "", field, &mut sites);

    let Some(offset) = offset else {
        return sites.into_iter().next();
    };
    let covering = sites
        .iter()
        .position(|s| s.span.as_ref().is_some_and(|r| r.contains(&offset)));
    let index = covering.or_else(|| {
        sites
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.span.as_ref().map_or(usize::MAX, |r| r.start.abs_diff(offset)))
            .map(|(i, _)| i)
    })?;
    Some(sites.swap_remove(index))
}

fn child_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

fn collect_table(table: &Table, path: &str, field: &str, sites: &mut Vec<KeySite>) {
    if let Some((key, _)) = table.get_key_value(field) {
        sites.push(KeySite {
            table: path.to_string(),
            span: key.span(),
        });
    }
    for (name, item) in table.iter() {
        let child = child_path(path, name);
        match item {
            Item::Table(t) => collect_table(t, &child, field, sites),
            Item::ArrayOfTables(tables) => {
                for t in tables.iter() {
                    collect_table(t, &child, field, sites);
                }
            }
            Item::Value(v) => collect_value(v, &child, field, sites),
            Item::None => {}
        }
    }
}

fn collect_inline(table: &InlineTable, path: &str, field: &str, sites: &mut Vec<KeySite>) {
    if let Some((key, _)) = table.get_key_value(field) {
        sites.push(KeySite {
            table: path.to_string(),
            span: key.span(),
        });
    }
    for (name, value) in table.iter() {
        collect_value(value, &child_path(path, name), field, sites);
    }
}

fn collect_value(value: &Value, path: &str, field: &str, sites: &mut Vec<KeySite>) {
    match value {
        Value::InlineTable(t) => collect_inline(t, path, field, sites),
        Value::Array(items) => {
            for v in items.iter() {
                collect_value(v, path, field, sites);
            }
        }
        _ => {}
    }
}

fn type_name_for(path: &str) -> &'static str {
    match path {
        "" => "Project",
        "before" => "Before",
        "builds" => "Build",
        "builds.hooks" => "BuildHooks",
        "builds.ignore" => "IgnoredTarget",
        "before.hooks" | "builds.hooks.pre" | "builds.hooks.post" => "Hook",
        "archive" => "Archive",
        "archive.format_overrides" => "FormatOverride",
        "checksum" => "Checksum",
        "snapshot" => "Snapshot",
        "signs" => "Sign",
        "dockers" => "Docker",
        "changelog" => "Changelog",
        "changelog.filters" => "ChangelogFilters",
        "release" => "Release",
        "publishers" => "Publisher",
        _ => "Project",
    }
}
