//! The built-in stages and the graphs they are assembled into.

mod archive;
mod before;
mod build;
mod changelog;
mod checksum;
mod docker;
mod env;
mod publish;
mod sign;
mod validate;

pub use archive::ArchiveStage;
pub use before::BeforeStage;
pub use build::BuildStage;
pub use changelog::{ChangelogStage, render_changelog};
pub use checksum::{ChecksumStage, sha256_file};
pub use docker::DockerStage;
pub use env::EnvStage;
pub use publish::PublishStage;
pub use sign::SignStage;
pub use validate::ValidateStage;

use binship_git::VersionControl;

use crate::build::Compiler;
use crate::stage::StageGraph;

/// Every stage of a release, in dependency order.
pub fn release_graph<'a>(vcs: &'a dyn VersionControl, compiler: &'a dyn Compiler) -> StageGraph<'a> {
    build_graph(vcs, compiler)
        .then(ArchiveStage)
        .then(ChecksumStage)
        .then(SignStage)
        .then(DockerStage)
        .then(ChangelogStage::new(vcs))
        .then(PublishStage)
}

/// The stages up to and including compilation.
pub fn build_graph<'a>(vcs: &'a dyn VersionControl, compiler: &'a dyn Compiler) -> StageGraph<'a> {
    StageGraph::new()
        .then(EnvStage)
        .then(ValidateStage::new(vcs))
        .then(BeforeStage)
        .then(BuildStage::new(compiler))
}

/// Path of `path` relative to `base` with `/` separators, or the file name
/// when it lies outside `base`.
pub(crate) fn display_name(path: &std::path::Path, base: &std::path::Path) -> String {
    match path.strip_prefix(base) {
        Ok(rel) => rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
        Err(_) => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    }
}
