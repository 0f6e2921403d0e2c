//! # binship
//!
//! Release-build orchestration for Rust binaries: one declarative project
//! file turns a tagged commit into cross-compiled binaries, archives,
//! checksums, signatures, container images and release notes, and hands them
//! to publisher commands.
//!
//! ## Pipeline
//!
//! A run is a fixed, ordered graph of stages sharing one [`RunContext`]:
//!
//! 1. `env` checks the release token is present when something will publish.
//! 2. `validate` refuses dirty trees and HEADs the release tag doesn't point at.
//! 3. `before` runs the global hooks.
//! 4. `build` expands every build into units (os × arch × variant) and
//!    compiles them with bounded parallelism ([`build::BuildMatrixExecutor`]).
//! 5. `archive`, `checksum`, `sign` and `docker` package what was built.
//! 6. `changelog` renders the commits since the previous tag.
//! 7. `publish` runs the configured publisher commands per artifact.
//!
//! Snapshots (`--snapshot`, or `--snapshot-auto` on a dirty or untagged tree)
//! skip validation, the token check, the changelog and publishing.
//!
//! Every run leaves `artifacts.json`, `metadata.json` and `events.jsonl` in the
//! dist directory, whatever its terminal state.
//!
//! ## Example
//!
//! ```ignore
//! use binship::{BuildOptions, Orchestrator};
//!
//! let report = Orchestrator::system(".").run(
//!     &BuildOptions { snapshot: true, ..BuildOptions::default() },
//!     &mut reporter,
//! );
//! std::process::exit(report.exit_code());
//! ```

pub mod build;
pub mod context;
pub mod dist;
pub mod error;
pub mod hooks;
pub mod orchestrator;
pub mod stage;
pub mod stages;
pub mod template;
pub mod version;

pub use build::{BuildMatrixExecutor, BuildUnit, CargoCompiler, Compiler};
pub use context::{BuildOptions, RunContext, build_context};
pub use error::PipelineError;
pub use orchestrator::{Orchestrator, RunReport};
pub use stage::{Reporter, Stage, StageGraph};

pub use binship_config::{CONFIG_FILE, ConfigError, Project};
pub use binship_types::{Artifact, ArtifactKind, Platform, TerminalState, VersionInfo};
