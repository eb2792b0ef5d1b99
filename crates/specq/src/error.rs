//! Structurally meaningful error kinds that call sites branch on.
//!
//! Everything else (I/O, YAML parsing, store failures bubbling out of a
//! command) is propagated as `anyhow::Result` with `.context(...)`
//! annotations added at each boundary instead of a dedicated type.

use thiserror::Error;

/// Failure building or validating the change-dependency graph.
///
/// A [`DAGError`] aborts the pipeline run before any work is dispatched —
/// it is a statement about the whole environment, not one change.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DAGError {
    #[error("change {from:?} depends on unknown change {dep:?}")]
    UnknownDependency { from: String, dep: String },

    #[error("dependency cycle detected: {0}")]
    Cycle(String),
}

/// Failure scanning one change directory. A directory only reaches
/// [`crate::scanner::scan_one`] once it looks like a real change (it has
/// a `proposal.md`), so an I/O or front-matter error here means the
/// directory is broken, not absent — it aborts the whole scan.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed front-matter in {path}: {source}")]
    FrontMatter {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}
