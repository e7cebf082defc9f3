//! Error taxonomy for the engine
//!
//! - `ConfigurationError` aborts plan building before anything runs
//! - `NodeFailure` is attached to one node's terminal state
//! - `FingerprintError` surfaces as a `NodeFailure` for the node being checked
//! - `CacheError` is recovered locally by the caller (treated as "no record")

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::graph::NodeId;

/// Rejected digest algorithm ids
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DigestError {
    #[error("digest algorithm id must not be empty")]
    EmptyAlgorithmId,
    #[error("unknown digest algorithm '{0}' (expected one of: blake3, sha1, sha256, sha512)")]
    UnknownAlgorithm(String),
}

/// A file changed underneath the fingerprinter
#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("cannot fingerprint '{}': it no longer exists", .path.display())]
    Vanished { path: PathBuf },
    #[error("cannot fingerprint '{}': expected a {expected}, found a {found}", .path.display())]
    TypeChanged {
        path: PathBuf,
        expected: &'static str,
        found: &'static str,
    },
    #[error("cannot fingerprint '{}': it changed while being read", .path.display())]
    ChangedWhileReading { path: PathBuf },
    #[error("cannot fingerprint '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FingerprintError {
    pub(crate) fn from_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            FingerprintError::Vanished { path }
        } else {
            FingerprintError::Io { path, source }
        }
    }
}

/// Errors from the history store and the build cache
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("store error: {0}")]
    Store(#[from] sled::Error),
    #[error("corrupt record for '{key}': {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot encode record for '{key}': {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fatal problems with the declared graph, reported before execution starts
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("circular dependency between the following nodes:\n{}", render_cycle(.cycle))]
    Cycle { cycle: Vec<NodeId> },
    #[error("cannot resolve {description} to a work node (declared by '{owner}')")]
    Unresolvable { owner: NodeId, description: String },
    #[error(
        "circular dependency container expansion while resolving '{owner}': {}",
        .path.join(" -> ")
    )]
    ContainerCycle { owner: NodeId, path: Vec<String> },
    #[error("node '{owner}' depends on unknown node '{name}'")]
    UnknownNode { owner: NodeId, name: NodeId },
    #[error("requested node '{0}' does not exist")]
    UnknownTarget(NodeId),
    #[error("node '{0}' is declared more than once")]
    DuplicateNode(NodeId),
    #[error("node '{node}' uses undeclared shared resource '{resource}'")]
    UnknownResource { node: NodeId, resource: String },
    #[error("shared resource '{0}' must allow at least one holder")]
    InvalidResource(String),
    #[error("{} configuration problems:\n{}", .0.len(), render_all(.0))]
    Multiple(Vec<ConfigurationError>),
}

impl ConfigurationError {
    /// Collapse a list of problems into one error, if there are any
    pub(crate) fn aggregate(mut errors: Vec<ConfigurationError>) -> Option<ConfigurationError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(ConfigurationError::Multiple(errors)),
        }
    }
}

fn render_cycle(cycle: &[NodeId]) -> String {
    let mut out = String::new();
    for (depth, node) in cycle.iter().enumerate() {
        out.push_str(&"  ".repeat(depth + 1));
        out.push_str(if depth == 0 { "" } else { "\\--- " });
        out.push_str(node.as_str());
        out.push('\n');
    }
    if let Some(first) = cycle.first() {
        out.push_str(&"  ".repeat(cycle.len() + 1));
        out.push_str("\\--- ");
        out.push_str(first.as_str());
        out.push_str(" (*)");
    }
    out
}

fn render_all(errors: &[ConfigurationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Why a node reached the Failed state
#[derive(Debug, Error)]
pub enum NodeFailure {
    #[error("{0:#}")]
    Action(anyhow::Error),
    #[error("action panicked: {0}")]
    Panicked(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),
    #[error("file '{}' specified for property '{property}' does not exist", .path.display())]
    MissingInput { property: String, path: PathBuf },
    #[error("could not resolve dependencies: {0}")]
    Resolution(String),
    /// The action returned after its token was cancelled; nothing was recorded
    #[error("action finished after cancellation; result discarded")]
    Abandoned,
}

/// Why a node reached the Cancelled state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// A (transitive) hard dependency failed or was cancelled
    DependencyFailed(NodeId),
    /// Fail-fast stopped the build after another node failed
    BuildAborted,
    /// The build was cancelled from outside
    Interrupted,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::DependencyFailed(node) => write!(f, "dependency '{}' did not succeed", node),
            CancelReason::BuildAborted => write!(f, "build aborted after an earlier failure"),
            CancelReason::Interrupted => write!(f, "build cancelled"),
        }
    }
}

/// Top-level error returned by `Engine::build`
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("invalid engine configuration: {0}")]
    Config(String),
}
