//! Kiln Core - Incremental Build Execution Engine
//!
//! Features:
//! - Content fingerprinting with pluggable digests (BLAKE3 default)
//! - Path normalization and line-ending-insensitive hashing
//! - Polymorphic dependency resolution with cycle reporting
//! - Deterministic execution plans with shared-resource constraints
//! - Parallel scheduler with fail-fast / continue and cancellation
//! - Identity-based up-to-date checks and a tiered build cache
//! - Parallel tree walking with Rayon

pub mod cache;
pub mod cancel;
pub mod config;
pub mod digest;
pub mod engine;
pub mod error;
pub mod graph;
pub mod hasher;
pub mod identity;
pub mod plan;
pub mod resolve;
pub mod runner;
pub mod scheduler;
pub mod schema;

pub use cache::{BuildCache, BuildCacheController, CacheEntry, ExecutionHistory, HistoryRecord};
pub use cancel::CancellationToken;
pub use config::{get_config_path, load_config, save_config, EngineConfig};
pub use digest::{DigestAlgorithm, DigesterCache, MutableDigester};
pub use engine::Engine;
pub use error::{CancelReason, ConfigurationError, EngineError, NodeFailure};
pub use graph::{Dependency, DependencyContainer, NodeId, ResolveContext, WorkGraph, WorkNode};
pub use hasher::{Fingerprint, Fingerprinter, Normalizer, Sensitivity};
pub use identity::{compute_identity, Identity};
pub use plan::{build_plan, BuildRequest, ExecutionPlan};
pub use resolve::{resolve_graph, ResolvedGraph};
pub use runner::{action, ExecutionContext, InputChanges, SkipReason, WorkAction};
pub use scheduler::{BuildListener, BuildResult, FailurePolicy, NodeOutcome, NodeState, Scheduler};
pub use schema::{FileInput, OutputProperty, PropertyBehavior, WorkSchema};
