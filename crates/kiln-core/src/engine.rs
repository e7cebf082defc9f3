//! Engine - resolve, plan, and execute a work graph
//!
//! Holds everything that outlives a single build: the fingerprinter, the
//! execution history and the persistent build cache tiers. Each build gets
//! a fresh [`NodeRunner`] so identity claims and the in-memory cache tier
//! never leak between builds.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::cache::{
    BuildCache, BuildCacheController, ExecutionHistory, InMemoryBuildCache, InMemoryHistory, LocalBuildCache,
    SledHistory,
};
use crate::cancel::CancellationToken;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::graph::WorkGraph;
use crate::hasher::Fingerprinter;
use crate::plan::{build_plan, BuildRequest, ExecutionPlan};
use crate::resolve::resolve_graph;
use crate::runner::NodeRunner;
use crate::scheduler::{BuildListener, BuildResult, NoopListener, Scheduler};

pub struct Engine {
    config: EngineConfig,
    fingerprinter: Arc<Fingerprinter>,
    history: Arc<dyn ExecutionHistory>,
    cache_tiers: Vec<Arc<dyn BuildCache>>,
}

impl Engine {
    /// Open an engine persisting its state under the project's state dir
    pub fn open(root: &Path, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let state_dir = config.state_dir(root);
        std::fs::create_dir_all(&state_dir).map_err(crate::error::CacheError::from)?;
        let db = sled::open(state_dir.join("db")).map_err(crate::error::CacheError::from)?;
        let history: Arc<dyn ExecutionHistory> = Arc::new(SledHistory::new(&db)?);

        let mut cache_tiers: Vec<Arc<dyn BuildCache>> = Vec::new();
        if config.build_cache.enabled {
            let tier = match &config.build_cache.directory {
                Some(_) => LocalBuildCache::open(config.build_cache_dir(root))?,
                None => LocalBuildCache::new(&db)?,
            };
            cache_tiers.push(Arc::new(tier));
        }

        info!("Engine state at {:?}", state_dir);
        Ok(Self {
            fingerprinter: Arc::new(Fingerprinter::new(config.digest_algorithm)),
            config,
            history,
            cache_tiers,
        })
    }

    /// Engine with history and build cache kept in memory
    pub fn in_memory(config: EngineConfig) -> Self {
        let mut cache_tiers: Vec<Arc<dyn BuildCache>> = Vec::new();
        if config.build_cache.enabled {
            cache_tiers.push(Arc::new(InMemoryBuildCache::new()));
        }
        Self {
            fingerprinter: Arc::new(Fingerprinter::new(config.digest_algorithm)),
            history: Arc::new(InMemoryHistory::new()),
            config,
            cache_tiers,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn fingerprinter(&self) -> &Arc<Fingerprinter> {
        &self.fingerprinter
    }

    /// Resolve the graph and build the plan without executing anything
    pub fn plan(&self, graph: WorkGraph, request: &BuildRequest) -> Result<ExecutionPlan, EngineError> {
        let resolved = resolve_graph(graph)?;
        Ok(build_plan(&resolved, request)?)
    }

    pub async fn build(&self, graph: WorkGraph, request: &BuildRequest) -> Result<BuildResult, EngineError> {
        self.build_with(graph, request, &CancellationToken::new(), Arc::new(NoopListener))
            .await
    }

    /// Build, observing `cancel` and reporting node events to `listener`
    ///
    /// Configuration errors abort before any node runs; node failures are
    /// reported through the returned [`BuildResult`].
    pub async fn build_with(
        &self,
        graph: WorkGraph,
        request: &BuildRequest,
        cancel: &CancellationToken,
        listener: Arc<dyn BuildListener>,
    ) -> Result<BuildResult, EngineError> {
        let plan = self.plan(graph, request)?;
        info!("Executing {} nodes with {} workers", plan.len(), self.config.workers());

        let controller = self
            .cache_tiers
            .iter()
            .fold(BuildCacheController::new(), |controller, tier| {
                controller.with_tier(Arc::clone(tier))
            });
        let runner = NodeRunner::new(Arc::clone(&self.fingerprinter), Arc::clone(&self.history), controller);

        let scheduler = Scheduler::new(self.config.workers())
            .failure_policy(self.config.failure_policy)
            .default_timeout(self.config.default_timeout());
        Ok(scheduler
            .execute_with(&plan, Arc::new(runner), cancel, listener)
            .await)
    }

    /// Forget every execution record and cached result
    pub fn clear_cache(&self) -> Result<(), EngineError> {
        self.history.clear()?;
        for tier in &self.cache_tiers {
            tier.clear()?;
        }
        info!("Cache cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigurationError;
    use crate::graph::WorkNode;
    use crate::runner::{action, SkipReason};
    use crate::scheduler::{FailurePolicy, NodeState};
    use crate::schema::{FileInput, OutputProperty, WorkSchema};
    use crate::error::NodeFailure;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Node that concatenates its inputs into `out`, counting executions
    fn concat(id: &str, inputs: &[PathBuf], out: PathBuf, runs: &Arc<AtomicUsize>) -> WorkNode {
        let mut schema = WorkSchema::builder();
        for (i, input) in inputs.iter().enumerate() {
            schema = schema.file(FileInput::file(format!("in{}", i), input));
        }
        let schema = schema.output(OutputProperty::file("out", &out)).build();

        let (sources, runs) = (inputs.to_vec(), Arc::clone(runs));
        WorkNode::new(
            id,
            action(move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
                let mut text = String::new();
                for source in &sources {
                    text.push_str(&std::fs::read_to_string(source)?);
                }
                std::fs::write(&out, text)?;
                Ok(())
            }),
        )
        .implementation(format!("concat:{}", id))
        .schema(schema)
    }

    fn diamond(root: &Path, runs: &Arc<AtomicUsize>) -> WorkGraph {
        let src = root.join("src.txt");
        let (a, b, c, d) = (root.join("a"), root.join("b"), root.join("c"), root.join("d"));
        let mut graph = WorkGraph::new();
        graph.add_node(concat("A", &[src], a.clone(), runs)).unwrap();
        graph
            .add_node(concat("B", &[a.clone()], b.clone(), runs).depends_on("A"))
            .unwrap();
        graph.add_node(concat("C", &[a], c.clone(), runs).depends_on("A")).unwrap();
        graph
            .add_node(concat("D", &[b, c], d, runs).depends_on("B").depends_on("C"))
            .unwrap();
        graph
    }

    #[tokio::test]
    async fn test_second_build_is_all_up_to_date() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("src.txt"), "x").unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();

        let first = engine.build(diamond(dir.path(), &runs), &BuildRequest::all()).await.unwrap();
        assert!(first.is_success());
        assert_eq!(first.count(NodeState::Succeeded), 4);
        assert_eq!(std::fs::read_to_string(dir.path().join("d")).unwrap(), "xx");

        let second = engine.build(diamond(dir.path(), &runs), &BuildRequest::all()).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 4);
        assert!(second
            .outcomes
            .iter()
            .all(|o| o.skip_reason == Some(SkipReason::UpToDate)));
    }

    #[tokio::test]
    async fn test_source_change_reruns_downstream() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("src.txt"), "x").unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let engine = Engine::in_memory(EngineConfig::default());

        engine.build(diamond(dir.path(), &runs), &BuildRequest::all()).await.unwrap();
        std::fs::write(dir.path().join("src.txt"), "y").unwrap();
        let result = engine.build(diamond(dir.path(), &runs), &BuildRequest::all()).await.unwrap();

        assert_eq!(result.count(NodeState::Succeeded), 4);
        assert_eq!(std::fs::read_to_string(dir.path().join("d")).unwrap(), "yy");
    }

    #[tokio::test]
    async fn test_deleted_output_restored_from_cache() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("src.txt"), "x").unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();

        engine.build(diamond(dir.path(), &runs), &BuildRequest::all()).await.unwrap();
        std::fs::remove_file(dir.path().join("d")).unwrap();

        let result = engine.build(diamond(dir.path(), &runs), &BuildRequest::all()).await.unwrap();
        let d = result.outcome(&"D".into()).unwrap();
        assert_eq!(d.skip_reason, Some(SkipReason::FromCache));
        assert_eq!(runs.load(Ordering::SeqCst), 4);
        assert_eq!(std::fs::read_to_string(dir.path().join("d")).unwrap(), "xx");
    }

    #[tokio::test]
    async fn test_cycle_rejected_before_execution() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut graph = WorkGraph::new();
        for (id, dep) in [("a", "b"), ("b", "a")] {
            let runs = Arc::clone(&runs);
            graph
                .add_node(
                    WorkNode::new(
                        id,
                        action(move |_| {
                            runs.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }),
                    )
                    .depends_on(dep),
                )
                .unwrap();
        }

        let engine = Engine::in_memory(EngineConfig::default());
        let err = engine.build(graph, &BuildRequest::all()).await.unwrap_err();
        assert!(matches!(err, EngineError::Configuration(ConfigurationError::Cycle { .. })));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_identical_work_runs_once_per_build() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.txt");
        std::fs::write(&src, "same").unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        // Same implementation and inputs, outputs at different locations
        let mut graph = WorkGraph::new();
        for id in ["left", "right"] {
            let runs = Arc::clone(&runs);
            let (from, out) = (src.clone(), dir.path().join(format!("{}.out", id)));
            let schema = WorkSchema::builder()
                .file(FileInput::file("src", &src))
                .output(OutputProperty::file("out", &out))
                .build();
            graph
                .add_node(
                    WorkNode::new(
                        id,
                        action(move |_| {
                            runs.fetch_add(1, Ordering::SeqCst);
                            std::fs::copy(&from, &out)?;
                            Ok(())
                        }),
                    )
                    .implementation("copy")
                    .schema(schema),
                )
                .unwrap();
        }

        let config = EngineConfig {
            workers: Some(2),
            ..EngineConfig::default()
        };
        let result = Engine::in_memory(config).build(graph, &BuildRequest::all()).await.unwrap();
        assert!(result.is_success());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        for id in ["left", "right"] {
            assert_eq!(std::fs::read_to_string(dir.path().join(format!("{}.out", id))).unwrap(), "same");
        }
    }

    #[tokio::test]
    async fn test_failures_are_aggregated() {
        let mut graph = WorkGraph::new();
        for id in ["one", "two"] {
            graph
                .add_node(WorkNode::new(id, action(|_| anyhow::bail!("broken"))).implementation(id))
                .unwrap();
        }
        let config = EngineConfig {
            failure_policy: FailurePolicy::Continue,
            ..EngineConfig::default()
        };
        let result = Engine::in_memory(config).build(graph, &BuildRequest::all()).await.unwrap();
        assert_eq!(result.failures().len(), 2);
    }

    /// Writes `out` after `delay`, ignoring cancellation
    fn slow_writer(out: PathBuf, delay: Duration, runs: &Arc<AtomicUsize>) -> WorkNode {
        let (target, runs) = (out.clone(), Arc::clone(runs));
        WorkNode::new(
            "slow",
            action(move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(delay);
                std::fs::write(&target, "late")?;
                Ok(())
            }),
        )
        .implementation("slow")
        .schema(WorkSchema::builder().output(OutputProperty::file("out", out)).build())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_out_node_reruns_next_build() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.txt");
        let runs = Arc::new(AtomicUsize::new(0));
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();

        for _ in 0..2 {
            let mut graph = WorkGraph::new();
            graph
                .add_node(slow_writer(out.clone(), Duration::from_millis(300), &runs).timeout(Duration::from_millis(50)))
                .unwrap();
            let result = engine.build(graph, &BuildRequest::all()).await.unwrap();
            let outcome = &result.outcomes[0];
            assert_eq!(outcome.state, NodeState::Failed);
            assert!(matches!(outcome.failure, Some(NodeFailure::Timeout(_))));
            assert_eq!(outcome.skip_reason, None);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_node_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.txt");
        let runs = Arc::new(AtomicUsize::new(0));
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();

        for _ in 0..2 {
            let (target, counter) = (out.clone(), Arc::clone(&runs));
            let node = WorkNode::new(
                "half",
                action(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    std::fs::write(&target, "partial")?;
                    anyhow::bail!("linker crashed")
                }),
            )
            .implementation("half")
            .schema(WorkSchema::builder().output(OutputProperty::file("out", &out)).build());
            let mut graph = WorkGraph::new();
            graph.add_node(node).unwrap();

            let result = engine.build(graph, &BuildRequest::all()).await.unwrap();
            assert_eq!(result.outcomes[0].state, NodeState::Failed);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_clear_cache_forces_rerun() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("src.txt"), "x").unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let config = EngineConfig {
            build_cache: crate::config::BuildCacheConfig {
                enabled: false,
                directory: None,
            },
            ..EngineConfig::default()
        };
        let engine = Engine::open(dir.path(), config).unwrap();

        engine.build(diamond(dir.path(), &runs), &BuildRequest::all()).await.unwrap();
        engine.clear_cache().unwrap();
        engine.build(diamond(dir.path(), &runs), &BuildRequest::all()).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 8);
    }
}
