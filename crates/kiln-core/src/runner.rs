//! Node Runner - decide skip vs execute, then record the result
//!
//! For each tracked node:
//! 1. snapshot inputs; every primary input empty means "no source"
//! 2. compute the identity and compare with the history record
//! 3. unchanged identity and outputs means up to date
//! 4. otherwise claim the identity and try the build cache
//! 5. otherwise execute, then record history and populate the cache
//!
//! Unreadable history is logged and treated as "no record", forcing
//! execution rather than a false skip.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{now_secs, BuildCacheController, CacheEntry, ExecutionHistory, HistoryRecord};
use crate::cancel::CancellationToken;
use crate::error::NodeFailure;
use crate::graph::{NodeId, WorkNode};
use crate::hasher::{Fingerprint, Fingerprinter};
use crate::identity::{compute_identity, Claim, Identity, IdentityRegistry};
use crate::schema::{InputSnapshot, OutputSnapshot, PropertyBehavior};

/// The executable part of a work node
pub trait WorkAction: Send + Sync {
    fn execute(&self, context: &ExecutionContext) -> anyhow::Result<()>;

    /// Enters the node's identity; changing it invalidates previous results
    fn implementation_id(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

/// A closure used as a [`WorkAction`]
pub struct FnAction<F>(F);

/// Wrap a closure as a work action
pub fn action<F>(f: F) -> FnAction<F>
where
    F: Fn(&ExecutionContext) -> anyhow::Result<()> + Send + Sync,
{
    FnAction(f)
}

impl<F> WorkAction for FnAction<F>
where
    F: Fn(&ExecutionContext) -> anyhow::Result<()> + Send + Sync,
{
    fn execute(&self, context: &ExecutionContext) -> anyhow::Result<()> {
        (self.0)(context)
    }
}

/// Files of incremental properties that changed since the last execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputChanges {
    /// No usable history; treat every input as new
    pub full_rebuild: bool,
    pub added: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

impl InputChanges {
    pub fn full_rebuild() -> Self {
        Self {
            full_rebuild: true,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.full_rebuild && self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    fn between(
        previous: &BTreeMap<String, BTreeMap<String, Fingerprint>>,
        current: &BTreeMap<String, BTreeMap<String, Fingerprint>>,
    ) -> Self {
        let mut changes = Self::default();
        let empty = BTreeMap::new();
        for (property, files) in current {
            let before = previous.get(property).unwrap_or(&empty);
            for (path, fingerprint) in files {
                match before.get(path) {
                    None => changes.added.push(PathBuf::from(path)),
                    Some(old) if old != fingerprint => changes.modified.push(PathBuf::from(path)),
                    Some(_) => {}
                }
            }
            for path in before.keys().filter(|p| !files.contains_key(*p)) {
                changes.removed.push(PathBuf::from(path));
            }
        }
        changes
    }
}

/// What an action sees while executing
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    node: NodeId,
    cancellation: CancellationToken,
    changes: InputChanges,
}

impl ExecutionContext {
    pub fn new(node: NodeId, cancellation: CancellationToken, changes: InputChanges) -> Self {
        Self {
            node,
            cancellation,
            changes,
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Fired on build cancellation or when the node times out
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn changes(&self) -> &InputChanges {
        &self.changes
    }
}

/// Why a node was skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    UpToDate,
    FromCache,
    NoSource,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::UpToDate => "UP-TO-DATE",
            SkipReason::FromCache => "FROM-CACHE",
            SkipReason::NoSource => "NO-SOURCE",
        })
    }
}

/// Successful end of one node
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Executed {
        outputs: BTreeMap<String, OutputSnapshot>,
    },
    Skipped {
        reason: SkipReason,
        outputs: BTreeMap<String, OutputSnapshot>,
    },
}

/// Runs one node to completion on a blocking worker
pub trait NodeExecutor: Send + Sync {
    fn run(&self, node: &WorkNode, cancellation: &CancellationToken) -> Result<Completion, NodeFailure>;
}

/// Identity-aware executor backed by execution history and the build cache
pub struct NodeRunner {
    fingerprinter: Arc<Fingerprinter>,
    history: Arc<dyn ExecutionHistory>,
    build_cache: BuildCacheController,
    identities: IdentityRegistry,
}

impl NodeRunner {
    pub fn new(
        fingerprinter: Arc<Fingerprinter>,
        history: Arc<dyn ExecutionHistory>,
        build_cache: BuildCacheController,
    ) -> Self {
        Self {
            fingerprinter,
            history,
            build_cache,
            identities: IdentityRegistry::new(),
        }
    }

    fn load_history(&self, id: &NodeId) -> Option<HistoryRecord> {
        match self.history.load(id) {
            Ok(record) => record,
            Err(e) => {
                warn!(node = %id, "ignoring unreadable execution history: {}", e);
                None
            }
        }
    }

    fn record(&self, node: &WorkNode, record: HistoryRecord) {
        if let Err(e) = self.history.store(node.id(), &record) {
            warn!(node = %node.id(), "could not record execution history: {}", e);
        }
    }

    fn history_record(
        &self,
        node: &WorkNode,
        identity: &Identity,
        inputs: &InputSnapshot,
        outputs: &BTreeMap<String, OutputSnapshot>,
        duration_ms: u64,
    ) -> HistoryRecord {
        HistoryRecord {
            identity: identity.clone(),
            implementation: node.implementation_id().to_string(),
            inputs: inputs
                .properties()
                .iter()
                .map(|(name, p)| (name.clone(), p.fingerprint.clone()))
                .collect(),
            outputs: outputs.clone(),
            incremental_inputs: inputs.incremental_files(),
            recorded_at: now_secs(),
            duration_ms,
        }
    }

    /// Restore outputs from the build cache, if an entry exists
    fn try_restore(
        &self,
        node: &WorkNode,
        identity: &Identity,
        inputs: &InputSnapshot,
    ) -> Option<BTreeMap<String, OutputSnapshot>> {
        let entry = self.build_cache.load(identity)?;
        let schema = node.work_schema();
        if let Err(e) = entry.restore(schema.outputs()) {
            warn!(node = %node.id(), identity = %identity, "could not restore cached outputs: {}", e);
            return None;
        }
        match schema.snapshot_outputs(&self.fingerprinter) {
            Ok(outputs) if !entry.matches(&outputs) => {
                warn!(node = %node.id(), identity = %identity, "restored outputs differ from the cache entry");
                None
            }
            Ok(outputs) => {
                let record = self.history_record(node, identity, inputs, &outputs, 0);
                self.record(node, record);
                Some(outputs)
            }
            Err(e) => {
                warn!(node = %node.id(), "restored outputs could not be fingerprinted: {}", e);
                None
            }
        }
    }

    /// Changes to report to an incremental action
    fn input_changes(
        &self,
        node: &WorkNode,
        previous: Option<&HistoryRecord>,
        inputs: &InputSnapshot,
        outputs: &BTreeMap<String, OutputSnapshot>,
    ) -> InputChanges {
        let Some(previous) = previous else {
            return InputChanges::full_rebuild();
        };
        let current = inputs.incremental_files();
        if current.is_empty() || previous.implementation != node.implementation_id() {
            return InputChanges::full_rebuild();
        }
        // Only incremental properties may differ
        let others_unchanged = inputs
            .properties()
            .iter()
            .filter(|(_, p)| p.behavior != PropertyBehavior::Incremental)
            .all(|(name, p)| previous.inputs.get(name) == Some(&p.fingerprint))
            && previous.inputs.len() == inputs.properties().len();
        if !others_unchanged || previous.outputs != *outputs {
            return InputChanges::full_rebuild();
        }
        InputChanges::between(&previous.incremental_inputs, &current)
    }

    fn execute(&self, node: &WorkNode, cancellation: &CancellationToken, changes: InputChanges) -> Result<u64, NodeFailure> {
        let context = ExecutionContext::new(node.id().clone(), cancellation.clone(), changes);
        let start = Instant::now();
        info!(node = %node.id(), "executing");
        node.action().execute(&context).map_err(NodeFailure::Action)?;
        Ok(start.elapsed().as_millis() as u64)
    }
}

impl NodeExecutor for NodeRunner {
    fn run(&self, node: &WorkNode, cancellation: &CancellationToken) -> Result<Completion, NodeFailure> {
        let schema = node.work_schema();

        if schema.is_untracked() {
            self.execute(node, cancellation, InputChanges::full_rebuild())?;
            let outputs = schema.snapshot_outputs(&self.fingerprinter)?;
            return Ok(Completion::Executed { outputs });
        }

        let inputs = schema.snapshot_inputs(&self.fingerprinter)?;
        if inputs.has_no_source() {
            debug!(node = %node.id(), "skipping: no source");
            return Ok(Completion::Skipped {
                reason: SkipReason::NoSource,
                outputs: BTreeMap::new(),
            });
        }

        let identity = compute_identity(
            &self.fingerprinter,
            node.implementation_id(),
            &inputs,
            schema.outputs(),
        );
        let previous = self.load_history(node.id());
        let outputs = schema.snapshot_outputs(&self.fingerprinter)?;

        if let Some(record) = &previous {
            if record.identity == identity && record.outputs == outputs {
                debug!(node = %node.id(), identity = %identity.as_str(), "up to date");
                return Ok(Completion::Skipped {
                    reason: SkipReason::UpToDate,
                    outputs,
                });
            }
        }

        let guard = match self.identities.claim(&identity) {
            Claim::Leader(guard) => Some(guard),
            Claim::Follower => None,
        };
        if let Some(restored) = self.try_restore(node, &identity, &inputs) {
            debug!(node = %node.id(), identity = %identity.as_str(), "outputs restored from build cache");
            if let Some(guard) = guard {
                guard.complete();
            }
            return Ok(Completion::Skipped {
                reason: SkipReason::FromCache,
                outputs: restored,
            });
        }

        let changes = self.input_changes(node, previous.as_ref(), &inputs, &outputs);
        let duration_ms = self.execute(node, cancellation, changes)?;
        if cancellation.is_cancelled() {
            // Timed out or interrupted mid-run; outputs may be partial
            debug!(node = %node.id(), "discarding result of cancelled execution");
            return Err(NodeFailure::Abandoned);
        }

        let outputs = schema.snapshot_outputs(&self.fingerprinter)?;
        let record = self.history_record(node, &identity, &inputs, &outputs, duration_ms);
        self.record(node, record);

        match CacheEntry::capture(&identity, schema.outputs(), &outputs) {
            Ok(entry) => {
                self.build_cache.store(&identity, &entry);
                if let Some(guard) = guard {
                    guard.complete();
                }
            }
            Err(e) => warn!(node = %node.id(), "could not capture outputs for the build cache: {}", e),
        }

        Ok(Completion::Executed { outputs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{BuildCache, InMemoryHistory, LocalBuildCache};
    use crate::schema::{FileInput, OutputProperty, WorkSchema};
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn runner(history: &Arc<InMemoryHistory>) -> NodeRunner {
        NodeRunner::new(
            Arc::new(Fingerprinter::default()),
            Arc::clone(history) as Arc<dyn ExecutionHistory>,
            BuildCacheController::new(),
        )
    }

    /// Copies `src` to `out`, counting executions
    fn copy_node(id: &str, src: &Path, out: &Path, runs: &Arc<AtomicUsize>) -> WorkNode {
        let (from, to, runs) = (src.to_path_buf(), out.to_path_buf(), Arc::clone(runs));
        WorkNode::new(
            id,
            action(move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
                fs::copy(&from, &to)?;
                Ok(())
            }),
        )
        .implementation("copy")
        .schema(
            WorkSchema::builder()
                .file(FileInput::file("source", src))
                .output(OutputProperty::file("target", out))
                .build(),
        )
    }

    #[test]
    fn test_second_run_is_up_to_date() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("in.txt");
        fs::write(&src, b"payload").unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let node = copy_node("copy", &src, &dir.path().join("out.txt"), &runs);
        let history = Arc::new(InMemoryHistory::new());
        let token = CancellationToken::new();

        assert!(matches!(runner(&history).run(&node, &token).unwrap(), Completion::Executed { .. }));
        let second = runner(&history).run(&node, &token).unwrap();
        assert!(matches!(second, Completion::Skipped { reason: SkipReason::UpToDate, .. }));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_changed_input_or_output_reexecutes() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("in.txt");
        let out = dir.path().join("out.txt");
        fs::write(&src, b"v1").unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let node = copy_node("copy", &src, &out, &runs);
        let history = Arc::new(InMemoryHistory::new());
        let token = CancellationToken::new();

        runner(&history).run(&node, &token).unwrap();
        fs::write(&src, b"v2").unwrap();
        runner(&history).run(&node, &token).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        fs::write(&out, b"tampered").unwrap();
        runner(&history).run(&node, &token).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(fs::read(&out).unwrap(), b"v2");
    }

    #[test]
    fn test_corrupt_history_forces_execution() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("in.txt");
        fs::write(&src, b"x").unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let node = copy_node("copy", &src, &dir.path().join("out.txt"), &runs);
        let history = Arc::new(InMemoryHistory::new());
        let token = CancellationToken::new();

        runner(&history).run(&node, &token).unwrap();
        history.insert_raw(node.id(), b"\x00garbage".to_vec());
        let again = runner(&history).run(&node, &token).unwrap();
        assert!(matches!(again, Completion::Executed { .. }));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_restores_from_build_cache() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("in.txt");
        let out = dir.path().join("out.txt");
        fs::write(&src, b"cached").unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let node = copy_node("copy", &src, &out, &runs);
        let tier = Arc::new(LocalBuildCache::open(dir.path().join("cache")).unwrap());
        let token = CancellationToken::new();

        let first = NodeRunner::new(
            Arc::new(Fingerprinter::default()),
            Arc::new(InMemoryHistory::new()),
            BuildCacheController::new().with_tier(tier.clone()),
        );
        first.run(&node, &token).unwrap();
        fs::remove_file(&out).unwrap();

        // Fresh history: only the build cache knows this identity
        let second = NodeRunner::new(
            Arc::new(Fingerprinter::default()),
            Arc::new(InMemoryHistory::new()),
            BuildCacheController::new().with_tier(tier),
        );
        let completion = second.run(&node, &token).unwrap();
        assert!(matches!(completion, Completion::Skipped { reason: SkipReason::FromCache, .. }));
        assert_eq!(fs::read(&out).unwrap(), b"cached");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_corrupt_cache_entry_is_not_trusted() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("in.txt");
        let out = dir.path().join("out.txt");
        fs::write(&src, b"genuine").unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let node = copy_node("copy", &src, &out, &runs);
        let tier = Arc::new(LocalBuildCache::open(dir.path().join("cache")).unwrap());
        let history = Arc::new(InMemoryHistory::new());
        let token = CancellationToken::new();

        NodeRunner::new(
            Arc::new(Fingerprinter::default()),
            Arc::clone(&history) as Arc<dyn ExecutionHistory>,
            BuildCacheController::new().with_tier(tier.clone()),
        )
        .run(&node, &token)
        .unwrap();
        let identity = history.load(node.id()).unwrap().unwrap().identity;
        let mut entry = tier.load(&identity).unwrap().unwrap();
        entry.outputs[0].files[0].contents = b"corrupt".to_vec();
        tier.store(&identity, &entry).unwrap();
        fs::remove_file(&out).unwrap();

        let second = NodeRunner::new(
            Arc::new(Fingerprinter::default()),
            Arc::new(InMemoryHistory::new()),
            BuildCacheController::new().with_tier(tier),
        );
        let completion = second.run(&node, &token).unwrap();
        assert!(matches!(completion, Completion::Executed { .. }));
        assert_eq!(fs::read(&out).unwrap(), b"genuine");
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_result_after_cancellation_is_discarded() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.txt");
        let runs = Arc::new(AtomicUsize::new(0));
        let (counter, target) = (Arc::clone(&runs), out.clone());
        let node = WorkNode::new(
            "slow",
            action(move |ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                fs::write(&target, b"half")?;
                // The deadline passes while the action is still writing
                ctx.cancellation().cancel();
                Ok(())
            }),
        )
        .schema(WorkSchema::builder().output(OutputProperty::file("out", &out)).build());
        let history = Arc::new(InMemoryHistory::new());
        let runner = runner(&history);

        let err = runner.run(&node, &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, NodeFailure::Abandoned));
        assert!(history.is_empty());

        assert!(runner.run(&node, &CancellationToken::new()).is_err());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_identical_identity_runs_once_per_build() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("in.txt");
        fs::write(&src, b"same").unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let one = copy_node("one", &src, &dir.path().join("one.txt"), &runs);
        let two = copy_node("two", &src, &dir.path().join("two.txt"), &runs);
        let history = Arc::new(InMemoryHistory::new());
        let runner = runner(&history);
        let token = CancellationToken::new();

        assert!(matches!(runner.run(&one, &token).unwrap(), Completion::Executed { .. }));
        let second = runner.run(&two, &token).unwrap();
        assert!(matches!(second, Completion::Skipped { reason: SkipReason::FromCache, .. }));
        assert_eq!(fs::read(dir.path().join("two.txt")).unwrap(), b"same");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_action_records_nothing() {
        let history = Arc::new(InMemoryHistory::new());
        let node = WorkNode::new("bad", action(|_| anyhow::bail!("compiler exploded")));
        let err = runner(&history).run(&node, &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, NodeFailure::Action(_)));
        assert!(err.to_string().contains("compiler exploded"));
        assert!(history.is_empty());
    }

    #[test]
    fn test_untracked_always_executes() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let node = WorkNode::new(
            "deploy",
            action(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .schema(WorkSchema::builder().untracked().build());
        let history = Arc::new(InMemoryHistory::new());
        let token = CancellationToken::new();
        runner(&history).run(&node, &token).unwrap();
        runner(&history).run(&node, &token).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(history.is_empty());
    }

    #[test]
    fn test_incremental_changes_reported() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("a.c"), b"a").unwrap();
        fs::write(src.join("b.c"), b"b").unwrap();

        let seen: Arc<Mutex<Vec<InputChanges>>> = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let node = WorkNode::new(
            "compile",
            action(move |ctx| {
                recorder.lock().unwrap().push(ctx.changes().clone());
                Ok(())
            }),
        )
        .schema(
            WorkSchema::builder()
                .file(FileInput::directory("sources", &src).behavior(PropertyBehavior::Incremental))
                .build(),
        );
        let history = Arc::new(InMemoryHistory::new());
        let token = CancellationToken::new();

        runner(&history).run(&node, &token).unwrap();
        fs::write(src.join("a.c"), b"a2").unwrap();
        fs::remove_file(src.join("b.c")).unwrap();
        fs::write(src.join("c.c"), b"c").unwrap();
        runner(&history).run(&node, &token).unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen[0].full_rebuild);
        let second = &seen[1];
        assert!(!second.full_rebuild);
        assert_eq!(second.added, [src.join("c.c")]);
        assert_eq!(second.modified, [src.join("a.c")]);
        assert_eq!(second.removed, [src.join("b.c")]);
    }

    #[test]
    fn test_no_source_skips_without_running() {
        let dir = TempDir::new().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let node = WorkNode::new(
            "compile",
            action(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .schema(
            WorkSchema::builder()
                .file(FileInput::directory("sources", dir.path()).behavior(PropertyBehavior::PrimaryInput))
                .build(),
        );
        let history = Arc::new(InMemoryHistory::new());
        let completion = runner(&history).run(&node, &CancellationToken::new()).unwrap();
        assert!(matches!(completion, Completion::Skipped { reason: SkipReason::NoSource, .. }));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
