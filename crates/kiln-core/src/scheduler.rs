//! Parallel Scheduler - dependency-aware execution of an [`ExecutionPlan`]
//!
//! Features:
//! - Bounded worker pool; actions run on the blocking pool
//! - One coordinator task owns all node states (no shared locks)
//! - All-or-nothing acquisition of shared resources
//! - Fail-fast or continue-on-failure, with downstream cancellation
//! - Cooperative global cancellation and per-node timeouts

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use crate::cancel::CancellationToken;
use crate::error::{CancelReason, NodeFailure};
use crate::graph::NodeId;
use crate::plan::ExecutionPlan;
use crate::runner::{Completion, NodeExecutor, SkipReason};
use crate::schema::OutputSnapshot;

/// Node state; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    NotStarted,
    Queued,
    Executing,
    Skipped,
    Succeeded,
    Failed,
    Cancelled,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Skipped | NodeState::Succeeded | NodeState::Failed | NodeState::Cancelled
        )
    }

    /// Dependents may start after this state
    pub fn is_success(&self) -> bool {
        matches!(self, NodeState::Skipped | NodeState::Succeeded)
    }

    fn rank(&self) -> u8 {
        match self {
            NodeState::NotStarted => 0,
            NodeState::Queued => 1,
            NodeState::Executing => 2,
            _ => 3,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::NotStarted => "NOT-STARTED",
            NodeState::Queued => "QUEUED",
            NodeState::Executing => "EXECUTING",
            NodeState::Skipped => "SKIPPED",
            NodeState::Succeeded => "SUCCEEDED",
            NodeState::Failed => "FAILED",
            NodeState::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// What happens to the rest of the build after a node fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Start nothing new; running nodes finish
    #[default]
    FailFast,
    /// Only transitive dependents of the failed node are cancelled
    Continue,
}

/// Terminal outcome of one node
#[derive(Debug)]
pub struct NodeOutcome {
    pub node: NodeId,
    pub state: NodeState,
    pub skip_reason: Option<SkipReason>,
    pub failure: Option<NodeFailure>,
    pub cancel_reason: Option<CancelReason>,
    pub duration: Duration,
    pub outputs: BTreeMap<String, OutputSnapshot>,
}

impl NodeOutcome {
    fn new(node: NodeId, state: NodeState) -> Self {
        Self {
            node,
            state,
            skip_reason: None,
            failure: None,
            cancel_reason: None,
            duration: Duration::ZERO,
            outputs: BTreeMap::new(),
        }
    }

    fn failed(node: NodeId, failure: NodeFailure, duration: Duration) -> Self {
        Self {
            failure: Some(failure),
            duration,
            ..Self::new(node, NodeState::Failed)
        }
    }

    fn cancelled(node: NodeId, reason: CancelReason) -> Self {
        Self {
            cancel_reason: Some(reason),
            ..Self::new(node, NodeState::Cancelled)
        }
    }
}

/// Every planned node's outcome, in plan order
#[derive(Debug)]
pub struct BuildResult {
    pub outcomes: Vec<NodeOutcome>,
    pub duration: Duration,
}

impl BuildResult {
    pub fn outcome(&self, id: &NodeId) -> Option<&NodeOutcome> {
        self.outcomes.iter().find(|o| &o.node == id)
    }

    pub fn state(&self, id: &NodeId) -> Option<NodeState> {
        self.outcome(id).map(|o| o.state)
    }

    /// All failed nodes, not just the first
    pub fn failures(&self) -> Vec<&NodeOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.state == NodeState::Failed)
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.state.is_success())
    }

    pub fn count(&self, state: NodeState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }
}

/// Observer of node lifecycle events
pub trait BuildListener: Send + Sync {
    fn node_started(&self, _node: &NodeId) {}
    fn node_finished(&self, _outcome: &NodeOutcome) {}
}

/// Listener that ignores everything
pub struct NoopListener;

impl BuildListener for NoopListener {}

/// Message from a worker back to the coordinator
struct Finished {
    position: usize,
    result: Result<Completion, NodeFailure>,
    duration: Duration,
}

/// Counting pool over the plan's shared resources
struct ResourcePool {
    held: Vec<usize>,
    limits: Vec<usize>,
}

impl ResourcePool {
    fn new(plan: &ExecutionPlan) -> Self {
        Self {
            held: vec![0; plan.resources().len()],
            limits: plan.resources().iter().map(|r| r.max_holders).collect(),
        }
    }

    /// Acquire every resource or none
    fn try_acquire(&mut self, resources: &[usize]) -> bool {
        if resources.iter().any(|&r| self.held[r] >= self.limits[r]) {
            return false;
        }
        for &r in resources {
            self.held[r] += 1;
        }
        true
    }

    fn release(&mut self, resources: &[usize]) {
        for &r in resources {
            self.held[r] = self.held[r].saturating_sub(1);
        }
    }
}

/// Parallel plan executor
pub struct Scheduler {
    workers: usize,
    policy: FailurePolicy,
    default_timeout: Option<Duration>,
}

impl Scheduler {
    /// Create a scheduler with a fixed worker count
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            policy: FailurePolicy::default(),
            default_timeout: None,
        }
    }

    /// Create a scheduler with one worker per CPU core
    pub fn with_default_concurrency() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4);
        Self::new(cpus)
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn continue_on_failure(self, enabled: bool) -> Self {
        self.failure_policy(if enabled {
            FailurePolicy::Continue
        } else {
            FailurePolicy::FailFast
        })
    }

    /// Timeout for nodes that do not declare their own
    pub fn default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Execute the plan to completion
    pub async fn execute(&self, plan: &ExecutionPlan, executor: Arc<dyn NodeExecutor>) -> BuildResult {
        self.execute_with(plan, executor, &CancellationToken::new(), Arc::new(NoopListener))
            .await
    }

    /// Execute the plan, observing `cancel` and reporting to `listener`
    pub async fn execute_with(
        &self,
        plan: &ExecutionPlan,
        executor: Arc<dyn NodeExecutor>,
        cancel: &CancellationToken,
        listener: Arc<dyn BuildListener>,
    ) -> BuildResult {
        let start = Instant::now();
        let (tx, mut rx) = mpsc::unbounded_channel::<Finished>();

        let mut run = Coordinator {
            plan,
            workers: self.workers,
            policy: self.policy,
            default_timeout: self.default_timeout,
            executor,
            listener,
            cancel: cancel.clone(),
            tx,
            states: vec![NodeState::NotStarted; plan.len()],
            outcomes: (0..plan.len()).map(|_| None).collect(),
            waiting: plan
                .nodes()
                .iter()
                .map(|n| n.dependencies.len() + n.ordering.len())
                .collect(),
            queued: BTreeSet::new(),
            pool: ResourcePool::new(plan),
            running: 0,
            stopped: false,
            interrupted: false,
        };

        for i in 0..plan.len() {
            if run.waiting[i] == 0 {
                run.enqueue(i);
            }
        }
        run.dispatch();

        while !run.is_done() {
            tokio::select! {
                Some(finished) = rx.recv() => run.on_finished(finished),
                _ = cancel.cancelled(), if !run.interrupted => {
                    warn!("build cancelled; waiting for running nodes");
                    run.interrupted = true;
                    run.stop(CancelReason::Interrupted);
                }
            }
            run.dispatch();

            if run.running == 0 && !run.is_done() {
                error!("scheduler stalled with unfinished nodes");
                run.stop(CancelReason::BuildAborted);
            }
        }

        let outcomes: Vec<NodeOutcome> = run.outcomes.into_iter().flatten().collect();
        let result = BuildResult {
            outcomes,
            duration: start.elapsed(),
        };
        info!(
            nodes = result.outcomes.len(),
            failed = result.count(NodeState::Failed),
            cancelled = result.count(NodeState::Cancelled),
            "Scheduler completed {} nodes in {:?}",
            result.outcomes.len(),
            result.duration
        );
        result
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::with_default_concurrency()
    }
}

/// Owns all mutable scheduling state for one build
struct Coordinator<'p> {
    plan: &'p ExecutionPlan,
    workers: usize,
    policy: FailurePolicy,
    default_timeout: Option<Duration>,
    executor: Arc<dyn NodeExecutor>,
    listener: Arc<dyn BuildListener>,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<Finished>,
    states: Vec<NodeState>,
    outcomes: Vec<Option<NodeOutcome>>,
    /// Predecessors (hard and ordering) not yet terminal
    waiting: Vec<usize>,
    queued: BTreeSet<usize>,
    pool: ResourcePool,
    running: usize,
    /// No new node may start
    stopped: bool,
    interrupted: bool,
}

impl Coordinator<'_> {
    fn is_done(&self) -> bool {
        self.states.iter().all(NodeState::is_terminal)
    }

    fn advance(&mut self, i: usize, to: NodeState) {
        debug_assert!(self.states[i].rank() < to.rank());
        self.states[i] = to;
    }

    fn enqueue(&mut self, i: usize) {
        if self.states[i] != NodeState::NotStarted {
            return;
        }
        self.advance(i, NodeState::Queued);
        self.queued.insert(i);
    }

    /// Record a terminal outcome and propagate it downstream
    fn complete(&mut self, i: usize, outcome: NodeOutcome) {
        let plan = self.plan;
        let mut pending = vec![(i, outcome)];
        while let Some((i, outcome)) = pending.pop() {
            if self.states[i].is_terminal() {
                continue;
            }
            let blocked = !outcome.state.is_success();
            self.queued.remove(&i);
            self.advance(i, outcome.state);
            self.listener.node_finished(&outcome);
            self.outcomes[i] = Some(outcome);

            let node = &plan.nodes()[i];
            for &d in &node.dependents {
                if blocked {
                    if !self.states[d].is_terminal() {
                        let reason = CancelReason::DependencyFailed(node.id().clone());
                        pending.push((d, NodeOutcome::cancelled(plan.nodes()[d].id().clone(), reason)));
                    }
                } else {
                    self.release_wait(d);
                }
            }
            for &s in &node.successors {
                self.release_wait(s);
            }
        }
    }

    fn release_wait(&mut self, i: usize) {
        self.waiting[i] = self.waiting[i].saturating_sub(1);
        if self.waiting[i] == 0 {
            self.enqueue(i);
        }
    }

    /// Cancel every node that has not started
    fn stop(&mut self, reason: CancelReason) {
        self.stopped = true;
        for i in 0..self.states.len() {
            if matches!(self.states[i], NodeState::NotStarted | NodeState::Queued) {
                let id = self.plan.nodes()[i].id().clone();
                self.complete(i, NodeOutcome::cancelled(id, reason.clone()));
            }
        }
    }

    fn on_failure(&mut self) {
        if self.policy == FailurePolicy::FailFast && !self.stopped {
            info!("fail-fast: not starting further nodes");
            self.stop(CancelReason::BuildAborted);
        }
    }

    fn on_finished(&mut self, finished: Finished) {
        let Finished {
            position: i,
            result,
            duration,
        } = finished;
        let plan = self.plan;
        let node = &plan.nodes()[i];
        self.running -= 1;
        self.pool.release(&node.resources);

        let id = node.id().clone();
        let outcome = match result {
            Ok(Completion::Executed { outputs }) => NodeOutcome {
                duration,
                outputs,
                ..NodeOutcome::new(id, NodeState::Succeeded)
            },
            Ok(Completion::Skipped { reason, outputs }) => NodeOutcome {
                skip_reason: Some(reason),
                duration,
                outputs,
                ..NodeOutcome::new(id, NodeState::Skipped)
            },
            Err(failure) if self.interrupted => {
                debug!(node = %id, "interrupted node ended with: {}", failure);
                NodeOutcome::cancelled(id, CancelReason::Interrupted)
            }
            Err(failure) => {
                error!(node = %id, "failed: {}", failure);
                NodeOutcome::failed(id, failure, duration)
            }
        };
        let failed = outcome.state == NodeState::Failed;
        self.complete(i, outcome);
        if failed {
            self.on_failure();
        }
    }

    /// Start queued nodes while workers and resources allow
    fn dispatch(&mut self) {
        let plan = self.plan;
        let mut progressed = true;
        while progressed && !self.stopped {
            progressed = false;
            let candidates: Vec<usize> = self.queued.iter().copied().collect();
            for i in candidates {
                if self.states[i] != NodeState::Queued || self.stopped {
                    continue;
                }
                let node = &plan.nodes()[i];

                if let Some(message) = node.resolution_failure() {
                    let failure = NodeFailure::Resolution(message.to_string());
                    error!(node = %node.id(), "{}", failure);
                    self.complete(i, NodeOutcome::failed(node.id().clone(), failure, Duration::ZERO));
                    self.on_failure();
                    progressed = true;
                    continue;
                }

                if self.running >= self.workers {
                    break;
                }
                if !self.pool.try_acquire(&node.resources) {
                    continue;
                }
                self.queued.remove(&i);
                self.start(i);
            }
        }
    }

    fn start(&mut self, i: usize) {
        let plan = self.plan;
        let node = &plan.nodes()[i];
        self.advance(i, NodeState::Executing);
        self.running += 1;
        self.listener.node_started(node.id());
        debug!(node = %node.id(), "dispatching");

        let work = Arc::clone(node.work());
        let executor = Arc::clone(&self.executor);
        let token = self.cancel.child_token();
        let timeout = work.timeout_limit().or(self.default_timeout);
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let start = Instant::now();
            let node_token = token.clone();
            let mut handle = tokio::task::spawn_blocking(move || executor.run(&work, &node_token));

            let result = match timeout {
                Some(limit) => {
                    tokio::select! {
                        joined = &mut handle => joined.unwrap_or_else(|e| Err(panicked(e))),
                        _ = tokio::time::sleep(limit) => {
                            // Resources stay held until the action actually returns
                            token.cancel();
                            let _ = (&mut handle).await;
                            Err(NodeFailure::Timeout(limit))
                        }
                    }
                }
                None => handle.await.unwrap_or_else(|e| Err(panicked(e))),
            };

            let _ = tx.send(Finished {
                position: i,
                result,
                duration: start.elapsed(),
            });
        });
    }
}

fn panicked(e: JoinError) -> NodeFailure {
    if !e.is_panic() {
        return NodeFailure::Panicked(e.to_string());
    }
    let payload = e.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    NodeFailure::Panicked(message)
}
