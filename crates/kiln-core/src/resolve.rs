//! Dependency Graph Resolver - polymorphic walk into concrete edges
//!
//! Each node's declared dependencies are walked depth-first with an
//! explicit stack. Containers are visited once per build (memoized by
//! instance), each visit gets a fresh [`ResolveContext`], and re-entering
//! a container that is still being expanded is reported as a cycle.
//!
//! Failure policy:
//! - a container whose visit fails poisons only the owning node; the
//!   failure is attached to it and surfaces when the node is scheduled
//! - unknown nodes, unrecognized objects, and container cycles are
//!   configuration errors; every one found is collected and reported
//!   together, then plan building aborts

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::ConfigurationError;
use crate::graph::{Dependency, DependencyContainer, NodeId, ResolveContext, WorkGraph, WorkNode};

/// Result of walking one dependency declaration
#[derive(Debug)]
pub enum ResolveFailure {
    /// Fatal: the graph is misconfigured
    Configuration(ConfigurationError),
    /// A container's visit failed; attached to the owning node
    Visit(String),
}

impl From<ConfigurationError> for ResolveFailure {
    fn from(e: ConfigurationError) -> Self {
        ResolveFailure::Configuration(e)
    }
}

#[derive(Clone)]
enum Expansion {
    Resolved(BTreeSet<NodeId>),
    Failed(String),
}

struct Frame {
    key: usize,
    description: String,
    pending: std::vec::IntoIter<Dependency>,
    nodes: BTreeSet<NodeId>,
}

/// Memoizing resolver for one build invocation
pub struct DependencyResolver<'g> {
    graph: &'g WorkGraph,
    // Containers are kept alive so their addresses stay unique
    memo: HashMap<usize, (Arc<dyn DependencyContainer>, Expansion)>,
    visits: usize,
}

fn container_key(container: &Arc<dyn DependencyContainer>) -> usize {
    Arc::as_ptr(container) as *const () as usize
}

impl<'g> DependencyResolver<'g> {
    pub fn new(graph: &'g WorkGraph) -> Self {
        Self {
            graph,
            memo: HashMap::new(),
            visits: 0,
        }
    }

    /// Number of container visits performed so far
    pub fn visits(&self) -> usize {
        self.visits
    }

    /// Resolve `roots` (declared by `owner`) to the set of work nodes they reach
    pub fn resolve(
        &mut self,
        owner: &NodeId,
        roots: &[Dependency],
    ) -> Result<BTreeSet<NodeId>, ResolveFailure> {
        let mut resolved = BTreeSet::new();
        for dependency in roots {
            match dependency {
                Dependency::Node(id) => {
                    self.check_known(owner, id)?;
                    resolved.insert(id.clone());
                }
                Dependency::Container(container) => {
                    resolved.extend(self.expand(owner, container)?);
                }
                Dependency::Other { type_name, .. } => {
                    return Err(unresolvable(owner, type_name).into());
                }
            }
        }
        Ok(resolved)
    }

    fn check_known(&self, owner: &NodeId, id: &NodeId) -> Result<(), ConfigurationError> {
        if self.graph.contains(id) {
            Ok(())
        } else {
            Err(ConfigurationError::UnknownNode {
                owner: owner.clone(),
                name: id.clone(),
            })
        }
    }

    fn memoized(&self, key: usize) -> Option<Expansion> {
        self.memo.get(&key).map(|(_, expansion)| expansion.clone())
    }

    /// Visit a container with a fresh context and open a frame for it
    fn enter(&mut self, container: &Arc<dyn DependencyContainer>) -> Result<Frame, ResolveFailure> {
        let key = container_key(container);
        let description = container.describe();
        let mut context = ResolveContext::new();
        self.visits += 1;

        if let Err(e) = container.visit_dependencies(&mut context) {
            let message = format!("{} failed: {:#}", description, e);
            self.memo
                .insert(key, (Arc::clone(container), Expansion::Failed(message.clone())));
            return Err(ResolveFailure::Visit(message));
        }

        Ok(Frame {
            key,
            description,
            pending: context.into_discovered().into_iter(),
            nodes: BTreeSet::new(),
        })
    }

    /// Every open frame fails with its descendant
    fn abandon(
        &mut self,
        stack: Vec<Frame>,
        containers: Vec<Arc<dyn DependencyContainer>>,
        message: String,
    ) -> ResolveFailure {
        for (frame, container) in stack.into_iter().zip(containers) {
            self.memo
                .insert(frame.key, (container, Expansion::Failed(message.clone())));
        }
        ResolveFailure::Visit(message)
    }

    fn expand(
        &mut self,
        owner: &NodeId,
        root: &Arc<dyn DependencyContainer>,
    ) -> Result<BTreeSet<NodeId>, ResolveFailure> {
        match self.memoized(container_key(root)) {
            Some(Expansion::Resolved(nodes)) => return Ok(nodes),
            Some(Expansion::Failed(message)) => return Err(ResolveFailure::Visit(message)),
            None => {}
        }

        let mut stack = vec![self.enter(root)?];
        let mut containers = vec![Arc::clone(root)];

        loop {
            let next = match stack.last_mut() {
                Some(frame) => frame.pending.next(),
                None => return Ok(BTreeSet::new()),
            };

            match next {
                None => {
                    let (Some(finished), Some(container)) = (stack.pop(), containers.pop()) else {
                        return Ok(BTreeSet::new());
                    };
                    self.memo.insert(
                        finished.key,
                        (container, Expansion::Resolved(finished.nodes.clone())),
                    );
                    match stack.last_mut() {
                        Some(parent) => parent.nodes.extend(finished.nodes),
                        None => return Ok(finished.nodes),
                    }
                }
                Some(Dependency::Node(id)) => {
                    self.check_known(owner, &id)?;
                    if let Some(frame) = stack.last_mut() {
                        frame.nodes.insert(id);
                    }
                }
                Some(Dependency::Other { type_name, .. }) => {
                    return Err(unresolvable(owner, type_name).into());
                }
                Some(Dependency::Container(child)) => {
                    let key = container_key(&child);
                    match self.memoized(key) {
                        Some(Expansion::Resolved(nodes)) => {
                            if let Some(frame) = stack.last_mut() {
                                frame.nodes.extend(nodes);
                            }
                        }
                        Some(Expansion::Failed(message)) => {
                            return Err(self.abandon(stack, containers, message));
                        }
                        None => {
                            if let Some(start) = stack.iter().position(|f| f.key == key) {
                                let mut path: Vec<String> =
                                    stack[start..].iter().map(|f| f.description.clone()).collect();
                                path.push(child.describe());
                                return Err(ConfigurationError::ContainerCycle {
                                    owner: owner.clone(),
                                    path,
                                }
                                .into());
                            }
                            match self.enter(&child) {
                                Ok(frame) => {
                                    stack.push(frame);
                                    containers.push(child);
                                }
                                Err(ResolveFailure::Visit(message)) => {
                                    return Err(self.abandon(stack, containers, message));
                                }
                                Err(e) => return Err(e),
                            }
                        }
                    }
                }
            }
        }
    }
}

fn unresolvable(owner: &NodeId, type_name: &str) -> ConfigurationError {
    ConfigurationError::Unresolvable {
        owner: owner.clone(),
        description: format!("object of type '{}'", type_name),
    }
}

/// The declared graph with every dependency resolved to node positions
pub struct ResolvedGraph {
    pub(crate) graph: WorkGraph,
    /// Hard dependencies (must succeed first), by declaration position
    pub(crate) dependencies: Vec<BTreeSet<usize>>,
    pub(crate) must_run_after: Vec<BTreeSet<usize>>,
    pub(crate) should_run_after: Vec<BTreeSet<usize>>,
    /// Deferred visit failures, attached to the owning node
    pub(crate) failures: Vec<Option<String>>,
}

impl ResolvedGraph {
    pub fn graph(&self) -> &WorkGraph {
        &self.graph
    }

    pub fn nodes(&self) -> &[Arc<WorkNode>] {
        self.graph.nodes()
    }

    /// Ids of the hard dependencies of `id`
    pub fn dependencies_of(&self, id: &NodeId) -> Vec<&NodeId> {
        self.graph
            .position(id)
            .map(|i| {
                self.dependencies[i]
                    .iter()
                    .map(|&d| self.graph.nodes()[d].id())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The deferred resolution failure attached to `id`, if any
    pub fn failure_of(&self, id: &NodeId) -> Option<&str> {
        self.graph
            .position(id)
            .and_then(|i| self.failures[i].as_deref())
    }
}

/// Resolve every node of `graph`
pub fn resolve_graph(graph: WorkGraph) -> Result<ResolvedGraph, ConfigurationError> {
    let n = graph.len();
    let mut dependencies = vec![BTreeSet::new(); n];
    let mut must_run_after = vec![BTreeSet::new(); n];
    let mut should_run_after = vec![BTreeSet::new(); n];
    let mut failures: Vec<Option<String>> = vec![None; n];
    let mut errors = Vec::new();

    {
        let mut resolver = DependencyResolver::new(&graph);
        for (i, node) in graph.nodes().iter().enumerate() {
            let relations = [
                ("dependencies", &node.dependencies, &mut dependencies[i]),
                ("must-run-after", &node.must_run_after, &mut must_run_after[i]),
                ("should-run-after", &node.should_run_after, &mut should_run_after[i]),
            ];
            for (relation, declared, target) in relations {
                match resolver.resolve(node.id(), declared) {
                    Ok(ids) => {
                        target.extend(ids.iter().filter_map(|id| graph.position(id)));
                    }
                    Err(ResolveFailure::Configuration(e)) => errors.push(e),
                    Err(ResolveFailure::Visit(message)) => {
                        warn!(node = %node.id(), relation, "dependency resolution failed: {}", message);
                        failures[i].get_or_insert(message);
                    }
                }
            }
        }
        debug!(nodes = n, visits = resolver.visits(), "resolved dependency graph");
    }

    if let Some(error) = ConfigurationError::aggregate(errors) {
        return Err(error);
    }

    Ok(ResolvedGraph {
        graph,
        dependencies,
        must_run_after,
        should_run_after,
        failures,
    })
}
