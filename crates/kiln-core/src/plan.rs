//! Execution Plan Builder - petgraph-based ordering and conflict grouping
//!
//! Turns a [`ResolvedGraph`] into an immutable [`ExecutionPlan`]:
//! - selects the requested nodes plus their hard dependencies
//! - rejects cycles over hard and must-run-after edges, naming every member
//! - keeps should-run-after edges only where they close no cycle
//! - puts nodes with overlapping outputs/destroys into exclusive groups
//! - linearizes with ties broken by declaration order

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use petgraph::algo::{has_path_connecting, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use tracing::debug;

use crate::error::ConfigurationError;
use crate::graph::{NodeId, WorkNode};
use crate::resolve::ResolvedGraph;

/// Which nodes to build
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    targets: Vec<NodeId>,
    excluded: BTreeSet<NodeId>,
}

impl BuildRequest {
    /// Every declared node
    pub fn all() -> Self {
        Self::default()
    }

    pub fn targets<I, T>(targets: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<NodeId>,
    {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            excluded: BTreeSet::new(),
        }
    }

    /// Leave `id` (and anything reachable only through it) out of the plan
    pub fn exclude(mut self, id: impl Into<NodeId>) -> Self {
        self.excluded.insert(id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeKind {
    Hard,
    MustRunAfter,
    ShouldRunAfter,
}

/// A named exclusivity domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedResource {
    pub name: String,
    pub max_holders: usize,
}

/// One node of the plan with its edges as plan positions
#[derive(Debug)]
pub struct PlannedNode {
    pub(crate) work: Arc<WorkNode>,
    /// Hard predecessors; they must succeed or be skipped
    pub(crate) dependencies: Vec<usize>,
    /// Ordering-only predecessors; any terminal state releases the wait
    pub(crate) ordering: Vec<usize>,
    pub(crate) dependents: Vec<usize>,
    pub(crate) successors: Vec<usize>,
    pub(crate) resources: Vec<usize>,
    pub(crate) resolution_failure: Option<String>,
}

impl PlannedNode {
    pub fn id(&self) -> &NodeId {
        self.work.id()
    }

    pub fn work(&self) -> &Arc<WorkNode> {
        &self.work
    }

    pub fn resolution_failure(&self) -> Option<&str> {
        self.resolution_failure.as_deref()
    }
}

/// Immutable, linearized view of the nodes to execute
#[derive(Debug)]
pub struct ExecutionPlan {
    nodes: Vec<PlannedNode>,
    resources: Vec<SharedResource>,
    index: HashMap<NodeId, usize>,
}

impl ExecutionPlan {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in linearized order
    pub fn nodes(&self) -> &[PlannedNode] {
        &self.nodes
    }

    pub fn node(&self, id: &NodeId) -> Option<&PlannedNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn position(&self, id: &NodeId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn order(&self) -> Vec<&NodeId> {
        self.nodes.iter().map(PlannedNode::id).collect()
    }

    /// Immediate predecessors of `id` (hard and ordering)
    pub fn predecessors(&self, id: &NodeId) -> Vec<&NodeId> {
        self.node(id)
            .map(|node| {
                let mut positions: Vec<usize> =
                    node.dependencies.iter().chain(&node.ordering).copied().collect();
                positions.sort_unstable();
                positions.dedup();
                positions.into_iter().map(|p| self.nodes[p].id()).collect()
            })
            .unwrap_or_default()
    }

    /// Exclusive resources `id` holds while executing
    pub fn resources_of(&self, id: &NodeId) -> Vec<&SharedResource> {
        self.node(id)
            .map(|node| node.resources.iter().map(|&r| &self.resources[r]).collect())
            .unwrap_or_default()
    }

    pub fn resources(&self) -> &[SharedResource] {
        &self.resources
    }
}

/// Build a plan for `request` over a resolved graph
pub fn build_plan(resolved: &ResolvedGraph, request: &BuildRequest) -> Result<ExecutionPlan, ConfigurationError> {
    let graph = resolved.graph();
    let declared = graph.nodes();

    let unknown: Vec<_> = request
        .targets
        .iter()
        .filter(|id| !graph.contains(id))
        .map(|id| ConfigurationError::UnknownTarget(id.clone()))
        .collect();
    if let Some(error) = ConfigurationError::aggregate(unknown) {
        return Err(error);
    }

    let selected = select(resolved, request);

    // Edges run from predecessor to successor
    let mut dag: DiGraph<usize, EdgeKind> = DiGraph::new();
    let mut node_of: HashMap<usize, NodeIndex> = HashMap::new();
    for &i in &selected {
        node_of.insert(i, dag.add_node(i));
    }
    for &i in &selected {
        let successor = node_of[&i];
        // A hard edge replaces an ordering edge between the same pair
        for (kind, predecessors) in [
            (EdgeKind::MustRunAfter, &resolved.must_run_after[i]),
            (EdgeKind::Hard, &resolved.dependencies[i]),
        ] {
            for p in predecessors {
                if let Some(&predecessor) = node_of.get(p) {
                    dag.update_edge(predecessor, successor, kind);
                }
            }
        }
    }

    let mut errors = cycle_errors(&dag, declared);
    if errors.is_empty() {
        add_should_run_after(&mut dag, resolved, &selected, &node_of);
    }

    let mut resources: Vec<SharedResource> = graph
        .resources()
        .iter()
        .map(|(name, &max_holders)| SharedResource {
            name: name.clone(),
            max_holders,
        })
        .collect();
    let resource_index: BTreeMap<&str, usize> = graph
        .resources()
        .keys()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();

    let mut held: HashMap<usize, Vec<usize>> = HashMap::new();
    for &i in &selected {
        for name in declared[i].resources() {
            match resource_index.get(name.as_str()) {
                Some(&r) => held.entry(i).or_default().push(r),
                None => errors.push(ConfigurationError::UnknownResource {
                    node: declared[i].id().clone(),
                    resource: name.clone(),
                }),
            }
        }
    }

    if let Some(error) = ConfigurationError::aggregate(errors) {
        return Err(error);
    }

    for (k, group) in conflict_groups(&dag, declared, &selected, &node_of).into_iter().enumerate() {
        let r = resources.len();
        resources.push(SharedResource {
            name: format!("output-group-{}", k),
            max_holders: 1,
        });
        for i in group {
            held.entry(i).or_default().push(r);
        }
    }

    let order = linearize(&dag);
    let position: HashMap<usize, usize> = order.iter().enumerate().map(|(p, &i)| (i, p)).collect();

    let mut nodes: Vec<PlannedNode> = order
        .iter()
        .map(|&i| PlannedNode {
            work: Arc::clone(&declared[i]),
            dependencies: Vec::new(),
            ordering: Vec::new(),
            dependents: Vec::new(),
            successors: Vec::new(),
            resources: held.remove(&i).unwrap_or_default(),
            resolution_failure: resolved.failures[i].clone(),
        })
        .collect();

    for edge in dag.edge_references() {
        let from = position[&dag[edge.source()]];
        let to = position[&dag[edge.target()]];
        match edge.weight() {
            EdgeKind::Hard => {
                nodes[to].dependencies.push(from);
                nodes[from].dependents.push(to);
            }
            EdgeKind::MustRunAfter | EdgeKind::ShouldRunAfter => {
                nodes[to].ordering.push(from);
                nodes[from].successors.push(to);
            }
        }
    }
    for node in &mut nodes {
        for edges in [
            &mut node.dependencies,
            &mut node.ordering,
            &mut node.dependents,
            &mut node.successors,
            &mut node.resources,
        ] {
            edges.sort_unstable();
            edges.dedup();
        }
    }

    let index = nodes
        .iter()
        .enumerate()
        .map(|(p, node)| (node.id().clone(), p))
        .collect();

    debug!(nodes = nodes.len(), resources = resources.len(), "built execution plan");
    Ok(ExecutionPlan {
        nodes,
        resources,
        index,
    })
}

/// Requested nodes and their hard dependencies, never through excluded nodes
fn select(resolved: &ResolvedGraph, request: &BuildRequest) -> BTreeSet<usize> {
    let graph = resolved.graph();
    let excluded: BTreeSet<usize> = request
        .excluded
        .iter()
        .filter_map(|id| graph.position(id))
        .collect();

    let roots: Vec<usize> = if request.targets.is_empty() {
        (0..graph.len()).collect()
    } else {
        request
            .targets
            .iter()
            .filter_map(|id| graph.position(id))
            .collect()
    };

    let mut selected = BTreeSet::new();
    let mut stack: Vec<usize> = roots.into_iter().filter(|i| !excluded.contains(i)).collect();
    while let Some(i) = stack.pop() {
        if !selected.insert(i) {
            continue;
        }
        stack.extend(
            resolved.dependencies[i]
                .iter()
                .filter(|&&d| !excluded.contains(&d) && !selected.contains(&d)),
        );
    }
    selected
}

/// One error per strongly connected component, walking through every member
fn cycle_errors(dag: &DiGraph<usize, EdgeKind>, declared: &[Arc<WorkNode>]) -> Vec<ConfigurationError> {
    let mut components: Vec<Vec<NodeIndex>> = tarjan_scc(dag)
        .into_iter()
        .filter(|scc| scc.len() > 1 || dag.contains_edge(scc[0], scc[0]))
        .collect();
    for scc in &mut components {
        scc.sort_by_key(|&n| dag[n]);
    }
    components.sort_by_key(|scc| dag[scc[0]]);

    components
        .into_iter()
        .map(|scc| {
            let members: BTreeSet<NodeIndex> = scc.iter().copied().collect();
            // Follow "depends on" direction: successor -> predecessor
            let mut walk = vec![scc[0]];
            for &target in scc.iter().skip(1) {
                if walk.contains(&target) {
                    continue;
                }
                let current = walk[walk.len() - 1];
                walk.extend(shortest_path(dag, &members, current, target).into_iter().skip(1));
            }
            let current = walk[walk.len() - 1];
            let back = shortest_path(dag, &members, current, scc[0]);
            if back.len() > 2 {
                walk.extend(&back[1..back.len() - 1]);
            }
            ConfigurationError::Cycle {
                cycle: walk.iter().map(|&n| declared[dag[n]].id().clone()).collect(),
            }
        })
        .collect()
}

fn shortest_path(
    dag: &DiGraph<usize, EdgeKind>,
    members: &BTreeSet<NodeIndex>,
    from: NodeIndex,
    to: NodeIndex,
) -> Vec<NodeIndex> {
    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([from]);
    while let Some(n) = queue.pop_front() {
        let mut next: Vec<NodeIndex> = dag
            .neighbors_directed(n, Direction::Incoming)
            .filter(|m| members.contains(m))
            .collect();
        next.sort_by_key(|&m| dag[m]);
        for m in next {
            if m == to {
                let mut path = vec![n];
                let mut cursor = n;
                while let Some(&p) = parent.get(&cursor) {
                    path.push(p);
                    cursor = p;
                }
                path.reverse();
                path.push(to);
                return path;
            }
            if m != from && !parent.contains_key(&m) {
                parent.insert(m, n);
                queue.push_back(m);
            }
        }
    }
    vec![from, to]
}

fn add_should_run_after(
    dag: &mut DiGraph<usize, EdgeKind>,
    resolved: &ResolvedGraph,
    selected: &BTreeSet<usize>,
    node_of: &HashMap<usize, NodeIndex>,
) {
    for &i in selected {
        let successor = node_of[&i];
        for p in &resolved.should_run_after[i] {
            let Some(&predecessor) = node_of.get(p) else {
                continue;
            };
            if predecessor == successor || dag.contains_edge(predecessor, successor) {
                continue;
            }
            if has_path_connecting(&*dag, successor, predecessor, None) {
                debug!(
                    node = %resolved.graph().nodes()[i].id(),
                    after = %resolved.graph().nodes()[*p].id(),
                    "dropping should-run-after edge that would close a cycle"
                );
                continue;
            }
            dag.add_edge(predecessor, successor, EdgeKind::ShouldRunAfter);
        }
    }
}

fn overlaps(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

/// Unordered nodes whose writes overlap another node's reads or writes
fn conflict_groups(
    dag: &DiGraph<usize, EdgeKind>,
    declared: &[Arc<WorkNode>],
    selected: &BTreeSet<usize>,
    node_of: &HashMap<usize, NodeIndex>,
) -> Vec<Vec<usize>> {
    let nodes: Vec<usize> = selected.iter().copied().collect();
    let writes: Vec<Vec<&Path>> = nodes
        .iter()
        .map(|&i| {
            let schema = declared[i].work_schema();
            schema
                .outputs()
                .iter()
                .map(|o| o.path.as_path())
                .chain(schema.destroys().iter().map(|p| p.as_path()))
                .collect()
        })
        .collect();
    let reads: Vec<Vec<&Path>> = nodes
        .iter()
        .map(|&i| declared[i].work_schema().input_roots())
        .collect();

    let mut parent: Vec<usize> = (0..nodes.len()).collect();
    fn find(parent: &mut [usize], mut x: usize) -> usize {
        while parent[x] != x {
            parent[x] = parent[parent[x]];
            x = parent[x];
        }
        x
    }

    for a in 0..nodes.len() {
        for b in (a + 1)..nodes.len() {
            let conflict = writes[a].iter().any(|&w| {
                writes[b].iter().chain(&reads[b]).any(|&o| overlaps(w, o))
            }) || writes[b].iter().any(|&w| reads[a].iter().any(|&o| overlaps(w, o)));
            if !conflict {
                continue;
            }
            let (na, nb) = (node_of[&nodes[a]], node_of[&nodes[b]]);
            if has_path_connecting(dag, na, nb, None) || has_path_connecting(dag, nb, na, None) {
                continue;
            }
            let (ra, rb) = (find(&mut parent, a), find(&mut parent, b));
            if ra != rb {
                parent[ra.max(rb)] = ra.min(rb);
            }
        }
    }

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for k in 0..nodes.len() {
        let root = find(&mut parent, k);
        groups.entry(root).or_default().push(nodes[k]);
    }
    groups.into_values().filter(|g| g.len() > 1).collect()
}

/// Kahn's algorithm; the lowest declaration index goes first among ready nodes
fn linearize(dag: &DiGraph<usize, EdgeKind>) -> Vec<usize> {
    let mut in_degree: HashMap<NodeIndex, usize> = dag
        .node_indices()
        .map(|n| (n, dag.neighbors_directed(n, Direction::Incoming).count()))
        .collect();
    let mut ready: BinaryHeap<Reverse<(usize, NodeIndex)>> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&n, _)| Reverse((dag[n], n)))
        .collect();

    let mut order = Vec::with_capacity(dag.node_count());
    while let Some(Reverse((declared, n))) = ready.pop() {
        order.push(declared);
        for m in dag.neighbors_directed(n, Direction::Outgoing) {
            if let Some(d) = in_degree.get_mut(&m) {
                *d -= 1;
                if *d == 0 {
                    ready.push(Reverse((dag[m], m)));
                }
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{WorkGraph, WorkNode};
    use crate::resolve::resolve_graph;
    use crate::runner::action;
    use crate::schema::{FileInput, OutputProperty, WorkSchema};

    fn node(id: &str) -> WorkNode {
        WorkNode::new(id, action(|_| Ok(())))
    }

    fn plan(graph: WorkGraph, request: &BuildRequest) -> Result<ExecutionPlan, ConfigurationError> {
        build_plan(&resolve_graph(graph)?, request)
    }

    fn ids(nodes: Vec<&NodeId>) -> Vec<&str> {
        nodes.into_iter().map(NodeId::as_str).collect()
    }

    fn diamond() -> WorkGraph {
        let mut graph = WorkGraph::new();
        graph.add_node(node("d").depends_on("b").depends_on("c")).unwrap();
        graph.add_node(node("c").depends_on("a")).unwrap();
        graph.add_node(node("b").depends_on("a")).unwrap();
        graph.add_node(node("a")).unwrap();
        graph
    }

    #[test]
    fn test_dependencies_come_first() {
        let plan = plan(diamond(), &BuildRequest::all()).unwrap();
        let order = ids(plan.order());
        let pos = |id: &str| order.iter().position(|n| *n == id).unwrap();
        assert_eq!(pos("a"), 0);
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
        // c was declared before b
        assert!(pos("c") < pos("b"));
        assert_eq!(ids(plan.predecessors(&NodeId::from("d"))), ["c", "b"]);
    }

    #[test]
    fn test_order_is_reproducible() {
        let first = plan(diamond(), &BuildRequest::all()).unwrap();
        let second = plan(diamond(), &BuildRequest::all()).unwrap();
        assert_eq!(first.order(), second.order());
    }

    #[test]
    fn test_cycle_names_every_member() {
        let mut graph = WorkGraph::new();
        graph.add_node(node("a").depends_on("c")).unwrap();
        graph.add_node(node("b").depends_on("a")).unwrap();
        graph.add_node(node("c").depends_on("b")).unwrap();
        graph.add_node(node("free")).unwrap();

        match plan(graph, &BuildRequest::all()).unwrap_err() {
            ConfigurationError::Cycle { cycle } => {
                let mut names = ids(cycle.iter().collect());
                names.sort();
                assert_eq!(names, ["a", "b", "c"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_cycle_with_branches_names_every_member() {
        // a <-> b and b <-> c share one component
        let mut graph = WorkGraph::new();
        graph.add_node(node("a").depends_on("b")).unwrap();
        graph.add_node(node("b").depends_on("a").depends_on("c")).unwrap();
        graph.add_node(node("c").depends_on("b")).unwrap();

        let err = plan(graph, &BuildRequest::all()).unwrap_err();
        let ConfigurationError::Cycle { cycle } = &err else {
            panic!("unexpected {:?}", err);
        };
        for name in ["a", "b", "c"] {
            assert!(cycle.iter().any(|n| n.as_str() == name), "{} missing from {}", name, err);
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let mut graph = WorkGraph::new();
        graph.add_node(node("a").depends_on("a")).unwrap();
        assert!(matches!(
            plan(graph, &BuildRequest::all()).unwrap_err(),
            ConfigurationError::Cycle { .. }
        ));
    }

    #[test]
    fn test_must_run_after_cycle_is_fatal_should_is_dropped() {
        let mut graph = WorkGraph::new();
        graph.add_node(node("a").must_run_after("b")).unwrap();
        graph.add_node(node("b").depends_on("a")).unwrap();
        assert!(plan(graph, &BuildRequest::all()).is_err());

        let mut graph = WorkGraph::new();
        graph.add_node(node("a").should_run_after("b")).unwrap();
        graph.add_node(node("b").depends_on("a")).unwrap();
        let plan = plan(graph, &BuildRequest::all()).unwrap();
        assert_eq!(ids(plan.order()), ["a", "b"]);
        assert!(plan.predecessors(&NodeId::from("a")).is_empty());
    }

    #[test]
    fn test_ordering_edges_do_not_pull_nodes_in() {
        let mut graph = WorkGraph::new();
        graph.add_node(node("clean")).unwrap();
        graph.add_node(node("build").must_run_after("clean")).unwrap();

        let only_build = plan(graph, &BuildRequest::targets(["build"])).unwrap();
        assert_eq!(ids(only_build.order()), ["build"]);
    }

    #[test]
    fn test_must_run_after_orders_when_both_present() {
        let mut graph = WorkGraph::new();
        graph.add_node(node("build").must_run_after("clean")).unwrap();
        graph.add_node(node("clean")).unwrap();
        let plan = plan(graph, &BuildRequest::all()).unwrap();
        assert_eq!(ids(plan.order()), ["clean", "build"]);
    }

    #[test]
    fn test_targets_and_exclusions() {
        let plan_b = plan(diamond(), &BuildRequest::targets(["b"])).unwrap();
        assert_eq!(ids(plan_b.order()), ["a", "b"]);

        let without_c = plan(diamond(), &BuildRequest::targets(["d"]).exclude("c")).unwrap();
        assert_eq!(ids(without_c.order()), ["a", "b", "d"]);

        let err = plan(diamond(), &BuildRequest::targets(["nope"])).unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownTarget(_)));
    }

    #[test]
    fn test_declared_resources() {
        let mut graph = WorkGraph::new();
        graph.declare_resource("db", 1).unwrap();
        graph.add_node(node("a").uses_resource("db")).unwrap();
        graph.add_node(node("b").uses_resource("gpu")).unwrap();
        let err = plan(graph, &BuildRequest::all()).unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownResource { .. }));

        let mut graph = WorkGraph::new();
        graph.declare_resource("db", 2).unwrap();
        graph.add_node(node("a").uses_resource("db")).unwrap();
        let plan = plan(graph, &BuildRequest::all()).unwrap();
        let held = plan.resources_of(&NodeId::from("a"));
        assert_eq!(held[0].name, "db");
        assert_eq!(held[0].max_holders, 2);
    }

    #[test]
    fn test_overlapping_outputs_share_an_exclusive_group() {
        let mut graph = WorkGraph::new();
        graph
            .add_node(node("compile").schema(
                WorkSchema::builder()
                    .output(OutputProperty::directory("classes", "/work/build/classes"))
                    .build(),
            ))
            .unwrap();
        graph
            .add_node(node("clean").schema(WorkSchema::builder().destroys("/work/build").build()))
            .unwrap();
        graph
            .add_node(node("docs").schema(
                WorkSchema::builder()
                    .output(OutputProperty::directory("html", "/work/docs"))
                    .build(),
            ))
            .unwrap();
        graph
            .add_node(node("package").schema(
                WorkSchema::builder()
                    .file(FileInput::directory("classes", "/work/build/classes"))
                    .build(),
            ).depends_on("compile"))
            .unwrap();

        let plan = plan(graph, &BuildRequest::all()).unwrap();
        let group = |id: &str| -> Vec<String> {
            plan.resources_of(&NodeId::from(id)).iter().map(|r| r.name.clone()).collect()
        };
        assert_eq!(group("compile"), ["output-group-0"]);
        assert_eq!(group("clean"), ["output-group-0"]);
        // package reads compile's output but is ordered after it; it still
        // conflicts with clean, so it joins the same group
        assert_eq!(group("package"), ["output-group-0"]);
        assert!(group("docs").is_empty());
    }

    #[test]
    fn test_resolution_failure_reaches_plan() {
        let mut graph = WorkGraph::new();
        struct Broken;
        impl crate::graph::DependencyContainer for Broken {
            fn visit_dependencies(&self, _: &mut crate::graph::ResolveContext) -> anyhow::Result<()> {
                anyhow::bail!("boom")
            }
        }
        graph
            .add_node(node("a").depends_on(crate::graph::Dependency::container(Broken)))
            .unwrap();
        let plan = plan(graph, &BuildRequest::all()).unwrap();
        assert!(plan.node(&NodeId::from("a")).unwrap().resolution_failure().is_some());
    }
}
