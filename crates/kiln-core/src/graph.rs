//! Work graph - declared work nodes and their (unresolved) dependencies
//!
//! Nodes are declared by the front-end with an opaque action, a
//! [`WorkSchema`], and dependency declarations. Dependencies stay
//! polymorphic until [`crate::resolve`] walks them into concrete edges.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::runner::WorkAction;
use crate::schema::WorkSchema;

/// Stable identity of a work node (e.g. `:app:compile`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// An object that contributes further dependencies when visited
///
/// Implementations must be stateless from the engine's point of view:
/// visiting twice yields the same objects. The engine visits each
/// container instance at most once per build.
pub trait DependencyContainer: Send + Sync {
    fn visit_dependencies(&self, context: &mut ResolveContext) -> anyhow::Result<()>;

    /// Human-readable name used in cycle reports
    fn describe(&self) -> String {
        "dependency container".to_string()
    }
}

/// One declared dependency
#[derive(Clone)]
pub enum Dependency {
    /// A work node, by id
    Node(NodeId),
    /// A container whose contributions are resolved transitively
    Container(Arc<dyn DependencyContainer>),
    /// Anything else; resolving it is a configuration error
    Other {
        value: Arc<dyn Any + Send + Sync>,
        type_name: &'static str,
    },
}

impl Dependency {
    pub fn node(id: impl Into<NodeId>) -> Self {
        Dependency::Node(id.into())
    }

    pub fn container(container: impl DependencyContainer + 'static) -> Self {
        Dependency::Container(Arc::new(container))
    }

    pub fn other<T: Any + Send + Sync>(value: T) -> Self {
        Dependency::Other {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dependency::Node(id) => f.debug_tuple("Node").field(id).finish(),
            Dependency::Container(c) => f.debug_tuple("Container").field(&c.describe()).finish(),
            Dependency::Other { type_name, .. } => f.debug_tuple("Other").field(type_name).finish(),
        }
    }
}

impl From<NodeId> for Dependency {
    fn from(id: NodeId) -> Self {
        Dependency::Node(id)
    }
}

impl From<&str> for Dependency {
    fn from(id: &str) -> Self {
        Dependency::Node(id.into())
    }
}

impl From<Arc<dyn DependencyContainer>> for Dependency {
    fn from(container: Arc<dyn DependencyContainer>) -> Self {
        Dependency::Container(container)
    }
}

/// A fixed list of dependencies behaves as a container
impl DependencyContainer for Vec<Dependency> {
    fn visit_dependencies(&self, context: &mut ResolveContext) -> anyhow::Result<()> {
        context.add_all(self.iter().cloned());
        Ok(())
    }

    fn describe(&self) -> String {
        format!("dependency list of {} entries", self.len())
    }
}

/// Accumulator for the objects discovered while visiting one container
///
/// A fresh context is created for every visit, so nothing discovered for
/// one container can leak into another.
#[derive(Debug, Default)]
pub struct ResolveContext {
    discovered: Vec<Dependency>,
}

impl ResolveContext {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, dependency: impl Into<Dependency>) {
        self.discovered.push(dependency.into());
    }

    pub fn add_all(&mut self, dependencies: impl IntoIterator<Item = Dependency>) {
        self.discovered.extend(dependencies);
    }

    pub(crate) fn into_discovered(self) -> Vec<Dependency> {
        self.discovered
    }
}

/// A single schedulable unit of build work
pub struct WorkNode {
    id: NodeId,
    action: Arc<dyn WorkAction>,
    implementation: String,
    pub(crate) dependencies: Vec<Dependency>,
    pub(crate) must_run_after: Vec<Dependency>,
    pub(crate) should_run_after: Vec<Dependency>,
    schema: WorkSchema,
    resources: Vec<String>,
    timeout: Option<Duration>,
}

impl WorkNode {
    pub fn new(id: impl Into<NodeId>, action: impl WorkAction + 'static) -> Self {
        let implementation = action.implementation_id();
        Self {
            id: id.into(),
            action: Arc::new(action),
            implementation,
            dependencies: Vec::new(),
            must_run_after: Vec::new(),
            should_run_after: Vec::new(),
            schema: WorkSchema::default(),
            resources: Vec::new(),
            timeout: None,
        }
    }

    pub fn depends_on(mut self, dependency: impl Into<Dependency>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn must_run_after(mut self, dependency: impl Into<Dependency>) -> Self {
        self.must_run_after.push(dependency.into());
        self
    }

    pub fn should_run_after(mut self, dependency: impl Into<Dependency>) -> Self {
        self.should_run_after.push(dependency.into());
        self
    }

    pub fn schema(mut self, schema: WorkSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn uses_resource(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.resources.contains(&name) {
            self.resources.push(name);
        }
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the implementation id that enters the node's identity
    pub fn implementation(mut self, id: impl Into<String>) -> Self {
        self.implementation = id.into();
        self
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn action(&self) -> &Arc<dyn WorkAction> {
        &self.action
    }

    pub fn implementation_id(&self) -> &str {
        &self.implementation
    }

    pub fn work_schema(&self) -> &WorkSchema {
        &self.schema
    }

    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    pub fn timeout_limit(&self) -> Option<Duration> {
        self.timeout
    }
}

impl fmt::Debug for WorkNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkNode")
            .field("id", &self.id)
            .field("implementation", &self.implementation)
            .field("dependencies", &self.dependencies)
            .field("resources", &self.resources)
            .finish()
    }
}

/// The declared graph handed over by the front-end
#[derive(Debug, Default)]
pub struct WorkGraph {
    nodes: Vec<Arc<WorkNode>>,
    index: HashMap<NodeId, usize>,
    resources: BTreeMap<String, usize>,
}

impl WorkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node; ids must be unique
    pub fn add_node(&mut self, node: WorkNode) -> Result<(), ConfigurationError> {
        if self.index.contains_key(node.id()) {
            return Err(ConfigurationError::DuplicateNode(node.id().clone()));
        }
        self.index.insert(node.id().clone(), self.nodes.len());
        self.nodes.push(Arc::new(node));
        Ok(())
    }

    /// Declare a named shared resource with a maximum number of concurrent holders
    pub fn declare_resource(
        &mut self,
        name: impl Into<String>,
        max_holders: usize,
    ) -> Result<(), ConfigurationError> {
        let name = name.into();
        if max_holders == 0 {
            return Err(ConfigurationError::InvalidResource(name));
        }
        self.resources.insert(name, max_holders);
        Ok(())
    }

    pub fn get(&self, id: &NodeId) -> Option<&Arc<WorkNode>> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    /// Nodes in declaration order
    pub fn nodes(&self) -> &[Arc<WorkNode>] {
        &self.nodes
    }

    pub fn resources(&self) -> &BTreeMap<String, usize> {
        &self.resources
    }

    pub(crate) fn position(&self, id: &NodeId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
