/// Hot-swappable node type catalog using ArcSwap
///
/// Maps node type strings to their static planning attributes (cost weight,
/// estimated duration, executor capability). Planning validates every node
/// against the catalog so unknown types fail fast at plan-build time instead
/// of defaulting silently. Registering a new type swaps the whole map pointer,
/// so concurrent planners never observe a half-updated catalog.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};

use crate::error::PlanError;
use crate::workflow::types::Node;

/// What kind of resource an executor for this node type leans on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Entry points that only forward their input
    Trigger,
    /// Outbound HTTP through the pooled agents
    Http,
    /// Database work through the pooled handles
    Database,
    /// In-process data shaping
    Compute,
    /// Model inference or other long-running processing
    Inference,
    /// Waits on a timer
    Timer,
}

/// Static planning attributes for one node type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTypeSpec {
    /// Relative cost used when reporting partition complexity
    pub cost_weight: u32,
    /// Expected wall time of one invocation, for plan duration estimates only
    #[serde(with = "duration_ms")]
    pub estimated_duration: Duration,
    pub capability: Capability,
    /// Whether outputs of this type are deterministic and may be cached
    pub cacheable: bool,
}

impl NodeTypeSpec {
    pub fn new(cost_weight: u32, estimated_ms: u64, capability: Capability, cacheable: bool) -> Self {
        Self {
            cost_weight,
            estimated_duration: Duration::from_millis(estimated_ms),
            capability,
            cacheable,
        }
    }
}

/// Lock-free node type catalog
#[derive(Debug)]
pub struct NodeCatalog {
    types: ArcSwap<HashMap<String, NodeTypeSpec>>,
}

impl Default for NodeCatalog {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl NodeCatalog {
    /// Empty catalog; every lookup fails until types are registered
    pub fn empty() -> Self {
        Self {
            types: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    /// Catalog pre-populated with the built-in node types
    pub fn with_builtins() -> Self {
        let builtins = [
            ("trigger", NodeTypeSpec::new(1, 10, Capability::Trigger, false)),
            ("webhook", NodeTypeSpec::new(1, 10, Capability::Trigger, false)),
            ("http_request", NodeTypeSpec::new(3, 1_000, Capability::Http, false)),
            ("database", NodeTypeSpec::new(4, 500, Capability::Database, false)),
            ("ai_agent", NodeTypeSpec::new(10, 5_000, Capability::Inference, true)),
            ("transform", NodeTypeSpec::new(2, 100, Capability::Compute, true)),
            ("code", NodeTypeSpec::new(3, 200, Capability::Compute, true)),
            ("condition", NodeTypeSpec::new(1, 50, Capability::Compute, true)),
            ("merge", NodeTypeSpec::new(1, 50, Capability::Compute, true)),
            ("delay", NodeTypeSpec::new(1, 1_000, Capability::Timer, false)),
            ("notify", NodeTypeSpec::new(2, 300, Capability::Http, false)),
        ];

        let map = builtins
            .into_iter()
            .map(|(name, spec)| (name.to_string(), spec))
            .collect::<HashMap<_, _>>();

        Self {
            types: ArcSwap::new(Arc::new(map)),
        }
    }

    /// Register or replace a node type (atomic pointer swap)
    pub fn register(&self, node_type: impl Into<String>, spec: NodeTypeSpec) {
        let node_type = node_type.into();
        self.types.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(node_type.clone(), spec.clone());
            next
        });
        tracing::info!("🧩 Registered node type '{}'", node_type);
    }

    /// Remove a node type; returns whether it existed
    pub fn unregister(&self, node_type: &str) -> bool {
        if !self.types.load().contains_key(node_type) {
            return false;
        }
        self.types.rcu(|current| {
            let mut next = (**current).clone();
            next.remove(node_type);
            next
        });
        tracing::info!("🗑️ Unregistered node type '{}'", node_type);
        true
    }

    /// Lock-free lookup
    pub fn get(&self, node_type: &str) -> Option<NodeTypeSpec> {
        self.types.load().get(node_type).cloned()
    }

    /// Resolve a node's type or fail with the offending node id
    pub fn resolve(&self, node: &Node) -> Result<NodeTypeSpec, PlanError> {
        self.get(&node.node_type)
            .ok_or_else(|| PlanError::UnknownNodeType {
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
            })
    }

    /// Registered type names, sorted
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.load().keys().cloned().collect();
        names.sort();
        names
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
