//! Process-wide node factory registry.
//!
//! Factories let node kinds be looked up by name at plan-build time, so
//! front ends can assemble graphs from declarative plans without linking
//! against every node module. The built-in kinds are pre-registered in the
//! process-wide instance returned by [`default_registry`].

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use brook_common::{BrookError, Result};

use crate::node::NodeId;
use crate::nodes::{
    AggregateOptions, FilterNode, FilterOptions, GroupByNode, GroupByOptions, ProjectNode,
    ProjectOptions, ScalarAggregateNode, SinkNode, SinkOptions, SourceNode, SourceOptions,
};
use crate::plan::ExecPlan;

/// Builds one node from type-erased options, adds it to the plan, and
/// returns its id.
pub type NodeFactory =
    Arc<dyn Fn(&ExecPlan, &[NodeId], Box<dyn Any + Send>) -> Result<NodeId> + Send + Sync>;

/// Thread-safe name-to-factory map.
#[derive(Default)]
pub struct NodeRegistry {
    factories: RwLock<HashMap<String, NodeFactory>>,
}

impl NodeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`. Duplicate names are rejected so a
    /// later registration cannot silently shadow an earlier one.
    pub fn add_factory(&self, name: impl Into<String>, factory: NodeFactory) -> Result<()> {
        let name = name.into();
        let mut factories = self.factories.write().expect("registry lock poisoned");
        if factories.contains_key(&name) {
            return Err(BrookError::FactoryExists(name));
        }
        factories.insert(name, factory);
        Ok(())
    }

    /// Look up the factory registered under `name`.
    pub fn get_factory(&self, name: &str) -> Result<NodeFactory> {
        self.factories
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| BrookError::FactoryNotFound(name.to_string()))
    }

    /// Build a node of the named kind and add it to `plan`.
    pub fn make_exec_node(
        &self,
        name: &str,
        plan: &ExecPlan,
        inputs: &[NodeId],
        options: Box<dyn Any + Send>,
    ) -> Result<NodeId> {
        (self.get_factory(name)?)(plan, inputs, options)
    }

    /// Registered kind names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

fn expect_inputs(name: &str, inputs: &[NodeId], want: usize) -> Result<()> {
    if inputs.len() != want {
        return Err(BrookError::Graph(format!(
            "{name} node takes {want} input(s), got {}",
            inputs.len()
        )));
    }
    Ok(())
}

fn downcast_options<T: 'static>(name: &str, options: Box<dyn Any + Send>) -> Result<Box<T>> {
    options.downcast::<T>().map_err(|_| {
        BrookError::InvalidConfig(format!(
            "{name} node options have the wrong type (expected {})",
            std::any::type_name::<T>()
        ))
    })
}

fn register_builtins(registry: &NodeRegistry) {
    let builtins: [(&str, NodeFactory); 6] = [
        (
            "source",
            Arc::new(|plan, inputs, options| {
                expect_inputs("source", inputs, 0)?;
                let options = downcast_options::<SourceOptions>("source", options)?;
                SourceNode::make(plan, *options)
            }),
        ),
        (
            "sink",
            Arc::new(|plan, inputs, options| {
                expect_inputs("sink", inputs, 1)?;
                let options = downcast_options::<SinkOptions>("sink", options)?;
                SinkNode::make_with_options(plan, inputs[0], *options)
            }),
        ),
        (
            "filter",
            Arc::new(|plan, inputs, options| {
                expect_inputs("filter", inputs, 1)?;
                let options = downcast_options::<FilterOptions>("filter", options)?;
                FilterNode::make(plan, inputs[0], *options)
            }),
        ),
        (
            "project",
            Arc::new(|plan, inputs, options| {
                expect_inputs("project", inputs, 1)?;
                let options = downcast_options::<ProjectOptions>("project", options)?;
                ProjectNode::make(plan, inputs[0], *options)
            }),
        ),
        (
            "scalar_aggregate",
            Arc::new(|plan, inputs, options| {
                expect_inputs("scalar_aggregate", inputs, 1)?;
                let options = downcast_options::<AggregateOptions>("scalar_aggregate", options)?;
                ScalarAggregateNode::make(plan, inputs[0], *options)
            }),
        ),
        (
            "group_by",
            Arc::new(|plan, inputs, options| {
                expect_inputs("group_by", inputs, 1)?;
                let options = downcast_options::<GroupByOptions>("group_by", options)?;
                GroupByNode::make(plan, inputs[0], *options)
            }),
        ),
    ];
    for (name, factory) in builtins {
        registry
            .add_factory(name, factory)
            .expect("builtin registered twice");
    }
}

/// The process-wide registry with all built-in node kinds pre-registered.
pub fn default_registry() -> &'static NodeRegistry {
    static REGISTRY: OnceLock<NodeRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let registry = NodeRegistry::new();
        register_builtins(&registry);
        registry
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_factory_rejected() {
        let registry = NodeRegistry::new();
        let factory: NodeFactory =
            Arc::new(|_, _, _| Err(BrookError::Execution("unused".to_string())));
        registry.add_factory("custom", factory.clone()).unwrap();
        let err = registry.add_factory("custom", factory).unwrap_err();
        assert!(matches!(err, BrookError::FactoryExists(name) if name == "custom"));
    }

    #[test]
    fn missing_factory_reported() {
        let registry = NodeRegistry::new();
        let err = registry
            .get_factory("no_such_kind")
            .err()
            .expect("lookup should fail");
        assert!(matches!(err, BrookError::FactoryNotFound(name) if name == "no_such_kind"));
    }

    #[test]
    fn builtins_present() {
        let names = default_registry().names();
        for kind in [
            "filter",
            "group_by",
            "project",
            "scalar_aggregate",
            "sink",
            "source",
        ] {
            assert!(names.iter().any(|n| n == kind), "missing builtin {kind}");
        }
    }
}
