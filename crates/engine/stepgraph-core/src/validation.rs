//! Batch validation of nodes and groups.

use std::fmt;

use hashbrown::HashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::graph::{NodeEntry, NodeGraph};
use crate::ids::NodeId;
use crate::memory::BlockSize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationMessage {
    pub node: Option<NodeId>,
    pub node_name: String,
    pub severity: Severity,
    pub message: String,
}

impl fmt::Display for ValidationMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node {
            Some(id) => write!(f, "{} ({}): {}", self.node_name, id, self.message),
            None => write!(f, "{}: {}", self.node_name, self.message),
        }
    }
}

/// Collects validation messages; a run of checks succeeds when no error was recorded.
#[derive(Debug, Default, Clone)]
pub struct Validator {
    messages: Vec<ValidationMessage>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn push(&mut self, message: ValidationMessage) {
        self.messages.push(message);
    }

    pub fn error(&mut self, node: Option<NodeId>, node_name: &str, message: impl Into<String>) {
        self.push(ValidationMessage {
            node,
            node_name: node_name.to_string(),
            severity: Severity::Error,
            message: message.into(),
        });
    }

    pub fn warning(&mut self, node: Option<NodeId>, node_name: &str, message: impl Into<String>) {
        self.push(ValidationMessage {
            node,
            node_name: node_name.to_string(),
            severity: Severity::Warning,
            message: message.into(),
        });
    }

    /// Record an error unless `condition` holds.
    pub fn assert_error(
        &mut self,
        condition: bool,
        node: Option<NodeId>,
        node_name: &str,
        message: impl Into<String>,
    ) {
        if !condition {
            self.error(node, node_name, message);
        }
    }

    pub fn messages(&self) -> &[ValidationMessage] {
        &self.messages
    }

    pub fn errors(&self) -> Vec<ValidationMessage> {
        self.messages
            .iter()
            .filter(|m| m.severity == Severity::Error)
            .cloned()
            .collect()
    }

    pub fn is_successful(&self) -> bool {
        self.messages.iter().all(|m| m.severity != Severity::Error)
    }
}

/// View handed to [`Node::validate`](crate::node::Node::validate).
pub struct ValidationContext<'a> {
    node: NodeId,
    name: &'a str,
    inputs: &'a IndexMap<String, Option<BlockSize>>,
    validator: &'a mut Validator,
}

impl<'a> ValidationContext<'a> {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn input(&self, input: &str) -> Option<&BlockSize> {
        self.inputs.get(input).and_then(Option::as_ref)
    }

    pub fn is_bound(&self, input: &str) -> bool {
        self.inputs.contains_key(input)
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.validator.error(Some(self.node), self.name, message);
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.validator.warning(Some(self.node), self.name, message);
    }

    pub fn assert_error(&mut self, condition: bool, message: impl Into<String>) {
        if !condition {
            self.error(message);
        }
    }
}

/// Checks every node must pass regardless of its behavior: the node sits on one of the
/// `devices`, and bound inputs resolve to an output block readable from its device.
pub fn validate_mandatory(
    graph: &NodeGraph,
    id: NodeId,
    devices: usize,
    validator: &mut Validator,
) {
    let Some(entry) = graph.node(id) else {
        validator.error(Some(id), "<unknown>", "node is not part of the graph");
        return;
    };
    check_device(entry, devices, validator);
    for (input, key) in entry.inputs() {
        let Some(source) = graph.node(key.node) else {
            validator.error(
                Some(id),
                entry.name(),
                format!("input '{input}' is bound to missing node {}", key.node),
            );
            continue;
        };
        match source.output(&key.block) {
            None => validator.error(
                Some(id),
                entry.name(),
                format!(
                    "input '{input}' is bound to unknown block '{}' of node '{}'",
                    key.block,
                    source.name()
                ),
            ),
            Some(block) if !block.shared && source.device() != entry.device() => validator.error(
                Some(id),
                entry.name(),
                format!(
                    "input '{input}' reads block '{}' of node '{}' on device {}, which is not shared",
                    key.block,
                    source.name(),
                    source.device()
                ),
            ),
            Some(_) => {}
        }
    }
}

fn check_device(entry: &NodeEntry, devices: usize, validator: &mut Validator) {
    if entry.device() >= devices {
        validator.error(
            Some(entry.id()),
            entry.name(),
            format!(
                "node is placed on device {} but only {devices} device(s) exist",
                entry.device()
            ),
        );
    }
}

/// Device placement of every node, checked when a graph is scheduled.
pub fn validate_placement(graph: &NodeGraph, devices: usize, validator: &mut Validator) {
    for entry in graph.iter() {
        check_device(entry, devices, validator);
    }
}

/// Mandatory checks followed by the node's own validation.
pub fn validate_node(graph: &NodeGraph, id: NodeId, devices: usize, validator: &mut Validator) {
    validate_mandatory(graph, id, devices, validator);
    let (Some(entry), Ok(inputs)) = (graph.node(id), graph.input_sizes(id)) else {
        return;
    };
    let mut ctx = ValidationContext {
        node: id,
        name: entry.name(),
        inputs: &inputs,
        validator,
    };
    entry.behavior().validate(&mut ctx);
}

/// Validate the world first, then every node; also flags duplicate node names, which
/// would collide in persisted block records.
pub fn validate_graph(graph: &NodeGraph, devices: usize, validator: &mut Validator) {
    let world = graph.world();
    if let Some(world) = world {
        validate_node(graph, world, devices, validator);
    }
    let mut seen: HashMap<&str, NodeId> = HashMap::new();
    for entry in graph.iter() {
        if let Some(first) = seen.insert(entry.name(), entry.id()) {
            validator.error(
                Some(entry.id()),
                entry.name(),
                format!("node name is already used by {first}"),
            );
        }
        if Some(entry.id()) != world {
            validate_node(graph, entry.id(), devices, validator);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeSpec;
    use crate::memory::BlockDecl;
    use crate::node::Node;

    struct Emits;

    impl Node for Emits {
        fn memory_blocks(&self) -> Vec<BlockDecl> {
            vec![BlockDecl::new("out").with_count(2)]
        }
    }

    struct NeedsInput;

    impl Node for NeedsInput {
        fn validate(&self, ctx: &mut ValidationContext<'_>) {
            let bound = ctx.is_bound("in");
            ctx.assert_error(bound, "input 'in' must be connected");
        }
    }

    #[test]
    fn it_should_report_unbound_and_dangling_inputs() {
        let mut g = NodeGraph::new();
        let a = g.add_node(NodeSpec::new("a", Emits)).unwrap();
        g.add_node(NodeSpec::new("b", NeedsInput)).unwrap();
        g.add_node(NodeSpec::new("c", NeedsInput).input("in", a, "missing"))
            .unwrap();

        let mut v = Validator::new();
        validate_graph(&g, 1, &mut v);
        let errors = v.errors();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("must be connected"));
        assert!(errors[1].message.contains("unknown block 'missing'"));
        assert!(!v.is_successful());
    }

    #[test]
    fn it_should_flag_duplicate_names() {
        let mut g = NodeGraph::new();
        g.add_node(NodeSpec::new("same", Emits)).unwrap();
        g.add_node(NodeSpec::new("same", Emits)).unwrap();
        let mut v = Validator::new();
        validate_graph(&g, 1, &mut v);
        assert_eq!(v.errors().len(), 1);
    }

    #[test]
    fn warnings_do_not_fail_validation() {
        let mut v = Validator::new();
        v.warning(None, "x", "just so you know");
        assert!(v.is_successful());
        v.assert_error(false, None, "x", "broken");
        assert!(!v.is_successful());
    }

    #[test]
    fn it_should_reject_nodes_on_missing_devices() {
        let mut g = NodeGraph::new();
        g.add_node(NodeSpec::new("near", Emits).on_device(1)).unwrap();
        g.add_node(NodeSpec::new("far", Emits).on_device(3)).unwrap();

        let mut v = Validator::new();
        validate_graph(&g, 2, &mut v);
        let errors = v.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].node_name, "far");
        assert!(errors[0].message.contains("device 3"));
    }

    struct EmitsShared;

    impl Node for EmitsShared {
        fn memory_blocks(&self) -> Vec<BlockDecl> {
            vec![BlockDecl::new("out").with_count(2).shared()]
        }
    }

    #[test]
    fn it_should_reject_cross_device_reads_of_local_blocks() {
        let mut g = NodeGraph::new();
        let local = g.add_node(NodeSpec::new("local", Emits)).unwrap();
        let shared = g.add_node(NodeSpec::new("shared", EmitsShared)).unwrap();
        g.add_node(NodeSpec::new("same", NeedsInput).input("in", local, "out"))
            .unwrap();
        g.add_node(
            NodeSpec::new("mirror", NeedsInput)
                .on_device(1)
                .input("in", shared, "out"),
        )
        .unwrap();
        g.add_node(
            NodeSpec::new("remote", NeedsInput)
                .on_device(1)
                .input("in", local, "out"),
        )
        .unwrap();

        let mut v = Validator::new();
        validate_graph(&g, 2, &mut v);
        let errors = v.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].node_name, "remote");
        assert!(errors[0].message.contains("not shared"));
    }
}
