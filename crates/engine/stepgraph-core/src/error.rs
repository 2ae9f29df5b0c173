//! Error taxonomy for scheduling, validation, execution and control misuse.

use thiserror::Error;

use crate::ids::{DeviceIndex, NodeId, TaskId};
use crate::validation::ValidationMessage;

/// Fatal to scheduling; no partial plan is installed.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("dependency cycle between nodes {}", format_nodes(.nodes))]
    Cycle { nodes: Vec<NodeId> },
    #[error("memory block sizes did not converge after {attempts} passes (possible sizing cycle)")]
    SizingDidNotConverge { attempts: usize },
    #[error("node {0} updating its memory blocks failed: {1}")]
    Sizing(NodeId, anyhow::Error),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Structural misuse of the graph API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error("node {0} is not a group")]
    NotAGroup(NodeId),
    #[error("node {node} binds input '{input}' twice")]
    DuplicateInput { node: NodeId, input: String },
    #[error("node {node} declares output block '{block}' twice")]
    DuplicateBlock { node: NodeId, block: String },
    #[error("pending node index {0} is out of range for this change request")]
    UnknownPending(usize),
    #[error("the world node cannot be removed")]
    WorldRemoval,
    #[error("node {node} is not inside group {group}")]
    NotAChild { group: NodeId, node: NodeId },
    #[error("{0} identifiers are exhausted")]
    IdsExhausted(&'static str),
}

/// A task failed while a device was executing its portion of a step.
#[derive(Debug, Error)]
#[error("device {device}: task {task_name} ({task}) failed: {source}")]
pub struct ExecutionError {
    pub device: DeviceIndex,
    pub task: TaskId,
    pub task_name: String,
    #[source]
    pub source: anyhow::Error,
}

/// Umbrella error surfaced by [`Simulation`](crate::simulation::Simulation).
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("validation failed with {} error(s): {}", .0.len(), format_messages(.0))]
    Validation(Vec<ValidationMessage>),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("worker for device {device} panicked: {message}")]
    WorkerPanic { device: DeviceIndex, message: String },
    #[error("device {0} context is dead; reset devices and reschedule")]
    DeviceDead(DeviceIndex),
    #[error("simulation control error: {0}")]
    Control(String),
    #[error("task initialization failed for node {node}: {source}")]
    TaskInit {
        node: NodeId,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Persistence(#[from] crate::persistence::PersistenceError),
    #[error(transparent)]
    Pool(#[from] crate::pool::PoolError),
}

impl SimulationError {
    pub fn control(message: impl Into<String>) -> Self {
        SimulationError::Control(message.into())
    }
}

pub type Result<T, E = SimulationError> = std::result::Result<T, E>;

fn format_nodes(nodes: &[NodeId]) -> String {
    nodes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_messages(messages: &[ValidationMessage]) -> String {
    messages
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
