//! stepgraph-core
//!
//! Step-wise execution engine for node graphs: plan building, one worker per compute
//! device, fixed-point memory sizing, interactive debugging and runtime model changes.

pub mod block;
pub mod breakpoints;
pub mod config;
pub mod context;
pub mod cursor;
pub mod debug;
pub mod device;
pub mod error;
pub mod events;
pub mod graph;
pub mod ids;
pub mod memory;
pub mod model_change;
pub mod node;
pub mod persistence;
pub mod planner;
pub mod pool;
pub mod simulation;
pub mod validation;

pub use block::{Executable, ExecutionBlock, ProfilingSample, StepResult, TaskLeaf};
pub use breakpoints::Breakpoints;
pub use config::SimulationConfig;
pub use context::{BlockReader, TaskContext};
pub use cursor::{DebugPosition, PlanCursor};
pub use debug::{DebugController, DebugStepMode};
pub use error::{BuildError, ExecutionError, GraphError, Result, SimulationError};
pub use events::{SimulationEvent, SimulationState};
pub use graph::{NodeEntry, NodeGraph, NodeSpec, Source};
pub use ids::{BlockId, DeviceIndex, ExecutableId, NodeId, PlanKind, TaskId};
pub use memory::{update_memory_model, BlockDecl, BlockKey, BlockSize, MemoryBlock, Shape};
pub use model_change::{ChildView, GroupView, ModelChangeRequest, ModelChanger};
pub use node::{Node, NodeGroup, SizingContext, Task, TaskDecl};
pub use persistence::{BlockSerializer, PersistedBlock};
pub use planner::{order_nodes, ExecutionPlan, PlanBuilder};
pub use simulation::{ProfilingEntry, Simulation};
pub use validation::{Severity, ValidationContext, ValidationMessage, Validator};
