//! Sample node behaviors used by tests and benches.

use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use stepgraph::{
    BlockDecl, DeviceIndex, GroupView, ModelChangeRequest, ModelChanger, Node, NodeSpec,
    SimulationState, SizingContext, Task, TaskContext, TaskDecl, ValidationContext,
};

/// Shared, ordered record of what fixture nodes did.
#[derive(Clone, Debug, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().expect("journal lock").push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().expect("journal lock").clone()
    }

    pub fn clear(&self) {
        self.0.lock().expect("journal lock").clear();
    }

    /// Index of the first entry equal to `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

/// Writes `value + step` into every element of its fixed-size `out` block.
pub struct Producer {
    pub count: usize,
    pub value: f32,
    /// Mirror `out` on every device.
    pub shared: bool,
}

impl Producer {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            value: 0.0,
            shared: false,
        }
    }
}

struct Emit(f32);

impl Task for Emit {
    fn execute(&mut self, ctx: &mut TaskContext<'_>) -> Result<()> {
        let value = self.0 + ctx.step() as f32;
        ctx.output("out")?.fill(value);
        Ok(())
    }
}

impl Node for Producer {
    fn memory_blocks(&self) -> Vec<BlockDecl> {
        let out = BlockDecl::new("out").with_count(self.count);
        vec![if self.shared { out.shared() } else { out }]
    }

    fn tasks(&mut self) -> Vec<TaskDecl> {
        vec![TaskDecl::new("emit", Emit(self.value))]
    }
}

/// Copies `in` to `out`; `out` is sized after `in`.
#[derive(Default)]
pub struct PassThrough;

struct CopyInput;

impl Task for CopyInput {
    fn execute(&mut self, ctx: &mut TaskContext<'_>) -> Result<()> {
        ctx.with_output("out", |inputs, out| {
            let input = inputs.input("in")?;
            if input.len() != out.len() {
                bail!("input has {} elements, output {}", input.len(), out.len());
            }
            out.copy_from_slice(input);
            Ok(())
        })
    }
}

impl Node for PassThrough {
    fn memory_blocks(&self) -> Vec<BlockDecl> {
        vec![BlockDecl::new("out")]
    }

    fn update_memory_blocks(&mut self, ctx: &mut SizingContext<'_>) -> Result<()> {
        let count = ctx.input_count("in");
        ctx.set_output_count("out", count)
    }

    fn tasks(&mut self) -> Vec<TaskDecl> {
        vec![TaskDecl::new("copy", CopyInput)]
    }

    fn validate(&self, ctx: &mut ValidationContext<'_>) {
        let bound = ctx.is_bound("in");
        ctx.assert_error(bound, "input 'in' must be connected");
    }
}

/// Adds one to every element of its persistable `acc` block each step.
pub struct Accumulator {
    pub count: usize,
    pub load_on_start: bool,
    pub save_on_stop: bool,
}

impl Accumulator {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            load_on_start: false,
            save_on_stop: false,
        }
    }

    pub fn persistent(count: usize) -> Self {
        Self {
            count,
            load_on_start: true,
            save_on_stop: true,
        }
    }
}

struct Increment;

impl Task for Increment {
    fn execute(&mut self, ctx: &mut TaskContext<'_>) -> Result<()> {
        for value in ctx.output("acc")?.iter_mut() {
            *value += 1.0;
        }
        Ok(())
    }
}

impl Node for Accumulator {
    fn memory_blocks(&self) -> Vec<BlockDecl> {
        vec![BlockDecl::new("acc").with_count(self.count).persistable()]
    }

    fn tasks(&mut self) -> Vec<TaskDecl> {
        vec![TaskDecl::new("increment", Increment)]
    }

    fn load_on_start(&self) -> bool {
        self.load_on_start
    }

    fn save_on_stop(&self) -> bool {
        self.save_on_stop
    }
}

/// Fails its task on one given step.
pub struct Failing {
    pub fail_at: u64,
}

struct FailAt(u64);

impl Task for FailAt {
    fn execute(&mut self, ctx: &mut TaskContext<'_>) -> Result<()> {
        if ctx.step() == self.0 {
            bail!("injected failure on step {}", self.0);
        }
        Ok(())
    }
}

impl Node for Failing {
    fn tasks(&mut self) -> Vec<TaskDecl> {
        vec![TaskDecl::new("fail", FailAt(self.fail_at))]
    }
}

/// Panics inside its task on one given step.
pub struct Panicking {
    pub panic_at: u64,
}

struct PanicAt(u64);

impl Task for PanicAt {
    fn execute(&mut self, ctx: &mut TaskContext<'_>) -> Result<()> {
        if ctx.step() == self.0 {
            panic!("injected panic on step {}", self.0);
        }
        Ok(())
    }
}

impl Node for Panicking {
    fn tasks(&mut self) -> Vec<TaskDecl> {
        vec![TaskDecl::new("panic", PanicAt(self.panic_at))]
    }
}

/// Output is one larger than its input: two of these wired in a loop never settle.
#[derive(Default)]
pub struct GrowingSizer;

impl Node for GrowingSizer {
    fn memory_blocks(&self) -> Vec<BlockDecl> {
        vec![BlockDecl::new("out").with_count(1)]
    }

    fn update_memory_blocks(&mut self, ctx: &mut SizingContext<'_>) -> Result<()> {
        let count = ctx.input_count("in") + 1;
        ctx.set_output_count("out", count)
    }
}

/// Records its lifecycle, sizing passes and every task run into a [`Journal`].
pub struct Recorder {
    pub name: String,
    pub journal: Journal,
    pub tasks: usize,
    pub one_shot: bool,
}

impl Recorder {
    pub fn new(name: impl Into<String>, journal: &Journal) -> Self {
        Self {
            name: name.into(),
            journal: journal.clone(),
            tasks: 1,
            one_shot: false,
        }
    }

    pub fn with_tasks(mut self, tasks: usize) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_one_shot(mut self) -> Self {
        self.one_shot = true;
        self
    }

    pub fn spec(self) -> NodeSpec {
        let name = self.name.clone();
        NodeSpec::new(name, self)
    }
}

struct RecordRun {
    label: String,
    journal: Journal,
}

impl Task for RecordRun {
    fn init(&mut self, device: usize) -> Result<()> {
        self.journal.push(format!("task-init:{}@{device}", self.label));
        Ok(())
    }

    fn execute(&mut self, ctx: &mut TaskContext<'_>) -> Result<()> {
        self.journal.push(format!("run:{}:{}", self.label, ctx.step()));
        Ok(())
    }
}

impl Node for Recorder {
    fn memory_blocks(&self) -> Vec<BlockDecl> {
        vec![BlockDecl::new("out").with_count(1)]
    }

    fn update_memory_blocks(&mut self, _ctx: &mut SizingContext<'_>) -> Result<()> {
        self.journal.push(format!("size:{}", self.name));
        Ok(())
    }

    fn tasks(&mut self) -> Vec<TaskDecl> {
        let mut tasks: Vec<TaskDecl> = (0..self.tasks)
            .map(|i| {
                TaskDecl::new(
                    format!("t{i}"),
                    RecordRun {
                        label: format!("{}.t{i}", self.name),
                        journal: self.journal.clone(),
                    },
                )
            })
            .collect();
        if self.one_shot {
            tasks.push(
                TaskDecl::new(
                    "setup",
                    RecordRun {
                        label: format!("{}.setup", self.name),
                        journal: self.journal.clone(),
                    },
                )
                .one_shot(),
            );
        }
        tasks
    }

    fn init_tasks(&mut self) {
        self.journal.push(format!("init:{}", self.name));
    }

    fn clear_signals(&mut self) {
        self.journal.push(format!("clear:{}", self.name));
    }

    fn cleanup(&mut self) {
        self.journal.push(format!("cleanup:{}", self.name));
    }

    fn on_state_changed(&mut self, from: SimulationState, to: SimulationState) {
        self.journal.push(format!("state:{}:{from:?}->{to:?}", self.name));
    }
}

/// Group that, from `at_step` on, removes its child `remove` and adds a recorder `add`.
///
/// Fires once: a missing `remove` child or an existing `add` child means the change is done.
pub struct SwapGroup {
    pub journal: Journal,
    pub at_step: u64,
    pub remove: Option<String>,
    pub add: Option<String>,
    pub add_device: DeviceIndex,
}

impl SwapGroup {
    pub fn new(journal: &Journal, at_step: u64) -> Self {
        Self {
            journal: journal.clone(),
            at_step,
            remove: None,
            add: None,
            add_device: 0,
        }
    }

    pub fn removing(mut self, name: impl Into<String>) -> Self {
        self.remove = Some(name.into());
        self
    }

    pub fn adding(mut self, name: impl Into<String>) -> Self {
        self.add = Some(name.into());
        self
    }

    pub fn adding_on(mut self, name: impl Into<String>, device: DeviceIndex) -> Self {
        self.add_device = device;
        self.adding(name)
    }
}

impl Node for SwapGroup {
    fn as_model_changer(&mut self) -> Option<&mut dyn ModelChanger> {
        Some(self)
    }
}

impl ModelChanger for SwapGroup {
    fn change_model(&mut self, view: &GroupView) -> ModelChangeRequest {
        if view.step < self.at_step {
            return ModelChangeRequest::none();
        }
        let mut request = ModelChangeRequest::none();
        if let Some(name) = &self.remove {
            match view.find(name) {
                Some(old) => request = request.remove(old.id),
                None => return ModelChangeRequest::none(),
            }
        }
        if let Some(name) = &self.add {
            if view.find(name).is_some() {
                return ModelChangeRequest::none();
            }
            let spec = Recorder::new(name.clone(), &self.journal)
                .spec()
                .on_device(self.add_device);
            request = request.add(spec);
        }
        request
    }
}

/// Group that adds a [`PassThrough`] without connecting its input.
pub struct BrokenAdder;

impl Node for BrokenAdder {
    fn as_model_changer(&mut self) -> Option<&mut dyn ModelChanger> {
        Some(self)
    }
}

impl ModelChanger for BrokenAdder {
    fn change_model(&mut self, view: &GroupView) -> ModelChangeRequest {
        if view.find("dangling").is_some() {
            return ModelChangeRequest::none();
        }
        ModelChangeRequest::none().add(NodeSpec::new("dangling", PassThrough))
    }
}
