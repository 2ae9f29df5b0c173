use stepgraph::block::ExecContext;
use stepgraph::memory::DeviceMemory;
use stepgraph::{
    order_nodes, ExecutableId, NodeGraph, NodeGroup, NodeSpec, PlanBuilder, PlanCursor, PlanKind,
    Simulation, SimulationConfig,
};
use stepgraph_test_fixtures::nodes::Recorder;
use stepgraph_test_fixtures::{graphs, Journal};

fn recorder_graph(journal: &Journal) -> NodeGraph {
    let mut graph = NodeGraph::new();
    graph
        .add_node(Recorder::new("a", journal).with_tasks(2).spec())
        .unwrap();
    let group = graph.add_node(NodeSpec::group("g", NodeGroup)).unwrap();
    graph
        .add_child(group, Recorder::new("b", journal).with_one_shot().spec())
        .unwrap();
    graph
        .add_child(group, Recorder::new("c", journal).spec())
        .unwrap();
    graph
}

#[test]
fn plans_of_an_unchanged_graph_have_the_same_shape() {
    let built = graphs::build("diamond").unwrap();
    let first = PlanBuilder::build(&built.graph, None, None).unwrap();
    let second = PlanBuilder::build(&built.graph, None, None).unwrap();
    assert_eq!(first.standard.shape(), second.standard.shape());
    assert_eq!(first.init.shape(), second.init.shape());

    // incremental rebuild with nothing changed reuses every branch
    let reused = PlanBuilder::build(&built.graph, Some(&first), Some(&[][..])).unwrap();
    assert_eq!(reused.standard.shape(), first.standard.shape());
}

#[test]
fn diamond_orders_world_first_then_dependencies() {
    let built = graphs::build("diamond").unwrap();
    let order = order_nodes(&built.graph).unwrap();
    let pos = |name: &str| order.iter().position(|id| *id == built.id(name)).unwrap();
    assert_eq!(pos("world"), 0);
    assert!(pos("source") < pos("left"));
    assert!(pos("source") < pos("right"));
    assert!(pos("right") < pos("sink"));
}

#[test]
fn full_execution_matches_stepping_to_the_end() {
    let journal = Journal::new();
    let graph = recorder_graph(&journal);
    let mut plan = PlanBuilder::build(&graph, None, None).unwrap();
    let mut memory = DeviceMemory::new();

    let mut ctx = ExecContext {
        device: 0,
        step: 7,
        memory: &mut memory,
    };
    plan.standard.execute(&mut ctx).unwrap();
    let executed = journal.entries();
    journal.clear();

    plan.reset();
    let mut cursor = PlanCursor::at_root(PlanKind::Standard);
    let mut granules = 0;
    while cursor.step(&mut plan.standard, &mut ctx).unwrap().is_some() {
        granules += 1;
        assert!(granules < 64, "cursor did not terminate");
    }
    assert!(cursor.is_done());
    assert_eq!(journal.entries(), executed);
    assert_eq!(
        executed,
        vec!["run:a.t0:7", "run:a.t1:7", "run:b.t0:7", "run:c.t0:7"]
    );
}

#[test]
fn one_shot_tasks_run_only_on_the_first_step() {
    let journal = Journal::new();
    let graph = recorder_graph(&journal);
    let mut sim = Simulation::new(SimulationConfig::default()).unwrap();
    sim.schedule(graph).unwrap();
    let plan = sim.plan().unwrap();
    assert_eq!(plan.init.leaf_ids().len(), 1);
    assert_eq!(plan.standard.leaf_ids().len(), 4);
    sim.allocate_memory().unwrap();
    sim.init().unwrap();

    for _ in 0..3 {
        sim.perform_step(false).unwrap();
    }
    assert_eq!(journal.count_prefix("run:b.setup"), 1);
    assert_eq!(journal.count_prefix("run:c.t0"), 3);
    let setup = journal.position("run:b.setup:0").unwrap();
    assert!(setup < journal.position("run:a.t0:0").unwrap());
}

#[test]
fn disabling_a_task_rebuilds_the_plan() {
    let journal = Journal::new();
    let graph = recorder_graph(&journal);
    let a = graph.find_by_name("a").unwrap();
    let task = graph.node(a).unwrap().tasks()[1].id;
    let mut sim = Simulation::new(SimulationConfig::default()).unwrap();
    sim.schedule(graph).unwrap();
    sim.add_breakpoint(task);

    sim.set_task_enabled(task, false).unwrap();
    assert!(!sim.plan().unwrap().contains(ExecutableId::Task(task)));
    assert!(sim.breakpoints().is_empty());

    sim.set_task_enabled(task, true).unwrap();
    assert!(sim.plan().unwrap().contains(ExecutableId::Task(task)));
}
