use stepgraph::{NodeGraph, NodeSpec, SimulationConfig, SimulationError, SimulationEvent};
use stepgraph_runner::{RunState, RunnerConfig, SimulationHandler};
use stepgraph_test_fixtures::nodes::{Recorder, SwapGroup};
use stepgraph_test_fixtures::{graphs, Journal};

fn recorder_graph(journal: &Journal, tasks: usize) -> NodeGraph {
    let mut graph = NodeGraph::new();
    graph
        .add_node(Recorder::new("r", journal).with_tasks(tasks).spec())
        .unwrap();
    graph
}

#[test]
fn it_should_run_the_requested_number_of_steps() {
    let built = graphs::build("pipeline").unwrap();
    let consumer = built.id("consumer");
    let mut handler =
        SimulationHandler::new(SimulationConfig::default(), RunnerConfig::default(), built.graph)
            .unwrap();
    assert!(handler.run(1).is_err());

    handler.start_simulation().unwrap();
    assert_eq!(handler.state(), RunState::Running);
    let report = handler.run(3).unwrap();
    assert_eq!(report.steps_performed, 3);
    assert_eq!(report.final_step, 3);
    assert_eq!(report.pauses, 0);
    assert_eq!(
        handler.simulation().read_block(consumer, "out").unwrap(),
        vec![3.0; 4]
    );
}

#[test]
fn it_should_pause_on_breakpoints_and_resume_granule_by_granule() {
    let journal = Journal::new();
    let graph = recorder_graph(&journal, 3);
    let node = graph.find_by_name("r").unwrap();
    let tasks: Vec<_> = graph.node(node).unwrap().tasks().iter().map(|t| t.id).collect();
    let config = RunnerConfig {
        debug: true,
        ..RunnerConfig::default()
    };
    let mut handler = SimulationHandler::new(SimulationConfig::default(), config, graph).unwrap();
    handler.simulation_mut().add_breakpoint(tasks[1]);

    handler.start_simulation().unwrap();
    let report = handler.run(5).unwrap();
    assert_eq!(handler.state(), RunState::Paused);
    assert_eq!(report.pauses, 1);
    assert_eq!(report.steps_performed, 0);
    assert_eq!(report.final_step, 0);
    assert_eq!(journal.count_prefix("run:"), 1);

    assert!(handler.run(1).is_err());
    handler.step_once().unwrap();
    assert_eq!(journal.count_prefix("run:"), 2);
    assert!(journal.position("run:r.t1:0").is_some());
    assert_eq!(handler.state(), RunState::Paused);

    handler.start_simulation().unwrap();
    let report = handler.run(2).unwrap();
    // step 0 completes, then the breakpoint fires again inside step 1
    assert_eq!(report.steps_performed, 1);
    assert_eq!(report.final_step, 1);
    assert_eq!(report.pauses, 1);
    assert_eq!(handler.state(), RunState::Paused);
    assert!(journal.position("run:r.t0:1").is_some());
    assert!(journal.position("run:r.t1:1").is_none());
}

#[test]
fn state_changes_reach_every_node() {
    let journal = Journal::new();
    let mut handler = SimulationHandler::new(
        SimulationConfig::default(),
        RunnerConfig::default(),
        recorder_graph(&journal, 1),
    )
    .unwrap();

    handler.start_simulation().unwrap();
    handler.pause();
    handler.start_simulation().unwrap();
    handler.stop().unwrap();

    let states: Vec<String> = journal
        .entries()
        .into_iter()
        .filter(|e| e.starts_with("state:"))
        .collect();
    assert_eq!(
        states,
        vec![
            "state:r:Stopped->Running",
            "state:r:Running->Paused",
            "state:r:Paused->Running",
            "state:r:Running->Stopped",
        ]
    );
    assert!(journal.position("cleanup:r").is_some());
}

#[test]
fn model_changes_are_applied_between_steps() {
    let journal = Journal::new();
    let mut graph = NodeGraph::new();
    let group = graph
        .add_node(NodeSpec::group(
            "swapper",
            SwapGroup::new(&journal, 1)
                .removing("old")
                .adding("fresh"),
        ))
        .unwrap();
    graph
        .add_child(group, Recorder::new("old", &journal).spec())
        .unwrap();
    let mut handler =
        SimulationHandler::new(SimulationConfig::default(), RunnerConfig::default(), graph)
            .unwrap();

    handler.start_simulation().unwrap();
    let report = handler.run(3).unwrap();
    assert!(report
        .events
        .contains(&SimulationEvent::ModelChanged { node: group }));
    assert_eq!(journal.count_prefix("run:old.t0"), 1);
    assert_eq!(journal.count_prefix("run:fresh.t0"), 2);
}

#[test]
fn max_steps_stops_the_simulation() {
    let journal = Journal::new();
    let config = RunnerConfig::from_json_str(r#"{ "max_steps": 2 }"#).unwrap();
    let mut handler = SimulationHandler::new(
        SimulationConfig::default(),
        config,
        recorder_graph(&journal, 1),
    )
    .unwrap();

    handler.start_simulation().unwrap();
    let report = handler.run(10).unwrap();
    assert_eq!(report.final_step, 2);
    assert_eq!(handler.state(), RunState::Stopped);
    assert!(handler.simulation().is_finished());

    let err = handler.start_simulation().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SimulationError>(),
        Some(SimulationError::Control(_))
    ));
}
