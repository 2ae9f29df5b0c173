use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use stepgraph::{BlockSerializer, NodeId, PersistedBlock, Shape, Simulation, SimulationConfig};
use stepgraph_test_fixtures::{configs, graphs};

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("stepgraph-it-{name}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    dir
}

fn run(config: SimulationConfig, steps: usize) -> (Simulation, HashMap<String, NodeId>) {
    let built = graphs::build("persistent").unwrap();
    let ids = built.ids.clone();
    let mut sim = Simulation::new(config).unwrap();
    sim.schedule(built.graph).unwrap();
    sim.allocate_memory().unwrap();
    sim.init().unwrap();
    for _ in 0..steps {
        sim.perform_step(false).unwrap();
    }
    (sim, ids)
}

#[test]
fn blocks_saved_on_stop_are_loaded_on_the_next_run() {
    let dir = scratch("roundtrip");
    let config = SimulationConfig::default().with_data_folder(&dir);

    let (mut first, names) = run(config.clone(), 3);
    assert_eq!(first.read_block(names["counter"], "acc").unwrap(), vec![3.0; 3]);
    first.finish().unwrap();

    let serializer = BlockSerializer::new(&dir);
    assert!(serializer.path_for("counter", "acc").exists());
    assert!(!serializer.path_for("scratch", "acc").exists());

    // step 0 runs, then the saved data replaces the fresh block
    let (second, names) = run(config, 2);
    assert_eq!(second.read_block(names["counter"], "acc").unwrap(), vec![4.0; 3]);
    assert_eq!(second.read_block(names["scratch"], "acc").unwrap(), vec![2.0; 2]);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn autosave_writes_on_the_configured_interval() {
    let dir = scratch("autosave");
    let config = SimulationConfig::from_json_str(&configs::json("autosave").unwrap())
        .unwrap()
        .with_data_folder(&dir);
    assert_eq!(config.autosave_interval, 2);

    let (_sim, _names) = run(config.clone(), 2);
    let serializer = BlockSerializer::new(&dir);
    assert_eq!(serializer.load("counter", "acc").unwrap(), None);

    let (_sim, _names) = run(config, 3);
    let record = serializer.load("counter", "acc").unwrap().expect("autosaved");
    assert_eq!(record.data, vec![3.0; 3]);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn mismatched_records_are_skipped() {
    let dir = scratch("mismatch");
    let serializer = BlockSerializer::new(&dir);
    serializer
        .save(&PersistedBlock {
            node: "counter".into(),
            block: "acc".into(),
            count: 5,
            shape: Shape::vector(5),
            data: vec![9.0; 5],
        })
        .unwrap();

    let config = SimulationConfig::default().with_data_folder(&dir);
    let (sim, names) = run(config, 1);
    assert_eq!(sim.read_block(names["counter"], "acc").unwrap(), vec![1.0; 3]);
    let _ = fs::remove_dir_all(&dir);
}
