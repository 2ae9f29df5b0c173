use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use stepgraph::{NodeGraph, NodeGroup, NodeId, NodeSpec};

pub mod nodes;

pub use nodes::Journal;

static MANIFEST: Lazy<Manifest> = Lazy::new(|| {
    let raw = include_str!("../../../../fixtures/manifest.json");
    serde_json::from_str(raw).expect("fixtures manifest should parse")
});

#[derive(Debug, Deserialize)]
struct Manifest {
    graphs: HashMap<String, String>,
    configs: HashMap<String, String>,
}

fn fixtures_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../../fixtures")
}

fn resolve_path(rel: &str) -> PathBuf {
    fixtures_root().join(rel)
}

fn read_to_string(rel: &str) -> Result<String> {
    let path = resolve_path(rel);
    fs::read_to_string(&path)
        .with_context(|| format!("failed to read fixture at {}", path.display()))
}

fn load_json<T: DeserializeOwned>(rel: &str) -> Result<T> {
    let text = read_to_string(rel)?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse JSON fixture {rel}"))
}

fn lookup<'a, T>(map: &'a HashMap<String, T>, kind: &str, name: &str) -> Result<&'a T> {
    map.get(name)
        .ok_or_else(|| anyhow!("unknown {kind} fixture '{name}'"))
}

pub mod graphs {
    use super::*;

    pub fn keys() -> Vec<String> {
        MANIFEST.graphs.keys().cloned().collect()
    }

    pub fn load<T: DeserializeOwned>(name: &str) -> Result<T> {
        let rel = lookup(&MANIFEST.graphs, "graph", name)?;
        super::load_json(rel)
    }

    /// Build the named graph fixture.
    pub fn build(name: &str) -> Result<BuiltGraph> {
        let doc: GraphDoc = load(name)?;
        build_graph(&doc).with_context(|| format!("failed to build graph fixture '{name}'"))
    }
}

pub mod configs {
    use super::*;

    pub fn keys() -> Vec<String> {
        MANIFEST.configs.keys().cloned().collect()
    }

    /// Raw JSON text, for parsers that take a string.
    pub fn json(name: &str) -> Result<String> {
        let rel = lookup(&MANIFEST.configs, "config", name)?;
        read_to_string(rel)
    }

    pub fn path(name: &str) -> Result<PathBuf> {
        let rel = lookup(&MANIFEST.configs, "config", name)?;
        Ok(resolve_path(rel))
    }
}

/// Declarative graph fixture: a node list plus name-based wiring.
#[derive(Debug, Deserialize)]
pub struct GraphDoc {
    #[serde(default)]
    pub world: Option<NodeDoc>,
    pub nodes: Vec<NodeDoc>,
}

#[derive(Debug, Deserialize)]
pub struct NodeDoc {
    pub name: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(default)]
    pub device: usize,
    /// `input name -> "node.block"`.
    #[serde(default)]
    pub inputs: HashMap<String, String>,
    #[serde(default)]
    pub children: Vec<NodeDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Producer {
        count: usize,
        #[serde(default)]
        value: f32,
        #[serde(default)]
        shared: bool,
    },
    PassThrough,
    Accumulator {
        count: usize,
        #[serde(default)]
        persistent: bool,
    },
    Failing {
        fail_at: u64,
    },
    GrowingSizer,
    Group,
}

/// A built fixture graph with its name lookup.
pub struct BuiltGraph {
    pub graph: NodeGraph,
    pub ids: HashMap<String, NodeId>,
}

impl BuiltGraph {
    pub fn id(&self, name: &str) -> NodeId {
        self.ids[name]
    }
}

fn spec_for(doc: &NodeDoc) -> NodeSpec {
    let spec = match &doc.kind {
        NodeKind::Producer {
            count,
            value,
            shared,
        } => NodeSpec::new(
            doc.name.clone(),
            nodes::Producer {
                count: *count,
                value: *value,
                shared: *shared,
            },
        ),
        NodeKind::PassThrough => NodeSpec::new(doc.name.clone(), nodes::PassThrough),
        NodeKind::Accumulator { count, persistent } => {
            let node = if *persistent {
                nodes::Accumulator::persistent(*count)
            } else {
                nodes::Accumulator::new(*count)
            };
            NodeSpec::new(doc.name.clone(), node)
        }
        NodeKind::Failing { fail_at } => {
            NodeSpec::new(doc.name.clone(), nodes::Failing { fail_at: *fail_at })
        }
        NodeKind::GrowingSizer => NodeSpec::new(doc.name.clone(), nodes::GrowingSizer),
        NodeKind::Group => NodeSpec::group(doc.name.clone(), NodeGroup),
    };
    spec.on_device(doc.device)
}

fn insert_tree(
    graph: &mut NodeGraph,
    parent: Option<NodeId>,
    doc: &NodeDoc,
    ids: &mut HashMap<String, NodeId>,
) -> Result<()> {
    let spec = spec_for(doc);
    let id = match parent {
        Some(group) => graph.add_child(group, spec)?,
        None => graph.add_node(spec)?,
    };
    if ids.insert(doc.name.clone(), id).is_some() {
        bail!("duplicate node name '{}'", doc.name);
    }
    for child in &doc.children {
        insert_tree(graph, Some(id), child, ids)?;
    }
    Ok(())
}

fn wire_tree(graph: &mut NodeGraph, doc: &NodeDoc, ids: &HashMap<String, NodeId>) -> Result<()> {
    let node = ids[&doc.name];
    for (input, source) in &doc.inputs {
        let (source_node, block) = source
            .split_once('.')
            .ok_or_else(|| anyhow!("input '{input}' of '{}' must be 'node.block'", doc.name))?;
        let source_id = *ids
            .get(source_node)
            .ok_or_else(|| anyhow!("input '{input}' of '{}' names unknown node '{source_node}'", doc.name))?;
        graph.connect(node, input.clone(), source_id, block)?;
    }
    for child in &doc.children {
        wire_tree(graph, child, ids)?;
    }
    Ok(())
}

/// Insert every node first, then bind inputs by name so forward references work.
pub fn build_graph(doc: &GraphDoc) -> Result<BuiltGraph> {
    let mut graph = NodeGraph::new();
    let mut ids = HashMap::new();
    if let Some(world) = &doc.world {
        let id = graph.set_world(spec_for(world))?;
        ids.insert(world.name.clone(), id);
    }
    for node in &doc.nodes {
        insert_tree(&mut graph, None, node, &mut ids)?;
    }
    for node in doc.world.iter().chain(&doc.nodes) {
        wire_tree(&mut graph, node, &ids)?;
    }
    Ok(BuiltGraph { graph, ids })
}
