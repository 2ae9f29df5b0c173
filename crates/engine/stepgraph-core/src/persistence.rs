//! Load/save of persistable memory blocks.
//!
//! One JSON record per block, stored at `<folder>/<node name>/<block name>.json`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::{NodeEntry, NodeGraph};
use crate::ids::NodeId;
use crate::memory::{BlockKey, MemoryManager, Shape};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed block record {path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedBlock {
    pub node: String,
    pub block: String,
    pub count: usize,
    #[serde(default)]
    pub shape: Shape,
    pub data: Vec<f32>,
}

#[derive(Clone, Debug)]
pub struct BlockSerializer {
    folder: PathBuf,
}

impl BlockSerializer {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn path_for(&self, node: &str, block: &str) -> PathBuf {
        self.folder
            .join(sanitize(node))
            .join(format!("{}.json", sanitize(block)))
    }

    pub fn save(&self, record: &PersistedBlock) -> Result<PathBuf, PersistenceError> {
        let path = self.path_for(&record.node, &record.block);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|source| PersistenceError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let text = serde_json::to_string(record).map_err(|source| PersistenceError::Format {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, text).map_err(|source| PersistenceError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// `Ok(None)` when no record exists.
    pub fn load(&self, node: &str, block: &str) -> Result<Option<PersistedBlock>, PersistenceError> {
        let path = self.path_for(node, block);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(PersistenceError::Io { path, source }),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| PersistenceError::Format { path, source })
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect()
}

fn selected<'a>(
    graph: &'a NodeGraph,
    nodes: &'a [NodeId],
    all: bool,
    wants: fn(&NodeEntry) -> bool,
) -> impl Iterator<Item = &'a NodeEntry> + 'a {
    nodes
        .iter()
        .filter_map(move |id| graph.node(*id))
        .filter(move |entry| all || wants(entry))
}

/// Save every persistable block of the selected nodes from their owning device.
/// Returns the number of records written.
pub fn save_blocks(
    serializer: &BlockSerializer,
    graph: &NodeGraph,
    memory: &MemoryManager,
    nodes: &[NodeId],
    all: bool,
) -> Result<usize, PersistenceError> {
    let mut written = 0;
    for entry in selected(graph, nodes, all, |e| e.behavior().save_on_stop()) {
        for block in entry.outputs().values().filter(|b| b.persistable) {
            let key = BlockKey::new(entry.id(), block.name.clone());
            let Some(data) = memory.read(entry.device(), &key) else {
                log::warn!("block {} of '{}' is not allocated; not saved", block.name, entry.name());
                continue;
            };
            serializer.save(&PersistedBlock {
                node: entry.name().to_string(),
                block: block.name.clone(),
                count: block.count,
                shape: block.shape.clone(),
                data,
            })?;
            written += 1;
        }
    }
    Ok(written)
}

/// Load every persistable block of the selected nodes into their owning device.
/// Missing records and size mismatches are skipped. Returns the number of blocks loaded.
pub fn load_blocks(
    serializer: &BlockSerializer,
    graph: &NodeGraph,
    memory: &MemoryManager,
    nodes: &[NodeId],
    all: bool,
) -> Result<usize, PersistenceError> {
    let mut loaded = 0;
    for entry in selected(graph, nodes, all, |e| e.behavior().load_on_start()) {
        for block in entry.outputs().values().filter(|b| b.persistable) {
            let Some(record) = serializer.load(entry.name(), &block.name)? else {
                log::warn!(
                    "no saved data for block {} of '{}' in {}",
                    block.name,
                    entry.name(),
                    serializer.folder().display()
                );
                continue;
            };
            if record.count != block.count || record.data.len() != block.count {
                log::warn!(
                    "saved block {} of '{}' has {} element(s), expected {}; skipped",
                    block.name,
                    entry.name(),
                    record.data.len(),
                    block.count
                );
                continue;
            }
            let key = BlockKey::new(entry.id(), block.name.clone());
            if memory.write(entry.device(), &key, &record.data) {
                loaded += 1;
            } else {
                log::warn!("block {} of '{}' is not allocated; not loaded", block.name, entry.name());
            }
        }
    }
    Ok(loaded)
}
