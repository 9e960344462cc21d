//! Offline document ingestion used by the `rag-indexer` binary.

pub mod chunker;
pub mod extractor;
pub mod walker;

use std::collections::HashSet;
use std::path::Path;

use uuid::Uuid;

/// Stable source label stored with every chunk: the path relative to the indexed
/// root, always with `/` separators.
pub fn source_name(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Deterministic point id, so indexing the same file again overwrites its chunks.
pub fn point_id(source: &str, chunk_index: usize) -> String {
    let key = format!("{}#{}", source, chunk_index);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()).to_string()
}

/// Bookkeeping for one indexing pass, used afterwards to remove chunks the
/// collection should no longer serve.
#[derive(Debug, Default)]
pub struct IndexRun {
    present: HashSet<String>,
    reindexed: HashSet<String>,
    written: HashSet<String>,
}

impl IndexRun {
    /// A supported file found on disk, whether or not it indexed cleanly.
    pub fn saw(&mut self, source: &str) {
        self.present.insert(source.to_string());
    }

    /// A file indexed completely; `ids` are every point written for it.
    pub fn indexed(&mut self, source: &str, ids: impl IntoIterator<Item = String>) {
        self.reindexed.insert(source.to_string());
        self.written.extend(ids);
    }

    /// Stored point ids to delete: chunks of files that are gone, and trailing chunks
    /// of re-indexed files that shrank. Points of files that failed this run and
    /// points without a `source` payload are kept.
    pub fn stale(&self, stored: &[(String, Option<String>)]) -> Vec<String> {
        stored
            .iter()
            .filter_map(|(id, source)| {
                let source = source.as_deref()?;
                let gone = !self.present.contains(source);
                let superseded = self.reindexed.contains(source) && !self.written.contains(id);
                (gone || superseded).then(|| id.clone())
            })
            .collect()
    }
}
