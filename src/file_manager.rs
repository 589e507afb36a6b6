//! Coordinates reads when many node filters are packed into shared
//! container files.
//!
//! The manager owns the "currently open container" state: at most one file
//! handle is open at a time, and all node loads are serialized through it.
//! Opening a container loads every still-unloaded node block stored in it
//! in on-disk offset order, so a traversal touching the whole file costs
//! one open and a forward-only sequence of reads instead of an open/seek
//! per node.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::bloom::BloomFilter;
use crate::constants::READ_BUF_SIZE;
use crate::error::{BloomTreeError, Result};
use crate::tree::BloomTree;

/// Single owner of the open-container-file state.
#[derive(Debug)]
pub struct FileManager {
    /// Container file -> node indices stored in it, ordered by offset.
    containers: HashMap<PathBuf, Vec<usize>>,
    open_file: Option<(PathBuf, BufReader<File>)>,
}

impl FileManager {
    /// Build the filename-to-nodes mapping from a tree.
    pub fn new(tree: &BloomTree) -> FileManager {
        let mut containers: HashMap<PathBuf, Vec<usize>> = HashMap::new();
        for (ix, node) in tree.iter() {
            if let Some(loc) = &node.location {
                containers.entry(loc.file.clone()).or_default().push(ix);
            }
        }
        for members in containers.values_mut() {
            members.sort_by_key(|&ix| {
                tree.node(ix)
                    .location
                    .as_ref()
                    .map(|loc| loc.offset)
                    .unwrap_or(0)
            });
        }
        log::info!(
            "file manager: {} container file(s) for {} node(s)",
            containers.len(),
            tree.len()
        );
        FileManager {
            containers,
            open_file: None,
        }
    }

    /// Build the mapping and run the whole-tree consistency validation,
    /// failing on the first node whose filter parameters disagree.
    pub fn with_validation(tree: &mut BloomTree) -> Result<FileManager> {
        let mut manager = FileManager::new(tree);
        manager.validate_consistency(tree)?;
        Ok(manager)
    }

    /// Container files known to the manager.
    pub fn container_files(&self) -> impl Iterator<Item = &PathBuf> {
        self.containers.keys()
    }

    /// Node indices stored in one container, in offset order.
    pub fn nodes_in(&self, file: &Path) -> &[usize] {
        self.containers
            .get(file)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Ensure a node's filter is loaded.
    ///
    /// If the node's container is not the currently open file, the previous
    /// handle is closed and the new container opened; every still-unloaded
    /// node in that container is then read in offset order.
    pub fn load_node(&mut self, tree: &mut BloomTree, ix: usize) -> Result<()> {
        if tree.node(ix).filter.is_some() {
            return Ok(());
        }
        let file = match &tree.node(ix).location {
            Some(loc) => loc.file.clone(),
            None => {
                return Err(BloomTreeError::validation(format!(
                    "node '{}' has no filter storage",
                    tree.node(ix).name
                )))
            }
        };

        self.ensure_open(&file)?;
        let members = match self.containers.get(&file) {
            Some(members) => members.clone(),
            None => vec![ix],
        };
        let reader = match &mut self.open_file {
            Some((_, reader)) => reader,
            None => {
                return Err(BloomTreeError::validation(
                    "file manager lost its open handle",
                ))
            }
        };

        for member in members {
            if tree.node(member).filter.is_some() {
                continue;
            }
            let offset = match &tree.node(member).location {
                Some(loc) => loc.offset,
                None => continue,
            };
            reader
                .seek(SeekFrom::Start(offset))
                .map_err(|e| BloomTreeError::io(&file, "seek", e))?;
            let filter = BloomFilter::read_block(reader, &file)?;
            log::debug!(
                "file manager loaded '{}' from '{}' at offset {}",
                tree.node(member).name,
                file.display(),
                offset
            );
            tree.node_mut(member).filter = Some(filter);
        }
        Ok(())
    }

    /// Close the currently open container, if any. Idempotent; call at
    /// session end so the last opened handle does not leak.
    pub fn close_file(&mut self) {
        if let Some((path, _)) = self.open_file.take() {
            log::debug!("closing container '{}'", path.display());
        }
    }

    /// Load every node once, in post-order, comparing each against a model
    /// filter; the first mismatch is fatal and names the offending node.
    pub fn validate_consistency(&mut self, tree: &mut BloomTree) -> Result<()> {
        let order: Vec<usize> = tree.post_order().collect();
        let mut model: Option<usize> = None;
        for ix in order {
            if tree.node(ix).location.is_none() {
                continue;
            }
            self.load_node(tree, ix)?;
            match model {
                None => model = Some(ix),
                Some(m) => {
                    let model_bf = tree.node(m).filter.as_ref().ok_or_else(|| {
                        BloomTreeError::validation("model filter missing after load")
                    })?;
                    let bf = tree.node(ix).filter.as_ref().ok_or_else(|| {
                        BloomTreeError::validation("filter missing after load")
                    })?;
                    bf.assert_consistent_with(model_bf, &tree.node(ix).name)?;
                }
            }
        }
        log::info!("consistency check passed for {} nodes", tree.len());
        Ok(())
    }

    fn ensure_open(&mut self, file: &Path) -> Result<()> {
        if let Some((open, _)) = &self.open_file {
            if open == file {
                return Ok(());
            }
        }
        self.close_file();
        log::debug!("opening container '{}'", file.display());
        let handle = File::open(file).map_err(|e| BloomTreeError::io(file, "open", e))?;
        self.open_file = Some((
            file.to_path_buf(),
            BufReader::with_capacity(READ_BUF_SIZE, handle),
        ));
        Ok(())
    }
}

impl Drop for FileManager {
    fn drop(&mut self) {
        self.close_file();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bloom::FilterParams;
    use std::io::Write;

    fn make_filter(params: FilterParams, seq: &[u8]) -> BloomFilter {
        let hasher = params.hasher();
        let mut bf = BloomFilter::new_plain(params).unwrap();
        for positions in hasher.kmerize(seq, true, None) {
            bf.insert_positions(&positions).unwrap();
        }
        bf.finalize();
        bf
    }

    /// Write filters into one container, returning each block's offset.
    fn write_container(path: &Path, filters: &[&BloomFilter]) -> Vec<u64> {
        let mut out = File::create(path).unwrap();
        let mut offsets = Vec::new();
        let mut offset = 0u64;
        for bf in filters {
            offsets.push(offset);
            offset += bf.write_block(&mut out, path).unwrap();
        }
        out.flush().unwrap();
        offsets
    }

    fn shared_file_tree(dir: &Path, params: FilterParams) -> BloomTree {
        let root = make_filter(params, b"ACGTACGTACGTACGTTTTT");
        let leaf1 = make_filter(params, b"ACGTACGTACGTACGT");
        let leaf2 = make_filter(params, b"TTTTTTTTTTTTTTTT");
        let container = dir.join("all.bf");
        let offsets = write_container(&container, &[&root, &leaf1, &leaf2]);

        let topo = dir.join("tree.sbt");
        let mut f = File::create(&topo).unwrap();
        writeln!(f, "root@all.bf:{}", offsets[0]).unwrap();
        writeln!(f, "*leaf1@all.bf:{}", offsets[1]).unwrap();
        writeln!(f, "*leaf2@all.bf:{}", offsets[2]).unwrap();
        drop(f);

        BloomTree::read_topology(&topo).unwrap()
    }

    fn test_params() -> FilterParams {
        FilterParams {
            num_bits: 1024,
            num_hashes: 2,
            kmer_size: 8,
            hash_seed: 7,
        }
    }

    #[test]
    fn test_mapping_orders_by_offset() {
        let dir = tempfile::tempdir().unwrap();
        let tree = shared_file_tree(dir.path(), test_params());
        let manager = FileManager::new(&tree);

        let container = dir.path().join("all.bf");
        let members = manager.nodes_in(&container);
        assert_eq!(members.len(), 3);
        let offsets: Vec<u64> = members
            .iter()
            .map(|&ix| tree.node(ix).location.as_ref().unwrap().offset)
            .collect();
        let mut sorted = offsets.clone();
        sorted.sort_unstable();
        assert_eq!(offsets, sorted);
    }

    #[test]
    fn test_load_node_loads_whole_container() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = shared_file_tree(dir.path(), test_params());
        let mut manager = FileManager::new(&tree);

        let root = tree.root();
        let leaf1 = tree.node(root).children[0];
        manager.load_node(&mut tree, leaf1).unwrap();

        // One batched pass brought in every node of the container.
        for (_, node) in tree.iter() {
            assert!(node.is_loaded(), "node '{}' not loaded", node.name);
        }
        manager.close_file();
    }

    #[test]
    fn test_close_file_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let tree = shared_file_tree(dir.path(), test_params());
        let mut manager = FileManager::new(&tree);
        manager.close_file();
        manager.close_file();
    }

    #[test]
    fn test_validation_passes_on_consistent_tree() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = shared_file_tree(dir.path(), test_params());
        assert!(FileManager::with_validation(&mut tree).is_ok());
    }

    #[test]
    fn test_validation_names_inconsistent_node() {
        let dir = tempfile::tempdir().unwrap();
        let params = test_params();
        let mut bad_params = params;
        bad_params.kmer_size = 12;

        let root = make_filter(params, b"ACGTACGTACGTACGTTTTT");
        let leaf1 = make_filter(params, b"ACGTACGTACGTACGT");
        let leaf2 = make_filter(bad_params, b"TTTTTTTTTTTTTTTT");
        let container = dir.path().join("all.bf");
        let offsets = write_container(&container, &[&root, &leaf1, &leaf2]);

        let topo = dir.path().join("tree.sbt");
        let mut f = File::create(&topo).unwrap();
        writeln!(f, "root@all.bf:{}", offsets[0]).unwrap();
        writeln!(f, "*leaf1@all.bf:{}", offsets[1]).unwrap();
        writeln!(f, "*leaf2@all.bf:{}", offsets[2]).unwrap();
        drop(f);

        let mut tree = BloomTree::read_topology(&topo).unwrap();
        let err = FileManager::with_validation(&mut tree).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("leaf2"), "message was: {}", msg);
        assert!(msg.contains("k-mer length"));
    }
}
