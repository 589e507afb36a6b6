//! The bloom tree: a rooted hierarchy of nodes built once from a topology
//! description, traversed read-only by every query.
//!
//! Nodes live in an arena (`Vec<TreeNode>`) with index links, so the whole
//! tree is owned by one value and per-node filters can be loaded and
//! unloaded without touching the topology. Leaves carry per-dataset
//! filters; internal nodes carry a filter summarizing their subtree (the
//! union of descendant filters), which is what makes one-sided pruning
//! sound: a k-mer absent from an internal node is absent from every
//! descendant.
//!
//! # Topology format
//!
//! One node per line, depth given by leading `*`s, children following their
//! parent:
//!
//! ```text
//! root@all.bf:0
//! *leaf1@all.bf:8232
//! *leaf2@all.bf:16464
//! ```
//!
//! A node without an `@container:offset` reference stores its filter in
//! `<name>.bf` at offset 0. Relative container paths resolve against the
//! topology file's directory. Several depth-0 lines produce a synthetic
//! placeholder root with no filter of its own.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::bloom::BloomFilter;
use crate::constants::{MAX_NAME_LENGTH, MAX_TREE_NODES};
use crate::error::{BloomTreeError, Result};

/// Where a node's serialized filter block lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterLocation {
    pub file: PathBuf,
    pub offset: u64,
}

/// One tree node: a name, the on-disk location of its filter, the filter
/// itself when loaded, and its links.
#[derive(Debug)]
pub struct TreeNode {
    pub name: String,
    /// `None` only for a synthetic placeholder root.
    pub location: Option<FilterLocation>,
    /// `None` while unloaded.
    pub filter: Option<BloomFilter>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

impl TreeNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn is_loaded(&self) -> bool {
        self.filter.is_some()
    }
}

/// A rooted hierarchy of bloom filter nodes.
#[derive(Debug)]
pub struct BloomTree {
    nodes: Vec<TreeNode>,
    root: usize,
    nodes_share_files: bool,
}

impl BloomTree {
    /// Parse a topology file into an all-unloaded tree.
    pub fn read_topology(path: &Path) -> Result<BloomTree> {
        let file = File::open(path).map_err(|e| BloomTreeError::io(path, "open", e))?;
        let reader = BufReader::new(file);
        let base_dir = path.parent().unwrap_or_else(|| Path::new("")).to_path_buf();

        let mut nodes: Vec<TreeNode> = Vec::new();
        let mut names: HashSet<String> = HashSet::new();
        let mut file_uses: HashMap<PathBuf, usize> = HashMap::new();
        let mut explicit_offsets = false;
        // Ancestors of the node most recently added, outermost first.
        let mut stack: Vec<usize> = Vec::new();
        let mut roots: Vec<usize> = Vec::new();

        for (line_no, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| BloomTreeError::io(path, "read", e))?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let depth = trimmed.bytes().take_while(|&b| b == b'*').count();
            let entry = trimmed[depth..].trim();
            if entry.is_empty() {
                return Err(BloomTreeError::format(
                    path,
                    format!("line {}: missing node name", line_no + 1),
                ));
            }

            let (name, location) = parse_entry(entry, &base_dir, path, line_no + 1)?;
            if name.len() > MAX_NAME_LENGTH {
                return Err(BloomTreeError::format(
                    path,
                    format!("line {}: node name too long", line_no + 1),
                ));
            }
            if !names.insert(name.clone()) {
                return Err(BloomTreeError::format(
                    path,
                    format!("line {}: duplicate node name '{}'", line_no + 1, name),
                ));
            }
            if depth > stack.len() {
                return Err(BloomTreeError::format(
                    path,
                    format!("line {}: node '{}' skips a tree level", line_no + 1, name),
                ));
            }
            stack.truncate(depth);

            *file_uses.entry(location.file.clone()).or_insert(0) += 1;
            if location.offset != 0 {
                explicit_offsets = true;
            }

            let ix = nodes.len();
            if ix >= MAX_TREE_NODES {
                return Err(BloomTreeError::format(path, "too many nodes in topology"));
            }
            let parent = stack.last().copied();
            nodes.push(TreeNode {
                name,
                location: Some(location),
                filter: None,
                parent,
                children: Vec::new(),
            });
            match parent {
                Some(p) => nodes[p].children.push(ix),
                None => roots.push(ix),
            }
            stack.push(ix);
        }

        if nodes.is_empty() {
            return Err(BloomTreeError::format(path, "topology describes no nodes"));
        }

        let nodes_share_files = explicit_offsets || file_uses.values().any(|&n| n > 1);

        let root = if roots.len() == 1 {
            roots[0]
        } else {
            // Several top-level nodes: hang them under a placeholder.
            let ix = nodes.len();
            for &r in &roots {
                nodes[r].parent = Some(ix);
            }
            nodes.push(TreeNode {
                name: "(root)".to_string(),
                location: None,
                filter: None,
                parent: None,
                children: roots,
            });
            ix
        };

        log::info!(
            "topology '{}': {} nodes{}",
            path.display(),
            nodes.len(),
            if nodes_share_files {
                ", sharing container files"
            } else {
                ""
            }
        );

        Ok(BloomTree {
            nodes,
            root,
            nodes_share_files,
        })
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, ix: usize) -> &TreeNode {
        &self.nodes[ix]
    }

    pub fn node_mut(&mut self, ix: usize) -> &mut TreeNode {
        &mut self.nodes[ix]
    }

    /// Whether several nodes store their filters in shared container files
    /// (which is what makes a `FileManager` worthwhile).
    pub fn nodes_share_files(&self) -> bool {
        self.nodes_share_files
    }

    /// Iterate `(index, node)` pairs in arena order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &TreeNode)> {
        self.nodes.iter().enumerate()
    }

    /// Lazy, restartable post-order traversal (children before parents).
    pub fn post_order(&self) -> PostOrder<'_> {
        PostOrder {
            tree: self,
            stack: vec![(self.root, 0)],
        }
    }

    /// Load a node's filter from its container file. Idempotent; a no-op
    /// for already-loaded nodes.
    pub fn load(&mut self, ix: usize) -> Result<()> {
        if self.nodes[ix].filter.is_some() {
            return Ok(());
        }
        let (file, offset) = match &self.nodes[ix].location {
            Some(loc) => (loc.file.clone(), loc.offset),
            None => {
                return Err(BloomTreeError::validation(format!(
                    "node '{}' has no filter storage",
                    self.nodes[ix].name
                )))
            }
        };
        log::debug!(
            "loading filter for node '{}' from '{}' at offset {}",
            self.nodes[ix].name,
            file.display(),
            offset
        );
        let filter = BloomFilter::load_from_file(&file, offset)?;
        self.nodes[ix].filter = Some(filter);
        Ok(())
    }

    /// Force a node's filter to be resident without running a query.
    pub fn preload(&mut self, ix: usize) -> Result<()> {
        self.load(ix)
    }

    /// Release a node's filter storage; name, location, and links remain, so
    /// a later `load` restores the identical filter.
    pub fn unload(&mut self, ix: usize) {
        if self.nodes[ix].filter.take().is_some() {
            log::debug!("unloaded filter for node '{}'", self.nodes[ix].name);
        }
    }

    /// Release every node's filter storage.
    pub fn unload_all(&mut self) {
        for ix in 0..self.nodes.len() {
            self.unload(ix);
        }
    }

    /// A usable filter for the root, even when the root is a placeholder:
    /// the first stored node in post-order.
    pub fn real_filter(&mut self) -> Result<&BloomFilter> {
        let ix = self
            .post_order()
            .find(|&ix| self.nodes[ix].location.is_some())
            .ok_or_else(|| BloomTreeError::validation("tree has no stored filters"))?;
        self.load(ix)?;
        self.nodes[ix]
            .filter
            .as_ref()
            .ok_or_else(|| BloomTreeError::validation("filter missing after load"))
    }
}

fn parse_entry(
    entry: &str,
    base_dir: &Path,
    topology: &Path,
    line_no: usize,
) -> Result<(String, FilterLocation)> {
    let (name, file, offset) = match entry.split_once('@') {
        Some((name, storage)) => {
            let (file, offset_str) = storage.rsplit_once(':').ok_or_else(|| {
                BloomTreeError::format(
                    topology,
                    format!("line {}: storage reference '{}' needs container:offset", line_no, storage),
                )
            })?;
            let offset: u64 = offset_str.parse().map_err(|_| {
                BloomTreeError::format(
                    topology,
                    format!("line {}: bad offset '{}'", line_no, offset_str),
                )
            })?;
            (name.to_string(), file.to_string(), offset)
        }
        None => match entry.strip_suffix(".bf") {
            Some(stem) => (stem.to_string(), entry.to_string(), 0),
            None => (entry.to_string(), format!("{}.bf", entry), 0),
        },
    };

    let mut path = PathBuf::from(&file);
    if path.is_relative() {
        path = base_dir.join(path);
    }
    Ok((name, FilterLocation { file: path, offset }))
}

/// Iterator for [`BloomTree::post_order`].
pub struct PostOrder<'a> {
    tree: &'a BloomTree,
    /// `(node, next child to visit)` frames; explicit stack so deep trees
    /// cannot overflow the call stack.
    stack: Vec<(usize, usize)>,
}

impl Iterator for PostOrder<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            let &(node, cursor) = self.stack.last()?;
            let children = &self.tree.nodes[node].children;
            if cursor < children.len() {
                if let Some(frame) = self.stack.last_mut() {
                    frame.1 += 1;
                }
                self.stack.push((children[cursor], 0));
            } else {
                self.stack.pop();
                return Some(node);
            }
        }
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

    fn write_topology(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("tree.sbt");
        let mut f = File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_parse_simple_tree() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_topology(dir.path(), "root\n*leaf1\n*leaf2\n");
        let tree = BloomTree::read_topology(&path).unwrap();

        assert_eq!(tree.len(), 3);
        let root = tree.node(tree.root());
        assert_eq!(root.name, "root");
        assert_eq!(root.children.len(), 2);
        assert!(!tree.nodes_share_files());

        let leaf1 = tree.node(root.children[0]);
        assert_eq!(leaf1.name, "leaf1");
        assert_eq!(leaf1.parent, Some(tree.root()));
        assert_eq!(
            leaf1.location.as_ref().unwrap().file,
            dir.path().join("leaf1.bf")
        );
    }

    #[test]
    fn test_parse_container_references() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_topology(
            dir.path(),
            "root@all.bf:0\n*leaf1@all.bf:100\n*leaf2@all.bf:200\n",
        );
        let tree = BloomTree::read_topology(&path).unwrap();
        assert!(tree.nodes_share_files());

        let root = tree.node(tree.root());
        let leaf2 = tree.node(root.children[1]);
        assert_eq!(leaf2.location.as_ref().unwrap().offset, 200);
        assert_eq!(
            leaf2.location.as_ref().unwrap().file,
            dir.path().join("all.bf")
        );
    }

    #[test]
    fn test_bf_suffix_stripped_from_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_topology(dir.path(), "root.bf\n*leaf1.bf\n");
        let tree = BloomTree::read_topology(&path).unwrap();
        assert_eq!(tree.node(tree.root()).name, "root");
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_topology(dir.path(), "root\n*leaf\n*leaf\n");
        let err = BloomTree::read_topology(&path).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_level_skip_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_topology(dir.path(), "root\n***deep\n");
        let err = BloomTree::read_topology(&path).unwrap_err();
        assert!(err.to_string().contains("skips a tree level"));
    }

    #[test]
    fn test_empty_topology_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_topology(dir.path(), "# only a comment\n\n");
        assert!(BloomTree::read_topology(&path).is_err());
    }

    #[test]
    fn test_multiple_roots_get_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_topology(dir.path(), "a\n*b\nc\n");
        let tree = BloomTree::read_topology(&path).unwrap();

        let root = tree.node(tree.root());
        assert_eq!(root.name, "(root)");
        assert!(root.location.is_none());
        assert_eq!(root.children.len(), 2);
        for &child in &root.children {
            assert_eq!(tree.node(child).parent, Some(tree.root()));
        }
    }

    #[test]
    fn test_post_order_children_before_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_topology(dir.path(), "root\n*mid\n**leaf1\n**leaf2\n*leaf3\n");
        let tree = BloomTree::read_topology(&path).unwrap();

        let order: Vec<String> = tree
            .post_order()
            .map(|ix| tree.node(ix).name.clone())
            .collect();
        assert_eq!(order, vec!["leaf1", "leaf2", "mid", "leaf3", "root"]);

        // Restartable: a second iterator yields the same sequence.
        let again: Vec<String> = tree
            .post_order()
            .map(|ix| tree.node(ix).name.clone())
            .collect();
        assert_eq!(order, again);
    }

    #[test]
    fn test_load_unload_reload() {
        let dir = tempfile::tempdir().unwrap();

        // Write a real filter block for the single node.
        let params = FilterParams {
            num_bits: 512,
            num_hashes: 2,
            kmer_size: 8,
            hash_seed: 1,
        };
        let hasher = params.hasher();
        let mut bf = BloomFilter::new_plain(params).unwrap();
        let kmers = hasher.kmerize(b"ACGTACGTACGTACGT", true, None);
        for positions in &kmers {
            bf.insert_positions(positions).unwrap();
        }
        bf.finalize();
        let bf_path = dir.path().join("only.bf");
        let mut out = File::create(&bf_path).unwrap();
        bf.write_block(&mut out, &bf_path).unwrap();

        let topo = write_topology(dir.path(), "only\n");
        let mut tree = BloomTree::read_topology(&topo).unwrap();
        let root = tree.root();
        assert!(!tree.node(root).is_loaded());

        tree.load(root).unwrap();
        assert!(tree.node(root).is_loaded());
        let before = tree.node(root).filter.as_ref().unwrap().count_contained(&kmers);

        // Idempotent load.
        tree.load(root).unwrap();

        tree.unload(root);
        assert!(!tree.node(root).is_loaded());

        // Reload restores bit-identical containment behavior.
        tree.load(root).unwrap();
        let after = tree.node(root).filter.as_ref().unwrap().count_contained(&kmers);
        assert_eq!(before, after);
        assert_eq!(after, kmers.len() as u64);
    }

    #[test]
    fn test_real_filter_with_placeholder_root() {
        let dir = tempfile::tempdir().unwrap();

        let params = FilterParams {
            num_bits: 512,
            num_hashes: 1,
            kmer_size: 8,
            hash_seed: 0,
        };
        for name in ["a", "b"] {
            let bf = BloomFilter::new_plain(params).unwrap();
            let path = dir.path().join(format!("{}.bf", name));
            let mut out = File::create(&path).unwrap();
            bf.write_block(&mut out, &path).unwrap();
        }

        let topo = write_topology(dir.path(), "a\nb\n");
        let mut tree = BloomTree::read_topology(&topo).unwrap();
        let filter = tree.real_filter().unwrap();
        assert_eq!(filter.params().num_bits, 512);
    }
}
