//! Tree construction: leaf filters from reference FASTA files, internal
//! union filters by pairwise joining, one packed container file plus a
//! topology description.
//!
//! This is the build-side companion of the query engine: each reference
//! file becomes a leaf whose filter indexes the file's k-mers; levels of
//! internal nodes union adjacent pairs until a single root remains. Every
//! block lands in one container file, and the emitted topology references
//! it by `@container:offset`, so querying goes through the file-manager
//! batched path.

use needletail::parse_fastx_file;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::bloom::{BloomFilter, FilterParams};
use crate::constants::WRITE_BUF_SIZE;
use crate::error::{BloomTreeError, Result};

struct BuildNode {
    name: String,
    filter: BloomFilter,
    children: Vec<BuildNode>,
}

/// Build a tree over the given reference files and write the container and
/// topology files. Returns the total number of nodes written.
pub fn build_tree(
    references: &[PathBuf],
    params: FilterParams,
    container_path: &Path,
    topology_path: &Path,
) -> Result<usize> {
    params.validate()?;
    if references.is_empty() {
        return Err(BloomTreeError::validation("no reference files given"));
    }

    // One leaf per reference file, named by the file stem.
    let mut names = HashSet::new();
    let mut level: Vec<BuildNode> = Vec::with_capacity(references.len());
    for path in references {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "leaf".to_string());
        if !names.insert(name.clone()) {
            return Err(BloomTreeError::validation(format!(
                "duplicate leaf name '{}' (reference file stems must be unique)",
                name
            )));
        }
        level.push(BuildNode {
            name,
            filter: leaf_filter(path, params)?,
            children: Vec::new(),
        });
    }
    let num_leaves = level.len();

    // Union adjacent pairs level by level until a single root remains; an
    // odd node out is promoted unchanged.
    let mut branch_counter = 0usize;
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len() / 2 + 1);
        let mut iter = level.into_iter();
        while let Some(a) = iter.next() {
            match iter.next() {
                Some(b) => {
                    branch_counter += 1;
                    let mut filter = a.filter.clone();
                    filter.union_with(&b.filter)?;
                    filter.finalize();
                    next.push(BuildNode {
                        name: format!("branch_{}", branch_counter),
                        filter,
                        children: vec![a, b],
                    });
                }
                None => next.push(a),
            }
        }
        level = next;
    }
    let root = match level.pop() {
        Some(root) => root,
        None => return Err(BloomTreeError::validation("no reference files given")),
    };

    let total = write_tree(&root, container_path, topology_path)?;
    log::info!(
        "built tree: {} leaves, {} nodes, container '{}'",
        num_leaves,
        total,
        container_path.display()
    );
    Ok(total)
}

fn leaf_filter(path: &Path, params: FilterParams) -> Result<BloomFilter> {
    let hasher = params.hasher();
    let mut filter = BloomFilter::new_plain(params)?;
    let mut reader =
        parse_fastx_file(path).map_err(|e| BloomTreeError::format(path, e.to_string()))?;
    while let Some(record) = reader.next() {
        let record = record.map_err(|e| BloomTreeError::format(path, e.to_string()))?;
        for positions in hasher.kmerize(&record.seq(), true, None) {
            filter.insert_positions(&positions)?;
        }
    }
    filter.finalize();
    Ok(filter)
}

/// Write every node's filter block into the container (pre-order) and emit
/// the matching topology file.
fn write_tree(root: &BuildNode, container_path: &Path, topology_path: &Path) -> Result<usize> {
    let container_ref = container_reference(container_path, topology_path);

    let file =
        File::create(container_path).map_err(|e| BloomTreeError::io(container_path, "create", e))?;
    let mut writer = BufWriter::with_capacity(WRITE_BUF_SIZE, file);

    let mut lines: Vec<String> = Vec::new();
    let mut offset = 0u64;
    let mut count = 0usize;
    let mut stack: Vec<(&BuildNode, usize)> = vec![(root, 0)];
    while let Some((node, depth)) = stack.pop() {
        lines.push(format!(
            "{}{}@{}:{}",
            "*".repeat(depth),
            node.name,
            container_ref,
            offset
        ));
        offset += node.filter.write_block(&mut writer, container_path)?;
        count += 1;
        for child in node.children.iter().rev() {
            stack.push((child, depth + 1));
        }
    }
    writer
        .flush()
        .map_err(|e| BloomTreeError::io(container_path, "write", e))?;

    let mut topo = File::create(topology_path)
        .map_err(|e| BloomTreeError::io(topology_path, "create", e))?;
    for line in &lines {
        writeln!(topo, "{}", line).map_err(|e| BloomTreeError::io(topology_path, "write", e))?;
    }
    Ok(count)
}

/// How the topology refers to the container: by bare filename when they sit
/// in the same directory, by full path otherwise.
fn container_reference(container_path: &Path, topology_path: &Path) -> String {
    if container_path.parent() == topology_path.parent() {
        container_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| container_path.display().to_string())
    } else {
        container_path.display().to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::BloomTree;

    fn write_fasta(dir: &Path, name: &str, seq: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!(">{}\n{}\n", name, seq)).unwrap();
        path
    }

    fn params() -> FilterParams {
        FilterParams {
            num_bits: 2048,
            num_hashes: 2,
            kmer_size: 8,
            hash_seed: 0x5555,
        }
    }

    #[test]
    fn test_build_two_leaves() {
        let dir = tempfile::tempdir().unwrap();
        let refs = vec![
            write_fasta(dir.path(), "l1.fa", "ACGTACGTACGTACGT"),
            write_fasta(dir.path(), "l2.fa", "TTTTGGGGCCCCAAAA"),
        ];
        let container = dir.path().join("all.bf");
        let topology = dir.path().join("tree.sbt");
        let total = build_tree(&refs, params(), &container, &topology).unwrap();
        assert_eq!(total, 3);

        let tree = BloomTree::read_topology(&topology).unwrap();
        assert_eq!(tree.len(), 3);
        assert!(tree.nodes_share_files());
        let root = tree.node(tree.root());
        assert_eq!(root.name, "branch_1");
        assert_eq!(root.children.len(), 2);
        assert_eq!(tree.node(root.children[0]).name, "l1");
        assert_eq!(tree.node(root.children[1]).name, "l2");
    }

    #[test]
    fn test_root_is_union_of_leaves() {
        let dir = tempfile::tempdir().unwrap();
        let seq1 = "ACGTACGTACGTACGT";
        let seq2 = "TTTTGGGGCCCCAAAA";
        let refs = vec![
            write_fasta(dir.path(), "l1.fa", seq1),
            write_fasta(dir.path(), "l2.fa", seq2),
        ];
        let container = dir.path().join("all.bf");
        let topology = dir.path().join("tree.sbt");
        build_tree(&refs, params(), &container, &topology).unwrap();

        let mut tree = BloomTree::read_topology(&topology).unwrap();
        let root = tree.root();
        tree.load(root).unwrap();
        let hasher = params().hasher();
        let root_filter = tree.node(root).filter.as_ref().unwrap();
        for seq in [seq1, seq2] {
            let kmers = hasher.kmerize(seq.as_bytes(), true, None);
            assert_eq!(root_filter.count_contained(&kmers), kmers.len() as u64);
        }
    }

    #[test]
    fn test_single_reference_is_root() {
        let dir = tempfile::tempdir().unwrap();
        let refs = vec![write_fasta(dir.path(), "only.fa", "ACGTACGTACGTACGT")];
        let container = dir.path().join("all.bf");
        let topology = dir.path().join("tree.sbt");
        let total = build_tree(&refs, params(), &container, &topology).unwrap();
        assert_eq!(total, 1);

        let tree = BloomTree::read_topology(&topology).unwrap();
        assert_eq!(tree.node(tree.root()).name, "only");
        assert!(tree.node(tree.root()).is_leaf());
    }

    #[test]
    fn test_five_leaves_make_balanced_levels() {
        let dir = tempfile::tempdir().unwrap();
        let refs: Vec<PathBuf> = (0..5)
            .map(|i| write_fasta(dir.path(), &format!("l{}.fa", i), "ACGTACGTACGTACGT"))
            .collect();
        let container = dir.path().join("all.bf");
        let topology = dir.path().join("tree.sbt");
        // 5 leaves -> 2 pairs + 1 odd -> 3 -> 1 pair + 1 odd -> 2 -> 1 root
        let total = build_tree(&refs, params(), &container, &topology).unwrap();
        assert_eq!(total, 5 + 2 + 1 + 1);
    }

    #[test]
    fn test_duplicate_stems_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let refs = vec![
            write_fasta(dir.path(), "same.fa", "ACGTACGTACGTACGT"),
            write_fasta(&sub, "same.fa", "TTTTGGGGCCCCAAAA"),
        ];
        let container = dir.path().join("all.bf");
        let topology = dir.path().join("tree.sbt");
        let err = build_tree(&refs, params(), &container, &topology).unwrap_err();
        assert!(err.to_string().contains("duplicate leaf name"));
    }

    #[test]
    fn test_no_references_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = build_tree(
            &[],
            params(),
            &dir.path().join("all.bf"),
            &dir.path().join("tree.sbt"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("no reference files"));
    }
}
