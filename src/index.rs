//! Point-in-time index over the machine inventory: a directory tree keyed
//! by virtual path and a label-to-machines map.
//!
//! Both structures are pure projections of the metadata stored in each
//! machine's own definition. They are rebuilt wholesale after every
//! mutation; nothing here is patched incrementally, so the index can never
//! drift from the source metadata.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use crate::error::Error;
use crate::hypervisor::MachineRecord;
use crate::metadata::codec;
use crate::metadata::{Metadata, VirtualPath};

/// A machine record together with its decoded organizational metadata.
#[derive(Debug, Clone)]
pub struct MachineEntry {
    pub record: MachineRecord,
    pub metadata: Metadata,
}

#[derive(Debug, Default)]
struct DirNode {
    children: BTreeMap<String, DirNode>,
    /// Indices into `Inventory::machines` for machines at exactly this path.
    machines: Vec<usize>,
}

/// The result of listing one virtual directory.
#[derive(Debug, Default)]
pub struct Listing<'a> {
    pub directories: Vec<&'a str>,
    pub machines: Vec<&'a MachineEntry>,
}

/// Derived, rebuildable index over a snapshot of the inventory.
#[derive(Debug, Default)]
pub struct Inventory {
    machines: Vec<MachineEntry>,
    root: DirNode,
    tags: BTreeMap<String, BTreeSet<usize>>,
    /// Per-machine decode failures. A malformed machine never blocks
    /// browsing the rest of the inventory.
    pub failures: Vec<Error>,
}

impl Inventory {
    /// Build the index from a snapshot of machine records.
    ///
    /// Entries are ordered by `(name, id)` before insertion, so the result
    /// is identical for any permutation of the input.
    pub fn build(records: Vec<MachineRecord>) -> Inventory {
        let mut entries = Vec::with_capacity(records.len());
        let mut failures = Vec::new();

        for record in records {
            match codec::decode(&record.name, &record.definition) {
                Ok(metadata) => entries.push(MachineEntry { record, metadata }),
                Err(e) => {
                    warn!(machine = %record.name, error = %e, "skipping machine with malformed metadata");
                    failures.push(e);
                }
            }
        }

        entries.sort_by(|a, b| {
            (a.record.name.as_str(), a.record.id).cmp(&(b.record.name.as_str(), b.record.id))
        });

        let mut root = DirNode::default();
        let mut tags: BTreeMap<String, BTreeSet<usize>> = BTreeMap::new();

        for (i, entry) in entries.iter().enumerate() {
            let mut node = &mut root;
            for segment in entry.metadata.path.segments() {
                node = node.children.entry(segment.to_string()).or_default();
            }
            node.machines.push(i);

            for label in &entry.metadata.labels {
                tags.entry(label.clone()).or_default().insert(i);
            }
        }

        Inventory {
            machines: entries,
            root,
            tags,
            failures,
        }
    }

    fn node_at(&self, path: &VirtualPath) -> Option<&DirNode> {
        let mut node = &self.root;
        for segment in path.segments() {
            node = node.children.get(segment)?;
        }
        Some(node)
    }

    /// Immediate subdirectories and machines at a path. Unknown paths list
    /// as empty rather than erroring; the root always exists.
    pub fn list_children(&self, path: &VirtualPath) -> Listing<'_> {
        match self.node_at(path) {
            Some(node) => Listing {
                directories: node.children.keys().map(String::as_str).collect(),
                machines: node.machines.iter().map(|&i| &self.machines[i]).collect(),
            },
            None => Listing::default(),
        }
    }

    /// All machines carrying a label, in `(name, id)` order.
    pub fn list_by_tag(&self, label: &str) -> Vec<&MachineEntry> {
        match self.tags.get(label) {
            Some(indices) => indices.iter().map(|&i| &self.machines[i]).collect(),
            None => Vec::new(),
        }
    }

    /// Every label in use, sorted.
    pub fn all_tags(&self) -> Vec<&str> {
        self.tags.keys().map(String::as_str).collect()
    }

    /// All machines in the snapshot, in `(name, id)` order.
    pub fn machines(&self) -> impl Iterator<Item = &MachineEntry> {
        self.machines.iter()
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    /// Look up a machine by its display name.
    pub fn machine_named(&self, name: &str) -> Option<&MachineEntry> {
        self.machines.iter().find(|m| m.record.name == name)
    }

    /// Every directory path that currently exists in the tree, depth-first
    /// and sorted, the root included.
    pub fn known_paths(&self) -> Vec<VirtualPath> {
        fn walk(node: &DirNode, prefix: &VirtualPath, out: &mut Vec<VirtualPath>) {
            for (name, child) in &node.children {
                let path = prefix.child(name);
                out.push(path.clone());
                walk(child, &path, out);
            }
        }

        let mut out = vec![VirtualPath::root()];
        walk(&self.root, &VirtualPath::root(), &mut out);
        out
    }
}
