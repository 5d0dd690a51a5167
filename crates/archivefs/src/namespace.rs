//! Virtual namespace: the directory tree presented by a mounted archive.
//!
//! Built once from the entry table and read-only afterwards, apart from the
//! root selection which happens before the filesystem is exposed. Nodes live
//! in an arena and refer to each other by position.

use crate::error::FsError;
use crate::safety::{join_components, normalize_entry_path, split_lookup_path};
use crate::types::{Attributes, DirEntry, Entry, NodeKind};
use std::collections::BTreeMap;
use std::time::SystemTime;

type NodeId = usize;

const TOP: NodeId = 0;

#[derive(Debug, Clone)]
enum NodeData {
    Directory { children: BTreeMap<String, NodeId> },
    File { entry: u32, encrypted: bool },
}

/// A directory or file in the tree.
#[derive(Debug, Clone)]
pub struct Node {
    name: String,
    parent: Option<NodeId>,
    size: u64,
    modified: SystemTime,
    data: NodeData,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        match self.data {
            NodeData::Directory { .. } => NodeKind::Directory,
            NodeData::File { .. } => NodeKind::File,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind() == NodeKind::Directory
    }

    /// Index of the archive entry behind a file node.
    pub fn entry(&self) -> Option<u32> {
        match self.data {
            NodeData::File { entry, .. } => Some(entry),
            NodeData::Directory { .. } => None,
        }
    }

    pub fn attributes(&self) -> Attributes {
        Attributes {
            kind: self.kind(),
            size: self.size,
            modified: self.modified,
        }
    }
}

/// The tree of directories and files built from an archive's entries.
#[derive(Debug, Clone)]
pub struct Namespace {
    nodes: Vec<Node>,
    root: NodeId,
}

impl Namespace {
    /// Builds the tree from `entries`.
    ///
    /// Intermediate directories without an entry of their own are
    /// synthesized with `default_modified`, which also stands in for entries
    /// that carry no timestamp. Names that escape the archive root are
    /// skipped, and so is any entry colliding with an existing file or with
    /// a node of the other kind.
    pub fn build(entries: &[Entry], default_modified: SystemTime) -> Self {
        let mut namespace = Self {
            nodes: vec![Node {
                name: String::new(),
                parent: None,
                size: 0,
                modified: default_modified,
                data: NodeData::Directory {
                    children: BTreeMap::new(),
                },
            }],
            root: TOP,
        };

        for entry in entries {
            let Some(components) = normalize_entry_path(&entry.path) else {
                tracing::warn!(path = %entry.path, "skipping entry with unsafe path");
                continue;
            };
            namespace.insert(entry, &components, default_modified);
        }

        tracing::debug!(nodes = namespace.nodes.len(), "namespace built");
        namespace
    }

    fn insert(&mut self, entry: &Entry, components: &[String], default_modified: SystemTime) {
        let (name, parents) = match components.split_last() {
            Some(split) => split,
            None => return,
        };

        let mut current = TOP;
        for component in parents {
            match self.child(current, component) {
                Some(next) if self.nodes[next].is_directory() => current = next,
                Some(_) => {
                    tracing::warn!(path = %entry.path, "skipping entry below a file");
                    return;
                }
                None => current = self.add_directory(current, component, default_modified),
            }
        }

        let modified = entry.modified.unwrap_or(default_modified);
        match self.child(current, name) {
            None if entry.is_directory => {
                self.add_directory(current, name, modified);
            }
            None => {
                self.add_node(
                    current,
                    Node {
                        name: name.clone(),
                        parent: Some(current),
                        size: entry.size,
                        modified,
                        data: NodeData::File {
                            entry: entry.index,
                            encrypted: entry.encrypted,
                        },
                    },
                );
            }
            // An explicit entry for a directory synthesized earlier supplies its timestamp.
            Some(existing) if entry.is_directory && self.nodes[existing].is_directory() => {
                if let Some(stamp) = entry.modified {
                    self.nodes[existing].modified = stamp;
                }
            }
            Some(_) => {
                tracing::warn!(path = %entry.path, index = entry.index, "skipping duplicate entry");
            }
        }
    }

    fn add_directory(&mut self, parent: NodeId, name: &str, modified: SystemTime) -> NodeId {
        self.add_node(
            parent,
            Node {
                name: name.to_string(),
                parent: Some(parent),
                size: 0,
                modified,
                data: NodeData::Directory {
                    children: BTreeMap::new(),
                },
            },
        )
    }

    fn add_node(&mut self, parent: NodeId, node: Node) -> NodeId {
        let id = self.nodes.len();
        let name = node.name.clone();
        self.nodes.push(node);
        if let NodeData::Directory { children } = &mut self.nodes[parent].data {
            children.insert(name, id);
        }
        id
    }

    fn child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        match &self.nodes[parent].data {
            NodeData::Directory { children } => children.get(name).copied(),
            NodeData::File { .. } => None,
        }
    }

    fn children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        let children = match &self.nodes[id].data {
            NodeData::Directory { children } => Some(children.values().copied()),
            NodeData::File { .. } => None,
        };
        children.into_iter().flatten()
    }

    fn resolve(&self, path: &str) -> Option<NodeId> {
        let mut current = self.root;
        for component in split_lookup_path(path) {
            current = self.child(current, component)?;
        }
        Some(current)
    }

    /// Resolves `path` relative to the current root.
    pub fn lookup(&self, path: &str) -> Result<&Node, FsError> {
        self.resolve(path)
            .map(|id| &self.nodes[id])
            .ok_or_else(|| FsError::PathNotFound(path.to_string()))
    }

    /// Children of the directory at `path`, ordered by name.
    pub fn list(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let id = self
            .resolve(path)
            .ok_or_else(|| FsError::PathNotFound(path.to_string()))?;
        if !self.nodes[id].is_directory() {
            return Err(FsError::NotADirectory(path.to_string()));
        }

        Ok(self
            .children(id)
            .map(|child| {
                let node = &self.nodes[child];
                DirEntry {
                    name: node.name.clone(),
                    attributes: node.attributes(),
                }
            })
            .collect())
    }

    /// Re-roots the tree at the directory `path`, relative to the current
    /// root. Returns `false`, leaving the root unchanged, if `path` does not
    /// resolve to a directory.
    pub fn set_root(&mut self, path: &str) -> bool {
        match self.resolve(path) {
            Some(id) if self.nodes[id].is_directory() => {
                self.root = id;
                tracing::debug!(root = %self.root_path(), "namespace re-rooted");
                true
            }
            _ => false,
        }
    }

    /// Descends while the root holds a single directory and nothing else.
    /// Returns whether the root moved.
    pub fn set_root_auto(&mut self) -> bool {
        let start = self.root;
        loop {
            let only = {
                let mut children = self.children(self.root);
                match (children.next(), children.next()) {
                    (Some(only), None) if self.nodes[only].is_directory() => only,
                    _ => break,
                }
            };
            self.root = only;
        }
        self.root != start
    }

    /// Absolute path of the current root within the archive, `/` at the top.
    pub fn root_path(&self) -> String {
        let mut components = Vec::new();
        let mut current = Some(self.root);
        while let Some(id) = current {
            if id != TOP {
                components.push(self.nodes[id].name.as_str());
            }
            current = self.nodes[id].parent;
        }
        components.reverse();
        join_components(&components)
    }

    pub fn is_rerooted(&self) -> bool {
        self.root != TOP
    }

    /// Entry index of the first encrypted file below the current root,
    /// walking directories depth-first in name order.
    pub fn find_first_encrypted(&self) -> Option<u32> {
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            match &self.nodes[id].data {
                NodeData::File {
                    entry,
                    encrypted: true,
                } => return Some(*entry),
                NodeData::File { .. } => {}
                NodeData::Directory { children } => {
                    stack.extend(children.values().rev().copied());
                }
            }
        }
        None
    }

    /// Number of files below the current root.
    pub fn file_count(&self) -> usize {
        let mut stack = vec![self.root];
        let mut count = 0;
        while let Some(id) = stack.pop() {
            match &self.nodes[id].data {
                NodeData::File { .. } => count += 1,
                NodeData::Directory { children } => stack.extend(children.values().copied()),
            }
        }
        count
    }

    /// Paths of every file below the current root, in listing order.
    pub fn files(&self) -> Vec<(String, u32)> {
        let mut out = Vec::new();
        self.collect_files(self.root, &mut Vec::new(), &mut out);
        out
    }

    fn collect_files(&self, id: NodeId, prefix: &mut Vec<String>, out: &mut Vec<(String, u32)>) {
        for child in self.children(id) {
            let node = &self.nodes[child];
            prefix.push(node.name.clone());
            match node.data {
                NodeData::File { entry, .. } => out.push((join_components(prefix.as_slice()), entry)),
                NodeData::Directory { .. } => self.collect_files(child, prefix, out),
            }
            prefix.pop();
        }
    }
}
