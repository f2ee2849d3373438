//! The in-memory file-list tree: our own share and browsed remote shares.
//!
//! Nodes live in an arena owned by [`FileTree`]; parent links are arena
//! indexes, which keeps the parent back-reference cycle-free and makes
//! subtree destruction a plain index sweep. Within a directory, children are
//! kept ordered by `(lowercase(name), name)` and names are unique under
//! case-insensitive comparison.

pub mod local;
pub mod search;
pub mod xml;

use crate::tth::TthDigest;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug)]
pub enum FlError {
    /// Node names may not contain the path separator.
    NameWithSeparator(String),
    EmptyName,
    NotADirectory,
    /// The node is already attached to a parent.
    NotDetached,
    /// Adding here would make the node an ancestor of itself.
    Cycle,
    /// A child with this name (case-insensitive) already exists.
    Duplicate { existing: NodeId },
    /// The root cannot be removed.
    RootRemoval,
    StaleNode,
}

impl std::fmt::Display for FlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NameWithSeparator(name) => write!(f, "name contains '/': {name}"),
            Self::EmptyName => write!(f, "empty node name"),
            Self::NotADirectory => write!(f, "not a directory"),
            Self::NotDetached => write!(f, "node is already attached"),
            Self::Cycle => write!(f, "node cannot be added to its own subtree"),
            Self::Duplicate { .. } => write!(f, "duplicate name in directory"),
            Self::RootRemoval => write!(f, "the root cannot be removed"),
            Self::StaleNode => write!(f, "node was already freed"),
        }
    }
}

impl std::error::Error for FlError {}

/// Extension data for files in our own share, used to reconcile against the
/// hash store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalMeta {
    pub lastmod: i64,
    pub storage_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    File {
        size: u64,
        tth: Option<TthDigest>,
        local: Option<LocalMeta>,
    },
    Dir {
        children: Vec<NodeId>,
        /// Sum of all descendant sizes, maintained by add/remove.
        size: u64,
        incomplete: bool,
    },
}

#[derive(Debug, Clone)]
pub struct FlNode {
    name: String,
    parent: Option<NodeId>,
    pub kind: NodeKind,
}

impl FlNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, NodeKind::File { .. })
    }

    pub fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::File { size, .. } => *size,
            NodeKind::Dir { size, .. } => *size,
        }
    }

    pub fn tth(&self) -> Option<&TthDigest> {
        match &self.kind {
            NodeKind::File { tth, .. } => tth.as_ref(),
            NodeKind::Dir { .. } => None,
        }
    }

    pub fn children(&self) -> &[NodeId] {
        match &self.kind {
            NodeKind::Dir { children, .. } => children,
            NodeKind::File { .. } => &[],
        }
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::Dir {
                incomplete: true,
                ..
            }
        )
    }
}

/// Case-insensitive name ordering with a byte-wise tiebreak, the canonical
/// order of children within a directory.
pub fn cmp_names(a: &str, b: &str) -> Ordering {
    let la = a.chars().flat_map(char::to_lowercase);
    let lb = b.chars().flat_map(char::to_lowercase);
    la.cmp(lb).then_with(|| a.as_bytes().cmp(b.as_bytes()))
}

fn eq_names_ci(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_lowercase)
        .eq(b.chars().flat_map(char::to_lowercase))
}

#[derive(Debug)]
pub struct FileTree {
    nodes: Vec<Option<FlNode>>,
    free: Vec<usize>,
    root: NodeId,
}

impl Default for FileTree {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTree {
    pub fn new() -> Self {
        let root = FlNode {
            name: String::new(),
            parent: None,
            kind: NodeKind::Dir {
                children: Vec::new(),
                size: 0,
                incomplete: false,
            },
        };
        Self {
            nodes: vec![Some(root)],
            free: Vec::new(),
            root: NodeId(0),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &FlNode {
        self.nodes[id.0].as_ref().expect("live node")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut FlNode {
        self.nodes[id.0].as_mut().expect("live node")
    }

    pub fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    pub fn is_empty_tree(&self) -> bool {
        self.len() == 1
    }

    fn alloc(&mut self, node: FlNode) -> NodeId {
        if let Some(slot) = self.free.pop() {
            self.nodes[slot] = Some(node);
            NodeId(slot)
        } else {
            self.nodes.push(Some(node));
            NodeId(self.nodes.len() - 1)
        }
    }

    fn check_name(name: &str) -> Result<(), FlError> {
        if name.is_empty() {
            return Err(FlError::EmptyName);
        }
        if name.contains('/') {
            return Err(FlError::NameWithSeparator(name.to_string()));
        }
        Ok(())
    }

    /// Creates a detached file node.
    pub fn create_file(
        &mut self,
        name: &str,
        size: u64,
        tth: Option<TthDigest>,
        local: Option<LocalMeta>,
    ) -> Result<NodeId, FlError> {
        Self::check_name(name)?;
        Ok(self.alloc(FlNode {
            name: name.to_string(),
            parent: None,
            kind: NodeKind::File { size, tth, local },
        }))
    }

    /// Creates a detached directory node.
    pub fn create_dir(&mut self, name: &str, incomplete: bool) -> Result<NodeId, FlError> {
        Self::check_name(name)?;
        Ok(self.alloc(FlNode {
            name: name.to_string(),
            parent: None,
            kind: NodeKind::Dir {
                children: Vec::new(),
                size: 0,
                incomplete,
            },
        }))
    }

    /// Attaches a detached node under `parent`, keeping the canonical child
    /// order and updating ancestor sizes.
    pub fn add(&mut self, parent: NodeId, child: NodeId) -> Result<(), FlError> {
        if self.node(child).parent.is_some() {
            return Err(FlError::NotDetached);
        }
        // `parent` inside the subtree of `child` would create a cycle.
        let mut cursor = Some(parent);
        while let Some(c) = cursor {
            if c == child {
                return Err(FlError::Cycle);
            }
            cursor = self.node(c).parent;
        }
        let child_name = self.node(child).name.clone();
        let child_size = self.node(child).size();

        let NodeKind::Dir { children, .. } = &self.node(parent).kind else {
            return Err(FlError::NotADirectory);
        };
        let idx = children
            .partition_point(|&c| cmp_names(&self.node(c).name, &child_name) == Ordering::Less);
        if let Some(&at) = children.get(idx) {
            if eq_names_ci(&self.node(at).name, &child_name) {
                return Err(FlError::Duplicate { existing: at });
            }
        }
        if idx > 0 {
            let before = children[idx - 1];
            if eq_names_ci(&self.node(before).name, &child_name) {
                return Err(FlError::Duplicate { existing: before });
            }
        }

        let NodeKind::Dir { children, .. } = &mut self.node_mut(parent).kind else {
            unreachable!()
        };
        children.insert(idx, child);
        self.node_mut(child).parent = Some(parent);
        self.bump_sizes(parent, child_size as i64);
        Ok(())
    }

    /// Appends without ordering; used by bulk loaders which call [`Self::sort`]
    /// on each directory afterwards.
    pub fn add_unsorted(&mut self, parent: NodeId, child: NodeId) -> Result<(), FlError> {
        if self.node(child).parent.is_some() {
            return Err(FlError::NotDetached);
        }
        let child_size = self.node(child).size();
        let NodeKind::Dir { children, .. } = &mut self.node_mut(parent).kind else {
            return Err(FlError::NotADirectory);
        };
        children.push(child);
        self.node_mut(child).parent = Some(parent);
        self.bump_sizes(parent, child_size as i64);
        Ok(())
    }

    /// Canonicalizes a directory's child order and drops case-insensitive
    /// duplicates; of two colliding names, the byte-wise smaller one stays.
    /// Returns the number of nodes removed (including their subtrees).
    pub fn sort(&mut self, dir: NodeId) -> usize {
        let NodeKind::Dir { children, .. } = &self.node(dir).kind else {
            return 0;
        };
        let mut order: Vec<NodeId> = children.clone();
        order.sort_by(|&a, &b| cmp_names(&self.node(a).name, &self.node(b).name));

        let mut removed = 0;
        let mut kept: Vec<NodeId> = Vec::with_capacity(order.len());
        for id in order {
            if let Some(&last) = kept.last() {
                if eq_names_ci(&self.node(last).name, &self.node(id).name) {
                    // Byte-wise order within the sorted run puts the keeper
                    // first.
                    tracing::debug!(
                        dup = %self.node(id).name,
                        kept = %self.node(last).name,
                        "dropping duplicate file-list entry"
                    );
                    let size = self.node(id).size();
                    self.bump_sizes(dir, -(size as i64));
                    self.free_subtree(id);
                    removed += 1;
                    continue;
                }
            }
            kept.push(id);
        }
        let NodeKind::Dir { children, .. } = &mut self.node_mut(dir).kind else {
            unreachable!()
        };
        *children = kept;
        removed
    }

    /// Detaches and frees a subtree, updating ancestor sizes.
    pub fn remove(&mut self, node: NodeId) -> Result<(), FlError> {
        let Some(parent) = self.node(node).parent else {
            return Err(FlError::RootRemoval);
        };
        let size = self.node(node).size();
        let NodeKind::Dir { children, .. } = &mut self.node_mut(parent).kind else {
            unreachable!()
        };
        children.retain(|&c| c != node);
        self.bump_sizes(parent, -(size as i64));
        self.free_subtree(node);
        Ok(())
    }

    fn free_subtree(&mut self, node: NodeId) {
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            if let Some(n) = self.nodes[id.0].take() {
                if let NodeKind::Dir { children, .. } = n.kind {
                    stack.extend(children);
                }
                self.free.push(id.0);
            }
        }
    }

    fn bump_sizes(&mut self, from: NodeId, delta: i64) {
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            if let NodeKind::Dir { size, .. } = &mut self.node_mut(id).kind {
                *size = (*size as i64 + delta) as u64;
            }
            cursor = self.node(id).parent;
        }
    }

    /// Case-insensitive child lookup; with `strict`, the byte-exact entry of
    /// a case-insensitive run. Binary search against the sorted order.
    pub fn find(&self, dir: NodeId, name: &str, strict: bool) -> Option<NodeId> {
        let children = self.node(dir).children();
        let idx = children
            .partition_point(|&c| {
                self.node(c)
                    .name
                    .chars()
                    .flat_map(char::to_lowercase)
                    .cmp(name.chars().flat_map(char::to_lowercase))
                    == Ordering::Less
            });
        for &c in &children[idx..] {
            if !eq_names_ci(&self.node(c).name, name) {
                break;
            }
            if !strict || self.node(c).name == name {
                return Some(c);
            }
        }
        None
    }

    /// Resolves a slash-delimited, case-insensitive path from `from`. `/`
    /// denotes the starting node itself; `.` and `..` are not supported.
    pub fn resolve(&self, from: NodeId, path: &str) -> Option<NodeId> {
        let mut cur = from;
        for seg in path.split('/') {
            if seg.is_empty() {
                continue;
            }
            if seg == "." || seg == ".." {
                return None;
            }
            cur = self.find(cur, seg, false)?;
        }
        Some(cur)
    }

    /// Canonical absolute path of a node ("/" for the root).
    pub fn path_of(&self, node: NodeId) -> String {
        let mut parts = Vec::new();
        let mut cursor = Some(node);
        while let Some(id) = cursor {
            let n = self.node(id);
            if n.parent.is_some() {
                parts.push(n.name.as_str());
            }
            cursor = n.parent;
        }
        if parts.is_empty() {
            return "/".to_string();
        }
        let mut out = String::new();
        for part in parts.iter().rev() {
            out.push('/');
            out.push_str(part);
        }
        out
    }

    /// True iff no file with a TTH exists anywhere below `dir`.
    pub fn is_empty(&self, dir: NodeId) -> bool {
        let mut stack = vec![dir];
        while let Some(id) = stack.pop() {
            match &self.node(id).kind {
                NodeKind::File { tth: Some(_), .. } => return false,
                NodeKind::File { .. } => {}
                NodeKind::Dir { children, .. } => stack.extend(children.iter().copied()),
            }
        }
        true
    }

    /// Deep copy of a subtree; the copy's root is detached.
    pub fn copy(&mut self, node: NodeId) -> NodeId {
        let cloned = FlNode {
            parent: None,
            ..self.node(node).clone()
        };
        let new_id = self.alloc(cloned);
        if let NodeKind::Dir { children, .. } = self.node(node).kind.clone() {
            let new_children: Vec<NodeId> = children
                .iter()
                .map(|&c| {
                    let nc = self.copy(c);
                    self.node_mut(nc).parent = Some(new_id);
                    nc
                })
                .collect();
            if let NodeKind::Dir { children, .. } = &mut self.node_mut(new_id).kind {
                *children = new_children;
            }
        }
        new_id
    }

    /// Walks the subtree depth-first, files and directories alike.
    pub fn walk(&self, from: NodeId, f: &mut impl FnMut(NodeId, &FlNode)) {
        let node = self.node(from);
        f(from, node);
        for &c in node.children() {
            self.walk(c, f);
        }
    }

    #[cfg(test)]
    fn assert_invariants(&self, dir: NodeId) {
        let node = self.node(dir);
        let NodeKind::Dir { children, size, .. } = &node.kind else {
            return;
        };
        let mut sum = 0;
        for pair in children.windows(2) {
            assert_eq!(
                cmp_names(&self.node(pair[0]).name, &self.node(pair[1]).name),
                Ordering::Less,
                "children out of order"
            );
        }
        for &c in children {
            assert_eq!(self.node(c).parent, Some(dir), "parent link broken");
            sum += self.node(c).size();
            self.assert_invariants(c);
        }
        assert_eq!(*size, sum, "directory size out of sync");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> (FileTree, NodeId, NodeId) {
        let mut t = FileTree::new();
        let music = t.create_dir("Music", false).unwrap();
        t.add(t.root(), music).unwrap();
        let a = t.create_file("album.flac", 100, Some([1u8; 24]), None).unwrap();
        t.add(music, a).unwrap();
        let b = t.create_file("Ballad.mp3", 50, Some([2u8; 24]), None).unwrap();
        t.add(music, b).unwrap();
        let docs = t.create_dir("docs", false).unwrap();
        t.add(t.root(), docs).unwrap();
        (t, music, docs)
    }

    #[test]
    fn sizes_aggregate_up() {
        let (t, music, docs) = sample_tree();
        assert_eq!(t.node(music).size(), 150);
        assert_eq!(t.node(docs).size(), 0);
        assert_eq!(t.node(t.root()).size(), 150);
        t.assert_invariants(t.root());
    }

    #[test]
    fn children_ordered_case_insensitively() {
        let (t, music, _) = sample_tree();
        let names: Vec<&str> = t
            .node(music)
            .children()
            .iter()
            .map(|&c| t.node(c).name())
            .collect();
        assert_eq!(names, ["album.flac", "Ballad.mp3"]);
    }

    #[test]
    fn duplicate_names_rejected() {
        let (mut t, music, _) = sample_tree();
        let dup = t.create_file("ALBUM.FLAC", 10, None, None).unwrap();
        assert!(matches!(
            t.add(music, dup),
            Err(FlError::Duplicate { .. })
        ));
    }

    #[test]
    fn separator_in_name_rejected() {
        let mut t = FileTree::new();
        assert!(matches!(
            t.create_file("a/b", 1, None, None),
            Err(FlError::NameWithSeparator(_))
        ));
    }

    #[test]
    fn cycle_rejected() {
        let mut t = FileTree::new();
        let d = t.create_dir("d", false).unwrap();
        assert!(matches!(t.add(d, d), Err(FlError::Cycle)));
        t.add(t.root(), d).unwrap();
        let e = t.create_dir("e", false).unwrap();
        t.add(d, e).unwrap();
        // Re-adding an attached node is also an error.
        assert!(matches!(t.add(e, d), Err(FlError::NotDetached)));
    }

    #[test]
    fn remove_updates_sizes_and_frees() {
        let (mut t, music, _) = sample_tree();
        let before = t.len();
        let a = t.find(music, "album.flac", false).unwrap();
        t.remove(a).unwrap();
        assert_eq!(t.node(music).size(), 50);
        assert_eq!(t.node(t.root()).size(), 50);
        assert_eq!(t.len(), before - 1);
        assert!(matches!(t.remove(t.root()), Err(FlError::RootRemoval)));
        t.assert_invariants(t.root());
    }

    #[test]
    fn find_strict_and_loose() {
        let (t, music, _) = sample_tree();
        assert!(t.find(music, "ballad.MP3", false).is_some());
        assert!(t.find(music, "ballad.MP3", true).is_none());
        assert!(t.find(music, "Ballad.mp3", true).is_some());
        assert!(t.find(music, "missing", false).is_none());
    }

    #[test]
    fn resolve_paths() {
        let (t, music, _) = sample_tree();
        assert_eq!(t.resolve(t.root(), "/"), Some(t.root()));
        assert_eq!(t.resolve(t.root(), "/music"), Some(music));
        let a = t.find(music, "album.flac", false).unwrap();
        assert_eq!(t.resolve(t.root(), "/Music/Album.Flac"), Some(a));
        assert_eq!(t.resolve(t.root(), "Music//album.flac"), Some(a));
        assert_eq!(t.resolve(t.root(), "/Music/../Music"), None);
        assert_eq!(t.resolve(t.root(), "/nope"), None);
    }

    #[test]
    fn path_of_roundtrips() {
        let (t, music, _) = sample_tree();
        let a = t.find(music, "album.flac", false).unwrap();
        assert_eq!(t.path_of(a), "/Music/album.flac");
        assert_eq!(t.path_of(t.root()), "/");
        assert_eq!(t.resolve(t.root(), &t.path_of(a)), Some(a));
    }

    #[test]
    fn emptiness_means_no_hashed_file() {
        let (mut t, music, docs) = sample_tree();
        assert!(!t.is_empty(t.root()));
        assert!(t.is_empty(docs));
        let plain = t.create_file("raw.bin", 5, None, None).unwrap();
        t.add(docs, plain).unwrap();
        // A file without a TTH does not count.
        assert!(t.is_empty(docs));
        assert!(!t.is_empty(music));
    }

    #[test]
    fn deep_copy_is_detached_and_equal() {
        let (mut t, music, _) = sample_tree();
        let copy = t.copy(music);
        assert_eq!(t.node(copy).parent(), None);
        assert_eq!(t.node(copy).size(), t.node(music).size());
        let names: Vec<String> = t
            .node(copy)
            .children()
            .iter()
            .map(|&c| t.node(c).name().to_string())
            .collect();
        assert_eq!(names, ["album.flac", "Ballad.mp3"]);
        // Mutating the copy leaves the original alone.
        let first = t.node(copy).children()[0];
        t.remove(first).unwrap();
        assert_eq!(t.node(music).children().len(), 2);
    }

    #[test]
    fn sort_after_bulk_load_drops_duplicates() {
        let mut t = FileTree::new();
        let d = t.create_dir("d", false).unwrap();
        t.add(t.root(), d).unwrap();
        for (name, size) in [("beta", 1u64), ("Alpha", 2), ("ALPHA", 4), ("gamma", 8)] {
            let f = t.create_file(name, size, None, None).unwrap();
            t.add_unsorted(d, f).unwrap();
        }
        let removed = t.sort(d);
        assert_eq!(removed, 1);
        let names: Vec<&str> = t
            .node(d)
            .children()
            .iter()
            .map(|&c| t.node(c).name())
            .collect();
        // "ALPHA" < "Alpha" byte-wise, so it is the keeper.
        assert_eq!(names, ["ALPHA", "beta", "gamma"]);
        assert_eq!(t.node(d).size(), 13);
        t.assert_invariants(t.root());
    }
}
