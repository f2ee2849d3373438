//! Recursive search over a file-list tree.

use super::{FileTree, FlNode, NodeId, NodeKind};

/// Size constraint of a search query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizeCond {
    #[default]
    Any,
    AtMost(u64),
    Equal(u64),
    Greater(u64),
}

impl SizeCond {
    fn matches(self, size: u64) -> bool {
        match self {
            SizeCond::Any => true,
            SizeCond::AtMost(n) => size <= n,
            SizeCond::Equal(n) => size == n,
            SizeCond::Greater(n) => size > n,
        }
    }
}

/// A compiled search predicate. Term lists are matched case-insensitively;
/// every AND term must appear somewhere along the path from the search root
/// to the node, and no NOT term may appear in the node's own name.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub size: SizeCond,
    pub want_files: bool,
    pub want_dirs: bool,
    /// Allowed extensions (lowercase, no dot); empty allows everything.
    pub exts: Vec<String>,
    pub and_terms: Vec<String>,
    pub not_terms: Vec<String>,
}

impl SearchQuery {
    pub fn files_and_dirs() -> Self {
        Self {
            want_files: true,
            want_dirs: true,
            ..Self::default()
        }
    }

    pub fn with_and_terms(mut self, terms: &[&str]) -> Self {
        self.and_terms = terms.iter().map(|t| t.to_lowercase()).collect();
        self
    }

    pub fn with_not_terms(mut self, terms: &[&str]) -> Self {
        self.not_terms = terms.iter().map(|t| t.to_lowercase()).collect();
        self
    }
}

fn contains_ci(haystack_lower: &str, needle_lower: &str) -> bool {
    haystack_lower.contains(needle_lower)
}

fn ext_of(name_lower: &str) -> Option<&str> {
    let idx = name_lower.rfind('.')?;
    let ext = &name_lower[idx + 1..];
    (!ext.is_empty()).then_some(ext)
}

fn node_matches(q: &SearchQuery, node: &FlNode, name_lower: &str, remaining_and: &[&str]) -> bool {
    let type_ok = if node.is_file() {
        q.want_files
    } else {
        q.want_dirs
    };
    if !type_ok || !q.size.matches(node.size()) {
        return false;
    }
    if !remaining_and.iter().all(|t| contains_ci(name_lower, t)) {
        return false;
    }
    if q.not_terms.iter().any(|t| contains_ci(name_lower, t)) {
        return false;
    }
    if !q.exts.is_empty() {
        match ext_of(name_lower) {
            Some(ext) if q.exts.iter().any(|e| e == ext) => {}
            _ => return false,
        }
    }
    true
}

/// Depth-first search below `from`, bounded by `max_results`. AND terms
/// matched by a directory's name are elided for its subtree.
pub fn search(tree: &FileTree, from: NodeId, q: &SearchQuery, max_results: usize) -> Vec<NodeId> {
    let mut out = Vec::new();
    if max_results == 0 {
        return out;
    }
    let remaining: Vec<&str> = q.and_terms.iter().map(String::as_str).collect();
    walk(tree, from, q, &remaining, max_results, &mut out);
    out
}

fn walk(
    tree: &FileTree,
    id: NodeId,
    q: &SearchQuery,
    remaining_and: &[&str],
    max_results: usize,
    out: &mut Vec<NodeId>,
) {
    if out.len() >= max_results {
        return;
    }
    let node = tree.node(id);
    let name_lower = node.name().to_lowercase();
    if node_matches(q, node, &name_lower, remaining_and) {
        out.push(id);
        if out.len() >= max_results {
            return;
        }
    }
    if let NodeKind::Dir { children, .. } = &node.kind {
        let narrowed: Vec<&str> = remaining_and
            .iter()
            .copied()
            .filter(|t| !contains_ci(&name_lower, t))
            .collect();
        for &c in children {
            walk(tree, c, q, &narrowed, max_results, out);
            if out.len() >= max_results {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fl::FileTree;

    fn tree() -> FileTree {
        let mut t = FileTree::new();
        let shows = t.create_dir("TV Shows", false).unwrap();
        t.add(t.root(), shows).unwrap();
        let serie = t.create_dir("Some Serie", false).unwrap();
        t.add(shows, serie).unwrap();
        for (name, size) in [
            ("Some.Serie.S01E01.mkv", 700u64 << 20),
            ("Some.Serie.S01E02.mkv", 720 << 20),
            ("sample.avi", 20 << 20),
            ("notes.txt", 1024),
        ] {
            let f = t.create_file(name, size, Some([9u8; 24]), None).unwrap();
            t.add(serie, f).unwrap();
        }
        t
    }

    fn names(t: &FileTree, ids: &[super::NodeId]) -> Vec<String> {
        ids.iter().map(|&i| t.node(i).name().to_string()).collect()
    }

    #[test]
    fn empty_terms_match_everything_allowed() {
        let t = tree();
        let q = SearchQuery {
            want_files: true,
            ..Default::default()
        };
        let hits = search(&t, t.root(), &q, 100);
        assert_eq!(hits.len(), 4);
    }

    #[test]
    fn and_terms_match_along_the_path() {
        let t = tree();
        // "serie" only matches the directory name for sample.avi, but the
        // term is elided below the matching ancestor.
        let q = SearchQuery {
            want_files: true,
            ..Default::default()
        }
        .with_and_terms(&["serie", "sample"]);
        let hits = search(&t, t.root(), &q, 100);
        assert_eq!(names(&t, &hits), ["sample.avi"]);
    }

    #[test]
    fn not_terms_exclude() {
        let t = tree();
        let q = SearchQuery {
            want_files: true,
            ..Default::default()
        }
        .with_and_terms(&["serie"])
        .with_not_terms(&["sample", "notes"]);
        let hits = search(&t, t.root(), &q, 100);
        assert_eq!(
            names(&t, &hits),
            ["Some.Serie.S01E01.mkv", "Some.Serie.S01E02.mkv"]
        );
    }

    #[test]
    fn extension_filter() {
        let t = tree();
        let q = SearchQuery {
            want_files: true,
            exts: vec!["mkv".into(), "avi".into()],
            ..Default::default()
        };
        let hits = search(&t, t.root(), &q, 100);
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn size_conditions() {
        let t = tree();
        let base = SearchQuery {
            want_files: true,
            ..Default::default()
        };
        let q = SearchQuery {
            size: SizeCond::Greater(500 << 20),
            ..base.clone()
        };
        assert_eq!(search(&t, t.root(), &q, 100).len(), 2);
        let q = SearchQuery {
            size: SizeCond::AtMost(1024),
            ..base.clone()
        };
        assert_eq!(names(&t, &search(&t, t.root(), &q, 100)), ["notes.txt"]);
        let q = SearchQuery {
            size: SizeCond::Equal(20 << 20),
            ..base
        };
        assert_eq!(names(&t, &search(&t, t.root(), &q, 100)), ["sample.avi"]);
    }

    #[test]
    fn directory_hits_and_bound() {
        let t = tree();
        let q = SearchQuery {
            want_dirs: true,
            ..Default::default()
        }
        .with_and_terms(&["serie"]);
        let hits = search(&t, t.root(), &q, 100);
        assert_eq!(names(&t, &hits), ["Some Serie"]);

        let q = SearchQuery {
            want_files: true,
            want_dirs: true,
            ..Default::default()
        };
        let hits = search(&t, t.root(), &q, 3);
        assert_eq!(hits.len(), 3);
    }
}
