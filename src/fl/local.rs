//! The local share: named root directories scanned into a file-list tree,
//! with Tiger-tree hashes persisted in `hashdata`/`hashfiles` so rescans only
//! hash files that changed, and the serialized own list peers download.

use super::{FileTree, LocalMeta, NodeId};
use crate::db::{DbHandle, DbRequest, Query, Value};
use crate::tth::{self, TthContext, TthDigest};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Upper bound on stored TTHL leaves per file; the hash block size grows
/// with the file instead.
const MAX_HASH_LEAVES: usize = 64;
/// Smallest hash block used for shared files.
const MIN_HASH_BLOCK: u64 = 1 << 20;

#[derive(Debug)]
pub enum ShareError {
    Db(crate::db::DbError),
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    NotADirectory(PathBuf),
    BadName(String),
}

impl std::fmt::Display for ShareError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(source) => write!(f, "{source}"),
            Self::Io { path, source } => {
                write!(f, "share I/O error on '{}': {source}", path.display())
            }
            Self::NotADirectory(path) => {
                write!(f, "'{}' is not a directory", path.display())
            }
            Self::BadName(name) => write!(f, "invalid share name: {name}"),
        }
    }
}

impl std::error::Error for ShareError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Db(source) => Some(source),
            Self::Io { source, .. } => Some(source),
            Self::NotADirectory(_) | Self::BadName(_) => None,
        }
    }
}

impl From<crate::db::DbError> for ShareError {
    fn from(value: crate::db::DbError) -> Self {
        Self::Db(value)
    }
}

/// Per-file hashing result.
#[derive(Debug)]
struct HashedFile {
    root: TthDigest,
    tthl: Vec<u8>,
}

/// Hashes one file into its Tiger-tree root and (for multi-block files) the
/// serialized leaves.
fn hash_file(path: &Path, size: u64) -> std::io::Result<HashedFile> {
    use std::io::Read as _;
    let block = tth::tth_blocksize(size.max(1), MAX_HASH_LEAVES).max(MIN_HASH_BLOCK);
    let mut file = std::fs::File::open(path)?;
    let mut leaves: Vec<TthDigest> = Vec::new();
    let mut buf = vec![0u8; 256 * 1024];
    let mut ctx = TthContext::new();
    let mut in_block: u64 = 0;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let mut rest = &buf[..n];
        while !rest.is_empty() {
            let take = ((block - in_block).min(rest.len() as u64)) as usize;
            ctx.update(&rest[..take]);
            in_block += take as u64;
            rest = &rest[take..];
            if in_block == block {
                leaves.push(std::mem::take(&mut ctx).finish());
                in_block = 0;
            }
        }
    }
    if in_block > 0 || leaves.is_empty() {
        leaves.push(ctx.finish());
    }
    let root = tth::tth_root(&leaves);
    let tthl = if leaves.len() > 1 {
        let mut out = Vec::with_capacity(leaves.len() * 24);
        for leaf in &leaves {
            out.extend_from_slice(leaf);
        }
        out
    } else {
        Vec::new()
    };
    Ok(HashedFile { root, tthl })
}

/// The set of shared roots and the tree built from them.
#[derive(Debug)]
pub struct ShareStore {
    db: DbHandle,
    roots: Vec<(String, PathBuf)>,
    tree: FileTree,
}

impl ShareStore {
    /// Loads the configured share roots from the store. The tree is empty
    /// until the first [`Self::scan`].
    pub fn load(db: DbHandle) -> Result<Self, ShareError> {
        let mut roots = Vec::new();
        for row in db.query_rows(Query::ShareListAll, vec![])? {
            if let (Some(name), Some(path)) = (row[0].as_str(), row[1].as_str()) {
                roots.push((name.to_string(), PathBuf::from(path)));
            }
        }
        roots.sort();
        Ok(Self {
            db,
            roots,
            tree: FileTree::new(),
        })
    }

    pub fn roots(&self) -> &[(String, PathBuf)] {
        &self.roots
    }

    pub fn tree(&self) -> &FileTree {
        &self.tree
    }

    /// Total shared size after the last scan.
    pub fn size(&self) -> u64 {
        self.tree.node(self.tree.root()).size()
    }

    pub fn add_root(&mut self, name: &str, path: &Path) -> Result<(), ShareError> {
        if name.is_empty() || name.contains('/') {
            return Err(ShareError::BadName(name.to_string()));
        }
        if !path.is_dir() {
            return Err(ShareError::NotADirectory(path.to_path_buf()));
        }
        self.roots.retain(|(n, _)| n != name);
        self.roots.push((name.to_string(), path.to_path_buf()));
        self.roots.sort();
        self.db.exec(
            Query::ShareAdd,
            vec![
                Value::Text(name.to_string()),
                Value::Text(path.display().to_string()),
            ],
        )?;
        Ok(())
    }

    pub fn remove_root(&mut self, name: &str) -> Result<bool, ShareError> {
        let before = self.roots.len();
        self.roots.retain(|(n, _)| n != name);
        self.db
            .exec(Query::ShareDel, vec![Value::Text(name.to_string())])?;
        Ok(self.roots.len() != before)
    }

    /// Rescans every root, reusing stored hashes for files whose size and
    /// modification time are unchanged. Returns the number of files hashed
    /// anew. Blocking; run via `spawn_blocking` from async contexts.
    pub fn scan(&mut self) -> Result<usize, ShareError> {
        let known = self.load_known()?;
        let mut seen = std::collections::HashSet::new();
        let mut tree = FileTree::new();
        let mut hashed = 0usize;
        for (name, path) in self.roots.clone() {
            let dir = tree
                .create_dir(&name, false)
                .map_err(|_| ShareError::BadName(name.clone()))?;
            // Root names are unique keys, so this insert cannot collide.
            if tree.add(tree.root(), dir).is_err() {
                continue;
            }
            self.scan_dir(&mut tree, dir, &path, &known, &mut seen, &mut hashed)?;
        }
        // Hash entries for files that no longer exist are dropped.
        for name in known.keys() {
            if !seen.contains(name) {
                let _ = self
                    .db
                    .exec(Query::HashFileDel, vec![Value::Text(name.clone())]);
            }
        }
        self.tree = tree;
        tracing::info!(
            files_hashed = hashed,
            total = crate::util::format_size(self.size()),
            "share scan finished"
        );
        Ok(hashed)
    }

    /// `(filename, lastmod)` of every hashed file we know, with its id and
    /// root.
    #[allow(clippy::type_complexity)]
    fn load_known(&self) -> Result<std::collections::HashMap<String, (i64, i64, TthDigest)>, ShareError> {
        let rows = self.db.query_rows(Query::HashFileListAll, vec![])?;
        let mut known = std::collections::HashMap::new();
        for row in rows {
            let (Some(id), Some(name), Some(tth_s), Some(lastmod)) = (
                row[0].as_i64(),
                row[1].as_str(),
                row[2].as_str(),
                row[3].as_i64(),
            ) else {
                continue;
            };
            let Some(digest) = tth::tth_from_str(tth_s) else {
                continue;
            };
            known.insert(name.to_string(), (id, lastmod, digest));
        }
        Ok(known)
    }

    fn scan_dir(
        &self,
        tree: &mut FileTree,
        parent: NodeId,
        dir: &Path,
        known: &std::collections::HashMap<String, (i64, i64, TthDigest)>,
        seen: &mut std::collections::HashSet<String>,
        hashed: &mut usize,
    ) -> Result<(), ShareError> {
        let io = |source| ShareError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut entries: Vec<std::fs::DirEntry> =
            std::fs::read_dir(dir).map_err(io)?.filter_map(Result::ok).collect();
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let Ok(name) = entry.file_name().into_string() else {
                tracing::warn!(path = %entry.path().display(), "skipping non-UTF-8 name");
                continue;
            };
            let Ok(meta) = entry.metadata() else { continue };
            if meta.is_dir() {
                let Ok(sub) = tree.create_dir(&name, false) else {
                    continue;
                };
                if tree.add(parent, sub).is_ok() {
                    self.scan_dir(tree, sub, &entry.path(), known, seen, hashed)?;
                }
                continue;
            }
            if !meta.is_file() {
                continue;
            }
            let size = meta.len();
            let lastmod = meta
                .modified()
                .ok()
                .and_then(|m| m.duration_since(SystemTime::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            let full = entry.path().display().to_string();
            seen.insert(full.clone());

            let (digest, storage_id) = match known.get(&full) {
                Some(&(id, stored_mod, digest)) if stored_mod == lastmod => (digest, id),
                _ => {
                    let file = match hash_file(&entry.path(), size) {
                        Ok(h) => h,
                        Err(err) => {
                            tracing::warn!(path = full, error = %err, "cannot hash file");
                            continue;
                        }
                    };
                    *hashed += 1;
                    let id = self.persist_hash(&full, size, lastmod, &file)?;
                    (file.root, id)
                }
            };
            let Ok(node) = tree.create_file(
                &name,
                size,
                Some(digest),
                Some(LocalMeta {
                    lastmod,
                    storage_id,
                }),
            ) else {
                continue;
            };
            let _ = tree.add(parent, node);
        }
        Ok(())
    }

    fn persist_hash(
        &self,
        filename: &str,
        size: u64,
        lastmod: i64,
        file: &HashedFile,
    ) -> Result<i64, ShareError> {
        let root_s = tth::base32_encode(&file.root);
        self.db.submit(
            DbRequest::new(
                Query::HashDataSet,
                vec![
                    Value::Text(root_s.clone()),
                    Value::Int64(size as i64),
                    if file.tthl.is_empty() {
                        Value::Null
                    } else {
                        Value::Blob(file.tthl.clone())
                    },
                ],
            )
            .flags(crate::db::DBF_CHAIN_NEXT),
        )?;
        let id = self.db.exec_wait(
            Query::HashFileSet,
            vec![
                Value::Text(filename.to_string()),
                Value::Text(root_s),
                Value::Int64(lastmod),
            ],
            0,
        )?;
        Ok(id.unwrap_or(0))
    }

    /// Stored TTHL leaves for a shared file, served to peers on request.
    pub fn tthl_for(&self, root: &TthDigest) -> Result<Option<Vec<u8>>, ShareError> {
        let rows = self.db.query_rows(
            Query::HashDataGet,
            vec![Value::Text(tth::base32_encode(root))],
        )?;
        Ok(rows
            .first()
            .and_then(|r| r[1].as_blob())
            .map(|b| b.to_vec()))
    }

    /// Writes the own list to `path` (bz2-compressed when the suffix says
    /// so), as peers download it.
    pub fn save_list(&self, path: &Path, generator: &str) -> Result<(), super::xml::FlXmlError> {
        super::xml::save_to_file(&self.tree, path, generator)
    }
}
