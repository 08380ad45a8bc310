// Copyright 2024 The Reposync Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Three independent change collectors feeding the sync status view: one
//! compares the index against the worktree, one finds untracked worktree
//! entries, one compares the index against the head commit's tree. Their
//! output is merged and normalized by `resolve_empty_dirs`/`resolve_renames`.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::backend::{BackendResult, BlobId, FileMode, TreeId};
use crate::crypto::DerivedKeys;
use crate::ignore::is_ignored_filename;
use crate::index::{stat_file, IndexState};
use crate::object_store::ObjectStore;
use crate::repo_path::RepoPath;
use crate::tree_walker::{flatten_tree, LeafValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Deleted,
    Modified,
    DirAdded,
    DirDeleted,
    Renamed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub path: RepoPath,
    pub kind: ChangeKind,
    /// Set only for `Renamed`: the path the entry was renamed from.
    pub renamed_from: Option<RepoPath>,
}

impl Change {
    fn new(path: RepoPath, kind: ChangeKind) -> Self {
        Change { path, kind, renamed_from: None }
    }
}

/// Compares each index entry against the worktree: a missing file is
/// `Deleted`; a file whose stat disagrees with the cached entry is
/// re-hashed and reported `Modified` only if the content actually differs
/// (a touch with no content change must not show up as a change).
pub fn collect_changes_worktree(
    index: &IndexState,
    worktree: &Path,
    store: &ObjectStore,
    crypt: Option<&DerivedKeys>,
) -> BackendResult<Vec<Change>> {
    let mut changes = Vec::new();
    for entry in index.entries() {
        let Some(path) = RepoPath::parse(&entry.path) else { continue };
        let fs_path = path.to_fs_path(worktree);
        let metadata = match fs::symlink_metadata(&fs_path) {
            Ok(m) => m,
            Err(_) => {
                changes.push(Change::new(path, ChangeKind::Deleted));
                continue;
            }
        };
        if entry.mode == FileMode::EmptyDir {
            if !metadata.is_dir() {
                changes.push(Change::new(path, ChangeKind::Deleted));
            }
            continue;
        }
        if !metadata.is_file() {
            changes.push(Change::new(path, ChangeKind::Deleted));
            continue;
        }
        let stat = stat_file(&metadata);
        let stat_matches =
            stat.ctime_millis == entry.ctime_millis && stat.mtime_millis == entry.mtime_millis && stat.size == entry.size;
        if stat_matches {
            continue;
        }
        let current_id = store.index_blocks(&fs_path, crypt)?;
        if current_id != entry.blob_id {
            changes.push(Change::new(path, ChangeKind::Modified));
        }
    }
    Ok(changes)
}

/// Walks the worktree looking for paths the index doesn't know about yet.
pub fn collect_untracked(index: &IndexState, worktree: &Path) -> BackendResult<Vec<Change>> {
    let mut changes = Vec::new();
    walk_untracked(index, worktree, &RepoPath::root(), worktree, &mut changes)?;
    Ok(changes)
}

fn walk_untracked(
    index: &IndexState,
    worktree: &Path,
    repo_dir: &RepoPath,
    fs_dir: &Path,
    out: &mut Vec<Change>,
) -> BackendResult<()> {
    let mut entries: Vec<_> = fs::read_dir(fs_dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_ignored_filename(&name) {
            continue;
        }
        let path = repo_dir.join(&name);
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            if index.get(&path).is_some() {
                walk_untracked(index, worktree, &path, &entry.path(), out)?;
                continue;
            }
            let mut sub_entries = fs::read_dir(entry.path())?;
            if sub_entries.next().is_none() {
                out.push(Change::new(path, ChangeKind::DirAdded));
            } else {
                walk_untracked(index, worktree, &path, &entry.path(), out)?;
            }
        } else if metadata.is_file() && index.get(&path).is_none() {
            out.push(Change::new(path, ChangeKind::Added));
        }
    }
    Ok(())
}

/// Diffs the index against `head_tree`'s flattened contents.
pub fn collect_changes_index(index: &IndexState, store: &ObjectStore, head_tree: &TreeId) -> BackendResult<Vec<Change>> {
    let head_flat = flatten_tree(store, head_tree)?;
    let mut changes = Vec::new();

    for entry in index.entries() {
        let Some(path) = RepoPath::parse(&entry.path) else { continue };
        match head_flat.get(&path) {
            None => {
                let kind = if entry.mode == FileMode::EmptyDir {
                    ChangeKind::DirAdded
                } else {
                    ChangeKind::Added
                };
                changes.push(Change::new(path, kind));
            }
            Some((head_mode, head_leaf)) => {
                let matches = match head_leaf {
                    LeafValue::EmptyDir => entry.mode == FileMode::EmptyDir,
                    LeafValue::Blob(id) => entry.mode == *head_mode && *id == entry.blob_id,
                };
                if !matches {
                    changes.push(Change::new(path, ChangeKind::Modified));
                }
            }
        }
    }

    for (path, (_, leaf)) in &head_flat {
        if index.get(path).is_none() {
            let kind = match leaf {
                LeafValue::EmptyDir => ChangeKind::DirDeleted,
                LeafValue::Blob(_) => ChangeKind::Deleted,
            };
            changes.push(Change::new(path.clone(), kind));
        }
    }
    Ok(changes)
}

/// Collapses a `Deleted` file paired with a sibling `DirAdded`-turned-empty
/// into a single `DirDeleted`, which happens whenever the last file under a
/// directory is removed and the tree walker's empty-dir sentinel logic
/// would otherwise report the directory twice.
pub fn resolve_empty_dirs(changes: Vec<Change>) -> Vec<Change> {
    let deleted_dirs: std::collections::HashSet<RepoPath> = changes
        .iter()
        .filter(|c| c.kind == ChangeKind::DirDeleted)
        .map(|c| c.path.clone())
        .collect();
    changes
        .into_iter()
        .filter(|c| !(c.kind == ChangeKind::Deleted && deleted_dirs.contains(&c.path)))
        .collect()
}

/// Pairs an `Added` and a `Deleted` change carrying the same blob id into a
/// single `Renamed` entry.
pub fn resolve_renames(changes: Vec<Change>, index: &IndexState) -> Vec<Change> {
    let mut deleted_blobs: HashMap<BlobId, RepoPath> = HashMap::new();
    for change in &changes {
        if change.kind != ChangeKind::Deleted {
            continue;
        }
        if let Some(entry) = index.get(&change.path) {
            deleted_blobs.insert(entry.blob_id.clone(), change.path.clone());
        }
    }

    let mut added_blob_for: HashMap<RepoPath, BlobId> = HashMap::new();
    for change in &changes {
        if change.kind == ChangeKind::Added {
            if let Some(entry) = index.get(&change.path) {
                added_blob_for.insert(change.path.clone(), entry.blob_id.clone());
            }
        }
    }

    let mut consumed_deletes = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(changes.len());
    for change in changes {
        if change.kind == ChangeKind::Added {
            if let Some(blob_id) = added_blob_for.get(&change.path) {
                if let Some(from) = deleted_blobs.get(blob_id) {
                    consumed_deletes.insert(from.clone());
                    out.push(Change {
                        path: change.path,
                        kind: ChangeKind::Renamed,
                        renamed_from: Some(from.clone()),
                    });
                    continue;
                }
            }
        }
        if change.kind == ChangeKind::Deleted && consumed_deletes.contains(&change.path) {
            continue;
        }
        out.push(change);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Tree, TreeEntry, TreeValueId};
    use crate::index::{add_to_index, CacheEntry, EntryFlags};

    fn new_store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::init(dir.path().join("objects")).unwrap();
        (dir, store)
    }

    fn stage_file(index: &mut IndexState, store: &ObjectStore, worktree: &Path, name: &str, contents: &[u8]) {
        let full = worktree.join(name);
        fs::write(&full, contents).unwrap();
        let stat = stat_file(&fs::metadata(&full).unwrap());
        add_to_index(index, &RepoPath::parse(name).unwrap(), &full, stat, None, store).unwrap();
    }

    #[test]
    fn collect_changes_worktree_reports_modified_on_content_change() {
        let (_dir, store) = new_store();
        let worktree = tempfile::tempdir().unwrap();
        let mut index = IndexState::default();
        stage_file(&mut index, &store, worktree.path(), "a.txt", b"hello");

        fs::write(worktree.path().join("a.txt"), b"goodbye").unwrap();
        let changes = collect_changes_worktree(&index, worktree.path(), &store, None).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Modified);
    }

    #[test]
    fn collect_changes_worktree_reports_deleted_when_file_missing() {
        let (_dir, store) = new_store();
        let worktree = tempfile::tempdir().unwrap();
        let mut index = IndexState::default();
        stage_file(&mut index, &store, worktree.path(), "a.txt", b"hello");
        fs::remove_file(worktree.path().join("a.txt")).unwrap();

        let changes = collect_changes_worktree(&index, worktree.path(), &store, None).unwrap();
        assert_eq!(changes, vec![Change::new(RepoPath::parse("a.txt").unwrap(), ChangeKind::Deleted)]);
    }

    #[test]
    fn collect_untracked_finds_new_file_and_empty_dir() {
        let worktree = tempfile::tempdir().unwrap();
        fs::write(worktree.path().join("new.txt"), b"x").unwrap();
        fs::create_dir(worktree.path().join("empty")).unwrap();
        let index = IndexState::default();

        let mut changes = collect_untracked(&index, worktree.path()).unwrap();
        changes.sort_by(|a, b| a.path.as_internal_str().cmp(b.path.as_internal_str()));
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].kind, ChangeKind::DirAdded);
        assert_eq!(changes[1].kind, ChangeKind::Added);
    }

    #[test]
    fn collect_untracked_skips_ignored_names() {
        let worktree = tempfile::tempdir().unwrap();
        fs::write(worktree.path().join("Thumbs.db"), b"x").unwrap();
        let index = IndexState::default();
        let changes = collect_untracked(&index, worktree.path()).unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn collect_changes_index_reports_added_and_deleted() {
        let (_dir, store) = new_store();
        let blob_id = {
            let tmp = tempfile::tempdir().unwrap();
            let f = tmp.path().join("f");
            fs::write(&f, b"hello").unwrap();
            store.index_blocks(&f, None).unwrap()
        };
        let head_tree = store
            .write_tree(&Tree {
                entries: vec![TreeEntry {
                    name: "old.txt".to_string(),
                    mode: FileMode::Regular,
                    id: TreeValueId::Blob(blob_id),
                }],
            })
            .unwrap();

        let mut index = IndexState::default();
        let worktree = tempfile::tempdir().unwrap();
        stage_file(&mut index, &store, worktree.path(), "new.txt", b"new content");

        let changes = collect_changes_index(&index, &store, &head_tree).unwrap();
        let kinds: std::collections::HashSet<ChangeKind> = changes.iter().map(|c| c.kind).collect();
        assert!(kinds.contains(&ChangeKind::Added));
        assert!(kinds.contains(&ChangeKind::Deleted));
    }

    #[test]
    fn resolve_renames_pairs_matching_blob_ids() {
        let (_dir, store) = new_store();
        let worktree = tempfile::tempdir().unwrap();
        let mut index = IndexState::default();
        stage_file(&mut index, &store, worktree.path(), "new_name.txt", b"same content");

        let old_entry = CacheEntry {
            path: "old_name.txt".to_string(),
            mode: FileMode::Regular,
            blob_id: index.get(&RepoPath::parse("new_name.txt").unwrap()).unwrap().blob_id.clone(),
            ctime_millis: 0,
            mtime_millis: 0,
            size: 0,
            flags: EntryFlags::empty(),
            stage: 0,
        };
        let mut index_with_old = IndexState::default();
        index_with_old.set_entry(old_entry);
        index_with_old.set_entry(index.get(&RepoPath::parse("new_name.txt").unwrap()).unwrap().clone());

        let changes = vec![
            Change::new(RepoPath::parse("old_name.txt").unwrap(), ChangeKind::Deleted),
            Change::new(RepoPath::parse("new_name.txt").unwrap(), ChangeKind::Added),
        ];
        let resolved = resolve_renames(changes, &index_with_old);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].kind, ChangeKind::Renamed);
        assert_eq!(resolved[0].renamed_from, Some(RepoPath::parse("old_name.txt").unwrap()));
    }
}
