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

//! Walks one or two target trees in lockstep with the index and plans the
//! worktree operations needed to reconcile them, then applies that plan.
//! The planning strategies (`oneway_merge`, `twoway_merge`) decide *what*
//! happens at each path; [`apply_plan`] is the one place that actually
//! touches the worktree.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::backend::{BackendResult, BlobId, FileMode, Tree, TreeId, TreeValueId};
use crate::crypto::DerivedKeys;
use crate::index::{stat_file, CacheEntry, EntryFlags, IndexState};
use crate::object_store::ObjectStore;
use crate::repo_path::RepoPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Update,
    WtRemove,
    Keep,
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChange {
    pub path: RepoPath,
    pub action: Action,
    /// The content to write for `Update`; `None` for every other action.
    pub target: Option<(FileMode, LeafValue)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafValue {
    Blob(BlobId),
    EmptyDir,
}

type Leaf = (FileMode, LeafValue);
type FlatTree = BTreeMap<RepoPath, Leaf>;

/// Recursively reads `tree_id` and its subtrees into a flat path -> leaf map.
pub fn flatten_tree(store: &ObjectStore, tree_id: &TreeId) -> BackendResult<FlatTree> {
    let mut out = BTreeMap::new();
    flatten_into(store, tree_id, &RepoPath::root(), &mut out)?;
    Ok(out)
}

fn flatten_into(store: &ObjectStore, tree_id: &TreeId, prefix: &RepoPath, out: &mut FlatTree) -> BackendResult<()> {
    let tree: Tree = store.read_tree(tree_id)?;
    for entry in &tree.entries {
        let path = prefix.join(&entry.name);
        match (entry.mode, &entry.id) {
            (FileMode::EmptyDir, TreeValueId::Tree(_)) => {
                out.insert(path, (FileMode::EmptyDir, LeafValue::EmptyDir));
            }
            (mode, TreeValueId::Blob(blob_id)) => {
                out.insert(path, (mode, LeafValue::Blob(blob_id.clone())));
            }
            (_, TreeValueId::Tree(sub_id)) => {
                flatten_into(store, sub_id, &path, out)?;
            }
        }
    }
    Ok(())
}

fn index_leaf(index: &IndexState, path: &RepoPath) -> Option<Leaf> {
    let entry = index.get(path)?;
    let leaf = match entry.mode {
        FileMode::EmptyDir => LeafValue::EmptyDir,
        FileMode::Regular | FileMode::Executable => LeafValue::Blob(entry.blob_id.clone()),
    };
    Some((entry.mode, leaf))
}

/// Forces the index and worktree to match `target` exactly: every path in
/// `target` not already matching the index is planned as `Update`; every
/// path in the index not present in `target` is planned as `WtRemove`. Used
/// for reset/revert, where there is no merge to attempt.
pub fn oneway_merge(store: &ObjectStore, index: &IndexState, target: &TreeId) -> BackendResult<Vec<PlannedChange>> {
    let target_flat = flatten_tree(store, target)?;
    let mut paths: BTreeSet<RepoPath> = target_flat.keys().cloned().collect();
    paths.extend(index.entries().iter().filter_map(|e| RepoPath::parse(&e.path)));

    let mut plan = Vec::with_capacity(paths.len());
    for path in paths {
        let target_leaf = target_flat.get(&path).cloned();
        let idx_leaf = index_leaf(index, &path);
        let change = match (target_leaf, idx_leaf) {
            (Some(t), Some(i)) if t == i => PlannedChange { path, action: Action::Keep, target: None },
            (Some((mode, leaf)), _) => PlannedChange {
                path,
                action: Action::Update,
                target: Some((mode, leaf)),
            },
            (None, Some(_)) => PlannedChange { path, action: Action::WtRemove, target: None },
            (None, None) => continue,
        };
        plan.push(change);
    }
    Ok(plan)
}

/// Reconciles `head` (the current commit) against `new` (the checkout
/// target) relative to the index: a path untouched since `head` moves to
/// `new`; a path already matching `new` is left alone; anything else is a
/// conflict the caller must resolve.
pub fn twoway_merge(
    store: &ObjectStore,
    index: &IndexState,
    head: &TreeId,
    new: &TreeId,
) -> BackendResult<Vec<PlannedChange>> {
    let head_flat = flatten_tree(store, head)?;
    let new_flat = flatten_tree(store, new)?;
    let mut paths: BTreeSet<RepoPath> = head_flat.keys().cloned().collect();
    paths.extend(new_flat.keys().cloned());
    paths.extend(index.entries().iter().filter_map(|e| RepoPath::parse(&e.path)));

    let mut plan = Vec::with_capacity(paths.len());
    for path in paths {
        let head_leaf = head_flat.get(&path).cloned();
        let new_leaf = new_flat.get(&path).cloned();
        let idx_leaf = index_leaf(index, &path);

        let change = if idx_leaf == head_leaf {
            match new_leaf {
                Some(ref leaf) if Some(leaf.clone()) == head_leaf => {
                    PlannedChange { path, action: Action::Keep, target: None }
                }
                Some((mode, leaf)) => PlannedChange {
                    path,
                    action: Action::Update,
                    target: Some((mode, leaf)),
                },
                None => PlannedChange { path, action: Action::WtRemove, target: None },
            }
        } else if idx_leaf == new_leaf {
            PlannedChange { path, action: Action::Keep, target: None }
        } else {
            PlannedChange { path, action: Action::Conflict, target: None }
        };
        plan.push(change);
    }
    Ok(plan)
}

/// Applies a plan to the worktree: creates parent directories on demand,
/// writes new content through the object store's own temp+rename path,
/// removes deleted entries, and updates the index to match. Returns the
/// paths left in `Conflict`, which the caller (the merge engine) must
/// resolve before the index can be committed.
pub fn apply_plan(
    plan: &[PlannedChange],
    worktree: &Path,
    store: &ObjectStore,
    crypt: Option<&DerivedKeys>,
    index: &mut IndexState,
    progress: Option<&AtomicU64>,
) -> BackendResult<Vec<RepoPath>> {
    let mut conflicts = Vec::new();
    for change in plan {
        match change.action {
            Action::Update => {
                let (mode, leaf) = change.target.clone().expect("Update plans always carry a target");
                apply_update(&change.path, mode, &leaf, worktree, store, crypt, index)?;
                if let Some(progress) = progress {
                    progress.fetch_add(1, Ordering::SeqCst);
                }
            }
            Action::WtRemove => {
                remove_from_worktree(&change.path, worktree)?;
                index.remove_file_from_index(&change.path);
            }
            Action::Keep => {}
            Action::Conflict => conflicts.push(change.path.clone()),
        }
    }
    index.remove_marked_cache_entries();
    Ok(conflicts)
}

fn apply_update(
    path: &RepoPath,
    mode: FileMode,
    leaf: &LeafValue,
    worktree: &Path,
    store: &ObjectStore,
    crypt: Option<&DerivedKeys>,
    index: &mut IndexState,
) -> BackendResult<()> {
    let fs_path = path.to_fs_path(worktree);
    if let Some(parent) = fs_path.parent() {
        fs::create_dir_all(parent)?;
    }
    match leaf {
        LeafValue::EmptyDir => {
            fs::create_dir_all(&fs_path)?;
            index.add_empty_dir_to_index(path);
        }
        LeafValue::Blob(blob_id) => {
            store.checkout_blob(blob_id, crypt, &fs_path)?;
            let stage = index.get(path).map(|e| e.stage).unwrap_or(0);
            let stat = stat_file(&fs::metadata(&fs_path)?);
            index.set_entry(CacheEntry {
                path: path.as_internal_str().to_string(),
                mode,
                blob_id: blob_id.clone(),
                ctime_millis: stat.ctime_millis,
                mtime_millis: stat.mtime_millis,
                size: stat.size,
                flags: EntryFlags::empty(),
                stage,
            });
        }
    }
    Ok(())
}

/// Before destructive worktree changes (not the initial checkout, not
/// recovering an interrupted merge), scans every path a plan would touch
/// for files another process is holding open, so a checkout never clobbers
/// a document the user has open in an editor. A no-op on platforms without
/// mandatory file locking.
#[cfg(windows)]
pub fn scan_for_locked_files(plan: &[PlannedChange], worktree: &Path) -> Vec<RepoPath> {
    plan.iter()
        .filter(|change| matches!(change.action, Action::Update | Action::WtRemove))
        .filter(|change| {
            let fs_path = change.path.to_fs_path(worktree);
            fs_path.exists() && fs::OpenOptions::new().write(true).open(&fs_path).is_err()
        })
        .map(|change| change.path.clone())
        .collect()
}

#[cfg(not(windows))]
pub fn scan_for_locked_files(_plan: &[PlannedChange], _worktree: &Path) -> Vec<RepoPath> {
    Vec::new()
}

fn remove_from_worktree(path: &RepoPath, worktree: &Path) -> BackendResult<()> {
    let fs_path = path.to_fs_path(worktree);
    match fs::symlink_metadata(&fs_path) {
        Ok(meta) if meta.is_dir() => {
            let _ = fs::remove_dir(&fs_path);
        }
        Ok(_) => fs::remove_file(&fs_path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::init(dir.path().join("objects")).unwrap();
        (dir, store)
    }

    fn tree_with_file(store: &ObjectStore, name: &str, contents: &[u8]) -> TreeId {
        let src_dir = tempfile::tempdir().unwrap();
        let file_path = src_dir.path().join("f");
        fs::write(&file_path, contents).unwrap();
        let blob_id = store.index_blocks(&file_path, None).unwrap();
        store
            .write_tree(&Tree {
                entries: vec![crate::backend::TreeEntry {
                    name: name.to_string(),
                    mode: FileMode::Regular,
                    id: TreeValueId::Blob(blob_id),
                }],
            })
            .unwrap()
    }

    #[test]
    fn oneway_merge_plans_update_for_empty_index() {
        let (_dir, store) = new_store();
        let tree_id = tree_with_file(&store, "a.txt", b"hello");
        let index = IndexState::default();
        let plan = oneway_merge(&store, &index, &tree_id).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].action, Action::Update);
    }

    #[test]
    fn twoway_merge_fast_forwards_when_index_matches_head() {
        let (_dir, store) = new_store();
        let head = tree_with_file(&store, "a.txt", b"one");
        let new = tree_with_file(&store, "a.txt", b"two");

        let mut index = IndexState::default();
        let worktree = tempfile::tempdir().unwrap();
        apply_plan(
            &oneway_merge(&store, &index, &head).unwrap(),
            worktree.path(),
            &store,
            None,
            &mut index,
            None,
        )
        .unwrap();

        let plan = twoway_merge(&store, &index, &head, &new).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].action, Action::Update);
    }

    #[test]
    fn twoway_merge_keeps_when_already_at_target() {
        let (_dir, store) = new_store();
        let head = tree_with_file(&store, "a.txt", b"one");
        let new = tree_with_file(&store, "a.txt", b"two");

        let mut index = IndexState::default();
        let worktree = tempfile::tempdir().unwrap();
        apply_plan(
            &oneway_merge(&store, &index, &new).unwrap(),
            worktree.path(),
            &store,
            None,
            &mut index,
            None,
        )
        .unwrap();

        let plan = twoway_merge(&store, &index, &head, &new).unwrap();
        assert_eq!(plan[0].action, Action::Keep);
    }

    #[test]
    fn twoway_merge_conflicts_on_independent_local_edit() {
        let (_dir, store) = new_store();
        let head = tree_with_file(&store, "a.txt", b"one");
        let new = tree_with_file(&store, "a.txt", b"two");
        let local = tree_with_file(&store, "a.txt", b"three");

        let mut index = IndexState::default();
        let worktree = tempfile::tempdir().unwrap();
        apply_plan(
            &oneway_merge(&store, &index, &local).unwrap(),
            worktree.path(),
            &store,
            None,
            &mut index,
            None,
        )
        .unwrap();

        let plan = twoway_merge(&store, &index, &head, &new).unwrap();
        assert_eq!(plan[0].action, Action::Conflict);
    }

    #[test]
    fn apply_plan_writes_file_and_updates_index() {
        let (_dir, store) = new_store();
        let tree_id = tree_with_file(&store, "a.txt", b"hello");
        let mut index = IndexState::default();
        let worktree = tempfile::tempdir().unwrap();
        let plan = oneway_merge(&store, &index, &tree_id).unwrap();
        apply_plan(&plan, worktree.path(), &store, None, &mut index, None).unwrap();

        assert_eq!(fs::read(worktree.path().join("a.txt")).unwrap(), b"hello");
        assert!(index.get(&RepoPath::parse("a.txt").unwrap()).is_some());
    }

    #[test]
    fn progress_counter_increments_per_update() {
        let (_dir, store) = new_store();
        let tree_id = tree_with_file(&store, "a.txt", b"hello");
        let mut index = IndexState::default();
        let worktree = tempfile::tempdir().unwrap();
        let plan = oneway_merge(&store, &index, &tree_id).unwrap();
        let progress = AtomicU64::new(0);
        apply_plan(&plan, worktree.path(), &store, None, &mut index, Some(&progress)).unwrap();
        assert_eq!(progress.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[cfg(not(windows))]
    fn scan_for_locked_files_is_a_noop_off_windows() {
        let (_dir, store) = new_store();
        let tree_id = tree_with_file(&store, "a.txt", b"hello");
        let index = IndexState::default();
        let plan = oneway_merge(&store, &index, &tree_id).unwrap();
        assert!(scan_for_locked_files(&plan, Path::new(".")).is_empty());
    }

    #[test]
    fn oneway_merge_removes_paths_absent_from_target() {
        let (_dir, store) = new_store();
        let populated = tree_with_file(&store, "a.txt", b"hello");
        let empty_tree = store.write_tree(&Tree::default()).unwrap();

        let mut index = IndexState::default();
        let worktree = tempfile::tempdir().unwrap();
        apply_plan(
            &oneway_merge(&store, &index, &populated).unwrap(),
            worktree.path(),
            &store,
            None,
            &mut index,
            None,
        )
        .unwrap();

        let plan = oneway_merge(&store, &index, &empty_tree).unwrap();
        assert_eq!(plan[0].action, Action::WtRemove);
        apply_plan(&plan, worktree.path(), &store, None, &mut index, None).unwrap();
        assert!(!worktree.path().join("a.txt").exists());
        assert!(index.is_empty());
    }
}
