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

//! Merges a remote branch into the local head: fast-forward when possible,
//! a no-op when the local branch already contains the remote, otherwise a
//! three-way unpack of (ancestor, local, remote) against the index. The
//! repo's `MergeInfo` row is persisted before any worktree write and
//! cleared only once the merge commit is recorded, so a crash mid-merge is
//! recoverable at the next startup (`RepoManager::interrupted_merges`).

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::backend::{BackendError, BlobId, CommitId, FileMode, TreeId};
use crate::branch::{BranchError, BranchRegistry};
use crate::cache_tree::cache_tree_update;
use crate::commit_builder::CommitBuilder;
use crate::content_merge::{self, MergeHunk, MergeResult};
use crate::crypto::DerivedKeys;
use crate::dag::merge_base;
use crate::index::{read_index_from, update_index, CacheEntry, EntryFlags, IndexState};
use crate::lock::FileLock;
use crate::object_store::ObjectStore;
use crate::repo_manager::{RepoManager, RepoManagerError};
use crate::repo_path::RepoPath;
use crate::tree_walker::{flatten_tree, scan_for_locked_files, twoway_merge, Action, LeafValue, PlannedChange};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("branch error: {0}")]
    Branch(#[from] BranchError),
    #[error("repo manager error: {0}")]
    RepoManager(#[from] RepoManagerError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("branches {0} and {1} share no common history")]
    NoCommonAncestor(String, String),
    #[error("{} file(s) are open in another program and cannot be merged", .0.len())]
    LockedFiles(Vec<RepoPath>),
}

pub type MergeResultOutcome = Result<bool, MergeError>;

/// Merges `remote_commit` into `local_branch`. Returns `Ok(true)` only when
/// a real merge commit was recorded (two parents); `Ok(false)` for a
/// fast-forward or when the branch was already up to date.
#[allow(clippy::too_many_arguments)]
pub fn merge_branches(
    store: &ObjectStore,
    branches: &BranchRegistry,
    manager: &RepoManager,
    repo_id: &str,
    local_branch: &str,
    remote_branch_label: &str,
    remote_commit: &CommitId,
    index_path: &Path,
    worktree: &Path,
    crypt: Option<&DerivedKeys>,
) -> MergeResultOutcome {
    let _lock = FileLock::lock(index_path.with_extension("lock"));

    let local_head = branches.get(repo_id, local_branch)?;
    if &local_head == remote_commit {
        return Ok(false);
    }

    let ancestor = merge_base(store, &local_head, remote_commit)
        .ok_or_else(|| MergeError::NoCommonAncestor(local_branch.to_string(), remote_branch_label.to_string()))?;

    if ancestor == local_head {
        fast_forward(store, branches, repo_id, local_branch, remote_commit, index_path, worktree, crypt)?;
        return Ok(false);
    }
    if &ancestor == remote_commit {
        return Ok(false);
    }

    three_way_merge(
        store,
        branches,
        manager,
        repo_id,
        local_branch,
        remote_branch_label,
        &local_head,
        remote_commit,
        &ancestor,
        index_path,
        worktree,
        crypt,
    )?;
    Ok(true)
}

#[allow(clippy::too_many_arguments)]
fn fast_forward(
    store: &ObjectStore,
    branches: &BranchRegistry,
    repo_id: &str,
    local_branch: &str,
    remote_commit: &CommitId,
    index_path: &Path,
    worktree: &Path,
    crypt: Option<&DerivedKeys>,
) -> Result<(), MergeError> {
    let local_head = branches.get(repo_id, local_branch)?;
    let local = store.read_commit(&local_head)?;
    let remote = store.read_commit(remote_commit)?;

    let mut index = read_index_from(index_path)?;
    let plan = twoway_merge(store, &index, &local.root_tree_id, &remote.root_tree_id)?;
    let locked = scan_for_locked_files(&plan, worktree);
    if !locked.is_empty() {
        return Err(MergeError::LockedFiles(locked));
    }
    crate::tree_walker::apply_plan(&plan, worktree, store, crypt, &mut index, None)?;
    update_index(&index, index_path)?;
    branches.update(repo_id, local_branch, remote_commit)?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn three_way_merge(
    store: &ObjectStore,
    branches: &BranchRegistry,
    manager: &RepoManager,
    repo_id: &str,
    local_branch: &str,
    remote_label: &str,
    local_head: &CommitId,
    remote_commit: &CommitId,
    ancestor_commit: &CommitId,
    index_path: &Path,
    worktree: &Path,
    crypt: Option<&DerivedKeys>,
) -> Result<CommitId, MergeError> {
    manager.set_merge_info(repo_id, true, remote_label)?;

    let local = store.read_commit(local_head)?;
    let remote = store.read_commit(remote_commit)?;
    let ancestor = store.read_commit(ancestor_commit)?;

    let mut index = read_index_from(index_path)?;
    unpack_three_way(
        store,
        &mut index,
        worktree,
        crypt,
        &ancestor.root_tree_id,
        &local.root_tree_id,
        &remote.root_tree_id,
        local_branch,
        remote_label,
    )?;
    update_index(&index, index_path)?;

    let tree_id = cache_tree_update(&index, store)?;
    let mut builder = CommitBuilder::for_new_commit_from(&local, &local.creator_name, &local.creator_email);
    builder
        .set_tree(tree_id)
        .set_parent(local_head.clone())
        .set_second_parent(remote_commit.clone())
        .set_description(format!("Merge branch '{remote_label}' into {local_branch}"));
    let commit_id = builder.write(store)?;

    branches.update(repo_id, local_branch, &commit_id)?;
    manager.clear_merge_info(repo_id)?;
    Ok(commit_id)
}

/// Walks all three trees in lockstep and resolves each path: a change on
/// only one side wins outright; a change on both sides that resolves to
/// the same content wins; everything else is a genuine conflict, resolved
/// at the content level for text files and by suffixed sibling files for
/// binary ones. Returns the set of paths left conflicted.
#[allow(clippy::too_many_arguments)]
fn unpack_three_way(
    store: &ObjectStore,
    index: &mut IndexState,
    worktree: &Path,
    crypt: Option<&DerivedKeys>,
    ancestor_tree: &TreeId,
    local_tree: &TreeId,
    remote_tree: &TreeId,
    local_label: &str,
    remote_label: &str,
) -> Result<Vec<RepoPath>, MergeError> {
    let ancestor_flat = flatten_tree(store, ancestor_tree)?;
    let local_flat = flatten_tree(store, local_tree)?;
    let remote_flat = flatten_tree(store, remote_tree)?;

    let mut paths: std::collections::BTreeSet<RepoPath> = ancestor_flat.keys().cloned().collect();
    paths.extend(local_flat.keys().cloned());
    paths.extend(remote_flat.keys().cloned());

    let touched: Vec<PlannedChange> = paths
        .iter()
        .filter(|path| local_flat.get(*path) != remote_flat.get(*path))
        .map(|path| PlannedChange { path: path.clone(), action: Action::Update, target: None })
        .collect();
    let locked = scan_for_locked_files(&touched, worktree);
    if !locked.is_empty() {
        return Err(MergeError::LockedFiles(locked));
    }

    let mut conflicts = Vec::new();
    for path in paths {
        let a = ancestor_flat.get(&path);
        let l = local_flat.get(&path);
        let r = remote_flat.get(&path);

        if l == r {
            continue; // both sides agree; worktree already holds this (it is the local tree)
        }
        if l == a {
            // Only remote changed: take it (or remove if remote deleted it).
            apply_remote_side(store, index, worktree, crypt, &path, r)?;
            continue;
        }
        if r == a {
            continue; // Only local changed; worktree already holds it.
        }

        // Both sides changed the same path differently from the ancestor.
        match (l, r) {
            (Some((_, LeafValue::Blob(local_id))), Some((remote_mode, LeafValue::Blob(remote_id)))) => {
                let base_bytes = match a {
                    Some((_, LeafValue::Blob(id))) => store.read_blob_to_vec(id, crypt)?,
                    _ => Vec::new(),
                };
                let local_bytes = store.read_blob_to_vec(local_id, crypt)?;
                let remote_bytes = store.read_blob_to_vec(remote_id, crypt)?;

                if looks_like_text(&local_bytes) && looks_like_text(&remote_bytes) {
                    match content_merge::merge(&base_bytes, &local_bytes, &remote_bytes) {
                        MergeResult::Resolved(data) => {
                            write_resolved(store, index, worktree, crypt, &path, *remote_mode, &data)?;
                        }
                        MergeResult::Conflict(hunks) => {
                            write_conflict_markers(store, index, worktree, crypt, &path, &hunks, local_label, remote_label)?;
                            conflicts.push(path.clone());
                        }
                    }
                } else {
                    write_binary_conflict(store, index, worktree, crypt, &path, remote_id, remote_label)?;
                    conflicts.push(path.clone());
                }
            }
            _ => {
                // A directory/file type clash, or an add/delete pair with
                // different content on each side: flag the conflict but
                // leave the local worktree content in place for the user
                // to resolve by hand.
                conflicts.push(path.clone());
                if let Some(entry) = index.get(&path) {
                    let mut flagged = entry.clone();
                    flagged.stage = 1;
                    index.set_entry(flagged);
                }
            }
        }
    }
    Ok(conflicts)
}

fn looks_like_text(bytes: &[u8]) -> bool {
    bytes.len() < 8 * 1024 * 1024 && !bytes.contains(&0)
}

fn apply_remote_side(
    store: &ObjectStore,
    index: &mut IndexState,
    worktree: &Path,
    crypt: Option<&DerivedKeys>,
    path: &RepoPath,
    remote: Option<&(FileMode, LeafValue)>,
) -> Result<(), MergeError> {
    let fs_path = path.to_fs_path(worktree);
    match remote {
        None => {
            let _ = fs::remove_file(&fs_path);
            index.remove_file_from_index(path);
            index.remove_marked_cache_entries();
        }
        Some((mode, LeafValue::EmptyDir)) => {
            fs::create_dir_all(&fs_path)?;
            index.add_empty_dir_to_index(path);
            let _ = mode;
        }
        Some((mode, LeafValue::Blob(blob_id))) => {
            if let Some(parent) = fs_path.parent() {
                fs::create_dir_all(parent)?;
            }
            store.checkout_blob(blob_id, crypt, &fs_path)?;
            set_index_entry(index, path, *mode, blob_id.clone(), &fs_path)?;
        }
    }
    Ok(())
}

fn write_resolved(
    store: &ObjectStore,
    index: &mut IndexState,
    worktree: &Path,
    crypt: Option<&DerivedKeys>,
    path: &RepoPath,
    mode: FileMode,
    data: &[u8],
) -> Result<(), MergeError> {
    let fs_path = path.to_fs_path(worktree);
    if let Some(parent) = fs_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&fs_path, data)?;
    let blob_id = store.index_blocks(&fs_path, crypt)?;
    set_index_entry(index, path, mode, blob_id, &fs_path)?;
    Ok(())
}

fn write_conflict_markers(
    store: &ObjectStore,
    index: &mut IndexState,
    worktree: &Path,
    crypt: Option<&DerivedKeys>,
    path: &RepoPath,
    hunks: &[MergeHunk],
    local_label: &str,
    remote_label: &str,
) -> Result<(), MergeError> {
    let fs_path = path.to_fs_path(worktree);
    let marked = content_merge::render_conflict_markers(hunks, local_label, remote_label);
    fs::write(&fs_path, &marked)?;
    let blob_id = store.index_blocks(&fs_path, crypt)?;
    let mut entry = index.get(path).cloned().unwrap_or_else(|| CacheEntry {
        path: path.as_internal_str().to_string(),
        mode: FileMode::Regular,
        blob_id: BlobId::from_sha1([0u8; 20]),
        ctime_millis: 0,
        mtime_millis: 0,
        size: 0,
        flags: EntryFlags::empty(),
        stage: 0,
    });
    let stat = crate::index::stat_file(&fs::metadata(&fs_path)?);
    entry.blob_id = blob_id;
    entry.ctime_millis = stat.ctime_millis;
    entry.mtime_millis = stat.mtime_millis;
    entry.size = stat.size;
    entry.stage = 1;
    index.set_entry(entry);
    Ok(())
}

fn write_binary_conflict(
    store: &ObjectStore,
    index: &mut IndexState,
    worktree: &Path,
    crypt: Option<&DerivedKeys>,
    path: &RepoPath,
    remote_id: &BlobId,
    remote_label: &str,
) -> Result<(), MergeError> {
    let suffixed = suffixed_path(path, remote_label);
    let suffixed_fs_path = suffixed.to_fs_path(worktree);
    if let Some(parent) = suffixed_fs_path.parent() {
        fs::create_dir_all(parent)?;
    }
    store.checkout_blob(remote_id, crypt, &suffixed_fs_path)?;
    set_index_entry(index, &suffixed, FileMode::Regular, remote_id.clone(), &suffixed_fs_path)?;

    if let Some(entry) = index.get(path) {
        let mut flagged = entry.clone();
        flagged.stage = 1;
        index.set_entry(flagged);
    }
    Ok(())
}

fn suffixed_path(path: &RepoPath, label: &str) -> RepoPath {
    let sanitized: String = label.chars().filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_').collect();
    RepoPath::parse(&format!("{}.conflict-{sanitized}", path.as_internal_str())).expect("suffixed path is still valid")
}

fn set_index_entry(
    index: &mut IndexState,
    path: &RepoPath,
    mode: FileMode,
    blob_id: BlobId,
    fs_path: &Path,
) -> Result<(), MergeError> {
    let stat = crate::index::stat_file(&fs::metadata(fs_path)?);
    index.set_entry(CacheEntry {
        path: path.as_internal_str().to_string(),
        mode,
        blob_id,
        ctime_millis: stat.ctime_millis,
        mtime_millis: stat.mtime_millis,
        size: stat.size,
        flags: EntryFlags::empty(),
        stage: 0,
    });
    Ok(())
}
