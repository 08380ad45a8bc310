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

//! Top-level repository operations composing the lower-level primitives:
//! stage the worktree into the index and commit it, check out a commit via
//! the two-way tree walker, and revert to a prior commit's content without
//! rewriting history. Mirrors the role `LocalWorkingCopy::check_out` plays
//! for the teacher, minus the sparse-pattern and snapshot machinery this
//! engine has no use for.

use std::path::Path;

use thiserror::Error;

use crate::backend::{BackendError, CommitId};
use crate::branch::{BranchError, BranchRegistry};
use crate::cache_tree::cache_tree_update;
use crate::commit_builder::CommitBuilder;
use crate::crypto::DerivedKeys;
use crate::index::{index_add, read_index_from, update_index};
use crate::lock::FileLock;
use crate::object_id::ObjectId;
use crate::object_store::ObjectStore;
use crate::repo_manager::GcCoordinator;
use crate::repo_path::RepoPath;
use crate::tree_walker::{apply_plan, oneway_merge, scan_for_locked_files, twoway_merge};

/// Takes the advisory lock guarding `index_path` against another process
/// mutating the same index/worktree concurrently, mirroring the teacher's
/// `working_copy.lock` taken by `LocalWorkingCopy::start_mutation`.
fn lock_index(index_path: &Path) -> FileLock {
    FileLock::lock(index_path.with_extension("lock"))
}

#[derive(Debug, Error)]
pub enum OpsError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("branch error: {0}")]
    Branch(#[from] BranchError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot commit: index has unresolved merge conflicts")]
    Unmerged,
    #[error("{} file(s) are open in another program and cannot be checked out", .0.len())]
    LockedFiles(Vec<RepoPath>),
}

pub type OpsResult<T> = Result<T, OpsError>;

/// Stages every change under `path_prefix` into the index (§4.D) and commits
/// the result as a new child of `parent`, creating `branch_name` if it does
/// not exist yet or moving it forward otherwise. Refuses to commit over an
/// unresolved three-way merge.
#[allow(clippy::too_many_arguments)]
pub fn stage_and_commit(
    store: &ObjectStore,
    branches: &BranchRegistry,
    gc: &GcCoordinator,
    repo_id: &str,
    branch_name: &str,
    index_path: &Path,
    worktree: &Path,
    path_prefix: &RepoPath,
    parent: Option<&CommitId>,
    creator_name: &str,
    creator_email: &str,
    description: impl Into<String>,
    crypt: Option<&DerivedKeys>,
) -> OpsResult<CommitId> {
    let _lock = lock_index(index_path);
    index_add(index_path, worktree, path_prefix, store, crypt, gc)?;
    let index = read_index_from(index_path)?;
    if index.is_unmerged() {
        return Err(OpsError::Unmerged);
    }

    let tree_id = cache_tree_update(&index, store)?;
    let mut builder = CommitBuilder::new(repo_id, tree_id, creator_name, creator_email);
    builder.set_description(description);
    if let Some(parent) = parent {
        builder.set_parent(parent.clone());
    }
    let commit_id = builder.write(store)?;

    match branches.create(repo_id, branch_name, &commit_id) {
        Ok(()) => {}
        Err(BranchError::AlreadyExists(_)) => branches.update(repo_id, branch_name, &commit_id)?,
        Err(e) => return Err(e.into()),
    }
    Ok(commit_id)
}

/// Checks out `target` into `worktree`, reconciling it against `head` (the
/// commit the index is currently believed to match) via [`twoway_merge`].
/// Returns the paths left conflicted, which a caller must resolve before the
/// checkout can be considered complete.
pub fn checkout_commit(
    store: &ObjectStore,
    index_path: &Path,
    worktree: &Path,
    head: &CommitId,
    target: &CommitId,
    crypt: Option<&DerivedKeys>,
) -> OpsResult<Vec<RepoPath>> {
    let _lock = lock_index(index_path);
    let head_commit = store.read_commit(head)?;
    let target_commit = store.read_commit(target)?;
    let mut index = read_index_from(index_path)?;
    let plan = twoway_merge(store, &index, &head_commit.root_tree_id, &target_commit.root_tree_id)?;
    let locked = scan_for_locked_files(&plan, worktree);
    if !locked.is_empty() {
        return Err(OpsError::LockedFiles(locked));
    }
    let conflicts = apply_plan(&plan, worktree, store, crypt, &mut index, None)?;
    update_index(&index, index_path)?;
    Ok(conflicts)
}

/// Reverts `branch_name` to `target`'s content: forces the worktree and
/// index to match `target`'s tree exactly via [`oneway_merge`], then records
/// a new commit with that same tree, parented on the branch's current head.
/// History is never rewritten — reverting only ever adds a commit.
#[allow(clippy::too_many_arguments)]
pub fn revert_to(
    store: &ObjectStore,
    branches: &BranchRegistry,
    repo_id: &str,
    branch_name: &str,
    index_path: &Path,
    worktree: &Path,
    target: &CommitId,
    creator_name: &str,
    creator_email: &str,
    crypt: Option<&DerivedKeys>,
) -> OpsResult<CommitId> {
    let _lock = lock_index(index_path);
    let current_head = branches.get(repo_id, branch_name)?;
    let target_commit = store.read_commit(target)?;

    let mut index = read_index_from(index_path)?;
    let plan = oneway_merge(store, &index, &target_commit.root_tree_id)?;
    apply_plan(&plan, worktree, store, crypt, &mut index, None)?;
    update_index(&index, index_path)?;

    let mut builder = CommitBuilder::for_new_commit_from(&target_commit, creator_name, creator_email);
    builder
        .set_tree(target_commit.root_tree_id.clone())
        .set_parent(current_head)
        .set_description(format!("Reverted repo to status at {}", target.hex()));
    let commit_id = builder.write(store)?;
    branches.update(repo_id, branch_name, &commit_id)?;
    Ok(commit_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FileMode;
    use std::fs;

    fn new_env() -> (tempfile::TempDir, ObjectStore, BranchRegistry, GcCoordinator) {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::init(dir.path().join("objects")).unwrap();
        let branches = BranchRegistry::init(dir.path().join("branches")).unwrap();
        (dir, store, branches, GcCoordinator::new())
    }

    #[test]
    fn stage_and_commit_creates_first_commit_with_no_parent() {
        let (dir, store, branches, gc) = new_env();
        let worktree = dir.path().join("wt");
        fs::create_dir_all(&worktree).unwrap();
        fs::write(worktree.join("a.txt"), b"hello").unwrap();
        let index_path = dir.path().join("index");

        let commit_id = stage_and_commit(
            &store, &branches, &gc, "repo1", "master", &index_path, &worktree, &RepoPath::root(),
            None, "me", "me@example.com", "initial commit", None,
        )
        .unwrap();

        let commit = store.read_commit(&commit_id).unwrap();
        assert!(commit.parent_id.is_none());
        let tree = store.read_tree(&commit.root_tree_id).unwrap();
        assert_eq!(tree.entries.len(), 1);
        assert_eq!(tree.entries[0].name, "a.txt");
        assert_eq!(branches.get("repo1", "master").unwrap(), commit_id);
    }

    #[test]
    fn checkout_commit_writes_target_content() {
        let (dir, store, _branches, _gc) = new_env();
        let worktree = dir.path().join("wt");
        fs::create_dir_all(&worktree).unwrap();
        let index_path = dir.path().join("index");

        fs::write(worktree.join("a.txt"), b"one").unwrap();
        let blob1 = store.index_blocks(&worktree.join("a.txt"), None).unwrap();
        let tree1 = store
            .write_tree(&crate::backend::Tree {
                entries: vec![crate::backend::TreeEntry {
                    name: "a.txt".to_string(),
                    mode: FileMode::Regular,
                    id: crate::backend::TreeValueId::Blob(blob1),
                }],
            })
            .unwrap();
        let c1 = CommitBuilder::new("repo1", tree1, "me", "me@example.com").write(&store).unwrap();

        fs::write(worktree.join("a.txt"), b"two").unwrap();
        let blob2 = store.index_blocks(&worktree.join("a.txt"), None).unwrap();
        let tree2 = store
            .write_tree(&crate::backend::Tree {
                entries: vec![crate::backend::TreeEntry {
                    name: "a.txt".to_string(),
                    mode: FileMode::Regular,
                    id: crate::backend::TreeValueId::Blob(blob2),
                }],
            })
            .unwrap();
        let mut builder = CommitBuilder::new("repo1", tree2, "me", "me@example.com");
        builder.set_parent(c1.clone());
        let c2 = builder.write(&store).unwrap();

        // Check out c1 first so the index matches head before reconciling to c2.
        let mut index = crate::index::IndexState::default();
        let plan = oneway_merge(&store, &index, &tree1).unwrap();
        apply_plan(&plan, &worktree, &store, None, &mut index, None).unwrap();
        update_index(&index, &index_path).unwrap();

        checkout_commit(&store, &index_path, &worktree, &c1, &c2, None).unwrap();
        assert_eq!(fs::read(worktree.join("a.txt")).unwrap(), b"two");
    }

    #[test]
    fn revert_to_restores_prior_content_and_adds_a_commit() {
        let (dir, store, branches, gc) = new_env();
        let worktree = dir.path().join("wt");
        fs::create_dir_all(&worktree).unwrap();
        let index_path = dir.path().join("index");

        fs::write(worktree.join("x"), b"1").unwrap();
        let c1 = stage_and_commit(
            &store, &branches, &gc, "repo1", "master", &index_path, &worktree, &RepoPath::root(),
            None, "me", "me@example.com", "x=1", None,
        )
        .unwrap();

        fs::write(worktree.join("x"), b"2").unwrap();
        let c2 = stage_and_commit(
            &store, &branches, &gc, "repo1", "master", &index_path, &worktree, &RepoPath::root(),
            Some(&c1), "me", "me@example.com", "x=2", None,
        )
        .unwrap();

        let c3 = revert_to(&store, &branches, "repo1", "master", &index_path, &worktree, &c1, "me", "me@example.com", None).unwrap();

        assert_eq!(fs::read(worktree.join("x")).unwrap(), b"1");
        let commit3 = store.read_commit(&c3).unwrap();
        assert_eq!(commit3.parent_id, Some(c2));
        let commit1 = store.read_commit(&c1).unwrap();
        assert_eq!(commit3.root_tree_id, commit1.root_tree_id);
        assert!(commit3.description.starts_with("Reverted repo to status at "));
    }
}
