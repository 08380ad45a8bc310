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

//! Commit DAG traversal: the commit manager's visitor-based history walk
//! and merge-base (lowest common ancestor) resolution.

use std::collections::{HashSet, VecDeque};

use crate::backend::{Commit, CommitId};
use crate::object_store::ObjectStore;

fn parent_ids(commit: &Commit) -> impl Iterator<Item = &CommitId> {
    commit.parent_id.iter().chain(commit.second_parent_id.iter())
}

/// Loads a commit's direct parents as `(CommitId, Commit)` pairs, silently
/// skipping ids that fail to load (a corrupt repo should not make history
/// traversal panic).
fn load_parents(store: &ObjectStore, commit: &Commit) -> Vec<(CommitId, Commit)> {
    parent_ids(commit)
        .filter_map(|id| store.read_commit(id).ok().map(|c| (id.clone(), c)))
        .collect()
}

/// Visits `head` and its ancestors in an unspecified but parents-after-
/// children order, calling `visit` on each. Traversal stops as soon as
/// `visit` returns `false` for a commit, leaving the rest of the DAG
/// unvisited — this is the "stop flag" the commit manager's callback-based
/// traversal exposes to callers doing bounded history scans.
pub fn walk_history(
    store: &ObjectStore,
    head: &CommitId,
    mut visit: impl FnMut(&CommitId, &Commit) -> bool,
) {
    let Ok(head_commit) = store.read_commit(head) else {
        return;
    };
    let mut work = VecDeque::from([(head.clone(), head_commit)]);
    let mut visited = HashSet::new();
    while let Some((id, commit)) = work.pop_front() {
        if !visited.insert(id.clone()) {
            continue;
        }
        if !visit(&id, &commit) {
            return;
        }
        work.extend(load_parents(store, &commit));
    }
}

/// Collects the full set of ancestor ids of `head`, including `head` itself.
fn ancestor_set(store: &ObjectStore, head: &CommitId) -> HashSet<CommitId> {
    let mut set = HashSet::new();
    walk_history(store, head, |id, _| {
        set.insert(id.clone());
        true
    });
    set
}

pub fn is_ancestor(store: &ObjectStore, maybe_ancestor: &CommitId, descendant: &CommitId) -> bool {
    if maybe_ancestor == descendant {
        return true;
    }
    let mut found = false;
    walk_history(store, descendant, |id, _| {
        if id == maybe_ancestor {
            found = true;
            return false;
        }
        true
    });
    found
}

/// Finds a merge base of `left` and `right`: a common ancestor that is not
/// itself an ancestor of any other common ancestor. A DAG can have more than
/// one such node; ties are broken by earliest creation time, per the merge
/// engine's "lowest common ancestor by any correct algorithm" contract.
pub fn merge_base(store: &ObjectStore, left: &CommitId, right: &CommitId) -> Option<CommitId> {
    let ancestors_left = ancestor_set(store, left);
    let ancestors_right = ancestor_set(store, right);
    let common: Vec<CommitId> = ancestors_left
        .intersection(&ancestors_right)
        .cloned()
        .collect();
    if common.is_empty() {
        return None;
    }

    let common_set: HashSet<&CommitId> = common.iter().collect();
    let mut candidates: Vec<CommitId> = common
        .iter()
        .filter(|&c| {
            // `c` is a lowest common ancestor iff no other common ancestor
            // is a (strict) descendant of `c`, i.e. `c` has no common
            // ancestor among its own proper ancestors.
            let mut dominated = false;
            walk_history(store, c, |id, _| {
                if id != c && common_set.contains(id) {
                    dominated = true;
                    return false;
                }
                true
            });
            !dominated
        })
        .cloned()
        .collect();

    candidates.sort_by_key(|id| {
        store
            .read_commit(id)
            .map(|c| c.ctime_millis)
            .unwrap_or(i64::MAX)
    });
    candidates.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit_builder::CommitBuilder;

    fn commit_after(
        store: &ObjectStore,
        parent: Option<&CommitId>,
        ctime: i64,
        desc: &str,
    ) -> CommitId {
        let empty_tree = store.write_tree(&Default::default()).unwrap();
        let mut builder = CommitBuilder::new("repo", empty_tree, "me", "me@example.com");
        builder.set_description(desc);
        builder.set_ctime_millis(ctime);
        if let Some(p) = parent {
            builder.set_parent(p.clone());
        }
        builder.write(store).unwrap()
    }

    #[test]
    fn merge_base_of_linear_history_is_shared_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::init(dir.path().to_path_buf()).unwrap();
        let c1 = commit_after(&store, None, 0, "c1");
        let c2 = commit_after(&store, Some(&c1), 1, "c2");
        let c3 = commit_after(&store, Some(&c1), 2, "c3 (other branch)");
        assert_eq!(merge_base(&store, &c2, &c3), Some(c1.clone()));
        assert!(is_ancestor(&store, &c1, &c2));
        assert!(!is_ancestor(&store, &c2, &c3));
    }

    #[test]
    fn merge_base_of_fast_forward_is_the_older_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::init(dir.path().to_path_buf()).unwrap();
        let c1 = commit_after(&store, None, 0, "c1");
        let c2 = commit_after(&store, Some(&c1), 1, "c2");
        assert_eq!(merge_base(&store, &c1, &c2), Some(c1));
    }
}
