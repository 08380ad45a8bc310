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

//! Derives the commit-ready tree graph from the index. The root hash this
//! produces is deterministic in the sorted (path, mode, blob_id) tuples of
//! the index and nothing else — insertion order, traversal order, or any
//! other property of how the index got to its current state must not
//! affect it.

use std::collections::BTreeMap;

use crate::backend::{BackendResult, FileMode, Tree, TreeEntry, TreeId, TreeValueId};
use crate::index::{CacheEntry, IndexState};
use crate::object_store::ObjectStore;
use crate::repo_path::RepoPath;

enum Node {
    Blob { mode: FileMode, id: crate::backend::BlobId },
    EmptyDir,
    Dir(BTreeMap<String, Node>),
}

impl Node {
    fn dir_mut(children: &mut BTreeMap<String, Node>, name: &str) -> &mut BTreeMap<String, Node> {
        match children
            .entry(name.to_string())
            .or_insert_with(|| Node::Dir(BTreeMap::new()))
        {
            Node::Dir(map) => map,
            _ => unreachable!("path component collides with a file entry"),
        }
    }
}

fn insert_entry(root: &mut BTreeMap<String, Node>, entry: &CacheEntry) {
    let path = RepoPath::parse(&entry.path).expect("index entries hold valid repo paths");
    let components: Vec<&str> = path.components().collect();
    let mut cursor = root;
    for component in &components[..components.len().saturating_sub(1)] {
        cursor = Node::dir_mut(cursor, component);
    }
    let Some(&leaf_name) = components.last() else {
        return;
    };
    let node = match entry.mode {
        FileMode::EmptyDir => Node::EmptyDir,
        FileMode::Regular | FileMode::Executable => Node::Blob {
            mode: entry.mode,
            id: entry.blob_id.clone(),
        },
    };
    cursor.insert(leaf_name.to_string(), node);
}

fn write_dir(children: &BTreeMap<String, Node>, store: &ObjectStore) -> BackendResult<TreeId> {
    let mut entries = Vec::with_capacity(children.len());
    for (name, node) in children {
        let (mode, id) = match node {
            Node::Blob { mode, id } => (*mode, TreeValueId::Blob(id.clone())),
            Node::EmptyDir => (FileMode::EmptyDir, TreeValueId::Tree(write_dir(&BTreeMap::new(), store)?)),
            Node::Dir(map) => (FileMode::Regular, TreeValueId::Tree(write_dir(map, store)?)),
        };
        entries.push(TreeEntry {
            name: name.clone(),
            mode,
            id,
        });
    }
    store.write_tree(&Tree { entries })
}

/// Builds the tree graph for `index`'s current entries and returns the root
/// tree id, which becomes a commit's `root_tree_id`.
pub fn cache_tree_update(index: &IndexState, store: &ObjectStore) -> BackendResult<TreeId> {
    let mut root: BTreeMap<String, Node> = BTreeMap::new();
    for entry in index.entries() {
        insert_entry(&mut root, entry);
    }
    write_dir(&root, store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::EntryFlags;

    fn new_store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::init(dir.path().join("objects")).unwrap();
        (dir, store)
    }

    fn entry(path: &str, mode: FileMode, blob: u8) -> CacheEntry {
        CacheEntry {
            path: path.to_string(),
            mode,
            blob_id: crate::backend::BlobId::from_sha1([blob; 20]),
            ctime_millis: 0,
            mtime_millis: 0,
            size: 0,
            flags: EntryFlags::empty(),
            stage: 0,
        }
    }

    #[test]
    fn identical_entries_in_different_insertion_order_produce_same_root() {
        let (_dir, store) = new_store();

        let mut trie_a = BTreeMap::new();
        insert_entry(&mut trie_a, &entry("b/c.txt", FileMode::Regular, 1));
        insert_entry(&mut trie_a, &entry("a.txt", FileMode::Regular, 2));

        let mut trie_b = BTreeMap::new();
        insert_entry(&mut trie_b, &entry("a.txt", FileMode::Regular, 2));
        insert_entry(&mut trie_b, &entry("b/c.txt", FileMode::Regular, 1));

        let root_a = write_dir(&trie_a, &store).unwrap();
        let root_b = write_dir(&trie_b, &store).unwrap();
        assert_eq!(root_a, root_b);
    }

    #[test]
    fn empty_dir_sentinel_produces_tree_entry_with_no_children() {
        let (_dir, store) = new_store();
        let mut trie = BTreeMap::new();
        insert_entry(&mut trie, &entry("empty", FileMode::EmptyDir, 0));
        let root_id = write_dir(&trie, &store).unwrap();
        let tree = store.read_tree(&root_id).unwrap();
        assert_eq!(tree.entries.len(), 1);
        assert_eq!(tree.entries[0].mode, FileMode::EmptyDir);
        match &tree.entries[0].id {
            TreeValueId::Tree(id) => assert!(store.read_tree(id).unwrap().is_empty()),
            TreeValueId::Blob(_) => panic!("expected a tree, not a blob"),
        }
    }

    #[test]
    fn nested_directories_produce_sorted_subtree() {
        let (_dir, store) = new_store();
        let mut trie = BTreeMap::new();
        insert_entry(&mut trie, &entry("dir/z.txt", FileMode::Regular, 1));
        insert_entry(&mut trie, &entry("dir/a.txt", FileMode::Regular, 2));
        let root_id = write_dir(&trie, &store).unwrap();
        let root = store.read_tree(&root_id).unwrap();
        assert_eq!(root.entries.len(), 1);
        let TreeValueId::Tree(dir_id) = &root.entries[0].id else {
            panic!("expected a subtree");
        };
        let dir = store.read_tree(dir_id).unwrap();
        let names: Vec<&str> = dir.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "z.txt"]);
    }
}
