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

//! The staging index: an ordered, path-sorted sequence of cache entries
//! persisted to a per-repo file. Mirrors the role `local_working_copy`'s
//! `FileStatesMap` plays for the working copy, but the unit of storage here
//! is the whole index file rather than per-directory proto state, matching
//! a git-style single flat index.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, BackendResult, BlobId, FileMode};
use crate::crypto::DerivedKeys;
use crate::file_util::write_atomic;
use crate::ignore::is_ignored_filename;
use crate::object_store::ObjectStore;
use crate::repo_manager::GcCoordinator;
use crate::repo_path::RepoPath;

const INDEX_MAGIC: [u8; 4] = *b"RSIX";
const INDEX_VERSION: u32 = 1;

macro_rules! bitflags_lite {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $repr:ty {
            $(const $flag:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
        pub struct $name($repr);

        impl $name {
            $(pub const $flag: $name = $name($value);)*

            pub fn empty() -> Self {
                $name(0)
            }

            pub fn contains(&self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }
        }
    };
}

bitflags_lite! {
    /// Per-entry flag bits. `Remove` marks an entry for the next compaction
    /// pass; `Update`/`WtRemove` are set by the tree walker while planning a
    /// checkout and consumed by `update_worktree`.
    pub struct EntryFlags: u8 {
        const REMOVE = 0b001;
        const UPDATE = 0b010;
        const WT_REMOVE = 0b100;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub path: RepoPathOnDisk,
    pub mode: FileMode,
    pub blob_id: BlobId,
    pub ctime_millis: i64,
    pub mtime_millis: i64,
    pub size: u64,
    pub flags: EntryFlags,
    /// 0 when merged; 1/2/3 identify a conflict side while unmerged.
    pub stage: u8,
}

/// `RepoPath` has no `Serialize` impl of its own (it is reconstructed via
/// `parse` everywhere else); the index file stores its internal string form
/// directly so the on-disk format doesn't depend on `serde` reaching into
/// another module's private field.
pub type RepoPathOnDisk = String;

#[derive(Debug, Clone, Default)]
pub struct IndexState {
    /// Sorted by path, unique by path; invariants (i)/(ii) of the index.
    entries: Vec<CacheEntry>,
}

impl IndexState {
    pub fn entries(&self) -> &[CacheEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Binary search by path: `Ok(pos)` for an exact match, `Err(pos)` for
    /// the position a new entry with that path would be inserted at.
    pub fn index_name_pos(&self, path: &RepoPath) -> Result<usize, usize> {
        self.entries
            .binary_search_by(|e| e.path.as_str().cmp(path.as_internal_str()))
    }

    pub fn get(&self, path: &RepoPath) -> Option<&CacheEntry> {
        self.index_name_pos(path).ok().map(|i| &self.entries[i])
    }

    /// True if any entry has an unresolved conflict stage; `commit` must
    /// refuse to proceed while this holds.
    pub fn is_unmerged(&self) -> bool {
        self.entries.iter().any(|e| e.stage != 0)
    }

    fn upsert(&mut self, entry: CacheEntry) {
        match self.index_name_pos_str(&entry.path) {
            Ok(pos) => self.entries[pos] = entry,
            Err(pos) => self.entries.insert(pos, entry),
        }
    }

    fn index_name_pos_str(&self, path: &str) -> Result<usize, usize> {
        self.entries.binary_search_by(|e| e.path.as_str().cmp(path))
    }

    pub fn remove_file_from_index(&mut self, path: &RepoPath) {
        if let Ok(pos) = self.index_name_pos(path) {
            self.entries[pos].flags.insert(EntryFlags::REMOVE);
        }
    }

    /// Drops every entry marked `REMOVE`, per invariant (iii).
    pub fn remove_marked_cache_entries(&mut self) {
        self.entries.retain(|e| !e.flags.contains(EntryFlags::REMOVE));
    }

    /// Inserts or overwrites the entry at `entry.path`, used by the tree
    /// walker when it writes a fresh blob into the worktree during checkout.
    pub fn set_entry(&mut self, entry: CacheEntry) {
        self.upsert(entry);
    }

    pub fn add_empty_dir_to_index(&mut self, path: &RepoPath) {
        self.upsert(CacheEntry {
            path: path.as_internal_str().to_string(),
            mode: FileMode::EmptyDir,
            blob_id: BlobId::from_sha1([0u8; 20]),
            ctime_millis: 0,
            mtime_millis: 0,
            size: 0,
            flags: EntryFlags::empty(),
            stage: 0,
        });
    }
}

/// Loads the index at `path`, tolerating a missing file as the empty
/// "unborn" index a freshly created repo starts with.
pub fn read_index_from(path: &Path) -> BackendResult<IndexState> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(IndexState::default()),
        Err(e) => return Err(e.into()),
    };
    if bytes.len() < 8 || bytes[0..4] != INDEX_MAGIC[..] {
        return Err(BackendError::Other("index file missing magic header".to_string()));
    }
    let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    if version != INDEX_VERSION {
        return Err(BackendError::Other(format!("unsupported index version {version}")));
    }
    let entries: Vec<CacheEntry> =
        bincode::deserialize(&bytes[8..]).map_err(|e| BackendError::Other(e.to_string()))?;
    Ok(IndexState { entries })
}

/// Writes `state` to `path` atomically (temp file + fsync + rename), so a
/// reader never observes a torn index (invariant #8).
pub fn update_index(state: &IndexState, path: &Path) -> BackendResult<()> {
    let mut bytes = Vec::with_capacity(8 + state.entries.len() * 64);
    bytes.extend_from_slice(&INDEX_MAGIC);
    bytes.extend_from_slice(&INDEX_VERSION.to_le_bytes());
    bincode::serialize_into(&mut bytes, &state.entries).map_err(|e| BackendError::Other(e.to_string()))?;
    write_atomic(path, &bytes)?;
    Ok(())
}

/// Stat fields compared against a cache entry to decide whether the blob
/// must be re-hashed.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub ctime_millis: i64,
    pub mtime_millis: i64,
    pub size: u64,
    pub executable: bool,
}

#[cfg(unix)]
pub fn stat_file(metadata: &fs::Metadata) -> FileStat {
    use std::os::unix::fs::MetadataExt as _;
    FileStat {
        ctime_millis: metadata.ctime() * 1000 + metadata.ctime_nsec() / 1_000_000,
        mtime_millis: metadata.mtime() * 1000 + metadata.mtime_nsec() / 1_000_000,
        size: metadata.size(),
        executable: metadata.permissions().mode() & 0o111 != 0,
    }
}

#[cfg(not(unix))]
pub fn stat_file(metadata: &fs::Metadata) -> FileStat {
    let to_millis = |t: std::io::Result<std::time::SystemTime>| {
        t.ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    };
    FileStat {
        ctime_millis: to_millis(metadata.created()),
        mtime_millis: to_millis(metadata.modified()),
        size: metadata.len(),
        executable: false,
    }
}

/// Inserts or refreshes the entry for `relpath`. If an entry already exists
/// at that path with matching stat fields, the existing blob id is kept and
/// the file is not re-read; otherwise `store.index_blocks` computes a fresh
/// blob id.
pub fn add_to_index(
    state: &mut IndexState,
    relpath: &RepoPath,
    full_path: &Path,
    stat: FileStat,
    crypt: Option<&DerivedKeys>,
    store: &ObjectStore,
) -> BackendResult<()> {
    if let Some(existing) = state.get(relpath) {
        if existing.mode != FileMode::EmptyDir
            && existing.ctime_millis == stat.ctime_millis
            && existing.mtime_millis == stat.mtime_millis
            && existing.size == stat.size
        {
            return Ok(());
        }
    }
    let blob_id = store.index_blocks(full_path, crypt)?;
    let mode = if stat.executable {
        FileMode::Executable
    } else {
        FileMode::Regular
    };
    state.upsert(CacheEntry {
        path: relpath.as_internal_str().to_string(),
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

/// Marks REMOVE on every existing entry under `path_prefix` whose worktree
/// counterpart is gone, of the wrong type, or (for a directory sentinel) no
/// longer empty, then compacts.
pub fn remove_deleted(state: &mut IndexState, worktree: &Path, path_prefix: &RepoPath) {
    let stale: Vec<RepoPath> = state
        .entries()
        .iter()
        .filter_map(|e| RepoPath::parse(&e.path))
        .filter(|p| p.starts_with(path_prefix))
        .filter(|p| {
            let fs_path = p.to_fs_path(worktree);
            match fs::symlink_metadata(&fs_path) {
                Ok(meta) => {
                    let entry = state.get(p).expect("path came from state.entries()");
                    match entry.mode {
                        FileMode::EmptyDir => {
                            !meta.is_dir() || fs::read_dir(&fs_path).map(|mut d| d.next().is_some()).unwrap_or(true)
                        }
                        FileMode::Regular | FileMode::Executable => !meta.is_file(),
                    }
                }
                Err(_) => true,
            }
        })
        .collect();
    for path in &stale {
        state.remove_file_from_index(path);
    }
    state.remove_marked_cache_entries();
}

/// Recursively stages every tracked-or-trackable file under `path_prefix`:
/// walks the worktree, skips ignored names, hashes new/changed files, adds
/// empty-directory sentinels, then removes entries whose worktree file is
/// gone. Spin-waits (via the GC coordinator's reader lock) until no GC
/// sweep is holding the object store's write lock, since `index_add` and GC
/// must never run concurrently against the same store.
pub fn index_add(
    index_path: &Path,
    worktree: &Path,
    path_prefix: &RepoPath,
    store: &ObjectStore,
    crypt: Option<&DerivedKeys>,
    gc: &GcCoordinator,
) -> BackendResult<()> {
    let _gc_guard = gc.begin_stage();

    if !worktree.is_dir() {
        return Err(BackendError::Other(format!("{worktree:?} is not a valid worktree")));
    }

    let mut state = read_index_from(index_path)?;
    let base_dir = path_prefix.to_fs_path(worktree);
    if base_dir.is_dir() {
        walk_and_stage(&mut state, worktree, path_prefix, &base_dir, store, crypt)?;
    }
    remove_deleted(&mut state, worktree, path_prefix);
    update_index(&state, index_path)
}

fn walk_and_stage(
    state: &mut IndexState,
    worktree: &Path,
    repo_dir: &RepoPath,
    fs_dir: &Path,
    store: &ObjectStore,
    crypt: Option<&DerivedKeys>,
) -> BackendResult<bool> {
    let mut saw_entry = false;
    let mut read_dir: Vec<_> = fs::read_dir(fs_dir)?.collect::<Result<_, _>>()?;
    read_dir.sort_by_key(|e| e.file_name());
    for entry in read_dir {
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_ignored_filename(&name) {
            continue;
        }
        let child_repo_path = repo_dir.join(&name);
        let child_fs_path = entry.path();
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            let had_children = walk_and_stage(state, worktree, &child_repo_path, &child_fs_path, store, crypt)?;
            if !had_children {
                state.add_empty_dir_to_index(&child_repo_path);
            }
            saw_entry = true;
        } else if metadata.is_file() {
            let stat = stat_file(&metadata);
            add_to_index(state, &child_repo_path, &child_fs_path, stat, crypt, store)?;
            saw_entry = true;
        }
    }
    Ok(saw_entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(n: u8) -> BlobId {
        BlobId::from_sha1([n; 20])
    }

    fn entry(path: &str, blob_id: BlobId) -> CacheEntry {
        CacheEntry {
            path: path.to_string(),
            mode: FileMode::Regular,
            blob_id,
            ctime_millis: 1,
            mtime_millis: 1,
            size: 3,
            flags: EntryFlags::empty(),
            stage: 0,
        }
    }

    #[test]
    fn index_name_pos_finds_exact_and_insertion_point() {
        let mut state = IndexState::default();
        state.upsert(entry("b.txt", blob(1)));
        state.upsert(entry("d.txt", blob(2)));
        assert_eq!(state.index_name_pos(&RepoPath::parse("b.txt").unwrap()), Ok(0));
        assert_eq!(state.index_name_pos(&RepoPath::parse("c.txt").unwrap()), Err(1));
    }

    #[test]
    fn remove_then_compact_drops_entry() {
        let mut state = IndexState::default();
        state.upsert(entry("a.txt", blob(1)));
        state.remove_file_from_index(&RepoPath::parse("a.txt").unwrap());
        assert_eq!(state.entries().len(), 1);
        state.remove_marked_cache_entries();
        assert!(state.is_empty());
    }

    #[test]
    fn is_unmerged_detects_conflict_stage() {
        let mut state = IndexState::default();
        let mut e = entry("a.txt", blob(1));
        e.stage = 2;
        state.upsert(e);
        assert!(state.is_unmerged());
    }

    #[test]
    fn read_index_from_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = read_index_from(&dir.path().join("no-such-index")).unwrap();
        assert!(state.is_empty());
    }

    #[test]
    fn update_index_then_read_back_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index");
        let mut state = IndexState::default();
        state.upsert(entry("a.txt", blob(1)));
        update_index(&state, &path).unwrap();
        let reloaded = read_index_from(&path).unwrap();
        assert_eq!(reloaded.entries(), state.entries());
    }
}
