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

//! Core domain types shared by every component: object ids, the immutable
//! [`Tree`] and [`Commit`] records, and the error type object-store and
//! index operations propagate.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::object_id::{id_type, ObjectId};

id_type!(
    /// SHA-1 over a chunk's plaintext bytes. Stable across re-encryption or
    /// re-keying, which is what makes cross-user dedup of encrypted repos
    /// possible.
    #[derive(Serialize, Deserialize)]
    pub BlobId
);
id_type!(
    #[derive(Serialize, Deserialize)]
    pub TreeId
);
id_type!(
    #[derive(Serialize, Deserialize)]
    pub CommitId
);
id_type!(
    /// SHA-1 over one fixed-size chunk's plaintext. A [`BlobId`] is itself
    /// the hash of an ordered list of `ChunkId`s, so dedup happens at both
    /// the whole-file and the chunk level.
    #[derive(Serialize, Deserialize)]
    pub ChunkId
);

/// A repository identifier: a 36-character UUID (8-4-4-4-12 hex digits).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RepoId(String);

impl RepoId {
    pub fn new() -> Self {
        RepoId(uuid::Uuid::new_v4().to_string())
    }

    pub fn parse(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s).ok().map(|u| RepoId(u.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl Default for RepoId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RepoId").field(&self.0).finish()
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unix file mode recorded in a tree entry. Only the bits the engine cares
/// about are modeled; everything else collapses to `Regular`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, crate::content_hash::ContentHash,
)]
pub enum FileMode {
    Regular,
    Executable,
    /// A directory with no tracked children; see index invariant (iv).
    EmptyDir,
}

/// One entry in a [`Tree`]: a name plus the mode and object it refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, crate::content_hash::ContentHash)]
pub struct TreeEntry {
    pub name: String,
    pub mode: FileMode,
    pub id: TreeValueId,
}

/// The object a tree entry points at: either a subtree or a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, crate::content_hash::ContentHash)]
pub enum TreeValueId {
    Tree(TreeId),
    Blob(BlobId),
}

/// An immutable directory listing, keyed by SHA-1 over its canonical form.
/// Entries are always kept sorted by name; see cache-tree invariant #1.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, crate::content_hash::ContentHash)]
pub struct Tree {
    pub entries: Vec<TreeEntry>,
}

impl Tree {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, name: &str) -> Option<&TreeEntry> {
        // Entries are sorted, but the list is small enough per directory
        // that a binary search would only add risk of a bad comparator.
        self.entries.iter().find(|e| e.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MillisSinceEpoch(pub i64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub millis_since_epoch: MillisSinceEpoch,
    /// Time zone offset in minutes, matching `chrono`'s convention.
    pub tz_offset: i32,
}

impl Timestamp {
    pub fn now() -> Self {
        let now = chrono::offset::Local::now();
        Timestamp {
            millis_since_epoch: MillisSinceEpoch(now.timestamp_millis()),
            tz_offset: now.offset().local_minus_utc() / 60,
        }
    }
}

/// Encryption parameters recorded on the repo at the time of a commit, so
/// that checking out an old commit can see whether the repo was encrypted
/// when it was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, crate::content_hash::ContentHash)]
pub struct EncryptionSnapshot {
    pub enc_version: u32,
    pub magic: String,
}

/// An immutable commit node. Never mutated once written; referenced only by
/// [`CommitId`], which is the SHA-1 of this struct's canonical encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, crate::content_hash::ContentHash)]
pub struct Commit {
    pub repo_id: String,
    pub root_tree_id: TreeId,
    pub parent_id: Option<CommitId>,
    pub second_parent_id: Option<CommitId>,
    pub creator_name: String,
    pub creator_email: String,
    pub creator_session_id: String,
    pub description: String,
    pub ctime_millis: i64,
    pub repo_name: String,
    pub repo_desc: String,
    pub encryption: Option<EncryptionSnapshot>,
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum BackendError {
    #[error("object not found")]
    NotFound,
    #[error("index failed: {0}")]
    IndexFailed(String),
    #[error("backend error: {0}")]
    Other(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            BackendError::NotFound
        } else {
            BackendError::Other(err.to_string())
        }
    }
}
