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

//! Content-addressed storage for blobs (as chunked files), trees and
//! commits.
//!
//! Every object is written to a temp file in the store directory first, then
//! persisted to its final content-addressed path; persisting is a no-op
//! (and still succeeds) when an object with that id is already present, so
//! concurrent writers racing to store the same bytes never conflict and the
//! file is durable before its hash is returned to the caller.

use std::fs;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tempfile::NamedTempFile;

use crate::backend::{BackendError, BackendResult, BlobId, ChunkId, Commit, CommitId, Tree, TreeId};
use crate::content_hash::sha1_hash;
use crate::crypto::DerivedKeys;
use crate::file_util::persist_content_addressed;
use crate::object_id::ObjectId;

/// Chunk boundary for blob splitting. Seafile-style content-defined
/// chunking would dedup better across edits, but fixed-size chunking is
/// simple, deterministic, and is all the spec asks for.
pub const CHUNK_SIZE: usize = 1 << 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FileManifest {
    size: u64,
    chunks: Vec<ChunkId>,
}

#[derive(Debug)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn init(root: PathBuf) -> BackendResult<Self> {
        for dir in ["chunks", "files", "trees", "commits"] {
            fs::create_dir_all(root.join(dir))?;
        }
        Ok(ObjectStore { root })
    }

    pub fn load(root: PathBuf) -> Self {
        ObjectStore { root }
    }

    fn chunk_path(&self, id: &ChunkId) -> PathBuf {
        self.root.join("chunks").join(id.hex())
    }

    fn file_path(&self, id: &BlobId) -> PathBuf {
        self.root.join("files").join(id.hex())
    }

    fn tree_path(&self, id: &TreeId) -> PathBuf {
        self.root.join("trees").join(id.hex())
    }

    fn commit_path(&self, id: &CommitId) -> PathBuf {
        self.root.join("commits").join(id.hex())
    }

    /// Reads `path` from disk, splits it into fixed-size chunks, optionally
    /// encrypts each chunk, and writes any chunk not already present. The
    /// object id returned is always the plaintext hash, so dedup works
    /// across users even when `crypt` differs between them.
    pub fn index_blocks(&self, path: &Path, crypt: Option<&DerivedKeys>) -> BackendResult<BlobId> {
        let mut file =
            File::open(path).map_err(|e| BackendError::IndexFailed(format!("open {path:?}: {e}")))?;
        let mut chunk_ids = Vec::new();
        let mut total_size = 0u64;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = read_full(&mut file, &mut buf)
                .map_err(|e| BackendError::IndexFailed(format!("read {path:?}: {e}")))?;
            if n == 0 {
                break;
            }
            total_size += n as u64;
            let chunk_id = self.write_chunk(&buf[..n], crypt)?;
            chunk_ids.push(chunk_id);
        }
        let manifest = FileManifest {
            size: total_size,
            chunks: chunk_ids,
        };
        self.write_manifest(&manifest)
    }

    fn write_chunk(&self, plaintext: &[u8], crypt: Option<&DerivedKeys>) -> BackendResult<ChunkId> {
        let id = ChunkId::from_sha1(Sha1::digest(plaintext).into());
        let dest = self.chunk_path(&id);
        if dest.exists() {
            return Ok(id);
        }
        let payload = match crypt {
            Some(keys) => crate::crypto::encrypt_chunk(keys, plaintext),
            None => plaintext.to_vec(),
        };
        let mut temp = NamedTempFile::new_in(&self.root)
            .map_err(|e| BackendError::IndexFailed(e.to_string()))?;
        temp.write_all(&payload)
            .map_err(|e| BackendError::IndexFailed(e.to_string()))?;
        persist_content_addressed(temp, &dest).map_err(|e| BackendError::IndexFailed(e.to_string()))?;
        Ok(id)
    }

    fn write_manifest(&self, manifest: &FileManifest) -> BackendResult<BlobId> {
        let bytes =
            bincode::serialize(manifest).map_err(|e| BackendError::IndexFailed(e.to_string()))?;
        let id = BlobId::from_sha1(Sha1::digest(&bytes).into());
        let dest = self.file_path(&id);
        if !dest.exists() {
            let mut temp = NamedTempFile::new_in(&self.root)
                .map_err(|e| BackendError::IndexFailed(e.to_string()))?;
            temp.write_all(&bytes)
                .map_err(|e| BackendError::IndexFailed(e.to_string()))?;
            persist_content_addressed(temp, &dest)
                .map_err(|e| BackendError::IndexFailed(e.to_string()))?;
        }
        Ok(id)
    }

    /// Reassembles and (if `crypt` is given) decrypts a blob's chunks,
    /// writing the plaintext to `dest`. `dest`'s parent directory must
    /// already exist.
    pub fn checkout_blob(
        &self,
        id: &BlobId,
        crypt: Option<&DerivedKeys>,
        dest: &Path,
    ) -> BackendResult<()> {
        let manifest = self.read_manifest(id)?;
        let temp = NamedTempFile::new_in(dest.parent().unwrap_or(Path::new(".")))?;
        {
            let mut out = temp.as_file();
            for chunk_id in &manifest.chunks {
                let raw = fs::read(self.chunk_path(chunk_id))
                    .map_err(|_| BackendError::NotFound)?;
                let plaintext = match crypt {
                    Some(keys) => crate::crypto::decrypt_chunk(keys, &raw)
                        .map_err(|e| BackendError::Other(e.to_string()))?,
                    None => raw,
                };
                out.write_all(&plaintext)?;
            }
        }
        temp.persist(dest)
            .map_err(|e| BackendError::Other(e.to_string()))?;
        Ok(())
    }

    pub(crate) fn read_manifest(&self, id: &BlobId) -> BackendResult<FileManifest> {
        let path = self.file_path(id);
        let bytes = fs::read(path).map_err(|_| BackendError::NotFound)?;
        bincode::deserialize(&bytes).map_err(|e| BackendError::Other(e.to_string()))
    }

    pub fn read_blob_to_vec(&self, id: &BlobId, crypt: Option<&DerivedKeys>) -> BackendResult<Vec<u8>> {
        let manifest = self.read_manifest(id)?;
        let mut out = Vec::with_capacity(manifest.size as usize);
        for chunk_id in &manifest.chunks {
            let raw = fs::read(self.chunk_path(chunk_id)).map_err(|_| BackendError::NotFound)?;
            let plaintext = match crypt {
                Some(keys) => crate::crypto::decrypt_chunk(keys, &raw)
                    .map_err(|e| BackendError::Other(e.to_string()))?,
                None => raw,
            };
            out.extend_from_slice(&plaintext);
        }
        Ok(out)
    }

    pub fn write_tree(&self, tree: &Tree) -> BackendResult<TreeId> {
        let id = TreeId::from_sha1(sha1_hash(tree));
        let dest = self.tree_path(&id);
        if !dest.exists() {
            let bytes = bincode::serialize(tree).map_err(|e| BackendError::Other(e.to_string()))?;
            let mut temp = NamedTempFile::new_in(&self.root)?;
            temp.write_all(&bytes)?;
            persist_content_addressed(temp, &dest).map_err(|e| BackendError::Other(e.to_string()))?;
        }
        Ok(id)
    }

    pub fn read_tree(&self, id: &TreeId) -> BackendResult<Tree> {
        let bytes = fs::read(self.tree_path(id)).map_err(|_| BackendError::NotFound)?;
        bincode::deserialize(&bytes).map_err(|e| BackendError::Other(e.to_string()))
    }

    pub fn write_commit(&self, commit: &Commit) -> BackendResult<CommitId> {
        let id = CommitId::from_sha1(sha1_hash(commit));
        let dest = self.commit_path(&id);
        if !dest.exists() {
            let bytes = bincode::serialize(commit).map_err(|e| BackendError::Other(e.to_string()))?;
            let mut temp = NamedTempFile::new_in(&self.root)?;
            temp.write_all(&bytes)?;
            persist_content_addressed(temp, &dest).map_err(|e| BackendError::Other(e.to_string()))?;
        }
        Ok(id)
    }

    pub fn read_commit(&self, id: &CommitId) -> BackendResult<Commit> {
        let bytes = fs::read(self.commit_path(id)).map_err(|_| BackendError::NotFound)?;
        bincode::deserialize(&bytes).map_err(|e| BackendError::Other(e.to_string()))
    }
}

/// Like `Read::read`, but keeps reading until the buffer is full or EOF,
/// since a single `read()` call may return fewer bytes than requested.
fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}
