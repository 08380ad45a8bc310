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

//! Branch registry: named mutable `(repo_id, branch_name) -> commit_id`
//! pointers, one file per branch so updates are atomic renames rather than
//! rows in the metadata database. The `RepoBranch` row that caches which
//! branch is the repo's head lives in [`crate::repo_manager`], since it is
//! metadata about the repo rather than about the branch itself.

use std::fs;
use std::path::PathBuf;

use thiserror::Error;

use crate::backend::CommitId;
use crate::file_util::write_atomic;
use crate::object_id::ObjectId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BranchError {
    #[error("branch {0:?} already exists")]
    AlreadyExists(String),
    #[error("branch {0:?} not found")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("branch {0:?} ref file is corrupt: {1}")]
    Corrupt(String, String),
}

pub type BranchResult<T> = Result<T, BranchError>;

impl From<std::io::Error> for BranchError {
    fn from(err: std::io::Error) -> Self {
        BranchError::Io(err.to_string())
    }
}

/// Stores every repo's branches under `root/<repo_id>/<branch_name>`, each
/// file holding the hex-encoded commit id it currently points at.
#[derive(Debug)]
pub struct BranchRegistry {
    root: PathBuf,
}

impl BranchRegistry {
    pub fn init(root: PathBuf) -> std::io::Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(BranchRegistry { root })
    }

    fn repo_dir(&self, repo_id: &str) -> PathBuf {
        self.root.join(repo_id)
    }

    fn branch_path(&self, repo_id: &str, branch_name: &str) -> PathBuf {
        self.repo_dir(repo_id).join(branch_name)
    }

    pub fn create(&self, repo_id: &str, branch_name: &str, commit_id: &CommitId) -> BranchResult<()> {
        let path = self.branch_path(repo_id, branch_name);
        if path.exists() {
            return Err(BranchError::AlreadyExists(branch_name.to_string()));
        }
        fs::create_dir_all(self.repo_dir(repo_id))?;
        write_atomic(&path, commit_id.hex().as_bytes())?;
        Ok(())
    }

    pub fn get(&self, repo_id: &str, branch_name: &str) -> BranchResult<CommitId> {
        let path = self.branch_path(repo_id, branch_name);
        let hex = fs::read_to_string(&path).map_err(|_| BranchError::NotFound(branch_name.to_string()))?;
        CommitId::from_hex(hex.trim())
            .map_err(|e| BranchError::Corrupt(branch_name.to_string(), e.to_string()))
    }

    /// Lists every branch for `repo_id` as `(name, commit_id)` pairs, sorted
    /// by name for a deterministic listing order.
    pub fn list(&self, repo_id: &str) -> BranchResult<Vec<(String, CommitId)>> {
        let dir = self.repo_dir(repo_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut branches = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let commit_id = self.get(repo_id, &name)?;
            branches.push((name, commit_id));
        }
        branches.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(branches)
    }

    /// Atomically swaps the branch's target commit. Readers of the branch
    /// file always observe either the old or the new commit id, never a
    /// torn value, since `write_atomic` renders the update as a rename.
    pub fn update(&self, repo_id: &str, branch_name: &str, commit_id: &CommitId) -> BranchResult<()> {
        let path = self.branch_path(repo_id, branch_name);
        if !path.exists() {
            return Err(BranchError::NotFound(branch_name.to_string()));
        }
        write_atomic(&path, commit_id.hex().as_bytes())?;
        Ok(())
    }

    pub fn delete(&self, repo_id: &str, branch_name: &str) -> BranchResult<()> {
        let path = self.branch_path(repo_id, branch_name);
        fs::remove_file(&path).map_err(|_| BranchError::NotFound(branch_name.to_string()))?;
        Ok(())
    }

    /// Removes every branch belonging to `repo_id`, part of the two-phase
    /// repo delete carried out by the repo manager.
    pub fn delete_repo(&self, repo_id: &str) -> std::io::Result<()> {
        let dir = self.repo_dir(repo_id);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit_id(n: u8) -> CommitId {
        CommitId::from_sha1([n; 20])
    }

    #[test]
    fn create_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BranchRegistry::init(dir.path().to_path_buf()).unwrap();
        registry.create("repo1", "master", &commit_id(1)).unwrap();
        assert_eq!(registry.get("repo1", "master").unwrap(), commit_id(1));
    }

    #[test]
    fn create_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BranchRegistry::init(dir.path().to_path_buf()).unwrap();
        registry.create("repo1", "master", &commit_id(1)).unwrap();
        assert_eq!(
            registry.create("repo1", "master", &commit_id(2)),
            Err(BranchError::AlreadyExists("master".to_string()))
        );
    }

    #[test]
    fn update_swaps_target() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BranchRegistry::init(dir.path().to_path_buf()).unwrap();
        registry.create("repo1", "master", &commit_id(1)).unwrap();
        registry.update("repo1", "master", &commit_id(2)).unwrap();
        assert_eq!(registry.get("repo1", "master").unwrap(), commit_id(2));
    }

    #[test]
    fn get_returns_corrupt_for_malformed_ref_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BranchRegistry::init(dir.path().to_path_buf()).unwrap();
        registry.create("repo1", "master", &commit_id(1)).unwrap();
        fs::write(registry.branch_path("repo1", "master"), b"not-hex-at-all").unwrap();
        assert!(matches!(registry.get("repo1", "master"), Err(BranchError::Corrupt(..))));
    }

    #[test]
    fn update_missing_branch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BranchRegistry::init(dir.path().to_path_buf()).unwrap();
        assert_eq!(
            registry.update("repo1", "master", &commit_id(1)),
            Err(BranchError::NotFound("master".to_string()))
        );
    }

    #[test]
    fn list_is_sorted_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BranchRegistry::init(dir.path().to_path_buf()).unwrap();
        registry.create("repo1", "zeta", &commit_id(1)).unwrap();
        registry.create("repo1", "alpha", &commit_id(2)).unwrap();
        let names: Vec<String> = registry.list("repo1").unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[test]
    fn delete_removes_branch() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BranchRegistry::init(dir.path().to_path_buf()).unwrap();
        registry.create("repo1", "master", &commit_id(1)).unwrap();
        registry.delete("repo1", "master").unwrap();
        assert_eq!(
            registry.get("repo1", "master"),
            Err(BranchError::NotFound("master".to_string()))
        );
    }
}
