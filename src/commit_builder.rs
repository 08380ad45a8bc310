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

//! Builds a new, immutable [`Commit`] and writes it to the object store.

use crate::backend::{BackendResult, Commit, CommitId, EncryptionSnapshot, TreeId};
use crate::object_store::ObjectStore;

#[derive(Debug, Clone)]
pub struct CommitBuilder {
    commit: Commit,
}

impl CommitBuilder {
    pub fn new(repo_id: &str, root_tree_id: TreeId, creator_name: &str, creator_email: &str) -> Self {
        CommitBuilder {
            commit: Commit {
                repo_id: repo_id.to_string(),
                root_tree_id,
                parent_id: None,
                second_parent_id: None,
                creator_name: creator_name.to_string(),
                creator_email: creator_email.to_string(),
                creator_session_id: String::new(),
                description: String::new(),
                ctime_millis: crate::backend::Timestamp::now().millis_since_epoch.0,
                repo_name: String::new(),
                repo_desc: String::new(),
                encryption: None,
            },
        }
    }

    /// Starts a new builder that carries over everything from `parent`
    /// except tree, description, and parentage — used when reverting to or
    /// rewriting a previous commit's content under a fresh id.
    pub fn for_new_commit_from(parent: &Commit, creator_name: &str, creator_email: &str) -> Self {
        let mut builder = Self::new(&parent.repo_id, parent.root_tree_id.clone(), creator_name, creator_email);
        builder.commit.repo_name = parent.repo_name.clone();
        builder.commit.repo_desc = parent.repo_desc.clone();
        builder.commit.encryption = parent.encryption.clone();
        builder
    }

    pub fn set_tree(&mut self, tree_id: TreeId) -> &mut Self {
        self.commit.root_tree_id = tree_id;
        self
    }

    pub fn set_parent(&mut self, parent_id: CommitId) -> &mut Self {
        self.commit.parent_id = Some(parent_id);
        self
    }

    pub fn set_second_parent(&mut self, parent_id: CommitId) -> &mut Self {
        self.commit.second_parent_id = Some(parent_id);
        self
    }

    pub fn set_description(&mut self, description: impl Into<String>) -> &mut Self {
        self.commit.description = description.into();
        self
    }

    pub fn set_creator_session_id(&mut self, session_id: impl Into<String>) -> &mut Self {
        self.commit.creator_session_id = session_id.into();
        self
    }

    pub fn set_ctime_millis(&mut self, millis: i64) -> &mut Self {
        self.commit.ctime_millis = millis;
        self
    }

    pub fn set_repo_snapshot(&mut self, name: impl Into<String>, desc: impl Into<String>) -> &mut Self {
        self.commit.repo_name = name.into();
        self.commit.repo_desc = desc.into();
        self
    }

    pub fn set_encryption(&mut self, snapshot: Option<EncryptionSnapshot>) -> &mut Self {
        self.commit.encryption = snapshot;
        self
    }

    pub fn write(&self, store: &ObjectStore) -> BackendResult<CommitId> {
        store.write_commit(&self.commit)
    }
}
