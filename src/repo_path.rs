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

//! Slash-separated paths relative to a worktree root.
//!
//! A `RepoPath` never starts or ends with `/` and always uses `/` as the
//! component separator regardless of host platform, so that blob/tree ids
//! derived from it are portable between Windows and Unix worktrees.

use std::path::{Path, PathBuf};

use crate::content_hash::ContentHash;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, ContentHash)]
pub struct RepoPath(String);

impl std::fmt::Debug for RepoPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RepoPath").field(&self.0).finish()
    }
}

impl std::fmt::Display for RepoPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl RepoPath {
    pub fn root() -> Self {
        RepoPath(String::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Parses a `/`-separated relative path. Rejects `.`, `..` and empty
    /// components, since those would let the worktree walk escape itself.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim_matches('/');
        if value.is_empty() {
            return Some(Self::root());
        }
        for component in value.split('/') {
            if component.is_empty() || component == "." || component == ".." {
                return None;
            }
        }
        Some(RepoPath(value.to_string()))
    }

    pub fn as_internal_str(&self) -> &str {
        &self.0
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|c| !c.is_empty())
    }

    pub fn basename(&self) -> &str {
        self.components().last().unwrap_or("")
    }

    /// The direct parent directory, or `None` for the root.
    pub fn parent(&self) -> Option<RepoPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(i) => Some(RepoPath(self.0[..i].to_string())),
            None => Some(RepoPath::root()),
        }
    }

    pub fn join(&self, component: &str) -> RepoPath {
        if self.is_root() {
            RepoPath(component.to_string())
        } else {
            RepoPath(format!("{}/{}", self.0, component))
        }
    }

    pub fn starts_with(&self, base: &RepoPath) -> bool {
        if base.is_root() {
            return true;
        }
        self.0 == base.0 || self.0.starts_with(&format!("{}/", base.0))
    }

    pub fn to_fs_path(&self, workdir: &Path) -> PathBuf {
        let mut path = workdir.to_path_buf();
        for component in self.components() {
            path.push(component);
        }
        path
    }

    /// Depth below the root; used to sort by directory boundary in the
    /// cache-tree builder.
    pub fn depth(&self) -> usize {
        self.components().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_dotdot() {
        assert!(RepoPath::parse("a/../b").is_none());
        assert!(RepoPath::parse("./a").is_none());
    }

    #[test]
    fn parse_normalizes_slashes() {
        assert_eq!(RepoPath::parse("/a/b/").unwrap().as_internal_str(), "a/b");
    }

    #[test]
    fn starts_with_respects_boundaries() {
        let dir = RepoPath::parse("foo").unwrap();
        assert!(RepoPath::parse("foo/bar").unwrap().starts_with(&dir));
        assert!(!RepoPath::parse("foobar").unwrap().starts_with(&dir));
    }

    #[test]
    fn parent_of_top_level_is_root() {
        let p = RepoPath::parse("a.txt").unwrap();
        assert_eq!(p.parent(), Some(RepoPath::root()));
        assert_eq!(RepoPath::root().parent(), None);
    }
}
