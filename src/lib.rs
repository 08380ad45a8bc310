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

//! `reposync`: a content-addressed, versioned repository engine for a
//! file-synchronization client. Blobs, trees and commits live in an
//! [`object_store`], optionally encrypted; a git-style [`index`] stages
//! worktree changes before they are folded into a [`cache_tree`]; the
//! [`dag`] and [`merge_engine`] resolve branch history and three-way
//! merges; [`repo_manager`] and [`branch`] own the process-wide,
//! crash-recoverable metadata that ties it all together.

pub mod backend;
pub mod branch;
pub mod cache_tree;
pub mod commit_builder;
pub mod content_hash;
pub mod content_merge;
pub mod crypto;
pub mod dag;
pub mod file_util;
pub mod ignore;
pub mod index;
pub mod lock;
pub mod merge_engine;
pub mod object_id;
pub mod object_store;
pub mod ops;
pub mod repo_manager;
pub mod repo_path;
pub mod settings;
pub mod tree_walker;
pub mod worktree_diff;
