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

//! Repository lifecycle: the metadata database, the in-memory repo map, and
//! the startup sequence that reconciles the two after a crash.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{info, warn};

use crate::backend::{BackendError, EncryptionSnapshot};
use crate::branch::{BranchError, BranchRegistry};
use crate::object_store::ObjectStore;

pub const DEFAULT_REPO_TOKEN: &str = "default-repo-token";

#[derive(Debug, Error)]
pub enum RepoManagerError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("branch error: {0}")]
    Branch(#[from] BranchError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("repo {0} not found")]
    NotFound(String),
    #[error("repo id prefix {0:?} is ambiguous or matches no repo")]
    AmbiguousPrefix(String),
    #[error("invalid value for property {0:?}: {1}")]
    InvalidProperty(String, String),
}

pub type RepoManagerResult<T> = Result<T, RepoManagerError>;

/// Coordinates access to the object store between GC and staging: GC takes
/// the writer side, `index_add` the reader side, replacing a polling loop
/// with a proper reader-writer primitive.
#[derive(Debug, Default)]
pub struct GcCoordinator {
    lock: RwLock<()>,
}

impl GcCoordinator {
    pub fn new() -> Self {
        GcCoordinator::default()
    }

    pub fn begin_stage(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn begin_gc(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone)]
pub struct Repo {
    pub repo_id: String,
    pub name: String,
    pub desc: String,
    pub encryption: Option<EncryptionSnapshot>,
    pub head_branch: String,
    pub worktree: Option<PathBuf>,
    pub auto_sync: bool,
    pub net_browsable: bool,
    pub relay_id: Option<String>,
    pub owner_email: Option<String>,
    pub access_token: Option<String>,
    pub is_corrupted: bool,
    pub index_corrupted: bool,
    pub delete_pending: bool,
}

impl Repo {
    fn new(repo_id: String) -> Self {
        Repo {
            repo_id,
            name: String::new(),
            desc: String::new(),
            encryption: None,
            head_branch: "master".to_string(),
            worktree: None,
            auto_sync: false,
            net_browsable: false,
            relay_id: None,
            owner_email: None,
            access_token: None,
            is_corrupted: false,
            index_corrupted: false,
            delete_pending: false,
        }
    }
}

/// A peer-role oracle over CCNet peer discovery, which this engine treats as
/// an external collaborator (spec: "CCNet peer discovery ... are treated as
/// interfaces the core consumes"). Supplied by the caller so `relay-id` can
/// be checked against a peer's actual role list without this crate owning
/// peer discovery itself.
pub trait PeerRoleLookup {
    /// Returns `true` if `peer_id` is a known peer whose role list contains
    /// `"MyRelay"`.
    fn is_my_relay(&self, peer_id: &str) -> bool;
}

fn is_well_formed_peer_id(value: &str) -> bool {
    value.len() == 40 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// A transient async-checkout record: removed once its done-callback fires.
#[derive(Debug)]
pub struct CheckoutTask {
    pub repo_id: String,
    pub worktree: PathBuf,
    pub total_files: u64,
    pub finished_files: AtomicU64,
    pub success: AtomicBool,
}

pub struct RepoManager {
    db: Mutex<Connection>,
    repos: RwLock<BTreeMap<String, Arc<Mutex<Repo>>>>,
    checkout_tasks: Mutex<HashMap<String, Arc<CheckoutTask>>>,
    pub gc: Arc<GcCoordinator>,
    branches: BranchRegistry,
    objects_root: PathBuf,
}

impl RepoManager {
    /// Opens (creating if absent) the metadata database at `db_path`, runs
    /// the startup sequence, and returns a manager with every recoverable
    /// repo registered in the in-memory map.
    pub fn open(db_path: &Path, objects_root: PathBuf, branches_root: PathBuf) -> RepoManagerResult<Self> {
        let conn = Connection::open(db_path)?;
        create_schema(&conn)?;
        let branches = BranchRegistry::init(branches_root)?;
        let manager = RepoManager {
            db: Mutex::new(conn),
            repos: RwLock::new(BTreeMap::new()),
            checkout_tasks: Mutex::new(HashMap::new()),
            gc: Arc::new(GcCoordinator::new()),
            branches,
            objects_root,
        };
        manager.drain_deleted()?;
        manager.load_all_repos()?;
        Ok(manager)
    }

    fn drain_deleted(&self) -> RepoManagerResult<()> {
        let db = self.db.lock().unwrap();
        let repo_ids: Vec<String> = db
            .prepare("SELECT repo_id FROM DeletedRepo")?
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        drop(db);
        for repo_id in repo_ids {
            self.reclaim_deleted_repo(&repo_id)?;
        }
        Ok(())
    }

    fn reclaim_deleted_repo(&self, repo_id: &str) -> RepoManagerResult<()> {
        let db = self.db.lock().unwrap();
        for table in [
            "Repo",
            "RepoBranch",
            "RepoLanToken",
            "RepoTmpToken",
            "RepoPasswd",
            "RepoKeys",
            "RepoProperty",
            "MergeInfo",
        ] {
            db.execute(&format!("DELETE FROM {table} WHERE repo_id = ?1"), params![repo_id])?;
        }
        db.execute("DELETE FROM DeletedRepo WHERE repo_id = ?1", params![repo_id])?;
        drop(db);
        let _ = self.branches.delete_repo(repo_id);
        Ok(())
    }

    fn load_all_repos(&self) -> RepoManagerResult<()> {
        let db = self.db.lock().unwrap();
        let repo_ids: Vec<String> = db
            .prepare("SELECT repo_id FROM Repo")?
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        drop(db);

        let object_store = ObjectStore::load(self.objects_root.clone());
        for repo_id in repo_ids {
            match self.load_repo(&repo_id, &object_store) {
                Ok(Some(repo)) => {
                    let mut repos = self.repos.write().unwrap();
                    repos.insert(repo_id, Arc::new(Mutex::new(repo)));
                }
                Ok(None) => {
                    warn!(repo_id, "repo corrupted at startup, removing");
                    self.mark_repo_deleted_locked(&repo_id)?;
                }
                Err(e) => {
                    warn!(repo_id, error = %e, "failed to load repo at startup, removing");
                    self.mark_repo_deleted_locked(&repo_id)?;
                }
            }
        }
        Ok(())
    }

    /// Loads one repo's state, returning `Ok(None)` if its head branch or
    /// head commit is missing (corrupt and should be removed).
    fn load_repo(&self, repo_id: &str, store: &ObjectStore) -> RepoManagerResult<Option<Repo>> {
        let mut repo = Repo::new(repo_id.to_string());

        let head_branch_name = self.get_head_branch_name(repo_id)?.unwrap_or_else(|| "master".to_string());
        let commit_id = match self.branches.get(repo_id, &head_branch_name) {
            Ok(id) => id,
            Err(_) => return Ok(None),
        };
        let commit = match store.read_commit(&commit_id) {
            Ok(c) => c,
            Err(_) => return Ok(None),
        };
        repo.head_branch = head_branch_name;
        repo.name = commit.repo_name;
        repo.desc = commit.repo_desc;
        repo.encryption = commit.encryption;

        self.load_keys_for(repo_id)?;
        self.load_properties_into(repo_id, &mut repo)?;
        Ok(Some(repo))
    }

    fn get_head_branch_name(&self, repo_id: &str) -> RepoManagerResult<Option<String>> {
        let db = self.db.lock().unwrap();
        let name: Option<String> = db
            .query_row(
                "SELECT branch_name FROM RepoBranch WHERE repo_id = ?1",
                params![repo_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name)
    }

    /// Step 4 of the startup sequence: if a password is cached but the
    /// derived keys are not (key-DB loss, or upgrade from an older schema),
    /// regenerate and persist them.
    fn load_keys_for(&self, repo_id: &str) -> RepoManagerResult<()> {
        let db = self.db.lock().unwrap();
        let passwd: Option<String> = db
            .query_row("SELECT passwd FROM RepoPasswd WHERE repo_id = ?1", params![repo_id], |r| r.get(0))
            .optional()?;
        let has_keys: bool = db
            .query_row("SELECT 1 FROM RepoKeys WHERE repo_id = ?1", params![repo_id], |r| r.get::<_, i64>(0))
            .optional()?
            .is_some();
        if let Some(passwd) = passwd {
            if !has_keys {
                let keys = crate::crypto::derive_keys(repo_id, &passwd, crate::crypto::CURRENT_ENC_VERSION);
                db.execute(
                    "INSERT INTO RepoKeys (repo_id, key, iv) VALUES (?1, ?2, ?3)",
                    params![repo_id, keys.key_hex(), keys.iv_hex()],
                )?;
                info!(repo_id, "regenerated encryption keys from cached password");
            }
        }
        Ok(())
    }

    fn load_properties_into(&self, repo_id: &str, repo: &mut Repo) -> RepoManagerResult<()> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare("SELECT key, value FROM RepoProperty WHERE repo_id = ?1")?;
        let rows: Vec<(String, String)> = stmt
            .query_map(params![repo_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;
        for (key, value) in rows {
            match key.as_str() {
                "auto-sync" => repo.auto_sync = value == "true",
                "worktree" => repo.worktree = Some(PathBuf::from(value)),
                "relay-id" => repo.relay_id = Some(value),
                "net-browsable" => repo.net_browsable = value == "true",
                "email" => repo.owner_email = Some(value),
                "token" => repo.access_token = Some(value),
                _ => {}
            }
        }
        Ok(())
    }

    pub fn create_new_repo(&self, name: &str, desc: &str) -> RepoManagerResult<String> {
        let repo_id = crate::backend::RepoId::new().to_string();
        {
            let db = self.db.lock().unwrap();
            db.execute("INSERT INTO Repo (repo_id) VALUES (?1)", params![repo_id])?;
        }
        let mut repo = Repo::new(repo_id.clone());
        repo.name = name.to_string();
        repo.desc = desc.to_string();
        self.repos.write().unwrap().insert(repo_id.clone(), Arc::new(Mutex::new(repo)));
        Ok(repo_id)
    }

    pub fn get_repo(&self, repo_id: &str) -> Option<Arc<Mutex<Repo>>> {
        let repos = self.repos.read().unwrap();
        let handle = repos.get(repo_id)?;
        if handle.lock().unwrap().delete_pending {
            return None;
        }
        Some(Arc::clone(handle))
    }

    /// Returns the unique repo whose id starts with `prefix`, or `None` if
    /// zero or more than one match.
    pub fn get_repo_prefix(&self, prefix: &str) -> Option<Arc<Mutex<Repo>>> {
        let repos = self.repos.read().unwrap();
        let mut matches = repos.iter().filter(|(id, _)| id.starts_with(prefix));
        let (_, only) = matches.next()?;
        if matches.next().is_some() {
            return None;
        }
        if only.lock().unwrap().delete_pending {
            return None;
        }
        Some(Arc::clone(only))
    }

    pub fn repo_exists(&self, repo_id: &str) -> bool {
        self.get_repo(repo_id).is_some()
    }

    /// Lists up to `limit` repo ids starting at the `start`th entry, in the
    /// manager's BST (ascending id) order.
    pub fn get_repo_list(&self, start: usize, limit: usize) -> Vec<String> {
        self.repos
            .read()
            .unwrap()
            .iter()
            .filter(|(_, r)| !r.lock().unwrap().delete_pending)
            .map(|(id, _)| id.clone())
            .skip(start)
            .take(limit)
            .collect()
    }

    pub fn mark_repo_deleted(&self, repo_id: &str) -> RepoManagerResult<()> {
        self.mark_repo_deleted_locked(repo_id)
    }

    fn mark_repo_deleted_locked(&self, repo_id: &str) -> RepoManagerResult<()> {
        {
            let db = self.db.lock().unwrap();
            db.execute(
                "INSERT OR IGNORE INTO DeletedRepo (repo_id) VALUES (?1)",
                params![repo_id],
            )?;
        }
        if let Some(handle) = self.repos.read().unwrap().get(repo_id) {
            handle.lock().unwrap().delete_pending = true;
        }
        Ok(())
    }

    /// Finishes a pending two-phase delete: removes every DB row, the
    /// branch directory, and the in-memory entry. Call after
    /// `mark_repo_deleted`, or let it run automatically at the next
    /// `RepoManager::open`.
    pub fn reclaim_deleted(&self, repo_id: &str) -> RepoManagerResult<()> {
        self.reclaim_deleted_repo(repo_id)?;
        self.repos.write().unwrap().remove(repo_id);
        Ok(())
    }

    /// Sets a `RepoProperty` row. `peer_roles` is consulted only for the
    /// `relay-id` key: the value must be a well-formed 40-char peer id, and
    /// if a lookup is supplied, that peer's role list must contain
    /// `"MyRelay"`. Pass `None` when the caller has no peer registry handy;
    /// the syntactic check still applies.
    pub fn set_repo_property(
        &self,
        repo_id: &str,
        key: &str,
        value: &str,
        peer_roles: Option<&dyn PeerRoleLookup>,
    ) -> RepoManagerResult<()> {
        if key == "relay-id" {
            if !is_well_formed_peer_id(value) {
                return Err(RepoManagerError::InvalidProperty(
                    key.to_string(),
                    format!("{value:?} is not a well-formed 40-char peer id"),
                ));
            }
            if let Some(lookup) = peer_roles {
                if !lookup.is_my_relay(value) {
                    return Err(RepoManagerError::InvalidProperty(
                        key.to_string(),
                        format!("peer {value} does not have the MyRelay role"),
                    ));
                }
            }
        }

        {
            let db = self.db.lock().unwrap();
            db.execute(
                "INSERT INTO RepoProperty (repo_id, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(repo_id, key) DO UPDATE SET value = excluded.value",
                params![repo_id, key, value],
            )?;
        }
        let Some(handle) = self.get_repo(repo_id) else {
            return Err(RepoManagerError::NotFound(repo_id.to_string()));
        };
        let mut repo = handle.lock().unwrap();
        match key {
            "auto-sync" => repo.auto_sync = value == "true",
            "net-browsable" => repo.net_browsable = value == "true",
            "worktree" => repo.worktree = Some(PathBuf::from(value)),
            "relay-id" => repo.relay_id = Some(value.to_string()),
            "email" => repo.owner_email = Some(value.to_string()),
            "token" => repo.access_token = Some(value.to_string()),
            _ => {}
        }
        Ok(())
    }

    pub fn set_repo_worktree(&self, repo_id: &str, path: &Path) -> RepoManagerResult<()> {
        if !path.is_dir() {
            return Err(RepoManagerError::Backend(BackendError::Other(format!(
                "worktree path {path:?} does not exist"
            ))));
        }
        self.set_repo_property(repo_id, "worktree", &path.to_string_lossy(), None)
    }

    pub fn set_repo_passwd(&self, repo_id: &str, passwd: &str) -> RepoManagerResult<()> {
        let keys = crate::crypto::derive_keys(repo_id, passwd, crate::crypto::CURRENT_ENC_VERSION);
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO RepoPasswd (repo_id, passwd) VALUES (?1, ?2)
             ON CONFLICT(repo_id) DO UPDATE SET passwd = excluded.passwd",
            params![repo_id, passwd],
        )?;
        db.execute(
            "INSERT INTO RepoKeys (repo_id, key, iv) VALUES (?1, ?2, ?3)
             ON CONFLICT(repo_id) DO UPDATE SET key = excluded.key, iv = excluded.iv",
            params![repo_id, keys.key_hex(), keys.iv_hex()],
        )?;
        Ok(())
    }

    pub fn generate_magic(&self, repo_id: &str, passwd: &str) -> String {
        crate::crypto::generate_magic(repo_id, passwd, crate::crypto::CURRENT_ENC_VERSION)
    }

    pub fn set_head_branch(&self, repo_id: &str, branch_name: &str) -> RepoManagerResult<()> {
        {
            let db = self.db.lock().unwrap();
            db.execute(
                "INSERT INTO RepoBranch (repo_id, branch_name) VALUES (?1, ?2)
                 ON CONFLICT(repo_id) DO UPDATE SET branch_name = excluded.branch_name",
                params![repo_id, branch_name],
            )?;
        }
        if let Some(handle) = self.get_repo(repo_id) {
            handle.lock().unwrap().head_branch = branch_name.to_string();
        }
        Ok(())
    }

    pub fn lan_token(&self, repo_id: &str) -> RepoManagerResult<String> {
        let db = self.db.lock().unwrap();
        let token: Option<String> = db
            .query_row("SELECT token FROM RepoLanToken WHERE repo_id = ?1", params![repo_id], |r| r.get(0))
            .optional()?;
        Ok(token.unwrap_or_else(|| DEFAULT_REPO_TOKEN.to_string()))
    }

    pub fn set_tmp_token(&self, repo_id: &str, peer_id: &str, token: &str, timestamp: i64) -> RepoManagerResult<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO RepoTmpToken (repo_id, peer_id, token, timestamp) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(repo_id, peer_id) DO UPDATE SET token = excluded.token, timestamp = excluded.timestamp",
            params![repo_id, peer_id, token, timestamp],
        )?;
        Ok(())
    }

    /// Verifies a one-shot tmp token, deleting it whether or not it
    /// matched — it is spent either way.
    pub fn verify_and_consume_tmp_token(&self, repo_id: &str, peer_id: &str, token: &str) -> RepoManagerResult<bool> {
        let db = self.db.lock().unwrap();
        let stored: Option<String> = db
            .query_row(
                "SELECT token FROM RepoTmpToken WHERE repo_id = ?1 AND peer_id = ?2",
                params![repo_id, peer_id],
                |r| r.get(0),
            )
            .optional()?;
        db.execute(
            "DELETE FROM RepoTmpToken WHERE repo_id = ?1 AND peer_id = ?2",
            params![repo_id, peer_id],
        )?;
        Ok(stored.as_deref() == Some(token))
    }

    pub fn set_merge_info(&self, repo_id: &str, in_merge: bool, branch: &str) -> RepoManagerResult<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO MergeInfo (repo_id, in_merge, branch) VALUES (?1, ?2, ?3)
             ON CONFLICT(repo_id) DO UPDATE SET in_merge = excluded.in_merge, branch = excluded.branch",
            params![repo_id, in_merge as i64, branch],
        )?;
        Ok(())
    }

    pub fn clear_merge_info(&self, repo_id: &str) -> RepoManagerResult<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE MergeInfo SET in_merge = 0 WHERE repo_id = ?1",
            params![repo_id],
        )?;
        Ok(())
    }

    /// Step 7 of the startup sequence: every repo whose `MergeInfo` row
    /// shows an interrupted merge, paired with the branch it was merging.
    /// The caller is expected to re-run `merge_engine::merge_branches` for
    /// each pair.
    pub fn interrupted_merges(&self) -> RepoManagerResult<Vec<(String, String)>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare("SELECT repo_id, branch FROM MergeInfo WHERE in_merge = 1")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    pub fn add_checkout_task(&self, repo_id: &str, worktree: PathBuf, total_files: u64) -> Arc<CheckoutTask> {
        let task = Arc::new(CheckoutTask {
            repo_id: repo_id.to_string(),
            worktree,
            total_files,
            finished_files: AtomicU64::new(0),
            success: AtomicBool::new(false),
        });
        self.checkout_tasks.lock().unwrap().insert(repo_id.to_string(), Arc::clone(&task));
        task
    }

    pub fn checkout_task(&self, repo_id: &str) -> Option<Arc<CheckoutTask>> {
        self.checkout_tasks.lock().unwrap().get(repo_id).cloned()
    }

    /// Removes a checkout task once its done-callback has fired.
    pub fn finish_checkout_task(&self, repo_id: &str, success: bool, worktree: PathBuf) {
        if let Some(task) = self.checkout_tasks.lock().unwrap().remove(repo_id) {
            task.success.store(success, Ordering::SeqCst);
        }
        if success {
            if let Some(handle) = self.get_repo(repo_id) {
                handle.lock().unwrap().worktree = Some(worktree);
            }
        }
    }
}

fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS Repo (repo_id TEXT PRIMARY KEY);
         CREATE TABLE IF NOT EXISTS DeletedRepo (repo_id TEXT PRIMARY KEY);
         CREATE TABLE IF NOT EXISTS RepoBranch (repo_id TEXT PRIMARY KEY, branch_name TEXT);
         CREATE TABLE IF NOT EXISTS RepoLanToken (repo_id TEXT PRIMARY KEY, token TEXT);
         CREATE TABLE IF NOT EXISTS RepoTmpToken (
             repo_id TEXT, peer_id TEXT, token TEXT, timestamp INTEGER,
             PRIMARY KEY(repo_id, peer_id)
         );
         CREATE TABLE IF NOT EXISTS RepoPasswd (repo_id TEXT PRIMARY KEY, passwd TEXT NOT NULL);
         CREATE TABLE IF NOT EXISTS RepoKeys (repo_id TEXT PRIMARY KEY, key TEXT NOT NULL, iv TEXT NOT NULL);
         CREATE TABLE IF NOT EXISTS RepoProperty (repo_id TEXT, key TEXT, value TEXT, PRIMARY KEY(repo_id, key));
         CREATE INDEX IF NOT EXISTS idx_repo_property_repo_id ON RepoProperty(repo_id);
         CREATE TABLE IF NOT EXISTS MergeInfo (repo_id TEXT PRIMARY KEY, in_merge INTEGER, branch TEXT);"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_manager() -> (tempfile::TempDir, RepoManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = RepoManager::open(
            &dir.path().join("repo.db"),
            dir.path().join("objects"),
            dir.path().join("branches"),
        )
        .unwrap();
        (dir, manager)
    }

    #[test]
    fn create_new_repo_is_immediately_visible() {
        let (_dir, manager) = new_manager();
        let repo_id = manager.create_new_repo("my repo", "desc").unwrap();
        assert!(manager.repo_exists(&repo_id));
    }

    #[test]
    fn mark_deleted_hides_repo_immediately() {
        let (_dir, manager) = new_manager();
        let repo_id = manager.create_new_repo("my repo", "desc").unwrap();
        manager.mark_repo_deleted(&repo_id).unwrap();
        assert!(!manager.repo_exists(&repo_id));
    }

    struct FakeRelay(bool);
    impl PeerRoleLookup for FakeRelay {
        fn is_my_relay(&self, _peer_id: &str) -> bool {
            self.0
        }
    }

    #[test]
    fn relay_id_rejects_wrong_length() {
        let (_dir, manager) = new_manager();
        let repo_id = manager.create_new_repo("my repo", "desc").unwrap();
        let err = manager.set_repo_property(&repo_id, "relay-id", "deadbeef", None).unwrap_err();
        assert!(matches!(err, RepoManagerError::InvalidProperty(..)));
    }

    #[test]
    fn relay_id_rejects_peer_without_my_relay_role() {
        let (_dir, manager) = new_manager();
        let repo_id = manager.create_new_repo("my repo", "desc").unwrap();
        let peer_id = "a".repeat(40);
        let err = manager
            .set_repo_property(&repo_id, "relay-id", &peer_id, Some(&FakeRelay(false)))
            .unwrap_err();
        assert!(matches!(err, RepoManagerError::InvalidProperty(..)));
    }

    #[test]
    fn relay_id_accepted_when_peer_has_my_relay_role() {
        let (_dir, manager) = new_manager();
        let repo_id = manager.create_new_repo("my repo", "desc").unwrap();
        let peer_id = "a".repeat(40);
        manager.set_repo_property(&repo_id, "relay-id", &peer_id, Some(&FakeRelay(true))).unwrap();
        let repo = manager.get_repo(&repo_id).unwrap();
        assert_eq!(repo.lock().unwrap().relay_id, Some(peer_id));
    }

    #[test]
    fn token_property_is_stored_on_repo() {
        let (_dir, manager) = new_manager();
        let repo_id = manager.create_new_repo("my repo", "desc").unwrap();
        manager.set_repo_property(&repo_id, "token", "sometoken", None).unwrap();
        let repo = manager.get_repo(&repo_id).unwrap();
        assert_eq!(repo.lock().unwrap().access_token, Some("sometoken".to_string()));
    }

    #[test]
    fn reclaim_deleted_removes_all_rows() {
        let (_dir, manager) = new_manager();
        let repo_id = manager.create_new_repo("my repo", "desc").unwrap();
        manager.set_repo_property(&repo_id, "auto-sync", "true", None).unwrap();
        manager.mark_repo_deleted(&repo_id).unwrap();
        manager.reclaim_deleted(&repo_id).unwrap();

        let db = manager.db.lock().unwrap();
        let count: i64 = db
            .query_row("SELECT COUNT(*) FROM RepoProperty WHERE repo_id = ?1", params![repo_id], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn reopen_after_mark_deleted_reclaims_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("repo.db");
        let objects = dir.path().join("objects");
        let branches = dir.path().join("branches");
        let repo_id = {
            let manager = RepoManager::open(&db_path, objects.clone(), branches.clone()).unwrap();
            let repo_id = manager.create_new_repo("my repo", "desc").unwrap();
            manager.mark_repo_deleted(&repo_id).unwrap();
            repo_id
        };
        let manager = RepoManager::open(&db_path, objects, branches).unwrap();
        let db = manager.db.lock().unwrap();
        let count: i64 = db
            .query_row("SELECT COUNT(*) FROM DeletedRepo WHERE repo_id = ?1", params![repo_id], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn lan_token_falls_back_to_default() {
        let (_dir, manager) = new_manager();
        let repo_id = manager.create_new_repo("my repo", "desc").unwrap();
        assert_eq!(manager.lan_token(&repo_id).unwrap(), DEFAULT_REPO_TOKEN);
    }

    #[test]
    fn tmp_token_is_consumed_on_first_verify() {
        let (_dir, manager) = new_manager();
        let repo_id = manager.create_new_repo("my repo", "desc").unwrap();
        manager.set_tmp_token(&repo_id, "peer1", "secret", 0).unwrap();
        assert!(manager.verify_and_consume_tmp_token(&repo_id, "peer1", "secret").unwrap());
        assert!(!manager.verify_and_consume_tmp_token(&repo_id, "peer1", "secret").unwrap());
    }

    #[test]
    fn get_repo_prefix_requires_uniqueness() {
        let (_dir, manager) = new_manager();
        let repo_id = manager.create_new_repo("my repo", "desc").unwrap();
        manager.create_new_repo("other repo", "desc").unwrap();
        let prefix = &repo_id[..8];
        assert!(manager.get_repo_prefix(prefix).is_some());
        // The empty prefix matches every repo, so with two repos present it
        // is ambiguous.
        assert!(manager.get_repo_prefix("").is_none());
    }
}
