//! An in-process directory.
//!
//! Serves as the backing store of the built-in daemon and as the test
//! double for provisioning. It keeps an ordered log of every operation so
//! callers can check what was done in which order, and can optionally
//! persist its content to a JSON snapshot.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use log::{debug, warn};
use crate::commons::file;
use crate::constants::TASKS_BASE_DN;
use super::{
    Directory, DirectoryError, DirectoryFactory, Entry, Filter, LdapConnInfo,
    Modification, ResultCode, Scope, is_within, normalize_dn, parent_dn,
};


//------------ DirectoryOp ---------------------------------------------------

/// An operation as recorded in the log.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DirectoryOp {
    Bind(String),
    Read(String),
    Search(String),
    Add(String),
    Modify(String),
    Delete(String),
}

impl DirectoryOp {
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            DirectoryOp::Add(_) | DirectoryOp::Modify(_) | DirectoryOp::Delete(_)
        )
    }
}


//------------ MemoryDirectory -----------------------------------------------

/// Entries present in a freshly installed directory server.
const SERVER_ENTRIES: &[&str] = &[
    "cn=config",
    "cn=schema",
    "cn=plugins,cn=config",
    "cn=ldbm database,cn=plugins,cn=config",
    "cn=mapping tree,cn=config",
    "cn=tasks,cn=config",
    "cn=index,cn=tasks,cn=config",
];

#[derive(Clone, Debug, Default)]
pub struct MemoryDirectory {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<String, Entry>,
    log: Vec<DirectoryOp>,
    snapshot: Option<PathBuf>,
    credentials: Option<(String, String)>,

    /// Exit code written to newly added tasks, `None` leaves them running.
    task_exit_code: Option<i32>,

    /// Make the next operation on a DN fail with the given code.
    failures: HashMap<String, ResultCode>,
}

impl MemoryDirectory {
    /// Creates a directory holding the configuration entries every
    /// directory server has, which completes tasks successfully.
    pub fn new() -> Self {
        let dir = Self::empty();
        dir.seed(SERVER_ENTRIES.iter().map(|dn| {
            Entry::new(*dn)
                .with("objectClass", "top")
                .with("objectClass", "nsContainer")
        }));
        dir
    }

    /// Creates a directory without any entries.
    pub fn empty() -> Self {
        let dir = MemoryDirectory::default();
        dir.lock().task_exit_code = Some(0);
        dir
    }

    /// Opens a directory persisted at the given path.
    pub fn open(snapshot: &Path) -> Result<Self, DirectoryError> {
        let dir = Self::new();
        {
            let mut state = dir.lock();
            if snapshot.exists() {
                let entries: Vec<Entry> = file::load_json(snapshot)
                    .map_err(DirectoryError::other)?;
                for entry in entries {
                    state.entries.insert(normalize_dn(entry.dn()), entry);
                }
                debug!(
                    "Loaded {} directory entries from {}",
                    state.entries.len(),
                    snapshot.display()
                );
            }
            state.snapshot = Some(snapshot.to_path_buf());
        }
        Ok(dir)
    }

    /// Requires binds to use the given DN and password.
    pub fn with_credentials(self, bind_dn: &str, password: &str) -> Self {
        self.lock().credentials =
            Some((normalize_dn(bind_dn), password.to_string()));
        self
    }

    /// Sets the exit code written to tasks, or `None` to never finish them.
    pub fn set_task_exit_code(&self, code: Option<i32>) {
        self.lock().task_exit_code = code;
    }

    /// Makes the next operation touching `dn` fail.
    pub fn fail_next(&self, dn: &str, code: ResultCode) {
        self.lock().failures.insert(normalize_dn(dn), code);
    }

    /// Returns the operation log.
    pub fn log(&self) -> Vec<DirectoryOp> {
        self.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear()
    }

    /// Returns all mutations from the log.
    pub fn mutations(&self) -> Vec<DirectoryOp> {
        self.log().into_iter().filter(DirectoryOp::is_mutation).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Returns an entry without recording a log entry.
    pub fn peek(&self, dn: &str) -> Option<Entry> {
        self.lock().entries.get(&normalize_dn(dn)).cloned()
    }

    /// Adds entries without logging, for setting up scenarios.
    pub fn seed(&self, entries: impl IntoIterator<Item = Entry>) {
        let mut state = self.lock();
        for entry in entries {
            state.entries.insert(normalize_dn(entry.dn()), entry);
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test panicked while holding it.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn bind(&self, info: &LdapConnInfo) -> Result<(), DirectoryError> {
        let mut state = self.lock();
        state.log.push(DirectoryOp::Bind(info.bind_dn.clone()));
        if let Some((dn, password)) = &state.credentials {
            if *dn != normalize_dn(&info.bind_dn)
                || *password != info.bind_password
            {
                return Err(DirectoryError::new(
                    ResultCode::InvalidCredentials,
                    format!("invalid credentials for {}", info.bind_dn),
                ));
            }
        }
        Ok(())
    }
}

impl MemoryState {
    fn take_failure(&mut self, dn: &str) -> Result<(), DirectoryError> {
        match self.failures.remove(&normalize_dn(dn)) {
            Some(code) => Err(DirectoryError::new(
                code,
                format!("injected failure for {dn}"),
            )),
            None => Ok(()),
        }
    }

    fn persist(&self) -> Result<(), DirectoryError> {
        if let Some(path) = &self.snapshot {
            let entries: Vec<&Entry> = self.entries.values().collect();
            file::save_json(&entries, path).map_err(DirectoryError::other)?;
        }
        Ok(())
    }

    /// Finishes a total update requested on a replication agreement.
    fn refresh_replica(&self, entry: &mut Entry) {
        if !entry.has_value("nsds5BeginReplicaRefresh", "start") {
            return;
        }
        if let Some(code) = self.task_exit_code {
            entry.remove_attr("nsds5BeginReplicaRefresh");
            let status = if code == 0 {
                format!("{code} Total update succeeded")
            } else {
                format!("{code} Total update aborted")
            };
            entry.set("nsds5ReplicaLastInitStatus", vec![status]);
        }
    }

    fn complete_task(&self, entry: &mut Entry) {
        if !is_within(entry.dn(), TASKS_BASE_DN)
            || normalize_dn(entry.dn()) == normalize_dn(TASKS_BASE_DN)
        {
            return;
        }
        if parent_dn(entry.dn()).map(normalize_dn)
            == Some(normalize_dn(TASKS_BASE_DN))
        {
            // Task type containers, not tasks.
            return;
        }
        if let Some(code) = self.task_exit_code {
            entry.set("nsTaskExitCode", vec![code.to_string()]);
            entry.set(
                "nsTaskStatus",
                vec![if code == 0 {
                    "Task finished".to_string()
                } else {
                    format!("Task failed with code {code}")
                }],
            );
        }
    }
}

impl Directory for MemoryDirectory {
    fn read(&self, dn: &str) -> Result<Entry, DirectoryError> {
        let mut state = self.lock();
        state.log.push(DirectoryOp::Read(dn.to_string()));
        state.take_failure(dn)?;
        state
            .entries
            .get(&normalize_dn(dn))
            .cloned()
            .ok_or_else(|| DirectoryError::no_such_object(dn))
    }

    fn search(
        &self, base: &str, scope: Scope, filter: &Filter
    ) -> Result<Vec<Entry>, DirectoryError> {
        let mut state = self.lock();
        state.log.push(DirectoryOp::Search(base.to_string()));
        state.take_failure(base)?;

        let norm_base = normalize_dn(base);
        if !state.entries.contains_key(&norm_base) {
            return Err(DirectoryError::no_such_object(base));
        }
        Ok(state
            .entries
            .iter()
            .filter(|(dn, _)| match scope {
                Scope::Base => **dn == norm_base,
                Scope::OneLevel => {
                    parent_dn(dn).map(|p| p == norm_base).unwrap_or(false)
                }
                Scope::Subtree => is_within(dn, &norm_base),
            })
            .map(|(_, entry)| entry)
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect())
    }

    fn add(&self, mut entry: Entry) -> Result<(), DirectoryError> {
        let mut state = self.lock();
        state.log.push(DirectoryOp::Add(entry.dn().to_string()));
        state.take_failure(entry.dn())?;

        let key = normalize_dn(entry.dn());
        if state.entries.contains_key(&key) {
            return Err(DirectoryError::already_exists(entry.dn()));
        }
        if !entry.has_attr("objectClass") {
            return Err(DirectoryError::new(
                ResultCode::ObjectClassViolation,
                format!("entry {} has no object class", entry.dn()),
            ));
        }
        state.complete_task(&mut entry);
        state.entries.insert(key, entry);
        state.persist()
    }

    fn modify(
        &self, dn: &str, mods: &[Modification]
    ) -> Result<(), DirectoryError> {
        let mut state = self.lock();
        state.log.push(DirectoryOp::Modify(dn.to_string()));
        state.take_failure(dn)?;

        let key = normalize_dn(dn);
        let mut entry = state
            .entries
            .get(&key)
            .cloned()
            .ok_or_else(|| DirectoryError::no_such_object(dn))?;

        for modification in mods {
            match modification {
                Modification::Add(attr, values) => {
                    for value in values {
                        if entry.has_value(attr, value) {
                            return Err(DirectoryError::new(
                                ResultCode::TypeOrValueExists,
                                format!("{attr}: {value} already present in {dn}"),
                            ));
                        }
                        entry.add_value(attr, value.clone());
                    }
                }
                Modification::Replace(attr, values) => {
                    entry.set(attr, values.clone());
                }
                Modification::Delete(attr, values) => {
                    if !entry.has_attr(attr) {
                        return Err(DirectoryError::new(
                            ResultCode::NoSuchAttribute,
                            format!("no attribute {attr} in {dn}"),
                        ));
                    }
                    if values.is_empty() {
                        entry.remove_attr(attr);
                    } else {
                        let remaining = entry
                            .values(attr)
                            .iter()
                            .filter(|v| {
                                !values.iter().any(|d| d.eq_ignore_ascii_case(v))
                            })
                            .cloned()
                            .collect();
                        entry.set(attr, remaining);
                    }
                }
            }
        }
        state.refresh_replica(&mut entry);
        state.entries.insert(key, entry);
        state.persist()
    }

    fn delete(&self, dn: &str) -> Result<(), DirectoryError> {
        let mut state = self.lock();
        state.log.push(DirectoryOp::Delete(dn.to_string()));
        state.take_failure(dn)?;

        let key = normalize_dn(dn);
        if !state.entries.contains_key(&key) {
            return Err(DirectoryError::no_such_object(dn));
        }
        let has_children = state
            .entries
            .keys()
            .any(|other| parent_dn(other).map(|p| p == key).unwrap_or(false));
        if has_children {
            return Err(DirectoryError::new(
                ResultCode::NotAllowedOnNonLeaf,
                format!("entry {dn} has children"),
            ));
        }
        state.entries.remove(&key);
        state.persist()
    }
}

impl DirectoryFactory for MemoryDirectory {
    fn connect(
        &self, info: &LdapConnInfo
    ) -> Result<Box<dyn Directory>, DirectoryError> {
        self.bind(info)?;
        Ok(Box::new(self.clone()))
    }
}


//------------ MemoryDirectoryPool -------------------------------------------

/// A set of in-memory directories, one per host and port.
///
/// Servers that were not registered explicitly are created on first
/// connect.
#[derive(Clone, Debug, Default)]
pub struct MemoryDirectoryPool {
    servers: Arc<Mutex<HashMap<(String, u16), MemoryDirectory>>>,
}

impl MemoryDirectoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, host: &str, port: u16, dir: MemoryDirectory) {
        self.servers().insert((host.to_ascii_lowercase(), port), dir);
    }

    /// Returns the directory at the given host and port.
    pub fn server(&self, host: &str, port: u16) -> MemoryDirectory {
        self.servers()
            .entry((host.to_ascii_lowercase(), port))
            .or_insert_with(MemoryDirectory::new)
            .clone()
    }

    fn servers(
        &self
    ) -> MutexGuard<'_, HashMap<(String, u16), MemoryDirectory>> {
        match self.servers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("directory pool lock was poisoned");
                poisoned.into_inner()
            }
        }
    }
}

impl DirectoryFactory for MemoryDirectoryPool {
    fn connect(
        &self, info: &LdapConnInfo
    ) -> Result<Box<dyn Directory>, DirectoryError> {
        self.server(&info.host, info.port).connect(info)
    }
}


//------------ Tests ---------------------------------------------------------
