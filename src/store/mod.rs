//! The instance configuration store.
//!
//! Configuration lives in a flat file of `key=value` lines with dotted
//! keys, traditionally called `CS.cfg`. The whole file is loaded at start,
//! mutated in memory and written back in one go by [`ConfigStore::commit`].
//! The `preop` namespace holds the installation journal, see
//! [`journal`].

pub mod journal;

use std::collections::BTreeMap;
use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use log::{debug, trace};
use crate::commons::error::SetupIoError;
use crate::commons::file;


//------------ ConfigStore ---------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct ConfigStore {
    /// Where the store is committed to, `None` for a purely in-memory store.
    path: Option<PathBuf>,

    entries: BTreeMap<String, String>,
}

impl ConfigStore {
    /// Creates an empty store that is never written to disk.
    pub fn in_memory() -> Self {
        ConfigStore::default()
    }

    /// Loads the store from the given file.
    ///
    /// A missing file results in an empty store that will be created on
    /// the first commit.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let entries = if path.exists() {
            Self::parse(&file::read_to_string(path)?)?
        } else {
            debug!(
                "Configuration file {} does not exist yet, starting empty",
                path.display()
            );
            BTreeMap::new()
        };
        Ok(ConfigStore {
            path: Some(path.to_path_buf()),
            entries,
        })
    }

    /// Parses the `key=value` format.
    ///
    /// Empty lines and lines starting with `#` are skipped. Everything
    /// after the first `=` is the value, verbatim.
    pub fn parse(content: &str) -> Result<BTreeMap<String, String>, StoreError> {
        let mut res = BTreeMap::new();
        for (idx, line) in content.lines().enumerate() {
            let trimmed = line.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match trimmed.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    res.insert(key.trim().to_string(), value.to_string());
                }
                _ => {
                    return Err(StoreError::Parse {
                        line: idx + 1,
                        content: line.to_string(),
                    })
                }
            }
        }
        Ok(res)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_string(&self, key: &str) -> Result<String, StoreError> {
        self.get(key)
            .map(ToString::to_string)
            .ok_or_else(|| StoreError::MissingKey(key.to_string()))
    }

    pub fn get_string_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    /// Returns the value if present and not empty.
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.trim().is_empty())
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, StoreError> {
        let value = self.get_string(key)?;
        match value.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(StoreError::invalid(key, &value, "a boolean")),
        }
    }

    pub fn get_bool_or(&self, key: &str, default: bool) -> Result<bool, StoreError> {
        if self.contains(key) {
            self.get_bool(key)
        } else {
            Ok(default)
        }
    }

    pub fn get_int(&self, key: &str) -> Result<i64, StoreError> {
        self.get_parsed(key, "an integer")
    }

    pub fn get_int_or(&self, key: &str, default: i64) -> Result<i64, StoreError> {
        if self.contains(key) {
            self.get_int(key)
        } else {
            Ok(default)
        }
    }

    pub fn get_port(&self, key: &str) -> Result<u16, StoreError> {
        self.get_parsed(key, "a port number")
    }

    fn get_parsed<T: FromStr>(
        &self, key: &str, expected: &'static str
    ) -> Result<T, StoreError> {
        let value = self.get_string(key)?;
        T::from_str(value.trim())
            .map_err(|_| StoreError::invalid(key, &value, expected))
    }

    pub fn put(&mut self, key: &str, value: impl fmt::Display) {
        trace!("config: {key} updated");
        self.entries.insert(key.to_string(), value.to_string());
    }

    pub fn put_bool(&mut self, key: &str, value: bool) {
        self.put(key, if value { "true" } else { "false" })
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    /// Returns all entries whose key lies below the given prefix.
    pub fn entries_with_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        let start = format!("{prefix}.");
        self.entries
            .range(start.clone()..)
            .take_while(|(k, _)| k.starts_with(&start))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Returns the distinct names of the level right below the prefix.
    ///
    /// For keys `a.b.c` and `a.d`, `sub_keys("a")` returns `b` and `d`.
    pub fn sub_keys(&self, prefix: &str) -> Vec<String> {
        let start = format!("{prefix}.");
        let mut res: Vec<String> = Vec::new();
        for (key, _) in self.entries_with_prefix(prefix) {
            if let Some(rest) = key.strip_prefix(&start) {
                let name = rest.split('.').next().unwrap_or(rest);
                if res.last().map(String::as_str) != Some(name) {
                    res.push(name.to_string());
                }
            }
        }
        res
    }

    /// Removes all entries below the prefix, returning how many there were.
    pub fn remove_prefix(&mut self, prefix: &str) -> usize {
        let keys: Vec<String> = self
            .entries_with_prefix(prefix)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        for key in &keys {
            self.entries.remove(key);
        }
        keys.len()
    }

    /// Renders the store in its file format.
    pub fn to_file_content(&self) -> String {
        let mut res = String::new();
        for (key, value) in &self.entries {
            res.push_str(key);
            res.push('=');
            res.push_str(value);
            res.push('\n');
        }
        res
    }

    /// Makes all changes durable.
    ///
    /// The file is replaced atomically while holding an exclusive lock on
    /// a sibling lock file so command line tools editing the same instance
    /// cannot interleave their writes.
    pub fn commit(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        let lock_path = PathBuf::from(lock_path);
        if let Some(parent) = path.parent() {
            file::create_dir(parent)?;
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| {
                StoreError::Io(SetupIoError::new(
                    format!("failed to open lock file '{}'", lock_path.display()),
                    e,
                ))
            })?;
        let mut lock = fd_lock::RwLock::new(lock_file);
        let _guard = lock
            .write()
            .map_err(|e| StoreError::Lock(format!("Cannot get file lock: {e}")))?;

        file::save_atomic(self.to_file_content().as_bytes(), path)?;
        debug!("Committed {} entries to {}", self.entries.len(), path.display());
        Ok(())
    }
}


//------------ StoreError ----------------------------------------------------

#[derive(Debug)]
pub enum StoreError {
    MissingKey(String),
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },
    Parse { line: usize, content: String },
    Io(SetupIoError),
    Lock(String),
    Journal(String),
}

impl StoreError {
    pub fn invalid(key: &str, value: &str, expected: &'static str) -> Self {
        StoreError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            expected,
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StoreError::MissingKey(key) => {
                write!(f, "missing configuration value '{key}'")
            }
            StoreError::InvalidValue { key, value, expected } => write!(
                f,
                "configuration value '{key}' should be {expected}, found '{value}'"
            ),
            StoreError::Parse { line, content } => {
                write!(f, "cannot parse line {line}: '{content}'")
            }
            StoreError::Io(e) => e.fmt(f),
            StoreError::Lock(e) => e.fmt(f),
            StoreError::Journal(e) => write!(f, "installation journal: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<SetupIoError> for StoreError {
    fn from(e: SetupIoError) -> Self {
        StoreError::Io(e)
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_skips_comments_and_keeps_values_verbatim() {
        let entries = ConfigStore::parse(
            "# instance\n\
             cs.type=CA\n\
             \n\
             ca.signing.dn=CN=CA Signing Certificate,O=EXAMPLE\n\
             empty=\n"
        ).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries["ca.signing.dn"],
            "CN=CA Signing Certificate,O=EXAMPLE"
        );
        assert_eq!(entries["empty"], "");
    }

    #[test]
    fn parse_rejects_line_without_separator() {
        let err = ConfigStore::parse("a=1\nnonsense\n").unwrap_err();
        assert!(matches!(err, StoreError::Parse { line: 2, .. }));
    }

    #[test]
    fn typed_getters() {
        let mut store = ConfigStore::in_memory();
        store.put("preop.database.port", 389);
        store.put_bool("preop.cert.signing.done", true);
        store.put("bad.bool", "yes");

        assert_eq!(store.get_port("preop.database.port").unwrap(), 389);
        assert!(store.get_bool("preop.cert.signing.done").unwrap());
        assert!(!store.get_bool_or("preop.cert.audit_signing.done", false).unwrap());
        assert!(store.get_bool("bad.bool").is_err());
        assert!(matches!(
            store.get_string("missing"),
            Err(StoreError::MissingKey(_))
        ));
    }

    #[test]
    fn prefix_operations() {
        let mut store = ConfigStore::in_memory();
        store.put("preop.cert.signing.type", "local");
        store.put("preop.cert.sslserver.type", "remote");
        store.put("preop.pin", "1234");
        store.put("preoperation", "x");
        store.put("cs.type", "CA");

        assert_eq!(store.sub_keys("preop"), vec!["cert", "pin"]);
        assert_eq!(store.sub_keys("preop.cert"), vec!["signing", "sslserver"]);
        assert_eq!(store.remove_prefix("preop"), 3);
        assert!(store.contains("preoperation"));
        assert!(store.contains("cs.type"));
    }

    #[test]
    fn commit_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf/CS.cfg");

        let mut store = ConfigStore::load(&path).unwrap();
        assert!(store.is_empty());
        store.put("cs.state", 0);
        store.put("ca.sslserver.cert", "MIIB+abc=");
        store.commit().unwrap();

        let reloaded = ConfigStore::load(&path).unwrap();
        assert_eq!(reloaded.get("cs.state"), Some("0"));
        assert_eq!(reloaded.get("ca.sslserver.cert"), Some("MIIB+abc="));
    }
}
