//! Provisioning the directory database of a subsystem.
//!
//! A subsystem keeps its data below a base DN in a backend of its own,
//! connected to the directory tree by a mapping tree entry. Provisioning
//! checks what exists, removes it if the administrator agreed, creates the
//! backend and mapping and imports the LDIF bundles. Clones only create
//! the empty database and receive the data through replication.

pub mod replication;
pub mod task;

use std::path::PathBuf;
use std::sync::Arc;
use log::{debug, info, warn};
use crate::commons::error::Error;
use crate::commons::{SetupEmptyResult, SetupResult};
use crate::constants::{LDBM_BASE_DN, MAPPING_TREE_BASE_DN};
use crate::directory::ldif::{self, LdifBundle, LdifParams};
use crate::directory::{
    normalize_dn, Directory, DirectoryFactory, Entry, Filter, LdapConnInfo,
    ResultCode, Scope,
};
use crate::store::ConfigStore;
use self::replication::{ReplicaSide, ReplicationParams, ReplicationReport};
use self::task::TaskPoller;


//------------ InternalDb ----------------------------------------------------

/// The database an instance keeps its data in.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InternalDb {
    pub conn: LdapConnInfo,
    pub base_dn: String,

    /// The name of the backend.
    pub database: String,
}

impl InternalDb {
    /// Reads the `internaldb` settings of an instance.
    pub fn from_store(store: &ConfigStore) -> SetupResult<Self> {
        Ok(InternalDb {
            conn: LdapConnInfo {
                host: store.get_string("internaldb.ldapconn.host")?,
                port: store.get_port("internaldb.ldapconn.port")?,
                secure: store.get_bool_or("internaldb.ldapconn.secureConn", false)?,
                bind_dn: store.get_string("internaldb.ldapauth.bindDN")?,
                bind_password: store.get_string_or("internaldb.ldapauth.password", ""),
            },
            base_dn: store.get_string("internaldb.basedn")?,
            database: store.get_string("internaldb.database")?,
        })
    }

    /// Writes the settings, without committing.
    pub fn save(&self, store: &mut ConfigStore) {
        store.put("internaldb.ldapconn.host", &self.conn.host);
        store.put("internaldb.ldapconn.port", self.conn.port);
        store.put_bool("internaldb.ldapconn.secureConn", self.conn.secure);
        store.put("internaldb.ldapauth.bindDN", &self.conn.bind_dn);
        store.put("internaldb.ldapauth.password", &self.conn.bind_password);
        store.put("internaldb.basedn", &self.base_dn);
        store.put("internaldb.database", &self.database);
    }

    pub fn mapping_dn(&self) -> String {
        mapping_dn(&self.base_dn)
    }

    pub fn backend_dn(&self) -> String {
        backend_dn(&self.database)
    }
}

/// Returns the DN of the mapping tree entry for a base DN.
pub fn mapping_dn(base_dn: &str) -> String {
    format!("cn=\"{base_dn}\",{MAPPING_TREE_BASE_DN}")
}

/// Returns the DN of a backend.
pub fn backend_dn(database: &str) -> String {
    format!("cn={database},{LDBM_BASE_DN}")
}


//------------ CloneSource ---------------------------------------------------

/// The master a clone database is set up from.
#[derive(Clone, Debug)]
pub struct CloneSource {
    /// The database of the master as it reported it.
    pub master: InternalDb,

    pub master_replication_port: u16,
    pub clone_replication_port: u16,

    /// The replica id of the master, used if it has no replica yet.
    pub master_replica_id: u32,
    pub replication_password: String,

    /// Whether to set up replication here or leave it to the operator.
    pub setup_replication: bool,
}


//------------ DatabaseSetup -------------------------------------------------

/// What to provision.
#[derive(Clone, Debug)]
pub struct DatabaseSetup {
    pub db: InternalDb,
    pub instance_id: String,

    /// Create backend and mapping rather than use existing ones.
    pub create_new_db: bool,

    /// Remove whatever exists already.
    pub remove_data: bool,

    /// Rebuild the attribute indexes after importing.
    pub reindex_data: bool,

    pub clone: Option<CloneSource>,
}

impl DatabaseSetup {
    fn ldif_params(&self) -> LdifParams {
        LdifParams {
            instance_id: self.instance_id.clone(),
            root_suffix: self.db.base_dn.clone(),
            database: self.db.database.clone(),
            dbuser: format!("uid=pkidbuser,ou=people,{}", self.db.base_dn),
        }
    }
}


//------------ Existing ------------------------------------------------------

/// The parts of a database found on the server.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Existing {
    pub base: bool,
    pub mapping: bool,
    pub backend: bool,
}

impl Existing {
    pub fn any(self) -> bool {
        self.base || self.mapping || self.backend
    }
}


//------------ ProvisionReport -----------------------------------------------

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProvisionReport {
    /// What was found, and removed, before provisioning.
    pub removed: Existing,
    pub imported: Vec<String>,
    pub replication: Option<ReplicationReport>,
}


//------------ DatabaseProvisioner -------------------------------------------

pub struct DatabaseProvisioner {
    factory: Arc<dyn DirectoryFactory>,
    ldif_dir: Option<PathBuf>,
    poller: TaskPoller,
}

impl DatabaseProvisioner {
    pub fn new(
        factory: Arc<dyn DirectoryFactory>,
        ldif_dir: Option<PathBuf>,
        poller: TaskPoller,
    ) -> Self {
        DatabaseProvisioner { factory, ldif_dir, poller }
    }

    /// Provisions the database.
    ///
    /// Nothing is changed if the request conflicts with what exists on the
    /// server. Parts created before a later failure are left in place.
    pub fn provision(&self, setup: &DatabaseSetup) -> SetupResult<ProvisionReport> {
        validate(setup)?;
        if let Some(clone) = &setup.clone {
            check_clone(&setup.db, &clone.master)?;
        }

        let dir = self.factory.connect(&setup.db.conn)?;
        let dir = dir.as_ref();
        info!(
            "Provisioning {} in backend '{}' on {}",
            setup.db.base_dn, setup.db.database, setup.db.conn
        );

        let existing = self.check_existing(dir, setup)?;
        let mut report = ProvisionReport::default();
        if setup.create_new_db && existing.any() {
            if !setup.remove_data {
                return Err(Error::already_exists(describe(&setup.db, existing)));
            }
            self.remove(dir, &setup.db, existing)?;
            report.removed = existing;
        }
        else if !setup.create_new_db {
            if !existing.mapping || !existing.backend {
                return Err(Error::validation(format!(
                    "database '{}' for {} does not exist",
                    setup.db.database, setup.db.base_dn
                )));
            }
            if setup.remove_data && existing.base {
                dir.delete_subtree(&setup.db.base_dn)?;
                report.removed.base = true;
            }
        }

        if setup.create_new_db {
            self.create_backend(dir, &setup.db)?;
        }

        match &setup.clone {
            None => self.populate(dir, setup, &mut report)?,
            Some(clone) => self.populate_clone(dir, setup, clone, &mut report)?,
        }

        if setup.reindex_data {
            self.run_task(dir, setup, LdifBundle::Reindex, &mut report)?;
        }
        info!("Database {} provisioned", setup.db.base_dn);
        Ok(report)
    }

    /// Finds the parts of the database that exist.
    ///
    /// Also makes sure the backend is not used for another base DN.
    pub fn check_existing(
        &self, dir: &dyn Directory, setup: &DatabaseSetup
    ) -> SetupResult<Existing> {
        let db = &setup.db;
        let existing = Existing {
            base: dir.exists(&db.base_dn)?,
            mapping: dir.exists(&db.mapping_dn())?,
            backend: dir.exists(&db.backend_dn())?,
        };
        debug!("Found for {}: {existing:?}", db.base_dn);

        if existing.backend {
            let users = dir.search(
                MAPPING_TREE_BASE_DN,
                Scope::Subtree,
                &Filter::eq("nsslapd-backend", db.database.as_str()),
            )?;
            let own = normalize_dn(&db.mapping_dn());
            if let Some(other) = users.iter().find(|e| normalize_dn(e.dn()) != own) {
                return Err(Error::conflict(format!(
                    "database '{}' is used by {}",
                    db.database,
                    other.first("cn").unwrap_or(other.dn())
                )));
            }
        }
        Ok(existing)
    }

    /// Removes mapping, backend and data, in that order.
    fn remove(
        &self, dir: &dyn Directory, db: &InternalDb, existing: Existing
    ) -> SetupEmptyResult {
        if existing.mapping {
            dir.delete_subtree(&db.mapping_dn())?;
            info!("Removed mapping for {}", db.base_dn);
        }
        if existing.backend {
            dir.delete_subtree(&db.backend_dn())?;
            info!("Removed backend '{}'", db.database);
        }
        if existing.base {
            match dir.delete_subtree(&db.base_dn) {
                Ok(()) => info!("Removed data below {}", db.base_dn),
                // Gone with its backend.
                Err(err) if err.code() == ResultCode::NoSuchObject => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn create_backend(&self, dir: &dyn Directory, db: &InternalDb) -> SetupEmptyResult {
        dir.add(Entry::new(db.backend_dn())
            .with("objectClass", "top")
            .with("objectClass", "extensibleObject")
            .with("objectClass", "nsBackendInstance")
            .with("cn", db.database.as_str())
            .with("nsslapd-suffix", db.base_dn.as_str()))?;
        dir.add(Entry::new(db.mapping_dn())
            .with("objectClass", "top")
            .with("objectClass", "extensibleObject")
            .with("objectClass", "nsMappingTree")
            .with("cn", db.base_dn.as_str())
            .with("nsslapd-state", "Backend")
            .with("nsslapd-backend", db.database.as_str()))?;
        debug!("Created backend '{}' for {}", db.database, db.base_dn);
        Ok(())
    }

    fn populate(
        &self, dir: &dyn Directory, setup: &DatabaseSetup, report: &mut ProvisionReport
    ) -> SetupEmptyResult {
        match dir.add(base_entry(&setup.db.base_dn)?) {
            Ok(()) => {}
            Err(err) if err.code() == ResultCode::EntryAlreadyExists => {}
            Err(err) => return Err(err.into()),
        }
        for bundle in [
            LdifBundle::Schema, LdifBundle::Core, LdifBundle::Seed,
            LdifBundle::Index, LdifBundle::Vlv,
        ] {
            self.import(dir, setup, bundle, report)?;
        }
        Ok(())
    }

    fn populate_clone(
        &self,
        dir: &dyn Directory,
        setup: &DatabaseSetup,
        clone: &CloneSource,
        report: &mut ProvisionReport,
    ) -> SetupEmptyResult {
        if !clone.setup_replication {
            self.import(dir, setup, LdifBundle::Schema, report)?;
        }
        self.import(dir, setup, LdifBundle::Index, report)?;
        self.import(dir, setup, LdifBundle::Vlv, report)?;

        if clone.setup_replication {
            let master = self.factory.connect(&clone.master.conn)?;
            let params = ReplicationParams {
                master: ReplicaSide {
                    conn: clone.master.conn.clone(),
                    replication_port: clone.master_replication_port,
                    replica_id: clone.master_replica_id,
                },
                clone: ReplicaSide {
                    conn: setup.db.conn.clone(),
                    replication_port: clone.clone_replication_port,
                    replica_id: clone.master_replica_id + 1,
                },
                base_dn: setup.db.base_dn.clone(),
                instance_id: setup.instance_id.clone(),
                password: clone.replication_password.clone(),
            };
            report.replication = Some(replication::setup(
                master.as_ref(), dir, &params, &self.poller
            )?);
        }
        else {
            warn!(
                "Replication of {} is not set up, the clone needs its data from elsewhere",
                setup.db.base_dn
            );
        }

        self.run_task(dir, setup, LdifBundle::VlvTasks, report)
    }

    fn import(
        &self,
        dir: &dyn Directory,
        setup: &DatabaseSetup,
        bundle: LdifBundle,
        report: &mut ProvisionReport,
    ) -> SetupEmptyResult {
        let template = bundle.template(self.ldif_dir.as_deref())?;
        let content = setup.ldif_params().substitute(&template);
        // Schema may partly exist on a shared server.
        let suppress = bundle == LdifBundle::Schema;
        ldif::import(dir, bundle.file_name(), &content, suppress)?;
        report.imported.push(bundle.file_name().to_string());
        Ok(())
    }

    /// Adds the task entries of a bundle and waits for them to finish.
    fn run_task(
        &self,
        dir: &dyn Directory,
        setup: &DatabaseSetup,
        bundle: LdifBundle,
        report: &mut ProvisionReport,
    ) -> SetupEmptyResult {
        let template = bundle.template(self.ldif_dir.as_deref())?;
        let content = setup.ldif_params().substitute(&template);
        let tasks = ldif::parse(&content)?
            .into_iter()
            .map(|record| record.dn().to_string())
            .collect::<Vec<_>>();

        // A task left over from an earlier attempt would never be run
        // again, so start afresh.
        for dn in &tasks {
            match dir.delete(dn) {
                Ok(()) => debug!("Removed old task {dn}"),
                Err(err) if err.code() == ResultCode::NoSuchObject => {}
                Err(err) => return Err(err.into()),
            }
        }
        ldif::import(dir, bundle.file_name(), &content, false)?;
        report.imported.push(bundle.file_name().to_string());
        for dn in &tasks {
            self.poller.wait_for_task(dir, dn)?;
        }
        Ok(())
    }
}

fn validate(setup: &DatabaseSetup) -> SetupEmptyResult {
    let db = &setup.db;
    if db.base_dn.trim().is_empty() {
        return Err(Error::validation("missing base DN"));
    }
    if db.database.trim().is_empty() {
        return Err(Error::validation("missing database name"));
    }
    if db.conn.host.trim().is_empty() || db.conn.port == 0 {
        return Err(Error::validation("missing directory host or port"));
    }
    Ok(())
}

/// Makes sure a clone does not share the database of its master.
pub fn check_clone(clone: &InternalDb, master: &InternalDb) -> SetupEmptyResult {
    if clone.conn.same_server(&master.conn) {
        return Err(Error::consistency(format!(
            "clone and master use the same directory server {}:{}",
            clone.conn.host, clone.conn.port
        )));
    }
    if normalize_dn(&clone.base_dn) != normalize_dn(&master.base_dn) {
        return Err(Error::consistency(format!(
            "clone base DN {} differs from master base DN {}",
            clone.base_dn, master.base_dn
        )));
    }
    Ok(())
}

fn describe(db: &InternalDb, existing: Existing) -> String {
    let mut parts = Vec::new();
    if existing.base {
        parts.push(format!("base DN {}", db.base_dn));
    }
    if existing.mapping {
        parts.push(format!("mapping for {}", db.base_dn));
    }
    if existing.backend {
        parts.push(format!("database '{}'", db.database));
    }
    parts.join(", ")
}

/// Creates the entry for a base DN according to its naming attribute.
fn base_entry(base_dn: &str) -> SetupResult<Entry> {
    let rdn = base_dn.split(',').next().unwrap_or_default();
    let (attr, value) = rdn
        .split_once('=')
        .map(|(a, v)| (a.trim(), v.trim()))
        .ok_or_else(|| Error::validation(format!("invalid base DN '{base_dn}'")))?;
    let class = match attr.to_ascii_lowercase().as_str() {
        "o" => "organization",
        "ou" => "organizationalUnit",
        "dc" => "domain",
        _ => "extensibleObject",
    };
    Ok(Entry::new(base_dn)
        .with("objectClass", "top")
        .with("objectClass", class)
        .with(attr, value))
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::directory::{DirectoryOp, MemoryDirectory, MemoryDirectoryPool};
    use super::task::TaskPolicy;

    fn db(host: &str) -> InternalDb {
        InternalDb {
            conn: LdapConnInfo {
                host: host.into(),
                port: 389,
                secure: false,
                bind_dn: "cn=Directory Manager".into(),
                bind_password: "Secret.123".into(),
            },
            base_dn: "o=pki-tomcat-CA".into(),
            database: "pki-tomcat-CA".into(),
        }
    }

    fn setup(host: &str) -> DatabaseSetup {
        DatabaseSetup {
            db: db(host),
            instance_id: "pki-tomcat".into(),
            create_new_db: true,
            remove_data: false,
            reindex_data: false,
            clone: None,
        }
    }

    fn provisioner(factory: Arc<dyn DirectoryFactory>) -> DatabaseProvisioner {
        DatabaseProvisioner::new(factory, None, TaskPoller::new(TaskPolicy::new(
            Duration::from_millis(5), Duration::from_millis(10), Duration::from_millis(200)
        )))
    }

    #[test]
    fn store_round_trip() {
        let mut store = ConfigStore::in_memory();
        db("ds.example.com").save(&mut store);
        assert_eq!(InternalDb::from_store(&store).unwrap(), db("ds.example.com"));
    }

    #[test]
    fn new_database_is_populated() {
        let dir = MemoryDirectory::new();
        let report = provisioner(Arc::new(dir.clone()))
            .provision(&setup("localhost"))
            .unwrap();
        assert_eq!(
            report.imported,
            vec!["schema.ldif", "core.ldif", "seed.ldif", "index.ldif", "vlv.ldif"]
        );
        assert!(dir.peek("cn=Subsystem Group,ou=groups,o=pki-tomcat-CA").is_some());
        assert!(dir.peek("cn=serialno,cn=index,cn=pki-tomcat-CA,cn=ldbm database,cn=plugins,cn=config").is_some());
        assert_eq!(
            dir.peek("o=pki-tomcat-CA").unwrap().first("o"),
            Some("pki-tomcat-CA")
        );
    }

    #[test]
    fn second_run_needs_confirmed_removal() {
        let dir = MemoryDirectory::new();
        let provisioner = provisioner(Arc::new(dir.clone()));
        provisioner.provision(&setup("localhost")).unwrap();
        dir.clear_log();

        match provisioner.provision(&setup("localhost")) {
            Err(Error::Conflict(msg)) => assert!(msg.contains("already exists"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!dir.log().iter().any(DirectoryOp::is_mutation));
    }

    #[test]
    fn removal_goes_mapping_backend_data() {
        let dir = MemoryDirectory::new();
        let provisioner = provisioner(Arc::new(dir.clone()));
        provisioner.provision(&setup("localhost")).unwrap();
        dir.clear_log();

        let mut again = setup("localhost");
        again.remove_data = true;
        let report = provisioner.provision(&again).unwrap();
        assert!(report.removed.base && report.removed.mapping && report.removed.backend);

        let log = dir.log();
        let deleted = |dn: &str| {
            log.iter()
                .position(|op| matches!(
                    op, DirectoryOp::Delete(d) if normalize_dn(d) == normalize_dn(dn)
                ))
                .unwrap_or_else(|| panic!("{dn} not deleted"))
        };
        let db = db("localhost");
        let mapping = deleted(&db.mapping_dn());
        let backend = deleted(&db.backend_dn());
        let base = deleted(&db.base_dn);
        assert!(mapping < backend && backend < base, "{mapping} {backend} {base}");

        // Everything is back afterwards.
        assert!(dir.peek("o=pki-tomcat-CA").is_some());
        assert!(dir.peek(&db.backend_dn()).is_some());
    }

    #[test]
    fn backend_of_other_base_dn_is_refused() {
        let dir = MemoryDirectory::new();
        dir.seed([
            Entry::new(backend_dn("pki-tomcat-CA")).with("objectClass", "nsBackendInstance"),
            Entry::new(mapping_dn("o=other"))
                .with("objectClass", "nsMappingTree")
                .with("cn", "o=other")
                .with("nsslapd-backend", "pki-tomcat-CA"),
        ]);
        let mut setup = setup("localhost");
        setup.remove_data = true;
        dir.clear_log();

        assert!(matches!(
            provisioner(Arc::new(dir.clone())).provision(&setup),
            Err(Error::Conflict(_))
        ));
        assert!(!dir.log().iter().any(DirectoryOp::is_mutation));
    }

    #[test]
    fn reuse_requires_existing_database() {
        let dir = MemoryDirectory::new();
        let mut setup = setup("localhost");
        setup.create_new_db = false;
        assert!(matches!(
            provisioner(Arc::new(dir)).provision(&setup),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn clone_gets_replicated_database() {
        let pool = MemoryDirectoryPool::default();
        let master_dir = pool.server("ds1.example.com", 389);
        provisioner(Arc::new(pool.clone())).provision(&setup("ds1.example.com")).unwrap();

        let mut clone = setup("ds2.example.com");
        clone.clone = Some(CloneSource {
            master: db("ds1.example.com"),
            master_replication_port: 389,
            clone_replication_port: 389,
            master_replica_id: 96,
            replication_password: "Secret.123".into(),
            setup_replication: true,
        });
        let report = provisioner(Arc::new(pool.clone())).provision(&clone).unwrap();

        assert_eq!(report.imported, vec!["index.ldif", "vlv.ldif", "vlvtasks.ldif"]);
        assert_eq!(report.replication.unwrap().clone_replica_id, 97);
        let clone_dir = pool.server("ds2.example.com", 389);
        assert!(clone_dir.peek("o=pki-tomcat-CA").is_none());
        assert!(master_dir.peek(&replication::replica_dn("o=pki-tomcat-CA")).is_some());
    }

    #[test]
    fn clone_on_master_server_is_inconsistent() {
        let mut clone = setup("ds1.example.com");
        clone.clone = Some(CloneSource {
            master: db("DS1.example.com"),
            master_replication_port: 389,
            clone_replication_port: 389,
            master_replica_id: 96,
            replication_password: "Secret.123".into(),
            setup_replication: true,
        });
        let dir = MemoryDirectory::new();
        assert!(matches!(
            provisioner(Arc::new(dir.clone())).provision(&clone),
            Err(Error::Consistency(_))
        ));
        assert!(dir.log().is_empty());
    }
}
