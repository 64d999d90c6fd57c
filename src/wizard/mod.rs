//! The configuration workflow.
//!
//! A [`ConfigurationRequest`] is checked as a whole and then carried out
//! as the sequence of [`Step`]s. Every step records a digest of its inputs
//! in the installation journal when it completes. Submitting the same
//! request again after a failure skips the steps that completed and
//! continues with the one that failed. A step whose inputs changed is run
//! again together with everything after it.
//!
//! Nothing is rolled back when a step fails. Whatever it created stays in
//! place and is found by the existence checks of the next attempt.

pub mod certs;
pub mod done;
pub mod validate;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use log::{debug, info, warn};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use crate::api::{
    AdminRequest, ConfigurationRequest, ConfigurationResponse, DatabaseRequest,
    Hierarchy,
};
use crate::certs::transfer::CertImportExport;
use crate::commons::error::Error;
use crate::commons::{file, SetupEmptyResult, SetupResult};
use crate::constants::CS_TYPE_KEY;
use crate::crypto::CryptoToken;
use crate::database::task::TaskPoller;
use crate::database::{CloneSource, DatabaseProvisioner, DatabaseSetup, InternalDb};
use crate::directory::{DirectoryFactory, LdapConnInfo};
use crate::domain::bootstrap::SecurityDomainBootstrap;
use crate::domain::{HostInfo, SubsystemType};
use crate::remote::RemoteAdminClient;
use crate::store::journal::{InstallationJournal, Step, StepState};
use crate::store::ConfigStore;
use self::validate::{non_empty, parse_peer, EXTERNAL_CA};


//------------ ConfigurationOrchestrator -------------------------------------

pub struct ConfigurationOrchestrator {
    store: ConfigStore,
    token: Arc<dyn CryptoToken>,
    remote: RemoteAdminClient,
    directories: Arc<dyn DirectoryFactory>,
    profiles_dir: Option<PathBuf>,
    ldif_dir: Option<PathBuf>,
    poller: TaskPoller,

    /// Written once the instance is configured.
    restart_marker: Option<PathBuf>,
}

impl ConfigurationOrchestrator {
    pub fn new(
        store: ConfigStore,
        token: Arc<dyn CryptoToken>,
        remote: RemoteAdminClient,
        directories: Arc<dyn DirectoryFactory>,
    ) -> Self {
        ConfigurationOrchestrator {
            store,
            token,
            remote,
            directories,
            profiles_dir: None,
            ldif_dir: None,
            poller: TaskPoller::default(),
            restart_marker: None,
        }
    }

    pub fn with_profiles_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.profiles_dir = dir;
        self
    }

    pub fn with_ldif_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.ldif_dir = dir;
        self
    }

    pub fn with_poller(mut self, poller: TaskPoller) -> Self {
        self.poller = poller;
        self
    }

    pub fn with_restart_marker(mut self, path: PathBuf) -> Self {
        self.restart_marker = Some(path);
        self
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ConfigStore {
        &mut self.store
    }

    pub fn poller(&self) -> &TaskPoller {
        &self.poller
    }

    /// The subsystem type of this instance.
    pub fn kind(&self) -> SetupResult<SubsystemType> {
        self.store.get_string(CS_TYPE_KEY)?.parse()
    }

    /// Configures the instance.
    pub fn configure(
        &mut self, request: &ConfigurationRequest
    ) -> SetupResult<ConfigurationResponse> {
        let kind = self.kind()?;
        validate::check_request(&self.store, kind, request)?;
        info!(
            "Configuring {kind} '{}'{}",
            request.subsystem_name,
            if request.is_clone { " as clone" } else { "" }
        );

        if let Some(password) = &request.token_password {
            self.token.login(password)?;
        }

        self.run_step(Step::Token, &request.token_name(), |o| {
            o.select_token(request)
        })?;
        self.run_step(Step::SecurityDomain, &SecurityDomainInputs::new(request), |o| {
            o.select_security_domain(kind, request)
        })?;
        self.run_step(Step::Subsystem, &SubsystemInputs::new(request), |o| {
            o.identify_subsystem(kind, request)
        })?;
        self.run_step(Step::Hierarchy, &HierarchyInputs::new(request), |o| {
            o.select_hierarchy(kind, request)
        })?;
        self.run_step(Step::Database, &DatabaseInputs::new(request), |o| {
            o.provision_database(request)
        })?;
        self.run_step(Step::Certificates, &request.system_certs, |o| {
            certs::issue_system_certs(o, kind, request)
        })?;
        if !request.is_clone {
            self.run_step(Step::Admin, &AdminInputs::new(request), |o| {
                certs::create_admin(o, kind, request)
            })?;
        }
        self.run_step(Step::Done, &DoneInputs::new(request), |o| {
            done::finish(o, kind, request)
        })?;

        let response = certs::response(&self.store, kind, request)?;
        self.commit_installation()?;
        info!("{kind} '{}' is configured, restart to activate", request.subsystem_name);
        Ok(response)
    }

    /// Runs a step unless it completed with the same inputs before.
    ///
    /// Returns whether the step was run.
    fn run_step<I, F>(&mut self, step: Step, inputs: &I, action: F) -> SetupResult<bool>
    where
        I: Serialize,
        F: FnOnce(&mut Self) -> SetupEmptyResult,
    {
        let digest = InstallationJournal::digest(inputs)?;
        let state = InstallationJournal::new(&mut self.store).state(step, &digest)?;
        match state {
            StepState::Completed(record) => {
                debug!("Step '{step}' completed at {}, skipping", record.completed);
                return Ok(false);
            }
            StepState::Stale(_) => {
                let invalidated = InstallationJournal::new(&mut self.store)
                    .invalidate_from(step)?;
                for done in invalidated {
                    self.clean_up(done);
                }
                if let Err(err) = self.store.commit() {
                    warn!("Cannot save invalidated journal: {err}");
                }
            }
            StepState::Pending => {}
        }

        info!("Running step '{step}'");
        if let Err(err) = action(self) {
            warn!("Step '{step}' failed: {err}");
            return Err(err);
        }
        InstallationJournal::new(&mut self.store).complete(step, digest, BTreeMap::new())?;
        Ok(true)
    }

    /// Forgets what an invalidated step left in the journal namespace.
    ///
    /// Keys, certificates and directory entries stay. They are reused or
    /// replaced when the step runs again.
    fn clean_up(&mut self, step: Step) {
        let prefixes: &[&str] = match step {
            Step::SecurityDomain => &["preop.securitydomain"],
            Step::Subsystem => &["preop.subsystem", "preop.master", "preop.restored"],
            Step::Hierarchy => &["preop.hierarchy", "preop.ca"],
            Step::Certificates => &["preop.cert"],
            Step::Done => &["preop.done"],
            Step::Token | Step::Database | Step::Admin => &[],
        };
        let removed: usize = prefixes
            .iter()
            .map(|prefix| self.store.remove_prefix(prefix))
            .sum();
        debug!("Cleaned up {removed} values of step '{step}'");
    }

    fn commit_installation(&mut self) -> SetupEmptyResult {
        InstallationJournal::new(&mut self.store).commit_installation()?;
        if let Some(marker) = &self.restart_marker {
            file::save(b"", marker)?;
            debug!("Wrote restart marker {}", marker.display());
        }
        Ok(())
    }


    //--- Steps

    fn select_token(&mut self, request: &ConfigurationRequest) -> SetupEmptyResult {
        let name = request.token_name();
        if name != "internal" && name != self.token.name() {
            return Err(Error::validation(format!("unknown token '{name}'")));
        }
        self.store.put("preop.module.token", name);
        Ok(self.store.commit()?)
    }

    fn select_security_domain(
        &mut self, kind: SubsystemType, request: &ConfigurationRequest
    ) -> SetupEmptyResult {
        let me = self.local_host(request)?;
        if request.is_new_domain() {
            let name = non_empty(&request.security_domain_name).unwrap_or_default();
            self.store.put("preop.securitydomain.select", "new");
            self.store.put("preop.securitydomain.name", name);
            self.store.put("preop.securitydomain.host", &me.host);
            self.store.put("preop.securitydomain.httpsport", me.secure_port);
            self.store.put("preop.securitydomain.httpsadminport", me.secure_admin_port);
            return Ok(self.store.commit()?);
        }

        let sd = parse_peer(
            "securityDomainUri",
            non_empty(&request.security_domain_uri).unwrap_or_default(),
        )?;
        let session_id = match non_empty(&request.install_token) {
            Some(token) => token.to_string(),
            None => self.remote.get_install_token(
                &sd,
                non_empty(&request.security_domain_user).unwrap_or_default(),
                request.security_domain_password.as_deref().unwrap_or_default(),
                &me.host,
                kind,
            )?,
        };
        self.store.put("preop.securitydomain.select", "existing");
        self.store.put("preop.securitydomain.uri", &sd);
        self.store.put("preop.securitydomain.sessionID", session_id);
        SecurityDomainBootstrap::new(self.remote.clone()).fetch_domain(&sd, &mut self.store)?;
        Ok(())
    }

    fn identify_subsystem(
        &mut self, kind: SubsystemType, request: &ConfigurationRequest
    ) -> SetupEmptyResult {
        self.store.put("preop.subsystem.name", &request.subsystem_name);
        if !request.is_clone {
            self.store.put("preop.subsystem.select", "new");
            return Ok(self.store.commit()?);
        }
        self.store.put("preop.subsystem.select", "clone");

        let importer = CertImportExport::new(self.token.clone());
        let password = request.p12_password.as_deref().unwrap_or_default();
        let mut restored = Vec::new();
        for path in &request.p12_files {
            let data = file::read(Path::new(path))?;
            restored.extend(importer.import_pkcs12(&data, password)?);
        }
        for tag in kind.system_cert_tags() {
            let nickname = certs::nickname(kind, request, *tag);
            if restored.contains(&nickname) {
                self.store.put(&format!("preop.restored.{tag}"), nickname);
            }
        }

        let master = parse_peer(
            "cloneUri", non_empty(&request.clone_uri).unwrap_or_default()
        )?;
        let session_id = self.session_id()?;
        let entries = self.remote.get_config_entries(
            &master, &master_entry_names(kind), &session_id
        )?;
        for (name, value) in entries {
            self.store.put(&format!("preop.master.{name}"), value);
        }
        self.store.put("preop.master.hostname", &master.host);
        self.store.put("preop.master.httpsport", master.port);
        info!("Cloning {kind} at {master}, restored {}", restored.join(", "));
        Ok(self.store.commit()?)
    }

    fn select_hierarchy(
        &mut self, kind: SubsystemType, request: &ConfigurationRequest
    ) -> SetupEmptyResult {
        let hierarchy = request.hierarchy();
        if kind == SubsystemType::Ca {
            self.store.put("preop.hierarchy.select", match hierarchy {
                Hierarchy::Root => "root",
                Hierarchy::Join => "join",
            });
            if hierarchy == Hierarchy::Root || request.is_clone {
                return Ok(self.store.commit()?);
            }
        }

        match non_empty(&request.issuing_ca) {
            Some(EXTERNAL_CA) => {
                self.store.put("preop.ca.type", "otherca");
                if let Some(chain) = non_empty(&request.external_ca_chain) {
                    CertImportExport::new(self.token.clone()).import_chain(chain.as_bytes())?;
                }
            }
            Some(uri) => {
                let ca = parse_peer("issuingCa", uri)?;
                self.store.put("preop.ca.type", "sdca");
                self.store.put("preop.ca.hostname", &ca.host);
                self.store.put("preop.ca.httpsport", ca.port);
            }
            None => {
                // The domain manager issues.
                let host = self.store.get_string("preop.securitydomain.host")?;
                let port = self.store.get_port("preop.securitydomain.httpsport")?;
                self.store.put("preop.ca.type", "sdca");
                self.store.put("preop.ca.hostname", host);
                self.store.put("preop.ca.httpsport", port);
            }
        }
        Ok(self.store.commit()?)
    }

    fn provision_database(&mut self, request: &ConfigurationRequest) -> SetupEmptyResult {
        let db_request = request.database.as_ref().ok_or_else(|| {
            Error::validation("missing database settings")
        })?;
        let db = InternalDb {
            conn: db_request.conn_info(),
            base_dn: db_request.base_dn.clone(),
            database: db_request.database.clone(),
        };
        let clone = if request.is_clone {
            Some(self.clone_source(db_request)?)
        } else {
            None
        };
        let setup = DatabaseSetup {
            db: db.clone(),
            instance_id: self.instance_id(),
            create_new_db: db_request.create_new_db,
            remove_data: db_request.remove_data,
            reindex_data: db_request.reindex_data,
            clone,
        };

        let provisioner = DatabaseProvisioner::new(
            self.directories.clone(), self.ldif_dir.clone(), self.poller.clone()
        );
        let report = provisioner.provision(&setup)?;

        db.save(&mut self.store);
        if let Some(clone) = &setup.clone {
            self.store.put("internaldb.replication.password", &clone.replication_password);
        }
        if let Some(replication) = report.replication {
            self.store.put("dbs.replicaId", replication.clone_replica_id);
        }
        Ok(self.store.commit()?)
    }


    //--- Helpers

    /// The install token session with the security domain.
    fn session_id(&self) -> SetupResult<String> {
        self.store
            .get_non_empty("preop.securitydomain.sessionID")
            .map(ToString::to_string)
            .ok_or_else(|| Error::validation("no install token for the security domain"))
    }

    fn instance_id(&self) -> String {
        self.store.get_string_or("instanceId", "pki-tomcat")
    }

    /// How this instance is listed in the security domain.
    fn local_host(&self, request: &ConfigurationRequest) -> SetupResult<HostInfo> {
        let host = self.store.get_string("service.machineName")?;
        let secure_port = port_or(&self.store, "service.securePort", 8443)?;
        let unsecure_port = match self.store.get_non_empty("service.unsecurePort") {
            Some(_) => Some(self.store.get_port("service.unsecurePort")?),
            None => None,
        };
        Ok(HostInfo {
            host,
            unsecure_port,
            secure_port,
            secure_ee_client_auth_port: Some(
                port_or(&self.store, "service.clientauth_securePort", secure_port)?
            ),
            secure_agent_port: port_or(&self.store, "service.secureAgentPort", secure_port)?,
            secure_admin_port: port_or(&self.store, "service.secureAdminPort", secure_port)?,
            clone: request.is_clone,
            subsystem_name: request.subsystem_name.clone(),
            domain_manager: false,
        })
    }

    /// The master database of a clone as reported by the master.
    ///
    /// The master does not hand out passwords, the clone's bind password
    /// is used on both servers.
    fn clone_source(&self, request: &DatabaseRequest) -> SetupResult<CloneSource> {
        let master = InternalDb {
            conn: LdapConnInfo {
                host: self.store.get_string("preop.master.internaldb.ldapconn.host")?,
                port: self.store.get_port("preop.master.internaldb.ldapconn.port")?,
                secure: self.store.get_bool_or(
                    "preop.master.internaldb.ldapconn.secureConn", false
                )?,
                bind_dn: self.store.get_string_or(
                    "preop.master.internaldb.ldapauth.bindDN", &request.bind_dn
                ),
                bind_password: request.bind_pwd.clone(),
            },
            base_dn: self.store.get_string("preop.master.internaldb.basedn")?,
            database: self.store.get_string("preop.master.internaldb.database")?,
        };
        let master_replica_id = self.store.get_int_or(
            "preop.master.dbs.beginReplicaNumber", 1
        )?;
        let replication_password = match self.store.get_non_empty(
            "internaldb.replication.password"
        ) {
            Some(password) => password.to_string(),
            None => rand::rng()
                .sample_iter(&Alphanumeric)
                .take(24)
                .map(char::from)
                .collect(),
        };
        Ok(CloneSource {
            master_replication_port: request
                .master_replication_port
                .unwrap_or(master.conn.port),
            clone_replication_port: request.clone_replication_port.unwrap_or(request.ds_port),
            master,
            master_replica_id: u32::try_from(master_replica_id).map_err(|_| {
                Error::validation(format!("invalid master replica id {master_replica_id}"))
            })?,
            replication_password,
            setup_replication: request.setup_replication,
        })
    }
}

/// The values a clone needs from its master.
fn master_entry_names(kind: SubsystemType) -> Vec<String> {
    let mut names: Vec<String> = [
        "internaldb.ldapconn.host",
        "internaldb.ldapconn.port",
        "internaldb.ldapconn.secureConn",
        "internaldb.ldapauth.bindDN",
        "internaldb.basedn",
        "internaldb.database",
        "dbs.beginReplicaNumber",
    ].into_iter().map(ToString::to_string).collect();
    for tag in kind.system_cert_tags() {
        names.push(format!("{}.{tag}.nickname", kind.lower()));
    }
    names
}

fn port_or(store: &ConfigStore, key: &str, default: u16) -> SetupResult<u16> {
    match store.get_non_empty(key) {
        Some(_) => Ok(store.get_port(key)?),
        None => Ok(default),
    }
}


//------------ Step Inputs ---------------------------------------------------

// What each step depends on. Passwords are left out so a changed
// password alone does not repeat work.

#[derive(Serialize)]
struct SecurityDomainInputs<'a> {
    kind: Option<crate::api::SecurityDomainType>,
    name: Option<&'a str>,
    uri: Option<&'a str>,
    user: Option<&'a str>,
    install_token: Option<&'a str>,
}

impl<'a> SecurityDomainInputs<'a> {
    fn new(request: &'a ConfigurationRequest) -> Self {
        SecurityDomainInputs {
            kind: request.security_domain_type,
            name: non_empty(&request.security_domain_name),
            uri: non_empty(&request.security_domain_uri),
            user: non_empty(&request.security_domain_user),
            install_token: non_empty(&request.install_token),
        }
    }
}

#[derive(Serialize)]
struct SubsystemInputs<'a> {
    name: &'a str,
    is_clone: bool,
    clone_uri: Option<&'a str>,
    p12_files: &'a [String],
}

impl<'a> SubsystemInputs<'a> {
    fn new(request: &'a ConfigurationRequest) -> Self {
        SubsystemInputs {
            name: &request.subsystem_name,
            is_clone: request.is_clone,
            clone_uri: non_empty(&request.clone_uri),
            p12_files: &request.p12_files,
        }
    }
}

#[derive(Serialize)]
struct HierarchyInputs<'a> {
    hierarchy: Hierarchy,
    issuing_ca: Option<&'a str>,
    external_ca_chain: Option<&'a str>,
}

impl<'a> HierarchyInputs<'a> {
    fn new(request: &'a ConfigurationRequest) -> Self {
        HierarchyInputs {
            hierarchy: request.hierarchy(),
            issuing_ca: non_empty(&request.issuing_ca),
            external_ca_chain: non_empty(&request.external_ca_chain),
        }
    }
}

#[derive(Serialize)]
struct DatabaseInputs(Option<DatabaseRequest>);

impl DatabaseInputs {
    fn new(request: &ConfigurationRequest) -> Self {
        DatabaseInputs(request.database.clone().map(|mut database| {
            database.bind_pwd.clear();
            database
        }))
    }
}

#[derive(Serialize)]
struct AdminInputs(Option<AdminRequest>);

impl AdminInputs {
    fn new(request: &ConfigurationRequest) -> Self {
        AdminInputs(request.admin.clone().map(|mut admin| {
            admin.admin_password.clear();
            admin
        }))
    }
}

#[derive(Serialize)]
struct DoneInputs<'a> {
    backup_keys: bool,
    backup_file: Option<&'a str>,
    ca_uri: Option<&'a str>,
    kra_uri: Option<&'a str>,
    tks_uri: Option<&'a str>,
    enable_server_side_keygen: bool,
}

impl<'a> DoneInputs<'a> {
    fn new(request: &'a ConfigurationRequest) -> Self {
        DoneInputs {
            backup_keys: request.backup_keys,
            backup_file: non_empty(&request.backup_file),
            ca_uri: non_empty(&request.ca_uri),
            kra_uri: non_empty(&request.kra_uri),
            tks_uri: non_empty(&request.tks_uri),
            enable_server_side_keygen: request.enable_server_side_keygen,
        }
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::crypto::SoftToken;
    use crate::directory::MemoryDirectoryPool;
    use crate::remote::transport::Transport;
    use crate::commons::httpclient::{self, Credentials};

    struct NoTransport;

    impl Transport for NoTransport {
        fn post_form(
            &self, uri: &str, _form: &[(String, String)], _creds: Option<&Credentials>
        ) -> Result<String, httpclient::Error> {
            Err(httpclient::Error::execute(uri, "no peers in this test"))
        }

        fn get(
            &self, uri: &str, _creds: Option<&Credentials>
        ) -> Result<String, httpclient::Error> {
            Err(httpclient::Error::execute(uri, "no peers in this test"))
        }
    }

    fn orchestrator() -> ConfigurationOrchestrator {
        let mut store = ConfigStore::in_memory();
        store.put(CS_TYPE_KEY, "CA");
        ConfigurationOrchestrator::new(
            store,
            Arc::new(SoftToken::new("internal")),
            RemoteAdminClient::new(Arc::new(NoTransport)),
            Arc::new(MemoryDirectoryPool::new()),
        )
    }

    #[test]
    fn completed_step_is_skipped() {
        let mut o = orchestrator();
        let runs = AtomicUsize::new(0);
        let count = |_: &mut ConfigurationOrchestrator| {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };

        assert!(o.run_step(Step::Token, &"internal", count).unwrap());
        assert!(!o.run_step(Step::Token, &"internal", count).unwrap());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn changed_inputs_invalidate_following_steps() {
        let mut o = orchestrator();
        o.run_step(Step::Hierarchy, &"root", |o| {
            o.store.put("preop.hierarchy.select", "root");
            Ok(())
        }).unwrap();
        o.run_step(Step::Certificates, &"certs", |o| {
            o.store.put("preop.cert.signing.done", "true");
            Ok(())
        }).unwrap();

        assert!(o.run_step(Step::Hierarchy, &"join", |_| Ok(())).unwrap());
        assert!(o.store.get("preop.cert.signing.done").is_none());
        assert!(o.store.get("preop.hierarchy.select").is_none());

        let journal = InstallationJournal::new(&mut o.store);
        assert_eq!(journal.completed_steps().unwrap(), vec![Step::Hierarchy]);
    }

    #[test]
    fn passwords_do_not_make_steps_stale() {
        let mut request = ConfigurationRequest {
            database: Some(DatabaseRequest {
                ds_host: "ds.example.com".into(),
                ds_port: 389,
                secure_conn: false,
                bind_dn: "cn=Directory Manager".into(),
                bind_pwd: "Secret.123".into(),
                base_dn: "o=pki-tomcat-CA".into(),
                database: "ca".into(),
                create_new_db: true,
                remove_data: false,
                setup_replication: true,
                reindex_data: false,
                master_replication_port: None,
                clone_replication_port: None,
            }),
            ..Default::default()
        };
        let mut o = orchestrator();
        assert!(o.run_step(Step::Database, &DatabaseInputs::new(&request), |_| Ok(())).unwrap());

        if let Some(database) = request.database.as_mut() {
            database.bind_pwd = "Other.456".into();
        }
        assert!(!o.run_step(Step::Database, &DatabaseInputs::new(&request), |_| Ok(())).unwrap());

        if let Some(database) = request.database.as_mut() {
            database.base_dn = "o=other".into();
        }
        assert!(o.run_step(Step::Database, &DatabaseInputs::new(&request), |_| Ok(())).unwrap());
    }

    #[test]
    fn failed_step_is_not_recorded() {
        let mut o = orchestrator();
        let res = o.run_step(Step::Database, &1, |_| Err(Error::custom("boom")));
        assert!(res.is_err());
        assert!(o.run_step(Step::Database, &1, |_| Ok(())).unwrap());
    }

    #[test]
    fn master_entries_include_nicknames() {
        let names = master_entry_names(SubsystemType::Kra);
        assert!(names.contains(&"internaldb.basedn".to_string()));
        assert!(names.contains(&"kra.transport.nickname".to_string()));
    }
}
