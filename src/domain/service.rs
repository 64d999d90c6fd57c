//! The domain manager side of the security domain.
//!
//! A CA managing a domain hands out install tokens to administrators of
//! new subsystems, serves the domain descriptor and maintains the host
//! lists when instances join or leave. Clones of its subsystems also ask
//! it for configuration values and number ranges.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use log::{debug, info, warn};
use rand::Rng;
use crate::commons::error::Error;
use crate::commons::{SetupEmptyResult, SetupResult};
use crate::constants::AUDIT_LOG_TARGET;
use crate::database::InternalDb;
use crate::directory::{
    Directory, DirectoryFactory, Filter, ResultCode, Scope,
};
use crate::remote::response::{ConfigEntries, NumberRange};
use crate::remote::{DomainOperation, HostRegistration, RangeKind};
use crate::store::ConfigStore;
use crate::users::{DirectoryUserStore, UserGroupSubsystem};
use super::{domain_dn, list_dn, DomainInfo, HostInfo, SubsystemType};


//------------ InstallSession ------------------------------------------------

/// Who an install token was issued to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstallSession {
    pub user: String,
    pub source_ip: String,
    pub group: String,
    pub hostname: String,
    pub subsystem: SubsystemType,
}


//------------ SessionTable --------------------------------------------------

pub trait SessionTable: Send + Sync {
    fn put(&self, id: &str, session: InstallSession);

    /// Returns a live session.
    fn get(&self, id: &str) -> Option<InstallSession>;

    fn remove(&self, id: &str) -> Option<InstallSession>;
}


//------------ MemorySessionTable --------------------------------------------

/// A process wide session table.
///
/// Sessions stay valid for any number of uses until their time to live
/// runs out.
#[derive(Debug)]
pub struct MemorySessionTable {
    ttl: Duration,
    sessions: Mutex<HashMap<String, (Instant, InstallSession)>>,
}

impl MemorySessionTable {
    pub fn new(ttl: Duration) -> Self {
        MemorySessionTable {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, (Instant, InstallSession)>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("session table lock was poisoned");
                poisoned.into_inner()
            }
        }
    }
}

impl SessionTable for MemorySessionTable {
    fn put(&self, id: &str, session: InstallSession) {
        let mut sessions = self.sessions();
        let ttl = self.ttl;
        sessions.retain(|_, (created, _)| created.elapsed() < ttl);
        sessions.insert(id.to_string(), (Instant::now(), session));
    }

    fn get(&self, id: &str) -> Option<InstallSession> {
        let mut sessions = self.sessions();
        match sessions.get(id) {
            Some((created, session)) if created.elapsed() < self.ttl => {
                Some(session.clone())
            }
            Some(_) => {
                debug!("Install session {id} expired");
                sessions.remove(id);
                None
            }
            None => None,
        }
    }

    fn remove(&self, id: &str) -> Option<InstallSession> {
        self.sessions().remove(id).map(|(_, session)| session)
    }
}


//------------ SecurityDomainService -----------------------------------------

pub struct SecurityDomainService {
    factory: Arc<dyn DirectoryFactory>,
    sessions: Arc<dyn SessionTable>,
}

impl SecurityDomainService {
    pub fn new(
        factory: Arc<dyn DirectoryFactory>, sessions: Arc<dyn SessionTable>
    ) -> Self {
        SecurityDomainService { factory, sessions }
    }

    fn connect(&self, store: &ConfigStore) -> SetupResult<(Box<dyn Directory>, String)> {
        if store.get_non_empty("securitydomain.name").is_none() {
            return Err(Error::validation("this instance does not manage a security domain"));
        }
        let db = InternalDb::from_store(store)?;
        let dir = self.factory.connect(&db.conn)?;
        Ok((dir, db.base_dn))
    }

    /// Issues an install token for setting up a subsystem on `hostname`.
    ///
    /// The user must be a member of the enterprise administrators group
    /// of the subsystem type.
    pub fn get_install_token(
        &self,
        store: &ConfigStore,
        user: &str,
        password: &str,
        source_ip: &str,
        hostname: &str,
        subsystem: SubsystemType,
    ) -> SetupResult<String> {
        let (dir, base_dn) = self.connect(store)?;
        let users = DirectoryUserStore::new(dir, &base_dn);
        let group = subsystem.enterprise_admin_group();

        if !users.authenticate(user, password)? {
            warn!(
                target: AUDIT_LOG_TARGET,
                "Install token for {hostname} denied: authentication of '{user}' \
                 from {source_ip} failed"
            );
            return Err(Error::AuthenticationFailure(format!(
                "invalid credentials for '{user}'"
            )));
        }
        if !users.is_member(user, &group)? {
            warn!(
                target: AUDIT_LOG_TARGET,
                "Install token for {hostname} denied: '{user}' from {source_ip} \
                 is not in '{group}'"
            );
            return Err(Error::unauthorized(format!(
                "'{user}' is not a member of '{group}'"
            )));
        }

        // Nineteen decimal digits.
        let id = rand::rng()
            .random_range(
                1_000_000_000_000_000_000u64..10_000_000_000_000_000_000u64
            )
            .to_string();
        self.sessions.put(&id, InstallSession {
            user: user.to_string(),
            source_ip: source_ip.to_string(),
            group: group.clone(),
            hostname: hostname.to_string(),
            subsystem,
        });
        info!(
            target: AUDIT_LOG_TARGET,
            "Issued install token for {subsystem} on {hostname} to '{user}' from {source_ip}"
        );
        Ok(id)
    }

    /// Returns the session for a token or fails as unauthorized.
    pub fn validate_session(&self, session_id: &str) -> SetupResult<InstallSession> {
        self.sessions.get(session_id.trim()).ok_or_else(|| {
            warn!(target: AUDIT_LOG_TARGET, "Rejected unknown install token");
            Error::unauthorized("invalid or expired install token")
        })
    }

    pub fn get_domain_info(&self, store: &ConfigStore) -> SetupResult<DomainInfo> {
        let (dir, base_dn) = self.connect(store)?;
        load_domain(dir.as_ref(), &base_dn)
    }

    /// Adds or removes a host as asked for by a registration.
    ///
    /// Adding a host listed already and removing one not listed are no
    /// errors.
    pub fn update_domain(
        &self,
        store: &ConfigStore,
        registration: &HostRegistration,
        session_id: &str,
    ) -> SetupEmptyResult {
        let session = self.validate_session(session_id)?;
        let (dir, base_dn) = self.connect(store)?;
        let kind = registration.kind;
        let host = &registration.host;
        let dn = host.to_entry(&list_dn(&base_dn, kind)).dn().to_string();

        match registration.operation {
            DomainOperation::Add => {
                // Checks the domain manager rules.
                let mut domain = load_domain(dir.as_ref(), &base_dn)?;
                domain.add_host(kind, host.clone())?;

                match dir.add(host.to_entry(&list_dn(&base_dn, kind))) {
                    Ok(()) => {}
                    Err(err) if err.code() == ResultCode::EntryAlreadyExists => {
                        debug!("{dn} is registered already");
                    }
                    Err(err) => return Err(err.into()),
                }
                info!(
                    target: AUDIT_LOG_TARGET,
                    "Added {kind} {} to the security domain for '{}'",
                    host.entry_name(), session.user
                );
            }
            DomainOperation::Remove => {
                match dir.delete(&dn) {
                    Ok(()) => {}
                    Err(err) if err.code() == ResultCode::NoSuchObject => {
                        debug!("{dn} is not registered");
                    }
                    Err(err) => return Err(err.into()),
                }
                info!(
                    target: AUDIT_LOG_TARGET,
                    "Removed {kind} {} from the security domain for '{}'",
                    host.entry_name(), session.user
                );
            }
        }
        Ok(())
    }

    /// Returns configuration values for a clone.
    ///
    /// Unknown names are left out, as are passwords.
    pub fn get_config_entries(
        &self,
        store: &ConfigStore,
        names: &[String],
        session_id: &str,
    ) -> SetupResult<ConfigEntries> {
        self.validate_session(session_id)?;
        let mut res = BTreeMap::new();
        for name in names {
            let name = name.trim();
            if name.to_ascii_lowercase().contains("password") {
                warn!("Refusing to hand out '{name}'");
                continue;
            }
            if let Some(value) = store.get(name) {
                res.insert(name.to_string(), value.to_string());
            }
        }
        Ok(ConfigEntries(res))
    }

    /// Hands a clone the top part of our current range of numbers.
    ///
    /// Our own range ends before the handed out part from then on.
    pub fn update_number_range(
        &self,
        store: &mut ConfigStore,
        kind: RangeKind,
        session_id: &str,
    ) -> SetupResult<NumberRange> {
        self.validate_session(session_id)?;
        let (begin_key, end_key, increment_key) = kind.config_keys();
        let begin = store.get_int(begin_key)?;
        let end = store.get_int(end_key)?;
        let increment = store.get_int(increment_key)?;

        let range_begin = end - increment + 1;
        if increment <= 0 || range_begin <= begin {
            return Err(Error::conflict(format!(
                "{} range {begin}-{end} cannot spare {increment} numbers",
                kind.as_str()
            )));
        }
        store.put(end_key, range_begin - 1);
        store.commit()?;

        let range = NumberRange {
            begin: range_begin as u64,
            end: end as u64,
        };
        info!("Handed out {} range {}-{}", kind.as_str(), range.begin, range.end);
        Ok(range)
    }
}


//------------ load_domain ---------------------------------------------------

/// Reads the domain registered below `base_dn`.
pub fn load_domain(dir: &dyn Directory, base_dn: &str) -> SetupResult<DomainInfo> {
    let root = dir.read_opt(&domain_dn(base_dn))?.ok_or_else(|| {
        Error::custom(format!("no security domain below {base_dn}"))
    })?;
    let mut domain = DomainInfo::new(root.first("name").unwrap_or_default());
    for kind in SubsystemType::ALL {
        let entries = match dir.search(
            &list_dn(base_dn, kind), Scope::OneLevel, &Filter::any()
        ) {
            Ok(entries) => entries,
            Err(err) if err.code() == ResultCode::NoSuchObject => continue,
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            domain.add_host(kind, HostInfo::from_entry(&entry)?)?;
        }
    }
    Ok(domain)
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Entry, MemoryDirectory};

    const BASE: &str = "o=pki-tomcat";

    fn store() -> ConfigStore {
        let mut store = ConfigStore::in_memory();
        store.put("securitydomain.name", "Example Domain");
        store.put("internaldb.ldapconn.host", "localhost");
        store.put("internaldb.ldapconn.port", 389);
        store.put("internaldb.ldapauth.bindDN", "cn=Directory Manager");
        store.put("internaldb.ldapauth.password", "Secret.123");
        store.put("internaldb.basedn", BASE);
        store.put("internaldb.database", "ca");
        store
    }

    fn service() -> (MemoryDirectory, SecurityDomainService) {
        let dir = MemoryDirectory::empty();
        dir.seed([
            Entry::new(BASE),
            Entry::new(format!("ou=people,{BASE}")),
            Entry::new(format!("ou=groups,{BASE}")),
            Entry::new(format!("cn=Enterprise KRA Administrators,ou=groups,{BASE}"))
                .with("uniqueMember", format!("uid=caadmin,ou=people,{BASE}")),
            Entry::new(format!("uid=caadmin,ou=people,{BASE}"))
                .with("uid", "caadmin")
                .with("userPassword", "Secret.123"),
            Entry::new(format!("uid=agent,ou=people,{BASE}"))
                .with("uid", "agent")
                .with("userPassword", "Secret.123"),
            Entry::new(domain_dn(BASE)).with("name", "Example Domain"),
            Entry::new(list_dn(BASE, SubsystemType::Ca)),
            Entry::new(list_dn(BASE, SubsystemType::Kra)),
        ]);
        let service = SecurityDomainService::new(
            Arc::new(dir.clone()),
            Arc::new(MemorySessionTable::new(Duration::from_secs(60))),
        );
        (dir, service)
    }

    fn kra() -> HostRegistration {
        HostRegistration {
            kind: SubsystemType::Kra,
            host: HostInfo {
                host: "kra.example.com".into(),
                secure_port: 8443,
                secure_agent_port: 8443,
                secure_admin_port: 8443,
                subsystem_name: "KRA kra.example.com 8443".into(),
                ..Default::default()
            },
            operation: DomainOperation::Add,
        }
    }

    #[test]
    fn install_token_requires_enterprise_admin() {
        let (_dir, service) = service();
        let store = store();

        let token = service
            .get_install_token(&store, "caadmin", "Secret.123", "192.0.2.7", "kra.example.com", SubsystemType::Kra)
            .unwrap();
        assert_eq!(token.len(), 19);
        assert!(token.bytes().all(|b| b.is_ascii_digit()), "{token}");
        assert_eq!(service.validate_session(&token).unwrap().user, "caadmin");

        assert!(matches!(
            service.get_install_token(&store, "caadmin", "wrong", "192.0.2.7", "kra.example.com", SubsystemType::Kra),
            Err(Error::AuthenticationFailure(_))
        ));
        assert!(matches!(
            service.get_install_token(&store, "agent", "Secret.123", "192.0.2.7", "kra.example.com", SubsystemType::Kra),
            Err(Error::Unauthorized(_))
        ));
    }

    #[test]
    fn hosts_are_added_once_and_removed() {
        let (_dir, service) = service();
        let store = store();
        let token = service
            .get_install_token(&store, "caadmin", "Secret.123", "192.0.2.7", "kra.example.com", SubsystemType::Kra)
            .unwrap();

        assert!(matches!(
            service.update_domain(&store, &kra(), "bogus"),
            Err(Error::Unauthorized(_))
        ));
        service.update_domain(&store, &kra(), &token).unwrap();
        service.update_domain(&store, &kra(), &token).unwrap();
        let domain = service.get_domain_info(&store).unwrap();
        assert_eq!(domain.hosts(SubsystemType::Kra).len(), 1);

        let mut remove = kra();
        remove.operation = DomainOperation::Remove;
        service.update_domain(&store, &remove, &token).unwrap();
        service.update_domain(&store, &remove, &token).unwrap();
        assert!(service.get_domain_info(&store).unwrap().hosts(SubsystemType::Kra).is_empty());
    }

    #[test]
    fn number_ranges_are_carved_from_the_top() {
        let (_dir, service) = service();
        let mut store = store();
        store.put("dbs.beginSerialNumber", 1);
        store.put("dbs.endSerialNumber", 10_000_000);
        store.put("dbs.serialIncrement", 1_000_000);
        let token = service
            .get_install_token(&store, "caadmin", "Secret.123", "192.0.2.7", "kra.example.com", SubsystemType::Kra)
            .unwrap();

        let range = service.update_number_range(&mut store, RangeKind::Serial, &token).unwrap();
        assert_eq!(range, NumberRange { begin: 9_000_001, end: 10_000_000 });
        assert_eq!(store.get("dbs.endSerialNumber"), Some("9000000"));

        let entries = service.get_config_entries(
            &store,
            &["internaldb.basedn".into(), "internaldb.ldapauth.password".into()],
            &token,
        ).unwrap();
        assert_eq!(entries.0.len(), 1);
    }

    #[test]
    fn sessions_expire() {
        let table = MemorySessionTable::new(Duration::ZERO);
        table.put("1", InstallSession {
            user: "caadmin".into(),
            source_ip: "192.0.2.7".into(),
            group: "Enterprise CA Administrators".into(),
            hostname: "ca2.example.com".into(),
            subsystem: SubsystemType::Ca,
        });
        assert!(table.get("1").is_none());
    }
}
