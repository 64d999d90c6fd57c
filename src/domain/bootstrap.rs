//! Creating or joining a security domain.

use log::{debug, info, warn};
use crate::commons::error::Error;
use crate::commons::httpclient::Credentials;
use crate::commons::{SetupEmptyResult, SetupResult};
use crate::constants::AUDIT_LOG_TARGET;
use crate::directory::{Directory, Entry, ResultCode};
use crate::remote::{DomainOperation, HostRegistration, Peer, RemoteAdminClient};
use crate::store::ConfigStore;
use super::service::load_domain;
use super::{domain_dn, list_dn, DomainInfo, HostInfo, SubsystemType};


//------------ SecurityDomainBootstrap ---------------------------------------

#[derive(Clone, Debug)]
pub struct SecurityDomainBootstrap {
    remote: RemoteAdminClient,
}

impl SecurityDomainBootstrap {
    pub fn new(remote: RemoteAdminClient) -> Self {
        SecurityDomainBootstrap { remote }
    }

    /// Creates a new domain in the directory of this CA.
    ///
    /// Writes the domain root and a host list per subsystem type, then
    /// registers this CA as domain manager. Entries left over from an
    /// earlier attempt are kept.
    pub fn create(
        &self,
        dir: &dyn Directory,
        base_dn: &str,
        name: &str,
        me: &HostInfo,
    ) -> SetupResult<DomainInfo> {
        if name.trim().is_empty() {
            return Err(Error::validation("missing security domain name"));
        }

        let root = domain_dn(base_dn);
        let root_entry = Entry::new(root.as_str())
            .with("objectClass", "top")
            .with("objectClass", "pkiSecurityDomain")
            .with("name", name);
        if !add_if_missing(dir, root_entry)? {
            let existing = dir.read(&root)?;
            if existing.first("name") != Some(name) {
                return Err(Error::already_exists(format!(
                    "security domain '{}' at {root}",
                    existing.first("name").unwrap_or_default()
                )));
            }
        }

        for kind in SubsystemType::ALL {
            let list = Entry::new(list_dn(base_dn, kind))
                .with("objectClass", "top")
                .with("objectClass", "pkiSecurityGroup")
                .with("cn", kind.list_name());
            add_if_missing(dir, list)?;
        }

        let mut manager = me.clone();
        manager.domain_manager = true;
        add_if_missing(dir, manager.to_entry(&list_dn(base_dn, SubsystemType::Ca)))?;

        info!(
            target: AUDIT_LOG_TARGET,
            "Created security domain '{name}' managed by {}", manager.entry_name()
        );
        load_domain(dir, base_dn)
    }

    /// Fetches the descriptor of an existing domain.
    ///
    /// Records the ports of the CA at `sd` below `preop.securitydomain` so
    /// later steps can reach its interfaces, and whether that CA manages
    /// the domain.
    pub fn fetch_domain(
        &self, sd: &Peer, store: &mut ConfigStore
    ) -> SetupResult<DomainInfo> {
        let domain = self.remote.get_domain_info(sd)?;
        let manager = domain
            .hosts(SubsystemType::Ca)
            .iter()
            .find(|h| {
                h.host.eq_ignore_ascii_case(&sd.host)
                    && (h.secure_admin_port == sd.port || h.secure_port == sd.port)
            })
            .cloned();

        store.put("preop.securitydomain.name", domain.name());
        store.put("preop.securitydomain.host", &sd.host);
        match manager {
            Some(host) => {
                store.put_bool(
                    "preop.securitydomain.domainManager",
                    domain.is_domain_master(&host.host, host.secure_admin_port),
                );
                store.put("preop.securitydomain.httpsport", host.secure_port);
                store.put("preop.securitydomain.httpsadminport", host.secure_admin_port);
                store.put("preop.securitydomain.httpsagentport", host.secure_agent_port);
                store.put(
                    "preop.securitydomain.httpseeport",
                    host.secure_ee_client_auth_port.unwrap_or(host.secure_port),
                );
            }
            None => {
                warn!("{sd} is not listed in domain '{}', using its port throughout", domain.name());
                store.put_bool("preop.securitydomain.domainManager", false);
                for key in ["httpsport", "httpsadminport", "httpsagentport", "httpseeport"] {
                    store.put(&format!("preop.securitydomain.{key}"), sd.port);
                }
            }
        }
        store.commit()?;
        debug!("Domain '{}' has {} CAs", domain.name(), domain.hosts(SubsystemType::Ca).len());
        Ok(domain)
    }

    /// Lists this instance in the domain.
    ///
    /// Uses the admin interface of the domain manager and falls back to
    /// its agent interface, authenticated with the subsystem certificate.
    pub fn register(
        &self,
        sd: &Peer,
        kind: SubsystemType,
        me: &HostInfo,
        session_id: &str,
        subsystem_cert: Option<&Credentials>,
    ) -> SetupEmptyResult {
        let registration = HostRegistration {
            kind,
            host: me.clone(),
            operation: DomainOperation::Add,
        };
        self.remote.update_domain_xml(sd, &registration, session_id, subsystem_cert)?;
        info!(
            target: AUDIT_LOG_TARGET,
            "Registered {kind} {} with security domain at {sd}", me.entry_name()
        );
        Ok(())
    }

    /// Joins an existing domain: fetch its descriptor and register.
    pub fn join(
        &self,
        sd: &Peer,
        store: &mut ConfigStore,
        kind: SubsystemType,
        me: &HostInfo,
        session_id: &str,
        subsystem_cert: Option<&Credentials>,
    ) -> SetupResult<DomainInfo> {
        let mut domain = self.fetch_domain(sd, store)?;
        self.register(sd, kind, me, session_id, subsystem_cert)?;
        domain.add_host(kind, me.clone())?;
        Ok(domain)
    }

    /// Removes this instance from the domain.
    pub fn leave(
        &self,
        sd: &Peer,
        kind: SubsystemType,
        me: &HostInfo,
        session_id: &str,
    ) -> SetupEmptyResult {
        let registration = HostRegistration {
            kind,
            host: me.clone(),
            operation: DomainOperation::Remove,
        };
        self.remote.update_domain_xml(sd, &registration, session_id, None)?;
        info!(
            target: AUDIT_LOG_TARGET,
            "Removed {kind} {} from security domain at {sd}", me.entry_name()
        );
        Ok(())
    }
}

/// Adds an entry, returning `false` if it exists already.
fn add_if_missing(dir: &dyn Directory, entry: Entry) -> SetupResult<bool> {
    let dn = entry.dn().to_string();
    match dir.add(entry) {
        Ok(()) => Ok(true),
        Err(err) if err.code() == ResultCode::EntryAlreadyExists => {
            debug!("{dn} exists already");
            Ok(false)
        }
        Err(err) => Err(err.into()),
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use crate::commons::httpclient;
    use crate::directory::MemoryDirectory;
    use crate::remote::response::XmlResponse;
    use crate::remote::transport::Transport;

    fn me(host: &str) -> HostInfo {
        HostInfo {
            host: host.into(),
            unsecure_port: Some(8080),
            secure_port: 8443,
            secure_ee_client_auth_port: Some(8443),
            secure_agent_port: 8443,
            secure_admin_port: 8443,
            clone: false,
            subsystem_name: format!("CA {host} 8443"),
            domain_manager: false,
        }
    }

    fn directory() -> MemoryDirectory {
        let dir = MemoryDirectory::empty();
        dir.seed([Entry::new("o=pki-tomcat").with("objectClass", "top")]);
        dir
    }

    #[test]
    fn create_registers_manager() {
        let dir = directory();
        let bootstrap = SecurityDomainBootstrap::new(
            RemoteAdminClient::new(Arc::new(ScriptedTransport::default()))
        );
        let domain = bootstrap
            .create(&dir, "o=pki-tomcat", "Example Domain", &me("ca.example.com"))
            .unwrap();

        assert_eq!(domain.name(), "Example Domain");
        assert!(domain.is_domain_master("ca.example.com", 8443));
        assert!(dir.peek("cn=KRAList,ou=Security Domain,o=pki-tomcat").is_some());

        // Running again is fine, a different name is not.
        bootstrap.create(&dir, "o=pki-tomcat", "Example Domain", &me("ca.example.com")).unwrap();
        assert!(matches!(
            bootstrap.create(&dir, "o=pki-tomcat", "Other", &me("ca.example.com")),
            Err(Error::Conflict(_))
        ));
    }

    #[derive(Default)]
    struct ScriptedTransport {
        domain: String,
        admin_fails: bool,
        posts: Mutex<Vec<(String, bool)>>,
    }

    impl Transport for ScriptedTransport {
        fn post_form(
            &self, uri: &str, _form: &[(String, String)], creds: Option<&Credentials>
        ) -> Result<String, httpclient::Error> {
            self.posts.lock().unwrap().push((uri.to_string(), creds.is_some()));
            if self.admin_fails && uri.contains("/admin/") {
                return Err(httpclient::Error::execute(uri, "404"));
            }
            Ok("<XMLResponse><Status>0</Status></XMLResponse>".into())
        }

        fn get(
            &self, _uri: &str, _creds: Option<&Credentials>
        ) -> Result<String, httpclient::Error> {
            Ok(self.domain.clone())
        }
    }

    #[test]
    fn join_falls_back_to_agent_interface() {
        let mut sd = DomainInfo::new("Example Domain");
        let mut manager = me("sd.example.com");
        manager.secure_agent_port = 8444;
        manager.domain_manager = true;
        sd.add_host(SubsystemType::Ca, manager).unwrap();

        let transport = Arc::new(ScriptedTransport {
            domain: XmlResponse::render_success(vec![sd.to_xml()]).unwrap(),
            admin_fails: true,
            posts: Mutex::default(),
        });
        let bootstrap = SecurityDomainBootstrap::new(RemoteAdminClient::new(transport.clone()));
        let mut store = ConfigStore::in_memory();
        let creds = Credentials::ClientCert { pkcs12: vec![1], password: "x".into() };

        let domain = bootstrap.join(
            &Peer::new("sd.example.com", 8443),
            &mut store,
            SubsystemType::Kra,
            &me("kra.example.com"),
            "123456",
            Some(&creds),
        ).unwrap();

        assert_eq!(domain.hosts(SubsystemType::Kra).len(), 1);
        assert_eq!(store.get("preop.securitydomain.httpsagentport"), Some("8444"));
        assert_eq!(store.get("preop.securitydomain.domainManager"), Some("true"));
        let posts = transport.posts.lock().unwrap();
        assert_eq!(posts.len(), 2);
        assert!(posts[0].0.ends_with("/ca/admin/ca/updateDomainXML") && !posts[0].1);
        assert!(posts[1].0.ends_with("/ca/agent/ca/updateDomainXML") && posts[1].1);
    }
}
