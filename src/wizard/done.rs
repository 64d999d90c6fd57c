//! The final step: making the configured instance known to its peers.
//!
//! The step is made of parts which are marked below `preop.done` when
//! they succeed. A repeated run skips the parts that were done already,
//! so nothing is registered twice with a peer.

use std::path::Path;
use log::{debug, info};
use rand::distr::Alphanumeric;
use rand::Rng;
use crate::api::ConfigurationRequest;
use crate::certs::issuer::requestor;
use crate::certs::transfer::CertImportExport;
use crate::certs::CertTag;
use crate::commons::error::Error;
use crate::commons::httpclient::Credentials;
use crate::commons::{file, SetupEmptyResult, SetupResult};
use crate::constants::{AUDIT_LOG_TARGET, DATABASE_USER, SUBSYSTEM_GROUP};
use crate::crypto::base64_decode;
use crate::database::InternalDb;
use crate::domain::bootstrap::SecurityDomainBootstrap;
use crate::domain::{HostInfo, SubsystemType};
use crate::remote::{ConnectorInfo, Peer, RangeKind};
use crate::users::{DirectoryUserStore, User, UserGroupSubsystem};
use super::validate::{non_empty, parse_peer};
use super::{port_or, ConfigurationOrchestrator};


/// Defaults for the number ranges of a CA or KRA.
///
/// Clones take their begin and end from the master, the remaining values
/// are filled in from here.
const RANGE_DEFAULTS: &[(&str, u64)] = &[
    ("dbs.beginSerialNumber", 1),
    ("dbs.endSerialNumber", 10_000_000),
    ("dbs.serialIncrement", 1_000_000),
    ("dbs.serialLowWaterMark", 200_000),
    ("dbs.beginRequestNumber", 1),
    ("dbs.endRequestNumber", 10_000_000),
    ("dbs.requestIncrement", 1_000_000),
    ("dbs.requestLowWaterMark", 200_000),
    ("dbs.beginReplicaNumber", 1),
    ("dbs.endReplicaNumber", 100),
];


//------------ finish --------------------------------------------------------

pub fn finish(
    o: &mut ConfigurationOrchestrator,
    kind: SubsystemType,
    request: &ConfigurationRequest,
) -> SetupEmptyResult {
    let me = o.local_host(request)?;

    once(o, "domain", |o| join_domain(o, kind, request, &me))?;
    if !request.is_clone {
        // Clones get the database user through replication.
        once(o, "dbuser", |o| create_database_user(o, kind))?;
        once(o, "peers", |o| connect_peers(o, kind, request, &me))?;
    }
    if kind.has_number_ranges() {
        once(o, "ranges", |o| allocate_ranges(o, request))?;
    }
    if request.backup_keys {
        once(o, "backup", |o| backup_keys(o, kind, request))?;
    }
    Ok(())
}

/// Runs a part of the step unless it is marked as done.
fn once<F>(o: &mut ConfigurationOrchestrator, part: &str, action: F) -> SetupEmptyResult
where
    F: FnOnce(&mut ConfigurationOrchestrator) -> SetupEmptyResult,
{
    let key = format!("preop.done.{part}");
    if o.store.get_bool_or(&key, false)? {
        debug!("'{part}' is done already");
        return Ok(());
    }
    action(o)?;
    o.store.put_bool(&key, true);
    Ok(o.store.commit()?)
}


//------------ Security Domain -----------------------------------------------

fn join_domain(
    o: &mut ConfigurationOrchestrator,
    kind: SubsystemType,
    request: &ConfigurationRequest,
    me: &HostInfo,
) -> SetupEmptyResult {
    let bootstrap = SecurityDomainBootstrap::new(o.remote.clone());
    let name = o.store.get_string("preop.securitydomain.name")?;

    if request.is_new_domain() {
        let db = InternalDb::from_store(&o.store)?;
        let dir = o.directories.connect(&db.conn)?;
        bootstrap.create(dir.as_ref(), &db.base_dn, &name, me)?;

        o.store.put("securitydomain.select", "new");
        o.store.put("securitydomain.name", &name);
        o.store.put("securitydomain.host", &me.host);
        o.store.put("securitydomain.httpsport", me.secure_port);
        o.store.put("securitydomain.httpsadminport", me.secure_admin_port);
        o.store.put("securitydomain.httpsagentport", me.secure_agent_port);
        o.store.put(
            "securitydomain.httpseeport",
            me.secure_ee_client_auth_port.unwrap_or(me.secure_port),
        );
        return Ok(());
    }

    let sd: Peer = o.store.get_string("preop.securitydomain.uri")?.parse()?;
    let session_id = o.session_id()?;
    let credentials = subsystem_credentials(o, kind)?;
    let mut me = me.clone();
    me.domain_manager = clones_domain_manager(o, kind, request)?;
    bootstrap.register(&sd, kind, &me, &session_id, credentials.as_ref())?;
    if me.domain_manager {
        info!(
            target: AUDIT_LOG_TARGET,
            "{} manages domain '{name}' together with its master", me.entry_name()
        );
    }

    o.store.put("securitydomain.select", "existing");
    o.store.put("securitydomain.name", &name);
    o.store.put("securitydomain.host", &sd.host);
    for port in ["httpsport", "httpsadminport", "httpsagentport", "httpseeport"] {
        let value = o.store.get_string_or(
            &format!("preop.securitydomain.{port}"), &sd.port.to_string()
        );
        o.store.put(&format!("securitydomain.{port}"), value);
    }
    Ok(())
}

/// Returns whether this instance is a clone of the domain manager.
///
/// The master must be the CA the domain was joined through and that CA
/// must be listed as manager. The clone then manages the domain as well.
fn clones_domain_manager(
    o: &ConfigurationOrchestrator,
    kind: SubsystemType,
    request: &ConfigurationRequest,
) -> SetupResult<bool> {
    if kind != SubsystemType::Ca || !request.is_clone {
        return Ok(false)
    }
    if !o.store.get_bool_or("preop.securitydomain.domainManager", false)? {
        return Ok(false)
    }
    let master_host = o.store.get_string("preop.master.hostname")?;
    let master_port = o.store.get_port("preop.master.httpsport")?;
    let sd_host = o.store.get_string("preop.securitydomain.host")?;
    let sd_ports = [
        port_or(&o.store, "preop.securitydomain.httpsport", 0)?,
        port_or(&o.store, "preop.securitydomain.httpsadminport", 0)?,
    ];
    Ok(master_host.eq_ignore_ascii_case(&sd_host) && sd_ports.contains(&master_port))
}

/// The subsystem certificate for authenticating at the domain manager.
///
/// A certificate issued by an external CA may not have its key in the
/// token yet, it is left out then.
fn subsystem_credentials(
    o: &ConfigurationOrchestrator, kind: SubsystemType
) -> SetupResult<Option<Credentials>> {
    let nickname = o.store.get_string(&format!("{}.subsystem.nickname", kind.lower()))?;
    if !o.token.has_key(&nickname) {
        debug!("No key for '{nickname}', registering without client certificate");
        return Ok(None);
    }
    let password: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    let pkcs12 = o.token.export_pkcs12(&nickname, &[], &password)?;
    Ok(Some(Credentials::ClientCert { pkcs12, password }))
}


//------------ Database User -------------------------------------------------

/// Creates the user the instance binds to its database as.
fn create_database_user(
    o: &mut ConfigurationOrchestrator, kind: SubsystemType
) -> SetupEmptyResult {
    let db = InternalDb::from_store(&o.store)?;
    let users = DirectoryUserStore::new(o.directories.connect(&db.conn)?, &db.base_dn);
    let cert = base64_decode(
        &o.store.get_string(&format!("{}.subsystem.cert", kind.lower()))?
    )?;

    let mut user = User::new(DATABASE_USER, DATABASE_USER);
    user.user_type = Some("agentType".into());
    match users.create_user(&user) {
        Ok(()) => {}
        Err(Error::Conflict(_)) => debug!("Database user '{DATABASE_USER}' exists"),
        Err(err) => return Err(err),
    }
    users.add_cert(DATABASE_USER, &cert)?;
    users.add_to_group(DATABASE_USER, SUBSYSTEM_GROUP)?;

    o.store.put(
        "internaldb.dbuser",
        format!("uid={DATABASE_USER},ou=people,{}", db.base_dn),
    );
    Ok(())
}


//------------ Peers ---------------------------------------------------------

/// Registers this instance with the subsystems it works with.
fn connect_peers(
    o: &mut ConfigurationOrchestrator,
    kind: SubsystemType,
    request: &ConfigurationRequest,
    me: &HostInfo,
) -> SetupEmptyResult {
    if !matches!(kind, SubsystemType::Kra | SubsystemType::Ocsp | SubsystemType::Tps) {
        return Ok(());
    }
    let session_id = o.session_id()?;
    let uid = requestor(&o.store, kind);
    let cert = o.store.get_string(&format!("{}.subsystem.cert", kind.lower()))?;
    let ca = ca_peer(o, request)?;
    o.remote.register_user(&ca, &uid, &uid, &cert, &session_id)?;

    match kind {
        SubsystemType::Kra => {
            let connector = ConnectorInfo {
                kra_host: me.host.clone(),
                kra_port: me.secure_agent_port,
                transport_cert: o.store.get_string("kra.transport.cert")?,
                subsystem_name: request.subsystem_name.clone(),
            };
            o.remote.update_connector(&ca, &connector, &session_id)?;
        }
        SubsystemType::Ocsp => {
            let ocsp = Peer::new(me.host.as_str(), me.secure_port);
            o.remote.update_ocsp_config(&ca, &ocsp, &session_id)?;
        }
        SubsystemType::Tps => {
            o.store.put("tps.connector.ca1.host", &ca.host);
            o.store.put("tps.connector.ca1.port", ca.port);

            if let Some(uri) = non_empty(&request.kra_uri) {
                let kra = parse_peer("kraUri", uri)?;
                o.remote.register_user(&kra, &uid, &uid, &cert, &session_id)?;
                o.store.put("tps.connector.kra1.host", &kra.host);
                o.store.put("tps.connector.kra1.port", kra.port);
                o.store.put_bool(
                    "tps.connector.kra1.serverKeygen", request.enable_server_side_keygen
                );
            }

            let tks = parse_peer("tksUri", non_empty(&request.tks_uri).unwrap_or_default())?;
            o.remote.register_user(&tks, &uid, &uid, &cert, &session_id)?;
            let secret = o.remote.create_shared_secret(&tks, &uid, &session_id)?;
            let secret_name = format!("{uid} sharedSecret");
            o.token.store_shared_secret(&secret_name, &secret)?;
            o.store.put("tps.connector.tks1.host", &tks.host);
            o.store.put("tps.connector.tks1.port", tks.port);
            o.store.put("tps.connector.tks1.tksSharedSymKeyName", &secret_name);
            info!(target: AUDIT_LOG_TARGET, "Stored secret shared with TKS at {tks}");
        }
        SubsystemType::Ca | SubsystemType::Tks | SubsystemType::Ra => {}
    }
    info!("Registered '{uid}' with CA at {ca}");
    Ok(())
}

/// The CA this instance works with.
fn ca_peer(
    o: &ConfigurationOrchestrator, request: &ConfigurationRequest
) -> SetupResult<Peer> {
    if let Some(uri) = non_empty(&request.ca_uri) {
        return parse_peer("caUri", uri);
    }
    let (host, port) = match o.store.get_non_empty("preop.ca.hostname") {
        Some(_) => ("preop.ca.hostname", "preop.ca.httpsport"),
        None => ("preop.securitydomain.host", "preop.securitydomain.httpsport"),
    };
    Ok(Peer::new(o.store.get_string(host)?, o.store.get_port(port)?))
}


//------------ Number Ranges -------------------------------------------------

fn allocate_ranges(
    o: &mut ConfigurationOrchestrator, request: &ConfigurationRequest
) -> SetupEmptyResult {
    if request.is_clone {
        let master = Peer::new(
            o.store.get_string("preop.master.hostname")?,
            o.store.get_port("preop.master.httpsport")?,
        );
        let session_id = o.session_id()?;
        for range_kind in [RangeKind::Serial, RangeKind::Request] {
            let range = o.remote.update_number_range(&master, range_kind, &session_id)?;
            let (begin_key, end_key, _) = range_kind.config_keys();
            o.store.put(begin_key, range.begin);
            o.store.put(end_key, range.end);
            info!(
                "Master {master} handed out {} range {}-{}",
                range_kind.as_str(), range.begin, range.end
            );
        }
    }
    for (key, value) in RANGE_DEFAULTS {
        if o.store.get_non_empty(key).is_none() {
            o.store.put(key, value);
        }
    }
    Ok(())
}


//------------ Key Backup ----------------------------------------------------

/// Writes a PKCS#12 file per system key into the backup directory.
///
/// The server key stays behind, clones get a server certificate of
/// their own.
fn backup_keys(
    o: &mut ConfigurationOrchestrator,
    kind: SubsystemType,
    request: &ConfigurationRequest,
) -> SetupEmptyResult {
    let dir = non_empty(&request.backup_file).map(Path::new).ok_or_else(|| {
        Error::validation("missing backup file")
    })?;
    file::create_dir(dir)?;

    let mut nicknames = Vec::new();
    for tag in kind.system_cert_tags() {
        if *tag == CertTag::Sslserver {
            continue;
        }
        let nickname = o.store.get_string(&format!("{}.{tag}.nickname", kind.lower()))?;
        if o.token.has_key(&nickname) {
            nicknames.push(nickname);
        }
        else {
            debug!("Key of '{nickname}' is not in the token, not backing it up");
        }
    }
    let written = CertImportExport::new(o.token.clone()).export_system_keys(
        &nicknames,
        request.backup_password.as_deref().unwrap_or_default(),
        dir,
    )?;
    info!(
        target: AUDIT_LOG_TARGET,
        "Backed up {} system keys to {}", written.len(), dir.display()
    );
    Ok(())
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use crate::api::SecurityDomainType;
    use crate::commons::httpclient;
    use crate::constants::{CS_TYPE_KEY, UPDATE_NUMBER_RANGE_PATH};
    use crate::crypto::{
        base64_encode, CertExtension, CertInfo, CryptoToken, EcCurve, IssuerName,
        KeySpec, SigningAlgorithm, SoftToken,
    };
    use crate::directory::{Entry, MemoryDirectory, MemoryDirectoryPool};
    use crate::domain::domain_dn;
    use crate::remote::transport::Transport;
    use crate::remote::RemoteAdminClient;
    use crate::store::ConfigStore;

    /// Answers every request with success and remembers it.
    #[derive(Default)]
    struct RecordingTransport {
        calls: Mutex<Vec<(String, Vec<(String, String)>)>>,
    }

    impl RecordingTransport {
        fn paths(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(uri, _)| uri.trim_start_matches("https://").to_string())
                .collect()
        }

        fn form(&self, path: &str, name: &str) -> Option<String> {
            let calls = self.calls.lock().unwrap();
            let (_, form) = calls.iter().find(|(uri, _)| uri.ends_with(path))?;
            form.iter().find(|(n, _)| n == name).map(|(_, v)| v.clone())
        }
    }

    impl Transport for RecordingTransport {
        fn post_form(
            &self, uri: &str, form: &[(String, String)], _creds: Option<&Credentials>
        ) -> Result<String, httpclient::Error> {
            self.calls.lock().unwrap().push((uri.to_string(), form.to_vec()));
            if uri.ends_with(UPDATE_NUMBER_RANGE_PATH) {
                return Ok(
                    "<XMLResponse><Status>0</Status>\
                     <beginNumber>9000001</beginNumber><endNumber>10000000</endNumber>\
                     </XMLResponse>".into()
                );
            }
            Ok("<XMLResponse><Status>0</Status></XMLResponse>".into())
        }

        fn get(
            &self, uri: &str, _creds: Option<&Credentials>
        ) -> Result<String, httpclient::Error> {
            Err(httpclient::Error::execute(uri, "unexpected GET"))
        }
    }

    fn subsystem_cert() -> String {
        let token = SoftToken::new("scratch");
        let public_key = token
            .generate_key_pair("subsystem", &KeySpec::Ec { curve: EcCurve::P256 })
            .unwrap();
        let subject = "CN=Subsystem Certificate,O=Example";
        let info = CertInfo {
            serial: 7,
            subject: subject.into(),
            issuer: IssuerName::Dn(subject.into()),
            not_before: 1_700_000_000,
            not_after: 1_900_000_000,
            public_key,
            extensions: vec![CertExtension::BasicConstraints {
                ca: false, path_len: None, critical: true
            }],
        };
        let der = token
            .sign_certificate(&info, "subsystem", SigningAlgorithm::Sha256WithEc, None)
            .unwrap();
        base64_encode(&der)
    }

    fn setup(
        kind: &str, transport: Arc<RecordingTransport>
    ) -> (ConfigurationOrchestrator, MemoryDirectory) {
        let lower = kind.to_ascii_lowercase();
        let mut store = ConfigStore::in_memory();
        store.put(CS_TYPE_KEY, kind);
        store.put("service.machineName", "pki1.example.com");
        store.put("service.securePort", 8443);
        store.put("internaldb.ldapconn.host", "ds.example.com");
        store.put("internaldb.ldapconn.port", 389);
        store.put("internaldb.ldapauth.bindDN", "cn=Directory Manager");
        store.put("internaldb.basedn", "o=pki");
        store.put("internaldb.database", "pki");
        store.put("preop.securitydomain.name", "Example Domain");
        store.put(&format!("{lower}.subsystem.nickname"), "subsystemCert");
        store.put(&format!("{lower}.subsystem.cert"), subsystem_cert());

        let dir = MemoryDirectory::new();
        dir.seed([
            Entry::new("o=pki").with("objectClass", "top"),
            Entry::new("ou=people,o=pki").with("objectClass", "organizationalUnit"),
            Entry::new("ou=groups,o=pki").with("objectClass", "organizationalUnit"),
            Entry::new(format!("cn={SUBSYSTEM_GROUP},ou=groups,o=pki"))
                .with("objectClass", "groupOfUniqueNames"),
        ]);
        let pool = MemoryDirectoryPool::new();
        pool.insert("ds.example.com", 389, dir.clone());

        let o = ConfigurationOrchestrator::new(
            store,
            Arc::new(SoftToken::new("internal")),
            RemoteAdminClient::new(transport),
            Arc::new(pool),
        );
        (o, dir)
    }

    fn join_existing(o: &mut ConfigurationOrchestrator) {
        let store = o.store_mut();
        store.put("preop.securitydomain.uri", "https://sd.example.com:8443");
        store.put("preop.securitydomain.sessionID", "token-1");
        store.put("preop.securitydomain.host", "sd.example.com");
        store.put("preop.securitydomain.httpsport", 8443);
        store.put("preop.securitydomain.httpsadminport", 8443);
    }

    #[test]
    fn root_ca_creates_domain() {
        let transport = Arc::new(RecordingTransport::default());
        let (mut o, dir) = setup("CA", transport.clone());
        let request = ConfigurationRequest {
            subsystem_name: "CA pki1".into(),
            security_domain_type: Some(SecurityDomainType::NewDomain),
            ..Default::default()
        };

        finish(&mut o, SubsystemType::Ca, &request).unwrap();

        assert_eq!(o.store().get("securitydomain.name"), Some("Example Domain"));
        assert_eq!(o.store().get("securitydomain.httpsadminport"), Some("8443"));
        assert_eq!(o.store().get("dbs.endSerialNumber"), Some("10000000"));
        assert!(dir.peek(&domain_dn("o=pki")).is_some());
        let group = dir.peek(&format!("cn={SUBSYSTEM_GROUP},ou=groups,o=pki")).unwrap();
        assert!(group.has_value("uniqueMember", "uid=pkidbuser,ou=people,o=pki"));
        assert!(transport.paths().is_empty());

        // Everything is marked done, a second run changes nothing.
        let mutations = dir.mutations().len();
        finish(&mut o, SubsystemType::Ca, &request).unwrap();
        assert_eq!(dir.mutations().len(), mutations);
    }

    #[test]
    fn kra_registers_with_ca() {
        let transport = Arc::new(RecordingTransport::default());
        let (mut o, _dir) = setup("KRA", transport.clone());
        join_existing(&mut o);
        let store = o.store_mut();
        store.put("service.secureAgentPort", 8444);
        store.put("preop.ca.hostname", "ca.example.com");
        store.put("preop.ca.httpsport", 8443);
        store.put("kra.transport.cert", "VHJhbnNwb3J0");
        let request = ConfigurationRequest {
            subsystem_name: "KRA pki1".into(),
            security_domain_type: Some(SecurityDomainType::ExistingDomain),
            ..Default::default()
        };

        finish(&mut o, SubsystemType::Kra, &request).unwrap();

        assert_eq!(transport.paths(), vec![
            "sd.example.com:8443/ca/admin/ca/updateDomainXML".to_string(),
            "ca.example.com:8443/ca/admin/ca/registerUser".to_string(),
            "ca.example.com:8443/ca/admin/ca/updateConnector".to_string(),
        ]);
        assert_eq!(
            transport.form("/registerUser", "uid").as_deref(),
            Some("KRA-pki1.example.com-8443")
        );
        assert_eq!(
            transport.form("/updateConnector", "ca.connector.KRA.port").as_deref(),
            Some("8444")
        );
        assert_eq!(o.store().get("securitydomain.host"), Some("sd.example.com"));
    }

    #[test]
    fn clone_takes_ranges_from_master() {
        let transport = Arc::new(RecordingTransport::default());
        let (mut o, _dir) = setup("CA", transport.clone());
        join_existing(&mut o);
        o.store_mut().put("preop.master.hostname", "master.example.com");
        o.store_mut().put("preop.master.httpsport", 8443);
        let request = ConfigurationRequest {
            subsystem_name: "CA pki2".into(),
            security_domain_type: Some(SecurityDomainType::ExistingDomain),
            is_clone: true,
            ..Default::default()
        };

        finish(&mut o, SubsystemType::Ca, &request).unwrap();

        assert_eq!(o.store().get("dbs.beginSerialNumber"), Some("9000001"));
        assert_eq!(o.store().get("dbs.endRequestNumber"), Some("10000000"));
        assert_eq!(o.store().get("dbs.serialIncrement"), Some("1000000"));
        assert_eq!(
            transport.paths().iter().filter(|p| p.ends_with(UPDATE_NUMBER_RANGE_PATH)).count(),
            2
        );
        // No peer connections or database user for clones.
        assert!(transport.paths().iter().all(|p| !p.ends_with("/registerUser")));
        assert!(o.store().get("internaldb.dbuser").is_none());
        assert_eq!(transport.form("/updateDomainXML", "dm").as_deref(), Some("false"));
    }

    #[test]
    fn clone_of_domain_manager_registers_as_manager() {
        let transport = Arc::new(RecordingTransport::default());
        let (mut o, _dir) = setup("CA", transport.clone());
        join_existing(&mut o);
        o.store_mut().put_bool("preop.securitydomain.domainManager", true);
        o.store_mut().put("preop.master.hostname", "SD.example.com");
        o.store_mut().put("preop.master.httpsport", 8443);
        let request = ConfigurationRequest {
            subsystem_name: "CA pki2".into(),
            security_domain_type: Some(SecurityDomainType::ExistingDomain),
            is_clone: true,
            ..Default::default()
        };

        finish(&mut o, SubsystemType::Ca, &request).unwrap();

        assert_eq!(transport.form("/updateDomainXML", "dm").as_deref(), Some("true"));
        assert_eq!(transport.form("/updateDomainXML", "clone").as_deref(), Some("true"));
    }

    #[test]
    fn backup_needs_a_directory() {
        let transport = Arc::new(RecordingTransport::default());
        let (mut o, _dir) = setup("CA", transport);
        let request = ConfigurationRequest {
            backup_keys: true,
            ..Default::default()
        };
        assert!(matches!(
            backup_keys(&mut o, SubsystemType::Ca, &request),
            Err(Error::Validation(_))
        ));
    }
}
