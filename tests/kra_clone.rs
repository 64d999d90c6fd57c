//! Cloning a KRA that joins an existing security domain.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use pkisetup::api::{ConfigurationRequest, SecurityDomainType};
use pkisetup::commons::error::Error;
use pkisetup::constants::{GET_CONFIG_ENTRIES_PATH, GET_DOMAIN_XML_PATH};
use pkisetup::crypto::{
    CertInfo, CryptoToken, EcCurve, IssuerName, KeySpec, SigningAlgorithm,
    SoftToken, TrustFlags,
};
use pkisetup::directory::MemoryDirectoryPool;
use pkisetup::domain::{DomainInfo, HostInfo, SubsystemType};
use pkisetup::remote::response::ConfigEntries;
use tempfile::TempDir;
use common::{MockTransport, PASSWORD};

const BASE_DN: &str = "o=pki-tomcat-KRA";

fn host(name: &str, kind: SubsystemType, manager: bool) -> HostInfo {
    HostInfo {
        host: name.into(),
        unsecure_port: None,
        secure_port: 8443,
        secure_ee_client_auth_port: Some(8443),
        secure_agent_port: 8443,
        secure_admin_port: 8443,
        clone: false,
        subsystem_name: format!("{} {name} 8443", kind.name()),
        domain_manager: manager,
    }
}

/// Writes the transport key of the master into a PKCS#12 file.
fn master_p12(dir: &TempDir) -> String {
    let token = SoftToken::new("master");
    let subject = "CN=DRM Transport Certificate,O=Example";
    let public_key = token
        .generate_key_pair("transportCert", &KeySpec::Ec { curve: EcCurve::P256 })
        .unwrap();
    let info = CertInfo {
        serial: 7,
        subject: subject.into(),
        issuer: IssuerName::Dn(subject.into()),
        not_before: 1_700_000_000,
        not_after: 2_000_000_000,
        public_key,
        extensions: Vec::new(),
    };
    let cert = token
        .sign_certificate(&info, "transportCert", SigningAlgorithm::Sha256WithEc, None)
        .unwrap();
    token
        .import_certificate("transportCert", &cert, &TrustFlags::user())
        .unwrap();
    let p12 = token.export_pkcs12("transportCert", &[], PASSWORD).unwrap();

    let path = dir.path().join("kra-master.p12");
    std::fs::write(&path, p12).unwrap();
    path.to_string_lossy().into_owned()
}

/// A security domain at sd.example.com listing the master KRA, which
/// reports its database on `ds_host`.
fn peers(ds_host: &str, base_dn: &str) -> Arc<MockTransport> {
    let transport = MockTransport::new();

    let mut domain = DomainInfo::new("Example Domain");
    domain.add_host(SubsystemType::Ca, host("sd.example.com", SubsystemType::Ca, true)).unwrap();
    domain.add_host(SubsystemType::Kra, host("kra1.example.com", SubsystemType::Kra, false)).unwrap();
    transport.reply(GET_DOMAIN_XML_PATH, vec![domain.to_xml()]);

    let mut entries = BTreeMap::new();
    entries.insert("internaldb.ldapconn.host".to_string(), ds_host.to_string());
    entries.insert("internaldb.ldapconn.port".into(), "389".into());
    entries.insert("internaldb.ldapconn.secureConn".into(), "false".into());
    entries.insert("internaldb.ldapauth.bindDN".into(), "cn=Directory Manager".into());
    entries.insert("internaldb.basedn".into(), base_dn.into());
    entries.insert("internaldb.database".into(), "kra".into());
    entries.insert("dbs.beginReplicaNumber".into(), "1".into());
    transport.reply(GET_CONFIG_ENTRIES_PATH, vec![ConfigEntries(entries).to_xml()]);
    transport
}

fn clone_request(p12: String) -> ConfigurationRequest {
    ConfigurationRequest {
        pin: common::PIN.into(),
        subsystem_name: format!("KRA {} 8443", common::MACHINE),
        security_domain_type: Some(SecurityDomainType::ExistingDomain),
        security_domain_uri: Some("https://sd.example.com:8443".into()),
        install_token: Some("8675309".into()),
        is_clone: true,
        clone_uri: Some("https://kra1.example.com:8443".into()),
        p12_files: vec![p12],
        p12_password: Some(PASSWORD.into()),
        database: Some(common::database("ds.example.com", BASE_DN, "kra")),
        system_certs: common::ecc_certs(SubsystemType::Kra),
        ..Default::default()
    }
}

#[test]
fn clone_refuses_the_directory_of_its_master() {
    let p12_dir = TempDir::new().unwrap();
    let transport = peers("DS.example.com", BASE_DN);
    let pool = MemoryDirectoryPool::new();
    let dir = pool.server("ds.example.com", 389);
    let mut o = common::orchestrator(
        common::instance_store(SubsystemType::Kra), transport.clone(), Arc::new(pool)
    );

    match o.configure(&clone_request(master_p12(&p12_dir))) {
        Err(Error::Consistency(msg)) => {
            assert!(msg.contains("same directory server"), "{msg}")
        }
        other => panic!("unexpected {other:?}"),
    }

    // Nothing was written to the directory and the domain does not know
    // about us.
    assert!(dir.mutations().is_empty());
    assert!(transport.paths().iter().all(|path| !path.contains("updateDomainXML")));

    // The master's keys and settings were taken over before that.
    let store = o.store();
    assert_eq!(store.get("preop.restored.transport"), Some("transportCert"));
    assert_eq!(store.get("preop.master.internaldb.basedn"), Some(BASE_DN));
    assert_eq!(store.get("preop.securitydomain.name"), Some("Example Domain"));
    assert_eq!(store.get("preop.securitydomain.sessionID"), Some("8675309"));
    assert_eq!(store.get("cs.state"), Some("0"));

    let call = transport.call_to(GET_CONFIG_ENTRIES_PATH).unwrap();
    assert_eq!(call.field("op"), Some("get"));
    assert_eq!(call.field("sessionID"), Some("8675309"));
    assert!(call.field("names").unwrap().contains("kra.transport.nickname"));
}

#[test]
fn clone_needs_the_base_dn_of_its_master() {
    let p12_dir = TempDir::new().unwrap();
    let transport = peers("ds1.example.com", "o=pki-tomcat-KRA-master");
    let pool = MemoryDirectoryPool::new();
    let dir = pool.server("ds.example.com", 389);
    let mut o = common::orchestrator(
        common::instance_store(SubsystemType::Kra), transport, Arc::new(pool)
    );

    match o.configure(&clone_request(master_p12(&p12_dir))) {
        Err(Error::Consistency(msg)) => assert!(msg.contains("differs"), "{msg}"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(dir.log().is_empty());
}

#[test]
fn clone_without_master_keys_is_rejected() {
    let transport = MockTransport::new();
    let mut o = common::orchestrator(
        common::instance_store(SubsystemType::Kra),
        transport.clone(),
        Arc::new(MemoryDirectoryPool::new()),
    );
    let mut request = clone_request(String::new());
    request.p12_files.clear();

    assert!(matches!(o.configure(&request), Err(Error::Validation(_))));
    assert!(transport.calls().is_empty());
}
