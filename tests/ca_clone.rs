//! A CA clone registering with the security domain it joined.

mod common;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use pkisetup::api::{ConfigurationRequest, SecurityDomainType};
use pkisetup::constants::{
    GET_DOMAIN_XML_PATH, UPDATE_DOMAIN_XML_ADMIN_PATH, UPDATE_NUMBER_RANGE_PATH,
};
use pkisetup::directory::MemoryDirectoryPool;
use pkisetup::domain::bootstrap::SecurityDomainBootstrap;
use pkisetup::domain::{DomainInfo, HostInfo, SubsystemType};
use pkisetup::remote::response::{NumberRange, XmlResponse};
use pkisetup::remote::{HostRegistration, Peer, RemoteAdminClient};
use pkisetup::wizard::{done, ConfigurationOrchestrator};
use common::{MockTransport, MACHINE};

const SD: &str = "https://sd.example.com:8443";

fn ca(name: &str, manager: bool) -> HostInfo {
    HostInfo {
        host: name.into(),
        unsecure_port: Some(8080),
        secure_port: 8443,
        secure_ee_client_auth_port: Some(8443),
        secure_agent_port: 8443,
        secure_admin_port: 8443,
        clone: false,
        subsystem_name: format!("CA {name} 8443"),
        domain_manager: manager,
    }
}

/// The domain as kept by its manager at sd.example.com.
///
/// Registrations are applied the way the manager applies them.
fn domain_manager(transport: &MockTransport) -> Arc<Mutex<DomainInfo>> {
    let mut domain = DomainInfo::new("Example Domain");
    domain.add_host(SubsystemType::Ca, ca("sd.example.com", true)).unwrap();
    domain.add_host(SubsystemType::Ca, ca("ca2.example.com", false)).unwrap();
    let domain = Arc::new(Mutex::new(domain));

    let listed = domain.clone();
    transport.on(GET_DOMAIN_XML_PATH, move |_| {
        let xml = listed.lock().unwrap().to_xml();
        Ok(XmlResponse::render_success(vec![xml]).unwrap())
    });

    let updated = domain.clone();
    transport.on(UPDATE_DOMAIN_XML_ADMIN_PATH, move |form| {
        let fields: BTreeMap<String, String> = form.iter().cloned().collect();
        let registration = HostRegistration::from_form(&fields).map_err(|e| e.to_string())?;
        updated
            .lock()
            .unwrap()
            .add_host(registration.kind, registration.host)
            .map_err(|e| e.to_string())?;
        Ok(XmlResponse::render_success(Vec::new()).unwrap())
    });

    transport.reply(
        UPDATE_NUMBER_RANGE_PATH,
        NumberRange { begin: 9_000_001, end: 10_000_000 }.to_xml(),
    );
    domain
}

/// A CA clone of `master` that got through every step but the last.
fn cloned_ca(transport: Arc<MockTransport>, master: &str) -> ConfigurationOrchestrator {
    let mut store = common::instance_store(SubsystemType::Ca);
    store.put("ca.subsystem.nickname", "subsystemCert");
    store.put("preop.securitydomain.uri", SD);
    store.put("preop.securitydomain.sessionID", "8675309");
    store.put("preop.master.hostname", master);
    store.put("preop.master.httpsport", 8443);

    let sd: Peer = SD.parse().unwrap();
    SecurityDomainBootstrap::new(RemoteAdminClient::new(transport.clone()))
        .fetch_domain(&sd, &mut store)
        .unwrap();

    common::orchestrator(store, transport, Arc::new(MemoryDirectoryPool::new()))
}

fn clone_request() -> ConfigurationRequest {
    ConfigurationRequest {
        pin: common::PIN.into(),
        subsystem_name: format!("CA {MACHINE} 8443"),
        security_domain_type: Some(SecurityDomainType::ExistingDomain),
        security_domain_uri: Some(SD.into()),
        install_token: Some("8675309".into()),
        is_clone: true,
        clone_uri: Some("https://sd.example.com:8443".into()),
        ..Default::default()
    }
}

#[test]
fn clone_of_domain_manager_manages_domain() {
    let transport = MockTransport::new();
    let domain = domain_manager(&transport);
    let mut o = cloned_ca(transport.clone(), "sd.example.com");

    done::finish(&mut o, SubsystemType::Ca, &clone_request()).unwrap();

    let call = transport.call_to(UPDATE_DOMAIN_XML_ADMIN_PATH).unwrap();
    assert_eq!(call.field("dm"), Some("true"));
    assert_eq!(call.field("sessionID"), Some("8675309"));

    let domain = domain.lock().unwrap();
    let me = domain.find_host(SubsystemType::Ca, MACHINE, 8443).unwrap();
    assert!(me.clone && me.domain_manager);
    assert!(domain.is_domain_master(MACHINE, 8443));
    assert_eq!(
        domain.domain_manager().map(|h| h.host.as_str()),
        Some("sd.example.com")
    );
    assert_eq!(o.store().get("securitydomain.host"), Some("sd.example.com"));
    assert_eq!(o.store().get("dbs.beginSerialNumber"), Some("9000001"));
}

#[test]
fn clone_of_other_ca_does_not_manage_domain() {
    let transport = MockTransport::new();
    let domain = domain_manager(&transport);
    let mut o = cloned_ca(transport.clone(), "ca2.example.com");
    let mut request = clone_request();
    request.clone_uri = Some("https://ca2.example.com:8443".into());

    done::finish(&mut o, SubsystemType::Ca, &request).unwrap();

    let call = transport.call_to(UPDATE_DOMAIN_XML_ADMIN_PATH).unwrap();
    assert_eq!(call.field("dm"), Some("false"));
    let domain = domain.lock().unwrap();
    assert!(!domain.is_domain_master(MACHINE, 8443));
    assert!(domain.find_host(SubsystemType::Ca, MACHINE, 8443).unwrap().clone);
}
