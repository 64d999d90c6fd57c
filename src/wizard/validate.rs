//! Checking a configuration request before anything is changed.

use log::warn;
use crate::api::{ConfigurationRequest, Hierarchy, SecurityDomainType};
use crate::certs::CertTag;
use crate::commons::error::Error;
use crate::commons::SetupEmptyResult;
use crate::constants::{AUDIT_LOG_TARGET, CS_STATE_KEY};
use crate::crypto::{KeySpec, SigningAlgorithm};
use crate::domain::SubsystemType;
use crate::remote::Peer;
use crate::store::ConfigStore;

/// The `issuingCa` value naming a CA outside the security domain.
pub const EXTERNAL_CA: &str = "External CA";

/// Checks a request against the instance configuration.
///
/// Everything that can be known to fail without talking to peers is
/// rejected here, so an invalid request leaves no trace.
pub fn check_request(
    store: &ConfigStore,
    kind: SubsystemType,
    request: &ConfigurationRequest,
) -> SetupEmptyResult {
    if store.get_int_or(CS_STATE_KEY, 0)? == 1 {
        return Err(Error::AlreadyConfigured);
    }
    check_pin(store, &request.pin)?;

    if request.subsystem_name.trim().is_empty() {
        return Err(Error::validation("missing subsystem name"));
    }

    check_security_domain(kind, request)?;
    check_clone(kind, request)?;
    check_hierarchy(kind, request)?;
    check_database(request)?;
    check_system_certs(kind, request)?;
    check_admin(request)?;

    if request.backup_keys {
        if non_empty(&request.backup_file).is_none() {
            return Err(Error::validation("backing up keys needs a backup location"));
        }
        if non_empty(&request.backup_password).is_none() {
            return Err(Error::validation("backing up keys needs a backup password"));
        }
    }
    for (name, uri) in [
        ("caUri", &request.ca_uri),
        ("kraUri", &request.kra_uri),
        ("tksUri", &request.tks_uri),
    ] {
        if let Some(uri) = non_empty(uri) {
            parse_peer(name, uri)?;
        }
    }
    if kind == SubsystemType::Tps && non_empty(&request.tks_uri).is_none() {
        return Err(Error::validation("a TPS needs the URI of its TKS"));
    }
    Ok(())
}

fn check_pin(store: &ConfigStore, pin: &str) -> SetupEmptyResult {
    if pin.is_empty() {
        return Err(Error::validation("missing pin"));
    }
    match store.get_non_empty("preop.pin") {
        Some(expected) if expected == pin => Ok(()),
        Some(_) => {
            warn!(target: AUDIT_LOG_TARGET, "Configuration request with wrong pin");
            Err(Error::validation("the pin does not match"))
        }
        None => Err(Error::validation("this instance has no pin, it cannot be configured")),
    }
}

fn check_security_domain(
    kind: SubsystemType, request: &ConfigurationRequest
) -> SetupEmptyResult {
    match request.security_domain_type {
        None => Err(Error::validation("missing security domain type")),
        Some(SecurityDomainType::NewDomain) => {
            if kind != SubsystemType::Ca {
                return Err(Error::validation(format!(
                    "a {kind} must join an existing security domain"
                )));
            }
            if request.is_clone {
                return Err(Error::validation("a clone must join the domain of its master"));
            }
            if non_empty(&request.security_domain_name).is_none() {
                return Err(Error::validation("missing security domain name"));
            }
            Ok(())
        }
        Some(SecurityDomainType::ExistingDomain) => {
            let uri = non_empty(&request.security_domain_uri).ok_or_else(|| {
                Error::validation("missing security domain URI")
            })?;
            parse_peer("securityDomainUri", uri)?;
            if non_empty(&request.install_token).is_none()
                && (non_empty(&request.security_domain_user).is_none()
                    || non_empty(&request.security_domain_password).is_none())
            {
                return Err(Error::validation(
                    "joining a security domain needs an install token or \
                     user and password"
                ));
            }
            Ok(())
        }
    }
}

fn check_clone(kind: SubsystemType, request: &ConfigurationRequest) -> SetupEmptyResult {
    if !request.is_clone {
        return Ok(());
    }
    if matches!(kind, SubsystemType::Tps | SubsystemType::Ra) {
        return Err(Error::validation(format!("a {kind} cannot be cloned")));
    }
    let uri = non_empty(&request.clone_uri).ok_or_else(|| {
        Error::validation("missing clone URI")
    })?;
    parse_peer("cloneUri", uri)?;
    if request.p12_files.is_empty() {
        return Err(Error::validation("a clone needs the PKCS#12 files of its master"));
    }
    if request.p12_password.is_none() {
        return Err(Error::validation("missing PKCS#12 password"));
    }
    Ok(())
}

fn check_hierarchy(kind: SubsystemType, request: &ConfigurationRequest) -> SetupEmptyResult {
    if kind == SubsystemType::Ca && request.is_clone {
        return Ok(());
    }
    let needs_issuer = kind != SubsystemType::Ca || request.hierarchy() == Hierarchy::Join;
    if kind != SubsystemType::Ca && request.hierarchy == Some(Hierarchy::Join) {
        warn!("Ignoring hierarchy selection for a {kind}");
    }
    match non_empty(&request.issuing_ca) {
        Some(EXTERNAL_CA) => {
            if !needs_issuer {
                return Err(Error::validation("a root CA has no issuing CA"));
            }
            Ok(())
        }
        Some(uri) => {
            parse_peer("issuingCa", uri)?;
            Ok(())
        }
        None if kind == SubsystemType::Ca && needs_issuer => Err(Error::validation(
            "a subordinate CA needs an issuing CA"
        )),
        None => Ok(()),
    }
}

fn check_database(request: &ConfigurationRequest) -> SetupEmptyResult {
    let db = request.database.as_ref().ok_or_else(|| {
        Error::validation("missing database settings")
    })?;
    for (name, value) in [
        ("dsHost", &db.ds_host),
        ("bindDn", &db.bind_dn),
        ("baseDn", &db.base_dn),
        ("database", &db.database),
    ] {
        if value.trim().is_empty() {
            return Err(Error::validation(format!("missing database setting {name}")));
        }
    }
    if db.ds_port == 0 {
        return Err(Error::validation("invalid directory server port 0"));
    }
    if request.is_clone && db.remove_data && !db.create_new_db {
        return Err(Error::validation(
            "a clone cannot remove the data of an existing database"
        ));
    }
    Ok(())
}

fn check_system_certs(kind: SubsystemType, request: &ConfigurationRequest) -> SetupEmptyResult {
    let tags = kind.system_cert_tags();
    for cert in &request.system_certs {
        if !tags.contains(&cert.tag) {
            return Err(Error::validation(format!(
                "a {kind} has no {} certificate", cert.tag
            )));
        }
        if let Some(dn) = &cert.subject_dn {
            if dn.trim().is_empty() {
                return Err(Error::validation(format!(
                    "empty subject DN for {} certificate", cert.tag
                )));
            }
        }
        if cert.key_type.is_some() || cert.key_size.is_some() {
            let key_type = cert.key_type.as_deref().unwrap_or("rsa");
            KeySpec::parse(key_type, cert.key_size.as_deref().unwrap_or(
                default_key_size(key_type)
            )).map_err(|e| Error::validation(format!("{} certificate: {e}", cert.tag)))?;
        }
        if let Some(alg) = non_empty(&cert.signing_algorithm) {
            alg.parse::<SigningAlgorithm>().map_err(|_| {
                Error::validation(format!(
                    "unknown signing algorithm '{alg}' for {} certificate", cert.tag
                ))
            })?;
        }
    }
    if kind == SubsystemType::Ca && !request.is_clone && request.hierarchy() == Hierarchy::Root {
        if let Some(signing) = request.system_cert(CertTag::Signing) {
            if signing.issuance_type == Some(crate::certs::IssuanceType::Remote) {
                return Err(Error::validation(
                    "the signing certificate of a root CA is self-signed"
                ));
            }
        }
    }
    Ok(())
}

fn check_admin(request: &ConfigurationRequest) -> SetupEmptyResult {
    if request.is_clone {
        return Ok(());
    }
    let admin = request.admin.as_ref().ok_or_else(|| {
        Error::validation("missing administrator settings")
    })?;
    for (name, value) in [
        ("adminUid", &admin.admin_uid),
        ("adminPassword", &admin.admin_password),
        ("adminName", &admin.admin_name),
        ("adminEmail", &admin.admin_email),
        ("adminSubjectDn", &admin.admin_subject_dn),
    ] {
        if value.trim().is_empty() {
            return Err(Error::validation(format!("missing {name}")));
        }
    }
    if admin.import_admin_cert {
        if non_empty(&admin.admin_cert).is_none() {
            return Err(Error::validation("importing the admin certificate needs adminCert"));
        }
    }
    else if non_empty(&admin.admin_cert_request).is_none() {
        return Err(Error::validation("missing adminCertRequest"));
    }
    Ok(())
}

/// The key size used when a request names only the key type.
pub fn default_key_size(key_type: &str) -> &'static str {
    if key_type.eq_ignore_ascii_case("ecc") || key_type.eq_ignore_ascii_case("ec") {
        "nistp256"
    } else {
        "2048"
    }
}

pub fn parse_peer(name: &str, uri: &str) -> Result<Peer, Error> {
    uri.parse::<Peer>().map_err(|_| {
        Error::validation(format!("invalid URI for {name}: '{uri}'"))
    })
}

pub fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{AdminRequest, DatabaseRequest, SystemCertData};

    fn store() -> ConfigStore {
        let mut store = ConfigStore::in_memory();
        store.put("preop.pin", "abc123");
        store.put(CS_STATE_KEY, 0);
        store
    }

    fn root_ca() -> ConfigurationRequest {
        ConfigurationRequest {
            pin: "abc123".into(),
            subsystem_name: "CA ca.example.com 8443".into(),
            security_domain_type: Some(SecurityDomainType::NewDomain),
            security_domain_name: Some("Example Domain".into()),
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
            admin: Some(AdminRequest {
                admin_uid: "caadmin".into(),
                admin_password: "Secret.123".into(),
                admin_name: "CA Administrator".into(),
                admin_email: "caadmin@example.com".into(),
                admin_subject_dn: "CN=PKI Administrator".into(),
                admin_cert_request: Some("MIIB".into()),
                admin_profile_id: None,
                import_admin_cert: false,
                admin_cert: None,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn accepts_root_ca() {
        check_request(&store(), SubsystemType::Ca, &root_ca()).unwrap();
    }

    #[test]
    fn rejects_bad_pin() {
        let mut request = root_ca();
        request.pin = String::new();
        assert!(matches!(
            check_request(&store(), SubsystemType::Ca, &request),
            Err(Error::Validation(_))
        ));
        request.pin = "wrong".into();
        assert!(matches!(
            check_request(&store(), SubsystemType::Ca, &request),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn rejects_configured_instance() {
        let mut store = store();
        store.put(CS_STATE_KEY, 1);
        assert!(matches!(
            check_request(&store, SubsystemType::Ca, &root_ca()),
            Err(Error::AlreadyConfigured)
        ));
    }

    #[test]
    fn kra_cannot_create_domain() {
        assert!(matches!(
            check_request(&store(), SubsystemType::Kra, &root_ca()),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn rejects_invalid_uris() {
        let mut request = root_ca();
        request.security_domain_type = Some(SecurityDomainType::ExistingDomain);
        request.security_domain_uri = Some("not a uri".into());
        request.install_token = Some("123".into());
        assert!(matches!(
            check_request(&store(), SubsystemType::Ca, &request),
            Err(Error::Validation(_))
        ));

        let mut request = root_ca();
        request.ca_uri = Some("ftp:/x".into());
        assert!(check_request(&store(), SubsystemType::Ca, &request).is_err());
    }

    #[test]
    fn rejects_foreign_cert_tags_and_keys() {
        let mut request = root_ca();
        request.system_certs.push(SystemCertData::new(CertTag::Transport));
        assert!(check_request(&store(), SubsystemType::Ca, &request).is_err());

        let mut request = root_ca();
        let mut signing = SystemCertData::new(CertTag::Signing);
        signing.key_type = Some("rsa".into());
        signing.key_size = Some("1024".into());
        request.system_certs.push(signing);
        assert!(check_request(&store(), SubsystemType::Ca, &request).is_err());
    }

    #[test]
    fn clone_needs_master_keys() {
        let mut request = root_ca();
        request.security_domain_type = Some(SecurityDomainType::ExistingDomain);
        request.security_domain_uri = Some("https://sd.example.com:8443".into());
        request.install_token = Some("123".into());
        request.is_clone = true;
        request.clone_uri = Some("https://master.example.com:8443".into());
        assert!(check_request(&store(), SubsystemType::Kra, &request).is_err());

        request.p12_files = vec!["/tmp/master.p12".into()];
        request.p12_password = Some("Secret.123".into());
        check_request(&store(), SubsystemType::Kra, &request).unwrap();
    }
}
