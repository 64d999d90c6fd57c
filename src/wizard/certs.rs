//! The certificate and administrator steps.

use std::sync::Arc;
use log::{debug, info};
use crate::api::{
    ConfigurationRequest, ConfigurationResponse, Hierarchy, SystemCertData,
};
use crate::certs::issuer::{CertificateIssuer, IssueParams};
use crate::certs::repository::DirectoryCertRepository;
use crate::certs::transfer::CertImportExport;
use crate::certs::{CertSpec, CertTag, IssuanceType};
use crate::commons::error::Error;
use crate::commons::{SetupEmptyResult, SetupResult};
use crate::constants::{
    ADMINISTRATORS_GROUP, CERTIFICATE_MANAGER_AGENTS_GROUP,
    SECURITY_DOMAIN_ADMINISTRATORS_GROUP,
};
use crate::crypto::{
    base64_decode, base64_encode, softtoken, KeySpec, SigningAlgorithm,
};
use crate::database::InternalDb;
use crate::domain::SubsystemType;
use crate::remote::Peer;
use crate::store::ConfigStore;
use crate::users::{DirectoryUserStore, User, UserGroupSubsystem};
use super::validate::{default_key_size, non_empty};
use super::ConfigurationOrchestrator;


//------------ System Certificates -------------------------------------------

/// Produces every system certificate of the instance.
///
/// Certificates are done one by one. Each one that is done is marked so
/// a repeated run after a failure continues with the next one.
pub fn issue_system_certs(
    o: &mut ConfigurationOrchestrator,
    kind: SubsystemType,
    request: &ConfigurationRequest,
) -> SetupEmptyResult {
    let db = InternalDb::from_store(&o.store)?;
    let users = DirectoryUserStore::new(o.directories.connect(&db.conn)?, &db.base_dn);
    let mut issuer = CertificateIssuer::new(
        o.token.clone(), o.remote.clone(), o.profiles_dir.clone()
    ).with_users(Arc::new(users));
    if kind == SubsystemType::Ca {
        issuer = issuer.with_repository(Arc::new(
            DirectoryCertRepository::new(o.directories.connect(&db.conn)?, &db.base_dn)
        ));
    }
    let params = IssueParams {
        session_id: o.session_id().ok(),
        clone_master: clone_master(&o.store, request)?,
    };

    for &tag in kind.system_cert_tags() {
        let done_key = format!("preop.cert.{tag}.done");
        let mut spec = cert_spec(&o.store, kind, request, tag)?;
        if o.store.get_bool_or(&done_key, false)? {
            debug!("{tag} certificate is done already");
        }
        else {
            let restored = o.store
                .get_non_empty(&format!("preop.restored.{tag}"))
                .map(ToString::to_string);
            match restored {
                // Clones always get a server certificate of their own.
                Some(nickname) if tag != CertTag::Sslserver => {
                    use_restored(o, &spec, &nickname)?;
                }
                _ => {
                    o.store.put(&format!("preop.cert.{tag}.type"), spec.issuance().as_str());
                    o.store.put(&format!("preop.cert.{tag}.profile"), spec.profile());
                    let chain = request
                        .system_cert(tag)
                        .and_then(|data| non_empty(&data.cert_chain));
                    if let Some(chain) = chain {
                        CertImportExport::new(o.token.clone()).import_chain(chain.as_bytes())?;
                    }
                    issuer.issue(&mut spec, &mut o.store, &params)?;
                }
            }
            o.store.put_bool(&done_key, true);
        }

        if kind == SubsystemType::Ca && tag == CertTag::Signing {
            o.store.put("ca.signing.nickname", spec.nickname());
        }
        o.store.commit()?;
    }
    info!("All system certificates of the {kind} are in place");
    Ok(())
}

/// Records a certificate restored from the master of a clone.
fn use_restored(
    o: &mut ConfigurationOrchestrator, spec: &CertSpec, nickname: &str
) -> SetupEmptyResult {
    let cert = o.token.find_certificate(nickname)?.ok_or_else(|| {
        Error::custom(format!("restored certificate '{nickname}' is not in the token"))
    })?;
    o.token.set_trust(nickname, &spec.tag().trust_flags())?;

    let prefix = spec.config_prefix();
    o.store.put(&format!("{prefix}.cert"), base64_encode(&cert));
    o.store.put(&format!("{prefix}.nickname"), nickname);
    o.store.put(&format!("{prefix}.tokenname"), spec.token());
    info!("Using restored {} certificate '{nickname}'", spec.tag());
    Ok(())
}

/// Builds the spec of a system certificate from the request.
///
/// Whatever the request leaves out is filled in from the defaults of the
/// certificate type.
pub fn cert_spec(
    store: &ConfigStore,
    kind: SubsystemType,
    request: &ConfigurationRequest,
    tag: CertTag,
) -> SetupResult<CertSpec> {
    let data = request.system_cert(tag);
    let value = |get: Field| field(data, get);

    let key_type = value(|d| &d.key_type).unwrap_or("rsa");
    let key_size = value(|d| &d.key_size).unwrap_or(default_key_size(key_type));
    let signing_algorithm = value(|d| &d.signing_algorithm)
        .map(str::parse::<SigningAlgorithm>)
        .transpose()?;
    let issuance = data
        .and_then(|data| data.issuance_type)
        .unwrap_or_else(|| default_issuance(kind, tag, request.hierarchy()));
    let subject_dn = match value(|d| &d.subject_dn) {
        Some(dn) => dn.to_string(),
        None => default_subject_dn(store, kind, tag),
    };

    let mut spec = CertSpec::new(
        tag,
        kind,
        nickname(kind, request, tag),
        value(|d| &d.token).unwrap_or(request.token_name()).to_string(),
        subject_dn,
        KeySpec::parse(key_type, key_size)?,
        value(|d| &d.profile).unwrap_or(tag.default_profile(kind)).to_string(),
        issuance,
    ).with_signing_algorithm(signing_algorithm);

    if let Some(csr) = value(|d| &d.request) {
        spec.set_request(base64_decode(csr)?)?;
    }
    if let Some(cert) = value(|d| &d.cert) {
        spec.set_cert(base64_decode(cert)?)?;
    }
    Ok(spec)
}

type Field = fn(&SystemCertData) -> &Option<String>;

fn field(data: Option<&SystemCertData>, get: Field) -> Option<&str> {
    data.and_then(|data| non_empty(get(data)))
}

/// The nickname of a system certificate.
pub fn nickname(kind: SubsystemType, request: &ConfigurationRequest, tag: CertTag) -> String {
    request
        .system_cert(tag)
        .and_then(|data| non_empty(&data.nickname))
        .map(ToString::to_string)
        .unwrap_or_else(|| tag.default_nickname(kind))
}

fn default_issuance(kind: SubsystemType, tag: CertTag, hierarchy: Hierarchy) -> IssuanceType {
    match (kind, tag, hierarchy) {
        (SubsystemType::Ca, CertTag::Signing, Hierarchy::Root) => IssuanceType::SelfSign,
        (SubsystemType::Ca, CertTag::Signing, Hierarchy::Join) => IssuanceType::Remote,
        (SubsystemType::Ca, _, _) => IssuanceType::Local,
        _ => IssuanceType::Remote,
    }
}

fn default_subject_dn(store: &ConfigStore, kind: SubsystemType, tag: CertTag) -> String {
    let common_name = match tag {
        CertTag::Sslserver => store.get_string_or("service.machineName", "localhost"),
        CertTag::Signing if kind == SubsystemType::Ca => "CA Signing Certificate".into(),
        CertTag::Signing | CertTag::OcspSigning => "OCSP Signing Certificate".into(),
        CertTag::Subsystem => "Subsystem Certificate".into(),
        CertTag::AuditSigning => format!("{} Audit Signing Certificate", kind.name()),
        CertTag::Transport => "DRM Transport Certificate".into(),
        CertTag::Storage => "DRM Storage Certificate".into(),
        CertTag::Admin => "PKI Administrator".into(),
    };
    format!(
        "CN={common_name},OU={},O={}",
        store.get_string_or("instanceId", "pki-tomcat"),
        store.get_non_empty("preop.securitydomain.name").unwrap_or("pki"),
    )
}

fn clone_master(
    store: &ConfigStore, request: &ConfigurationRequest
) -> SetupResult<Option<Peer>> {
    if !request.is_clone {
        return Ok(None)
    }
    Ok(Some(Peer::new(
        store.get_string("preop.master.hostname")?,
        store.get_port("preop.master.httpsport")?,
    )))
}


//------------ Administrator -------------------------------------------------

/// Creates the administrator with its groups and certificate.
pub fn create_admin(
    o: &mut ConfigurationOrchestrator,
    kind: SubsystemType,
    request: &ConfigurationRequest,
) -> SetupEmptyResult {
    let admin = request.admin.as_ref().ok_or_else(|| {
        Error::validation("missing administrator settings")
    })?;
    let db = InternalDb::from_store(&o.store)?;
    let users = DirectoryUserStore::new(o.directories.connect(&db.conn)?, &db.base_dn);

    let mut user = User::new(&admin.admin_uid, &admin.admin_name);
    user.email = Some(admin.admin_email.clone());
    user.password = Some(admin.admin_password.clone());
    user.user_type = Some("adminType".into());
    user.state = Some("1".into());
    match users.create_user(&user) {
        Ok(()) => {}
        Err(Error::Conflict(_)) => info!("Administrator '{}' exists already", user.uid),
        Err(err) => return Err(err),
    }
    for group in admin_groups(kind, request) {
        users.add_to_group(&admin.admin_uid, &group)?;
    }

    let cert = if admin.import_admin_cert {
        let cert = base64_decode(non_empty(&admin.admin_cert).unwrap_or_default())?;
        o.store.put(&format!("{}.admin.cert", kind.lower()), base64_encode(&cert));
        cert
    }
    else {
        let mut spec = CertSpec::new(
            CertTag::Admin,
            kind,
            CertTag::Admin.default_nickname(kind),
            request.token_name().to_string(),
            admin.admin_subject_dn.clone(),
            KeySpec::parse("rsa", "2048")?,
            CertTag::Admin.default_profile(kind).to_string(),
            if kind == SubsystemType::Ca { IssuanceType::Local } else { IssuanceType::Remote },
        );
        spec.set_request(base64_decode(
            non_empty(&admin.admin_cert_request).unwrap_or_default()
        )?)?;

        let mut issuer = CertificateIssuer::new(
            o.token.clone(), o.remote.clone(), o.profiles_dir.clone()
        );
        if kind == SubsystemType::Ca {
            issuer = issuer.with_repository(Arc::new(
                DirectoryCertRepository::new(o.directories.connect(&db.conn)?, &db.base_dn)
            ));
        }
        if let Some(profile_id) = non_empty(&admin.admin_profile_id) {
            let profile_id = profile_id.to_string();
            issuer = issuer.with_profile_mapper(Arc::new(
                move |tag: CertTag, id: &str| {
                    if tag == CertTag::Admin { profile_id.clone() } else { id.to_string() }
                }
            ));
        }
        let params = IssueParams {
            session_id: o.session_id().ok(),
            clone_master: None,
        };
        issuer.issue(&mut spec, &mut o.store, &params)?
    };

    users.add_cert(&admin.admin_uid, &cert)?;
    o.store.commit()?;
    info!("Administrator '{}' set up", admin.admin_uid);
    Ok(())
}

/// The groups the administrator joins.
///
/// The administrator of a new domain administers the enterprise of all
/// subsystem types as well.
fn admin_groups(kind: SubsystemType, request: &ConfigurationRequest) -> Vec<String> {
    let mut res = vec![ADMINISTRATORS_GROUP.to_string()];
    if kind == SubsystemType::Ca {
        res.push(CERTIFICATE_MANAGER_AGENTS_GROUP.to_string());
    }
    if request.is_new_domain() {
        res.push(SECURITY_DOMAIN_ADMINISTRATORS_GROUP.to_string());
        res.extend(SubsystemType::ALL.iter().map(|k| k.enterprise_admin_group()));
    }
    res
}


//------------ Response ------------------------------------------------------

/// Collects the certificates of the instance for the response.
pub fn response(
    store: &ConfigStore,
    kind: SubsystemType,
    request: &ConfigurationRequest,
) -> SetupResult<ConfigurationResponse> {
    let mut certs = Vec::new();
    for &tag in kind.system_cert_tags() {
        certs.push(cert_data(store, &format!("{}.{tag}", kind.lower()), tag)?);
    }
    let admin_cert = if request.is_clone {
        None
    } else {
        let mut data = cert_data(store, &format!("{}.admin", kind.lower()), CertTag::Admin)?;
        data.nickname = request.admin.as_ref().map(|admin| admin.admin_uid.clone());
        data.cert.is_some().then_some(data)
    };
    Ok(ConfigurationResponse::success(certs, admin_cert))
}

fn cert_data(store: &ConfigStore, prefix: &str, tag: CertTag) -> SetupResult<SystemCertData> {
    let value = |name: &str| {
        store.get_non_empty(&format!("{prefix}.{name}")).map(ToString::to_string)
    };
    let mut data = SystemCertData::new(tag);
    data.nickname = value("nickname");
    data.token = value("tokenname");
    data.request = value("certreq");
    if let Some(cert) = value("cert") {
        data.subject_dn = Some(softtoken::subject_dn(&base64_decode(&cert)?)?);
        data.cert = Some(cert);
    }
    Ok(data)
}


//------------ Tests ---------------------------------------------------------
