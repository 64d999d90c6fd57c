//! Issuing the system certificates.
//!
//! Every certificate is either signed with its own key, signed by the CA of
//! this instance, requested from a remote CA, or supplied from outside.
//! [`CertificateIssuer::decide`] picks one of these from the instance
//! configuration, [`CertificateIssuer::issue`] carries it out. Results are
//! only written once the certificate is in hand, a failed attempt leaves
//! the configuration as it was.

use std::path::PathBuf;
use std::sync::Arc;
use log::{debug, info, warn};
use crate::commons::error::Error;
use crate::commons::{SetupEmptyResult, SetupResult};
use crate::constants::SUBSYSTEM_GROUP;
use crate::crypto::{
    algorithm, base64_encode, softtoken, CertInfo, CryptoToken, IssuerName,
    KeyType, SigningAlgorithm,
};
use crate::domain::SubsystemType;
use crate::remote::{CertSubmission, Peer, RemoteAdminClient};
use crate::store::ConfigStore;
use crate::users::{User, UserGroupSubsystem};
use super::profile::{CertProfile, ProfileRequest};
use super::repository::{CertRecord, CertRepository, RequestRecord};
use super::transfer::CertImportExport;
use super::{CertSpec, CertTag, IssuanceType};


//------------ Issuance ------------------------------------------------------

/// How a certificate is going to be produced.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Issuance {
    SelfSigned,

    /// Signed with the signing key of the CA of this instance.
    Local,

    Remote(RemoteIssuance),

    /// Issued by a CA we cannot talk to, the certificate has to be
    /// supplied with the request.
    External,
}

/// Where and how to request a certificate remotely.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteIssuance {
    pub peer: Peer,
    pub profile_id: String,
    pub session_id: Option<String>,
}


//------------ IssueParams ---------------------------------------------------

/// Parameters of one issuance beyond the instance configuration.
#[derive(Clone, Debug, Default)]
pub struct IssueParams {
    /// The install token session with the security domain.
    pub session_id: Option<String>,

    /// The master when cloning a CA.
    ///
    /// The SSL server certificate of a CA clone is always requested from
    /// its master so issuer and subject names of the topology encode
    /// identically.
    pub clone_master: Option<Peer>,
}


//------------ CertificateIssuer ---------------------------------------------

/// Maps a certificate tag and profile id to the profile id used remotely.
pub type ProfileMapper = dyn Fn(CertTag, &str) -> String + Send + Sync;

pub struct CertificateIssuer {
    token: Arc<dyn CryptoToken>,
    remote: RemoteAdminClient,
    profiles_dir: Option<PathBuf>,
    repository: Option<Arc<dyn CertRepository>>,
    users: Option<Arc<dyn UserGroupSubsystem>>,
    profile_mapper: Option<Arc<ProfileMapper>>,
}

impl CertificateIssuer {
    pub fn new(
        token: Arc<dyn CryptoToken>,
        remote: RemoteAdminClient,
        profiles_dir: Option<PathBuf>,
    ) -> Self {
        CertificateIssuer {
            token,
            remote,
            profiles_dir,
            repository: None,
            users: None,
            profile_mapper: None,
        }
    }

    pub fn with_repository(mut self, repository: Arc<dyn CertRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn with_users(mut self, users: Arc<dyn UserGroupSubsystem>) -> Self {
        self.users = Some(users);
        self
    }

    pub fn with_profile_mapper(mut self, mapper: Arc<ProfileMapper>) -> Self {
        self.profile_mapper = Some(mapper);
        self
    }

    /// Decides how the certificate of `spec` is produced.
    pub fn decide(
        &self,
        spec: &CertSpec,
        store: &ConfigStore,
        params: &IssueParams,
    ) -> SetupResult<Issuance> {
        let kind = spec.subsystem();
        let tag = spec.tag();

        if let Some(master) = &params.clone_master {
            if kind == SubsystemType::Ca && tag == CertTag::Sslserver {
                return Ok(Issuance::Remote(RemoteIssuance {
                    peer: master.clone(),
                    profile_id: self.remote_profile_id(tag, &profile_name(spec, store))?,
                    session_id: params.session_id.clone(),
                }));
            }
        }

        match issuance_type(spec, store)? {
            IssuanceType::SelfSign => Ok(Issuance::SelfSigned),
            IssuanceType::Local => {
                if kind != SubsystemType::Ca {
                    return Err(Error::validation(format!(
                        "a {} cannot issue its {} certificate locally",
                        kind, tag
                    )));
                }
                if tag != CertTag::Signing {
                    return Ok(Issuance::Local);
                }
                match store.get_non_empty("preop.hierarchy.select") {
                    None | Some("root") => Ok(Issuance::SelfSigned),
                    Some(other) => Err(Error::validation(format!(
                        "the signing certificate of a '{other}' CA cannot be issued locally"
                    ))),
                }
            }
            IssuanceType::Remote => {
                let profile_id = self.remote_profile_id(tag, &profile_name(spec, store))?;
                let peer = if tag == CertTag::Subsystem {
                    peer_from(store, "preop.securitydomain.host", "preop.securitydomain.httpsport")?
                } else {
                    match store.get_non_empty("preop.ca.type").unwrap_or("sdca") {
                        "otherca" => return Ok(Issuance::External),
                        "sdca" => peer_from(store, "preop.ca.hostname", "preop.ca.httpsport")?,
                        other => {
                            return Err(Error::validation(format!(
                                "unknown issuing CA type '{other}'"
                            )))
                        }
                    }
                };
                Ok(Issuance::Remote(RemoteIssuance {
                    peer,
                    profile_id,
                    session_id: params.session_id.clone(),
                }))
            }
        }
    }

    /// Produces the certificate of `spec` and records it.
    ///
    /// On success the certificate is stored as `<subsystem>.<tag>.cert`,
    /// imported into the token and the spec is marked done.
    pub fn issue(
        &self,
        spec: &mut CertSpec,
        store: &mut ConfigStore,
        params: &IssueParams,
    ) -> SetupResult<Vec<u8>> {
        if spec.is_done() {
            if let Some(cert) = spec.cert() {
                return Ok(cert.to_vec());
            }
        }
        spec.validate()?;

        let issuance = self.decide(spec, store, params)?;
        info!(
            "Issuing {} certificate '{}' for {}: {:?}",
            spec.tag(), spec.nickname(), spec.subject_dn(), issuance
        );

        let issued = match &issuance {
            Issuance::SelfSigned => self.sign_locally(spec, store, false)?,
            Issuance::Local => self.sign_locally(spec, store, true)?,
            Issuance::Remote(remote) => self.request_remote(spec, store, remote)?,
            Issuance::External => self.external(spec, store)?,
        };

        self.persist(spec, store, &issued)?;
        spec.complete(issued.cert.clone(), issued.chain)?;
        Ok(issued.cert)
    }

    fn remote_profile_id(&self, tag: CertTag, profile: &str) -> SetupResult<String> {
        let loaded = CertProfile::load(self.profiles_dir.as_deref(), profile)?;
        Ok(self.profile_id(tag, &loaded))
    }

    /// The id a certificate of this profile is recorded and requested under.
    fn profile_id(&self, tag: CertTag, profile: &CertProfile) -> String {
        let id = profile
            .profile_id()
            .unwrap_or_else(|| profile.name().trim_end_matches(".profile"));
        match &self.profile_mapper {
            Some(mapper) => mapper(tag, id),
            None => id.to_string(),
        }
    }

    /// Returns the public key for the spec, creating a key if needed.
    ///
    /// A spec carrying a request uses the key of the request.
    fn public_key(&self, spec: &CertSpec) -> SetupResult<Vec<u8>> {
        if let Some(request) = spec.request() {
            return Ok(softtoken::pkcs10_public_key(request)?);
        }
        if self.token.has_key(spec.nickname()) {
            debug!("Reusing existing key '{}'", spec.nickname());
            Ok(self.token.public_key(spec.nickname())?)
        } else {
            Ok(self.token.generate_key_pair(spec.nickname(), spec.key_spec())?)
        }
    }

    fn signing_algorithm(
        &self,
        spec: &CertSpec,
        profile: &CertProfile,
        store: &ConfigStore,
        key_type: KeyType,
    ) -> SetupResult<SigningAlgorithm> {
        if spec.tag() == CertTag::Admin {
            let allowed = algorithm::allowed_list(
                profile.signing_algs_allowed(),
                store.get_non_empty("ca.profiles.defaultSigningAlgsAllowed"),
            );
            return Ok(algorithm::select_admin_algorithm(
                &allowed, profile.signing_alg_default(), key_type
            )?);
        }
        if let Some(alg) = spec.signing_algorithm() {
            if !alg.is_compatible(key_type) {
                return Err(Error::validation(format!(
                    "signing algorithm {alg} cannot be used with a {key_type} key"
                )));
            }
            return Ok(alg);
        }
        Ok(profile
            .signing_alg_default()
            .and_then(|name| name.parse::<SigningAlgorithm>().ok())
            .filter(|alg| alg.is_compatible(key_type))
            .unwrap_or_else(|| SigningAlgorithm::default_for(key_type)))
    }

    fn sign_locally(
        &self,
        spec: &CertSpec,
        store: &ConfigStore,
        by_ca: bool,
    ) -> SetupResult<Issued> {
        let public_key = self.public_key(spec)?;
        let profile = CertProfile::load(
            self.profiles_dir.as_deref(), &profile_name(spec, store)
        )?;

        let (issuer, signer, issuer_cert) = if by_ca {
            let signer = store.get_string("ca.signing.nickname")?;
            let ca_cert = self.token.find_certificate(&signer)?.ok_or_else(|| {
                Error::custom(format!("CA signing certificate '{signer}' not in token"))
            })?;
            let issuer = IssuerName::Encoded(softtoken::subject_name_der(&ca_cert)?);
            (issuer, signer, Some(ca_cert))
        } else {
            (
                IssuerName::Dn(spec.subject_dn().to_string()),
                spec.nickname().to_string(),
                None,
            )
        };
        let key_type = self.token.key_type(&signer)?;

        let (serial, request_id) = match &self.repository {
            Some(repository) => (repository.next_serial()?, Some(repository.next_request_id()?)),
            None => {
                debug!("No certificate repository, using a random serial");
                (rand::random::<u64>() >> 1, None)
            }
        };

        let now = chrono::Utc::now().timestamp();
        let mut info = CertInfo {
            serial,
            subject: spec.subject_dn().to_string(),
            issuer,
            not_before: now,
            not_after: now,
            public_key: public_key.clone(),
            extensions: Vec::new(),
        };
        profile.apply(
            &ProfileRequest {
                subject: spec.subject_dn(),
                now,
                configured_san: store.get_non_empty("service.sslserver.san"),
                ocsp_uri: store.get_non_empty("ca.defaultOcspUri"),
            },
            &mut info,
        )?;

        let algorithm = self.signing_algorithm(spec, &profile, store, key_type)?;
        let cert = self.token.sign_certificate(
            &info, &signer, algorithm, issuer_cert.as_deref()
        )?;

        let records = request_id.map(|request_id| {
            let profile_id = self.profile_id(spec.tag(), &profile);
            let issuer_dn = match &issuer_cert {
                Some(ca) => softtoken::subject_dn(ca),
                None => Ok(spec.subject_dn().to_string()),
            };
            issuer_dn.map(|issuer| (
                RequestRecord {
                    id: request_id,
                    profile_id: profile_id.clone(),
                    subject: spec.subject_dn().to_string(),
                    requestor: requestor(store, spec.subsystem()),
                    public_key,
                    cert_serial: serial,
                },
                CertRecord {
                    serial,
                    subject: spec.subject_dn().to_string(),
                    issuer,
                    cert: cert.clone(),
                    request_id,
                    profile_id,
                },
            ))
        }).transpose()?;

        Ok(Issued {
            cert,
            chain: issuer_cert.into_iter().collect(),
            request: spec.request().map(<[u8]>::to_vec),
            records,
            ca_certs_imported: true,
        })
    }

    fn request_remote(
        &self,
        spec: &CertSpec,
        store: &ConfigStore,
        remote: &RemoteIssuance,
    ) -> SetupResult<Issued> {
        let public_key = self.public_key(spec)?;
        let csr = match spec.request() {
            Some(request) => request.to_vec(),
            None => {
                let key_type = self.token.key_type(spec.nickname())?;
                let algorithm = spec
                    .signing_algorithm()
                    .filter(|alg| alg.is_compatible(key_type))
                    .unwrap_or_else(|| SigningAlgorithm::default_for(key_type));
                self.token.create_pkcs10(spec.nickname(), spec.subject_dn(), algorithm)?
            }
        };

        let ca_chain = self.remote.get_cert_chain(&remote.peer)?;
        let submission = CertSubmission {
            profile_id: remote.profile_id.clone(),
            request: base64_encode(&csr),
            session_id: remote.session_id.clone(),
            requestor: requestor(store, spec.subsystem()),
        };
        let response = self.remote.submit_cert_request(&remote.peer, &submission)?;

        if softtoken::cert_public_key(&response.cert)? != public_key {
            return Err(Error::remote(
                remote.peer.uri(crate::constants::PROFILE_SUBMIT_PATH),
                format!("issued {} certificate has a different key", spec.tag()),
            ));
        }

        Ok(Issued {
            cert: response.cert,
            chain: if response.chain.is_empty() { ca_chain } else { response.chain },
            request: Some(csr),
            records: None,
            ca_certs_imported: false,
        })
    }

    /// Uses a certificate supplied from outside.
    ///
    /// Without one, the request is stored under `<subsystem>.<tag>.certreq`
    /// for the operator to take to the external CA.
    fn external(&self, spec: &CertSpec, store: &mut ConfigStore) -> SetupResult<Issued> {
        let public_key = self.public_key(spec)?;
        if let Some(cert) = spec.cert() {
            if softtoken::cert_public_key(cert)? != public_key {
                return Err(Error::validation(format!(
                    "supplied {} certificate does not match its key", spec.tag()
                )));
            }
            return Ok(Issued {
                cert: cert.to_vec(),
                chain: spec.chain().to_vec(),
                request: spec.request().map(<[u8]>::to_vec),
                records: None,
                ca_certs_imported: false,
            });
        }

        let key_type = self.token.key_type(spec.nickname())?;
        let csr = self.token.create_pkcs10(
            spec.nickname(),
            spec.subject_dn(),
            SigningAlgorithm::default_for(key_type),
        )?;
        let key = format!("{}.certreq", spec.config_prefix());
        store.put(&key, base64_encode(&csr));
        store.commit()?;
        Err(Error::validation(format!(
            "the {} certificate must be issued by an external CA, \
             its request is stored in {key}",
            spec.tag()
        )))
    }

    fn persist(
        &self,
        spec: &CertSpec,
        store: &mut ConfigStore,
        issued: &Issued,
    ) -> SetupEmptyResult {
        if !issued.ca_certs_imported && !issued.chain.is_empty() {
            CertImportExport::new(self.token.clone()).import_ca_certs(&issued.chain)?;
        }
        if self.token.has_key(spec.nickname()) {
            self.token.import_certificate(
                spec.nickname(), &issued.cert, &spec.tag().trust_flags()
            )?;
        }

        let prefix = spec.config_prefix();
        store.put(&format!("{prefix}.cert"), base64_encode(&issued.cert));
        if let Some(request) = &issued.request {
            store.put(&format!("{prefix}.certreq"), base64_encode(request));
        }
        store.put(&format!("{prefix}.nickname"), spec.nickname());
        store.put(&format!("{prefix}.tokenname"), spec.token());
        store.commit()?;

        if let (Some(repository), Some((request, cert))) = (&self.repository, &issued.records) {
            repository.add_request(request)?;
            repository.add_certificate(cert)?;
        }

        if spec.tag() == CertTag::Subsystem {
            self.add_subsystem_user(spec, store, &issued.cert)?;
        }
        Ok(())
    }

    /// Creates the user owning the subsystem certificate.
    fn add_subsystem_user(
        &self,
        spec: &CertSpec,
        store: &ConfigStore,
        cert: &[u8],
    ) -> SetupEmptyResult {
        let Some(users) = &self.users else {
            debug!("No user database, not creating subsystem user");
            return Ok(())
        };
        let uid = requestor(store, spec.subsystem());
        let mut user = User::new(&uid, &uid);
        user.user_type = Some("agentType".into());
        match users.create_user(&user) {
            Ok(()) => {}
            Err(Error::Conflict(_)) => debug!("Subsystem user '{uid}' exists"),
            Err(err) => return Err(err),
        }
        users.add_cert(&uid, cert)?;
        if let Err(err) = users.add_to_group(&uid, SUBSYSTEM_GROUP) {
            warn!("Cannot add '{uid}' to {SUBSYSTEM_GROUP}: {err}");
            return Err(err);
        }
        Ok(())
    }
}


//------------ Issued --------------------------------------------------------

struct Issued {
    cert: Vec<u8>,
    chain: Vec<Vec<u8>>,
    request: Option<Vec<u8>>,
    records: Option<(RequestRecord, CertRecord)>,

    /// Whether the chain is in the token already.
    ca_certs_imported: bool,
}


//------------ Helpers -------------------------------------------------------

fn issuance_type(spec: &CertSpec, store: &ConfigStore) -> SetupResult<IssuanceType> {
    match store.get_non_empty(&format!("preop.cert.{}.type", spec.tag())) {
        Some(value) => value.parse(),
        None => Ok(spec.issuance()),
    }
}

fn profile_name(spec: &CertSpec, store: &ConfigStore) -> String {
    store
        .get_non_empty(&format!("preop.cert.{}.profile", spec.tag()))
        .unwrap_or(spec.profile())
        .to_string()
}

fn peer_from(store: &ConfigStore, host: &str, port: &str) -> SetupResult<Peer> {
    let hostname = store.get_non_empty(host).ok_or_else(|| {
        Error::validation(format!("missing {host}"))
    })?;
    Ok(Peer::new(hostname, store.get_port(port)?))
}

/// Identifies this instance towards a CA as `{type}-{machine}-{port}`.
pub fn requestor(store: &ConfigStore, kind: SubsystemType) -> String {
    format!(
        "{}-{}-{}",
        kind.name(),
        store.get_string_or("service.machineName", "localhost"),
        store.get_string_or("service.securePort", "8443"),
    )
}


//------------ Tests ---------------------------------------------------------
