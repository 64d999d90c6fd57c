//! The system certificates of a subsystem instance.

pub mod issuer;
pub mod profile;
pub mod repository;
pub mod transfer;

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use crate::commons::error::Error;
use crate::commons::SetupEmptyResult;
use crate::crypto::{KeySpec, SigningAlgorithm, TrustFlags};
use crate::domain::SubsystemType;


//------------ CertTag -------------------------------------------------------

/// The role of a system certificate.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CertTag {
    Signing,
    OcspSigning,
    Sslserver,
    Subsystem,
    AuditSigning,
    Transport,
    Storage,
    Admin,
}

impl CertTag {
    pub fn name(self) -> &'static str {
        match self {
            CertTag::Signing => "signing",
            CertTag::OcspSigning => "ocsp_signing",
            CertTag::Sslserver => "sslserver",
            CertTag::Subsystem => "subsystem",
            CertTag::AuditSigning => "audit_signing",
            CertTag::Transport => "transport",
            CertTag::Storage => "storage",
            CertTag::Admin => "admin",
        }
    }

    /// The nickname used when the request does not name one.
    pub fn default_nickname(self, kind: SubsystemType) -> String {
        match self {
            CertTag::Signing if kind == SubsystemType::Ocsp => "ocspSigningCert".into(),
            CertTag::Signing => "caSigningCert".into(),
            CertTag::OcspSigning => "ocspSigningCert".into(),
            CertTag::Sslserver => "Server-Cert".into(),
            CertTag::Subsystem => "subsystemCert".into(),
            CertTag::AuditSigning => "auditSigningCert".into(),
            CertTag::Transport => "transportCert".into(),
            CertTag::Storage => "storageCert".into(),
            CertTag::Admin => "PKI Administrator".into(),
        }
    }

    /// The profile file used for issuing this certificate.
    pub fn default_profile(self, kind: SubsystemType) -> &'static str {
        match self {
            CertTag::Signing if kind == SubsystemType::Ocsp => "ocspCert.profile",
            CertTag::Signing => "caCert.profile",
            CertTag::OcspSigning => "ocspCert.profile",
            CertTag::Sslserver => "serverCert.profile",
            CertTag::Subsystem => "subsystemCert.profile",
            CertTag::AuditSigning => "auditSigningCert.profile",
            CertTag::Transport => "transportCert.profile",
            CertTag::Storage => "storageCert.profile",
            CertTag::Admin => "adminCert.profile",
        }
    }

    pub fn trust_flags(self) -> TrustFlags {
        match self {
            CertTag::Signing => TrustFlags::ca_signing(),
            CertTag::AuditSigning => TrustFlags::audit_signing(),
            _ => TrustFlags::user(),
        }
    }
}

impl FromStr for CertTag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "signing" => Ok(CertTag::Signing),
            "ocsp_signing" => Ok(CertTag::OcspSigning),
            "sslserver" => Ok(CertTag::Sslserver),
            "subsystem" => Ok(CertTag::Subsystem),
            "audit_signing" => Ok(CertTag::AuditSigning),
            "transport" => Ok(CertTag::Transport),
            "storage" => Ok(CertTag::Storage),
            "admin" => Ok(CertTag::Admin),
            _ => Err(Error::validation(format!("unknown certificate tag '{s}'"))),
        }
    }
}

impl fmt::Display for CertTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}


//------------ IssuanceType --------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssuanceType {
    /// Signed with its own key.
    SelfSign,

    /// Signed by the CA of this very instance.
    Local,

    /// Requested from another CA.
    Remote,
}

impl IssuanceType {
    pub fn as_str(self) -> &'static str {
        match self {
            IssuanceType::SelfSign => "selfsign",
            IssuanceType::Local => "local",
            IssuanceType::Remote => "remote",
        }
    }
}

impl FromStr for IssuanceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "selfsign" => Ok(IssuanceType::SelfSign),
            "local" => Ok(IssuanceType::Local),
            "remote" => Ok(IssuanceType::Remote),
            _ => Err(Error::validation(format!("unknown issuance type '{s}'"))),
        }
    }
}


//------------ CertSpec ------------------------------------------------------

/// One system certificate to produce during a configuration run.
///
/// Once marked done the spec no longer changes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CertSpec {
    tag: CertTag,
    subsystem: SubsystemType,
    nickname: String,
    token: String,
    subject_dn: String,
    key_spec: KeySpec,
    signing_algorithm: Option<SigningAlgorithm>,
    profile: String,
    issuance: IssuanceType,
    request: Option<Vec<u8>>,
    cert: Option<Vec<u8>>,
    chain: Vec<Vec<u8>>,
    done: bool,
}

impl CertSpec {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tag: CertTag,
        subsystem: SubsystemType,
        nickname: String,
        token: String,
        subject_dn: String,
        key_spec: KeySpec,
        profile: String,
        issuance: IssuanceType,
    ) -> Self {
        CertSpec {
            tag,
            subsystem,
            nickname,
            token,
            subject_dn,
            key_spec,
            signing_algorithm: None,
            profile,
            issuance,
            request: None,
            cert: None,
            chain: Vec::new(),
            done: false,
        }
    }

    pub fn with_signing_algorithm(mut self, alg: Option<SigningAlgorithm>) -> Self {
        self.signing_algorithm = alg;
        self
    }

    pub fn tag(&self) -> CertTag {
        self.tag
    }

    pub fn subsystem(&self) -> SubsystemType {
        self.subsystem
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn subject_dn(&self) -> &str {
        &self.subject_dn
    }

    pub fn key_spec(&self) -> &KeySpec {
        &self.key_spec
    }

    pub fn signing_algorithm(&self) -> Option<SigningAlgorithm> {
        self.signing_algorithm
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn issuance(&self) -> IssuanceType {
        self.issuance
    }

    pub fn request(&self) -> Option<&[u8]> {
        self.request.as_deref()
    }

    pub fn cert(&self) -> Option<&[u8]> {
        self.cert.as_deref()
    }

    pub fn chain(&self) -> &[Vec<u8>] {
        &self.chain
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// The config key prefix for the values of this certificate.
    pub fn config_prefix(&self) -> String {
        format!("{}.{}", self.subsystem.lower(), self.tag)
    }

    /// Checks that the spec can be issued.
    pub fn validate(&self) -> SetupEmptyResult {
        if self.subject_dn.trim().is_empty() {
            return Err(Error::validation(format!(
                "missing subject DN for {} certificate", self.tag
            )));
        }
        if self.nickname.trim().is_empty() {
            return Err(Error::validation(format!(
                "missing nickname for {} certificate", self.tag
            )));
        }
        Ok(())
    }

    fn ensure_open(&self) -> SetupEmptyResult {
        if self.done {
            Err(Error::conflict(format!(
                "{} certificate is already done", self.tag
            )))
        } else {
            Ok(())
        }
    }

    pub fn set_request(&mut self, request: Vec<u8>) -> SetupEmptyResult {
        self.ensure_open()?;
        self.request = Some(request);
        Ok(())
    }

    /// Records the certificate, typically supplied with the request.
    pub fn set_cert(&mut self, cert: Vec<u8>) -> SetupEmptyResult {
        self.ensure_open()?;
        self.cert = Some(cert);
        Ok(())
    }

    /// Records the issued certificate and freezes the spec.
    pub fn complete(
        &mut self, cert: Vec<u8>, chain: Vec<Vec<u8>>
    ) -> SetupEmptyResult {
        self.ensure_open()?;
        self.cert = Some(cert);
        self.chain = chain;
        self.done = true;
        Ok(())
    }
}


//------------ Tests ---------------------------------------------------------
