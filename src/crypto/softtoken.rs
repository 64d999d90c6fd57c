//! A crypto token keeping software keys through OpenSSL.
//!
//! Keys and certificates are held in memory. When the token is given a
//! directory, its contents are also stored there, unencrypted, in a single
//! JSON file that is rewritten after every change.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use log::{debug, info, warn};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkcs7::Pkcs7;
use openssl::pkey::{Id, PKey, Private};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage as EkuBuilder,
    KeyUsage, SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::{
    X509, X509Builder, X509Extension, X509Name, X509NameBuilder, X509NameRef,
    X509Ref, X509ReqBuilder,
};
use serde::{Deserialize, Serialize};
use crate::commons::file;
use super::{
    base64_decode, base64_encode, CertExtension, CertInfo, CryptoToken,
    EcCurve, ExtendedKeyUsage, GeneralName, IssuerName, KeySpec, KeyType,
    KeyUsageBit, SigningAlgorithm, TokenError, TrustFlags,
};

const STATE_FILE: &str = "token.json";


//------------ SoftToken -----------------------------------------------------

pub struct SoftToken {
    name: String,
    password: Option<String>,
    dir: Option<PathBuf>,
    state: Mutex<TokenState>,
}

#[derive(Default)]
struct TokenState {
    logged_in: bool,
    keys: BTreeMap<String, PKey<Private>>,
    certs: BTreeMap<String, StoredCert>,
    secrets: BTreeMap<String, Vec<u8>>,
}

#[derive(Clone)]
struct StoredCert {
    der: Vec<u8>,
    trust: TrustFlags,
}

impl SoftToken {
    /// Creates an in-memory token that needs no login.
    pub fn new(name: &str) -> Self {
        SoftToken {
            name: name.to_string(),
            password: None,
            dir: None,
            state: Mutex::new(TokenState {
                logged_in: true,
                ..Default::default()
            }),
        }
    }

    /// Requires a login with the given password before keys can be used.
    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        if let Ok(mut state) = self.state.lock() {
            state.logged_in = false;
        }
        self
    }

    /// Opens a token stored in the given directory, creating it if needed.
    pub fn open(name: &str, dir: &Path) -> Result<Self, TokenError> {
        file::create_dir(dir).map_err(|e| TokenError::Storage(e.to_string()))?;
        let path = dir.join(STATE_FILE);
        let mut state = TokenState {
            logged_in: true,
            ..Default::default()
        };
        if path.exists() {
            let stored: StoredState = file::load_json(&path)
                .map_err(|e| TokenError::Storage(e.to_string()))?;
            for (nickname, der) in stored.keys {
                let key = PKey::private_key_from_pkcs8(&base64_decode(&der)?)?;
                state.keys.insert(nickname, key);
            }
            for (nickname, cert) in stored.certs {
                state.certs.insert(nickname, StoredCert {
                    der: base64_decode(&cert.cert)?,
                    trust: cert.trust,
                });
            }
            for (nickname, secret) in stored.secrets {
                state.secrets.insert(nickname, base64_decode(&secret)?);
            }
            debug!(
                "Loaded token '{name}' with {} keys and {} certificates",
                state.keys.len(),
                state.certs.len()
            );
        }
        Ok(SoftToken {
            name: name.to_string(),
            password: None,
            dir: Some(dir.to_path_buf()),
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, TokenState>, TokenError> {
        self.state
            .lock()
            .map_err(|_| TokenError::Storage("token state poisoned".into()))
    }

    /// Locks the state for an operation needing a private key.
    fn lock_logged_in(&self) -> Result<MutexGuard<'_, TokenState>, TokenError> {
        let state = self.lock()?;
        if state.logged_in {
            Ok(state)
        } else {
            Err(TokenError::NotLoggedIn(self.name.clone()))
        }
    }

    fn persist(&self, state: &TokenState) -> Result<(), TokenError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let mut stored = StoredState::default();
        for (nickname, key) in &state.keys {
            stored
                .keys
                .insert(nickname.clone(), base64_encode(&key.private_key_to_pkcs8()?));
        }
        for (nickname, cert) in &state.certs {
            stored.certs.insert(nickname.clone(), StoredCertJson {
                cert: base64_encode(&cert.der),
                trust: cert.trust.clone(),
            });
        }
        for (nickname, secret) in &state.secrets {
            stored.secrets.insert(nickname.clone(), base64_encode(secret));
        }
        let json = serde_json::to_vec_pretty(&stored)
            .map_err(|e| TokenError::Storage(e.to_string()))?;
        file::save_atomic(&json, &dir.join(STATE_FILE))
            .map_err(|e| TokenError::Storage(e.to_string()))
    }

    fn key<'a>(
        state: &'a TokenState, nickname: &str
    ) -> Result<&'a PKey<Private>, TokenError> {
        state
            .keys
            .get(nickname)
            .ok_or_else(|| TokenError::KeyNotFound(nickname.to_string()))
    }
}

impl CryptoToken for SoftToken {
    fn name(&self) -> &str {
        &self.name
    }

    fn login(&self, password: &str) -> Result<(), TokenError> {
        let mut state = self.lock()?;
        match &self.password {
            Some(expected) if expected != password => {
                Err(TokenError::LoginFailed(self.name.clone()))
            }
            _ => {
                state.logged_in = true;
                Ok(())
            }
        }
    }

    fn generate_key_pair(
        &self, nickname: &str, spec: &KeySpec
    ) -> Result<Vec<u8>, TokenError> {
        let mut state = self.lock_logged_in()?;
        if state.keys.contains_key(nickname) {
            return Err(TokenError::KeyExists(nickname.to_string()));
        }
        let key = match spec {
            KeySpec::Rsa { bits } => PKey::from_rsa(Rsa::generate(*bits)?)?,
            KeySpec::Ec { curve } => {
                let nid = match curve {
                    EcCurve::P256 => Nid::X9_62_PRIME256V1,
                    EcCurve::P384 => Nid::SECP384R1,
                    EcCurve::P521 => Nid::SECP521R1,
                };
                let group = EcGroup::from_curve_name(nid)?;
                PKey::from_ec_key(EcKey::generate(&group)?)?
            }
        };
        let public = key.public_key_to_der()?;
        state.keys.insert(nickname.to_string(), key);
        self.persist(&state)?;
        debug!("Generated {:?} key for '{nickname}'", spec);
        Ok(public)
    }

    fn has_key(&self, nickname: &str) -> bool {
        self.lock()
            .map(|state| state.keys.contains_key(nickname))
            .unwrap_or(false)
    }

    fn public_key(&self, nickname: &str) -> Result<Vec<u8>, TokenError> {
        let state = self.lock()?;
        Ok(Self::key(&state, nickname)?.public_key_to_der()?)
    }

    fn key_type(&self, nickname: &str) -> Result<KeyType, TokenError> {
        let state = self.lock()?;
        match Self::key(&state, nickname)?.id() {
            Id::RSA => Ok(KeyType::Rsa),
            Id::EC => Ok(KeyType::Ec),
            other => Err(TokenError::invalid(format!(
                "unsupported key type {other:?} for '{nickname}'"
            ))),
        }
    }

    fn create_pkcs10(
        &self,
        nickname: &str,
        subject: &str,
        algorithm: SigningAlgorithm,
    ) -> Result<Vec<u8>, TokenError> {
        let state = self.lock_logged_in()?;
        let key = Self::key(&state, nickname)?;
        let mut builder = X509ReqBuilder::new()?;
        let name = dn_to_name(subject)?;
        builder.set_subject_name(&name)?;
        builder.set_pubkey(key)?;
        builder.sign(key, algorithm.digest())?;
        Ok(builder.build().to_der()?)
    }

    fn sign_certificate(
        &self,
        info: &CertInfo,
        signer: &str,
        algorithm: SigningAlgorithm,
        issuer_cert: Option<&[u8]>,
    ) -> Result<Vec<u8>, TokenError> {
        let state = self.lock_logged_in()?;
        let key = Self::key(&state, signer)?;
        let issuer = issuer_cert.map(X509::from_der).transpose()?;

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        let serial = BigNum::from_slice(&info.serial.to_be_bytes())?;
        let serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;
        let subject = dn_to_name(&info.subject)?;
        builder.set_subject_name(&subject)?;
        let issuer_name = match &info.issuer {
            IssuerName::Dn(dn) => dn_to_name(dn)?,
            IssuerName::Encoded(der) => X509Name::from_der(der)?,
        };
        builder.set_issuer_name(&issuer_name)?;
        let not_before = Asn1Time::from_unix(info.not_before)?;
        builder.set_not_before(&not_before)?;
        let not_after = Asn1Time::from_unix(info.not_after)?;
        builder.set_not_after(&not_after)?;
        let public_key = PKey::public_key_from_der(&info.public_key)?;
        builder.set_pubkey(&public_key)?;

        for ext in &info.extensions {
            let ext = build_extension(&builder, ext, issuer.as_deref())?;
            builder.append_extension(ext)?;
        }

        builder.sign(key, algorithm.digest())?;
        Ok(builder.build().to_der()?)
    }

    fn import_certificate(
        &self, nickname: &str, der: &[u8], trust: &TrustFlags
    ) -> Result<(), TokenError> {
        // Reject garbage before it ends up in the token.
        X509::from_der(der)?;
        let mut state = self.lock()?;
        state.certs.insert(nickname.to_string(), StoredCert {
            der: der.to_vec(),
            trust: trust.clone(),
        });
        self.persist(&state)?;
        debug!("Imported certificate '{nickname}' with trust {trust}");
        Ok(())
    }

    fn find_certificate(
        &self, nickname: &str
    ) -> Result<Option<Vec<u8>>, TokenError> {
        Ok(self.lock()?.certs.get(nickname).map(|c| c.der.clone()))
    }

    fn delete_certificate(&self, nickname: &str) -> Result<(), TokenError> {
        let mut state = self.lock()?;
        if state.certs.remove(nickname).is_none() {
            return Err(TokenError::CertNotFound(nickname.to_string()));
        }
        self.persist(&state)
    }

    fn set_trust(
        &self, nickname: &str, trust: &TrustFlags
    ) -> Result<(), TokenError> {
        let mut state = self.lock()?;
        match state.certs.get_mut(nickname) {
            Some(cert) => cert.trust = trust.clone(),
            None => return Err(TokenError::CertNotFound(nickname.to_string())),
        }
        self.persist(&state)
    }

    fn trust(&self, nickname: &str) -> Option<TrustFlags> {
        self.lock()
            .ok()
            .and_then(|state| state.certs.get(nickname).map(|c| c.trust.clone()))
    }

    fn certificate_nicknames(&self) -> Vec<String> {
        self.lock()
            .map(|state| state.certs.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn export_pkcs12(
        &self,
        nickname: &str,
        ca_nicknames: &[String],
        password: &str,
    ) -> Result<Vec<u8>, TokenError> {
        let state = self.lock_logged_in()?;
        let key = Self::key(&state, nickname)?;
        let cert = state
            .certs
            .get(nickname)
            .ok_or_else(|| TokenError::CertNotFound(nickname.to_string()))?;

        let mut chain = Stack::new()?;
        for ca in ca_nicknames {
            match state.certs.get(ca) {
                Some(stored) => chain.push(X509::from_der(&stored.der)?)?,
                None => warn!("CA certificate '{ca}' not in token, not exported"),
            }
        }

        let cert = X509::from_der(&cert.der)?;
        let pkcs12 = Pkcs12::builder()
            .name(nickname)
            .pkey(key)
            .cert(&cert)
            .ca(chain)
            .build2(password)?;
        Ok(pkcs12.to_der()?)
    }

    fn import_pkcs12(
        &self, data: &[u8], password: &str
    ) -> Result<Vec<String>, TokenError> {
        let parsed = Pkcs12::from_der(data)?
            .parse2(password)
            .map_err(|_| TokenError::invalid("cannot decrypt PKCS#12, wrong password?"))?;

        let mut state = self.lock_logged_in()?;
        let mut nicknames = Vec::new();
        if let Some(cert) = parsed.cert {
            let nickname = nickname_for(&cert)?;
            if let Some(key) = parsed.pkey {
                state.keys.insert(nickname.clone(), key);
            }
            state.certs.insert(nickname.clone(), StoredCert {
                der: cert.to_der()?,
                trust: TrustFlags::user(),
            });
            nicknames.push(nickname);
        }
        if let Some(ca) = parsed.ca {
            for cert in ca.iter() {
                let nickname = nickname_for(cert)?;
                state.certs.insert(nickname.clone(), StoredCert {
                    der: cert.to_der()?,
                    trust: TrustFlags::trusted_ca(),
                });
                nicknames.push(nickname);
            }
        }
        self.persist(&state)?;
        info!("Imported {} certificates from PKCS#12", nicknames.len());
        Ok(nicknames)
    }

    fn store_shared_secret(
        &self, nickname: &str, secret: &[u8]
    ) -> Result<(), TokenError> {
        let mut state = self.lock_logged_in()?;
        state.secrets.insert(nickname.to_string(), secret.to_vec());
        self.persist(&state)
    }
}


//------------ Persistence ---------------------------------------------------

#[derive(Default, Deserialize, Serialize)]
struct StoredState {
    keys: BTreeMap<String, String>,
    certs: BTreeMap<String, StoredCertJson>,
    #[serde(default)]
    secrets: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize)]
struct StoredCertJson {
    cert: String,
    trust: TrustFlags,
}


//------------ Names and Extensions ------------------------------------------

/// Encodes a DN string such as `CN=Foo,O=Example`.
///
/// The string lists the most specific RDN first, the encoding the other
/// way around.
pub fn dn_to_name(dn: &str) -> Result<X509Name, TokenError> {
    let mut builder = X509NameBuilder::new()?;
    let rdns = split_dn(dn);
    if rdns.is_empty() {
        return Err(TokenError::invalid("empty distinguished name"));
    }
    for rdn in rdns.iter().rev() {
        let (attr, value) = rdn
            .split_once('=')
            .ok_or_else(|| TokenError::invalid(format!("bad RDN '{rdn}' in '{dn}'")))?;
        builder.append_entry_by_text(attr.trim(), value.trim())?;
    }
    Ok(builder.build())
}

/// Renders an encoded name as a DN string, most specific RDN first.
pub fn name_to_dn(name: &X509NameRef) -> Result<String, TokenError> {
    let mut rdns = Vec::new();
    for entry in name.entries() {
        let attr = entry.object().nid().short_name()?;
        let value = entry.data().as_utf8()?;
        rdns.push(format!("{attr}={}", escape_rdn_value(&value)));
    }
    rdns.reverse();
    Ok(rdns.join(","))
}

fn escape_rdn_value(value: &str) -> String {
    let mut res = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';') {
            res.push('\\');
        }
        res.push(c);
    }
    res
}

/// Splits a DN at unescaped commas, removing the escapes.
fn split_dn(dn: &str) -> Vec<String> {
    let mut res = Vec::new();
    let mut current = String::new();
    let mut chars = dn.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ',' => {
                res.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        res.push(current.trim().to_string());
    }
    res.retain(|rdn| !rdn.is_empty());
    res
}

/// Picks the nickname for a certificate taken from a PKCS#12 bundle.
///
/// This is the friendly name if there is one or the common name.
fn nickname_for(cert: &X509Ref) -> Result<String, TokenError> {
    if let Some(alias) = cert.alias() {
        return Ok(String::from_utf8_lossy(alias).into_owned());
    }
    match cert.subject_name().entries_by_nid(Nid::COMMONNAME).next() {
        Some(cn) => Ok(cn.data().as_utf8()?.to_string()),
        None => name_to_dn(cert.subject_name()),
    }
}

fn build_extension(
    builder: &X509Builder,
    ext: &CertExtension,
    issuer: Option<&X509Ref>,
) -> Result<X509Extension, TokenError> {
    let res = match ext {
        CertExtension::BasicConstraints { ca, path_len, critical } => {
            let mut bc = BasicConstraints::new();
            if *critical {
                bc.critical();
            }
            if *ca {
                bc.ca();
            }
            if let Some(len) = path_len {
                bc.pathlen(*len);
            }
            bc.build()?
        }
        CertExtension::KeyUsage { usages, critical } => {
            let mut ku = KeyUsage::new();
            if *critical {
                ku.critical();
            }
            for usage in usages {
                match usage {
                    KeyUsageBit::DigitalSignature => ku.digital_signature(),
                    KeyUsageBit::NonRepudiation => ku.non_repudiation(),
                    KeyUsageBit::KeyEncipherment => ku.key_encipherment(),
                    KeyUsageBit::DataEncipherment => ku.data_encipherment(),
                    KeyUsageBit::KeyAgreement => ku.key_agreement(),
                    KeyUsageBit::KeyCertSign => ku.key_cert_sign(),
                    KeyUsageBit::CrlSign => ku.crl_sign(),
                };
            }
            ku.build()?
        }
        CertExtension::ExtendedKeyUsage(usages) => {
            let mut eku = EkuBuilder::new();
            for usage in usages {
                match usage {
                    ExtendedKeyUsage::ServerAuth => eku.server_auth(),
                    ExtendedKeyUsage::ClientAuth => eku.client_auth(),
                    ExtendedKeyUsage::EmailProtection => eku.email_protection(),
                    ExtendedKeyUsage::CodeSigning => eku.code_signing(),
                    ExtendedKeyUsage::OcspSigning => eku.other("OCSPSigning"),
                };
            }
            eku.build()?
        }
        CertExtension::SubjectAltName(names) => {
            let mut san = SubjectAlternativeName::new();
            for name in names {
                match name {
                    GeneralName::Dns(v) => san.dns(v),
                    GeneralName::Ip(v) => san.ip(v),
                    GeneralName::Email(v) => san.email(v),
                    GeneralName::Uri(v) => san.uri(v),
                };
            }
            let ctx = builder.x509v3_context(issuer, None);
            san.build(&ctx)?
        }
        CertExtension::SubjectKeyIdentifier => {
            let ctx = builder.x509v3_context(issuer, None);
            SubjectKeyIdentifier::new().build(&ctx)?
        }
        CertExtension::AuthorityKeyIdentifier => {
            let ctx = builder.x509v3_context(issuer, None);
            AuthorityKeyIdentifier::new().keyid(false).build(&ctx)?
        }
        CertExtension::AuthorityInfoAccess { ocsp_uri } => {
            let ctx = builder.x509v3_context(issuer, None);
            #[allow(deprecated)]
            let aia = X509Extension::new_nid(
                None,
                Some(&ctx),
                Nid::INFO_ACCESS,
                &format!("OCSP;URI:{ocsp_uri}"),
            )?;
            aia
        }
    };
    Ok(res)
}


//------------ Chains --------------------------------------------------------

/// Parses a certificate chain into DER encoded certificates.
///
/// Accepts PKCS#7 in DER, PEM or plain base64 as well as one or more PEM
/// certificates or a single DER certificate.
pub fn parse_chain(data: &[u8]) -> Result<Vec<Vec<u8>>, TokenError> {
    let text = std::str::from_utf8(data).ok().map(str::trim);

    if let Some(text) = text {
        if text.contains("-----BEGIN PKCS7-----") {
            return pkcs7_certs(&Pkcs7::from_pem(text.as_bytes())?);
        }
        if text.contains("-----BEGIN CERTIFICATE-----") {
            return X509::stack_from_pem(text.as_bytes())?
                .iter()
                .map(|c| c.to_der().map_err(TokenError::from))
                .collect();
        }
        if !text.is_empty() {
            if let Ok(der) = base64_decode(text) {
                return parse_der_chain(&der);
            }
        }
    }
    parse_der_chain(data)
}

fn parse_der_chain(der: &[u8]) -> Result<Vec<Vec<u8>>, TokenError> {
    if let Ok(p7) = Pkcs7::from_der(der) {
        return pkcs7_certs(&p7);
    }
    let cert = X509::from_der(der)
        .map_err(|_| TokenError::invalid("not a certificate or PKCS#7 chain"))?;
    Ok(vec![cert.to_der()?])
}

fn pkcs7_certs(p7: &Pkcs7) -> Result<Vec<Vec<u8>>, TokenError> {
    let certs = p7
        .signed()
        .and_then(|signed| signed.certificates())
        .ok_or_else(|| TokenError::invalid("PKCS#7 without certificates"))?;
    certs
        .iter()
        .map(|c| c.to_der().map_err(TokenError::from))
        .collect()
}

/// Returns the subject of a DER encoded certificate as a DN string.
pub fn subject_dn(der: &[u8]) -> Result<String, TokenError> {
    name_to_dn(X509::from_der(der)?.subject_name())
}

/// Returns the DER encoding of the subject name of a certificate.
pub fn subject_name_der(der: &[u8]) -> Result<Vec<u8>, TokenError> {
    Ok(X509::from_der(der)?.subject_name().to_der()?)
}

/// Returns the DER encoding of the issuer name of a certificate.
pub fn issuer_name_der(der: &[u8]) -> Result<Vec<u8>, TokenError> {
    Ok(X509::from_der(der)?.issuer_name().to_der()?)
}

/// Returns the public key of a certificate.
pub fn cert_public_key(der: &[u8]) -> Result<Vec<u8>, TokenError> {
    Ok(X509::from_der(der)?.public_key()?.public_key_to_der()?)
}

/// Returns the public key of a DER encoded PKCS#10 request.
pub fn pkcs10_public_key(der: &[u8]) -> Result<Vec<u8>, TokenError> {
    let req = openssl::x509::X509Req::from_der(der)?;
    Ok(req.public_key()?.public_key_to_der()?)
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn p256() -> KeySpec {
        KeySpec::Ec { curve: EcCurve::P256 }
    }

    fn self_signed(token: &SoftToken, nickname: &str, subject: &str) -> Vec<u8> {
        let public_key = token.generate_key_pair(nickname, &p256()).unwrap();
        let info = CertInfo {
            serial: 1,
            subject: subject.into(),
            issuer: IssuerName::Dn(subject.into()),
            not_before: 1_700_000_000,
            not_after: 1_900_000_000,
            public_key,
            extensions: vec![
                CertExtension::BasicConstraints {
                    ca: true, path_len: None, critical: true
                },
                CertExtension::SubjectKeyIdentifier,
                CertExtension::AuthorityKeyIdentifier,
            ],
        };
        token.sign_certificate(
            &info, nickname, SigningAlgorithm::Sha256WithEc, None
        ).unwrap()
    }

    #[test]
    fn dn_round_trip() {
        let name = dn_to_name("CN=CA Signing Certificate,OU=pki-tomcat,O=EXAMPLE").unwrap();
        assert_eq!(
            name_to_dn(&name).unwrap(),
            "CN=CA Signing Certificate,OU=pki-tomcat,O=EXAMPLE"
        );
        let escaped = dn_to_name("CN=Example\\, Inc,O=X").unwrap();
        assert_eq!(name_to_dn(&escaped).unwrap(), "CN=Example\\, Inc,O=X");
    }

    #[test]
    fn sign_and_issue_chain() {
        let token = SoftToken::new("internal");
        let ca = self_signed(&token, "caSigningCert", "CN=CA Signing,O=EXAMPLE");

        let leaf_key = token.generate_key_pair("Server-Cert", &p256()).unwrap();
        let info = CertInfo {
            serial: 2,
            subject: "CN=pki.example.com,O=EXAMPLE".into(),
            issuer: IssuerName::Encoded(subject_name_der(&ca).unwrap()),
            not_before: 1_700_000_000,
            not_after: 1_800_000_000,
            public_key: leaf_key,
            extensions: vec![
                CertExtension::SubjectAltName(vec![
                    GeneralName::Dns("pki.example.com".into())
                ]),
                CertExtension::AuthorityKeyIdentifier,
            ],
        };
        let leaf = token.sign_certificate(
            &info, "caSigningCert", SigningAlgorithm::Sha256WithEc, Some(&ca)
        ).unwrap();

        assert_eq!(
            issuer_name_der(&leaf).unwrap(),
            subject_name_der(&ca).unwrap()
        );
        let ca_key = X509::from_der(&ca).unwrap().public_key().unwrap();
        assert!(X509::from_der(&leaf).unwrap().verify(&ca_key).unwrap());
    }

    #[test]
    fn pkcs12_round_trip_keeps_nickname() {
        let token = SoftToken::new("internal");
        let ca = self_signed(&token, "caSigningCert", "CN=CA Signing,O=EXAMPLE");
        token.import_certificate("caSigningCert", &ca, &TrustFlags::ca_signing()).unwrap();

        let p12 = token.export_pkcs12("caSigningCert", &[], "secret").unwrap();

        let other = SoftToken::new("internal");
        let nicknames = other.import_pkcs12(&p12, "secret").unwrap();
        assert_eq!(nicknames, vec!["caSigningCert".to_string()]);
        assert!(other.has_key("caSigningCert"));
        assert!(other.import_pkcs12(&p12, "wrong").is_err());
    }

    #[test]
    fn parse_chain_formats() {
        let token = SoftToken::new("internal");
        let ca = self_signed(&token, "ca", "CN=Root,O=EXAMPLE");
        let pem = X509::from_der(&ca).unwrap().to_pem().unwrap();

        assert_eq!(parse_chain(&pem).unwrap(), vec![ca.clone()]);
        assert_eq!(parse_chain(&ca).unwrap(), vec![ca.clone()]);
        assert_eq!(
            parse_chain(base64_encode(&ca).as_bytes()).unwrap(),
            vec![ca]
        );
    }

    #[test]
    fn login_required_with_password() {
        let token = SoftToken::new("hsm").with_password("pin");
        assert!(matches!(
            token.generate_key_pair("k", &p256()),
            Err(TokenError::NotLoggedIn(_))
        ));
        assert!(token.login("wrong").is_err());
        token.login("pin").unwrap();
        assert!(token.generate_key_pair("k", &p256()).is_ok());
    }

    #[test]
    fn persists_to_directory() {
        let dir = tempfile::tempdir().unwrap();
        let token = SoftToken::open("internal", dir.path()).unwrap();
        let ca = self_signed(&token, "ca", "CN=Root,O=EXAMPLE");
        token.import_certificate("ca", &ca, &TrustFlags::trusted_ca()).unwrap();
        drop(token);

        let reopened = SoftToken::open("internal", dir.path()).unwrap();
        assert!(reopened.has_key("ca"));
        assert_eq!(reopened.find_certificate("ca").unwrap(), Some(ca));
        assert_eq!(reopened.trust("ca"), Some(TrustFlags::trusted_ca()));
    }
}
