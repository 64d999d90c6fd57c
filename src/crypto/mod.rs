//! The crypto token holding the keys and certificates of an instance.
//!
//! Everything the installer needs from a token is expressed by the
//! [`CryptoToken`] trait. [`SoftToken`] implements it with OpenSSL.

pub mod algorithm;
pub mod softtoken;

use std::fmt;
use std::str::FromStr;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use openssl::error::ErrorStack;
use serde::{Deserialize, Serialize};

pub use self::algorithm::SigningAlgorithm;
pub use self::softtoken::SoftToken;


//------------ CryptoToken ---------------------------------------------------

/// Keys are addressed by the nickname of the certificate they belong to.
pub trait CryptoToken: Send + Sync {
    fn name(&self) -> &str;

    fn login(&self, password: &str) -> Result<(), TokenError>;

    /// Generates a key pair and returns the DER encoded public key.
    fn generate_key_pair(
        &self, nickname: &str, spec: &KeySpec
    ) -> Result<Vec<u8>, TokenError>;

    fn has_key(&self, nickname: &str) -> bool;

    /// Returns the DER encoded public key for the key with this nickname.
    fn public_key(&self, nickname: &str) -> Result<Vec<u8>, TokenError>;

    fn key_type(&self, nickname: &str) -> Result<KeyType, TokenError>;

    /// Creates a DER encoded PKCS#10 request signed with the key.
    fn create_pkcs10(
        &self,
        nickname: &str,
        subject: &str,
        algorithm: SigningAlgorithm,
    ) -> Result<Vec<u8>, TokenError>;

    /// Signs a certificate with the key of `signer`.
    ///
    /// The issuer certificate is needed for the authority key identifier.
    /// Without one the certificate is treated as self-signed.
    fn sign_certificate(
        &self,
        info: &CertInfo,
        signer: &str,
        algorithm: SigningAlgorithm,
        issuer_cert: Option<&[u8]>,
    ) -> Result<Vec<u8>, TokenError>;

    fn import_certificate(
        &self, nickname: &str, der: &[u8], trust: &TrustFlags
    ) -> Result<(), TokenError>;

    fn find_certificate(
        &self, nickname: &str
    ) -> Result<Option<Vec<u8>>, TokenError>;

    fn delete_certificate(&self, nickname: &str) -> Result<(), TokenError>;

    fn set_trust(
        &self, nickname: &str, trust: &TrustFlags
    ) -> Result<(), TokenError>;

    fn trust(&self, nickname: &str) -> Option<TrustFlags>;

    fn certificate_nicknames(&self) -> Vec<String>;

    /// Exports key, certificate and the given CA certificates.
    fn export_pkcs12(
        &self,
        nickname: &str,
        ca_nicknames: &[String],
        password: &str,
    ) -> Result<Vec<u8>, TokenError>;

    /// Imports a PKCS#12 bundle and returns the nicknames it held.
    fn import_pkcs12(
        &self, data: &[u8], password: &str
    ) -> Result<Vec<String>, TokenError>;

    fn store_shared_secret(
        &self, nickname: &str, secret: &[u8]
    ) -> Result<(), TokenError>;
}


//------------ KeyType -------------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Rsa,
    Ec,
}

impl FromStr for KeyType {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rsa" => Ok(KeyType::Rsa),
            "ec" | "ecc" => Ok(KeyType::Ec),
            _ => Err(TokenError::invalid(format!("unknown key type '{s}'"))),
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyType::Rsa => f.write_str("rsa"),
            KeyType::Ec => f.write_str("ecc"),
        }
    }
}


//------------ KeySpec -------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum KeySpec {
    Rsa { bits: u32 },
    Ec { curve: EcCurve },
}

impl KeySpec {
    /// Creates a spec from the configured key type and size.
    ///
    /// For RSA the size is the number of bits, for EC the curve name.
    pub fn parse(key_type: &str, size: &str) -> Result<Self, TokenError> {
        match KeyType::from_str(key_type)? {
            KeyType::Rsa => {
                let bits = u32::from_str(size.trim()).map_err(|_| {
                    TokenError::invalid(format!("bad RSA key size '{size}'"))
                })?;
                if !(2048..=8192).contains(&bits) {
                    return Err(TokenError::invalid(format!(
                        "RSA key size {bits} is out of range"
                    )));
                }
                Ok(KeySpec::Rsa { bits })
            }
            KeyType::Ec => Ok(KeySpec::Ec {
                curve: EcCurve::from_str(size)?,
            }),
        }
    }

    pub fn key_type(&self) -> KeyType {
        match self {
            KeySpec::Rsa { .. } => KeyType::Rsa,
            KeySpec::Ec { .. } => KeyType::Ec,
        }
    }
}


//------------ EcCurve -------------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum EcCurve {
    P256,
    P384,
    P521,
}

impl FromStr for EcCurve {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nistp256" | "p-256" | "secp256r1" | "prime256v1" => Ok(EcCurve::P256),
            "nistp384" | "p-384" | "secp384r1" => Ok(EcCurve::P384),
            "nistp521" | "p-521" | "secp521r1" => Ok(EcCurve::P521),
            _ => Err(TokenError::invalid(format!("unsupported curve '{s}'"))),
        }
    }
}


//------------ CertInfo ------------------------------------------------------

/// Everything needed to sign a certificate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CertInfo {
    pub serial: u64,
    pub subject: String,
    pub issuer: IssuerName,

    /// Validity as seconds since the epoch.
    pub not_before: i64,
    pub not_after: i64,

    /// DER encoded subject public key info.
    pub public_key: Vec<u8>,
    pub extensions: Vec<CertExtension>,
}

/// The issuer name to put into a certificate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum IssuerName {
    /// Encode from a string representation.
    Dn(String),

    /// Use exactly this DER encoded name, typically taken from the subject
    /// of the issuing certificate so both encode identically.
    Encoded(Vec<u8>),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CertExtension {
    BasicConstraints {
        ca: bool,
        path_len: Option<u32>,
        critical: bool,
    },
    KeyUsage {
        usages: Vec<KeyUsageBit>,
        critical: bool,
    },
    ExtendedKeyUsage(Vec<ExtendedKeyUsage>),
    SubjectAltName(Vec<GeneralName>),
    SubjectKeyIdentifier,
    AuthorityKeyIdentifier,
    AuthorityInfoAccess { ocsp_uri: String },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyUsageBit {
    DigitalSignature,
    NonRepudiation,
    KeyEncipherment,
    DataEncipherment,
    KeyAgreement,
    KeyCertSign,
    CrlSign,
}

impl FromStr for KeyUsageBit {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "digitalSignature" => Ok(KeyUsageBit::DigitalSignature),
            "nonRepudiation" => Ok(KeyUsageBit::NonRepudiation),
            "keyEncipherment" => Ok(KeyUsageBit::KeyEncipherment),
            "dataEncipherment" => Ok(KeyUsageBit::DataEncipherment),
            "keyAgreement" => Ok(KeyUsageBit::KeyAgreement),
            "keyCertSign" => Ok(KeyUsageBit::KeyCertSign),
            "crlSign" => Ok(KeyUsageBit::CrlSign),
            other => Err(TokenError::invalid(format!("unknown key usage '{other}'"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExtendedKeyUsage {
    ServerAuth,
    ClientAuth,
    EmailProtection,
    OcspSigning,
    CodeSigning,
}

impl FromStr for ExtendedKeyUsage {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "serverAuth" | "1.3.6.1.5.5.7.3.1" => Ok(ExtendedKeyUsage::ServerAuth),
            "clientAuth" | "1.3.6.1.5.5.7.3.2" => Ok(ExtendedKeyUsage::ClientAuth),
            "codeSigning" | "1.3.6.1.5.5.7.3.3" => Ok(ExtendedKeyUsage::CodeSigning),
            "emailProtection" | "1.3.6.1.5.5.7.3.4" => {
                Ok(ExtendedKeyUsage::EmailProtection)
            }
            "OCSPSigning" | "1.3.6.1.5.5.7.3.9" => Ok(ExtendedKeyUsage::OcspSigning),
            other => Err(TokenError::invalid(format!(
                "unknown extended key usage '{other}'"
            ))),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GeneralName {
    Dns(String),
    Ip(String),
    Email(String),
    Uri(String),
}

impl GeneralName {
    /// Parses `type:value`, treating a bare value as a DNS name.
    pub fn parse(s: &str) -> Result<Self, TokenError> {
        let s = s.trim();
        match s.split_once(':') {
            Some(("DNS" | "dns", v)) => Ok(GeneralName::Dns(v.to_string())),
            Some(("IP" | "ip", v)) => Ok(GeneralName::Ip(v.to_string())),
            Some(("email" | "RFC822", v)) => Ok(GeneralName::Email(v.to_string())),
            Some(("URI" | "uri", v)) => Ok(GeneralName::Uri(v.to_string())),
            Some(_) if s.contains("://") => Ok(GeneralName::Uri(s.to_string())),
            Some((kind, _)) => Err(TokenError::invalid(format!(
                "unknown subject alt name type '{kind}'"
            ))),
            None if s.is_empty() => {
                Err(TokenError::invalid("empty subject alt name"))
            }
            None => Ok(GeneralName::Dns(s.to_string())),
        }
    }
}


//------------ TrustFlags ----------------------------------------------------

/// Trust flags of a certificate for SSL, email and object signing.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TrustFlags(String);

impl TrustFlags {
    pub const CA_SIGNING: &'static str = "CTu,Cu,Cu";
    pub const AUDIT_SIGNING: &'static str = "u,u,Pu";
    pub const USER: &'static str = "u,u,u";
    pub const TRUSTED_CA: &'static str = "CT,C,C";
    pub const NONE: &'static str = ",,";

    pub fn new(s: &str) -> Result<Self, TokenError> {
        let parts: Vec<&str> = s.split(',').collect();
        let valid = parts.len() == 3
            && parts.iter().all(|p| p.chars().all(|c| "pPcCTuw".contains(c)));
        if valid {
            Ok(TrustFlags(s.to_string()))
        } else {
            Err(TokenError::invalid(format!("bad trust flags '{s}'")))
        }
    }

    pub fn ca_signing() -> Self {
        TrustFlags(Self::CA_SIGNING.into())
    }

    pub fn audit_signing() -> Self {
        TrustFlags(Self::AUDIT_SIGNING.into())
    }

    pub fn user() -> Self {
        TrustFlags(Self::USER.into())
    }

    pub fn trusted_ca() -> Self {
        TrustFlags(Self::TRUSTED_CA.into())
    }

    pub fn none() -> Self {
        TrustFlags(Self::NONE.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrustFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}


//------------ Encoding helpers ----------------------------------------------

pub fn base64_encode(der: &[u8]) -> String {
    BASE64.encode(der)
}

/// Decodes base64, tolerating PEM armour and line breaks.
pub fn base64_decode(s: &str) -> Result<Vec<u8>, TokenError> {
    let cleaned: String = s
        .lines()
        .filter(|l| !l.starts_with("-----"))
        .flat_map(|l| l.chars())
        .filter(|c| !c.is_whitespace())
        .collect();
    BASE64
        .decode(cleaned.as_bytes())
        .map_err(|e| TokenError::invalid(format!("bad base64: {e}")))
}


//------------ TokenError ----------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TokenError {
    Openssl(String),
    KeyNotFound(String),
    KeyExists(String),
    CertNotFound(String),
    LoginFailed(String),
    NotLoggedIn(String),
    InvalidInput(String),
    Storage(String),
}

impl TokenError {
    pub fn invalid(msg: impl fmt::Display) -> Self {
        TokenError::InvalidInput(msg.to_string())
    }
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TokenError::Openssl(e) => write!(f, "OpenSSL error: {e}"),
            TokenError::KeyNotFound(n) => write!(f, "no key for '{n}'"),
            TokenError::KeyExists(n) => write!(f, "key '{n}' already exists"),
            TokenError::CertNotFound(n) => write!(f, "no certificate '{n}'"),
            TokenError::LoginFailed(t) => write!(f, "login to token '{t}' failed"),
            TokenError::NotLoggedIn(t) => write!(f, "not logged in to token '{t}'"),
            TokenError::InvalidInput(e) => e.fmt(f),
            TokenError::Storage(e) => write!(f, "token storage: {e}"),
        }
    }
}

impl std::error::Error for TokenError {}

impl From<ErrorStack> for TokenError {
    fn from(e: ErrorStack) -> Self {
        TokenError::Openssl(e.to_string())
    }
}


//------------ Tests ---------------------------------------------------------
