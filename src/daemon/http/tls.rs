//! The certificate and key the daemon presents over HTTPS.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{error, fmt, io};
use openssl::pkey::PKey;
use openssl::x509::X509;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::KeyLogFile;
use crate::config::Config;

pub use tokio_rustls::rustls::ServerConfig;


//------------ TlsFiles ------------------------------------------------------

/// The PEM files holding the server certificate of the instance.
///
/// The certificate file starts with the server certificate, optionally
/// followed by the chain up to the issuing CA. The key file holds exactly
/// one private key in PKCS#1, PKCS#8 or SEC1 form.
#[derive(Clone, Debug)]
pub struct TlsFiles {
    key: PathBuf,
    cert: PathBuf,
}

impl TlsFiles {
    pub fn new(key: impl Into<PathBuf>, cert: impl Into<PathBuf>) -> Self {
        TlsFiles { key: key.into(), cert: cert.into() }
    }

    /// Returns the files named in the configuration, if both are set.
    pub fn from_config(config: &Config) -> Option<Self> {
        match (&config.tls_key_file, &config.tls_cert_file) {
            (Some(key), Some(cert)) => Some(Self::new(key, cert)),
            _ => None,
        }
    }

    /// Builds the rustls configuration after checking that the key
    /// belongs to the server certificate.
    pub fn server_config(&self) -> Result<ServerConfig, TlsError> {
        let chain = self.read_chain()?;
        let key = self.read_key()?;
        self.check_key_matches(&chain[0], &key)?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|err| TlsError::Rustls(err.to_string()))?;

        if std::env::var_os("SSLKEYLOGFILE").is_some() {
            config.key_log = Arc::new(KeyLogFile::new());
        }
        Ok(config)
    }

    fn read_chain(&self) -> Result<Vec<CertificateDer<'static>>, TlsError> {
        let cert_err = |msg: String| TlsError::Cert(self.cert.clone(), msg);

        let mut reader = open(&self.cert).map_err(|e| cert_err(e.to_string()))?;
        let chain = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| cert_err(e.to_string()))?;
        if chain.is_empty() {
            return Err(cert_err("file does not contain any certificates".into()))
        }
        Ok(chain)
    }

    fn read_key(&self) -> Result<PrivateKeyDer<'static>, TlsError> {
        use rustls_pemfile::Item;

        let key_err = |msg: &str| TlsError::Key(self.key.clone(), msg.into());

        let mut reader = open(&self.key).map_err(|e| key_err(&e.to_string()))?;
        let mut found: Option<PrivateKeyDer<'static>> = None;
        for item in rustls_pemfile::read_all(&mut reader) {
            let key = match item.map_err(|e| key_err(&e.to_string()))? {
                Item::Pkcs1Key(der) => der.into(),
                Item::Pkcs8Key(der) => der.into(),
                Item::Sec1Key(der) => der.into(),
                _ => continue,
            };
            if found.replace(key).is_some() {
                return Err(key_err("file contains multiple keys"))
            }
        }
        found.ok_or_else(|| key_err("file does not contain any usable keys"))
    }

    /// An instance that was reconfigured may still have the key of its
    /// previous server certificate lying around.
    fn check_key_matches(
        &self,
        cert: &CertificateDer,
        key: &PrivateKeyDer,
    ) -> Result<(), TlsError> {
        let cert_key = X509::from_der(cert.as_ref())
            .and_then(|cert| cert.public_key())
            .map_err(|e| TlsError::Cert(self.cert.clone(), e.to_string()))?;
        let key = PKey::private_key_from_der(key.secret_der())
            .map_err(|e| TlsError::Key(self.key.clone(), e.to_string()))?;
        if cert_key.public_eq(&key) {
            Ok(())
        }
        else {
            Err(TlsError::KeyMismatch(self.key.clone(), self.cert.clone()))
        }
    }
}

fn open(path: &Path) -> Result<io::BufReader<File>, io::Error> {
    File::open(path).map(io::BufReader::new)
}


//------------ TlsError ------------------------------------------------------

#[derive(Debug)]
pub enum TlsError {
    Key(PathBuf, String),
    Cert(PathBuf, String),
    KeyMismatch(PathBuf, PathBuf),
    Rustls(String),
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsError::Key(path, msg) => {
                write!(f, "Error in TLS key file {}: {}", path.display(), msg)
            }
            TlsError::Cert(path, msg) => write!(
                f, "Error in TLS certificate file {}: {}", path.display(), msg
            ),
            TlsError::KeyMismatch(key, cert) => write!(
                f,
                "The key in {} does not belong to the certificate in {}",
                key.display(), cert.display()
            ),
            TlsError::Rustls(msg) => {
                write!(f, "Error in TLS configuration: {msg}")
            }
        }
    }
}

impl error::Error for TlsError {}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::asn1::Asn1Time;
    use openssl::ec::{EcGroup, EcKey};
    use openssl::hash::MessageDigest;
    use openssl::nid::Nid;
    use openssl::pkey::Private;
    use openssl::x509::{X509Builder, X509NameBuilder};

    fn ec_key() -> PKey<Private> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
    }

    fn server_cert(key: &PKey<Private>) -> X509 {
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "pki1.example.com").unwrap();
        let name = name.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(key).unwrap();
        builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
        builder.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
        builder.sign(key, MessageDigest::sha256()).unwrap();
        builder.build()
    }

    fn write_files(dir: &Path, key: &PKey<Private>, cert: &X509) -> TlsFiles {
        let files = TlsFiles::new(dir.join("key.pem"), dir.join("cert.pem"));
        std::fs::write(&files.key, key.private_key_to_pem_pkcs8().unwrap()).unwrap();
        std::fs::write(&files.cert, cert.to_pem().unwrap()).unwrap();
        files
    }

    #[test]
    fn server_config_from_pem_files() {
        let dir = tempfile::tempdir().unwrap();
        let key = ec_key();
        let files = write_files(dir.path(), &key, &server_cert(&key));
        assert!(files.server_config().is_ok());
    }

    #[test]
    fn key_file_without_key() {
        let dir = tempfile::tempdir().unwrap();
        let key = ec_key();
        let files = write_files(dir.path(), &key, &server_cert(&key));
        let files = TlsFiles::new(&files.cert, &files.cert);
        let err = files.server_config().unwrap_err();
        assert!(err.to_string().contains("does not contain any usable keys"));
    }

    #[test]
    fn missing_cert_file() {
        let dir = tempfile::tempdir().unwrap();
        let key = ec_key();
        let files = write_files(dir.path(), &key, &server_cert(&key));
        let files = TlsFiles::new(&files.key, dir.path().join("missing.pem"));
        let err = files.server_config().unwrap_err();
        assert!(err.to_string().starts_with("Error in TLS certificate file"));
    }

    #[test]
    fn key_of_previous_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let old = ec_key();
        let files = write_files(dir.path(), &old, &server_cert(&ec_key()));
        assert!(matches!(
            files.server_config(),
            Err(TlsError::KeyMismatch(_, _))
        ));
    }
}
