//! Moving keys and certificates in and out of the token.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use log::{debug, info, warn};
use crate::commons::error::Error;
use crate::commons::{file, SetupResult};
use crate::crypto::{softtoken, CryptoToken, SoftToken, TrustFlags};


//------------ CertImportExport ----------------------------------------------

#[derive(Clone)]
pub struct CertImportExport {
    token: Arc<dyn CryptoToken>,
}

impl CertImportExport {
    pub fn new(token: Arc<dyn CryptoToken>) -> Self {
        CertImportExport { token }
    }

    /// Restores keys and certificates from a PKCS#12 bundle.
    ///
    /// Certificates in the token with the same nicknames as those in the
    /// bundle are removed first. Returns the nicknames of the bundle.
    pub fn import_pkcs12(
        &self, data: &[u8], password: &str
    ) -> SetupResult<Vec<String>> {
        // Unpack into a scratch token to learn the nicknames.
        let scratch = SoftToken::new("scratch");
        let nicknames = scratch.import_pkcs12(data, password)?;

        for nickname in &nicknames {
            if let Ok(Some(_)) = self.token.find_certificate(nickname) {
                match self.token.delete_certificate(nickname) {
                    Ok(()) => debug!("Removed existing certificate '{nickname}'"),
                    Err(err) => warn!(
                        "Cannot remove existing certificate '{nickname}': {err}"
                    ),
                }
            }
        }

        let imported = self.token.import_pkcs12(data, password)?;
        info!(
            "Restored {} from PKCS#12 into token {}",
            imported.join(", "),
            self.token.name()
        );
        Ok(imported)
    }

    /// Installs a chain of CA certificates.
    ///
    /// Accepts PKCS#7 in DER or base64, or a PEM bundle.
    pub fn import_chain(&self, data: &[u8]) -> SetupResult<Vec<String>> {
        let certs = softtoken::parse_chain(data)?;
        if certs.is_empty() {
            return Err(Error::validation("certificate chain is empty"));
        }
        self.import_ca_certs(&certs)
    }

    /// Installs DER encoded CA certificates as trusted.
    pub fn import_ca_certs(&self, certs: &[Vec<u8>]) -> SetupResult<Vec<String>> {
        let mut nicknames = Vec::with_capacity(certs.len());
        for der in certs {
            let nickname = softtoken::subject_dn(der)?;
            match self.token.find_certificate(&nickname)? {
                Some(existing) if existing == *der => {
                    debug!("CA certificate '{nickname}' already present");
                }
                _ => {
                    self.token.import_certificate(
                        &nickname, der, &TrustFlags::trusted_ca()
                    )?;
                    info!("Imported CA certificate '{nickname}'");
                }
            }
            nicknames.push(nickname);
        }
        Ok(nicknames)
    }

    /// Writes a PKCS#12 backup of each system key into `dir`.
    ///
    /// Each bundle holds the key, its certificate and all trusted CA
    /// certificates of the token.
    pub fn export_system_keys(
        &self,
        nicknames: &[String],
        password: &str,
        dir: &Path,
    ) -> SetupResult<Vec<PathBuf>> {
        if password.is_empty() {
            return Err(Error::validation("a backup password is required"));
        }
        let trusted_ca = TrustFlags::trusted_ca();
        let ca_nicknames = self
            .token
            .certificate_nicknames()
            .into_iter()
            .filter(|n| self.token.trust(n).as_ref() == Some(&trusted_ca))
            .collect::<Vec<_>>();

        let mut written = Vec::with_capacity(nicknames.len());
        for nickname in nicknames {
            let data = self.token.export_pkcs12(nickname, &ca_nicknames, password)?;
            let path = dir.join(format!("{}.p12", file_name(nickname)));
            file::save(&data, &path)?;
            info!("Backed up key '{nickname}' to {}", path.display());
            written.push(path);
        }
        Ok(written)
    }
}

/// Makes a nickname usable as a file name.
fn file_name(nickname: &str) -> String {
    nickname
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{
        CertExtension, CertInfo, EcCurve, IssuerName, KeySpec, SigningAlgorithm,
    };

    fn self_signed(token: &SoftToken, nickname: &str, subject: &str) -> Vec<u8> {
        let public_key = token
            .generate_key_pair(nickname, &KeySpec::Ec { curve: EcCurve::P256 })
            .unwrap();
        let info = CertInfo {
            serial: 1,
            subject: subject.into(),
            issuer: IssuerName::Dn(subject.into()),
            not_before: 1_700_000_000,
            not_after: 1_900_000_000,
            public_key,
            extensions: vec![CertExtension::BasicConstraints {
                ca: true, path_len: None, critical: true
            }],
        };
        token.sign_certificate(&info, nickname, SigningAlgorithm::Sha256WithEc, None).unwrap()
    }

    #[test]
    fn import_ca_certs_is_idempotent() {
        let token = Arc::new(SoftToken::new("internal"));
        let ca = self_signed(&token, "ca", "CN=Root CA,O=Example");
        let transfer = CertImportExport::new(token.clone());

        let names = transfer.import_ca_certs(&[ca.clone()]).unwrap();
        assert_eq!(names, vec!["CN=Root CA,O=Example".to_string()]);
        transfer.import_ca_certs(&[ca]).unwrap();
        assert_eq!(token.trust(&names[0]), Some(TrustFlags::trusted_ca()));
    }

    #[test]
    fn backup_and_restore() {
        let source = Arc::new(SoftToken::new("internal"));
        let cert = self_signed(&source, "caSigningCert", "CN=CA Signing,O=Example");
        source.import_certificate("caSigningCert", &cert, &TrustFlags::ca_signing()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let written = CertImportExport::new(source)
            .export_system_keys(&["caSigningCert".into()], "Secret.123", dir.path())
            .unwrap();
        assert_eq!(written.len(), 1);

        let target = Arc::new(SoftToken::new("internal"));
        target.import_certificate("caSigningCert", &cert, &TrustFlags::user()).unwrap();
        let data = std::fs::read(&written[0]).unwrap();
        let restored = CertImportExport::new(target.clone())
            .import_pkcs12(&data, "Secret.123")
            .unwrap();
        assert_eq!(restored, vec!["caSigningCert".to_string()]);
        assert!(target.has_key("caSigningCert"));
    }

    #[test]
    fn empty_backup_password_is_rejected() {
        let transfer = CertImportExport::new(Arc::new(SoftToken::new("internal")));
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            transfer.export_system_keys(&[], "", dir.path()),
            Err(Error::Validation(_))
        ));
    }
}
