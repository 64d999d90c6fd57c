//! Records of issued certificates and the requests they came from.

use log::debug;
use crate::commons::error::Error;
use crate::commons::{SetupEmptyResult, SetupResult};
use crate::crypto::base64_encode;
use crate::directory::{Directory, Entry, Modification, ResultCode};


//------------ CertRepository ------------------------------------------------

pub trait CertRepository: Send + Sync {
    /// Allocates the next certificate serial number.
    fn next_serial(&self) -> SetupResult<u64>;

    /// Allocates the next request id.
    fn next_request_id(&self) -> SetupResult<u64>;

    fn add_request(&self, record: &RequestRecord) -> SetupEmptyResult;

    fn add_certificate(&self, record: &CertRecord) -> SetupEmptyResult;
}


//------------ RequestRecord -------------------------------------------------

/// An enrollment request made up for a locally issued certificate.
///
/// It allows renewing the certificate through its profile later on.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RequestRecord {
    pub id: u64,
    pub profile_id: String,
    pub subject: String,
    pub requestor: String,

    /// The DER encoded subject public key info.
    pub public_key: Vec<u8>,
    pub cert_serial: u64,
}


//------------ CertRecord ----------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CertRecord {
    pub serial: u64,
    pub subject: String,
    pub issuer: String,
    pub cert: Vec<u8>,
    pub request_id: u64,
    pub profile_id: String,
}


//------------ DirectoryCertRepository ---------------------------------------

/// Keeps records in the `ou=certificateRepository,ou=ca` and `ou=requests`
/// containers, with the next free number in their `serialno` attribute.
pub struct DirectoryCertRepository {
    dir: Box<dyn Directory>,
    base_dn: String,
}

impl DirectoryCertRepository {
    pub fn new(dir: Box<dyn Directory>, base_dn: &str) -> Self {
        DirectoryCertRepository {
            dir,
            base_dn: base_dn.to_string(),
        }
    }

    fn certs_dn(&self) -> String {
        format!("ou=certificateRepository,ou=ca,{}", self.base_dn)
    }

    fn requests_dn(&self) -> String {
        format!("ou=requests,{}", self.base_dn)
    }

    fn next_number(&self, container: &str) -> SetupResult<u64> {
        let entry = self.dir.read(container)?;
        let current = entry
            .first("serialno")
            .ok_or_else(|| Error::custom(format!("{container} has no serialno")))?;
        let number = current.trim().parse::<u64>().map_err(|_| {
            Error::custom(format!("{container} has invalid serialno '{current}'"))
        })?;

        // Remove the exact old value so two concurrent allocations cannot
        // both succeed.
        self.dir.modify(container, &[
            Modification::delete_value("serialno", current),
            Modification::add("serialno", (number + 1).to_string()),
        ])?;
        Ok(number)
    }

    fn add_entry(&self, entry: Entry, what: &str) -> SetupEmptyResult {
        let dn = entry.dn().to_string();
        match self.dir.add(entry) {
            Ok(()) => {
                debug!("Added {what} record {dn}");
                Ok(())
            }
            Err(err) if err.code() == ResultCode::EntryAlreadyExists => {
                Err(Error::already_exists(format!("{what} record {dn}")))
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl CertRepository for DirectoryCertRepository {
    fn next_serial(&self) -> SetupResult<u64> {
        self.next_number(&self.certs_dn())
    }

    fn next_request_id(&self) -> SetupResult<u64> {
        self.next_number(&self.requests_dn())
    }

    fn add_request(&self, record: &RequestRecord) -> SetupEmptyResult {
        let entry = Entry::new(format!("cn={},{}", record.id, self.requests_dn()))
            .with("objectClass", "top")
            .with("objectClass", "request")
            .with("requestId", record.id.to_string())
            .with("requestState", "complete")
            .with("requestType", "enrollment")
            .with("requestSourceId", &record.requestor)
            .with("profileId", &record.profile_id)
            .with("subjectName", &record.subject)
            .with("publicKeyData", base64_encode(&record.public_key))
            .with("certSerial", record.cert_serial.to_string());
        self.add_entry(entry, "request")
    }

    fn add_certificate(&self, record: &CertRecord) -> SetupEmptyResult {
        let entry = Entry::new(format!("cn={},{}", record.serial, self.certs_dn()))
            .with("objectClass", "top")
            .with("objectClass", "certificateRecord")
            .with("serialno", record.serial.to_string())
            .with("subjectName", &record.subject)
            .with("issuerName", &record.issuer)
            .with("certStatus", "VALID")
            .with("userCertificate", base64_encode(&record.cert))
            .with("metaInfo", format!("requestId:{}", record.request_id))
            .with("metaInfo", format!("profileId:{}", record.profile_id));
        self.add_entry(entry, "certificate")
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;

    fn repository() -> (MemoryDirectory, DirectoryCertRepository) {
        let dir = MemoryDirectory::empty();
        dir.seed([
            Entry::new("o=pki").with("objectClass", "top"),
            Entry::new("ou=ca,o=pki").with("objectClass", "organizationalUnit"),
            Entry::new("ou=certificateRepository,ou=ca,o=pki")
                .with("objectClass", "repository")
                .with("serialno", "1"),
            Entry::new("ou=requests,o=pki")
                .with("objectClass", "repository")
                .with("serialno", "7"),
        ]);
        let repo = DirectoryCertRepository::new(Box::new(dir.clone()), "o=pki");
        (dir, repo)
    }

    #[test]
    fn numbers_are_allocated_in_sequence() {
        let (_dir, repo) = repository();
        assert_eq!(repo.next_serial().unwrap(), 1);
        assert_eq!(repo.next_serial().unwrap(), 2);
        assert_eq!(repo.next_request_id().unwrap(), 7);
        assert_eq!(repo.next_request_id().unwrap(), 8);
    }

    #[test]
    fn records_are_stored_once() {
        let (dir, repo) = repository();
        let record = CertRecord {
            serial: 1,
            subject: "CN=CA Signing Certificate".into(),
            issuer: "CN=CA Signing Certificate".into(),
            cert: vec![0x30, 0x00],
            request_id: 7,
            profile_id: "caCACert".into(),
        };
        repo.add_certificate(&record).unwrap();
        assert!(matches!(repo.add_certificate(&record), Err(Error::Conflict(_))));

        let entry = dir.peek("cn=1,ou=certificateRepository,ou=ca,o=pki").unwrap();
        assert!(entry.has_value("metaInfo", "requestId:7"));
    }
}
