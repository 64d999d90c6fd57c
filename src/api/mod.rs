//! Data structures exchanged through the configuration API.
//!
//! All JSON uses camelCase names.

use std::fmt;
use serde::{Deserialize, Serialize};
use crate::certs::{CertTag, IssuanceType};
use crate::directory::LdapConnInfo;


//------------ SecurityDomainType --------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum SecurityDomainType {
    #[serde(rename = "newdomain", alias = "NewDomain")]
    NewDomain,

    #[serde(rename = "existingdomain", alias = "ExistingDomain")]
    ExistingDomain,
}


//------------ Hierarchy -----------------------------------------------------

/// Where a CA sits in the certificate hierarchy.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Hierarchy {
    /// A self-signed root.
    #[default]
    Root,

    /// A subordinate signed by another CA.
    Join,
}


//------------ ConfigurationRequest ------------------------------------------

/// Everything needed to configure an instance in one go.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigurationRequest {
    /// The one-time pin generated when the instance was created.
    pub pin: String,

    pub subsystem_name: String,

    pub token: Option<String>,
    pub token_password: Option<String>,

    pub security_domain_type: Option<SecurityDomainType>,
    pub security_domain_name: Option<String>,
    pub security_domain_uri: Option<String>,
    pub security_domain_user: Option<String>,
    pub security_domain_password: Option<String>,

    /// A token obtained beforehand, used instead of user and password.
    pub install_token: Option<String>,

    pub is_clone: bool,
    pub clone_uri: Option<String>,

    /// PKCS#12 files holding the system keys of the master, for clones.
    pub p12_files: Vec<String>,
    pub p12_password: Option<String>,

    pub hierarchy: Option<Hierarchy>,

    /// The CA issuing the certificates of this instance. Either the URI of a
    /// CA in the security domain or `External CA`.
    pub issuing_ca: Option<String>,

    /// The chain of an external CA, base64 PKCS#7 or PEM.
    pub external_ca_chain: Option<String>,

    pub database: Option<DatabaseRequest>,

    pub system_certs: Vec<SystemCertData>,

    pub admin: Option<AdminRequest>,

    pub backup_keys: bool,
    pub backup_file: Option<String>,
    pub backup_password: Option<String>,

    /// URIs of peers to connect this instance to, such as the CA a KRA
    /// registers with.
    pub ca_uri: Option<String>,
    pub kra_uri: Option<String>,
    pub tks_uri: Option<String>,
    pub enable_server_side_keygen: bool,
}

impl ConfigurationRequest {
    pub fn is_new_domain(&self) -> bool {
        self.security_domain_type == Some(SecurityDomainType::NewDomain)
    }

    pub fn hierarchy(&self) -> Hierarchy {
        self.hierarchy.unwrap_or_default()
    }

    pub fn token_name(&self) -> &str {
        self.token.as_deref().unwrap_or("internal")
    }

    pub fn system_cert(&self, tag: CertTag) -> Option<&SystemCertData> {
        self.system_certs.iter().find(|c| c.tag == tag)
    }
}


//------------ DatabaseRequest -----------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseRequest {
    pub ds_host: String,
    pub ds_port: u16,
    #[serde(default)]
    pub secure_conn: bool,
    pub bind_dn: String,
    pub bind_pwd: String,
    pub base_dn: String,
    pub database: String,

    #[serde(default = "default_true")]
    pub create_new_db: bool,
    #[serde(default)]
    pub remove_data: bool,
    #[serde(default = "default_true")]
    pub setup_replication: bool,
    #[serde(default)]
    pub reindex_data: bool,

    pub master_replication_port: Option<u16>,
    pub clone_replication_port: Option<u16>,
}

impl DatabaseRequest {
    pub fn conn_info(&self) -> LdapConnInfo {
        LdapConnInfo {
            host: self.ds_host.clone(),
            port: self.ds_port,
            secure: self.secure_conn,
            bind_dn: self.bind_dn.clone(),
            bind_password: self.bind_pwd.clone(),
        }
    }
}

fn default_true() -> bool {
    true
}


//------------ SystemCertData ------------------------------------------------

/// One system certificate as requested and as returned.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemCertData {
    pub tag: CertTag,
    pub nickname: Option<String>,
    pub token: Option<String>,
    pub subject_dn: Option<String>,

    /// `rsa` or `ecc`.
    pub key_type: Option<String>,

    /// Bits for RSA, the curve name for EC.
    pub key_size: Option<String>,
    pub signing_algorithm: Option<String>,
    pub profile: Option<String>,
    pub issuance_type: Option<IssuanceType>,

    /// Base64 encoded PKCS#10 request.
    pub request: Option<String>,

    /// Base64 encoded certificate.
    pub cert: Option<String>,

    /// Base64 encoded chain.
    pub cert_chain: Option<String>,
}

impl SystemCertData {
    pub fn new(tag: CertTag) -> Self {
        SystemCertData {
            tag,
            nickname: None,
            token: None,
            subject_dn: None,
            key_type: None,
            key_size: None,
            signing_algorithm: None,
            profile: None,
            issuance_type: None,
            request: None,
            cert: None,
            cert_chain: None,
        }
    }
}


//------------ AdminRequest --------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminRequest {
    pub admin_uid: String,
    pub admin_password: String,
    pub admin_name: String,
    pub admin_email: String,
    pub admin_subject_dn: String,

    /// Base64 encoded PKCS#10 request for the admin certificate.
    pub admin_cert_request: Option<String>,
    pub admin_profile_id: Option<String>,

    /// Use this certificate instead of issuing one.
    #[serde(default)]
    pub import_admin_cert: bool,
    pub admin_cert: Option<String>,
}


//------------ ConfigurationResponse -----------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationResponse {
    /// `"0"` for success.
    pub status: String,
    pub system_certs: Vec<SystemCertData>,
    pub admin_cert: Option<SystemCertData>,
}

impl ConfigurationResponse {
    pub fn success(
        system_certs: Vec<SystemCertData>,
        admin_cert: Option<SystemCertData>,
    ) -> Self {
        ConfigurationResponse {
            status: "0".to_string(),
            system_certs,
            admin_cert,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == "0"
    }
}


//------------ InstallToken --------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct InstallToken {
    #[serde(rename = "Token")]
    token: String,
}

impl InstallToken {
    pub fn new(token: String) -> Self {
        InstallToken { token }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Display for InstallToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.token)
    }
}


//------------ ErrorResponse -------------------------------------------------

/// Defines an error response. Codes are grouped by category, see
/// [`crate::commons::error::Error`].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ErrorResponse {
    code: u32,
    msg: String,
    #[serde(default)]
    args: Vec<String>,
}

impl ErrorResponse {
    pub fn no_args(code: u32, msg: impl fmt::Display) -> Self {
        Self::with_args(code, msg, vec![])
    }

    pub fn with_args(code: u32, msg: impl fmt::Display, args: Vec<String>) -> Self {
        ErrorResponse {
            code,
            msg: msg.to_string(),
            args,
        }
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn msg(&self) -> &str {
        &self.msg
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (code {})", self.msg, self.code)
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_configuration_request() {
        let json = r#"{
            "pin": "XKJ8pq",
            "subsystemName": "CA pki.example.com 8443",
            "securityDomainType": "newdomain",
            "securityDomainName": "EXAMPLE",
            "hierarchy": "root",
            "database": {
                "dsHost": "ds.example.com",
                "dsPort": 389,
                "bindDn": "cn=Directory Manager",
                "bindPwd": "secret",
                "baseDn": "o=pki-tomcat-CA",
                "database": "pki-tomcat-CA"
            },
            "systemCerts": [
                { "tag": "signing", "nickname": "caSigningCert",
                  "subjectDn": "CN=CA Signing Certificate,O=EXAMPLE",
                  "keyType": "ecc", "keySize": "nistp256" }
            ]
        }"#;
        let req: ConfigurationRequest = serde_json::from_str(json).unwrap();
        assert!(req.is_new_domain());
        assert_eq!(req.hierarchy(), Hierarchy::Root);
        assert_eq!(req.token_name(), "internal");
        let db = req.database.unwrap();
        assert!(db.create_new_db);
        assert!(db.setup_replication);
        assert!(!db.remove_data);
        assert_eq!(req.system_certs[0].tag, CertTag::Signing);
    }

    #[test]
    fn install_token_json() {
        let token: InstallToken =
            serde_json::from_str(r#"{"Token":"8263912"}"#).unwrap();
        assert_eq!(token.token(), "8263912");
    }
}
