//! Talking to peer subsystems.
//!
//! [`RemoteAdminClient`] performs the exchanges with other instances that
//! configuring a subsystem involves: enrolling with the security domain,
//! having certificates issued, and connecting subsystems to each other.

pub mod response;
pub mod transport;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use log::{debug, info, warn};
use url::Url;
use crate::api::InstallToken;
use crate::commons::error::Error;
use crate::commons::httpclient::{ClientOptions, Credentials};
use crate::commons::{SetupEmptyResult, SetupResult};
use crate::constants::{
    CREATE_SHARED_SECRET_PATH, GET_CERT_CHAIN_PATH, GET_CONFIG_ENTRIES_PATH,
    GET_DOMAIN_XML_PATH, INSTALL_TOKEN_PATH, PROFILE_SUBMIT_PATH,
    REGISTER_USER_PATH, UPDATE_CONNECTOR_PATH, UPDATE_DOMAIN_XML_ADMIN_PATH,
    UPDATE_DOMAIN_XML_AGENT_PATH, UPDATE_NUMBER_RANGE_PATH,
    UPDATE_OCSP_CONFIG_PATH,
};
use crate::domain::{DomainInfo, HostInfo, SubsystemType};
use self::response::{
    CertChain, CertResponse, ConfigEntries, FromXmlResponse, NumberRange,
    SharedSecret, XmlResponse,
};
use self::transport::{HttpTransport, Transport};


//------------ Peer ----------------------------------------------------------

/// The HTTPS endpoint of a peer subsystem.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Peer {
    pub host: String,
    pub port: u16,
}

impl Peer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Peer {
            host: host.into(),
            port,
        }
    }

    pub fn uri(&self, path: &str) -> String {
        format!("https://{}:{}{}", self.host, self.port, path)
    }
}

impl FromStr for Peer {
    type Err = Error;

    /// Parses `https://host:port`, anything after the port is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s.trim())
            .map_err(|e| Error::validation(format!("invalid URI '{s}': {e}")))?;
        if url.scheme() != "https" {
            return Err(Error::validation(format!("URI '{s}' must use https")));
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::validation(format!("URI '{s}' has no host")))?;
        let port = url.port_or_known_default().unwrap_or(443);
        Ok(Peer::new(host, port))
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "https://{}:{}", self.host, self.port)
    }
}


//------------ HostRegistration ----------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DomainOperation {
    Add,
    Remove,
}

impl DomainOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            DomainOperation::Add => "add",
            DomainOperation::Remove => "remove",
        }
    }
}

/// A change to the host list of a security domain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HostRegistration {
    pub kind: SubsystemType,
    pub host: HostInfo,
    pub operation: DomainOperation,
}

impl HostRegistration {
    pub fn to_form(&self, session_id: &str) -> Vec<(String, String)> {
        let h = &self.host;
        let opt = |p: Option<u16>| p.map(|p| p.to_string()).unwrap_or_default();
        vec![
            form("list", self.kind.list_name()),
            form("type", self.kind.name()),
            form("host", &h.host),
            form("name", &h.subsystem_name),
            form("sport", h.secure_port.to_string()),
            form("agentsport", h.secure_agent_port.to_string()),
            form("adminsport", h.secure_admin_port.to_string()),
            form("eeclientauthsport", opt(h.secure_ee_client_auth_port)),
            form("httpport", opt(h.unsecure_port)),
            form("dm", if h.domain_manager { "true" } else { "false" }),
            form("clone", if h.clone { "true" } else { "false" }),
            form("operation", self.operation.as_str()),
            form("sessionID", session_id),
        ]
    }

    /// Reads a registration from the form of an `updateDomainXML` call.
    pub fn from_form(fields: &BTreeMap<String, String>) -> SetupResult<Self> {
        let get = |name: &str| -> SetupResult<&str> {
            fields
                .get(name)
                .map(String::as_str)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| Error::validation(format!("missing parameter '{name}'")))
        };
        let port = |name: &str| -> SetupResult<u16> {
            let value = get(name)?;
            u16::from_str(value.trim())
                .map_err(|_| Error::validation(format!("bad port '{value}' for '{name}'")))
        };
        let opt_port = |name: &str| -> Option<u16> {
            fields.get(name).and_then(|v| u16::from_str(v.trim()).ok())
        };
        let flag = |name: &str| {
            fields.get(name).is_some_and(|v| v.eq_ignore_ascii_case("true"))
        };

        let kind = match fields.get("type") {
            Some(t) => SubsystemType::from_str(t)?,
            None => {
                let list = get("list")?;
                SubsystemType::from_str(list.trim_end_matches("List"))?
            }
        };
        let operation = match fields.get("operation").map(String::as_str) {
            None | Some("add") => DomainOperation::Add,
            Some("remove") => DomainOperation::Remove,
            Some(other) => {
                return Err(Error::validation(format!("unknown operation '{other}'")))
            }
        };
        Ok(HostRegistration {
            kind,
            host: HostInfo {
                host: get("host")?.to_string(),
                unsecure_port: opt_port("httpport"),
                secure_port: port("sport")?,
                secure_ee_client_auth_port: opt_port("eeclientauthsport"),
                secure_agent_port: opt_port("agentsport").unwrap_or(port("sport")?),
                secure_admin_port: port("adminsport")?,
                clone: flag("clone"),
                subsystem_name: fields.get("name").cloned().unwrap_or_default(),
                domain_manager: flag("dm"),
            },
            operation,
        })
    }
}

fn form(name: &str, value: impl Into<String>) -> (String, String) {
    (name.to_string(), value.into())
}


//------------ CertSubmission ------------------------------------------------

/// A certificate request to submit to a CA.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CertSubmission {
    pub profile_id: String,

    /// Base64 encoded PKCS#10.
    pub request: String,
    pub session_id: Option<String>,

    /// Identifies the requesting instance as `{type}-{machine}-{port}`.
    pub requestor: String,
}

impl CertSubmission {
    pub fn to_form(&self) -> Vec<(String, String)> {
        let mut res = vec![
            form("profileId", &self.profile_id),
            form("cert_request_type", "pkcs10"),
            form("cert_request", &self.request),
            form("xmlOutput", "true"),
            form("requestor_name", &self.requestor),
        ];
        if let Some(session) = &self.session_id {
            res.push(form("sessionID", session));
        }
        res
    }
}


//------------ ConnectorInfo -------------------------------------------------

/// What a CA needs to know to forward key archival to a KRA.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectorInfo {
    pub kra_host: String,
    pub kra_port: u16,

    /// Base64 encoded transport certificate of the KRA.
    pub transport_cert: String,
    pub subsystem_name: String,
}


//------------ RangeKind -----------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RangeKind {
    Serial,
    Request,
}

impl RangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RangeKind::Serial => "serialNo",
            RangeKind::Request => "request",
        }
    }

    /// The configuration keys holding begin, end and increment of the range.
    pub fn config_keys(self) -> (&'static str, &'static str, &'static str) {
        match self {
            RangeKind::Serial => (
                "dbs.beginSerialNumber", "dbs.endSerialNumber", "dbs.serialIncrement"
            ),
            RangeKind::Request => (
                "dbs.beginRequestNumber", "dbs.endRequestNumber", "dbs.requestIncrement"
            ),
        }
    }
}

impl FromStr for RangeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "serialNo" => Ok(RangeKind::Serial),
            "request" => Ok(RangeKind::Request),
            _ => Err(Error::validation(format!("unknown range type '{s}'"))),
        }
    }
}


//------------ RemoteAdminClient ---------------------------------------------

#[derive(Clone)]
pub struct RemoteAdminClient {
    transport: Arc<dyn Transport>,
}

impl RemoteAdminClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        RemoteAdminClient { transport }
    }

    pub fn http(options: ClientOptions) -> Self {
        Self::new(Arc::new(HttpTransport::new(options)))
    }

    /// Posts a form and decodes the XML response.
    fn post_xml<T: FromXmlResponse>(
        &self,
        peer: &Peer,
        path: &str,
        form: &[(String, String)],
        credentials: Option<&Credentials>,
    ) -> SetupResult<T> {
        let uri = peer.uri(path);
        debug!("POST {uri}");
        let body = self.transport.post_form(&uri, form, credentials)?;
        Self::decode(&uri, &body)
    }

    fn get_xml<T: FromXmlResponse>(
        &self, peer: &Peer, path: &str
    ) -> SetupResult<T> {
        let uri = peer.uri(path);
        debug!("GET {uri}");
        let body = self.transport.get(&uri, None)?;
        Self::decode(&uri, &body)
    }

    fn decode<T: FromXmlResponse>(uri: &str, body: &str) -> SetupResult<T> {
        let root = XmlResponse::parse(uri, body)?.into_success(uri)?;
        T::from_response(&root).map_err(|e| Error::remote(uri, e))
    }

    /// Obtains an install token from the security domain.
    pub fn get_install_token(
        &self,
        sd: &Peer,
        user: &str,
        password: &str,
        hostname: &str,
        subsystem: SubsystemType,
    ) -> SetupResult<String> {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("hostname", hostname)
            .append_pair("subsystem", subsystem.name())
            .finish();
        let uri = format!("{}?{query}", sd.uri(INSTALL_TOKEN_PATH));
        let credentials = Credentials::Basic {
            user: user.to_string(),
            password: password.to_string(),
        };
        let body = self.transport.get(&uri, Some(&credentials))?;
        let token: InstallToken = serde_json::from_str(&body)
            .map_err(|e| Error::remote(&uri, format!("bad install token: {e}")))?;
        info!("Obtained install token from {sd} for {user}");
        Ok(token.token().to_string())
    }

    pub fn get_domain_info(&self, sd: &Peer) -> SetupResult<DomainInfo> {
        self.get_xml(sd, GET_DOMAIN_XML_PATH)
    }

    /// Adds or removes a host in the security domain.
    ///
    /// Tries the admin interface first. Older peers only offer the agent
    /// interface which needs the subsystem certificate for client
    /// authentication, so that is tried once if the admin call fails.
    pub fn update_domain_xml(
        &self,
        sd: &Peer,
        registration: &HostRegistration,
        session_id: &str,
        subsystem_cert: Option<&Credentials>,
    ) -> SetupEmptyResult {
        let form = registration.to_form(session_id);
        let admin = self.post_xml::<()>(sd, UPDATE_DOMAIN_XML_ADMIN_PATH, &form, None);
        let admin_err = match admin {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        let Some(credentials) = subsystem_cert else {
            return Err(admin_err);
        };
        warn!(
            "Updating domain through admin interface of {sd} failed ({admin_err}), \
             trying agent interface"
        );
        self.post_xml::<()>(sd, UPDATE_DOMAIN_XML_AGENT_PATH, &form, Some(credentials))
    }

    /// Submits a certificate request to a CA and returns the certificate.
    pub fn submit_cert_request(
        &self, ca: &Peer, submission: &CertSubmission
    ) -> SetupResult<CertResponse> {
        let res: CertResponse =
            self.post_xml(ca, PROFILE_SUBMIT_PATH, &submission.to_form(), None)?;
        info!(
            "CA {ca} issued certificate for profile {} (request {})",
            submission.profile_id,
            res.request_id.as_deref().unwrap_or("-")
        );
        Ok(res)
    }

    /// Fetches the certificate chain of a CA.
    pub fn get_cert_chain(&self, ca: &Peer) -> SetupResult<Vec<Vec<u8>>> {
        let chain: CertChain = self.get_xml(ca, GET_CERT_CHAIN_PATH)?;
        if chain.0.is_empty() {
            return Err(Error::remote(ca.uri(GET_CERT_CHAIN_PATH), "empty chain"));
        }
        Ok(chain.0)
    }

    pub fn get_config_entries(
        &self,
        master: &Peer,
        names: &[String],
        session_id: &str,
    ) -> SetupResult<BTreeMap<String, String>> {
        let form = vec![
            form("op", "get"),
            form("names", names.join(",")),
            form("sessionID", session_id),
        ];
        let entries: ConfigEntries =
            self.post_xml(master, GET_CONFIG_ENTRIES_PATH, &form, None)?;
        Ok(entries.0)
    }

    /// Has the master carve out a range of numbers for a clone.
    pub fn update_number_range(
        &self,
        master: &Peer,
        kind: RangeKind,
        session_id: &str,
    ) -> SetupResult<NumberRange> {
        let form = vec![
            form("type", kind.as_str()),
            form("sessionID", session_id),
        ];
        self.post_xml(master, UPDATE_NUMBER_RANGE_PATH, &form, None)
    }

    /// Registers the subsystem user of this instance with a peer.
    pub fn register_user(
        &self,
        peer: &Peer,
        uid: &str,
        name: &str,
        cert: &str,
        session_id: &str,
    ) -> SetupEmptyResult {
        let form = vec![
            form("uid", uid),
            form("name", name),
            form("certificate", cert),
            form("sessionID", session_id),
        ];
        self.post_xml(peer, REGISTER_USER_PATH, &form, None)
    }

    pub fn update_connector(
        &self,
        ca: &Peer,
        connector: &ConnectorInfo,
        session_id: &str,
    ) -> SetupEmptyResult {
        let form = vec![
            form("ca.connector.KRA.enable", "true"),
            form("ca.connector.KRA.host", &connector.kra_host),
            form("ca.connector.KRA.port", connector.kra_port.to_string()),
            form("ca.connector.KRA.transportCert", &connector.transport_cert),
            form("ca.connector.KRA.uri", "/kra/agent/kra/connector"),
            form("ca.connector.KRA.local", "false"),
            form("name", &connector.subsystem_name),
            form("sessionID", session_id),
        ];
        self.post_xml(ca, UPDATE_CONNECTOR_PATH, &form, None)
    }

    /// Has a CA publish its CRLs to an OCSP responder.
    pub fn update_ocsp_config(
        &self,
        ca: &Peer,
        ocsp: &Peer,
        session_id: &str,
    ) -> SetupEmptyResult {
        let form = vec![
            form("ocsp_host", &ocsp.host),
            form("ocsp_port", ocsp.port.to_string()),
            form("sessionID", session_id),
        ];
        self.post_xml(ca, UPDATE_OCSP_CONFIG_PATH, &form, None)
    }

    /// Has a TKS create the secret it shares with a TPS.
    pub fn create_shared_secret(
        &self,
        tks: &Peer,
        tps_id: &str,
        session_id: &str,
    ) -> SetupResult<Vec<u8>> {
        let form = vec![
            form("tpsId", tps_id),
            form("sessionID", session_id),
        ];
        let secret: SharedSecret =
            self.post_xml(tks, CREATE_SHARED_SECRET_PATH, &form, None)?;
        Ok(secret.0)
    }
}

impl fmt::Debug for RemoteAdminClient {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("RemoteAdminClient")
    }
}


//------------ Tests ---------------------------------------------------------
