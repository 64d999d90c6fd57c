#![allow(dead_code)] // Different tests use different parts.

use std::net::TcpListener;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use log::error;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use pkisetup::api::{
    AdminRequest, ConfigurationRequest, DatabaseRequest, SecurityDomainType,
    SystemCertData,
};
use pkisetup::commons::httpclient::{self, Credentials};
use pkisetup::commons::xml::XmlElement;
use pkisetup::config::Config;
use pkisetup::constants::{CS_STATE_KEY, CS_TYPE_KEY};
use pkisetup::crypto::{
    base64_encode, softtoken, CertExtension, CertInfo, CryptoToken, EcCurve,
    IssuerName, KeySpec, SigningAlgorithm, SoftToken,
};
use pkisetup::daemon::start::start_pkisetup_daemon;
use pkisetup::database::task::{TaskPolicy, TaskPoller};
use pkisetup::directory::DirectoryFactory;
use pkisetup::domain::SubsystemType;
use pkisetup::remote::response::XmlResponse;
use pkisetup::remote::transport::Transport;
use pkisetup::remote::RemoteAdminClient;
use pkisetup::store::ConfigStore;
use pkisetup::wizard::ConfigurationOrchestrator;


pub const PIN: &str = "Xa9Cq2Lr";
pub const PASSWORD: &str = "Secret.123";
pub const MACHINE: &str = "pki1.example.com";


//------------ MockTransport -------------------------------------------------

type Responder =
    Box<dyn Fn(&[(String, String)]) -> Result<String, String> + Send + Sync>;

/// A request the mock has seen.
#[derive(Clone, Debug)]
pub struct Call {
    pub method: &'static str,
    pub uri: String,
    pub form: Vec<(String, String)>,
}

impl Call {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.form
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Answers requests by the path they end with and remembers them all.
///
/// Requests to paths without an answer fail as if the peer could not be
/// reached.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<Vec<(String, Responder)>>,
    calls: Mutex<Vec<Call>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answers `path` with whatever `responder` makes of the form.
    pub fn on(
        &self,
        path: &str,
        responder: impl Fn(&[(String, String)]) -> Result<String, String>
            + Send + Sync + 'static,
    ) {
        self.routes
            .lock()
            .unwrap()
            .push((path.to_string(), Box::new(responder)));
    }

    /// Answers `path` with a success envelope holding `values`.
    pub fn reply(&self, path: &str, values: Vec<XmlElement>) {
        let body = XmlResponse::render_success(values).unwrap();
        self.on(path, move |_| Ok(body.clone()));
    }

    /// Answers `path` with a failure envelope.
    pub fn reply_failure(&self, path: &str, status: &str, msg: &str) {
        let mut root = XmlElement::new("XMLResponse");
        root.push_text("Status", status);
        root.push_text("Error", msg);
        let body = root.to_xml_string().unwrap();
        self.on(path, move |_| Ok(body.clone()));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// The calls as `host:port/path`.
    pub fn paths(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|call| {
                call.uri
                    .trim_start_matches("https://")
                    .split('?')
                    .next()
                    .unwrap_or_default()
                    .to_string()
            })
            .collect()
    }

    pub fn call_to(&self, path: &str) -> Option<Call> {
        self.calls()
            .into_iter()
            .find(|call| call.uri.split('?').next().unwrap_or_default().ends_with(path))
    }

    fn answer(
        &self,
        method: &'static str,
        uri: &str,
        form: &[(String, String)],
    ) -> Result<String, httpclient::Error> {
        self.calls.lock().unwrap().push(Call {
            method,
            uri: uri.to_string(),
            form: form.to_vec(),
        });
        let path = uri.split('?').next().unwrap_or_default();
        let routes = self.routes.lock().unwrap();
        match routes.iter().find(|(route, _)| path.ends_with(route.as_str())) {
            Some((_, responder)) => {
                responder(form).map_err(|msg| httpclient::Error::execute(uri, msg))
            }
            None => Err(httpclient::Error::execute(uri, "connection refused")),
        }
    }
}

impl Transport for MockTransport {
    fn post_form(
        &self,
        uri: &str,
        form: &[(String, String)],
        _credentials: Option<&Credentials>,
    ) -> Result<String, httpclient::Error> {
        self.answer("POST", uri, form)
    }

    fn get(
        &self,
        uri: &str,
        _credentials: Option<&Credentials>,
    ) -> Result<String, httpclient::Error> {
        self.answer("GET", uri, &[])
    }
}


//------------ TestCa --------------------------------------------------------

/// A CA outside the instance under test, standing in for a peer.
pub struct TestCa {
    token: SoftToken,
    cert: Vec<u8>,
}

impl TestCa {
    pub fn new(subject: &str) -> Self {
        let token = SoftToken::new("peer");
        let public_key = token
            .generate_key_pair("ca", &KeySpec::Ec { curve: EcCurve::P256 })
            .unwrap();
        let info = CertInfo {
            serial: 1,
            subject: subject.into(),
            issuer: IssuerName::Dn(subject.into()),
            not_before: 1_700_000_000,
            not_after: 2_000_000_000,
            public_key,
            extensions: vec![CertExtension::BasicConstraints {
                ca: true, path_len: None, critical: true
            }],
        };
        let cert = token
            .sign_certificate(&info, "ca", SigningAlgorithm::Sha256WithEc, None)
            .unwrap();
        TestCa { token, cert }
    }

    pub fn cert(&self) -> &[u8] {
        &self.cert
    }

    /// Issues an end entity certificate for a public key.
    pub fn issue(&self, public_key: Vec<u8>, subject: &str, serial: u64) -> Vec<u8> {
        let info = CertInfo {
            serial,
            subject: subject.into(),
            issuer: IssuerName::Encoded(softtoken::subject_name_der(&self.cert).unwrap()),
            not_before: 1_700_000_000,
            not_after: 2_000_000_000,
            public_key,
            extensions: vec![CertExtension::BasicConstraints {
                ca: false, path_len: None, critical: true
            }],
        };
        self.token
            .sign_certificate(&info, "ca", SigningAlgorithm::Sha256WithEc, Some(&self.cert))
            .unwrap()
    }

    /// Answers profile submissions at `path` by issuing for the request.
    pub fn serve_profile_submit(self: &Arc<Self>, transport: &MockTransport, path: &str) {
        let ca = self.clone();
        transport.on(path, move |form| {
            let csr = form
                .iter()
                .find(|(name, _)| name == "cert_request")
                .map(|(_, value)| value.clone())
                .ok_or("no cert_request")?;
            let der = pkisetup::crypto::base64_decode(&csr).map_err(|e| e.to_string())?;
            let public_key = softtoken::pkcs10_public_key(&der).map_err(|e| e.to_string())?;
            let cert = ca.issue(public_key, "CN=issued.example.com", 4711);
            Ok(cert_response(&cert))
        });
    }

    /// Answers chain requests at `path` with this CA.
    pub fn serve_chain(&self, transport: &MockTransport, path: &str) {
        transport.reply(path, vec![
            XmlElement::with_text("ChainBase64", base64_encode(&self.cert))
        ]);
    }
}

/// The success envelope of a profile submission.
pub fn cert_response(cert: &[u8]) -> String {
    let mut request = XmlElement::new("Request");
    request.push_text("Id", "42");
    request.push_text("b64", base64_encode(cert));
    let mut requests = XmlElement::new("Requests");
    requests.push(request);
    XmlResponse::render_success(vec![requests]).unwrap()
}


//------------ Fixtures ------------------------------------------------------

/// The configuration of a freshly created, unconfigured instance.
pub fn instance_store(kind: SubsystemType) -> ConfigStore {
    let mut store = ConfigStore::in_memory();
    fill_instance_store(&mut store, kind);
    store
}

pub fn fill_instance_store(store: &mut ConfigStore, kind: SubsystemType) {
    store.put(CS_TYPE_KEY, kind.name());
    store.put(CS_STATE_KEY, 0);
    store.put("preop.pin", PIN);
    store.put("instanceId", "pki-tomcat");
    store.put("service.machineName", MACHINE);
    store.put("service.securePort", 8443);
}

/// Polls quickly and gives up soon.
pub fn fast_poller() -> TaskPoller {
    TaskPoller::new(TaskPolicy::new(
        Duration::from_millis(5),
        Duration::from_millis(20),
        Duration::from_secs(2),
    ))
}

pub fn orchestrator(
    store: ConfigStore,
    transport: Arc<MockTransport>,
    directories: Arc<dyn DirectoryFactory>,
) -> ConfigurationOrchestrator {
    ConfigurationOrchestrator::new(
        store,
        Arc::new(SoftToken::new("internal")),
        RemoteAdminClient::new(transport),
        directories,
    )
    .with_poller(fast_poller())
}

/// EC keys for every system certificate of `kind`, they are fast to make.
pub fn ecc_certs(kind: SubsystemType) -> Vec<SystemCertData> {
    kind.system_cert_tags()
        .iter()
        .map(|&tag| {
            let mut data = SystemCertData::new(tag);
            data.key_type = Some("ecc".into());
            data.key_size = Some("nistp256".into());
            data
        })
        .collect()
}

/// A base64 PKCS#10 request as a browser would make for the admin.
pub fn admin_csr() -> String {
    let token = SoftToken::new("browser");
    token
        .generate_key_pair("admin", &KeySpec::Ec { curve: EcCurve::P256 })
        .unwrap();
    let csr = token
        .create_pkcs10("admin", "CN=PKI Administrator,O=Example", SigningAlgorithm::Sha256WithEc)
        .unwrap();
    base64_encode(&csr)
}

pub fn database(host: &str, base_dn: &str, database: &str) -> DatabaseRequest {
    DatabaseRequest {
        ds_host: host.into(),
        ds_port: 389,
        secure_conn: false,
        bind_dn: "cn=Directory Manager".into(),
        bind_pwd: PASSWORD.into(),
        base_dn: base_dn.into(),
        database: database.into(),
        create_new_db: true,
        remove_data: false,
        setup_replication: true,
        reindex_data: false,
        master_replication_port: None,
        clone_replication_port: None,
    }
}

/// A root CA creating a new security domain.
pub fn root_ca_request() -> ConfigurationRequest {
    ConfigurationRequest {
        pin: PIN.into(),
        subsystem_name: format!("CA {MACHINE} 8443"),
        security_domain_type: Some(SecurityDomainType::NewDomain),
        security_domain_name: Some("Example Domain".into()),
        database: Some(database("ds.example.com", "o=pki-tomcat-CA", "ca")),
        system_certs: ecc_certs(SubsystemType::Ca),
        admin: Some(AdminRequest {
            admin_uid: "caadmin".into(),
            admin_password: PASSWORD.into(),
            admin_name: "CA Administrator".into(),
            admin_email: "caadmin@example.com".into(),
            admin_subject_dn: "CN=PKI Administrator,O=Example".into(),
            admin_cert_request: Some(admin_csr()),
            admin_profile_id: None,
            import_admin_cert: false,
            admin_cert: None,
        }),
        ..Default::default()
    }
}


//------------ TestDaemon ----------------------------------------------------

/// A daemon serving plain HTTP on a free local port.
pub struct TestDaemon {
    join: JoinHandle<()>,
    pub uri: String,
    pub data_dir: TempDir,
}

impl TestDaemon {
    /// Starts a CA instance waiting to be configured.
    pub async fn start_ca() -> Self {
        let _ = stderrlog::new().verbosity(2).init();
        let data_dir = TempDir::new().unwrap();
        let mut config = Config::test(data_dir.path());
        config.port = free_port();
        write_instance_config(&config.instance_config(), SubsystemType::Ca);

        let uri = format!("http://127.0.0.1:{}", config.port);
        let (tx, running) = oneshot::channel();
        let join = tokio::spawn(async move {
            if let Err(err) = start_pkisetup_daemon(Arc::new(config), Some(tx)).await {
                error!("pkisetup failed to start: {err}");
            }
        });
        assert!(running.await.is_ok());
        TestDaemon { join, uri, data_dir }
    }

    pub fn uri(&self, path: &str) -> String {
        format!("{}{path}", self.uri)
    }

    pub fn stop(self) {
        self.join.abort();
    }
}

fn write_instance_config(path: &Path, kind: SubsystemType) {
    let content = instance_store(kind).to_file_content();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}
