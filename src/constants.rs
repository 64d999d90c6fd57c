//! Various installer-wide constants.


//------------ Binary Names -------------------------------------------------

/// The friendly name of the `pkisetup` binary.
pub const PKISETUP_SERVER_APP: &str = "PKI Setup";

/// The friendly name of the `pkisetupc` binary.
pub const PKISETUP_CLIENT_APP: &str = "PKI Setup Client";


//------------ Config Files Paths -------------------------------------------

/// The default path to the daemon config file.
pub const PKISETUP_DEFAULT_CONFIG_FILE: &str = "/etc/pkisetup.conf";

/// The name of the instance configuration file below `<data_dir>/conf`.
pub const INSTANCE_CONFIG_FILE: &str = "CS.cfg";

/// The marker file signalling a configured but not yet restarted instance.
pub const RESTART_MARKER_FILE: &str = ".restart_required";


//------------ Environment Variables ----------------------------------------

/// The environment variable with the log level.
///
/// The variable should contain the name of a [`log::LevelFilter`]. It will
/// be overwritten by the config file. The default is “info.”
pub const PKISETUP_ENV_LOG_LEVEL: &str = "PKISETUP_LOG_LEVEL";

/// The environment variable with the server URI used by the client.
pub const PKISETUP_CLI_SERVER_ENV: &str = "PKISETUP_CLI_SERVER";

/// The environment variable listing extra root certificates (PEM files,
/// colon separated) trusted for outgoing HTTPS requests.
pub const PKISETUP_HTTPS_ROOT_CERTS_ENV: &str = "PKISETUP_HTTPS_ROOT_CERTS";


//------------ HTTP ----------------------------------------------------------

/// The default timeout for outgoing HTTP requests in seconds.
pub const HTTP_CLIENT_TIMEOUT_SECS: u64 = 120;

/// The maximum length of a user agent we will log.
pub const HTTP_USER_AGENT_TRUNCATE: usize = 256;

/// The user agent sent with outgoing requests.
pub const HTTP_USER_AGENT: &str = concat!("pkisetup/", env!("CARGO_PKG_VERSION"));


//------------ Logging -------------------------------------------------------

/// Log target used for security relevant events.
pub const AUDIT_LOG_TARGET: &str = "pkisetup::audit";


//------------ Instance Configuration ----------------------------------------

/// Prefix of the installation journal namespace.
pub const PREOP_PREFIX: &str = "preop";

/// Key holding the configuration state (0 = not configured, 1 = configured).
pub const CS_STATE_KEY: &str = "cs.state";

/// Key holding the subsystem type of this instance.
pub const CS_TYPE_KEY: &str = "cs.type";

/// Signing algorithms allowed for the admin certificate when neither the
/// profile nor the server configuration list any.
pub const DEFAULT_ALLOWED_SIGNING_ALGORITHMS: &str =
    "SHA256withRSA,SHA512withRSA,SHA256withEC,SHA512withEC";

/// Group holding the users of peer subsystems.
pub const SUBSYSTEM_GROUP: &str = "Subsystem Group";

/// Group whose members may act as agents.
pub const CERTIFICATE_MANAGER_AGENTS_GROUP: &str = "Certificate Manager Agents";

/// Group whose members may administer the instance.
pub const ADMINISTRATORS_GROUP: &str = "Administrators";

/// Group whose members may administer the security domain.
pub const SECURITY_DOMAIN_ADMINISTRATORS_GROUP: &str =
    "Security Domain Administrators";


//------------ Directory -----------------------------------------------------

/// The RDN of the security domain subtree below the base DN.
pub const SECURITY_DOMAIN_RDN: &str = "ou=Security Domain";

/// The base of directory server tasks.
pub const TASKS_BASE_DN: &str = "cn=tasks,cn=config";

/// The base of the directory server mapping tree.
pub const MAPPING_TREE_BASE_DN: &str = "cn=mapping tree,cn=config";

/// The base of the directory server backends.
pub const LDBM_BASE_DN: &str = "cn=ldbm database,cn=plugins,cn=config";

/// The DN of the directory server changelog.
pub const CHANGELOG_DN: &str = "cn=changelog5,cn=config";


//------------ Remote Endpoints ----------------------------------------------

pub const PROFILE_SUBMIT_PATH: &str = "/ca/ee/ca/profileSubmit";
pub const GET_CERT_CHAIN_PATH: &str = "/ca/ee/ca/getCertChain";
pub const GET_DOMAIN_XML_PATH: &str = "/ca/admin/ca/getDomainXML";
pub const UPDATE_DOMAIN_XML_ADMIN_PATH: &str = "/ca/admin/ca/updateDomainXML";
pub const UPDATE_DOMAIN_XML_AGENT_PATH: &str = "/ca/agent/ca/updateDomainXML";
pub const INSTALL_TOKEN_PATH: &str = "/ca/rest/securityDomain/installToken";
pub const DOMAIN_INFO_PATH: &str = "/ca/rest/securityDomain/domainInfo";
pub const GET_CONFIG_ENTRIES_PATH: &str = "/ca/admin/ca/getConfigEntries";
pub const UPDATE_NUMBER_RANGE_PATH: &str = "/ca/admin/ca/updateNumberRange";
pub const REGISTER_USER_PATH: &str = "/ca/admin/ca/registerUser";
pub const UPDATE_CONNECTOR_PATH: &str = "/ca/admin/ca/updateConnector";
pub const UPDATE_OCSP_CONFIG_PATH: &str = "/ca/ee/ca/updateOCSPConfig";
pub const CREATE_SHARED_SECRET_PATH: &str = "/tks/admin/tks/createSharedSecret";


//------------ Tasks ---------------------------------------------------------

/// Default initial interval between polls of a directory task in millis.
pub const TASK_POLL_INITIAL_MILLIS: u64 = 500;

/// Default maximum interval between polls of a directory task in millis.
pub const TASK_POLL_MAX_MILLIS: u64 = 10_000;

/// Default time after which waiting for a directory task is given up.
pub const TASK_TIMEOUT_SECS: u64 = 3600;


//------------ Security Domain -----------------------------------------------

/// Default lifetime of an install token session in seconds.
pub const INSTALL_TOKEN_TTL_SECS: u64 = 1800;

/// The user the instance binds to its database as, once configured.
pub const DATABASE_USER: &str = "pkidbuser";
