//! Configuration of the `pkisetup` daemon.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::{env, fmt, io};
use log::{error, info, LevelFilter};
use serde::de;
use serde::{Deserialize, Deserializer};
#[cfg(unix)]
use syslog::Facility;
use crate::commons::httpclient::ClientOptions;
use crate::constants::*;
use crate::database::task::TaskPolicy;


//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
    }

    fn port() -> u16 {
        8443
    }

    fn https_mode() -> HttpsMode {
        HttpsMode::Disable
    }

    fn data_dir() -> PathBuf {
        PathBuf::from("./data")
    }

    fn log_level() -> LevelFilter {
        match env::var(PKISETUP_ENV_LOG_LEVEL) {
            Ok(level) => match LevelFilter::from_str(&level) {
                Ok(level) => level,
                Err(_) => {
                    eprintln!(
                        "Unrecognized value for log level in env var {PKISETUP_ENV_LOG_LEVEL}"
                    );
                    ::std::process::exit(1);
                }
            },
            _ => LevelFilter::Info,
        }
    }

    fn log_type() -> LogType {
        LogType::File
    }

    fn log_file() -> PathBuf {
        PathBuf::from("./pkisetup.log")
    }

    fn syslog_facility() -> String {
        "daemon".to_string()
    }

    fn http_client_timeout() -> u64 {
        HTTP_CLIENT_TIMEOUT_SECS
    }

    fn index_task_initial_poll_ms() -> u64 {
        TASK_POLL_INITIAL_MILLIS
    }

    fn index_task_max_poll_ms() -> u64 {
        TASK_POLL_MAX_MILLIS
    }

    fn index_task_timeout() -> u64 {
        TASK_TIMEOUT_SECS
    }

    fn install_token_ttl() -> u64 {
        INSTALL_TOKEN_TTL_SECS
    }

    fn post_limit_api() -> u64 {
        256 * 1024 // 256kB
    }
}


//------------ Config --------------------------------------------------------

/// Global configuration for the daemon.
///
/// The settings of the instance being configured live in its own
/// configuration store, see [`Config::instance_config`].
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "ConfigDefaults::ip")]
    ip: IpAddr,

    #[serde(default = "ConfigDefaults::port")]
    pub port: u16,

    #[serde(default = "ConfigDefaults::https_mode")]
    pub https_mode: HttpsMode,

    pub tls_cert_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,

    #[serde(default = "ConfigDefaults::data_dir")]
    pub data_dir: PathBuf,

    instance_config: Option<PathBuf>,
    token_dir: Option<PathBuf>,
    directory_snapshot: Option<PathBuf>,

    /// Certificate profiles, the shipped ones are used if missing.
    pub profiles_dir: Option<PathBuf>,

    /// LDIF templates, the shipped ones are used if missing.
    pub ldif_dir: Option<PathBuf>,

    #[serde(
        default = "ConfigDefaults::log_level",
        deserialize_with = "de_level_filter"
    )]
    log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    log_file: PathBuf,

    #[serde(default = "ConfigDefaults::syslog_facility")]
    syslog_facility: String,

    #[serde(default = "ConfigDefaults::http_client_timeout")]
    pub http_client_timeout: u64,

    #[serde(default = "ConfigDefaults::index_task_initial_poll_ms")]
    pub index_task_initial_poll_ms: u64,

    #[serde(default = "ConfigDefaults::index_task_max_poll_ms")]
    pub index_task_max_poll_ms: u64,

    #[serde(default = "ConfigDefaults::index_task_timeout")]
    pub index_task_timeout: u64,

    #[serde(default = "ConfigDefaults::install_token_ttl")]
    pub install_token_ttl: u64,

    #[serde(default = "ConfigDefaults::post_limit_api")]
    pub post_limit_api: u64,
}

impl Config {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// The configuration store of the instance.
    pub fn instance_config(&self) -> PathBuf {
        match &self.instance_config {
            Some(path) => path.clone(),
            None => self.data_dir.join("conf").join(INSTANCE_CONFIG_FILE),
        }
    }

    /// Where the software token keeps its keys.
    pub fn token_dir(&self) -> PathBuf {
        match &self.token_dir {
            Some(path) => path.clone(),
            None => self.data_dir.join("alias"),
        }
    }

    /// The file backing the built-in directory server.
    pub fn directory_snapshot(&self) -> PathBuf {
        match &self.directory_snapshot {
            Some(path) => path.clone(),
            None => self.data_dir.join("directory.json"),
        }
    }

    pub fn restart_marker(&self) -> PathBuf {
        self.data_dir.join("conf").join(RESTART_MARKER_FILE)
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            timeout: Duration::from_secs(self.http_client_timeout),
            ..Default::default()
        }
    }

    pub fn task_policy(&self) -> TaskPolicy {
        TaskPolicy::new(
            Duration::from_millis(self.index_task_initial_poll_ms),
            Duration::from_millis(self.index_task_max_poll_ms),
            Duration::from_secs(self.index_task_timeout),
        )
    }

    pub fn install_token_ttl(&self) -> Duration {
        Duration::from_secs(self.install_token_ttl)
    }
}

/// # Create
impl Config {
    /// Creates a config for use in tests, logging to stderr.
    pub fn test(data_dir: &Path) -> Self {
        Config {
            ip: ConfigDefaults::ip(),
            port: 18443,
            https_mode: HttpsMode::Disable,
            tls_cert_file: None,
            tls_key_file: None,
            data_dir: data_dir.to_path_buf(),
            instance_config: None,
            token_dir: None,
            directory_snapshot: None,
            profiles_dir: None,
            ldif_dir: None,
            log_level: LevelFilter::Debug,
            log_type: LogType::Stderr,
            log_file: ConfigDefaults::log_file(),
            syslog_facility: ConfigDefaults::syslog_facility(),
            http_client_timeout: 5,
            index_task_initial_poll_ms: 5,
            index_task_max_poll_ms: 20,
            index_task_timeout: 5,
            install_token_ttl: ConfigDefaults::install_token_ttl(),
            post_limit_api: ConfigDefaults::post_limit_api(),
        }
    }

    /// Creates the config at startup.
    pub fn create(config_file: &str) -> Result<Self, ConfigError> {
        let config = match Self::read_config(config_file) {
            Err(e) => {
                if config_file == PKISETUP_DEFAULT_CONFIG_FILE {
                    Err(ConfigError::other(
                        "Cannot find config file. Please use --config to specify its location.",
                    ))
                } else {
                    Err(ConfigError::Other(format!(
                        "Error parsing config file: {config_file}, error: {e}"
                    )))
                }
            }
            Ok(config) => {
                config.init_logging()?;
                info!("{PKISETUP_SERVER_APP} uses configuration file: {config_file}");
                Ok(config)
            }
        }?;
        config.verify().map_err(|e| {
            ConfigError::Other(format!(
                "Error parsing config file: {config_file}, error: {e}"
            ))
        })?;
        Ok(config)
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.port < 1024 {
            return Err(ConfigError::other("Port number must be >1024"));
        }

        if self.https_mode == HttpsMode::Existing
            && (self.tls_cert_file.is_none() || self.tls_key_file.is_none())
        {
            return Err(ConfigError::other(
                "https_mode \"existing\" needs tls_cert_file and tls_key_file",
            ));
        }

        if self.http_client_timeout == 0 {
            return Err(ConfigError::other("http_client_timeout must be at least 1"));
        }

        if self.index_task_initial_poll_ms == 0 {
            return Err(ConfigError::other(
                "index_task_initial_poll_ms must be at least 1",
            ));
        }

        if self.index_task_max_poll_ms < self.index_task_initial_poll_ms {
            return Err(ConfigError::other(
                "index_task_max_poll_ms must not be smaller than index_task_initial_poll_ms",
            ));
        }

        if self.index_task_timeout == 0 {
            return Err(ConfigError::other("index_task_timeout must be at least 1"));
        }

        if self.install_token_ttl == 0 {
            return Err(ConfigError::other("install_token_ttl must be at least 1"));
        }

        Ok(())
    }

    pub fn read_config(file: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(file)?;
        let c: Config = toml::from_str(&content)?;
        Ok(c)
    }

    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::File => self.file_logger(&self.log_file),
            LogType::Stderr => self.stderr_logger(),
            #[cfg(unix)]
            LogType::Syslog => {
                let facility = Facility::from_str(&self.syslog_facility)
                    .map_err(|_| ConfigError::other("Invalid syslog_facility"))?;
                self.syslog_logger(facility)
            }
            #[cfg(not(unix))]
            LogType::Syslog => {
                Err(ConfigError::other("syslog is only supported on unix"))
            }
        }
    }

    /// Creates a stderr logger.
    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.fern_logger()
            .chain(io::stderr())
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init stderr logging: {e}")))
    }

    /// Creates a file logger using the file provided by `path`.
    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        let file = match fern::log_file(path) {
            Ok(file) => file,
            Err(err) => {
                let error_string = format!(
                    "Failed to open log file '{}': {err}", path.display()
                );
                error!("{}", error_string.as_str());
                return Err(ConfigError::Other(error_string));
            }
        };
        self.fern_logger()
            .chain(file)
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init file logging: {e}")))
    }

    /// Creates a syslog logger and configures correctly.
    #[cfg(unix)]
    fn syslog_logger(&self, facility: Facility) -> Result<(), ConfigError> {
        let process = env::current_exe()
            .ok()
            .and_then(|path| {
                path.file_name()
                    .and_then(std::ffi::OsStr::to_str)
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| String::from("pkisetup"));
        let formatter = syslog::Formatter3164 {
            facility,
            hostname: None,
            process,
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter.clone())
            .or_else(|_| syslog::tcp(formatter.clone(), ("127.0.0.1", 601)))
            .or_else(|_| syslog::udp(formatter, ("127.0.0.1", 0), ("127.0.0.1", 514)));
        match logger {
            Ok(logger) => self
                .fern_logger()
                .chain(logger)
                .apply()
                .map_err(|e| ConfigError::Other(format!("Failed to init syslog: {e}"))),
            Err(err) => {
                let msg = format!("Cannot connect to syslog: {err}");
                Err(ConfigError::Other(msg))
            }
        }
    }

    /// Creates and returns a fern logger with log level tweaks
    fn fern_logger(&self) -> fern::Dispatch {
        // suppress overly noisy logging
        let framework_level = self.log_level.min(LevelFilter::Warn);

        let show_target = self.log_level == LevelFilter::Trace
            || self.log_level == LevelFilter::Debug;
        fern::Dispatch::new()
            .format(move |out, message, record| {
                if show_target {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                } else {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        message
                    ))
                }
            })
            .level(self.log_level)
            .level_for("rustls", framework_level)
            .level_for("hyper", framework_level)
            .level_for("hyper_util", framework_level)
            .level_for("mio", framework_level)
            .level_for("reqwest", framework_level)
            .level_for("tokio_util", framework_level)
            .level_for("want", framework_level)
            .level_for("h2", framework_level)
    }
}

fn de_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map_err(de::Error::custom)
}


//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => e.fmt(f),
            ConfigError::TomlError(e) => e.fmt(f),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}


//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
    Syslog,
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D>(d: D) -> Result<LogType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        match string.as_str() {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            "syslog" => Ok(LogType::Syslog),
            _ => Err(de::Error::custom(format!(
                "expected \"stderr\", \"file\" or \"syslog\", found : \"{string}\""
            ))),
        }
    }
}


//------------ HttpsMode -----------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HttpsMode {
    /// Serve plain HTTP, for use behind a TLS terminating proxy.
    Disable,

    /// Serve HTTPS with the configured certificate and key.
    Existing,
}

impl<'de> Deserialize<'de> for HttpsMode {
    fn deserialize<D>(d: D) -> Result<HttpsMode, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        match string.as_str() {
            "disable" => Ok(HttpsMode::Disable),
            "existing" => Ok(HttpsMode::Existing),
            _ => Err(de::Error::custom(format!(
                "expected \"disable\", or \"existing\", \
                 found: \"{string}\""
            ))),
        }
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_parse_default_config_file() {
        let c = Config::read_config("./defaults/pkisetup.conf").unwrap();
        let expected_socket_addr: SocketAddr = ([127, 0, 0, 1], 8443).into();
        assert_eq!(c.socket_addr(), expected_socket_addr);
        assert_eq!(c.https_mode, HttpsMode::Disable);
        assert_eq!(c.instance_config(), PathBuf::from("./data/conf/CS.cfg"));
        c.verify().unwrap();
    }

    #[test]
    fn should_reject_existing_https_without_files() {
        let c: Config = toml::from_str(r#"https_mode = "existing""#).unwrap();
        assert!(c.verify().is_err());

        let c: Config = toml::from_str(
            r#"
            https_mode = "existing"
            tls_cert_file = "/etc/pkisetup/cert.pem"
            tls_key_file = "/etc/pkisetup/key.pem"
            "#
        ).unwrap();
        c.verify().unwrap();
    }

    #[test]
    fn should_reject_bad_poll_settings() {
        let c: Config = toml::from_str(
            "index_task_initial_poll_ms = 1000\nindex_task_max_poll_ms = 10"
        ).unwrap();
        assert!(c.verify().is_err());
        assert!(toml::from_str::<Config>(r#"log_type = "journal""#).is_err());
    }

    #[test]
    fn should_set_correct_log_levels() {
        use log::Level as LL;

        fn void_logger(config: &str) -> Box<dyn log::Log> {
            let c: Config = toml::from_str(config).unwrap();
            let void_output = fern::Output::writer(Box::new(io::sink()), "");
            let (_, void_logger) = c.fern_logger().chain(void_output).into_log();
            void_logger
        }

        fn at(target: &str, level: LL) -> log::Metadata {
            log::Metadata::builder().target(target).level(level).build()
        }

        let log = void_logger(r#"log_level = "debug""#);
        assert!(log.enabled(&at("pkisetup::wizard", LL::Debug)));
        assert!(log.enabled(&at(AUDIT_LOG_TARGET, LL::Info)));
        assert!(!log.enabled(&at("pkisetup::wizard", LL::Trace)));
        assert!(log.enabled(&at("hyper", LL::Warn)));
        assert!(!log.enabled(&at("hyper", LL::Info)));
        assert!(!log.enabled(&at("reqwest", LL::Debug)));

        let log = void_logger(r#"log_level = "error""#);
        assert!(log.enabled(&at("pkisetup", LL::Error)));
        assert!(!log.enabled(&at("pkisetup", LL::Warn)));
        assert!(!log.enabled(&at("hyper", LL::Warn)));
    }
}
