use std::{error, fmt, io};
use url::Url;
use crate::api::{ConfigurationRequest, ConfigurationResponse, InstallToken};
use crate::commons::error::SetupIoError;
use crate::commons::httpclient::{self, ClientOptions, Credentials};
use crate::commons::file;
use crate::commons::xml::XmlError;
use crate::constants::{
    DOMAIN_INFO_PATH, GET_DOMAIN_XML_PATH, INSTALL_TOKEN_PATH,
};
use crate::domain::{DomainInfo, SubsystemType};
use crate::remote::response::XmlResponse;
use super::options::{Command, Options};
use super::report::{Report, ReportError, ReportFormat};


//------------ PkisetupClient ------------------------------------------------

/// Talks to a `pkisetup` daemon.
pub struct PkisetupClient {
    server: Url,
    options: ClientOptions,
}

impl PkisetupClient {
    pub fn new(server: Url, options: ClientOptions) -> Self {
        PkisetupClient { server, options }
    }

    /// Runs the command and prints the result.
    pub fn report(options: Options) -> Result<(), Error> {
        let format = options.general.format;
        let client = PkisetupClient::new(
            options.general.server,
            ClientOptions {
                accept_invalid_certs: options.general.insecure,
                ..Default::default()
            },
        );

        let report = match options.command {
            Command::Configure(args) => {
                let request: ConfigurationRequest = file::load_json(&args.file)?;
                let response = client.configure(args.subsystem, &request)?;
                response.report(format)?
            }
            Command::InstallToken(args) => {
                let password = match args.password {
                    Some(password) => password,
                    None => rpassword::prompt_password(
                        format!("Password for {}: ", args.user)
                    ).map_err(Error::Prompt)?,
                };
                let token = client.install_token(
                    &args.hostname, args.subsystem, &args.user, &password,
                )?;
                token.report(format)?
            }
            Command::DomainInfo => client.domain_info()?.report(format)?,
            Command::DomainXml => {
                let xml = client.domain_xml()?;
                match format {
                    ReportFormat::Text => xml,
                    ReportFormat::Json => {
                        DomainInfo::from_xml_str(&xml)?.report(format)?
                    }
                }
            }
        };
        println!("{}", report.trim_end());
        Ok(())
    }

    fn uri(&self, path: &str) -> String {
        format!("{}{}", self.server.as_str().trim_end_matches('/'), path)
    }

    pub fn configure(
        &self,
        subsystem: SubsystemType,
        request: &ConfigurationRequest,
    ) -> Result<ConfigurationResponse, Error> {
        let uri = self.uri(&format!("/{}/rest/installer/configure", subsystem.lower()));
        Ok(httpclient::post_json_with_response(&uri, request, &self.options, None)?)
    }

    pub fn install_token(
        &self,
        hostname: &str,
        subsystem: SubsystemType,
        user: &str,
        password: &str,
    ) -> Result<InstallToken, Error> {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("hostname", hostname)
            .append_pair("subsystem", subsystem.name())
            .finish();
        let uri = format!("{}?{query}", self.uri(INSTALL_TOKEN_PATH));
        let credentials = Credentials::Basic {
            user: user.to_string(),
            password: password.to_string(),
        };
        Ok(httpclient::get_json(&uri, &self.options, Some(&credentials))?)
    }

    pub fn domain_info(&self) -> Result<DomainInfo, Error> {
        let uri = self.uri(DOMAIN_INFO_PATH);
        Ok(httpclient::get_json(&uri, &self.options, None)?)
    }

    /// Returns the `DomainInfo` element of the legacy interface.
    pub fn domain_xml(&self) -> Result<String, Error> {
        let uri = self.uri(GET_DOMAIN_XML_PATH);
        let body = httpclient::get_text(&uri, &self.options, None)?;
        let root = XmlResponse::parse(&uri, &body)
            .and_then(|res| res.into_success(&uri))
            .map_err(|e| Error::Server(e.to_string()))?;
        let info = root
            .child("DomainInfo")
            .ok_or_else(|| Error::Xml(XmlError::missing("DomainInfo")))?;
        Ok(info.to_xml_string()?)
    }
}


//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    HttpClient(httpclient::Error),
    Input(SetupIoError),
    Prompt(io::Error),
    Report(ReportError),
    Server(String),
    Xml(XmlError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::HttpClient(e) => e.fmt(f),
            Error::Input(e) => write!(f, "Cannot read input: {e}"),
            Error::Prompt(e) => write!(f, "Cannot read password: {e}"),
            Error::Report(e) => e.fmt(f),
            Error::Server(e) => write!(f, "Server reported an error: {e}"),
            Error::Xml(e) => write!(f, "Invalid XML from server: {e}"),
        }
    }
}

impl error::Error for Error {}

impl From<httpclient::Error> for Error {
    fn from(e: httpclient::Error) -> Self {
        Error::HttpClient(e)
    }
}

impl From<SetupIoError> for Error {
    fn from(e: SetupIoError) -> Self {
        Error::Input(e)
    }
}

impl From<ReportError> for Error {
    fn from(e: ReportError) -> Self {
        Error::Report(e)
    }
}

impl From<XmlError> for Error {
    fn from(e: XmlError) -> Self {
        Error::Xml(e)
    }
}


//============ Tests =========================================================
