//! Formatting of server responses for the user.

use std::{error, fmt};
use std::str::FromStr;
use serde::Serialize;
use crate::api::{ConfigurationResponse, InstallToken};
use crate::domain::{DomainInfo, SubsystemType};


//------------ ReportFormat --------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReportFormat {
    Json,
    Text,
}

impl FromStr for ReportFormat {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, ReportError> {
        match s {
            "json" => Ok(ReportFormat::Json),
            "text" => Ok(ReportFormat::Text),
            _ => Err(ReportError::UnrecognisedFormat(s.to_string())),
        }
    }
}


//------------ ReportError ---------------------------------------------------

#[derive(Debug)]
pub enum ReportError {
    UnrecognisedFormat(String),
    Json(serde_json::Error),
}

impl fmt::Display for ReportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReportError::UnrecognisedFormat(s) => {
                write!(f, "This report format is not recognised: {s}")
            }
            ReportError::Json(e) => write!(f, "Cannot format as JSON: {e}"),
        }
    }
}

impl error::Error for ReportError {}


//------------ Report --------------------------------------------------------

/// A server response that can be shown to the user.
pub trait Report: Serialize {
    fn text(&self) -> String;

    fn report(&self, format: ReportFormat) -> Result<String, ReportError> {
        match format {
            ReportFormat::Json => {
                serde_json::to_string_pretty(self).map_err(ReportError::Json)
            }
            ReportFormat::Text => Ok(self.text()),
        }
    }
}

impl Report for ConfigurationResponse {
    fn text(&self) -> String {
        let mut res = String::new();
        res.push_str(&format!("Status: {}\n", self.status));
        for cert in &self.system_certs {
            res.push_str(&format!(
                "{}: {}\n",
                cert.tag,
                cert.nickname.as_deref().unwrap_or("-")
            ));
        }
        if let Some(admin) = &self.admin_cert {
            res.push_str(&format!(
                "admin: {}\n", admin.nickname.as_deref().unwrap_or("-")
            ));
        }
        res
    }
}

impl Report for InstallToken {
    fn text(&self) -> String {
        format!("{}\n", self.token())
    }
}

impl Report for DomainInfo {
    fn text(&self) -> String {
        let mut res = format!("Domain: {}\n", self.name());
        for kind in SubsystemType::ALL {
            let hosts = self.hosts(kind);
            if hosts.is_empty() {
                continue;
            }
            res.push_str(&format!("\n{kind}:\n"));
            for host in hosts {
                res.push_str(&format!(
                    "  {}:{}{}{}\n",
                    host.host,
                    host.secure_port,
                    if host.domain_manager { " (domain manager)" } else { "" },
                    if host.clone { " (clone)" } else { "" },
                ));
            }
        }
        res
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::HostInfo;

    #[test]
    fn should_parse_formats() {
        assert_eq!(ReportFormat::from_str("json").unwrap(), ReportFormat::Json);
        assert_eq!(ReportFormat::from_str("text").unwrap(), ReportFormat::Text);
        assert!(ReportFormat::from_str("xml").is_err());
    }

    #[test]
    fn domain_info_text_lists_hosts() {
        let mut domain = DomainInfo::new("Example Domain");
        domain.add_host(SubsystemType::Ca, HostInfo {
            host: "ca.example.com".into(),
            unsecure_port: None,
            secure_port: 8443,
            secure_ee_client_auth_port: None,
            secure_agent_port: 8443,
            secure_admin_port: 8443,
            clone: false,
            subsystem_name: "CA ca.example.com 8443".into(),
            domain_manager: true,
        }).unwrap();

        let text = domain.report(ReportFormat::Text).unwrap();
        assert!(text.starts_with("Domain: Example Domain\n"));
        assert!(text.contains("ca.example.com:8443 (domain manager)"));

        let json = domain.report(ReportFormat::Json).unwrap();
        assert!(json.contains("Example Domain"));
    }
}
