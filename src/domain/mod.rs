//! The security domain: a registry of the PKI subsystems trusting each
//! other.
//!
//! The registry lives in the directory of the domain manager CA below
//! `ou=Security Domain`. It is exchanged between peers as a
//! [`DomainInfo`], in XML for the legacy interface and JSON for REST.

pub mod bootstrap;
pub mod service;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use crate::certs::CertTag;
use crate::commons::error::Error;
use crate::commons::xml::{XmlElement, XmlError};
use crate::constants::SECURITY_DOMAIN_RDN;
use crate::directory::{escape_dn_value, Entry};


//------------ SubsystemType -------------------------------------------------

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub enum SubsystemType {
    #[serde(rename = "CA")]
    Ca,
    #[serde(rename = "KRA")]
    Kra,
    #[serde(rename = "OCSP")]
    Ocsp,
    #[serde(rename = "TKS")]
    Tks,
    #[serde(rename = "TPS")]
    Tps,
    #[serde(rename = "RA")]
    Ra,
}

impl SubsystemType {
    pub const ALL: [SubsystemType; 6] = [
        SubsystemType::Ca,
        SubsystemType::Ocsp,
        SubsystemType::Kra,
        SubsystemType::Ra,
        SubsystemType::Tks,
        SubsystemType::Tps,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SubsystemType::Ca => "CA",
            SubsystemType::Kra => "KRA",
            SubsystemType::Ocsp => "OCSP",
            SubsystemType::Tks => "TKS",
            SubsystemType::Tps => "TPS",
            SubsystemType::Ra => "RA",
        }
    }

    /// The name used in configuration keys and URL paths.
    pub fn lower(self) -> &'static str {
        match self {
            SubsystemType::Ca => "ca",
            SubsystemType::Kra => "kra",
            SubsystemType::Ocsp => "ocsp",
            SubsystemType::Tks => "tks",
            SubsystemType::Tps => "tps",
            SubsystemType::Ra => "ra",
        }
    }

    /// The name of the host list of this type in the domain.
    pub fn list_name(self) -> String {
        format!("{}List", self.name())
    }

    /// The group whose members may enroll instances of this type.
    pub fn enterprise_admin_group(self) -> String {
        format!("Enterprise {} Administrators", self.name())
    }

    /// The system certificates an instance of this type needs.
    pub fn system_cert_tags(self) -> &'static [CertTag] {
        match self {
            SubsystemType::Ca => &[
                CertTag::Signing,
                CertTag::OcspSigning,
                CertTag::Sslserver,
                CertTag::Subsystem,
                CertTag::AuditSigning,
            ],
            SubsystemType::Kra => &[
                CertTag::Transport,
                CertTag::Storage,
                CertTag::Sslserver,
                CertTag::Subsystem,
                CertTag::AuditSigning,
            ],
            SubsystemType::Ocsp => &[
                CertTag::Signing,
                CertTag::Sslserver,
                CertTag::Subsystem,
                CertTag::AuditSigning,
            ],
            SubsystemType::Tks | SubsystemType::Tps | SubsystemType::Ra => &[
                CertTag::Sslserver,
                CertTag::Subsystem,
                CertTag::AuditSigning,
            ],
        }
    }

    /// Whether instances keep serial number ranges that clones split.
    pub fn has_number_ranges(self) -> bool {
        matches!(self, SubsystemType::Ca | SubsystemType::Kra)
    }
}

impl FromStr for SubsystemType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CA" => Ok(SubsystemType::Ca),
            "KRA" | "DRM" => Ok(SubsystemType::Kra),
            "OCSP" => Ok(SubsystemType::Ocsp),
            "TKS" => Ok(SubsystemType::Tks),
            "TPS" => Ok(SubsystemType::Tps),
            "RA" => Ok(SubsystemType::Ra),
            _ => Err(Error::validation(format!("unknown subsystem type '{s}'"))),
        }
    }
}

impl fmt::Display for SubsystemType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}


//------------ HostInfo ------------------------------------------------------

/// One subsystem instance registered in the domain.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    pub host: String,
    pub unsecure_port: Option<u16>,
    pub secure_port: u16,
    pub secure_ee_client_auth_port: Option<u16>,
    pub secure_agent_port: u16,
    pub secure_admin_port: u16,
    pub clone: bool,
    pub subsystem_name: String,
    pub domain_manager: bool,
}

impl HostInfo {
    /// Returns whether this is the instance at the given host and port.
    pub fn is_at(&self, host: &str, admin_port: u16) -> bool {
        self.host.eq_ignore_ascii_case(host) && self.secure_admin_port == admin_port
    }

    /// The RDN value of the directory entry for this host.
    pub fn entry_name(&self) -> String {
        format!("{}:{}", self.host, self.secure_admin_port)
    }

    fn to_xml(&self, element: &str) -> XmlElement {
        let mut res = XmlElement::new(element);
        res.push_text("Host", &self.host);
        res.push_text("UnSecurePort", opt_port(self.unsecure_port));
        res.push_text("SecurePort", self.secure_port.to_string());
        res.push_text(
            "SecureEEClientAuthPort",
            opt_port(self.secure_ee_client_auth_port),
        );
        res.push_text("SecureAgentPort", self.secure_agent_port.to_string());
        res.push_text("SecureAdminPort", self.secure_admin_port.to_string());
        res.push_text("Clone", bool_text(self.clone));
        res.push_text("SubsystemName", &self.subsystem_name);
        res.push_text("DomainManager", bool_text(self.domain_manager));
        res
    }

    fn from_xml(xml: &XmlElement) -> Result<Self, XmlError> {
        let port = |name: &str| -> Result<u16, XmlError> {
            let text = xml.req_child_text(name)?;
            u16::from_str(text.trim()).map_err(|_| XmlError::invalid(name, text))
        };
        let opt_port = |name: &str| -> Result<Option<u16>, XmlError> {
            match xml.child_text(name).map(str::trim) {
                None | Some("") => Ok(None),
                Some(text) => u16::from_str(text)
                    .map(Some)
                    .map_err(|_| XmlError::invalid(name, text)),
            }
        };
        Ok(HostInfo {
            host: xml.req_child_text("Host")?.to_string(),
            unsecure_port: opt_port("UnSecurePort")?,
            secure_port: port("SecurePort")?,
            secure_ee_client_auth_port: opt_port("SecureEEClientAuthPort")?,
            secure_agent_port: port("SecureAgentPort")?,
            secure_admin_port: port("SecureAdminPort")?,
            clone: parse_bool(xml.child_text("Clone")),
            subsystem_name: xml.child_text("SubsystemName").unwrap_or("").to_string(),
            domain_manager: parse_bool(xml.child_text("DomainManager")),
        })
    }

    /// Creates the directory entry for this host.
    pub fn to_entry(&self, list_dn: &str) -> Entry {
        let dn = format!("cn={},{list_dn}", escape_dn_value(&self.entry_name()));
        let mut entry = Entry::new(dn)
            .with("objectClass", "top")
            .with("objectClass", "pkiSubsystem")
            .with("cn", self.entry_name())
            .with("Host", &self.host)
            .with("SecurePort", self.secure_port.to_string())
            .with("SecureAgentPort", self.secure_agent_port.to_string())
            .with("SecureAdminPort", self.secure_admin_port.to_string())
            .with("Clone", bool_text(self.clone))
            .with("SubsystemName", &self.subsystem_name)
            .with("DomainManager", bool_text(self.domain_manager));
        if let Some(port) = self.unsecure_port {
            entry.add_value("UnSecurePort", port.to_string());
        }
        if let Some(port) = self.secure_ee_client_auth_port {
            entry.add_value("SecureEEClientAuthPort", port.to_string());
        }
        entry
    }

    /// Reads a host from its directory entry.
    pub fn from_entry(entry: &Entry) -> Result<Self, Error> {
        let port = |name: &str| -> Result<u16, Error> {
            let text = entry.first(name).ok_or_else(|| {
                Error::custom(format!("host entry {} has no {name}", entry.dn()))
            })?;
            u16::from_str(text.trim()).map_err(|_| {
                Error::custom(format!("host entry {} has bad {name}", entry.dn()))
            })
        };
        let opt_port = |name: &str| {
            entry.first(name).and_then(|p| u16::from_str(p.trim()).ok())
        };
        Ok(HostInfo {
            host: entry
                .first("Host")
                .ok_or_else(|| Error::custom(format!("host entry {} has no Host", entry.dn())))?
                .to_string(),
            unsecure_port: opt_port("UnSecurePort"),
            secure_port: port("SecurePort")?,
            secure_ee_client_auth_port: opt_port("SecureEEClientAuthPort"),
            secure_agent_port: port("SecureAgentPort")?,
            secure_admin_port: port("SecureAdminPort")?,
            clone: parse_bool(entry.first("Clone")),
            subsystem_name: entry.first("SubsystemName").unwrap_or("").to_string(),
            domain_manager: parse_bool(entry.first("DomainManager")),
        })
    }
}

fn opt_port(port: Option<u16>) -> String {
    port.map(|p| p.to_string()).unwrap_or_default()
}

fn bool_text(value: bool) -> &'static str {
    if value { "TRUE" } else { "FALSE" }
}

fn parse_bool(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}


//------------ DomainInfo ----------------------------------------------------

/// The full descriptor of a security domain.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct DomainInfo {
    name: String,
    subsystems: BTreeMap<SubsystemType, Vec<HostInfo>>,
}

impl DomainInfo {
    pub fn new(name: impl Into<String>) -> Self {
        DomainInfo {
            name: name.into(),
            subsystems: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hosts(&self, kind: SubsystemType) -> &[HostInfo] {
        self.subsystems.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Adds a host.
    ///
    /// A host with the same name and admin port replaces the existing one.
    /// Only a single CA may be domain manager. Its clones share the domain
    /// database through replication and may carry the flag as well.
    pub fn add_host(&mut self, kind: SubsystemType, host: HostInfo) -> Result<(), Error> {
        if host.domain_manager {
            if kind != SubsystemType::Ca {
                return Err(Error::validation(format!(
                    "a {kind} cannot be domain manager"
                )));
            }
            let manager = self.domain_manager().filter(|m| !m.clone);
            if let (Some(manager), false) = (manager, host.clone) {
                if !manager.is_at(&host.host, host.secure_admin_port) {
                    return Err(Error::conflict(format!(
                        "domain '{}' already has manager {}",
                        self.name,
                        manager.entry_name()
                    )));
                }
            }
        }
        let hosts = self.subsystems.entry(kind).or_default();
        hosts.retain(|h| !h.is_at(&host.host, host.secure_admin_port));
        hosts.push(host);
        Ok(())
    }

    pub fn find_host(
        &self, kind: SubsystemType, host: &str, admin_port: u16
    ) -> Option<&HostInfo> {
        self.hosts(kind).iter().find(|h| h.is_at(host, admin_port))
    }

    /// Returns the domain manager, leaving out its clones.
    pub fn domain_manager(&self) -> Option<&HostInfo> {
        let mut managers = self.hosts(SubsystemType::Ca).iter().filter(|h| h.domain_manager);
        let first = managers.next()?;
        Some(managers.find(|h| !h.clone).unwrap_or(first))
    }

    /// Returns whether the CA at host and admin port manages the domain.
    pub fn is_domain_master(&self, host: &str, admin_port: u16) -> bool {
        self.find_host(SubsystemType::Ca, host, admin_port)
            .is_some_and(|h| h.domain_manager)
    }

    /// Converts to the `DomainInfo` element of the legacy interface.
    ///
    /// Every type gets its list, with a `SubsystemCount`, even if empty.
    pub fn to_xml(&self) -> XmlElement {
        let mut res = XmlElement::new("DomainInfo");
        res.push_text("Name", &self.name);
        for kind in SubsystemType::ALL {
            let mut list = XmlElement::new(kind.list_name());
            let hosts = self.hosts(kind);
            for host in hosts {
                list.push(host.to_xml(kind.name()));
            }
            list.push_text("SubsystemCount", hosts.len().to_string());
            res.push(list);
        }
        res
    }

    pub fn from_xml(xml: &XmlElement) -> Result<Self, XmlError> {
        let xml = if xml.name() == "DomainInfo" {
            xml
        } else {
            xml.child("DomainInfo").ok_or_else(|| XmlError::missing("DomainInfo"))?
        };
        let mut res = DomainInfo::new(xml.req_child_text("Name")?);
        for kind in SubsystemType::ALL {
            let Some(list) = xml.child(&kind.list_name()) else {
                continue;
            };
            let hosts = list
                .children_named(kind.name())
                .map(HostInfo::from_xml)
                .collect::<Result<Vec<_>, _>>()?;
            if let Some(count) = list.child_text("SubsystemCount") {
                if usize::from_str(count.trim()).ok() != Some(hosts.len()) {
                    return Err(XmlError::invalid("SubsystemCount", count));
                }
            }
            if !hosts.is_empty() {
                res.subsystems.insert(kind, hosts);
            }
        }
        Ok(res)
    }

    pub fn to_xml_string(&self) -> Result<String, XmlError> {
        self.to_xml().to_xml_string()
    }

    pub fn from_xml_str(s: &str) -> Result<Self, XmlError> {
        Self::from_xml(&XmlElement::parse_str(s)?)
    }
}


//------------ Directory layout ----------------------------------------------

/// The DN of the security domain root below a base DN.
pub fn domain_dn(base_dn: &str) -> String {
    format!("{SECURITY_DOMAIN_RDN},{base_dn}")
}

/// The DN of the host list of a type below a base DN.
pub fn list_dn(base_dn: &str, kind: SubsystemType) -> String {
    format!("cn={},{}", kind.list_name(), domain_dn(base_dn))
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn host(name: &str, admin: u16, manager: bool) -> HostInfo {
        HostInfo {
            host: name.into(),
            unsecure_port: Some(8080),
            secure_port: 8443,
            secure_ee_client_auth_port: None,
            secure_agent_port: 8443,
            secure_admin_port: admin,
            clone: false,
            subsystem_name: format!("CA {name} {admin}"),
            domain_manager: manager,
        }
    }

    #[test]
    fn one_host_per_name_and_port() {
        let mut info = DomainInfo::new("EXAMPLE");
        info.add_host(SubsystemType::Ca, host("ca1", 8443, true)).unwrap();
        info.add_host(SubsystemType::Ca, host("ca1", 8443, true)).unwrap();
        info.add_host(SubsystemType::Ca, host("ca1", 9443, false)).unwrap();
        assert_eq!(info.hosts(SubsystemType::Ca).len(), 2);
    }

    #[test]
    fn single_domain_manager() {
        let mut info = DomainInfo::new("EXAMPLE");
        info.add_host(SubsystemType::Ca, host("ca1", 8443, true)).unwrap();
        assert!(info.add_host(SubsystemType::Ca, host("ca2", 8443, true)).is_err());
        assert!(info.add_host(SubsystemType::Kra, host("kra", 8443, true)).is_err());
        assert!(info.is_domain_master("CA1", 8443));
        assert!(!info.is_domain_master("ca1", 9443));
    }

    #[test]
    fn clone_of_manager_manages_too() {
        let mut info = DomainInfo::new("EXAMPLE");
        let mut clone = host("ca2", 8443, true);
        clone.clone = true;
        info.add_host(SubsystemType::Ca, clone).unwrap();
        info.add_host(SubsystemType::Ca, host("ca1", 8443, true)).unwrap();

        assert!(info.is_domain_master("ca2", 8443));
        assert_eq!(info.domain_manager().map(|h| h.host.as_str()), Some("ca1"));
        assert!(info.add_host(SubsystemType::Ca, host("ca3", 8443, true)).is_err());
    }

    #[test]
    fn xml_lists_every_type_with_count() {
        let mut info = DomainInfo::new("EXAMPLE");
        info.add_host(SubsystemType::Ca, host("ca1", 8443, true)).unwrap();
        let xml = info.to_xml();
        assert_eq!(
            xml.child("CAList").and_then(|l| l.child_text("SubsystemCount")),
            Some("1")
        );
        assert_eq!(
            xml.child("TPSList").and_then(|l| l.child_text("SubsystemCount")),
            Some("0")
        );
    }

    #[test]
    fn rejects_wrong_count() {
        let xml = "<DomainInfo><Name>X</Name><CAList>\
                   <SubsystemCount>2</SubsystemCount></CAList></DomainInfo>";
        assert!(DomainInfo::from_xml_str(xml).is_err());
    }

    #[test]
    fn entry_round_trip() {
        let h = host("ca1.example.com", 8443, true);
        let entry = h.to_entry(&list_dn("o=pki", SubsystemType::Ca));
        assert_eq!(
            entry.dn(),
            "cn=ca1.example.com:8443,cn=CAList,ou=Security Domain,o=pki"
        );
        assert_eq!(HostInfo::from_entry(&entry).unwrap(), h);
    }
}
