//! Certificate profiles.
//!
//! A profile is a `key=value` file listing the defaults applied to a new
//! certificate:
//!
//! ```text
//! profileId=caCACert
//! list=1,2
//! 1.default.class=validity
//! 1.default.params.range=7305
//! 2.default.class=basicConstraints
//! 2.default.params.isCA=true
//! ```
//!
//! The class names one variant of [`DefaultPolicy`]. There is no way to
//! plug in other classes, unknown ones make loading the profile fail.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use log::{debug, trace};
use crate::commons::error::Error;
use crate::commons::{file, SetupEmptyResult, SetupResult};
use crate::crypto::{
    CertExtension, CertInfo, ExtendedKeyUsage, GeneralName, KeyUsageBit,
};
use crate::store::ConfigStore;

const SECONDS_PER_DAY: i64 = 86_400;


//------------ ProfileRequest ------------------------------------------------

/// What a profile gets to see about the certificate being made.
#[derive(Clone, Debug)]
pub struct ProfileRequest<'a> {
    pub subject: &'a str,

    /// The current time as seconds since the epoch.
    pub now: i64,

    /// The value of `service.sslserver.san`, if configured.
    pub configured_san: Option<&'a str>,

    /// The OCSP responder of the issuing CA, if known.
    pub ocsp_uri: Option<&'a str>,
}


//------------ DefaultPolicy -------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DefaultPolicy {
    Validity {
        range_days: i64,
        start_offset: i64,
    },
    SubjectKeyIdentifier,
    AuthorityKeyIdentifier,
    BasicConstraints {
        ca: bool,
        path_len: Option<u32>,
        critical: bool,
    },
    KeyUsage {
        usages: Vec<KeyUsageBit>,
        critical: bool,
    },
    ExtendedKeyUsage(Vec<ExtendedKeyUsage>),
    SubjectAltName {
        names: Vec<GeneralName>,
        inject_configured_san: bool,
        common_name_to_san: bool,
    },
    AuthorityInfoAccess {
        ocsp_uri: Option<String>,
    },
}

impl DefaultPolicy {
    /// Creates the policy for a class name and its parameters.
    pub fn from_params(
        class: &str, params: &BTreeMap<String, String>
    ) -> SetupResult<Self> {
        let p = Params { class, params };
        match class {
            "validity" => Ok(DefaultPolicy::Validity {
                range_days: p.int("range", 365)?,
                start_offset: p.int("startTime", 0)?,
            }),
            "subjectKeyIdentifier" => Ok(DefaultPolicy::SubjectKeyIdentifier),
            "authorityKeyIdentifier" => Ok(DefaultPolicy::AuthorityKeyIdentifier),
            "basicConstraints" => {
                let path_len = p.int("pathLen", -1)?;
                Ok(DefaultPolicy::BasicConstraints {
                    ca: p.bool("isCA", false)?,
                    path_len: u32::try_from(path_len).ok(),
                    critical: p.bool("critical", true)?,
                })
            }
            "keyUsage" => Ok(DefaultPolicy::KeyUsage {
                usages: p.list("usages", |s| {
                    KeyUsageBit::from_str(s).map_err(|e| e.to_string())
                })?,
                critical: p.bool("critical", true)?,
            }),
            "extendedKeyUsage" => Ok(DefaultPolicy::ExtendedKeyUsage(
                p.list("oids", |s| {
                    ExtendedKeyUsage::from_str(s).map_err(|e| e.to_string())
                })?
            )),
            "subjectAltName" => Ok(DefaultPolicy::SubjectAltName {
                names: p.list("names", |s| {
                    GeneralName::parse(s).map_err(|e| e.to_string())
                })?,
                inject_configured_san: p.bool("injectConfiguredSan", false)?,
                common_name_to_san: p.bool("commonNameToSan", false)?,
            }),
            "authorityInfoAccess" => Ok(DefaultPolicy::AuthorityInfoAccess {
                ocsp_uri: p.string("ocspUri"),
            }),
            _ => Err(Error::custom(format!(
                "unknown profile default class '{class}'"
            ))),
        }
    }

    /// Applies the policy to the certificate.
    pub fn populate(
        &self, request: &ProfileRequest, info: &mut CertInfo
    ) -> SetupEmptyResult {
        match self {
            DefaultPolicy::Validity { range_days, start_offset } => {
                info.not_before = request.now + start_offset;
                info.not_after = info.not_before + range_days * SECONDS_PER_DAY;
            }
            DefaultPolicy::SubjectKeyIdentifier => {
                info.extensions.push(CertExtension::SubjectKeyIdentifier)
            }
            DefaultPolicy::AuthorityKeyIdentifier => {
                info.extensions.push(CertExtension::AuthorityKeyIdentifier)
            }
            DefaultPolicy::BasicConstraints { ca, path_len, critical } => {
                info.extensions.push(CertExtension::BasicConstraints {
                    ca: *ca,
                    path_len: *path_len,
                    critical: *critical,
                })
            }
            DefaultPolicy::KeyUsage { usages, critical } => {
                info.extensions.push(CertExtension::KeyUsage {
                    usages: usages.clone(),
                    critical: *critical,
                })
            }
            DefaultPolicy::ExtendedKeyUsage(usages) => {
                info.extensions.push(CertExtension::ExtendedKeyUsage(usages.clone()))
            }
            DefaultPolicy::SubjectAltName {
                names, inject_configured_san, common_name_to_san
            } => {
                let mut all = Vec::new();
                if *common_name_to_san {
                    if let Some(cn) = common_name(request.subject) {
                        all.push(GeneralName::Dns(cn.to_string()));
                    }
                }
                all.extend(names.iter().cloned());
                if *inject_configured_san {
                    if let Some(san) = request.configured_san {
                        for name in san.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                            all.push(GeneralName::parse(name)?);
                        }
                    }
                }
                all.dedup();
                if all.is_empty() {
                    debug!("No subject alternative names for '{}'", request.subject);
                } else {
                    info.extensions.push(CertExtension::SubjectAltName(all));
                }
            }
            DefaultPolicy::AuthorityInfoAccess { ocsp_uri } => {
                let uri = ocsp_uri.as_deref().or(request.ocsp_uri);
                if let Some(uri) = uri {
                    info.extensions.push(CertExtension::AuthorityInfoAccess {
                        ocsp_uri: uri.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Returns the value of the first CN in a DN.
fn common_name(dn: &str) -> Option<&str> {
    dn.split(',').find_map(|rdn| {
        let (attr, value) = rdn.split_once('=')?;
        if attr.trim().eq_ignore_ascii_case("cn") {
            Some(value.trim())
        } else {
            None
        }
    })
}

struct Params<'a> {
    class: &'a str,
    params: &'a BTreeMap<String, String>,
}

impl Params<'_> {
    fn string(&self, name: &str) -> Option<String> {
        self.params
            .get(name)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
    }

    fn invalid(&self, name: &str, value: &str) -> Error {
        Error::custom(format!(
            "invalid value '{value}' for parameter '{name}' of '{}'", self.class
        ))
    }

    fn int(&self, name: &str, default: i64) -> SetupResult<i64> {
        match self.string(name) {
            Some(v) => i64::from_str(&v).map_err(|_| self.invalid(name, &v)),
            None => Ok(default),
        }
    }

    fn bool(&self, name: &str, default: bool) -> SetupResult<bool> {
        match self.string(name).as_deref() {
            Some("true") => Ok(true),
            Some("false") => Ok(false),
            Some(v) => Err(self.invalid(name, v)),
            None => Ok(default),
        }
    }

    fn list<T>(
        &self, name: &str, parse: impl Fn(&str) -> Result<T, String>
    ) -> SetupResult<Vec<T>> {
        let Some(value) = self.string(name) else {
            return Ok(Vec::new())
        };
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| parse(s).map_err(|e| {
                Error::custom(format!("parameter '{name}' of '{}': {e}", self.class))
            }))
            .collect()
    }
}


//------------ CertProfile ---------------------------------------------------

/// A loaded certificate profile.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CertProfile {
    name: String,
    profile_id: Option<String>,
    signing_algs_allowed: Option<String>,
    signing_alg_default: Option<String>,
    policies: Vec<DefaultPolicy>,
}

impl CertProfile {
    /// Parses the content of the profile file called `name`.
    pub fn parse(name: &str, content: &str) -> SetupResult<Self> {
        let entries = ConfigStore::parse(content)?;
        let get = |key: &str| {
            entries
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(ToString::to_string)
        };

        let mut policies = Vec::new();
        for id in get("list").unwrap_or_default().split(',').map(str::trim) {
            if id.is_empty() {
                continue;
            }
            let class = get(&format!("{id}.default.class")).ok_or_else(|| {
                Error::custom(format!("profile {name}: no class for default {id}"))
            })?;
            let prefix = format!("{id}.default.params.");
            let params = entries
                .iter()
                .filter_map(|(key, value)| {
                    key.strip_prefix(&prefix).map(|p| (p.to_string(), value.clone()))
                })
                .collect::<BTreeMap<_, _>>();
            let policy = DefaultPolicy::from_params(&class, &params)
                .map_err(|e| Error::custom(format!("profile {name}: {e}")))?;
            trace!("Profile {name}: default {id} is {policy:?}");
            policies.push(policy);
        }

        Ok(CertProfile {
            name: name.to_string(),
            profile_id: get("profileId"),
            signing_algs_allowed: get("signingAlgsAllowed"),
            signing_alg_default: get("signingAlgDefault"),
            policies,
        })
    }

    /// Loads a profile from `dir` or, without a directory, a built-in one.
    pub fn load(dir: Option<&Path>, name: &str) -> SetupResult<Self> {
        match dir {
            Some(dir) => {
                let content = file::read_to_string(&dir.join(name))?;
                Self::parse(name, &content)
            }
            None => {
                let content = builtin(name).ok_or_else(|| {
                    Error::custom(format!("no built-in profile '{name}'"))
                })?;
                Self::parse(name, content)
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The id of the profile on a remote CA.
    pub fn profile_id(&self) -> Option<&str> {
        self.profile_id.as_deref()
    }

    pub fn signing_algs_allowed(&self) -> Option<&str> {
        self.signing_algs_allowed.as_deref()
    }

    pub fn signing_alg_default(&self) -> Option<&str> {
        self.signing_alg_default.as_deref()
    }

    pub fn policies(&self) -> &[DefaultPolicy] {
        &self.policies
    }

    /// Applies all defaults in the order they are listed.
    pub fn apply(
        &self, request: &ProfileRequest, info: &mut CertInfo
    ) -> SetupEmptyResult {
        for policy in &self.policies {
            policy.populate(request, info)?;
        }
        Ok(())
    }
}

fn builtin(name: &str) -> Option<&'static str> {
    match name {
        "caCert.profile" => Some(include_str!("../../defaults/profiles/caCert.profile")),
        "ocspCert.profile" => Some(include_str!("../../defaults/profiles/ocspCert.profile")),
        "serverCert.profile" => Some(include_str!("../../defaults/profiles/serverCert.profile")),
        "subsystemCert.profile" => Some(include_str!("../../defaults/profiles/subsystemCert.profile")),
        "auditSigningCert.profile" => Some(include_str!("../../defaults/profiles/auditSigningCert.profile")),
        "transportCert.profile" => Some(include_str!("../../defaults/profiles/transportCert.profile")),
        "storageCert.profile" => Some(include_str!("../../defaults/profiles/storageCert.profile")),
        "adminCert.profile" => Some(include_str!("../../defaults/profiles/adminCert.profile")),
        _ => None,
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IssuerName;

    fn info() -> CertInfo {
        CertInfo {
            serial: 1,
            subject: "CN=pki.example.com,O=Example".into(),
            issuer: IssuerName::Dn("CN=CA Signing Certificate,O=Example".into()),
            not_before: 0,
            not_after: 0,
            public_key: vec![],
            extensions: vec![],
        }
    }

    fn request<'a>(san: Option<&'a str>) -> ProfileRequest<'a> {
        ProfileRequest {
            subject: "CN=pki.example.com,O=Example",
            now: 1_000_000,
            configured_san: san,
            ocsp_uri: None,
        }
    }

    #[test]
    fn all_builtin_profiles_load() {
        for name in [
            "caCert.profile", "ocspCert.profile", "serverCert.profile",
            "subsystemCert.profile", "auditSigningCert.profile",
            "transportCert.profile", "storageCert.profile", "adminCert.profile",
        ] {
            let profile = CertProfile::load(None, name).unwrap();
            assert!(!profile.policies().is_empty(), "{name}");
            assert!(profile.profile_id().is_some(), "{name}");
        }
    }

    #[test]
    fn ca_profile_sets_constraints_and_validity() {
        let profile = CertProfile::load(None, "caCert.profile").unwrap();
        let mut info = info();
        profile.apply(&request(None), &mut info).unwrap();

        assert_eq!(info.not_before, 1_000_000);
        assert_eq!(info.not_after - info.not_before, 7305 * SECONDS_PER_DAY);
        assert!(info.extensions.contains(&CertExtension::BasicConstraints {
            ca: true, path_len: None, critical: true
        }));
    }

    #[test]
    fn server_profile_injects_configured_san() {
        let profile = CertProfile::load(None, "serverCert.profile").unwrap();
        let mut info = info();
        profile.apply(
            &request(Some("dns:alt.example.com, ip:192.0.2.1")), &mut info
        ).unwrap();

        let san = info.extensions.iter().find_map(|ext| match ext {
            CertExtension::SubjectAltName(names) => Some(names.clone()),
            _ => None,
        }).unwrap();
        assert_eq!(san, vec![
            GeneralName::Dns("pki.example.com".into()),
            GeneralName::Dns("alt.example.com".into()),
            GeneralName::Ip("192.0.2.1".into()),
        ]);
    }

    #[test]
    fn unknown_class_fails() {
        let content = "list=1\n1.default.class=com.example.MagicDefault\n";
        assert!(CertProfile::parse("magic.profile", content).is_err());
    }

    #[test]
    fn invalid_param_fails() {
        let content = "list=1\n1.default.class=keyUsage\n\
                       1.default.params.usages=digitalSignature,teleport\n";
        assert!(CertProfile::parse("bad.profile", content).is_err());
    }

    #[test]
    fn negative_path_len_is_unlimited() {
        let content = "list=1\n1.default.class=basicConstraints\n\
                       1.default.params.isCA=true\n1.default.params.pathLen=-1\n";
        let profile = CertProfile::parse("p.profile", content).unwrap();
        assert_eq!(profile.policies(), &[DefaultPolicy::BasicConstraints {
            ca: true, path_len: None, critical: true
        }]);
    }
}
