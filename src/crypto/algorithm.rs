//! Signing algorithms and their selection.

use std::fmt;
use std::str::FromStr;
use log::{debug, warn};
use openssl::hash::MessageDigest;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use crate::constants::DEFAULT_ALLOWED_SIGNING_ALGORITHMS;
use super::{KeyType, TokenError};


//------------ SigningAlgorithm ----------------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SigningAlgorithm {
    Sha256WithRsa,
    Sha384WithRsa,
    Sha512WithRsa,
    Sha256WithEc,
    Sha384WithEc,
    Sha512WithEc,
}

impl SigningAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            SigningAlgorithm::Sha256WithRsa => "SHA256withRSA",
            SigningAlgorithm::Sha384WithRsa => "SHA384withRSA",
            SigningAlgorithm::Sha512WithRsa => "SHA512withRSA",
            SigningAlgorithm::Sha256WithEc => "SHA256withEC",
            SigningAlgorithm::Sha384WithEc => "SHA384withEC",
            SigningAlgorithm::Sha512WithEc => "SHA512withEC",
        }
    }

    pub fn key_type(self) -> KeyType {
        match self {
            SigningAlgorithm::Sha256WithRsa
            | SigningAlgorithm::Sha384WithRsa
            | SigningAlgorithm::Sha512WithRsa => KeyType::Rsa,
            SigningAlgorithm::Sha256WithEc
            | SigningAlgorithm::Sha384WithEc
            | SigningAlgorithm::Sha512WithEc => KeyType::Ec,
        }
    }

    pub fn digest(self) -> MessageDigest {
        match self {
            SigningAlgorithm::Sha256WithRsa
            | SigningAlgorithm::Sha256WithEc => MessageDigest::sha256(),
            SigningAlgorithm::Sha384WithRsa
            | SigningAlgorithm::Sha384WithEc => MessageDigest::sha384(),
            SigningAlgorithm::Sha512WithRsa
            | SigningAlgorithm::Sha512WithEc => MessageDigest::sha512(),
        }
    }

    /// Returns whether a key of the given type can sign with this.
    pub fn is_compatible(self, key_type: KeyType) -> bool {
        self.key_type() == key_type
    }

    /// The algorithm used when nothing else is configured.
    pub fn default_for(key_type: KeyType) -> Self {
        match key_type {
            KeyType::Rsa => SigningAlgorithm::Sha256WithRsa,
            KeyType::Ec => SigningAlgorithm::Sha256WithEc,
        }
    }
}

impl FromStr for SigningAlgorithm {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha256withrsa" => Ok(SigningAlgorithm::Sha256WithRsa),
            "sha384withrsa" => Ok(SigningAlgorithm::Sha384WithRsa),
            "sha512withrsa" => Ok(SigningAlgorithm::Sha512WithRsa),
            "sha256withec" | "sha256withecdsa" => Ok(SigningAlgorithm::Sha256WithEc),
            "sha384withec" | "sha384withecdsa" => Ok(SigningAlgorithm::Sha384WithEc),
            "sha512withec" | "sha512withecdsa" => Ok(SigningAlgorithm::Sha512WithEc),
            _ => Err(TokenError::invalid(format!(
                "unsupported signing algorithm '{s}'"
            ))),
        }
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for SigningAlgorithm {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for SigningAlgorithm {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let string = String::deserialize(d)?;
        SigningAlgorithm::from_str(&string).map_err(serde::de::Error::custom)
    }
}


//------------ Selection -----------------------------------------------------

/// Returns the list of allowed algorithms to use.
///
/// The first non-empty list of the profile setting and the server setting
/// wins, otherwise the built-in default applies.
pub fn allowed_list(
    profile: Option<&str>, server: Option<&str>
) -> Vec<String> {
    let source = [profile, server]
        .into_iter()
        .flatten()
        .find(|s| !s.trim().is_empty())
        .unwrap_or(DEFAULT_ALLOWED_SIGNING_ALGORITHMS);
    source
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Selects the algorithm for signing the admin certificate.
///
/// The preferred algorithm is used if it is in the allowed list and fits
/// the key of the CA. Otherwise the first allowed algorithm that fits
/// is taken. An empty list, or one without any fitting algorithm, is an
/// error.
pub fn select_admin_algorithm(
    allowed: &[String],
    preferred: Option<&str>,
    ca_key_type: KeyType,
) -> Result<SigningAlgorithm, TokenError> {
    if allowed.is_empty() {
        return Err(TokenError::invalid("the list of allowed algorithms is empty"));
    }

    let mut candidates = Vec::with_capacity(allowed.len());
    for name in allowed {
        match SigningAlgorithm::from_str(name) {
            Ok(alg) => candidates.push(alg),
            Err(_) => warn!("Ignoring unknown allowed algorithm '{name}'"),
        }
    }

    if let Some(preferred) = preferred.filter(|p| !p.trim().is_empty()) {
        match SigningAlgorithm::from_str(preferred) {
            Ok(alg) if candidates.contains(&alg) && alg.is_compatible(ca_key_type) => {
                return Ok(alg)
            }
            _ => debug!(
                "Preferred admin algorithm '{preferred}' not usable with {ca_key_type} key"
            ),
        }
    }

    candidates
        .into_iter()
        .find(|alg| alg.is_compatible(ca_key_type))
        .ok_or_else(|| {
            TokenError::invalid(format!(
                "none of the allowed algorithms ({}) can be used with a {} key",
                allowed.join(","),
                ca_key_type
            ))
        })
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn list(s: &str) -> Vec<String> {
        allowed_list(Some(s), None)
    }

    #[test]
    fn preferred_wins_when_allowed_and_compatible() {
        let alg = select_admin_algorithm(
            &list("SHA256withRSA,SHA512withRSA"),
            Some("SHA512withRSA"),
            KeyType::Rsa,
        ).unwrap();
        assert_eq!(alg, SigningAlgorithm::Sha512WithRsa);
    }

    #[test]
    fn falls_back_to_first_compatible() {
        let alg = select_admin_algorithm(
            &list("SHA256withRSA,SHA384withEC,SHA512withEC"),
            Some("SHA256withRSA"),
            KeyType::Ec,
        ).unwrap();
        assert_eq!(alg, SigningAlgorithm::Sha384WithEc);

        let alg = select_admin_algorithm(
            &list("SHA256withRSA,SHA512withRSA"),
            Some("SHA384withRSA"),
            KeyType::Rsa,
        ).unwrap();
        assert_eq!(alg, SigningAlgorithm::Sha256WithRsa);
    }

    #[test]
    fn rejects_without_compatible_algorithm() {
        assert!(select_admin_algorithm(
            &list("SHA256withRSA"), None, KeyType::Ec
        ).is_err());
        assert!(select_admin_algorithm(&[], None, KeyType::Rsa).is_err());
    }

    #[test]
    fn allowed_list_falls_back() {
        assert_eq!(allowed_list(Some(" "), Some("SHA256withEC")), vec!["SHA256withEC"]);
        assert_eq!(allowed_list(None, None).len(), 4);
    }
}
