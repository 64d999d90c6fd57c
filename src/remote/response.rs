//! The legacy XML response envelope.
//!
//! Peers answer with an `XMLResponse` root holding a `Status` of `0` for
//! success, `1` for failure or `2` for failed authentication. Failures
//! carry an `Error` text, successes named values. Responses are decoded
//! once into the typed values below.

use std::collections::BTreeMap;
use std::str::FromStr;
use crate::commons::error::Error;
use crate::commons::xml::{XmlElement, XmlError};
use crate::commons::SetupResult;
use crate::crypto::{base64_decode, softtoken};
use crate::domain::DomainInfo;

const ROOT: &str = "XMLResponse";


//------------ XmlResponse ---------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum XmlResponse {
    Success(XmlElement),
    AuthFailure(String),
    Failure(String),
}

impl XmlResponse {
    /// Decodes a response body received from `uri`.
    ///
    /// An empty body means the peer could not be reached properly.
    pub fn parse(uri: &str, body: &str) -> SetupResult<Self> {
        if body.trim().is_empty() {
            return Err(Error::remote(uri, "empty response"));
        }
        let root = XmlElement::parse_str(body)
            .map_err(|e| Error::remote(uri, e))?;
        if root.name() != ROOT {
            return Err(Error::remote(
                uri,
                format!("unexpected response element '{}'", root.name()),
            ));
        }
        let status = root
            .child_text("Status")
            .ok_or_else(|| Error::remote(uri, "response without status"))?
            .trim()
            .to_string();
        if status == "0" {
            return Ok(XmlResponse::Success(root));
        }
        let msg = root
            .child_text("Error")
            .filter(|e| !e.trim().is_empty())
            .map(ToString::to_string)
            .unwrap_or_else(|| format!("peer returned status {status}"));
        Ok(if status == "2" {
            XmlResponse::AuthFailure(msg)
        } else {
            XmlResponse::Failure(msg)
        })
    }

    /// Turns the response into the success payload or an error.
    pub fn into_success(self, uri: &str) -> SetupResult<XmlElement> {
        match self {
            XmlResponse::Success(root) => Ok(root),
            XmlResponse::AuthFailure(msg) => Err(Error::AuthenticationFailure(
                format!("{uri}: {msg}")
            )),
            XmlResponse::Failure(msg) => Err(Error::remote_status(uri, msg)),
        }
    }

    /// Renders a success response with the given values.
    pub fn render_success(values: Vec<XmlElement>) -> Result<String, XmlError> {
        let mut root = XmlElement::new(ROOT);
        root.push_text("Status", "0");
        for value in values {
            root.push(value);
        }
        root.to_xml_string()
    }

    /// Renders the failure response for an error.
    pub fn render_error(err: &Error) -> Result<String, XmlError> {
        let mut root = XmlElement::new(ROOT);
        root.push_text("Status", err.legacy_status());
        root.push_text("Error", err.to_string());
        root.to_xml_string()
    }
}


//------------ FromXmlResponse -----------------------------------------------

/// A typed success payload.
pub trait FromXmlResponse: Sized {
    fn from_response(root: &XmlElement) -> Result<Self, XmlError>;
}

/// For calls whose success has no payload.
impl FromXmlResponse for () {
    fn from_response(_root: &XmlElement) -> Result<Self, XmlError> {
        Ok(())
    }
}

impl FromXmlResponse for DomainInfo {
    fn from_response(root: &XmlElement) -> Result<Self, XmlError> {
        DomainInfo::from_xml(root)
    }
}


//------------ CertResponse --------------------------------------------------

/// The outcome of a profile submission.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CertResponse {
    pub request_id: Option<String>,
    pub cert: Vec<u8>,
    pub chain: Vec<Vec<u8>>,
}

impl FromXmlResponse for CertResponse {
    fn from_response(root: &XmlElement) -> Result<Self, XmlError> {
        let request = root
            .child("Requests")
            .and_then(|r| r.child("Request"))
            .ok_or_else(|| XmlError::missing("Request"))?;
        let b64 = request.req_child_text("b64")?;
        let cert = base64_decode(b64).map_err(|_| XmlError::invalid("b64", b64))?;
        let chain = match request.child_text("pkcs7").filter(|p| !p.trim().is_empty()) {
            Some(pkcs7) => softtoken::parse_chain(pkcs7.as_bytes())
                .map_err(|_| XmlError::invalid("pkcs7", pkcs7))?,
            None => Vec::new(),
        };
        Ok(CertResponse {
            request_id: request.child_text("Id").map(ToString::to_string),
            cert,
            chain,
        })
    }
}


//------------ CertChain -----------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CertChain(pub Vec<Vec<u8>>);

impl FromXmlResponse for CertChain {
    fn from_response(root: &XmlElement) -> Result<Self, XmlError> {
        let b64 = root.req_child_text("ChainBase64")?;
        softtoken::parse_chain(b64.as_bytes())
            .map(CertChain)
            .map_err(|_| XmlError::invalid("ChainBase64", b64))
    }
}


//------------ ConfigEntries -------------------------------------------------

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConfigEntries(pub BTreeMap<String, String>);

impl ConfigEntries {
    pub fn to_xml(&self) -> XmlElement {
        let mut list = XmlElement::new("ConfigList");
        for (name, value) in &self.0 {
            let mut entry = XmlElement::new("ConfigEntry");
            entry.push_text("name", name);
            entry.push_text("value", value);
            list.push(entry);
        }
        list
    }
}

impl FromXmlResponse for ConfigEntries {
    fn from_response(root: &XmlElement) -> Result<Self, XmlError> {
        let mut res = BTreeMap::new();
        if let Some(list) = root.child("ConfigList") {
            for entry in list.children_named("ConfigEntry") {
                res.insert(
                    entry.req_child_text("name")?.to_string(),
                    entry.child_text("value").unwrap_or("").to_string(),
                );
            }
        }
        Ok(ConfigEntries(res))
    }
}


//------------ NumberRange ---------------------------------------------------

/// A range of serial or request numbers, both ends included.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NumberRange {
    pub begin: u64,
    pub end: u64,
}

impl NumberRange {
    pub fn to_xml(self) -> Vec<XmlElement> {
        vec![
            XmlElement::with_text("beginNumber", self.begin.to_string()),
            XmlElement::with_text("endNumber", self.end.to_string()),
        ]
    }
}

impl FromXmlResponse for NumberRange {
    fn from_response(root: &XmlElement) -> Result<Self, XmlError> {
        let number = |name: &str| -> Result<u64, XmlError> {
            let text = root.req_child_text(name)?;
            u64::from_str(text.trim()).map_err(|_| XmlError::invalid(name, text))
        };
        let range = NumberRange {
            begin: number("beginNumber")?,
            end: number("endNumber")?,
        };
        if range.begin > range.end {
            return Err(XmlError::invalid("endNumber", &range.end.to_string()));
        }
        Ok(range)
    }
}


//------------ SharedSecret --------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SharedSecret(pub Vec<u8>);

impl FromXmlResponse for SharedSecret {
    fn from_response(root: &XmlElement) -> Result<Self, XmlError> {
        let b64 = root.req_child_text("SharedSecret")?;
        base64_decode(b64)
            .map(SharedSecret)
            .map_err(|_| XmlError::invalid("SharedSecret", "<redacted>"))
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const URI: &str = "https://ca.example.com:8443/ca/ee/ca/profileSubmit";

    #[test]
    fn status_decoding() {
        let ok = XmlResponse::parse(URI, "<XMLResponse><Status>0</Status></XMLResponse>").unwrap();
        assert!(matches!(ok, XmlResponse::Success(_)));

        let auth = XmlResponse::parse(
            URI, "<XMLResponse><Status>2</Status><Error>bad session</Error></XMLResponse>"
        ).unwrap();
        assert_eq!(auth, XmlResponse::AuthFailure("bad session".into()));
        assert!(auth.into_success(URI).unwrap_err().is_authentication_failure());

        let fail = XmlResponse::parse(
            URI, "<XMLResponse><Status>1</Status><Error>profile not found</Error></XMLResponse>"
        ).unwrap();
        match fail.into_success(URI) {
            Err(Error::RemoteStatus { msg, .. }) => assert_eq!(msg, "profile not found"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_and_garbage_are_protocol_errors() {
        assert!(matches!(
            XmlResponse::parse(URI, "  "),
            Err(Error::RemoteProtocol { .. })
        ));
        assert!(matches!(
            XmlResponse::parse(URI, "<html>oops</html>"),
            Err(Error::RemoteProtocol { .. })
        ));
    }

    #[test]
    fn render_error_uses_legacy_status() {
        let xml = XmlResponse::render_error(
            &Error::AuthenticationFailure("x".into())
        ).unwrap();
        let parsed = XmlResponse::parse(URI, &xml).unwrap();
        assert!(matches!(parsed, XmlResponse::AuthFailure(_)));
    }

    #[test]
    fn decode_number_range_and_config() {
        let root = XmlElement::parse_str(
            "<XMLResponse><Status>0</Status><beginNumber>900</beginNumber>\
             <endNumber>999</endNumber><ConfigList><ConfigEntry><name>internaldb.ldapconn.port</name>\
             <value>389</value></ConfigEntry></ConfigList></XMLResponse>"
        ).unwrap();
        assert_eq!(
            NumberRange::from_response(&root).unwrap(),
            NumberRange { begin: 900, end: 999 }
        );
        let entries = ConfigEntries::from_response(&root).unwrap();
        assert_eq!(entries.0["internaldb.ldapconn.port"], "389");
    }
}
