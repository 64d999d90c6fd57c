//! Defines all installer errors.

use std::{error, fmt, io};
use hyper::StatusCode;
use crate::api::ErrorResponse;
use crate::commons::httpclient;
use crate::commons::xml::XmlError;
use crate::crypto::TokenError;
use crate::directory::DirectoryError;
use crate::store::StoreError;


//------------ SetupIoError --------------------------------------------------

/// An I/O error with some context about what was being done.
#[derive(Debug)]
pub struct SetupIoError {
    context: String,
    cause: io::Error,
}

impl SetupIoError {
    pub fn new(context: String, cause: io::Error) -> Self {
        SetupIoError { context, cause }
    }

    pub fn cause(&self) -> &io::Error {
        &self.cause
    }
}

impl fmt::Display for SetupIoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "context: {}, underlying io::Error: {}", self.context, self.cause)
    }
}

impl error::Error for SetupIoError {}


//------------ Error ---------------------------------------------------------

/// Every error the installer can report.
///
/// The variants are grouped in ranges of error codes that are reported
/// through the JSON API. The categories are what callers act upon: a
/// validation or conflict error can be fixed by the operator and retried,
/// an authentication failure should lead to a new prompt for credentials,
/// everything in the system range is fatal for the current run.
#[derive(Debug)]
pub enum Error {
    //-----------------------------------------------------------------
    // System Issues (1000-1099)
    //-----------------------------------------------------------------

    // 1000
    IoError(SetupIoError),

    // 1001
    TokenError(TokenError),

    // 1002
    DirectoryError(DirectoryError),

    // 1003
    StoreError(StoreError),

    // 1004
    XmlError(XmlError),

    // 1005
    TaskFailed { dn: String, status: String },

    // 1006
    TaskTimeout(String),

    // not on api (fails at start up)
    HttpsSetup(String),

    //-----------------------------------------------------------------
    // General API Client Issues (2000-2099)
    //-----------------------------------------------------------------

    // 2000
    JsonError(serde_json::Error),

    // 2001
    ApiUnknownMethod,

    // 2002
    ApiUnknownResource,

    // 2003
    PostTooBig,

    // 2004
    PostCannotRead,

    // 2005
    InvalidUtf8Input,

    //-----------------------------------------------------------------
    // Validation Issues (2100-2199)
    //-----------------------------------------------------------------

    // 2100
    Validation(String),

    //-----------------------------------------------------------------
    // Conflicts (2200-2299)
    //-----------------------------------------------------------------

    // 2200
    Conflict(String),

    // 2201
    AlreadyConfigured,

    // 2202
    ConfigurationInProgress,

    //-----------------------------------------------------------------
    // Authentication and Authorization (2300-2399)
    //-----------------------------------------------------------------

    // 2300
    AuthenticationFailure(String),

    // 2301
    Unauthorized(String),

    //-----------------------------------------------------------------
    // Remote Peers (2400-2499)
    //-----------------------------------------------------------------

    // 2400
    RemoteProtocol { uri: String, msg: String },

    // 2401
    RemoteStatus { uri: String, msg: String },

    //-----------------------------------------------------------------
    // Consistency (2500-2599)
    //-----------------------------------------------------------------

    // 2500
    Consistency(String),

    //-----------------------------------------------------------------
    // If we really don't know any more..
    //-----------------------------------------------------------------

    // 65535
    Custom(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::IoError(e) => write!(f, "I/O error: {e}"),
            Error::TokenError(e) => write!(f, "Crypto token error: {e}"),
            Error::DirectoryError(e) => write!(f, "Directory error: {e}"),
            Error::StoreError(e) => write!(f, "Configuration store error: {e}"),
            Error::XmlError(e) => write!(f, "XML error: {e}"),
            Error::TaskFailed { dn, status } => {
                write!(f, "Directory task '{dn}' failed: {status}")
            }
            Error::TaskTimeout(dn) => {
                write!(f, "Timed out waiting for directory task '{dn}'")
            }
            Error::HttpsSetup(e) => write!(f, "Cannot set up HTTPS: {e}"),
            Error::JsonError(e) => write!(f, "Invalid JSON: {e}"),
            Error::ApiUnknownMethod => write!(f, "Unknown API method"),
            Error::ApiUnknownResource => write!(f, "Unknown resource"),
            Error::PostTooBig => write!(f, "POST body exceeds configured limit"),
            Error::PostCannotRead => write!(f, "POST body cannot be read"),
            Error::InvalidUtf8Input => write!(f, "Submitted bytes are not valid UTF-8"),
            Error::Validation(msg) => write!(f, "Invalid request: {msg}"),
            Error::Conflict(msg) => write!(f, "{msg}"),
            Error::AlreadyConfigured => {
                write!(f, "Instance is already configured")
            }
            Error::ConfigurationInProgress => {
                write!(f, "Another configuration request is in progress")
            }
            Error::AuthenticationFailure(msg) => {
                write!(f, "Authentication failed: {msg}")
            }
            Error::Unauthorized(msg) => write!(f, "Not authorized: {msg}"),
            Error::RemoteProtocol { uri, msg } => {
                write!(f, "Error talking to {uri}: {msg}")
            }
            Error::RemoteStatus { uri, msg } => {
                write!(f, "Request to {uri} failed: {msg}")
            }
            Error::Consistency(msg) => write!(f, "Inconsistent setup: {msg}"),
            Error::Custom(msg) => write!(f, "{msg}"),
        }
    }
}

impl error::Error for Error {}

impl From<SetupIoError> for Error {
    fn from(e: SetupIoError) -> Self {
        Error::IoError(e)
    }
}

impl From<TokenError> for Error {
    fn from(e: TokenError) -> Self {
        Error::TokenError(e)
    }
}

impl From<DirectoryError> for Error {
    fn from(e: DirectoryError) -> Self {
        Error::DirectoryError(e)
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Error::StoreError(e)
    }
}

impl From<XmlError> for Error {
    fn from(e: XmlError) -> Self {
        Error::XmlError(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::JsonError(e)
    }
}

impl From<httpclient::Error> for Error {
    fn from(e: httpclient::Error) -> Self {
        match e {
            httpclient::Error::Unauthorized(uri) => {
                Error::AuthenticationFailure(format!(
                    "peer at {uri} rejected the credentials"
                ))
            }
            httpclient::Error::Forbidden(uri) => {
                Error::Unauthorized(format!("peer at {uri} denied access"))
            }
            other => Error::RemoteProtocol {
                uri: other.uri().to_string(),
                msg: other.to_string(),
            },
        }
    }
}

impl Error {
    pub fn custom(msg: impl fmt::Display) -> Self {
        Error::Custom(msg.to_string())
    }

    pub fn validation(msg: impl fmt::Display) -> Self {
        Error::Validation(msg.to_string())
    }

    pub fn conflict(msg: impl fmt::Display) -> Self {
        Error::Conflict(msg.to_string())
    }

    pub fn consistency(msg: impl fmt::Display) -> Self {
        Error::Consistency(msg.to_string())
    }

    pub fn unauthorized(msg: impl fmt::Display) -> Self {
        Error::Unauthorized(msg.to_string())
    }

    pub fn remote(uri: impl fmt::Display, msg: impl fmt::Display) -> Self {
        Error::RemoteProtocol {
            uri: uri.to_string(),
            msg: msg.to_string(),
        }
    }

    pub fn remote_status(uri: impl fmt::Display, msg: impl fmt::Display) -> Self {
        Error::RemoteStatus {
            uri: uri.to_string(),
            msg: msg.to_string(),
        }
    }

    /// Returns an error for an entity that exists but may not be replaced.
    pub fn already_exists(entity: impl fmt::Display) -> Self {
        Error::Conflict(format!(
            "{entity} already exists, confirm removal to replace it"
        ))
    }

    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, Error::AuthenticationFailure(_))
    }
}

/// Translate an error to an HTTP Status Code
impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::IoError(_)
            | Error::TokenError(_)
            | Error::DirectoryError(_)
            | Error::StoreError(_)
            | Error::XmlError(_)
            | Error::TaskFailed { .. }
            | Error::TaskTimeout(_)
            | Error::HttpsSetup(_)
            | Error::Custom(_) => StatusCode::INTERNAL_SERVER_ERROR,

            Error::ApiUnknownResource => StatusCode::NOT_FOUND,
            Error::ApiUnknownMethod => StatusCode::METHOD_NOT_ALLOWED,
            Error::PostTooBig => StatusCode::PAYLOAD_TOO_LARGE,

            Error::Conflict(_)
            | Error::AlreadyConfigured
            | Error::ConfigurationInProgress => StatusCode::CONFLICT,

            Error::AuthenticationFailure(_) => StatusCode::UNAUTHORIZED,
            Error::Unauthorized(_) => StatusCode::FORBIDDEN,

            Error::RemoteProtocol { .. } | Error::RemoteStatus { .. } => {
                StatusCode::BAD_GATEWAY
            }

            Error::JsonError(_)
            | Error::PostCannotRead
            | Error::InvalidUtf8Input
            | Error::Validation(_)
            | Error::Consistency(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Returns the status code used in the legacy XML envelope.
    pub fn legacy_status(&self) -> &'static str {
        match self {
            Error::AuthenticationFailure(_) => "2",
            _ => "1",
        }
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        match self {
            Error::IoError(e) => {
                ErrorResponse::with_args(1000, self, vec![e.to_string()])
            }
            Error::TokenError(e) => {
                ErrorResponse::with_args(1001, self, vec![e.to_string()])
            }
            Error::DirectoryError(e) => {
                ErrorResponse::with_args(1002, self, vec![e.to_string()])
            }
            Error::StoreError(e) => {
                ErrorResponse::with_args(1003, self, vec![e.to_string()])
            }
            Error::XmlError(e) => {
                ErrorResponse::with_args(1004, self, vec![e.to_string()])
            }
            Error::TaskFailed { dn, status } => ErrorResponse::with_args(
                1005, self, vec![dn.clone(), status.clone()]
            ),
            Error::TaskTimeout(dn) => {
                ErrorResponse::with_args(1006, self, vec![dn.clone()])
            }
            Error::HttpsSetup(e) => {
                ErrorResponse::with_args(1099, self, vec![e.clone()])
            }

            Error::JsonError(e) => {
                ErrorResponse::with_args(2000, self, vec![e.to_string()])
            }
            Error::ApiUnknownMethod => ErrorResponse::no_args(2001, self),
            Error::ApiUnknownResource => ErrorResponse::no_args(2002, self),
            Error::PostTooBig => ErrorResponse::no_args(2003, self),
            Error::PostCannotRead => ErrorResponse::no_args(2004, self),
            Error::InvalidUtf8Input => ErrorResponse::no_args(2005, self),

            Error::Validation(msg) => {
                ErrorResponse::with_args(2100, self, vec![msg.clone()])
            }

            Error::Conflict(msg) => {
                ErrorResponse::with_args(2200, self, vec![msg.clone()])
            }
            Error::AlreadyConfigured => ErrorResponse::no_args(2201, self),
            Error::ConfigurationInProgress => {
                ErrorResponse::no_args(2202, self)
            }

            Error::AuthenticationFailure(msg) => {
                ErrorResponse::with_args(2300, self, vec![msg.clone()])
            }
            Error::Unauthorized(msg) => {
                ErrorResponse::with_args(2301, self, vec![msg.clone()])
            }

            Error::RemoteProtocol { uri, msg } => ErrorResponse::with_args(
                2400, self, vec![uri.clone(), msg.clone()]
            ),
            Error::RemoteStatus { uri, msg } => ErrorResponse::with_args(
                2401, self, vec![uri.clone(), msg.clone()]
            ),

            Error::Consistency(msg) => {
                ErrorResponse::with_args(2500, self, vec![msg.clone()])
            }

            Error::Custom(msg) => {
                ErrorResponse::with_args(65535, self, vec![msg.clone()])
            }
        }
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(
            Error::validation("pin").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(Error::conflict("dn").status(), StatusCode::CONFLICT);
        assert_eq!(
            Error::AuthenticationFailure("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(Error::unauthorized("x").status(), StatusCode::FORBIDDEN);
        assert_eq!(
            Error::remote("https://ca:8443", "down").status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            Error::consistency("same db").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::custom("boom").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn legacy_status_distinguishes_auth_failure() {
        assert_eq!(Error::AuthenticationFailure("x".into()).legacy_status(), "2");
        assert_eq!(Error::validation("x").legacy_status(), "1");
    }

    #[test]
    fn error_response_carries_code_and_args() {
        let res = Error::remote("https://ca.example.com:8443", "timeout")
            .to_error_response();
        assert_eq!(res.code(), 2400);
        assert_eq!(
            res.args(),
            &["https://ca.example.com:8443".to_string(), "timeout".to_string()]
        );
    }

    #[test]
    fn unauthorized_http_maps_to_authentication_failure() {
        let err: Error = httpclient::Error::Unauthorized(
            "https://sd.example.com:8443/x".into()
        ).into();
        assert!(err.is_authentication_failure());
    }
}
