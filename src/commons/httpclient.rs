//! Some helper functions for HTTP calls.
//!
//! The installer core is synchronous, so everything here uses the blocking
//! reqwest client. Async callers should move calls onto a blocking thread.
use std::{env, fmt};
use std::path::Path;
use std::time::Duration;
use log::trace;
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use serde::de::DeserializeOwned;
use crate::api::ErrorResponse;
use crate::commons::file;
use crate::constants::{
    HTTP_CLIENT_TIMEOUT_SECS, HTTP_USER_AGENT, PKISETUP_HTTPS_ROOT_CERTS_ENV,
};

const JSON_CONTENT: &str = "application/json";
const FORM_CONTENT: &str = "application/x-www-form-urlencoded";


//------------ ClientOptions -------------------------------------------------

/// Settings applied to every outgoing request.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub timeout: Duration,

    /// Accept any server certificate.
    ///
    /// Needed while bootstrapping trust with a peer whose chain has not
    /// been imported yet.
    pub accept_invalid_certs: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            timeout: Duration::from_secs(HTTP_CLIENT_TIMEOUT_SECS),
            accept_invalid_certs: false,
        }
    }
}


//------------ Credentials ---------------------------------------------------

/// How a request authenticates itself.
#[derive(Clone)]
pub enum Credentials {
    Basic { user: String, password: String },

    /// A TLS client certificate with its key as a PKCS#12 bundle.
    ClientCert { pkcs12: Vec<u8>, password: String },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Credentials::Basic { user, .. } => {
                write!(f, "Basic({user})")
            }
            Credentials::ClientCert { .. } => write!(f, "ClientCert"),
        }
    }
}


//------------ Requests ------------------------------------------------------

/// Performs a GET request and expects a response body that can be turned
/// into a string.
pub fn get_text(
    uri: &str,
    options: &ClientOptions,
    credentials: Option<&Credentials>,
) -> Result<String, Error> {
    let req = client(uri, options, credentials)?
        .get(uri)
        .headers(headers(uri, None)?);
    let res = send(uri, req, credentials)?;
    text_response(uri, res)
}

/// Performs a GET request that expects a json response that can be
/// deserialized into an owned value of the expected type.
pub fn get_json<T: DeserializeOwned>(
    uri: &str,
    options: &ClientOptions,
    credentials: Option<&Credentials>,
) -> Result<T, Error> {
    let req = client(uri, options, credentials)?
        .get(uri)
        .headers(headers(uri, Some(JSON_CONTENT))?);
    let res = send(uri, req, credentials)?;
    json_response(uri, res)
}

/// Performs a form encoded POST and returns the response body.
pub fn post_form(
    uri: &str,
    form: &[(String, String)],
    options: &ClientOptions,
    credentials: Option<&Credentials>,
) -> Result<String, Error> {
    let body = encode_form(form);
    trace!("POST {uri} with {} form fields", form.len());
    let req = client(uri, options, credentials)?
        .post(uri)
        .headers(headers(uri, Some(FORM_CONTENT))?)
        .body(body);
    let res = send(uri, req, credentials)?;
    text_response(uri, res)
}

/// Performs a POST of data that can be serialized into json, and expects
/// a json response that can be deserialized into an owned value.
pub fn post_json_with_response<T: DeserializeOwned>(
    uri: &str,
    data: impl Serialize,
    options: &ClientOptions,
    credentials: Option<&Credentials>,
) -> Result<T, Error> {
    let body = serde_json::to_string_pretty(&data)
        .map_err(|e| Error::request_build_json(uri, e))?;
    let req = client(uri, options, credentials)?
        .post(uri)
        .headers(headers(uri, Some(JSON_CONTENT))?)
        .body(body);
    let res = send(uri, req, credentials)?;
    json_response(uri, res)
}

/// Encodes form fields the way browsers do.
pub fn encode_form(form: &[(String, String)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(form.iter())
        .finish()
}

fn send(
    uri: &str,
    req: RequestBuilder,
    credentials: Option<&Credentials>,
) -> Result<Response, Error> {
    let req = match credentials {
        Some(Credentials::Basic { user, password }) => {
            req.basic_auth(user, Some(password))
        }
        _ => req,
    };
    req.send().map_err(|e| Error::execute(uri, e))
}

fn client(
    uri: &str,
    options: &ClientOptions,
    credentials: Option<&Credentials>,
) -> Result<Client, Error> {
    let mut builder = Client::builder().timeout(options.timeout);

    if let Ok(cert_list) = env::var(PKISETUP_HTTPS_ROOT_CERTS_ENV) {
        for path in cert_list.split(':') {
            let cert = load_root_cert(path)?;
            builder = builder.add_root_certificate(cert);
        }
    }

    if let Some(Credentials::ClientCert { pkcs12, password }) = credentials {
        let identity = reqwest::Identity::from_pkcs12_der(pkcs12, password)
            .map_err(|e| Error::request_build(uri, e))?;
        builder = builder.identity(identity);
    }

    if options.accept_invalid_certs
        || uri.starts_with("https://localhost")
        || uri.starts_with("https://127.0.0.1")
    {
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder.build().map_err(|e| Error::request_build(uri, e))
}

fn load_root_cert(path: &str) -> Result<reqwest::Certificate, Error> {
    let bytes = file::read(Path::new(path))
        .map_err(|e| Error::request_build_https_cert(path, e))?;
    reqwest::Certificate::from_pem(&bytes)
        .map_err(|e| Error::request_build_https_cert(path, e))
}

fn headers(
    uri: &str,
    content_type: Option<&str>,
) -> Result<HeaderMap, Error> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(HTTP_USER_AGENT));

    if let Some(content_type) = content_type {
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(content_type)
                .map_err(|e| Error::request_build(uri, e))?,
        );
    }
    Ok(headers)
}

fn json_response<T: DeserializeOwned>(
    uri: &str, res: Response
) -> Result<T, Error> {
    let text = text_response(uri, res)?;
    serde_json::from_str(&text).map_err(|e| {
        Error::response(uri, format!("could not parse JSON response: {e}"))
    })
}

fn text_response(uri: &str, res: Response) -> Result<String, Error> {
    match opt_text_response(uri, res)? {
        None => Err(Error::response(uri, "expected response body")),
        Some(s) => Ok(s),
    }
}

fn opt_text_response(
    uri: &str, res: Response
) -> Result<Option<String>, Error> {
    match res.status() {
        StatusCode::OK => match res.text().ok() {
            None => Ok(None),
            Some(s) => {
                if s.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(s))
                }
            }
        },
        StatusCode::UNAUTHORIZED => Err(Error::Unauthorized(uri.to_string())),
        StatusCode::FORBIDDEN => Err(Error::Forbidden(uri.to_string())),
        _ => Err(Error::from_res(uri, res)),
    }
}


//------------ Error ---------------------------------------------------------

type ErrorUri = String;
type RootCertPath = String;
type ErrorMessage = String;

#[derive(Debug)]
pub enum Error {
    RequestBuild(ErrorUri, ErrorMessage),
    RequestBuildHttpsCert(RootCertPath, ErrorMessage),

    RequestExecute(ErrorUri, ErrorMessage),

    Response(ErrorUri, ErrorMessage),
    Unauthorized(ErrorUri),
    Forbidden(ErrorUri),
    ErrorResponseWithBody(ErrorUri, StatusCode, String),
    ErrorResponseWithJson(ErrorUri, StatusCode, ErrorResponse),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::RequestBuild(uri, msg) => write!(
                f, "Issue creating request for URI: {uri}, error: {msg}"
            ),
            Error::RequestBuildHttpsCert(path, msg) => write!(
                f,
                "Cannot use configured HTTPS root cert '{path}'. Error: {msg}"
            ),
            Error::RequestExecute(uri, msg) => {
                write!(f, "Issue accessing URI: {uri}, error: {msg}")
            }
            Error::Response(uri, msg) => write!(
                f, "Issue processing response from URI: {uri}, error: {msg}"
            ),
            Error::Unauthorized(uri) => {
                write!(f, "Got 'Unauthorized' response for URI: {uri}")
            }
            Error::Forbidden(uri) => {
                write!(f, "Got 'Forbidden' response for URI: {uri}")
            }
            Error::ErrorResponseWithBody(uri, code, e) => write!(
                f, "Error response from URI: {uri}, Status: {code}, Error: {e}"
            ),
            Error::ErrorResponseWithJson(uri, code, res) => write!(
                f,
                "Error response from URI: {uri}, Status: {code}, \
                 ErrorResponse: {res}"
            ),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn request_build(uri: &str, msg: impl fmt::Display) -> Self {
        Error::RequestBuild(uri.to_string(), msg.to_string())
    }

    pub fn request_build_json(uri: &str, e: impl fmt::Display) -> Self {
        Error::RequestBuild(
            uri.to_string(),
            format!("could not serialize type to JSON: {e}"),
        )
    }

    pub fn request_build_https_cert(path: &str, msg: impl fmt::Display) -> Self {
        Error::RequestBuildHttpsCert(path.to_string(), msg.to_string())
    }

    pub fn execute(uri: &str, msg: impl fmt::Display) -> Self {
        Error::RequestExecute(uri.to_string(), msg.to_string())
    }

    pub fn response(uri: &str, msg: impl fmt::Display) -> Self {
        Error::Response(uri.to_string(), msg.to_string())
    }

    pub fn response_unexpected_status(uri: &str, status: StatusCode) -> Self {
        Error::Response(
            uri.to_string(), format!("unexpected status code {status}")
        )
    }

    /// Returns the URI (or certificate path) the error refers to.
    pub fn uri(&self) -> &str {
        match self {
            Error::RequestBuild(uri, _)
            | Error::RequestBuildHttpsCert(uri, _)
            | Error::RequestExecute(uri, _)
            | Error::Response(uri, _)
            | Error::Unauthorized(uri)
            | Error::Forbidden(uri)
            | Error::ErrorResponseWithBody(uri, _, _)
            | Error::ErrorResponseWithJson(uri, _, _) => uri,
        }
    }

    fn from_res(uri: &str, res: Response) -> Error {
        let status = res.status();
        match res.text() {
            Ok(body) => {
                if body.is_empty() {
                    Self::response_unexpected_status(uri, status)
                } else {
                    match serde_json::from_str::<ErrorResponse>(&body) {
                        Ok(res) => Error::ErrorResponseWithJson(
                            uri.to_string(), status, res
                        ),
                        Err(_) => Error::ErrorResponseWithBody(
                            uri.to_string(), status, body
                        ),
                    }
                }
            }
            _ => Self::response_unexpected_status(uri, status),
        }
    }
}


//------------ Tests ---------------------------------------------------------
