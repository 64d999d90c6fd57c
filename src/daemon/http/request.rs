use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::str::from_utf8;
use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Limited};
use hyper::body::Body;
use hyper::header::{AUTHORIZATION, USER_AGENT};
use hyper::Method;
use serde::de::DeserializeOwned;
use crate::commons::error::Error;
use crate::constants::HTTP_USER_AGENT_TRUNCATE;


//------------ HyperRequest --------------------------------------------------

/// A type alias for the request we receive from Hyper.
pub type HyperRequest = hyper::Request<hyper::body::Incoming>;


//------------ Request -------------------------------------------------------

pub struct Request {
    request: HyperRequest,
    remote_addr: SocketAddr,
    post_limit: u64,
}

impl Request {
    pub fn new(
        request: HyperRequest, remote_addr: SocketAddr, post_limit: u64
    ) -> Self {
        Request { request, remote_addr, post_limit }
    }

    pub fn method(&self) -> &Method {
        self.request.method()
    }

    pub fn path(&self) -> &str {
        self.request.uri().path()
    }

    /// Returns the first value of a query parameter.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.request.uri().query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    pub fn remote_ip(&self) -> String {
        self.remote_addr.ip().to_string()
    }

    pub fn user_agent(&self) -> Option<String> {
        let value = self.request.headers().get(&USER_AGENT)?;
        // to_str only succeeds for visible ASCII, so byte slicing is safe.
        value.to_str().ok().map(|s| {
            if s.len() > HTTP_USER_AGENT_TRUNCATE {
                s[..HTTP_USER_AGENT_TRUNCATE].to_string()
            } else {
                s.to_string()
            }
        })
    }

    /// Returns user and password from basic authentication, if present.
    pub fn basic_auth(&self) -> Option<(String, String)> {
        let value = self.request.headers().get(&AUTHORIZATION)?;
        parse_basic_auth(value.to_str().ok()?)
    }

    /// Get a json object from a post body.
    pub async fn json<O: DeserializeOwned>(self) -> Result<O, Error> {
        let bytes = self.read_bytes().await?;
        let string = from_utf8(&bytes).map_err(|_| Error::InvalidUtf8Input)?;
        serde_json::from_str(string).map_err(Error::JsonError)
    }

    /// Get the fields of a URL encoded form from a post body.
    ///
    /// Parameters in the query string are included, values in the body
    /// take precedence.
    pub async fn form(self) -> Result<BTreeMap<String, String>, Error> {
        let mut res = BTreeMap::new();
        if let Some(query) = self.request.uri().query() {
            res.extend(parse_form(query.as_bytes()));
        }
        let bytes = self.read_bytes().await?;
        from_utf8(&bytes).map_err(|_| Error::InvalidUtf8Input)?;
        res.extend(parse_form(&bytes));
        Ok(res)
    }

    pub async fn read_bytes(self) -> Result<Bytes, Error> {
        // If the Content-Length header says the body is too big, we return
        // Error::PostTooBig. Otherwise Limited catches oversized chunked
        // bodies and we return PostCannotRead on any error.
        let limit = self.post_limit;
        if self.request.body().size_hint().lower() > limit {
            return Err(Error::PostTooBig);
        }

        Ok(Limited::new(
            self.request.into_body(),
            limit.try_into().unwrap_or(usize::MAX),
        )
        .collect()
        .await
        .map_err(|_| Error::PostCannotRead)?
        .to_bytes())
    }
}


//------------ Helpers -------------------------------------------------------

fn parse_basic_auth(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = BASE64_ENGINE.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

fn parse_form(bytes: &[u8]) -> impl Iterator<Item = (String, String)> + '_ {
    url::form_urlencoded::parse(bytes)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
}


//============ Tests =========================================================
