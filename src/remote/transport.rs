//! Moving requests to peers.

use crate::commons::httpclient::{self, ClientOptions, Credentials};


//------------ Transport -----------------------------------------------------

/// Sends requests to peer subsystems and returns the response bodies.
///
/// HTTP error statuses are turned into errors, anything else is the
/// caller's business.
pub trait Transport: Send + Sync {
    fn post_form(
        &self,
        uri: &str,
        form: &[(String, String)],
        credentials: Option<&Credentials>,
    ) -> Result<String, httpclient::Error>;

    fn get(
        &self,
        uri: &str,
        credentials: Option<&Credentials>,
    ) -> Result<String, httpclient::Error>;
}


//------------ HttpTransport -------------------------------------------------

/// The transport actually talking HTTPS.
#[derive(Clone, Debug, Default)]
pub struct HttpTransport {
    options: ClientOptions,
}

impl HttpTransport {
    pub fn new(options: ClientOptions) -> Self {
        HttpTransport { options }
    }
}

impl Transport for HttpTransport {
    fn post_form(
        &self,
        uri: &str,
        form: &[(String, String)],
        credentials: Option<&Credentials>,
    ) -> Result<String, httpclient::Error> {
        httpclient::post_form(uri, form, &self.options, credentials)
    }

    fn get(
        &self,
        uri: &str,
        credentials: Option<&Credentials>,
    ) -> Result<String, httpclient::Error> {
        httpclient::get_text(uri, &self.options, credentials)
    }
}
