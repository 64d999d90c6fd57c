use bytes::Bytes;
use http_body_util::{Either, Empty, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE, WWW_AUTHENTICATE};
use hyper::StatusCode;
use log::error;
use serde::Serialize;
use crate::commons::error::Error;
use crate::remote::response::XmlResponse;


//----------- ContentType ----------------------------------------------------

#[derive(Clone, Copy)]
enum ContentType {
    Json,
    Text,
    Xml,
}

impl ContentType {
    fn as_str(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Text => "text/plain",
            ContentType::Xml => "application/xml",
        }
    }
}


//------------ HyperResponse -------------------------------------------------

pub type HyperResponseBody = Either<Empty<Bytes>, Full<Bytes>>;
pub type HyperResponse = hyper::Response<HyperResponseBody>;


//----------- Response -------------------------------------------------------

struct Response {
    status: StatusCode,
    content_type: ContentType,
    body: Bytes,
    cause: Option<Error>,
}

impl Response {
    fn new(status: StatusCode) -> Self {
        Response {
            status,
            content_type: ContentType::Text,
            body: Bytes::default(),
            cause: None,
        }
    }

    fn finalize(self) -> HttpResponse {
        let body = if self.body.is_empty() {
            Either::Left(Empty::new())
        } else {
            Either::Right(Full::new(self.body))
        };
        let mut response = hyper::Response::new(body);
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static(self.content_type.as_str()),
        );
        if self.status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"pkisetup\""),
            );
        }

        HttpResponse {
            response,
            cause: self.cause,
        }
    }
}


//------------ HttpResponse --------------------------------------------------

#[derive(Debug)]
pub struct HttpResponse {
    response: HyperResponse,
    cause: Option<Error>,
}

impl HttpResponse {
    pub fn into_hyper(self) -> HyperResponse {
        self.response
    }

    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    /// The error this response reports, if any.
    ///
    /// Used for logging, the body might be JSON or XML.
    pub fn cause(&self) -> Option<&Error> {
        self.cause.as_ref()
    }

    fn ok_response(content_type: ContentType, body: impl Into<Bytes>) -> Self {
        Response {
            status: StatusCode::OK,
            content_type,
            body: body.into(),
            cause: None,
        }
        .finalize()
    }

    pub fn json<O: Serialize>(object: &O) -> Self {
        match serde_json::to_string(object) {
            Ok(json) => Self::ok_response(ContentType::Json, json),
            Err(e) => Self::response_from_error(Error::JsonError(e)),
        }
    }

    pub fn text(body: impl Into<Bytes>) -> Self {
        Self::ok_response(ContentType::Text, body)
    }

    pub fn xml(body: impl Into<Bytes>) -> Self {
        Self::ok_response(ContentType::Xml, body)
    }

    /// The JSON error response for the REST interface.
    pub fn response_from_error(error: Error) -> Self {
        let status = error.status();
        let body = match serde_json::to_string(&error.to_error_response()) {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                error!("Cannot serialize error response: {e}");
                Bytes::default()
            }
        };
        Response {
            status,
            content_type: ContentType::Json,
            body,
            cause: Some(error),
        }
        .finalize()
    }

    /// The error response for the legacy XML interface.
    ///
    /// Legacy clients look at the status in the envelope only, so the HTTP
    /// status is always 200.
    pub fn xml_from_error(error: Error) -> Self {
        match XmlResponse::render_error(&error) {
            Ok(body) => Response {
                status: StatusCode::OK,
                content_type: ContentType::Xml,
                body: body.into(),
                cause: Some(error),
            }
            .finalize(),
            Err(e) => Self::response_from_error(Error::XmlError(e)),
        }
    }

    pub fn ok() -> Self {
        Response::new(StatusCode::OK).finalize()
    }

    pub fn not_found() -> Self {
        Response::new(StatusCode::NOT_FOUND).finalize()
    }

    pub fn method_not_allowed() -> Self {
        Response::new(StatusCode::METHOD_NOT_ALLOWED).finalize()
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_string(res: HttpResponse) -> String {
        let bytes = res.into_hyper().into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn error_response_is_json_with_status() {
        let res = HttpResponse::response_from_error(Error::validation("bad"));
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(res.cause().is_some());
        let body = body_string(res).await;
        assert!(body.contains("\"code\":2100"), "{body}");
    }

    #[tokio::test]
    async fn legacy_error_is_xml_envelope() {
        let res = HttpResponse::xml_from_error(
            Error::AuthenticationFailure("no".into())
        );
        assert_eq!(res.status(), StatusCode::OK);
        let body = body_string(res).await;
        let parsed = XmlResponse::parse("test", &body).unwrap();
        assert!(matches!(parsed, XmlResponse::AuthFailure(_)));
    }

    #[test]
    fn unauthorized_asks_for_basic_auth() {
        let res = HttpResponse::response_from_error(
            Error::AuthenticationFailure("no".into())
        ).into_hyper();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert!(res.headers().contains_key(WWW_AUTHENTICATE));
    }
}
