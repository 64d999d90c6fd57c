//! Routing of requests to the configuration wizard and the security domain.
//!
//! The wizard and the domain service are blocking, so every request doing
//! real work is handed to the blocking thread pool. Both share the
//! configuration store which lives inside the orchestrator, hence the
//! mutex. A configure request never waits for it: a second configuration
//! while one is running is rejected.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, TryLockError};
use hyper::{Method, StatusCode};
use log::{debug, error, info, warn};
use crate::api::{ConfigurationRequest, ConfigurationResponse, InstallToken};
use crate::commons::error::Error;
use crate::commons::xml::XmlElement;
use crate::commons::SetupResult;
use crate::config::Config;
use crate::database::task::TaskPoller;
use crate::domain::service::SecurityDomainService;
use crate::domain::{DomainInfo, SubsystemType};
use crate::remote::response::XmlResponse;
use crate::remote::{HostRegistration, RangeKind};
use crate::store::ConfigStore;
use crate::wizard::ConfigurationOrchestrator;
use super::request::{HyperRequest, Request};
use super::response::{HttpResponse, HyperResponse};


//------------ HttpServer ----------------------------------------------------

pub struct HttpServer {
    config: Arc<Config>,
    kind: SubsystemType,
    wizard: Arc<Mutex<ConfigurationOrchestrator>>,
    domain: Arc<SecurityDomainService>,
    poller: TaskPoller,
}

impl HttpServer {
    /// Creates the server for an orchestrator.
    ///
    /// The orchestrator's store must name the subsystem type already.
    pub fn new(
        config: Arc<Config>,
        wizard: ConfigurationOrchestrator,
        domain: SecurityDomainService,
    ) -> SetupResult<Self> {
        let kind = wizard.kind()?;
        let poller = wizard.poller().clone();
        Ok(HttpServer {
            config,
            kind,
            wizard: Arc::new(Mutex::new(wizard)),
            domain: Arc::new(domain),
            poller,
        })
    }

    pub fn kind(&self) -> SubsystemType {
        self.kind
    }

    /// Aborts waiting for directory tasks of a running configuration.
    pub fn shutdown(&self) {
        self.poller.cancel()
    }

    pub async fn process_request(
        &self, req: HyperRequest, remote_addr: SocketAddr,
    ) -> Result<HyperResponse, Infallible> {
        let request = Request::new(req, remote_addr, self.config.post_limit_api);
        let method = request.method().clone();
        let path = request.path().to_string();
        let agent = request.user_agent().unwrap_or_else(|| "-".into());

        let response = self.dispatch(request).await;

        let status = response.status();
        match response.cause() {
            Some(err) if status.is_server_error() => {
                error!("{method} {path} from {remote_addr} ({agent}): {status}: {err}")
            }
            Some(err) => {
                warn!("{method} {path} from {remote_addr} ({agent}): {status}: {err}")
            }
            None if status == StatusCode::OK => {
                debug!("{method} {path} from {remote_addr} ({agent}): {status}")
            }
            None => info!("{method} {path} from {remote_addr} ({agent}): {status}"),
        }
        Ok(response.into_hyper())
    }

    async fn dispatch(&self, request: Request) -> HttpResponse {
        let path = request.path().trim_matches('/').to_string();
        let segments: Vec<&str> = path.split('/').collect();

        match segments.as_slice() {
            ["health"] => {
                if request.method() == Method::GET {
                    HttpResponse::ok()
                } else {
                    HttpResponse::method_not_allowed()
                }
            }
            [subsystem, "rest", "installer", "configure"] => {
                json_response(self.configure(request, subsystem).await)
            }
            ["ca", "rest", "securityDomain", "installToken"] => {
                json_response(self.install_token(request).await)
            }
            ["ca", "rest", "securityDomain", "domainInfo"] => {
                json_response(self.domain_info(request).await)
            }
            ["ca", "admin", "ca", "getDomainXML"] => {
                xml_response(self.domain_xml(request).await)
            }
            ["ca", "admin" | "agent", "ca", "updateDomainXML"] => {
                xml_response(self.update_domain_xml(request).await)
            }
            ["ca", "admin", "ca", "getConfigEntries"] => {
                xml_response(self.config_entries(request).await)
            }
            ["ca", "admin", "ca", "updateNumberRange"] => {
                xml_response(self.number_range(request).await)
            }
            _ => HttpResponse::not_found(),
        }
    }


    //--- Configuration

    async fn configure(
        &self, request: Request, subsystem: &str,
    ) -> SetupResult<ConfigurationResponse> {
        if !subsystem.eq_ignore_ascii_case(self.kind.lower()) {
            return Err(Error::ApiUnknownResource);
        }
        check_method(&request, Method::POST)?;
        let req: ConfigurationRequest = request.json().await?;

        let wizard = self.wizard.clone();
        blocking(move || {
            let mut wizard = match wizard.try_lock() {
                Ok(wizard) => wizard,
                Err(TryLockError::WouldBlock) => {
                    return Err(Error::ConfigurationInProgress)
                }
                Err(TryLockError::Poisoned(_)) => {
                    return Err(Error::custom("configuration state is poisoned"))
                }
            };
            wizard.configure(&req)
        })
        .await
    }


    //--- Security domain, REST

    async fn install_token(&self, request: Request) -> SetupResult<InstallToken> {
        self.check_domain()?;
        check_method(&request, Method::GET)?;
        let (user, password) = request.basic_auth().ok_or_else(|| {
            Error::AuthenticationFailure("missing credentials".into())
        })?;
        let hostname = required(request.query_param("hostname"), "hostname")?;
        let subsystem: SubsystemType =
            required(request.query_param("subsystem"), "subsystem")?.parse()?;
        let source_ip = request.remote_ip();

        let token = self
            .with_store(move |domain, store| {
                domain.get_install_token(
                    store, &user, &password, &source_ip, &hostname, subsystem,
                )
            })
            .await?;
        Ok(InstallToken::new(token))
    }

    async fn domain_info(
        &self, request: Request,
    ) -> SetupResult<DomainInfo> {
        self.check_domain()?;
        check_method(&request, Method::GET)?;
        self.with_store(|domain, store| domain.get_domain_info(store)).await
    }


    //--- Security domain, legacy XML

    async fn domain_xml(&self, request: Request) -> SetupResult<Vec<XmlElement>> {
        self.check_domain()?;
        check_method(&request, Method::GET)?;
        let info = self
            .with_store(|domain, store| domain.get_domain_info(store))
            .await?;
        Ok(vec![info.to_xml()])
    }

    async fn update_domain_xml(
        &self, request: Request,
    ) -> SetupResult<Vec<XmlElement>> {
        self.check_domain()?;
        check_method(&request, Method::POST)?;
        let fields = request.form().await?;
        let registration = HostRegistration::from_form(&fields)?;
        let session_id = required(fields.get("sessionID").cloned(), "sessionID")?;

        self.with_store(move |domain, store| {
            domain.update_domain(store, &registration, &session_id)
        })
        .await?;
        Ok(Vec::new())
    }

    async fn config_entries(
        &self, request: Request,
    ) -> SetupResult<Vec<XmlElement>> {
        self.check_domain()?;
        check_method(&request, Method::POST)?;
        let fields = request.form().await?;
        let session_id = required(fields.get("sessionID").cloned(), "sessionID")?;
        let names: Vec<String> = fields
            .get("names")
            .map(|names| {
                names
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let entries = self
            .with_store(move |domain, store| {
                domain.get_config_entries(store, &names, &session_id)
            })
            .await?;
        Ok(vec![entries.to_xml()])
    }

    async fn number_range(
        &self, request: Request,
    ) -> SetupResult<Vec<XmlElement>> {
        self.check_domain()?;
        check_method(&request, Method::POST)?;
        let fields = request.form().await?;
        let session_id = required(fields.get("sessionID").cloned(), "sessionID")?;
        let kind: RangeKind = required(fields.get("type").cloned(), "type")?.parse()?;

        let range = self
            .with_store(move |domain, store| {
                domain.update_number_range(store, kind, &session_id)
            })
            .await?;
        Ok(range.to_xml())
    }


    //--- Helpers

    /// Only a CA hosts a security domain.
    fn check_domain(&self) -> SetupResult<()> {
        if self.kind == SubsystemType::Ca {
            Ok(())
        } else {
            Err(Error::ApiUnknownResource)
        }
    }

    /// Runs `op` with the configuration store on the blocking pool.
    async fn with_store<T, F>(&self, op: F) -> SetupResult<T>
    where
        F: FnOnce(&SecurityDomainService, &mut ConfigStore) -> SetupResult<T>
            + Send + 'static,
        T: Send + 'static,
    {
        let wizard = self.wizard.clone();
        let domain = self.domain.clone();
        blocking(move || {
            let mut wizard = wizard.lock().map_err(|_| {
                Error::custom("configuration state is poisoned")
            })?;
            op(&domain, wizard.store_mut())
        })
        .await
    }
}


//------------ Helper Functions ----------------------------------------------

async fn blocking<T, F>(op: F) -> SetupResult<T>
where
    F: FnOnce() -> SetupResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| Error::custom(format!("worker thread failed: {e}")))?
}

fn check_method(request: &Request, method: Method) -> SetupResult<()> {
    if request.method() == method {
        Ok(())
    } else {
        Err(Error::ApiUnknownMethod)
    }
}

fn required(value: Option<String>, name: &str) -> SetupResult<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| Error::validation(format!("missing parameter '{name}'")))
}

fn json_response<T: serde::Serialize>(res: SetupResult<T>) -> HttpResponse {
    match res {
        Ok(value) => HttpResponse::json(&value),
        Err(err) => HttpResponse::response_from_error(err),
    }
}

fn xml_response(res: SetupResult<Vec<XmlElement>>) -> HttpResponse {
    let body = res.and_then(|values| {
        XmlResponse::render_success(values).map_err(Error::from)
    });
    match body {
        Ok(body) => HttpResponse::xml(body),
        Err(err) => HttpResponse::xml_from_error(err),
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_rejects_blank_values() {
        assert_eq!(required(Some("x".into()), "a").unwrap(), "x");
        assert!(matches!(
            required(Some("  ".into()), "a"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(required(None, "a"), Err(Error::Validation(_))));
    }

    #[test]
    fn xml_response_wraps_values() {
        let res = xml_response(Ok(vec![XmlElement::with_text("beginNumber", "1")]));
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.cause().is_none());

        let res = xml_response(Err(Error::unauthorized("expired")));
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.cause().is_some());
    }

    #[tokio::test]
    async fn blocking_returns_result() {
        assert_eq!(blocking(|| Ok(42)).await.unwrap(), 42);
        assert!(blocking::<(), _>(|| Err(Error::AlreadyConfigured)).await.is_err());
    }
}
