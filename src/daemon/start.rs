use std::net::SocketAddr;
use std::sync::Arc;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use log::{debug, error, info};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;
use crate::commons::error::{Error, SetupIoError};
use crate::config::{Config, HttpsMode};
use crate::crypto::softtoken::SoftToken;
use crate::database::task::TaskPoller;
use crate::directory::memory::MemoryDirectory;
use crate::directory::DirectoryFactory;
use crate::domain::service::{MemorySessionTable, SecurityDomainService};
use crate::remote::RemoteAdminClient;
use crate::store::ConfigStore;
use crate::wizard::ConfigurationOrchestrator;
use super::http::server::HttpServer;
use super::http::tls::TlsFiles;


/// The name of the software token holding the system keys.
const TOKEN_NAME: &str = "internal";


/// Runs the daemon until it is interrupted.
///
/// If given, `signal_running` is triggered once the listener is bound.
pub async fn start_pkisetup_daemon(
    config: Arc<Config>,
    mut signal_running: Option<oneshot::Sender<()>>,
) -> Result<(), Error> {
    let server = Arc::new(build_server(config.clone())?);
    let tls = tls_acceptor(&config)?;

    let addr = config.socket_addr();
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        Error::IoError(SetupIoError::new(format!("Could not bind to {addr}"), e))
    })?;
    info!(
        "Serving {} configuration on {}://{addr}",
        server.kind(),
        if tls.is_some() { "https" } else { "http" }
    );

    if let Some(tx) = signal_running.take() {
        let _ = tx.send(());
    }

    loop {
        select! {
            accepted = listener.accept() => {
                let (stream, remote_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        error!("Fatal error in HTTP server {addr}: {err}");
                        server.shutdown();
                        return Err(Error::IoError(SetupIoError::new(
                            format!("accepting on {addr}"), err
                        )));
                    }
                };
                tokio::spawn(serve_connection(
                    server.clone(), stream, remote_addr, tls.clone()
                ));
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                server.shutdown();
                return Ok(());
            }
        }
    }
}

/// Assembles the server from the configured instance.
pub fn build_server(config: Arc<Config>) -> Result<HttpServer, Error> {
    let store = ConfigStore::load(&config.instance_config())?;
    let token = SoftToken::open(TOKEN_NAME, &config.token_dir())?;
    let directories: Arc<dyn DirectoryFactory> =
        Arc::new(MemoryDirectory::open(&config.directory_snapshot())?);

    let wizard = ConfigurationOrchestrator::new(
        store,
        Arc::new(token),
        RemoteAdminClient::http(config.client_options()),
        directories.clone(),
    )
    .with_profiles_dir(config.profiles_dir.clone())
    .with_ldif_dir(config.ldif_dir.clone())
    .with_poller(TaskPoller::new(config.task_policy()))
    .with_restart_marker(config.restart_marker());

    let domain = SecurityDomainService::new(
        directories,
        Arc::new(MemorySessionTable::new(config.install_token_ttl())),
    );

    HttpServer::new(config, wizard, domain)
}

fn tls_acceptor(config: &Config) -> Result<Option<TlsAcceptor>, Error> {
    match config.https_mode {
        HttpsMode::Disable => Ok(None),
        HttpsMode::Existing => {
            let files = TlsFiles::from_config(config).ok_or_else(|| {
                Error::HttpsSetup(
                    "tls_key_file and tls_cert_file are required".into()
                )
            })?;
            let tls_config = files
                .server_config()
                .map_err(|e| Error::HttpsSetup(e.to_string()))?;
            Ok(Some(TlsAcceptor::from(Arc::new(tls_config))))
        }
    }
}

async fn serve_connection(
    server: Arc<HttpServer>,
    stream: TcpStream,
    remote_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
) {
    let service = service_fn(move |req| {
        let server = server.clone();
        async move { server.process_request(req, remote_addr).await }
    });
    let builder = auto::Builder::new(TokioExecutor::new());

    let res = match tls {
        Some(tls) => match tls.accept(stream).await {
            Ok(stream) => {
                builder.serve_connection(TokioIo::new(stream), service).await
            }
            Err(err) => {
                debug!("TLS handshake with {remote_addr} failed: {err}");
                return;
            }
        },
        None => builder.serve_connection(TokioIo::new(stream), service).await,
    };
    if let Err(err) = res {
        debug!("Connection with {remote_addr} ended with error: {err}");
    }
}
