//! The HTTP interface of the daemon.

pub mod request;
pub mod response;
pub mod server;
pub mod tls;
