//! The `pkisetup` daemon.

pub mod http;
pub mod start;
