//! The _pkisetup_ library crate.
//!
//! Drives the installation of a PKI subsystem instance: system certificate
//! issuance, security domain enrollment, directory provisioning and the
//! resumable configuration workflow tying these together.

pub mod api;
pub mod certs;
pub mod cli;
pub mod commons;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod daemon;
pub mod database;
pub mod directory;
pub mod domain;
pub mod remote;
pub mod store;
pub mod users;
pub mod wizard;
