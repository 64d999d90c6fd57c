//! The options for the `pkisetupc` client.

use std::path::PathBuf;
use clap::Parser;
use url::Url;
use crate::constants::PKISETUP_CLI_SERVER_ENV;
use crate::domain::SubsystemType;
use super::report::ReportFormat;


//------------ Options -------------------------------------------------------

/// The command line options for the client.
#[derive(clap::Parser)]
#[command(
    version,
    about = "Configures PKI subsystems through a pkisetup daemon.",
)]
pub struct Options {
    #[command(flatten)]
    pub general: GeneralOptions,

    #[command(subcommand)]
    pub command: Command,
}

impl Options {
    /// Creates the options from the process arguments.
    ///
    /// If the arguments won't result in usable options, exits the process.
    pub fn from_args() -> Self {
        Self::parse()
    }
}


//------------ GeneralOptions ------------------------------------------------

#[derive(clap::Args)]
pub struct GeneralOptions {
    /// The full URI to the pkisetup daemon.
    #[arg(
        short, long,
        env = PKISETUP_CLI_SERVER_ENV,
        default_value = "https://localhost:8443/"
    )]
    pub server: Url,

    /// Report format
    #[arg(short, long, default_value = "text")]
    pub format: ReportFormat,

    /// Accept any certificate presented by the server.
    #[arg(long)]
    pub insecure: bool,
}


//------------ Command -------------------------------------------------------

#[derive(clap::Subcommand)]
pub enum Command {
    /// Configure the instance from a JSON request file.
    Configure(Configure),

    /// Obtain an install token from a security domain.
    InstallToken(InstallToken),

    /// Show the hosts of the security domain.
    DomainInfo,

    /// Show the security domain in its legacy XML form.
    DomainXml,
}


//------------ Configure -----------------------------------------------------

#[derive(clap::Args)]
pub struct Configure {
    /// Path to the JSON configuration request.
    #[arg(long, short = 'i', value_name = "path")]
    pub file: PathBuf,

    /// The type of the subsystem to configure.
    #[arg(long, default_value = "ca", value_parser = parse_subsystem)]
    pub subsystem: SubsystemType,
}


//------------ InstallToken --------------------------------------------------

#[derive(clap::Args)]
pub struct InstallToken {
    /// The host name the token is for.
    #[arg(long)]
    pub hostname: String,

    /// The type of the subsystem the token is for.
    #[arg(long, value_parser = parse_subsystem)]
    pub subsystem: SubsystemType,

    /// A security domain administrator.
    #[arg(long)]
    pub user: String,

    /// The administrator's password, asked for if missing.
    #[arg(long)]
    pub password: Option<String>,
}

fn parse_subsystem(s: &str) -> Result<SubsystemType, String> {
    s.parse().map_err(|e: crate::commons::error::Error| e.to_string())
}


//============ Tests =========================================================
