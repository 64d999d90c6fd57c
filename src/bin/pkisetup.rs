use std::process;
use std::sync::Arc;
use clap::Parser;
use log::error;
use pkisetup::config::Config;
use pkisetup::constants::{PKISETUP_DEFAULT_CONFIG_FILE, PKISETUP_SERVER_APP};
use pkisetup::daemon::start::start_pkisetup_daemon;


/// The command line arguments of the daemon.
#[derive(clap::Parser)]
#[command(
    version,
    about = "Serves the configuration of a PKI subsystem.",
    long_about = "Serves the configuration of a PKI subsystem.\n\n\
        Directory data is kept by the built-in directory, a JSON snapshot \
        file set by `directory_snapshot` in the config file. The daemon \
        does not connect to an external LDAP server.",
)]
struct Args {
    /// Override the path to the config file
    #[arg(
        short, long,
        value_name = "path",
        default_value = PKISETUP_DEFAULT_CONFIG_FILE,
    )]
    config: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match Config::create(&args.config) {
        Ok(config) => {
            if let Err(e) = start_pkisetup_daemon(Arc::new(config), None).await {
                error!("{PKISETUP_SERVER_APP} failed to start: {e}");
                eprintln!("{PKISETUP_SERVER_APP} failed to start: {e}");
                process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    }
}


//------------ Tests ---------------------------------------------------------
