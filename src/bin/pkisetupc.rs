use pkisetup::cli::options::Options;
use pkisetup::cli::PkisetupClient;
use pkisetup::constants::PKISETUP_CLIENT_APP;

fn main() {
    let options = Options::from_args();
    if let Err(e) = PkisetupClient::report(options) {
        eprintln!("{PKISETUP_CLIENT_APP}: {e}");
        std::process::exit(1);
    }
}
