use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use guestproc::config::LOG_ENV;
use guestproc_broker::host::LinuxHost;
use guestproc_broker::{server, BrokerConfig, BrokerError, Limits, Registry};

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or(LOG_ENV, "warn")).init();

    let config = BrokerConfig::parse();
    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("guestproc-broker: {e}");
            e.exit_code()
        }
    }
}

fn run(config: &BrokerConfig) -> Result<(), BrokerError> {
    config.validate()?;
    let listener = server::bind(&config.socket)?;
    log::info!(
        "[server] listening on {} (max transfer {}, max processes {})",
        config.socket.display(),
        config.max_transfer,
        config.max_processes
    );
    let registry = Arc::new(Registry::new(Limits::from(config), Arc::new(LinuxHost)));
    server::serve(listener, registry)
}
