use clap::Parser;
use parley_hub::{Cli, HubServer};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let config = Cli::parse().into_config();
    let server = match HubServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            log::error!("failed to start: {e}");
            return ExitCode::FAILURE;
        }
    };
    let listener = match server.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    match server.serve(listener, shutdown).await {
        Ok(()) => {
            log::info!("hub stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("server error: {e}");
            ExitCode::FAILURE
        }
    }
}
