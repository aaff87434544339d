use market_pulse_lib::logging::init_logging;
use tracing::error;

#[tokio::main]
async fn main() {
    init_logging();

    if let Err(error) = market_pulse_lib::run().await {
        error!(%error, "market-pulse exited with error");
        std::process::exit(1);
    }
}
