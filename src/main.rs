use std::time::Duration;

use lfs_gateway::config::GatewayConfig;
use lfs_gateway::error::Error;
use lfs_gateway::observability::init_observability;
use lfs_gateway::run_server;
use tokio::runtime::Runtime;
use tokio::signal;
use tracing::{error, info};

fn main() -> Result<(), Error> {
    dotenv::dotenv().ok();

    let config = GatewayConfig::new()?;
    let runtime = Runtime::new()?;

    let result = runtime.block_on(async {
        let _observability = init_observability(config.otlp_enabled)?;

        info!("Starting LFS Gateway");

        let result = tokio::select! {
            result = run_server(config) => result,
            signal = signal::ctrl_c() => signal.map_err(Error::from),
        };

        match &result {
            Ok(()) => info!("Shutting Down LFS Gateway"),
            Err(error) => error!(%error, "LFS Gateway stopped"),
        }

        result
    });

    runtime.shutdown_timeout(Duration::from_secs(10));

    result
}
