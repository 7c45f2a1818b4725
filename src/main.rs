//! switchboard: a multiplexed TCP message server
//!
//! Clients exchange length-prefixed frames that start with a fixed marker.
//! One thread multiplexes every socket; a second reassembles frames and
//! hands each one to the responder registered for its command.
//!
//! Features:
//! - Greeting frame on connect
//! - Echo and ping responders
//! - Resynchronisation on corrupt input (lenient or strict)
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocol;
mod responders;
mod runtime;

use config::Config;
use responders::ResponderTable;
use runtime::Runtime;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How often the main thread checks that the runtime is still running.
const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_millis(500);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        max_body_size = config.max_body_size,
        resync = ?config.resync,
        flush = ?config.flush,
        "Starting switchboard server"
    );

    let runtime = match Runtime::start(&config, ResponderTable::with_defaults()) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start");
            return Err(e.into());
        }
    };
    info!(addr = %runtime.local_addr(), "Listening");

    wait_for_shutdown(&runtime)?;
    info!(connections = runtime.registry().len(), "Stopping");

    runtime.stop();
    runtime.join()?;
    info!("Server stopped");
    Ok(())
}

/// Block until Ctrl-C, or until the runtime's threads exit on their own.
fn wait_for_shutdown(runtime: &Runtime) -> std::io::Result<()> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(async {
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);
            let mut ticker = tokio::time::interval(LIVENESS_CHECK_INTERVAL);

            loop {
                tokio::select! {
                    result = &mut ctrl_c => {
                        info!("Shutdown requested");
                        return result;
                    }
                    _ = ticker.tick() => {
                        if !runtime.is_alive() {
                            warn!("Runtime exited unexpectedly");
                            return Ok(());
                        }
                    }
                }
            }
        })
}
