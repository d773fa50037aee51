//! unistore: standalone storage node
//!
//! Opens the configured database, runs the background pruner and garbage
//! collector, and logs every committed write seen by the watch until
//! interrupted.
//!
//! ## Configuration
//! - UNISTORE_CONFIG: Path to a YAML config file (optional)
//! - UNISTORE_STORAGE__DATABASE_URL: Database URL (default: sqlite::memory:)
//! - UNISTORE_BACKEND__HIGH_AVAILABILITY: Watch by polling the database
//! - UNISTORE_LOG: Log filter (default: info)

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use unistore::config::Config;
use unistore::storage::Backend;
use unistore::utils::bootstrap::{connect_with_retry, init_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;

    let (pool, dialect) = connect_with_retry(&config.storage).await?;
    let backend = Backend::new(pool, dialect, config.backend).await?;

    let cancel = CancellationToken::new();
    let mut events = backend.watch_write_events(cancel.clone()).await?;

    info!(dialect = dialect.name(), "unistore started");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            event = events.recv() => match event {
                Some(event) => info!(
                    key = %event.key,
                    event_type = ?event.event_type,
                    rv = event.resource_version,
                    "Write"
                ),
                None => {
                    warn!("Watch stream closed");
                    break;
                }
            },
        }
    }

    cancel.cancel();
    backend.stop().await;
    Ok(())
}
