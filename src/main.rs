use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chronicle::{open_registry, Config};
use chronicle_replica::{NarrateOptions, OpenOptions};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            eprintln!("Required: CHRONICLE_PARTITIONS=<uri>[,<uri>...]");
            eprintln!("Optional: CHRONICLE_DB_PATH, CHRONICLE_INLINE_THRESHOLD, CHRONICLE_MAX_ATTEMPTS, CHRONICLE_RETRY_BASE_MS, CHRONICLE_COMPACT_ON_START");
            std::process::exit(1);
        }
    };

    tracing::info!("Starting Chronicle node");
    tracing::info!("Database path: {}", config.db_path.display());

    let registry = match open_registry(&config, None) {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("Database error: {}", e);
            std::process::exit(1);
        }
    };

    if config.compact_on_start {
        if let Err(e) = registry.compact_blobs().await {
            tracing::warn!("Blob compaction failed: {}", e);
        }
    }

    let options = OpenOptions {
        connect_upstream: false,
        narrate: NarrateOptions {
            remote: false,
            ..NarrateOptions::default()
        },
        ..OpenOptions::default()
    };

    let mut failed = false;
    for partition in &config.partitions {
        match registry.open_partition(partition.clone(), options.clone()).await {
            Ok((replica, _)) => {
                let ranges = replica.ranges();
                tracing::info!(
                    "{}: truths [{}, {}), {} queued commands",
                    partition,
                    ranges.truths.first,
                    ranges.truths.next,
                    ranges.commands.len()
                );
            }
            Err(e) => {
                tracing::error!("Failed to open {}: {}", partition, e);
                failed = true;
            }
        }
    }

    for partition in &config.partitions {
        registry.close_partition(partition);
    }

    if failed {
        std::process::exit(1);
    }
}
