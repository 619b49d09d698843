//! Lineage indexing daemon.
//!
//! Joins the indexing consumer group, materializes provenance events into
//! the Postgres document view, and shuts down cleanly on SIGINT. All
//! configuration comes from the environment:
//!
//! | Variable               | Default                               |
//! |------------------------|---------------------------------------|
//! | `KAFKA_BROKERS`        | `localhost:9092`                      |
//! | `LINEAGE_TOPIC`        | `provenance-events`                   |
//! | `LINEAGE_GROUP_ID`     | `lineage-index`                       |
//! | `LINEAGE_DEFAULT_SEEK` | `earliest` (`latest` to skip history) |
//! | `LINEAGE_REBUILD`      | unset (`1` to reindex from scratch)   |
//! | `DATABASE_URL`         | `postgres://localhost/lineage`        |

use anyhow::{Context, Result};
use lineage_kafka::consumer::{IndexerConfig, IndexingConsumer};
use lineage_kafka::rebalance::DefaultSeek;
use lineage_postgres::PostgresMaterializedStore;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let brokers = env_or("KAFKA_BROKERS", "localhost:9092");
    let topic = env_or("LINEAGE_TOPIC", "provenance-events");
    let group_id = env_or("LINEAGE_GROUP_ID", "lineage-index");
    let database_url = env_or("DATABASE_URL", "postgres://localhost/lineage");

    let default_seek = match env_or("LINEAGE_DEFAULT_SEEK", "earliest").as_str() {
        "latest" => DefaultSeek::Latest,
        _ => DefaultSeek::Earliest,
    };
    let rebuild = std::env::var("LINEAGE_REBUILD").is_ok_and(|v| v == "1");

    info!(%brokers, %topic, %group_id, rebuild, "Starting lineage indexer");

    let store = PostgresMaterializedStore::new_with_url(&database_url)
        .await
        .context("connecting to the document store")?;
    store.migrate().await.context("applying migrations")?;

    let config = IndexerConfig::new(&brokers, &topic, &group_id).default_seek(default_seek);
    let store = Arc::new(store);
    let (consumer, shutdown) = if rebuild {
        IndexingConsumer::consume_from_earliest(config, store)
    } else {
        IndexingConsumer::consume(config, store)
    }
    .context("joining consumer group")?;

    // The poll loop blocks; give it its own thread and keep this task free
    // to watch for the interrupt.
    let mut worker = tokio::task::spawn_blocking(move || consumer.run());

    tokio::select! {
        result = &mut worker => {
            result.context("indexer thread panicked")?.context("indexer failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            let _ = shutdown.send(true);
            worker
                .await
                .context("indexer thread panicked")?
                .context("indexer failed during shutdown")?;
        }
    }

    info!("Lineage indexer stopped");
    Ok(())
}
