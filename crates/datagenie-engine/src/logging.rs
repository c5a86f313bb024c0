//! Tracing bootstrap and log-safe identifiers

use crate::config::{LogFormat, LoggingConfig};
use sha2::{Digest, Sha256};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Install the global tracing subscriber.
///
/// If `RUST_LOG` is set it is used as-is; otherwise every datagenie crate logs
/// at the configured level and noisy dependencies are held at `warn`.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::try_from_default_env()?
    } else {
        EnvFilter::try_new(default_filter(&config.level))?
    };

    let fmt_layer = match config.format {
        LogFormat::Full => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}

fn default_filter(level: &str) -> String {
    format!(
        "datagenie_engine={level},\
         datagenie_query={level},\
         datagenie_query_postgres={level},\
         datagenie_query_sqlite={level},\
         tokio_postgres=warn,\
         rusqlite=warn,\
         reqwest=warn,\
         hyper=warn,\
         h2=warn,\
         rustls=warn",
        level = level
    )
}

/// Short, stable identifier for text that must not appear in logs verbatim
/// (questions, generated queries).
pub fn log_digest(text: &str) -> String {
    let digest = hex::encode(Sha256::digest(text.as_bytes()));
    digest[..16].to_string()
}
