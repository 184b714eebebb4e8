use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::fmt::{Debug, Formatter};
use std::str::FromStr;
use tracing::{info_span, Instrument};

pub mod error;
pub mod reader;

pub use error::{PartialFetchError, StorageError};
pub use reader::{PostgresReader, SpanReader};

#[derive(clap::Parser)]
pub struct DbConfig {
    #[clap(long, env = "DATABASE_URL")]
    pub url: String,
    #[clap(long, env, default_value_t = 10)]
    pub max_db_connections: u16,
}

impl Debug for DbConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // url carries credentials, only show the tail (db name and port)
        let url_tail: String = self
            .url
            .chars()
            .rev()
            .take(12)
            .collect::<String>()
            .chars()
            .rev()
            .collect();
        f.debug_struct("DbConfig")
            .field("max_db_connections", &self.max_db_connections)
            .field("url", &format!("...{url_tail}"))
            .finish()
    }
}

pub async fn connect_to_db(config: &DbConfig) -> Result<PgPool, StorageError> {
    let options = PgConnectOptions::from_str(&config.url)
        .map_err(|e| StorageError::from_sqlx_error(e, "parsing the database url"))?;
    let con = PgPoolOptions::new()
        .max_connections(u32::from(config.max_db_connections))
        .connect_with(options)
        .instrument(info_span!("Connecting to the DB"))
        .await
        .map_err(|e| StorageError::from_sqlx_error(e, "connecting to the database"))?;
    Ok(con)
}
