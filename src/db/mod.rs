//! Postgres access.
//!
//! One pool backs the idempotency tables, the run archive, and the pgmq
//! queues used by triggers, topics, and dead-letter queues.

pub mod idempotency;
pub mod pgmq;
pub mod runs;

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::{Error, Result};

pub use idempotency::PgIdempotencyStore;
pub use pgmq::PgmqMessage;

const MAX_CONNECTIONS: u32 = 10;

/// A run waiting this long for a connection fails its admission check
/// instead of hanging.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Db {
    pool: PgPool,
}

impl Db {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Apply `migrations/`: the shared idempotency table, the run archive,
    /// and the pgmq extension.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}
