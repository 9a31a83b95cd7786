//! Postgres-backed store: connection pool, migrations, health check and
//! the per-shard critical section.

pub mod cron;
pub mod work;

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};
use crate::shard::{Shard, Sharding};

/// Advisory lock class shared by all shard locks.
const SHARD_LOCK_CLASS: i32 = 0x686b_71;

/// Connection options for [`Db`].
#[derive(Debug, Clone)]
pub struct DbOptions {
    pub sharding: Sharding,
    pub max_connections: u32,
    /// Serialise all database access through a single permit.
    pub single_connection: bool,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            sharding: Sharding::single(),
            max_connections: 10,
            single_connection: false,
        }
    }
}

/// Database handle. Owns the connection pool shared across all workers.
pub struct Db {
    pool: PgPool,
    sharding: Sharding,
    gate: Option<Arc<Semaphore>>,
}

/// A transaction holding a shard's advisory lock until commit or rollback.
pub(crate) struct ShardTx {
    pub(crate) tx: Transaction<'static, Postgres>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl ShardTx {
    pub(crate) async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str, options: DbOptions) -> Result<Self> {
        let max_connections = if options.single_connection {
            1
        } else {
            options.max_connections
        };
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self {
            pool,
            sharding: options.sharding,
            gate: options
                .single_connection
                .then(|| Arc::new(Semaphore::new(1))),
        })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        let _permit = self.acquire().await?;
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Wait for the connection permit in single-connection mode.
    pub(crate) async fn acquire(&self) -> Result<Option<OwnedSemaphorePermit>> {
        match &self.gate {
            Some(gate) => Arc::clone(gate)
                .acquire_owned()
                .await
                .map(Some)
                .map_err(|e| Error::Other(format!("connection gate closed: {e}"))),
            None => Ok(None),
        }
    }

    /// Open a transaction without taking any shard lock.
    pub(crate) async fn begin(&self) -> Result<ShardTx> {
        let permit = self.acquire().await?;
        let tx = self.pool.begin().await?;
        Ok(ShardTx {
            tx,
            _permit: permit,
        })
    }

    /// Open a transaction and enter `shard`'s critical section.
    pub(crate) async fn begin_shard(&self, shard: Shard) -> Result<ShardTx> {
        let mut shard_tx = self.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
            .bind(SHARD_LOCK_CLASS)
            .bind(shard_lock_key(shard))
            .execute(&mut *shard_tx.tx)
            .await?;
        Ok(shard_tx)
    }
}

fn shard_lock_key(shard: Shard) -> i32 {
    (i32::from(shard.max_shards) << 8) | i32::from(shard.index)
}
