//! Cron job persistence. The row lock taken by `select_and_lock_cron_job`
//! is what keeps two cron workers from firing the same occurrence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::ShardTx;
use super::work::insert_work_item;
use crate::error::{Error, Result};
use crate::model::{CronJobInfo, NewWorkItem};
use crate::shard::Sharding;
use crate::store::CronTransaction;

pub(crate) struct PgCronTransaction {
    inner: ShardTx,
    sharding: Sharding,
}

impl PgCronTransaction {
    pub(crate) fn new(inner: ShardTx, sharding: Sharding) -> Self {
        Self { inner, sharding }
    }
}

#[async_trait]
impl CronTransaction for PgCronTransaction {
    async fn create_cron_job(&mut self, name: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO cron_job (cron_job_name, last_ran_at, active)
             VALUES ($1, $2, TRUE)
             ON CONFLICT (cron_job_name) DO NOTHING",
        )
        .bind(name)
        .bind(DateTime::<Utc>::UNIX_EPOCH)
        .execute(&mut *self.inner.tx)
        .await?;
        Ok(())
    }

    async fn select_and_lock_cron_job(&mut self, name: &str) -> Result<CronJobInfo> {
        let row: Option<(String, DateTime<Utc>, bool)> = sqlx::query_as(
            "SELECT cron_job_name, last_ran_at, active FROM cron_job
             WHERE cron_job_name = $1
             FOR UPDATE",
        )
        .bind(name)
        .fetch_optional(&mut *self.inner.tx)
        .await?;

        let (name, last_ran_at, active) =
            row.ok_or_else(|| Error::NotFound(format!("cron job {name}")))?;
        Ok(CronJobInfo {
            name,
            last_ran_at,
            active,
        })
    }

    async fn update_cron_job_last_ran_at(&mut self, name: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE cron_job SET last_ran_at = $2 WHERE cron_job_name = $1")
            .bind(name)
            .bind(at)
            .execute(&mut *self.inner.tx)
            .await?;
        Ok(())
    }

    async fn enqueue_work_item(&mut self, item: NewWorkItem) -> Result<()> {
        let prepared = item.prepare(&self.sharding)?;
        insert_work_item(&mut self.inner.tx, prepared, Utc::now()).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.inner.commit().await
    }
}
