//! Cron scheduling.
//!
//! Jobs are configured up front and validated at startup. The worker ticks
//! once a minute; each due job is re-checked under its row lock inside a
//! store transaction, so an occurrence fires at most once however many
//! workers evaluate it.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use opentelemetry::KeyValue;
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, info};

use super::poll::PollWorker;
use crate::error::{Error, Result};
use crate::model::{CronJobInfo, NewWorkItem};
use crate::store::SharedStore;
use crate::telemetry::metrics;

pub const CRON_TICK: Duration = Duration::from_secs(60);

/// Placeholder in a job URL replaced by the occurrence timestamp.
const OCCURRENCE_PLACEHOLDER: &str = "{0}";

/// One `[[cron]]` entry of the cron configuration file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CronJobConfig {
    pub name: String,
    pub url: String,
    /// 5-field (minute resolution) or 6-field (with seconds) expression.
    pub schedule: String,
    /// Queue key for the enqueued items. Defaults to the job name.
    #[serde(default)]
    pub queue: Option<String>,
    /// IANA time zone the schedule is evaluated in, e.g. `Europe/London`.
    /// Defaults to UTC.
    #[serde(default)]
    pub timezone: Option<String>,
}

/// A validated cron job.
#[derive(Debug, Clone)]
pub struct CronJob {
    name: String,
    url: String,
    queue: String,
    schedule: Schedule,
    timezone: Tz,
}

impl CronJob {
    pub fn from_config(config: CronJobConfig) -> Result<Self> {
        let parsed = Url::parse(&config.url)
            .map_err(|e| Error::Cron(format!("job {}: invalid url {}: {e}", config.name, config.url)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::Cron(format!(
                "job {}: url must be http or https, got {}",
                config.name, config.url
            )));
        }

        let schedule = parse_schedule(&config.schedule)
            .map_err(|e| Error::Cron(format!("job {}: {e}", config.name)))?;

        let timezone = match &config.timezone {
            None => Tz::UTC,
            Some(raw) => Tz::from_str(raw.trim()).map_err(|e| {
                Error::Cron(format!("job {}: invalid timezone {raw}: {e}", config.name))
            })?,
        };

        Ok(Self {
            queue: config.queue.unwrap_or_else(|| config.name.clone()),
            name: config.name,
            url: config.url,
            schedule,
            timezone,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// First occurrence strictly after `last_ran_at`.
    pub fn next_occurrence(&self, last_ran_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&last_ran_at.with_timezone(&self.timezone))
            .next()
            .map(|at| at.with_timezone(&Utc))
    }

    /// The URL enqueued for `occurrence`.
    pub fn url_for(&self, occurrence: DateTime<Utc>) -> String {
        self.url.replace(
            OCCURRENCE_PLACEHOLDER,
            &occurrence.to_rfc3339_opts(SecondsFormat::Secs, true),
        )
    }

    fn due(&self, last_ran_at: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next_occurrence(last_ran_at).filter(|next| *next < now)
    }
}

/// Accepts 5-field expressions by pinning seconds to zero.
fn parse_schedule(expr: &str) -> std::result::Result<Schedule, String> {
    let fields = expr.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| format!("invalid cron expression '{expr}': {e}"))
}

/// Validate a set of job configs. Names must be unique.
pub fn validate_cron_jobs(configs: Vec<CronJobConfig>) -> Result<Vec<CronJob>> {
    let mut seen = HashSet::new();
    let mut jobs = Vec::with_capacity(configs.len());
    for config in configs {
        if !seen.insert(config.name.clone()) {
            return Err(Error::Cron(format!("duplicate cron job name {}", config.name)));
        }
        jobs.push(CronJob::from_config(config)?);
    }
    Ok(jobs)
}

type OnFire = Box<dyn Fn() + Send + Sync>;

/// Enqueues work for due cron occurrences.
pub struct CronJobWorker {
    store: SharedStore,
    jobs: Vec<CronJob>,
    on_fire: Option<OnFire>,
}

impl CronJobWorker {
    pub fn new(store: SharedStore, jobs: Vec<CronJob>) -> Self {
        Self {
            store,
            jobs,
            on_fire: None,
        }
    }

    /// Called after a tick that enqueued at least one item.
    pub fn on_fire(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_fire = Some(Box::new(f));
        self
    }

    pub fn jobs(&self) -> &[CronJob] {
        &self.jobs
    }

    /// Evaluate every job once. Returns how many occurrences fired.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let state: HashMap<String, CronJobInfo> = self
            .store
            .get_cron_job_state()
            .await?
            .into_iter()
            .map(|info| (info.name.clone(), info))
            .collect();

        let mut fired = 0;
        for job in &self.jobs {
            let last_ran_at = state
                .get(job.name())
                .map(|info| info.last_ran_at)
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
            if job.due(last_ran_at, now).is_none() {
                continue;
            }
            if self.fire(job, now).await? {
                fired += 1;
            }
        }
        Ok(fired)
    }

    async fn fire(&self, job: &CronJob, now: DateTime<Utc>) -> Result<bool> {
        let mut tx = self.store.begin_cron_transaction().await?;
        tx.create_cron_job(job.name()).await?;
        let locked = tx.select_and_lock_cron_job(job.name()).await?;

        // Another worker may have fired this occurrence since the unlocked read.
        let Some(occurrence) = job.due(locked.last_ran_at, now) else {
            debug!(job = job.name(), "cron occurrence already fired");
            return Ok(false);
        };
        if !locked.active {
            debug!(job = job.name(), "cron job inactive");
            return Ok(false);
        }

        let url = job.url_for(occurrence);
        tx.enqueue_work_item(
            NewWorkItem::new(url.clone())
                .queue(job.queue())
                .debug_info(format!("cron:{}", job.name()))
                .duplicate_protection(true),
        )
        .await?;
        tx.update_cron_job_last_ran_at(job.name(), now).await?;
        tx.commit().await?;

        metrics::cron_triggered().add(1, &[KeyValue::new("job", job.name().to_string())]);
        info!(job = job.name(), %occurrence, %url, "cron job fired");
        Ok(true)
    }
}

#[async_trait]
impl PollWorker for CronJobWorker {
    fn name(&self) -> String {
        "cron".to_string()
    }

    fn interval(&self) -> Duration {
        CRON_TICK
    }

    fn wakeable(&self) -> bool {
        false
    }

    async fn execute_one(&self) -> Result<bool> {
        let fired = self.tick(Utc::now()).await?;
        if fired > 0 {
            if let Some(on_fire) = &self.on_fire {
                on_fire();
            }
        }
        Ok(false)
    }
}
