//! Cron-driven sync jobs. Each job skips a tick while its previous run is
//! still going.

use std::sync::Arc;

use anyhow::{Context, Result};
use erpsync_core::SyncFilters;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::engine::SyncEngine;

/// Per-job overlap guard.
#[derive(Debug, Clone, Default)]
pub struct OverlapGuard {
    running: Arc<Mutex<()>>,
}

impl OverlapGuard {
    pub fn try_enter(&self) -> Option<OwnedMutexGuard<()>> {
        self.running.clone().try_lock_owned().ok()
    }
}

pub fn entity_job(engine: Arc<SyncEngine>, entity: String, cron: &str) -> Result<Job> {
    let guard = OverlapGuard::default();
    let label = entity.clone();
    Job::new_async(cron, move |_uuid, _l| {
        let engine = engine.clone();
        let entity = entity.clone();
        let guard = guard.clone();
        Box::pin(async move {
            let Some(_running) = guard.try_enter() else {
                warn!(entity = %entity, "previous run still active, skipping tick");
                return;
            };
            let result = engine.run_sync(&entity, SyncFilters::none()).await;
            if result.success {
                info!(
                    entity = %entity,
                    rows = result.total_rows_processed,
                    batches = result.total_batches_written,
                    "scheduled sync completed"
                );
            } else {
                error!(
                    entity = %entity,
                    error = result.failure.as_ref().map(|f| f.error.as_str()).unwrap_or(""),
                    "scheduled sync failed"
                );
            }
        })
    })
    .with_context(|| format!("creating scheduler job for {label} with cron {cron}"))
}

pub fn delete_job(engine: Arc<SyncEngine>, cron: &str) -> Result<Job> {
    let guard = OverlapGuard::default();
    Job::new_async(cron, move |_uuid, _l| {
        let engine = engine.clone();
        let guard = guard.clone();
        Box::pin(async move {
            let Some(_running) = guard.try_enter() else {
                warn!("previous delete sync still active, skipping tick");
                return;
            };
            let result = engine.run_delete_sync().await;
            if result.success {
                info!(
                    deleted = result.total_deleted,
                    examined = result.total_examined,
                    "scheduled delete sync completed"
                );
            } else {
                error!(
                    error = result.failure.as_ref().map(|f| f.error.as_str()).unwrap_or(""),
                    "scheduled delete sync failed"
                );
            }
        })
    })
    .with_context(|| format!("creating delete sync job with cron {cron}"))
}

/// One job per scheduled entity plus the delete feed. The scheduler is
/// returned unstarted.
pub async fn build_scheduler(engine: Arc<SyncEngine>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let mut jobs = 0usize;

    for descriptor in &engine.registry().entities {
        let Some(cron) = descriptor.schedule.as_deref() else {
            continue;
        };
        let job = entity_job(engine.clone(), descriptor.name.clone(), cron)
            .with_context(|| format!("scheduling {}", descriptor.name))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(entity = %descriptor.name, cron, "sync job scheduled");
        jobs += 1;
    }

    if let Some(cron) = engine
        .registry()
        .delete_feed
        .as_ref()
        .and_then(|f| f.schedule.as_deref())
    {
        sched
            .add(delete_job(engine.clone(), cron)?)
            .await
            .context("adding delete sync job")?;
        info!(cron, "delete sync job scheduled");
        jobs += 1;
    }

    if jobs == 0 {
        warn!("no entity carries a schedule; scheduler has nothing to run");
    }
    Ok(sched)
}
