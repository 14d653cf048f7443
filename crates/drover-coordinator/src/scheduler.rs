//! Cron-driven materialization of scheduled jobs.
//!
//! On boot the scheduler loads every Active scheduled job and keeps a
//! second-precision timer list. When an entry fires, materialization
//! runs under a `cron:<id>` lock so only one coordinator replica
//! produces the tick's job; the authoritative state is re-read inside
//! the lock, so a Paused entry never fires even if its timer is
//! stale. Ticks missed while no coordinator was running are not
//! backfilled.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use drover_broker::Broker;
use drover_core::scheduled::{cron_schedule, parse_fixed_offset};
use drover_core::{Job, JobContext, JobState, ScheduledJob, ScheduledJobState};
use drover_datastore::{Datastore, Locker};

use crate::error::Result;

struct Entry {
    id: String,
    schedule: cron::Schedule,
    timezone: Option<chrono::FixedOffset>,
    next_run: Option<DateTime<Utc>>,
}

struct SchedulerInner {
    ds: Arc<dyn Datastore>,
    broker: Arc<dyn Broker>,
    locker: Arc<dyn Locker>,
    entries: RwLock<Vec<Entry>>,
    stop: CancellationToken,
}

/// Background scheduler turning cron entries into Pending jobs.
/// Cheaply cloneable.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

impl JobScheduler {
    pub fn new(
        ds: Arc<dyn Datastore>,
        broker: Arc<dyn Broker>,
        locker: Arc<dyn Locker>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                ds,
                broker,
                locker,
                entries: RwLock::new(Vec::new()),
                stop: CancellationToken::new(),
            }),
        }
    }

    /// Load Active entries and start the tick loop.
    pub async fn start(&self) -> Result<()> {
        for scheduled in self.inner.ds.get_active_scheduled_jobs().await? {
            if let Err(err) = self.register(&scheduled).await {
                // A row that no longer parses must not take the
                // scheduler down with it.
                error!(
                    scheduled_job_id = %scheduled.id,
                    error = %err,
                    "skipping unschedulable cron entry"
                );
            }
        }

        let scheduler = self.clone();
        tokio::spawn(async move {
            info!("cron scheduler started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => scheduler.tick().await,
                    _ = scheduler.inner.stop.cancelled() => {
                        info!("cron scheduler stopped");
                        return;
                    }
                }
            }
        });
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.stop.cancel();
    }

    /// Add (or replace) the timer entry for a scheduled job.
    pub async fn register(&self, scheduled: &ScheduledJob) -> Result<()> {
        let schedule = cron_schedule(&scheduled.cron)?;
        let timezone = if scheduled.timezone.is_empty() {
            None
        } else {
            Some(parse_fixed_offset(&scheduled.timezone)?)
        };
        let next_run = next_after(&schedule, timezone, Utc::now());
        info!(
            scheduled_job_id = %scheduled.id,
            cron = %scheduled.cron,
            next_run = ?next_run,
            "cron entry registered"
        );

        let mut entries = self.inner.entries.write().await;
        entries.retain(|e| e.id != scheduled.id);
        entries.push(Entry {
            id: scheduled.id.clone(),
            schedule,
            timezone,
            next_run,
        });
        Ok(())
    }

    /// Drop the timer entry for a deleted scheduled job.
    pub async fn unregister(&self, id: &str) {
        self.inner.entries.write().await.retain(|e| e.id != id);
        debug!(scheduled_job_id = %id, "cron entry removed");
    }

    async fn tick(&self) {
        let now = Utc::now();
        let due: Vec<String> = {
            let mut entries = self.inner.entries.write().await;
            let mut due = Vec::new();
            for entry in entries.iter_mut() {
                if entry.next_run.is_some_and(|next| next <= now) {
                    due.push(entry.id.clone());
                    entry.next_run = next_after(&entry.schedule, entry.timezone, now);
                }
            }
            due
        };
        for id in due {
            if let Err(err) = self.fire(&id).await {
                error!(scheduled_job_id = %id, error = %err, "cron materialization failed");
            }
        }
    }

    async fn fire(&self, id: &str) -> Result<()> {
        let _lease = self.inner.locker.acquire(&format!("cron:{id}")).await?;

        let scheduled = match self.inner.ds.get_scheduled_job(id).await {
            Ok(scheduled) => scheduled,
            Err(drover_datastore::DatastoreError::NotFound { .. }) => {
                warn!(scheduled_job_id = %id, "cron entry deleted underneath us");
                self.unregister(id).await;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        if scheduled.state != ScheduledJobState::Active {
            debug!(scheduled_job_id = %id, "paused, not firing");
            return Ok(());
        }

        let job = materialize(&scheduled);
        self.inner.ds.create_job(&job).await?;
        self.inner.broker.publish_job(&job).await?;
        self.inner
            .ds
            .update_scheduled_job(
                id,
                Box::new(|s| {
                    s.last_run_at = Some(Utc::now());
                    Ok(())
                }),
            )
            .await?;
        info!(
            scheduled_job_id = %id,
            job_id = %job.id,
            job_name = %job.name,
            "scheduled job materialized"
        );
        Ok(())
    }
}

fn next_after(
    schedule: &cron::Schedule,
    timezone: Option<chrono::FixedOffset>,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match timezone {
        Some(offset) => schedule
            .after(&after.with_timezone(&offset))
            .next()
            .map(|dt| dt.with_timezone(&Utc)),
        None => schedule.after(&after).next(),
    }
}

/// Copy the template into a fresh Pending job. No expressions are
/// expanded here; that is the planner's job at dispatch time.
fn materialize(scheduled: &ScheduledJob) -> Job {
    Job {
        id: drover_core::new_id(),
        name: scheduled.name.clone(),
        description: scheduled.description.clone(),
        tags: scheduled.tags.clone(),
        state: JobState::Pending,
        created_at: Some(Utc::now()),
        tasks: scheduled.tasks.clone(),
        position: 1,
        task_count: scheduled.tasks.len() as u32,
        inputs: scheduled.inputs.clone(),
        context: JobContext {
            inputs: scheduled.inputs.clone(),
            secrets: scheduled.secrets.clone(),
            tasks: Default::default(),
        },
        output: scheduled.output.clone(),
        secrets: scheduled.secrets.clone(),
        created_by: scheduled.created_by.clone(),
        ..Job::default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use drover_broker::InMemoryBroker;
    use drover_core::Task;
    use drover_datastore::{InMemoryDatastore, InMemoryLocker};

    fn scheduled(cron: &str) -> ScheduledJob {
        ScheduledJob {
            id: drover_core::new_id(),
            name: "tick".into(),
            description: String::new(),
            state: ScheduledJobState::Active,
            cron: cron.into(),
            timezone: String::new(),
            created_at: Utc::now(),
            last_run_at: None,
            tasks: vec![Task {
                name: "t".into(),
                run: "true".into(),
                ..Task::default()
            }],
            inputs: Default::default(),
            output: String::new(),
            tags: Vec::new(),
            secrets: Default::default(),
            created_by: String::new(),
        }
    }

    fn scheduler(
        ds: &Arc<InMemoryDatastore>,
        broker: &InMemoryBroker,
    ) -> Arc<JobScheduler> {
        Arc::new(JobScheduler::new(
            ds.clone(),
            Arc::new(broker.clone()),
            Arc::new(InMemoryLocker::new()),
        ))
    }

    #[tokio::test]
    async fn fires_and_materializes_a_pending_job() {
        let ds = Arc::new(InMemoryDatastore::new());
        let broker = InMemoryBroker::new();
        let sched = scheduler(&ds, &broker);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        broker
            .subscribe_jobs(Arc::new(move |job| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(job);
                    Ok(())
                })
            }))
            .await
            .unwrap();

        // Every-second cron so the test fires fast.
        let sj = scheduled("* * * * * *");
        ds.create_scheduled_job(&sj).await.unwrap();
        sched.start().await.unwrap();

        let job = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("cron never fired")
            .unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.name, "tick");
        assert_eq!(job.position, 1);
        assert_eq!(job.task_count, 1);

        let stored = ds.get_scheduled_job(&sj.id).await.unwrap();
        assert!(stored.last_run_at.is_some());
        sched.stop();
    }

    #[tokio::test]
    async fn paused_entries_do_not_fire() {
        let ds = Arc::new(InMemoryDatastore::new());
        let broker = InMemoryBroker::new();
        let sched = scheduler(&ds, &broker);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        broker
            .subscribe_jobs(Arc::new(move |job| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(job);
                    Ok(())
                })
            }))
            .await
            .unwrap();

        let mut sj = scheduled("* * * * * *");
        sj.state = ScheduledJobState::Paused;
        ds.create_scheduled_job(&sj).await.unwrap();
        // Register explicitly (start() would skip it as inactive).
        sched.register(&sj).await.unwrap();
        sched.start().await.unwrap();

        assert!(
            tokio::time::timeout(Duration::from_millis(2500), rx.recv())
                .await
                .is_err(),
            "paused cron must not materialize jobs"
        );
        sched.stop();
    }

    #[tokio::test]
    async fn rejects_bad_cron_expressions() {
        let ds = Arc::new(InMemoryDatastore::new());
        let broker = InMemoryBroker::new();
        let sched = scheduler(&ds, &broker);

        let mut sj = scheduled("not a cron");
        sj.id = "bad".into();
        assert!(sched.register(&sj).await.is_err());
    }
}
