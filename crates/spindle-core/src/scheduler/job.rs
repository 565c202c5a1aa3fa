//! Job scheduler: turns trigger slots into ordinary queue messages.
//!
//! On every tick each due job tries to insert a `(job, slot)` trigger record.
//! Only the scheduler whose insert succeeds enqueues the job message, so any
//! number of schedulers can share one store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::domain::{Headers, SchedulerId, TriggerRecord, header_keys};
use crate::error::{QueueError, QueueResult};
use crate::queue::{MessageStore, Producer, SendOptions};
use crate::scheduler::trigger::{Trigger, TriggerParseError};

/// Upper bound on the missed slots counted for one catch-up.
const MAX_SKIPPED_COUNT: usize = 10_000;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job '{job}': {source}")]
    Parse {
        job: String,
        #[source]
        source: TriggerParseError,
    },

    #[error("job '{0}' is already registered")]
    DuplicateJob(String),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often due jobs are evaluated.
    pub tick_interval: Duration,
    /// Trigger records older than this are purged.
    pub retention: Duration,
    pub purge_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            retention: Duration::from_secs(24 * 3600),
            purge_interval: Duration::from_secs(3600),
        }
    }
}

impl SchedulerConfig {
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval = interval;
        self
    }
}

/// Job registration: name, trigger and the message body to enqueue per slot.
#[derive(Debug, Clone)]
pub struct JobDefinition {
    pub name: String,
    pub trigger: Trigger,
    pub body: Vec<u8>,
    pub headers: Headers,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>, expression: &str) -> Result<Self, SchedulerError> {
        let name = name.into();
        let trigger = Trigger::parse(expression).map_err(|source| SchedulerError::Parse {
            job: name.clone(),
            source,
        })?;
        Ok(Self {
            name,
            trigger,
            body: Vec::new(),
            headers: Headers::new(),
        })
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers = self.headers.with(key, value);
        self
    }
}

struct ScheduledJob {
    definition: JobDefinition,
    /// Earliest slot not yet handled by this scheduler.
    next_due: Option<DateTime<Utc>>,
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Slots this scheduler won and enqueued.
    pub dispatched: usize,
    /// Slots another scheduler had already claimed.
    pub suppressed: usize,
    /// Slots passed over while catching up.
    pub skipped: usize,
}

pub struct JobScheduler {
    id: SchedulerId,
    store: Arc<MessageStore>,
    producer: Producer,
    config: SchedulerConfig,
    jobs: Vec<ScheduledJob>,
    last_purge: Option<DateTime<Utc>>,
}

impl JobScheduler {
    pub fn new(store: Arc<MessageStore>, config: SchedulerConfig) -> Self {
        Self {
            id: SchedulerId::generate(),
            producer: Producer::new(Arc::clone(&store)),
            store,
            config,
            jobs: Vec::new(),
            last_purge: None,
        }
    }

    pub fn id(&self) -> SchedulerId {
        self.id
    }

    pub fn job_names(&self) -> impl Iterator<Item = &str> {
        self.jobs.iter().map(|job| job.definition.name.as_str())
    }

    /// Register a job. Its first slot is the first one at or after now.
    pub fn add_job(&mut self, definition: JobDefinition) -> Result<(), SchedulerError> {
        if self.jobs.iter().any(|j| j.definition.name == definition.name) {
            return Err(SchedulerError::DuplicateJob(definition.name));
        }
        let now = self.store.now();
        let next_due = definition
            .trigger
            .next_occurrence(now - chrono::Duration::seconds(1));
        info!(job = %definition.name, trigger = %definition.trigger, ?next_due, "job registered");
        self.jobs.push(ScheduledJob {
            definition,
            next_due,
        });
        Ok(())
    }

    /// Shorthand for `add_job(JobDefinition::new(name, expression)?.body(body))`.
    pub fn schedule(
        &mut self,
        name: impl Into<String>,
        expression: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<(), SchedulerError> {
        self.add_job(JobDefinition::new(name, expression)?.body(body))
    }

    /// Evaluate every job once.
    ///
    /// A job that fell behind dispatches only its latest due slot. A storage
    /// failure on one job is logged and the slot is retried on the next tick.
    #[instrument(name = "scheduler.tick", skip(self), fields(scheduler = %self.id))]
    pub async fn tick(&mut self) -> Result<TickReport, SchedulerError> {
        self.store.ensure_live()?;
        let now = self.store.now();
        let mut report = TickReport::default();

        for job in self.jobs.iter_mut() {
            let Some(due) = job.next_due else { continue };
            if due > now {
                continue;
            }
            let trigger = &job.definition.trigger;
            let slot = trigger.previous_occurrence(now).unwrap_or(due).max(due);
            let skipped = count_between(trigger, due, slot);
            if skipped > 0 {
                warn!(job = %job.definition.name, skipped, %slot, "missed slots, dispatching the latest only");
                report.skipped += skipped;
            }

            match dispatch(&self.store, &self.producer, self.id, &job.definition, slot, now).await {
                Ok(true) => report.dispatched += 1,
                Ok(false) => report.suppressed += 1,
                Err(QueueError::Disposed) => return Err(QueueError::Disposed.into()),
                Err(e) => {
                    warn!(job = %job.definition.name, %slot, error = %e, "dispatch failed, retrying next tick");
                    continue;
                }
            }
            job.next_due = trigger.next_occurrence(slot);
        }

        self.purge_if_due(now).await?;
        Ok(report)
    }

    async fn purge_if_due(&mut self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let interval = chrono::Duration::from_std(self.config.purge_interval)
            .unwrap_or(chrono::Duration::MAX);
        if self.last_purge.is_some_and(|last| now - last < interval) {
            return Ok(());
        }
        let retention =
            chrono::Duration::from_std(self.config.retention).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(retention).unwrap_or(DateTime::<Utc>::MIN_UTC);
        match self.store.purge_triggers_before(cutoff).await {
            Ok(purged) => {
                self.last_purge = Some(now);
                if purged > 0 {
                    info!(purged, %cutoff, "trigger records purged");
                } else {
                    debug!(%cutoff, "no trigger records to purge");
                }
                Ok(())
            }
            Err(QueueError::Disposed) => Err(QueueError::Disposed.into()),
            Err(e) => {
                warn!(error = %e, "trigger purge failed");
                Ok(())
            }
        }
    }

    /// Tick every `tick_interval` until `shutdown` turns true.
    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(scheduler = %self.id, jobs = self.jobs.len(), "scheduler started");
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.config.tick_interval) => {}
                }
                if *shutdown.borrow() {
                    break;
                }
                match self.tick().await {
                    Ok(report) if report.dispatched > 0 => {
                        debug!(?report, "scheduler tick");
                    }
                    Ok(_) => {}
                    Err(SchedulerError::Queue(QueueError::Disposed)) => break,
                    Err(e) => warn!(error = %e, "scheduler tick failed"),
                }
            }
            info!(scheduler = %self.id, "scheduler stopped");
        })
    }
}

/// Insert the trigger record, then enqueue. `Ok(false)` if another scheduler
/// already owns the slot.
async fn dispatch(
    store: &MessageStore,
    producer: &Producer,
    scheduler: SchedulerId,
    job: &JobDefinition,
    slot: DateTime<Utc>,
    now: DateTime<Utc>,
) -> QueueResult<bool> {
    let record = TriggerRecord {
        job_name: job.name.clone(),
        scheduled_time: slot,
        dispatched_by: scheduler,
        dispatched_at: now,
    };
    if !store.insert_trigger(record).await? {
        debug!(job = %job.name, %slot, "slot already dispatched elsewhere");
        return Ok(false);
    }

    let mut options = SendOptions::new();
    options.headers = job
        .headers
        .clone()
        .with(header_keys::JOB_NAME, job.name.clone())
        .with(header_keys::JOB_SCHEDULED_TIME, slot.to_rfc3339());
    match producer.send(job.body.clone(), options).await {
        Ok(sent) => {
            info!(job = %job.name, %slot, id = %sent.id, "job dispatched");
            Ok(true)
        }
        Err(e) => {
            // the marker is written, so no other scheduler will retry this slot
            warn!(job = %job.name, %slot, error = %e, "job slot claimed but enqueue failed, slot lost");
            Err(e)
        }
    }
}

/// Slots in `[from, to)`.
fn count_between(trigger: &Trigger, from: DateTime<Utc>, to: DateTime<Utc>) -> usize {
    let mut count = 0;
    let mut cursor = from;
    while cursor < to && count < MAX_SKIPPED_COUNT {
        count += 1;
        match trigger.next_occurrence(cursor) {
            Some(next) => cursor = next,
            None => break,
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueOptions;
    use crate::impls::InMemoryStorage;
    use crate::ports::{Clock, ManualClock, StorageAdapter};
    use chrono::TimeZone;

    async fn store(clock: &ManualClock) -> Arc<MessageStore> {
        let options = QueueOptions::standard();
        let storage = InMemoryStorage::new("jobs");
        storage.create_queue(&options).await.unwrap();
        Arc::new(MessageStore::new(
            Arc::new(storage),
            options,
            Arc::new(clock.clone()),
        ))
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 3).unwrap()
    }

    #[tokio::test]
    async fn dispatches_each_slot_once() {
        let clock = ManualClock::new(start());
        let store = store(&clock).await;
        let mut scheduler = JobScheduler::new(Arc::clone(&store), SchedulerConfig::default());
        scheduler.schedule("report", "second(*%10)", "run").unwrap();

        assert_eq!(scheduler.tick().await.unwrap().dispatched, 0);
        clock.advance(chrono::Duration::seconds(7)); // 08:00:10
        assert_eq!(scheduler.tick().await.unwrap().dispatched, 1);
        assert_eq!(scheduler.tick().await.unwrap().dispatched, 0);
        clock.advance(chrono::Duration::seconds(10)); // 08:00:20
        assert_eq!(scheduler.tick().await.unwrap().dispatched, 1);

        let waiting = store.peek_waiting(10).await.unwrap();
        assert_eq!(waiting.len(), 2);
        assert_eq!(waiting[0].headers.get_str(header_keys::JOB_NAME), Some("report"));
        assert_eq!(
            waiting[0].headers.get_str(header_keys::JOB_SCHEDULED_TIME),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 10).unwrap().to_rfc3339().as_str())
        );
        assert_eq!(waiting[1].body, b"run".to_vec());
    }

    #[tokio::test]
    async fn racing_schedulers_dispatch_once() {
        let clock = ManualClock::new(start());
        let store = store(&clock).await;
        let mut a = JobScheduler::new(Arc::clone(&store), SchedulerConfig::default());
        let mut b = JobScheduler::new(Arc::clone(&store), SchedulerConfig::default());
        a.schedule("sync", "second(*%10)", "").unwrap();
        b.schedule("sync", "second(*%10)", "").unwrap();

        clock.advance(chrono::Duration::seconds(7));
        let (ra, rb) = tokio::join!(a.tick(), b.tick());
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert_eq!(ra.dispatched + rb.dispatched, 1);
        assert_eq!(ra.suppressed + rb.suppressed, 1);
        assert_eq!(store.count_waiting().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn late_tick_dispatches_latest_slot_only() {
        let clock = ManualClock::new(start());
        let store = store(&clock).await;
        let mut scheduler = JobScheduler::new(Arc::clone(&store), SchedulerConfig::default());
        scheduler.schedule("catchup", "second(*%10)", "").unwrap();

        clock.advance(chrono::Duration::seconds(45)); // 08:00:48
        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.dispatched, 1);
        // 10, 20, 30 passed over; 40 dispatched
        assert_eq!(report.skipped, 3);
        let waiting = store.peek_waiting(10).await.unwrap();
        assert_eq!(
            waiting[0].headers.get_str(header_keys::JOB_SCHEDULED_TIME),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 40).unwrap().to_rfc3339().as_str())
        );
    }

    #[tokio::test]
    async fn registration_errors() {
        let clock = ManualClock::new(start());
        let mut scheduler = JobScheduler::new(store(&clock).await, SchedulerConfig::default());
        assert!(matches!(
            scheduler.schedule("bad", "second(*%0)", ""),
            Err(SchedulerError::Parse { job, .. }) if job == "bad"
        ));
        scheduler.schedule("a", "minute(*)", "").unwrap();
        assert!(matches!(
            scheduler.schedule("a", "hour(*)", ""),
            Err(SchedulerError::DuplicateJob(name)) if name == "a"
        ));
        assert_eq!(scheduler.job_names().collect::<Vec<_>>(), vec!["a"]);
    }

    #[tokio::test]
    async fn old_trigger_records_are_purged() {
        let clock = ManualClock::new(start());
        let store = store(&clock).await;
        let config = SchedulerConfig::default()
            .with_retention(Duration::from_secs(60))
            .with_purge_interval(Duration::from_secs(30));
        let mut scheduler = JobScheduler::new(Arc::clone(&store), config);
        scheduler.schedule("tick", "second(*%10)", "").unwrap();

        clock.advance(chrono::Duration::seconds(7));
        scheduler.tick().await.unwrap();

        // the 08:00:10 record is past retention two minutes later, so the
        // slot could be inserted again
        clock.advance(chrono::Duration::seconds(120));
        scheduler.tick().await.unwrap();
        let replay = TriggerRecord {
            job_name: "tick".into(),
            scheduled_time: Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 10).unwrap(),
            dispatched_by: SchedulerId::generate(),
            dispatched_at: clock.now(),
        };
        assert!(store.insert_trigger(replay).await.unwrap());
    }

    #[tokio::test]
    async fn disposed_store_stops_the_scheduler() {
        let clock = ManualClock::new(start());
        let store = store(&clock).await;
        let mut scheduler = JobScheduler::new(Arc::clone(&store), SchedulerConfig::default());
        store.dispose();
        assert!(matches!(
            scheduler.tick().await,
            Err(SchedulerError::Queue(QueueError::Disposed))
        ));
    }
}
