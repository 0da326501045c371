//! Completion tracking of search jobs.
//!
//! Each job record carries atomic counters only. The fan-out is set once
//! before dispatch, every finished work unit increments `received` and
//! decrements `outstanding`, and the job is complete once `received`
//! equals the fan-out. Records are reclaimed after a fixed time-to-live
//! regardless of their state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::err::TrackerError;

use super::blob::StoredResponse;

const FAN_OUT_UNSET: u64 = u64::MAX;

/// Default time-to-live of a job record.
pub const DEFAULT_JOB_TTL: Duration = Duration::from_secs(5 * 60);

/// Life cycle state of a job.
#[derive(
    serde::Serialize,
    serde::Deserialize,
    PartialEq,
    Eq,
    Debug,
    Clone,
    Copy,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum JobState {
    /// Registered, fan-out not yet set.
    New,
    /// Fan-out set, results outstanding.
    Running,
    /// All results received.
    Complete,
}

/// Shared record of one search job.
#[derive(Debug)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub created: DateTime<Utc>,
    expires_at: Instant,
    /// `FAN_OUT_UNSET` until set at dispatch.
    fan_out: AtomicU64,
    received: AtomicU64,
    outstanding: AtomicI64,
    responses_counter: AtomicU64,
    complete: AtomicBool,
    /// Milliseconds since the epoch, 0 while running.
    finished_millis: AtomicI64,
    responses: Mutex<Vec<(u64, StoredResponse)>>,
    notify: Notify,
}

impl JobRecord {
    fn new(job_id: Uuid, ttl: Duration) -> Self {
        Self {
            job_id,
            created: Utc::now(),
            expires_at: Instant::now() + ttl,
            fan_out: AtomicU64::new(FAN_OUT_UNSET),
            received: AtomicU64::new(0),
            outstanding: AtomicI64::new(0),
            responses_counter: AtomicU64::new(0),
            complete: AtomicBool::new(false),
            finished_millis: AtomicI64::new(0),
            responses: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    /// The fan-out, `None` while not set.
    pub fn fan_out(&self) -> Option<u64> {
        match self.fan_out.load(Ordering::Acquire) {
            FAN_OUT_UNSET => None,
            fan_out => Some(fan_out),
        }
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Acquire)
    }

    pub fn outstanding(&self) -> i64 {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    pub fn state(&self) -> JobState {
        if self.is_complete() {
            JobState::Complete
        } else if self.fan_out().is_some() {
            JobState::Running
        } else {
            JobState::New
        }
    }

    /// Time of completion, if complete.
    pub fn finished(&self) -> Option<DateTime<Utc>> {
        match self.finished_millis.load(Ordering::Acquire) {
            0 => None,
            millis => DateTime::from_timestamp_millis(millis),
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Future resolving on completion; create before checking
    /// `is_complete()` so no wakeup is lost.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Stored responses ordered by response number.
    pub fn responses(&self) -> Vec<(u64, StoredResponse)> {
        let mut result = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        result.sort_by_key(|(number, _)| *number);
        result
    }

    /// Transition to complete; only the first caller notifies.
    fn try_complete(&self) -> bool {
        match self.fan_out() {
            Some(fan_out) if self.received() >= fan_out => (),
            _ => return false,
        }
        if self
            .complete
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.finished_millis
                .store(Utc::now().timestamp_millis().max(1), Ordering::Release);
            self.notify.notify_waiters();
            true
        } else {
            false
        }
    }
}

/// In-process store of job records with TTL-based reclamation.
#[derive(Debug)]
pub struct CompletionTracker {
    jobs: RwLock<HashMap<Uuid, Arc<JobRecord>>>,
    ttl: Duration,
}

impl Default for CompletionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_JOB_TTL)
    }
}

impl CompletionTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Register a new job with unset fan-out and return its id.
    pub fn register(&self) -> Uuid {
        let job_id = Uuid::new_v4();
        let record = Arc::new(JobRecord::new(job_id, self.ttl));
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id, record);
        tracing::debug!("registered search job {}", job_id);
        job_id
    }

    /// Look up the record of `job_id`.
    pub fn get(&self, job_id: &Uuid) -> Result<Arc<JobRecord>, TrackerError> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .cloned()
            .ok_or(TrackerError::UnknownJob(*job_id))
    }

    /// Set the fan-out in one update; may only be called once per job.
    pub fn set_fan_out(&self, job_id: &Uuid, fan_out: u64) -> Result<(), TrackerError> {
        let record = self.get(job_id)?;
        record
            .fan_out
            .compare_exchange(FAN_OUT_UNSET, fan_out, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| TrackerError::FanOutAlreadySet(*job_id))?;
        record
            .outstanding
            .fetch_add(fan_out as i64, Ordering::AcqRel);
        // zero fan-out is complete right away
        record.try_complete();
        Ok(())
    }

    /// Allocate the next response number of `job_id`.
    pub fn next_response_number(&self, job_id: &Uuid) -> Result<u64, TrackerError> {
        Ok(self
            .get(job_id)?
            .responses_counter
            .fetch_add(1, Ordering::AcqRel))
    }

    /// Keep a stored response with the job record.
    pub fn store_response(
        &self,
        job_id: &Uuid,
        response_number: u64,
        response: StoredResponse,
    ) -> Result<(), TrackerError> {
        self.get(job_id)?
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((response_number, response));
        Ok(())
    }

    /// Account for one finished work unit.
    ///
    /// Returns whether this call completed the job. Arrivals beyond the
    /// fan-out are ignored.
    pub fn mark_finished(&self, job_id: &Uuid) -> Result<bool, TrackerError> {
        let record = self.get(job_id)?;
        let fan_out = record.fan_out();
        let incremented = record
            .received
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |received| {
                match fan_out {
                    Some(fan_out) if received >= fan_out => None,
                    _ => Some(received + 1),
                }
            });
        if incremented.is_err() {
            tracing::debug!("ignoring surplus arrival for job {}", job_id);
            return Ok(false);
        }
        record.outstanding.fetch_sub(1, Ordering::AcqRel);
        Ok(record.try_complete())
    }

    /// Remove the record of `job_id`.
    pub fn reclaim(&self, job_id: &Uuid) -> Option<Arc<JobRecord>> {
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id)
    }

    /// Remove all expired records and return their number.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let before = jobs.len();
        jobs.retain(|_, record| !record.is_expired(now));
        before - jobs.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Periodically sweep expired records until the tracker is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let tracker: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(tracker) = tracker.upgrade() else {
                    break;
                };
                let swept = tracker.sweep_expired();
                if swept > 0 {
                    tracing::debug!("reclaimed {} expired search jobs", swept);
                }
            }
        })
    }
}
