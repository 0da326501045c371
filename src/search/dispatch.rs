//! Bounded fan-out of work units.

use std::sync::Arc;

use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::err::TrackerError;

use super::blob::{BlobStore, StoredResponse};
use super::reader::VariantReader;
use super::schema::SearchRequest;
use super::splitter::{SplitPlan, WorkUnit};
use super::tracker::CompletionTracker;
use super::worker::{self, MatchResult};

/// Store one result with the job and account for it.
///
/// Results for jobs that have been reclaimed in the meantime are dropped.
pub async fn record_result(
    tracker: &CompletionTracker,
    blobs: &BlobStore,
    inline_threshold: usize,
    job_id: &Uuid,
    result: MatchResult,
) -> Result<bool, TrackerError> {
    let response_number = match tracker.next_response_number(job_id) {
        Ok(number) => number,
        Err(e) => {
            tracing::debug!("discarding result for {}: {}", &result.vcf_location, e);
            return Err(e);
        }
    };
    let stored = match StoredResponse::store(&result, blobs, inline_threshold).await {
        Ok(stored) => Some(stored),
        Err(e) => {
            tracing::warn!("could not store result for {}: {}", &result.vcf_location, e);
            let errored = MatchResult {
                error: Some(e.to_string()),
                ..MatchResult::default()
            };
            serde_json::to_string(&errored)
                .ok()
                .map(StoredResponse::Inline)
        }
    };
    match stored {
        Some(stored) => record_stored(tracker, blobs, job_id, response_number, stored).await,
        None => tracker.mark_finished(job_id),
    }
}

/// Keep an already stored response with the job and account for it.
///
/// If the job is gone by now, an out-of-band response is deleted again.
pub async fn record_stored(
    tracker: &CompletionTracker,
    blobs: &BlobStore,
    job_id: &Uuid,
    response_number: u64,
    stored: StoredResponse,
) -> Result<bool, TrackerError> {
    let blob_key = match &stored {
        StoredResponse::Blob(key) => Some(key.clone()),
        StoredResponse::Inline(_) => None,
    };
    let res = tracker
        .store_response(job_id, response_number, stored)
        .and_then(|()| tracker.mark_finished(job_id));
    if let (Err(e), Some(key)) = (&res, blob_key) {
        tracing::debug!("deleting orphaned blob {}: {}", &key, e);
        if let Err(e) = blobs.delete(&key).await {
            tracing::warn!("could not delete blob {}: {}", &key, e);
        }
    }
    res
}

/// Dispatches the work units of a job onto a bounded pool of blocking tasks.
pub struct Dispatcher {
    tracker: Arc<CompletionTracker>,
    blobs: Arc<BlobStore>,
    reader: Arc<dyn VariantReader>,
    semaphore: Arc<Semaphore>,
    inline_threshold: usize,
}

impl Dispatcher {
    pub fn new(
        tracker: Arc<CompletionTracker>,
        blobs: Arc<BlobStore>,
        reader: Arc<dyn VariantReader>,
        pool_size: usize,
        inline_threshold: usize,
    ) -> Self {
        Self {
            tracker,
            blobs,
            reader,
            semaphore: Arc::new(Semaphore::new(pool_size.max(1))),
            inline_threshold,
        }
    }

    /// Register a job for `plan`, set its fan-out and start all units.
    ///
    /// Returns without waiting for any unit.
    pub fn dispatch(
        &self,
        plan: &SplitPlan,
        request: &SearchRequest,
    ) -> Result<Uuid, TrackerError> {
        let job_id = self.tracker.register();
        let units = plan.work_units(job_id, request);
        self.tracker.set_fan_out(&job_id, units.len() as u64)?;
        tracing::debug!("dispatching {} work units for job {}", units.len(), job_id);
        for unit in units {
            self.spawn_unit(unit);
        }
        Ok(job_id)
    }

    fn spawn_unit(&self, unit: WorkUnit) {
        let tracker = self.tracker.clone();
        let blobs = self.blobs.clone();
        let reader = self.reader.clone();
        let semaphore = self.semaphore.clone();
        let inline_threshold = self.inline_threshold;

        tokio::spawn(async move {
            let result = match semaphore.acquire_owned().await {
                Ok(permit) => {
                    let blocking_unit = unit.clone();
                    let task = tokio::task::spawn_blocking(move || {
                        let _permit = permit;
                        worker::perform(&blocking_unit, reader.as_ref())
                    });
                    match task.await {
                        Ok(result) => result,
                        Err(e) => MatchResult::errored(&unit, format!("worker task failed: {}", e)),
                    }
                }
                Err(e) => MatchResult::errored(&unit, format!("could not dispatch: {}", e)),
            };
            if let Err(e) =
                record_result(&tracker, &blobs, inline_threshold, &unit.job_id, result).await
            {
                tracing::debug!("result of {} not recorded: {}", &unit.vcf_location, e);
            }
        });
    }

    /// Stop launching units; units started afterwards finish as errored.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::search::reader::LocalVcfReader;
    use crate::search::schema::{Dataset, VcfChromosomes};
    use crate::search::tracker::JobState;

    fn dataset(id: &str, vcf: &str) -> Dataset {
        Dataset {
            id: id.into(),
            vcf_locations: vec![vcf.into()],
            vcf_chromosome_map: vec![VcfChromosomes {
                vcf: vcf.into(),
                chromosomes: vec!["1".into(), "2".into()],
            }],
            ..Default::default()
        }
    }

    fn dispatcher(tracker: &Arc<CompletionTracker>) -> Dispatcher {
        Dispatcher::new(
            tracker.clone(),
            Arc::new(BlobStore::default()),
            Arc::new(LocalVcfReader),
            2,
            1024,
        )
    }

    async fn wait_complete(
        tracker: &CompletionTracker,
        job_id: &Uuid,
    ) -> Result<(), anyhow::Error> {
        let record = tracker.get(job_id)?;
        tokio::time::timeout(Duration::from_secs(10), async {
            while !record.is_complete() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;
        Ok(())
    }

    #[tokio::test]
    async fn all_units_arrive() -> Result<(), anyhow::Error> {
        let tracker = Arc::new(CompletionTracker::default());
        let request = SearchRequest {
            start: vec![0, 25_000],
            end: vec![0, 30_000],
            ..Default::default()
        };
        let datasets = vec![
            dataset("ds-1", "tests/search/small.vcf"),
            dataset("ds-2", "tests/search/small.vcf.gz"),
        ];
        let plan = SplitPlan::new(&request, &datasets, 10_000);

        let job_id = dispatcher(&tracker).dispatch(&plan, &request)?;
        wait_complete(&tracker, &job_id).await?;

        let record = tracker.get(&job_id)?;
        assert_eq!(record.fan_out(), Some(plan.fan_out()));
        assert_eq!(record.received(), 6);
        assert_eq!(record.outstanding(), 0);
        assert_eq!(record.responses().len(), 6);
        assert_eq!(record.state(), JobState::Complete);

        Ok(())
    }

    #[tokio::test]
    async fn closed_pool_yields_errored_results() -> Result<(), anyhow::Error> {
        let tracker = Arc::new(CompletionTracker::default());
        let request = SearchRequest::default();
        let plan = SplitPlan::new(&request, &[dataset("ds-1", "tests/search/small.vcf")], 10_000);
        let dispatcher = dispatcher(&tracker);
        dispatcher.close();

        let job_id = dispatcher.dispatch(&plan, &request)?;
        wait_complete(&tracker, &job_id).await?;

        let blobs = BlobStore::default();
        let responses = tracker.get(&job_id)?.responses();
        assert_eq!(responses.len(), 1);
        let result = responses[0].1.load(&blobs).await?;
        assert!(result.is_error());

        Ok(())
    }

    #[tokio::test]
    async fn result_for_reclaimed_job_is_dropped() -> Result<(), anyhow::Error> {
        let tracker = CompletionTracker::default();
        let blobs = BlobStore::default();
        let job_id = tracker.register();
        tracker.set_fan_out(&job_id, 1)?;
        tracker.reclaim(&job_id);

        let res = record_result(&tracker, &blobs, 1024, &job_id, MatchResult::default()).await;
        assert_eq!(res, Err(TrackerError::UnknownJob(job_id)));

        Ok(())
    }

    #[tokio::test]
    async fn blob_of_job_reclaimed_while_storing_is_deleted() -> Result<(), anyhow::Error> {
        let tracker = CompletionTracker::default();
        let blobs = BlobStore::default();
        let job_id = tracker.register();
        tracker.set_fan_out(&job_id, 1)?;

        let response_number = tracker.next_response_number(&job_id)?;
        let stored = StoredResponse::store(&MatchResult::default(), &blobs, 0).await?;
        let key = match &stored {
            StoredResponse::Blob(key) => key.clone(),
            StoredResponse::Inline(_) => anyhow::bail!("expected out-of-band result"),
        };
        assert!(blobs.get(&key).await.is_ok());
        tracker.reclaim(&job_id);

        let res = record_stored(&tracker, &blobs, &job_id, response_number, stored).await;
        assert_eq!(res, Err(TrackerError::UnknownJob(job_id)));
        match &blobs {
            BlobStore::Memory(map) => assert!(map.lock().unwrap().is_empty()),
            _ => anyhow::bail!("expected memory blob store"),
        }

        Ok(())
    }

    #[tokio::test]
    async fn blob_of_live_job_is_kept() -> Result<(), anyhow::Error> {
        let tracker = CompletionTracker::default();
        let blobs = BlobStore::default();
        let job_id = tracker.register();
        tracker.set_fan_out(&job_id, 1)?;

        let completed = record_result(&tracker, &blobs, 0, &job_id, MatchResult::default()).await?;
        assert!(completed);
        let responses = tracker.get(&job_id)?.responses();
        assert_eq!(responses.len(), 1);
        assert!(matches!(responses[0].1, StoredResponse::Blob(_)));
        assert!(responses[0].1.load(&blobs).await.is_ok());

        Ok(())
    }
}
