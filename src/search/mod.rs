//! Distributed variant search over datasets of VCF files.
//!
//! A search request is split into work units of bounded region size per
//! relevant VCF file, the units are run on a bounded pool, and their
//! results are merged once all of them arrived or the deadline elapsed.

pub mod aggregate;
pub mod blob;
pub mod cli;
pub mod dispatch;
pub mod matcher;
pub mod reader;
pub mod schema;
pub mod splitter;
pub mod tracker;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use thousands::Separable;

use crate::err::RequestError;

use self::aggregate::AggregateResult;
use self::blob::{BlobStore, StoredResponse, DEFAULT_INLINE_THRESHOLD};
use self::dispatch::Dispatcher;
use self::reader::VariantReader;
use self::schema::{Dataset, SearchRequest};
use self::splitter::{SplitPlan, DEFAULT_MAX_FAN_OUT, DEFAULT_SPLIT_SIZE};
use self::tracker::CompletionTracker;

/// Tuning of the search engine.
#[derive(clap::Args, serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SearchConfig {
    /// Maximal span of the region of one work unit.
    #[arg(long, default_value_t = DEFAULT_SPLIT_SIZE)]
    pub split_size: u64,
    /// Requests needing more work units than this are rejected.
    #[arg(long, default_value_t = DEFAULT_MAX_FAN_OUT)]
    pub max_fan_out: u64,
    /// Maximal number of work units running at the same time.
    #[arg(long, default_value_t = 32)]
    pub pool_size: usize,
    /// Deadline of one search in milliseconds.
    #[arg(long, default_value_t = 30_000)]
    pub timeout_ms: u64,
    /// Poll interval while waiting for results in milliseconds.
    #[arg(long, default_value_t = 100)]
    pub poll_interval_ms: u64,
    /// Results larger than this many bytes are stored out-of-band.
    #[arg(long, default_value_t = DEFAULT_INLINE_THRESHOLD)]
    pub inline_threshold: usize,
    /// Time-to-live of job records in seconds.
    #[arg(long, default_value_t = 300)]
    pub job_ttl_secs: u64,
    /// Interval between sweeps for expired job records in seconds.
    #[arg(long, default_value_t = 60)]
    pub sweep_interval_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            split_size: DEFAULT_SPLIT_SIZE,
            max_fan_out: DEFAULT_MAX_FAN_OUT,
            pool_size: 32,
            timeout_ms: 30_000,
            poll_interval_ms: 100,
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            job_ttl_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

impl SearchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.job_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Runs searches; must be created inside a tokio runtime.
pub struct SearchEngine {
    config: SearchConfig,
    tracker: Arc<CompletionTracker>,
    blobs: Arc<BlobStore>,
    dispatcher: Dispatcher,
    sweeper: tokio::task::JoinHandle<()>,
}

impl SearchEngine {
    pub fn new(config: SearchConfig, reader: Arc<dyn VariantReader>, blobs: BlobStore) -> Self {
        let tracker = Arc::new(CompletionTracker::new(config.job_ttl()));
        let blobs = Arc::new(blobs);
        let dispatcher = Dispatcher::new(
            tracker.clone(),
            blobs.clone(),
            reader,
            config.pool_size,
            config.inline_threshold,
        );
        let sweeper = tracker.spawn_sweeper(config.sweep_interval());
        Self {
            config,
            tracker,
            blobs,
            dispatcher,
            sweeper,
        }
    }

    pub fn tracker(&self) -> &CompletionTracker {
        &self.tracker
    }

    /// Run `request` against `datasets`.
    ///
    /// Only malformed or oversized requests fail; worker failures are counted in the
    /// result and an elapsed deadline yields a partial result.
    pub async fn search(
        &self,
        request: &SearchRequest,
        datasets: &[Dataset],
    ) -> Result<AggregateResult, RequestError> {
        let before_anything = std::time::Instant::now();
        request.validate()?;
        let deadline = tokio::time::Instant::now() + self.config.timeout();

        let plan = SplitPlan::bounded(
            request,
            datasets,
            self.config.split_size,
            self.config.max_fan_out,
        )?;
        tracing::info!(
            "searching {}:{}-{} in {} datasets with {} work units",
            &request.reference_name,
            plan.window.start_min.separate_with_commas(),
            plan.window.start_max.separate_with_commas(),
            datasets.len(),
            plan.fan_out().separate_with_commas()
        );

        let job_id = match self.dispatcher.dispatch(&plan, request) {
            Ok(job_id) => job_id,
            Err(e) => {
                tracing::error!("could not dispatch search: {}", e);
                return Ok(aggregate::Merge::default().finish(
                    uuid::Uuid::nil(),
                    &plan,
                    plan.fan_out(),
                    0,
                    true,
                ));
            }
        };
        let result = aggregate::aggregate(
            &self.tracker,
            &self.blobs,
            job_id,
            &plan,
            request.include_resultset_responses,
            deadline,
            self.config.poll_interval(),
        )
        .await;
        self.reclaim(&job_id).await;

        tracing::info!(
            "job {} done in {:?}: exists={} variants={} calls={} partial={}",
            job_id,
            before_anything.elapsed(),
            result.exists,
            result.variant_count.separate_with_commas(),
            result.call_count.separate_with_commas(),
            result.partial
        );
        Ok(result)
    }

    /// Drop the job record together with its out-of-band results.
    async fn reclaim(&self, job_id: &uuid::Uuid) {
        if let Some(record) = self.tracker.reclaim(job_id) {
            for (_, stored) in record.responses() {
                if let StoredResponse::Blob(key) = stored {
                    if let Err(e) = self.blobs.delete(&key).await {
                        tracing::warn!("could not delete blob {}: {}", &key, e);
                    }
                }
            }
        }
    }

    /// Stop dispatching and the background sweep.
    pub fn shutdown(&self) {
        self.dispatcher.close();
        self.sweeper.abort();
    }
}
