//! Entry points of the `search *` sub commands.

use std::fs::File;
use std::io::{BufReader, Write};
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use thousands::Separable;

use crate::common::{io::open_write_maybe_gz, trace_rss_now, worker_version};

use super::blob::BlobStore;
use super::reader::{BcftoolsReader, LocalVcfReader, VariantReader};
use super::schema::{Dataset, SearchRequest};
use super::splitter::{SplitPlan, WorkUnit};
use super::{worker, SearchConfig, SearchEngine};

/// Which variant reader to use.
#[derive(
    clap::ValueEnum, PartialEq, Eq, Debug, Clone, Copy, Default, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum ReaderKind {
    /// Stream plain or gzip compressed VCF files.
    #[default]
    Local,
    /// Run `bcftools query` on indexed VCF files.
    Bcftools,
}

impl ReaderKind {
    fn build(self) -> Arc<dyn VariantReader> {
        match self {
            ReaderKind::Local => Arc::new(LocalVcfReader),
            ReaderKind::Bcftools => Arc::new(BcftoolsReader::default()),
        }
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, anyhow::Error> {
    let reader = BufReader::new(
        File::open(path).map_err(|e| anyhow::anyhow!("could not open {}: {}", path, e))?,
    );
    serde_json::from_reader(reader).map_err(|e| anyhow::anyhow!("could not parse {}: {}", path, e))
}

fn write_json<T: serde::Serialize>(path: &str, value: &T) -> Result<(), anyhow::Error> {
    let mut writer = open_write_maybe_gz(path)?;
    serde_json::to_writer_pretty(&mut writer, value)?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}

/// Command line arguments for `search split` sub command.
#[derive(Parser, Debug)]
#[command(about = "Split a search request into work units", long_about = None)]
pub struct SplitArgs {
    /// Path to search request JSON file.
    #[arg(long, required = true)]
    pub path_request: String,
    /// Path to datasets JSON file.
    #[arg(long, required = true)]
    pub path_datasets: String,
    /// Path to output JSON file with work units.
    #[arg(long, required = true)]
    pub path_output: String,
    /// Maximal span of the region of one work unit.
    #[arg(long, default_value_t = super::splitter::DEFAULT_SPLIT_SIZE)]
    pub split_size: u64,
    /// Requests needing more work units than this are rejected.
    #[arg(long, default_value_t = super::splitter::DEFAULT_MAX_FAN_OUT)]
    pub max_fan_out: u64,
}

/// Main entry point for `search split` sub command.
pub fn run_split(args_common: &crate::common::Args, args: &SplitArgs) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);

    let request: SearchRequest = load_json(&args.path_request)?;
    request.validate()?;
    let datasets: Vec<Dataset> = load_json(&args.path_datasets)?;

    let plan = SplitPlan::bounded(&request, &datasets, args.split_size, args.max_fan_out)?;
    let units = plan.work_units(uuid::Uuid::new_v4(), &request);
    tracing::info!(
        "{} work units for window {:?}",
        plan.fan_out().separate_with_commas(),
        &plan.window
    );
    write_json(&args.path_output, &units)
}

/// Command line arguments for `search perform` sub command.
#[derive(Parser, Debug)]
#[command(about = "Run a single work unit", long_about = None)]
pub struct PerformArgs {
    /// Path to work unit JSON file.
    #[arg(long, required = true)]
    pub path_unit: String,
    /// Path to output JSON file with the match result.
    #[arg(long, required = true)]
    pub path_output: String,
    /// Variant reader to use.
    #[arg(long, value_enum, default_value_t = ReaderKind::Local)]
    pub reader: ReaderKind,
}

/// Main entry point for `search perform` sub command.
pub fn run_perform(
    args_common: &crate::common::Args,
    args: &PerformArgs,
) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);

    let unit: WorkUnit = load_json(&args.path_unit)?;
    let before_scan = Instant::now();
    let result = worker::perform(&unit, args.reader.build().as_ref());
    tracing::info!(
        "... done with {} in {:?}",
        unit.region(),
        before_scan.elapsed()
    );
    trace_rss_now();
    write_json(&args.path_output, &result)
}

/// Command line arguments for `search run` sub command.
#[derive(Parser, Debug)]
#[command(about = "Run a search over datasets", long_about = None)]
pub struct RunArgs {
    /// Path to search request JSON file.
    #[arg(long, required = true)]
    pub path_request: String,
    /// Path to datasets JSON file.
    #[arg(long, required = true)]
    pub path_datasets: String,
    /// Path to output JSON file with the aggregate result.
    #[arg(long, required = true)]
    pub path_output: String,
    /// Variant reader to use.
    #[arg(long, value_enum, default_value_t = ReaderKind::Local)]
    pub reader: ReaderKind,
    /// S3 bucket for large results, used if S3 is configured.
    #[arg(long)]
    pub blob_bucket: Option<String>,
    /// Local directory for large results.
    #[arg(long)]
    pub blob_dir: Option<String>,

    #[command(flatten)]
    pub config: SearchConfig,
}

/// Main entry point for `search run` sub command.
pub fn run_search(args_common: &crate::common::Args, args: &RunArgs) -> Result<(), anyhow::Error> {
    #[tokio::main]
    async fn run(args: &RunArgs) -> Result<super::aggregate::AggregateResult, anyhow::Error> {
        let request: SearchRequest = load_json(&args.path_request)?;
        let datasets: Vec<Dataset> = load_json(&args.path_datasets)?;
        let blobs =
            BlobStore::from_env(args.blob_bucket.as_deref(), args.blob_dir.as_deref()).await?;

        let engine = SearchEngine::new(args.config.clone(), args.reader.build(), blobs);
        let result = engine.search(&request, &datasets).await;
        engine.shutdown();
        Ok(result?)
    }

    let before_anything = Instant::now();
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);
    tracing::info!("beacon-search-worker {}", worker_version());

    let result = run(args)?;
    write_json(&args.path_output, &result)?;
    trace_rss_now();
    tracing::info!("All of `search run` completed in {:?}", before_anything.elapsed());
    Ok(())
}
