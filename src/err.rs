use std::num::ParseIntError;

/// Errors raised while parsing command line or payload arguments.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ArgError {
    #[error("Invalid format in region {0:?}, expected chrom:start-end")]
    RegionInvalidFormat(String),
    #[error("Invalid integer coordinates in region")]
    RegionInvalidInts(#[from] ParseIntError),
}

/// A search request that is rejected before any work unit is created.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("referenceName must not be empty")]
    EmptyReferenceName,
    #[error("referenceBases must be either [ACGTN]+ or N, got {0:?}")]
    InvalidReferenceBases(String),
    #[error("alternateBases must be either [ACGTN]+ or N, got {0:?}")]
    InvalidAlternateBases(String),
    #[error("{field} must have one or two positions, got {len}")]
    InvalidIntervalArity { field: &'static str, len: usize },
    #[error("invalid interval: {0}")]
    InvalidInterval(String),
    #[error("unsupported variant type {0:?}")]
    UnsupportedVariantType(String),
    #[error("invalid variant length range [{min}, {max}]")]
    InvalidLengthRange { min: i64, max: i64 },
    #[error("search needs {fan_out} work units, at most {max} are allowed")]
    FanOutTooLarge { fan_out: u64, max: u64 },
}

/// Failure of one worker invocation; recorded as an errored match result.
#[derive(thiserror::Error, Debug)]
pub enum WorkerError {
    #[error("could not open VCF {location}: {source}")]
    Unreachable {
        location: String,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt VCF {location}: {message}")]
    CorruptFormat { location: String, message: String },
    #[error("variant reader failed on {location}: {message}")]
    ReaderFailed { location: String, message: String },
}

/// Errors of the completion tracker.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("unknown or expired search job {0}")]
    UnknownJob(uuid::Uuid),
    #[error("fan-out of search job {0} has already been set")]
    FanOutAlreadySet(uuid::Uuid),
}

/// Errors when storing or loading out-of-band results.
#[derive(thiserror::Error, Debug)]
pub enum BlobError {
    #[error("no blob at {0}")]
    NotFound(String),
    #[error("blob I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not (de)serialize result: {0}")]
    Json(#[from] serde_json::Error),
    #[error("S3 access failed: {0}")]
    S3(String),
}
