//! Splitting of one search request into bounded work units.
//!
//! The number of work units only depends on the request interval, the
//! split size and the number of VCF files that carry the requested
//! chromosome, so the fan-out is known before anything is dispatched.

use indexmap::IndexMap;

use crate::common::matching_chromosome;
use crate::err::{ArgError, RequestError};

use super::schema::{Dataset, Granularity, IncludeResultsetResponses, SearchRequest, VariantType};

/// Default maximal span of one work unit.
pub const DEFAULT_SPLIT_SIZE: u64 = 10_000;

/// Default upper bound on the number of work units of one search.
pub const DEFAULT_MAX_FAN_OUT: u64 = 100_000;

/// Start of the unreachable interval used when the window narrowing leaves
/// nothing to search.
pub const DUMMY_START: u64 = 2_000_000_000;

/// 1-based, inclusive search window of a request.
#[derive(serde::Serialize, serde::Deserialize, PartialEq, Eq, Debug, Clone, Copy)]
pub struct SearchWindow {
    pub start_min: u64,
    pub start_max: u64,
    pub end_min: u64,
    pub end_max: u64,
}

impl SearchWindow {
    /// Build window from the 0-based `start`/`end` of a validated request.
    pub fn from_request(request: &SearchRequest) -> Self {
        let (start_min, start_max) = match request.start.as_slice() {
            [min, max] => (*min, Some(*max)),
            [pos, ..] => (*pos, None),
            [] => (0, None),
        };
        let (end_min, end_max) = match request.end.as_slice() {
            [min, max] => (*min, *max),
            [pos, ..] => (start_min, *pos),
            [] => (start_min, start_min),
        };
        let start_max = start_max.unwrap_or(end_max);

        Self {
            start_min: start_min.saturating_add(1),
            start_max: start_max.saturating_add(1),
            end_min: end_min.saturating_add(1),
            end_max: end_max.saturating_add(1),
        }
    }

    /// Narrow the window for literal reference bases.
    ///
    /// A record with `len(ref)` bases starting at `pos` ends at
    /// `pos + len(ref) - 1`, so start and end ranges constrain each other.
    /// An empty result is replaced by an unreachable dummy interval.
    pub fn narrowed(self, reference_bases: &str) -> Self {
        if reference_bases == "N" || reference_bases.is_empty() {
            return self;
        }
        let max_offset = reference_bases.len() as u64 - 1;
        let end_max = self.end_max.min(self.start_max.saturating_add(max_offset));
        let start_min = self
            .start_min
            .max(self.end_min.saturating_sub(max_offset));
        if self.end_min > end_max || start_min > self.start_max {
            tracing::debug!(
                "window {:?} is empty for reference of length {}, using dummy interval",
                &self,
                reference_bases.len()
            );
            Self {
                start_min: DUMMY_START,
                start_max: DUMMY_START,
                end_min: DUMMY_START.saturating_add(max_offset),
                end_max: DUMMY_START.saturating_add(max_offset),
            }
        } else {
            Self {
                start_min,
                start_max: self.start_max,
                end_min: self.end_min,
                end_max,
            }
        }
    }
}

/// Number of chunks of at most `split_size` covering `[start_min, start_max]`.
pub fn chunk_count(start_min: u64, start_max: u64, split_size: u64) -> u64 {
    if start_max < start_min {
        0
    } else {
        (start_max - start_min) / split_size.max(1) + 1
    }
}

/// Contiguous chunks of at most `split_size` covering `[start_min, start_max]`.
pub fn chunks(start_min: u64, start_max: u64, split_size: u64) -> Vec<(u64, u64)> {
    let split_size = split_size.max(1);
    let mut result = Vec::new();
    let mut split_start = start_min;
    while split_start <= start_max {
        let split_end = split_start.saturating_add(split_size - 1).min(start_max);
        result.push((split_start, split_end));
        match split_end.checked_add(1) {
            Some(next) => split_start = next,
            None => break,
        }
    }
    result
}

/// Genomic region string `chrom:start-end` as passed to the variant reader.
#[derive(PartialEq, Eq, Debug, Clone, derive_new::new)]
pub struct Region {
    pub chrom: String,
    pub start: u64,
    pub end: u64,
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}-{}", self.chrom, self.start, self.end)
    }
}

impl std::str::FromStr for Region {
    type Err = ArgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (chrom, range) = s
            .rsplit_once(':')
            .ok_or_else(|| ArgError::RegionInvalidFormat(s.to_string()))?;
        let (start, end) = range
            .split_once('-')
            .ok_or_else(|| ArgError::RegionInvalidFormat(s.to_string()))?;
        if chrom.is_empty() {
            return Err(ArgError::RegionInvalidFormat(s.to_string()));
        }
        Ok(Region::new(chrom.to_string(), start.parse()?, end.parse()?))
    }
}

/// The unit of dispatch: one VCF location and one region chunk.
#[serde_with::skip_serializing_none]
#[derive(serde::Serialize, serde::Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct WorkUnit {
    pub job_id: uuid::Uuid,
    pub dataset_id: String,
    pub vcf_location: String,
    /// Chromosome name as written in this VCF file.
    pub chrom: String,
    /// Chromosome name as requested, used in variant keys.
    pub reference_name: String,
    pub region_start: u64,
    pub region_end: u64,
    pub end_min: u64,
    pub end_max: u64,
    pub reference_bases: String,
    pub alternate_bases: Option<String>,
    pub variant_type: Option<VariantType>,
    pub variant_min_length: i64,
    pub variant_max_length: i64,
    pub requested_granularity: Granularity,
    pub include_resultset_responses: IncludeResultsetResponses,
    #[serde(default)]
    pub include_samples: bool,
    #[serde(default)]
    pub samples: Vec<String>,
}

impl WorkUnit {
    /// The region to scan.
    pub fn region(&self) -> Region {
        Region::new(self.chrom.clone(), self.region_start, self.region_end)
    }

    /// Upper ALT length bound, `None` if unbounded.
    pub fn max_length(&self) -> Option<usize> {
        usize::try_from(self.variant_max_length).ok()
    }

    /// Whether sample names are to be resolved.
    pub fn resolve_sample_names(&self) -> bool {
        self.include_samples && self.requested_granularity == Granularity::Record
    }
}

/// Relevant VCF files of one dataset.
#[derive(serde::Serialize, PartialEq, Eq, Debug, Clone)]
pub struct DatasetPlan {
    pub dataset_id: String,
    /// VCF location to chromosome name in that file.
    pub vcf_locations: IndexMap<String, String>,
    /// Linked VCF groups, restricted to the relevant VCF files.
    pub vcf_groups: Vec<Vec<String>>,
    /// Sample allow-list.
    pub samples: Vec<String>,
}

impl DatasetPlan {
    fn new(dataset: &Dataset, reference_name: &str) -> Self {
        let mut vcf_locations = IndexMap::new();
        for vcf in &dataset.vcf_locations {
            let chrom = match dataset.chromosomes_of(vcf) {
                Some(chroms) => matching_chromosome(chroms, reference_name),
                None => {
                    tracing::debug!(
                        "no chromosome map for {} in dataset {}, assuming {:?}",
                        vcf,
                        &dataset.id,
                        reference_name
                    );
                    Some(reference_name.to_string())
                }
            };
            if let Some(chrom) = chrom {
                vcf_locations.insert(vcf.clone(), chrom);
            }
        }
        let vcf_groups = dataset
            .vcf_groups
            .iter()
            .map(|group| {
                group
                    .iter()
                    .filter(|vcf| vcf_locations.contains_key(vcf.as_str()))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .filter(|group| !group.is_empty())
            .collect();

        Self {
            dataset_id: dataset.id.clone(),
            vcf_locations,
            vcf_groups,
            samples: dataset.samples.clone(),
        }
    }
}

fn vcf_count(datasets: &[DatasetPlan]) -> u64 {
    datasets.iter().map(|d| d.vcf_locations.len() as u64).sum()
}

/// Result of splitting one request over a list of datasets.
#[derive(serde::Serialize, PartialEq, Eq, Debug, Clone)]
pub struct SplitPlan {
    pub window: SearchWindow,
    pub chunks: Vec<(u64, u64)>,
    pub datasets: Vec<DatasetPlan>,
}

impl SplitPlan {
    /// Split `request` over `datasets`; the request must have been validated.
    pub fn new(request: &SearchRequest, datasets: &[Dataset], split_size: u64) -> Self {
        let window = SearchWindow::from_request(request)
            .narrowed(&request.reference_bases.to_ascii_uppercase());
        Self {
            window,
            chunks: chunks(window.start_min, window.start_max, split_size),
            datasets: Self::dataset_plans(request, datasets),
        }
    }

    /// Like [`SplitPlan::new`] but fails before building any chunk if the
    /// plan would exceed `max_fan_out` work units.
    pub fn bounded(
        request: &SearchRequest,
        datasets: &[Dataset],
        split_size: u64,
        max_fan_out: u64,
    ) -> Result<Self, RequestError> {
        let window = SearchWindow::from_request(request)
            .narrowed(&request.reference_bases.to_ascii_uppercase());
        let datasets = Self::dataset_plans(request, datasets);
        let fan_out = chunk_count(window.start_min, window.start_max, split_size)
            .saturating_mul(vcf_count(&datasets));
        if fan_out > max_fan_out {
            return Err(RequestError::FanOutTooLarge {
                fan_out,
                max: max_fan_out,
            });
        }

        Ok(Self {
            window,
            chunks: chunks(window.start_min, window.start_max, split_size),
            datasets,
        })
    }

    fn dataset_plans(request: &SearchRequest, datasets: &[Dataset]) -> Vec<DatasetPlan> {
        datasets
            .iter()
            .map(|dataset| DatasetPlan::new(dataset, &request.reference_name))
            .collect()
    }

    /// Number of work units, known without building them.
    pub fn fan_out(&self) -> u64 {
        (self.chunks.len() as u64).saturating_mul(vcf_count(&self.datasets))
    }

    /// Materialize the work units for `job_id`.
    pub fn work_units(&self, job_id: uuid::Uuid, request: &SearchRequest) -> Vec<WorkUnit> {
        let reference_bases = request.reference_bases.to_ascii_uppercase();
        let alternate_bases = request
            .alternate_bases
            .as_ref()
            .map(|alt| alt.to_ascii_uppercase());

        let mut result = Vec::with_capacity(self.fan_out() as usize);
        for dataset in &self.datasets {
            for &(region_start, region_end) in &self.chunks {
                for (vcf_location, chrom) in &dataset.vcf_locations {
                    result.push(WorkUnit {
                        job_id,
                        dataset_id: dataset.dataset_id.clone(),
                        vcf_location: vcf_location.clone(),
                        chrom: chrom.clone(),
                        reference_name: request.reference_name.clone(),
                        region_start,
                        region_end,
                        end_min: self.window.end_min,
                        end_max: self.window.end_max,
                        reference_bases: reference_bases.clone(),
                        alternate_bases: alternate_bases.clone(),
                        variant_type: request.variant_type.clone(),
                        variant_min_length: request.variant_min_length,
                        variant_max_length: request.variant_max_length,
                        requested_granularity: request.requested_granularity,
                        include_resultset_responses: request.include_resultset_responses,
                        include_samples: request.include_samples,
                        samples: dataset.samples.clone(),
                    });
                }
            }
        }
        result
    }
}
