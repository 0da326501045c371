//! Fan-in of match results into the answer of one search.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use super::blob::BlobStore;
use super::schema::IncludeResultsetResponses;
use super::splitter::SplitPlan;
use super::tracker::{CompletionTracker, JobRecord};
use super::worker::{MatchResult, VariantKey};

/// Per-dataset detail of an aggregate result.
#[derive(serde::Serialize, serde::Deserialize, PartialEq, Eq, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct DatasetResponse {
    pub dataset_id: String,
    pub exists: bool,
    pub variants: BTreeSet<VariantKey>,
    pub call_count: u64,
    pub all_alleles_count: u64,
    pub sample_names: BTreeSet<String>,
    /// VCF locations with at least one hit.
    pub hit_vcfs: BTreeSet<String>,
    /// Indexes of the linked VCF groups containing a hit.
    pub hit_groups: Vec<usize>,
}

impl DatasetResponse {
    fn add(&mut self, result: &MatchResult) {
        self.exists |= result.exists;
        self.variants.extend(result.variants.iter().cloned());
        self.call_count += result.call_count;
        self.all_alleles_count += result.all_alleles_count;
        self.sample_names.extend(result.sample_names.iter().cloned());
        if result.exists {
            self.hit_vcfs.insert(result.vcf_location.clone());
        }
    }
}

/// The answer of one search.
#[serde_with::skip_serializing_none]
#[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    pub job_id: Uuid,
    pub exists: bool,
    /// Number of distinct variants.
    pub variant_count: usize,
    pub variants: BTreeSet<VariantKey>,
    pub call_count: u64,
    pub all_alleles_count: u64,
    /// `call_count / all_alleles_count`, if there are alleles.
    pub frequency: Option<f64>,
    /// Set if the deadline elapsed first; a partial non-existence is not
    /// authoritative.
    pub partial: bool,
    pub fan_out: u64,
    pub received: u64,
    /// Number of errored work units.
    pub errored: u64,
    pub datasets: Vec<DatasetResponse>,
}

/// Commutative fold over match results.
#[derive(PartialEq, Eq, Debug, Clone, Default)]
pub struct Merge {
    pub exists: bool,
    pub variants: BTreeSet<VariantKey>,
    pub call_count: u64,
    pub all_alleles_count: u64,
    pub errored: u64,
    pub datasets: BTreeMap<String, DatasetResponse>,
}

impl Merge {
    /// Fold in one result; detail is kept if `policy` retains it.
    pub fn add(&mut self, result: &MatchResult, policy: IncludeResultsetResponses) {
        if result.is_error() {
            self.errored += 1;
            return;
        }
        self.exists |= result.exists;
        self.variants.extend(result.variants.iter().cloned());
        self.call_count += result.call_count;
        self.all_alleles_count += result.all_alleles_count;
        if policy.retains(result.exists) {
            self.datasets
                .entry(result.dataset_id.clone())
                .or_insert_with(|| DatasetResponse {
                    dataset_id: result.dataset_id.clone(),
                    ..Default::default()
                })
                .add(result);
        }
    }

    /// Account for a result that could not be loaded.
    pub fn add_missing(&mut self) {
        self.errored += 1;
    }

    /// Build the final result.
    pub fn finish(
        self,
        job_id: Uuid,
        plan: &SplitPlan,
        fan_out: u64,
        received: u64,
        partial: bool,
    ) -> AggregateResult {
        let datasets = self
            .datasets
            .into_values()
            .map(|mut dataset| {
                if let Some(dataset_plan) = plan
                    .datasets
                    .iter()
                    .find(|d| d.dataset_id == dataset.dataset_id)
                {
                    dataset.hit_groups = dataset_plan
                        .vcf_groups
                        .iter()
                        .enumerate()
                        .filter(|(_, group)| {
                            group.iter().any(|vcf| dataset.hit_vcfs.contains(vcf))
                        })
                        .map(|(i, _)| i)
                        .collect();
                }
                dataset
            })
            .collect();

        AggregateResult {
            job_id,
            exists: self.exists,
            variant_count: self.variants.len(),
            variants: self.variants,
            call_count: self.call_count,
            all_alleles_count: self.all_alleles_count,
            frequency: (self.all_alleles_count > 0)
                .then(|| self.call_count as f64 / self.all_alleles_count as f64),
            partial,
            fan_out,
            received,
            errored: self.errored,
            datasets,
        }
    }
}

/// Wait until `record` is complete or `deadline` elapses.
///
/// Wakes up on completion and additionally every `poll_interval`.
pub async fn wait_for_completion(
    record: &JobRecord,
    deadline: Instant,
    poll_interval: Duration,
) -> bool {
    loop {
        let notified = record.notified();
        if record.is_complete() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let _ = tokio::time::timeout_at((now + poll_interval).min(deadline), notified).await;
    }
}

/// Wait for job `job_id` and merge its results.
pub async fn aggregate(
    tracker: &CompletionTracker,
    blobs: &BlobStore,
    job_id: Uuid,
    plan: &SplitPlan,
    policy: IncludeResultsetResponses,
    deadline: Instant,
    poll_interval: Duration,
) -> AggregateResult {
    let before = std::time::Instant::now();
    let record = match tracker.get(&job_id) {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!("{}, returning empty partial result", e);
            return Merge::default().finish(job_id, plan, plan.fan_out(), 0, true);
        }
    };

    let complete = wait_for_completion(&record, deadline, poll_interval).await;
    if !complete {
        tracing::warn!(
            "deadline elapsed for job {} with {}/{} results",
            job_id,
            record.received(),
            record.fan_out().unwrap_or_default()
        );
    }

    let mut merge = Merge::default();
    for (response_number, stored) in record.responses() {
        match stored.load(blobs).await {
            Ok(result) => merge.add(&result, policy),
            Err(e) => {
                tracing::warn!(
                    "could not load response {} of job {}: {}",
                    response_number,
                    job_id,
                    e
                );
                merge.add_missing();
            }
        }
    }
    tracing::debug!("merged results of job {} in {:?}", job_id, before.elapsed());

    merge.finish(
        job_id,
        plan,
        record.fan_out().unwrap_or_default(),
        record.received(),
        !complete,
    )
}

#[cfg(test)]
mod test {
    use itertools::Itertools;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::search::schema::{Dataset, SearchRequest};

    fn key(pos: u64, alt: &str) -> VariantKey {
        VariantKey {
            chrom: "1".into(),
            pos,
            reference: "A".into(),
            alternate: alt.into(),
            variant_type: None,
        }
    }

    fn results() -> Vec<MatchResult> {
        vec![
            MatchResult {
                dataset_id: "ds-1".into(),
                vcf_location: "a.vcf.gz".into(),
                exists: true,
                variants: [key(1000, "G")].into_iter().collect(),
                call_count: 3,
                all_alleles_count: 10,
                sample_names: ["s1".to_string(), "s2".to_string()].into_iter().collect(),
                ..Default::default()
            },
            MatchResult {
                dataset_id: "ds-1".into(),
                vcf_location: "b.vcf.gz".into(),
                exists: true,
                variants: [key(1000, "G"), key(1200, "T")].into_iter().collect(),
                call_count: 2,
                all_alleles_count: 6,
                sample_names: ["s2".to_string(), "s9".to_string()].into_iter().collect(),
                ..Default::default()
            },
            MatchResult {
                dataset_id: "ds-2".into(),
                vcf_location: "c.vcf.gz".into(),
                all_alleles_count: 4,
                ..Default::default()
            },
            MatchResult {
                dataset_id: "ds-3".into(),
                vcf_location: "d.vcf.gz".into(),
                error: Some("could not open".into()),
                ..Default::default()
            },
        ]
    }

    fn plan() -> SplitPlan {
        let mut ds = Dataset {
            id: "ds-1".into(),
            vcf_locations: vec!["a.vcf.gz".into(), "b.vcf.gz".into(), "e.vcf.gz".into()],
            ..Default::default()
        };
        ds.vcf_groups = vec![
            vec!["e.vcf.gz".into()],
            vec!["a.vcf.gz".into(), "e.vcf.gz".into()],
        ];
        SplitPlan::new(&SearchRequest::default(), &[ds], 10_000)
    }

    #[test]
    fn merge_is_order_independent() {
        let results = results();
        let expected = {
            let mut merge = Merge::default();
            for result in &results {
                merge.add(result, IncludeResultsetResponses::All);
            }
            merge
        };

        for permutation in results.iter().permutations(results.len()) {
            let mut merge = Merge::default();
            for result in permutation {
                merge.add(result, IncludeResultsetResponses::All);
            }
            assert_eq!(merge, expected);
        }
    }

    #[test]
    fn merge_totals() {
        let mut merge = Merge::default();
        for result in &results() {
            merge.add(result, IncludeResultsetResponses::All);
        }
        let result = merge.finish(Uuid::nil(), &plan(), 4, 4, false);

        assert!(result.exists);
        assert_eq!(result.variant_count, 2);
        assert_eq!(result.call_count, 5);
        assert_eq!(result.all_alleles_count, 20);
        assert_eq!(result.frequency, Some(0.25));
        assert_eq!(result.errored, 1);
        assert_eq!(
            result
                .datasets
                .iter()
                .map(|d| d.dataset_id.as_str())
                .collect::<Vec<_>>(),
            vec!["ds-1", "ds-2"]
        );
        assert_eq!(
            result.datasets[0].sample_names.iter().collect::<Vec<_>>(),
            vec!["s1", "s2", "s9"]
        );
        assert_eq!(result.datasets[0].hit_groups, vec![1]);
    }

    #[rstest]
    #[case(IncludeResultsetResponses::All, vec!["ds-1", "ds-2"])]
    #[case(IncludeResultsetResponses::Hit, vec!["ds-1"])]
    #[case(IncludeResultsetResponses::Miss, vec!["ds-2"])]
    #[case(IncludeResultsetResponses::None, vec![])]
    fn inclusion_policy(
        #[case] policy: IncludeResultsetResponses,
        #[case] expected: Vec<&str>,
    ) {
        let mut merge = Merge::default();
        for result in &results() {
            merge.add(result, policy);
        }
        let result = merge.finish(Uuid::nil(), &plan(), 4, 4, false);

        assert!(result.exists);
        assert_eq!(result.call_count, 5);
        assert_eq!(
            result
                .datasets
                .iter()
                .map(|d| d.dataset_id.as_str())
                .collect::<Vec<_>>(),
            expected
        );
    }

    #[test]
    fn no_alleles_no_frequency() {
        let result = Merge::default().finish(Uuid::nil(), &plan(), 0, 0, false);
        assert_eq!(result.frequency, None);
        assert!(!result.exists);
    }

    #[tokio::test]
    async fn deadline_gives_partial() -> Result<(), anyhow::Error> {
        let tracker = CompletionTracker::default();
        let blobs = BlobStore::default();
        let job_id = tracker.register();
        tracker.set_fan_out(&job_id, 2)?;
        tracker.mark_finished(&job_id)?;

        let result = aggregate(
            &tracker,
            &blobs,
            job_id,
            &plan(),
            IncludeResultsetResponses::All,
            Instant::now() + Duration::from_millis(50),
            Duration::from_millis(10),
        )
        .await;

        assert!(result.partial);
        assert_eq!((result.received, result.fan_out), (1, 2));

        Ok(())
    }

    #[tokio::test]
    async fn unknown_job_gives_partial() {
        let tracker = CompletionTracker::default();
        let result = aggregate(
            &tracker,
            &BlobStore::default(),
            Uuid::new_v4(),
            &plan(),
            IncludeResultsetResponses::All,
            Instant::now(),
            Duration::from_millis(10),
        )
        .await;

        assert!(result.partial);
        assert!(!result.exists);
    }
}
