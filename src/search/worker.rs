//! Scanning of one work unit and computation of its match result.

use std::collections::BTreeSet;

use itertools::Itertools;
use regex::Regex;

use crate::err::WorkerError;

use super::matcher::{AltRule, LengthRange, Matcher};
use super::reader::{VariantReader, VcfRecord};
use super::schema::Granularity;
use super::splitter::WorkUnit;

/// Key of a matched variant.
#[derive(
    serde::Serialize, serde::Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone,
)]
pub struct VariantKey {
    pub chrom: String,
    pub pos: u64,
    pub reference: String,
    pub alternate: String,
    /// Value of `INFO/VT`, if any.
    pub variant_type: Option<String>,
}

/// Outcome of one work unit.
#[serde_with::skip_serializing_none]
#[derive(serde::Serialize, serde::Deserialize, PartialEq, Eq, Debug, Clone, Default)]
pub struct MatchResult {
    pub dataset_id: String,
    pub vcf_location: String,
    pub exists: bool,
    pub variants: BTreeSet<VariantKey>,
    pub call_count: u64,
    pub all_alleles_count: u64,
    #[serde(default)]
    pub sample_indices: BTreeSet<usize>,
    #[serde(default)]
    pub sample_names: BTreeSet<String>,
    /// Set if the scan failed; such a result carries no hits.
    pub error: Option<String>,
}

impl MatchResult {
    fn empty(unit: &WorkUnit) -> Self {
        Self {
            dataset_id: unit.dataset_id.clone(),
            vcf_location: unit.vcf_location.clone(),
            ..Default::default()
        }
    }

    /// An errored result for `unit`.
    pub fn errored(unit: &WorkUnit, message: String) -> Self {
        Self {
            error: Some(message),
            ..Self::empty(unit)
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// The INFO subfields used for counting.
#[derive(PartialEq, Eq, Debug, Default)]
struct InfoCounts {
    allele_counts: Option<Vec<u64>>,
    allele_number: Option<u64>,
    variant_type: Option<String>,
}

impl InfoCounts {
    fn parse(info: &str) -> Self {
        let mut result = Self::default();
        for field in info.split(';') {
            if let Some(value) = field.strip_prefix("AC=") {
                result.allele_counts = value
                    .split(',')
                    .map(|v| v.parse::<u64>())
                    .collect::<Result<Vec<_>, _>>()
                    .ok();
            } else if let Some(value) = field.strip_prefix("AN=") {
                result.allele_number = value.parse().ok();
            } else if let Some(value) = field.strip_prefix("VT=") {
                result.variant_type = Some(value.to_string());
            }
        }
        result
    }
}

/// Called alleles of all samples; no-calls (".") are skipped.
fn parse_calls(genotypes: &[String]) -> Vec<usize> {
    genotypes
        .iter()
        .flat_map(|gt| gt.split(|c: char| c == '|' || c == '/'))
        .filter_map(|allele| allele.parse::<usize>().ok())
        .collect()
}

/// Whether the reference check passes, `N` matching any base.
fn reference_matches(requested: &str, reference: &str) -> bool {
    requested == "N"
        || (requested.len() == reference.len()
            && requested
                .bytes()
                .zip(reference.bytes())
                .all(|(q, r)| q == b'N' || q.eq_ignore_ascii_case(&r)))
}

/// Regular expression finding genotypes that carry one of the hit alleles.
fn hit_genotype_re(hit_indexes: &[usize]) -> Result<Regex, regex::Error> {
    let alleles = hit_indexes.iter().map(|i| i + 1).join("|");
    Regex::new(&format!("(^|[|/])({})([|/]|$)", alleles))
}

/// Per-record call and allele counts.
#[derive(PartialEq, Eq, Debug)]
struct RecordCounts {
    /// Call count per hit index, in hit index order.
    calls: Vec<u64>,
    alleles: u64,
}

/// Count calls of the hit alleles and the allele number of one record.
///
/// `AC`/`AN` are used where present unless `force_genotypes` is set, in
/// which case every genotype is parsed.
fn count_record(
    record: &VcfRecord,
    info: &InfoCounts,
    hit_indexes: &[usize],
    force_genotypes: bool,
) -> RecordCounts {
    let mut calls_cache = None;
    let mut all_calls = || -> Vec<usize> {
        calls_cache
            .get_or_insert_with(|| parse_calls(&record.genotypes))
            .clone()
    };

    let calls = match (&info.allele_counts, force_genotypes) {
        (Some(acs), false) if acs.len() == record.alts.len() => hit_indexes
            .iter()
            .map(|&i| acs.get(i).copied().unwrap_or(0))
            .collect(),
        _ => {
            let all_calls = all_calls();
            hit_indexes
                .iter()
                .map(|&i| all_calls.iter().filter(|&&c| c == i + 1).count() as u64)
                .collect()
        }
    };
    let alleles = match (info.allele_number, force_genotypes) {
        (Some(an), false) => an,
        _ => all_calls().len() as u64,
    };

    RecordCounts { calls, alleles }
}

/// Scan the region of `unit` and build its match result.
pub fn scan(unit: &WorkUnit, reader: &dyn VariantReader) -> Result<MatchResult, WorkerError> {
    let before = std::time::Instant::now();
    let matcher = Matcher::new(
        AltRule::new(unit.alternate_bases.as_deref(), unit.variant_type.as_ref()),
        LengthRange::new(unit.variant_min_length, unit.variant_max_length),
    );
    let region = unit.region();
    let stream = reader.query(&unit.vcf_location, &region, &unit.samples)?;
    // AC/AN describe all samples, not the allow-listed ones
    let force_genotypes = !unit.samples.is_empty();

    let mut result = MatchResult::empty(unit);
    let mut records_seen = 0usize;
    for record in stream.records {
        let record = record?;
        records_seen += 1;

        // each record is found by exactly one unit
        if record.pos < unit.region_start || record.pos > unit.region_end {
            continue;
        }
        let end = record.pos + (record.reference.len() as u64).max(1) - 1;
        if end < unit.end_min || end > unit.end_max {
            continue;
        }
        if !reference_matches(&unit.reference_bases, &record.reference) {
            continue;
        }
        let hit_indexes = matcher.hit_indexes(&record.reference, &record.alts);
        if hit_indexes.is_empty() {
            continue;
        }

        let info = InfoCounts::parse(&record.info);
        let counts = count_record(&record, &info, &hit_indexes, force_genotypes);
        for (&i, &calls) in hit_indexes.iter().zip(counts.calls.iter()) {
            if calls > 0 {
                result.variants.insert(VariantKey {
                    chrom: unit.reference_name.clone(),
                    pos: record.pos,
                    reference: record.reference.clone(),
                    alternate: record.alts[i].clone(),
                    variant_type: info.variant_type.clone(),
                });
            }
        }
        let record_calls: u64 = counts.calls.iter().sum();
        result.call_count += record_calls;
        result.all_alleles_count += counts.alleles;

        if record_calls > 0 {
            result.exists = true;
            if unit.include_samples {
                let re = hit_genotype_re(&hit_indexes).map_err(|e| WorkerError::CorruptFormat {
                    location: unit.vcf_location.clone(),
                    message: e.to_string(),
                })?;
                result.sample_indices.extend(
                    record
                        .genotypes
                        .iter()
                        .enumerate()
                        .filter(|(_, gt)| re.is_match(gt))
                        .map(|(i, _)| i),
                );
            }
            if unit.requested_granularity == Granularity::Boolean {
                break;
            }
        }
    }

    if unit.resolve_sample_names() {
        result.sample_names = result
            .sample_indices
            .iter()
            .filter_map(|&i| stream.sample_names.get(i).cloned())
            .collect();
    }

    tracing::debug!(
        "scanned {} in {} records: exists={} calls={} alleles={} in {:?}",
        unit.region(),
        records_seen,
        result.exists,
        result.call_count,
        result.all_alleles_count,
        before.elapsed()
    );
    Ok(result)
}

/// Run one work unit; failures become an errored result.
pub fn perform(unit: &WorkUnit, reader: &dyn VariantReader) -> MatchResult {
    match scan(unit, reader) {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!("work unit on {} failed: {}", &unit.vcf_location, e);
            MatchResult::errored(unit, e.to_string())
        }
    }
}

#[cfg(test)]
pub mod test {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::search::reader::LocalVcfReader;
    use crate::search::schema::{IncludeResultsetResponses, VariantType};

    /// Work unit over `tests/search/small.vcf` covering position 1000.
    pub fn unit_at_1000(vcf_location: &str) -> WorkUnit {
        WorkUnit {
            job_id: uuid::Uuid::nil(),
            dataset_id: "ds-1".into(),
            vcf_location: vcf_location.into(),
            chrom: "1".into(),
            reference_name: "1".into(),
            region_start: 1000,
            region_end: 1001,
            end_min: 1000,
            end_max: 1001,
            reference_bases: "A".into(),
            alternate_bases: Some("G".into()),
            variant_type: None,
            variant_min_length: 0,
            variant_max_length: -1,
            requested_granularity: Granularity::Count,
            include_resultset_responses: IncludeResultsetResponses::All,
            include_samples: false,
            samples: vec![],
        }
    }

    fn record(alts: &[&str], info: &str, genotypes: &[&str]) -> VcfRecord {
        VcfRecord {
            pos: 1000,
            reference: "A".into(),
            alts: alts.iter().map(|s| s.to_string()).collect(),
            info: info.into(),
            genotypes: genotypes.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn info_counts_parse() {
        assert_eq!(
            InfoCounts::parse("DP=10;AC=3,1;AN=10;VT=SNP"),
            InfoCounts {
                allele_counts: Some(vec![3, 1]),
                allele_number: Some(10),
                variant_type: Some("SNP".into()),
            }
        );
        assert_eq!(InfoCounts::parse("."), InfoCounts::default());
    }

    #[rstest]
    #[case(&["0|1", "1/1", "./.", "2"], vec![0, 1, 1, 1, 2])]
    #[case(&["0|1|2"], vec![0, 1, 2])]
    #[case(&[], vec![])]
    fn parse_calls(#[case] genotypes: &[&str], #[case] expected: Vec<usize>) {
        let genotypes = genotypes.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(super::parse_calls(&genotypes), expected);
    }

    #[rstest]
    #[case("N", "ACGT", true)]
    #[case("A", "a", true)]
    #[case("ANG", "ACG", true)]
    #[case("ACG", "ACT", false)]
    #[case("AC", "ACG", false)]
    fn reference_matches(#[case] requested: &str, #[case] reference: &str, #[case] expected: bool) {
        assert_eq!(super::reference_matches(requested, reference), expected);
    }

    #[rstest]
    #[case(&[0], "0|1", true)]
    #[case(&[0], "0|0", false)]
    #[case(&[0], "0/11", false)]
    #[case(&[1], "2/0", true)]
    #[case(&[0, 1], "0|2", true)]
    fn hit_genotype_re(#[case] hits: &[usize], #[case] gt: &str, #[case] expected: bool) {
        let re = super::hit_genotype_re(hits).unwrap();
        assert_eq!(re.is_match(gt), expected);
    }

    #[test]
    fn fast_and_slow_path_agree() {
        let genotypes = &["0|1", "1|1", "0/2", "0|0", "0|0"];
        let with_info = record(&["G", "T"], "AC=3,1;AN=10", genotypes);
        let without_info = record(&["G", "T"], ".", genotypes);

        for hits in [vec![0], vec![1], vec![0, 1]] {
            let fast = count_record(
                &with_info,
                &InfoCounts::parse(&with_info.info),
                &hits,
                false,
            );
            let slow = count_record(
                &without_info,
                &InfoCounts::parse(&without_info.info),
                &hits,
                false,
            );
            let forced = count_record(
                &with_info,
                &InfoCounts::parse(&with_info.info),
                &hits,
                true,
            );
            assert_eq!(fast, slow);
            assert_eq!(fast, forced);
        }
    }

    #[test]
    fn polyploid_genotypes_counted() {
        let rec = record(&["G"], ".", &["0/1/1", "1", "./."]);
        let counts = count_record(&rec, &InfoCounts::default(), &[0], false);
        assert_eq!(
            counts,
            RecordCounts {
                calls: vec![3],
                alleles: 4,
            }
        );
    }

    #[rstest]
    #[case("tests/search/small.vcf")]
    #[case("tests/search/small-noinfo.vcf")]
    fn scan_exact_alt(#[case] path: &str) -> Result<(), anyhow::Error> {
        let result = scan(&unit_at_1000(path), &LocalVcfReader)?;

        assert!(result.exists);
        assert_eq!(result.call_count, 3);
        assert_eq!(result.all_alleles_count, 10);
        assert_eq!(
            result.variants.into_iter().collect::<Vec<_>>(),
            vec![VariantKey {
                chrom: "1".into(),
                pos: 1000,
                reference: "A".into(),
                alternate: "G".into(),
                variant_type: None,
            }]
        );

        Ok(())
    }

    #[test]
    fn scan_length_filter_excludes_snvs() -> Result<(), anyhow::Error> {
        let unit = WorkUnit {
            alternate_bases: Some("N".into()),
            variant_min_length: 2,
            ..unit_at_1000("tests/search/small.vcf")
        };
        let result = scan(&unit, &LocalVcfReader)?;

        assert!(!result.exists);
        assert_eq!(result.call_count, 0);
        assert!(result.variants.is_empty());

        Ok(())
    }

    #[test]
    fn scan_record_samples() -> Result<(), anyhow::Error> {
        let unit = WorkUnit {
            alternate_bases: Some("N".into()),
            requested_granularity: Granularity::Record,
            include_samples: true,
            ..unit_at_1000("tests/search/small.vcf")
        };
        let result = scan(&unit, &LocalVcfReader)?;

        assert!(result.exists);
        assert_eq!(result.call_count, 4);
        assert_eq!(result.variants.len(), 2);
        assert_eq!(
            result.sample_indices.into_iter().collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(
            result.sample_names.into_iter().collect::<Vec<_>>(),
            vec!["s1", "s2", "s3"]
        );

        Ok(())
    }

    #[test]
    fn scan_count_keeps_indices_without_names() -> Result<(), anyhow::Error> {
        let unit = WorkUnit {
            include_samples: true,
            ..unit_at_1000("tests/search/small.vcf")
        };
        let result = scan(&unit, &LocalVcfReader)?;

        assert_eq!(
            result.sample_indices.into_iter().collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert!(result.sample_names.is_empty());

        Ok(())
    }

    #[test]
    fn scan_allow_list_forces_genotypes() -> Result<(), anyhow::Error> {
        let unit = WorkUnit {
            samples: vec!["s2".into(), "s4".into()],
            ..unit_at_1000("tests/search/small.vcf")
        };
        let result = scan(&unit, &LocalVcfReader)?;

        assert!(result.exists);
        assert_eq!(result.call_count, 2);
        assert_eq!(result.all_alleles_count, 4);

        Ok(())
    }

    #[test]
    fn scan_deletion_by_type() -> Result<(), anyhow::Error> {
        let unit = WorkUnit {
            region_start: 1,
            region_end: 10_000,
            end_min: 1,
            end_max: 20_000,
            reference_bases: "N".into(),
            alternate_bases: None,
            variant_type: Some(VariantType::Del),
            ..unit_at_1000("tests/search/small.vcf")
        };
        let result = scan(&unit, &LocalVcfReader)?;

        assert_eq!(
            result
                .variants
                .iter()
                .map(|v| (v.pos, v.alternate.as_str()))
                .collect::<Vec<_>>(),
            vec![(1200, "A")]
        );
        assert_eq!(result.call_count, 1);

        Ok(())
    }

    #[test]
    fn scan_boolean_stops_at_first_hit() -> Result<(), anyhow::Error> {
        let unit = WorkUnit {
            region_start: 1,
            region_end: 10_000,
            end_min: 1,
            end_max: 20_000,
            reference_bases: "N".into(),
            alternate_bases: None,
            requested_granularity: Granularity::Boolean,
            ..unit_at_1000("tests/search/small.vcf")
        };
        let result = scan(&unit, &LocalVcfReader)?;

        assert!(result.exists);
        assert_eq!(
            result.variants.iter().map(|v| v.pos).collect::<Vec<_>>(),
            vec![1000, 1000]
        );

        Ok(())
    }

    #[test]
    fn scan_end_window_excludes_long_reference() -> Result<(), anyhow::Error> {
        let unit = WorkUnit {
            region_start: 1200,
            region_end: 1200,
            end_min: 1200,
            end_max: 1200,
            reference_bases: "N".into(),
            alternate_bases: None,
            ..unit_at_1000("tests/search/small.vcf")
        };
        let result = scan(&unit, &LocalVcfReader)?;

        // REF AT at 1200 ends at 1201
        assert!(!result.exists);

        Ok(())
    }

    #[test]
    fn perform_unreachable_is_errored() {
        let result = perform(
            &unit_at_1000("tests/search/missing.vcf.gz"),
            &LocalVcfReader,
        );

        assert!(result.is_error());
        assert!(!result.exists);
        assert_eq!(result.dataset_id, "ds-1");
    }
}
