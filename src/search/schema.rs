//! Supporting code for search request and dataset definition.

use std::sync::OnceLock;

use regex::Regex;

use crate::err::RequestError;

/// Largest accepted 0-based position; Beacon coordinates are 32 bit integers.
pub const MAX_POSITION: u64 = i32::MAX as u64;

/// Requested result granularity.
#[derive(
    serde::Serialize,
    serde::Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Clone,
    Copy,
    Default,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Granularity {
    /// Existence only.
    #[default]
    Boolean,
    /// Counts only.
    Count,
    /// Full records.
    Record,
}

/// Which per-unit outcomes are kept in the detailed response.
#[derive(
    serde::Serialize,
    serde::Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Clone,
    Copy,
    Default,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum IncludeResultsetResponses {
    /// Keep detail of all units.
    #[default]
    All,
    /// Keep detail of units that matched.
    Hit,
    /// Keep detail of units that did not match.
    Miss,
    /// Keep no detail at all.
    None,
}

impl IncludeResultsetResponses {
    /// Whether detail of a unit with the given outcome is retained.
    pub fn retains(&self, exists: bool) -> bool {
        match self {
            IncludeResultsetResponses::All => true,
            IncludeResultsetResponses::Hit => exists,
            IncludeResultsetResponses::Miss => !exists,
            IncludeResultsetResponses::None => false,
        }
    }
}

/// Symbolic variant type tag of a request.
#[derive(serde::Serialize, serde::Deserialize, PartialEq, Eq, Hash, Debug, Clone)]
#[serde(try_from = "String", into = "String")]
pub enum VariantType {
    /// Single nucleotide polymorphism.
    Snp,
    /// Insertion.
    Ins,
    /// Deletion.
    Del,
    /// Duplication.
    Dup,
    /// Tandem duplication.
    DupTandem,
    /// Copy number variation.
    Cnv,
    /// Any other structural type, matched by symbolic ALT prefix only.
    Other(String),
}

fn other_type_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z0-9][A-Z0-9:_.]*$").expect("valid regex"))
}

impl std::str::FromStr for VariantType {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "SNP" => VariantType::Snp,
            "INS" => VariantType::Ins,
            "DEL" => VariantType::Del,
            "DUP" => VariantType::Dup,
            "DUP:TANDEM" => VariantType::DupTandem,
            "CNV" => VariantType::Cnv,
            _ if other_type_re().is_match(s) => VariantType::Other(s.to_string()),
            _ => return Err(RequestError::UnsupportedVariantType(s.to_string())),
        })
    }
}

impl std::fmt::Display for VariantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VariantType::Snp => write!(f, "SNP"),
            VariantType::Ins => write!(f, "INS"),
            VariantType::Del => write!(f, "DEL"),
            VariantType::Dup => write!(f, "DUP"),
            VariantType::DupTandem => write!(f, "DUP:TANDEM"),
            VariantType::Cnv => write!(f, "CNV"),
            VariantType::Other(s) => write!(f, "{}", s),
        }
    }
}

impl TryFrom<String> for VariantType {
    type Error = RequestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VariantType> for String {
    fn from(value: VariantType) -> Self {
        value.to_string()
    }
}

fn default_bases() -> String {
    String::from("N")
}

fn default_max_length() -> i64 {
    -1
}

/// One logical variant query.
///
/// Coordinates in `start` and `end` are 0-based, each given either as a
/// single position or as a `[min, max]` pair.
#[serde_with::skip_serializing_none]
#[derive(serde::Serialize, serde::Deserialize, PartialEq, Eq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    /// Reference sequence name, e.g., "1" or "X".
    pub reference_name: String,
    /// Reference bases or "N" for any.
    #[serde(default = "default_bases")]
    pub reference_bases: String,
    /// Alternate bases, "N" for any or absent.
    #[serde(default)]
    pub alternate_bases: Option<String>,
    /// Start position(s).
    pub start: Vec<u64>,
    /// End position(s).
    pub end: Vec<u64>,
    /// Symbolic variant type.
    #[serde(default)]
    pub variant_type: Option<VariantType>,
    /// Minimal ALT length.
    #[serde(default)]
    pub variant_min_length: i64,
    /// Maximal ALT length, negative for unbounded.
    #[serde(default = "default_max_length")]
    pub variant_max_length: i64,
    /// Requested granularity.
    #[serde(default)]
    pub requested_granularity: Granularity,
    /// Inclusion policy for per-dataset detail.
    #[serde(default)]
    pub include_resultset_responses: IncludeResultsetResponses,
    /// Whether to resolve the names of matching samples.
    #[serde(default)]
    pub include_samples: bool,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            reference_name: String::from("1"),
            reference_bases: default_bases(),
            alternate_bases: None,
            start: vec![0],
            end: vec![0],
            variant_type: None,
            variant_min_length: 0,
            variant_max_length: default_max_length(),
            requested_granularity: Granularity::default(),
            include_resultset_responses: IncludeResultsetResponses::default(),
            include_samples: false,
        }
    }
}

fn bases_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^[ACGTN]+$").expect("valid regex"))
}

impl SearchRequest {
    /// Check the request, rejecting malformed input before any dispatch.
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.reference_name.trim().is_empty() {
            return Err(RequestError::EmptyReferenceName);
        }
        if !bases_re().is_match(&self.reference_bases) {
            return Err(RequestError::InvalidReferenceBases(
                self.reference_bases.clone(),
            ));
        }
        if let Some(alt) = self.alternate_bases.as_ref() {
            if !bases_re().is_match(alt) {
                return Err(RequestError::InvalidAlternateBases(alt.clone()));
            }
        }
        for (field, value) in [("start", &self.start), ("end", &self.end)] {
            if value.is_empty() || value.len() > 2 {
                return Err(RequestError::InvalidIntervalArity {
                    field,
                    len: value.len(),
                });
            }
            if let Some(pos) = value.iter().find(|&&pos| pos > MAX_POSITION) {
                return Err(RequestError::InvalidInterval(format!(
                    "{} {} is larger than {}",
                    field, pos, MAX_POSITION
                )));
            }
            if value.len() == 2 && value[0] > value[1] {
                return Err(RequestError::InvalidInterval(format!(
                    "{} min {} is larger than max {}",
                    field, value[0], value[1]
                )));
            }
        }
        if self.start.len() == 1 && self.end.len() == 1 && self.end[0] < self.start[0] {
            return Err(RequestError::InvalidInterval(format!(
                "end {} is before start {}",
                self.end[0], self.start[0]
            )));
        }
        if self.variant_min_length < 0
            || (self.variant_max_length >= 0 && self.variant_max_length < self.variant_min_length)
        {
            return Err(RequestError::InvalidLengthRange {
                min: self.variant_min_length,
                max: self.variant_max_length,
            });
        }
        Ok(())
    }
}

/// Chromosome names as they appear inside one VCF file.
#[derive(serde::Serialize, serde::Deserialize, PartialEq, Eq, Debug, Clone, Default)]
pub struct VcfChromosomes {
    /// VCF location.
    pub vcf: String,
    /// Literal chromosome names in the file.
    pub chromosomes: Vec<String>,
}

/// A registered dataset with its VCF files.
#[derive(serde::Serialize, serde::Deserialize, PartialEq, Eq, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    /// Stable dataset identifier.
    pub id: String,
    /// Assembly identifier, e.g., "GRCh38".
    #[serde(default)]
    pub assembly_id: String,
    /// VCF locations of the dataset.
    pub vcf_locations: Vec<String>,
    /// Per-VCF chromosome naming.
    #[serde(default)]
    pub vcf_chromosome_map: Vec<VcfChromosomes>,
    /// VCF locations that are evaluated jointly.
    #[serde(default)]
    pub vcf_groups: Vec<Vec<String>>,
    /// Optional allow-list of samples to restrict the search to.
    #[serde(default)]
    pub samples: Vec<String>,
}

impl Dataset {
    /// Literal chromosome names known for the given VCF location.
    pub fn chromosomes_of(&self, vcf: &str) -> Option<&Vec<String>> {
        self.vcf_chromosome_map
            .iter()
            .find(|m| m.vcf == vcf)
            .map(|m| &m.chromosomes)
    }
}
