//! Selection of hit ALT alleles for one VCF record.

use super::schema::VariantType;

/// Inclusive ALT length range; `max == None` is unbounded.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct LengthRange {
    pub min: usize,
    pub max: Option<usize>,
}

impl LengthRange {
    /// Build from request values; negative `max` means unbounded.
    pub fn new(min: i64, max: i64) -> Self {
        Self {
            min: usize::try_from(min).unwrap_or(0),
            max: usize::try_from(max).ok(),
        }
    }

    pub fn contains(&self, len: usize) -> bool {
        len >= self.min && self.max.map(|max| len <= max).unwrap_or(true)
    }
}

/// How ALT alleles are tested.
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum AltRule {
    /// Upper-cased ALT equals the given bases.
    Exact(String),
    /// Any ALT passes, only the length filter applies.
    Any,
    /// Structural rule for the given type.
    Typed(VariantType),
}

impl AltRule {
    /// Derive the rule from the requested alternate bases and type.
    ///
    /// Literal alternate bases take precedence over a type tag.
    pub fn new(alternate_bases: Option<&str>, variant_type: Option<&VariantType>) -> Self {
        match (alternate_bases, variant_type) {
            (Some(alt), _) if alt != "N" => AltRule::Exact(alt.to_ascii_uppercase()),
            (_, Some(variant_type)) => AltRule::Typed(variant_type.clone()),
            _ => AltRule::Any,
        }
    }
}

/// Whether `alt` consists of `reference` repeated at least `min_times`.
fn is_repeat_of(alt: &str, reference: &str, min_times: usize) -> bool {
    if reference.is_empty() {
        return alt.is_empty() && min_times == 0;
    }
    alt.len() % reference.len() == 0
        && alt.len() / reference.len() >= min_times
        && alt
            .as_bytes()
            .chunks(reference.len())
            .all(|chunk| chunk.eq_ignore_ascii_case(reference.as_bytes()))
}

fn is_base(alt: &str) -> bool {
    matches!(
        alt.to_ascii_uppercase().as_str(),
        "A" | "C" | "G" | "T" | "N"
    )
}

/// Whether one ALT allele is a hit for `variant_type` given the record's REF.
pub fn type_matches(variant_type: &VariantType, reference: &str, alt: &str) -> bool {
    let symbolic = alt.starts_with('<');
    match variant_type {
        VariantType::Del if symbolic => alt.starts_with("<DEL") || alt == "<CN0>",
        VariantType::Del => alt.len() < reference.len(),
        VariantType::Ins if symbolic => alt.starts_with("<INS"),
        VariantType::Ins => alt.len() > reference.len(),
        VariantType::Dup if symbolic => {
            alt.starts_with("<DUP") || (alt.starts_with("<CN") && alt != "<CN0>" && alt != "<CN1>")
        }
        VariantType::Dup => is_repeat_of(alt, reference, 2),
        VariantType::DupTandem if symbolic => alt.starts_with("<DUP:TANDEM") || alt == "<CN2>",
        VariantType::DupTandem => {
            alt.len() == 2 * reference.len() && is_repeat_of(alt, reference, 2)
        }
        VariantType::Cnv if symbolic => {
            alt.starts_with("<CNV")
                || alt.starts_with("<CN")
                || alt.starts_with("<DEL")
                || alt.starts_with("<DUP")
        }
        VariantType::Cnv => alt == "." || is_repeat_of(alt, reference, 0),
        VariantType::Snp if symbolic => false,
        VariantType::Snp => reference.len() == 1 && alt.len() == 1 && is_base(alt),
        VariantType::Other(tag) => symbolic && alt[1..].starts_with(tag.as_str()),
    }
}

/// Combined ALT rule and length filter.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct Matcher {
    pub rule: AltRule,
    pub lengths: LengthRange,
}

impl Matcher {
    pub fn new(rule: AltRule, lengths: LengthRange) -> Self {
        Self { rule, lengths }
    }

    /// 0-based indexes of the ALT alleles that are hits.
    pub fn hit_indexes<S: AsRef<str>>(&self, reference: &str, alts: &[S]) -> Vec<usize> {
        alts.iter()
            .enumerate()
            .filter(|(_, alt)| {
                let alt = alt.as_ref();
                self.lengths.contains(alt.len())
                    && match &self.rule {
                        AltRule::Exact(bases) => alt.to_ascii_uppercase() == *bases,
                        AltRule::Any => true,
                        AltRule::Typed(variant_type) => type_matches(variant_type, reference, alt),
                    }
            })
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0, -1, 0, true)]
    #[case(0, -1, 100_000, true)]
    #[case(2, -1, 1, false)]
    #[case(2, 3, 3, true)]
    #[case(2, 3, 4, false)]
    fn length_range(
        #[case] min: i64,
        #[case] max: i64,
        #[case] len: usize,
        #[case] expected: bool,
    ) {
        assert_eq!(LengthRange::new(min, max).contains(len), expected);
    }

    #[rstest]
    #[case(Some("g"), None, AltRule::Exact("G".into()))]
    #[case(Some("G"), Some(VariantType::Del), AltRule::Exact("G".into()))]
    #[case(Some("N"), Some(VariantType::Del), AltRule::Typed(VariantType::Del))]
    #[case(None, Some(VariantType::Ins), AltRule::Typed(VariantType::Ins))]
    #[case(Some("N"), None, AltRule::Any)]
    #[case(None, None, AltRule::Any)]
    fn alt_rule_new(
        #[case] alt: Option<&str>,
        #[case] variant_type: Option<VariantType>,
        #[case] expected: AltRule,
    ) {
        assert_eq!(AltRule::new(alt, variant_type.as_ref()), expected);
    }

    #[rstest]
    #[case(VariantType::Del, "AT", "A", true)]
    #[case(VariantType::Del, "A", "AT", false)]
    #[case(VariantType::Del, "A", "<DEL:ME>", true)]
    #[case(VariantType::Del, "A", "<CN0>", true)]
    #[case(VariantType::Del, "A", "<CN1>", false)]
    #[case(VariantType::Ins, "A", "AT", true)]
    #[case(VariantType::Ins, "AT", "A", false)]
    #[case(VariantType::Ins, "A", "<INS>", true)]
    #[case(VariantType::Ins, "A", "<DEL>", false)]
    #[case(VariantType::Dup, "AT", "ATAT", true)]
    #[case(VariantType::Dup, "AT", "ATATAT", true)]
    #[case(VariantType::Dup, "AT", "AT", false)]
    #[case(VariantType::Dup, "A", "<CN3>", true)]
    #[case(VariantType::Dup, "A", "<CN1>", false)]
    #[case(VariantType::Dup, "A", "<DUP:TANDEM>", true)]
    #[case(VariantType::DupTandem, "AT", "ATAT", true)]
    #[case(VariantType::DupTandem, "AT", "ATATAT", false)]
    #[case(VariantType::DupTandem, "A", "<CN2>", true)]
    #[case(VariantType::DupTandem, "A", "<DUP>", false)]
    #[case(VariantType::Cnv, "A", ".", true)]
    #[case(VariantType::Cnv, "A", "AAA", true)]
    #[case(VariantType::Cnv, "A", "AG", false)]
    #[case(VariantType::Cnv, "A", "<CN4>", true)]
    #[case(VariantType::Cnv, "A", "<DEL>", true)]
    #[case(VariantType::Cnv, "A", "<INS>", false)]
    #[case(VariantType::Snp, "A", "G", true)]
    #[case(VariantType::Snp, "A", "GT", false)]
    #[case(VariantType::Snp, "A", "*", false)]
    #[case(VariantType::Snp, "A", "<SNP>", false)]
    #[case(VariantType::Other("INV".into()), "A", "<INV>", true)]
    #[case(VariantType::Other("INV".into()), "A", "<DEL>", false)]
    #[case(VariantType::Other("INV".into()), "A", "INV", false)]
    fn type_matches(
        #[case] variant_type: VariantType,
        #[case] reference: &str,
        #[case] alt: &str,
        #[case] expected: bool,
    ) {
        assert_eq!(super::type_matches(&variant_type, reference, alt), expected);
    }

    #[test]
    fn hit_indexes_exact_per_allele() {
        let matcher = Matcher::new(AltRule::Exact("T".into()), LengthRange::new(0, -1));
        assert_eq!(matcher.hit_indexes("A", &["G", "t", "T"]), vec![1, 2]);
    }

    #[test]
    fn hit_indexes_length_only() {
        let matcher = Matcher::new(AltRule::Any, LengthRange::new(2, -1));
        assert_eq!(matcher.hit_indexes("A", &["G", "T"]), Vec::<usize>::new());
        assert_eq!(matcher.hit_indexes("A", &["G", "AT"]), vec![1]);
    }

    #[test]
    fn del_and_ins_are_exclusive() {
        let del = Matcher::new(AltRule::Typed(VariantType::Del), LengthRange::new(0, -1));
        let ins = Matcher::new(AltRule::Typed(VariantType::Ins), LengthRange::new(0, -1));
        let records: &[(&str, &[&str])] = &[
            ("ACGT", &["A", "ACGTT", "<DEL>", "<INS>"]),
            ("A", &["AT", "<CN0>", "G", "ATTT"]),
            ("AT", &["A", "<INS:ME>", "ATAT"]),
        ];

        for &(reference, alts) in records {
            let del_hits = del.hit_indexes(reference, alts);
            let ins_hits = ins.hit_indexes(reference, alts);
            assert!(
                del_hits.iter().all(|i| !ins_hits.contains(i)),
                "{:?} vs {:?} for {} {:?}",
                del_hits,
                ins_hits,
                reference,
                alts
            );
        }
        assert_eq!(del.hit_indexes("ACGT", &["A", "ACGTT", "<DEL>", "<INS>"]), vec![0, 2]);
        assert_eq!(ins.hit_indexes("ACGT", &["A", "ACGTT", "<DEL>", "<INS>"]), vec![1, 3]);
    }
}
