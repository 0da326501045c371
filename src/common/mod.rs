//! Common functionality.

use byte_unit::Byte;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};

pub mod io;
pub mod s3;

/// Commonly used command line arguments.
#[derive(Parser, Debug)]
pub struct Args {
    /// Verbosity of the program
    #[clap(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            verbose: Verbosity::new(0, 0),
        }
    }
}

/// Helper to print the current memory resident set size via `tracing`.
pub fn trace_rss_now() {
    let rss = procfs::process::Process::myself()
        .and_then(|me| me.stat())
        .map(|stat| stat.rss * procfs::page_size());
    match rss {
        Ok(rss) => tracing::debug!(
            "RSS now: {}",
            Byte::from_u64(rss).get_appropriate_unit(byte_unit::UnitType::Binary)
        ),
        Err(e) => tracing::debug!("could not determine RSS: {}", e),
    }
}

/// Definition of canonical chromosome names.
pub const CHROMS: &[&str] = &[
    "1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12", "13", "14", "15", "16", "17",
    "18", "19", "20", "21", "22", "X", "Y", "MT",
];

/// Aliases that are mapped onto a canonical chromosome name.
const CHROM_ALIASES: &[(&str, &str)] = &[("M", "MT"), ("x", "X"), ("y", "Y")];

/// Map a chromosome name as found in a VCF file ("chr1", "Chr1", "CHRM") to
/// its canonical name by progressively stripping prefix characters.
pub fn canonical_chrom(name: &str) -> Option<&'static str> {
    for (i, _) in name.char_indices() {
        let suffix = &name[i..];
        if let Some(&chrom) = CHROMS.iter().find(|&&c| c == suffix) {
            return Some(chrom);
        }
        if let Some((_, canonical)) = CHROM_ALIASES.iter().find(|(alias, _)| *alias == suffix) {
            return Some(*canonical);
        }
    }
    None
}

/// Select the chromosome name used inside one VCF file for `target`.
///
/// A literal match wins, otherwise names are compared after canonicalization.
pub fn matching_chromosome<'a, I>(vcf_chroms: I, target: &str) -> Option<String>
where
    I: IntoIterator<Item = &'a String>,
{
    let canonical_target = canonical_chrom(target);
    for vcf_chrom in vcf_chroms {
        if vcf_chrom == target {
            return Some(vcf_chrom.clone());
        }
        let canonical = canonical_chrom(vcf_chrom);
        if canonical.is_some() && canonical == canonical_target {
            return Some(vcf_chrom.clone());
        }
    }
    None
}

/// Return the version of the `beacon-search-worker` crate and `x.y.z` in tests.
pub fn worker_version() -> &'static str {
    if cfg!(test) {
        "x.y.z"
    } else {
        env!("CARGO_PKG_VERSION")
    }
}
