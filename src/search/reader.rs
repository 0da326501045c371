//! Region-scoped access to single VCF files.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

use noodles_core::Position;
use noodles_csi::BinningIndex;
use noodles_vcf as vcf;
use vcf::record::genotypes::keys::key::GENOTYPE;

use crate::common::io::open_read_maybe_gz;
use crate::err::WorkerError;

use super::splitter::Region;

/// One VCF data line as seen by the worker.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct VcfRecord {
    /// 1-based position.
    pub pos: u64,
    pub reference: String,
    pub alts: Vec<String>,
    /// Raw `;`-separated INFO column.
    pub info: String,
    /// One GT string per selected sample.
    pub genotypes: Vec<String>,
}

/// Records of one region query.
pub struct RecordStream {
    /// Names of the selected samples, in genotype column order.
    pub sample_names: Vec<String>,
    pub records: Box<dyn Iterator<Item = Result<VcfRecord, WorkerError>> + Send>,
}

/// A region-scoped query over one VCF location.
///
/// An empty `samples` list selects all samples.
pub trait VariantReader: Send + Sync {
    fn query(
        &self,
        location: &str,
        region: &Region,
        samples: &[String],
    ) -> Result<RecordStream, WorkerError>;
}

/// Column indexes and names of the samples to keep.
fn select_samples(all: &[String], samples: &[String]) -> (Vec<usize>, Vec<String>) {
    all.iter()
        .enumerate()
        .filter(|(_, name)| samples.is_empty() || samples.contains(name))
        .map(|(i, name)| (i, name.clone()))
        .unzip()
}

/// Reads VCF files from the local file system with noodles.
///
/// Bgzipped files with a `.tbi` or `.csi` index next to them are queried
/// through the index. Other files are streamed from the start; records of the
/// requested chromosome are then expected to be sorted by position.
#[derive(Debug, Default, Clone)]
pub struct LocalVcfReader;

/// Path of the tabix or CSI index of `location`, if any.
fn index_path(location: &str) -> Option<PathBuf> {
    if !location.ends_with(".gz") {
        return None;
    }
    ["tbi", "csi"]
        .iter()
        .map(|ext| PathBuf::from(format!("{}.{}", location, ext)))
        .find(|path| path.exists())
}

/// Convert a noodles record into the worker's view, keeping `GT` of the
/// selected sample columns.
fn convert_record(record: &vcf::Record, columns: &[usize]) -> VcfRecord {
    let genotypes = record.genotypes();
    VcfRecord {
        pos: usize::from(record.position()) as u64,
        reference: record.reference_bases().to_string(),
        alts: record
            .alternate_bases()
            .iter()
            .map(|allele| allele.to_string())
            .collect(),
        info: record.info().to_string(),
        genotypes: columns
            .iter()
            .map(|&column| {
                genotypes
                    .get_index(column)
                    .and_then(|sample| sample.get(&GENOTYPE))
                    .flatten()
                    .map(|gt| gt.to_string())
                    .unwrap_or_else(|| String::from("."))
            })
            .collect(),
    }
}

fn corrupt(location: &str, e: impl std::fmt::Display) -> WorkerError {
    WorkerError::CorruptFormat {
        location: location.to_string(),
        message: e.to_string(),
    }
}

impl LocalVcfReader {
    fn query_indexed(
        &self,
        location: &str,
        index_path: &Path,
        region: &Region,
        samples: &[String],
    ) -> Result<RecordStream, WorkerError> {
        let open_failed = |source: std::io::Error| WorkerError::Unreachable {
            location: location.to_string(),
            source,
        };
        let builder = match index_path.extension().and_then(|ext| ext.to_str()) {
            Some("csi") => vcf::indexed_reader::Builder::default()
                .set_index(noodles_csi::read(index_path).map_err(open_failed)?),
            _ => vcf::indexed_reader::Builder::default()
                .set_index(noodles_tabix::read(index_path).map_err(open_failed)?),
        };
        let mut reader = builder.build_from_path(location).map_err(open_failed)?;
        let header = reader.read_header().map_err(|e| corrupt(location, e))?;
        let all_samples = header.sample_names().iter().cloned().collect::<Vec<_>>();
        let (columns, sample_names) = select_samples(&all_samples, samples);

        let indexed = reader
            .index()
            .header()
            .map(|h| h.reference_sequence_names().contains(region.chrom.as_str()))
            .unwrap_or(false);
        if !indexed {
            tracing::trace!("{} has no records on {}", location, &region.chrom);
            return Ok(RecordStream {
                sample_names,
                records: Box::new(std::iter::empty()),
            });
        }

        let start = Position::try_from(region.start.max(1) as usize)
            .map_err(|e| corrupt(location, e))?;
        let end = Position::try_from(region.end.max(1) as usize)
            .map_err(|e| corrupt(location, e))?;
        let query_region = noodles_core::Region::new(region.chrom.as_str(), start..=end);

        // the region of one unit is bounded, so its records are buffered
        let mut records = Vec::new();
        for result in reader
            .query(&header, &query_region)
            .map_err(|e| corrupt(location, e))?
        {
            match result {
                Ok(record) => {
                    let record = convert_record(&record, &columns);
                    if record.pos >= region.start {
                        records.push(Ok(record));
                    }
                }
                Err(e) => {
                    records.push(Err(corrupt(location, e)));
                    break;
                }
            }
        }
        tracing::trace!(
            "{} records of {} in {}",
            records.len(),
            region,
            location
        );

        Ok(RecordStream {
            sample_names,
            records: Box::new(records.into_iter()),
        })
    }

    fn query_linear(
        &self,
        location: &str,
        region: &Region,
        samples: &[String],
    ) -> Result<RecordStream, WorkerError> {
        let input = open_read_maybe_gz(location).map_err(|source| WorkerError::Unreachable {
            location: location.to_string(),
            source,
        })?;
        let mut reader = vcf::Reader::new(input);
        let header = reader.read_header().map_err(|e| corrupt(location, e))?;
        let all_samples = header.sample_names().iter().cloned().collect::<Vec<_>>();
        let (columns, sample_names) = select_samples(&all_samples, samples);
        tracing::trace!(
            "{} has {} samples, {} selected, no index",
            location,
            all_samples.len(),
            columns.len()
        );

        Ok(RecordStream {
            sample_names,
            records: Box::new(LinearRecords {
                location: location.to_string(),
                reader,
                header,
                record: vcf::Record::default(),
                region: region.clone(),
                columns,
                seen_chrom: false,
                done: false,
            }),
        })
    }
}

impl VariantReader for LocalVcfReader {
    fn query(
        &self,
        location: &str,
        region: &Region,
        samples: &[String],
    ) -> Result<RecordStream, WorkerError> {
        match index_path(location) {
            Some(index_path) => self.query_indexed(location, &index_path, region, samples),
            None => self.query_linear(location, region, samples),
        }
    }
}

/// Records of an unindexed file, read from the start up to the region end.
struct LinearRecords {
    location: String,
    reader: vcf::Reader<Box<dyn BufRead + Send>>,
    header: vcf::Header,
    record: vcf::Record,
    region: Region,
    columns: Vec<usize>,
    seen_chrom: bool,
    done: bool,
}

impl Iterator for LinearRecords {
    type Item = Result<VcfRecord, WorkerError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match self.reader.read_record(&self.header, &mut self.record) {
                Ok(0) => break,
                Ok(_) => (),
                Err(e) => {
                    self.done = true;
                    return Some(Err(corrupt(&self.location, e)));
                }
            }
            if self.record.chromosome().to_string() != self.region.chrom {
                if self.seen_chrom {
                    break;
                }
                continue;
            }
            self.seen_chrom = true;
            let pos = usize::from(self.record.position()) as u64;
            if pos > self.region.end {
                break;
            }
            if pos >= self.region.start {
                return Some(Ok(convert_record(&self.record, &self.columns)));
            }
        }
        self.done = true;
        None
    }
}

/// Runs `bcftools query` as a subprocess on indexed VCF files.
#[derive(Debug, Clone)]
pub struct BcftoolsReader {
    /// Path to the `bcftools` executable.
    pub bcftools: String,
}

impl Default for BcftoolsReader {
    fn default() -> Self {
        Self {
            bcftools: String::from("bcftools"),
        }
    }
}

const BCFTOOLS_FORMAT: &str = "%POS\t%REF\t%ALT\t%INFO\t[%GT,]\n";

impl BcftoolsReader {
    fn failed(location: &str, message: String) -> WorkerError {
        WorkerError::ReaderFailed {
            location: location.to_string(),
            message,
        }
    }

    fn command(&self, samples: &[String]) -> Command {
        let mut cmd = Command::new(&self.bcftools);
        cmd.arg("query");
        if !samples.is_empty() {
            cmd.arg("--force-samples")
                .arg("--samples")
                .arg(samples.join(","));
        }
        cmd
    }

    /// List sample names of `location` through `bcftools query -l`.
    fn sample_names(&self, location: &str, samples: &[String]) -> Result<Vec<String>, WorkerError> {
        let output = self
            .command(samples)
            .arg("--list-samples")
            .arg(location)
            .output()
            .map_err(|e| Self::failed(location, format!("could not run bcftools: {}", e)))?;
        if !output.status.success() {
            return Err(Self::failed(
                location,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| line.to_string())
            .collect())
    }
}

impl VariantReader for BcftoolsReader {
    fn query(
        &self,
        location: &str,
        region: &Region,
        samples: &[String],
    ) -> Result<RecordStream, WorkerError> {
        let sample_names = self.sample_names(location, samples)?;
        let mut cmd = self.command(samples);
        cmd.arg("--regions")
            .arg(region.to_string())
            .arg("--format")
            .arg(BCFTOOLS_FORMAT)
            .arg(location)
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        tracing::trace!("running {:?}", &cmd);
        let mut child = cmd
            .spawn()
            .map_err(|e| Self::failed(location, format!("could not run bcftools: {}", e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Self::failed(location, "no stdout from bcftools".to_string()))?;

        Ok(RecordStream {
            sample_names,
            records: Box::new(BcftoolsRecords {
                location: location.to_string(),
                child,
                lines: BufReader::new(stdout),
                done: false,
            }),
        })
    }
}

/// Parse one line of `bcftools query` output in `BCFTOOLS_FORMAT`.
fn parse_query_line(location: &str, line: &str) -> Result<VcfRecord, WorkerError> {
    let fields = line
        .trim_end_matches(&['\r', '\n'][..])
        .split('\t')
        .collect::<Vec<_>>();
    let [pos, reference, alts, info, genotypes] = fields.as_slice() else {
        return Err(BcftoolsReader::failed(
            location,
            format!("unexpected bcftools output {:?}", line),
        ));
    };
    Ok(VcfRecord {
        pos: pos
            .parse()
            .map_err(|e| BcftoolsReader::failed(location, format!("invalid position: {}", e)))?,
        reference: reference.to_string(),
        alts: alts.split(',').map(|s| s.to_string()).collect(),
        info: info.to_string(),
        genotypes: genotypes
            .split(',')
            .filter(|gt| !gt.is_empty())
            .map(|gt| gt.to_string())
            .collect(),
    })
}

struct BcftoolsRecords {
    location: String,
    child: Child,
    lines: BufReader<ChildStdout>,
    done: bool,
}

impl BcftoolsRecords {
    fn finish(&mut self) -> Option<WorkerError> {
        self.done = true;
        match self.child.wait() {
            Ok(status) if status.success() => None,
            Ok(status) => Some(BcftoolsReader::failed(
                &self.location,
                format!("bcftools exited with {}", status),
            )),
            Err(e) => Some(BcftoolsReader::failed(&self.location, e.to_string())),
        }
    }
}

impl Iterator for BcftoolsRecords {
    type Item = Result<VcfRecord, WorkerError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut line = String::new();
        match self.lines.read_line(&mut line) {
            Ok(0) => self.finish().map(Err),
            Ok(_) => Some(parse_query_line(&self.location, &line)),
            Err(e) => {
                let _ = self.child.kill();
                let _ = self.finish();
                Some(Err(BcftoolsReader::failed(&self.location, e.to_string())))
            }
        }
    }
}

impl Drop for BcftoolsRecords {
    fn drop(&mut self) {
        if !self.done {
            // stopped early, e.g., on the first hit
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
