use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use itertools::Itertools;
use log::{info, warn};

use super::constants::MAX_DIFF_LENGTH;
use crate::fileformat::{self, decode_library};
use crate::hgvs;
use crate::tile::{CompactGenome, TagId, TileLibRef};
use crate::utils::trim_filename_for_label;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Hgvs,
    Vcf,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hgvs" => Ok(OutputFormat::Hgvs),
            "vcf" => Ok(OutputFormat::Vcf),
            _ => Err(format!("Invalid output format: {}", s)),
        }
    }
}

#[derive(Args)]
pub struct ExportCMD {
    /// Input library file
    #[arg(short = 'i', value_parser)]
    pub input: PathBuf,

    /// Output file, or - for stdout
    #[arg(short = 'o', value_parser, default_value = "-")]
    pub output: PathBuf,

    /// Reference name (if blank, use the last one seen in the input)
    #[arg(long = "ref", default_value = "")]
    pub ref_name: String,

    /// hgvs (one line per variant, one column per genome) or vcf
    /// (left-padded tab rows with genotype columns)
    #[arg(long = "output-format", default_value = "hgvs")]
    pub output_format: OutputFormat,

    /// Also write one BED row per reference tile
    #[arg(long = "output-bed", value_parser)]
    pub output_bed: Option<PathBuf>,
}

impl ExportCMD {
    /// Run the commandline option
    pub fn try_execute(&mut self) -> Result<()> {
        info!("Running command: export");

        Export::run(&Export {
            input: self.input.clone(),
            output: self.output.clone(),
            ref_name: self.ref_name.clone(),
            output_format: self.output_format,
            output_bed: self.output_bed.clone(),
        })
    }
}

pub struct Export {
    pub input: PathBuf,
    pub output: PathBuf,
    pub ref_name: String,
    pub output_format: OutputFormat,
    pub output_bed: Option<PathBuf>,
}

impl Export {
    /// Run the algorithm
    pub fn run(params: &Export) -> Result<()> {
        let mut taglen: Option<usize> = None;
        let mut sequences: HashMap<TileLibRef, Vec<u8>> = HashMap::new();
        let mut genomes: BTreeMap<String, CompactGenome> = BTreeMap::new();
        let mut refseqs: BTreeMap<String, BTreeMap<String, Vec<TileLibRef>>> = BTreeMap::new();
        let mut last_ref: Option<String> = None;
        let f = File::open(&params.input)
            .with_context(|| format!("open {}", params.input.display()))?;
        decode_library(f, fileformat::is_gzip_path(&params.input), |ent| {
            if let Some(tag) = ent.tagset.first() {
                taglen = Some(tag.len());
            }
            for tv in ent.tile_variants {
                sequences
                    .entry(TileLibRef {
                        tag: tv.tag,
                        variant: tv.variant,
                    })
                    .or_insert(tv.sequence);
            }
            for cg in ent.compact_genomes {
                genomes.insert(cg.name.clone(), cg);
            }
            for cseq in ent.compact_sequences {
                last_ref = Some(cseq.name.clone());
                refseqs.insert(cseq.name, cseq.tile_sequences);
            }
            Ok(())
        })?;
        let taglen = taglen.ok_or_else(|| anyhow!("tagset not found"))?;

        let refname = if params.ref_name.is_empty() {
            last_ref
                .ok_or_else(|| anyhow!("no reference sequence in {}", params.input.display()))?
        } else {
            let want = trim_filename_for_label(&params.ref_name);
            refseqs
                .keys()
                .find(|name| **name == params.ref_name || **name == want)
                .cloned()
                .ok_or_else(|| anyhow!("reference {:?} not found", params.ref_name))?
        };
        let refseq = &refseqs[&refname];
        // the reference's own genome entry (if any) is not an export column
        genomes.remove(&refname);
        if genomes.is_empty() {
            bail!("no genomes to export");
        }
        let cgnames: Vec<&String> = genomes.keys().collect();
        info!(
            "exporting {} genomes against reference {:?}",
            cgnames.len(),
            refname
        );

        let mut bedw = match &params.output_bed {
            None => None,
            Some(path) => Some(BufWriter::new(
                File::create(path).with_context(|| format!("create {}", path.display()))?,
            )),
        };

        // chrom -> variant -> per-genome phase presence
        let mut found: BTreeMap<&String, BTreeMap<hgvs::Variant, Vec<[bool; 2]>>> =
            BTreeMap::new();
        for (seqname, librefs) in refseq {
            let chromvars = found.entry(seqname).or_default();
            let mut pos = 0usize;
            for (i, libref) in librefs.iter().enumerate() {
                let tiledata = sequences
                    .get(libref)
                    .ok_or_else(|| {
                        anyhow!(
                            "missing tiledata for tag {} variant {} in {}",
                            libref.tag,
                            libref.variant,
                            seqname
                        )
                    })?;
                let reftilestr = String::from_utf8_lossy(tiledata).to_uppercase();
                let mut diffcache: HashMap<u16, Option<Vec<hgvs::Variant>>> = HashMap::new();
                let mut nonref_alleles = 0usize;
                for (gi, cg) in genomes.values().enumerate() {
                    let base = match libref.tag.checked_sub(cg.start_tag) {
                        Some(t) => 2 * t as usize,
                        None => continue,
                    };
                    for phase in 0..2 {
                        let v = cg.variants.get(base + phase).copied().unwrap_or(0);
                        if v == 0 || v == libref.variant {
                            continue;
                        }
                        nonref_alleles += 1;
                        let diffs = diffcache.entry(v).or_insert_with(|| {
                            diff_tile(
                                &reftilestr,
                                sequences.get(&TileLibRef {
                                    tag: libref.tag,
                                    variant: v,
                                }),
                                tiledata,
                                taglen,
                                seqname,
                                libref.tag,
                            )
                        });
                        if let Some(diffs) = diffs {
                            for d in diffs {
                                let mut d = d.clone();
                                d.position += pos;
                                chromvars.entry(d).or_insert_with(|| {
                                    vec![[false; 2]; genomes.len()]
                                })[gi][phase] = true;
                            }
                        }
                    }
                }

                if let Some(bedw) = bedw.as_mut() {
                    let start = pos;
                    let end = pos + tiledata.len();
                    let thickstart = if i == 0 { 0 } else { start + taglen };
                    let thickend = if i + 1 == librefs.len() {
                        end
                    } else {
                        end - taglen
                    };
                    let total = 2 * genomes.len();
                    let score = if total == 0 {
                        0
                    } else {
                        1000 * nonref_alleles / total
                    };
                    writeln!(
                        bedw,
                        "{} {} {} {} {} . {} {}",
                        seqname, start, end, libref.tag, score, thickstart, thickend
                    )?;
                }
                pos += tiledata.len() - taglen;
            }
        }
        if let Some(mut bedw) = bedw {
            bedw.flush()?;
        }

        let mut out: Box<dyn Write> = if params.output.as_os_str() == "-" {
            Box::new(BufWriter::new(std::io::stdout()))
        } else {
            Box::new(BufWriter::new(File::create(&params.output).with_context(
                || format!("create {}", params.output.display()),
            )?))
        };
        for (seqname, chromvars) in &found {
            for (variant, presence) in chromvars {
                let line = match params.output_format {
                    OutputFormat::Hgvs => presence
                        .iter()
                        .map(|ph| match (ph[0], ph[1]) {
                            (true, true) => format!("{}:g.{}", seqname, variant),
                            (true, false) => format!(
                                "{}:g.[{}];[{}=]",
                                seqname, variant, variant.position
                            ),
                            (false, true) => format!(
                                "{}:g.[{}=];[{}]",
                                seqname, variant.position, variant
                            ),
                            (false, false) => ".".to_string(),
                        })
                        .join("\t"),
                    OutputFormat::Vcf => {
                        let padded = variant.pad_left();
                        let gts = presence
                            .iter()
                            .map(|ph| {
                                format!("{}/{}", ph[0] as u8, ph[1] as u8)
                            })
                            .join("\t");
                        format!(
                            "{}\t{}\t{}\t{}\t{}",
                            seqname, padded.position, padded.ref_seq, padded.new_seq, gts
                        )
                    }
                };
                writeln!(out, "{}", line)?;
            }
        }
        out.flush()?;
        Ok(())
    }
}

/// Diff one variant tile against its reference tile, or None when the
/// variant is not anchored on the reference's trailing tag or the length
/// difference is too large to diff usefully.
fn diff_tile(
    reftilestr: &str,
    varseq: Option<&Vec<u8>>,
    tiledata: &[u8],
    taglen: usize,
    seqname: &str,
    tag: TagId,
) -> Option<Vec<hgvs::Variant>> {
    let varseq = match varseq {
        Some(seq) => seq,
        None => {
            warn!("{} tag {}: variant sequence missing, skipping", seqname, tag);
            return None;
        }
    };
    if varseq.len() < taglen || !tiledata.ends_with(&varseq[varseq.len() - taglen..]) {
        return None;
    }
    if tiledata.len().abs_diff(varseq.len()) > MAX_DIFF_LENGTH {
        return None;
    }
    let varstr = String::from_utf8_lossy(varseq).to_uppercase();
    Some(hgvs::diff(reftilestr, &varstr))
}
