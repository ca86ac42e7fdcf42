use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use log::info;
use regex::Regex;

use crate::fileformat::npy::write_npy_u16_file;
use crate::fileformat::{self};
use crate::tile::{CompactGenome, TagId, TileLibRef, TileLibrary, TileLibraryParams, TileVariantId};
use crate::utils::Throttle;

#[derive(Args)]
pub struct ExportMatrixCMD {
    /// Input library file
    #[arg(short = 'i', value_parser)]
    pub input: PathBuf,

    /// Output matrix (numpy format, uint16)
    #[arg(short = 'o', value_parser)]
    pub output: PathBuf,

    /// Recode tile variants as one-hot columns
    #[arg(long = "one-hot", value_parser, default_value = "false")]
    pub one_hot: bool,

    /// With --one-hot, write a TSV mapping output column to tag and variant
    #[arg(long = "output-onehot2tilevar", value_parser)]
    pub librefs_out: Option<PathBuf>,

    /// Only export genomes whose name matches this regex
    #[arg(long = "match-genome", default_value = "")]
    pub match_genome: String,
}

impl ExportMatrixCMD {
    /// Run the commandline option
    pub fn try_execute(&mut self) -> Result<()> {
        info!("Running command: export-matrix");

        ExportMatrix::run(&ExportMatrix {
            input: self.input.clone(),
            output: self.output.clone(),
            one_hot: self.one_hot,
            librefs_out: self.librefs_out.clone(),
            match_genome: self.match_genome.clone(),
        })
    }
}

pub struct ExportMatrix {
    pub input: PathBuf,
    pub output: PathBuf,
    pub one_hot: bool,
    pub librefs_out: Option<PathBuf>,
    pub match_genome: String,
}

impl ExportMatrix {
    /// Run the algorithm
    pub fn run(params: &ExportMatrix) -> Result<()> {
        let matcher = Regex::new(&params.match_genome).with_context(|| {
            format!("--match-genome: invalid regexp {:?}", params.match_genome)
        })?;

        let lib = TileLibrary::new(TileLibraryParams {
            retain_no_calls: true,
            track_genomes: true,
            ..Default::default()
        });
        let cancel = Throttle::new(1);
        let f = File::open(&params.input)
            .with_context(|| format!("open {}", params.input.display()))?;
        lib.load(f, fileformat::is_gzip_path(&params.input), &cancel)?;

        let mut genomes = lib.take_genomes();
        genomes.retain(|name, _| matcher.is_match(name));
        if genomes.is_empty() {
            bail!("no genomes found matching regexp {:?}", params.match_genome);
        }

        info!("building matrix for {} genomes", genomes.len());
        let (mut data, rows, mut cols) = cgs2array(&genomes);

        if params.one_hot {
            info!("recoding to one-hot");
            let (recoded, librefs, outcols) = recode_onehot(&data, cols);
            data = recoded;
            cols = outcols;
            if let Some(path) = &params.librefs_out {
                info!("writing one-hot column mapping {}", path.display());
                let f = File::create(path)
                    .with_context(|| format!("create {}", path.display()))?;
                let mut w = BufWriter::new(f);
                for (i, libref) in librefs.iter().enumerate() {
                    writeln!(w, "{}\t{}\t{}", i, libref.tag, libref.variant)?;
                }
                w.flush()?;
            }
        }

        write_npy_u16_file(&params.output, &data, rows, cols)?;
        Ok(())
    }
}

/// Flatten genomes into a row-major uint16 matrix: one row per genome
/// (sorted by name), cells are raw variant ids, short rows padded with 0.
pub fn cgs2array(cgs: &BTreeMap<String, CompactGenome>) -> (Vec<u16>, usize, usize) {
    let rows = cgs.len();
    let cols = cgs.values().map(|cg| cg.variants.len()).max().unwrap_or(0);
    let mut data = vec![0u16; rows * cols];
    for (row, cg) in cgs.values().enumerate() {
        for (i, v) in cg.variants.iter().enumerate() {
            data[row * cols + i] = *v;
        }
    }
    (data, rows, cols)
}

/// One-hot recoding: input cells are 0 (ref/absent) or a variant rank >= 1.
/// Each input column c expands to max-rank output columns; an output cell
/// is 1 iff the input cell equals that column's rank. Returns the recoded
/// matrix, the output-column -> (tag, variant) mapping, and the output
/// column count.
pub fn recode_onehot(input: &[u16], incols: usize) -> (Vec<u16>, Vec<TileLibRef>, usize) {
    let rows = if incols == 0 { 0 } else { input.len() / incols };
    let mut maxvalue = vec![0u16; incols];
    for row in 0..rows {
        for col in 0..incols {
            let v = input[row * incols + col];
            if maxvalue[col] < v {
                maxvalue[col] = v;
            }
        }
    }

    let mut outcol = vec![0usize; incols];
    let mut librefs: Vec<TileLibRef> = Vec::new();
    let mut outcols = 0usize;
    let mut dropped = 0usize;
    for (incol, &maxv) in maxvalue.iter().enumerate() {
        outcol[incol] = outcols;
        if maxv == 0 {
            dropped += 1;
        }
        for v in 1..=maxv {
            // two input columns per tag (diploid pair)
            librefs.push(TileLibRef {
                tag: (incol / 2) as TagId,
                variant: v as TileVariantId,
            });
            outcols += 1;
        }
    }
    info!("recode_onehot: dropped {} input cols with zero maxvalue", dropped);

    let mut out = vec![0u16; rows * outcols];
    let mut inidx = 0;
    for row in 0..rows {
        let base = row * outcols;
        for col in 0..incols {
            let v = input[inidx];
            if v > 0 {
                out[base + outcol[col] + v as usize - 1] = 1;
            }
            inidx += 1;
        }
    }
    (out, librefs, outcols)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn onehot_trials() {
        struct Trial {
            incols: usize,
            input: Vec<u16>,
            outcols: usize,
            out: Vec<u16>,
        }
        for trial in [
            Trial {
                incols: 2,
                input: vec![1, 1, 1, 1],
                outcols: 2,
                out: vec![1, 1, 1, 1],
            },
            Trial {
                incols: 2,
                input: vec![1, 1, 1, 2],
                outcols: 3,
                out: vec![1, 1, 0, 1, 0, 1],
            },
            Trial {
                // 2nd column expands to 3 one-hot columns, 4th to none
                incols: 4,
                input: vec![
                    1, 1, 0, 0, //
                    1, 2, 1, 0, //
                    1, 3, 0, 0,
                ],
                outcols: 5,
                out: vec![
                    1, 1, 0, 0, 0, //
                    1, 0, 1, 0, 1, //
                    1, 0, 0, 1, 0,
                ],
            },
        ] {
            let (out, _librefs, outcols) = recode_onehot(&trial.input, trial.incols);
            assert_eq!(out, trial.out);
            assert_eq!(outcols, trial.outcols);
        }
    }

    #[test]
    fn onehot_column_sums_match_input_counts() {
        let input: Vec<u16> = vec![2, 1, 0, 2, 2, 1, 1, 0, 2, 2, 0, 1];
        let incols = 3;
        let rows = input.len() / incols;
        let (out, librefs, outcols) = recode_onehot(&input, incols);
        assert_eq!(librefs.len(), outcols);
        // walk output columns per input column and check counts
        let mut oc = 0;
        for col in 0..incols {
            let maxv = (0..rows).map(|r| input[r * incols + col]).max().unwrap();
            for v in 1..=maxv {
                let expect = (0..rows).filter(|r| input[r * incols + col] == v).count();
                let got: u16 = (0..rows).map(|r| out[r * outcols + oc]).sum();
                assert_eq!(got as usize, expect, "col {} rank {}", col, v);
                oc += 1;
            }
        }
        assert_eq!(oc, outcols);
    }

    #[test]
    fn cgs2array_sorts_and_pads() {
        let mut cgs = BTreeMap::new();
        cgs.insert(
            "b".to_string(),
            CompactGenome {
                name: "b".to_string(),
                start_tag: 0,
                end_tag: 2,
                variants: vec![1, 2, 3, 4],
            },
        );
        cgs.insert(
            "a".to_string(),
            CompactGenome {
                name: "a".to_string(),
                start_tag: 0,
                end_tag: 1,
                variants: vec![9, 8],
            },
        );
        let (data, rows, cols) = cgs2array(&cgs);
        assert_eq!((rows, cols), (2, 4));
        assert_eq!(data, vec![9, 8, 0, 0, 1, 2, 3, 4]);
    }
}
