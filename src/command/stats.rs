use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use log::info;
use serde::Serialize;

use crate::fileformat::{self, decode_library};

#[derive(Args)]
pub struct StatsCMD {
    /// Input library file, or - for stdin
    #[arg(short = 'i', value_parser, default_value = "-")]
    pub input: PathBuf,

    /// Output file, or - for stdout
    #[arg(short = 'o', value_parser, default_value = "-")]
    pub output: PathBuf,
}

impl StatsCMD {
    /// Run the commandline option
    pub fn try_execute(&mut self) -> Result<()> {
        info!("Running command: stats");

        Stats::run(&Stats {
            input: self.input.clone(),
            output: self.output.clone(),
        })
    }
}

pub struct Stats {
    pub input: PathBuf,
    pub output: PathBuf,
}

#[derive(Default, Serialize)]
struct StatsReport {
    genomes: usize,
    tags: usize,
    tile_variants: usize,
    ref_tile_variants: usize,
    tile_sequence_bytes: u64,
    reference_sequences: Vec<String>,
}

impl Stats {
    /// Run the algorithm
    pub fn run(params: &Stats) -> Result<()> {
        let mut report = StatsReport::default();
        let mut refnames: BTreeSet<String> = BTreeSet::new();

        let gz = fileformat::is_gzip_path(&params.input);
        let each = |ent: fileformat::LibraryEntry| -> Result<()> {
            if !ent.tagset.is_empty() {
                report.tags = ent.tagset.len();
            }
            for tv in &ent.tile_variants {
                if tv.is_ref {
                    report.ref_tile_variants += 1;
                } else {
                    report.tile_variants += 1;
                    report.tile_sequence_bytes += tv.sequence.len() as u64;
                }
            }
            report.genomes += ent.compact_genomes.len();
            for cseq in &ent.compact_sequences {
                refnames.insert(cseq.name.clone());
            }
            Ok(())
        };
        if params.input.as_os_str() == "-" {
            decode_library(std::io::stdin().lock(), false, each)?;
        } else {
            let f = std::fs::File::open(&params.input)
                .with_context(|| format!("open {}", params.input.display()))?;
            decode_library(f, gz, each)?;
        }
        report.reference_sequences = refnames.into_iter().collect();

        if params.output.as_os_str() == "-" {
            let stdout = std::io::stdout();
            let mut w = stdout.lock();
            serde_json::to_writer_pretty(&mut w, &report)?;
            writeln!(w)?;
        } else {
            let mut f = std::fs::File::create(&params.output)
                .with_context(|| format!("create {}", params.output.display()))?;
            serde_json::to_writer_pretty(&mut f, &report)?;
            writeln!(f)?;
        }
        Ok(())
    }
}
