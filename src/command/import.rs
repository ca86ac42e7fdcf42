use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Args;
use log::info;

use crate::fileformat::{self, LibraryEntry, LibraryWriter};
use crate::tile::{
    tile_fasta, tile_seq_variants, CompactGenome, CompactSequence, TagId, TagSet, TileLibrary,
    TileLibraryParams, TileVariantId,
};
use crate::utils::{determine_thread_count, split_phase_suffix};

#[derive(Args)]
pub struct ImportCMD {
    /// Tag library: FASTA or one tag per line, optionally gzipped
    #[arg(long = "tag-library", value_parser)]
    pub tag_library: PathBuf,

    /// Input that is the reference; its tile paths are stored as a named
    /// reference sequence instead of a genome
    #[arg(long = "ref", value_parser)]
    pub ref_input: Option<PathBuf>,

    /// Output library file (gzipped if the name ends in .gz)
    #[arg(short = 'o', value_parser)]
    pub output: PathBuf,

    /// Drop tag matches that appear out of tagset order
    #[arg(long = "skip-ooo", value_parser, default_value = "false")]
    pub skip_ooo: bool,

    /// Keep tiles containing non-acgt bases
    #[arg(long = "include-no-calls", value_parser, default_value = "false")]
    pub include_no_calls: bool,

    /// Stream tile variants (with sequences) into the output
    #[arg(long = "output-tiles", value_parser, default_value = "false")]
    pub output_tiles: bool,

    //Thread settings
    #[arg(short = '@', value_parser = clap::value_parser!(usize))]
    pub num_threads: Option<usize>,

    /// FASTA inputs (files or directories of .fa/.fasta[.gz]); sample
    /// files named NAME.1/NAME.2 fill haplotype 0/1 of genome NAME
    #[arg(value_parser, required = true)]
    pub inputs: Vec<PathBuf>,
}

impl ImportCMD {
    /// Run the commandline option
    pub fn try_execute(&mut self) -> Result<()> {
        let num_threads = determine_thread_count(self.num_threads);
        info!("Running command: import ({} threads)", num_threads);

        Import::run(&Import {
            tag_library: self.tag_library.clone(),
            ref_input: self.ref_input.clone(),
            output: self.output.clone(),
            skip_ooo: self.skip_ooo,
            include_no_calls: self.include_no_calls,
            output_tiles: self.output_tiles,
            num_threads,
            inputs: self.inputs.clone(),
        })?;

        log::info!("Import has finished successfully");
        Ok(())
    }
}

pub struct Import {
    pub tag_library: PathBuf,
    pub ref_input: Option<PathBuf>,
    pub output: PathBuf,
    pub skip_ooo: bool,
    pub include_no_calls: bool,
    pub output_tiles: bool,
    pub num_threads: usize,
    pub inputs: Vec<PathBuf>,
}

impl Import {
    /// Run the algorithm
    pub fn run(params: &Import) -> Result<()> {
        let tags = TagSet::from_reader(fileformat::open_reader(&params.tag_library)?)
            .with_context(|| format!("loading tag library {}", params.tag_library.display()))?;
        let ntags = tags.len();
        info!("tag library: {} tags of length {}", ntags, tags.taglen());

        let writer = LibraryWriter::create(&params.output)?;
        let lib = TileLibrary::new(TileLibraryParams {
            retain_no_calls: params.include_no_calls,
            skip_ooo: params.skip_ooo,
            encoder: if params.output_tiles {
                Some(writer.clone())
            } else {
                None
            },
            track_genomes: false,
            track_sequences: false,
        });
        // the store's encoder passes the tagset through; without one, the
        // decoder still needs the tagset entry first
        lib.set_tagset(tags.tags())?;
        if !params.output_tiles {
            writer.write_entry(&LibraryEntry {
                tagset: tags.tags().to_vec(),
                ..Default::default()
            })?;
        }

        // reference first, so its tiles take the low variant numbers
        let mut infiles: Vec<PathBuf> = Vec::new();
        if let Some(refpath) = &params.ref_input {
            infiles.push(refpath.clone());
        }
        for input in &params.inputs {
            if Some(input) == params.ref_input.as_ref() {
                continue;
            }
            expand_input(input, &mut infiles)?;
        }

        let mut phased: BTreeMap<String, [Option<Vec<TileVariantId>>; 2]> = BTreeMap::new();
        let mut cseqs: Vec<CompactSequence> = Vec::new();

        for infile in &infiles {
            let is_ref = params.ref_input.as_deref() == Some(infile.as_path());
            let filelabel = infile.to_string_lossy().into_owned();
            let (name, phase) = genome_label(infile);
            let rdr = fileformat::open_reader(infile)?;
            let (tseq, _stats) = tile_fasta(&lib, &filelabel, rdr, is_ref, params.num_threads)?;
            if is_ref {
                cseqs.push(CompactSequence {
                    name,
                    tile_sequences: tseq,
                });
                continue;
            }
            let (vars, kept, dropped) = tile_seq_variants(&tseq);
            if vars.len() > ntags {
                bail!("{}: tile path references tag {} outside the tagset", filelabel, vars.len() - 1);
            }
            info!("{}: {} tile positions kept, {} dropped (duplicate tags)", filelabel, kept, dropped);
            let slots = phased.entry(name).or_default();
            match phase {
                Some(p) => slots[p] = Some(vars),
                None => {
                    // unphased input covers both haplotypes
                    slots[0] = Some(vars.clone());
                    slots[1] = Some(vars);
                }
            }
        }

        let mut cgs: Vec<CompactGenome> = Vec::new();
        for (name, slots) in phased {
            let mut variants = vec![0 as TileVariantId; 2 * ntags];
            for (phase, slot) in slots.iter().enumerate() {
                if let Some(vars) = slot {
                    for (tag, v) in vars.iter().enumerate() {
                        variants[2 * tag + phase] = *v;
                    }
                }
            }
            cgs.push(CompactGenome {
                name,
                start_tag: 0,
                end_tag: ntags as TagId,
                variants,
            });
        }
        if !cgs.is_empty() {
            info!("writing {} compact genomes", cgs.len());
            writer.write_entry(&LibraryEntry {
                compact_genomes: cgs,
                ..Default::default()
            })?;
        }
        if !cseqs.is_empty() {
            writer.write_entry(&LibraryEntry {
                compact_sequences: cseqs,
                ..Default::default()
            })?;
        }
        if params.output_tiles {
            lib.write_ref_tiles(&writer)?;
        }
        writer.finish()?;
        info!(
            "import wrote {} variants across {} tags -> {}",
            lib.len(),
            ntags,
            params.output.display()
        );
        Ok(())
    }
}

/// A directory input expands to its .fa/.fasta[.gz] files, sorted.
fn expand_input(input: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    if !input.is_dir() {
        out.push(input.to_path_buf());
        return Ok(());
    }
    let mut found = Vec::new();
    for entry in std::fs::read_dir(input)
        .with_context(|| format!("read directory {}", input.display()))?
    {
        let path = entry?.path();
        let name = path.file_name().map(|s| s.to_string_lossy().into_owned());
        let name = match name {
            Some(n) => n,
            None => continue,
        };
        let stripped = name.strip_suffix(".gz").unwrap_or(&name);
        if stripped.ends_with(".fa") || stripped.ends_with(".fasta") {
            found.push(path);
        }
    }
    if found.is_empty() {
        bail!("no FASTA files found in {}", input.display());
    }
    found.sort();
    out.extend(found);
    Ok(())
}

/// Genome name and phase from a file name: "x/a.2.fasta.gz" is haplotype 1
/// of genome "a"; a name without .1/.2 covers both haplotypes.
fn genome_label(path: &Path) -> (String, Option<usize>) {
    let base = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut stem = base.as_str();
    for suffix in [".gz", ".fasta", ".fa"] {
        if let Some(t) = stem.strip_suffix(suffix) {
            stem = t;
        }
    }
    let (name, phase) = split_phase_suffix(stem);
    (name.to_string(), phase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genome_labels() {
        assert_eq!(genome_label(Path::new("d/a.1.fasta")), ("a".to_string(), Some(0)));
        assert_eq!(genome_label(Path::new("a.2.fa.gz")), ("a".to_string(), Some(1)));
        assert_eq!(genome_label(Path::new("d/ref.fasta")), ("ref".to_string(), None));
    }
}
