use std::fs::File;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use log::info;

use super::constants::{LIBRARY_FILE_EXT, SLICE_FILE_PREFIX};
use crate::fileformat::{self, LibraryEntry, LibraryWriter};
use crate::tile::{TagId, TileLibRef, TileLibrary, TileLibraryParams, TileVariant};
use crate::utils::Throttle;

#[derive(Args)]
pub struct SliceCMD {
    /// Output directory for slice files
    #[arg(short = 'o', value_parser)]
    pub output_dir: PathBuf,

    /// Number of tag-range slices to produce
    #[arg(long = "slices", value_parser = clap::value_parser!(usize), default_value_t = 16)]
    pub slices: usize,

    /// Input library files (merged as they are read)
    #[arg(value_parser, required = true)]
    pub inputs: Vec<PathBuf>,
}

impl SliceCMD {
    /// Run the commandline option
    pub fn try_execute(&mut self) -> Result<()> {
        info!("Running command: slice ({} slices)", self.slices);
        if self.slices == 0 {
            bail!("--slices must be at least 1");
        }

        Slice::run(&Slice {
            output_dir: self.output_dir.clone(),
            slices: self.slices,
            inputs: self.inputs.clone(),
        })?;

        log::info!("Slice has finished successfully");
        Ok(())
    }
}

pub struct Slice {
    pub output_dir: PathBuf,
    pub slices: usize,
    pub inputs: Vec<PathBuf>,
}

impl Slice {
    /// Run the algorithm
    pub fn run(params: &Slice) -> Result<()> {
        let lib = TileLibrary::new(TileLibraryParams {
            retain_no_calls: true,
            track_genomes: true,
            track_sequences: true,
            ..Default::default()
        });
        let cancel = Throttle::new(1);
        for infile in &params.inputs {
            info!("reading {}", infile.display());
            let f = File::open(infile)
                .with_context(|| format!("open {}", infile.display()))?;
            lib.load(f, fileformat::is_gzip_path(infile), &cancel)
                .with_context(|| format!("load {}", infile.display()))?;
        }
        let tagset = match lib.tagset() {
            Some(ts) => ts,
            None => bail!("no tagset found in inputs"),
        };
        let ntags = tagset.len();
        let genomes = lib.take_genomes();
        let refseqs = lib.refseqs();
        info!("{} tags, {} genomes, {} variants", ntags, genomes.len(), lib.len());

        std::fs::create_dir_all(&params.output_dir)
            .with_context(|| format!("create {}", params.output_dir.display()))?;

        let width = (ntags + params.slices - 1) / params.slices;
        for s in 0..params.slices {
            let tagstart = (s * width).min(ntags) as TagId;
            let tagend = ((s + 1) * width).min(ntags) as TagId;
            let path = params.output_dir.join(format!(
                "{}{:04}.{}",
                SLICE_FILE_PREFIX, s, LIBRARY_FILE_EXT
            ));
            info!("writing {} (tags {}..{})", path.display(), tagstart, tagend);
            let writer = LibraryWriter::create(&path)?;
            writer.write_entry(&LibraryEntry {
                tagset: tagset.tags().to_vec(),
                ..Default::default()
            })?;

            // range-local variant tables, sequences included
            let mut tile_variants: Vec<TileVariant> = Vec::new();
            for tag in tagstart..tagend {
                for (variant, hash) in lib.variants_for_tag(tag) {
                    let libref = TileLibRef { tag, variant };
                    let sequence = lib
                        .tile_sequence(libref)
                        .ok_or_else(|| {
                            anyhow::anyhow!("missing sequence for tag {} variant {}", tag, variant)
                        })?;
                    tile_variants.push(TileVariant {
                        tag,
                        variant,
                        blake2b: hash,
                        sequence,
                        is_ref: false,
                    });
                }
            }
            if !tile_variants.is_empty() {
                writer.write_entry(&LibraryEntry {
                    tile_variants,
                    ..Default::default()
                })?;
            }

            // every slice decodes standalone: full reference paths and all
            // flagged reference tiles travel with each one
            lib.write_ref_tiles(&writer)?;
            if !refseqs.is_empty() {
                let compact_sequences = refseqs
                    .iter()
                    .map(|(name, tile_sequences)| crate::tile::CompactSequence {
                        name: name.clone(),
                        tile_sequences: tile_sequences.clone(),
                    })
                    .collect();
                writer.write_entry(&LibraryEntry {
                    compact_sequences,
                    ..Default::default()
                })?;
            }

            let compact_genomes = genomes
                .values()
                .map(|cg| {
                    let lo = 2 * tagstart as usize;
                    let hi = (2 * tagend as usize).min(cg.variants.len());
                    crate::tile::CompactGenome {
                        name: cg.name.clone(),
                        start_tag: tagstart,
                        end_tag: tagend,
                        variants: if lo < hi {
                            cg.variants[lo..hi].to_vec()
                        } else {
                            Vec::new()
                        },
                    }
                })
                .collect();
            writer.write_entry(&LibraryEntry {
                compact_genomes,
                ..Default::default()
            })?;
            writer.finish()?;
        }
        info!(
            "slice wrote {} files in {}",
            params.slices,
            params.output_dir.display()
        );
        Ok(())
    }
}
