use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use log::info;

use crate::fileformat::{self, LibraryWriter};
use crate::tile::{TileLibrary, TileLibraryParams};
use crate::utils::Throttle;

#[derive(Args)]
pub struct MergeCMD {
    /// Output library file (gzipped if the name ends in .gz)
    #[arg(short = 'o', value_parser)]
    pub output: PathBuf,

    /// Input library files
    #[arg(value_parser, required = true)]
    pub inputs: Vec<PathBuf>,
}

impl MergeCMD {
    /// Run the commandline option
    pub fn try_execute(&mut self) -> Result<()> {
        info!("Running command: merge ({} inputs)", self.inputs.len());

        Merge::run(&Merge {
            output: self.output.clone(),
            inputs: self.inputs.clone(),
        })?;

        log::info!("Merge has finished successfully");
        Ok(())
    }
}

pub struct Merge {
    pub output: PathBuf,
    pub inputs: Vec<PathBuf>,
}

impl Merge {
    /// Run the algorithm
    pub fn run(params: &Merge) -> Result<()> {
        let writer = LibraryWriter::create(&params.output)?;
        // tile identity is (tag, hash): the destination store assigns one
        // variant id per distinct hash, and every input entry is remapped
        // through it as it streams out
        let lib = TileLibrary::new(TileLibraryParams {
            retain_no_calls: true,
            skip_ooo: false,
            encoder: Some(writer.clone()),
            track_genomes: false,
            track_sequences: false,
        });

        let cancel = Throttle::new(1);
        for infile in &params.inputs {
            info!("merging {}", infile.display());
            let f = File::open(infile)
                .with_context(|| format!("open {}", infile.display()))?;
            lib.load(f, fileformat::is_gzip_path(infile), &cancel)
                .with_context(|| format!("merge {}", infile.display()))?;
        }
        lib.write_ref_tiles(&writer)?;
        writer.finish()?;
        info!(
            "merge wrote {} variants -> {}",
            lib.len(),
            params.output.display()
        );
        Ok(())
    }
}
