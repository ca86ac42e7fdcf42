use std::fmt;

use clap::Subcommand;

// Module declarations (alphabetical)
pub mod constants;
pub mod export;
pub mod export_matrix;
pub mod import;
pub mod merge;
pub mod slice;
pub mod slice_matrix;
pub mod stats;

pub use export::{Export, ExportCMD};
pub use export_matrix::{ExportMatrix, ExportMatrixCMD};
pub use import::{Import, ImportCMD};
pub use merge::{Merge, MergeCMD};
pub use slice::{Slice, SliceCMD};
pub use slice_matrix::{SliceMatrix, SliceMatrixCMD};
pub use stats::{Stats, StatsCMD};

///////////////////////////////
/// Possible subcommands to parse
#[derive(Subcommand)]
pub enum Commands {
    Import(ImportCMD),
    Merge(MergeCMD),
    Slice(SliceCMD),
    SliceMatrix(SliceMatrixCMD),
    ExportMatrix(ExportMatrixCMD),
    Export(ExportCMD),
    Stats(StatsCMD),
}

impl fmt::Debug for Commands {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cmd = match self {
            Commands::Import(_) => "Import",
            Commands::Merge(_) => "Merge",
            Commands::Slice(_) => "Slice",
            Commands::SliceMatrix(_) => "SliceMatrix",
            Commands::ExportMatrix(_) => "ExportMatrix",
            Commands::Export(_) => "Export",
            Commands::Stats(_) => "Stats",
        };
        write!(f, "{}", cmd)
    }
}
