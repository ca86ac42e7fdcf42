use std::path::PathBuf;

use clap::Parser;

use weft::command::Commands;
use weft::runtime;

/// Genome tiling toolkit: tile FASTA genomes against a fixed tagset, merge
/// tile libraries, and materialize genotype matrices for downstream
/// association analysis.
#[derive(Parser)]
#[command(name = "weft", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long = "log-level", global = true, default_value = "info")]
    log_level: runtime::LogLevel,

    #[arg(long = "log-mode", global = true, default_value = "terminal")]
    log_mode: runtime::LogMode,

    #[arg(long = "log-path", global = true, default_value = "weft.log")]
    log_path: PathBuf,
}

fn main() {
    // clap exits with code 2 itself on usage errors
    let mut cli = Cli::parse();
    let _guard =
        runtime::setup_global_logger(cli.log_level, cli.log_mode, cli.log_path.clone());
    log::debug!("Running command: {:?}", cli.command);

    let result = match &mut cli.command {
        Commands::Import(cmd) => cmd.try_execute(),
        Commands::Merge(cmd) => cmd.try_execute(),
        Commands::Slice(cmd) => cmd.try_execute(),
        Commands::SliceMatrix(cmd) => cmd.try_execute(),
        Commands::ExportMatrix(cmd) => cmd.try_execute(),
        Commands::Export(cmd) => cmd.try_execute(),
        Commands::Stats(cmd) => cmd.try_execute(),
    };
    if let Err(err) = result {
        eprintln!("weft: {:#}", err);
        std::process::exit(1);
    }
}
