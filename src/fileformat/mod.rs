use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;

pub mod bed;
pub mod library;
pub mod npy;

pub use bed::Mask;
pub use library::{decode_library, decode_library_file, LibraryEntry, LibraryWriter};

/// True if the file name asks for transparent gzip.
pub fn is_gzip_path(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("gz")
}

/// Open a file for buffered reading, decompressing if the name ends in .gz.
pub fn open_reader(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let file =
        File::open(path).with_context(|| format!("open {}", path.display()))?;
    let rdr: Box<dyn Read + Send> = if is_gzip_path(path) {
        Box::new(MultiGzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(file)
    };
    Ok(Box::new(BufReader::new(rdr)))
}
