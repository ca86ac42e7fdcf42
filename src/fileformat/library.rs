use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::tile::{CompactGenome, CompactSequence, TileVariant};

///////////////////////////////
/// One self-delimiting record of the library stream. A stream is any
/// sequence of entries; the only ordering requirement is that the tagset
/// appears before anything that references it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LibraryEntry {
    pub tagset: Vec<Vec<u8>>,
    pub tile_variants: Vec<TileVariant>,
    pub compact_genomes: Vec<CompactGenome>,
    pub compact_sequences: Vec<CompactSequence>,
}

enum Sink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Sink::Plain(w) => w.write(buf),
            Sink::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Sink::Plain(w) => w.flush(),
            Sink::Gzip(w) => w.flush(),
        }
    }
}

///////////////////////////////
/// Streaming library encoder. Cloneable; clones share one buffered sink and
/// serialize their writes through a mutex, so concurrent tilers can push
/// entries as tiles are created.
#[derive(Clone)]
pub struct LibraryWriter {
    inner: Arc<Mutex<Option<Sink>>>,
}

impl LibraryWriter {
    /// Create (truncate) a library file; gzip if the name ends in .gz.
    pub fn create(path: &Path) -> Result<LibraryWriter> {
        let file =
            File::create(path).with_context(|| format!("create {}", path.display()))?;
        let bufw = BufWriter::with_capacity(1 << 20, file);
        let sink = if super::is_gzip_path(path) {
            Sink::Gzip(GzEncoder::new(bufw, Compression::default()))
        } else {
            Sink::Plain(bufw)
        };
        Ok(LibraryWriter {
            inner: Arc::new(Mutex::new(Some(sink))),
        })
    }

    pub fn write_entry(&self, entry: &LibraryEntry) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let sink = guard
            .as_mut()
            .ok_or_else(|| anyhow!("library writer already finished"))?;
        bincode::serialize_into(&mut *sink, entry).context("encoding library entry")?;
        Ok(())
    }

    /// Flush and close. Must be called once; writes after this fail.
    pub fn finish(&self) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        match guard.take() {
            None => bail!("library writer already finished"),
            Some(Sink::Plain(mut w)) => {
                w.flush()?;
            }
            Some(Sink::Gzip(w)) => {
                let mut inner = w.finish().context("finishing gzip stream")?;
                inner.flush()?;
            }
        }
        Ok(())
    }
}

/// Decode a library stream, invoking the callback once per entry. The
/// callback keeps whatever state it needs between entries; returning an
/// error aborts the decode.
pub fn decode_library<R: Read>(
    rdr: R,
    gzip: bool,
    mut each: impl FnMut(LibraryEntry) -> Result<()>,
) -> Result<()> {
    let rdr: Box<dyn Read> = if gzip {
        Box::new(MultiGzDecoder::new(BufReader::new(rdr)))
    } else {
        Box::new(rdr)
    };
    let mut rdr = BufReader::with_capacity(1 << 20, rdr);
    loop {
        if rdr.fill_buf().context("reading library stream")?.is_empty() {
            return Ok(());
        }
        let entry: LibraryEntry =
            bincode::deserialize_from(&mut rdr).context("malformed library entry")?;
        each(entry)?;
    }
}

/// decode_library for a file path, inferring gzip from the name.
pub fn decode_library_file(
    path: &Path,
    each: impl FnMut(LibraryEntry) -> Result<()>,
) -> Result<()> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    decode_library(file, super::is_gzip_path(path), each)
        .with_context(|| format!("decode {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::TileLibRef;

    #[test]
    fn round_trip_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lib.wlib");
        let w = LibraryWriter::create(&path).unwrap();
        w.write_entry(&LibraryEntry {
            tagset: vec![b"acgt".to_vec(), b"tgca".to_vec()],
            ..Default::default()
        })
        .unwrap();
        let mut cseq = CompactSequence {
            name: "ref".to_string(),
            ..Default::default()
        };
        cseq.tile_sequences
            .insert("chr1".to_string(), vec![TileLibRef { tag: 0, variant: 1 }]);
        w.write_entry(&LibraryEntry {
            tile_variants: vec![TileVariant {
                tag: 0,
                variant: 1,
                blake2b: [7; 32],
                sequence: b"acgtacgt".to_vec(),
                is_ref: false,
            }],
            compact_genomes: vec![CompactGenome {
                name: "g1".to_string(),
                start_tag: 0,
                end_tag: 2,
                variants: vec![1, 1, 0, 0],
            }],
            compact_sequences: vec![cseq],
            ..Default::default()
        })
        .unwrap();
        w.finish().unwrap();

        let mut entries = Vec::new();
        decode_library_file(&path, |ent| {
            entries.push(ent);
            Ok(())
        })
        .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].tagset.len(), 2);
        assert_eq!(entries[1].tile_variants[0].sequence, b"acgtacgt");
        assert_eq!(entries[1].compact_genomes[0].variants, vec![1, 1, 0, 0]);
        assert_eq!(
            entries[1].compact_sequences[0].tile_sequences["chr1"],
            vec![TileLibRef { tag: 0, variant: 1 }]
        );
    }

    #[test]
    fn gzip_round_trip_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lib.wlib.gz");
        let w = LibraryWriter::create(&path).unwrap();
        w.write_entry(&LibraryEntry {
            tagset: vec![b"acgtacgt".to_vec()],
            ..Default::default()
        })
        .unwrap();
        w.finish().unwrap();

        // plain-read must not parse as a library; gz-read must
        let mut n = 0;
        decode_library_file(&path, |_| {
            n += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn writer_rejects_use_after_finish() {
        let dir = tempfile::tempdir().unwrap();
        let w = LibraryWriter::create(&dir.path().join("x.wlib")).unwrap();
        w.finish().unwrap();
        assert!(w.write_entry(&LibraryEntry::default()).is_err());
        assert!(w.finish().is_err());
    }
}
