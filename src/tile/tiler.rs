use std::io::BufRead;
use std::thread;

use anyhow::{anyhow, Result};
use log::{info, warn};
use seq_io::fasta::Record as _;

use super::lis::longest_increasing_subsequence;
use super::{count_bases, TagSet, TileLibRef, TileLibrary, TileSeq};

///////////////////////////////
/// Per-record tiling statistics.
#[derive(Clone, Debug)]
pub struct ImportStats {
    pub input_file: String,
    pub input_label: String,
    pub input_length: usize,
    pub input_coverage: usize,
    pub tile_coverage: usize,
    pub path_length: usize,
    pub dropped_out_of_order_tiles: usize,
}

#[derive(Clone, Copy)]
struct FoundTag {
    pos: usize,
    tagid: u32,
    taglen: usize,
}

struct Job {
    name: String,
    seq: Vec<u8>,
}

enum Outcome {
    Tiled(String, Vec<TileLibRef>, ImportStats),
    Skipped,
    Failed(anyhow::Error),
}

/// Tile one FASTA stream against the library's tagset. Records are pulled
/// off a bounded channel by nthreads workers; each record tiles
/// independently and the per-record path order is deterministic. Records
/// whose name contains '_' are skipped (unplaced/alt contigs). mark_ref
/// records every tile of this input as reference-path data.
pub fn tile_fasta(
    lib: &TileLibrary,
    filelabel: &str,
    rdr: Box<dyn BufRead + Send>,
    mark_ref: bool,
    nthreads: usize,
) -> Result<(TileSeq, Vec<ImportStats>)> {
    let taglib = lib
        .tagset()
        .ok_or_else(|| anyhow!("cannot tile {}: no tagset loaded", filelabel))?;
    let nthreads = nthreads.max(1);

    let (job_tx, job_rx) = crossbeam::channel::bounded::<Job>(nthreads * 4);
    let (res_tx, res_rx) = crossbeam::channel::unbounded::<Outcome>();

    let mut ret = TileSeq::new();
    let mut stats: Vec<ImportStats> = Vec::new();
    let mut skipped_sequences = 0usize;
    let mut first_err: Option<anyhow::Error> = None;

    thread::scope(|s| {
        // single producer: scan records, lowercase, push to the bounded
        // channel (suspends on backpressure)
        let producer_res = res_tx.clone();
        s.spawn(move || {
            let mut reader = seq_io::fasta::Reader::new(rdr);
            while let Some(result) = reader.next() {
                match result {
                    Ok(record) => {
                        let name = match record.id() {
                            Ok(id) => id.to_string(),
                            Err(_) => String::new(),
                        };
                        let mut seq = record.full_seq().into_owned();
                        seq.make_ascii_lowercase();
                        if job_tx.send(Job { name, seq }).is_err() {
                            // consumers gone (error path); stop reading
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = producer_res.send(Outcome::Failed(anyhow!(
                            "{}: {}",
                            filelabel,
                            e
                        )));
                        return;
                    }
                }
            }
        });

        for _ in 0..nthreads {
            let job_rx = job_rx.clone();
            let res_tx = res_tx.clone();
            let taglib = &taglib;
            s.spawn(move || {
                for job in job_rx.iter() {
                    if job.seq.is_empty() {
                        continue;
                    }
                    if job.name.contains('_') {
                        let _ = res_tx.send(Outcome::Skipped);
                        continue;
                    }
                    match tile_record(lib, taglib, filelabel, &job.name, &job.seq, mark_ref) {
                        Ok((path, st)) => {
                            let _ = res_tx.send(Outcome::Tiled(job.name, path, st));
                        }
                        Err(e) => {
                            let _ = res_tx.send(Outcome::Failed(e));
                            return;
                        }
                    }
                }
            });
        }
        drop(res_tx);
        drop(job_rx);

        for outcome in res_rx.iter() {
            match outcome {
                Outcome::Tiled(name, path, st) => {
                    ret.insert(name, path);
                    stats.push(st);
                }
                Outcome::Skipped => skipped_sequences += 1,
                Outcome::Failed(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
    });

    if let Some(e) = first_err {
        return Err(e);
    }

    // channel completion order is nondeterministic; report in record-name
    // order
    stats.sort_by(|a, b| a.input_label.cmp(&b.input_label));
    let total_path: usize = stats.iter().map(|s| s.path_length).sum();
    info!(
        "{} tiled: total path len {} in {} sequences (skipped {} sequences with '_' in name)",
        filelabel,
        total_path,
        ret.len(),
        skipped_sequences
    );
    Ok((ret, stats))
}

/// Tile a single record: find tag matches, optionally drop out-of-order
/// matches, then cut one tile per adjacent match pair. The first match
/// anchors at position 0 of the record (its own position and tag length
/// are not part of the tile geometry), and the last tile runs to the end
/// of the record.
fn tile_record(
    lib: &TileLibrary,
    taglib: &TagSet,
    filelabel: &str,
    name: &str,
    seq: &[u8],
    mark_ref: bool,
) -> Result<(Vec<TileLibRef>, ImportStats)> {
    let mut found: Vec<FoundTag> = Vec::new();
    taglib.find_all(seq, |tagid, pos, taglen| {
        found.push(FoundTag { pos, tagid, taglen })
    });

    let mut dropped = 0usize;
    if lib.skip_ooo() {
        let keys: Vec<u32> = found.iter().map(|f| f.tagid).collect();
        let keep = longest_increasing_subsequence(&keys);
        dropped = found.len() - keep.len();
        for (i, &x) in keep.iter().enumerate() {
            found[i] = found[x];
        }
        found.truncate(keep.len());
    }

    let mut path: Vec<TileLibRef> = Vec::new();
    let mut bases_out = 0usize;
    if found.is_empty() {
        warn!("{} {} no tags found", filelabel, name);
    } else {
        let mut last = FoundTag {
            pos: 0,
            tagid: found[0].tagid,
            taglen: 0,
        };
        for i in 1..found.len() {
            let mut f = found[i];
            let libref = lib.get_ref(last.tagid, &seq[last.pos..f.pos + f.taglen], mark_ref)?;
            path.push(libref);
            if libref.variant > 0 {
                // credit coverage from the end of the previous tag to the
                // end of the current one, so tag bodies are not counted
                // twice
                bases_out += count_bases(&seq[last.pos + last.taglen..f.pos + f.taglen]);
            } else {
                // tile dropped (no-call): let the overlapping tag count
                // toward the following tile instead
                f.taglen = 0;
            }
            last = f;
        }
        let libref = lib.get_ref(last.tagid, &seq[last.pos..], mark_ref)?;
        path.push(libref);
        if libref.variant > 0 {
            bases_out += count_bases(&seq[last.pos + last.taglen..]);
        }
    }

    let stats = ImportStats {
        input_file: filelabel.to_string(),
        input_label: name.to_string(),
        input_length: seq.len(),
        input_coverage: count_bases(seq),
        tile_coverage: bases_out,
        path_length: path.len(),
        dropped_out_of_order_tiles: dropped,
    };
    info!(
        "{} {} fasta in {} coverage in {} coverage out {} path len {} skipped {}",
        filelabel,
        name,
        stats.input_length,
        stats.input_coverage,
        stats.tile_coverage,
        stats.path_length,
        stats.dropped_out_of_order_tiles
    );
    Ok((path, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::{TileLibrary, TileLibraryParams};

    const TAG0: &[u8] = b"aaaaaaaaaacc";
    const TAG1: &[u8] = b"ggggggggggcc";
    const TAG2: &[u8] = b"ttttttttttcc";

    fn lib_with_tags(skip_ooo: bool) -> TileLibrary {
        let lib = TileLibrary::new(TileLibraryParams {
            skip_ooo,
            ..Default::default()
        });
        lib.set_tagset(&[TAG0.to_vec(), TAG1.to_vec(), TAG2.to_vec()])
            .unwrap();
        lib
    }

    fn fasta(records: &[(&str, &[u8])]) -> Box<dyn BufRead + Send> {
        let mut text = Vec::new();
        for (name, seq) in records {
            text.extend_from_slice(format!(">{}\n", name).as_bytes());
            text.extend_from_slice(seq);
            text.push(b'\n');
        }
        Box::new(std::io::Cursor::new(text))
    }

    fn demo_seq() -> Vec<u8> {
        let mut seq = Vec::new();
        seq.extend_from_slice(TAG0);
        seq.extend_from_slice(b"acgtacgtacgt");
        seq.extend_from_slice(TAG1);
        seq.extend_from_slice(b"tgcatgcatgca");
        seq.extend_from_slice(TAG2);
        seq.extend_from_slice(b"acacacacacac");
        seq
    }

    #[test]
    fn deterministic_paths_and_variant_ids() {
        let seq = demo_seq();
        let mut paths = Vec::new();
        for _ in 0..2 {
            let lib = lib_with_tags(false);
            let (tseq, stats) =
                tile_fasta(&lib, "t", fasta(&[("chr1", &seq)]), false, 2).unwrap();
            assert_eq!(stats.len(), 1);
            assert_eq!(stats[0].path_length, 3);
            assert_eq!(stats[0].input_length, seq.len());
            assert_eq!(stats[0].input_coverage, seq.len());
            assert_eq!(stats[0].tile_coverage, seq.len());
            paths.push(tseq["chr1"].clone());
        }
        assert_eq!(paths[0], paths[1]);
        assert_eq!(
            paths[0],
            vec![
                TileLibRef { tag: 0, variant: 1 },
                TileLibRef { tag: 1, variant: 1 },
                TileLibRef { tag: 2, variant: 1 },
            ]
        );
    }

    #[test]
    fn tiles_overlap_on_tag_bodies() {
        let seq = demo_seq();
        let lib = lib_with_tags(false);
        let (tseq, _) = tile_fasta(&lib, "t", fasta(&[("chr1", &seq)]), true, 1).unwrap();
        let path = &tseq["chr1"];
        // tile 0 spans the record start through the end of tag 1
        let t0_end = TAG0.len() + 12 + TAG1.len();
        assert_eq!(
            lib.variant_hash(path[0]).unwrap(),
            crate::tile::library::hash_tile(&seq[..t0_end])
        );
        // tile 1 starts at tag 1
        let t1_start = TAG0.len() + 12;
        let t1_end = t1_start + TAG1.len() + 12 + TAG2.len();
        assert_eq!(
            lib.variant_hash(path[1]).unwrap(),
            crate::tile::library::hash_tile(&seq[t1_start..t1_end])
        );
        // tail tile runs to the record end
        assert_eq!(
            lib.variant_hash(path[2]).unwrap(),
            crate::tile::library::hash_tile(&seq[t1_end - TAG2.len()..])
        );
    }

    #[test]
    fn no_call_tile_dropped_and_coverage_shifted() {
        let mut seq = Vec::new();
        seq.extend_from_slice(TAG0);
        seq.extend_from_slice(b"acgtnnnnacgt"); // no-call in tile 0
        seq.extend_from_slice(TAG1);
        seq.extend_from_slice(b"tgcatgcatgca");
        seq.extend_from_slice(TAG2);
        let lib = lib_with_tags(false);
        let (tseq, stats) = tile_fasta(&lib, "t", fasta(&[("chr1", &seq)]), false, 1).unwrap();
        let path = &tseq["chr1"];
        assert_eq!(path[0].variant, 0);
        assert!(path[1].variant > 0);
        // the dropped tile's trailing tag is credited to the next tile:
        // coverage = tag1..end, all called
        let t1_start = TAG0.len() + 12;
        assert_eq!(stats[0].tile_coverage, seq.len() - t1_start);
    }

    #[test]
    fn skip_ooo_drops_backtracking_tags() {
        // tag order 0,2,1,2 in sequence; LIS keeps 0,2 (first occurrence)
        let mut seq = Vec::new();
        seq.extend_from_slice(TAG0);
        seq.extend_from_slice(b"acgt");
        seq.extend_from_slice(TAG2);
        seq.extend_from_slice(b"acgt");
        seq.extend_from_slice(TAG1);
        seq.extend_from_slice(b"acgt");
        let lib = lib_with_tags(true);
        let (tseq, stats) = tile_fasta(&lib, "t", fasta(&[("chr1", &seq)]), false, 1).unwrap();
        let path = &tseq["chr1"];
        assert_eq!(stats[0].dropped_out_of_order_tiles, 1);
        assert_eq!(path.len(), 2);
        assert_eq!(path[0].tag, 0);
        assert_eq!(path[1].tag, 2);
    }

    #[test]
    fn underscore_names_skipped() {
        let seq = demo_seq();
        let lib = lib_with_tags(false);
        let (tseq, stats) = tile_fasta(
            &lib,
            "t",
            fasta(&[("chr1_alt", &seq), ("chr1", &seq)]),
            false,
            2,
        )
        .unwrap();
        assert_eq!(tseq.len(), 1);
        assert!(tseq.contains_key("chr1"));
        assert_eq!(stats.len(), 1);
    }

    #[test]
    fn record_with_no_tags_yields_empty_path() {
        let lib = lib_with_tags(false);
        let (tseq, stats) =
            tile_fasta(&lib, "t", fasta(&[("chr9", b"acgtacgtacgt")]), false, 1).unwrap();
        assert!(tseq["chr9"].is_empty());
        assert_eq!(stats[0].path_length, 0);
    }
}
