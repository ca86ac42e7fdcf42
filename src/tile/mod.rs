use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod library;
pub mod lis;
pub mod tagset;
pub mod tiler;

pub use library::{TileLibrary, TileLibraryParams};
pub use tagset::TagSet;
pub use tiler::{tile_fasta, ImportStats};

/// Index of a tag within the tagset.
pub type TagId = u32;

/// 1-based variant number, local to one tag. 0 means "no call" / absent.
pub type TileVariantId = u16;

/// BLAKE2b-256 digest of a tile sequence.
pub type TileHash = [u8; 32];

///////////////////////////////
/// Reference to one tile variant: (tag, variant). variant==0 denotes a
/// skipped or no-call tile.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileLibRef {
    pub tag: TagId,
    pub variant: TileVariantId,
}

/// Tile paths for one FASTA input, keyed by sequence (chromosome) name.
pub type TileSeq = BTreeMap<String, Vec<TileLibRef>>;

///////////////////////////////
/// One tile variant on the wire. `is_ref` marks a copy that belongs to a
/// reference tile path; decoders use flagged entries for reference tile
/// data only and unflagged entries for the per-tag variant tables.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TileVariant {
    pub tag: TagId,
    pub variant: TileVariantId,
    pub blake2b: TileHash,
    pub sequence: Vec<u8>,
    pub is_ref: bool,
}

///////////////////////////////
/// A genome as a flat array of variant ids: variants[2*(tag-start_tag)+phase].
/// Genomes may be sharded by tag range; start_tag/end_tag delimit the range.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CompactGenome {
    pub name: String,
    pub start_tag: TagId,
    pub end_tag: TagId,
    pub variants: Vec<TileVariantId>,
}

///////////////////////////////
/// A named reference: per-chromosome ordered tile paths.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CompactSequence {
    pub name: String,
    pub tile_sequences: BTreeMap<String, Vec<TileLibRef>>,
}

/// Flatten per-chromosome tile paths into one variant-per-tag array.
/// Returns (variants, kept, dropped); a tag appearing in more than one
/// chromosome keeps the last path's variant and counts the rest as dropped.
pub fn tile_seq_variants(tseq: &TileSeq) -> (Vec<TileVariantId>, usize, usize) {
    let mut maxtag = 0usize;
    for refs in tseq.values() {
        for r in refs {
            if maxtag < r.tag as usize {
                maxtag = r.tag as usize;
            }
        }
    }
    let mut vars = vec![0 as TileVariantId; maxtag + 1];
    let (mut kept, mut dropped) = (0, 0);
    for refs in tseq.values() {
        for r in refs {
            if vars[r.tag as usize] != 0 {
                dropped += 1;
            } else {
                kept += 1;
            }
            vars[r.tag as usize] = r.variant;
        }
    }
    (vars, kept, dropped)
}

/// Count called bases (acgt, after lowercasing).
pub fn count_bases(seq: &[u8]) -> usize {
    seq.iter()
        .filter(|b| matches!(**b, b'a' | b'c' | b'g' | b't'))
        .count()
}

/// True if any base is outside {a,c,g,t}.
pub fn has_no_call(seq: &[u8]) -> bool {
    seq.iter()
        .any(|b| !matches!(*b, b'a' | b'c' | b'g' | b't'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_bases_skips_no_calls() {
        assert_eq!(count_bases(b"acgtn"), 4);
        assert_eq!(count_bases(b"nnn"), 0);
        assert!(has_no_call(b"acgn"));
        assert!(!has_no_call(b"acgt"));
    }

    #[test]
    fn tile_seq_variants_flattens_and_counts() {
        let mut tseq = TileSeq::new();
        tseq.insert(
            "chr1".to_string(),
            vec![
                TileLibRef { tag: 0, variant: 1 },
                TileLibRef { tag: 1, variant: 2 },
            ],
        );
        tseq.insert(
            "chr2".to_string(),
            vec![
                TileLibRef { tag: 1, variant: 3 },
                TileLibRef { tag: 3, variant: 1 },
            ],
        );
        let (vars, kept, dropped) = tile_seq_variants(&tseq);
        assert_eq!(vars.len(), 4);
        assert_eq!(vars[0], 1);
        assert_eq!(vars[3], 1);
        assert_eq!(kept, 3);
        assert_eq!(dropped, 1);
    }
}
