use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use anyhow::{bail, Result};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use log::debug;

use crate::fileformat::library::{decode_library, LibraryEntry, LibraryWriter};
use crate::utils::{determine_thread_count, Throttle};

use super::{
    has_no_call, CompactGenome, CompactSequence, TagId, TagSet, TileHash, TileLibRef,
    TileVariant, TileVariantId,
};

type Blake2b256 = Blake2b<U32>;

/// Content address of a tile sequence.
pub fn hash_tile(seq: &[u8]) -> TileHash {
    Blake2b256::digest(seq).into()
}

struct StoreState {
    // variant[tag] is append-only; index+1 is the variant id
    variant: Vec<Vec<TileHash>>,
    variants: usize,
}

pub struct TileLibraryParams {
    /// Keep tiles containing non-acgt bases. When false, get_ref returns
    /// variant 0 for such tiles without touching the store.
    pub retain_no_calls: bool,
    /// Drop out-of-order tag matches (longest increasing subsequence) while
    /// tiling.
    pub skip_ooo: bool,
    /// Stream newly created tile variants, remapped genomes and sequences
    /// to this writer.
    pub encoder: Option<LibraryWriter>,
    /// Retain remapped genomes in memory (export paths).
    pub track_genomes: bool,
    /// Retain tile sequences in memory, keyed by content hash (slice and
    /// export paths).
    pub track_sequences: bool,
}

impl Default for TileLibraryParams {
    fn default() -> Self {
        TileLibraryParams {
            retain_no_calls: false,
            skip_ooo: false,
            encoder: None,
            track_genomes: false,
            track_sequences: false,
        }
    }
}

///////////////////////////////
/// The content-addressed tile variant store, plus the genome/sequence
/// tables loaded alongside it. The store is the only mutable structure
/// shared between tilers and mergers; all tables are lock-guarded and
/// variant tables are append-only for the lifetime of one assembly.
pub struct TileLibrary {
    retain_no_calls: bool,
    skip_ooo: bool,
    track_genomes: bool,
    track_sequences: bool,
    taglib: RwLock<Option<Arc<TagSet>>>,
    state: Mutex<StoreState>,
    encoder: Option<LibraryWriter>,
    compact_genomes: Mutex<BTreeMap<String, CompactGenome>>,
    refseqs: Mutex<BTreeMap<String, BTreeMap<String, Vec<TileLibRef>>>>,
    // sequences of tiles on a reference path, keyed by their store ref
    ref_tiles: Mutex<BTreeMap<TileLibRef, Vec<u8>>>,
    // all tile sequences by content hash, kept only when track_sequences
    sequences: Mutex<HashMap<TileHash, Vec<u8>>>,
}

impl TileLibrary {
    pub fn new(params: TileLibraryParams) -> TileLibrary {
        TileLibrary {
            retain_no_calls: params.retain_no_calls,
            skip_ooo: params.skip_ooo,
            track_genomes: params.track_genomes,
            track_sequences: params.track_sequences,
            taglib: RwLock::new(None),
            state: Mutex::new(StoreState {
                variant: Vec::new(),
                variants: 0,
            }),
            encoder: params.encoder,
            compact_genomes: Mutex::new(BTreeMap::new()),
            refseqs: Mutex::new(BTreeMap::new()),
            ref_tiles: Mutex::new(BTreeMap::new()),
            sequences: Mutex::new(HashMap::new()),
        }
    }

    pub fn skip_ooo(&self) -> bool {
        self.skip_ooo
    }

    pub fn tagset(&self) -> Option<Arc<TagSet>> {
        self.taglib.read().unwrap().clone()
    }

    /// Install the tagset, or check it against the one already installed.
    /// The first tagset seen is passed through to the encoder; later inputs
    /// must match it bit for bit.
    pub fn set_tagset(&self, newtagset: &[Vec<u8>]) -> Result<()> {
        if newtagset.is_empty() {
            return Ok(());
        }
        let mut guard = self.taglib.write().unwrap();
        match guard.as_ref() {
            None => {
                let ts = TagSet::new(newtagset.to_vec())?;
                if let Some(enc) = &self.encoder {
                    enc.write_entry(&LibraryEntry {
                        tagset: ts.tags().to_vec(),
                        ..Default::default()
                    })?;
                }
                *guard = Some(Arc::new(ts));
            }
            Some(current) => {
                let same = current.len() == newtagset.len()
                    && current.tags().iter().zip(newtagset.iter()).all(|(a, b)| {
                        a.eq_ignore_ascii_case(b)
                    });
                if !same {
                    bail!("cannot merge libraries with differing tagsets");
                }
            }
        }
        Ok(())
    }

    /// Total variants across all tags.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().variants
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up (tag, seq), adding the sequence to the store if new. If the
    /// library rejects no-calls and seq has any base outside {a,c,g,t},
    /// returns variant 0 and leaves the store untouched. mark_ref records
    /// the tile as belonging to a reference path.
    pub fn get_ref(&self, tag: TagId, seq: &[u8], mark_ref: bool) -> Result<TileLibRef> {
        if !self.retain_no_calls && has_no_call(seq) {
            return Ok(TileLibRef { tag, variant: 0 });
        }
        let seqhash = hash_tile(seq);
        let (libref, created) = {
            let mut state = self.state.lock().unwrap();
            if state.variant.len() <= tag as usize {
                state.variant.resize(tag as usize + 1, Vec::new());
            }
            let table = &mut state.variant[tag as usize];
            match table.iter().position(|h| *h == seqhash) {
                Some(i) => (
                    TileLibRef {
                        tag,
                        variant: (i + 1) as TileVariantId,
                    },
                    false,
                ),
                None => {
                    if table.len() >= TileVariantId::MAX as usize {
                        bail!("tag {}: variant table overflow", tag);
                    }
                    table.push(seqhash);
                    let variant = table.len() as TileVariantId;
                    state.variants += 1;
                    (TileLibRef { tag, variant }, true)
                }
            }
        };
        if mark_ref && libref.variant > 0 {
            self.ref_tiles
                .lock()
                .unwrap()
                .entry(libref)
                .or_insert_with(|| seq.to_vec());
        }
        if self.track_sequences && created {
            self.sequences.lock().unwrap().insert(seqhash, seq.to_vec());
        }
        if created {
            if let Some(enc) = &self.encoder {
                enc.write_entry(&LibraryEntry {
                    tile_variants: vec![TileVariant {
                        tag,
                        variant: libref.variant,
                        blake2b: seqhash,
                        sequence: seq.to_vec(),
                        is_ref: false,
                    }],
                    ..Default::default()
                })?;
            }
        }
        Ok(libref)
    }

    pub fn variant_hash(&self, libref: TileLibRef) -> Option<TileHash> {
        let state = self.state.lock().unwrap();
        state
            .variant
            .get(libref.tag as usize)?
            .get(libref.variant as usize - 1)
            .copied()
    }

    /// All variants of one tag as (variant, hash), in id order.
    pub fn variants_for_tag(&self, tag: TagId) -> Vec<(TileVariantId, TileHash)> {
        let state = self.state.lock().unwrap();
        match state.variant.get(tag as usize) {
            None => Vec::new(),
            Some(table) => table
                .iter()
                .enumerate()
                .map(|(i, h)| ((i + 1) as TileVariantId, *h))
                .collect(),
        }
    }

    /// Sequence bytes of a stored tile, available when track_sequences is
    /// set.
    pub fn tile_sequence(&self, libref: TileLibRef) -> Option<Vec<u8>> {
        let hash = self.variant_hash(libref)?;
        self.sequences.lock().unwrap().get(&hash).cloned()
    }

    /// Emit one flagged TileVariants batch covering every tile recorded on
    /// a reference path, sequences included. Decoders use these entries as
    /// reference tile data.
    pub fn write_ref_tiles(&self, w: &LibraryWriter) -> Result<()> {
        let ref_tiles = self.ref_tiles.lock().unwrap();
        if ref_tiles.is_empty() {
            return Ok(());
        }
        let tile_variants = ref_tiles
            .iter()
            .map(|(libref, seq)| TileVariant {
                tag: libref.tag,
                variant: libref.variant,
                blake2b: hash_tile(seq),
                sequence: seq.clone(),
                is_ref: true,
            })
            .collect();
        w.write_entry(&LibraryEntry {
            tile_variants,
            ..Default::default()
        })
    }

    /// Remapped genomes retained when track_genomes is set.
    pub fn take_genomes(&self) -> BTreeMap<String, CompactGenome> {
        std::mem::take(&mut *self.compact_genomes.lock().unwrap())
    }

    pub fn refseqs(&self) -> BTreeMap<String, BTreeMap<String, Vec<TileLibRef>>> {
        self.refseqs.lock().unwrap().clone()
    }

    ///////////////////////////////
    /// Load a library stream into this one. Tile variants are renumbered to
    /// this store's ids; genome and sequence entries are remapped to match
    /// and re-encoded. cancel is observed at every entry and task boundary.
    pub fn load<R: Read>(&self, rdr: R, gzip: bool, cancel: &Throttle) -> Result<()> {
        let mut variantmap: HashMap<TileLibRef, TileVariantId> = HashMap::new();
        let mut cgs: Vec<CompactGenome> = Vec::new();
        let mut cseqs: Vec<CompactSequence> = Vec::new();
        decode_library(rdr, gzip, |ent| {
            cancel.check()?;
            self.set_tagset(&ent.tagset)?;
            self.load_tile_variants(&ent.tile_variants, &mut variantmap)?;
            cgs.extend(ent.compact_genomes);
            cseqs.extend(ent.compact_sequences);
            Ok(())
        })?;
        cancel.check()?;
        self.load_compact_genomes(cgs, &variantmap, cancel)?;
        self.load_compact_sequences(cseqs, &variantmap)?;
        Ok(())
    }

    /// Assign a store-local variant id for each input variant, recording
    /// the translation keyed by the input's (tag, variant).
    fn load_tile_variants(
        &self,
        tvs: &[TileVariant],
        variantmap: &mut HashMap<TileLibRef, TileVariantId>,
    ) -> Result<()> {
        for tv in tvs {
            let dest = self.get_ref(tv.tag, &tv.sequence, tv.is_ref)?;
            variantmap.insert(
                TileLibRef {
                    tag: tv.tag,
                    variant: tv.variant,
                },
                dest.variant,
            );
        }
        Ok(())
    }

    /// Remap genome cells through variantmap, one worker per genome. A cell
    /// whose source variant is missing from the map is an invariant
    /// violation and fails the load; workers already running finish, and
    /// the store stays consistent with the entries accepted so far.
    fn load_compact_genomes(
        &self,
        cgs: Vec<CompactGenome>,
        variantmap: &HashMap<TileLibRef, TileVariantId>,
        cancel: &Throttle,
    ) -> Result<()> {
        if cgs.is_empty() {
            return Ok(());
        }
        debug!("load_compact_genomes: {}", cgs.len());
        let throttle = Throttle::new(determine_thread_count(None));
        thread::scope(|s| {
            let throttle = &throttle;
            for mut cg in cgs {
                throttle.go(s, move || {
                    for i in 0..cg.variants.len() {
                        if throttle.is_cancelled() || cancel.is_cancelled() {
                            return Ok(());
                        }
                        let v = cg.variants[i];
                        if v == 0 {
                            continue;
                        }
                        let tag = cg.start_tag + (i / 2) as TagId;
                        match variantmap.get(&TileLibRef { tag, variant: v }) {
                            Some(&newv) => cg.variants[i] = newv,
                            None => bail!(
                                "genome {:?} has variant {} for tag {}, but that variant was not in its library",
                                cg.name,
                                v,
                                tag
                            ),
                        }
                    }
                    if let Some(enc) = &self.encoder {
                        enc.write_entry(&LibraryEntry {
                            compact_genomes: vec![cg.clone()],
                            ..Default::default()
                        })?;
                    }
                    if self.track_genomes {
                        self.compact_genomes
                            .lock()
                            .unwrap()
                            .insert(cg.name.clone(), cg);
                    }
                    Ok(())
                });
            }
            throttle.wait()
        })
    }

    fn load_compact_sequences(
        &self,
        cseqs: Vec<CompactSequence>,
        variantmap: &HashMap<TileLibRef, TileVariantId>,
    ) -> Result<()> {
        if !cseqs.is_empty() {
            debug!("load_compact_sequences: {}", cseqs.len());
        }
        for mut cseq in cseqs {
            for tseq in cseq.tile_sequences.values_mut() {
                for libref in tseq.iter_mut() {
                    if libref.variant == 0 {
                        // no variant (e.g. import dropped a no-call tile):
                        // nothing to translate
                        continue;
                    }
                    match variantmap.get(libref) {
                        Some(&newv) => libref.variant = newv,
                        None => bail!(
                            "sequence {:?} has variant {} for tag {}, but that variant was not in its library",
                            cseq.name,
                            libref.variant,
                            libref.tag
                        ),
                    }
                }
            }
            if let Some(enc) = &self.encoder {
                enc.write_entry(&LibraryEntry {
                    compact_sequences: vec![cseq.clone()],
                    ..Default::default()
                })?;
            }
            self.refseqs
                .lock()
                .unwrap()
                .insert(cseq.name, cseq.tile_sequences);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileformat::decode_library_file;

    #[test]
    fn get_ref_is_idempotent_and_orders_variants() {
        let lib = TileLibrary::new(TileLibraryParams::default());
        let a = lib.get_ref(3, b"acgtacgt", false).unwrap();
        let b = lib.get_ref(3, b"ttttacgt", false).unwrap();
        let a2 = lib.get_ref(3, b"acgtacgt", false).unwrap();
        assert_eq!(a, TileLibRef { tag: 3, variant: 1 });
        assert_eq!(b, TileLibRef { tag: 3, variant: 2 });
        assert_eq!(a, a2);
        assert_eq!(lib.len(), 2);
        assert_eq!(lib.variant_hash(a).unwrap(), hash_tile(b"acgtacgt"));
    }

    #[test]
    fn no_call_tiles_rejected_without_store_growth() {
        let lib = TileLibrary::new(TileLibraryParams::default());
        let r = lib.get_ref(0, b"acgtnacg", false).unwrap();
        assert_eq!(r.variant, 0);
        assert_eq!(lib.len(), 0);

        let keep = TileLibrary::new(TileLibraryParams {
            retain_no_calls: true,
            ..Default::default()
        });
        let r = keep.get_ref(0, b"acgtnacg", false).unwrap();
        assert_eq!(r.variant, 1);
        assert_eq!(keep.len(), 1);
    }

    #[test]
    fn tagset_mismatch_fails() {
        let lib = TileLibrary::new(TileLibraryParams::default());
        lib.set_tagset(&[b"acgt".to_vec()]).unwrap();
        assert!(lib.set_tagset(&[b"ACGT".to_vec()]).is_ok());
        assert!(lib.set_tagset(&[b"tttt".to_vec()]).is_err());
        assert!(lib
            .set_tagset(&[b"acgt".to_vec(), b"tttt".to_vec()])
            .is_err());
    }

    #[test]
    fn merge_remaps_genomes_and_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("src.wlib");

        // source library: variant ids chosen so the merge must renumber
        let w = LibraryWriter::create(&src_path).unwrap();
        let lib = TileLibrary::new(TileLibraryParams {
            encoder: Some(w.clone()),
            ..Default::default()
        });
        lib.set_tagset(&[b"aaaacccc".to_vec(), b"ggggtttt".to_vec()])
            .unwrap();
        let v1 = lib.get_ref(0, b"aaaaccccttggggtttt", false).unwrap();
        let v2 = lib.get_ref(0, b"aaaaccccgaggggtttt", false).unwrap();
        w.write_entry(&LibraryEntry {
            compact_genomes: vec![CompactGenome {
                name: "g".to_string(),
                start_tag: 0,
                end_tag: 2,
                variants: vec![v2.variant, v1.variant, 0, 0],
            }],
            ..Default::default()
        })
        .unwrap();
        w.finish().unwrap();

        // destination already has the second sequence, so ids swap
        let dest = TileLibrary::new(TileLibraryParams {
            track_genomes: true,
            ..Default::default()
        });
        dest.set_tagset(&[b"aaaacccc".to_vec(), b"ggggtttt".to_vec()])
            .unwrap();
        dest.get_ref(0, b"aaaaccccgaggggtttt", false).unwrap();

        let cancel = Throttle::new(1);
        let f = std::fs::File::open(&src_path).unwrap();
        dest.load(f, false, &cancel).unwrap();

        let genomes = dest.take_genomes();
        let g = &genomes["g"];
        // pre-merge cells hashed to (v2, v1); they must still hash the same
        assert_eq!(
            dest.variant_hash(TileLibRef { tag: 0, variant: g.variants[0] }).unwrap(),
            hash_tile(b"aaaaccccgaggggtttt")
        );
        assert_eq!(
            dest.variant_hash(TileLibRef { tag: 0, variant: g.variants[1] }).unwrap(),
            hash_tile(b"aaaaccccttggggtttt")
        );
        assert_eq!(g.variants[2], 0);
    }

    #[test]
    fn merge_fails_on_unknown_genome_variant() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("bad.wlib");
        let w = LibraryWriter::create(&src_path).unwrap();
        w.write_entry(&LibraryEntry {
            tagset: vec![b"aaaacccc".to_vec()],
            ..Default::default()
        })
        .unwrap();
        w.write_entry(&LibraryEntry {
            compact_genomes: vec![CompactGenome {
                name: "g".to_string(),
                start_tag: 0,
                end_tag: 1,
                variants: vec![5, 0],
            }],
            ..Default::default()
        })
        .unwrap();
        w.finish().unwrap();

        let dest = TileLibrary::new(TileLibraryParams::default());
        let cancel = Throttle::new(1);
        let f = std::fs::File::open(&src_path).unwrap();
        let err = dest.load(f, false, &cancel).unwrap_err();
        assert!(err.to_string().contains("not in its library"));
    }

    #[test]
    fn streamed_variants_round_trip_with_ref_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wlib");
        let w = LibraryWriter::create(&path).unwrap();
        let lib = TileLibrary::new(TileLibraryParams {
            encoder: Some(w.clone()),
            ..Default::default()
        });
        lib.set_tagset(&[b"aaaacccc".to_vec()]).unwrap();
        lib.get_ref(0, b"aaaaccccggtt", true).unwrap();
        lib.get_ref(0, b"aaaaccccaatt", false).unwrap();
        lib.write_ref_tiles(&w).unwrap();
        w.finish().unwrap();

        let mut plain = 0;
        let mut flagged = 0;
        decode_library_file(&path, |ent| {
            for tv in &ent.tile_variants {
                if tv.is_ref {
                    flagged += 1;
                    assert_eq!(tv.sequence, b"aaaaccccggtt");
                } else {
                    plain += 1;
                }
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(plain, 2);
        assert_eq!(flagged, 1);
    }
}
