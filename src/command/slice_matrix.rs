use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use log::info;
use regex::Regex;

use super::constants::{
    HGVS_ANNOTATIONS_CSV, HGVS_MATRIX_NPY, LABELS_CSV, LIBRARY_FILE_EXT, MAX_DIFF_LENGTH,
    MERGED_ANNOTATIONS_CSV, MERGED_MATRIX_NPY,
};
use crate::fileformat::npy::write_npy_i16_file;
use crate::fileformat::{decode_library_file, Mask};
use crate::hgvs;
use crate::tile::library::hash_tile;
use crate::tile::{CompactGenome, TagId, TileLibRef, TileVariant, TileVariantId};
use crate::utils::{determine_thread_count, trim_filename_for_label, Throttle};

#[derive(Args)]
pub struct SliceMatrixCMD {
    /// Directory of library slice files
    #[arg(short = 'i', long = "input-dir", value_parser)]
    pub input_dir: PathBuf,

    /// Output directory
    #[arg(short = 'o', long = "output-dir", value_parser)]
    pub output_dir: PathBuf,

    /// Reference name (if blank, use the last one seen in the first slice)
    #[arg(long = "ref", default_value = "")]
    pub ref_name: String,

    /// Only output columns/annotations that intersect regions in this BED
    /// file
    #[arg(long = "regions", value_parser)]
    pub regions: Option<PathBuf>,

    /// Expand the specified regions by N base pairs on each side
    #[arg(long = "expand-regions", value_parser = clap::value_parser!(u64), default_value_t = 0)]
    pub expand_regions: u64,

    /// Merge output into one matrix.npy and one matrix.annotations.csv,
    /// plus the HGVS pivot matrix
    #[arg(long = "merge-output", value_parser, default_value = "false")]
    pub merge_output: bool,

    /// Only genomes whose name matches this regex
    #[arg(long = "match-genome", default_value = "")]
    pub match_genome: String,

    /// Number of memory-hungry assembly threads
    #[arg(short = '@', long = "threads", value_parser = clap::value_parser!(usize))]
    pub threads: Option<usize>,
}

impl SliceMatrixCMD {
    /// Run the commandline option
    pub fn try_execute(&mut self) -> Result<()> {
        let num_threads = determine_thread_count(self.threads);
        info!("Running command: slice-matrix ({} threads)", num_threads);

        SliceMatrix::run(&SliceMatrix {
            input_dir: self.input_dir.clone(),
            output_dir: self.output_dir.clone(),
            ref_name: self.ref_name.clone(),
            regions: self.regions.clone(),
            expand_regions: self.expand_regions,
            merge_output: self.merge_output,
            match_genome: self.match_genome.clone(),
            num_threads,
        })?;

        log::info!("SliceMatrix has finished successfully");
        Ok(())
    }
}

pub struct SliceMatrix {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub ref_name: String,
    pub regions: Option<PathBuf>,
    pub expand_regions: u64,
    pub merge_output: bool,
    pub match_genome: String,
    pub num_threads: usize,
}

/// Where one reference tile sits: its (ranked) variant, chromosome, start
/// offset, and sequence.
struct RefTileInfo {
    variant: TileVariantId,
    seqname: String,
    pos: usize,
    tiledata: Vec<u8>,
}

impl SliceMatrix {
    /// Run the algorithm
    pub fn run(params: &SliceMatrix) -> Result<()> {
        let matcher = Regex::new(&params.match_genome).with_context(|| {
            format!("--match-genome: invalid regexp {:?}", params.match_genome)
        })?;

        let mut infiles: Vec<PathBuf> = Vec::new();
        for entry in std::fs::read_dir(&params.input_dir)
            .with_context(|| format!("read directory {}", params.input_dir.display()))?
        {
            let path = entry?.path();
            let name = path.to_string_lossy().into_owned();
            if name.ends_with(&format!(".{}", LIBRARY_FILE_EXT))
                || name.ends_with(&format!(".{}.gz", LIBRARY_FILE_EXT))
            {
                infiles.push(path);
            }
        }
        if infiles.is_empty() {
            bail!("no library slices found in {}", params.input_dir.display());
        }
        infiles.sort();
        std::fs::create_dir_all(&params.output_dir)
            .with_context(|| format!("create {}", params.output_dir.display()))?;

        // first pass over slice 0: tag length, reference tile path,
        // reference tile sequences, and the genome roster
        let mut taglen: Option<usize> = None;
        let mut refseq: Option<BTreeMap<String, Vec<TileLibRef>>> = None;
        let mut reftiledata: HashMap<TileLibRef, Vec<u8>> = HashMap::new();
        let mut cgnames: Vec<String> = Vec::new();
        decode_library_file(&infiles[0], |ent| {
            if let Some(tag) = ent.tagset.first() {
                taglen = Some(tag.len());
            }
            for cseq in ent.compact_sequences {
                if cseq.name == params.ref_name || params.ref_name.is_empty() {
                    refseq = Some(cseq.tile_sequences);
                }
            }
            for cg in &ent.compact_genomes {
                if matcher.is_match(&cg.name) {
                    cgnames.push(cg.name.clone());
                }
            }
            for tv in ent.tile_variants {
                if tv.is_ref {
                    reftiledata.insert(
                        TileLibRef {
                            tag: tv.tag,
                            variant: tv.variant,
                        },
                        tv.sequence,
                    );
                }
            }
            Ok(())
        })?;
        let taglen = taglen.ok_or_else(|| anyhow!("tagset not found"))?;
        let refseq = refseq
            .ok_or_else(|| anyhow!("{}: reference sequence not found", infiles[0].display()))?;
        if cgnames.is_empty() {
            bail!("no genomes found matching regexp {:?}", params.match_genome);
        }
        cgnames.sort();
        cgnames.dedup();

        let labels_path = params.output_dir.join(LABELS_CSV);
        info!("writing labels to {}", labels_path.display());
        let mut labels = BufWriter::new(
            File::create(&labels_path)
                .with_context(|| format!("create {}", labels_path.display()))?,
        );
        for (i, name) in cgnames.iter().enumerate() {
            writeln!(labels, "{},{:?}", i, trim_filename_for_label(name))?;
        }
        labels
            .flush()
            .with_context(|| format!("write {}", labels_path.display()))?;

        info!("indexing reference tiles");
        let mut reftile: BTreeMap<TagId, RefTileInfo> = BTreeMap::new();
        let mut isdup: HashMap<TagId, bool> = HashMap::new();
        for (seqname, cseq) in &refseq {
            let mut pos = 0usize;
            for libref in cseq {
                let tiledata = reftiledata.get(libref).cloned().unwrap_or_default();
                if tiledata.is_empty() {
                    bail!(
                        "missing tiledata for tag {} variant {} in {} in ref",
                        libref.tag,
                        libref.variant,
                        seqname
                    );
                }
                if isdup.get(&libref.tag).copied().unwrap_or(false) {
                    info!("dropping reference tile {:?} from {} @ {}, tag not unique", libref, seqname, pos);
                } else if reftile.contains_key(&libref.tag) {
                    // a tag appearing twice on the reference is dropped from
                    // both places
                    reftile.remove(&libref.tag);
                    isdup.insert(libref.tag, true);
                    info!("dropping reference tile {:?} from {} @ {}, tag not unique", libref, seqname, pos);
                } else {
                    reftile.insert(
                        libref.tag,
                        RefTileInfo {
                            variant: libref.variant,
                            seqname: seqname.clone(),
                            pos,
                            tiledata: tiledata.clone(),
                        },
                    );
                }
                pos += tiledata.len() - taglen;
            }
            info!("... {} done, len {}", seqname, pos + taglen);
        }

        let mask = match &params.regions {
            None => None,
            Some(path) => {
                let mask = Mask::from_bed(path, params.expand_regions)?;
                info!("before applying mask, {} reference tiles", reftile.len());
                reftile.retain(|_, rt| {
                    mask.check(
                        rt.seqname.strip_prefix("chr").unwrap_or(&rt.seqname),
                        rt.pos as u64,
                        (rt.pos + rt.tiledata.len()) as u64,
                    )
                });
                info!("after applying mask, {} reference tiles", reftile.len());
                Some(mask)
            }
        };

        info!("generating annotations and numpy matrix for each slice");
        let to_merge: Mutex<Vec<Option<Vec<i16>>>> =
            Mutex::new((0..infiles.len()).map(|_| None).collect());
        let ref_rank: Mutex<HashMap<TagId, TileVariantId>> = Mutex::new(HashMap::new());
        let throttle_mem = Throttle::new(params.num_threads);
        let done_count = AtomicUsize::new(0);
        let ntotal = infiles.len();

        thread::scope(|s| {
            for (idx, infile) in infiles.iter().enumerate() {
                let cgnames = &cgnames;
                let reftile = &reftile;
                let mask = mask.as_ref();
                let to_merge = &to_merge;
                let ref_rank = &ref_rank;
                let done_count = &done_count;
                let matcher = &matcher;
                let merge_output = params.merge_output;
                let output_dir = &params.output_dir;
                let throttle = &throttle_mem;
                throttle_mem.go(s, move || {
                    throttle.check()?;
                    let out = slice_one(
                        idx, infile, taglen, cgnames, matcher, reftile, mask, ref_rank,
                        output_dir,
                    )?;
                    if merge_output {
                        to_merge.lock().unwrap()[idx] = Some(out);
                    } else {
                        let rows = cgnames.len();
                        let cols = if rows == 0 { 0 } else { out.len() / rows };
                        write_npy_i16_file(
                            &output_dir.join(format!("matrix.{:04}.npy", idx)),
                            &out,
                            rows,
                            cols,
                        )?;
                    }
                    info!(
                        "{}: done ({}/{})",
                        infile.display(),
                        done_count.fetch_add(1, Ordering::SeqCst) + 1,
                        ntotal
                    );
                    Ok(())
                });
            }
            throttle_mem.wait()
        })?;

        if params.merge_output {
            params.write_merged(
                &cgnames,
                mask.as_ref(),
                to_merge.into_inner().unwrap(),
                &ref_rank.into_inner().unwrap(),
            )?;
        }
        Ok(())
    }

    /// Merge per-slice matrices along the column axis, rewrite the
    /// annotations with global columns, and build the HGVS pivot matrix.
    fn write_merged(
        &self,
        cgnames: &[String],
        mask: Option<&Mask>,
        chunks: Vec<Option<Vec<i16>>>,
        ref_rank: &HashMap<TagId, TileVariantId>,
    ) -> Result<()> {
        info!("merging output matrix and annotations");
        let rows = cgnames.len();
        let chunks: Vec<Vec<i16>> = chunks
            .into_iter()
            .enumerate()
            .map(|(i, c)| c.ok_or_else(|| anyhow!("slice {} produced no matrix", i)))
            .collect::<Result<_>>()?;
        let cols: usize = chunks.iter().map(|c| c.len() / rows).sum();
        let mut out = vec![0i16; rows * cols];

        let anno_path = self.output_dir.join(MERGED_ANNOTATIONS_CSV);
        let mut annow = BufWriter::with_capacity(
            1 << 20,
            File::create(&anno_path).with_context(|| format!("create {}", anno_path.display()))?,
        );

        // hgvs id -> one column per phase, genomes down the rows; -1 means
        // "no data", 0 "same as reference", 1 "has this variant"
        let mut hgvs_cols: BTreeMap<String, [Vec<i16>; 2]> = BTreeMap::new();
        let mut startcol = 0usize;
        for (idx, chunk) in chunks.iter().enumerate() {
            let chunkcols = chunk.len() / rows;
            for row in 0..rows {
                out[row * cols + startcol..row * cols + startcol + chunkcols]
                    .copy_from_slice(&chunk[row * chunkcols..(row + 1) * chunkcols]);
            }

            let slice_anno = self.output_dir.join(format!("matrix.{:04}.annotations.csv", idx));
            info!("reading {}", slice_anno.display());
            let buf = std::fs::read_to_string(&slice_anno)
                .with_context(|| format!("read {}", slice_anno.display()))?;
            std::fs::remove_file(&slice_anno)
                .with_context(|| format!("remove {}", slice_anno.display()))?;
            for line in buf.lines() {
                if line.is_empty() {
                    continue;
                }
                let fields: Vec<&str> = line.splitn(9, ',').collect();
                if fields.len() < 9 {
                    bail!("{}: malformed annotation line {:?}", slice_anno.display(), line);
                }
                let tag: TagId = fields[0].parse().context("annotation tag")?;
                let incol: usize = fields[1].parse().context("annotation outcol")?;
                let tile_variant: i16 = fields[2].parse().context("annotation variant")?;
                let hgvs_id = fields[3];
                let seqname = fields[4];
                let pos: usize = fields[5].parse().context("annotation pos")?;
                let refseq = fields[6];
                if hgvs_id.is_empty() || hgvs_id == "=" {
                    // null entry: un-diffable tile variant, or the ref line
                    continue;
                }
                if let Some(mask) = mask {
                    // the tile intersects a selected region, but this
                    // particular variant might not
                    if !mask.check(
                        seqname.strip_prefix("chr").unwrap_or(seqname),
                        pos as u64,
                        (pos + refseq.len()) as u64,
                    ) {
                        continue;
                    }
                }
                if !hgvs_cols.contains_key(hgvs_id) {
                    let rt_rank = *ref_rank.get(&tag).ok_or_else(|| {
                        anyhow!(
                            "bug: seeing annotations for tag {}, but it has no reftile entry",
                            tag
                        )
                    })?;
                    let mut pair = [vec![0i16; rows], vec![0i16; rows]];
                    for (ph, col) in pair.iter_mut().enumerate() {
                        for (row, cell) in col.iter_mut().enumerate() {
                            let v = chunk[row * chunkcols + incol * 2 + ph];
                            *cell = if v == rt_rank as i16 { 0 } else { -1 };
                        }
                    }
                    hgvs_cols.insert(hgvs_id.to_string(), pair);
                    let hgvsref = hgvs::Variant {
                        position: pos,
                        ref_seq: refseq.to_string(),
                        new_seq: refseq.to_string(),
                        left: String::new(),
                    };
                    writeln!(
                        annow,
                        "{},{},{},{}:g.{},{},{},{},{},{}",
                        tag,
                        incol + startcol / 2,
                        rt_rank,
                        seqname,
                        hgvsref,
                        seqname,
                        pos,
                        refseq,
                        refseq,
                        fields[8]
                    )?;
                }
                writeln!(
                    annow,
                    "{},{},{},{},{},{},{},{},{}",
                    tag,
                    incol + startcol / 2,
                    tile_variant,
                    hgvs_id,
                    seqname,
                    pos,
                    refseq,
                    fields[7],
                    fields[8]
                )?;
                let pair = hgvs_cols.get_mut(hgvs_id).unwrap();
                for (ph, col) in pair.iter_mut().enumerate() {
                    for (row, cell) in col.iter_mut().enumerate() {
                        if chunk[row * chunkcols + incol * 2 + ph] == tile_variant {
                            *cell = 1;
                        }
                    }
                }
            }
            startcol += chunkcols;
        }
        annow.flush()?;
        write_npy_i16_file(&self.output_dir.join(MERGED_MATRIX_NPY), &out, rows, cols)?;
        drop(out);

        let hcols = hgvs_cols.len() * 2;
        info!("building hgvs-based matrix: {} rows x {} cols", rows, hcols);
        let mut hout = vec![0i16; rows * hcols];
        let labels_path = self.output_dir.join(HGVS_ANNOTATIONS_CSV);
        let mut labels = BufWriter::new(
            File::create(&labels_path)
                .with_context(|| format!("create {}", labels_path.display()))?,
        );
        for (idx, (hgvs_id, pair)) in hgvs_cols.iter().enumerate() {
            writeln!(labels, "{},{}", idx, hgvs_id)?;
            for (ph, col) in pair.iter().enumerate() {
                for (row, val) in col.iter().enumerate() {
                    hout[row * hcols + idx * 2 + ph] = *val;
                }
            }
        }
        labels.flush()?;
        write_npy_i16_file(&self.output_dir.join(HGVS_MATRIX_NPY), &hout, rows, hcols)?;
        Ok(())
    }
}

/// Assemble one slice: decode it, dedup and rank the variants of every tag,
/// write the annotations CSV, and return the int16 matrix.
#[allow(clippy::too_many_arguments)]
fn slice_one(
    idx: usize,
    infile: &PathBuf,
    taglen: usize,
    cgnames: &[String],
    matcher: &Regex,
    reftile: &BTreeMap<TagId, RefTileInfo>,
    mask: Option<&Mask>,
    ref_rank: &Mutex<HashMap<TagId, TileVariantId>>,
    output_dir: &PathBuf,
) -> Result<Vec<i16>> {
    info!("{:04}: reading {}", idx, infile.display());
    let mut seq: HashMap<TagId, Vec<TileVariant>> = HashMap::new();
    let mut cgs: HashMap<String, CompactGenome> = HashMap::new();
    decode_library_file(infile, |ent| {
        for tv in ent.tile_variants {
            if tv.is_ref {
                continue;
            }
            if mask.is_some() && !reftile.contains_key(&tv.tag) {
                // masked out: don't spend memory on it
                continue;
            }
            let variants = seq.entry(tv.tag).or_default();
            while variants.len() <= tv.variant as usize {
                variants.push(TileVariant::default());
            }
            let slot = tv.variant as usize;
            variants[slot] = tv;
        }
        for cg in ent.compact_genomes {
            if matcher.is_match(&cg.name) {
                cgs.insert(cg.name.clone(), cg);
            }
        }
        Ok(())
    })?;
    let first = cgs
        .get(&cgnames[0])
        .ok_or_else(|| anyhow!("{}: genome {:?} not in slice", infile.display(), cgnames[0]))?;
    let tagstart = first.start_tag;
    let tagend = first.end_tag;

    info!("{:04}: renumber/dedup variants for tags {}-{}", idx, tagstart, tagend);
    // per-tag rank work fans out under the CPU throttle; each worker owns
    // one tag's remap slot
    let range = (tagend - tagstart) as usize;
    let variant_remap: Mutex<Vec<Option<Vec<TileVariantId>>>> =
        Mutex::new((0..range).map(|_| None).collect());
    let mut work_tags: Vec<TagId> = seq.keys().copied().collect();
    for (tag, _) in reftile.range(tagstart..tagend) {
        if !seq.contains_key(tag) {
            work_tags.push(*tag);
        }
    }
    let throttle_cpu = Throttle::new(determine_thread_count(None));
    thread::scope(|s| {
        for tag in work_tags {
            if tag < tagstart || tag >= tagend {
                continue;
            }
            let seq = &seq;
            let cgs = &cgs;
            let variant_remap = &variant_remap;
            let ref_rank = &ref_rank;
            throttle_cpu.go(s, move || {
                let empty: Vec<TileVariant> = Vec::new();
                let variants = seq.get(&tag).unwrap_or(&empty);
                let mut count: HashMap<[u8; 32], usize> = HashMap::with_capacity(variants.len() + 1);

                let rt = reftile.get(&tag);
                let rt_hash = rt.map(|rt| hash_tile(&rt.tiledata));
                if let Some(h) = rt_hash {
                    // the reference tile takes part in ranking even when no
                    // genome carries it
                    count.insert(h, 0);
                }

                for cg in cgs.values() {
                    let base = (tag - tagstart) as usize * 2;
                    for allele in 0..2 {
                        let v = match cg.variants.get(base + allele) {
                            Some(&v) => v as usize,
                            None => continue,
                        };
                        if v > 0 && v < variants.len() && !variants[v].sequence.is_empty() {
                            *count.entry(variants[v].blake2b).or_insert(0) += 1;
                        }
                    }
                }

                // canonical order: count desc, then hash bytes asc
                let mut hashes: Vec<[u8; 32]> = count.keys().copied().collect();
                hashes.sort_by(|a, b| count[b].cmp(&count[a]).then_with(|| a.cmp(b)));
                let rank: HashMap<[u8; 32], TileVariantId> = hashes
                    .iter()
                    .enumerate()
                    .map(|(i, h)| (*h, (i + 1) as TileVariantId))
                    .collect();

                let remap: Vec<TileVariantId> = variants
                    .iter()
                    .map(|tv| rank.get(&tv.blake2b).copied().unwrap_or(0))
                    .collect();
                variant_remap.lock().unwrap()[(tag - tagstart) as usize] = Some(remap);
                if let Some(h) = rt_hash {
                    ref_rank.lock().unwrap().insert(tag, rank[&h]);
                }
                Ok(())
            });
        }
        throttle_cpu.wait()
    })?;
    let variant_remap = variant_remap.into_inner().unwrap();

    let anno_path = output_dir.join(format!("matrix.{:04}.annotations.csv", idx));
    info!("{:04}: writing {}", idx, anno_path.display());
    let mut annow = BufWriter::with_capacity(
        1 << 20,
        File::create(&anno_path).with_context(|| format!("create {}", anno_path.display()))?,
    );
    let ref_rank_now = ref_rank.lock().unwrap().clone();
    let mut outcol = 0usize;
    for tag in tagstart..tagend {
        let rt = match reftile.get(&tag) {
            Some(rt) => rt,
            None => {
                // excluded by the region mask, or the reference does not
                // use this tag; without a mask the column still exists
                if mask.is_none() {
                    outcol += 1;
                }
                continue;
            }
        };
        let rt_variant = ref_rank_now.get(&tag).copied().unwrap_or(rt.variant);
        writeln!(annow, "{},{},{},=,{},{},,,", tag, outcol, rt_variant, rt.seqname, rt.pos)?;

        let empty: Vec<TileVariant> = Vec::new();
        let variants = seq.get(&tag).unwrap_or(&empty);
        let remap = variant_remap[(tag - tagstart) as usize].as_deref().unwrap_or(&[]);
        let maxrank = remap.iter().copied().max().unwrap_or(0) as usize;
        let mut done = vec![false; maxrank + 1];
        let reftilestr = String::from_utf8_lossy(&rt.tiledata).to_uppercase();
        for (old, tv) in variants.iter().enumerate() {
            if tv.sequence.is_empty() {
                continue;
            }
            let v = remap[old];
            if v == rt_variant || done[v as usize] {
                continue;
            }
            done[v as usize] = true;
            let anchored = tv.sequence.len() >= taglen
                && rt.tiledata.ends_with(&tv.sequence[tv.sequence.len() - taglen..]);
            let lendiff = rt.tiledata.len().abs_diff(tv.sequence.len());
            if !anchored || lendiff > MAX_DIFF_LENGTH {
                writeln!(annow, "{},{},{},,{},{},,,", tag, outcol, v, rt.seqname, rt.pos)?;
                continue;
            }
            let varstr = String::from_utf8_lossy(&tv.sequence).to_uppercase();
            for mut diff in hgvs::diff(&reftilestr, &varstr) {
                diff.position += rt.pos;
                writeln!(
                    annow,
                    "{},{},{},{}:g.{},{},{},{},{},{}",
                    tag, outcol, v, rt.seqname, diff, rt.seqname, diff.position,
                    diff.ref_seq, diff.new_seq, diff.left
                )?;
            }
        }
        outcol += 1;
    }
    annow.flush().with_context(|| format!("write {}", anno_path.display()))?;

    info!("{:04}: preparing numpy", idx);
    let rows = cgnames.len();
    let cols = 2 * outcol;
    let mut out = vec![0i16; rows * cols];
    for (row, name) in cgnames.iter().enumerate() {
        let cg = match cgs.get(name) {
            Some(cg) => cg,
            None => continue,
        };
        let mut oc = 0usize;
        for (col, &v) in cg.variants.iter().enumerate() {
            let tag = tagstart + (col / 2) as TagId;
            if mask.is_some() && !reftile.contains_key(&tag) {
                continue;
            }
            if oc >= cols {
                break;
            }
            let cell = match seq.get(&tag) {
                Some(variants)
                    if (v as usize) < variants.len()
                        && !variants[v as usize].sequence.is_empty() =>
                {
                    variant_remap[(tag - tagstart) as usize]
                        .as_ref()
                        .map(|remap| remap[v as usize] as i16)
                        .unwrap_or(-1)
                }
                _ => -1,
            };
            out[row * cols + oc] = cell;
            oc += 1;
        }
    }
    Ok(out)
}
