use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::info;

///////////////////////////////
/// Sorted-interval region mask built from a BED file. Sequence names are
/// stored without any "chr" prefix; intervals are half-open
/// (start <= pos < end) and may be expanded by a fixed margin on load.
pub struct Mask {
    // per seqname: intervals sorted by start, plus a running prefix max of
    // interval ends so overlap queries stay logarithmic without merging
    intervals: HashMap<String, Vec<(u64, u64)>>,
    prefix_max_end: HashMap<String, Vec<u64>>,
    len: usize,
}

impl Mask {
    pub fn from_bed(path: &Path, expand: u64) -> Result<Mask> {
        let rdr = super::open_reader(path)?;
        let mut intervals: HashMap<String, Vec<(u64, u64)>> = HashMap::new();
        let mut len = 0usize;
        for (lineno, line) in rdr.lines().enumerate() {
            let line = line.with_context(|| format!("read {}", path.display()))?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (chrom, start, end) = match (fields.next(), fields.next(), fields.next()) {
                (Some(c), Some(s), Some(e)) => (c, s, e),
                _ => bail!("{} line {}: not a BED line", path.display(), lineno + 1),
            };
            let start: u64 = start
                .parse()
                .with_context(|| format!("{} line {}: bad start", path.display(), lineno + 1))?;
            let end: u64 = end
                .parse()
                .with_context(|| format!("{} line {}: bad end", path.display(), lineno + 1))?;
            if end < start {
                bail!("{} line {}: end before start", path.display(), lineno + 1);
            }
            let chrom = chrom.strip_prefix("chr").unwrap_or(chrom);
            intervals
                .entry(chrom.to_string())
                .or_default()
                .push((start.saturating_sub(expand), end + expand));
            len += 1;
        }
        let mut prefix_max_end = HashMap::new();
        for (chrom, ivs) in intervals.iter_mut() {
            ivs.sort_unstable();
            let mut maxes = Vec::with_capacity(ivs.len());
            let mut best = 0u64;
            for &(_, e) in ivs.iter() {
                best = best.max(e);
                maxes.push(best);
            }
            prefix_max_end.insert(chrom.clone(), maxes);
        }
        info!("loaded {} mask intervals from {}", len, path.display());
        Ok(Mask {
            intervals,
            prefix_max_end,
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True if [start, end) overlaps any interval on seqname. The caller
    /// passes seqname without a "chr" prefix.
    pub fn check(&self, seqname: &str, start: u64, end: u64) -> bool {
        let ivs = match self.intervals.get(seqname) {
            Some(v) => v,
            None => return false,
        };
        // candidates start before our end; any of them reaching past our
        // start overlaps
        let n = ivs.partition_point(|&(s, _)| s < end);
        n > 0 && self.prefix_max_end[seqname][n - 1] > start
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn mask_from(text: &str, expand: u64) -> Mask {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regions.bed");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
        drop(f);
        Mask::from_bed(&path, expand).unwrap()
    }

    #[test]
    fn overlap_semantics() {
        let mask = mask_from("chr1\t0\t300\nchr2\t100\t200\n", 0);
        assert_eq!(mask.len(), 2);
        assert!(mask.check("1", 0, 10));
        assert!(mask.check("1", 299, 400));
        assert!(!mask.check("1", 300, 400));
        assert!(!mask.check("2", 0, 100));
        assert!(mask.check("2", 199, 200));
        assert!(!mask.check("3", 0, 1000));
    }

    #[test]
    fn chr_prefix_stripped() {
        let mask = mask_from("1\t50\t60\n", 0);
        assert!(mask.check("1", 55, 56));
    }

    #[test]
    fn expansion_grows_both_sides() {
        let mask = mask_from("chr1\t100\t200\n", 10);
        assert!(mask.check("1", 90, 91));
        assert!(mask.check("1", 209, 210));
        assert!(!mask.check("1", 210, 211));
        // expansion clamps at zero
        let mask = mask_from("chr1\t5\t10\n", 50);
        assert!(mask.check("1", 0, 1));
    }

    #[test]
    fn unsorted_input_still_queries() {
        let mask = mask_from("chr1\t500\t600\nchr1\t0\t100\nchr1\t200\t900\n", 0);
        assert!(mask.check("1", 150, 250));
        assert!(mask.check("1", 850, 860));
        assert!(!mask.check("1", 100, 200));
    }
}
