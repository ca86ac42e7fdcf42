use std::io::BufRead;

use aho_corasick::AhoCorasick;
use anyhow::{bail, Context, Result};

use super::TagId;

///////////////////////////////
/// The ordered anchor tagset and its multi-pattern index. Tags are
/// lowercased on construction; all tags must share one length.
pub struct TagSet {
    tags: Vec<Vec<u8>>,
    taglen: usize,
    index: AhoCorasick,
}

impl TagSet {
    pub fn new(tags: Vec<Vec<u8>>) -> Result<TagSet> {
        if tags.is_empty() {
            bail!("empty tagset");
        }
        let mut tags = tags;
        for t in tags.iter_mut() {
            t.make_ascii_lowercase();
        }
        let taglen = tags[0].len();
        for (i, t) in tags.iter().enumerate() {
            if t.len() != taglen {
                bail!(
                    "tag {} has length {}, want {} (tagset tags must all have the same length)",
                    i,
                    t.len(),
                    taglen
                );
            }
        }
        let index = AhoCorasick::new(&tags).context("building tag index")?;
        Ok(TagSet { tags, taglen, index })
    }

    /// Parse a tag library: FASTA (one tag per record) or one tag per line,
    /// decided by whether the first non-empty line starts with '>'.
    pub fn from_reader(rdr: impl BufRead) -> Result<TagSet> {
        let mut tags: Vec<Vec<u8>> = Vec::new();
        let mut current: Vec<u8> = Vec::new();
        let mut fasta = false;
        let mut seen_any = false;
        for line in rdr.lines() {
            let line = line.context("reading tag library")?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if !seen_any {
                seen_any = true;
                fasta = line.starts_with('>');
            }
            if fasta {
                if line.starts_with('>') {
                    if !current.is_empty() {
                        tags.push(std::mem::take(&mut current));
                    }
                } else {
                    current.extend_from_slice(line.as_bytes());
                }
            } else {
                tags.push(line.as_bytes().to_vec());
            }
        }
        if !current.is_empty() {
            tags.push(current);
        }
        TagSet::new(tags)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn taglen(&self) -> usize {
        self.taglen
    }

    pub fn tags(&self) -> &[Vec<u8>] {
        &self.tags
    }

    /// Call emit(tag, position, taglen) for every occurrence of any tag in
    /// text, in ascending position. Overlapping matches are all reported;
    /// the tiler decides what to keep.
    pub fn find_all(&self, text: &[u8], mut emit: impl FnMut(TagId, usize, usize)) {
        for m in self.index.find_overlapping_iter(text) {
            emit(m.pattern().as_u32() as TagId, m.start(), self.taglen);
        }
    }
}
