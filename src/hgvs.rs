use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use dissimilar::Chunk;

///////////////////////////////
/// One sequence variant in HGVS genomic terms: alt relative to ref at a
/// 1-based position. `left` stashes the base preceding an indel so the
/// VCF-style renderer can left-pad; it is carried alongside the variant
/// and takes no part in identity or ordering.
#[derive(Clone, Debug, Default)]
pub struct Variant {
    pub position: usize,
    pub ref_seq: String,
    pub new_seq: String,
    pub left: String,
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (r, n) = (self.ref_seq.len(), self.new_seq.len());
        match (r, n) {
            (0, 0) => write!(f, "{}=", self.position),
            (1, 0) => write!(f, "{}del", self.position),
            (_, 0) => write!(f, "{}_{}del", self.position, self.position + r - 1),
            (1, 1) => write!(f, "{}{}>{}", self.position, self.ref_seq, self.new_seq),
            (0, _) => write!(f, "{}_{}ins{}", self.position - 1, self.position, self.new_seq),
            (1, _) => write!(f, "{}delins{}", self.position, self.new_seq),
            _ => write!(
                f,
                "{}_{}delins{}",
                self.position,
                self.position + r - 1,
                self.new_seq
            ),
        }
    }
}

impl Variant {
    /// Equivalent variant with the stashed preceding base folded in, so
    /// neither side is empty. {45, "", "A", left "T"} becomes
    /// {44, "T", "TA"}.
    pub fn pad_left(&self) -> Variant {
        if self.ref_seq.is_empty() || self.new_seq.is_empty() {
            Variant {
                position: self.position - self.left.len(),
                ref_seq: format!("{}{}", self.left, self.ref_seq),
                new_seq: format!("{}{}", self.left, self.new_seq),
                left: String::new(),
            }
        } else {
            self.clone()
        }
    }
}

impl PartialEq for Variant {
    fn eq(&self, other: &Self) -> bool {
        self.position == other.position
            && self.ref_seq == other.ref_seq
            && self.new_seq == other.new_seq
    }
}

impl Eq for Variant {}

impl Hash for Variant {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.position.hash(state);
        self.ref_seq.hash(state);
        self.new_seq.hash(state);
    }
}

impl Ord for Variant {
    fn cmp(&self, other: &Self) -> Ordering {
        self.position
            .cmp(&other.position)
            .then_with(|| self.new_seq.cmp(&other.new_seq))
            .then_with(|| self.ref_seq.cmp(&other.ref_seq))
    }
}

impl PartialOrd for Variant {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Hunk {
    Equal(String),
    Delete(String),
    Insert(String),
}

/// Diff alt against ref and emit one Variant per maximal non-equal run,
/// after canonicalizing the raw diff so equivalent alignments spell the
/// same HGVS strings.
pub fn diff(reference: &str, alt: &str) -> Vec<Variant> {
    let hunks: Vec<Hunk> = dissimilar::diff(reference, alt)
        .into_iter()
        .map(|c| match c {
            Chunk::Equal(s) => Hunk::Equal(s.to_string()),
            Chunk::Delete(s) => Hunk::Delete(s.to_string()),
            Chunk::Insert(s) => Hunk::Insert(s.to_string()),
        })
        .collect();
    let hunks = canonicalize(hunks);

    let mut variants = Vec::new();
    let mut pos = 1usize;
    let mut i = 0;
    while i < hunks.len() {
        let mut left = String::new();
        while i < hunks.len() {
            if let Hunk::Equal(t) = &hunks[i] {
                pos += t.len();
                if !t.is_empty() {
                    left = t[t.len() - 1..].to_string();
                }
                i += 1;
            } else {
                break;
            }
        }
        if i >= hunks.len() {
            break;
        }
        let mut v = Variant {
            position: pos,
            left,
            ..Default::default()
        };
        while i < hunks.len() {
            match &hunks[i] {
                Hunk::Equal(_) => break,
                Hunk::Delete(t) => v.ref_seq.push_str(t),
                Hunk::Insert(t) => v.new_seq.push_str(t),
            }
            i += 1;
        }
        pos += v.ref_seq.len();
        variants.push(v);
    }
    variants
}

/// Normalization passes over the raw diff. The diff engine is free to pick
/// any minimal alignment; these rewrites collapse the spellings that differ
/// only by rotation, and split single-base substitutions out of
/// delete/insert pairs, so equivalent alignments produce one canonical
/// variant list.
fn canonicalize(input: Vec<Hunk>) -> Vec<Hunk> {
    // merge consecutive hunks of the same type
    let mut hunks: Vec<Hunk> = Vec::with_capacity(input.len());
    for h in input {
        match (hunks.last_mut(), h) {
            (Some(Hunk::Equal(a)), Hunk::Equal(b)) => a.push_str(&b),
            (Some(Hunk::Delete(a)), Hunk::Delete(b)) => a.push_str(&b),
            (Some(Hunk::Insert(a)), Hunk::Insert(b)) => a.push_str(&b),
            (_, h) => hunks.push(h),
        }
    }

    let mut out: Vec<Hunk> = Vec::with_capacity(hunks.len());
    let mut i = 0;
    while i < hunks.len() {
        // [delD, =E, insI] where I ends with E: the equal part really sits
        // after the replacement. Rearrange to [delD, ins E+I', =E].
        if i + 2 < hunks.len() {
            if let (Hunk::Delete(_), Hunk::Equal(eq), Hunk::Insert(ins)) =
                (&hunks[i], &hunks[i + 1], &hunks[i + 2])
            {
                if ins.ends_with(eq.as_str()) {
                    let rotated = format!("{}{}", eq, &ins[..ins.len() - eq.len()]);
                    let eq = eq.clone();
                    hunks[i + 1] = Hunk::Insert(rotated);
                    hunks[i + 2] = Hunk::Equal(eq);
                }
            }
        }
        // [delD, =E, insI] where swapping E and I leaves the string
        // unchanged: prefer [delD, insI, =E].
        if i + 2 < hunks.len() {
            if let (Hunk::Delete(_), Hunk::Equal(eq), Hunk::Insert(ins)) =
                (&hunks[i], &hunks[i + 1], &hunks[i + 2])
            {
                if format!("{}{}", eq, ins) == format!("{}{}", ins, eq) {
                    hunks.swap(i + 1, i + 2);
                }
            }
        }
        // [delD, insI] agreeing at offset 1: peel a single-base
        // substitution plus the shared run off the head and revisit the
        // tails.
        if i + 1 < hunks.len() {
            if let (Hunk::Delete(d), Hunk::Insert(ins)) = (&hunks[i], &hunks[i + 1]) {
                let db = d.as_bytes();
                let nb = ins.as_bytes();
                if db.len() > 2 && nb.len() > 2 && db[1] == nb[1] {
                    let mut eqend = 2;
                    while eqend < db.len() && eqend < nb.len() && db[eqend] == nb[eqend] {
                        eqend += 1;
                    }
                    out.push(Hunk::Delete(d[..1].to_string()));
                    out.push(Hunk::Insert(ins[..1].to_string()));
                    out.push(Hunk::Equal(d[1..eqend].to_string()));
                    let dtail = d[eqend..].to_string();
                    let itail = ins[eqend..].to_string();
                    hunks[i] = Hunk::Delete(dtail);
                    hunks[i + 1] = Hunk::Insert(itail);
                    continue;
                }
            }
        }
        // symmetric rule for a trailing single-base substitution
        if i + 1 < hunks.len() {
            if let (Hunk::Delete(d), Hunk::Insert(ins)) = (&hunks[i], &hunks[i + 1]) {
                let db = d.as_bytes();
                let nb = ins.as_bytes();
                if db.len() > 2 && nb.len() > 2 && db[db.len() - 2] == nb[nb.len() - 2] {
                    // eqstart counts the shared run before the terminal
                    // substitution, plus one for the substitution itself
                    let mut eqstart = 2;
                    while eqstart < db.len()
                        && eqstart < nb.len()
                        && db[db.len() - eqstart] == nb[nb.len() - eqstart]
                    {
                        eqstart += 1;
                    }
                    eqstart -= 1;
                    out.push(Hunk::Delete(d[..db.len() - eqstart].to_string()));
                    out.push(Hunk::Insert(ins[..nb.len() - eqstart].to_string()));
                    out.push(Hunk::Equal(d[db.len() - eqstart..db.len() - 1].to_string()));
                    out.push(Hunk::Delete(d[db.len() - 1..].to_string()));
                    out.push(Hunk::Insert(ins[nb.len() - 1..].to_string()));
                    i += 2;
                    continue;
                }
            }
        }
        out.push(hunks[i].clone());
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(reference: &str, variants: &[Variant]) -> String {
        let mut out = String::new();
        let mut pos = 1usize;
        for v in variants {
            assert!(v.position >= pos, "variants out of order");
            out.push_str(&reference[pos - 1..v.position - 1]);
            assert_eq!(
                &reference[v.position - 1..v.position - 1 + v.ref_seq.len()],
                v.ref_seq,
                "ref mismatch at {}",
                v.position
            );
            out.push_str(&v.new_seq);
            pos = v.position + v.ref_seq.len();
        }
        out.push_str(&reference[pos - 1..]);
        out
    }

    #[test]
    fn rendering_table() {
        let v = |position, r: &str, n: &str| Variant {
            position,
            ref_seq: r.to_string(),
            new_seq: n.to_string(),
            left: String::new(),
        };
        assert_eq!(v(41, "", "").to_string(), "41=");
        assert_eq!(v(4, "G", "").to_string(), "4del");
        assert_eq!(v(1, "TTT", "").to_string(), "1_3del");
        assert_eq!(v(161, "A", "T").to_string(), "161A>T");
        assert_eq!(v(4, "", "GG").to_string(), "3_4insGG");
        assert_eq!(v(7, "C", "AA").to_string(), "7delinsAA");
        assert_eq!(v(125, "CTT", "AAA").to_string(), "125_127delinsAAA");
    }

    #[test]
    fn snv() {
        let vs = diff("ACTGCAT", "ACTACAT");
        assert_eq!(vs.len(), 1);
        assert_eq!(vs[0].to_string(), "4G>A");
        assert_eq!(vs[0].left, "T");
        assert_eq!(apply("ACTGCAT", &vs), "ACTACAT");
    }

    #[test]
    fn plain_delins() {
        let vs = diff("TTTACGT", "AAAACGT");
        assert_eq!(vs.len(), 1);
        assert_eq!(vs[0].to_string(), "1_3delinsAAA");
        assert_eq!(apply("TTTACGT", &vs), "AAAACGT");
    }

    #[test]
    fn rotation_prefers_del_ins_eq() {
        // whichever alignment the engine picks, AAX -> XTX spells one way
        let vs = diff("AAX", "XTX");
        assert_eq!(vs.len(), 1);
        assert_eq!(vs[0].position, 1);
        assert_eq!(vs[0].ref_seq, "AA");
        assert_eq!(vs[0].new_seq, "XT");
        assert_eq!(apply("AAX", &vs), "XTX");
    }

    #[test]
    fn repeat_swap_becomes_snv() {
        let vs = diff("AXX", "XXX");
        assert_eq!(vs.len(), 1);
        assert_eq!(vs[0].to_string(), "1A>X");
        assert_eq!(apply("AXX", &vs), "XXX");
    }

    #[test]
    fn head_substitution_split() {
        let out = canonicalize(vec![
            Hunk::Delete("AAAG".to_string()),
            Hunk::Insert("TAAC".to_string()),
        ]);
        assert_eq!(
            out,
            vec![
                Hunk::Delete("A".to_string()),
                Hunk::Insert("T".to_string()),
                Hunk::Equal("AA".to_string()),
                Hunk::Delete("G".to_string()),
                Hunk::Insert("C".to_string()),
            ]
        );
    }

    #[test]
    fn tail_substitution_split() {
        let out = canonicalize(vec![
            Hunk::Delete("AAAA".to_string()),
            Hunk::Insert("TTAAG".to_string()),
        ]);
        assert_eq!(
            out,
            vec![
                Hunk::Delete("A".to_string()),
                Hunk::Insert("TT".to_string()),
                Hunk::Equal("AA".to_string()),
                Hunk::Delete("A".to_string()),
                Hunk::Insert("G".to_string()),
            ]
        );
    }

    #[test]
    fn pad_left_folds_preceding_base() {
        let v = Variant {
            position: 45,
            ref_seq: String::new(),
            new_seq: "A".to_string(),
            left: "T".to_string(),
        };
        let p = v.pad_left();
        assert_eq!(p.position, 44);
        assert_eq!(p.ref_seq, "T");
        assert_eq!(p.new_seq, "TA");
        // already two-sided variants are unchanged
        let v = Variant {
            position: 41,
            ref_seq: "TT".to_string(),
            new_seq: "AA".to_string(),
            left: "G".to_string(),
        };
        assert_eq!(v.pad_left(), v);
    }

    #[test]
    fn left_stash_takes_no_part_in_identity() {
        let a = Variant {
            position: 5,
            ref_seq: "A".to_string(),
            new_seq: "T".to_string(),
            left: "G".to_string(),
        };
        let b = Variant {
            left: "C".to_string(),
            ..a.clone()
        };
        assert_eq!(a, b);
        assert_eq!(a.cmp(&b), std::cmp::Ordering::Equal);
    }

    #[test]
    fn ordering_by_position_then_new_then_ref() {
        let mk = |position, r: &str, n: &str| Variant {
            position,
            ref_seq: r.to_string(),
            new_seq: n.to_string(),
            left: String::new(),
        };
        let mut vs = vec![mk(5, "A", "T"), mk(2, "G", "C"), mk(5, "A", "G")];
        vs.sort();
        assert_eq!(vs[0].position, 2);
        assert_eq!(vs[1].new_seq, "G");
        assert_eq!(vs[2].new_seq, "T");
    }

    #[test]
    fn apply_reproduces_alt_for_assorted_pairs() {
        let pairs = [
            ("ACGTACGTACGT", "ACGTACGTACGT"),
            ("ACGTACGTACGT", "ACGTACCTACGT"),
            ("ACGTACGT", "ACGT"),
            ("ACGT", "ACGTTTTT"),
            ("TTTTACGTTTTT", "AAAACGTT"),
            ("GATTACA", "GATTTACA"),
            ("CCCCCCC", "CCCCC"),
            ("ACTGCATTTT", "TGCATTTTAC"),
        ];
        for (a, b) in pairs {
            let vs = diff(a, b);
            assert_eq!(apply(a, &vs), b, "round trip failed for {} -> {}", a, b);
        }
    }
}
