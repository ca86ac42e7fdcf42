/// Longest strictly increasing subsequence of keys, returned as ascending
/// indices into the input. Among equally long subsequences the
/// lexicographically earliest index sequence wins, so ties go to the first
/// occurrence.
pub fn longest_increasing_subsequence(keys: &[u32]) -> Vec<usize> {
    let n = keys.len();
    if n == 0 {
        return Vec::new();
    }
    let maxkey = *keys.iter().max().unwrap() as usize;

    // len_from[i] = length of the longest strictly increasing run starting
    // at i. Computed right to left with a max-Fenwick over key space,
    // indexed so that a query at key k covers all keys > k.
    let mut fen = MaxFenwick::new(maxkey + 1);
    let mut len_from = vec![0u32; n];
    for i in (0..n).rev() {
        let k = keys[i] as usize;
        // best run among positions j > i with keys[j] > k
        let best = if k < maxkey { fen.query(maxkey - k - 1) } else { 0 };
        len_from[i] = best + 1;
        fen.update(maxkey - k, len_from[i]);
    }

    let total = *len_from.iter().max().unwrap();
    let mut out = Vec::with_capacity(total as usize);
    let mut need = total;
    let mut last: Option<u32> = None;
    for i in 0..n {
        if len_from[i] == need && last.map_or(true, |l| keys[i] > l) {
            out.push(i);
            last = Some(keys[i]);
            if need == 1 {
                break;
            }
            need -= 1;
        }
    }
    out
}

/// Prefix-max Fenwick tree; update(i, v) raises position i, query(i) returns
/// the max over [0, i].
struct MaxFenwick {
    tree: Vec<u32>,
}

impl MaxFenwick {
    fn new(n: usize) -> MaxFenwick {
        MaxFenwick { tree: vec![0; n + 1] }
    }

    fn update(&mut self, i: usize, v: u32) {
        let mut i = i + 1;
        while i < self.tree.len() {
            if self.tree[i] < v {
                self.tree[i] = v;
            }
            i += i & i.wrapping_neg();
        }
    }

    fn query(&self, i: usize) -> u32 {
        let mut i = i + 1;
        let mut best = 0;
        while i > 0 {
            if best < self.tree[i] {
                best = self.tree[i];
            }
            i -= i & i.wrapping_neg();
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_first_occurrence_on_ties() {
        // [5,3,7,4,9]: both {3,4,9} and {5,7,9} have length 3; the earliest
        // index sequence is [0,2,4] == {5,7,9}.
        assert_eq!(longest_increasing_subsequence(&[5, 3, 7, 4, 9]), vec![0, 2, 4]);
    }

    #[test]
    fn strictly_increasing_drops_equal_keys() {
        assert_eq!(longest_increasing_subsequence(&[2, 2, 2]), vec![0]);
        assert_eq!(longest_increasing_subsequence(&[1, 2, 2, 3]), vec![0, 1, 3]);
    }

    #[test]
    fn handles_sorted_and_reversed() {
        assert_eq!(longest_increasing_subsequence(&[1, 2, 3, 4]), vec![0, 1, 2, 3]);
        assert_eq!(longest_increasing_subsequence(&[4, 3, 2, 1]), vec![0]);
        assert!(longest_increasing_subsequence(&[]).is_empty());
    }

    #[test]
    fn single_element() {
        assert_eq!(longest_increasing_subsequence(&[7]), vec![0]);
    }
}
