/// Library slice files written by `weft slice`, consumed by slice-matrix.
pub const SLICE_FILE_PREFIX: &str = "slice.";
pub const LIBRARY_FILE_EXT: &str = "wlib";

/// slice-matrix output names.
pub const LABELS_CSV: &str = "labels.csv";
pub const MERGED_MATRIX_NPY: &str = "matrix.npy";
pub const MERGED_ANNOTATIONS_CSV: &str = "matrix.annotations.csv";
pub const HGVS_MATRIX_NPY: &str = "hgvs.npy";
pub const HGVS_ANNOTATIONS_CSV: &str = "hgvs.annotations.csv";

/// Don't diff a variant against a reference tile when their lengths differ
/// by more than this.
pub const MAX_DIFF_LENGTH: usize = 1000;
