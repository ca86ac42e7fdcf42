use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::info;

// Numpy array file envelope, version 1.0: magic, little-endian header
// length, python dict header padded to a 64-byte boundary, then raw
// little-endian data in C order.

const MAGIC: &[u8; 6] = b"\x93NUMPY";

fn write_header<W: Write>(w: &mut W, descr: &str, rows: usize, cols: usize) -> Result<()> {
    let dict = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': ({}, {}), }}",
        descr, rows, cols
    );
    // magic(6) + version(2) + headerlen(2) + dict + padding + '\n', total % 64 == 0
    let unpadded = 6 + 2 + 2 + dict.len() + 1;
    let pad = (64 - unpadded % 64) % 64;
    let header_len = dict.len() + pad + 1;
    w.write_all(MAGIC)?;
    w.write_all(&[1u8, 0u8])?;
    w.write_all(&(header_len as u16).to_le_bytes())?;
    w.write_all(dict.as_bytes())?;
    w.write_all(&vec![b' '; pad])?;
    w.write_all(b"\n")?;
    Ok(())
}

pub fn write_npy_i16<W: Write>(w: &mut W, data: &[i16], rows: usize, cols: usize) -> Result<()> {
    if data.len() != rows * cols {
        bail!("matrix is {} cells, want {}x{}", data.len(), rows, cols);
    }
    write_header(w, "<i2", rows, cols)?;
    let mut buf = Vec::with_capacity(data.len() * 2);
    for v in data {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    w.write_all(&buf)?;
    Ok(())
}

pub fn write_npy_u16<W: Write>(w: &mut W, data: &[u16], rows: usize, cols: usize) -> Result<()> {
    if data.len() != rows * cols {
        bail!("matrix is {} cells, want {}x{}", data.len(), rows, cols);
    }
    write_header(w, "<u2", rows, cols)?;
    let mut buf = Vec::with_capacity(data.len() * 2);
    for v in data {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    w.write_all(&buf)?;
    Ok(())
}

/// Write an int16 matrix to a file, logging shape like the other matrix
/// writers do.
pub fn write_npy_i16_file(path: &Path, data: &[i16], rows: usize, cols: usize) -> Result<()> {
    info!("writing numpy {} ({} rows x {} cols)", path.display(), rows, cols);
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut w = BufWriter::with_capacity(1 << 20, file);
    write_npy_i16(&mut w, data, rows, cols)?;
    w.flush()?;
    Ok(())
}

pub fn write_npy_u16_file(path: &Path, data: &[u16], rows: usize, cols: usize) -> Result<()> {
    info!("writing numpy {} ({} rows x {} cols)", path.display(), rows, cols);
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut w = BufWriter::with_capacity(1 << 20, file);
    write_npy_u16(&mut w, data, rows, cols)?;
    w.flush()?;
    Ok(())
}

fn read_header<R: Read>(r: &mut R, want_descr: &str) -> Result<(usize, usize)> {
    let mut magic = [0u8; 6];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        bail!("not a numpy file");
    }
    let mut version = [0u8; 2];
    r.read_exact(&mut version)?;
    if version[0] != 1 {
        bail!("unsupported numpy format version {}.{}", version[0], version[1]);
    }
    let mut lenbuf = [0u8; 2];
    r.read_exact(&mut lenbuf)?;
    let header_len = u16::from_le_bytes(lenbuf) as usize;
    let mut header = vec![0u8; header_len];
    r.read_exact(&mut header)?;
    let header = String::from_utf8_lossy(&header);
    if !header.contains(&format!("'descr': '{}'", want_descr)) {
        bail!("unexpected dtype in numpy header: {}", header.trim());
    }
    if header.contains("'fortran_order': True") {
        bail!("fortran-order numpy input not supported");
    }
    let shape = header
        .split("'shape': (")
        .nth(1)
        .and_then(|s| s.split(')').next())
        .ok_or_else(|| anyhow::anyhow!("numpy header has no shape"))?;
    let dims: Vec<usize> = shape
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>().context("parsing numpy shape"))
        .collect::<Result<_>>()?;
    if dims.len() != 2 {
        bail!("want a 2-dimensional matrix, got shape ({})", shape);
    }
    Ok((dims[0], dims[1]))
}

pub fn read_npy_i16<R: Read>(r: &mut R) -> Result<(Vec<i16>, usize, usize)> {
    let (rows, cols) = read_header(r, "<i2")?;
    let mut buf = vec![0u8; rows * cols * 2];
    r.read_exact(&mut buf)?;
    let data = buf
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect();
    Ok((data, rows, cols))
}

pub fn read_npy_u16<R: Read>(r: &mut R) -> Result<(Vec<u16>, usize, usize)> {
    let (rows, cols) = read_header(r, "<u2")?;
    let mut buf = vec![0u8; rows * cols * 2];
    r.read_exact(&mut buf)?;
    let data = buf
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    Ok((data, rows, cols))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i16_round_trip() {
        let data: Vec<i16> = vec![-1, 0, 1, 2, 32767, -32768];
        let mut buf = Vec::new();
        write_npy_i16(&mut buf, &data, 2, 3).unwrap();
        // envelope is 64-byte aligned before the data section
        assert_eq!((buf.len() - data.len() * 2) % 64, 0);
        let (back, rows, cols) = read_npy_i16(&mut buf.as_slice()).unwrap();
        assert_eq!((rows, cols), (2, 3));
        assert_eq!(back, data);
    }

    #[test]
    fn u16_round_trip() {
        let data: Vec<u16> = vec![0, 1, 65535, 7];
        let mut buf = Vec::new();
        write_npy_u16(&mut buf, &data, 4, 1).unwrap();
        let (back, rows, cols) = read_npy_u16(&mut buf.as_slice()).unwrap();
        assert_eq!((rows, cols), (4, 1));
        assert_eq!(back, data);
    }

    #[test]
    fn shape_mismatch_rejected() {
        assert!(write_npy_i16(&mut Vec::new(), &[1, 2, 3], 2, 2).is_err());
    }

    #[test]
    fn dtype_mismatch_rejected() {
        let mut buf = Vec::new();
        write_npy_u16(&mut buf, &[1], 1, 1).unwrap();
        assert!(read_npy_i16(&mut buf.as_slice()).is_err());
    }
}
