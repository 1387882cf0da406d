// vim: tw=80
//! Helpers for I/O buffers

use crate::{geometry::Geometry, types::*};
use divbuf::DivBufShared;

/// Allocate a zeroed buffer of `nbytes`, which must be a non-zero multiple of
/// `geo`'s sector size.
pub fn alloc(geo: &Geometry, nbytes: usize) -> Result<Vec<u8>> {
    if nbytes == 0 || nbytes % geo.sector_nbytes as usize != 0 {
        return Err(Error::EINVAL);
    }
    let mut v = Vec::new();
    v.try_reserve_exact(nbytes).map_err(|_| Error::ENOMEM)?;
    v.resize(nbytes, 0);
    Ok(v)
}

/// Like [`alloc`], but returning an owned [`IoVecMut`] suitable for
/// asynchronous commands.
pub fn alloc_iovec(geo: &Geometry, nbytes: usize) -> Result<IoVecMut> {
    let dbs = DivBufShared::from(alloc(geo, nbytes)?);
    dbs.try_mut().map_err(|_| Error::EBUSY)
}

/// Fill `buf` with the alphabet, repeated
pub fn fill(buf: &mut [u8]) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b = b'A' + (i % 26) as u8;
    }
}

/// Fill `buf` with `c`
pub fn fill_char(buf: &mut [u8], c: u8) {
    buf.fill(c);
}

/// Number of bytes that differ between `expected` and `actual`.  Any length
/// mismatch counts as differing bytes too.
pub fn diff(expected: &[u8], actual: &[u8]) -> usize {
    let common = expected.iter()
        .zip(actual.iter())
        .filter(|(e, a)| e != a)
        .count();
    common + expected.len().abs_diff(actual.len())
}

// LCOV_EXCL_STOP
