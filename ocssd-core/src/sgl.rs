// vim: tw=80
//! Scatter/gather lists

use crate::types::*;

/// An ordered list of buffer segments for a vectored transfer.
///
/// The list owns its segments, so they can't be freed or moved while a
/// command is using them.  Segments are visited front to back through an
/// explicit cursor.
#[derive(Debug, Default)]
pub struct ScatterGatherList {
    segments: Vec<IoVecMut>,
    cursor: usize,
}

impl ScatterGatherList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a segment.
    ///
    /// Only fails if memory for the segment table can't be allocated.
    pub fn add(&mut self, buf: IoVecMut) -> Result<()> {
        self.segments.try_reserve(1).map_err(|_| Error::ENOMEM)?;
        self.segments.push(buf);
        Ok(())
    }

    /// Rewind the cursor to the first segment.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Return the segment at the cursor and advance it.
    ///
    /// Returns `None` once every segment has been visited.  Call
    /// [`reset`](Self::reset) to traverse the list again.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<&mut [u8]> {
        let seg = self.segments.get_mut(self.cursor)?;
        self.cursor += 1;
        Some(&mut seg[..])
    }

    /// Number of segments
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Total number of bytes in all segments
    pub fn nbytes(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }

    /// Copy `data` into the segments, front to back.
    ///
    /// `data` must be exactly as long as the list.
    pub fn scatter(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != self.nbytes() {
            return Err(Error::EINVAL);
        }
        let mut off = 0;
        self.reset();
        while let Some(seg) = self.next() {
            let l = seg.len();
            seg.copy_from_slice(&data[off..off + l]);
            off += l;
        }
        Ok(())
    }

    /// Concatenate every segment into one contiguous buffer.
    pub fn gather(&mut self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        data.try_reserve_exact(self.nbytes()).map_err(|_| Error::ENOMEM)?;
        self.reset();
        while let Some(seg) = self.next() {
            data.extend_from_slice(seg);
        }
        Ok(data)
    }

    /// Give the segments back to the caller.
    pub fn into_bufs(self) -> Vec<IoVecMut> {
        self.segments
    }
}

// LCOV_EXCL_STOP
