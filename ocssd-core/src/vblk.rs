// vim: tw=80
//! Virtual blocks: several chunks striped together
//!
//! A [`VirtualBlock`] spans one chunk, or block, per member.  Data is laid
//! out in write units, one unit per member in turn: unit `n` of the virtual
//! block is unit `n / count` of member `n % count`.  A write unit is the
//! smallest write that a member accepts.  On a planar device that's one page
//! on every plane.  On a linear device it's `ws_min` sectors.

use crate::{
    addr::Addr,
    cmd::{Command, Transfer},
    dev::Device,
    geometry::{Generation, Geometry},
    types::*,
};
use thiserror::Error;
use tracing::{debug, warn};

/// Failure to erase one member of a [`VirtualBlock`]
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("erasing chunk {chunk} failed: {error}")]
pub struct EraseError {
    /// Index of the failed member
    pub chunk: usize,
    pub error: Error,
}

impl From<EraseError> for Error {
    fn from(e: EraseError) -> Self {
        e.error
    }
}

/// A set of chunks that are erased, written, and read together
#[derive(Debug)]
pub struct VirtualBlock<'d> {
    dev: &'d Device,
    chunks: Vec<Addr>,
    /// Bytes written so far by [`write`](Self::write)
    pos_write: usize,
}

impl<'d> VirtualBlock<'d> {
    /// Build a virtual block from the chunks containing `chunks`.
    ///
    /// For full bandwidth, there should be one chunk per parallel unit.
    pub fn new(dev: &'d Device, chunks: &[Addr]) -> Result<Self> {
        if chunks.is_empty() {
            return Err(Error::EINVAL);
        }
        let geo = dev.geometry();
        let chunks = chunks.iter()
            .map(|a| {
                a.validate(geo)?;
                Ok(match geo.generation {
                    Generation::Planar =>
                        Addr::planar(a.ch(), a.lun(), 0, a.blk(), 0, 0),
                    Generation::Linear =>
                        Addr::linear(a.pugrp(), a.punit(), a.chunk(), 0),
                })
            }).collect::<Result<Vec<_>>>()?;
        Ok(VirtualBlock { dev, chunks, pos_write: 0 })
    }

    /// Build a virtual block from `count` free chunks found on `dev`.
    pub fn alloc(dev: &'d Device, count: usize) -> Result<Self> {
        let chunks = dev.free_chunks(count)?;
        if chunks.len() < count {
            return Err(Error::ENOSPC);
        }
        Self::new(dev, &chunks)
    }

    fn geo(&self) -> &Geometry {
        self.dev.geometry()
    }

    /// Start address of every member
    pub fn addrs(&self) -> &[Addr] {
        &self.chunks
    }

    /// Number of members
    pub fn count(&self) -> usize {
        self.chunks.len()
    }

    /// Capacity in bytes
    pub fn nbytes(&self) -> usize {
        self.count() * self.geo().chunk_nbytes() as usize
    }

    pub fn pos_write(&self) -> usize {
        self.pos_write
    }

    /// Move the write position, for example after reopening a partially written
    /// virtual block.  It must fall on a stripe boundary within the capacity.
    pub fn set_pos_write(&mut self, pos: usize) -> Result<()> {
        if pos > self.nbytes() || pos % self.stripe_nbytes() != 0 {
            return Err(Error::EINVAL);
        }
        self.pos_write = pos;
        Ok(())
    }

    fn unit_nbytes(&self) -> usize {
        self.geo().write_unit_nbytes()
    }

    /// Write units per member
    fn units_per_chunk(&self) -> usize {
        (self.geo().chunk_nsectors() /
         u64::from(self.geo().write_unit_nsectors())) as usize
    }

    /// The granularity of [`write`](Self::write) and
    /// [`read_at`](Self::read_at): one write unit on every member
    pub fn stripe_nbytes(&self) -> usize {
        self.unit_nbytes() * self.count()
    }

    /// Sector addresses of write unit `unit` of member `chunk`, in buffer
    /// order
    fn unit_addrs(&self, chunk: usize, unit: usize) -> Vec<Addr> {
        let geo = self.geo();
        let base = self.chunks[chunk];
        match geo.generation {
            Generation::Planar => {
                let nsectors = geo.nsectors as usize;
                (0..geo.write_unit_nsectors() as usize).map(|i| {
                    Addr::planar(base.ch(), base.lun(), (i / nsectors) as u8,
                                 base.blk(), unit as u16,
                                 (i % nsectors) as u8)
                }).collect()
            },
            Generation::Linear => {
                let ws = geo.ws_min as usize;
                (0..ws).map(|i| {
                    Addr::linear(base.pugrp(), base.punit(), base.chunk(),
                                 (unit * ws + i) as u32)
                }).collect()
            }
        }
    }

    /// Metadata to accompany a write of `naddrs` sectors, if any
    fn meta_for(&self, naddrs: usize) -> Option<Vec<u8>> {
        let geo = self.geo();
        let mode = self.dev.meta_mode();
        mode.fill_byte(0)?;
        if geo.meta_nbytes == 0 {
            return None;
        }
        let per = geo.meta_nbytes as usize;
        let mut meta = vec![0u8; naddrs * per];
        for (i, oob) in meta.chunks_exact_mut(per).enumerate() {
            if let Some(b) = mode.fill_byte(i) {
                oob.fill(b);
            }
        }
        Some(meta)
    }

    /// Write one unit, in as many commands as the device's limit requires
    fn write_unit(&self, chunk: usize, unit: usize, data: &[u8])
        -> Result<()>
    {
        let addrs = self.unit_addrs(chunk, unit);
        let sector = self.geo().sector_nbytes as usize;
        let per_cmd = self.dev.write_naddrs_max();
        for (addrs, data) in addrs.chunks(per_cmd)
            .zip(data.chunks(per_cmd * sector))
        {
            let meta = self.meta_for(addrs.len());
            let mt = meta.as_deref()
                .map(Transfer::ToDevice)
                .unwrap_or_default();
            Command::write(self.dev, addrs, Transfer::ToDevice(data), mt,
                           self.dev.pmode())?
                .execute(self.dev)?;
        }
        Ok(())
    }

    fn read_unit(&self, chunk: usize, unit: usize, data: &mut [u8])
        -> Result<()>
    {
        let addrs = self.unit_addrs(chunk, unit);
        let sector = self.geo().sector_nbytes as usize;
        let per_cmd = self.dev.read_naddrs_max();
        for (addrs, data) in addrs.chunks(per_cmd)
            .zip(data.chunks_mut(per_cmd * sector))
        {
            Command::read(self.dev, addrs, Transfer::FromDevice(data),
                          Transfer::None, self.dev.pmode())?
                .execute(self.dev)?;
        }
        Ok(())
    }

    /// Member and per-member unit for stripe unit `n`
    fn locate(&self, n: usize) -> (usize, usize) {
        (n % self.count(), n / self.count())
    }

    /// Check that `[offset, offset + len)` is stripe-aligned and in range, and
    /// return the first stripe unit it covers.
    fn stripe_range(&self, offset: usize, len: usize) -> Result<usize> {
        let stripe = self.stripe_nbytes();
        if offset % stripe != 0 || len % stripe != 0 ||
            offset.checked_add(len).map_or(true, |end| end > self.nbytes())
        {
            return Err(Error::EINVAL);
        }
        Ok(offset / self.unit_nbytes())
    }

    /// Erase member `chunk`.
    pub fn erase_chunk(&self, chunk: usize) -> Result<()> {
        let base = *self.chunks.get(chunk).ok_or(Error::EINVAL)?;
        let geo = self.geo();
        let addrs = match geo.generation {
            Generation::Planar => (0..geo.nplanes).map(|pl| {
                Addr::planar(base.ch(), base.lun(), pl as u8, base.blk(), 0, 0)
            }).collect::<Vec<_>>(),
            Generation::Linear => vec![base],
        };
        Command::erase(self.dev, &addrs, self.dev.pmode())?.execute(self.dev)
    }

    /// Erase every member and rewind the write position.
    ///
    /// Stops at the first failure, leaving the write position alone.
    #[tracing::instrument(skip(self), fields(count = self.count()))]
    pub fn erase(&mut self) -> std::result::Result<(), EraseError> {
        for chunk in 0..self.count() {
            self.erase_chunk(chunk).map_err(|error| {
                debug!(chunk, ?error, "erase failed");
                EraseError { chunk, error }
            })?;
        }
        self.pos_write = 0;
        Ok(())
    }

    /// Append `buf` at the write position.  `buf`'s length must be a
    /// multiple of [`stripe_nbytes`](Self::stripe_nbytes).
    ///
    /// The write position advances by one unit with each completed command.
    /// After a failure it stays at the last fully written unit.
    #[tracing::instrument(skip_all, fields(nbytes = buf.len()))]
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let first = self.stripe_range(self.pos_write, buf.len())?;
        let unit = self.unit_nbytes();
        for (i, data) in buf.chunks(unit).enumerate() {
            let (chunk, u) = self.locate(first + i);
            self.write_unit(chunk, u, data)?;
            self.pos_write += unit;
        }
        Ok(buf.len())
    }

    /// Fill the rest of the virtual block with zeroes.
    pub fn pad(&mut self) -> Result<usize> {
        let remaining = self.nbytes() - self.pos_write;
        let unit = self.unit_nbytes();
        let zeros = vec![0u8; unit];
        let first = self.stripe_range(self.pos_write, remaining)?;
        for i in 0..remaining / unit {
            let (chunk, u) = self.locate(first + i);
            self.write_unit(chunk, u, &zeros)?;
            self.pos_write += unit;
        }
        Ok(remaining)
    }

    /// Read `buf.len()` bytes from the start of the virtual block.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.read_at(buf, 0)
    }

    /// Read `buf.len()` bytes starting `offset` bytes into the virtual block.
    /// Both must be multiples of [`stripe_nbytes`](Self::stripe_nbytes).
    #[tracing::instrument(skip(self, buf), fields(nbytes = buf.len()))]
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        let first = self.stripe_range(offset, buf.len())?;
        let unit = self.unit_nbytes();
        for (i, data) in buf.chunks_mut(unit).enumerate() {
            let (chunk, u) = self.locate(first + i);
            self.read_unit(chunk, u, data)?;
        }
        Ok(buf.len())
    }

    /// Check that `buf_len` bytes starting at unit `unit` fit in one member
    fn chunk_range(&self, chunk: usize, unit: usize, buf_len: usize)
        -> Result<()>
    {
        let nunits = buf_len / self.unit_nbytes();
        if chunk >= self.count() || buf_len % self.unit_nbytes() != 0 ||
            unit.checked_add(nunits)
                .map_or(true, |end| end > self.units_per_chunk())
        {
            return Err(Error::EINVAL);
        }
        Ok(())
    }

    /// Write `buf` directly to member `chunk`, starting at write unit `unit`.
    ///
    /// This ignores the write position.  Mixing it with
    /// [`write`](Self::write) on the same virtual block is the caller's
    /// responsibility.
    pub fn pwrite(&self, buf: &[u8], chunk: usize, unit: usize)
        -> Result<usize>
    {
        self.chunk_range(chunk, unit, buf.len())?;
        for (i, data) in buf.chunks(self.unit_nbytes()).enumerate() {
            self.write_unit(chunk, unit + i, data)?;
        }
        Ok(buf.len())
    }

    /// Read into `buf` directly from member `chunk`, starting at write unit
    /// `unit`.
    pub fn pread(&self, buf: &mut [u8], chunk: usize, unit: usize)
        -> Result<usize>
    {
        self.chunk_range(chunk, unit, buf.len())?;
        let unit_nbytes = self.unit_nbytes();
        for (i, data) in buf.chunks_mut(unit_nbytes).enumerate() {
            self.read_unit(chunk, unit + i, data)?;
        }
        Ok(buf.len())
    }
}

impl<'d> Drop for VirtualBlock<'d> {
    fn drop(&mut self) {
        let cap = self.nbytes();
        if self.pos_write != 0 && self.pos_write != cap {
            warn!(pos_write = self.pos_write, nbytes = cap,
                  "dropping a partially written virtual block");
        }
    }
}

// LCOV_EXCL_STOP
