// vim: tw=80
//! Physical addresses and their encodings
//!
//! An address always travels in exactly one encoding, and each encoding has
//! its own type:
//!
//! * [`Addr`]: the generic, bit-packed form.  It has accessors for both the
//!   planar and linear hierarchies.  Which one applies is decided by the
//!   [`Geometry`] it is used with.
//! * [`DevAddr`]: the packing that the device expects on the wire.  Its layout
//!   comes from [`Geometry::format`].
//! * [`Offset`]: a byte offset into the device's linear address space.
//! * [`Lba`]: a sector number in the same space.
//!
//! Converting with the wrong `Geometry` is not detected.

use crate::{
    geometry::{Generation, Geometry},
    types::*,
    util::mask,
};
use bitfield::*;
use serde_derive::{Deserialize, Serialize};

bitfield! {
    /// A physical address in generic form
    ///
    /// The planar and linear views share storage.  In particular `ch` and
    /// `pugrp`, and `lun` and `punit`, occupy the same bits, so a parallel unit
    /// is identified the same way in both generations.
    #[derive(Clone, Copy, Default, Deserialize, Eq, Hash, Ord, PartialEq,
             PartialOrd, Serialize)]
    pub struct Addr(u64);
    impl Debug;
    u8; pub sec, set_sec: 7, 0;
    u16; pub pg, set_pg: 23, 8;
    u8; pub pl, set_pl: 31, 24;
    u16; pub blk, set_blk: 47, 32;
    u8; pub lun, set_lun: 55, 48;
    u8; pub ch, set_ch: 63, 56;
    u32; pub sectr, set_sectr: 31, 0;
    u16; pub chunk, set_chunk: 47, 32;
    u8; pub punit, set_punit: 55, 48;
    u8; pub pugrp, set_pugrp: 63, 56;
}

/// A physical address packed the way the device expects it
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
pub struct DevAddr(pub u64);

/// Byte offset into the device's linear address space
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
pub struct Offset(pub u64);

/// Sector number in the device's linear address space
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
pub struct Lba(pub u64);

impl Addr {
    /// Construct a revision 1.2 address
    pub fn planar(ch: u8, lun: u8, pl: u8, blk: u16, pg: u16, sec: u8) -> Self
    {
        let mut addr = Addr(0);
        addr.set_ch(ch);
        addr.set_lun(lun);
        addr.set_pl(pl);
        addr.set_blk(blk);
        addr.set_pg(pg);
        addr.set_sec(sec);
        addr
    }

    /// Construct a revision 2.0 address
    pub fn linear(pugrp: u8, punit: u8, chunk: u16, sectr: u32) -> Self {
        let mut addr = Addr(0);
        addr.set_pugrp(pugrp);
        addr.set_punit(punit);
        addr.set_chunk(chunk);
        addr.set_sectr(sectr);
        addr
    }

    /// The raw generic value
    pub fn val(self) -> u64 {
        self.0
    }

    /// Just the parallel unit part of this address
    pub fn unit(self) -> Self {
        Addr(self.0 & !mask(48))
    }

    /// Index of this address's parallel unit, counting groups outermost
    pub fn unit_index(self, geo: &Geometry) -> u64 {
        u64::from(self.ch()) * u64::from(geo.npunit) + u64::from(self.lun())
    }

    /// Field values in `geo`'s generation, most significant level first
    fn digits(self, generation: Generation) -> Vec<u64> {
        match generation {
            Generation::Planar => vec![
                self.ch().into(),
                self.lun().into(),
                self.pl().into(),
                self.blk().into(),
                self.pg().into(),
                self.sec().into(),
            ],
            Generation::Linear => vec![
                self.pugrp().into(),
                self.punit().into(),
                self.chunk().into(),
                self.sectr().into(),
            ]
        }
    }

    /// Inverse of `digits`.  The digits must already be in range.
    fn from_digits(generation: Generation, d: &[u64]) -> Self {
        match generation {
            Generation::Planar => Addr::planar(d[0] as u8, d[1] as u8,
                d[2] as u8, d[3] as u16, d[4] as u16, d[5] as u8),
            Generation::Linear => Addr::linear(d[0] as u8, d[1] as u8,
                d[2] as u16, d[3] as u32),
        }
    }

    /// Check every field against its bound in `geo`.
    ///
    /// A field equal to its count is out of range.
    pub fn validate(self, geo: &Geometry) -> Result<()> {
        let counts = geo.format.fields(geo);
        let in_range = self.digits(geo.generation).iter()
            .zip(counts.iter())
            .all(|(&d, &(_, count))| d < count);
        if in_range {
            Ok(())
        } else {
            Err(Error::EINVAL)
        }
    }

    /// Pack into the device format
    pub fn to_device(self, geo: &Geometry) -> Result<DevAddr> {
        self.validate(geo)?;
        let val = self.digits(geo.generation).iter()
            .zip(geo.format.fields(geo))
            .fold(0u64, |acc, (&d, (field, _))| acc | (d << field.off));
        Ok(DevAddr(val))
    }

    /// Unpack from the device format.
    ///
    /// Fails if any field is out of range, or if any bit outside of the
    /// format's fields is set.
    pub fn from_device(dev: DevAddr, geo: &Geometry) -> Result<Self> {
        let fields = geo.format.fields(geo);
        let mut used = 0u64;
        let mut digits = Vec::with_capacity(fields.len());
        for (field, count) in fields {
            let d = (dev.0 >> field.off) & mask(field.len);
            if d >= count {
                return Err(Error::EINVAL);
            }
            used |= mask(field.len) << field.off;
            digits.push(d);
        }
        if dev.0 & !used != 0 {
            return Err(Error::EINVAL);
        }
        Ok(Addr::from_digits(geo.generation, &digits))
    }

    pub fn to_lba(self, geo: &Geometry) -> Result<Lba> {
        self.validate(geo)?;
        let lba = self.digits(geo.generation).iter()
            .zip(geo.format.fields(geo))
            .fold(0u64, |acc, (&d, (_, count))| acc * count + d);
        Ok(Lba(lba))
    }

    pub fn from_lba(lba: Lba, geo: &Geometry) -> Result<Self> {
        if lba.0 >= geo.total_nsectors() {
            return Err(Error::EINVAL);
        }
        let fields = geo.format.fields(geo);
        let mut digits = vec![0u64; fields.len()];
        let mut rem = lba.0;
        for (i, &(_, count)) in fields.iter().enumerate().rev() {
            digits[i] = rem % count;
            rem /= count;
        }
        Ok(Addr::from_digits(geo.generation, &digits))
    }

    pub fn to_offset(self, geo: &Geometry) -> Result<Offset> {
        let lba = self.to_lba(geo)?;
        Ok(Offset(lba.0 * u64::from(geo.sector_nbytes)))
    }

    /// Fails unless `offset` is sector-aligned and within the device.
    pub fn from_offset(offset: Offset, geo: &Geometry) -> Result<Self> {
        let nbytes = u64::from(geo.sector_nbytes);
        if offset.0 % nbytes != 0 {
            return Err(Error::EINVAL);
        }
        Addr::from_lba(Lba(offset.0 / nbytes), geo)
    }
}

impl DevAddr {
    pub fn to_generic(self, geo: &Geometry) -> Result<Addr> {
        Addr::from_device(self, geo)
    }
}

// LCOV_EXCL_STOP
