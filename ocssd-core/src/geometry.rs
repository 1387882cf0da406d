// vim: tw=80
//! Physical device geometry
//!
//! A `Geometry` is fixed when a device is opened and never changes afterwards.
//! It describes both the shape of the device and the bit layout that the
//! device expects for its physical addresses.

use crate::{
    types::*,
    util::bits_for,
};
use serde_derive::{Deserialize, Serialize};

/// Which Open-Channel generation describes the device
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Generation {
    /// Revision 1.2: channel / lun / plane / block / page / sector
    Planar,
    /// Revision 2.0: group / parallel unit / chunk / sector
    Linear,
}

/// Location of one address field within a device-format address
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq,
         Serialize)]
pub struct Field {
    /// Offset of the least significant bit
    pub off: u8,
    /// Number of bits
    pub len: u8,
}

impl Field {
    pub const fn new(off: u8, len: u8) -> Self {
        Field { off, len }
    }
}

/// Device-format address layout.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddrFormat {
    Planar {
        ch: Field,
        lun: Field,
        pl: Field,
        blk: Field,
        pg: Field,
        sec: Field,
    },
    Linear {
        pugrp: Field,
        punit: Field,
        chunk: Field,
        sectr: Field,
    },
}

impl AddrFormat {
    /// Pack fields, given from least to most significant, using the narrowest
    /// widths that can hold each count.
    fn packed<const N: usize>(counts: [u64; N]) -> [Field; N] {
        let mut off = 0;
        counts.map(|count| {
            let field = Field::new(off, bits_for(count));
            off += field.len;
            field
        })
    }

    fn planar(geo: &Geometry) -> Self {
        let [sec, pl, pg, blk, lun, ch] = Self::packed([
            geo.nsectors.into(),
            geo.nplanes.into(),
            geo.npages.into(),
            geo.nblocks.into(),
            geo.nluns.into(),
            geo.nchannels.into(),
        ]);
        AddrFormat::Planar { ch, lun, pl, blk, pg, sec }
    }

    fn linear(geo: &Geometry) -> Self {
        let [sectr, chunk, punit, pugrp] = Self::packed([
            geo.nsectr.into(),
            geo.nchunk.into(),
            geo.npunit.into(),
            geo.npugrp.into(),
        ]);
        AddrFormat::Linear { pugrp, punit, chunk, sectr }
    }

    pub fn generation(&self) -> Generation {
        match self {
            AddrFormat::Planar{..} => Generation::Planar,
            AddrFormat::Linear{..} => Generation::Linear,
        }
    }

    /// The fields paired with their counts, most significant level first.
    pub(crate) fn fields(&self, geo: &Geometry) -> Vec<(Field, u64)> {
        match *self {
            AddrFormat::Planar { ch, lun, pl, blk, pg, sec } => vec![
                (ch, geo.nchannels.into()),
                (lun, geo.nluns.into()),
                (pl, geo.nplanes.into()),
                (blk, geo.nblocks.into()),
                (pg, geo.npages.into()),
                (sec, geo.nsectors.into()),
            ],
            AddrFormat::Linear { pugrp, punit, chunk, sectr } => vec![
                (pugrp, geo.npugrp.into()),
                (punit, geo.npunit.into()),
                (chunk, geo.nchunk.into()),
                (sectr, geo.nsectr.into()),
            ]
        }
    }
}

/// Describes the physical shape of an Open-Channel device.
///
/// Both the planar and linear views are always populated.  For a planar
/// device the linear view is derived from it, and vice versa, so that code
/// which only cares about "parallel units" and "chunks" can ignore the
/// generation.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Geometry {
    pub generation: Generation,

    /// Channels, or parallel unit groups
    pub nchannels: u32,
    /// LUNs per channel, or parallel units per group
    pub nluns: u32,
    /// Planes per LUN
    pub nplanes: u32,
    /// Blocks per plane, or chunks per parallel unit
    pub nblocks: u32,
    /// Pages per block
    pub npages: u32,
    /// Sectors per page
    pub nsectors: u32,
    pub sector_nbytes: u32,
    pub page_nbytes: u32,
    /// Out-of-band bytes per sector
    pub meta_nbytes: u32,

    pub npugrp: u32,
    pub npunit: u32,
    pub nchunk: u32,
    /// Sectors per chunk
    pub nsectr: u32,
    /// Minimum number of sectors per write
    pub ws_min: u32,
    /// Optimal number of sectors per write
    pub ws_opt: u32,

    pub format: AddrFormat,
}

impl Geometry {
    /// Describe a revision 1.2 device.
    ///
    /// The device address format is computed from the counts.  Use
    /// [`Geometry::with_format`] when the device reports its own.
    #[allow(clippy::too_many_arguments)]
    pub fn planar(nchannels: u32, nluns: u32, nplanes: u32, nblocks: u32,
        npages: u32, nsectors: u32, sector_nbytes: u32, meta_nbytes: u32)
        -> Result<Self>
    {
        let super_page = nplanes.checked_mul(nsectors).ok_or(Error::EINVAL)?;
        let mut geo = Geometry {
            generation: Generation::Planar,
            nchannels,
            nluns,
            nplanes,
            nblocks,
            npages,
            nsectors,
            sector_nbytes,
            page_nbytes: nsectors.checked_mul(sector_nbytes)
                .ok_or(Error::EINVAL)?,
            meta_nbytes,
            npugrp: nchannels,
            npunit: nluns,
            nchunk: nblocks,
            nsectr: npages.checked_mul(super_page).ok_or(Error::EINVAL)?,
            ws_min: super_page,
            ws_opt: super_page,
            // Placeholder until the counts are known to be valid
            format: AddrFormat::Linear {
                pugrp: Field::default(),
                punit: Field::default(),
                chunk: Field::default(),
                sectr: Field::default(),
            }
        };
        geo.check_counts()?;
        geo.format = AddrFormat::planar(&geo);
        Ok(geo)
    }

    /// Describe a revision 2.0 device.
    ///
    /// The planar view treats `ws_opt / ws_min` as the number of planes and
    /// `ws_min` sectors as one page.
    #[allow(clippy::too_many_arguments)]
    pub fn linear(npugrp: u32, npunit: u32, nchunk: u32, nsectr: u32,
        ws_min: u32, ws_opt: u32, sector_nbytes: u32, meta_nbytes: u32)
        -> Result<Self>
    {
        if ws_min == 0 || ws_opt < ws_min || ws_opt % ws_min != 0 ||
            nsectr % ws_opt != 0
        {
            return Err(Error::EINVAL);
        }
        let mut geo = Geometry {
            generation: Generation::Linear,
            nchannels: npugrp,
            nluns: npunit,
            nplanes: ws_opt / ws_min,
            nblocks: nchunk,
            npages: nsectr / ws_opt,
            nsectors: ws_min,
            sector_nbytes,
            page_nbytes: ws_min.checked_mul(sector_nbytes)
                .ok_or(Error::EINVAL)?,
            meta_nbytes,
            npugrp,
            npunit,
            nchunk,
            nsectr,
            ws_min,
            ws_opt,
            format: AddrFormat::Planar {
                ch: Field::default(),
                lun: Field::default(),
                pl: Field::default(),
                blk: Field::default(),
                pg: Field::default(),
                sec: Field::default(),
            }
        };
        geo.check_counts()?;
        geo.format = AddrFormat::linear(&geo);
        Ok(geo)
    }

    /// Replace the computed device address format with one reported by the
    /// device.
    ///
    /// Every field must be wide enough for its count, fields may not overlap,
    /// and the generation must match.
    pub fn with_format(mut self, format: AddrFormat) -> Result<Self> {
        if format.generation() != self.generation {
            return Err(Error::EINVAL);
        }
        let mut used = 0u64;
        for (field, count) in format.fields(&self) {
            if u32::from(field.off) + u32::from(field.len) > 64 ||
                field.len < bits_for(count)
            {
                return Err(Error::EINVAL);
            }
            let bits = crate::util::mask(field.len) << field.off;
            if used & bits != 0 {
                return Err(Error::EINVAL);
            }
            used |= bits;
        }
        self.format = format;
        Ok(self)
    }

    /// Load a geometry description from YAML, validating it.
    pub fn from_yaml(s: &str) -> Result<Self> {
        let geo: Geometry = serde_yaml_ng::from_str(s)
            .map_err(|_| Error::EINVAL)?;
        geo.check_counts()?;
        let format = geo.format;
        geo.with_format(format)
    }

    /// Every count must be non-zero, and fit in the generic address packing.
    fn check_counts(&self) -> Result<()> {
        let planar = [
            (self.nchannels, 1 << 8),
            (self.nluns, 1 << 8),
            (self.nplanes, 1 << 8),
            (self.nblocks, 1 << 16),
            (self.npages, 1 << 16),
            (self.nsectors, 1 << 8),
        ];
        let linear = [
            (self.npugrp, 1 << 8),
            (self.npunit, 1 << 8),
            (self.nchunk, 1 << 16),
            (self.nsectr, u64::from(u32::MAX) + 1),
        ];
        let fits = planar.iter().chain(linear.iter())
            .all(|&(count, limit)| count > 0 && u64::from(count) <= limit);
        if !fits || self.sector_nbytes == 0 {
            return Err(Error::EINVAL);
        }
        Ok(())
    }

    /// Number of parallel units on the device
    pub fn nunits(&self) -> u64 {
        u64::from(self.npugrp) * u64::from(self.npunit)
    }

    /// Number of sectors in one block or chunk
    pub fn chunk_nsectors(&self) -> u64 {
        u64::from(self.nsectr)
    }

    /// Number of bytes in one block or chunk
    pub fn chunk_nbytes(&self) -> u64 {
        self.chunk_nsectors() * u64::from(self.sector_nbytes)
    }

    /// Number of sectors on the device
    pub fn total_nsectors(&self) -> u64 {
        self.nunits() * u64::from(self.nchunk) * self.chunk_nsectors()
    }

    /// Total number of bytes on the device
    pub fn tbytes(&self) -> u64 {
        self.total_nsectors() * u64::from(self.sector_nbytes)
    }

    /// Sectors in the smallest write a block or chunk accepts.
    ///
    /// For a planar device that is one page across every plane.
    pub fn write_unit_nsectors(&self) -> u32 {
        match self.generation {
            Generation::Planar => self.nplanes * self.nsectors,
            Generation::Linear => self.ws_min,
        }
    }

    pub fn write_unit_nbytes(&self) -> usize {
        self.write_unit_nsectors() as usize * self.sector_nbytes as usize
    }
}

// LCOV_EXCL_STOP
