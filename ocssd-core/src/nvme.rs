// vim: tw=80
//! Open-Channel SSD command set: opcodes, flags, and data structure layouts
//!
//! All multi-byte fields are little-endian on the wire.

use crate::{
    geometry::{AddrFormat, Field, Generation, Geometry},
    types::*,
};
use byteorder::{ByteOrder, LittleEndian};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde_derive::{Deserialize, Serialize};

/// Maximum number of addresses in one vector command
pub const NADDR_MAX: usize = 64;

/// Size of the identify data structure
pub const IDFY_NBYTES: usize = 4096;

/// Scrambler enable bit of the control word
pub const FLAG_SCRBL: u16 = 0x200;

/// Vector copy is supported (revision 2.0 media and controller capabilities)
pub const MCCAP_VCOPY: u32 = 0x1;

#[derive(Clone, Copy, Debug, Eq, IntoPrimitive, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    Identify = 0xE2,
    SetBbt   = 0xF1,
    /// Get bad block table in 1.2, report chunk state in 2.0
    State    = 0xF2,
    Erase    = 0x90,
    Write    = 0x91,
    Read     = 0x92,
    Copy     = 0x93,
}

/// Direction of a command's data transfer, taken from the opcode's two least
/// significant bits as in NVMe.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    None,
    ToDevice,
    FromDevice,
    Both,
}

impl Direction {
    pub fn of(opcode: u8) -> Self {
        match opcode & 0x3 {
            0 => Direction::None,
            1 => Direction::ToDevice,
            2 => Direction::FromDevice,
            _ => Direction::Both,
        }
    }
}

/// How many planes a single planar command addresses at once
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, IntoPrimitive,
         PartialEq, Serialize, TryFromPrimitive)]
#[repr(u16)]
#[serde(rename_all = "lowercase")]
pub enum PlaneMode {
    #[default]
    Single = 0x0,
    Dual   = 0x1,
    Quad   = 0x2,
}

impl PlaneMode {
    /// The natural plane mode for a device with `nplanes` planes
    pub fn for_planes(nplanes: u32) -> Self {
        match nplanes {
            4 => PlaneMode::Quad,
            2 => PlaneMode::Dual,
            _ => PlaneMode::Single,
        }
    }
}

/// Geometry as reported by the identify command
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Identify {
    /// Revision 1.2.  Only the first configuration group is used.
    Planar {
        num_ch: u8,
        num_lun: u8,
        num_pln: u8,
        num_blk: u16,
        num_pg: u16,
        /// Flash page size in bytes
        fpg_sz: u16,
        /// Sector size in bytes
        csecs: u16,
        /// Out-of-band bytes per sector
        sos: u16,
        /// Offset and length pairs: ch, lun, pl, blk, pg, sec
        ppaf: [u8; 12],
    },
    /// Revision 2.0
    Linear {
        /// Field lengths: pugrp, punit, chunk, sectr
        lbaf: [u8; 4],
        mccap: u32,
        npugrp: u16,
        npunit: u16,
        nchunk: u32,
        nsectr: u32,
        nbytes: u32,
        nbytes_oob: u32,
        ws_min: u32,
        ws_opt: u32,
        mw_cunits: u32,
    }
}

impl Identify {
    const VERID_12: u8 = 0x1;
    const VERID_20: u8 = 0x2;

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < IDFY_NBYTES {
            return Err(Error::EINVAL);
        }
        match buf[0] {
            Self::VERID_12 => {
                let grp = &buf[256..];
                let mut ppaf = [0u8; 12];
                ppaf.copy_from_slice(&buf[12..24]);
                Ok(Identify::Planar {
                    num_ch: grp[4],
                    num_lun: grp[5],
                    num_pln: grp[6],
                    num_blk: LittleEndian::read_u16(&grp[8..]),
                    num_pg: LittleEndian::read_u16(&grp[10..]),
                    fpg_sz: LittleEndian::read_u16(&grp[12..]),
                    csecs: LittleEndian::read_u16(&grp[14..]),
                    sos: LittleEndian::read_u16(&grp[16..]),
                    ppaf,
                })
            }
            Self::VERID_20 => {
                let mut lbaf = [0u8; 4];
                lbaf.copy_from_slice(&buf[8..12]);
                Ok(Identify::Linear {
                    lbaf,
                    mccap: LittleEndian::read_u32(&buf[16..]),
                    npugrp: LittleEndian::read_u16(&buf[64..]),
                    npunit: LittleEndian::read_u16(&buf[66..]),
                    nchunk: LittleEndian::read_u32(&buf[68..]),
                    nsectr: LittleEndian::read_u32(&buf[72..]),
                    nbytes: LittleEndian::read_u32(&buf[76..]),
                    nbytes_oob: LittleEndian::read_u32(&buf[80..]),
                    ws_min: LittleEndian::read_u32(&buf[128..]),
                    ws_opt: LittleEndian::read_u32(&buf[132..]),
                    mw_cunits: LittleEndian::read_u32(&buf[136..]),
                })
            }
            _ => Err(Error::EINVAL)
        }
    }

    /// Describe `geo` the way a device would identify itself.
    pub fn from_geometry(geo: &Geometry) -> Self {
        match (geo.generation, geo.format) {
            (Generation::Planar,
             AddrFormat::Planar { ch, lun, pl, blk, pg, sec }) =>
            {
                let ppaf = [ch, lun, pl, blk, pg, sec]
                    .map(|f| [f.off, f.len]);
                Identify::Planar {
                    num_ch: geo.nchannels as u8,
                    num_lun: geo.nluns as u8,
                    num_pln: geo.nplanes as u8,
                    num_blk: geo.nblocks as u16,
                    num_pg: geo.npages as u16,
                    fpg_sz: geo.page_nbytes as u16,
                    csecs: geo.sector_nbytes as u16,
                    sos: geo.meta_nbytes as u16,
                    ppaf: ppaf.concat().try_into().unwrap_or([0; 12]),
                }
            }
            (_, format) => {
                let lbaf = match format {
                    AddrFormat::Linear { pugrp, punit, chunk, sectr } =>
                        [pugrp.len, punit.len, chunk.len, sectr.len],
                    AddrFormat::Planar{..} => [0; 4],
                };
                Identify::Linear {
                    lbaf,
                    mccap: MCCAP_VCOPY,
                    npugrp: geo.npugrp as u16,
                    npunit: geo.npunit as u16,
                    nchunk: geo.nchunk,
                    nsectr: geo.nsectr,
                    nbytes: geo.sector_nbytes,
                    nbytes_oob: geo.meta_nbytes,
                    ws_min: geo.ws_min,
                    ws_opt: geo.ws_opt,
                    mw_cunits: 0,
                }
            }
        }
    }

    /// Encode into an identify data structure
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; IDFY_NBYTES];
        match *self {
            Identify::Planar { num_ch, num_lun, num_pln, num_blk, num_pg,
                fpg_sz, csecs, sos, ppaf } =>
            {
                buf[0] = Self::VERID_12;
                buf[2] = 1;     // configuration groups
                buf[12..24].copy_from_slice(&ppaf);
                let grp = &mut buf[256..];
                grp[4] = num_ch;
                grp[5] = num_lun;
                grp[6] = num_pln;
                LittleEndian::write_u16(&mut grp[8..], num_blk);
                LittleEndian::write_u16(&mut grp[10..], num_pg);
                LittleEndian::write_u16(&mut grp[12..], fpg_sz);
                LittleEndian::write_u16(&mut grp[14..], csecs);
                LittleEndian::write_u16(&mut grp[16..], sos);
            }
            Identify::Linear { lbaf, mccap, npugrp, npunit, nchunk, nsectr,
                nbytes, nbytes_oob, ws_min, ws_opt, mw_cunits } =>
            {
                buf[0] = Self::VERID_20;
                buf[8..12].copy_from_slice(&lbaf);
                LittleEndian::write_u32(&mut buf[16..], mccap);
                LittleEndian::write_u16(&mut buf[64..], npugrp);
                LittleEndian::write_u16(&mut buf[66..], npunit);
                LittleEndian::write_u32(&mut buf[68..], nchunk);
                LittleEndian::write_u32(&mut buf[72..], nsectr);
                LittleEndian::write_u32(&mut buf[76..], nbytes);
                LittleEndian::write_u32(&mut buf[80..], nbytes_oob);
                LittleEndian::write_u32(&mut buf[128..], ws_min);
                LittleEndian::write_u32(&mut buf[132..], ws_opt);
                LittleEndian::write_u32(&mut buf[136..], mw_cunits);
            }
        }
        buf
    }

    /// Derive the device geometry.
    ///
    /// A device-reported address format is used when it has any non-zero
    /// field length.  Otherwise the format is computed from the counts.
    pub fn geometry(&self) -> Result<Geometry> {
        match *self {
            Identify::Planar { num_ch, num_lun, num_pln, num_blk, num_pg,
                fpg_sz, csecs, sos, ppaf } =>
            {
                if csecs == 0 || fpg_sz % csecs != 0 {
                    return Err(Error::EINVAL);
                }
                let geo = Geometry::planar(num_ch.into(), num_lun.into(),
                    num_pln.into(), num_blk.into(), num_pg.into(),
                    u32::from(fpg_sz / csecs), csecs.into(), sos.into())?;
                if ppaf.chunks(2).all(|f| f[1] == 0) {
                    return Ok(geo);
                }
                let f = |i: usize| Field::new(ppaf[2 * i], ppaf[2 * i + 1]);
                geo.with_format(AddrFormat::Planar {
                    ch: f(0), lun: f(1), pl: f(2), blk: f(3), pg: f(4),
                    sec: f(5)
                })
            }
            Identify::Linear { lbaf, npugrp, npunit, nchunk, nsectr, nbytes,
                nbytes_oob, ws_min, ws_opt, .. } =>
            {
                let geo = Geometry::linear(npugrp.into(), npunit.into(),
                    nchunk, nsectr, ws_min, ws_opt, nbytes, nbytes_oob)?;
                if lbaf == [0; 4] {
                    return Ok(geo);
                }
                let [pugrp_len, punit_len, chunk_len, sectr_len] = lbaf;
                let sectr = Field::new(0, sectr_len);
                let chunk = Field::new(sectr_len, chunk_len);
                let punit = Field::new(sectr_len + chunk_len, punit_len);
                let pugrp = Field::new(sectr_len + chunk_len + punit_len,
                                       pugrp_len);
                geo.with_format(AddrFormat::Linear {pugrp, punit, chunk, sectr})
            }
        }
    }

    /// Does the device support vector copy?
    pub fn vcopy(&self) -> bool {
        matches!(self, Identify::Linear{mccap, ..} if mccap & MCCAP_VCOPY != 0)
    }
}

/// Size of the bad block table header, not including the entries
pub const BBT_HEADER_NBYTES: usize = 64;

/// Header of the device's bad block table for one parallel unit
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BbtHeader {
    pub verid: u16,
    pub revid: u16,
    /// Total number of entries
    pub tblks: u32,
    /// Number of factory bad blocks
    pub tfact: u32,
    /// Number of grown bad blocks
    pub tgrown: u32,
    /// Number of device-reserved blocks
    pub tdresv: u32,
    /// Number of host-reserved blocks
    pub thresv: u32,
}

impl BbtHeader {
    pub const TBLID: [u8; 4] = *b"BBLT";

    /// Buffer size needed to hold a table with `nblks` entries
    pub fn nbytes(nblks: usize) -> usize {
        BBT_HEADER_NBYTES + nblks
    }

    /// Parse a table, returning the header and the entries.
    ///
    /// Fails with `EIO` if the table is malformed.
    pub fn parse(buf: &[u8]) -> Result<(Self, &[u8])> {
        if buf.len() < BBT_HEADER_NBYTES || buf[0..4] != Self::TBLID {
            return Err(Error::EIO);
        }
        let hdr = BbtHeader {
            verid: LittleEndian::read_u16(&buf[4..]),
            revid: LittleEndian::read_u16(&buf[6..]),
            tblks: LittleEndian::read_u32(&buf[12..]),
            tfact: LittleEndian::read_u32(&buf[16..]),
            tgrown: LittleEndian::read_u32(&buf[20..]),
            tdresv: LittleEndian::read_u32(&buf[24..]),
            thresv: LittleEndian::read_u32(&buf[28..]),
        };
        let end = BBT_HEADER_NBYTES + hdr.tblks as usize;
        if buf.len() < end {
            return Err(Error::EIO);
        }
        Ok((hdr, &buf[BBT_HEADER_NBYTES..end]))
    }

    /// Encode a header followed by `blks` into `buf`
    pub fn write(&self, blks: &[u8], buf: &mut [u8]) -> Result<()> {
        if buf.len() < Self::nbytes(blks.len()) {
            return Err(Error::EINVAL);
        }
        buf[0..4].copy_from_slice(&Self::TBLID);
        LittleEndian::write_u16(&mut buf[4..], self.verid);
        LittleEndian::write_u16(&mut buf[6..], self.revid);
        LittleEndian::write_u32(&mut buf[12..], self.tblks);
        LittleEndian::write_u32(&mut buf[16..], self.tfact);
        LittleEndian::write_u32(&mut buf[20..], self.tgrown);
        LittleEndian::write_u32(&mut buf[24..], self.tdresv);
        LittleEndian::write_u32(&mut buf[28..], self.thresv);
        buf[BBT_HEADER_NBYTES..Self::nbytes(blks.len())].copy_from_slice(blks);
        Ok(())
    }
}

/// Chunk state bits from the chunk report
pub mod chunk_state {
    pub const FREE: u8 = 0x1;
    pub const CLOSED: u8 = 0x2;
    pub const OPEN: u8 = 0x4;
    pub const OFFLINE: u8 = 0x8;
}

/// Size of the chunk report header
pub const RPRT_HEADER_NBYTES: usize = 64;

/// Size of one chunk descriptor
pub const RPRT_DESCR_NBYTES: usize = 64;

/// One entry of the chunk report
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ChunkDescriptor {
    /// One of the [`chunk_state`] bits
    pub state: u8,
    pub ctype: u8,
    pub limits: u8,
    /// Device-format address of the chunk's first sector
    pub addr: u64,
    /// Number of sectors in the chunk
    pub naddrs: u64,
    /// Write pointer, in sectors from the start of the chunk
    pub wptr: u64,
}

impl ChunkDescriptor {
    pub fn is_free(&self) -> bool {
        self.state & chunk_state::FREE != 0
    }

    pub fn is_offline(&self) -> bool {
        self.state & chunk_state::OFFLINE != 0
    }

    /// Buffer size needed for a report with `ndescr` descriptors
    pub fn report_nbytes(ndescr: usize) -> usize {
        RPRT_HEADER_NBYTES + ndescr * RPRT_DESCR_NBYTES
    }

    /// Parse a chunk report
    pub fn parse_report(buf: &[u8]) -> Result<Vec<Self>> {
        if buf.len() < RPRT_HEADER_NBYTES {
            return Err(Error::EIO);
        }
        let n = LittleEndian::read_u64(&buf[0..]) as usize;
        if buf.len() < Self::report_nbytes(n) {
            return Err(Error::EIO);
        }
        let descrs = buf[RPRT_HEADER_NBYTES..Self::report_nbytes(n)]
            .chunks_exact(RPRT_DESCR_NBYTES)
            .map(|d| ChunkDescriptor {
                state: d[0],
                ctype: d[1],
                limits: d[2],
                addr: LittleEndian::read_u64(&d[8..]),
                naddrs: LittleEndian::read_u64(&d[16..]),
                wptr: LittleEndian::read_u64(&d[24..]),
            }).collect();
        Ok(descrs)
    }

    /// Encode a chunk report into `buf`
    pub fn write_report(descrs: &[Self], buf: &mut [u8]) -> Result<()> {
        if buf.len() < Self::report_nbytes(descrs.len()) {
            return Err(Error::EINVAL);
        }
        LittleEndian::write_u64(&mut buf[0..], descrs.len() as u64);
        let body = &mut buf[RPRT_HEADER_NBYTES..];
        for (d, out) in descrs.iter()
            .zip(body.chunks_exact_mut(RPRT_DESCR_NBYTES))
        {
            out[0] = d.state;
            out[1] = d.ctype;
            out[2] = d.limits;
            LittleEndian::write_u64(&mut out[8..], d.addr);
            LittleEndian::write_u64(&mut out[16..], d.naddrs);
            LittleEndian::write_u64(&mut out[24..], d.wptr);
        }
        Ok(())
    }
}

// LCOV_EXCL_STOP
