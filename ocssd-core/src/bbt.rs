// vim: tw=80
//! Per-parallel-unit bad block tables
//!
//! A table has one entry per block and plane of its parallel unit.  Entry
//! `blk * nplanes + pl` holds the state of plane `pl` of block `blk`.

use crate::{
    addr::Addr,
    cmd::{self, Command, Transfer},
    dev::Device,
    geometry::Generation,
    nvme::{BbtHeader, NADDR_MAX},
    types::*,
};
use itertools::Itertools;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// The state of one block, as stored in the device's table
#[derive(Clone, Copy, Debug, Eq, Hash, IntoPrimitive, Ord, PartialEq,
         PartialOrd, TryFromPrimitive)]
#[repr(u8)]
pub enum BlockState {
    Free        = 0x0,
    /// Bad from the factory
    Bad         = 0x1,
    /// Went bad in service
    GrownBad    = 0x2,
    /// Reserved by the device.  The host can't change these.
    DevReserved = 0x4,
    /// Marked bad by the host
    HostMarked  = 0x8,
}

/// Snapshot of one parallel unit's bad block table
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BadBlockTable {
    unit: Addr,
    nplanes: u32,
    nblocks: u32,
    blks: Vec<u8>,
}

impl BadBlockTable {
    fn alloc(n: usize) -> Result<Vec<u8>> {
        let mut v = Vec::new();
        v.try_reserve_exact(n).map_err(|_| Error::ENOMEM)?;
        v.resize(n, 0);
        Ok(v)
    }

    /// Fetch a fresh snapshot of the table for the parallel unit containing
    /// `addr`.
    ///
    /// Revision 2.0 devices have no bad block table.  For those, the table is
    /// derived from the chunk report, with offline chunks grown bad.
    pub fn get(dev: &Device, addr: Addr) -> Result<Self> {
        let geo = dev.geometry();
        let unit = addr.unit();
        unit.validate(geo)?;
        let (nplanes, nblocks) = (geo.nplanes, geo.nblocks);
        let nentries = (nplanes * nblocks) as usize;
        let blks = match geo.generation {
            Generation::Planar => {
                let mut buf = Self::alloc(BbtHeader::nbytes(nentries))?;
                Command::get_bbt(dev, unit, Transfer::FromDevice(&mut buf))?
                    .execute(dev)?;
                let (hdr, entries) = BbtHeader::parse(&buf)?;
                if hdr.tblks as usize != nentries {
                    debug!(tblks = hdr.tblks, nentries,
                           "bad block table has the wrong size");
                    return Err(Error::EIO);
                }
                entries.to_vec()
            },
            Generation::Linear => {
                let descrs = cmd::report(dev, Some(unit), None)?;
                if descrs.len() != nblocks as usize {
                    return Err(Error::EIO);
                }
                let mut blks = Self::alloc(nentries)?;
                for (chunk, d) in descrs.iter().enumerate() {
                    if d.is_offline() {
                        let i = chunk * nplanes as usize;
                        blks[i..i + nplanes as usize]
                            .fill(BlockState::GrownBad.into());
                    }
                }
                blks
            }
        };
        Ok(BadBlockTable { unit, nplanes, nblocks, blks })
    }

    /// Persist `self` to the device, replacing the whole table.
    ///
    /// Only the entries that differ from the device's current table are sent.
    /// If the device rejects any of them, the ones already applied are
    /// reverted before returning the error.
    pub fn set(&self, dev: &Device) -> Result<()> {
        let geo = dev.geometry();
        if geo.generation != Generation::Planar {
            return Err(Error::ENOTSUP);
        }
        if self.nplanes != geo.nplanes || self.nblocks != geo.nblocks ||
            self.blks.len() != (geo.nplanes * geo.nblocks) as usize
        {
            return Err(Error::EINVAL);
        }
        for &e in self.blks.iter() {
            BlockState::try_from(e).map_err(|_| Error::EINVAL)?;
        }
        let current = BadBlockTable::get(dev, self.unit)?;
        let groups = self.plan(&current)?;
        let mut applied: Vec<(BlockState, &[(u32, u32)])> = Vec::new();
        for (state, blocks) in groups.iter() {
            for batch in blocks.chunks(NADDR_MAX) {
                if let Err(e) = self.send(dev, *state, batch) {
                    self.revert(dev, &current, &applied);
                    return Err(e);
                }
                applied.push((*state, batch));
            }
        }
        Ok(())
    }

    /// Group the entries that change from `current` to `self` by their new
    /// state.
    fn plan(&self, current: &BadBlockTable)
        -> Result<BTreeMap<BlockState, Vec<(u32, u32)>>>
    {
        let mut groups = BTreeMap::<BlockState, Vec<(u32, u32)>>::new();
        for (i, (&old, &new)) in current.blks.iter()
            .zip(self.blks.iter())
            .enumerate()
            .filter(|(_, (old, new))| old != new)
        {
            let dmrk = u8::from(BlockState::DevReserved);
            if old == dmrk || new == dmrk {
                return Err(Error::EINVAL);
            }
            let state = BlockState::try_from(new).map_err(|_| Error::EINVAL)?;
            let (blk, pl) = self.position(i);
            groups.entry(state).or_default().push((blk, pl));
        }
        Ok(groups)
    }

    /// Best-effort restore of the entries in `applied` to their states in
    /// `current`
    fn revert(&self, dev: &Device, current: &BadBlockTable,
              applied: &[(BlockState, &[(u32, u32)])])
    {
        let by_state = applied.iter()
            .flat_map(|(_, batch)| batch.iter())
            .filter_map(|&(blk, pl)| {
                current.state(blk, pl).map(|s| (s, (blk, pl)))
            })
            .into_group_map();
        for (state, blocks) in by_state {
            for batch in blocks.chunks(NADDR_MAX) {
                if let Err(e) = self.send(dev, state, batch) {
                    warn!(?e, ?state, "could not revert bad block table");
                }
            }
        }
    }

    fn send(&self, dev: &Device, state: BlockState, blocks: &[(u32, u32)])
        -> Result<()>
    {
        let addrs = blocks.iter()
            .map(|&(blk, pl)| Addr::planar(self.unit.ch(), self.unit.lun(),
                                           pl as u8, blk as u16, 0, 0))
            .collect::<Vec<_>>();
        Command::set_bbt(dev, &addrs, state.into())?.execute(dev)
    }

    /// Fetch, update, and persist the tables of every parallel unit addressed
    /// by `addrs`, setting each addressed block and plane to `state`.
    ///
    /// This is not atomic with respect to other actors changing the same
    /// tables.
    pub fn mark(dev: &Device, addrs: &[Addr], state: BlockState)
        -> Result<()>
    {
        let geo = dev.geometry();
        if geo.generation != Generation::Planar {
            return Err(Error::ENOTSUP);
        }
        if state == BlockState::DevReserved {
            return Err(Error::EINVAL);
        }
        for a in addrs {
            a.validate(geo)?;
        }
        let by_unit = addrs.iter().map(|a| (a.unit(), *a)).into_group_map();
        for (unit, addrs) in by_unit.into_iter().sorted() {
            let mut bbt = BadBlockTable::get(dev, unit)?;
            for a in addrs {
                bbt.set_state(u32::from(a.blk()), u32::from(a.pl()), state)?;
            }
            bbt.set(dev)?;
        }
        Ok(())
    }

    /// Address of the parallel unit this table describes
    pub fn unit(&self) -> Addr {
        self.unit
    }

    /// The raw entries
    pub fn entries(&self) -> &[u8] {
        &self.blks
    }

    pub fn len(&self) -> usize {
        self.blks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blks.is_empty()
    }

    fn index(&self, blk: u32, pl: u32) -> Option<usize> {
        if blk < self.nblocks && pl < self.nplanes {
            Some((blk * self.nplanes + pl) as usize)
        } else {
            None
        }
    }

    fn position(&self, i: usize) -> (u32, u32) {
        let i = i as u32;
        (i / self.nplanes, i % self.nplanes)
    }

    /// State of plane `pl` of block `blk`.  `None` if out of range, or if the
    /// entry holds an unknown value.
    pub fn state(&self, blk: u32, pl: u32) -> Option<BlockState> {
        self.index(blk, pl)
            .and_then(|i| BlockState::try_from(self.blks[i]).ok())
    }

    /// Change one entry of the snapshot.  Device-reserved entries can't be
    /// changed, nor can anything be made device-reserved.
    pub fn set_state(&mut self, blk: u32, pl: u32, state: BlockState)
        -> Result<()>
    {
        let i = self.index(blk, pl).ok_or(Error::EINVAL)?;
        let dmrk = u8::from(BlockState::DevReserved);
        if state == BlockState::DevReserved || self.blks[i] == dmrk {
            return Err(Error::EINVAL);
        }
        self.blks[i] = state.into();
        Ok(())
    }

    fn count(&self, state: BlockState) -> usize {
        let s = u8::from(state);
        self.blks.iter().filter(|&&e| e == s).count()
    }

    /// Number of factory bad entries
    pub fn nbad(&self) -> usize {
        self.count(BlockState::Bad)
    }

    /// Number of grown bad entries
    pub fn ngbad(&self) -> usize {
        self.count(BlockState::GrownBad)
    }

    /// Number of device-reserved entries
    pub fn ndmrk(&self) -> usize {
        self.count(BlockState::DevReserved)
    }

    /// Number of host-marked entries
    pub fn nhmrk(&self) -> usize {
        self.count(BlockState::HostMarked)
    }
}

// LCOV_EXCL_STOP
