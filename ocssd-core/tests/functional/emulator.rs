// vim: tw=80
//! An in-memory Open-Channel device behind the ordinary [`Backend`] interface
//!
//! Sectors must be erased before they are written, chunks of a revision 2.0
//! device must be written sequentially, and bad blocks refuse erases and
//! writes.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};
use ocssd_core::{
    addr::{Addr, DevAddr},
    backend::{AsyncQueue, Backend, BackendId, ImmediateQueue},
    bbt::BlockState,
    cmd::Command,
    geometry::{Generation, Geometry},
    nvme::{BbtHeader, ChunkDescriptor, Identify, Opcode, chunk_state},
    Error, Result, Ret,
};

/// The opcode isn't implemented
pub const STATUS_INVALID_OPCODE: u64 = 0x1;
/// A field of the command is invalid
pub const STATUS_INVALID_FIELD: u64 = 0x2;
/// Write to a sector that isn't erased, or out of order within a chunk
pub const STATUS_WRITE_FAULT: u64 = 0x280;
/// Erase or write of a bad block or offline chunk
pub const STATUS_BAD_BLOCK: u64 = 0x2c0;

/// Identifies an erase unit: parallel unit index, block or chunk, and plane
type BlockKey = (u64, u32, u32);

#[derive(Clone, Debug, Default)]
struct Sector {
    data: Vec<u8>,
    meta: Vec<u8>,
}

/// A completion to fake for a future command
#[derive(Clone, Copy, Debug)]
struct Fault {
    opcode: u8,
    /// Matching commands to let through first
    skip: usize,
    ret: Ret,
}

#[derive(Debug, Default)]
struct Media {
    /// Written sectors of each erase unit, by sector index within it
    blocks: HashMap<BlockKey, HashMap<u32, Sector>>,
    /// Per-unit bad block tables, for revision 1.2
    bbts: Vec<Vec<u8>>,
    /// Offline chunks, for revision 2.0
    offline: HashSet<BlockKey>,
    faults: Vec<Fault>,
    ncommands: HashMap<u8, usize>,
}

impl Media {
    /// Remove and return the first fault due for `opcode`
    fn take_fault(&mut self, opcode: u8) -> Option<Fault> {
        let mut due = None;
        for (i, f) in self.faults.iter_mut().enumerate() {
            if f.opcode != opcode {
                continue;
            }
            if f.skip == 0 {
                due = Some(i);
                break;
            }
            f.skip -= 1;
            break;
        }
        due.map(|i| self.faults.remove(i))
    }
}

/// A shared handle to one emulated device.  Clones share the same media.
#[derive(Clone, Debug)]
pub struct Emulator {
    geo: Geometry,
    media: Arc<Mutex<Media>>,
}

fn fail(cmd: &mut Command<'_>, status: u64) -> Result<()> {
    cmd.ret.status = status;
    Err(Error::EIO)
}

impl Emulator {
    /// A factory-fresh device: everything erased, nothing bad
    pub fn new(geo: Geometry) -> Self {
        let nentries = (geo.nplanes * geo.nblocks) as usize;
        let bbts = match geo.generation {
            Generation::Planar => vec![vec![0u8; nentries];
                                       geo.nunits() as usize],
            Generation::Linear => Vec::new(),
        };
        let media = Media { bbts, ..Default::default() };
        Emulator { geo, media: Arc::new(Mutex::new(media)) }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    /// Change a bad block table entry behind the library's back, the way the
    /// factory or the device firmware would.
    pub fn set_block_state(&self, unit: Addr, blk: u32, pl: u32,
                           state: BlockState)
    {
        let i = (blk * self.geo.nplanes + pl) as usize;
        let u = unit.unit_index(&self.geo) as usize;
        self.media.lock().unwrap().bbts[u][i] = state.into();
    }

    /// The raw bad block table of `unit`
    pub fn bbt(&self, unit: Addr) -> Vec<u8> {
        let u = unit.unit_index(&self.geo) as usize;
        self.media.lock().unwrap().bbts[u].clone()
    }

    /// Take the chunk containing `addr` offline
    pub fn set_offline(&self, addr: Addr) {
        let key = (addr.unit_index(&self.geo), u32::from(addr.chunk()), 0);
        self.media.lock().unwrap().offline.insert(key);
    }

    /// Complete the `skip`th following command with `opcode`, counting from
    /// zero, with `ret`.
    ///
    /// A fault with a non-zero status aborts the command.  Otherwise the
    /// command takes effect and then reports `ret`.
    pub fn inject(&self, opcode: Opcode, skip: usize, ret: Ret) {
        let fault = Fault { opcode: opcode.into(), skip, ret };
        self.media.lock().unwrap().faults.push(fault);
    }

    /// How many commands with `opcode` the device has received
    pub fn ncommands(&self, opcode: Opcode) -> usize {
        let media = self.media.lock().unwrap();
        media.ncommands.get(&u8::from(opcode)).copied().unwrap_or(0)
    }

    /// Contents of the sector at `addr`, if it has been written since its
    /// last erase
    pub fn sector(&self, addr: Addr) -> Option<Vec<u8>> {
        let (key, idx) = self.locate_generic(addr);
        let media = self.media.lock().unwrap();
        media.blocks.get(&key)?.get(&idx).map(|s| s.data.clone())
    }

    fn locate_generic(&self, a: Addr) -> (BlockKey, u32) {
        let unit = a.unit_index(&self.geo);
        match self.geo.generation {
            Generation::Planar => {
                let idx = u32::from(a.pg()) * self.geo.nsectors +
                    u32::from(a.sec());
                ((unit, a.blk().into(), a.pl().into()), idx)
            },
            Generation::Linear => ((unit, a.chunk().into(), 0), a.sectr()),
        }
    }

    fn locate(&self, dev: DevAddr) -> Option<(BlockKey, u32)> {
        let a = dev.to_generic(&self.geo).ok()?;
        Some(self.locate_generic(a))
    }

    fn locate_all(&self, addrs: &[DevAddr]) -> Option<Vec<(BlockKey, u32)>> {
        addrs.iter().map(|&a| self.locate(a)).collect()
    }

    fn is_bad(&self, media: &Media, key: BlockKey) -> bool {
        match self.geo.generation {
            Generation::Planar => {
                let (unit, blk, pl) = key;
                let i = (blk * self.geo.nplanes + pl) as usize;
                let state = media.bbts[unit as usize][i];
                state == u8::from(BlockState::Bad) ||
                    state == u8::from(BlockState::GrownBad)
            },
            Generation::Linear => media.offline.contains(&key),
        }
    }

    /// Store one sector, enforcing erase-before-write
    fn program(&self, media: &mut Media, key: BlockKey, idx: u32,
               sector: Sector) -> std::result::Result<(), u64>
    {
        if self.is_bad(media, key) {
            return Err(STATUS_BAD_BLOCK);
        }
        let block = media.blocks.entry(key).or_default();
        let in_order = match self.geo.generation {
            Generation::Planar => true,
            Generation::Linear => idx as usize == block.len(),
        };
        if block.contains_key(&idx) || !in_order {
            return Err(STATUS_WRITE_FAULT);
        }
        block.insert(idx, sector);
        Ok(())
    }

    fn erase(&self, media: &mut Media, cmd: &mut Command<'_>) -> Result<()> {
        let Some(locs) = self.locate_all(&cmd.addrs) else {
            return fail(cmd, STATUS_INVALID_FIELD);
        };
        for (key, _) in locs {
            if self.is_bad(media, key) {
                return fail(cmd, STATUS_BAD_BLOCK);
            }
            media.blocks.remove(&key);
        }
        Ok(())
    }

    fn write(&self, media: &mut Media, cmd: &mut Command<'_>) -> Result<()> {
        let Some(locs) = self.locate_all(&cmd.addrs) else {
            return fail(cmd, STATUS_INVALID_FIELD);
        };
        let data = cmd.data.to_vec()?;
        let meta = cmd.meta.to_vec()?;
        let sector_nbytes = self.geo.sector_nbytes as usize;
        let meta_nbytes = self.geo.meta_nbytes as usize;
        for (i, (key, idx)) in locs.into_iter().enumerate() {
            let mut sector = Sector {
                data: data[i * sector_nbytes..(i + 1) * sector_nbytes].to_vec(),
                meta: vec![0u8; meta_nbytes],
            };
            if !meta.is_empty() {
                sector.meta.copy_from_slice(
                    &meta[i * meta_nbytes..(i + 1) * meta_nbytes]);
            }
            if let Err(status) = self.program(media, key, idx, sector) {
                return fail(cmd, status);
            }
        }
        Ok(())
    }

    /// Unwritten sectors read back as zeroes
    fn read(&self, media: &mut Media, cmd: &mut Command<'_>) -> Result<()> {
        let Some(locs) = self.locate_all(&cmd.addrs) else {
            return fail(cmd, STATUS_INVALID_FIELD);
        };
        let sector_nbytes = self.geo.sector_nbytes as usize;
        let meta_nbytes = self.geo.meta_nbytes as usize;
        let mut data = vec![0u8; locs.len() * sector_nbytes];
        let mut meta = vec![0u8; locs.len() * meta_nbytes];
        for (i, (key, idx)) in locs.into_iter().enumerate() {
            let Some(s) = media.blocks.get(&key).and_then(|b| b.get(&idx))
            else {
                continue;
            };
            data[i * sector_nbytes..(i + 1) * sector_nbytes]
                .copy_from_slice(&s.data);
            meta[i * meta_nbytes..(i + 1) * meta_nbytes]
                .copy_from_slice(&s.meta);
        }
        cmd.data.fill_from(&data)?;
        if !cmd.meta.is_none() {
            cmd.meta.fill_from(&meta)?;
        }
        Ok(())
    }

    fn copy(&self, media: &mut Media, cmd: &mut Command<'_>) -> Result<()> {
        let (Some(src), Some(dst)) = (self.locate_all(&cmd.addrs),
                                      self.locate_all(&cmd.dst)) else {
            return fail(cmd, STATUS_INVALID_FIELD);
        };
        for ((skey, sidx), (dkey, didx)) in src.into_iter().zip(dst) {
            let sector = media.blocks.get(&skey)
                .and_then(|b| b.get(&sidx))
                .cloned()
                .unwrap_or_else(|| Sector {
                    data: vec![0u8; self.geo.sector_nbytes as usize],
                    meta: vec![0u8; self.geo.meta_nbytes as usize],
                });
            if let Err(status) = self.program(media, dkey, didx, sector) {
                return fail(cmd, status);
            }
        }
        Ok(())
    }

    fn get_bbt(&self, media: &Media, cmd: &mut Command<'_>) -> Result<()> {
        let Some(&[addr]) = cmd.addrs.get(..1) else {
            return fail(cmd, STATUS_INVALID_FIELD);
        };
        let Ok(unit) = addr.to_generic(&self.geo) else {
            return fail(cmd, STATUS_INVALID_FIELD);
        };
        let blks = &media.bbts[unit.unit_index(&self.geo) as usize];
        let count = |s: BlockState| {
            blks.iter().filter(|&&b| b == u8::from(s)).count() as u32
        };
        let hdr = BbtHeader {
            verid: 1,
            revid: 0,
            tblks: blks.len() as u32,
            tfact: count(BlockState::Bad),
            tgrown: count(BlockState::GrownBad),
            tdresv: count(BlockState::DevReserved),
            thresv: count(BlockState::HostMarked),
        };
        let mut buf = vec![0u8; cmd.data.len()];
        hdr.write(blks, &mut buf)?;
        cmd.data.fill_from(&buf)
    }

    fn set_bbt(&self, media: &mut Media, cmd: &mut Command<'_>) -> Result<()>
    {
        let state = u8::try_from(cmd.control).ok()
            .and_then(|s| BlockState::try_from(s).ok());
        let (Some(state), Some(locs)) = (state, self.locate_all(&cmd.addrs))
        else {
            return fail(cmd, STATUS_INVALID_FIELD);
        };
        let dmrk = u8::from(BlockState::DevReserved);
        let entries = locs.iter()
            .map(|&((unit, blk, pl), _)| {
                (unit as usize, (blk * self.geo.nplanes + pl) as usize)
            }).collect::<Vec<_>>();
        if state == BlockState::DevReserved ||
            entries.iter().any(|&(u, i)| media.bbts[u][i] == dmrk)
        {
            return fail(cmd, STATUS_INVALID_FIELD);
        }
        for (u, i) in entries {
            media.bbts[u][i] = state.into();
        }
        Ok(())
    }

    fn descriptor(&self, media: &Media, unit: u64, chunk: u32)
        -> Result<ChunkDescriptor>
    {
        let npunit = u64::from(self.geo.npunit);
        let addr = Addr::linear((unit / npunit) as u8, (unit % npunit) as u8,
                                chunk as u16, 0);
        let key = (unit, chunk, 0);
        let wptr = media.blocks.get(&key).map(HashMap::len).unwrap_or(0);
        let state = if media.offline.contains(&key) {
            chunk_state::OFFLINE
        } else if wptr == 0 {
            chunk_state::FREE
        } else if wptr == self.geo.nsectr as usize {
            chunk_state::CLOSED
        } else {
            chunk_state::OPEN
        };
        Ok(ChunkDescriptor {
            state,
            ctype: 1,
            limits: 0,
            addr: addr.to_device(&self.geo)?.0,
            naddrs: self.geo.nsectr.into(),
            wptr: wptr as u64,
        })
    }

    fn report(&self, media: &Media, cmd: &mut Command<'_>) -> Result<()> {
        let units = match cmd.addrs.first() {
            None => (0..self.geo.nunits()).collect::<Vec<_>>(),
            Some(&a) => match a.to_generic(&self.geo) {
                Ok(unit) => vec![unit.unit_index(&self.geo)],
                Err(_) => return fail(cmd, STATUS_INVALID_FIELD),
            }
        };
        let mut descrs = Vec::new();
        for unit in units {
            for chunk in 0..self.geo.nchunk {
                descrs.push(self.descriptor(media, unit, chunk)?);
            }
        }
        let mut buf = vec![0u8; cmd.data.len()];
        ChunkDescriptor::write_report(&descrs, &mut buf)?;
        cmd.data.fill_from(&buf)
    }

    fn execute(&self, cmd: &mut Command<'_>) -> Result<()> {
        let mut media = self.media.lock().unwrap();
        *media.ncommands.entry(cmd.opcode).or_default() += 1;
        let fault = media.take_fault(cmd.opcode);
        if let Some(f) = fault.filter(|f| f.ret.status != 0) {
            cmd.ret = f.ret;
            return Err(Error::EIO);
        }
        let r = match (Opcode::try_from(cmd.opcode), self.geo.generation) {
            (Ok(Opcode::Identify), _) => {
                let id = Identify::from_geometry(&self.geo).to_bytes();
                cmd.data.fill_from(&id)
            },
            (Ok(Opcode::Erase), _) => self.erase(&mut media, cmd),
            (Ok(Opcode::Write), _) => self.write(&mut media, cmd),
            (Ok(Opcode::Read), _) => self.read(&mut media, cmd),
            (Ok(Opcode::Copy), Generation::Linear) =>
                self.copy(&mut media, cmd),
            (Ok(Opcode::State), Generation::Planar) =>
                self.get_bbt(&media, cmd),
            (Ok(Opcode::State), Generation::Linear) =>
                self.report(&media, cmd),
            (Ok(Opcode::SetBbt), Generation::Planar) =>
                self.set_bbt(&mut media, cmd),
            _ => fail(cmd, STATUS_INVALID_OPCODE),
        };
        match (r, fault) {
            (Ok(()), Some(f)) => {
                cmd.ret = f.ret;
                Err(Error::EIO)
            },
            (r, _) => r,
        }
    }
}

impl Backend for Emulator {
    fn id(&self) -> BackendId {
        BackendId::Any
    }

    fn user(&self, _cmd: &mut Command<'_>) -> Result<()> {
        Err(Error::ENOTSUP)
    }

    fn admin(&self, _cmd: &mut Command<'_>) -> Result<()> {
        Err(Error::ENOTSUP)
    }

    fn vuser(&self, cmd: &mut Command<'_>) -> Result<()> {
        self.execute(cmd)
    }

    fn vadmin(&self, cmd: &mut Command<'_>) -> Result<()> {
        self.execute(cmd)
    }

    fn async_init(&self, depth: u32) -> Result<Box<dyn AsyncQueue>> {
        if depth == 0 || depth > ImmediateQueue::<Self>::DEPTH_MAX {
            return Err(Error::EINVAL);
        }
        Ok(Box::new(ImmediateQueue::new(self.clone())))
    }
}
