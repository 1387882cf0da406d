// vim: tw=80
//! Open-Channel device handles

use crate::{
    addr::{Addr, DevAddr},
    backend::{Backend, BackendId, NosysBackend},
    bbt::{BadBlockTable, BlockState},
    cmd::{self, Command, Transfer},
    geometry::{Generation, Geometry},
    nvme::{self, Identify, NADDR_MAX, PlaneMode},
    options::{DeviceOptions, MetaMode},
    types::*,
};
use itertools::Itertools;
use std::path::Path;
use tracing::debug;

/// An open Open-Channel device.
///
/// The backend is bound at open and never changes.  A `Device` may be shared
/// by several threads, each issuing its own commands.
#[derive(Debug)]
pub struct Device {
    name: String,
    nsid: u32,
    geo: Geometry,
    backend: Box<dyn Backend>,
    pmode: PlaneMode,
    erase_naddrs_max: usize,
    write_naddrs_max: usize,
    read_naddrs_max: usize,
    meta_mode: MetaMode,
    vcopy: bool,
}

impl Device {
    /// Open the device at `path` and identify its geometry.
    #[tracing::instrument(skip(opts))]
    pub fn open<P: AsRef<Path> + std::fmt::Debug>(path: P,
        opts: &DeviceOptions) -> Result<Self>
    {
        let path = path.as_ref();
        let name = path.file_name()
            .and_then(|n| n.to_str())
            .ok_or(Error::EINVAL)?
            .to_owned();
        match opts.backend {
            BackendId::Any | BackendId::Ioctl => Self::open_ioctl(path, name,
                                                                  opts),
            BackendId::Nosys => {
                NosysBackend::open(path)?;
                Err(Error::ENOSYS)
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn open_ioctl(path: &Path, name: String, opts: &DeviceOptions)
        -> Result<Self>
    {
        let be = crate::backend::IoctlBackend::open(path, opts.writable)?;
        let nsid = be.nsid();
        Self::identified(name, Box::new(be), nsid, opts)
    }

    #[cfg(not(target_os = "linux"))]
    fn open_ioctl(path: &Path, _name: String, _opts: &DeviceOptions)
        -> Result<Self>
    {
        NosysBackend::open(path)?;
        Err(Error::ENOSYS)
    }

    /// Bind an already-constructed backend, and identify the device through
    /// it.
    pub fn with_backend(name: &str, backend: Box<dyn Backend>,
                        opts: &DeviceOptions) -> Result<Self>
    {
        Self::identified(name.to_owned(), backend, 1, opts)
    }

    /// Bind a backend to a known geometry, without identifying.
    pub fn with_geometry(name: &str, backend: Box<dyn Backend>, geo: Geometry,
                         opts: &DeviceOptions) -> Result<Self>
    {
        Self::build(name.to_owned(), backend, 1, geo, false, opts)
    }

    fn identified(name: String, backend: Box<dyn Backend>, nsid: u32,
                  opts: &DeviceOptions) -> Result<Self>
    {
        let mut buf = vec![0u8; nvme::IDFY_NBYTES];
        let mut idcmd = Command::identify(nsid,
                                          Transfer::FromDevice(&mut buf))?;
        backend.dispatch(&mut idcmd).inspect_err(|e| {
            debug!(?e, ret = ?idcmd.ret, "identify failed");
        })?;
        let id = Identify::parse(&buf)?;
        let geo = id.geometry()?;
        debug!(?geo, "identified device");
        Self::build(name, backend, nsid, geo, id.vcopy(), opts)
    }

    fn build(name: String, backend: Box<dyn Backend>, nsid: u32,
             geo: Geometry, vcopy: bool, opts: &DeviceOptions) -> Result<Self>
    {
        let pmode = match geo.generation {
            Generation::Planar => PlaneMode::for_planes(geo.nplanes),
            Generation::Linear => PlaneMode::Single,
        };
        let mut dev = Device {
            name,
            nsid,
            geo,
            backend,
            pmode,
            erase_naddrs_max: NADDR_MAX,
            write_naddrs_max: NADDR_MAX,
            read_naddrs_max: NADDR_MAX,
            meta_mode: opts.meta_mode,
            vcopy,
        };
        if let Some(pmode) = opts.pmode {
            dev.set_pmode(pmode)?;
        }
        if let Some(n) = opts.erase_naddrs_max {
            dev.set_erase_naddrs_max(n)?;
        }
        if let Some(n) = opts.write_naddrs_max {
            dev.set_write_naddrs_max(n)?;
        }
        if let Some(n) = opts.read_naddrs_max {
            dev.set_read_naddrs_max(n)?;
        }
        Ok(dev)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nsid(&self) -> u32 {
        self.nsid
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    pub fn backend(&self) -> &dyn Backend {
        &*self.backend
    }

    pub fn pmode(&self) -> PlaneMode {
        self.pmode
    }

    /// Override the plane mode.  More planes than the device has is invalid.
    pub fn set_pmode(&mut self, pmode: PlaneMode) -> Result<()> {
        let nplanes = match pmode {
            PlaneMode::Single => 1,
            PlaneMode::Dual => 2,
            PlaneMode::Quad => 4,
        };
        if nplanes > self.geo.nplanes {
            return Err(Error::EINVAL);
        }
        self.pmode = pmode;
        Ok(())
    }

    pub fn meta_mode(&self) -> MetaMode {
        self.meta_mode
    }

    pub fn set_meta_mode(&mut self, meta_mode: MetaMode) {
        self.meta_mode = meta_mode;
    }

    /// Does the device support vector copy?
    pub fn vcopy(&self) -> bool {
        self.vcopy
    }

    pub fn erase_naddrs_max(&self) -> usize {
        self.erase_naddrs_max
    }

    pub fn write_naddrs_max(&self) -> usize {
        self.write_naddrs_max
    }

    pub fn read_naddrs_max(&self) -> usize {
        self.read_naddrs_max
    }

    fn check_naddrs_max(n: usize) -> Result<()> {
        if n == 0 || n > NADDR_MAX {
            Err(Error::EINVAL)
        } else {
            Ok(())
        }
    }

    pub fn set_erase_naddrs_max(&mut self, n: usize) -> Result<()> {
        Self::check_naddrs_max(n)?;
        self.erase_naddrs_max = n;
        Ok(())
    }

    pub fn set_write_naddrs_max(&mut self, n: usize) -> Result<()> {
        Self::check_naddrs_max(n)?;
        self.write_naddrs_max = n;
        Ok(())
    }

    pub fn set_read_naddrs_max(&mut self, n: usize) -> Result<()> {
        Self::check_naddrs_max(n)?;
        self.read_naddrs_max = n;
        Ok(())
    }

    /// Every parallel unit, in index order
    pub fn units(&self) -> impl Iterator<Item=Addr> {
        let (ngrp, npu) = (self.geo.npugrp, self.geo.npunit);
        (0..ngrp).cartesian_product(0..npu)
            .map(|(g, u)| Addr::linear(g as u8, u as u8, 0, 0))
    }

    /// Find up to `n` free chunks, or blocks, spreading them round-robin over
    /// parallel units so that they can be written in parallel.
    pub fn free_chunks(&self, n: usize) -> Result<Vec<Addr>> {
        let per_unit = match self.geo.generation {
            Generation::Linear => {
                let descrs = cmd::report(self, None, None)?;
                let mut by_unit = vec![Vec::new(); self.geo.nunits() as usize];
                for d in descrs.iter().filter(|d| d.is_free()) {
                    let a = DevAddr(d.addr).to_generic(&self.geo)?;
                    by_unit[a.unit_index(&self.geo) as usize]
                        .push(Addr::linear(a.pugrp(), a.punit(), a.chunk(),
                                           0));
                }
                by_unit
            },
            Generation::Planar => {
                let mut by_unit = Vec::new();
                for unit in self.units() {
                    let bbt = BadBlockTable::get(self, unit)?;
                    let free = (0..self.geo.nblocks)
                        .filter(|&blk| {
                            (0..self.geo.nplanes).all(|pl| {
                                bbt.state(blk, pl) == Some(BlockState::Free)
                            })
                        }).map(|blk| Addr::planar(unit.ch(), unit.lun(), 0,
                                                  blk as u16, 0, 0))
                        .collect::<Vec<_>>();
                    by_unit.push(free);
                }
                by_unit
            }
        };
        let mut iters = per_unit.into_iter()
            .map(Vec::into_iter)
            .collect::<Vec<_>>();
        let mut chunks = Vec::with_capacity(n);
        while chunks.len() < n {
            let before = chunks.len();
            for it in iters.iter_mut() {
                if chunks.len() == n {
                    break;
                }
                if let Some(a) = it.next() {
                    chunks.push(a);
                }
            }
            if chunks.len() == before {
                break;
            }
        }
        Ok(chunks)
    }
}

// LCOV_EXCL_STOP
