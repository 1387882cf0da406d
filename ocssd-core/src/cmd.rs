// vim: tw=80
//! Construction and synchronous execution of device commands
//!
//! A [`Command`] is built from an opcode, one or more [`Addr`]esses, and
//! optional data and metadata transfers.  Commands execute synchronously via
//! [`Command::execute`] or asynchronously via
//! [`AsyncContext`](crate::async_ctx::AsyncContext).

use crate::{
    addr::{Addr, DevAddr},
    dev::Device,
    geometry::Generation,
    nvme::{self, ChunkDescriptor, Direction, Identify, Opcode, PlaneMode},
    sgl::ScatterGatherList,
    types::*,
};
use std::ptr;
use tracing::debug;

/// Protocol privilege level of a command.  Selects the backend entry point.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Privilege {
    /// Standard NVMe I/O command
    User,
    /// Standard NVMe admin command
    Admin,
    /// Open-Channel vendor-specific I/O command
    VendorUser,
    /// Open-Channel vendor-specific admin command
    VendorAdmin,
}

/// A command's data or metadata buffer.
///
/// A flat buffer and a scatter/gather list are mutually exclusive.  The owned
/// variants are what asynchronous submissions use, because the buffer must
/// stay put until the completion is delivered.
#[derive(Debug, Default)]
pub enum Transfer<'a> {
    #[default]
    None,
    /// Host-to-device flat buffer
    ToDevice(&'a [u8]),
    /// Device-to-host flat buffer
    FromDevice(&'a mut [u8]),
    /// Owned flat buffer, for either direction
    Buf(IoVecMut),
    Sgl(&'a mut ScatterGatherList),
    OwnedSgl(ScatterGatherList),
}

impl<'a> Transfer<'a> {
    pub fn len(&self) -> usize {
        match self {
            Transfer::None => 0,
            Transfer::ToDevice(b) => b.len(),
            Transfer::FromDevice(b) => b.len(),
            Transfer::Buf(b) => b.len(),
            Transfer::Sgl(sgl) => sgl.nbytes(),
            Transfer::OwnedSgl(sgl) => sgl.nbytes(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Transfer::None)
    }

    /// Copy out the transfer's contents into one contiguous buffer.
    pub fn to_vec(&mut self) -> Result<Vec<u8>> {
        match self {
            Transfer::None => Ok(Vec::new()),
            Transfer::ToDevice(b) => Ok(b.to_vec()),
            Transfer::FromDevice(b) => Ok(b.to_vec()),
            Transfer::Buf(b) => Ok(b.to_vec()),
            Transfer::Sgl(sgl) => sgl.gather(),
            Transfer::OwnedSgl(sgl) => sgl.gather(),
        }
    }

    /// Fill the transfer from `src`, which must be exactly as long.
    ///
    /// Fails for read-only transfers.
    pub fn fill_from(&mut self, src: &[u8]) -> Result<()> {
        if src.len() != self.len() {
            return Err(Error::EINVAL);
        }
        match self {
            Transfer::None => Ok(()),
            Transfer::ToDevice(_) => Err(Error::EINVAL),
            Transfer::FromDevice(b) => {
                b.copy_from_slice(src);
                Ok(())
            }
            Transfer::Buf(b) => {
                b.copy_from_slice(src);
                Ok(())
            }
            Transfer::Sgl(sgl) => sgl.scatter(src),
            Transfer::OwnedSgl(sgl) => sgl.scatter(src),
        }
    }

    /// Give back an owned flat buffer, if that's what this was
    pub fn into_buf(self) -> Option<IoVecMut> {
        match self {
            Transfer::Buf(b) => Some(b),
            _ => None
        }
    }

    /// Give back an owned scatter/gather list, if that's what this was
    pub fn into_sgl(self) -> Option<ScatterGatherList> {
        match self {
            Transfer::OwnedSgl(sgl) => Some(sgl),
            _ => None
        }
    }
}

/// Presents any [`Transfer`] to a backend as a single pointer and length.
///
/// Scatter/gather lists are staged through a contiguous bounce buffer, which
/// is scattered back to the segments by [`Mapping::finish`] for device-to-host
/// transfers.
#[derive(Debug)]
pub struct Mapping<'t, 'a> {
    transfer: &'t mut Transfer<'a>,
    bounce: Option<Vec<u8>>,
}

impl<'t, 'a> Mapping<'t, 'a> {
    pub fn new(transfer: &'t mut Transfer<'a>) -> Result<Self> {
        let bounce = match transfer {
            Transfer::Sgl(sgl) => Some(sgl.gather()?),
            Transfer::OwnedSgl(sgl) => Some(sgl.gather()?),
            _ => None
        };
        Ok(Mapping { transfer, bounce })
    }

    /// User address of the buffer, or 0 if there isn't one
    pub fn addr(&mut self) -> u64 {
        if let Some(b) = self.bounce.as_mut() {
            return b.as_mut_ptr() as u64;
        }
        match &mut self.transfer {
            Transfer::ToDevice(b) => b.as_ptr() as u64,
            Transfer::FromDevice(b) => b.as_mut_ptr() as u64,
            Transfer::Buf(b) => b.as_mut_ptr() as u64,
            _ => ptr::null::<u8>() as u64,
        }
    }

    pub fn len(&self) -> usize {
        self.transfer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Complete the mapping once the device is done with the buffer.
    pub fn finish(self, direction: Direction) -> Result<()> {
        match (self.bounce, direction) {
            (Some(b), Direction::FromDevice | Direction::Both) =>
                self.transfer.fill_from(&b),
            _ => Ok(())
        }
    }
}

/// A single protocol command.
///
/// Addresses are stored in device format; the builders convert and validate
/// them.  `ret` is filled in by the backend.
#[derive(Debug)]
pub struct Command<'a> {
    pub privilege: Privilege,
    pub opcode: u8,
    pub flags: u8,
    /// Plane mode, scrambler, and other per-command options
    pub control: u16,
    pub nsid: u32,
    /// Target addresses.  One for a scalar command, many for a vector one.
    pub addrs: Vec<DevAddr>,
    /// Destination addresses, for copy
    pub dst: Vec<DevAddr>,
    /// Command dwords 10 through 15, for commands without an address list
    pub cdw: [u32; 6],
    pub data: Transfer<'a>,
    pub meta: Transfer<'a>,
    pub timeout_ms: u32,
    pub ret: Ret,
}

impl<'a> Command<'a> {
    pub fn new(privilege: Privilege, opcode: u8) -> Self {
        Command {
            privilege,
            opcode,
            flags: 0,
            control: 0,
            nsid: 0,
            addrs: Vec::new(),
            dst: Vec::new(),
            cdw: [0; 6],
            data: Transfer::None,
            meta: Transfer::None,
            timeout_ms: 0,
            ret: Ret::default(),
        }
    }

    /// Number of addresses, as the protocol encodes it: counting from zero
    pub fn nppas(&self) -> u16 {
        self.addrs.len().saturating_sub(1) as u16
    }

    /// The data direction implied by the opcode
    pub fn direction(&self) -> Direction {
        Direction::of(self.opcode)
    }

    /// Convert and validate a list of addresses for `dev`
    fn dev_addrs(dev: &Device, addrs: &[Addr], max: usize)
        -> Result<Vec<DevAddr>>
    {
        if addrs.is_empty() || addrs.len() > max {
            return Err(Error::EINVAL);
        }
        let geo = dev.geometry();
        addrs.iter().map(|a| a.to_device(geo)).collect()
    }

    /// Control word for erase, write, and read
    fn ewr_control(dev: &Device, pmode: PlaneMode) -> u16 {
        match dev.geometry().generation {
            Generation::Planar => u16::from(pmode) | nvme::FLAG_SCRBL,
            Generation::Linear => 0,
        }
    }

    /// Shared by write and read: check the transfer sizes
    fn ewr(dev: &Device, opcode: Opcode, addrs: &[Addr], data: Transfer<'a>,
           meta: Transfer<'a>, pmode: PlaneMode, max: usize) -> Result<Self>
    {
        let geo = dev.geometry();
        let n = addrs.len();
        if data.len() != n * geo.sector_nbytes as usize {
            return Err(Error::EINVAL);
        }
        if !meta.is_none() && meta.len() != n * geo.meta_nbytes as usize {
            return Err(Error::EINVAL);
        }
        let mut cmd = Command::new(Privilege::VendorUser, opcode.into());
        cmd.nsid = dev.nsid();
        cmd.control = Self::ewr_control(dev, pmode);
        cmd.addrs = Self::dev_addrs(dev, addrs, max)?;
        cmd.data = data;
        cmd.meta = meta;
        Ok(cmd)
    }

    /// Erase the blocks or chunks containing `addrs`
    pub fn erase(dev: &Device, addrs: &[Addr], pmode: PlaneMode)
        -> Result<Command<'static>>
    {
        let mut cmd = Command::new(Privilege::VendorUser, Opcode::Erase.into());
        cmd.nsid = dev.nsid();
        cmd.control = Self::ewr_control(dev, pmode);
        cmd.addrs = Self::dev_addrs(dev, addrs, dev.erase_naddrs_max())?;
        Ok(cmd)
    }

    /// Write one sector to each of `addrs`.
    ///
    /// `data` must hold exactly one sector per address, and `meta`, if
    /// present, exactly one out-of-band area per address.
    pub fn write(dev: &Device, addrs: &[Addr], data: Transfer<'a>,
                 meta: Transfer<'a>, pmode: PlaneMode) -> Result<Self>
    {
        Self::ewr(dev, Opcode::Write, addrs, data, meta, pmode,
                  dev.write_naddrs_max())
    }

    /// Read one sector from each of `addrs`.
    pub fn read(dev: &Device, addrs: &[Addr], data: Transfer<'a>,
                meta: Transfer<'a>, pmode: PlaneMode) -> Result<Self>
    {
        Self::ewr(dev, Opcode::Read, addrs, data, meta, pmode,
                  dev.read_naddrs_max())
    }

    /// Copy sectors `src[i]` to `dst[i]` within the device
    pub fn copy(dev: &Device, src: &[Addr], dst: &[Addr])
        -> Result<Command<'static>>
    {
        if dev.geometry().generation != Generation::Linear || !dev.vcopy() {
            return Err(Error::ENOTSUP);
        }
        if src.len() != dst.len() {
            return Err(Error::EINVAL);
        }
        let mut cmd = Command::new(Privilege::VendorUser, Opcode::Copy.into());
        cmd.nsid = dev.nsid();
        cmd.addrs = Self::dev_addrs(dev, src, dev.write_naddrs_max())?;
        cmd.dst = Self::dev_addrs(dev, dst, dev.write_naddrs_max())?;
        Ok(cmd)
    }

    /// Identify the device's geometry into `buf`, which must be
    /// [`IDFY_NBYTES`](nvme::IDFY_NBYTES) long.
    pub fn identify(nsid: u32, buf: Transfer<'a>) -> Result<Self> {
        if buf.len() != nvme::IDFY_NBYTES {
            return Err(Error::EINVAL);
        }
        let mut cmd = Command::new(Privilege::VendorAdmin,
                                   Opcode::Identify.into());
        cmd.nsid = nsid;
        cmd.data = buf;
        Ok(cmd)
    }

    /// Fetch the bad block table of the parallel unit `unit` into `buf`
    pub fn get_bbt(dev: &Device, unit: Addr, buf: Transfer<'a>)
        -> Result<Self>
    {
        let mut cmd = Command::new(Privilege::VendorAdmin,
                                   Opcode::State.into());
        cmd.nsid = dev.nsid();
        cmd.addrs = Self::dev_addrs(dev, &[unit.unit()], 1)?;
        cmd.data = buf;
        Ok(cmd)
    }

    /// Mark every block in `addrs` with the raw state `state`
    pub fn set_bbt(dev: &Device, addrs: &[Addr], state: u8)
        -> Result<Command<'static>>
    {
        let mut cmd = Command::new(Privilege::VendorAdmin,
                                   Opcode::SetBbt.into());
        cmd.nsid = dev.nsid();
        cmd.control = state.into();
        cmd.addrs = Self::dev_addrs(dev, addrs, nvme::NADDR_MAX)?;
        Ok(cmd)
    }

    /// Report chunk state for the parallel unit `unit`, or for the whole
    /// device, into `buf`
    pub fn report(dev: &Device, unit: Option<Addr>, buf: Transfer<'a>)
        -> Result<Self>
    {
        if dev.geometry().generation != Generation::Linear {
            return Err(Error::ENOTSUP);
        }
        let mut cmd = Command::new(Privilege::VendorAdmin,
                                   Opcode::State.into());
        cmd.nsid = dev.nsid();
        if let Some(unit) = unit {
            cmd.addrs = Self::dev_addrs(dev, &[unit.unit()], 1)?;
        }
        cmd.data = buf;
        Ok(cmd)
    }

    /// Execute synchronously through `dev`'s backend, blocking until
    /// completion.
    ///
    /// Device-side failure is `EIO` with `ret` describing it.  Any other error
    /// happened on the host.
    #[tracing::instrument(skip_all, fields(opcode = self.opcode,
                                          naddrs = self.addrs.len()))]
    pub fn execute(&mut self, dev: &Device) -> Result<()> {
        let r = dev.backend().dispatch(self);
        if let Err(e) = r {
            if self.tolerates(e) {
                return Ok(());
            }
            debug!(?e, ret = ?self.ret, "command failed");
        }
        r
    }

    /// Erase, write, and read accept a couple of informational results.
    pub(crate) fn tolerates(&self, e: Error) -> bool {
        let ewr = [Opcode::Erase, Opcode::Write, Opcode::Read]
            .map(u8::from)
            .contains(&self.opcode);
        e == Error::EIO && ewr &&
            RESULT_ACCEPTABLE.contains(&self.ret.result)
    }
}

/// Copy `cmd`'s status into the caller's sink, if any
fn fill_ret(ret: Option<&mut Ret>, cmd: &Command) {
    if let Some(r) = ret {
        *r = cmd.ret;
    }
}

fn run(dev: &Device, cmd: &mut Command, ret: Option<&mut Ret>) -> Result<()> {
    let r = cmd.execute(dev);
    fill_ret(ret, cmd);
    r
}

/// Erase the blocks or chunks containing `addrs`
pub fn erase(dev: &Device, addrs: &[Addr], pmode: PlaneMode,
             ret: Option<&mut Ret>) -> Result<()>
{
    let mut cmd = Command::erase(dev, addrs, pmode)?;
    run(dev, &mut cmd, ret)
}

/// Write one sector of `data` to each address in `addrs`
pub fn write(dev: &Device, addrs: &[Addr], data: &[u8], meta: Option<&[u8]>,
             pmode: PlaneMode, ret: Option<&mut Ret>) -> Result<()>
{
    let meta = meta.map(Transfer::ToDevice).unwrap_or_default();
    let mut cmd = Command::write(dev, addrs, Transfer::ToDevice(data), meta,
                                 pmode)?;
    run(dev, &mut cmd, ret)
}

/// Read one sector from each address in `addrs` into `data`
pub fn read(dev: &Device, addrs: &[Addr], data: &mut [u8],
            meta: Option<&mut [u8]>, pmode: PlaneMode, ret: Option<&mut Ret>)
    -> Result<()>
{
    let meta = meta.map(Transfer::FromDevice).unwrap_or_default();
    let mut cmd = Command::read(dev, addrs, Transfer::FromDevice(data), meta,
                                pmode)?;
    run(dev, &mut cmd, ret)
}

/// Like [`write`], but gathering the data from a scatter/gather list
pub fn writev(dev: &Device, addrs: &[Addr], sgl: &mut ScatterGatherList,
              pmode: PlaneMode, ret: Option<&mut Ret>) -> Result<()>
{
    let mut cmd = Command::write(dev, addrs, Transfer::Sgl(sgl),
                                 Transfer::None, pmode)?;
    run(dev, &mut cmd, ret)
}

/// Like [`read`], but scattering the data into a scatter/gather list
pub fn readv(dev: &Device, addrs: &[Addr], sgl: &mut ScatterGatherList,
             pmode: PlaneMode, ret: Option<&mut Ret>) -> Result<()>
{
    let mut cmd = Command::read(dev, addrs, Transfer::Sgl(sgl),
                                Transfer::None, pmode)?;
    run(dev, &mut cmd, ret)
}

/// Vector copy from `src` to `dst`
pub fn copy(dev: &Device, src: &[Addr], dst: &[Addr], ret: Option<&mut Ret>)
    -> Result<()>
{
    let mut cmd = Command::copy(dev, src, dst)?;
    run(dev, &mut cmd, ret)
}

/// Retrieve the chunk report for one parallel unit, or for the whole device.
pub fn report(dev: &Device, unit: Option<Addr>, ret: Option<&mut Ret>)
    -> Result<Vec<ChunkDescriptor>>
{
    let geo = dev.geometry();
    let ndescr = match unit {
        Some(_) => u64::from(geo.nchunk),
        None => u64::from(geo.nchunk) * geo.nunits(),
    } as usize;
    let mut buf = vec![0u8; ChunkDescriptor::report_nbytes(ndescr)];
    let mut cmd = Command::report(dev, unit, Transfer::FromDevice(&mut buf))?;
    run(dev, &mut cmd, ret)?;
    ChunkDescriptor::parse_report(&buf)
}

/// Issue the identify command through `dev`'s backend.
pub fn identify(dev: &Device, ret: Option<&mut Ret>) -> Result<Identify> {
    let mut buf = vec![0u8; nvme::IDFY_NBYTES];
    let mut cmd = Command::identify(dev.nsid(),
                                    Transfer::FromDevice(&mut buf))?;
    run(dev, &mut cmd, ret)?;
    Identify::parse(&buf)
}

// LCOV_EXCL_STOP
