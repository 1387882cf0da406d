// vim: tw=80
//! Linux kernel passthrough backend
//!
//! Every command becomes a single blocking ioctl on the namespace's block
//! device node.  The kernel serializes nothing on our behalf, so concurrent
//! callers each get their own submission.

use crate::{
    addr::DevAddr,
    backend::{AsyncQueue, Backend, BackendId, ImmediateQueue},
    cmd::{Command, Mapping},
    types::*,
};
use std::{
    fs::{File, OpenOptions},
    os::unix::{fs::OpenOptionsExt, io::AsRawFd},
    path::Path,
    sync::Arc,
};
use tracing::debug;

/// FFI definitions for the Linux NVMe and LightNVM passthrough ioctls.  Nix's
/// macros make the ioctl functions `pub`, so the structs must be too.
#[doc(hidden)]
mod ffi {
    #![allow(non_camel_case_types)]
    use nix::{ioctl_readwrite, ioctl_write_ptr};
    use std::mem::size_of;

    /// Vendor I/O, as understood by `NVME_NVM_IOCTL_SUBMIT_VIO`
    #[repr(C)]
    #[derive(Debug, Default)]
    pub struct nvm_user_vio {
        pub opcode: u8,
        pub flags: u8,
        pub control: u16,
        pub nppas: u16,
        pub rsvd: u16,
        pub metadata: u64,
        pub addr: u64,
        pub ppa_list: u64,
        pub metadata_len: u32,
        pub data_len: u32,
        pub status: u64,
        pub result: u32,
        pub rsvd3: [u32; 3],
    }

    /// Vendor admin or I/O with command dwords
    #[repr(C)]
    #[derive(Debug, Default)]
    pub struct nvm_passthru_vio {
        pub opcode: u8,
        pub flags: u8,
        pub rsvd: [u8; 2],
        pub nsid: u32,
        pub cdw2: u32,
        pub cdw3: u32,
        pub metadata: u64,
        pub addr: u64,
        pub metadata_len: u32,
        pub data_len: u32,
        pub ppa_list: u64,
        pub nppas: u16,
        pub control: u16,
        pub cdw13: u32,
        pub cdw14: u32,
        pub cdw15: u32,
        pub status: u64,
        pub result: u32,
        pub timeout_ms: u32,
    }

    #[repr(C)]
    #[derive(Debug, Default)]
    pub struct nvme_passthru_cmd {
        pub opcode: u8,
        pub flags: u8,
        pub rsvd1: u16,
        pub nsid: u32,
        pub cdw2: u32,
        pub cdw3: u32,
        pub metadata: u64,
        pub addr: u64,
        pub metadata_len: u32,
        pub data_len: u32,
        pub cdw10: u32,
        pub cdw11: u32,
        pub cdw12: u32,
        pub cdw13: u32,
        pub cdw14: u32,
        pub cdw15: u32,
        pub timeout_ms: u32,
        pub result: u32,
    }

    #[repr(C)]
    #[derive(Debug, Default)]
    pub struct nvme_user_io {
        pub opcode: u8,
        pub flags: u8,
        pub control: u16,
        pub nblocks: u16,
        pub rsvd: u16,
        pub metadata: u64,
        pub addr: u64,
        pub slba: u64,
        pub dsmgmt: u32,
        pub reftag: u32,
        pub apptag: u16,
        pub appmask: u16,
    }

    const _: () = assert!(size_of::<nvm_user_vio>() == 64);
    const _: () = assert!(size_of::<nvm_passthru_vio>() == 80);
    const _: () = assert!(size_of::<nvme_passthru_cmd>() == 72);
    const _: () = assert!(size_of::<nvme_user_io>() == 48);

    ioctl_readwrite! {
        #[doc(hidden)]
        nvm_admin_vio, b'L', 0x41, nvm_passthru_vio
    }
    ioctl_readwrite! {
        #[doc(hidden)]
        nvm_io_vio, b'L', 0x42, nvm_passthru_vio
    }
    ioctl_readwrite! {
        #[doc(hidden)]
        nvm_submit_vio, b'L', 0x43, nvm_user_vio
    }
    ioctl_readwrite! {
        #[doc(hidden)]
        nvme_admin_cmd, b'N', 0x41, nvme_passthru_cmd
    }
    ioctl_write_ptr! {
        #[doc(hidden)]
        nvme_submit_io, b'N', 0x42, nvme_user_io
    }
}

/// Addresses as the kernel wants them: inline for one, by pointer for many.
struct PpaList(Vec<u64>);

impl PpaList {
    fn new(addrs: &[DevAddr]) -> Self {
        PpaList(addrs.iter().map(|a| a.0).collect())
    }

    fn val(&self) -> u64 {
        match self.0.len() {
            0 => 0,
            1 => self.0[0],
            _ => self.0.as_ptr() as u64,
        }
    }
}

/// Fold the outcome of an ioctl and the device's own status into one result
fn complete(r: nix::Result<i32>, cmd: &mut Command<'_>, result: u64,
            status: u64) -> Result<()>
{
    let r = r.map_err(Error::from)?;
    cmd.ret.result = result;
    // A positive return value is an NVMe status the kernel passed through
    cmd.ret.status = if status == 0 && r > 0 { r as u64 } else { status };
    if cmd.ret.result != 0 || cmd.ret.status != 0 {
        debug!(opcode = cmd.opcode, ret = ?cmd.ret, "device rejected command");
        return Err(Error::EIO);
    }
    Ok(())
}

/// Talks to the device through Linux's NVMe and LightNVM ioctls
#[derive(Clone, Debug)]
pub struct IoctlBackend {
    file: Arc<File>,
    nsid: u32,
}

impl IoctlBackend {
    /// Open the namespace device node at `path`, such as `/dev/nvme0n1`.
    ///
    /// `writable` selects direct read-write access.  Otherwise the device is
    /// opened read-only.
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> Result<Self> {
        let path = path.as_ref();
        let nsid = Self::nsid_of(path)?;
        let mut oo = OpenOptions::new();
        oo.read(true);
        if writable {
            oo.write(true).custom_flags(libc::O_DIRECT);
        }
        let file = oo.open(path)?;
        debug!(?path, nsid, writable, "opened device");
        Ok(IoctlBackend { file: Arc::new(file), nsid })
    }

    /// Namespace identifier of this device
    pub fn nsid(&self) -> u32 {
        self.nsid
    }

    /// Parse the namespace number out of a name like `nvme0n1`
    fn nsid_of(path: &Path) -> Result<u32> {
        let name = path.file_name()
            .and_then(|n| n.to_str())
            .ok_or(Error::EINVAL)?;
        let rest = name.strip_prefix("nvme").ok_or(Error::EINVAL)?;
        let (ctrl, ns) = rest.split_once('n').ok_or(Error::EINVAL)?;
        ctrl.parse::<u32>().map_err(|_| Error::EINVAL)?;
        ns.parse::<u32>().map_err(|_| Error::EINVAL)
    }
}

impl Backend for IoctlBackend {
    fn id(&self) -> BackendId {
        BackendId::Ioctl
    }

    fn user(&self, cmd: &mut Command<'_>) -> Result<()> {
        let direction = cmd.direction();
        let mut data = Mapping::new(&mut cmd.data)?;
        let mut meta = Mapping::new(&mut cmd.meta)?;
        let io = ffi::nvme_user_io {
            opcode: cmd.opcode,
            flags: cmd.flags,
            control: cmd.control,
            nblocks: cmd.cdw[2] as u16,
            metadata: meta.addr(),
            addr: data.addr(),
            slba: u64::from(cmd.cdw[0]) | u64::from(cmd.cdw[1]) << 32,
            ..Default::default()
        };
        let r = unsafe {
            ffi::nvme_submit_io(self.file.as_raw_fd(), &io)
        };
        data.finish(direction)?;
        meta.finish(direction)?;
        complete(r, cmd, 0, 0)
    }

    fn admin(&self, cmd: &mut Command<'_>) -> Result<()> {
        let direction = cmd.direction();
        let mut data = Mapping::new(&mut cmd.data)?;
        let mut meta = Mapping::new(&mut cmd.meta)?;
        let mut pc = ffi::nvme_passthru_cmd {
            opcode: cmd.opcode,
            flags: cmd.flags,
            nsid: cmd.nsid,
            metadata: meta.addr(),
            addr: data.addr(),
            metadata_len: meta.len() as u32,
            data_len: data.len() as u32,
            cdw10: cmd.cdw[0],
            cdw11: cmd.cdw[1],
            cdw12: cmd.cdw[2],
            cdw13: cmd.cdw[3],
            cdw14: cmd.cdw[4],
            cdw15: cmd.cdw[5],
            timeout_ms: cmd.timeout_ms,
            ..Default::default()
        };
        let r = unsafe {
            ffi::nvme_admin_cmd(self.file.as_raw_fd(), &mut pc)
        };
        data.finish(direction)?;
        meta.finish(direction)?;
        complete(r, cmd, u64::from(pc.result), 0)
    }

    fn vuser(&self, cmd: &mut Command<'_>) -> Result<()> {
        let direction = cmd.direction();
        let nppas = cmd.nppas();
        let src = PpaList::new(&cmd.addrs);
        let dst = PpaList::new(&cmd.dst);
        let mut data = Mapping::new(&mut cmd.data)?;
        let mut meta = Mapping::new(&mut cmd.meta)?;
        let (r, result, status) = if cmd.dst.is_empty() {
            let mut vio = ffi::nvm_user_vio {
                opcode: cmd.opcode,
                flags: cmd.flags,
                control: cmd.control,
                nppas,
                metadata: meta.addr(),
                addr: data.addr(),
                ppa_list: src.val(),
                metadata_len: meta.len() as u32,
                data_len: data.len() as u32,
                ..Default::default()
            };
            let r = unsafe {
                ffi::nvm_submit_vio(self.file.as_raw_fd(), &mut vio)
            };
            (r, vio.result, vio.status)
        } else {
            // The destination list rides in dwords 14 and 15
            let mut vio = ffi::nvm_passthru_vio {
                opcode: cmd.opcode,
                flags: cmd.flags,
                nsid: cmd.nsid,
                ppa_list: src.val(),
                nppas,
                control: cmd.control,
                cdw14: dst.val() as u32,
                cdw15: (dst.val() >> 32) as u32,
                timeout_ms: cmd.timeout_ms,
                ..Default::default()
            };
            let r = unsafe {
                ffi::nvm_io_vio(self.file.as_raw_fd(), &mut vio)
            };
            (r, vio.result, vio.status)
        };
        data.finish(direction)?;
        meta.finish(direction)?;
        complete(r, cmd, u64::from(result), status)
    }

    fn vadmin(&self, cmd: &mut Command<'_>) -> Result<()> {
        let direction = cmd.direction();
        let nppas = cmd.nppas();
        let ppas = PpaList::new(&cmd.addrs);
        let mut data = Mapping::new(&mut cmd.data)?;
        let mut meta = Mapping::new(&mut cmd.meta)?;
        let mut vio = ffi::nvm_passthru_vio {
            opcode: cmd.opcode,
            flags: cmd.flags,
            nsid: cmd.nsid,
            metadata: meta.addr(),
            addr: data.addr(),
            metadata_len: meta.len() as u32,
            data_len: data.len() as u32,
            ppa_list: ppas.val(),
            nppas,
            control: cmd.control,
            cdw13: cmd.cdw[3],
            cdw14: cmd.cdw[4],
            cdw15: cmd.cdw[5],
            timeout_ms: cmd.timeout_ms,
            ..Default::default()
        };
        let r = unsafe {
            ffi::nvm_admin_vio(self.file.as_raw_fd(), &mut vio)
        };
        data.finish(direction)?;
        meta.finish(direction)?;
        complete(r, cmd, u64::from(vio.result), vio.status)
    }

    fn async_init(&self, depth: u32) -> Result<Box<dyn AsyncQueue>> {
        if depth == 0 || depth > ImmediateQueue::<Self>::DEPTH_MAX {
            return Err(Error::EINVAL);
        }
        Ok(Box::new(ImmediateQueue::new(self.clone())))
    }
}

// LCOV_EXCL_STOP
