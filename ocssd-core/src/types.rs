// vim: tw=80
//! Common type definitions used throughout the library

use divbuf::{DivBuf, DivBufMut};
use enum_primitive_derive::Primitive;
use num_traits::{FromPrimitive, ToPrimitive};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use std::io;

/// Our `IoVec`.  Unlike the standard library's, ours is reference-counted so it
/// can have more than one owner.
pub type IoVec = DivBuf;

/// Mutable version of `IoVec`.  Uniquely owned.
pub type IoVecMut = DivBufMut;

/// The library's error type.  Basically just a Linux errno
#[derive(Clone, Copy, Debug, Deserialize, Error, Eq, PartialEq, Primitive,
         Serialize)]
pub enum Error {
    #[error("Operation not permitted")]
    EPERM           = libc::EPERM as isize,
    #[error("No such file or directory")]
    ENOENT          = libc::ENOENT as isize,
    #[error("Interrupted system call")]
    EINTR           = libc::EINTR as isize,
    #[error("Input/output error")]
    EIO             = libc::EIO as isize,
    #[error("No such device or address")]
    ENXIO           = libc::ENXIO as isize,
    #[error("Argument list too long")]
    E2BIG           = libc::E2BIG as isize,
    #[error("Bad file descriptor")]
    EBADF           = libc::EBADF as isize,
    #[error("Resource temporarily unavailable")]
    EAGAIN          = libc::EAGAIN as isize,
    #[error("Cannot allocate memory")]
    ENOMEM          = libc::ENOMEM as isize,
    #[error("Permission denied")]
    EACCES          = libc::EACCES as isize,
    #[error("Bad address")]
    EFAULT          = libc::EFAULT as isize,
    #[error("Block device required")]
    ENOTBLK         = libc::ENOTBLK as isize,
    #[error("Device or resource busy")]
    EBUSY           = libc::EBUSY as isize,
    #[error("File exists")]
    EEXIST          = libc::EEXIST as isize,
    #[error("No such device")]
    ENODEV          = libc::ENODEV as isize,
    #[error("Not a directory")]
    ENOTDIR         = libc::ENOTDIR as isize,
    #[error("Is a directory")]
    EISDIR          = libc::EISDIR as isize,
    #[error("Invalid argument")]
    EINVAL          = libc::EINVAL as isize,
    #[error("Too many open files in system")]
    ENFILE          = libc::ENFILE as isize,
    #[error("Too many open files")]
    EMFILE          = libc::EMFILE as isize,
    #[error("Inappropriate ioctl for device")]
    ENOTTY          = libc::ENOTTY as isize,
    #[error("File too large")]
    EFBIG           = libc::EFBIG as isize,
    #[error("No space left on device")]
    ENOSPC          = libc::ENOSPC as isize,
    #[error("Read-only file system")]
    EROFS           = libc::EROFS as isize,
    #[error("Numerical argument out of domain")]
    EDOM            = libc::EDOM as isize,
    #[error("Numerical result out of range")]
    ERANGE          = libc::ERANGE as isize,
    #[error("Resource deadlock avoided")]
    EDEADLK         = libc::EDEADLK as isize,
    #[error("File name too long")]
    ENAMETOOLONG    = libc::ENAMETOOLONG as isize,
    #[error("Function not implemented")]
    ENOSYS          = libc::ENOSYS as isize,
    #[error("Protocol error")]
    EPROTO          = libc::EPROTO as isize,
    #[error("Bad message")]
    EBADMSG         = libc::EBADMSG as isize,
    #[error("Value too large for defined data type")]
    EOVERFLOW       = libc::EOVERFLOW as isize,
    #[error("Message too long")]
    EMSGSIZE        = libc::EMSGSIZE as isize,
    #[error("Operation not supported")]
    ENOTSUP         = libc::ENOTSUP as isize,
    #[error("Operation already in progress")]
    EALREADY        = libc::EALREADY as isize,
    #[error("Operation now in progress")]
    EINPROGRESS     = libc::EINPROGRESS as isize,
    #[error("Operation canceled")]
    ECANCELED       = libc::ECANCELED as isize,

    //// Custom error types below
    #[error("Unknown error")]
    EUNKNOWN        = 4096,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        e.raw_os_error()
            .and_then(Error::from_i32)
            .unwrap_or(Error::EUNKNOWN)
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::from_i32(e as i32).unwrap_or(Error::EUNKNOWN)
    }
}

impl From<Error> for i32 {
    fn from(e: Error) -> Self {
        match e {
            Error::EUNKNOWN =>
                panic!("Unknown error codes should never be exposed"),
            _ => e.to_i32().unwrap()
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::EUNKNOWN => io::Error::other(e),
            _ => io::Error::from_raw_os_error(i32::from(e))
        }
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

/// Completion result codes that the device reports for successful commands.
///
/// 0x700 is the "high ECC" warning on reads and 0x4700 flags an erase or write
/// that hit an offline chunk but was otherwise handled by the device.
pub const RESULT_ACCEPTABLE: [u64; 2] = [0x700, 0x4700];

/// The result/status sink of a single command.
///
/// `result` is the command-specific completion dword, `status` is the protocol
/// status code.  Either one being set means the device rejected the command.
/// An all-zero `Ret` paired with an error means the failure happened on the
/// host side, before or during submission.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Ret {
    pub result: u64,
    pub status: u64,
}

impl Ret {
    /// Does this completion represent success?
    pub fn is_ok(&self) -> bool {
        (self.status == 0 && self.result == 0) ||
            RESULT_ACCEPTABLE.contains(&self.result)
    }

    /// Did the device itself reject the command?
    pub fn is_device_error(&self) -> bool {
        !self.is_ok()
    }
}

// LCOV_EXCL_STOP
