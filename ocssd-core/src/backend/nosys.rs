// vim: tw=80
//! A backend that supports nothing
//!
//! Used on platforms without a real transport, and as the fallback identity
//! of a [`Device`](crate::dev::Device) whose backend could not be chosen.

use crate::{
    backend::{AsyncQueue, Backend, BackendId},
    cmd::Command,
    types::*,
};
use std::path::Path;

#[derive(Clone, Copy, Debug, Default)]
pub struct NosysBackend;

impl NosysBackend {
    /// Opening a device through this backend never works
    pub fn open<P: AsRef<Path>>(_path: P) -> Result<Self> {
        Err(Error::ENOSYS)
    }
}

impl Backend for NosysBackend {
    fn id(&self) -> BackendId {
        BackendId::Nosys
    }

    fn user(&self, _cmd: &mut Command<'_>) -> Result<()> {
        Err(Error::ENOTSUP)
    }

    fn admin(&self, _cmd: &mut Command<'_>) -> Result<()> {
        Err(Error::ENOTSUP)
    }

    fn vuser(&self, _cmd: &mut Command<'_>) -> Result<()> {
        Err(Error::ENOTSUP)
    }

    fn vadmin(&self, _cmd: &mut Command<'_>) -> Result<()> {
        Err(Error::ENOTSUP)
    }

    fn async_init(&self, _depth: u32) -> Result<Box<dyn AsyncQueue>> {
        Err(Error::ENOTSUP)
    }
}

// LCOV_EXCL_STOP
