// vim: tw=80
//! Pluggable command transports
//!
//! A [`Backend`] carries [`Command`]s to the device.  Backends supply one
//! entry point per [`Privilege`] level and a factory for asynchronous
//! submission queues.  All of them must be safe to call from several threads
//! at once, each thread issuing its own commands.

use crate::{
    async_ctx::{Finished, Pending},
    cmd::{Command, Privilege},
    types::*,
};
use serde_derive::{Deserialize, Serialize};
use std::{collections::VecDeque, fmt};

#[cfg(test)] use mockall::automock;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod ioctl;
        pub use self::ioctl::IoctlBackend;
    }
}
mod nosys;
pub use self::nosys::NosysBackend;

/// Identifies a backend implementation
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendId {
    /// Whichever real backend this platform supports
    #[default]
    Any,
    /// Kernel ioctl passthrough
    Ioctl,
    /// Refuses every operation
    Nosys,
}

impl TryFrom<&str> for BackendId {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s {
            "any" => Ok(BackendId::Any),
            "ioctl" => Ok(BackendId::Ioctl),
            "nosys" => Ok(BackendId::Nosys),
            _ => Err(Error::EINVAL)
        }
    }
}

/// A device command transport
pub trait Backend: fmt::Debug + Send + Sync {
    fn id(&self) -> BackendId;

    /// Execute a standard NVMe I/O command
    fn user(&self, cmd: &mut Command<'_>) -> Result<()>;

    /// Execute a standard NVMe admin command
    fn admin(&self, cmd: &mut Command<'_>) -> Result<()>;

    /// Execute a vendor-specific I/O command
    fn vuser(&self, cmd: &mut Command<'_>) -> Result<()>;

    /// Execute a vendor-specific admin command
    fn vadmin(&self, cmd: &mut Command<'_>) -> Result<()>;

    /// Create an asynchronous submission queue able to carry `depth` commands
    /// at once.
    fn async_init(&self, depth: u32) -> Result<Box<dyn AsyncQueue>>;

    /// Tear down a queue created by [`async_init`](Self::async_init).
    fn async_term(&self, queue: Box<dyn AsyncQueue>) -> Result<()> {
        drop(queue);
        Ok(())
    }

    /// Collect up to `max` completions without blocking.  0 means no limit.
    fn async_poke(&self, queue: &mut dyn AsyncQueue, max: u32)
        -> Result<Vec<Finished>>
    {
        queue.reap(max)
    }

    /// Collect every outstanding completion, blocking as needed.
    fn async_wait(&self, queue: &mut dyn AsyncQueue) -> Result<Vec<Finished>> {
        queue.reap(0)
    }

    /// Route `cmd` to the entry point matching its privilege.
    ///
    /// On failure, `cmd.ret` tells whether the device or the host was at
    /// fault.
    fn dispatch(&self, cmd: &mut Command<'_>) -> Result<()> {
        match cmd.privilege {
            Privilege::User => self.user(cmd),
            Privilege::Admin => self.admin(cmd),
            Privilege::VendorUser => self.vuser(cmd),
            Privilege::VendorAdmin => self.vadmin(cmd),
        }
    }
}

/// A backend-specific asynchronous submission queue
#[cfg_attr(test, automock)]
pub trait AsyncQueue: Send {
    /// Hand a command to the device.  The queue owns it until it's reaped.
    /// A command the queue can't accept is handed back in the error.
    fn submit(&mut self, pending: Pending)
        -> ::std::result::Result<(), Rejected>;

    /// Return up to `max` finished commands, oldest first.  0 means no limit.
    fn reap(&mut self, max: u32) -> Result<Vec<Finished>>;
}

/// A command that an [`AsyncQueue`] refused to accept
#[derive(Debug)]
pub struct Rejected {
    pub error: Error,
    pub pending: Pending,
}

/// An [`AsyncQueue`] that executes each command synchronously as soon as it
/// is submitted, and hands back the results in submission order.
///
/// Any backend without native asynchronous support can use this.
#[derive(Debug)]
pub struct ImmediateQueue<B: Backend + Clone + 'static> {
    backend: B,
    done: VecDeque<Finished>,
}

impl<B: Backend + Clone + 'static> ImmediateQueue<B> {
    /// Deepest queue that may be requested
    pub const DEPTH_MAX: u32 = 4096;

    pub fn new(backend: B) -> Self {
        ImmediateQueue { backend, done: VecDeque::new() }
    }
}

impl<B: Backend + Clone + 'static> AsyncQueue for ImmediateQueue<B> {
    fn submit(&mut self, mut pending: Pending)
        -> ::std::result::Result<(), Rejected>
    {
        if self.done.try_reserve(1).is_err() {
            return Err(Rejected { error: Error::ENOMEM, pending });
        }
        let mut result = self.backend.dispatch(&mut pending.cmd);
        if let Err(e) = result {
            if pending.cmd.tolerates(e) {
                result = Ok(());
            }
        }
        self.done.push_back(Finished { pending, result });
        Ok(())
    }

    fn reap(&mut self, max: u32) -> Result<Vec<Finished>> {
        let n = match max {
            0 => self.done.len(),
            m => (m as usize).min(self.done.len()),
        };
        Ok(self.done.drain(..n).collect())
    }
}

// LCOV_EXCL_STOP
