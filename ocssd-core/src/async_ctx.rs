// vim: tw=80
//! Bounded asynchronous command execution
//!
//! An [`AsyncContext`] accepts up to `depth` commands at a time.  Each command
//! travels together with its buffers and its callback as one [`Pending`] unit.
//! The unit is owned by the context until completion.  Then the callback
//! receives it back as a [`Completion`], exactly once.

use crate::{
    backend::AsyncQueue,
    cmd::Command,
    dev::Device,
    types::*,
};
use std::fmt;
use tracing::warn;

/// Invoked once when an asynchronous command completes
pub type Callback = Box<dyn FnOnce(Completion) + Send>;

/// A command awaiting submission or completion, with its callback
pub struct Pending {
    pub cmd: Command<'static>,
    callback: Callback,
}

impl Pending {
    pub fn new(cmd: Command<'static>, callback: Callback) -> Self {
        Pending { cmd, callback }
    }

    /// Resolve the command, handing everything back to its owner
    fn complete(self, result: Result<()>) {
        let ret = self.cmd.ret;
        (self.callback)(Completion { cmd: self.cmd, ret, result });
    }
}

impl fmt::Debug for Pending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("cmd", &self.cmd)
            .finish_non_exhaustive()
    }
}

/// A command that a backend's queue has finished with, but whose callback
/// hasn't run yet
#[derive(Debug)]
pub struct Finished {
    pub pending: Pending,
    pub result: Result<()>,
}

/// What a callback receives
#[derive(Debug)]
pub struct Completion {
    /// The original command, still owning its buffers
    pub cmd: Command<'static>,
    pub ret: Ret,
    pub result: Result<()>,
}

/// Outcome of [`AsyncContext::submit`]
#[derive(Debug)]
pub enum Admission {
    Admitted,
    /// The context is full.  The command is handed back unsubmitted so the
    /// caller can retry it after reaping.
    TryAgain(Pending),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Active,
    /// Blocked in `wait`
    Draining,
    Terminated,
}

/// A bounded-depth asynchronous execution context for one [`Device`].
///
/// At most one thread may drive a context at a time.
pub struct AsyncContext<'d> {
    dev: &'d Device,
    depth: u32,
    outstanding: u32,
    queue: Option<Box<dyn AsyncQueue>>,
    state: State,
}

impl<'d> AsyncContext<'d> {
    /// Create a context allowing `depth` commands in flight.
    ///
    /// Fails if the backend can't support that depth.
    pub fn init(dev: &'d Device, depth: u32) -> Result<Self> {
        if depth == 0 {
            return Err(Error::EINVAL);
        }
        let queue = dev.backend().async_init(depth)?;
        Ok(AsyncContext {
            dev,
            depth,
            outstanding: 0,
            queue: Some(queue),
            state: State::Active,
        })
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Number of admitted commands whose callbacks haven't run yet
    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    fn queue(&mut self) -> Result<&mut Box<dyn AsyncQueue>> {
        match self.state {
            State::Terminated => Err(Error::EINVAL),
            _ => self.queue.as_mut().ok_or(Error::EINVAL),
        }
    }

    /// Submit a command without blocking.
    ///
    /// If the context is full, the command is handed back in
    /// [`Admission::TryAgain`].  If the backend fails to accept the command,
    /// its callback runs right away with the error, which is also returned.
    pub fn submit(&mut self, pending: Pending) -> Result<Admission> {
        if self.state != State::Active {
            return Err(Error::EINVAL);
        }
        if self.outstanding >= self.depth {
            return Ok(Admission::TryAgain(pending));
        }
        if let Err(r) = self.queue()?.submit(pending) {
            warn!(error = ?r.error, "backend refused an asynchronous command");
            r.pending.complete(Err(r.error));
            return Err(r.error);
        }
        self.outstanding += 1;
        Ok(Admission::Admitted)
    }

    /// Build a command with `f` and submit it with `callback`.
    pub fn submit_with<F>(&mut self, f: F, callback: Callback)
        -> Result<Admission>
        where F: FnOnce(&Device) -> Result<Command<'static>>
    {
        let cmd = f(self.dev)?;
        self.submit(Pending::new(cmd, callback))
    }

    fn deliver(&mut self, finished: Vec<Finished>) -> usize {
        let n = finished.len();
        for f in finished {
            self.outstanding = self.outstanding.saturating_sub(1);
            f.pending.complete(f.result);
        }
        n
    }

    /// Reap up to `max` completed commands without blocking, invoking their
    /// callbacks.  0 means no limit.  Returns the number reaped.
    pub fn poke(&mut self, max: u32) -> Result<usize> {
        let dev = self.dev;
        let finished = dev.backend().async_poke(&mut **self.queue()?, max)?;
        Ok(self.deliver(finished))
    }

    /// Block until every admitted command has completed, invoking each
    /// callback.  Returns the number reaped.
    pub fn wait(&mut self) -> Result<usize> {
        let dev = self.dev;
        self.queue()?;
        self.state = State::Draining;
        let mut total = 0;
        let r = loop {
            if self.outstanding == 0 {
                break Ok(total);
            }
            let finished = match self.queue
                .as_mut()
                .ok_or(Error::EINVAL)
                .and_then(|q| dev.backend().async_wait(&mut **q))
            {
                Ok(f) => f,
                Err(e) => break Err(e)
            };
            if finished.is_empty() {
                // The backend has nothing left to give us
                break Err(Error::EDEADLK);
            }
            total += self.deliver(finished);
        };
        self.state = State::Active;
        r
    }

    /// Release the context's backend resources.
    ///
    /// Every admitted command must have been reaped first.
    pub fn term(&mut self) -> Result<()> {
        if self.state == State::Terminated {
            return Err(Error::EINVAL);
        }
        if self.outstanding > 0 {
            return Err(Error::EBUSY);
        }
        self.state = State::Terminated;
        match self.queue.take() {
            Some(q) => self.dev.backend().async_term(q),
            None => Ok(())
        }
    }
}

impl<'d> Drop for AsyncContext<'d> {
    fn drop(&mut self) {
        if self.outstanding > 0 {
            warn!(outstanding = self.outstanding,
                "dropping an asynchronous context with commands in flight");
        }
    }
}

// LCOV_EXCL_STOP
