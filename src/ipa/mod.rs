//! Out-of-process algorithm isolation.
//!
//! Vendor image-processing algorithms run in a separate, untrusted worker
//! process. The [`IpaProxy`] owns the worker and its message channel,
//! translates typed method calls into framed messages, correlates the
//! asynchronous replies, and surfaces a worker crash as a first-class event
//! instead of a hang.
//!
//! The worker receives its channel endpoint as an inherited descriptor at the
//! reserved number [`IPA_CHANNEL_FD`]; a worker that finds the descriptor
//! missing or invalid must treat that as a fatal startup condition.

mod proxy;

pub use proxy::{IpaProxy, ProxyState};

use crate::error::{Error, Result};
use crate::event::EventDispatcher;
use crate::ipc::IpcChannel;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;

/// Reserved descriptor number at which a worker finds its channel endpoint.
pub const IPA_CHANNEL_FD: RawFd = 3;

/// Command tags understood by the reference worker (`obscura-worker`).
///
/// The first payload byte of every message carries one of these. Vendor
/// workers define their own tag space; only the convention that byte zero is
/// the command is fixed.
pub mod cmd {
    /// Ask the worker to exit cleanly. Second byte is the exit code.
    pub const EXIT: u8 = 0;
    /// Reply with the remaining payload bytes reversed.
    pub const REVERSE: u8 = 1;
    /// Reply with the summed byte length of every attached descriptor.
    pub const LEN_CALC: u8 = 2;
    /// Abort immediately without replying (crash on demand).
    pub const CRASH: u8 = 3;
    /// Reply with the remaining payload bytes after a delay. The second
    /// byte is the delay in units of 10 ms.
    pub const DELAY: u8 = 4;
}

/// Adopt the inherited channel endpoint from inside a worker process.
///
/// Validates that the reserved descriptor exists before taking ownership of
/// it, and binds it to the given dispatcher. Fails with [`Error::Connect`]
/// when the descriptor is absent, which a worker must treat as fatal.
pub fn inherited_channel(dispatcher: Rc<EventDispatcher>) -> Result<IpcChannel> {
    let flags = unsafe { libc::fcntl(IPA_CHANNEL_FD, libc::F_GETFD) };
    if flags < 0 {
        return Err(Error::Connect(
            "reserved channel descriptor is missing".into(),
        ));
    }

    // Sole owner from here on: nothing else in the worker references fd 3.
    let fd = unsafe { OwnedFd::from_raw_fd(IPA_CHANNEL_FD) };
    let channel = IpcChannel::new(dispatcher);
    channel.bind(fd)?;
    Ok(channel)
}
