//! # Obscura
//!
//! Core building blocks of a userspace camera stack: per-frame capture
//! request tracking and cross-process isolation for vendor image-processing
//! algorithms (IPA).
//!
//! The stack runs untrusted algorithm modules in separate worker processes.
//! The core talks to a worker over a framed, descriptor-carrying Unix socket
//! channel, supervises the worker's lifetime, and treats a crash mid-call as
//! an ordinary event rather than a fatal condition. All of it is driven by a
//! single-threaded readiness loop; nothing in this crate blocks a thread or
//! spawns one.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use obscura::prelude::*;
//! use std::path::Path;
//! use std::rc::Rc;
//!
//! let dispatcher = Rc::new(EventDispatcher::new()?);
//!
//! let proxy = IpaProxy::new(Rc::clone(&dispatcher));
//! proxy.open(Path::new("/usr/libexec/obscura/vendor-ipa"), &[])?;
//! proxy.call(1, Payload::from_data(vec![0x2a]), |reply| {
//!     // Fires from a dispatcher iteration with the reply, or with
//!     // Error::Disconnected if the worker dies first.
//! })?;
//!
//! let mut request = Request::new("cam0", 0);
//! request.add_buffer(FrameBuffer::new(0, Some(StreamId(0))))?;
//! request.prepare()?;
//!
//! loop {
//!     dispatcher.process_events()?;
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod controls;
pub mod error;
pub mod event;
pub mod ipa;
pub mod ipc;
pub mod process;
pub mod request;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::controls::{ControlId, ControlList, ControlValue};
    pub use crate::error::{Error, Result};
    pub use crate::event::EventDispatcher;
    pub use crate::ipa::{IpaProxy, ProxyState};
    pub use crate::ipc::{IpcChannel, Payload};
    pub use crate::process::{ExitStatus, Process};
    pub use crate::request::{
        BufferCompletion, BufferStatus, FrameBuffer, Request, RequestStatus, StreamId,
    };
}

pub use error::{Error, Result};
