//! Proxy to an isolated algorithm worker.

use super::IPA_CHANNEL_FD;
use crate::error::{Error, Result};
use crate::event::EventDispatcher;
use crate::ipc::{IpcChannel, Payload};
use crate::process::{ExitStatus, Process};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::path::Path;
use std::rc::Rc;

/// Connection state of an [`IpaProxy`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyState {
    /// No worker process; [`open`](IpaProxy::open) has not succeeded yet.
    Unconnected,
    /// Worker running, channel bound, calls accepted.
    Connected,
    /// The worker exited or the channel broke. Terminal until a fresh
    /// [`open`](IpaProxy::open).
    Disconnected,
}

struct PendingCall {
    tag: u8,
    // FnOnce: the exactly-once guarantee is structural.
    continuation: Box<dyn FnOnce(Result<Payload>)>,
}

struct ProxyInner {
    dispatcher: Rc<EventDispatcher>,
    state: Cell<ProxyState>,
    process: RefCell<Option<Process>>,
    channel: RefCell<Option<IpcChannel>>,
    /// Outstanding calls, correlated with replies by arrival order.
    pending: RefCell<VecDeque<PendingCall>>,
    /// Handler for unsolicited worker messages (no outstanding call).
    event_handler: RefCell<Option<Box<dyn FnMut(Payload)>>>,
    /// Handler fired once per transition into [`ProxyState::Disconnected`],
    /// carrying the worker's exit status.
    disconnected_handler: RefCell<Option<Box<dyn FnMut(ExitStatus)>>>,
}

/// Owns a supervised worker process and the channel connected to it.
///
/// Calls are asynchronous: [`call`](Self::call) sends a framed message and
/// registers a continuation that fires when the matching reply arrives, or
/// when the worker reaches an exited state, whichever happens first. Replies
/// are matched to calls strictly by arrival order on the channel; the
/// protocol is call/response without pipelining, so a caller needing
/// out-of-order completion must encode its own sequence numbers in the
/// payload.
///
/// A crashed worker is not fatal: the proxy transitions to
/// [`ProxyState::Disconnected`], fails every outstanding call with
/// [`Error::Disconnected`], and leaves any restart decision to the caller.
pub struct IpaProxy {
    inner: Rc<ProxyInner>,
}

impl IpaProxy {
    /// Create a proxy in the [`ProxyState::Unconnected`] state.
    pub fn new(dispatcher: Rc<EventDispatcher>) -> Self {
        Self {
            inner: Rc::new(ProxyInner {
                dispatcher,
                state: Cell::new(ProxyState::Unconnected),
                process: RefCell::new(None),
                channel: RefCell::new(None),
                pending: RefCell::new(VecDeque::new()),
                event_handler: RefCell::new(None),
                disconnected_handler: RefCell::new(None),
            }),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ProxyState {
        self.inner.state.get()
    }

    /// Install the handler for unsolicited worker messages.
    pub fn set_event_handler(&self, handler: impl FnMut(Payload) + 'static) {
        *self.inner.event_handler.borrow_mut() = Some(Box::new(handler));
    }

    /// Install the handler fired when the proxy becomes disconnected.
    ///
    /// The handler receives the worker's exit status, reported after the
    /// worker has been reaped. It does not fire for an explicit
    /// [`close`](Self::close).
    pub fn set_disconnected_handler(&self, handler: impl FnMut(ExitStatus) + 'static) {
        *self.inner.disconnected_handler.borrow_mut() = Some(Box::new(handler));
    }

    /// Start the worker and establish the channel.
    ///
    /// Creates the socket pair, spawns `executable` with `args` and the
    /// child end installed at [`IPA_CHANNEL_FD`], and binds the retained
    /// end. Fails with [`Error::Spawn`] or [`Error::Connect`] on any step,
    /// leaving the state [`ProxyState::Unconnected`] with no process id or
    /// descriptor leaked. Valid from Unconnected or Disconnected.
    pub fn open(&self, executable: &Path, args: &[&str]) -> Result<()> {
        if self.inner.state.get() == ProxyState::Connected {
            return Err(Error::Busy);
        }
        self.inner.state.set(ProxyState::Unconnected);

        let channel = IpcChannel::new(Rc::clone(&self.inner.dispatcher));
        let child_end = match channel.create_pair() {
            Ok(fd) => fd,
            Err(e) => return Err(Error::Connect(e.to_string())),
        };

        let process = Process::new(Rc::clone(&self.inner.dispatcher));
        let weak = Rc::downgrade(&self.inner);
        process.set_finished_handler(move |status| {
            if let Some(inner) = weak.upgrade() {
                ProxyInner::disconnect(&inner, status);
            }
        });

        if let Err(e) = process.start(executable, args, Some((child_end, IPA_CHANNEL_FD))) {
            channel.close();
            return Err(e);
        }

        let weak = Rc::downgrade(&self.inner);
        channel.set_ready_handler(move || {
            if let Some(inner) = weak.upgrade() {
                ProxyInner::on_ready(&inner);
            }
        });

        *self.inner.channel.borrow_mut() = Some(channel);
        *self.inner.process.borrow_mut() = Some(process);
        self.inner.state.set(ProxyState::Connected);

        tracing::debug!(executable = %executable.display(), "algorithm worker connected");

        Ok(())
    }

    /// Invoke a worker method asynchronously.
    ///
    /// Frames `tag` as the first payload byte and queues `continuation` for
    /// the matching reply. The continuation fires exactly once: with the
    /// reply payload, or with [`Error::Disconnected`] if the worker exits or
    /// the channel breaks first. A synchronous send failure is returned
    /// directly and releases the correlation entry.
    pub fn call(
        &self,
        tag: u8,
        payload: Payload,
        continuation: impl FnOnce(Result<Payload>) + 'static,
    ) -> Result<()> {
        if self.inner.state.get() != ProxyState::Connected {
            return Err(Error::Disconnected);
        }

        let mut data = Vec::with_capacity(1 + payload.data.len());
        data.push(tag);
        data.extend_from_slice(&payload.data);
        let message = Payload {
            data,
            fds: payload.fds,
        };

        self.inner.pending.borrow_mut().push_back(PendingCall {
            tag,
            continuation: Box::new(continuation),
        });

        let sent = {
            let channel = self.inner.channel.borrow();
            match channel.as_ref() {
                Some(channel) => channel.send(&message),
                // The channel broke and the reap that will transition the
                // state is still pending; the peer is gone either way.
                None => Err(Error::Disconnected),
            }
        };
        if let Err(e) = sent {
            self.inner.pending.borrow_mut().pop_back();
            return Err(e);
        }

        Ok(())
    }

    /// Number of calls whose replies are still outstanding.
    pub fn outstanding_calls(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    /// Tear the connection down.
    ///
    /// Kills the worker, fails every outstanding call with
    /// [`Error::Disconnected`], and returns to
    /// [`ProxyState::Unconnected`]. Idempotent.
    pub fn close(&self) {
        self.inner.state.set(ProxyState::Unconnected);
        if let Some(channel) = self.inner.channel.borrow_mut().take() {
            channel.close();
        }
        // Dropping the Process kills and reaps the worker.
        self.inner.process.borrow_mut().take();
        ProxyInner::fail_pending(&self.inner);
    }
}

impl ProxyInner {
    /// A message arrived from the worker.
    fn on_ready(inner: &Rc<ProxyInner>) {
        let received = {
            let channel = inner.channel.borrow();
            let Some(channel) = channel.as_ref() else {
                return;
            };
            channel.receive()
        };

        match received {
            Ok(payload) => {
                let call = inner.pending.borrow_mut().pop_front();
                match call {
                    Some(call) => {
                        tracing::trace!(tag = call.tag, "reply for outstanding call");
                        (call.continuation)(Ok(payload));
                    }
                    None => {
                        if let Some(handler) = inner.event_handler.borrow_mut().as_mut() {
                            handler(payload);
                        } else {
                            tracing::warn!("unsolicited worker message dropped");
                        }
                    }
                }
            }
            Err(Error::Disconnected) => Self::channel_broken(inner),
            Err(e) => {
                tracing::warn!(error = %e, "worker channel error");
                Self::channel_broken(inner);
            }
        }
    }

    /// The channel hit end-of-stream or a protocol error.
    ///
    /// The disconnect itself is driven by the supervisor's `finished` event
    /// so it always carries the worker's exit status: close the channel
    /// here, make sure the worker is on its way out, and let the reap that
    /// follows perform the state transition.
    fn channel_broken(inner: &Rc<ProxyInner>) {
        if inner.state.get() != ProxyState::Connected {
            return;
        }
        if let Some(channel) = inner.channel.borrow_mut().take() {
            channel.close();
        }
        if let Some(process) = inner.process.borrow().as_ref() {
            process.kill();
        }
    }

    /// Transition to Disconnected and fail everything outstanding.
    fn disconnect(inner: &Rc<ProxyInner>, status: ExitStatus) {
        if inner.state.get() != ProxyState::Connected {
            return;
        }
        inner.state.set(ProxyState::Disconnected);

        tracing::debug!(status = ?status, "algorithm worker disconnected");

        if let Some(channel) = inner.channel.borrow_mut().take() {
            channel.close();
        }
        inner.process.borrow_mut().take();

        Self::fail_pending(inner);

        if let Some(handler) = inner.disconnected_handler.borrow_mut().as_mut() {
            handler(status);
        }
    }

    fn fail_pending(inner: &Rc<ProxyInner>) {
        let calls: Vec<PendingCall> = inner.pending.borrow_mut().drain(..).collect();
        for call in calls {
            (call.continuation)(Err(Error::Disconnected));
        }
    }
}

impl std::fmt::Debug for IpaProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpaProxy")
            .field("state", &self.state())
            .field("outstanding", &self.outstanding_calls())
            .finish()
    }
}
