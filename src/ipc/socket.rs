//! Framed, descriptor-carrying channel over a Unix datagram socket pair.

use crate::error::{Error, Result};
use crate::event::{EventDispatcher, WatchId};
use rustix::event::{poll, PollFd, PollFlags, Timespec};
use rustix::io::Errno;
use rustix::net::{
    recvmsg, sendmsg, socketpair, AddressFamily, RecvAncillaryBuffer, RecvAncillaryMessage,
    RecvFlags, SendAncillaryBuffer, SendAncillaryMessage, SendFlags, SocketFlags, SocketType,
};
use std::cell::{Cell, RefCell};
use std::io::{IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::os::fd::{AsFd, OwnedFd};
use std::rc::Rc;

/// Size of the fixed message header on the wire.
pub const HEADER_SIZE: usize = 8;

/// Maximum number of file descriptors that can travel in a single message.
pub const MAX_FDS_PER_MESSAGE: usize = 32;

/// Maximum payload size of a single message.
///
/// Checked before the header record is written, so an oversized payload can
/// never leave a half frame on the wire. Well below the default AF_UNIX
/// socket buffer; bulk data travels by descriptor, not by copy.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Ancillary buffer space sized for `MAX_FDS_PER_MESSAGE` descriptors.
const ANCILLARY_SPACE: usize = 256;

/// How long a receiver waits for the payload record trailing a header.
const PAYLOAD_WAIT: Timespec = Timespec {
    tv_sec: 1,
    tv_nsec: 0,
};

/// One message: a byte payload plus an ordered list of descriptors.
///
/// By convention the first data byte is a command tag interpreted by the
/// peer. Received descriptors are owned by whoever holds the payload; the
/// transport never closes them behind the receiver's back.
#[derive(Debug, Default)]
pub struct Payload {
    /// Message bytes.
    pub data: Vec<u8>,
    /// Descriptors transferred with the message, in send order.
    pub fds: Vec<OwnedFd>,
}

impl Payload {
    /// Create an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a payload carrying only bytes.
    pub fn from_data(data: Vec<u8>) -> Self {
        Self {
            data,
            fds: Vec::new(),
        }
    }

    /// A payload with no bytes and no descriptors is invalid to send.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.fds.is_empty()
    }
}

struct ChannelInner {
    dispatcher: Rc<EventDispatcher>,
    socket: RefCell<Option<OwnedFd>>,
    watch: Cell<Option<WatchId>>,
    // Rc so the dispatcher watch callback can reach the handler without
    // keeping the whole channel alive.
    ready: Rc<RefCell<Option<Box<dyn FnMut()>>>>,
}

/// A bidirectional, connection-oriented message channel.
///
/// Messages are delivered in the exact order sent and are never interleaved:
/// the underlying socket is a connected SOCK_SEQPACKET pair, so every
/// header/payload write is one atomic record and a closed peer surfaces as
/// end-of-stream. The channel is a cheap clonable handle; all clones refer to
/// the same endpoint.
#[derive(Clone)]
pub struct IpcChannel {
    inner: Rc<ChannelInner>,
}

impl IpcChannel {
    /// Create an unbound channel on the given dispatcher.
    pub fn new(dispatcher: Rc<EventDispatcher>) -> Self {
        Self {
            inner: Rc::new(ChannelInner {
                dispatcher,
                socket: RefCell::new(None),
                watch: Cell::new(None),
                ready: Rc::new(RefCell::new(None)),
            }),
        }
    }

    /// Allocate a connected socket pair, bind one end in place, and return
    /// the other end for handing to a child process across exec.
    pub fn create_pair(&self) -> Result<OwnedFd> {
        let (ours, theirs) = socketpair(
            AddressFamily::UNIX,
            SocketType::SEQPACKET,
            SocketFlags::CLOEXEC | SocketFlags::NONBLOCK,
            None,
        )?;
        self.bind(ours)?;
        Ok(theirs)
    }

    /// Adopt an existing endpoint and subscribe it for read readiness.
    ///
    /// Used by the child side, which receives its endpoint as an inherited
    /// descriptor. Fails with [`Error::AlreadyBound`] on a bound channel.
    pub fn bind(&self, fd: OwnedFd) -> Result<()> {
        if self.inner.socket.borrow().is_some() {
            return Err(Error::AlreadyBound);
        }

        let ready = Rc::clone(&self.inner.ready);
        let watch = self.inner.dispatcher.register_read(fd.as_fd(), move || {
            if let Some(handler) = ready.borrow_mut().as_mut() {
                handler();
            }
        });
        self.inner.watch.set(Some(watch));
        *self.inner.socket.borrow_mut() = Some(fd);
        Ok(())
    }

    /// Whether the channel is bound to a socket endpoint.
    pub fn is_bound(&self) -> bool {
        self.inner.socket.borrow().is_some()
    }

    /// Install the handler invoked once per fully framed message available.
    ///
    /// The handler is expected to call [`receive`](Self::receive) exactly
    /// once; if further messages are queued the dispatcher reports the
    /// endpoint ready again on its next iteration.
    pub fn set_ready_handler(&self, handler: impl FnMut() + 'static) {
        *self.inner.ready.borrow_mut() = Some(Box::new(handler));
    }

    /// Send one message.
    ///
    /// Fails with [`Error::EmptyMessage`] for a payload with no bytes and no
    /// descriptors, and with [`Error::Protocol`] for one exceeding
    /// [`MAX_PAYLOAD_SIZE`] or [`MAX_FDS_PER_MESSAGE`]; both limits are
    /// checked before anything is written, leaving the channel usable. The
    /// send is non-blocking; a short or blocked write is surfaced as an
    /// error rather than retried. Descriptor ownership stays with the
    /// caller: the kernel duplicates them into the message.
    ///
    /// If the payload record fails after the header record was accepted, a
    /// half frame is on the wire and no subsequent message could be framed
    /// correctly, so the channel closes itself before reporting the error.
    pub fn send(&self, payload: &Payload) -> Result<()> {
        if payload.is_empty() {
            return Err(Error::EmptyMessage);
        }
        if payload.fds.len() > MAX_FDS_PER_MESSAGE {
            return Err(Error::Protocol(format!(
                "too many descriptors: {} > {}",
                payload.fds.len(),
                MAX_FDS_PER_MESSAGE
            )));
        }
        if payload.data.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::Protocol(format!(
                "payload of {} bytes exceeds the {} byte limit",
                payload.data.len(),
                MAX_PAYLOAD_SIZE
            )));
        }

        let mut header = [0u8; HEADER_SIZE];
        header[..4].copy_from_slice(&(payload.data.len() as u32).to_ne_bytes());
        header[4..].copy_from_slice(&(payload.fds.len() as u32).to_ne_bytes());

        let payload_result = {
            let socket = self.inner.socket.borrow();
            let socket = socket.as_ref().ok_or(Error::NotConnected)?;

            let sent = rustix::net::send(socket, &header, SendFlags::NOSIGNAL)?;
            if sent != HEADER_SIZE {
                return Err(Error::Protocol("short header write".into()));
            }

            Self::send_payload_record(socket, payload)
        };

        // The header record is already committed; a failed payload record
        // desynchronizes the framing beyond repair.
        if let Err(e) = payload_result {
            tracing::warn!(error = %e, "half frame on the wire, closing channel");
            self.close();
            return Err(e);
        }

        Ok(())
    }

    fn send_payload_record(socket: &OwnedFd, payload: &Payload) -> Result<()> {
        let borrowed: Vec<_> = payload.fds.iter().map(|fd| fd.as_fd()).collect();
        let mut space = [const { MaybeUninit::uninit() }; ANCILLARY_SPACE];
        let mut ancillary = SendAncillaryBuffer::new(&mut space);
        if !borrowed.is_empty() && !ancillary.push(SendAncillaryMessage::ScmRights(&borrowed)) {
            return Err(Error::Protocol(
                "descriptor list exceeds ancillary space".into(),
            ));
        }

        let iov = [IoSlice::new(&payload.data)];
        let sent = sendmsg(socket, &iov, &mut ancillary, SendFlags::NOSIGNAL)?;
        if sent != payload.data.len() {
            return Err(Error::Protocol("short payload write".into()));
        }

        Ok(())
    }

    /// Receive exactly one framed message.
    ///
    /// Invoked from the ready handler once a readiness event fires. Fails
    /// with [`Error::Protocol`] on a malformed or truncated frame and with
    /// [`Error::Disconnected`] when the peer endpoint is gone. Returned
    /// descriptors are owned by the caller.
    pub fn receive(&self) -> Result<Payload> {
        let socket = self.inner.socket.borrow();
        let socket = socket.as_ref().ok_or(Error::NotConnected)?;

        let mut header = [0u8; HEADER_SIZE];
        let mut iov = [IoSliceMut::new(&mut header)];
        let mut ancillary = RecvAncillaryBuffer::default();
        let msg = recvmsg(socket, &mut iov, &mut ancillary, RecvFlags::empty())?;
        if msg.bytes == 0 {
            // We never frame a zero-byte header record, so this is the
            // peer's end-of-stream.
            return Err(Error::Disconnected);
        }
        if msg.bytes != HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "truncated header: {} bytes",
                msg.bytes
            )));
        }

        let length = u32::from_ne_bytes(header[..4].try_into().unwrap()) as usize;
        let num_fds = u32::from_ne_bytes(header[4..].try_into().unwrap()) as usize;
        if length == 0 && num_fds == 0 {
            return Err(Error::Protocol("empty message on the wire".into()));
        }
        if num_fds > MAX_FDS_PER_MESSAGE {
            return Err(Error::Protocol(format!(
                "descriptor count {} exceeds limit",
                num_fds
            )));
        }

        let mut data = vec![0u8; length];
        let mut space = [const { MaybeUninit::uninit() }; ANCILLARY_SPACE];
        let mut ancillary = RecvAncillaryBuffer::new(&mut space);
        let mut iov = [IoSliceMut::new(&mut data)];
        let msg = loop {
            match recvmsg(socket, &mut iov, &mut ancillary, RecvFlags::empty()) {
                Ok(msg) => break msg,
                // The payload record trails the header by one syscall on
                // the sending side; a reader woken between the two must
                // wait for it rather than fail the frame.
                Err(Errno::AGAIN) => {
                    let mut fds = [PollFd::from_borrowed_fd(socket.as_fd(), PollFlags::IN)];
                    if poll(&mut fds, Some(&PAYLOAD_WAIT))? == 0 {
                        return Err(Error::Protocol("truncated message".into()));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        };
        if msg.bytes != length {
            return Err(Error::Protocol(format!(
                "payload length mismatch: header {} vs received {}",
                length, msg.bytes
            )));
        }

        let mut fds = Vec::with_capacity(num_fds);
        for message in ancillary.drain() {
            if let RecvAncillaryMessage::ScmRights(rights) = message {
                fds.extend(rights);
            }
        }
        if fds.len() != num_fds {
            // Dropping `fds` closes whatever did arrive.
            return Err(Error::Protocol(format!(
                "descriptor count mismatch: header {} vs received {}",
                num_fds,
                fds.len()
            )));
        }

        Ok(Payload { data, fds })
    }

    /// Close the channel.
    ///
    /// Unregisters the readiness watch and drops the endpoint. Idempotent.
    pub fn close(&self) {
        if let Some(watch) = self.inner.watch.take() {
            self.inner.dispatcher.unregister(watch);
        }
        self.inner.socket.borrow_mut().take();
    }
}

impl std::fmt::Debug for IpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcChannel")
            .field("bound", &self.is_bound())
            .finish()
    }
}
