//! Inter-process message transport.
//!
//! The capture core talks to isolated algorithm workers over a connected
//! AF_UNIX SOCK_SEQPACKET pair. Each message is a byte payload plus an
//! ordered list of file descriptors; descriptors cross the process boundary as
//! `SCM_RIGHTS` ancillary data and are owned by the receiver from the moment
//! [`IpcChannel::receive`] returns.
//!
//! Wire format (stable): a fixed `[u32 payload_length][u32 descriptor_count]`
//! header, followed by the payload bytes carrying the descriptors; the
//! descriptors are associated with the message by position, in send order.
//! A message with no bytes and no descriptors is a protocol error at the send
//! boundary, not a valid no-op.

mod socket;

pub use socket::{IpcChannel, Payload, HEADER_SIZE, MAX_FDS_PER_MESSAGE, MAX_PAYLOAD_SIZE};
