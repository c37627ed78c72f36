//! Capture requests and the buffers bound to them.
//!
//! A [`Request`] is one frame's worth of capture work: a set of output
//! buffers, one per stream, plus the control parameters to apply for that
//! frame. The request is prepared once at submission and then mutated only by
//! buffer completion events arriving from the device layer, all on the single
//! dispatcher thread. Completion is buffer driven: the request as a whole
//! finishes when its last outstanding buffer does, and a single cancelled
//! buffer cancels the whole request.

use crate::controls::ControlList;
use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet};

/// Identity of an output stream within a camera configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

/// Completion status of a single buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferStatus {
    /// The buffer was filled with valid frame data.
    Success,
    /// Capture was aborted before the buffer was filled.
    Cancelled,
}

/// A unit of image memory bound to one stream for one request.
///
/// The buffer is exclusively owned by the request from
/// [`add_buffer`](Request::add_buffer) until completion consumes the request;
/// the device layer refers to it by stream identity, never by reference.
#[derive(Debug)]
pub struct FrameBuffer {
    index: u32,
    stream: Option<StreamId>,
    sequence: u64,
    bytes_used: usize,
    status: BufferStatus,
}

impl FrameBuffer {
    /// Create a buffer backed by pool slot `index`, destined for `stream`.
    pub fn new(index: u32, stream: Option<StreamId>) -> Self {
        Self {
            index,
            stream,
            sequence: 0,
            bytes_used: 0,
            status: BufferStatus::Success,
        }
    }

    /// Pool slot index of the backing memory.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The stream this buffer is destined for, if declared.
    pub fn stream(&self) -> Option<StreamId> {
        self.stream
    }

    /// Frame sequence number assigned at completion.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Number of payload bytes the device wrote, assigned at completion.
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Completion status, meaningful once the buffer has completed.
    pub fn status(&self) -> BufferStatus {
        self.status
    }
}

/// Completion metadata reported by the device layer for one buffer.
#[derive(Clone, Copy, Debug)]
pub struct BufferCompletion {
    /// Whether the buffer carries frame data or was aborted.
    pub status: BufferStatus,
    /// Frame sequence number of the capture.
    pub sequence: u64,
    /// Payload bytes written by the device.
    pub bytes_used: usize,
}

impl BufferCompletion {
    /// Metadata for a successfully filled buffer.
    pub fn success(sequence: u64, bytes_used: usize) -> Self {
        Self {
            status: BufferStatus::Success,
            sequence,
            bytes_used,
        }
    }

    /// Metadata for a buffer whose capture was aborted.
    pub fn cancelled() -> Self {
        Self {
            status: BufferStatus::Cancelled,
            sequence: 0,
            bytes_used: 0,
        }
    }
}

/// Overall completion status of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    /// Submitted or being assembled; buffers may still be outstanding.
    Pending,
    /// Every buffer completed successfully.
    Complete,
    /// At least one buffer was cancelled.
    Cancelled,
}

/// One frame's worth of capture work.
pub struct Request {
    camera: String,
    cookie: u64,
    controls: ControlList,
    buffers: HashMap<StreamId, FrameBuffer>,
    outstanding: HashSet<StreamId>,
    status: RequestStatus,
    cancelled: bool,
}

impl Request {
    /// Create an empty request for `camera`.
    ///
    /// `cookie` is an opaque application value carried through unmodified;
    /// the stack never interprets it.
    pub fn new(camera: impl Into<String>, cookie: u64) -> Self {
        Self {
            camera: camera.into(),
            cookie,
            controls: ControlList::new(),
            buffers: HashMap::new(),
            outstanding: HashSet::new(),
            status: RequestStatus::Pending,
            cancelled: false,
        }
    }

    /// Name of the camera this request belongs to.
    pub fn camera(&self) -> &str {
        &self.camera
    }

    /// The application cookie, verbatim.
    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    /// Controls to apply for this frame.
    pub fn controls(&self) -> &ControlList {
        &self.controls
    }

    /// Mutable access to the controls, valid until the request is prepared.
    pub fn controls_mut(&mut self) -> &mut ControlList {
        &mut self.controls
    }

    /// Current completion status.
    pub fn status(&self) -> RequestStatus {
        self.status
    }

    /// The buffer bound to `stream`, if any.
    pub fn buffer(&self, stream: StreamId) -> Option<&FrameBuffer> {
        self.buffers.get(&stream)
    }

    /// Number of buffers bound to the request.
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Bind `buffer` to its declared stream.
    ///
    /// Fails with [`Error::InvalidStream`] if the buffer declares no stream
    /// and [`Error::StreamAlreadyBound`] if this request already holds a
    /// buffer for that stream. On failure the request is untouched.
    pub fn add_buffer(&mut self, buffer: FrameBuffer) -> Result<()> {
        let stream = buffer.stream.ok_or(Error::InvalidStream)?;
        if self.buffers.contains_key(&stream) {
            return Err(Error::StreamAlreadyBound);
        }
        self.buffers.insert(stream, buffer);
        Ok(())
    }

    /// Enter the pending state at submission.
    ///
    /// Fails with [`Error::EmptyRequest`] if no buffers are bound; a request
    /// with an empty buffer map never becomes outstanding. Idempotence is not
    /// offered: prepare is called exactly once per (re)submission.
    pub fn prepare(&mut self) -> Result<()> {
        if self.buffers.is_empty() {
            return Err(Error::EmptyRequest);
        }
        self.status = RequestStatus::Pending;
        self.cancelled = false;
        self.outstanding.extend(self.buffers.keys().copied());
        Ok(())
    }

    /// Whether any buffer is still awaiting completion.
    pub fn has_pending_buffers(&self) -> bool {
        !self.outstanding.is_empty()
    }

    /// Record the completion of the buffer bound to `stream`.
    ///
    /// Returns `true` when this was the last outstanding buffer, at which
    /// point the caller must invoke [`complete`](Self::complete).
    ///
    /// # Panics
    ///
    /// Completing a buffer that is not outstanding (never prepared, or
    /// already completed) is a programming error in the device layer and
    /// panics rather than being silently ignored.
    pub fn complete_buffer(&mut self, stream: StreamId, metadata: BufferCompletion) -> bool {
        assert!(
            self.outstanding.remove(&stream),
            "buffer for stream {:?} completed while not outstanding",
            stream
        );

        // The map holds every stream in the outstanding set.
        let buffer = self
            .buffers
            .get_mut(&stream)
            .unwrap_or_else(|| unreachable!("outstanding stream without a bound buffer"));
        buffer.status = metadata.status;
        buffer.sequence = metadata.sequence;
        buffer.bytes_used = metadata.bytes_used;

        if metadata.status == BufferStatus::Cancelled {
            self.cancelled = true;
        }

        tracing::trace!(
            cookie = self.cookie,
            stream = stream.0,
            ?metadata.status,
            remaining = self.outstanding.len(),
            "buffer completed"
        );

        self.outstanding.is_empty()
    }

    /// Finalize the request once every buffer has completed.
    ///
    /// The final status is [`RequestStatus::Cancelled`] if any buffer
    /// completed cancelled, else [`RequestStatus::Complete`].
    ///
    /// # Panics
    ///
    /// Panics if buffers are still outstanding or the request already left
    /// the pending state.
    pub fn complete(&mut self) {
        assert!(
            self.outstanding.is_empty(),
            "request completed with buffers outstanding"
        );
        assert_eq!(
            self.status,
            RequestStatus::Pending,
            "request completed twice"
        );

        self.status = if self.cancelled {
            RequestStatus::Cancelled
        } else {
            RequestStatus::Complete
        };

        tracing::debug!(camera = %self.camera, cookie = self.cookie, status = ?self.status, "request completed");
    }

    /// Reset a finished request for re-submission with the same buffers.
    ///
    /// Buffer completion metadata and the cancelled flag are cleared; the
    /// controls and cookie are kept. The request must then be prepared again
    /// before buffers may complete against it.
    pub fn reuse(&mut self) {
        assert!(
            self.outstanding.is_empty(),
            "request reused with buffers outstanding"
        );
        self.status = RequestStatus::Pending;
        self.cancelled = false;
        for buffer in self.buffers.values_mut() {
            buffer.status = BufferStatus::Success;
            buffer.sequence = 0;
            buffer.bytes_used = 0;
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("camera", &self.camera)
            .field("cookie", &self.cookie)
            .field("status", &self.status)
            .field("buffers", &self.buffers.len())
            .field("outstanding", &self.outstanding.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepared_request(streams: &[u32]) -> Request {
        let mut request = Request::new("cam0", 0xdead_beef);
        for (i, stream) in streams.iter().enumerate() {
            request
                .add_buffer(FrameBuffer::new(i as u32, Some(StreamId(*stream))))
                .unwrap();
        }
        request.prepare().unwrap();
        request
    }

    #[test]
    fn test_add_buffer_without_stream_is_invalid() {
        let mut request = Request::new("cam0", 0);
        let err = request.add_buffer(FrameBuffer::new(0, None)).unwrap_err();
        assert!(matches!(err, Error::InvalidStream));
        assert_eq!(request.buffer_count(), 0);
    }

    #[test]
    fn test_one_buffer_per_stream() {
        let mut request = Request::new("cam0", 0);
        request
            .add_buffer(FrameBuffer::new(0, Some(StreamId(1))))
            .unwrap();
        let err = request
            .add_buffer(FrameBuffer::new(1, Some(StreamId(1))))
            .unwrap_err();
        assert!(matches!(err, Error::StreamAlreadyBound));
        assert_eq!(request.buffer_count(), 1);
    }

    #[test]
    fn test_prepare_empty_request_fails() {
        let mut request = Request::new("cam0", 0);
        let err = request.prepare().unwrap_err();
        assert!(matches!(err, Error::EmptyRequest));
        assert!(!request.has_pending_buffers());
        assert_eq!(request.status(), RequestStatus::Pending);
    }

    #[test]
    fn test_completion_order_does_not_matter() {
        let mut request = prepared_request(&[1, 2, 3]);

        assert!(!request.complete_buffer(StreamId(2), BufferCompletion::success(10, 100)));
        assert!(!request.complete_buffer(StreamId(3), BufferCompletion::success(10, 200)));
        assert!(request.complete_buffer(StreamId(1), BufferCompletion::success(10, 300)));

        request.complete();
        assert_eq!(request.status(), RequestStatus::Complete);
        assert_eq!(request.buffer(StreamId(3)).unwrap().bytes_used(), 200);
    }

    #[test]
    #[should_panic(expected = "not outstanding")]
    fn test_double_complete_panics() {
        let mut request = prepared_request(&[1]);
        request.complete_buffer(StreamId(1), BufferCompletion::success(1, 1));
        request.complete_buffer(StreamId(1), BufferCompletion::success(1, 1));
    }

    #[test]
    #[should_panic(expected = "not outstanding")]
    fn test_complete_unknown_stream_panics() {
        let mut request = prepared_request(&[1]);
        request.complete_buffer(StreamId(9), BufferCompletion::success(1, 1));
    }

    #[test]
    fn test_single_cancelled_buffer_cancels_request() {
        let mut request = prepared_request(&[1, 2, 3]);

        assert!(!request.complete_buffer(StreamId(1), BufferCompletion::success(5, 10)));
        assert!(!request.complete_buffer(StreamId(2), BufferCompletion::cancelled()));
        assert!(request.complete_buffer(StreamId(3), BufferCompletion::success(5, 10)));

        request.complete();
        assert_eq!(request.status(), RequestStatus::Cancelled);
        assert_eq!(
            request.buffer(StreamId(2)).unwrap().status(),
            BufferStatus::Cancelled
        );
        assert_eq!(
            request.buffer(StreamId(1)).unwrap().status(),
            BufferStatus::Success
        );
    }

    #[test]
    #[should_panic(expected = "buffers outstanding")]
    fn test_complete_with_outstanding_buffers_panics() {
        let mut request = prepared_request(&[1, 2]);
        request.complete_buffer(StreamId(1), BufferCompletion::success(1, 1));
        request.complete();
    }

    #[test]
    fn test_reuse_resets_for_resubmission() {
        let mut request = prepared_request(&[1]);
        assert!(request.complete_buffer(StreamId(1), BufferCompletion::cancelled()));
        request.complete();
        assert_eq!(request.status(), RequestStatus::Cancelled);

        request.reuse();
        assert_eq!(request.status(), RequestStatus::Pending);
        request.prepare().unwrap();
        assert!(request.complete_buffer(StreamId(1), BufferCompletion::success(2, 64)));
        request.complete();
        assert_eq!(request.status(), RequestStatus::Complete);
        assert_eq!(request.cookie(), 0xdead_beef);
    }
}
