//! The request data source contract and the outbound write buffer.
//!
//! The engine never constructs requests. It polls a [`RequestSource`] for
//! the next request's bytes, ships them with partial-write accounting, and
//! reports per-request progress back to the source.

/// One request's outbound bytes plus the send offset.
///
/// Produced by the data source and handed to the engine by move; the engine
/// owns the buffer exclusively while it is in flight.
#[derive(Debug)]
pub struct WriteBuffer {
    identifier: String,
    payload: Vec<u8>,
    offset: usize,
    started: bool,
}

impl WriteBuffer {
    /// A buffer carrying `payload` for the request named `identifier`.
    pub fn new<S>(identifier: S, payload: Vec<u8>) -> Self
    where
        S: Into<String>,
    {
        Self {
            identifier: identifier.into(),
            payload,
            offset: 0,
            started: false,
        }
    }

    /// The request this buffer belongs to.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Total payload length.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// How many bytes have been sent so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Whether unsent bytes remain.
    pub fn has_data(&self) -> bool {
        self.offset < self.payload.len()
    }

    /// Whether some, but not all, bytes have been sent.
    pub fn is_partially_sent(&self) -> bool {
        self.offset > 0 && self.has_data()
    }

    /// The unsent tail of the payload.
    pub fn remaining(&self) -> &[u8] {
        &self.payload[self.offset..]
    }

    /// Record `sent` more bytes on the wire. The offset never passes the
    /// payload length.
    pub(crate) fn advance(&mut self, sent: usize) {
        self.offset = (self.offset + sent).min(self.payload.len());
    }

    /// Mark the processing-started notification as delivered; returns true
    /// the first time only.
    pub(crate) fn mark_started(&mut self) -> bool {
        !std::mem::replace(&mut self.started, true)
    }
}

/// External producer of write buffers and receiver of per-request progress.
///
/// All methods are invoked from the connection's own task, in order. The
/// notification methods default to no-ops so a source only implements the
/// events it cares about.
pub trait RequestSource: Send + Sync {
    /// Whether a request is waiting to be sent.
    fn has_data(&self) -> bool;

    /// Identifier of the next request, in production order.
    fn next_request_identifier(&self) -> Option<String>;

    /// Hand over the write buffer for `identifier`.
    fn request_data(&self, identifier: &str) -> Option<WriteBuffer>;

    /// The first byte of `identifier` is about to go on the wire. Delivered
    /// exactly once per buffer.
    fn processing_started(&self, identifier: &str) {
        let _ = identifier;
    }

    /// Every byte of `identifier` has been written.
    fn did_send_request(&self, identifier: &str) {
        let _ = identifier;
    }

    /// `identifier` was abandoned after some of its bytes were written.
    fn did_fail_to_process_request(&self, identifier: &str) {
        let _ = identifier;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fresh_buffer_has_data_and_no_progress() {
        let buffer = WriteBuffer::new("req-1", vec![0; 16]);
        assert_eq!(buffer.offset(), 0);
        assert!(buffer.has_data());
        assert!(!buffer.is_partially_sent());
        assert_eq!(buffer.remaining().len(), 16);
    }

    #[test]
    fn advancing_tracks_partial_progress() {
        let mut buffer = WriteBuffer::new("req-1", vec![0; 16]);
        buffer.advance(10);
        assert_eq!(buffer.offset(), 10);
        assert!(buffer.is_partially_sent());
        assert_eq!(buffer.remaining().len(), 6);

        buffer.advance(6);
        assert_eq!(buffer.offset(), 16);
        assert!(!buffer.has_data());
        assert!(!buffer.is_partially_sent());
    }

    #[test]
    fn offset_never_passes_the_length() {
        let mut buffer = WriteBuffer::new("req-1", vec![0; 4]);
        buffer.advance(100);
        assert_eq!(buffer.offset(), 4);
    }

    #[test]
    fn started_fires_once() {
        let mut buffer = WriteBuffer::new("req-1", vec![0; 4]);
        assert!(buffer.mark_started());
        assert!(!buffer.mark_started());
    }
}
