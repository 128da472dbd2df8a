//! The capability every stream offers, whether it is backed by a file, a
//! buffer, a simulation or other streams.
//!
//! Streams are shared between pipe threads behind an `Arc`, so every
//! operation takes `&self` and implementations guard their own state.

use crate::error::PipelineResult;
use crate::frame::StreamFrame;
use crate::header::StreamHeader;

use std::sync::Arc;

/// A shared handle to any stream.
pub type SharedStream = Arc<dyn FrameStream>;

/// A typed stream of frames preceded by one header.
pub trait FrameStream: Send + Sync {
    /// A short name for logs.
    fn id(&self) -> &str;

    /// Blocks until the header is known or the stream is closed. Returns the
    /// same header on every call, and `None` once closed with nothing left
    /// to read.
    fn get_header(&self) -> PipelineResult<Option<Arc<StreamHeader>>>;

    /// Announces the header. Point-to-point streams accept this once and
    /// fail with `ProtocolViolation` afterwards.
    fn set_header(&self, header: Arc<StreamHeader>) -> PipelineResult<()>;

    /// Hands over one frame without blocking the caller.
    fn send_frame(&self, frame: Arc<StreamFrame>) -> PipelineResult<()>;

    /// Takes one frame, `None` at end of stream.
    fn recv_frame(&self) -> PipelineResult<Option<Arc<StreamFrame>>>;

    /// Releases anyone waiting on the stream. Calling it again does nothing.
    fn close(&self);
}

/// A producer's handle on a stream fed by several pipes. Everything is
/// forwarded except `close`: the stream's owner ends it, not each of its
/// producers.
pub struct Detached {
    inner: SharedStream,
}

impl Detached {
    /// Wraps `inner`.
    pub fn new(inner: SharedStream) -> Arc<Self> {
        Arc::new(Self { inner })
    }
}

impl FrameStream for Detached {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn get_header(&self) -> PipelineResult<Option<Arc<StreamHeader>>> {
        self.inner.get_header()
    }

    fn set_header(&self, header: Arc<StreamHeader>) -> PipelineResult<()> {
        self.inner.set_header(header)
    }

    fn send_frame(&self, frame: Arc<StreamFrame>) -> PipelineResult<()> {
        self.inner.send_frame(frame)
    }

    fn recv_frame(&self) -> PipelineResult<Option<Arc<StreamFrame>>> {
        self.inner.recv_frame()
    }

    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_stream::BufferStream;
    use crate::frame::FrameData;

    #[test]
    fn detached_handle_does_not_close_its_stream() {
        let buffer = Arc::new(BufferStream::new("sink"));
        let handle = Detached::new(buffer.clone());
        assert_eq!(handle.id(), "sink");

        let header = StreamHeader::plain("a", 0, 100);
        handle.set_header(header.clone()).unwrap();
        handle.send_frame(header.make_frame(FrameData::Empty)).unwrap();
        handle.close();

        assert!(!buffer.is_closed());
        assert_eq!(buffer.pending(), 1);
        assert!(handle.recv_frame().unwrap().is_some());
    }
}
