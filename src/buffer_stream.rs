//! An in-memory point-to-point stream. Used as the sink at the end of the
//! merge pipe and as a hand-fed source.

use crate::error::{PipelineError, PipelineResult};
use crate::frame::StreamFrame;
use crate::header::StreamHeader;
use crate::stream::FrameStream;

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct BufferState {
    header: Option<Arc<StreamHeader>>,
    frames: VecDeque<Arc<StreamFrame>>,
    open: bool,
}

/// A single-producer, single-consumer stream that buffers without bound.
/// Frames queued before `close` can still be read afterwards.
pub struct BufferStream {
    id: String,
    state: Mutex<BufferState>,
    changed: Condvar,
}

impl BufferStream {
    /// An open, empty stream.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(BufferState {
                open: true,
                ..Default::default()
            }),
            changed: Condvar::new(),
        }
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        !self.lock().open
    }

    /// The header if it has already been set, without waiting.
    pub fn peek_header(&self) -> Option<Arc<StreamHeader>> {
        self.lock().header.clone()
    }

    /// Number of frames waiting to be read.
    pub fn pending(&self) -> usize {
        self.lock().frames.len()
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FrameStream for BufferStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn get_header(&self) -> PipelineResult<Option<Arc<StreamHeader>>> {
        let mut state = self.lock();
        while state.header.is_none() && state.open {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        // a closed stream keeps its header until the queue is drained
        if !state.open && state.frames.is_empty() {
            return Ok(None);
        }
        Ok(state.header.clone())
    }

    fn set_header(&self, header: Arc<StreamHeader>) -> PipelineResult<()> {
        let mut state = self.lock();
        if !state.open {
            return Err(PipelineError::ClosedPipeline);
        }
        if state.header.is_some() {
            return Err(PipelineError::ProtocolViolation(format!(
                "header of {} set twice",
                self.id
            )));
        }
        state.header = Some(header);
        self.changed.notify_all();
        Ok(())
    }

    fn send_frame(&self, frame: Arc<StreamFrame>) -> PipelineResult<()> {
        let mut state = self.lock();
        // frames sent after close are dropped
        if state.open {
            state.frames.push_back(frame);
            self.changed.notify_all();
        }
        Ok(())
    }

    fn recv_frame(&self) -> PipelineResult<Option<Arc<StreamFrame>>> {
        let mut state = self.lock();
        loop {
            if let Some(frame) = state.frames.pop_front() {
                return Ok(Some(frame));
            }
            if !state.open {
                return Ok(None);
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn close(&self) {
        let mut state = self.lock();
        state.open = false;
        self.changed.notify_all();
    }
}
