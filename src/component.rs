//! Defines the Component trait, to be used by each processing stage. This
//! enforces a common interface between stages, so that a pipe can hand the
//! header of its source to a stage once, then feed it frames and forward
//! whatever it produces.

use crate::error::PipelineResult;
use crate::frame::StreamFrame;
use crate::header::StreamHeader;

use std::fmt;
use std::sync::Arc;

///
/// A stateful transform from one stream to another. All structs that
/// perform a processing step (TDOA, consolidation, distance matrix,
/// geometry, embedding, and the composite pipelines built from them) must
/// implement Component, so that they can be run by a
/// [PipeBlock](crate::pipe_block::PipeBlock).
///
pub trait Component: fmt::Display + Send {
    /// Validates the input header and derives the output header.
    fn init(&mut self, in_header: Arc<StreamHeader>) -> PipelineResult<Arc<StreamHeader>>;

    /// Converts one input frame into at most one output frame. `None` means
    /// nothing is forwarded this cycle.
    fn process(&mut self, frame: Arc<StreamFrame>) -> PipelineResult<Option<Arc<StreamFrame>>>;

    /// Cleans up at termination of the pipe. Calling it twice is harmless.
    fn close(&mut self) -> PipelineResult<()>;
}

/// Hands frames through untouched, for exercising pipes.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct PassThrough;

#[cfg(test)]
impl PassThrough {
    /// Instantiates a new PassThrough.
    pub(crate) fn new() -> Self {
        Self
    }
}

#[cfg(test)]
impl Component for PassThrough {
    fn init(&mut self, in_header: Arc<StreamHeader>) -> PipelineResult<Arc<StreamHeader>> {
        Ok(in_header)
    }

    fn process(&mut self, frame: Arc<StreamFrame>) -> PipelineResult<Option<Arc<StreamFrame>>> {
        Ok(Some(frame))
    }

    fn close(&mut self) -> PipelineResult<()> {
        Ok(())
    }
}

#[cfg(test)]
impl fmt::Display for PassThrough {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PassThrough")
    }
}
