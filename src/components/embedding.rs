//! Embeds a distance matrix into coordinates with classical scaling.

use crate::component::Component;
use crate::error::{PipelineError, PipelineResult};
use crate::frame::{FrameData, StreamFrame};
use crate::header::{HeaderKey, StreamHeader};
use crate::localizer::classical_scaling;

use std::fmt;
use std::sync::Arc;

/// Turns an `N x N` distance frame into an `N x dimensions` coordinate
/// frame. A new output header is minted whenever the input frames start
/// carrying a different header, i.e. when devices join.
pub struct EmbeddingComponent {
    dimensions: usize,
    current: Option<(HeaderKey, Arc<StreamHeader>)>,
}

impl EmbeddingComponent {
    /// Instantiates a new EmbeddingComponent.
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            current: None,
        }
    }

    fn output_for(&mut self, in_header: &Arc<StreamHeader>) -> PipelineResult<Arc<StreamHeader>> {
        let key = HeaderKey::of(in_header);
        if let Some((k, out)) = &self.current {
            if *k == key {
                return Ok(Arc::clone(out));
            }
        }
        let shape = in_header.as_geometry().ok_or_else(|| {
            PipelineError::Validation(format!(
                "embedding input {} should be a matrix stream",
                in_header.id
            ))
        })?;
        if shape.rows != shape.cols {
            return Err(PipelineError::Validation(format!(
                "embedding input {} is {}x{}, not square",
                in_header.id, shape.rows, shape.cols
            )));
        }
        let out = StreamHeader::geometry(
            shape.device_ids.clone(),
            in_header.start_time,
            in_header.frame_time,
            shape.rows,
            self.dimensions,
        );
        self.current = Some((key, Arc::clone(&out)));
        Ok(out)
    }
}

impl Component for EmbeddingComponent {
    fn init(&mut self, in_header: Arc<StreamHeader>) -> PipelineResult<Arc<StreamHeader>> {
        self.current = None;
        self.output_for(&in_header)
    }

    fn process(&mut self, frame: Arc<StreamFrame>) -> PipelineResult<Option<Arc<StreamFrame>>> {
        let distances = frame.as_geometry().ok_or_else(|| {
            PipelineError::Validation("embedding input should be a matrix frame".to_string())
        })?;
        let in_header = frame.header().ok_or_else(|| {
            PipelineError::Validation("matrix frame outlived its header".to_string())
        })?;
        let out = self.output_for(&in_header)?;
        let coords = classical_scaling(distances, self.dimensions);
        Ok(Some(out.make_frame_with_seq(
            frame.seq_num,
            FrameData::Geometry(coords),
        )))
    }

    fn close(&mut self) -> PipelineResult<()> {
        self.current = None;
        Ok(())
    }
}

impl fmt::Display for EmbeddingComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EmbeddingComponent({}d)", self.dimensions)
    }
}
