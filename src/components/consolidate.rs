//! Temporal consolidation of a distance stream.
//!
//! For an event anywhere in the room, the TDOA between two devices is at
//! most their separation over the speed of sound, and reaches it when the
//! event happens at either device. Keeping the matches of the last few
//! frames and ranking them by absolute delta makes the first delta of each
//! output frame track that envelope.

use crate::component::Component;
use crate::error::{PipelineError, PipelineResult};
use crate::frame::{DistanceData, FrameData, StreamFrame};
use crate::header::StreamHeader;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Sliding-window consolidation of distance frames.
pub struct ConsolidateComponent {
    window: usize,
    recent: VecDeque<DistanceData>,
    header: Option<Arc<StreamHeader>>,
}

impl ConsolidateComponent {
    /// Keeps the matches of the last `window` frames (at least one).
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            recent: VecDeque::new(),
            header: None,
        }
    }

    /// Adds one frame's matches and returns the consolidated set.
    pub fn consolidate(&mut self, matches: DistanceData) -> DistanceData {
        self.recent.push_back(matches);
        while self.recent.len() > self.window {
            self.recent.pop_front();
        }

        let mut all: Vec<(f64, f64)> = self
            .recent
            .iter()
            .flat_map(|d| {
                d.peak_deltas
                    .iter()
                    .copied()
                    .zip(d.peak_magnitudes.iter().copied())
            })
            .collect();
        all.sort_by(|l, r| r.0.abs().total_cmp(&l.0.abs()));

        DistanceData {
            peak_deltas: all.iter().map(|m| m.0).collect(),
            peak_magnitudes: all.iter().map(|m| m.1).collect(),
        }
    }
}

impl Component for ConsolidateComponent {
    fn init(&mut self, in_header: Arc<StreamHeader>) -> PipelineResult<Arc<StreamHeader>> {
        if in_header.as_distance().is_none() {
            return Err(PipelineError::Validation(format!(
                "consolidation input {} should be a distance header",
                in_header.id
            )));
        }
        self.recent.clear();
        self.header = Some(Arc::clone(&in_header));
        Ok(in_header)
    }

    fn process(&mut self, frame: Arc<StreamFrame>) -> PipelineResult<Option<Arc<StreamFrame>>> {
        let header = self.header.clone().ok_or_else(|| {
            PipelineError::Validation("consolidation used before init".to_string())
        })?;
        let matches = frame.as_distance().cloned().ok_or_else(|| {
            PipelineError::Validation("consolidation input should be a distance frame".to_string())
        })?;
        let merged = self.consolidate(matches);
        Ok(Some(header.make_frame_with_seq(
            frame.seq_num,
            FrameData::Distance(merged),
        )))
    }

    fn close(&mut self) -> PipelineResult<()> {
        self.recent.clear();
        Ok(())
    }
}

impl fmt::Display for ConsolidateComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConsolidateComponent({})", self.window)
    }
}
