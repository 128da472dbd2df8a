//! Time difference of arrival between two devices.
//!
//! Peaks of the same acoustic event reach two devices at most
//! `max_plausible_distance` apart (by default 29 ms, sound over roughly
//! ten metres). Peaks are paired one-to-one, tightest pairs first.

use crate::component::Component;
use crate::error::{PipelineError, PipelineResult};
use crate::frame::{DistanceData, FrameData, ImpulseData, StreamFrame};
use crate::header::StreamHeader;

use std::fmt;
use std::sync::Arc;

/// Default bound on `|offset_a - offset_b|`, microseconds.
pub const DEFAULT_MAX_PLAUSIBLE_DISTANCE_US: i64 = 29 * 1000;

/// A candidate pairing of peak `a` with peak `b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Candidate {
    a: usize,
    b: usize,
    distance: i64,
}

/// Matches the peaks of two time-aligned impulse frames.
///
/// Returns `(deltas, magnitudes)`, index aligned and ordered by ascending
/// absolute delta. Candidates with equal absolute delta are committed in
/// the order the merge scan found them. A peak without a magnitude counts
/// as silent; [TdoaComponent] rejects such frames before they get here.
pub fn correlate(a: &ImpulseData, b: &ImpulseData, max_plausible_distance: i64) -> DistanceData {
    let offsets_a = &a.peak_offsets;
    let offsets_b = &b.peak_offsets;
    if offsets_a.is_empty() || offsets_b.is_empty() {
        return DistanceData::default();
    }

    let mut candidates = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < offsets_a.len() && j < offsets_b.len() {
        let higher = offsets_a[i].max(offsets_b[j]);

        // skip peaks that still sit below the other list's current peak
        while i + 1 < offsets_a.len() && offsets_a[i + 1] < higher {
            i += 1;
        }
        while j + 1 < offsets_b.len() && offsets_b[j + 1] < higher {
            j += 1;
        }

        let distance = (offsets_a[i] - offsets_b[j]).abs();
        if distance < max_plausible_distance {
            candidates.push(Candidate { a: i, b: j, distance });
        }

        if offsets_a[i] > offsets_b[j] {
            j += 1;
        } else {
            i += 1;
        }
    }

    // stable, so equal distances keep scan order
    candidates.sort_by_key(|c| c.distance);

    let mut used_a = vec![false; offsets_a.len()];
    let mut used_b = vec![false; offsets_b.len()];
    let mut matches = DistanceData::default();
    for c in candidates {
        if used_a[c.a] || used_b[c.b] {
            continue;
        }
        used_a[c.a] = true;
        used_b[c.b] = true;
        matches
            .peak_deltas
            .push((offsets_a[c.a] - offsets_b[c.b]) as f64);
        let magnitude = |d: &ImpulseData, i: usize| d.peak_magnitudes.get(i).copied().unwrap_or(0.0);
        matches
            .peak_magnitudes
            .push(magnitude(a, c.a) * magnitude(b, c.b));
    }
    matches
}

/// Turns an aggregate of two impulse streams into a distance stream.
pub struct TdoaComponent {
    max_plausible_distance: i64,
    header: Option<Arc<StreamHeader>>,
}

impl TdoaComponent {
    /// Instantiates a new TdoaComponent with the given bound in microseconds.
    pub fn new(max_plausible_distance: i64) -> Self {
        Self {
            max_plausible_distance,
            header: None,
        }
    }

    /// Correlates the two slots of an aggregate frame. An empty slot counts
    /// as a frame without peaks.
    pub fn correlate_frame(&self, frame: &StreamFrame) -> PipelineResult<DistanceData> {
        let multi = frame.as_multi().ok_or_else(|| {
            PipelineError::Validation("TDOA input should be an aggregate frame".to_string())
        })?;
        if multi.len() != 2 {
            return Err(PipelineError::Validation(format!(
                "TDOA input should contain two elements, got {}",
                multi.len()
            )));
        }

        let empty = ImpulseData::default();
        let mut sides = [&empty, &empty];
        for (side, slot) in sides.iter_mut().zip(0..2) {
            if let Some(f) = multi.slot(slot) {
                let peaks = f.as_impulse().ok_or_else(|| {
                    PipelineError::Validation(
                        "TDOA input should contain impulse frames".to_string(),
                    )
                })?;
                if peaks.peak_offsets.len() != peaks.peak_magnitudes.len() {
                    return Err(PipelineError::Validation(format!(
                        "impulse frame {} has {} offsets but {} magnitudes",
                        f.seq_num,
                        peaks.peak_offsets.len(),
                        peaks.peak_magnitudes.len()
                    )));
                }
                *side = peaks;
            }
        }
        Ok(correlate(sides[0], sides[1], self.max_plausible_distance))
    }
}

impl Default for TdoaComponent {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PLAUSIBLE_DISTANCE_US)
    }
}

impl Component for TdoaComponent {
    fn init(&mut self, in_header: Arc<StreamHeader>) -> PipelineResult<Arc<StreamHeader>> {
        let multi = in_header.as_multi().ok_or_else(|| {
            PipelineError::Validation("TDOA input should be an aggregate header".to_string())
        })?;
        let children = multi.children();
        if children.len() != 2 {
            return Err(PipelineError::Validation(format!(
                "TDOA input should contain two elements, got {}",
                children.len()
            )));
        }
        if !children.iter().all(|h| h.is_impulse()) {
            return Err(PipelineError::Validation(
                "TDOA input should contain impulse headers".to_string(),
            ));
        }
        if children[0].frame_time != children[1].frame_time {
            return Err(PipelineError::Validation(
                "frame duration must be equal for both inputs".to_string(),
            ));
        }

        let header = StreamHeader::distance(
            in_header.id.clone(),
            children[0].start_time,
            children[0].frame_time,
            [children[0].id.clone(), children[1].id.clone()],
            self.max_plausible_distance,
        );
        self.header = Some(Arc::clone(&header));
        Ok(header)
    }

    fn process(&mut self, frame: Arc<StreamFrame>) -> PipelineResult<Option<Arc<StreamFrame>>> {
        let header = self.header.as_ref().ok_or_else(|| {
            PipelineError::Validation("TDOA used before init".to_string())
        })?;
        let matches = self.correlate_frame(&frame)?;
        Ok(Some(
            header.make_frame_with_seq(frame.seq_num, FrameData::Distance(matches)),
        ))
    }

    fn close(&mut self) -> PipelineResult<()> {
        Ok(())
    }
}

impl fmt::Display for TdoaComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TdoaComponent")
    }
}
