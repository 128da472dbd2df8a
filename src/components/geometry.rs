//! Converts a matrix of TDOA estimates (microseconds) into signed distances
//! in metres.

use crate::component::Component;
use crate::error::{PipelineError, PipelineResult};
use crate::frame::{FrameData, StreamFrame};
use crate::header::StreamHeader;

use std::fmt;
use std::sync::Arc;

/// Scales every cell by the speed of sound. The shape and the header of the
/// incoming frame are kept.
pub struct GeometryComponent {
    speed_of_sound: f64,
}

impl GeometryComponent {
    /// `speed_of_sound` is in metres per second.
    pub fn new(speed_of_sound: f64) -> Self {
        Self { speed_of_sound }
    }

    /// Metres travelled by sound in `delta_us` microseconds.
    pub fn metres(&self, delta_us: f64) -> f64 {
        delta_us * 1e-6 * self.speed_of_sound
    }
}

impl Component for GeometryComponent {
    fn init(&mut self, in_header: Arc<StreamHeader>) -> PipelineResult<Arc<StreamHeader>> {
        match in_header.as_geometry() {
            Some(_) => Ok(in_header),
            None => Err(PipelineError::Validation(format!(
                "geometry input {} should be a matrix stream",
                in_header.id
            ))),
        }
    }

    fn process(&mut self, frame: Arc<StreamFrame>) -> PipelineResult<Option<Arc<StreamFrame>>> {
        let deltas = frame.as_geometry().ok_or_else(|| {
            PipelineError::Validation("geometry input should be a matrix frame".to_string())
        })?;
        let header = frame.header().ok_or_else(|| {
            PipelineError::Validation("matrix frame outlived its header".to_string())
        })?;
        let metres = deltas.map(|d| self.metres(d));
        Ok(Some(header.make_frame_with_seq(
            frame.seq_num,
            FrameData::Geometry(metres),
        )))
    }

    fn close(&mut self) -> PipelineResult<()> {
        Ok(())
    }
}

impl fmt::Display for GeometryComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GeometryComponent({} m/s)", self.speed_of_sound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;

    #[test]
    fn microseconds_become_metres() {
        let header = StreamHeader::geometry(vec!["a".into(), "b".into()], 0, 100, 2, 2);
        let mut comp = GeometryComponent::new(343.0);
        assert!(Arc::ptr_eq(&comp.init(header.clone()).unwrap(), &header));

        let deltas = DMatrix::from_row_slice(2, 2, &[0.0, 1000.0, -1000.0, 0.0]);
        let frame = header.make_frame_with_seq(4, FrameData::Geometry(deltas));
        let out = comp.process(frame).unwrap().unwrap();
        let m = out.as_geometry().unwrap();
        assert!((m[(0, 1)] - 0.343).abs() < 1e-12);
        assert!((m[(1, 0)] + 0.343).abs() < 1e-12);
        assert_eq!(m[(0, 0)], 0.0);
        assert_eq!(out.seq_num, 4);
        assert!(Arc::ptr_eq(&out.header().unwrap(), &header));
    }

    #[test]
    fn rejects_other_streams() {
        let mut comp = GeometryComponent::new(343.0);
        assert!(matches!(
            comp.init(StreamHeader::impulse("a", 0, 100)),
            Err(PipelineError::Validation(_))
        ));
    }
}
