//! Assembles the per-pair consolidated deltas of one aggregate cycle into a
//! device by device matrix.

use crate::component::Component;
use crate::error::{PipelineError, PipelineResult};
use crate::frame::{FrameData, StreamFrame};
use crate::header::{HeaderKey, StreamHeader};

use nalgebra::DMatrix;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Solves `pairs = n(n-1)/2` for an integer `n`.
pub fn devices_for_pairs(pairs: usize) -> Option<usize> {
    let mut n = 1;
    while n * (n - 1) / 2 < pairs {
        n += 1;
    }
    (n * (n - 1) / 2 == pairs).then_some(n)
}

/// Where each pair lands in the matrix.
struct Layout {
    devices: Vec<String>,
    cells: Vec<(HeaderKey, usize, usize)>,
    header: Arc<StreamHeader>,
}

/// Builds an antisymmetric matrix of TDOA estimates, microseconds.
///
/// Cell `(i, j)` holds `offset(i) - offset(j)` as estimated by the first
/// delta of the pair's latest non-empty frame; pairs that have not reported
/// yet read 0. Devices are numbered in the order they first appear among
/// the pair headers. The aggregate header may gain children while the pipe
/// runs; the layout and the output header follow.
pub struct DistanceMatrixComponent {
    in_header: Option<Arc<StreamHeader>>,
    layout: Option<Layout>,
    last_known: HashMap<HeaderKey, f64>,
}

impl DistanceMatrixComponent {
    /// Instantiates a new, uninitialised component.
    pub fn new() -> Self {
        Self {
            in_header: None,
            layout: None,
            last_known: HashMap::new(),
        }
    }

    /// Device ids in matrix order, as of the last layout.
    pub fn device_ids(&self) -> Vec<String> {
        self.layout
            .as_ref()
            .map(|l| l.devices.clone())
            .unwrap_or_default()
    }

    fn build_layout(in_header: &StreamHeader) -> PipelineResult<Layout> {
        let children = in_header
            .as_multi()
            .ok_or_else(|| {
                PipelineError::Validation(format!(
                    "distance matrix input {} should be an aggregate",
                    in_header.id
                ))
            })?
            .children();

        fn index_of(id: &str, devices: &mut Vec<String>) -> usize {
            match devices.iter().position(|d| d == id) {
                Some(i) => i,
                None => {
                    devices.push(id.to_string());
                    devices.len() - 1
                }
            }
        }

        let mut devices: Vec<String> = Vec::new();
        let mut cells = Vec::with_capacity(children.len());
        for child in &children {
            let pair = child.as_distance().ok_or_else(|| {
                PipelineError::Validation(format!("{} is not a distance stream", child.id))
            })?;
            let i = index_of(&pair.device_ids[0], &mut devices);
            let j = index_of(&pair.device_ids[1], &mut devices);
            if i == j {
                return Err(PipelineError::Configuration(format!(
                    "pair {} relates {} to itself",
                    child.id, pair.device_ids[0]
                )));
            }
            cells.push((HeaderKey::of(child), i, j));
        }

        let n = devices.len();
        let header = StreamHeader::geometry(
            devices.clone(),
            in_header.start_time,
            in_header.frame_time,
            n,
            n,
        );
        Ok(Layout {
            devices,
            cells,
            header,
        })
    }

    fn refresh_layout(&mut self) -> PipelineResult<()> {
        let in_header = self.in_header.clone().ok_or_else(|| {
            PipelineError::Validation("distance matrix used before init".to_string())
        })?;
        let pairs = in_header.as_multi().map_or(0, |m| m.len());
        let stale = self.layout.as_ref().map_or(true, |l| l.cells.len() != pairs);
        if stale {
            self.layout = Some(Self::build_layout(&in_header)?);
        }
        Ok(())
    }
}

impl Default for DistanceMatrixComponent {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for DistanceMatrixComponent {
    fn init(&mut self, in_header: Arc<StreamHeader>) -> PipelineResult<Arc<StreamHeader>> {
        let layout = Self::build_layout(&in_header)?;
        let header = Arc::clone(&layout.header);
        self.layout = Some(layout);
        self.in_header = Some(in_header);
        self.last_known.clear();
        Ok(header)
    }

    fn process(&mut self, frame: Arc<StreamFrame>) -> PipelineResult<Option<Arc<StreamFrame>>> {
        let multi = frame.as_multi().ok_or_else(|| {
            PipelineError::Validation("distance matrix input should be an aggregate frame".into())
        })?;
        for (child, slot) in multi.iter() {
            let first = slot
                .and_then(|f| f.as_distance())
                .and_then(|d| d.peak_deltas.first().copied());
            if let Some(delta) = first {
                self.last_known.insert(HeaderKey::of(child), delta);
            }
        }

        let seq_num = frame.seq_num;
        self.refresh_layout()?;
        let layout = self.layout.as_ref().ok_or_else(|| {
            PipelineError::Validation("distance matrix has no layout".to_string())
        })?;
        let pairs = layout.cells.len();
        let n = layout.devices.len();
        if devices_for_pairs(pairs) != Some(n) {
            return Err(PipelineError::Configuration(format!(
                "{} pairs do not cover {} devices pairwise",
                pairs, n
            )));
        }

        let mut matrix = DMatrix::<f64>::zeros(n, n);
        for &(key, i, j) in &layout.cells {
            let delta = self.last_known.get(&key).copied().unwrap_or(0.0);
            matrix[(i, j)] = delta;
            matrix[(j, i)] = -delta;
        }
        Ok(Some(layout.header.make_frame_with_seq(
            seq_num,
            FrameData::Geometry(matrix),
        )))
    }

    fn close(&mut self) -> PipelineResult<()> {
        self.last_known.clear();
        Ok(())
    }
}

impl fmt::Display for DistanceMatrixComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DistanceMatrixComponent[{}]", self.device_ids().join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{DistanceData, MultiFrame};

    fn pair(a: &str, b: &str) -> Arc<StreamHeader> {
        StreamHeader::distance(
            format!("{}+{}", a, b),
            0,
            100,
            [a.to_string(), b.to_string()],
            29_000,
        )
    }

    fn aggregate(pairs: &[Arc<StreamHeader>]) -> Arc<StreamHeader> {
        let all = StreamHeader::multi("all", Arc::clone(&pairs[0]));
        for p in &pairs[1..] {
            all.as_multi().unwrap().add(Arc::clone(p)).unwrap();
        }
        all
    }

    fn cycle(
        all: &Arc<StreamHeader>,
        deltas: &[(&Arc<StreamHeader>, Vec<f64>)],
    ) -> Arc<StreamFrame> {
        let mut multi = MultiFrame::empty(all.as_multi().unwrap().children());
        for (h, d) in deltas {
            let data = DistanceData {
                peak_deltas: d.clone(),
                peak_magnitudes: vec![1.0; d.len()],
            };
            assert!(multi.set_frame(h.make_frame(FrameData::Distance(data))));
        }
        all.make_frame(FrameData::Multi(multi))
    }

    #[test]
    fn device_count_from_pairs() {
        assert_eq!(devices_for_pairs(1), Some(2));
        assert_eq!(devices_for_pairs(3), Some(3));
        assert_eq!(devices_for_pairs(6), Some(4));
        assert_eq!(devices_for_pairs(10), Some(5));
        assert_eq!(devices_for_pairs(2), None);
        assert_eq!(devices_for_pairs(4), None);
        assert_eq!(devices_for_pairs(0), Some(1));
    }

    #[test]
    fn three_pairs_make_three_devices() {
        let (ab, ac, bc) = (pair("a", "b"), pair("a", "c"), pair("b", "c"));
        let all = aggregate(&[ab.clone(), ac.clone(), bc.clone()]);
        let mut comp = DistanceMatrixComponent::new();
        let header = comp.init(all.clone()).unwrap();
        let shape = header.as_geometry().unwrap();
        assert_eq!(shape.device_ids, vec!["a", "b", "c"]);
        assert_eq!((shape.rows, shape.cols), (3, 3));

        let frame = cycle(
            &all,
            &[(&ab, vec![10.0, 3.0]), (&ac, vec![-20.0]), (&bc, vec![5.0])],
        );
        let out = comp.process(frame).unwrap().unwrap();
        let m = out.as_geometry().unwrap();
        assert_eq!(m[(0, 1)], 10.0);
        assert_eq!(m[(0, 2)], -20.0);
        assert_eq!(m[(1, 2)], 5.0);
        for i in 0..3 {
            assert_eq!(m[(i, i)], 0.0);
            for j in 0..3 {
                assert_eq!(m[(i, j)], -m[(j, i)]);
            }
        }
    }

    #[test]
    fn four_pairs_are_a_configuration_error() {
        let pairs = [pair("a", "b"), pair("a", "c"), pair("b", "c"), pair("a", "d")];
        let all = aggregate(&pairs);
        let mut comp = DistanceMatrixComponent::new();
        comp.init(all.clone()).unwrap();
        let result = comp.process(cycle(&all, &[(&pairs[0], vec![1.0])]));
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn missing_pairs_keep_last_known_delta() {
        let (ab, ac, bc) = (pair("a", "b"), pair("a", "c"), pair("b", "c"));
        let all = aggregate(&[ab.clone(), ac.clone(), bc.clone()]);
        let mut comp = DistanceMatrixComponent::new();
        comp.init(all.clone()).unwrap();

        let first = comp
            .process(cycle(&all, &[(&ab, vec![7.0]), (&bc, vec![])]))
            .unwrap()
            .unwrap();
        let m = first.as_geometry().unwrap();
        assert_eq!(m[(0, 1)], 7.0);
        assert_eq!(m[(0, 2)], 0.0);
        assert_eq!(m[(1, 2)], 0.0);

        let second = comp.process(cycle(&all, &[(&ac, vec![4.0])])).unwrap().unwrap();
        let m = second.as_geometry().unwrap();
        assert_eq!(m[(0, 1)], 7.0);
        assert_eq!(m[(0, 2)], 4.0);
        assert_eq!(m[(2, 0)], -4.0);
    }

    #[test]
    fn header_follows_topology_growth() {
        let (ab, ac, bc) = (pair("a", "b"), pair("a", "c"), pair("b", "c"));
        let all = aggregate(&[ab.clone()]);
        let mut comp = DistanceMatrixComponent::new();
        let first_header = comp.init(all.clone()).unwrap();
        assert_eq!(first_header.as_geometry().unwrap().rows, 2);

        let out = comp.process(cycle(&all, &[(&ab, vec![2.0])])).unwrap().unwrap();
        assert!(Arc::ptr_eq(&out.header().unwrap(), &first_header));

        all.as_multi().unwrap().add(ac.clone()).unwrap();
        let result = comp.process(cycle(&all, &[(&ac, vec![1.0])]));
        assert!(matches!(result, Err(PipelineError::Configuration(_))));

        all.as_multi().unwrap().add(bc.clone()).unwrap();
        let out = comp.process(cycle(&all, &[(&bc, vec![3.0])])).unwrap().unwrap();
        let grown = out.header().unwrap();
        assert!(!Arc::ptr_eq(&grown, &first_header));
        assert_eq!(grown.id, "a,b,c");
        let m = out.as_geometry().unwrap();
        assert_eq!(m.shape(), (3, 3));
        assert_eq!(m[(0, 1)], 2.0);
        assert_eq!(m[(0, 2)], 1.0);
        assert_eq!(m[(1, 2)], 3.0);
    }

    #[test]
    fn rejects_non_distance_children() {
        let all = StreamHeader::multi("all", StreamHeader::impulse("a", 0, 100));
        let mut comp = DistanceMatrixComponent::new();
        assert!(matches!(
            comp.init(all),
            Err(PipelineError::Validation(_))
        ));
        assert!(matches!(
            comp.init(pair("a", "b")),
            Err(PipelineError::Validation(_))
        ));
    }
}
