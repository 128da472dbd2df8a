//! The three kinds of pipe the topology runs, each a chain of smaller
//! components behind one [Component]:
//!
//! - [SinglePipeline], one per device: raw audio to impulses
//! - [DualPipeline], one per device pair: alignment, TDOA, consolidation
//! - [MergePipeline], one overall: distance matrix, metres, coordinates

use crate::component::Component;
use crate::components::consolidate::ConsolidateComponent;
use crate::components::distance_matrix::DistanceMatrixComponent;
use crate::components::embedding::EmbeddingComponent;
use crate::components::geometry::GeometryComponent;
use crate::components::impulse::ImpulseComponent;
use crate::components::tdoa::TdoaComponent;
use crate::config::{ImpulseConfig, LocalizerConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::frame::{FrameData, MultiFrame, StreamFrame};
use crate::header::StreamHeader;
use crate::stream::FrameStream;
use crate::text_stream::TextFileStream;

use log::{debug, warn};
use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Per-device pre-processing. Raw audio goes through impulse detection;
/// a source that already delivers impulses is passed through untouched.
pub struct SinglePipeline {
    impulse: ImpulseComponent,
    detect: bool,
}

impl SinglePipeline {
    /// Instantiates a new SinglePipeline.
    pub fn new(config: ImpulseConfig) -> Self {
        Self {
            impulse: ImpulseComponent::new(config),
            detect: false,
        }
    }
}

impl Component for SinglePipeline {
    fn init(&mut self, in_header: Arc<StreamHeader>) -> PipelineResult<Arc<StreamHeader>> {
        if in_header.as_raw_audio().is_some() {
            self.detect = true;
            return self.impulse.init(in_header);
        }
        if in_header.is_impulse() {
            self.detect = false;
            return Ok(in_header);
        }
        Err(PipelineError::Validation(format!(
            "device stream {} should carry raw audio or impulses",
            in_header.id
        )))
    }

    fn process(&mut self, frame: Arc<StreamFrame>) -> PipelineResult<Option<Arc<StreamFrame>>> {
        if self.detect {
            return self.impulse.process(frame);
        }
        match frame.as_impulse() {
            Some(_) => Ok(Some(frame)),
            None => Err(PipelineError::Validation(
                "device stream should carry impulse frames".to_string(),
            )),
        }
    }

    fn close(&mut self) -> PipelineResult<()> {
        self.impulse.close()
    }
}

impl fmt::Display for SinglePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detect {
            write!(f, "SinglePipeline({})", self.impulse)
        } else {
            write!(f, "SinglePipeline(pass)")
        }
    }
}

/// Pairs up the frames of two device streams that cover the same time
/// window. The combining stream only promises that at least one side is
/// present per cycle; this restores lockstep.
pub struct FrameAligner {
    limit: usize,
    sides: [VecDeque<Arc<StreamFrame>>; 2],
    children: Vec<Arc<StreamHeader>>,
}

impl FrameAligner {
    /// Keeps at most `limit` frames waiting per side.
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            sides: [VecDeque::new(), VecDeque::new()],
            children: Vec::new(),
        }
    }

    /// Sets the two device headers, in slot order.
    pub fn init(&mut self, children: Vec<Arc<StreamHeader>>) -> PipelineResult<()> {
        if children.len() != 2 {
            return Err(PipelineError::Validation(format!(
                "a pair has two devices, not {}",
                children.len()
            )));
        }
        self.sides = [VecDeque::new(), VecDeque::new()];
        self.children = children;
        Ok(())
    }

    /// Queues whatever the cycle brought for each side.
    pub fn push(&mut self, cycle: &MultiFrame) {
        for (index, side) in self.sides.iter_mut().enumerate() {
            if let Some(frame) = cycle.slot(index) {
                side.push_back(Arc::clone(frame));
                if side.len() > self.limit {
                    side.pop_front();
                    debug!("aligner backlog over {} frames, dropping oldest", self.limit);
                }
            }
        }
    }

    fn window_start(&self, index: usize, frame: &StreamFrame) -> u64 {
        self.children[index].window_start_ms(frame.seq_num)
    }

    /// The oldest pair of frames whose windows start less than half a frame
    /// apart. Unpartnered frames older than the other side's front are
    /// dropped on the way.
    pub fn next_pair(&mut self) -> Option<(Arc<StreamFrame>, Arc<StreamFrame>)> {
        let frame_time = self.children.first()?.frame_time;
        loop {
            let a = self.sides[0].front()?;
            let b = self.sides[1].front()?;
            let ta = self.window_start(0, a);
            let tb = self.window_start(1, b);
            if ta.abs_diff(tb) * 2 < frame_time {
                let a = self.sides[0].pop_front()?;
                let b = self.sides[1].pop_front()?;
                return Some((a, b));
            }
            let older = if ta < tb { 0 } else { 1 };
            debug!(
                "dropping unaligned frame of {} at {} ms",
                self.children[older].id,
                ta.min(tb)
            );
            self.sides[older].pop_front();
        }
    }

    /// Frames waiting on either side.
    pub fn backlog(&self) -> usize {
        self.sides[0].len() + self.sides[1].len()
    }
}

fn trace_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{}.txt", id))
}

fn open_trace(dir: &Option<PathBuf>, id: &str) -> PipelineResult<Option<TextFileStream>> {
    match dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            Ok(Some(TextFileStream::create(id, trace_path(dir, id))?))
        }
        None => Ok(None),
    }
}

fn write_trace(trace: &Option<TextFileStream>, frame: &Arc<StreamFrame>) {
    if let Some(trace) = trace {
        if let Err(err) = trace.send_frame(Arc::clone(frame)) {
            warn!("{} : trace write failed : {}.", trace.id(), err);
        }
    }
}

/// Per-pair processing: aligns the two device streams, correlates their
/// impulses and consolidates the matches over time.
pub struct DualPipeline {
    aligner: FrameAligner,
    tdoa: TdoaComponent,
    consolidate: ConsolidateComponent,
    trace_dir: Option<PathBuf>,
    trace: Option<TextFileStream>,
    in_header: Option<Arc<StreamHeader>>,
}

impl DualPipeline {
    /// Instantiates a new DualPipeline.
    pub fn new(config: &LocalizerConfig) -> Self {
        Self {
            aligner: FrameAligner::new(config.align_queue_limit),
            tdoa: TdoaComponent::new(config.max_plausible_distance_us),
            consolidate: ConsolidateComponent::new(config.consolidation_window),
            trace_dir: config.trace_dir.clone(),
            trace: None,
            in_header: None,
        }
    }
}

impl Component for DualPipeline {
    fn init(&mut self, in_header: Arc<StreamHeader>) -> PipelineResult<Arc<StreamHeader>> {
        let children = in_header
            .as_multi()
            .ok_or_else(|| {
                PipelineError::Validation("pair input should be an aggregate".to_string())
            })?
            .children();
        if !children.iter().all(|h| h.is_impulse()) {
            return Err(PipelineError::Validation(
                "pair input should contain impulse headers".to_string(),
            ));
        }
        self.aligner.init(children)?;

        let header = self.tdoa.init(Arc::clone(&in_header))?;
        let header = self.consolidate.init(header)?;
        if header.as_distance().is_none() {
            return Err(PipelineError::Validation(
                "pair output should be a distance stream".to_string(),
            ));
        }

        self.trace = open_trace(&self.trace_dir, &in_header.id)?;
        if let Some(trace) = &self.trace {
            trace.set_header(Arc::clone(&header))?;
        }
        self.in_header = Some(in_header);
        Ok(header)
    }

    fn process(&mut self, frame: Arc<StreamFrame>) -> PipelineResult<Option<Arc<StreamFrame>>> {
        let in_header = self.in_header.clone().ok_or_else(|| {
            PipelineError::Validation("pair pipeline used before init".to_string())
        })?;
        let cycle = frame.as_multi().ok_or_else(|| {
            PipelineError::Validation("pair input should be an aggregate frame".to_string())
        })?;
        self.aligner.push(cycle);

        let Some((a, b)) = self.aligner.next_pair() else {
            debug!(
                "{} : waiting for a partner, {} frames queued",
                in_header.id,
                self.aligner.backlog()
            );
            return Ok(None);
        };
        let seq_num = a.seq_num;
        let mut aligned = MultiFrame::empty(in_header.as_multi().map_or_else(Vec::new, |m| {
            m.children()
        }));
        aligned.set_frame(a);
        aligned.set_frame(b);
        let aligned = in_header.make_frame_with_seq(seq_num, FrameData::Multi(aligned));

        let Some(matches) = self.tdoa.process(aligned)? else {
            return Ok(None);
        };
        let consolidated = self.consolidate.process(matches)?;
        if let Some(out) = &consolidated {
            write_trace(&self.trace, out);
        }
        Ok(consolidated)
    }

    fn close(&mut self) -> PipelineResult<()> {
        if let Some(trace) = self.trace.take() {
            trace.close();
        }
        self.tdoa.close()?;
        self.consolidate.close()
    }
}

impl fmt::Display for DualPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DualPipeline({} -> {})", self.tdoa, self.consolidate)
    }
}

/// The final stage: assembles the pair estimates into a matrix, converts it
/// to metres and embeds it.
pub struct MergePipeline {
    matrix: DistanceMatrixComponent,
    geometry: GeometryComponent,
    embedding: EmbeddingComponent,
    trace_dir: Option<PathBuf>,
    trace: Option<TextFileStream>,
}

impl MergePipeline {
    /// Name of the trace file (without extension) of the metre matrix.
    pub const TRACE_ID: &'static str = "geometry";

    /// Instantiates a new MergePipeline.
    pub fn new(config: &LocalizerConfig) -> Self {
        Self {
            matrix: DistanceMatrixComponent::new(),
            geometry: GeometryComponent::new(config.speed_of_sound),
            embedding: EmbeddingComponent::new(config.dimensions),
            trace_dir: config.trace_dir.clone(),
            trace: None,
        }
    }
}

impl Component for MergePipeline {
    fn init(&mut self, in_header: Arc<StreamHeader>) -> PipelineResult<Arc<StreamHeader>> {
        let header = self.matrix.init(in_header)?;
        let header = self.geometry.init(header)?;
        self.trace = open_trace(&self.trace_dir, Self::TRACE_ID)?;
        if let Some(trace) = &self.trace {
            trace.set_header(Arc::clone(&header))?;
        }
        self.embedding.init(header)
    }

    fn process(&mut self, frame: Arc<StreamFrame>) -> PipelineResult<Option<Arc<StreamFrame>>> {
        let deltas = match self.matrix.process(frame) {
            Ok(Some(deltas)) => deltas,
            Ok(None) => return Ok(None),
            // pairs of a newly joined device are still arriving
            Err(PipelineError::Configuration(reason)) => {
                debug!("merge : skipping cycle, {}", reason);
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        let Some(metres) = self.geometry.process(deltas)? else {
            return Ok(None);
        };
        write_trace(&self.trace, &metres);
        self.embedding.process(metres)
    }

    fn close(&mut self) -> PipelineResult<()> {
        if let Some(trace) = self.trace.take() {
            trace.close();
        }
        self.matrix.close()?;
        self.geometry.close()?;
        self.embedding.close()
    }
}

impl fmt::Display for MergePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MergePipeline({} -> {} -> {})",
            self.matrix, self.geometry, self.embedding
        )
    }
}
