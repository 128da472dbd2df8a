//! Per-stream metadata. A [StreamHeader] is created once when a pipe
//! initialises and is shared read-only afterwards; the frames it mints hold
//! only a weak back-reference to it (see [crate::frame]).

use crate::error::{PipelineError, PipelineResult};
use crate::frame::{FrameData, StreamFrame};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Identity of a header allocation. Two headers with equal fields are still
/// different streams; the combining stream keys its queues on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeaderKey(usize);

impl HeaderKey {
    /// The key of a shared header.
    pub fn of(header: &Arc<StreamHeader>) -> Self {
        HeaderKey(Arc::as_ptr(header) as usize)
    }

    pub(crate) fn from_ptr(ptr: *const StreamHeader) -> Self {
        HeaderKey(ptr as usize)
    }
}

/// Sample format of a raw audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Samples per second
    pub sampling_rate: u32,
    /// Interleaved channels in the source
    pub num_channels: u16,
    /// Bits per sample in the source
    pub bits_per_sample: u16,
}

/// The two devices a distance stream relates, in join order.
#[derive(Debug, Clone, PartialEq)]
pub struct DistancePair {
    /// `[a, b]`; every delta in the stream is `offset(a) - offset(b)`
    pub device_ids: [String; 2],
    /// Largest accepted absolute delta, microseconds
    pub max_window_us: i64,
}

/// Device set and matrix shape of a geometry stream.
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryShape {
    /// Row `i` of every matrix belongs to `device_ids[i]`
    pub device_ids: Vec<String>,
    /// Matrix rows
    pub rows: usize,
    /// Matrix columns
    pub cols: usize,
}

/// The domain-specific part of a header.
#[derive(Debug)]
pub enum HeaderKind {
    /// No payload description, frames carry [FrameData::Empty]
    Plain,
    /// PCM audio straight from a device
    RawAudio(AudioFormat),
    /// Detected acoustic peaks
    Impulse,
    /// Matched TDOA offsets between two devices
    Distance(DistancePair),
    /// A per-device matrix: deltas, distances or coordinates
    Geometry(GeometryShape),
    /// The aggregate header of a combining stream
    Multi(MultiHeader),
}

/// Immutable stream metadata plus the counter used to stamp frames.
#[derive(Debug)]
pub struct StreamHeader {
    /// Device or stream id
    pub id: String,
    /// Stream start, milliseconds since the unix epoch
    pub start_time: u64,
    /// Duration of one frame, milliseconds
    pub frame_time: u64,
    /// What the frames of this stream carry
    pub kind: HeaderKind,
    next_seq: AtomicU64,
}

impl StreamHeader {
    /// Builds a header of any kind.
    pub fn new(id: impl Into<String>, start_time: u64, frame_time: u64, kind: HeaderKind) -> Self {
        Self {
            id: id.into(),
            start_time,
            frame_time,
            kind,
            next_seq: AtomicU64::new(0),
        }
    }

    /// A header whose frames carry nothing but a sequence number.
    pub fn plain(id: impl Into<String>, start_time: u64, frame_time: u64) -> Arc<Self> {
        Arc::new(Self::new(id, start_time, frame_time, HeaderKind::Plain))
    }

    /// A raw audio header.
    pub fn raw_audio(
        id: impl Into<String>,
        start_time: u64,
        frame_time: u64,
        format: AudioFormat,
    ) -> Arc<Self> {
        Arc::new(Self::new(id, start_time, frame_time, HeaderKind::RawAudio(format)))
    }

    /// An impulse header.
    pub fn impulse(id: impl Into<String>, start_time: u64, frame_time: u64) -> Arc<Self> {
        Arc::new(Self::new(id, start_time, frame_time, HeaderKind::Impulse))
    }

    /// A distance header for the pair `device_ids`.
    pub fn distance(
        id: impl Into<String>,
        start_time: u64,
        frame_time: u64,
        device_ids: [String; 2],
        max_window_us: i64,
    ) -> Arc<Self> {
        let pair = DistancePair {
            device_ids,
            max_window_us,
        };
        Arc::new(Self::new(id, start_time, frame_time, HeaderKind::Distance(pair)))
    }

    /// A geometry header. The id is the comma-joined device list.
    pub fn geometry(
        device_ids: Vec<String>,
        start_time: u64,
        frame_time: u64,
        rows: usize,
        cols: usize,
    ) -> Arc<Self> {
        let id = device_ids.join(",");
        let shape = GeometryShape {
            device_ids,
            rows,
            cols,
        };
        Arc::new(Self::new(id, start_time, frame_time, HeaderKind::Geometry(shape)))
    }

    /// The aggregate header of a combining stream, seeded with its first child.
    pub fn multi(id: impl Into<String>, first: Arc<StreamHeader>) -> Arc<Self> {
        let start_time = first.start_time;
        let frame_time = first.frame_time;
        let children = MultiHeader {
            children: RwLock::new(vec![first]),
        };
        Arc::new(Self::new(id, start_time, frame_time, HeaderKind::Multi(children)))
    }

    /// Mints a frame with the next sequence number of this stream.
    pub fn make_frame(self: &Arc<Self>, data: FrameData) -> Arc<StreamFrame> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        Arc::new(StreamFrame::new(seq, Arc::downgrade(self), data))
    }

    /// Mints a frame carrying a sequence number chosen by the caller, e.g.
    /// one inherited from the input frame of a component.
    pub fn make_frame_with_seq(self: &Arc<Self>, seq_num: u64, data: FrameData) -> Arc<StreamFrame> {
        Arc::new(StreamFrame::new(seq_num, Arc::downgrade(self), data))
    }

    /// Start of the window covered by frame `seq`, milliseconds since the epoch.
    pub fn window_start_ms(&self, seq: u64) -> u64 {
        self.start_time + seq * self.frame_time
    }

    /// The audio format, if this is a raw audio header.
    pub fn as_raw_audio(&self) -> Option<&AudioFormat> {
        match &self.kind {
            HeaderKind::RawAudio(format) => Some(format),
            _ => None,
        }
    }

    /// Whether this is an impulse header.
    pub fn is_impulse(&self) -> bool {
        matches!(self.kind, HeaderKind::Impulse)
    }

    /// The device pair, if this is a distance header.
    pub fn as_distance(&self) -> Option<&DistancePair> {
        match &self.kind {
            HeaderKind::Distance(pair) => Some(pair),
            _ => None,
        }
    }

    /// The matrix shape, if this is a geometry header.
    pub fn as_geometry(&self) -> Option<&GeometryShape> {
        match &self.kind {
            HeaderKind::Geometry(shape) => Some(shape),
            _ => None,
        }
    }

    /// The children, if this is an aggregate header.
    pub fn as_multi(&self) -> Option<&MultiHeader> {
        match &self.kind {
            HeaderKind::Multi(multi) => Some(multi),
            _ => None,
        }
    }
}

impl fmt::Display for StreamHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            HeaderKind::Multi(multi) => {
                let ids: Vec<String> = multi.children().iter().map(|h| h.id.clone()).collect();
                write!(f, "{} [{}]", self.id, ids.join(", "))
            }
            _ => write!(f, "{} {} {}", self.id, self.start_time, self.frame_time),
        }
    }
}

/// Ordered children of an aggregate header. Join order is preserved; the
/// list only grows.
#[derive(Debug)]
pub struct MultiHeader {
    children: RwLock<Vec<Arc<StreamHeader>>>,
}

impl MultiHeader {
    /// Appends a child. Adding the same header twice is a no-op.
    pub fn add(&self, header: Arc<StreamHeader>) -> PipelineResult<()> {
        let mut children = self
            .children
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if children.iter().any(|c| Arc::ptr_eq(c, &header)) {
            return Ok(());
        }
        if let Some(first) = children.first() {
            if first.frame_time != header.frame_time {
                return Err(PipelineError::Validation(format!(
                    "frame time of {} ({} ms) differs from {} ({} ms)",
                    header.id, header.frame_time, first.id, first.frame_time
                )));
            }
        }
        if children.iter().any(|c| c.id == header.id) {
            return Err(PipelineError::Configuration(format!(
                "duplicate stream id {}",
                header.id
            )));
        }
        children.push(header);
        Ok(())
    }

    /// A snapshot of the children in join order.
    pub fn children(&self) -> Vec<Arc<StreamHeader>> {
        self.children
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The first child to join.
    pub fn first(&self) -> Option<Arc<StreamHeader>> {
        self.children
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .first()
            .cloned()
    }

    /// Number of children joined so far.
    pub fn len(&self) -> usize {
        self.children
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Never true for a header built by [StreamHeader::multi].
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_numbered_in_order() {
        let header = StreamHeader::plain("a", 1000, 100);
        let seqs: Vec<u64> = (0..3)
            .map(|_| header.make_frame(FrameData::Empty).seq_num)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);

        let pinned = header.make_frame_with_seq(42, FrameData::Empty);
        assert_eq!(pinned.seq_num, 42);
        assert_eq!(header.make_frame(FrameData::Empty).seq_num, 3);
    }

    #[test]
    fn frame_points_back_at_its_header() {
        let header = StreamHeader::impulse("dev", 0, 100);
        let frame = header.make_frame(FrameData::Empty);
        assert_eq!(frame.header_key(), HeaderKey::of(&header));
        assert!(Arc::ptr_eq(&frame.header().unwrap(), &header));
    }

    #[test]
    fn equal_headers_have_distinct_keys() {
        let a = StreamHeader::plain("x", 0, 100);
        let b = StreamHeader::plain("x", 0, 100);
        assert_ne!(HeaderKey::of(&a), HeaderKey::of(&b));
    }

    #[test]
    fn multi_header_keeps_join_order() {
        let a = StreamHeader::plain("a", 0, 100);
        let b = StreamHeader::plain("b", 5, 100);
        let m = StreamHeader::multi("mix", a.clone());
        let multi = m.as_multi().unwrap();
        multi.add(b.clone()).unwrap();
        multi.add(b.clone()).unwrap();

        let ids: Vec<String> = multi.children().iter().map(|h| h.id.clone()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(m.start_time, 0);
        assert_eq!(m.frame_time, 100);
    }

    #[test]
    fn multi_header_rejects_mismatched_children() {
        let m = StreamHeader::multi("mix", StreamHeader::plain("a", 0, 100));
        let multi = m.as_multi().unwrap();

        let slow = StreamHeader::plain("b", 0, 200);
        assert!(matches!(multi.add(slow), Err(PipelineError::Validation(_))));

        let twin = StreamHeader::plain("a", 0, 100);
        assert!(matches!(multi.add(twin), Err(PipelineError::Configuration(_))));
        assert_eq!(multi.len(), 1);
    }

    #[test]
    fn geometry_id_joins_devices() {
        let g = StreamHeader::geometry(vec!["a".into(), "b".into()], 0, 100, 2, 2);
        assert_eq!(g.id, "a,b");
        assert_eq!(g.as_geometry().unwrap().rows, 2);
    }
}
