//! Per-cycle data envelopes. A frame owns its payload and points back at
//! the header that minted it through a [Weak] reference, so a frame never
//! keeps a stream's metadata alive and can never mutate it.

use crate::header::{HeaderKey, StreamHeader};

use nalgebra::DMatrix;
use std::sync::{Arc, Weak};

/// Peaks detected within one frame window. Offsets are absolute
/// microseconds; `peak_offsets` and `peak_magnitudes` are index aligned and
/// offsets are ascending.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImpulseData {
    /// When each peak was heard
    pub peak_offsets: Vec<i64>,
    /// How loud each peak was
    pub peak_magnitudes: Vec<f64>,
}

impl ImpulseData {
    /// Builds impulse data from `(offset, magnitude)` pairs.
    pub fn from_peaks(peaks: &[(i64, f64)]) -> Self {
        Self {
            peak_offsets: peaks.iter().map(|p| p.0).collect(),
            peak_magnitudes: peaks.iter().map(|p| p.1).collect(),
        }
    }

    /// Number of peaks.
    pub fn len(&self) -> usize {
        self.peak_offsets.len()
    }

    /// True when nothing was heard.
    pub fn is_empty(&self) -> bool {
        self.peak_offsets.is_empty()
    }
}

/// Matched TDOA offsets between two devices, index aligned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DistanceData {
    /// `offset(a) - offset(b)`, microseconds
    pub peak_deltas: Vec<f64>,
    /// Confidence of each match
    pub peak_magnitudes: Vec<f64>,
}

impl DistanceData {
    /// Number of matches.
    pub fn len(&self) -> usize {
        self.peak_deltas.len()
    }

    /// True when nothing matched.
    pub fn is_empty(&self) -> bool {
        self.peak_deltas.is_empty()
    }
}

/// One synchronisation cycle of a combining stream: a slot per child
/// header, in join order. Empty slots are normal.
#[derive(Debug, Clone, Default)]
pub struct MultiFrame {
    slots: Vec<(Arc<StreamHeader>, Option<Arc<StreamFrame>>)>,
}

impl MultiFrame {
    /// An aggregate with every slot empty.
    pub fn empty(children: Vec<Arc<StreamHeader>>) -> Self {
        Self {
            slots: children.into_iter().map(|h| (h, None)).collect(),
        }
    }

    /// Fills the slot of the frame's own header. Returns false when no slot
    /// belongs to that header.
    pub fn set_frame(&mut self, frame: Arc<StreamFrame>) -> bool {
        let key = frame.header_key();
        match self.slots.iter_mut().find(|(h, _)| HeaderKey::of(h) == key) {
            Some(slot) => {
                slot.1 = Some(frame);
                true
            }
            None => false,
        }
    }

    /// The frame of a given child this cycle.
    pub fn get(&self, header: &Arc<StreamHeader>) -> Option<&Arc<StreamFrame>> {
        let key = HeaderKey::of(header);
        self.slots
            .iter()
            .find(|(h, _)| HeaderKey::of(h) == key)
            .and_then(|(_, f)| f.as_ref())
    }

    /// The frame in slot `index`.
    pub fn slot(&self, index: usize) -> Option<&Arc<StreamFrame>> {
        self.slots.get(index).and_then(|(_, f)| f.as_ref())
    }

    /// Number of slots, filled or not.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when there are no slots at all.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of slots holding a frame.
    pub fn filled(&self) -> usize {
        self.slots.iter().filter(|(_, f)| f.is_some()).count()
    }

    /// Iterates `(child header, frame)` in join order.
    pub fn iter(&self) -> impl Iterator<Item = (&Arc<StreamHeader>, Option<&Arc<StreamFrame>>)> {
        self.slots.iter().map(|(h, f)| (h, f.as_ref()))
    }
}

/// The payload of a frame; which variant is valid follows the header kind.
#[derive(Debug, Clone)]
pub enum FrameData {
    /// Sequence number only
    Empty,
    /// First-channel PCM samples
    RawAudio(Vec<i16>),
    /// Detected peaks
    Impulse(ImpulseData),
    /// Matched deltas
    Distance(DistanceData),
    /// A matrix whose rows follow the header's device order
    Geometry(DMatrix<f64>),
    /// One aggregate cycle
    Multi(MultiFrame),
}

/// A sequence-numbered frame of some stream.
#[derive(Debug)]
pub struct StreamFrame {
    /// Increases by one within a stream; gaps mean loss
    pub seq_num: u64,
    /// The payload
    pub data: FrameData,
    header: Weak<StreamHeader>,
}

impl StreamFrame {
    pub(crate) fn new(seq_num: u64, header: Weak<StreamHeader>, data: FrameData) -> Self {
        Self {
            seq_num,
            data,
            header,
        }
    }

    /// The header that minted this frame, if it is still alive.
    pub fn header(&self) -> Option<Arc<StreamHeader>> {
        self.header.upgrade()
    }

    /// Identity of the minting header, available even after it was dropped.
    pub fn header_key(&self) -> HeaderKey {
        HeaderKey::from_ptr(self.header.as_ptr())
    }

    /// Samples, if this is a raw audio frame.
    pub fn as_raw_audio(&self) -> Option<&[i16]> {
        match &self.data {
            FrameData::RawAudio(samples) => Some(samples),
            _ => None,
        }
    }

    /// Peaks, if this is an impulse frame.
    pub fn as_impulse(&self) -> Option<&ImpulseData> {
        match &self.data {
            FrameData::Impulse(data) => Some(data),
            _ => None,
        }
    }

    /// Matches, if this is a distance frame.
    pub fn as_distance(&self) -> Option<&DistanceData> {
        match &self.data {
            FrameData::Distance(data) => Some(data),
            _ => None,
        }
    }

    /// The matrix, if this is a geometry frame.
    pub fn as_geometry(&self) -> Option<&DMatrix<f64>> {
        match &self.data {
            FrameData::Geometry(matrix) => Some(matrix),
            _ => None,
        }
    }

    /// The aggregate, if this is a multi frame.
    pub fn as_multi(&self) -> Option<&MultiFrame> {
        match &self.data {
            FrameData::Multi(multi) => Some(multi),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_frame_slots_follow_headers() {
        let a = StreamHeader::impulse("a", 0, 100);
        let b = StreamHeader::impulse("b", 0, 100);
        let stranger = StreamHeader::impulse("c", 0, 100);

        let mut multi = MultiFrame::empty(vec![a.clone(), b.clone()]);
        assert_eq!(multi.len(), 2);
        assert_eq!(multi.filled(), 0);

        assert!(multi.set_frame(b.make_frame(FrameData::Empty)));
        assert!(!multi.set_frame(stranger.make_frame(FrameData::Empty)));

        assert_eq!(multi.filled(), 1);
        assert!(multi.get(&a).is_none());
        assert!(multi.get(&b).is_some());
        assert!(multi.slot(0).is_none());
        assert!(multi.slot(1).is_some());
    }

    #[test]
    fn orphaned_frame_keeps_its_key() {
        let header = StreamHeader::plain("gone", 0, 100);
        let key = HeaderKey::of(&header);
        let frame = header.make_frame(FrameData::Empty);
        drop(header);
        assert!(frame.header().is_none());
        assert_eq!(frame.header_key(), key);
    }

    #[test]
    fn impulse_data_from_peaks() {
        let data = ImpulseData::from_peaks(&[(100, 5.0), (500, 3.0)]);
        assert_eq!(data.peak_offsets, vec![100, 500]);
        assert_eq!(data.peak_magnitudes, vec![5.0, 3.0]);
        assert_eq!(data.len(), 2);
    }
}
