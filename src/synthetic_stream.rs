//! Simulated devices for demos and tests. A [SyntheticScene] places devices
//! on a plane and, once per frame, emits a click at one device's position,
//! taking turns. Every device hears each click after the sound travelled to
//! it, and reports it as an impulse.

use crate::error::{PipelineError, PipelineResult};
use crate::frame::{FrameData, ImpulseData, StreamFrame};
use crate::header::StreamHeader;
use crate::stream::FrameStream;

use rand::prelude::*;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A point on the floor plan, metres.
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct Point {
    /// Metres east
    pub x: f64,
    /// Metres north
    pub y: f64,
}

impl Point {
    /// Euclidean distance.
    pub fn dist(&self, other: &Self) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.2}, {:.2})", self.x, self.y)
    }
}

/// Devices in a room and the clicks they hear.
#[derive(Debug, Clone)]
pub struct SyntheticScene {
    ids: Vec<String>,
    positions: Vec<Point>,
    start_time: u64,
    frame_time: u64,
    frames: Option<u64>,
    speed_of_sound: f64,
    jitter_us: f64,
    realtime: bool,
    seed: u64,
}

impl SyntheticScene {
    /// Devices named `dev0`, `dev1`, ... at the given positions.
    pub fn new(positions: Vec<Point>, start_time: u64, frame_time: u64) -> Self {
        Self {
            ids: (0..positions.len()).map(|i| format!("dev{}", i)).collect(),
            positions,
            start_time,
            frame_time,
            frames: None,
            speed_of_sound: 343.0,
            jitter_us: 0.0,
            realtime: false,
            seed: 0,
        }
    }

    /// `count` devices scattered over a `side` by `side` metre room.
    pub fn scattered(count: usize, side: f64, seed: u64, start_time: u64, frame_time: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let positions = (0..count)
            .map(|_| Point {
                x: rng.gen_range(0.0..side),
                y: rng.gen_range(0.0..side),
            })
            .collect();
        Self::new(positions, start_time, frame_time).with_seed(seed)
    }

    /// Ends every stream after `frames` frames; unlimited otherwise.
    pub fn with_frames(mut self, frames: u64) -> Self {
        self.frames = Some(frames);
        self
    }

    /// Seeds click timing and jitter.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Metres per second.
    pub fn with_speed_of_sound(mut self, speed_of_sound: f64) -> Self {
        self.speed_of_sound = speed_of_sound;
        self
    }

    /// Uniform noise of up to `jitter_us` either way on every arrival.
    pub fn with_jitter_us(mut self, jitter_us: f64) -> Self {
        self.jitter_us = jitter_us.abs();
        self
    }

    /// Releases each frame only once its window has passed on the clock.
    pub fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    /// Device ids, in position order.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Device positions.
    pub fn positions(&self) -> &[Point] {
        &self.positions
    }

    /// Which device clicks in frame `seq`, and when (absolute microseconds).
    /// The click falls 20% to 60% into the frame window.
    pub fn click(&self, seq: u64) -> Option<(usize, i64)> {
        if self.positions.is_empty() {
            return None;
        }
        let emitter = (seq % self.positions.len() as u64) as usize;
        let mut rng = StdRng::seed_from_u64(self.seed ^ seq.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let window_us = (self.frame_time * 1000) as f64;
        let into_window = rng.gen_range(0.2..0.6) * window_us;
        let start_us = (self.start_time + seq * self.frame_time) as i64 * 1000;
        Some((emitter, start_us + into_window as i64))
    }

    /// What `device` hears in frame `seq`.
    pub fn impulses(&self, device: usize, seq: u64) -> ImpulseData {
        let Some((emitter, at)) = self.click(seq) else {
            return ImpulseData::default();
        };
        let (Some(from), Some(to)) = (self.positions.get(emitter), self.positions.get(device))
        else {
            return ImpulseData::default();
        };
        let mut travel_us = from.dist(to) / self.speed_of_sound * 1e6;
        if self.jitter_us > 0.0 {
            let mut rng = StdRng::seed_from_u64(
                self.seed ^ seq.wrapping_mul(31).wrapping_add(device as u64 + 1),
            );
            travel_us += rng.gen_range(-self.jitter_us..=self.jitter_us);
        }
        ImpulseData::from_peaks(&[(at + travel_us.round() as i64, 1.0)])
    }

    /// The stream of one device.
    pub fn stream(&self, device: usize) -> PipelineResult<SyntheticStream> {
        let id = self.ids.get(device).cloned().ok_or_else(|| {
            PipelineError::Configuration(format!("no device {} in the scene", device))
        })?;
        let header = StreamHeader::impulse(id.clone(), self.start_time, self.frame_time);
        Ok(SyntheticStream {
            id,
            device,
            scene: self.clone(),
            header,
            next_seq: AtomicU64::new(0),
            open: AtomicBool::new(true),
            epoch: Instant::now(),
        })
    }

    /// Streams for every device.
    pub fn streams(&self) -> PipelineResult<Vec<SyntheticStream>> {
        (0..self.positions.len()).map(|i| self.stream(i)).collect()
    }
}

/// One simulated device. Produces impulse frames directly.
pub struct SyntheticStream {
    id: String,
    device: usize,
    scene: SyntheticScene,
    header: Arc<StreamHeader>,
    next_seq: AtomicU64,
    open: AtomicBool,
    epoch: Instant,
}

impl FrameStream for SyntheticStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn get_header(&self) -> PipelineResult<Option<Arc<StreamHeader>>> {
        if !self.open.load(Ordering::Acquire) {
            return Ok(None);
        }
        Ok(Some(Arc::clone(&self.header)))
    }

    fn set_header(&self, _header: Arc<StreamHeader>) -> PipelineResult<()> {
        Err(PipelineError::ProtocolViolation(format!(
            "{} is a simulated source",
            self.id
        )))
    }

    fn send_frame(&self, _frame: Arc<StreamFrame>) -> PipelineResult<()> {
        Err(PipelineError::ProtocolViolation(format!(
            "{} is a simulated source",
            self.id
        )))
    }

    fn recv_frame(&self) -> PipelineResult<Option<Arc<StreamFrame>>> {
        if !self.open.load(Ordering::Acquire) {
            return Ok(None);
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        if self.scene.frames.map_or(false, |n| seq >= n) {
            return Ok(None);
        }
        if self.scene.realtime {
            let due = self.epoch + Duration::from_millis((seq + 1) * self.scene.frame_time);
            let now = Instant::now();
            if due > now {
                spin_sleep::sleep(due - now);
            }
        }
        let data = self.scene.impulses(self.device, seq);
        Ok(Some(
            self.header
                .make_frame_with_seq(seq, FrameData::Impulse(data)),
        ))
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene() -> SyntheticScene {
        let positions = vec![
            Point { x: 0.0, y: 0.0 },
            Point { x: 3.43, y: 0.0 },
            Point { x: 0.0, y: 0.686 },
        ];
        SyntheticScene::new(positions, 10_000, 100)
    }

    #[test]
    fn clicks_take_turns_inside_their_window() {
        let scene = scene();
        for seq in 0..6 {
            let (emitter, at) = scene.click(seq).unwrap();
            assert_eq!(emitter, (seq % 3) as usize);
            let start = (10_000 + seq * 100) as i64 * 1000;
            assert!(at >= start + 20_000 && at < start + 60_000);
        }
    }

    #[test]
    fn arrivals_follow_the_speed_of_sound() {
        let scene = scene();
        let (_, at) = scene.click(0).unwrap();
        assert_eq!(scene.impulses(0, 0).peak_offsets, vec![at]);
        assert_eq!(scene.impulses(1, 0).peak_offsets, vec![at + 10_000]);
        assert_eq!(scene.impulses(2, 0).peak_offsets, vec![at + 2_000]);
    }

    #[test]
    fn same_seed_same_scene() {
        let a = SyntheticScene::scattered(4, 5.0, 7, 0, 100);
        let b = SyntheticScene::scattered(4, 5.0, 7, 0, 100);
        assert_eq!(a.positions(), b.positions());
        assert_eq!(a.click(3), b.click(3));
        assert!(a.positions().iter().all(|p| p.x >= 0.0 && p.x < 5.0));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let scene = scene().with_jitter_us(50.0).with_seed(3);
        let (_, at) = scene.click(0).unwrap();
        for seq in [0u64, 3, 6] {
            let (_, at_seq) = scene.click(seq).unwrap();
            let heard = scene.impulses(1, seq).peak_offsets[0];
            assert!((heard - at_seq - 10_000).abs() <= 50);
        }
        assert_eq!(scene.click(0).unwrap().1, at);
    }

    #[test]
    fn stream_ends_after_frame_count() {
        let scene = scene().with_frames(3);
        let stream = scene.stream(1).unwrap();
        let header = stream.get_header().unwrap().unwrap();
        assert_eq!(header.id, "dev1");
        assert!(header.is_impulse());

        let seqs: Vec<u64> = std::iter::from_fn(|| stream.recv_frame().unwrap())
            .map(|f| f.seq_num)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);

        stream.close();
        stream.close();
        assert!(stream.get_header().unwrap().is_none());
        assert!(matches!(
            stream.set_header(header),
            Err(PipelineError::ProtocolViolation(_))
        ));
        assert!(scene.stream(9).is_err());
    }

    #[test]
    fn realtime_streams_are_paced() {
        let scene = scene().with_frames(3).with_realtime(true);
        let start = Instant::now();
        let stream = scene.stream(0).unwrap();
        while stream.recv_frame().unwrap().is_some() {}
        assert!(start.elapsed() >= Duration::from_millis(300));
    }
}
