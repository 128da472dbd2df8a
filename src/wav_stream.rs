//! A device source backed by a WAV file, read with [hound].

use crate::error::{PipelineError, PipelineResult};
use crate::frame::{FrameData, StreamFrame};
use crate::header::{AudioFormat, StreamHeader};
use crate::stream::FrameStream;

use hound::{SampleFormat, WavReader};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

struct WavState {
    reader: Option<WavReader<BufReader<File>>>,
    header: Option<Arc<StreamHeader>>,
    /// Set by the first read; frames are paced from here
    epoch: Option<Instant>,
    frames_read: u32,
}

/// Replays the first channel of a WAV file as raw audio frames of
/// `frame_time` milliseconds. The last frame is padded with silence.
pub struct WavFileStream {
    id: String,
    samples_per_frame: usize,
    channels: usize,
    frame_time: Duration,
    time_dilation: f64,
    state: Mutex<WavState>,
}

impl WavFileStream {
    /// Opens `path` as the device `id`, whose recording started at
    /// `start_time` (ms since the epoch).
    pub fn open(
        id: impl Into<String>,
        path: impl AsRef<Path>,
        start_time: u64,
        frame_time: u64,
    ) -> PipelineResult<Self> {
        let id = id.into();
        let reader = WavReader::open(path)?;
        let spec = reader.spec();
        if spec.sample_format != SampleFormat::Int || spec.bits_per_sample > 16 {
            return Err(PipelineError::Validation(format!(
                "{} : only integer PCM of at most 16 bits is supported",
                id
            )));
        }

        let per_frame = u64::from(spec.sample_rate) * frame_time;
        if per_frame == 0 || per_frame % 1000 != 0 {
            return Err(PipelineError::Validation(format!(
                "{} : {} ms is not a whole number of samples at {} Hz",
                id, frame_time, spec.sample_rate
            )));
        }

        let format = AudioFormat {
            sampling_rate: spec.sample_rate,
            num_channels: spec.channels,
            bits_per_sample: spec.bits_per_sample,
        };
        let header = StreamHeader::raw_audio(id.clone(), start_time, frame_time, format);
        Ok(Self {
            id,
            samples_per_frame: (per_frame / 1000) as usize,
            channels: usize::from(spec.channels.max(1)),
            frame_time: Duration::from_millis(frame_time),
            time_dilation: 0.0,
            state: Mutex::new(WavState {
                reader: Some(reader),
                header: Some(header),
                epoch: None,
                frames_read: 0,
            }),
        })
    }

    /// Holds each frame back until `frame_time * dilation` has passed per
    /// frame since the first read. `1.0` replays the file in real time,
    /// `0.0` (the default) as fast as it can be read.
    pub fn with_time_dilation(mut self, dilation: f64) -> Self {
        self.time_dilation = if dilation.is_finite() { dilation.max(0.0) } else { 0.0 };
        self
    }

    /// Samples in each frame.
    pub fn samples_per_frame(&self) -> usize {
        self.samples_per_frame
    }

    fn lock(&self) -> MutexGuard<'_, WavState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FrameStream for WavFileStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn get_header(&self) -> PipelineResult<Option<Arc<StreamHeader>>> {
        Ok(self.lock().header.clone())
    }

    fn set_header(&self, _header: Arc<StreamHeader>) -> PipelineResult<()> {
        Err(PipelineError::ProtocolViolation(format!(
            "{} is a file source",
            self.id
        )))
    }

    fn send_frame(&self, _frame: Arc<StreamFrame>) -> PipelineResult<()> {
        Err(PipelineError::ProtocolViolation(format!(
            "{} is a file source",
            self.id
        )))
    }

    fn recv_frame(&self) -> PipelineResult<Option<Arc<StreamFrame>>> {
        let mut state = self.lock();
        let WavState { reader, header, epoch, frames_read } = &mut *state;
        let (Some(reader), Some(header)) = (reader.as_mut(), header.as_ref()) else {
            return Ok(None);
        };

        let wanted = self.samples_per_frame * self.channels;
        let mut samples = Vec::with_capacity(self.samples_per_frame);
        for (i, sample) in reader.samples::<i16>().take(wanted).enumerate() {
            let sample = sample?;
            if i % self.channels == 0 {
                samples.push(sample);
            }
        }
        if samples.is_empty() {
            return Ok(None);
        }
        samples.resize(self.samples_per_frame, 0);

        if self.time_dilation > 0.0 {
            let epoch = *epoch.get_or_insert_with(Instant::now);
            *frames_read += 1;
            let due = epoch + self.frame_time.mul_f64(self.time_dilation) * *frames_read;
            let now = Instant::now();
            if due > now {
                spin_sleep::sleep(due - now);
            }
        }
        Ok(Some(header.make_frame(FrameData::RawAudio(samples))))
    }

    fn close(&self) {
        let mut state = self.lock();
        state.reader = None;
        state.header = None;
    }
}
