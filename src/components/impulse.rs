//! Per-device impulse detection: turns raw PCM into a sparse list of
//! acoustic peaks with absolute timestamps.

use crate::component::Component;
use crate::config::ImpulseConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::frame::{FrameData, ImpulseData, StreamFrame};
use crate::header::StreamHeader;

use log::debug;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Moving-RMS onset detector.
///
/// The envelope is the RMS of the last `rms_window` samples, zeros assumed
/// before the first one. A peak is reported where the envelope rises
/// through `threshold`, unless the previous peak is less than
/// `refractory_us` old. The window carries over from one frame to the next,
/// and is reset when a frame goes missing.
pub struct ImpulseComponent {
    config: ImpulseConfig,
    window: VecDeque<u64>,
    sum_sq: u64,
    above: bool,
    last_peak_us: Option<i64>,
    next_seq: Option<u64>,
    in_header: Option<Arc<StreamHeader>>,
    out_header: Option<Arc<StreamHeader>>,
}

impl ImpulseComponent {
    /// Instantiates a new detector.
    pub fn new(config: ImpulseConfig) -> Self {
        Self {
            config,
            window: VecDeque::new(),
            sum_sq: 0,
            above: false,
            last_peak_us: None,
            next_seq: None,
            in_header: None,
            out_header: None,
        }
    }

    fn reset(&mut self) {
        self.window.clear();
        self.sum_sq = 0;
        self.above = false;
    }

    /// Scans one block of samples. `base_us` is the absolute time of the
    /// first sample.
    pub fn detect(&mut self, samples: &[i16], base_us: i64, sampling_rate: u32) -> ImpulseData {
        let len = self.config.rms_window.max(1);
        let mut peaks = Vec::new();

        for (i, &sample) in samples.iter().enumerate() {
            let sq = (i64::from(sample) * i64::from(sample)) as u64;
            self.window.push_back(sq);
            self.sum_sq += sq;
            while self.window.len() > len {
                if let Some(old) = self.window.pop_front() {
                    self.sum_sq -= old;
                }
            }

            let envelope = (self.sum_sq as f64 / len as f64).sqrt();
            let crossing = envelope >= self.config.threshold && !self.above;
            self.above = envelope >= self.config.threshold;
            if !crossing {
                continue;
            }

            let offset = base_us + i as i64 * 1_000_000 / i64::from(sampling_rate);
            let rested = self
                .last_peak_us
                .map_or(true, |last| offset - last >= self.config.refractory_us);
            if rested {
                peaks.push((offset, envelope));
                self.last_peak_us = Some(offset);
            }
        }

        ImpulseData::from_peaks(&peaks)
    }
}

impl Component for ImpulseComponent {
    fn init(&mut self, in_header: Arc<StreamHeader>) -> PipelineResult<Arc<StreamHeader>> {
        if in_header.as_raw_audio().is_none() {
            return Err(PipelineError::Validation(format!(
                "impulse detection on {} needs raw audio",
                in_header.id
            )));
        }
        let out = StreamHeader::impulse(
            in_header.id.clone(),
            in_header.start_time,
            in_header.frame_time,
        );
        self.reset();
        self.last_peak_us = None;
        self.next_seq = None;
        self.in_header = Some(in_header);
        self.out_header = Some(Arc::clone(&out));
        Ok(out)
    }

    fn process(&mut self, frame: Arc<StreamFrame>) -> PipelineResult<Option<Arc<StreamFrame>>> {
        let (in_header, out_header) = match (&self.in_header, &self.out_header) {
            (Some(i), Some(o)) => (Arc::clone(i), Arc::clone(o)),
            _ => {
                return Err(PipelineError::Validation(
                    "impulse detection used before init".to_string(),
                ))
            }
        };
        let samples = frame.as_raw_audio().ok_or_else(|| {
            PipelineError::Validation(format!("{} : expected a raw audio frame", in_header.id))
        })?;
        let rate = in_header.as_raw_audio().map_or(1, |f| f.sampling_rate.max(1));

        if let Some(expected) = self.next_seq {
            if frame.seq_num != expected {
                debug!(
                    "{} : frames {}..{} lost, resetting envelope",
                    in_header.id, expected, frame.seq_num
                );
                self.reset();
            }
        }
        self.next_seq = Some(frame.seq_num + 1);

        let base_us = in_header.window_start_ms(frame.seq_num) as i64 * 1000;
        let peaks = self.detect(samples, base_us, rate);
        Ok(Some(out_header.make_frame_with_seq(
            frame.seq_num,
            FrameData::Impulse(peaks),
        )))
    }

    fn close(&mut self) -> PipelineResult<()> {
        self.reset();
        Ok(())
    }
}

impl fmt::Display for ImpulseComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ImpulseComponent(window={}, threshold={})",
            self.config.rms_window, self.config.threshold
        )
    }
}
