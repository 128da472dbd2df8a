//! Tunables of the localization chain, read from a [ron] file such as:
//!
//! ```text
//! (
//!     max_plausible_distance_us: 29000,
//!     consolidation_window: 8,
//!     dimensions: 2,
//!     impulse: (threshold: 1500.0),
//!     trace_dir: Some("traces"),
//! )
//! ```
//!
//! Every field is optional; missing ones take their default.

use crate::error::PipelineResult;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Settings of the per-device impulse detector.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ImpulseConfig {
    /// Samples in the moving RMS window
    pub rms_window: usize,
    /// Envelope level that counts as an impulse
    pub threshold: f64,
    /// Minimum spacing between two peaks, microseconds
    pub refractory_us: i64,
}

impl Default for ImpulseConfig {
    fn default() -> Self {
        Self {
            rms_window: 32,
            threshold: 2000.0,
            refractory_us: 50_000,
        }
    }
}

/// Settings of the whole localization topology.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LocalizerConfig {
    /// Largest plausible TDOA between two devices, microseconds
    pub max_plausible_distance_us: i64,
    /// Distance frames kept by the consolidation stage
    pub consolidation_window: usize,
    /// Dimensionality of the embedded geometry
    pub dimensions: usize,
    /// Metres per second
    pub speed_of_sound: f64,
    /// Backlog per side of a pair before the oldest frame is dropped
    pub align_queue_limit: usize,
    /// Impulse detection
    pub impulse: ImpulseConfig,
    /// Where pair and merge pipelines write text traces, if anywhere
    pub trace_dir: Option<PathBuf>,
}

impl Default for LocalizerConfig {
    fn default() -> Self {
        Self {
            max_plausible_distance_us: 29_000,
            consolidation_window: 8,
            dimensions: 2,
            speed_of_sound: 343.0,
            align_queue_limit: 64,
            impulse: ImpulseConfig::default(),
            trace_dir: None,
        }
    }
}

impl LocalizerConfig {
    /// Parses a configuration from RON text.
    pub fn from_ron_str(text: &str) -> PipelineResult<Self> {
        Ok(ron::de::from_str(text)?)
    }

    /// Reads a configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_ron_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use std::io::Write;

    #[test]
    fn empty_struct_gives_defaults() {
        let config = LocalizerConfig::from_ron_str("()").unwrap();
        assert_eq!(config, LocalizerConfig::default());
        assert_eq!(config.max_plausible_distance_us, 29_000);
        assert_eq!(config.impulse.rms_window, 32);
    }

    #[test]
    fn partial_override() {
        let config = LocalizerConfig::from_ron_str(
            "(dimensions: 3, impulse: (threshold: 1500.0), trace_dir: Some(\"traces\"))",
        )
        .unwrap();
        assert_eq!(config.dimensions, 3);
        assert_eq!(config.impulse.threshold, 1500.0);
        assert_eq!(config.impulse.refractory_us, 50_000);
        assert_eq!(config.trace_dir, Some(PathBuf::from("traces")));
        assert_eq!(config.consolidation_window, 8);
    }

    #[test]
    fn written_config_reads_back() {
        let mut config = LocalizerConfig::default();
        config.speed_of_sound = 340.0;
        let text = ron::ser::to_string(&config).unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        let loaded = LocalizerConfig::from_path(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn bad_input_is_reported() {
        assert!(matches!(
            LocalizerConfig::from_ron_str("(dimensions: \"two\")"),
            Err(PipelineError::Config(_))
        ));
        assert!(matches!(
            LocalizerConfig::from_path("/nonexistent/earshot.ron"),
            Err(PipelineError::Io(_))
        ));
    }
}
