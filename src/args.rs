// Commandline argument parser using clap for Earshot

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
/// Locates a set of devices from the clicks they hear
pub struct EarshotArgs {
    #[command(subcommand, long_about)]
    /// Where device audio comes from
    pub command: SourceCommand,

    /// RON file overriding the default localizer settings
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Text file the coordinate frames are written to
    #[arg(short = 'o', long = "out", default_value = "output.txt")]
    pub outfile: PathBuf,
}

/// Where device audio comes from
#[derive(Debug, Subcommand, Clone)]
pub enum SourceCommand {
    /// Replay one WAV recording per device
    #[command(about)]
    Files(FilesCommand),

    /// Simulate devices scattered over a room
    #[command(about)]
    Synthetic(SyntheticCommand),
}

/// Replay recordings
#[derive(Debug, Args, Clone)]
pub struct FilesCommand {
    /// One WAV file per device, the file stem is used as device id
    #[arg(short = 'f', long = "files", required = true)]
    #[clap(num_args = 1..)]
    pub filenames: Vec<PathBuf>,

    /// When the recordings started, in ms since the epoch
    #[arg(short = 's', long = "start", default_value_t = 0)]
    pub start_time: u64,

    /// Length of each frame, in ms
    #[arg(short = 't', long = "frame-time", default_value_t = 100)]
    pub frame_time: u64,

    /// Stretch replay so each frame takes frame-time times this factor,
    /// 0 reads as fast as possible
    #[arg(short = 'd', long = "dilation", default_value_t = 0.0, conflicts_with = "realtime")]
    pub dilation: f64,

    /// Replay at the speed the files were recorded, same as --dilation 1
    #[arg(long = "realtime")]
    pub realtime: bool,
}

impl FilesCommand {
    /// The pacing factor handed to each file source.
    pub fn time_dilation(&self) -> f64 {
        if self.realtime {
            1.0
        } else {
            self.dilation
        }
    }
}

/// Simulate devices
#[derive(Debug, Args, Clone)]
pub struct SyntheticCommand {
    /// Number of devices
    #[arg(short = 'n', long = "devices")]
    pub num_devices: usize,

    /// Frames per device
    #[arg(long = "frames", default_value_t = 200)]
    pub frames: u64,

    /// Length of each frame, in ms
    #[arg(short = 't', long = "frame-time", default_value_t = 100)]
    pub frame_time: u64,

    /// Side of the square room, in metres
    #[arg(long = "room", default_value_t = 5.0)]
    pub room: f64,

    /// Seeds device placement and click timing
    #[arg(long = "seed", default_value_t = 0)]
    pub seed: u64,

    /// Pace frames at the speed they would be recorded
    #[arg(long = "realtime")]
    pub realtime: bool,
}
