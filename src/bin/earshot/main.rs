//! Runs the localizer over WAV recordings or simulated devices and writes
//! the recovered coordinates to a text file.

use clap::Parser;
use earshot::{
    args::{EarshotArgs, FilesCommand, SourceCommand, SyntheticCommand},
    config::LocalizerConfig,
    error::{PipelineError, PipelineResult},
    stream::SharedStream,
    synthetic_stream::SyntheticScene,
    text_stream::TextFileStream,
    topology::Topology,
    wav_stream::WavFileStream,
};

use log::{error, info};
use std::{
    process::ExitCode,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

// Example:
// cargo run --bin earshot --
//                         --out    coords.txt
//                         files
//                         --files  kitchen.wav hall.wav porch.wav
//                         --start  1700000000000
//
// cargo run --bin earshot -- synthetic -n 4 --seed 3 --realtime

fn main() -> ExitCode {
    env_logger::init();
    let args = EarshotArgs::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: EarshotArgs) -> PipelineResult<()> {
    let config = match &args.config {
        Some(path) => LocalizerConfig::from_path(path)?,
        None => LocalizerConfig::default(),
    };
    info!("Using {:?}", config);

    let sources = match &args.command {
        SourceCommand::Files(cmd) => wav_sources(cmd)?,
        SourceCommand::Synthetic(cmd) => synthetic_sources(cmd)?,
    };

    let sink = Arc::new(TextFileStream::create("coordinates", &args.outfile)?);
    let topology = Topology::new(config, sink)?;
    for source in sources {
        topology.activate_device(source)?;
    }
    info!(
        "Localising {} devices over {} pairs",
        topology.device_ids().len(),
        topology.pair_ids().len()
    );

    topology.join();
    info!("Coordinates written to {}", args.outfile.display());
    Ok(())
}

fn wav_sources(cmd: &FilesCommand) -> PipelineResult<Vec<SharedStream>> {
    cmd.filenames
        .iter()
        .map(|path| {
            let id = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    PipelineError::Configuration(format!("{} names no file", path.display()))
                })?;
            let stream = WavFileStream::open(id, path, cmd.start_time, cmd.frame_time)?
                .with_time_dilation(cmd.time_dilation());
            Ok(Arc::new(stream) as SharedStream)
        })
        .collect()
}

fn synthetic_sources(cmd: &SyntheticCommand) -> PipelineResult<Vec<SharedStream>> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let scene = SyntheticScene::scattered(cmd.num_devices, cmd.room, cmd.seed, now, cmd.frame_time)
        .with_frames(cmd.frames)
        .with_realtime(cmd.realtime);
    for (id, pos) in scene.ids().iter().zip(scene.positions()) {
        info!("{} placed at {}", id, pos);
    }
    Ok(scene
        .streams()?
        .into_iter()
        .map(|s| Arc::new(s) as SharedStream)
        .collect())
}
