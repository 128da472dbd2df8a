//! The topology manager. It owns every pipe and grows the graph as devices
//! arrive:
//!
//! ```text
//! device a ──► device.a ──┬──► [a+b] ──► pair.a+b ──┐
//! device b ──► device.b ──┘                         ├──► [merge] ──► merge ──► sink
//! device c ──► device.c ───── ... ──► pair.a+c ─────┘
//! ```
//!
//! Every device gets its own pipe. Every new device also gets one combining
//! stream and one pair pipe per device already active, and all pair pipes
//! feed the single merge pipe.

use crate::components::pipelines::{DualPipeline, MergePipeline, SinglePipeline};
use crate::config::LocalizerConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::multi_frame_stream::MultiFrameStream;
use crate::pipe_block::{PipeBlock, PipeState};
use crate::stream::{Detached, FrameStream, SharedStream};

use log::{error, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

/// Canonical name of the pair made of two devices, the same whichever
/// device is named first.
pub fn pair_id(a: &str, b: &str) -> PipelineResult<String> {
    if a == b {
        return Err(PipelineError::Configuration(format!(
            "device {} cannot pair with itself",
            a
        )));
    }
    let (first, second) = if a < b { (a, b) } else { (b, a) };
    Ok(format!("{}+{}", first, second))
}

struct Device {
    id: String,
    pipe: Arc<PipeBlock>,
}

struct Pair {
    id: String,
    combiner: Arc<MultiFrameStream>,
    pipe: Arc<PipeBlock>,
}

#[derive(Default)]
struct Graph {
    devices: Vec<Device>,
    pairs: Vec<Pair>,
    device_threads: Vec<JoinHandle<()>>,
    pair_threads: Vec<JoinHandle<()>>,
}

/// All pipes of one localisation run.
pub struct Topology {
    config: LocalizerConfig,
    global: Arc<MultiFrameStream>,
    merge: Arc<PipeBlock>,
    merge_thread: Mutex<Option<JoinHandle<()>>>,
    graph: Mutex<Graph>,
}

impl Topology {
    /// Starts the merge pipe, writing coordinate frames to `sink`. Devices
    /// are added with [Topology::activate_device].
    pub fn new(config: LocalizerConfig, sink: SharedStream) -> PipelineResult<Self> {
        let global = Arc::new(MultiFrameStream::new("merge"));
        let merge = PipeBlock::with_output("merge", sink);
        let input: SharedStream = global.clone();
        let thread = merge.spawn(input, Box::new(MergePipeline::new(&config)))?;
        info!("Started merge pipe");
        Ok(Self {
            config,
            global,
            merge,
            merge_thread: Mutex::new(Some(thread)),
            graph: Mutex::new(Graph::default()),
        })
    }

    /// Adds a device. Starts its pipe and one pair pipe for every device
    /// already active. Fails on a device id that is already in use.
    pub fn activate_device(&self, source: SharedStream) -> PipelineResult<()> {
        let mut graph = self.lock();
        let id = source.id().to_string();
        if graph.devices.iter().any(|d| d.id == id) {
            return Err(PipelineError::Configuration(format!(
                "device {} is already active",
                id
            )));
        }
        let pairs = graph
            .devices
            .iter()
            .map(|other| pair_id(&other.id, &id))
            .collect::<PipelineResult<Vec<_>>>()?;

        let pipe = PipeBlock::new(format!("device.{}", id));
        let mut new_pairs = Vec::with_capacity(pairs.len());
        let mut new_threads = Vec::with_capacity(pairs.len());
        for (other, pair) in graph.devices.iter().zip(pairs) {
            // a device whose frames cannot pair up ends this pair, not the run
            let combiner =
                Arc::new(MultiFrameStream::with_min_headers(pair.clone(), 2).fatal_on_reject());
            if let Err(err) = other.pipe.add_output(Detached::new(combiner.clone())) {
                warn!("Not pairing {} with {} : {}", id, other.id, err);
                continue;
            }
            pipe.add_output(Detached::new(combiner.clone()))?;

            let pair_pipe = PipeBlock::with_output(
                format!("pair.{}", pair),
                Detached::new(self.global.clone()),
            );
            let input: SharedStream = combiner.clone();
            new_threads.push(pair_pipe.spawn(input, Box::new(DualPipeline::new(&self.config)))?);
            info!("Paired {} with {} as {}", other.id, id, pair);
            new_pairs.push(Pair {
                id: pair,
                combiner,
                pipe: pair_pipe,
            });
        }

        let thread = pipe.spawn(
            source,
            Box::new(SinglePipeline::new(self.config.impulse.clone())),
        )?;
        info!("Activated device {} ({} pairs)", id, new_pairs.len());

        graph.device_threads.push(thread);
        graph.pair_threads.extend(new_threads);
        graph.pairs.extend(new_pairs);
        graph.devices.push(Device { id, pipe });
        Ok(())
    }

    /// Ids of the active devices, in activation order.
    pub fn device_ids(&self) -> Vec<String> {
        self.lock().devices.iter().map(|d| d.id.clone()).collect()
    }

    /// Ids of the pairs, in creation order.
    pub fn pair_ids(&self) -> Vec<String> {
        self.lock().pairs.iter().map(|p| p.id.clone()).collect()
    }

    /// Pipe states by pipe id, merge pipe last.
    pub fn states(&self) -> Vec<(String, PipeState)> {
        let graph = self.lock();
        let devices = graph.devices.iter().map(|d| &d.pipe);
        let pairs = graph.pairs.iter().map(|p| &p.pipe);
        devices
            .chain(pairs)
            .chain(std::iter::once(&self.merge))
            .map(|pipe| (pipe.id().to_string(), pipe.state()))
            .collect()
    }

    /// Stops at once. Frames still queued in the combining streams are
    /// dropped; the device sources are left for their owners to close.
    pub fn shutdown(&self) {
        info!("Shutting down");
        for pair in &self.lock().pairs {
            pair.combiner.close();
        }
        self.global.close();
    }

    /// Waits for every pipe to finish, in stream order: devices first, then
    /// pairs, then the merge pipe. Each combining stream is finished once
    /// everything feeding it has stopped, so queued frames still reach the
    /// sink. Returns once the sink has been closed.
    pub fn join(&self) {
        let (device_threads, pair_threads, combiners) = {
            let mut graph = self.lock();
            let combiners: Vec<Arc<MultiFrameStream>> =
                graph.pairs.iter().map(|p| p.combiner.clone()).collect();
            (
                std::mem::take(&mut graph.device_threads),
                std::mem::take(&mut graph.pair_threads),
                combiners,
            )
        };

        join_all("device", device_threads);
        for combiner in &combiners {
            combiner.finish();
        }
        join_all("pair", pair_threads);
        self.global.finish();

        let merge = self
            .merge_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = merge {
            join_all("merge", vec![thread]);
        }
        info!(
            "All pipes finished, {} coordinate frames produced",
            self.merge.frames_processed()
        );
    }

    fn lock(&self) -> MutexGuard<'_, Graph> {
        self.graph.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn join_all(kind: &str, threads: Vec<JoinHandle<()>>) {
    for thread in threads {
        let name = thread.thread().name().unwrap_or(kind).to_string();
        if thread.join().is_err() {
            error!("{} pipe {} panicked", kind, name);
        }
    }
}
