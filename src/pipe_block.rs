//! A PipeBlock runs one [Component] on its own thread: it reads frames
//! from a source stream, converts them and writes the result to every
//! attached output. Outputs can be attached at any point of the pipe's
//! life; a late output is handed the already derived header first.

use crate::component::Component;
use crate::error::{PipelineError, PipelineResult};
use crate::frame::StreamFrame;
use crate::header::StreamHeader;
use crate::stream::SharedStream;

use log::{debug, error, info, warn};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

/// Lifecycle of a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    /// Built, thread not yet waiting on the source header
    Created,
    /// Waiting for the source header or running `init`
    Initializing,
    /// Forwarding frames
    Running,
    /// Source exhausted, closing outputs
    Draining,
    /// Finished or failed; outputs can no longer be added
    Closed,
}

struct Outputs {
    streams: Vec<SharedStream>,
    header: Option<Arc<StreamHeader>>,
    state: PipeState,
}

/// One source stream, one component, and any number of outputs.
///
/// The output set, the derived header and the state share one lock. `init`
/// and the header broadcast run under it, and so does each forward, so an
/// output attached concurrently sees the header exactly once and never
/// half a forward.
pub struct PipeBlock {
    id: String,
    outputs: Mutex<Outputs>,
    count: AtomicU64,
}

impl PipeBlock {
    /// Instantiates a new PipeBlock with no outputs.
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            outputs: Mutex::new(Outputs {
                streams: Vec::new(),
                header: None,
                state: PipeState::Created,
            }),
            count: AtomicU64::new(0),
        })
    }

    /// Instantiates a new PipeBlock that starts with one output.
    pub fn with_output(id: impl Into<String>, output: SharedStream) -> Arc<Self> {
        let pipe = Self::new(id);
        pipe.lock().streams.push(output);
        pipe
    }

    /// The pipe's name, also used for its thread.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PipeState {
        self.lock().state
    }

    /// Frames forwarded so far.
    pub fn frames_processed(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// The header produced by `init`, once known.
    pub fn output_header(&self) -> Option<Arc<StreamHeader>> {
        self.lock().header.clone()
    }

    /// Attaches another output. If the header is already known it is sent
    /// to the new output before anything else.
    pub fn add_output(&self, output: SharedStream) -> PipelineResult<()> {
        let mut outputs = self.lock();
        if matches!(outputs.state, PipeState::Draining | PipeState::Closed) {
            return Err(PipelineError::ClosedPipeline);
        }
        info!(
            "Adding output {} to pipe {} at frame {}",
            output.id(),
            self.id,
            self.frames_processed()
        );
        if let Some(header) = &outputs.header {
            output.set_header(Arc::clone(header))?;
        }
        outputs.streams.push(output);
        Ok(())
    }

    /// Runs the pipe on a named thread of its own.
    pub fn spawn(
        self: &Arc<Self>,
        input: SharedStream,
        component: Box<dyn Component>,
    ) -> io::Result<JoinHandle<()>> {
        let pipe = Arc::clone(self);
        thread::Builder::new()
            .name(self.id.clone())
            .spawn(move || pipe.run(input, component))
    }

    /// Runs the pipe on the calling thread until its source ends or a stage
    /// fails. A failure stops only this pipe: its outputs stay open for
    /// whoever else feeds them.
    pub fn run(&self, input: SharedStream, mut component: Box<dyn Component>) {
        self.lock().state = PipeState::Initializing;

        let in_header = match input.get_header() {
            Ok(Some(header)) => header,
            Ok(None) => {
                info!("{} : source closed before its header arrived.", self.id);
                self.drain(component.as_mut());
                return;
            }
            Err(err) => return self.fail(&input, component.as_mut(), "reading header", err),
        };

        if let Err(err) = self.initialize(component.as_mut(), in_header) {
            return self.fail(&input, component.as_mut(), "init", err);
        }
        debug!("{} : running {}.", self.id, component);

        loop {
            let frame = match input.recv_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => return self.fail(&input, component.as_mut(), "receiving", err),
            };
            match component.process(frame) {
                Ok(Some(out)) => self.forward(out),
                Ok(None) => {}
                Err(err) => return self.fail(&input, component.as_mut(), "process", err),
            }
        }

        self.drain(component.as_mut());
    }

    fn initialize(
        &self,
        component: &mut dyn Component,
        in_header: Arc<StreamHeader>,
    ) -> PipelineResult<()> {
        let mut outputs = self.lock();
        let header = component.init(in_header)?;
        // an output that rejects the header gets no frames either
        outputs.streams.retain(|out| match out.set_header(Arc::clone(&header)) {
            Ok(()) => true,
            Err(err) => {
                warn!("{} : header rejected by {}, detaching : {}.", self.id, out.id(), err);
                false
            }
        });
        outputs.header = Some(header);
        outputs.state = PipeState::Running;
        Ok(())
    }

    fn forward(&self, frame: Arc<StreamFrame>) {
        let outputs = self.lock();
        for out in &outputs.streams {
            if let Err(err) = out.send_frame(Arc::clone(&frame)) {
                warn!("{} : received error {} from {}.", self.id, err, out.id());
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn drain(&self, component: &mut dyn Component) {
        let mut outputs = self.lock();
        outputs.state = PipeState::Draining;
        info!(
            "Done with pipe {} count={}",
            self.id,
            self.frames_processed()
        );
        for out in &outputs.streams {
            out.close();
        }
        if let Err(err) = component.close() {
            warn!("{} : error during terminating : {}.", self.id, err);
        }
        outputs.state = PipeState::Closed;
        info!("{} : terminated.", self.id);
    }

    /// Stops the pipe after a fatal error. The source is closed, since
    /// nobody will read it again; the outputs are left to their other
    /// producers.
    fn fail(
        &self,
        input: &SharedStream,
        component: &mut dyn Component,
        during: &str,
        err: PipelineError,
    ) {
        error!("{} : failed during {} : {}.", self.id, during, err);
        input.close();
        let mut outputs = self.lock();
        outputs.state = PipeState::Closed;
        if let Err(err) = component.close() {
            warn!("{} : error during terminating : {}.", self.id, err);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Outputs> {
        self.outputs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_stream::BufferStream;
    use crate::component::PassThrough;
    use crate::frame::FrameData;
    use crate::stream::FrameStream;
    use std::fmt;
    use std::time::{Duration, Instant};

    fn wait_for(pipe: &PipeBlock, state: PipeState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while pipe.state() != state {
            assert!(Instant::now() < deadline, "pipe never reached {:?}", state);
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Fails on the frame with the given sequence number
    struct FailAt(u64);

    impl Component for FailAt {
        fn init(&mut self, in_header: Arc<StreamHeader>) -> PipelineResult<Arc<StreamHeader>> {
            Ok(in_header)
        }

        fn process(
            &mut self,
            frame: Arc<StreamFrame>,
        ) -> PipelineResult<Option<Arc<StreamFrame>>> {
            if frame.seq_num == self.0 {
                return Err(PipelineError::Validation("bad frame".to_string()));
            }
            Ok(Some(frame))
        }

        fn close(&mut self) -> PipelineResult<()> {
            Ok(())
        }
    }

    impl fmt::Display for FailAt {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "FailAt({})", self.0)
        }
    }

    /// Forwards only even frames
    struct EvenOnly;

    impl Component for EvenOnly {
        fn init(&mut self, in_header: Arc<StreamHeader>) -> PipelineResult<Arc<StreamHeader>> {
            Ok(in_header)
        }

        fn process(
            &mut self,
            frame: Arc<StreamFrame>,
        ) -> PipelineResult<Option<Arc<StreamFrame>>> {
            Ok((frame.seq_num % 2 == 0).then_some(frame))
        }

        fn close(&mut self) -> PipelineResult<()> {
            Ok(())
        }
    }

    impl fmt::Display for EvenOnly {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "EvenOnly")
        }
    }

    #[test]
    fn forwards_header_and_frames_then_closes_outputs() {
        let input = Arc::new(BufferStream::new("in"));
        let output = Arc::new(BufferStream::new("out"));
        let header = StreamHeader::plain("dev", 0, 100);

        let pipe = PipeBlock::with_output("pipe", output.clone());
        let th = pipe.spawn(input.clone(), Box::new(PassThrough::new())).unwrap();

        input.set_header(header.clone()).unwrap();
        wait_for(&pipe, PipeState::Running);
        for _ in 0..3 {
            input.send_frame(header.make_frame(FrameData::Empty)).unwrap();
        }
        input.close();
        th.join().unwrap();

        assert_eq!(pipe.state(), PipeState::Closed);
        assert_eq!(pipe.frames_processed(), 3);
        assert!(output.is_closed());
        let seqs: Vec<u64> = std::iter::from_fn(|| output.recv_frame().unwrap())
            .map(|f| f.seq_num)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn late_output_receives_header_first() {
        let input = Arc::new(BufferStream::new("in"));
        let header = StreamHeader::plain("dev", 0, 100);
        input.set_header(header.clone()).unwrap();

        let pipe = PipeBlock::new("pipe");
        let th = pipe.spawn(input.clone(), Box::new(PassThrough::new())).unwrap();
        wait_for(&pipe, PipeState::Running);

        let late = Arc::new(BufferStream::new("late"));
        pipe.add_output(late.clone()).unwrap();
        let delivered = late.peek_header().expect("header delivered on attach");
        assert!(Arc::ptr_eq(&delivered, &header));
        assert_eq!(late.pending(), 0);

        input.send_frame(header.make_frame(FrameData::Empty)).unwrap();
        assert_eq!(late.recv_frame().unwrap().unwrap().seq_num, 0);

        input.close();
        th.join().unwrap();
    }

    #[test]
    fn early_output_receives_header_when_produced() {
        let input = Arc::new(BufferStream::new("in"));
        let pipe = PipeBlock::new("pipe");
        let early = Arc::new(BufferStream::new("early"));
        pipe.add_output(early.clone()).unwrap();
        assert!(early.peek_header().is_none());

        let th = pipe.spawn(input.clone(), Box::new(PassThrough::new())).unwrap();
        input.set_header(StreamHeader::plain("dev", 0, 100)).unwrap();
        assert_eq!(early.get_header().unwrap().unwrap().id, "dev");

        input.close();
        th.join().unwrap();
    }

    #[test]
    fn closed_pipe_rejects_outputs() {
        let input = Arc::new(BufferStream::new("in"));
        let pipe = PipeBlock::new("pipe");
        let th = pipe.spawn(input.clone(), Box::new(PassThrough::new())).unwrap();
        input.close();
        th.join().unwrap();

        assert_eq!(pipe.state(), PipeState::Closed);
        let result = pipe.add_output(Arc::new(BufferStream::new("late")));
        assert!(matches!(result, Err(PipelineError::ClosedPipeline)));
    }

    #[test]
    fn failing_stage_stops_only_its_pipe() {
        let input = Arc::new(BufferStream::new("in"));
        let output = Arc::new(BufferStream::new("out"));
        let header = StreamHeader::plain("dev", 0, 100);
        input.set_header(header.clone()).unwrap();
        for _ in 0..4 {
            input.send_frame(header.make_frame(FrameData::Empty)).unwrap();
        }

        let pipe = PipeBlock::with_output("pipe", output.clone());
        pipe.spawn(input.clone(), Box::new(FailAt(2)))
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(pipe.state(), PipeState::Closed);
        assert_eq!(pipe.frames_processed(), 2);
        assert!(!output.is_closed());
        assert_eq!(output.pending(), 2);
        // the source is released so its producer stops queueing
        assert!(input.is_closed());
    }

    #[test]
    fn output_rejecting_the_header_is_detached() {
        let input = Arc::new(BufferStream::new("in"));
        let header = StreamHeader::plain("dev", 0, 100);
        input.set_header(header.clone()).unwrap();
        for _ in 0..3 {
            input.send_frame(header.make_frame(FrameData::Empty)).unwrap();
        }
        input.close();

        let taken = Arc::new(BufferStream::new("taken"));
        taken.set_header(StreamHeader::plain("other", 0, 100)).unwrap();
        let good = Arc::new(BufferStream::new("good"));
        let pipe = PipeBlock::with_output("pipe", taken.clone());
        pipe.add_output(good.clone()).unwrap();
        pipe.run(input, Box::new(PassThrough::new()));

        assert_eq!(pipe.frames_processed(), 3);
        assert_eq!(taken.pending(), 0);
        assert!(!taken.is_closed());
        assert_eq!(good.pending(), 3);
        assert!(good.is_closed());
    }

    #[test]
    fn skipped_frames_are_not_forwarded() {
        let input = Arc::new(BufferStream::new("in"));
        let output = Arc::new(BufferStream::new("out"));
        let header = StreamHeader::plain("dev", 0, 100);
        input.set_header(header.clone()).unwrap();
        for _ in 0..5 {
            input.send_frame(header.make_frame(FrameData::Empty)).unwrap();
        }
        input.close();

        let pipe = PipeBlock::with_output("pipe", output.clone());
        pipe.run(input, Box::new(EvenOnly));

        assert_eq!(pipe.frames_processed(), 3);
        let seqs: Vec<u64> = std::iter::from_fn(|| output.recv_frame().unwrap())
            .map(|f| f.seq_num)
            .collect();
        assert_eq!(seqs, vec![0, 2, 4]);
    }
}
