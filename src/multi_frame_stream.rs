//! The combining stream: fans any number of named input streams into one
//! aggregate stream, one [MultiFrame] per synchronisation cycle.
//!
//! All state sits behind one mutex. Header waiters and frame waiters share
//! a single condition variable, so every mutation wakes everybody and each
//! waiter re-checks its own condition.

use crate::error::{PipelineError, PipelineResult};
use crate::frame::{FrameData, MultiFrame, StreamFrame};
use crate::header::{HeaderKey, StreamHeader};
use crate::stream::FrameStream;

use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

struct CombinerState {
    header: Option<Arc<StreamHeader>>,
    queues: HashMap<HeaderKey, VecDeque<Arc<StreamFrame>>>,
    open: bool,
    finishing: bool,
}

impl CombinerState {
    fn shut(&mut self) {
        self.open = false;
        self.header = None;
        self.queues.clear();
    }
}

/// A fan-in synchroniser. Children may join at any time, even after the
/// aggregate has started producing; a cycle is emitted as soon as at least
/// one child has a frame pending.
pub struct MultiFrameStream {
    id: String,
    min_headers: usize,
    fatal_on_reject: bool,
    blocking: AtomicBool,
    state: Mutex<CombinerState>,
    changed: Condvar,
}

impl MultiFrameStream {
    /// A combining stream whose header is available after the first child
    /// joins.
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_min_headers(id, 1)
    }

    /// A combining stream whose `get_header` waits until `min_headers`
    /// children have joined.
    pub fn with_min_headers(id: impl Into<String>, min_headers: usize) -> Self {
        Self {
            id: id.into(),
            min_headers: min_headers.max(1),
            fatal_on_reject: false,
            blocking: AtomicBool::new(true),
            state: Mutex::new(CombinerState {
                header: None,
                queues: HashMap::new(),
                open: true,
                finishing: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Makes a rejected child (mismatched frame time, duplicate id) close
    /// the stream, so its reader ends instead of waiting for a child that
    /// will never join.
    pub fn fatal_on_reject(mut self) -> Self {
        self.fatal_on_reject = true;
        self
    }

    /// In non-blocking mode `recv_frame` fails with `WouldBlock` instead of
    /// waiting for a child frame.
    pub fn set_blocking(&self, blocking: bool) {
        self.blocking.store(blocking, Ordering::Relaxed);
    }

    /// Number of children joined so far.
    pub fn child_count(&self) -> usize {
        self.lock()
            .header
            .as_ref()
            .and_then(|h| h.as_multi().map(|m| m.len()))
            .unwrap_or(0)
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        !self.lock().open
    }

    /// Frames queued and not yet collected, over all children.
    pub fn pending(&self) -> usize {
        self.lock().queues.values().map(VecDeque::len).sum()
    }

    /// Stops taking frames but lets the reader collect what is already
    /// queued. The stream closes itself once the queues run dry. Children
    /// that stopped producing are expected to call this rather than
    /// [FrameStream::close], which drops pending frames.
    pub fn finish(&self) {
        let mut state = self.lock();
        state.finishing = true;
        self.changed.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, CombinerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, CombinerState>) -> MutexGuard<'a, CombinerState> {
        self.changed
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn header_ready(&self, state: &CombinerState) -> bool {
        state
            .header
            .as_ref()
            .and_then(|h| h.as_multi())
            .map_or(false, |m| m.len() >= self.min_headers)
    }

    /// Takes at most one pending frame per child. `None` when no child
    /// contributed.
    fn collect_cycle(state: &mut CombinerState) -> Option<Arc<StreamFrame>> {
        let header = state.header.clone()?;
        let children = header.as_multi()?.children();

        let mut cycle = MultiFrame::empty(children.clone());
        let mut count = 0;
        for child in &children {
            let pending = state
                .queues
                .get_mut(&HeaderKey::of(child))
                .and_then(|q| q.pop_front());
            if let Some(frame) = pending {
                cycle.set_frame(frame);
                count += 1;
            }
        }

        if count == 0 {
            return None;
        }
        Some(header.make_frame(FrameData::Multi(cycle)))
    }
}

impl FrameStream for MultiFrameStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn get_header(&self) -> PipelineResult<Option<Arc<StreamHeader>>> {
        let mut state = self.lock();
        while state.open && !state.finishing && !self.header_ready(&state) {
            state = self.wait(state);
        }
        if !state.open || !self.header_ready(&state) {
            return Ok(None);
        }
        Ok(state.header.clone())
    }

    fn set_header(&self, header: Arc<StreamHeader>) -> PipelineResult<()> {
        let mut state = self.lock();
        let joined = match &state.header {
            None => {
                if !state.open {
                    return Ok(());
                }
                debug!("{} : first child {}", self.id, header.id);
                state.header = Some(StreamHeader::multi(self.id.clone(), header.clone()));
                Ok(())
            }
            Some(aggregate) => match aggregate.as_multi() {
                Some(multi) => multi.add(Arc::clone(&header)),
                None => Err(PipelineError::Validation(format!(
                    "{} has a non-aggregate header",
                    self.id
                ))),
            },
        };
        if let Err(err) = joined {
            if self.fatal_on_reject {
                warn!("{} : closing, child {} rejected : {}", self.id, header.id, err);
                state.shut();
                self.changed.notify_all();
            }
            return Err(err);
        }
        self.changed.notify_all();
        Ok(())
    }

    fn send_frame(&self, frame: Arc<StreamFrame>) -> PipelineResult<()> {
        let mut state = self.lock();
        if !state.open || state.finishing {
            return Ok(());
        }
        state
            .queues
            .entry(frame.header_key())
            .or_default()
            .push_back(frame);
        self.changed.notify_all();
        Ok(())
    }

    fn recv_frame(&self) -> PipelineResult<Option<Arc<StreamFrame>>> {
        let mut state = self.lock();
        loop {
            if !state.open {
                return Ok(None);
            }
            if let Some(frame) = Self::collect_cycle(&mut state) {
                self.changed.notify_all();
                return Ok(Some(frame));
            }
            if state.finishing {
                debug!("{} : drained", self.id);
                state.shut();
                self.changed.notify_all();
                return Ok(None);
            }
            if !self.blocking.load(Ordering::Relaxed) {
                return Err(PipelineError::WouldBlock);
            }
            state = self.wait(state);
        }
    }

    fn close(&self) {
        let mut state = self.lock();
        state.shut();
        self.changed.notify_all();
    }
}
