//! Earshot works out where a set of devices sit relative to each other by
//! listening. Every device streams audio; loud, short clicks are picked out
//! of each stream, the same click heard by two devices gives the difference
//! in its arrival times, and the differences over all device pairs give a
//! distance matrix from which relative coordinates are recovered.
//!
//! The work is spread over a graph of pipes, each on its own thread:
//!
//! - one [pipe](pipe_block::PipeBlock) per device, detecting clicks
//! - one per device pair, fed by a [combining stream](multi_frame_stream)
//!   that joins the two devices' frames, matching their clicks
//! - one merge pipe, fed by every pair, assembling the matrix and the
//!   coordinates
//!
//! The [topology] grows this graph as devices join.

#![warn(missing_docs)]
/// Commandline arguments of the `earshot` binary
pub mod args;
pub mod buffer_stream;
pub mod component;
pub mod components;
pub mod config;
pub mod error;
pub mod frame;
pub mod header;
/// Classical scaling of distance matrices
pub mod localizer;
pub mod multi_frame_stream;
pub mod pipe_block;
pub mod stream;
pub mod synthetic_stream;
pub mod text_stream;
pub mod topology;
pub mod wav_stream;
