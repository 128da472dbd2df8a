//! The processing stages. Each implements [Component](crate::component::Component);
//! [pipelines] chains them into the three kinds of pipe the topology runs.

pub mod consolidate;
pub mod distance_matrix;
pub mod embedding;
pub mod geometry;
pub mod impulse;
pub mod pipelines;
pub mod tdoa;

pub use pipelines::{DualPipeline, MergePipeline, SinglePipeline};
