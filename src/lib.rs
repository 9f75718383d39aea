//! Domain decomposition for distributed sky-map pipelines.
//!
//! A dataset stored as one flat row-major file is cut into slabs along one axis, one slab per
//! rank, and each rank's slab is cut again into sub-calls small enough for the accelerator.
//! [`Backend`] wires this to a [`ProcessGroup`], a memory budget and rank-aware logging; the
//! planning itself ([`divide`], [`byte_offset`], [`plan_chunks`], [`Datastream`]) is pure.

pub mod backend;
pub mod chunks;
pub mod config;
pub mod datastream;
pub mod domain;
pub mod error;
pub mod group;
pub mod logging;
pub mod memory;
pub mod shape;
pub mod timing;

#[cfg(feature = "python")]
mod python;

pub use backend::Backend;
pub use chunks::plan_chunks;
pub use config::BackendConfig;
pub use datastream::{ChunkDescriptor, Chunks, Datastream, DatastreamSpec};
pub use domain::{byte_offset, divide, DecompositionKind, Partition, SizeTable, SlabDecomposition};
pub use error::{DecompError, Result};
pub use group::{ChannelGroup, ProcessGroup, SingleProcess};
pub use logging::{LogLevel, RankLogger, Severity};
pub use timing::StepTimes;
