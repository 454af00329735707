//! # tc-jobs
//!
//! Request validation and job scheduling for the transcoding service.
//!
//! - [`JobDescriptorBuilder`] turns raw requests into immutable
//!   [`tc_core::JobSpec`]s.
//! - [`JobCoordinator`] admits jobs against a fixed [`SlotPool`], queues the
//!   overflow, enforces deadlines and drives each job through a
//!   [`tc_av::TranscodeRunner`].
//! - [`MediaStore`] opens job sources and sinks.

pub mod builder;
pub mod coordinator;
pub mod slots;
pub mod store;

pub use builder::{FormatPreset, JobDescriptorBuilder, TranscodeRequest};
pub use coordinator::{
    CancelGuard, CoordinatorStats, JobCoordinator, JobHandle, JobOutcome, JobStatus,
};
pub use slots::{ResourceSlot, SlotPool, SlotStats};
pub use store::{
    LocalMediaStore, MediaStore, OpenedSource, OutputRef, OutputSink, PendingOutput,
};
