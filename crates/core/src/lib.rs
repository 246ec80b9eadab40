//! Thea core: an automated media-processing pipeline.
//!
//! Watches an import directory, classifies video files against
//! user-defined workflows, drives a pool of external encoder processes
//! through multiple output profiles, enriches metadata from an external
//! movie database, and persists the resulting media graph.
//!
//! The [`orchestrator::Orchestrator`] wires everything together; external
//! collaborators plug in through the adapter traits
//! ([`metadata::MetadataFetcher`], [`store::MediaStore`],
//! [`transcode::TranscoderRunner`], [`adapters::Clock`],
//! [`adapters::Filesystem`]).

pub mod adapters;
pub mod config;
pub mod events;
pub mod ingest;
pub mod metadata;
pub mod orchestrator;
pub mod queue;
pub mod store;
pub mod tasks;
pub mod testing;
pub mod transcode;
pub mod workers;
pub mod workflow;

pub use config::{
    default_config_path, load_config, load_config_from_str, validate_config, Config,
    ConfigError, LogLevel,
};
pub use orchestrator::{
    Orchestrator, OrchestratorConfig, OrchestratorError, StatusCallback, StatusSnapshot,
};
pub use queue::{Item, ItemId, Queue, QueueError, Stage, Status, Trouble, TroubleResolution};
pub use transcode::{TranscodeCommander, TranscodeTask, TranscoderRunner};
pub use workflow::{Criterion, Target, Workflow, WorkflowSet};
