//! Ferry: concurrent batch transfers between a local filesystem and a
//! remote object store.
//!
//! A job is a list of descriptors run by [`orchestrator::Orchestrator`] on a
//! bounded worker pool. Workers ([`upload::UploadWorker`],
//! [`download::DownloadWorker`]) report through a [`progress::Publisher`];
//! the orchestrator turns those events into display slots, a job-wide
//! counter and one [`types::TransferResult`] per descriptor.

pub mod config;
pub mod conflict;
pub mod display;
pub mod download;
pub mod error;
pub mod logger;
pub mod manifest;
pub mod orchestrator;
pub mod progress;
pub mod retry;
pub mod transport;
pub mod types;
pub mod upload;

pub use config::TransferConfig;
pub use error::{TransferError, TransportError};
pub use orchestrator::{CancelHandle, Dispatcher, JobReport, Orchestrator, TransferWorker};
pub use types::{
    AggregationMode, DownloadDescriptor, DuplicatePolicy, Metadata, NamingMode, TransferDescriptor,
    TransferResult, UploadDescriptor,
};
