//! jobgate - job admission, scheduling and output retrieval
//!
//! This crate implements the asynchronous job subsystem of an automation
//! backend: clients submit or cancel work through a durable request
//! ledger, a scheduler admits and queues it against pluggable permission
//! and resource authorities, secrets travel through a transient expiring
//! cache instead of the durable store, and job output is retrievable as
//! a paginated tail or as an incrementally gzip-compressed download.

pub mod config;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod machine;
pub mod mediator;
pub mod output;
pub mod poller;
pub mod scheduler;

pub use config::GateConfig;
pub use error::{Error, Result};
pub use gateway::{Gateway, NewRequest};
pub use ledger::{ActionType, JobState, Ledger, MemoryLedger, RequestState, TimeSlot};
pub use machine::{ExecutionMachine, MachineRegistry};
pub use mediator::Mediator;
pub use output::{Download, DownloadContent, DownloadEncoding, OutputGateway};
pub use poller::{CancelSignal, Poller, PollerConfig, WaitOutcome};
pub use scheduler::{QueueState, Scheduler, TaskDef};
