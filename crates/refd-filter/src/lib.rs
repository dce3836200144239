//! REFD filter: a file-activity interception pipeline.
//!
//! Handlers registered per operation type observe each request before and
//! after it runs. They snapshot files about to be destroyed, track what each
//! open handle did, and report one event per handle to a single consumer.

pub mod backup;
pub mod channel;
pub mod cli;
pub mod config;
pub mod context;
pub mod context_table;
pub mod dispatch;
pub mod entropy;
pub mod error;
pub mod host;
pub mod pipeline;
pub mod policy;
pub mod record;
pub mod registry;
pub mod request;
pub mod stats;
pub mod volume;

pub use backup::{path_hash, BackupId, BackupStore};
pub use channel::{ConsumerPort, EventChannel, Message};
pub use config::{FilterConfig, RecordFormat};
pub use context::{ContextKey, HandleContext};
pub use dispatch::{CompletionContext, Dispatcher, PreOutcome};
pub use error::{FilterError, Result};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use record::EventRecord;
pub use registry::{FeatureModule, OperationHandler, PostStatus, PreResult, RegistryBuilder};
pub use request::{IoRequest, IoStatus, OpCode};
pub use volume::{LocalHost, LocalVolume};
