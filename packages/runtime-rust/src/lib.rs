//! Flowyard Runtime: artifact registry, service lifecycle management,
//! bounded record channels, and operation dispatch.

pub mod builtin;
pub mod channel;
pub mod config;
pub mod error;
pub mod ingest;
mod instance;
pub mod loader;
pub mod logic;
pub mod manager;
pub mod notify;
pub mod registry;
pub mod service;
mod wiring;
pub mod worker;

pub use channel::RecordChannel;
pub use config::{NotificationMode, RuntimeConfig, TopologyOps};
pub use error::{ChannelError, ManagerError};
pub use ingest::{Ingestor, Outputs};
pub use loader::{DescriptorLoader, FileLoader, LoadError, MemoryLoader, SchemeLoader};
pub use logic::{ImplementationCatalog, ServiceContext, ServiceFactory, ServiceLogic};
pub use manager::ServiceManager;
pub use notify::{
    CompositeSink, LifecycleEvent, MemorySink, NotificationSink, Notifier, TracingSink,
};
pub use registry::{ArtifactInfo, ServiceInfo};
