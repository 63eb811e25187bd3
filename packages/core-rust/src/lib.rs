//! Flowyard Core: service lifecycle state machine, record payloads, and
//! wiring descriptors shared by the runtime and its collaborators.

pub mod clock;
pub mod descriptor;
pub mod state;
pub mod types;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use descriptor::{
    Direction, EndpointRef, PortSpec, RelationSpec, ServiceSpec, WiringDescriptor, WiringError,
};
pub use state::{IllegalTransition, ServiceState, Transition};
pub use types::{
    ArtifactId, ChannelId, ConfigMap, Record, ServiceId, ServiceKind, TypeTag, Value,
};
