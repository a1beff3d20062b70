//! Connection-state protocol for outposts: wire envelopes, the TTL-backed
//! instance state store, per-connection sessions and update broadcasts.

pub mod access;
pub mod broadcast;
pub mod channels;
pub mod clock;
pub mod error;
pub mod outpost_ipc;
pub mod session;
pub mod state_store;

pub use access::{AccessGate, CallerIdentity, ConnectRequest, OutpostDirectory, OutpostRecord};
pub use broadcast::{BroadcastReport, Broadcaster};
pub use channels::{new_channel_id, ChannelLayer, ChannelRegistry, DeliveryError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::OutpostError;
pub use outpost_ipc::{Instruction, MessageEnvelope};
pub use session::{OutpostSession, SessionContext};
pub use state_store::{
    state_ttl, InstanceKey, InstanceState, InstanceStateStore, MemoryInstanceStore, StoreError,
    OUTPOST_HELLO_INTERVAL,
};
