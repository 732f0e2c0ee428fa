mod error;
mod jsonl;
mod record;
mod sink;
mod state;
mod tracker;

pub use error::ObserveError;
pub use jsonl::{JsonlResourceLog, RESOURCE_LOG_SCHEMA};
pub use record::{BrowserRequestDescriptor, FinalizedResource, SocketRecord};
pub use sink::{NoopSink, ResourceFinalizedSink, VecSink};
pub use state::ResourceState;
pub use tracker::ResourceStateTracker;
