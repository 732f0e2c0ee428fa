use thiserror::Error;

use crate::state::ResourceState;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ObserveError {
    #[error("invalid transition for resource {resource_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        resource_id: u64,
        from: Option<ResourceState>,
        to: ResourceState,
    },
    #[error("unknown resource {0}")]
    UnknownResource(u64),
}
