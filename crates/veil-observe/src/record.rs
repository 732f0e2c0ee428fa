use std::net::{IpAddr, SocketAddr};
use std::time::SystemTime;

use crate::state::ResourceState;

/// Observed facts about one accepted connection and its outbound peer.
/// Timestamps are filled in as milestones occur; the record is immutable
/// once `closed_at` is set and it has been handed to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketRecord {
    pub id: u64,
    pub session_id: String,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    pub dns_resolved_ip: Option<IpAddr>,
    pub alpn: Option<String>,
    pub server_name: Option<String>,
    pub created_at: SystemTime,
    pub dns_lookup_at: Option<SystemTime>,
    pub connected_at: Option<SystemTime>,
    pub closed_at: Option<SystemTime>,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub error: Option<String>,
}

impl SocketRecord {
    pub fn new(id: u64, session_id: impl Into<String>, created_at: SystemTime) -> Self {
        Self {
            id,
            session_id: session_id.into(),
            local_addr: None,
            remote_addr: None,
            dns_resolved_ip: None,
            alpn: None,
            server_name: None,
            created_at,
            dns_lookup_at: None,
            connected_at: None,
            closed_at: None,
            bytes_read: 0,
            bytes_written: 0,
            error: None,
        }
    }
}

/// A page-level request as reported by the browser-control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserRequestDescriptor {
    pub url: String,
    pub method: String,
    pub initiator_frame_id: Option<String>,
    pub registered_at: SystemTime,
}

/// Everything the core knows about a resource once it reaches a terminal
/// state. Handed outward exactly once per resource; storage format is the
/// consumer's concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedResource {
    pub resource_id: u64,
    pub session_id: String,
    pub states: Vec<(ResourceState, SystemTime)>,
    pub error: Option<String>,
    pub socket: Option<SocketRecord>,
    pub request: Option<BrowserRequestDescriptor>,
}

impl FinalizedResource {
    pub fn terminal_state(&self) -> Option<ResourceState> {
        self.states.last().map(|(state, _)| *state)
    }
}
