use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::error::ObserveError;
use crate::record::{BrowserRequestDescriptor, FinalizedResource, SocketRecord};
use crate::sink::ResourceFinalizedSink;
use crate::state::{transition_allowed, ResourceState};

#[derive(Debug)]
struct ResourceEntry {
    session_id: String,
    states: Vec<(ResourceState, SystemTime)>,
    error: Option<String>,
    socket: Option<SocketRecord>,
    request: Option<BrowserRequestDescriptor>,
    suspect: bool,
}

impl ResourceEntry {
    fn current_state(&self) -> Option<ResourceState> {
        self.states.last().map(|(state, _)| *state)
    }
}

/// Per-resource state machine store.
///
/// Each resource is owned by the connection task driving it until
/// `finalize`, so the inner lock is held only for single map operations.
/// A misordered observation is a bug to investigate, not a reason to drop
/// user traffic: `record_state` rejects it and marks the resource suspect,
/// and callers log and continue.
pub struct ResourceStateTracker {
    entries: Mutex<HashMap<u64, ResourceEntry>>,
    next_resource_id: AtomicU64,
    sink: Arc<dyn ResourceFinalizedSink>,
}

impl ResourceStateTracker {
    pub fn new(sink: Arc<dyn ResourceFinalizedSink>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_resource_id: AtomicU64::new(1),
            sink,
        }
    }

    pub fn begin_resource(&self, session_id: &str) -> u64 {
        let resource_id = self.next_resource_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock().expect("tracker lock poisoned");
        entries.insert(
            resource_id,
            ResourceEntry {
                session_id: session_id.to_string(),
                states: Vec::new(),
                error: None,
                socket: None,
                request: None,
                suspect: false,
            },
        );
        resource_id
    }

    pub fn record_state(
        &self,
        resource_id: u64,
        state: ResourceState,
        at: SystemTime,
    ) -> Result<(), ObserveError> {
        let mut entries = self.entries.lock().expect("tracker lock poisoned");
        let entry = entries
            .get_mut(&resource_id)
            .ok_or(ObserveError::UnknownResource(resource_id))?;

        let current = entry.current_state();
        if !transition_allowed(current, state) {
            entry.suspect = true;
            return Err(ObserveError::InvalidTransition {
                resource_id,
                from: current,
                to: state,
            });
        }

        // Observed clocks can jitter; recorded timestamps stay monotone.
        let at = match entry.states.last() {
            Some((_, last_at)) if at < *last_at => *last_at,
            _ => at,
        };
        entry.states.push((state, at));
        Ok(())
    }

    /// Transitions the resource to the `Error` terminal with a captured
    /// reason. A no-op when the resource is already terminal.
    pub fn record_error(&self, resource_id: u64, reason: &str, at: SystemTime) {
        if self
            .record_state(resource_id, ResourceState::Error, at)
            .is_ok()
        {
            let mut entries = self.entries.lock().expect("tracker lock poisoned");
            if let Some(entry) = entries.get_mut(&resource_id) {
                entry.error = Some(reason.to_string());
            }
        }
    }

    pub fn attach_socket(&self, resource_id: u64, socket: SocketRecord) {
        let mut entries = self.entries.lock().expect("tracker lock poisoned");
        if let Some(entry) = entries.get_mut(&resource_id) {
            entry.socket = Some(socket);
        }
    }

    /// Binds the browser request descriptor to a live resource. Returns
    /// false when the resource has already been finalized (late control
    /// channel delivery) or never existed.
    pub fn attach_request(&self, resource_id: u64, request: BrowserRequestDescriptor) -> bool {
        let mut entries = self.entries.lock().expect("tracker lock poisoned");
        match entries.get_mut(&resource_id) {
            Some(entry) => {
                entry.request = Some(request);
                true
            }
            None => false,
        }
    }

    /// Persists the resource through the sink exactly once. The entry is
    /// removed on delivery, so a second call for the same id is a no-op.
    pub fn finalize(&self, resource_id: u64) -> bool {
        let entry = {
            let mut entries = self.entries.lock().expect("tracker lock poisoned");
            entries.remove(&resource_id)
        };

        let Some(entry) = entry else {
            tracing::debug!(resource_id, "finalize called for unknown or already finalized resource");
            return false;
        };

        if entry.suspect {
            tracing::warn!(resource_id, "finalizing resource with misordered observations");
        }

        self.sink.on_resource_finalized(FinalizedResource {
            resource_id,
            session_id: entry.session_id,
            states: entry.states,
            error: entry.error,
            socket: entry.socket,
            request: entry.request,
        });
        true
    }

    /// Current recorded timeline, for diagnostics and tests.
    pub fn snapshot_states(&self, resource_id: u64) -> Option<Vec<(ResourceState, SystemTime)>> {
        let entries = self.entries.lock().expect("tracker lock poisoned");
        entries.get(&resource_id).map(|entry| entry.states.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    use super::ResourceStateTracker;
    use crate::error::ObserveError;
    use crate::record::SocketRecord;
    use crate::sink::VecSink;
    use crate::state::ResourceState;

    fn tracker_with_sink() -> (ResourceStateTracker, VecSink) {
        let sink = VecSink::default();
        (ResourceStateTracker::new(Arc::new(sink.clone())), sink)
    }

    #[test]
    fn records_full_lifecycle_and_finalizes_once() {
        let (tracker, sink) = tracker_with_sink();
        let resource_id = tracker.begin_resource("session-1");
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(100);

        for (offset, state) in [
            ResourceState::DnsResolving,
            ResourceState::DnsResolved,
            ResourceState::TcpConnecting,
            ResourceState::TcpConnected,
            ResourceState::TlsHandshaking,
            ResourceState::TlsHandshaked,
            ResourceState::RequestSending,
            ResourceState::RequestSent,
            ResourceState::ResponseHeaders,
            ResourceState::ResponseBody,
            ResourceState::Complete,
        ]
        .into_iter()
        .enumerate()
        {
            tracker
                .record_state(resource_id, state, base + Duration::from_millis(offset as u64))
                .expect("legal transition");
        }

        tracker.attach_socket(resource_id, SocketRecord::new(1, "session-1", base));
        assert!(tracker.finalize(resource_id));
        assert!(!tracker.finalize(resource_id), "second finalize is a no-op");

        let records = sink.snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].terminal_state(), Some(ResourceState::Complete));
        assert!(records[0].socket.is_some());
    }

    #[test]
    fn invalid_transition_is_rejected_and_resource_survives() {
        let (tracker, _sink) = tracker_with_sink();
        let resource_id = tracker.begin_resource("session-1");
        let now = SystemTime::now();

        tracker
            .record_state(resource_id, ResourceState::RequestSent, now)
            .expect("skip-ahead is legal");
        let error = tracker
            .record_state(resource_id, ResourceState::DnsResolving, now)
            .expect_err("backwards transition must fail");
        assert!(matches!(error, ObserveError::InvalidTransition { .. }));

        // The resource keeps operating after the bad observation.
        tracker
            .record_state(resource_id, ResourceState::Complete, now)
            .expect("forward transition still legal");
    }

    #[test]
    fn complete_and_error_are_mutually_exclusive() {
        let (tracker, sink) = tracker_with_sink();
        let resource_id = tracker.begin_resource("session-1");
        let now = SystemTime::now();

        tracker.record_error(resource_id, "upstream connect refused", now);
        let error = tracker
            .record_state(resource_id, ResourceState::Complete, now)
            .expect_err("complete after error must fail");
        assert!(matches!(error, ObserveError::InvalidTransition { .. }));

        tracker.finalize(resource_id);
        let records = sink.snapshot();
        assert_eq!(records[0].terminal_state(), Some(ResourceState::Error));
        assert_eq!(
            records[0].error.as_deref(),
            Some("upstream connect refused")
        );
    }

    #[test]
    fn timestamps_never_regress() {
        let (tracker, _sink) = tracker_with_sink();
        let resource_id = tracker.begin_resource("session-1");
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(500);

        tracker
            .record_state(resource_id, ResourceState::TcpConnecting, base)
            .expect("first");
        tracker
            .record_state(
                resource_id,
                ResourceState::TcpConnected,
                base - Duration::from_secs(5),
            )
            .expect("second");

        let states = tracker.snapshot_states(resource_id).expect("states");
        assert_eq!(states[1].1, base, "earlier timestamp clamps to previous");
    }
}
