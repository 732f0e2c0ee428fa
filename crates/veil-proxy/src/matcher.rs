use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use veil_observe::BrowserRequestDescriptor;

/// Correlates page-level requests reported by the browser-control channel
/// with socket-level resources observed by the interceptor.
///
/// Neither side arrives with guaranteed ordering, so both are queued:
/// whichever arrives second completes the match. Same-host requests match
/// strictly in registration order; browsers issue same-host requests
/// roughly in the order scripted, and FIFO minimizes misattribution
/// against any content-based heuristic. A match, once made, is permanent.
pub struct BrowserRequestMatcher {
    window: Duration,
    state: Mutex<MatcherState>,
    retired_count: AtomicU64,
}

#[derive(Default)]
struct MatcherState {
    pending_requests: HashMap<String, VecDeque<BrowserRequestDescriptor>>,
    pending_resources: HashMap<String, VecDeque<PendingResource>>,
    bound: HashMap<u64, BrowserRequestDescriptor>,
}

struct PendingResource {
    resource_id: u64,
    observed_at: SystemTime,
}

impl BrowserRequestMatcher {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(MatcherState::default()),
            retired_count: AtomicU64::new(0),
        }
    }

    /// Queues a page-level request. When a socket-level resource for the
    /// same host is already waiting, the pair binds immediately and the
    /// bound resource id is returned so the caller can attach the
    /// descriptor to the live resource.
    pub fn register_request(
        &self,
        url: &str,
        method: &str,
        initiator_frame_id: Option<String>,
        at: SystemTime,
    ) -> Option<(u64, BrowserRequestDescriptor)> {
        let host = match host_of_url(url) {
            Some(host) => host,
            None => {
                tracing::warn!(url, "page request with unparsable url; not matchable");
                return None;
            }
        };

        let descriptor = BrowserRequestDescriptor {
            url: url.to_string(),
            method: method.to_string(),
            initiator_frame_id,
            registered_at: at,
        };

        let mut state = self.state.lock().expect("matcher lock poisoned");
        let state = &mut *state;
        self.retire_stale_locked(state, at);

        if let Some(queue) = state.pending_resources.get_mut(&host) {
            while let Some(front) = queue.front() {
                if age_between(front.observed_at, at) > self.window {
                    queue.pop_front();
                    continue;
                }
                let resource = queue.pop_front().expect("front checked above");
                state.bound.insert(resource.resource_id, descriptor.clone());
                return Some((resource.resource_id, descriptor));
            }
        }

        state
            .pending_requests
            .entry(host)
            .or_default()
            .push_back(descriptor);
        None
    }

    /// Called when the interceptor observes a resource to `host` starting.
    /// Binds the earliest pending request for that host registered within
    /// the window; otherwise queues the resource for a late-arriving
    /// control-channel report.
    pub fn match_resource(
        &self,
        host: &str,
        resource_id: u64,
        observed_at: SystemTime,
    ) -> Option<BrowserRequestDescriptor> {
        let host = host.to_ascii_lowercase();
        let mut state = self.state.lock().expect("matcher lock poisoned");
        let state = &mut *state;
        self.retire_stale_locked(state, observed_at);

        if let Some(queue) = state.pending_requests.get_mut(&host) {
            while let Some(front) = queue.front() {
                if age_between(front.registered_at, observed_at) > self.window {
                    let retired = queue.pop_front().expect("front checked above");
                    self.retire(&retired);
                    continue;
                }
                let descriptor = queue.pop_front().expect("front checked above");
                state.bound.insert(resource_id, descriptor.clone());
                return Some(descriptor);
            }
        }

        state
            .pending_resources
            .entry(host)
            .or_default()
            .push_back(PendingResource {
                resource_id,
                observed_at,
            });
        None
    }

    pub fn binding_for(&self, resource_id: u64) -> Option<BrowserRequestDescriptor> {
        let state = self.state.lock().expect("matcher lock poisoned");
        state.bound.get(&resource_id).cloned()
    }

    /// Requests retired as "not observed at network layer" (cache hits).
    pub fn retired_count(&self) -> u64 {
        self.retired_count.load(Ordering::Relaxed)
    }

    /// Drops all pending entries at session teardown.
    pub fn cancel_pending(&self) {
        let mut state = self.state.lock().expect("matcher lock poisoned");
        let pending: usize = state
            .pending_requests
            .values()
            .map(|queue| queue.len())
            .sum();
        if pending > 0 {
            tracing::debug!(pending, "dropping pending browser requests at teardown");
        }
        state.pending_requests.clear();
        state.pending_resources.clear();
    }

    fn retire_stale_locked(&self, state: &mut MatcherState, now: SystemTime) {
        for queue in state.pending_requests.values_mut() {
            while let Some(front) = queue.front() {
                if age_between(front.registered_at, now) <= self.window {
                    break;
                }
                let retired = queue.pop_front().expect("front checked above");
                self.retire(&retired);
            }
        }
        for queue in state.pending_resources.values_mut() {
            while let Some(front) = queue.front() {
                if age_between(front.observed_at, now) <= self.window {
                    break;
                }
                queue.pop_front();
            }
        }
    }

    fn retire(&self, request: &BrowserRequestDescriptor) {
        self.retired_count.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            url = %request.url,
            method = %request.method,
            "page request not observed at network layer (likely served from cache)"
        );
    }
}

fn age_between(earlier: SystemTime, later: SystemTime) -> Duration {
    // Tolerates either side arriving first: the age is the absolute gap.
    later
        .duration_since(earlier)
        .or_else(|_| earlier.duration_since(later))
        .unwrap_or(Duration::ZERO)
}

/// Extracts the lowercased host from an absolute URL without pulling in a
/// full URL parser; `scheme://host[:port]/...` and bare authorities both
/// work.
fn host_of_url(url: &str) -> Option<String> {
    let after_scheme = match url.find("://") {
        Some(index) => &url[index + 3..],
        None => url,
    };
    let authority = after_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);

    let host = if let Some(rest) = authority.strip_prefix('[') {
        rest.split(']').next().unwrap_or_default()
    } else {
        authority.split(':').next().unwrap_or_default()
    };

    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::{host_of_url, BrowserRequestMatcher};

    const WINDOW: Duration = Duration::from_secs(5);

    fn base_time() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000)
    }

    #[test]
    fn host_extraction() {
        assert_eq!(
            host_of_url("https://API.example.org/path?q=1"),
            Some("api.example.org".to_string())
        );
        assert_eq!(
            host_of_url("https://example.org:8443/"),
            Some("example.org".to_string())
        );
        assert_eq!(
            host_of_url("https://[2001:db8::1]:443/x"),
            Some("2001:db8::1".to_string())
        );
        assert_eq!(host_of_url("https:///nohost"), None);
    }

    #[test]
    fn request_first_then_resource_binds() {
        let matcher = BrowserRequestMatcher::new(WINDOW);
        let t0 = base_time();

        assert!(matcher
            .register_request("https://example.org/app.js", "GET", None, t0)
            .is_none());
        let bound = matcher
            .match_resource("example.org", 1, t0 + Duration::from_millis(20))
            .expect("must bind");
        assert_eq!(bound.url, "https://example.org/app.js");
        assert_eq!(matcher.binding_for(1).expect("bound").method, "GET");
    }

    #[test]
    fn resource_first_then_request_binds() {
        let matcher = BrowserRequestMatcher::new(WINDOW);
        let t0 = base_time();

        assert!(matcher.match_resource("example.org", 9, t0).is_none());
        let (resource_id, descriptor) = matcher
            .register_request(
                "https://example.org/late",
                "GET",
                None,
                t0 + Duration::from_millis(40),
            )
            .expect("must bind to the waiting resource");
        assert_eq!(resource_id, 9);
        assert_eq!(descriptor.url, "https://example.org/late");
    }

    #[test]
    fn same_host_requests_match_in_registration_order() {
        let matcher = BrowserRequestMatcher::new(WINDOW);
        let t0 = base_time();

        matcher.register_request("https://api.example.org/first", "GET", None, t0);
        matcher.register_request(
            "https://api.example.org/second",
            "GET",
            None,
            t0 + Duration::from_millis(5),
        );

        // Socket resources arrive in reverse order; binding still follows
        // registration order.
        let first_bound = matcher
            .match_resource("api.example.org", 21, t0 + Duration::from_millis(80))
            .expect("first observed socket binds");
        let second_bound = matcher
            .match_resource("api.example.org", 20, t0 + Duration::from_millis(90))
            .expect("second observed socket binds");

        assert_eq!(first_bound.url, "https://api.example.org/first");
        assert_eq!(second_bound.url, "https://api.example.org/second");
    }

    #[test]
    fn stale_requests_retire_as_unobserved() {
        let matcher = BrowserRequestMatcher::new(WINDOW);
        let t0 = base_time();

        matcher.register_request("https://example.org/cached.css", "GET", None, t0);
        let late = t0 + WINDOW + Duration::from_secs(1);
        assert!(matcher.match_resource("example.org", 3, late).is_none());
        assert_eq!(matcher.retired_count(), 1);
    }

    #[test]
    fn bindings_are_permanent_and_not_rematched() {
        let matcher = BrowserRequestMatcher::new(WINDOW);
        let t0 = base_time();

        matcher.register_request("https://example.org/once", "GET", None, t0);
        matcher
            .match_resource("example.org", 5, t0 + Duration::from_millis(10))
            .expect("binds");
        assert!(
            matcher
                .match_resource("example.org", 6, t0 + Duration::from_millis(20))
                .is_none(),
            "consumed request must not match a second resource"
        );
        assert_eq!(matcher.binding_for(5).expect("kept").url, "https://example.org/once");
    }

    #[test]
    fn hosts_do_not_cross_match() {
        let matcher = BrowserRequestMatcher::new(WINDOW);
        let t0 = base_time();

        matcher.register_request("https://a.example.org/x", "GET", None, t0);
        assert!(matcher
            .match_resource("b.example.org", 8, t0 + Duration::from_millis(10))
            .is_none());
    }
}
