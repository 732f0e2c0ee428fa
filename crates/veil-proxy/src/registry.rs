use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::net::TcpListener;
use veil_observe::{ResourceFinalizedSink, ResourceStateTracker};
use veil_profile::{
    client_hello_spec, session_preface, tcp_settings_for_os, EmulationProfile, SeededGrease,
};
use veil_tls::{CaConfig, CertificateAuthority};

use crate::config::ProxyConfig;
use crate::errors::VeilError;
use crate::interceptor::{self, InterceptorHandle, SessionRuntime};
use crate::matcher::BrowserRequestMatcher;
use crate::metrics::{ProxyMetrics, ProxyMetricsStore};
use crate::upstream;

const SESSION_STOP_GRACE: Duration = Duration::from_secs(5);

struct SessionEntry {
    port: u16,
    handle: Arc<InterceptorHandle>,
    matcher: Arc<BrowserRequestMatcher>,
    profile: Arc<EmulationProfile>,
    created_at: SystemTime,
}

/// Process-wide table of browser sessions and their allocated proxy
/// ports. The certificate authority and resource tracker are shared by
/// every session; the table lock is held only for map mutation, never
/// across network I/O.
pub struct SessionProxyRegistry {
    config: ProxyConfig,
    ca: Arc<CertificateAuthority>,
    tracker: Arc<ResourceStateTracker>,
    metrics: Arc<ProxyMetricsStore>,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionProxyRegistry {
    pub fn new(
        config: ProxyConfig,
        sink: Arc<dyn ResourceFinalizedSink>,
    ) -> Result<Self, VeilError> {
        config.validate()?;
        let ca = CertificateAuthority::open(CaConfig {
            data_dir: config.data_dir.clone(),
            ..CaConfig::default()
        })?;
        Ok(Self {
            config,
            ca: Arc::new(ca),
            tracker: Arc::new(ResourceStateTracker::new(sink)),
            metrics: Arc::new(ProxyMetricsStore::default()),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Handles `sessionStarted`: validates the profile, allocates a port,
    /// and starts the session's interceptor. Profile validation happens
    /// before any socket is opened; a session must not silently run
    /// unspoofed.
    pub async fn register_session(
        &self,
        session_id: &str,
        profile: EmulationProfile,
    ) -> Result<u16, VeilError> {
        let tcp = tcp_settings_for_os(&profile.os)?;

        let mut grease = SeededGrease::new(seed_for(session_id));
        let client_hello = client_hello_spec(&profile.tls, &mut grease);
        tracing::debug!(
            session_id,
            browser = %profile.browser,
            os = %profile.os,
            ja3 = %client_hello.ja3_string(),
            "resolved emulated client hello"
        );
        let connector = upstream::build_upstream_connector(
            &client_hello,
            self.config.upstream.verify_upstream_tls,
        )?;
        let h2_preface = session_preface(&profile.http2);

        {
            let sessions = self.sessions.lock().expect("session table lock poisoned");
            if sessions.contains_key(session_id) {
                return Err(VeilError::DuplicateSession(session_id.to_string()));
            }
        }

        let listener = bind_listener(&self.config).await?;
        let port = listener.local_addr()?.port();

        let profile = Arc::new(profile);
        let matcher = Arc::new(BrowserRequestMatcher::new(
            self.config.matcher.pending_window,
        ));
        let runtime = Arc::new(SessionRuntime {
            session_id: session_id.to_string(),
            tcp,
            h2_preface,
            connector,
            ca: Arc::clone(&self.ca),
            tracker: Arc::clone(&self.tracker),
            matcher: Arc::clone(&matcher),
            metrics: Arc::clone(&self.metrics),
            upstream: self.config.upstream.clone(),
            next_socket_id: AtomicU64::new(1),
        });
        let handle = Arc::new(interceptor::start(listener, runtime));

        let mut sessions = self.sessions.lock().expect("session table lock poisoned");
        if sessions.contains_key(session_id) {
            // Lost a registration race; the new interceptor must not leak.
            let stale = Arc::clone(&handle);
            tokio::spawn(async move {
                let _ = stale.stop(SESSION_STOP_GRACE).await;
            });
            return Err(VeilError::DuplicateSession(session_id.to_string()));
        }
        sessions.insert(
            session_id.to_string(),
            SessionEntry {
                port,
                handle,
                matcher,
                profile,
                created_at: SystemTime::now(),
            },
        );
        drop(sessions);

        self.metrics.record_session_start();
        tracing::debug!(session_id, port, "session proxy registered");
        Ok(port)
    }

    /// Handles `sessionEnded`: stops the interceptor, cancels in-flight
    /// work, and releases the port for reuse.
    pub async fn release_session(&self, session_id: &str) -> Result<(), VeilError> {
        let entry = {
            let mut sessions = self.sessions.lock().expect("session table lock poisoned");
            sessions
                .remove(session_id)
                .ok_or_else(|| VeilError::UnknownSession(session_id.to_string()))?
        };

        entry.matcher.cancel_pending();
        entry.handle.stop(SESSION_STOP_GRACE).await?;
        tracing::debug!(
            session_id,
            port = entry.port,
            lifetime_ms = entry
                .created_at
                .elapsed()
                .unwrap_or_default()
                .as_millis() as u64,
            "session proxy released"
        );
        Ok(())
    }

    pub fn proxy_port(&self, session_id: &str) -> Result<u16, VeilError> {
        let sessions = self.sessions.lock().expect("session table lock poisoned");
        sessions
            .get(session_id)
            .map(|entry| entry.port)
            .ok_or_else(|| VeilError::UnknownSession(session_id.to_string()))
    }

    pub fn session_profile(&self, session_id: &str) -> Result<Arc<EmulationProfile>, VeilError> {
        let sessions = self.sessions.lock().expect("session table lock poisoned");
        sessions
            .get(session_id)
            .map(|entry| Arc::clone(&entry.profile))
            .ok_or_else(|| VeilError::UnknownSession(session_id.to_string()))
    }

    /// Handles `pageRequestIssued` from the control channel. When the
    /// socket-level resource was observed first, the late-arriving
    /// descriptor is bound to it here.
    pub fn page_request_issued(
        &self,
        session_id: &str,
        url: &str,
        method: &str,
        initiator_frame_id: Option<String>,
        at: SystemTime,
    ) -> Result<(), VeilError> {
        let matcher = {
            let sessions = self.sessions.lock().expect("session table lock poisoned");
            let entry = sessions
                .get(session_id)
                .ok_or_else(|| VeilError::UnknownSession(session_id.to_string()))?;
            Arc::clone(&entry.matcher)
        };

        if let Some((resource_id, descriptor)) =
            matcher.register_request(url, method, initiator_frame_id, at)
        {
            if !self.tracker.attach_request(resource_id, descriptor) {
                tracing::debug!(
                    session_id,
                    resource_id,
                    "matched resource already finalized before request descriptor arrived"
                );
            }
        }
        Ok(())
    }

    /// PEM of the root certificate the controlled browser must trust.
    pub fn ca_cert_pem(&self) -> String {
        self.ca.ca_cert_pem().to_string()
    }

    pub fn metrics(&self) -> ProxyMetrics {
        self.metrics.snapshot()
    }
}

async fn bind_listener(config: &ProxyConfig) -> Result<TcpListener, VeilError> {
    match config.preferred_port {
        None => TcpListener::bind((config.bind_addr, 0))
            .await
            .map_err(|error| VeilError::Bind {
                attempts: 1,
                detail: error.to_string(),
            }),
        Some(preferred) => {
            let mut last_error = None;
            for attempt in 0..config.bind_attempts {
                let candidate = preferred.wrapping_add(attempt as u16);
                match TcpListener::bind((config.bind_addr, candidate)).await {
                    Ok(listener) => return Ok(listener),
                    Err(error) => last_error = Some(error),
                }
            }
            Err(VeilError::Bind {
                attempts: config.bind_attempts,
                detail: last_error
                    .map(|error| error.to_string())
                    .unwrap_or_else(|| "no bind attempts made".to_string()),
            })
        }
    }
}

fn seed_for(session_id: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    session_id.hash(&mut hasher);
    hasher.finish()
}
