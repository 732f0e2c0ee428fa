use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyMetrics {
    pub sessions_started: u64,
    pub active_connections: u64,
    pub total_connections: u64,
    pub upstream_connect_error_count: u64,
    pub tls_failure_count: u64,
}

#[derive(Debug, Default)]
pub(crate) struct ProxyMetricsStore {
    sessions_started: AtomicU64,
    active_connections: AtomicU64,
    total_connections: AtomicU64,
    upstream_connect_error_count: AtomicU64,
    tls_failure_count: AtomicU64,
}

impl ProxyMetricsStore {
    pub(crate) fn snapshot(&self) -> ProxyMetrics {
        ProxyMetrics {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            upstream_connect_error_count: self.upstream_connect_error_count.load(Ordering::Relaxed),
            tls_failure_count: self.tls_failure_count.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_session_start(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connection_open(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connection_close(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(1))
            });
    }

    pub(crate) fn record_upstream_connect_error(&self) {
        self.upstream_connect_error_count
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tls_failure(&self) {
        self.tls_failure_count.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::ProxyMetricsStore;

    #[test]
    fn counter_contract() {
        let store = ProxyMetricsStore::default();
        store.record_session_start();
        store.record_connection_open();
        store.record_connection_open();
        store.record_connection_close();
        store.record_upstream_connect_error();
        store.record_tls_failure();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.sessions_started, 1);
        assert_eq!(snapshot.total_connections, 2);
        assert_eq!(snapshot.active_connections, 1);
        assert_eq!(snapshot.upstream_connect_error_count, 1);
        assert_eq!(snapshot.tls_failure_count, 1);
    }
}
