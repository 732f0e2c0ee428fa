use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use boring::ssl::SslConnector;
use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use veil_observe::{ResourceState, ResourceStateTracker, SocketRecord};
use veil_profile::{Http2SessionPreface, TcpStackSettings};
use veil_tls::CertificateAuthority;

use crate::config::UpstreamConfig;
use crate::connect::{
    parse_connect_head, read_connect_head, write_proxy_response, ConnectTarget, PrefixedStream,
    MAX_CONNECT_HEAD_BYTES,
};
use crate::errors::VeilError;
use crate::http2_relay::{relay_http2, H2RelayContext};
use crate::matcher::BrowserRequestMatcher;
use crate::metrics::ProxyMetricsStore;
use crate::relay::{relay_bidirectional, RelayMilestone};
use crate::tls_failure::classify_tls_error;
use crate::upstream;

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(3);

/// Everything one session's connection tasks share. Built once at session
/// start; the profile-derived pieces never change afterwards.
pub(crate) struct SessionRuntime {
    pub session_id: String,
    pub tcp: TcpStackSettings,
    pub h2_preface: Http2SessionPreface,
    pub connector: SslConnector,
    pub ca: Arc<CertificateAuthority>,
    pub tracker: Arc<ResourceStateTracker>,
    pub matcher: Arc<BrowserRequestMatcher>,
    pub metrics: Arc<ProxyMetricsStore>,
    pub upstream: UpstreamConfig,
    pub next_socket_id: AtomicU64,
}

pub struct InterceptorHandle {
    local_port: u16,
    shutdown_tx: watch::Sender<bool>,
    join: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl InterceptorHandle {
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Signals the accept loop and all connection tasks to wind down,
    /// waiting up to `grace` before abandoning the join. Idempotent.
    pub async fn stop(&self, grace: Duration) -> Result<(), VeilError> {
        let _ = self.shutdown_tx.send(true);
        let mut guard = self.join.lock().await;
        let Some(handle) = guard.take() else {
            return Ok(());
        };

        let abort = handle.abort_handle();
        match tokio::time::timeout(grace, handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(join_error)) if join_error.is_cancelled() => Ok(()),
            Ok(Err(join_error)) => Err(VeilError::Join(join_error)),
            Err(_) => {
                abort.abort();
                Ok(())
            }
        }
    }
}

pub(crate) fn start(listener: TcpListener, runtime: Arc<SessionRuntime>) -> InterceptorHandle {
    let local_port = listener
        .local_addr()
        .map(|addr| addr.port())
        .unwrap_or_default();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let join = tokio::spawn(accept_loop(listener, runtime, shutdown_rx));
    InterceptorHandle {
        local_port,
        shutdown_tx,
        join: tokio::sync::Mutex::new(Some(join)),
    }
}

async fn accept_loop(
    listener: TcpListener,
    runtime: Arc<SessionRuntime>,
    shutdown_rx: watch::Receiver<bool>,
) {
    let mut tasks = JoinSet::new();
    let mut shutdown = shutdown_rx.clone();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _peer)) => {
                    let connection_runtime = Arc::clone(&runtime);
                    let connection_shutdown = shutdown_rx.clone();
                    tasks.spawn(handle_connection(
                        connection_runtime,
                        stream,
                        connection_shutdown,
                    ));
                }
                Err(error) => {
                    tracing::warn!(%error, "transient accept failure");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
            _ = shutdown.wait_for(|stopped| *stopped) => break,
        }

        while tasks.try_join_next().is_some() {}
    }

    drop(listener);
    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_DRAIN, drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

#[derive(Debug)]
struct InterceptFailure {
    code: &'static str,
    detail: String,
}

impl InterceptFailure {
    fn new(code: &'static str, detail: impl ToString) -> Self {
        Self {
            code,
            detail: detail.to_string(),
        }
    }

    fn reason(&self) -> String {
        format!("{}: {}", self.code, self.detail)
    }
}

async fn handle_connection(
    runtime: Arc<SessionRuntime>,
    mut downstream: TcpStream,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    runtime.metrics.record_connection_open();
    let socket_id = runtime.next_socket_id.fetch_add(1, Ordering::Relaxed);
    let mut socket = SocketRecord::new(socket_id, &runtime.session_id, SystemTime::now());

    let (head, remainder) = match read_connect_head(&mut downstream, MAX_CONNECT_HEAD_BYTES).await {
        Ok(parsed) => parsed,
        Err(error) => {
            if error.kind() != std::io::ErrorKind::UnexpectedEof {
                let _ = write_proxy_response(
                    &mut downstream,
                    "400 Bad Request",
                    "invalid or incomplete CONNECT request",
                )
                .await;
            }
            runtime.metrics.record_connection_close();
            return;
        }
    };

    let target = match parse_connect_head(&head) {
        Ok(target) => target,
        Err(error) => {
            tracing::debug!(%error, "rejecting malformed CONNECT");
            let _ =
                write_proxy_response(&mut downstream, "400 Bad Request", "invalid CONNECT request")
                    .await;
            runtime.metrics.record_connection_close();
            return;
        }
    };
    socket.server_name = Some(target.host.clone());

    let resource_id = runtime.tracker.begin_resource(&runtime.session_id);

    let outcome = tokio::select! {
        outcome = intercept(&runtime, &mut socket, resource_id, downstream, remainder, &target) => outcome,
        _ = shutdown_rx.wait_for(|stopped| *stopped) => Err(InterceptFailure::new(
            "session_teardown",
            "session closed during interception",
        )),
    };

    match outcome {
        Ok(()) => record_or_warn(&runtime.tracker, resource_id, ResourceState::Complete),
        Err(failure) => {
            let reason = failure.reason();
            runtime
                .tracker
                .record_error(resource_id, &reason, SystemTime::now());
            socket.error = Some(reason);
        }
    }

    socket.closed_at = Some(SystemTime::now());
    runtime.tracker.attach_socket(resource_id, socket);
    runtime.tracker.finalize(resource_id);
    runtime.metrics.record_connection_close();
}

/// The TLS-terminate/re-originate dance for one accepted connection.
///
/// The upstream side is established first so the downstream leaf can pin
/// the ALPN the origin actually negotiated; until the 200 goes out, any
/// failure is answered with a best-effort proxy error instead of a hang.
async fn intercept(
    runtime: &SessionRuntime,
    socket: &mut SocketRecord,
    resource_id: u64,
    mut downstream: TcpStream,
    remainder: Bytes,
    target: &ConnectTarget,
) -> Result<(), InterceptFailure> {
    let tracker = &runtime.tracker;

    record_or_warn(tracker, resource_id, ResourceState::DnsResolving);
    let addrs = match upstream::resolve_addrs(
        &target.host,
        target.port,
        runtime.upstream.connect_timeout,
    )
    .await
    {
        Ok(addrs) => addrs,
        Err(error) => {
            runtime.metrics.record_upstream_connect_error();
            let _ =
                write_proxy_response(&mut downstream, "502 Bad Gateway", "dns resolution failed")
                    .await;
            return Err(InterceptFailure::new("dns_error", error));
        }
    };
    socket.dns_lookup_at = Some(SystemTime::now());
    socket.dns_resolved_ip = Some(addrs[0].ip());
    record_or_warn(tracker, resource_id, ResourceState::DnsResolved);

    record_or_warn(tracker, resource_id, ResourceState::TcpConnecting);
    let upstream_tcp =
        match upstream::connect_with_stack(&addrs, &runtime.tcp, runtime.upstream.connect_timeout)
            .await
        {
            Ok(stream) => stream,
            Err(error) => {
                runtime.metrics.record_upstream_connect_error();
                let _ = write_proxy_response(
                    &mut downstream,
                    "502 Bad Gateway",
                    "upstream connect failed",
                )
                .await;
                return Err(InterceptFailure::new("connect_error", error));
            }
        };
    socket.connected_at = Some(SystemTime::now());
    socket.local_addr = upstream_tcp.local_addr().ok();
    socket.remote_addr = upstream_tcp.peer_addr().ok();
    record_or_warn(tracker, resource_id, ResourceState::TcpConnected);

    record_or_warn(tracker, resource_id, ResourceState::TlsHandshaking);
    let upstream_tls =
        match upstream::connect_tls(&runtime.connector, &target.host, upstream_tcp).await {
            Ok(stream) => stream,
            Err(error) => {
                runtime.metrics.record_tls_failure();
                let reason = classify_tls_error(&error.to_string());
                let _ = write_proxy_response(
                    &mut downstream,
                    "502 Bad Gateway",
                    "upstream tls handshake failed",
                )
                .await;
                return Err(InterceptFailure::new(reason.code(), error));
            }
        };
    let alpn = upstream::negotiated_alpn(&upstream_tls);
    socket.alpn = alpn.clone();

    let leaf = match runtime.ca.get_or_create(&target.host).await {
        Ok(leaf) => leaf,
        Err(error) => {
            let _ = write_proxy_response(
                &mut downstream,
                "502 Bad Gateway",
                "interception certificate unavailable",
            )
            .await;
            return Err(InterceptFailure::new("certificate_generation", error));
        }
    };
    // Pin the downstream ALPN to whatever the origin agreed to, so the
    // byte streams on both sides speak the same protocol.
    let downstream_alpn: Vec<Vec<u8>> = match alpn.as_deref() {
        Some(protocol) => vec![protocol.as_bytes().to_vec()],
        None => vec![b"http/1.1".to_vec()],
    };
    let server_config = match runtime.ca.server_config_for(&leaf, &downstream_alpn) {
        Ok(config) => config,
        Err(error) => {
            let _ = write_proxy_response(
                &mut downstream,
                "502 Bad Gateway",
                "interception certificate unavailable",
            )
            .await;
            return Err(InterceptFailure::new("certificate_generation", error));
        }
    };

    if let Err(error) = write_established(&mut downstream).await {
        return Err(InterceptFailure::new("downstream_io", error));
    }

    let acceptor = TlsAcceptor::from(server_config);
    let downstream_tls = match acceptor
        .accept(PrefixedStream::new(remainder, downstream))
        .await
    {
        Ok(stream) => stream,
        Err(error) => {
            runtime.metrics.record_tls_failure();
            let reason = classify_tls_error(&error.to_string());
            return Err(InterceptFailure::new(reason.code(), error));
        }
    };
    record_or_warn(tracker, resource_id, ResourceState::TlsHandshaked);

    if alpn.as_deref() == Some("h2") {
        let context = H2RelayContext {
            session_id: runtime.session_id.clone(),
            host: target.host.clone(),
            socket_template: socket.clone(),
            tracker: Arc::clone(tracker),
            matcher: Arc::clone(&runtime.matcher),
            idle_timeout: runtime.upstream.idle_timeout,
        };
        let totals = relay_http2(context, &runtime.h2_preface, downstream_tls, upstream_tls)
            .await
            .map_err(|error| InterceptFailure::new("h2_relay_error", error))?;
        socket.bytes_read += totals.from_client;
        socket.bytes_written += totals.from_server;
        return Ok(());
    }

    // One connection carries one logical resource below HTTP/2; bind the
    // browser request now that the protocol is known.
    if let Some(descriptor) =
        runtime
            .matcher
            .match_resource(&target.host, resource_id, SystemTime::now())
    {
        tracker.attach_request(resource_id, descriptor);
    }

    let mut downstream_tls = downstream_tls;
    let mut upstream_tls = upstream_tls;
    let totals = relay_bidirectional(
        &mut downstream_tls,
        &mut upstream_tls,
        runtime.upstream.idle_timeout,
        |milestone| {
            record_or_warn(tracker, resource_id, milestone_state(milestone));
        },
    )
    .await
    .map_err(|error| InterceptFailure::new("relay_error", error))?;
    socket.bytes_read += totals.from_client;
    socket.bytes_written += totals.from_server;
    Ok(())
}

async fn write_established(stream: &mut TcpStream) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    stream.flush().await
}

fn milestone_state(milestone: RelayMilestone) -> ResourceState {
    match milestone {
        RelayMilestone::RequestSending => ResourceState::RequestSending,
        RelayMilestone::RequestSent => ResourceState::RequestSent,
        RelayMilestone::ResponseHeaders => ResourceState::ResponseHeaders,
        RelayMilestone::ResponseBody => ResourceState::ResponseBody,
    }
}

fn record_or_warn(tracker: &ResourceStateTracker, resource_id: u64, state: ResourceState) {
    if let Err(error) = tracker.record_state(resource_id, state, SystemTime::now()) {
        tracing::warn!(%error, "misordered resource observation");
    }
}
