use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use veil_observe::{ResourceState, ResourceStateTracker, SocketRecord};
use veil_profile::{Http2SessionPreface, Http2Setting};

use crate::matcher::BrowserRequestMatcher;
use crate::relay::RelayTotals;

pub(crate) struct H2RelayContext {
    pub session_id: String,
    pub host: String,
    /// Snapshot of the carrying connection's socket record, attached to
    /// every stream-level resource at finalize.
    pub socket_template: SocketRecord,
    pub tracker: Arc<ResourceStateTracker>,
    pub matcher: Arc<BrowserRequestMatcher>,
    /// Bounds inactivity per stream; a stalled peer errors the resource
    /// instead of leaking it.
    pub idle_timeout: Duration,
}

enum StreamEvent {
    State(u64, ResourceState, SystemTime),
    Finalize(u64, Option<String>),
}

#[derive(Clone, Default)]
struct H2ByteCounters {
    request_bytes: Arc<AtomicU64>,
    response_bytes: Arc<AtomicU64>,
}

/// Relays a multiplexed HTTP/2 connection stream-by-stream. Each browser
/// stream becomes its own resource carried over the shared socket; the
/// emulated SETTINGS and connection window are applied to the upstream
/// session before its first frame goes out.
pub(crate) async fn relay_http2<D, U>(
    context: H2RelayContext,
    preface: &Http2SessionPreface,
    downstream: D,
    upstream: U,
) -> io::Result<RelayTotals>
where
    D: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    U: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut upstream_builder = h2::client::Builder::new();
    configure_upstream_builder(&mut upstream_builder, preface);
    let (upstream_sender, upstream_connection) = upstream_builder
        .handshake::<_, Bytes>(upstream)
        .await
        .map_err(|error| h2_error_to_io("upstream HTTP/2 handshake failed", error))?;
    let upstream_driver = tokio::spawn(upstream_connection);

    let mut downstream_connection = h2::server::Builder::new()
        .handshake(downstream)
        .await
        .map_err(|error| h2_error_to_io("downstream HTTP/2 handshake failed", error))?;

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let consumer = tokio::spawn(consume_stream_events(
        event_rx,
        Arc::clone(&context.tracker),
        context.socket_template.clone(),
    ));

    let counters = H2ByteCounters::default();
    let mut stream_tasks = tokio::task::JoinSet::new();
    let mut first_error: Option<io::Error> = None;

    while let Some(next_stream) = downstream_connection.accept().await {
        match next_stream {
            Ok((request, respond)) => {
                let resource_id = context.tracker.begin_resource(&context.session_id);
                if let Some(descriptor) =
                    context
                        .matcher
                        .match_resource(&context.host, resource_id, SystemTime::now())
                {
                    context.tracker.attach_request(resource_id, descriptor);
                }

                let events = event_tx.clone();
                let sender = upstream_sender.clone();
                let stream_counters = counters.clone();
                let idle_timeout = context.idle_timeout;
                stream_tasks.spawn(async move {
                    relay_h2_stream(
                        events,
                        resource_id,
                        sender,
                        request,
                        respond,
                        stream_counters,
                        idle_timeout,
                    )
                    .await;
                });
            }
            Err(error) => {
                if first_error.is_none() && !is_benign_h2_error(&error) {
                    first_error = Some(h2_error_to_io("downstream HTTP/2 accept failed", error));
                }
                break;
            }
        }
    }

    while stream_tasks.join_next().await.is_some() {}
    drop(upstream_sender);
    drop(event_tx);

    match upstream_driver.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            if first_error.is_none() && !is_benign_h2_error(&error) {
                first_error = Some(h2_error_to_io("upstream HTTP/2 driver failed", error));
            }
        }
        Err(join_error) => {
            if first_error.is_none() {
                first_error = Some(io::Error::other(format!(
                    "upstream HTTP/2 driver join failed: {join_error}"
                )));
            }
        }
    }

    let _ = consumer.await;

    let totals = RelayTotals {
        from_client: counters.request_bytes.load(Ordering::Relaxed),
        from_server: counters.response_bytes.load(Ordering::Relaxed),
    };

    match first_error {
        Some(error) => Err(error),
        None => Ok(totals),
    }
}

/// Single consumer of the per-stream event channel; the tracker sees one
/// writer regardless of how many streams race.
async fn consume_stream_events(
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
    tracker: Arc<ResourceStateTracker>,
    socket_template: SocketRecord,
) {
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::State(resource_id, state, at) => {
                if let Err(error) = tracker.record_state(resource_id, state, at) {
                    tracing::warn!(%error, "misordered stream observation");
                }
            }
            StreamEvent::Finalize(resource_id, error_reason) => {
                if let Some(reason) = error_reason {
                    tracker.record_error(resource_id, &reason, SystemTime::now());
                }
                tracker.attach_socket(resource_id, socket_template.clone());
                tracker.finalize(resource_id);
            }
        }
    }
}

async fn relay_h2_stream(
    events: mpsc::UnboundedSender<StreamEvent>,
    resource_id: u64,
    upstream_sender: h2::client::SendRequest<Bytes>,
    downstream_request: http::Request<h2::RecvStream>,
    mut downstream_respond: h2::server::SendResponse<Bytes>,
    counters: H2ByteCounters,
    idle_timeout: Duration,
) {
    let emit = |state: ResourceState| {
        let _ = events.send(StreamEvent::State(resource_id, state, SystemTime::now()));
    };
    let finish = |error: Option<String>| {
        let _ = events.send(StreamEvent::Finalize(resource_id, error));
    };

    emit(ResourceState::RequestSending);

    let (mut request_parts, mut downstream_request_body) = downstream_request.into_parts();
    request_parts.version = http::Version::HTTP_2;
    let upstream_request = http::Request::from_parts(request_parts, ());
    let request_end_stream = downstream_request_body.is_end_stream();

    let mut ready_sender = match upstream_sender.ready().await {
        Ok(sender) => sender,
        Err(error) => {
            downstream_respond.send_reset(h2::Reason::CANCEL);
            finish(Some(format!("upstream HTTP/2 sender not ready: {error}")));
            return;
        }
    };
    let (response_future, mut upstream_request_stream) =
        match ready_sender.send_request(upstream_request, request_end_stream) {
            Ok(parts) => parts,
            Err(error) => {
                downstream_respond.send_reset(h2::Reason::CANCEL);
                finish(Some(format!("forwarding HTTP/2 request failed: {error}")));
                return;
            }
        };

    if !request_end_stream {
        match relay_h2_body(
            &mut downstream_request_body,
            &mut upstream_request_stream,
            idle_timeout,
        )
        .await
        {
            Ok(bytes_forwarded) => {
                counters
                    .request_bytes
                    .fetch_add(bytes_forwarded, Ordering::Relaxed);
            }
            Err(error) => {
                upstream_request_stream.send_reset(h2::Reason::CANCEL);
                downstream_respond.send_reset(h2::Reason::CANCEL);
                finish(Some(format!("request body relay failed: {error}")));
                return;
            }
        }
    }
    emit(ResourceState::RequestSent);

    let upstream_response = match tokio::time::timeout(idle_timeout, response_future).await {
        Ok(Ok(response)) => response,
        Ok(Err(error)) => {
            downstream_respond.send_reset(h2::Reason::CANCEL);
            finish(Some(format!("awaiting upstream response failed: {error}")));
            return;
        }
        Err(_) => {
            downstream_respond.send_reset(h2::Reason::CANCEL);
            finish(Some("upstream response headers idle timeout".to_string()));
            return;
        }
    };
    emit(ResourceState::ResponseHeaders);

    let (response_parts, mut upstream_response_body) = upstream_response.into_parts();
    let response_end_stream = upstream_response_body.is_end_stream();
    let downstream_response = http::Response::from_parts(response_parts, ());
    let mut downstream_response_stream =
        match downstream_respond.send_response(downstream_response, response_end_stream) {
            Ok(stream) => stream,
            Err(error) => {
                finish(Some(format!("sending response headers failed: {error}")));
                return;
            }
        };

    if !response_end_stream {
        emit(ResourceState::ResponseBody);
        match relay_h2_body(
            &mut upstream_response_body,
            &mut downstream_response_stream,
            idle_timeout,
        )
        .await
        {
            Ok(bytes_forwarded) => {
                counters
                    .response_bytes
                    .fetch_add(bytes_forwarded, Ordering::Relaxed);
            }
            Err(error) => {
                downstream_response_stream.send_reset(h2::Reason::CANCEL);
                finish(Some(format!("response body relay failed: {error}")));
                return;
            }
        }
    }

    emit(ResourceState::Complete);
    finish(None);
}

async fn relay_h2_body(
    source: &mut h2::RecvStream,
    sink: &mut h2::SendStream<Bytes>,
    idle_timeout: Duration,
) -> io::Result<u64> {
    let mut total = 0_u64;
    let mut end_stream_sent = false;

    loop {
        let next_data = match tokio::time::timeout(idle_timeout, source.data()).await {
            Ok(Some(next_data)) => next_data,
            Ok(None) => break,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "HTTP/2 body relay idle timeout",
                ));
            }
        };
        let data =
            next_data.map_err(|error| h2_error_to_io("reading HTTP/2 body frame failed", error))?;
        let is_end_stream = source.is_end_stream();
        let frame_len = data.len();

        send_h2_data(sink, data, is_end_stream).await?;
        if frame_len > 0 {
            source
                .flow_control()
                .release_capacity(frame_len)
                .map_err(|error| h2_error_to_io("releasing receive capacity failed", error))?;
            total += frame_len as u64;
        }
        if is_end_stream {
            end_stream_sent = true;
            break;
        }
    }

    if !end_stream_sent {
        let trailers = tokio::time::timeout(idle_timeout, source.trailers())
            .await
            .map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, "HTTP/2 trailers idle timeout")
            })?
            .map_err(|error| h2_error_to_io("reading HTTP/2 trailers failed", error))?;
        match trailers {
            Some(trailers) => sink
                .send_trailers(trailers)
                .map_err(|error| h2_error_to_io("sending HTTP/2 trailers failed", error))?,
            None => send_h2_data(sink, Bytes::new(), true).await?,
        }
    }

    Ok(total)
}

async fn send_h2_data(
    sink: &mut h2::SendStream<Bytes>,
    mut data: Bytes,
    end_stream: bool,
) -> io::Result<()> {
    if data.is_empty() {
        return sink
            .send_data(data, end_stream)
            .map_err(|error| h2_error_to_io("sending HTTP/2 data frame failed", error));
    }

    while !data.is_empty() {
        sink.reserve_capacity(data.len());
        let capacity = match std::future::poll_fn(|cx| sink.poll_capacity(cx)).await {
            Some(Ok(capacity)) if capacity > 0 => capacity,
            Some(Ok(_)) => continue,
            Some(Err(error)) => {
                return Err(h2_error_to_io("polling send capacity failed", error));
            }
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "HTTP/2 send stream closed before capacity became available",
                ));
            }
        };
        let chunk = data.split_to(capacity.min(data.len()));
        let is_last = data.is_empty();
        sink.send_data(chunk, end_stream && is_last)
            .map_err(|error| h2_error_to_io("sending HTTP/2 data frame failed", error))?;
    }
    Ok(())
}

fn configure_upstream_builder(builder: &mut h2::client::Builder, preface: &Http2SessionPreface) {
    for setting in &preface.settings {
        match *setting {
            Http2Setting::HeaderTableSize(value) => {
                builder.header_table_size(value);
            }
            Http2Setting::EnablePush(value) => {
                builder.enable_push(value);
            }
            Http2Setting::MaxConcurrentStreams(value) => {
                builder.max_concurrent_streams(value);
            }
            Http2Setting::InitialWindowSize(value) => {
                builder.initial_window_size(value);
            }
            Http2Setting::MaxHeaderListSize(value) => {
                builder.max_header_list_size(value);
            }
        }
    }
    builder.initial_connection_window_size(preface.initial_connection_window_size);
}

fn h2_error_to_io(stage: &str, error: h2::Error) -> io::Error {
    if error.is_io() {
        match error.into_io() {
            Some(io_error) => io_error,
            None => io::Error::other(stage.to_string()),
        }
    } else {
        io::Error::other(format!("{stage}: {error}"))
    }
}

fn is_benign_h2_error(error: &h2::Error) -> bool {
    matches!(
        error.reason(),
        Some(h2::Reason::NO_ERROR) | Some(h2::Reason::CANCEL)
    )
}
