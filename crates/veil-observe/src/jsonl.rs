use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::record::FinalizedResource;
use crate::sink::ResourceFinalizedSink;

pub const RESOURCE_LOG_SCHEMA: &str = "veil-resource-log-v1";

#[derive(Debug, Serialize)]
struct StateLine {
    state: &'static str,
    at_unix_ms: u64,
}

#[derive(Debug, Serialize)]
struct SocketLine {
    id: u64,
    local_addr: Option<String>,
    remote_addr: Option<String>,
    dns_resolved_ip: Option<String>,
    alpn: Option<String>,
    server_name: Option<String>,
    created_at_unix_ms: u64,
    dns_lookup_at_unix_ms: Option<u64>,
    connected_at_unix_ms: Option<u64>,
    closed_at_unix_ms: Option<u64>,
    bytes_read: u64,
    bytes_written: u64,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct RequestLine {
    url: String,
    method: String,
    initiator_frame_id: Option<String>,
    registered_at_unix_ms: u64,
}

#[derive(Debug, Serialize)]
struct ResourceLine {
    schema: &'static str,
    resource_id: u64,
    session_id: String,
    terminal: Option<&'static str>,
    error: Option<String>,
    states: Vec<StateLine>,
    socket: Option<SocketLine>,
    request: Option<RequestLine>,
}

#[derive(Debug)]
struct LogState {
    writer: BufWriter<File>,
    records_since_flush: usize,
}

/// Durable JSONL consumer: one schema-tagged line per finalized resource.
/// Write failures are counted and surfaced through `last_error` rather
/// than propagated into connection handling.
#[derive(Debug)]
pub struct JsonlResourceLog {
    path: PathBuf,
    flush_every: usize,
    state: Mutex<LogState>,
    write_error_count: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl JsonlResourceLog {
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        Self::with_flush_every(path, 1)
    }

    pub fn with_flush_every(path: impl Into<PathBuf>, flush_every: usize) -> io::Result<Self> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "resource log path must not be empty",
            ));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            flush_every: flush_every.max(1),
            state: Mutex::new(LogState {
                writer: BufWriter::new(file),
                records_since_flush: 0,
            }),
            write_error_count: AtomicU64::new(0),
            last_error: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flush(&self) -> io::Result<()> {
        let mut state = self.state.lock().expect("log lock poisoned");
        state.writer.flush()
    }

    pub fn write_error_count(&self) -> u64 {
        self.write_error_count.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("log lock poisoned").clone()
    }

    fn write_record(&self, record: &FinalizedResource) -> io::Result<()> {
        let line = resource_line(record);
        let mut encoded = serde_json::to_vec(&line)
            .map_err(|error| io::Error::other(format!("serialize resource record: {error}")))?;
        encoded.push(b'\n');

        let mut state = self.state.lock().expect("log lock poisoned");
        state.writer.write_all(&encoded)?;
        state.records_since_flush += 1;
        if state.records_since_flush >= self.flush_every {
            state.writer.flush()?;
            state.records_since_flush = 0;
        }
        Ok(())
    }
}

impl ResourceFinalizedSink for JsonlResourceLog {
    fn on_resource_finalized(&self, record: FinalizedResource) {
        if let Err(error) = self.write_record(&record) {
            self.write_error_count.fetch_add(1, Ordering::Relaxed);
            let mut last_error = self.last_error.lock().expect("log lock poisoned");
            *last_error = Some(error.to_string());
            tracing::warn!(
                resource_id = record.resource_id,
                %error,
                "failed to persist finalized resource"
            );
        }
    }
}

fn resource_line(record: &FinalizedResource) -> ResourceLine {
    ResourceLine {
        schema: RESOURCE_LOG_SCHEMA,
        resource_id: record.resource_id,
        session_id: record.session_id.clone(),
        terminal: record.terminal_state().map(|state| state.as_str()),
        error: record.error.clone(),
        states: record
            .states
            .iter()
            .map(|(state, at)| StateLine {
                state: state.as_str(),
                at_unix_ms: unix_ms(*at),
            })
            .collect(),
        socket: record.socket.as_ref().map(|socket| SocketLine {
            id: socket.id,
            local_addr: socket.local_addr.map(|addr| addr.to_string()),
            remote_addr: socket.remote_addr.map(|addr| addr.to_string()),
            dns_resolved_ip: socket.dns_resolved_ip.map(|ip| ip.to_string()),
            alpn: socket.alpn.clone(),
            server_name: socket.server_name.clone(),
            created_at_unix_ms: unix_ms(socket.created_at),
            dns_lookup_at_unix_ms: socket.dns_lookup_at.map(unix_ms),
            connected_at_unix_ms: socket.connected_at.map(unix_ms),
            closed_at_unix_ms: socket.closed_at.map(unix_ms),
            bytes_read: socket.bytes_read,
            bytes_written: socket.bytes_written,
            error: socket.error.clone(),
        }),
        request: record.request.as_ref().map(|request| RequestLine {
            url: request.url.clone(),
            method: request.method.clone(),
            initiator_frame_id: request.initiator_frame_id.clone(),
            registered_at_unix_ms: unix_ms(request.registered_at),
        }),
    }
}

fn unix_ms(at: SystemTime) -> u64 {
    match at.duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis() as u64,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::SystemTime;

    use super::{JsonlResourceLog, RESOURCE_LOG_SCHEMA};
    use crate::record::{FinalizedResource, SocketRecord};
    use crate::sink::ResourceFinalizedSink;
    use crate::state::ResourceState;

    fn sample_record() -> FinalizedResource {
        let now = SystemTime::now();
        let mut socket = SocketRecord::new(7, "session-1", now);
        socket.alpn = Some("h2".to_string());
        socket.closed_at = Some(now);
        FinalizedResource {
            resource_id: 42,
            session_id: "session-1".to_string(),
            states: vec![
                (ResourceState::TcpConnecting, now),
                (ResourceState::TcpConnected, now),
                (ResourceState::Complete, now),
            ],
            error: None,
            socket: Some(socket),
            request: None,
        }
    }

    #[test]
    fn writes_one_schema_tagged_line_per_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("resources.jsonl");
        let log = Arc::new(JsonlResourceLog::create(&path).expect("create log"));

        log.on_resource_finalized(sample_record());
        log.flush().expect("flush");

        let contents = std::fs::read_to_string(&path).expect("read log");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);

        let parsed: serde_json::Value = serde_json::from_str(lines[0]).expect("valid json");
        assert_eq!(parsed["schema"], RESOURCE_LOG_SCHEMA);
        assert_eq!(parsed["resource_id"], 42);
        assert_eq!(parsed["terminal"], "complete");
        assert_eq!(parsed["socket"]["alpn"], "h2");
        assert_eq!(log.write_error_count(), 0);
    }
}
