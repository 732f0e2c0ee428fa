use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const IO_CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelayMilestone {
    RequestSending,
    RequestSent,
    ResponseHeaders,
    ResponseBody,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RelayTotals {
    pub from_client: u64,
    pub from_server: u64,
}

/// Bidirectional byte relay for non-multiplexed protocols.
///
/// Emits coarse lifecycle milestones from the traffic shape: the first
/// client chunk marks the request going out, the first server chunk marks
/// response headers, and any further server data marks the body. Each read
/// is guarded by the idle watchdog so a silent peer forces an error
/// instead of leaking a half-open resource.
pub(crate) async fn relay_bidirectional<C, S>(
    client: &mut C,
    server: &mut S,
    idle_timeout: Duration,
    mut on_milestone: impl FnMut(RelayMilestone),
) -> io::Result<RelayTotals>
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_buf = [0_u8; IO_CHUNK_SIZE];
    let mut server_buf = [0_u8; IO_CHUNK_SIZE];
    let mut totals = RelayTotals::default();
    let mut client_closed = false;
    let mut server_closed = false;
    let mut request_seen = false;
    let mut request_sent_seen = false;
    let mut response_headers_seen = false;
    let mut response_body_seen = false;

    loop {
        if client_closed && server_closed {
            return Ok(totals);
        }

        tokio::select! {
            result = read_with_idle_timeout(client, &mut client_buf, idle_timeout), if !client_closed => {
                let read = result?;
                if read == 0 {
                    client_closed = true;
                    let _ = server.shutdown().await;
                } else {
                    if !request_seen {
                        request_seen = true;
                        on_milestone(RelayMilestone::RequestSending);
                    }
                    server.write_all(&client_buf[..read]).await?;
                    server.flush().await?;
                    totals.from_client += read as u64;
                    if !request_sent_seen {
                        request_sent_seen = true;
                        on_milestone(RelayMilestone::RequestSent);
                    }
                }
            }
            result = read_with_idle_timeout(server, &mut server_buf, idle_timeout), if !server_closed => {
                let read = result?;
                if read == 0 {
                    server_closed = true;
                    let _ = client.shutdown().await;
                } else {
                    if !response_headers_seen {
                        response_headers_seen = true;
                        on_milestone(RelayMilestone::ResponseHeaders);
                    } else if !response_body_seen {
                        response_body_seen = true;
                        on_milestone(RelayMilestone::ResponseBody);
                    }
                    client.write_all(&server_buf[..read]).await?;
                    client.flush().await?;
                    totals.from_server += read as u64;
                }
            }
        }
    }
}

async fn read_with_idle_timeout<R>(
    stream: &mut R,
    buf: &mut [u8],
    idle_timeout: Duration,
) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(idle_timeout, stream.read(buf)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("relay idle timeout after {}ms", idle_timeout.as_millis()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::{relay_bidirectional, RelayMilestone};

    #[tokio::test]
    async fn relays_both_directions_and_reports_milestones() {
        let (mut browser_side, mut proxy_client_side) = tokio::io::duplex(4096);
        let (mut proxy_server_side, mut origin_side) = tokio::io::duplex(4096);

        let relay = tokio::spawn(async move {
            let mut milestones = Vec::new();
            let totals = relay_bidirectional(
                &mut proxy_client_side,
                &mut proxy_server_side,
                Duration::from_secs(5),
                |milestone| milestones.push(milestone),
            )
            .await
            .expect("relay completes");
            (totals, milestones)
        });

        browser_side
            .write_all(b"GET / HTTP/1.1\r\nhost: example.org\r\n\r\n")
            .await
            .expect("write request");

        let mut request = [0_u8; 64];
        let request_len = origin_side.read(&mut request).await.expect("origin reads");
        assert!(request_len > 0);

        origin_side
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\n")
            .await
            .expect("write headers");
        tokio::time::sleep(Duration::from_millis(20)).await;
        origin_side.write_all(b"ok").await.expect("write body");
        drop(origin_side);

        let mut response = Vec::new();
        browser_side
            .read_to_end(&mut response)
            .await
            .expect("browser reads response");
        assert!(response.ends_with(b"ok"));
        drop(browser_side);

        let (totals, milestones) = relay.await.expect("join relay");
        assert!(totals.from_client > 0);
        assert!(totals.from_server > 0);
        assert_eq!(milestones[0], RelayMilestone::RequestSending);
        assert!(milestones.contains(&RelayMilestone::RequestSent));
        assert!(milestones.contains(&RelayMilestone::ResponseHeaders));
        assert!(milestones.contains(&RelayMilestone::ResponseBody));
    }

    #[tokio::test]
    async fn idle_peer_forces_timeout_error() {
        let (_browser_side, mut proxy_client_side) = tokio::io::duplex(64);
        let (mut proxy_server_side, _origin_side) = tokio::io::duplex(64);

        let error = relay_bidirectional(
            &mut proxy_client_side,
            &mut proxy_server_side,
            Duration::from_millis(50),
            |_| {},
        )
        .await
        .expect_err("silent peers must time out");
        assert_eq!(error.kind(), std::io::ErrorKind::TimedOut);
    }
}
