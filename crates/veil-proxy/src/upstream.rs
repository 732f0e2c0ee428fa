use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use boring::ssl::{SslConnector, SslMethod, SslVerifyMode, SslVersion};
use socket2::SockRef;
use tokio::net::{TcpSocket, TcpStream};
use tokio_boring::SslStream;
use veil_profile::{ClientHelloSpec, TcpStackSettings, TlsVersion};

/// Resolves the CONNECT target. The first address is reported as the
/// resource's DNS result; remaining addresses are fallbacks for connect.
pub(crate) async fn resolve_addrs(
    host: &str,
    port: u16,
    timeout: Duration,
) -> io::Result<Vec<SocketAddr>> {
    let resolved = tokio::time::timeout(timeout, tokio::net::lookup_host((host, port)))
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("dns resolution for {host} timed out"),
            )
        })?
        .map_err(|error| {
            io::Error::new(error.kind(), format!("dns resolution for {host} failed: {error}"))
        })?;

    let addrs: Vec<SocketAddr> = resolved.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("dns resolution for {host} returned no addresses"),
        ));
    }
    Ok(addrs)
}

/// Connects to the first reachable address with the emulated OS's TTL and
/// receive-window applied before the SYN leaves the host.
pub(crate) async fn connect_with_stack(
    addrs: &[SocketAddr],
    tcp: &TcpStackSettings,
    timeout: Duration,
) -> io::Result<TcpStream> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last_error: Option<io::Error> = None;

    for addr in addrs {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "upstream connect timed out",
            ));
        }
        match connect_one(*addr, tcp, remaining).await {
            Ok(stream) => return Ok(stream),
            Err(error) => last_error = Some(error),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "all upstream connect attempts failed",
        )
    }))
}

async fn connect_one(
    addr: SocketAddr,
    tcp: &TcpStackSettings,
    timeout: Duration,
) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    apply_tcp_stack(&socket, tcp)?;

    let stream = tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("upstream connect to {addr} timed out"),
            )
        })??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn apply_tcp_stack(socket: &TcpSocket, tcp: &TcpStackSettings) -> io::Result<()> {
    let sock = SockRef::from(socket);
    sock.set_ttl(tcp.ttl)?;
    sock.set_recv_buffer_size(tcp.window_size as usize)?;
    Ok(())
}

/// Builds the upstream TLS connector from a resolved ClientHello spec.
///
/// BoringSSL is the one stack here that honors cipher order, curve order,
/// signature-algorithm order, and native GREASE in the ClientHello it
/// emits, which is exactly the surface detectors hash.
pub(crate) fn build_upstream_connector(
    spec: &ClientHelloSpec,
    verify_upstream_tls: bool,
) -> io::Result<SslConnector> {
    let mut builder =
        SslConnector::builder(SslMethod::tls_client()).map_err(io::Error::other)?;

    builder
        .set_min_proto_version(Some(boring_version(spec.version_min)))
        .map_err(io::Error::other)?;
    builder
        .set_max_proto_version(Some(boring_version(spec.version_max)))
        .map_err(io::Error::other)?;

    let cipher_list = cipher_list_string(&spec.cipher_suites);
    if !cipher_list.is_empty() {
        builder
            .set_cipher_list(&cipher_list)
            .map_err(io::Error::other)?;
    }

    let groups = groups_string(&spec.supported_groups);
    if !groups.is_empty() {
        builder.set_curves_list(&groups).map_err(io::Error::other)?;
    }

    let sigalgs = sigalgs_string(&spec.signature_algorithms);
    if !sigalgs.is_empty() {
        builder
            .set_sigalgs_list(&sigalgs)
            .map_err(io::Error::other)?;
    }

    if !spec.alpn_protocols.is_empty() {
        let mut alpn_wire = Vec::new();
        for protocol in &spec.alpn_protocols {
            alpn_wire.push(protocol.len() as u8);
            alpn_wire.extend_from_slice(protocol.as_bytes());
        }
        builder
            .set_alpn_protos(&alpn_wire)
            .map_err(io::Error::other)?;
    }

    builder.set_grease_enabled(spec.grease_enabled);

    if !verify_upstream_tls {
        builder.set_verify(SslVerifyMode::NONE);
    }

    Ok(builder.build())
}

pub(crate) async fn connect_tls(
    connector: &SslConnector,
    server_name: &str,
    stream: TcpStream,
) -> io::Result<SslStream<TcpStream>> {
    let config = connector.configure().map_err(io::Error::other)?;
    tokio_boring::connect(config, server_name, stream)
        .await
        .map_err(|error| io::Error::other(format!("upstream tls handshake failed: {error}")))
}

pub(crate) fn negotiated_alpn(stream: &SslStream<TcpStream>) -> Option<String> {
    stream
        .ssl()
        .selected_alpn_protocol()
        .map(|protocol| String::from_utf8_lossy(protocol).to_string())
}

fn boring_version(version: TlsVersion) -> SslVersion {
    match version {
        TlsVersion::Tls12 => SslVersion::TLS1_2,
        TlsVersion::Tls13 => SslVersion::TLS1_3,
    }
}

/// TLS 1.2 suites by their OpenSSL names, in profile order. TLS 1.3 suite
/// preference and GREASE slots are handled by BoringSSL itself.
fn cipher_list_string(cipher_suites: &[u16]) -> String {
    cipher_suites
        .iter()
        .filter_map(|&suite| match suite {
            0xc02b => Some("ECDHE-ECDSA-AES128-GCM-SHA256"),
            0xc02f => Some("ECDHE-RSA-AES128-GCM-SHA256"),
            0xc02c => Some("ECDHE-ECDSA-AES256-GCM-SHA384"),
            0xc030 => Some("ECDHE-RSA-AES256-GCM-SHA384"),
            0xcca9 => Some("ECDHE-ECDSA-CHACHA20-POLY1305"),
            0xcca8 => Some("ECDHE-RSA-CHACHA20-POLY1305"),
            0xc013 => Some("ECDHE-RSA-AES128-SHA"),
            0xc014 => Some("ECDHE-RSA-AES256-SHA"),
            0xc023 => Some("ECDHE-ECDSA-AES128-SHA256"),
            0xc024 => Some("ECDHE-ECDSA-AES256-SHA384"),
            0xc009 => Some("ECDHE-ECDSA-AES128-SHA"),
            0xc00a => Some("ECDHE-ECDSA-AES256-SHA"),
            0x009c => Some("AES128-GCM-SHA256"),
            0x009d => Some("AES256-GCM-SHA384"),
            0x002f => Some("AES128-SHA"),
            0x0035 => Some("AES256-SHA"),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(":")
}

fn groups_string(groups: &[u16]) -> String {
    groups
        .iter()
        .filter_map(|&group| match group {
            0x001d => Some("X25519"),
            0x0017 => Some("P-256"),
            0x0018 => Some("P-384"),
            0x0019 => Some("P-521"),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(":")
}

fn sigalgs_string(signature_algorithms: &[u16]) -> String {
    signature_algorithms
        .iter()
        .filter_map(|&algorithm| match algorithm {
            0x0403 => Some("ECDSA+SHA256"),
            0x0503 => Some("ECDSA+SHA384"),
            0x0603 => Some("ECDSA+SHA512"),
            0x0804 => Some("RSA-PSS+SHA256"),
            0x0805 => Some("RSA-PSS+SHA384"),
            0x0806 => Some("RSA-PSS+SHA512"),
            0x0401 => Some("RSA+SHA256"),
            0x0501 => Some("RSA+SHA384"),
            0x0601 => Some("RSA+SHA512"),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use veil_profile::{builtin_profile, client_hello_spec, BrowserIdentity, NoGrease, OsIdentity};

    use super::{build_upstream_connector, cipher_list_string, groups_string, sigalgs_string};

    fn chrome_spec() -> veil_profile::ClientHelloSpec {
        let profile = builtin_profile(
            &BrowserIdentity::new("chrome", "88"),
            &OsIdentity::new("windows", "10"),
        )
        .expect("chrome profile");
        client_hello_spec(&profile.tls, &mut NoGrease)
    }

    #[test]
    fn cipher_string_preserves_profile_order() {
        let spec = chrome_spec();
        let ciphers = cipher_list_string(&spec.cipher_suites);
        let first_tls12 = ciphers.split(':').next().expect("non-empty");
        assert_eq!(first_tls12, "ECDHE-ECDSA-AES128-GCM-SHA256");
        assert!(ciphers.ends_with("AES256-SHA"));
    }

    #[test]
    fn group_and_sigalg_strings_map_known_ids() {
        let spec = chrome_spec();
        assert_eq!(groups_string(&spec.supported_groups), "X25519:P-256:P-384");
        assert!(sigalgs_string(&spec.signature_algorithms).starts_with("ECDSA+SHA256"));
    }

    #[test]
    fn connector_builds_for_builtin_profiles() {
        let spec = chrome_spec();
        build_upstream_connector(&spec, true).expect("connector must build");
    }
}
