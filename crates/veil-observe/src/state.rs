use serde::Serialize;

/// Lifecycle states of one logical network resource, in canonical order.
/// Not every state is mandatory for every resource; a recorded sequence is
/// a strict subsequence of this ordering. `Error` is the alternate
/// terminal, reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResourceState {
    DnsResolving,
    DnsResolved,
    TcpConnecting,
    TcpConnected,
    TlsHandshaking,
    TlsHandshaked,
    RequestSending,
    RequestSent,
    ResponseHeaders,
    ResponseBody,
    Complete,
    Error,
}

impl ResourceState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DnsResolving => "dns_resolving",
            Self::DnsResolved => "dns_resolved",
            Self::TcpConnecting => "tcp_connecting",
            Self::TcpConnected => "tcp_connected",
            Self::TlsHandshaking => "tls_handshaking",
            Self::TlsHandshaked => "tls_handshaked",
            Self::RequestSending => "request_sending",
            Self::RequestSent => "request_sent",
            Self::ResponseHeaders => "response_headers",
            Self::ResponseBody => "response_body",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    pub(crate) fn sequence_index(self) -> Option<u8> {
        match self {
            Self::DnsResolving => Some(0),
            Self::DnsResolved => Some(1),
            Self::TcpConnecting => Some(2),
            Self::TcpConnected => Some(3),
            Self::TlsHandshaking => Some(4),
            Self::TlsHandshaked => Some(5),
            Self::RequestSending => Some(6),
            Self::RequestSent => Some(7),
            Self::ResponseHeaders => Some(8),
            Self::ResponseBody => Some(9),
            Self::Complete => Some(10),
            Self::Error => None,
        }
    }
}

/// A transition is legal when it moves strictly forward in the canonical
/// ordering. States may be skipped; they are never revisited, and nothing
/// leaves a terminal state.
pub(crate) fn transition_allowed(current: Option<ResourceState>, next: ResourceState) -> bool {
    if let Some(current) = current {
        if current.is_terminal() {
            return false;
        }
    }

    if next == ResourceState::Error {
        return true;
    }

    match (current, next.sequence_index()) {
        (None, Some(_)) => true,
        (Some(current), Some(next_index)) => current
            .sequence_index()
            .map(|current_index| next_index > current_index)
            .unwrap_or(false),
        _ => false,
    }
}
