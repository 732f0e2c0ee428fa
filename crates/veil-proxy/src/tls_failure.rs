#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsFailureReason {
    UnknownCa,
    CertValidation,
    HandshakeAlert,
    Timeout,
    EofOrReset,
    Other,
}

impl TlsFailureReason {
    pub fn code(self) -> &'static str {
        match self {
            Self::UnknownCa => "unknown_ca",
            Self::CertValidation => "cert_validation",
            Self::HandshakeAlert => "handshake",
            Self::Timeout => "timeout",
            Self::EofOrReset => "eof_or_reset",
            Self::Other => "other",
        }
    }
}

/// Maps handshake error text to a coarse failure reason for the persisted
/// `Error` state, so fingerprint mismatches stay auditable after the fact.
pub fn classify_tls_error(error_text: &str) -> TlsFailureReason {
    let lower = error_text.to_ascii_lowercase();

    if contains_any(
        &lower,
        &[
            "unknown ca",
            "unknown issuer",
            "self signed",
            "self-signed",
            "unknown authority",
            "unable to get local issuer certificate",
        ],
    ) {
        return TlsFailureReason::UnknownCa;
    }
    if contains_any(&lower, &["timed out", "timeout", "deadline has elapsed"]) {
        return TlsFailureReason::Timeout;
    }
    if contains_any(
        &lower,
        &[
            "unexpected eof",
            "eof",
            "connection reset",
            "broken pipe",
            "connection aborted",
        ],
    ) {
        return TlsFailureReason::EofOrReset;
    }
    if contains_any(
        &lower,
        &[
            "certificate verify failed",
            "invalid peer certificate",
            "certificate",
            "x509",
            "hostname mismatch",
            "name mismatch",
            "expired",
        ],
    ) {
        return TlsFailureReason::CertValidation;
    }
    if contains_any(
        &lower,
        &["handshake", "alert", "protocol version", "decrypt error"],
    ) {
        return TlsFailureReason::HandshakeAlert;
    }
    TlsFailureReason::Other
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}
