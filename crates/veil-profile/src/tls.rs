use crate::grease::{is_grease, GreasePolicy};

/// TLS extension identifiers that appear in the built-in profiles.
pub mod ext {
    pub const SERVER_NAME: u16 = 0x0000;
    pub const STATUS_REQUEST: u16 = 0x0005;
    pub const SUPPORTED_GROUPS: u16 = 0x000a;
    pub const EC_POINT_FORMATS: u16 = 0x000b;
    pub const SIGNATURE_ALGORITHMS: u16 = 0x000d;
    pub const ALPN: u16 = 0x0010;
    pub const SIGNED_CERTIFICATE_TIMESTAMP: u16 = 0x0012;
    pub const PADDING: u16 = 0x0015;
    pub const EXTENDED_MASTER_SECRET: u16 = 0x0017;
    pub const COMPRESS_CERTIFICATE: u16 = 0x001b;
    pub const SESSION_TICKET: u16 = 0x0023;
    pub const SUPPORTED_VERSIONS: u16 = 0x002b;
    pub const PSK_KEY_EXCHANGE_MODES: u16 = 0x002d;
    pub const KEY_SHARE: u16 = 0x0033;
    pub const RENEGOTIATION_INFO: u16 = 0xff01;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl TlsVersion {
    pub fn wire_value(self) -> u16 {
        match self {
            Self::Tls12 => 0x0303,
            Self::Tls13 => 0x0304,
        }
    }
}

/// Ordered ClientHello parameters as the target browser sends them.
///
/// Ordering is significant everywhere: detectors compare the order of
/// cipher suites and extensions, not just their presence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsClientHelloProfile {
    pub version_min: TlsVersion,
    pub version_max: TlsVersion,
    pub cipher_suites: Vec<u16>,
    pub extensions: Vec<u16>,
    pub supported_groups: Vec<u16>,
    pub ec_point_formats: Vec<u8>,
    pub signature_algorithms: Vec<u16>,
    pub alpn_protocols: Vec<String>,
    pub use_grease: bool,
}

/// Fully resolved ClientHello construction parameters, with GREASE values
/// placed. Deterministic for a fixed profile and grease policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHelloSpec {
    pub legacy_version: u16,
    pub version_min: TlsVersion,
    pub version_max: TlsVersion,
    pub cipher_suites: Vec<u16>,
    pub extensions: Vec<u16>,
    pub supported_groups: Vec<u16>,
    pub ec_point_formats: Vec<u8>,
    pub signature_algorithms: Vec<u16>,
    pub alpn_protocols: Vec<String>,
    pub grease_enabled: bool,
}

impl ClientHelloSpec {
    /// Renders the canonical JA3 input string
    /// (`version,ciphers,extensions,groups,formats`). GREASE values are
    /// filtered, matching how JA3 is computed on the wire.
    pub fn ja3_string(&self) -> String {
        let ciphers = join_filtered(&self.cipher_suites);
        let extensions = join_filtered(&self.extensions);
        let groups = join_filtered(&self.supported_groups);
        let formats = self
            .ec_point_formats
            .iter()
            .map(|format| format.to_string())
            .collect::<Vec<_>>()
            .join("-");
        format!(
            "{},{},{},{},{}",
            self.legacy_version, ciphers, extensions, groups, formats
        )
    }
}

fn join_filtered(values: &[u16]) -> String {
    values
        .iter()
        .filter(|&&value| !is_grease(value))
        .map(|value| value.to_string())
        .collect::<Vec<_>>()
        .join("-")
}

/// Produces the exact ClientHello parameter layout for a profile.
///
/// The profile's declared order is preserved verbatim. When the profile
/// uses GREASE, values are placed the way Chrome places them: one at the
/// head of the cipher list, one leading the extension list, one
/// immediately before the padding extension (or trailing when the profile
/// has no padding), and one at the head of the supported groups.
pub fn client_hello_spec(
    profile: &TlsClientHelloProfile,
    grease: &mut dyn GreasePolicy,
) -> ClientHelloSpec {
    let grease_enabled = profile.use_grease && grease.enabled();

    let mut cipher_suites = Vec::with_capacity(profile.cipher_suites.len() + 1);
    if grease_enabled {
        cipher_suites.push(grease.next_value());
    }
    cipher_suites.extend(&profile.cipher_suites);

    let mut extensions = Vec::with_capacity(profile.extensions.len() + 2);
    if grease_enabled {
        extensions.push(grease.next_value());
    }
    extensions.extend(&profile.extensions);
    if grease_enabled {
        let second = grease.next_value();
        match extensions.iter().position(|&e| e == ext::PADDING) {
            Some(padding_index) => extensions.insert(padding_index, second),
            None => extensions.push(second),
        }
    }

    let mut supported_groups = Vec::with_capacity(profile.supported_groups.len() + 1);
    if grease_enabled {
        supported_groups.push(grease.next_value());
    }
    supported_groups.extend(&profile.supported_groups);

    ClientHelloSpec {
        legacy_version: TlsVersion::Tls12.wire_value(),
        version_min: profile.version_min,
        version_max: profile.version_max,
        cipher_suites,
        extensions,
        supported_groups,
        ec_point_formats: profile.ec_point_formats.clone(),
        signature_algorithms: profile.signature_algorithms.clone(),
        alpn_protocols: profile.alpn_protocols.clone(),
        grease_enabled,
    }
}

#[cfg(test)]
mod tests {
    use super::{client_hello_spec, ext};
    use crate::catalog::builtin_profile;
    use crate::grease::{is_grease, NoGrease, SeededGrease};
    use crate::identity::{BrowserIdentity, OsIdentity};

    fn chrome_88_windows() -> crate::identity::EmulationProfile {
        builtin_profile(
            &BrowserIdentity::new("chrome", "88"),
            &OsIdentity::new("windows", "10"),
        )
        .expect("chrome 88 profile must exist")
    }

    #[test]
    fn spec_is_deterministic_for_fixed_profile_and_seed() {
        let profile = chrome_88_windows();
        let first = client_hello_spec(&profile.tls, &mut SeededGrease::new(7));
        let second = client_hello_spec(&profile.tls, &mut SeededGrease::new(7));
        assert_eq!(first, second);
    }

    #[test]
    fn cipher_and_extension_order_preserved_verbatim() {
        let profile = chrome_88_windows();
        let spec = client_hello_spec(&profile.tls, &mut NoGrease);
        assert_eq!(spec.cipher_suites, profile.tls.cipher_suites);
        assert_eq!(spec.extensions, profile.tls.extensions);
        assert_eq!(spec.supported_groups, profile.tls.supported_groups);
    }

    #[test]
    fn grease_placed_in_chrome_slots() {
        let profile = chrome_88_windows();
        let spec = client_hello_spec(&profile.tls, &mut SeededGrease::new(3));

        assert!(is_grease(spec.cipher_suites[0]));
        assert_eq!(&spec.cipher_suites[1..], &profile.tls.cipher_suites[..]);

        assert!(is_grease(spec.extensions[0]));
        let padding_index = spec
            .extensions
            .iter()
            .position(|&e| e == ext::PADDING)
            .expect("chrome profile carries padding");
        assert!(is_grease(spec.extensions[padding_index - 1]));

        assert!(is_grease(spec.supported_groups[0]));
    }

    #[test]
    fn ja3_filters_grease_and_matches_ungreased_profile() {
        let profile = chrome_88_windows();
        let greased = client_hello_spec(&profile.tls, &mut SeededGrease::new(11));
        let plain = client_hello_spec(&profile.tls, &mut NoGrease);
        assert_eq!(greased.ja3_string(), plain.ja3_string());
        assert!(greased.ja3_string().starts_with("771,"));
    }
}
