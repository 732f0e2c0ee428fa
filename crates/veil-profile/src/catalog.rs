use crate::error::ProfileError;
use crate::http2::Http2SettingsProfile;
use crate::identity::{BrowserIdentity, EmulationProfile, OsIdentity};
use crate::tls::{ext, TlsClientHelloProfile, TlsVersion};

/// Looks up a built-in browser profile for the given identity pair.
///
/// The OS identity selects TCP parameters elsewhere; here it is carried
/// through so one profile value describes the whole combination.
pub fn builtin_profile(
    browser: &BrowserIdentity,
    os: &OsIdentity,
) -> Result<EmulationProfile, ProfileError> {
    let name = browser.name.to_ascii_lowercase();
    let major = browser.version.split('.').next().unwrap_or_default();

    let (tls, http2) = match (name.as_str(), major) {
        ("chrome", "87") | ("chrome", "88") => (chrome_88_tls(), chrome_88_http2()),
        ("safari", "13") => (safari_13_tls(), safari_13_http2()),
        _ => return Err(ProfileError::UnknownBrowserProfile(browser.to_string())),
    };

    Ok(EmulationProfile {
        browser: browser.clone(),
        os: os.clone(),
        tls,
        http2,
    })
}

fn chrome_88_tls() -> TlsClientHelloProfile {
    TlsClientHelloProfile {
        version_min: TlsVersion::Tls12,
        version_max: TlsVersion::Tls13,
        cipher_suites: vec![
            0x1301, 0x1302, 0x1303, // TLS 1.3 suites
            0xc02b, 0xc02f, 0xc02c, 0xc030, // ECDHE-GCM
            0xcca9, 0xcca8, // ChaCha20
            0xc013, 0xc014, // ECDHE-CBC
            0x009c, 0x009d, // RSA-GCM
            0x002f, 0x0035, // RSA-CBC
        ],
        extensions: vec![
            ext::SERVER_NAME,
            ext::EXTENDED_MASTER_SECRET,
            ext::RENEGOTIATION_INFO,
            ext::SUPPORTED_GROUPS,
            ext::EC_POINT_FORMATS,
            ext::SESSION_TICKET,
            ext::ALPN,
            ext::STATUS_REQUEST,
            ext::SIGNATURE_ALGORITHMS,
            ext::SIGNED_CERTIFICATE_TIMESTAMP,
            ext::KEY_SHARE,
            ext::PSK_KEY_EXCHANGE_MODES,
            ext::SUPPORTED_VERSIONS,
            ext::COMPRESS_CERTIFICATE,
            ext::PADDING,
        ],
        supported_groups: vec![
            0x001d, // x25519
            0x0017, // secp256r1
            0x0018, // secp384r1
        ],
        ec_point_formats: vec![0x00],
        signature_algorithms: vec![
            0x0403, 0x0804, 0x0401, 0x0503, 0x0805, 0x0501, 0x0806, 0x0601,
        ],
        alpn_protocols: vec!["h2".to_string(), "http/1.1".to_string()],
        use_grease: true,
    }
}

fn chrome_88_http2() -> Http2SettingsProfile {
    Http2SettingsProfile {
        header_table_size: 65_536,
        enable_push: false,
        max_concurrent_streams: 1_000,
        initial_stream_window_size: 6_291_456,
        max_header_list_size: 262_144,
        initial_connection_window_size: 15_663_105,
    }
}

fn safari_13_tls() -> TlsClientHelloProfile {
    TlsClientHelloProfile {
        version_min: TlsVersion::Tls12,
        version_max: TlsVersion::Tls13,
        cipher_suites: vec![
            0x1301, 0x1302, 0x1303, // TLS 1.3 suites
            0xc02c, 0xc02b, // ECDHE-ECDSA first
            0xc030, 0xc02f, // then ECDHE-RSA
            0xc024, 0xc023, 0xc00a, 0xc009, // CBC fallbacks
        ],
        extensions: vec![
            ext::SERVER_NAME,
            ext::ALPN,
            ext::STATUS_REQUEST,
            ext::SUPPORTED_GROUPS,
            ext::EC_POINT_FORMATS,
            ext::SIGNATURE_ALGORITHMS,
            ext::EXTENDED_MASTER_SECRET,
            ext::SUPPORTED_VERSIONS,
            ext::PSK_KEY_EXCHANGE_MODES,
            ext::KEY_SHARE,
        ],
        supported_groups: vec![0x001d, 0x0017, 0x0018, 0x0019],
        ec_point_formats: vec![0x00],
        signature_algorithms: vec![
            0x0403, 0x0503, 0x0603, 0x0804, 0x0805, 0x0806, 0x0401, 0x0501, 0x0601,
        ],
        alpn_protocols: vec!["h2".to_string(), "http/1.1".to_string()],
        use_grease: false,
    }
}

fn safari_13_http2() -> Http2SettingsProfile {
    Http2SettingsProfile {
        header_table_size: 4_096,
        enable_push: true,
        max_concurrent_streams: 100,
        initial_stream_window_size: 2_097_152,
        max_header_list_size: 8_192,
        initial_connection_window_size: 10_485_760,
    }
}

#[cfg(test)]
mod tests {
    use super::builtin_profile;
    use crate::error::ProfileError;
    use crate::identity::{BrowserIdentity, OsIdentity};

    #[test]
    fn chrome_88_windows_10_resolves() {
        let profile = builtin_profile(
            &BrowserIdentity::new("chrome", "88"),
            &OsIdentity::new("windows", "10"),
        )
        .expect("chrome 88 must resolve");
        assert!(profile.tls.use_grease);
        assert_eq!(profile.tls.cipher_suites[0], 0x1301);
        assert!(!profile.http2.enable_push);
    }

    #[test]
    fn safari_13_orders_ecdsa_first() {
        let profile = builtin_profile(
            &BrowserIdentity::new("safari", "13"),
            &OsIdentity::new("mac-os", "10.15"),
        )
        .expect("safari 13 must resolve");
        assert_eq!(profile.tls.cipher_suites[3], 0xc02c);
        assert!(!profile.tls.use_grease);
    }

    #[test]
    fn unknown_browser_is_an_error() {
        let error = builtin_profile(
            &BrowserIdentity::new("netscape", "4"),
            &OsIdentity::new("windows", "10"),
        )
        .expect_err("netscape has no profile");
        assert_eq!(
            error,
            ProfileError::UnknownBrowserProfile("netscape-4".to_string())
        );
    }
}
