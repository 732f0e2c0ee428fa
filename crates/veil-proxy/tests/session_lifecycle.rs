use std::sync::Arc;

use veil_proxy::{
    builtin_profile, BrowserIdentity, EmulationProfile, OsIdentity, ProfileError, ProxyConfig,
    SessionProxyRegistry, VecSink, VeilError,
};

fn chrome_88_windows_10() -> EmulationProfile {
    builtin_profile(
        &BrowserIdentity::new("chrome", "88"),
        &OsIdentity::new("windows", "10"),
    )
    .expect("chrome 88 / windows 10 profile")
}

fn registry(data_dir: &std::path::Path) -> SessionProxyRegistry {
    let config = ProxyConfig {
        data_dir: data_dir.to_path_buf(),
        ..ProxyConfig::default()
    };
    SessionProxyRegistry::new(config, Arc::new(VecSink::default())).expect("registry")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_start_allocates_port_and_release_frees_it() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry(dir.path());

    let port = registry
        .register_session("session-1", chrome_88_windows_10())
        .await
        .expect("session registers");
    assert!(port > 0);
    assert_eq!(registry.proxy_port("session-1").expect("port"), port);
    assert_eq!(registry.metrics().sessions_started, 1);

    registry
        .release_session("session-1")
        .await
        .expect("session releases");
    assert!(matches!(
        registry.proxy_port("session-1"),
        Err(VeilError::UnknownSession(_))
    ));
    assert!(matches!(
        registry.release_session("session-1").await,
        Err(VeilError::UnknownSession(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_os_fails_session_start_before_any_socket() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry(dir.path());

    let mut profile = chrome_88_windows_10();
    profile.os = OsIdentity::new("FreeBSD", "unknown");

    let error = registry
        .register_session("session-bsd", profile)
        .await
        .expect_err("freebsd has no tcp stack entry");
    assert!(matches!(
        error,
        VeilError::Profile(ProfileError::UnknownOsProfile(_))
    ));
    assert!(matches!(
        registry.proxy_port("session-bsd"),
        Err(VeilError::UnknownSession(_))
    ));
    assert_eq!(registry.metrics().sessions_started, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_browser_fails_profile_lookup() {
    let error = builtin_profile(
        &BrowserIdentity::new("netscape", "4"),
        &OsIdentity::new("windows", "10"),
    )
    .expect_err("netscape has no profile");
    assert!(matches!(error, ProfileError::UnknownBrowserProfile(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_session_id_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry(dir.path());

    registry
        .register_session("session-dup", chrome_88_windows_10())
        .await
        .expect("first registration");
    let error = registry
        .register_session("session-dup", chrome_88_windows_10())
        .await
        .expect_err("second registration must fail");
    assert!(matches!(error, VeilError::DuplicateSession(_)));

    registry
        .release_session("session-dup")
        .await
        .expect("release");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn occupied_preferred_port_retries_to_a_free_one() {
    let dir = tempfile::tempdir().expect("tempdir");

    // Hold a port so the preferred bind fails.
    let blocker = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("blocker listener");
    let blocked_port = blocker.local_addr().expect("blocker addr").port();

    let config = ProxyConfig {
        data_dir: dir.path().to_path_buf(),
        preferred_port: Some(blocked_port),
        bind_attempts: 8,
        ..ProxyConfig::default()
    };
    let registry =
        SessionProxyRegistry::new(config, Arc::new(VecSink::default())).expect("registry");

    let port = registry
        .register_session("session-retry", chrome_88_windows_10())
        .await
        .expect("bind retry finds a free port");
    assert_ne!(port, blocked_port);

    registry
        .release_session("session-retry")
        .await
        .expect("release");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sessions_share_one_root_ca() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry(dir.path());
    let pem_before = registry.ca_cert_pem();

    registry
        .register_session("session-a", chrome_88_windows_10())
        .await
        .expect("register a");
    registry
        .register_session("session-b", chrome_88_windows_10())
        .await
        .expect("register b");

    assert_eq!(registry.ca_cert_pem(), pem_before);
    let port_a = registry.proxy_port("session-a").expect("port a");
    let port_b = registry.proxy_port("session-b").expect("port b");
    assert_ne!(port_a, port_b);

    registry.release_session("session-a").await.expect("release a");
    registry.release_session("session-b").await.expect("release b");
}
