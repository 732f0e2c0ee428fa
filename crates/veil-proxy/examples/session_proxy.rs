//! Starts one emulated browser session and prints the proxy port.
//!
//! Point a Chrome 88 instance at the printed port (and trust the printed
//! CA) to see intercepted resources land in ./veil-data/resources.jsonl.

use std::sync::Arc;

use veil_proxy::{
    builtin_profile, BrowserIdentity, JsonlResourceLog, OsIdentity, ProxyConfig,
    SessionProxyRegistry,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ProxyConfig::default();
    let log = Arc::new(JsonlResourceLog::create(
        config.data_dir.join("resources.jsonl"),
    )?);
    let registry = SessionProxyRegistry::new(config, log)?;

    let profile = builtin_profile(
        &BrowserIdentity::new("chrome", "88"),
        &OsIdentity::new("windows", "10"),
    )?;
    let port = registry.register_session("demo", profile).await?;

    println!("proxy listening on 127.0.0.1:{port}");
    println!("root CA to trust in the controlled browser:");
    println!("{}", registry.ca_cert_pem());

    tokio::signal::ctrl_c().await?;
    registry.release_session("demo").await?;
    println!("{:#?}", registry.metrics());
    Ok(())
}
