use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use dashmap::DashMap;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use time::OffsetDateTime;

use crate::error::CaError;
use crate::leaf_cache::{LeafCache, LeafCacheDecision};

const ROOT_CERT_FILE: &str = "veil-root-ca.pem";
const ROOT_KEY_FILE: &str = "veil-root-ca.key";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaConfig {
    pub data_dir: PathBuf,
    pub common_name: String,
    pub organization: String,
    pub leaf_backdate_days: i64,
    pub leaf_validity_days: i64,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./veil-certs"),
            common_name: "Veil Local CA".to_string(),
            organization: "veil".to_string(),
            leaf_backdate_days: 1,
            leaf_validity_days: 730,
        }
    }
}

/// One issued leaf: private key plus the chain presented to the browser
/// (leaf first, root last). Cached per host until `not_after`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRecord {
    pub host: String,
    pub key_pem: String,
    pub cert_chain_pem: Vec<String>,
    pub not_after: SystemTime,
}

struct CaMaterial {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    key_pem: String,
}

/// Process-wide certificate authority.
///
/// The root key+certificate are generated once per data directory and
/// persisted, so every process pointed at the same directory presents the
/// same root. Leaf issuance is host-keyed and single-flight: concurrent
/// requests for one uncached host coalesce on a per-host guard instead of
/// serializing unrelated hosts behind one lock.
pub struct CertificateAuthority {
    config: CaConfig,
    material: CaMaterial,
    cache: Mutex<LeafCache>,
    inflight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    leaves_issued: AtomicU64,
}

impl CertificateAuthority {
    pub fn open(config: CaConfig) -> Result<Self, CaError> {
        let material = load_or_generate_root(&config)?;
        Ok(Self {
            config,
            material,
            cache: Mutex::new(LeafCache::default()),
            inflight: DashMap::new(),
            leaves_issued: AtomicU64::new(0),
        })
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.material.cert_pem
    }

    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        &self.material.cert_der
    }

    /// Total leaf key pairs generated since this authority opened. Cache
    /// hits and single-flight joins do not increment it.
    pub fn leaves_issued(&self) -> u64 {
        self.leaves_issued.load(Ordering::Relaxed)
    }

    /// Returns the cached record for `host`, or issues a new one.
    ///
    /// Generation failure is returned to every waiter of the current
    /// flight and leaves the cache untouched; the next caller retries.
    pub async fn get_or_create(&self, host: &str) -> Result<CertificateRecord, CaError> {
        let host = normalize_host(host);

        if let Some(record) = self.cached_record(&host) {
            return Ok(record);
        }

        let guard = self
            .inflight
            .entry(host.clone())
            .or_default()
            .value()
            .clone();
        let _flight = guard.lock().await;

        // Another task may have finished the same flight while we waited.
        if let Some(record) = self.cached_record(&host) {
            return Ok(record);
        }

        let record = self.issue_leaf(&host)?;
        self.cache
            .lock()
            .expect("leaf cache lock poisoned")
            .insert(record.clone());
        Ok(record)
    }

    /// Builds the rustls server configuration presenting `record`'s chain,
    /// with the given ALPN preference list.
    pub fn server_config_for(
        &self,
        record: &CertificateRecord,
        alpn_protocols: &[Vec<u8>],
    ) -> Result<Arc<ServerConfig>, CaError> {
        let mut chain = Vec::with_capacity(record.cert_chain_pem.len());
        for pem in &record.cert_chain_pem {
            chain.push(CertificateDer::from_pem_slice(pem.as_bytes()).map_err(|error| {
                CaError::InvalidMaterial(format!("leaf chain PEM parse failed: {error}"))
            })?);
        }
        let key = PrivateKeyDer::from_pem_slice(record.key_pem.as_bytes()).map_err(|error| {
            CaError::InvalidMaterial(format!("leaf key PEM parse failed: {error}"))
        })?;

        let mut server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)?;
        server_config.alpn_protocols = alpn_protocols.to_vec();
        Ok(Arc::new(server_config))
    }

    fn cached_record(&self, host: &str) -> Option<CertificateRecord> {
        let cache = self.cache.lock().expect("leaf cache lock poisoned");
        match cache.decision_for_host(host, SystemTime::now()) {
            LeafCacheDecision::Reuse(record) => Some(record),
            LeafCacheDecision::Reissue => None,
        }
    }

    fn issue_leaf(&self, host: &str) -> Result<CertificateRecord, CaError> {
        let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .or_else(|_| KeyPair::generate())?;
        let params = build_leaf_params(host, &self.config)?;
        let not_after = params.not_after;
        let leaf_cert = params.signed_by(&leaf_key, &self.material.issuer)?;

        self.leaves_issued.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(host, "issued interception leaf certificate");

        Ok(CertificateRecord {
            host: host.to_string(),
            key_pem: leaf_key.serialize_pem(),
            cert_chain_pem: vec![leaf_cert.pem(), self.material.cert_pem.clone()],
            not_after: SystemTime::from(not_after),
        })
    }
}

fn normalize_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}

fn load_or_generate_root(config: &CaConfig) -> Result<CaMaterial, CaError> {
    let cert_path = config.data_dir.join(ROOT_CERT_FILE);
    let key_path = config.data_dir.join(ROOT_KEY_FILE);

    match (cert_path.exists(), key_path.exists()) {
        (true, true) => load_root(&cert_path, &key_path),
        (false, false) => {
            let material = generate_root(config)?;
            persist_root(config, &cert_path, &key_path, &material)?;
            Ok(material)
        }
        _ => Err(CaError::InvalidMaterial(
            "root CA cert and key files must both exist or both be absent".to_string(),
        )),
    }
}

fn generate_root(config: &CaConfig) -> Result<CaMaterial, CaError> {
    let root_key = KeyPair::generate()?;
    let key_pem = root_key.serialize_pem();
    let params = build_root_params(config);
    let root_cert = params.self_signed(&root_key)?;
    let cert_pem = root_cert.pem();
    let cert_der = root_cert.der().clone();
    let issuer = Issuer::new(params, root_key);

    Ok(CaMaterial {
        issuer,
        cert_pem,
        cert_der,
        key_pem,
    })
}

fn load_root(cert_path: &Path, key_path: &Path) -> Result<CaMaterial, CaError> {
    let cert_pem = fs::read_to_string(cert_path)?;
    let key_pem = fs::read_to_string(key_path)?;

    let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|error| {
        CaError::InvalidMaterial(format!(
            "failed to parse root CA certificate {}: {error}",
            cert_path.display()
        ))
    })?;
    let root_key = KeyPair::from_pem(&key_pem)?;
    let issuer = Issuer::from_ca_cert_der(&cert_der, root_key).map_err(|error| {
        CaError::InvalidMaterial(format!(
            "failed to parse issuer metadata from {}: {error}",
            cert_path.display()
        ))
    })?;

    Ok(CaMaterial {
        issuer,
        cert_pem,
        cert_der,
        key_pem,
    })
}

fn persist_root(
    config: &CaConfig,
    cert_path: &Path,
    key_path: &Path,
    material: &CaMaterial,
) -> Result<(), CaError> {
    fs::create_dir_all(&config.data_dir)?;
    fs::write(cert_path, material.cert_pem.as_bytes())?;
    fs::write(key_path, material.key_pem.as_bytes())?;
    Ok(())
}

fn build_root_params(config: &CaConfig) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, config.common_name.clone());
    distinguished_name.push(DnType::OrganizationName, config.organization.clone());
    params.distinguished_name = distinguished_name;
    params
}

fn build_leaf_params(host: &str, config: &CaConfig) -> Result<CertificateParams, CaError> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.use_authority_key_identifier_extension = true;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::days(config.leaf_backdate_days);
    params.not_after = now + time::Duration::days(config.leaf_validity_days);

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, host.to_string());
    params.distinguished_name = distinguished_name;

    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params
            .subject_alt_names
            .push(SanType::DnsName(host.try_into()?));
    }

    Ok(params)
}
