//! Certificate authority for on-the-fly TLS impersonation.
//!
//! A persistent self-signed root signs short-lived per-hostname leaves. The
//! root key never leaves this process except for its PEM file on disk; the
//! leaf cache is LRU with per-hostname mint coalescing, so a burst of
//! connections to one new host performs exactly one key generation.

use std::collections::{HashMap, VecDeque};
use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};

const ROOT_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 397;

#[derive(Debug)]
pub enum CaError {
    RootLoad(String),
    Mint(String),
    Io(std::io::Error),
    LockPoisoned,
    InvalidConfiguration(String),
}

impl fmt::Display for CaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RootLoad(detail) => write!(f, "root CA load failed: {detail}"),
            Self::Mint(detail) => write!(f, "leaf mint failed: {detail}"),
            Self::Io(error) => write!(f, "I/O error: {error}"),
            Self::LockPoisoned => write!(f, "certificate store lock poisoned"),
            Self::InvalidConfiguration(reason) => {
                write!(f, "invalid CA configuration: {reason}")
            }
        }
    }
}

impl StdError for CaError {}

impl From<std::io::Error> for CaError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub common_name: String,
    pub organization: String,
    pub leaf_cache_capacity: usize,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            cert_path: PathBuf::from("./ca.crt"),
            key_path: PathBuf::from("./ca.key"),
            common_name: "MITM Proxy Root".to_string(),
            organization: "tollgate".to_string(),
            leaf_cache_capacity: 1024,
        }
    }
}

impl CaConfig {
    fn validate(&self) -> Result<(), CaError> {
        if self.common_name.trim().is_empty() {
            return Err(CaError::InvalidConfiguration(
                "common_name must not be empty".to_string(),
            ));
        }
        if self.organization.trim().is_empty() {
            return Err(CaError::InvalidConfiguration(
                "organization must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
        }
    }
}

/// A ready-to-serve leaf identity for one hostname.
#[derive(Debug, Clone)]
pub struct IssuedLeaf {
    pub server_config: Arc<ServerConfig>,
    pub leaf_cert_der: CertificateDer<'static>,
    pub cache_status: CacheStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaMetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub leaves_issued: u64,
}

struct RootMaterial {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
}

#[derive(Clone)]
struct CachedLeaf {
    server_config: Arc<ServerConfig>,
    leaf_cert_der: CertificateDer<'static>,
    expires_at: SystemTime,
}

/// Mints and caches leaf certificates signed by the local root.
///
/// Cache hits take a shared acquisition; mutation is exclusive. Minting is
/// serialized per hostname so concurrent misses for the same host coalesce,
/// while distinct hosts mint in parallel.
pub struct CertificateStore {
    config: CaConfig,
    root: RootMaterial,
    cache: RwLock<HashMap<String, CachedLeaf>>,
    recency: Mutex<VecDeque<String>>,
    mint_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    leaves_issued: AtomicU64,
}

impl fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateStore")
            .field("config", &self.config)
            .field("cache_hits", &self.cache_hits)
            .field("cache_misses", &self.cache_misses)
            .field("leaves_issued", &self.leaves_issued)
            .finish_non_exhaustive()
    }
}

impl CertificateStore {
    /// Load the root from the configured paths, or synthesize and persist
    /// one when neither file exists yet.
    pub fn open(config: CaConfig) -> Result<Self, CaError> {
        config.validate()?;
        let root = load_or_create_root(&config)?;
        Ok(Self {
            config,
            root,
            cache: RwLock::new(HashMap::new()),
            recency: Mutex::new(VecDeque::new()),
            mint_locks: Mutex::new(HashMap::new()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            leaves_issued: AtomicU64::new(0),
        })
    }

    /// The root certificate PEM, for installing into a browser trust store.
    /// The private key has no accessor.
    pub fn root_certificate_pem(&self) -> &str {
        &self.root.cert_pem
    }

    pub fn metrics_snapshot(&self) -> CaMetricsSnapshot {
        CaMetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            leaves_issued: self.leaves_issued.load(Ordering::Relaxed),
        }
    }

    /// A server config for `host`: cached when present and unexpired,
    /// freshly minted otherwise.
    pub async fn cert_for(&self, host: &str) -> Result<IssuedLeaf, CaError> {
        let host = normalize_host(host);

        if let Some(leaf) = self.cached_leaf(&host)? {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(IssuedLeaf {
                server_config: leaf.server_config,
                leaf_cert_der: leaf.leaf_cert_der,
                cache_status: CacheStatus::Hit,
            });
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let mint_lock = self.mint_lock_for(&host)?;
        let _guard = mint_lock.lock().await;

        // Another waiter on the same host may have minted while this task
        // queued on the lock.
        if let Some(leaf) = self.cached_leaf(&host)? {
            return Ok(IssuedLeaf {
                server_config: leaf.server_config,
                leaf_cert_der: leaf.leaf_cert_der,
                cache_status: CacheStatus::Hit,
            });
        }

        let minted = mint_leaf(&self.root, &host)?;
        self.leaves_issued.fetch_add(1, Ordering::Relaxed);
        self.insert_leaf(&host, minted.clone())?;

        Ok(IssuedLeaf {
            server_config: minted.server_config,
            leaf_cert_der: minted.leaf_cert_der,
            cache_status: CacheStatus::Miss,
        })
    }

    fn cached_leaf(&self, host: &str) -> Result<Option<CachedLeaf>, CaError> {
        let cache = self.cache.read().map_err(|_| CaError::LockPoisoned)?;
        let Some(leaf) = cache.get(host) else {
            return Ok(None);
        };
        if leaf.expires_at <= SystemTime::now() {
            return Ok(None);
        }
        let leaf = leaf.clone();
        drop(cache);
        self.touch_recency(host)?;
        Ok(Some(leaf))
    }

    fn insert_leaf(&self, host: &str, leaf: CachedLeaf) -> Result<(), CaError> {
        if self.config.leaf_cache_capacity == 0 {
            return Ok(());
        }
        let mut cache = self.cache.write().map_err(|_| CaError::LockPoisoned)?;
        if cache.len() >= self.config.leaf_cache_capacity {
            let mut recency = self.recency.lock().map_err(|_| CaError::LockPoisoned)?;
            if let Some(oldest) = recency.pop_front() {
                cache.remove(&oldest);
                let mut mint_locks =
                    self.mint_locks.lock().map_err(|_| CaError::LockPoisoned)?;
                mint_locks.remove(&oldest);
            }
        }
        cache.insert(host.to_string(), leaf);
        drop(cache);
        self.touch_recency(host)
    }

    fn touch_recency(&self, host: &str) -> Result<(), CaError> {
        let mut recency = self.recency.lock().map_err(|_| CaError::LockPoisoned)?;
        if let Some(position) = recency.iter().position(|entry| entry == host) {
            recency.remove(position);
        }
        recency.push_back(host.to_string());
        Ok(())
    }

    fn mint_lock_for(&self, host: &str) -> Result<Arc<tokio::sync::Mutex<()>>, CaError> {
        let mut mint_locks = self.mint_locks.lock().map_err(|_| CaError::LockPoisoned)?;
        Ok(Arc::clone(
            mint_locks
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        ))
    }
}

fn load_or_create_root(config: &CaConfig) -> Result<RootMaterial, CaError> {
    let cert_exists = config.cert_path.exists();
    let key_exists = config.key_path.exists();

    match (cert_exists, key_exists) {
        (true, true) => load_root(&config.cert_path, &config.key_path),
        (false, false) => {
            let (root, key_pem) = generate_root(config)?;
            persist_root(config, &root.cert_pem, &key_pem)?;
            Ok(root)
        }
        _ => Err(CaError::RootLoad(
            "CA certificate and key files must both exist or both be absent".to_string(),
        )),
    }
}

fn generate_root(config: &CaConfig) -> Result<(RootMaterial, String), CaError> {
    let key = KeyPair::generate().map_err(|error| CaError::RootLoad(error.to_string()))?;
    let key_pem = key.serialize_pem();

    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(ROOT_VALIDITY_DAYS);

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, config.common_name.clone());
    dn.push(DnType::OrganizationName, config.organization.clone());
    params.distinguished_name = dn;

    let cert = params
        .self_signed(&key)
        .map_err(|error| CaError::RootLoad(error.to_string()))?;
    let cert_pem = cert.pem();
    let cert_der = cert.der().clone();
    let issuer = Issuer::new(params, key);

    Ok((
        RootMaterial {
            issuer,
            cert_pem,
            cert_der,
        },
        key_pem,
    ))
}

fn load_root(cert_path: &Path, key_path: &Path) -> Result<RootMaterial, CaError> {
    let cert_pem = fs::read_to_string(cert_path)?;
    let key_pem = fs::read_to_string(key_path)?;
    let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|error| {
        CaError::RootLoad(format!(
            "failed to parse CA certificate PEM from {}: {error}",
            cert_path.display()
        ))
    })?;
    let key = KeyPair::from_pem(&key_pem).map_err(|error| {
        CaError::RootLoad(format!(
            "failed to parse CA key PEM from {}: {error}",
            key_path.display()
        ))
    })?;
    let issuer = Issuer::from_ca_cert_der(&cert_der, key).map_err(|error| {
        CaError::RootLoad(format!(
            "certificate and key at {} do not form a usable issuer: {error}",
            cert_path.display()
        ))
    })?;

    Ok(RootMaterial {
        issuer,
        cert_pem,
        cert_der,
    })
}

fn persist_root(config: &CaConfig, cert_pem: &str, key_pem: &str) -> Result<(), CaError> {
    ensure_parent_exists(&config.cert_path)?;
    ensure_parent_exists(&config.key_path)?;
    write_atomically(&config.cert_path, cert_pem.as_bytes(), 0o644)?;
    write_atomically(&config.key_path, key_pem.as_bytes(), 0o600)?;
    Ok(())
}

/// Write via a sibling temp file and rename, so a crash never leaves a
/// half-written root behind.
fn write_atomically(path: &Path, bytes: &[u8], mode: u32) -> Result<(), CaError> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, bytes)?;
    set_file_mode(&temp_path, mode)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) -> Result<(), CaError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) -> Result<(), CaError> {
    Ok(())
}

fn ensure_parent_exists(path: &Path) -> Result<(), CaError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn mint_leaf(root: &RootMaterial, host: &str) -> Result<CachedLeaf, CaError> {
    let leaf_params = build_leaf_params(host)?;
    let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|error| CaError::Mint(error.to_string()))?;
    let leaf_key_der = PrivatePkcs8KeyDer::from(leaf_key.serialize_der());
    let leaf_cert = leaf_params
        .signed_by(&leaf_key, &root.issuer)
        .map_err(|error| CaError::Mint(error.to_string()))?;
    let leaf_cert_der = leaf_cert.der().clone();

    let chain = vec![leaf_cert_der.clone(), root.cert_der.clone()];
    let private_key = PrivateKeyDer::from(leaf_key_der);

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, private_key)
        .map_err(|error| CaError::Mint(error.to_string()))?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(CachedLeaf {
        server_config: Arc::new(server_config),
        leaf_cert_der,
        expires_at: SystemTime::now()
            + Duration::from_secs(LEAF_VALIDITY_DAYS as u64 * 24 * 60 * 60),
    })
}

fn build_leaf_params(host: &str) -> Result<CertificateParams, CaError> {
    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|error| CaError::Mint(error.to_string()))?;
    params.use_authority_key_identifier_extension = true;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(LEAF_VALIDITY_DAYS);

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host.to_string());
    params.distinguished_name = dn;

    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params.subject_alt_names.push(SanType::DnsName(
            host.try_into()
                .map_err(|error: rcgen::Error| CaError::Mint(error.to_string()))?,
        ));
        if let Some(wildcard) = wildcard_parent(host) {
            params.subject_alt_names.push(SanType::DnsName(
                wildcard
                    .as_str()
                    .try_into()
                    .map_err(|error: rcgen::Error| CaError::Mint(error.to_string()))?,
            ));
        }
    }

    Ok(params)
}

/// `www.example.com` → `*.example.com`; single-label hosts have none.
fn wildcard_parent(host: &str) -> Option<String> {
    let (_, parent) = host.split_once('.')?;
    if parent.is_empty() {
        return None;
    }
    Some(format!("*.{parent}"))
}

fn normalize_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}

/// Client config for upstream origins: real verification against the bundled
/// webpki roots, never the local root. The skip-verify variant exists for
/// test rigs with self-signed upstreams.
pub fn build_upstream_client_config(insecure_skip_verify: bool) -> Arc<ClientConfig> {
    let mut config = if insecure_skip_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureSkipVerify))
            .with_no_client_auth()
    } else {
        let root_store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

#[derive(Debug)]
struct InsecureSkipVerify;

impl ServerCertVerifier for InsecureSkipVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
        ]
    }
}
