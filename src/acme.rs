//! ACME (Let's Encrypt) certificate management
//!
//! Maintains certificates for every SSL-enabled routing key:
//! - HTTP-01 challenge (serves token at /.well-known/acme-challenge/)
//! - TLS-ALPN-01 challenge (serves certificate with acme-tls/1 ALPN)
//!
//! Coverage requests are idempotent and issuance runs asynchronously; an
//! issuance failure for one domain never blocks the others. TLS handshakes
//! for a domain without a ready certificate fail at the TLS layer.
//!
//! # Security Considerations
//!
//! The ACME account key and certificate private keys are stored in the data
//! directory with restrictive permissions (0700 directories, 0600 key
//! files) but unencrypted. For production deployments keep the directory on
//! an encrypted filesystem and restrict access to the service user.

use crate::config::{AcmeChallengeType, AcmeConfig};
use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::ResolvesServerCert;
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Path prefix of HTTP-01 challenge requests
pub const CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

const ACME_TLS_ALPN_NAME: &[u8] = b"acme-tls/1";
const ACME_ALPN_OID: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 1, 31];

/// Renewal sweep cadence
const RENEWAL_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Renew when fewer than this many days of validity remain
const RENEWAL_THRESHOLD_DAYS: u64 = 30;

/// Minimum pause between issuance attempts for one domain
const RETRY_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Pending ACME challenges for HTTP-01 validation
#[derive(Clone, Default)]
pub struct Http01Challenges {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl Http01Challenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, token: String, key_authorization: String) {
        self.inner.write().await.insert(token, key_authorization);
    }

    pub async fn get(&self, token: &str) -> Option<String> {
        self.inner.read().await.get(token).cloned()
    }

    pub async fn remove(&self, token: &str) {
        self.inner.write().await.remove(token);
    }
}

/// Per-SNI certificate resolver consulted on every TLS handshake.
///
/// During a TLS-ALPN-01 validation the ACME server connects with the
/// acme-tls/1 protocol; those handshakes get the challenge certificate for
/// the requested name instead of the regular one.
pub struct SniCertResolver {
    certs: DashMap<String, Arc<CertifiedKey>>,
    challenge_certs: DashMap<String, Arc<CertifiedKey>>,
}

impl std::fmt::Debug for SniCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniCertResolver")
            .field("certs", &self.certs.len())
            .field("challenge_certs", &self.challenge_certs.len())
            .finish()
    }
}

impl SniCertResolver {
    pub fn new() -> Self {
        Self {
            certs: DashMap::new(),
            challenge_certs: DashMap::new(),
        }
    }

    fn set_cert(&self, domain: &str, cert: Arc<CertifiedKey>) {
        self.certs.insert(domain.to_string(), cert);
    }

    fn set_challenge_cert(&self, domain: &str, cert: Arc<CertifiedKey>) {
        self.challenge_certs.insert(domain.to_string(), cert);
    }

    fn remove_challenge_cert(&self, domain: &str) {
        self.challenge_certs.remove(domain);
    }

    pub fn has_cert(&self, domain: &str) -> bool {
        self.certs.contains_key(domain)
    }

    fn cert(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        self.certs.get(domain).map(|e| Arc::clone(e.value()))
    }
}

impl Default for SniCertResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(
        &self,
        client_hello: rustls::server::ClientHello<'_>,
    ) -> Option<Arc<rustls::sign::CertifiedKey>> {
        let server_name = client_hello.server_name()?;

        let is_acme_challenge = client_hello
            .alpn()
            .map(|mut alpn| alpn.any(|p| p == ACME_TLS_ALPN_NAME))
            .unwrap_or(false);

        if is_acme_challenge {
            return self
                .challenge_certs
                .get(server_name)
                .map(|e| Arc::clone(e.value()));
        }

        self.cert(server_name)
    }
}

/// ACME certificate manager
pub struct CertificateManager {
    email: String,
    directory_url: Option<String>,
    data_dir: PathBuf,
    challenge_type: AcmeChallengeType,
    http01_challenges: Http01Challenges,
    resolver: Arc<SniCertResolver>,
    account: Mutex<Option<Account>>,
    /// Routing keys coverage has been requested for
    managed: DashMap<String, ()>,
    /// Domains with an issuance currently running
    in_flight: DashMap<String, ()>,
    /// Last issuance attempt per domain, for backoff
    last_attempt: DashMap<String, Instant>,
}

impl CertificateManager {
    pub fn new(config: &AcmeConfig, email: String) -> anyhow::Result<Arc<Self>> {
        let data_dir = validate_data_dir(&config.data_dir)?;
        create_private_dir(&data_dir)?;
        create_private_dir(&data_dir.join("certs"))?;
        create_private_dir(&data_dir.join("challenges"))?;

        info!(
            email = %email,
            data_dir = %data_dir.display(),
            challenge_type = ?config.challenge_type,
            "Certificate manager initialized"
        );

        Ok(Arc::new(Self {
            email,
            directory_url: config.directory_url.clone(),
            data_dir,
            challenge_type: config.challenge_type,
            http01_challenges: Http01Challenges::new(),
            resolver: Arc::new(SniCertResolver::new()),
            account: Mutex::new(None),
            managed: DashMap::new(),
            in_flight: DashMap::new(),
            last_attempt: DashMap::new(),
        }))
    }

    pub fn http01_challenges(&self) -> Http01Challenges {
        self.http01_challenges.clone()
    }

    pub fn resolver(&self) -> Arc<SniCertResolver> {
        Arc::clone(&self.resolver)
    }

    pub fn challenge_type(&self) -> AcmeChallengeType {
        self.challenge_type
    }

    /// Whether a usable certificate is installed for a domain
    pub fn has_certificate(&self, domain: &str) -> bool {
        self.resolver.has_cert(domain)
    }

    /// Request asynchronous coverage of a set of routing keys. Idempotent:
    /// domains with a valid certificate (cached or installed) trigger no
    /// ACME traffic, and concurrent calls dedupe on the in-flight set.
    pub fn ensure_managed(self: &Arc<Self>, domains: &[String]) {
        for domain in domains {
            self.managed.insert(domain.clone(), ());

            if self.has_certificate(domain) {
                continue;
            }

            if let Some((certs, key)) = self.load_cached_cert(domain) {
                if let Err(e) = self.install_cert(domain, certs, key) {
                    warn!(domain, error = %e, "Failed to install cached certificate");
                } else {
                    continue;
                }
            }

            let recently_tried = self
                .last_attempt
                .get(domain.as_str())
                .map(|at| at.elapsed() < RETRY_BACKOFF)
                .unwrap_or(false);
            if recently_tried {
                continue;
            }

            self.spawn_issuance(domain.clone());
        }
    }

    fn spawn_issuance(self: &Arc<Self>, domain: String) {
        if self.in_flight.insert(domain.clone(), ()).is_some() {
            return;
        }
        self.last_attempt.insert(domain.clone(), Instant::now());

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.issue(domain).await;
        });
    }

    async fn issue(self: Arc<Self>, domain: String) {
        info!(domain, "Requesting certificate");

        let result = async {
            let account = self.account().await?;
            let (certs, key, cert_pem, key_pem) =
                self.obtain_certificate(&account, &domain).await?;
            self.save_cert(&domain, &cert_pem, &key_pem)?;
            self.install_cert(&domain, certs, key)?;
            Ok::<(), anyhow::Error>(())
        }
        .await;

        match result {
            Ok(()) => info!(domain, "Certificate obtained successfully"),
            Err(e) => error!(domain, error = %e, "Certificate issuance failed"),
        }

        self.in_flight.remove(&domain);
    }

    /// Serve a pending HTTP-01 challenge response, if the path names one.
    /// Stored token material is consulted when the in-memory map misses,
    /// so a restart mid-order still validates.
    pub async fn try_serve_challenge(&self, host: Option<&str>, path: &str) -> Option<String> {
        let token = path.strip_prefix(CHALLENGE_PREFIX)?;
        let token = token.split('/').next().unwrap_or(token);
        if token.is_empty() || !is_safe_token(token) {
            return None;
        }

        if let Some(key_auth) = self.http01_challenges.get(token).await {
            debug!(token, "Responding to ACME HTTP-01 challenge");
            return Some(key_auth);
        }

        let host = host?;
        if !is_safe_token(host) {
            return None;
        }
        let stored = self.data_dir.join("challenges").join(host).join(token);
        std::fs::read_to_string(stored).ok()
    }

    /// Run the renewal sweep: every 12 hours re-issue certificates that are
    /// missing or within the renewal window.
    pub async fn run_renewal(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(RENEWAL_INTERVAL) => {
                    for entry in self.managed.iter() {
                        let domain = entry.key().clone();
                        if !self.has_certificate(&domain) || self.needs_renewal(&domain) {
                            info!(domain, "Certificate renewal needed");
                            self.last_attempt.remove(&domain);
                            self.spawn_issuance(domain);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Certificate manager shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn needs_renewal(&self, domain: &str) -> bool {
        match self.resolver.cert(domain) {
            Some(certified) => certified
                .cert
                .first()
                .map(|c| !is_cert_valid_for_days(c, RENEWAL_THRESHOLD_DAYS))
                .unwrap_or(true),
            None => true,
        }
    }

    /// Load or create the ACME account
    async fn account(&self) -> anyhow::Result<Account> {
        let mut guard = self.account.lock().await;
        if let Some(account) = guard.as_ref() {
            return Ok(account.clone());
        }

        let account_path = self.data_dir.join("account.json");
        let account = if account_path.exists() {
            debug!(path = %account_path.display(), "Loading existing ACME account");
            let data = std::fs::read_to_string(&account_path)?;
            let credentials: AccountCredentials = serde_json::from_str(&data)?;
            Account::from_credentials(credentials).await?
        } else {
            info!("Creating new ACME account");
            let directory_url = self
                .directory_url
                .as_deref()
                .unwrap_or(LetsEncrypt::Production.url());

            let (account, credentials) = Account::create(
                &NewAccount {
                    contact: &[&format!("mailto:{}", self.email)],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                directory_url,
                None,
            )
            .await?;

            let data = serde_json::to_string_pretty(&credentials)?;
            write_restricted(&account_path, data.as_bytes())?;
            info!(path = %account_path.display(), "ACME account credentials saved");
            account
        };

        *guard = Some(account.clone());
        Ok(account)
    }

    /// Obtain a certificate for one domain via ACME
    async fn obtain_certificate(
        &self,
        account: &Account,
        domain: &str,
    ) -> anyhow::Result<(
        Vec<CertificateDer<'static>>,
        PrivateKeyDer<'static>,
        String,
        String,
    )> {
        let identifiers = vec![Identifier::Dns(domain.to_string())];

        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let authorizations = order.authorizations().await?;

        for authz in authorizations {
            if matches!(authz.status, AuthorizationStatus::Valid) {
                continue;
            }

            let identifier = match &authz.identifier {
                Identifier::Dns(domain) => domain.clone(),
            };

            let challenge_type = match self.challenge_type {
                AcmeChallengeType::Http01 => ChallengeType::Http01,
                AcmeChallengeType::TlsAlpn01 => ChallengeType::TlsAlpn01,
            };

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == challenge_type)
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "Challenge type {:?} not available for {}",
                        self.challenge_type,
                        identifier
                    )
                })?;

            let key_auth = order.key_authorization(challenge);
            let key_auth_str = key_auth.as_str().to_string();
            let digest: Vec<u8> = key_auth.digest().as_ref().to_vec();

            match self.challenge_type {
                AcmeChallengeType::Http01 => {
                    debug!(domain = %identifier, token = %challenge.token, "Setting up HTTP-01 challenge");
                    self.http01_challenges
                        .set(challenge.token.clone(), key_auth_str.clone())
                        .await;
                    self.store_challenge_material(&identifier, &challenge.token, &key_auth_str);
                }
                AcmeChallengeType::TlsAlpn01 => {
                    debug!(domain = %identifier, "Setting up TLS-ALPN-01 challenge");
                    let challenge_cert = create_tls_alpn01_cert(&identifier, &digest)?;
                    self.resolver.set_challenge_cert(&identifier, challenge_cert);
                }
            }

            // Notify ACME server we're ready
            order.set_challenge_ready(&challenge.url).await?;

            // Wait for authorization to become valid
            let mut attempts = 0;
            loop {
                tokio::time::sleep(Duration::from_secs(2)).await;

                order.refresh().await?;
                let auths = order.authorizations().await?;
                let current_auth = auths
                    .iter()
                    .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == &identifier));

                match current_auth.map(|a| &a.status) {
                    Some(AuthorizationStatus::Valid) => {
                        info!(domain = %identifier, "Authorization valid");
                        break;
                    }
                    Some(AuthorizationStatus::Pending) => {
                        attempts += 1;
                        if attempts > 30 {
                            anyhow::bail!("Authorization timeout for {}", identifier);
                        }
                        debug!(domain = %identifier, attempt = attempts, "Waiting for authorization");
                    }
                    Some(AuthorizationStatus::Invalid) => {
                        anyhow::bail!("Authorization failed for {}", identifier);
                    }
                    Some(status) => {
                        debug!(domain = %identifier, status = ?status, "Authorization status");
                    }
                    None => {
                        anyhow::bail!("Authorization not found for {}", identifier);
                    }
                }
            }

            // Clean up challenge
            match self.challenge_type {
                AcmeChallengeType::Http01 => {
                    self.http01_challenges.remove(&challenge.token).await;
                    self.remove_challenge_material(&identifier, &challenge.token);
                }
                AcmeChallengeType::TlsAlpn01 => {
                    self.resolver.remove_challenge_cert(&identifier);
                }
            }
        }

        // Wait for order to be ready
        let mut attempts = 0;
        loop {
            let state = order.state();
            match state.status {
                OrderStatus::Ready => break,
                OrderStatus::Pending => {
                    attempts += 1;
                    if attempts > 30 {
                        anyhow::bail!("Order timeout");
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    order.refresh().await?;
                }
                OrderStatus::Invalid => {
                    anyhow::bail!("Order invalid");
                }
                OrderStatus::Valid => break,
                OrderStatus::Processing => {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    order.refresh().await?;
                }
            }
        }

        // Generate CSR and finalize order
        let mut params = CertificateParams::new(vec![domain.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, domain.to_string());

        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&private_key)?;

        order.finalize(csr.der()).await?;

        // Wait for certificate
        let mut attempts = 0;
        let cert_chain_pem: String = loop {
            order.refresh().await?;
            let state = order.state();

            match state.status {
                OrderStatus::Valid => {
                    if let Some(cert) = order.certificate().await? {
                        break cert;
                    }
                    anyhow::bail!("Order valid but no certificate returned");
                }
                OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > 30 {
                        anyhow::bail!("Certificate timeout");
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                _ => anyhow::bail!("Unexpected order status: {:?}", state.status),
            }
        };

        let private_key_pem = private_key.serialize_pem();

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(cert_chain_pem.as_bytes()))
                .filter_map(|c| c.ok())
                .collect();

        let key = PrivateKeyDer::try_from(private_key.serialize_der())
            .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;

        Ok((certs, key, cert_chain_pem, private_key_pem))
    }

    /// Build a signing key and expose the certificate to TLS handshakes
    fn install_cert(
        &self,
        domain: &str,
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> anyhow::Result<()> {
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| anyhow::anyhow!("Failed to create signing key: {}", e))?;

        let certified_key = Arc::new(CertifiedKey::new(certs, signing_key));
        self.resolver.set_cert(domain, certified_key);
        Ok(())
    }

    fn cert_dir(&self, domain: &str) -> PathBuf {
        self.data_dir.join("certs").join(domain)
    }

    /// Load a cached certificate for a domain if still valid long enough
    fn load_cached_cert(
        &self,
        domain: &str,
    ) -> Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let cert_path = self.cert_dir(domain).join("cert.pem");
        let key_path = self.cert_dir(domain).join("key.pem");

        if !cert_path.exists() || !key_path.exists() {
            return None;
        }

        let cert_data = std::fs::read(&cert_path).ok()?;
        let key_data = std::fs::read(&key_path).ok()?;

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(&cert_data[..]))
                .filter_map(|c| c.ok())
                .collect();

        if certs.is_empty() {
            return None;
        }

        let key = load_private_key(&key_data)?;

        if let Some(cert) = certs.first() {
            if !is_cert_valid_for_days(cert, RENEWAL_THRESHOLD_DAYS) {
                info!(domain, "Cached certificate expires soon, will renew");
                return None;
            }
        }

        info!(domain, path = %cert_path.display(), "Loaded cached certificate");
        Some((certs, key))
    }

    /// Save a certificate to the cache with restricted permissions
    fn save_cert(&self, domain: &str, cert_chain_pem: &str, private_key_pem: &str) -> anyhow::Result<()> {
        let dir = self.cert_dir(domain);
        create_private_dir(&dir)?;

        std::fs::write(dir.join("cert.pem"), cert_chain_pem)?;
        write_restricted(&dir.join("key.pem"), private_key_pem.as_bytes())?;

        info!(domain, path = %dir.display(), "Certificate saved to cache");
        Ok(())
    }

    fn store_challenge_material(&self, domain: &str, token: &str, key_auth: &str) {
        let dir = self.data_dir.join("challenges").join(domain);
        if let Err(e) = create_private_dir(&dir) {
            warn!(domain, error = %e, "Failed to create challenge directory");
            return;
        }
        if let Err(e) = write_restricted(&dir.join(token), key_auth.as_bytes()) {
            warn!(domain, token, error = %e, "Failed to store challenge token");
        }
    }

    fn remove_challenge_material(&self, domain: &str, token: &str) {
        let path = self.data_dir.join("challenges").join(domain).join(token);
        let _ = std::fs::remove_file(path);
    }
}

/// Create a TLS-ALPN-01 challenge certificate
fn create_tls_alpn01_cert(domain: &str, digest: &[u8]) -> anyhow::Result<Arc<CertifiedKey>> {
    use rcgen::{CustomExtension, IsCa, KeyUsagePurpose};

    let mut params = CertificateParams::new(vec![domain.to_string()])?;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];

    // Add the acmeIdentifier extension with the key authorization digest
    let mut ext_value = vec![0x04, 0x20]; // OCTET STRING of 32 bytes
    ext_value.extend_from_slice(digest);

    let extension = CustomExtension::from_oid_content(ACME_ALPN_OID, ext_value);
    params.custom_extensions.push(extension);

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    let cert = params.self_signed(&key_pair)?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
        .map_err(|e| anyhow::anyhow!("Failed to create signing key: {}", e))?;

    Ok(Arc::new(CertifiedKey::new(vec![cert_der], signing_key)))
}

fn load_private_key(data: &[u8]) -> Option<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(data);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Some(key.into()),
            Ok(None) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

fn is_cert_valid_for_days(cert: &CertificateDer<'_>, days: u64) -> bool {
    use x509_parser::prelude::*;

    let (_, parsed) = match X509Certificate::from_der(cert.as_ref()) {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Failed to parse X.509 certificate");
            return false;
        }
    };

    let not_after = parsed.validity().not_after;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let expiry = not_after.timestamp();

    let remaining_secs = expiry - now;
    if remaining_secs < 0 {
        info!("Certificate has already expired");
        return false;
    }

    let remaining_days = remaining_secs as u64 / (24 * 60 * 60);
    if remaining_days < days {
        info!(
            remaining_days,
            required_days = days,
            "Certificate expires soon, renewal needed"
        );
        return false;
    }

    debug!(
        remaining_days,
        expiry_timestamp = expiry,
        "Certificate validity check passed"
    );
    true
}

/// A token or host segment safe to join into a storage path
fn is_safe_token(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !s.starts_with('.')
}

/// Create a directory (and parents) owner-accessible only
fn create_private_dir(path: &std::path::Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Write a file readable by the owner only (0600)
fn write_restricted(path: &std::path::Path, contents: &[u8]) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        std::io::Write::write_all(&mut file, contents)?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, contents)?;
    }
    Ok(())
}

/// Validate and canonicalize the data directory path
fn validate_data_dir(path: &str) -> anyhow::Result<PathBuf> {
    // Check for path traversal attempts
    if path.contains("..") {
        anyhow::bail!("ACME data directory path must not contain '..'");
    }

    let path_buf = PathBuf::from(path);

    // If path exists, canonicalize it to resolve symlinks
    if path_buf.exists() {
        let canonical = path_buf.canonicalize().map_err(|e| {
            anyhow::anyhow!("Failed to canonicalize ACME data directory '{}': {}", path, e)
        })?;

        if !canonical.is_dir() {
            anyhow::bail!("ACME data path '{}' exists but is not a directory", path);
        }

        return Ok(canonical);
    }

    // Path doesn't exist - validate the parent exists and is safe
    if let Some(parent) = path_buf.parent() {
        if parent.as_os_str().is_empty() {
            return Ok(path_buf);
        }

        if parent.exists() {
            let canonical_parent = parent
                .canonicalize()
                .map_err(|e| anyhow::anyhow!("Failed to canonicalize parent directory: {}", e))?;

            if let Some(file_name) = path_buf.file_name() {
                return Ok(canonical_parent.join(file_name));
            }
        }
    }

    // Return as-is if parent doesn't exist (will fail later on create)
    Ok(path_buf)
}
