// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The node's certificate authority and server certificate lifecycle.
//!
//! A [`CertificateManager`] moves through `Uninitialized -> Initializing -> Ready`, alternates
//! between `Ready` and `Renewing` while the server certificate is replaced, and ends `Closed`.
//! Only the manager ever holds the decrypted CA private key.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use chrono::{DateTime, Utc};
use openssl::{
    ssl::{SslAcceptor, SslMethod, SslVerifyMode, SslVersion},
    x509::{store::X509StoreBuilder, X509},
};
use tracing::instrument;
use zeroize::{Zeroize, Zeroizing};

use crate::{
    config::{Config, Paths},
    error::Error,
    generator::{self, CertificateKind, Issuer, ParsedCertificate},
    keystore, persist,
    revocation::RevocationList,
    truststore::TrustStore,
    Result,
};

/// The oldest protocol version the server accepts.
pub const MIN_TLS_VERSION: SslVersion = SslVersion::TLS1_2;

/// The TLS 1.2 cipher suites the server accepts; TLS 1.3 suites are all AEAD already.
pub const TLS12_CIPHER_LIST: &str = "ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-GCM-SHA256:\
    ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-RSA-AES256-GCM-SHA384";

const PRIVATE_DIR_MODE: u32 = 0o700;
const PUBLIC_DIR_MODE: u32 = 0o755;

/// Where a [`CertificateManager`] is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Initializing,
    Ready,
    /// The server certificate is being replaced; the previous TLS configuration is still served.
    Renewing,
    Closed,
}

/// The TLS configuration the transport layer serves inbound connections with.
///
/// Clients may present a certificate issued by the local CA, which is then verified during the
/// handshake. Clients without a certificate are still accepted and must be treated as
/// unauthenticated.
pub struct ServerTlsConfig {
    acceptor: SslAcceptor,
    certificate_pem: String,
    certificate: ParsedCertificate,
}

impl std::fmt::Debug for ServerTlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTlsConfig")
            .field("fingerprint", &self.certificate.fingerprint)
            .field("not_after", &self.certificate.not_after)
            .finish_non_exhaustive()
    }
}

impl ServerTlsConfig {
    fn new(ca_cert: &X509, certificate_pem: &str, private_key_pem: &str) -> Result<Self> {
        let cert = generator::load_certificate(certificate_pem)?;
        let key = generator::load_private_key(private_key_pem)?;

        let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;
        acceptor.set_min_proto_version(Some(MIN_TLS_VERSION))?;
        acceptor.set_cipher_list(TLS12_CIPHER_LIST)?;
        // Verify a client certificate if one is offered, but don't require one.
        acceptor.set_verify(SslVerifyMode::PEER);
        let mut client_cas = X509StoreBuilder::new()?;
        client_cas.add_cert(ca_cert.clone())?;
        acceptor.set_verify_cert_store(client_cas.build())?;
        acceptor.add_client_ca(ca_cert)?;
        acceptor.set_private_key(&key)?;
        acceptor.set_certificate(&cert)?;
        acceptor.check_private_key()?;

        Ok(Self {
            acceptor: acceptor.build(),
            certificate_pem: certificate_pem.to_string(),
            certificate: generator::parse_certificate(certificate_pem)?,
        })
    }

    pub fn acceptor(&self) -> &SslAcceptor {
        &self.acceptor
    }

    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    pub fn certificate(&self) -> &ParsedCertificate {
        &self.certificate
    }

    pub fn fingerprint(&self) -> &str {
        &self.certificate.fingerprint
    }
}

/// A client certificate issued by the local CA, along with what's needed to use it.
pub struct IssuedCertificate {
    pub certificate: String,
    /// The PKCS#8 private key. It is zeroed when dropped.
    pub private_key: Zeroizing<String>,
    pub ca_certificate: String,
    pub fingerprint: String,
    pub not_after: DateTime<Utc>,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("fingerprint", &self.fingerprint)
            .field("not_after", &self.not_after)
            .field("private_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

/// Everything loaded by [`CertificateManager::initialize`].
struct Material {
    issuer: Arc<Issuer>,
    ca_cert_pem: String,
    ca_fingerprint: String,
    /// Kept so the decrypted key is zeroed, rather than just freed, on close.
    ca_key_pem: Zeroizing<String>,
    tls: Arc<ServerTlsConfig>,
    revocations: Arc<RevocationList>,
    trust_store: Arc<TrustStore>,
}

struct State {
    lifecycle: Lifecycle,
    identity_secret: Zeroizing<Vec<u8>>,
    material: Option<Material>,
}

/// Owns the CA, the server certificate, and the TLS configuration built from them.
///
/// The manager is meant to be shared (for example in an [`Arc`]) between the connection
/// handlers that fetch the TLS configuration and verify client certificates, and a periodic
/// task that calls [`CertificateManager::check_renewal`].
pub struct CertificateManager {
    config: Config,
    paths: Paths,
    state: RwLock<State>,
    // Serializes renewals so only one replacement certificate is generated at a time.
    renewal: Mutex<()>,
}

impl std::fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateManager")
            .field("config_directory", &self.config.config_directory)
            .field("lifecycle", &self.lifecycle())
            .finish_non_exhaustive()
    }
}

impl CertificateManager {
    /// Create a manager for `config`.
    ///
    /// The `identity_secret` is the node's P2P identity private key; the CA key is encrypted
    /// at rest with a key derived from it. Nothing is read or written until
    /// [`CertificateManager::initialize`] is called.
    pub fn new(config: Config, identity_secret: Zeroizing<Vec<u8>>) -> Self {
        let paths = config.paths();
        Self {
            config,
            paths,
            state: RwLock::new(State {
                lifecycle: Lifecycle::Uninitialized,
                identity_secret,
                material: None,
            }),
            renewal: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .lifecycle
    }

    /// Load or create the CA and server certificate, build the TLS configuration, and open the
    /// revocation list and trust store.
    ///
    /// Calling this on a manager that's already ready does nothing.
    ///
    /// # Errors
    ///
    /// Any failure is fatal; the node must not start without working trust material. In
    /// particular, [`Error::KeyDecryption`] means the CA key exists but can't be used with this
    /// node's identity key, and [`Error::KeyNotFound`] means the CA certificate exists but its key
    /// is gone. Neither is resolved by generating a new CA. The manager returns to
    /// [`Lifecycle::Uninitialized`] on failure.
    #[instrument(skip_all, err, fields(config_directory = %self.config.config_directory.display()))]
    pub fn initialize(&self) -> Result<()> {
        let identity_secret = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            match state.lifecycle {
                Lifecycle::Uninitialized => {}
                Lifecycle::Ready => return Ok(()),
                other => return Err(Error::NotReady(other)),
            }
            state.lifecycle = Lifecycle::Initializing;
            state.identity_secret.clone()
        };

        let result = self.load_material(&identity_secret);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.lifecycle != Lifecycle::Initializing {
            // Closed while initializing; drop whatever was loaded.
            return Err(Error::NotReady(state.lifecycle));
        }
        match result {
            Ok(material) => {
                tracing::info!(
                    ca_fingerprint = %material.ca_fingerprint,
                    server_fingerprint = %material.tls.fingerprint(),
                    "Certificate manager is ready"
                );
                state.material = Some(material);
                state.lifecycle = Lifecycle::Ready;
                Ok(())
            }
            Err(error) => {
                state.lifecycle = Lifecycle::Uninitialized;
                Err(error)
            }
        }
    }

    fn load_material(&self, identity_secret: &[u8]) -> Result<Material> {
        self.prepare_directories()?;
        let (issuer, ca_cert_pem, ca_key_pem) = self.load_or_create_ca(identity_secret)?;
        let ca_fingerprint = generator::fingerprint_der(&issuer.cert.to_der()?);
        let tls = self.load_or_create_server_cert(&issuer)?;
        let revocations = RevocationList::open(self.paths.revocation_list())?;
        let trust_store = TrustStore::open(self.paths.trusted_nodes_dir())?;
        Ok(Material {
            issuer: Arc::new(issuer),
            ca_cert_pem,
            ca_fingerprint,
            ca_key_pem,
            tls: Arc::new(tls),
            revocations: Arc::new(revocations),
            trust_store: Arc::new(trust_store),
        })
    }

    fn prepare_directories(&self) -> Result<()> {
        let directories = [
            (self.paths.certs_dir(), PUBLIC_DIR_MODE),
            (self.paths.secrets_dir(), PRIVATE_DIR_MODE),
            (self.paths.trusted_nodes_dir(), PRIVATE_DIR_MODE),
        ];
        for (path, mode) in directories {
            persist::create_dir(&path, mode)
                .map_err(|source| Error::ConfigDirectory { path, source })?;
        }
        Ok(())
    }

    fn load_or_create_ca(
        &self,
        identity_secret: &[u8],
    ) -> Result<(Issuer, String, Zeroizing<String>)> {
        let ca_cert_path = self.paths.ca_cert();
        let encrypted_key_path = self.paths.encrypted_ca_key();
        let ca_cert_pem = match std::fs::read_to_string(&ca_cert_path) {
            Ok(pem) => pem,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return self.create_ca(identity_secret)
            }
            Err(error) => return Err(error.into()),
        };

        let ca_key_pem = match keystore::load_encrypted_key(&encrypted_key_path, identity_secret) {
            Ok(key) => key,
            Err(Error::KeyNotFound(path)) => {
                let legacy_key_path = self.paths.legacy_ca_key();
                if !legacy_key_path.exists() {
                    return Err(Error::KeyNotFound(path));
                }
                return self.migrate_legacy_ca_key(ca_cert_pem, identity_secret);
            }
            Err(error) => return Err(error),
        };
        let issuer = Issuer::from_pem(&ca_cert_pem, &ca_key_pem)?;
        tracing::debug!(path = %ca_cert_path.display(), "Loaded certificate authority");
        Ok((issuer, ca_cert_pem, ca_key_pem))
    }

    fn create_ca(&self, identity_secret: &[u8]) -> Result<(Issuer, String, Zeroizing<String>)> {
        let encrypted_key_path = self.paths.encrypted_ca_key();
        if encrypted_key_path.exists() {
            tracing::warn!(
                path = %encrypted_key_path.display(),
                "Found a CA key without a CA certificate; it will be replaced"
            );
        }
        let generated = generator::generate_ca(&self.config.ca_generator())?;
        let issuer = Issuer::from_pem(&generated.certificate, &generated.private_key)?;
        // The key is written first; a certificate without its key can't be recovered from.
        keystore::save_encrypted_key(&encrypted_key_path, &generated.private_key, identity_secret)?;
        persist::write_atomic(
            &self.paths.ca_cert(),
            generated.certificate.as_bytes(),
            persist::PUBLIC_FILE_MODE,
        )?;
        tracing::info!(
            fingerprint = %generator::fingerprint(&generated.certificate)?,
            "Generated a new certificate authority"
        );
        Ok((issuer, generated.certificate, generated.private_key))
    }

    /// Encrypt a CA key that older installations left in plain text next to the certificate.
    fn migrate_legacy_ca_key(
        &self,
        ca_cert_pem: String,
        identity_secret: &[u8],
    ) -> Result<(Issuer, String, Zeroizing<String>)> {
        let legacy_key_path = self.paths.legacy_ca_key();
        let encrypted_key_path = self.paths.encrypted_ca_key();
        let ca_key_pem = Zeroizing::new(std::fs::read_to_string(&legacy_key_path)?);
        let issuer = Issuer::from_pem(&ca_cert_pem, &ca_key_pem)?;

        keystore::save_encrypted_key(&encrypted_key_path, &ca_key_pem, identity_secret)?;
        let round_trip = keystore::load_encrypted_key(&encrypted_key_path, identity_secret)?;
        if round_trip.as_str() != ca_key_pem.as_str() {
            return Err(Error::KeyDecryption(
                "the migrated CA key did not survive an encryption round trip".to_string(),
            ));
        }
        std::fs::remove_file(&legacy_key_path)?;
        tracing::warn!(
            legacy_path = %legacy_key_path.display(),
            encrypted_path = %encrypted_key_path.display(),
            "Migrated the plaintext CA key to encrypted storage and removed the plaintext copy"
        );
        Ok((issuer, ca_cert_pem, ca_key_pem))
    }

    fn load_or_create_server_cert(&self, issuer: &Issuer) -> Result<ServerTlsConfig> {
        match self.load_server_cert(issuer) {
            Ok(Some(tls)) => return Ok(tls),
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(%error, "The server certificate is unusable; generating a new one");
            }
        }
        self.create_server_cert(issuer)
    }

    /// Load the server certificate, returning `None` if it's missing or due for renewal.
    fn load_server_cert(&self, issuer: &Issuer) -> Result<Option<ServerTlsConfig>> {
        let (cert_path, key_path) = (self.paths.server_cert(), self.paths.server_key());
        if !cert_path.exists() || !key_path.exists() {
            tracing::info!("No server certificate found");
            return Ok(None);
        }
        let certificate_pem = std::fs::read_to_string(&cert_path)?;
        let private_key_pem = Zeroizing::new(std::fs::read_to_string(&key_path)?);
        generator::verify_x509_chain(
            &generator::load_certificate(&certificate_pem)?,
            &issuer.cert,
        )?;
        let tls = ServerTlsConfig::new(&issuer.cert, &certificate_pem, &private_key_pem)?;
        if tls
            .certificate()
            .needs_renewal_at(Utc::now(), self.config.renewal_threshold())
        {
            tracing::info!(
                not_after = %tls.certificate().not_after,
                "The server certificate is due for renewal"
            );
            return Ok(None);
        }
        Ok(Some(tls))
    }

    fn create_server_cert(&self, issuer: &Issuer) -> Result<ServerTlsConfig> {
        let generated = issuer.issue(CertificateKind::Server, &self.config.server_generator())?;
        let tls = ServerTlsConfig::new(
            &issuer.cert,
            &generated.certificate,
            &generated.private_key,
        )?;
        persist::write_atomic(
            &self.paths.server_key(),
            generated.private_key.as_bytes(),
            persist::PRIVATE_FILE_MODE,
        )?;
        persist::write_atomic(
            &self.paths.server_cert(),
            generated.certificate.as_bytes(),
            persist::PUBLIC_FILE_MODE,
        )?;
        tracing::info!(
            fingerprint = %tls.fingerprint(),
            not_after = %tls.certificate().not_after,
            "Generated a new server certificate"
        );
        Ok(tls)
    }

    /// Run `f` against the loaded material, failing unless the manager is ready or renewing.
    fn with_material<T>(&self, f: impl FnOnce(&Material) -> Result<T>) -> Result<T> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        match (&state.lifecycle, &state.material) {
            (Lifecycle::Ready | Lifecycle::Renewing, Some(material)) => f(material),
            (lifecycle, _) => Err(Error::NotReady(*lifecycle)),
        }
    }

    /// The current server TLS configuration.
    ///
    /// The returned configuration stays valid after a renewal; only connections accepted with a
    /// configuration fetched afterwards use the new certificate.
    pub fn tls_config(&self) -> Result<Arc<ServerTlsConfig>> {
        self.with_material(|material| Ok(material.tls.clone()))
    }

    pub fn ca_cert_pem(&self) -> Result<String> {
        self.with_material(|material| Ok(material.ca_cert_pem.clone()))
    }

    pub fn ca_fingerprint(&self) -> Result<String> {
        self.with_material(|material| Ok(material.ca_fingerprint.clone()))
    }

    pub fn server_certificate(&self) -> Result<ParsedCertificate> {
        self.with_material(|material| Ok(material.tls.certificate().clone()))
    }

    pub fn revocations(&self) -> Result<Arc<RevocationList>> {
        self.with_material(|material| Ok(material.revocations.clone()))
    }

    pub fn trust_store(&self) -> Result<Arc<TrustStore>> {
        self.with_material(|material| Ok(material.trust_store.clone()))
    }

    /// Issue a client certificate signed by the local CA.
    ///
    /// Nothing is persisted; see [`CertificateManager::save_client_cert`]. Common names need not
    /// be unique.
    pub fn generate_client_cert(
        &self,
        name: &str,
        user_id: Option<&str>,
        ssh_fingerprint: Option<&str>,
    ) -> Result<IssuedCertificate> {
        let generator_config = self
            .config
            .client_generator(name, user_id, ssh_fingerprint);
        let (generated, ca_certificate) = self.with_material(|material| {
            let generated = material
                .issuer
                .issue(CertificateKind::Client, &generator_config)?;
            Ok((generated, material.ca_cert_pem.clone()))
        })?;
        let parsed = generator::parse_certificate(&generated.certificate)?;
        tracing::info!(
            name,
            user_id,
            fingerprint = %parsed.fingerprint,
            "Issued client certificate"
        );
        Ok(IssuedCertificate {
            certificate: generated.certificate,
            private_key: generated.private_key,
            ca_certificate,
            fingerprint: parsed.fingerprint,
            not_after: parsed.not_after,
        })
    }

    /// Write a client certificate bundle to `client_certs/<name>/`, returning the directory.
    pub fn save_client_cert(&self, name: &str, issued: &IssuedCertificate) -> Result<PathBuf> {
        let directory = self.paths.client_cert_dir(name);
        persist::create_dir(&directory, PRIVATE_DIR_MODE).map_err(|source| {
            Error::ConfigDirectory {
                path: directory.clone(),
                source,
            }
        })?;
        persist::write_atomic(
            &directory.join("client.key"),
            issued.private_key.as_bytes(),
            persist::PRIVATE_FILE_MODE,
        )?;
        persist::write_atomic(
            &directory.join("client.crt"),
            issued.certificate.as_bytes(),
            persist::PUBLIC_FILE_MODE,
        )?;
        persist::write_atomic(
            &directory.join("ca.crt"),
            issued.ca_certificate.as_bytes(),
            persist::PUBLIC_FILE_MODE,
        )?;
        tracing::info!(directory = %directory.display(), "Saved client certificate bundle");
        Ok(directory)
    }

    /// Replace the server certificate if it's within the renewal threshold of expiring.
    ///
    /// Returns whether a new certificate was issued. Calling this repeatedly is harmless.
    #[instrument(skip_all, err)]
    pub fn check_renewal(&self) -> Result<bool> {
        let _renewal = self.renewal.lock().unwrap_or_else(PoisonError::into_inner);
        let issuer = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let threshold = self.config.renewal_threshold();
            let material = match (state.lifecycle, &state.material) {
                (Lifecycle::Ready, Some(material)) => material,
                (lifecycle, _) => return Err(Error::NotReady(lifecycle)),
            };
            if !material
                .tls
                .certificate()
                .needs_renewal_at(Utc::now(), threshold)
            {
                tracing::debug!("The server certificate does not need renewal");
                return Ok(false);
            }
            let issuer = material.issuer.clone();
            state.lifecycle = Lifecycle::Renewing;
            issuer
        };

        // Connections keep being served with the old configuration while this runs.
        let result = self.create_server_cert(&issuer);

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.lifecycle != Lifecycle::Renewing {
            return Err(Error::NotReady(state.lifecycle));
        }
        state.lifecycle = Lifecycle::Ready;
        let tls = result?;
        tracing::info!(fingerprint = %tls.fingerprint(), "Renewed the server certificate");
        if let Some(material) = state.material.as_mut() {
            material.tls = Arc::new(tls);
        }
        Ok(true)
    }

    /// Authorize a client certificate presented on an inbound connection.
    ///
    /// The certificate must chain to the local CA, be within its validity window, and not be
    /// revoked. On success, the parsed certificate is returned so the caller can read the
    /// identity bound to it.
    pub fn verify_client_cert(&self, certificate_pem: &str) -> Result<ParsedCertificate> {
        let certificate = generator::load_certificate(certificate_pem)?;
        let (issuer, revocations) = self.with_material(|material| {
            Ok((material.issuer.clone(), material.revocations.clone()))
        })?;
        generator::verify_x509_chain(&certificate, &issuer.cert)?;
        let parsed = generator::parse_certificate(certificate_pem)?;
        if revocations.is_revoked(&parsed.fingerprint) {
            tracing::warn!(
                fingerprint = %parsed.fingerprint,
                subject = %parsed.subject,
                "Rejected revoked client certificate"
            );
            return Err(Error::Revoked {
                fingerprint: parsed.fingerprint,
            });
        }
        tracing::debug!(fingerprint = %parsed.fingerprint, "Client certificate verified");
        Ok(parsed)
    }

    /// Release the decrypted CA key and identity secret.
    ///
    /// Nothing on disk is touched. Zeroing is best effort: OpenSSL manages its own copy of the
    /// key, which is only freed.
    pub fn close(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut material) = state.material.take() {
            material.ca_key_pem.zeroize();
        }
        state.identity_secret.zeroize();
        state.lifecycle = Lifecycle::Closed;
        tracing::info!("Certificate manager closed");
    }
}


#[cfg(test)]
mod tests {
    use anyhow::Result;
    use tracing_test::traced_test;

    use super::{test_utils::*, *};
    use crate::revocation::{RevocationReason, RevokedCertificate};

    #[test]
    fn initialize_creates_layout() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let manager = manager(dir.path());
        assert_eq!(manager.lifecycle(), Lifecycle::Uninitialized);
        manager.initialize()?;
        assert_eq!(manager.lifecycle(), Lifecycle::Ready);

        let paths = manager.paths();
        for path in [
            paths.ca_cert(),
            paths.encrypted_ca_key(),
            paths.server_cert(),
            paths.server_key(),
        ] {
            assert!(path.exists(), "{path:?} should exist");
        }
        assert!(paths.trusted_nodes_dir().is_dir());
        assert!(!paths.legacy_ca_key().exists());

        let ca_pem = std::fs::read_to_string(paths.ca_cert())?;
        assert_eq!(manager.ca_cert_pem()?, ca_pem);
        assert_eq!(manager.ca_fingerprint()?, generator::fingerprint(&ca_pem)?);
        let server_pem = std::fs::read_to_string(paths.server_cert())?;
        generator::verify_chain(&server_pem, &ca_pem)?;
        assert_eq!(
            manager.tls_config()?.fingerprint(),
            generator::fingerprint(&server_pem)?
        );
        let server = manager.server_certificate()?;
        assert_eq!(server.common_name.as_deref(), Some("node-a"));
        assert!(server.dns_names.contains(&"localhost".to_string()));

        // Initializing twice is a no-op.
        manager.initialize()?;
        assert_eq!(manager.ca_fingerprint()?, generator::fingerprint(&ca_pem)?);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn private_files_are_owner_only() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new()?;
        let manager = manager(dir.path());
        manager.initialize()?;
        let mode = |path: PathBuf| -> Result<u32> {
            Ok(std::fs::metadata(path)?.permissions().mode() & 0o777)
        };
        assert_eq!(mode(manager.paths().server_key())?, 0o600);
        assert_eq!(mode(manager.paths().encrypted_ca_key())?, 0o600);
        assert_eq!(mode(manager.paths().secrets_dir())?, 0o700);
        assert_eq!(mode(manager.paths().ca_cert())?, 0o644);
        Ok(())
    }

    #[test]
    fn restart_reuses_material() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let first = manager(dir.path());
        first.initialize()?;
        let ca_fingerprint = first.ca_fingerprint()?;
        let server_fingerprint = first.tls_config()?.fingerprint().to_string();
        first.close();

        let second = manager(dir.path());
        second.initialize()?;
        assert_eq!(second.ca_fingerprint()?, ca_fingerprint);
        assert_eq!(second.tls_config()?.fingerprint(), server_fingerprint);
        Ok(())
    }

    // A different identity key must never lead to a silently regenerated CA.
    #[test]
    fn wrong_identity_is_fatal() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        manager(dir.path()).initialize()?;
        let ca_pem = std::fs::read_to_string(dir.path().join("certs/ca.crt"))?;

        let other = CertificateManager::new(
            config(dir.path()),
            Zeroizing::new(b"another node's identity".to_vec()),
        );
        let result = other.initialize();
        assert!(matches!(result, Err(Error::KeyDecryption(_))));
        assert_eq!(other.lifecycle(), Lifecycle::Uninitialized);
        assert!(matches!(
            other.tls_config(),
            Err(Error::NotReady(Lifecycle::Uninitialized))
        ));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("certs/ca.crt"))?,
            ca_pem
        );
        Ok(())
    }

    #[test]
    fn missing_ca_key_is_fatal() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let first = manager(dir.path());
        first.initialize()?;
        std::fs::remove_file(first.paths().encrypted_ca_key())?;

        let result = manager(dir.path()).initialize();
        assert!(matches!(result, Err(Error::KeyNotFound(_))));
        assert!(!first.paths().encrypted_ca_key().exists());
        Ok(())
    }

    #[traced_test]
    #[test]
    fn legacy_plaintext_key_is_migrated() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let paths = Paths::new(dir.path());
        std::fs::create_dir_all(paths.certs_dir())?;
        let ca = generator::generate_ca(&config(dir.path()).ca_generator())?;
        std::fs::write(paths.ca_cert(), &ca.certificate)?;
        std::fs::write(paths.legacy_ca_key(), ca.private_key.as_bytes())?;

        let manager = manager(dir.path());
        manager.initialize()?;
        assert_eq!(
            manager.ca_fingerprint()?,
            generator::fingerprint(&ca.certificate)?
        );
        assert!(!paths.legacy_ca_key().exists());
        assert_eq!(
            keystore::load_encrypted_key(&paths.encrypted_ca_key(), IDENTITY)?.as_str(),
            ca.private_key.as_str()
        );
        assert!(logs_contain("Migrated the plaintext CA key"));
        Ok(())
    }

    #[test]
    fn mismatched_legacy_key_is_not_migrated() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let paths = Paths::new(dir.path());
        std::fs::create_dir_all(paths.certs_dir())?;
        let ca = generator::generate_ca(&config(dir.path()).ca_generator())?;
        let other = generator::generate_ca(&config(dir.path()).ca_generator())?;
        std::fs::write(paths.ca_cert(), &ca.certificate)?;
        std::fs::write(paths.legacy_ca_key(), other.private_key.as_bytes())?;

        let result = manager(dir.path()).initialize();
        assert!(matches!(result, Err(Error::KeyDecryption(_))));
        assert!(paths.legacy_ca_key().exists());
        assert!(!paths.encrypted_ca_key().exists());
        Ok(())
    }

    #[test]
    fn foreign_server_cert_is_replaced() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let first = manager(dir.path());
        first.initialize()?;
        first.close();

        let foreign_ca = generator::test_utils::ca("Foreign CA");
        let foreign = generator::generate_server_cert(
            &foreign_ca.certificate,
            &foreign_ca.private_key,
            &config(dir.path()).server_generator(),
        )?;
        std::fs::write(dir.path().join("certs/server.crt"), &foreign.certificate)?;
        std::fs::write(
            dir.path().join("certs/server.key"),
            foreign.private_key.as_bytes(),
        )?;

        let second = manager(dir.path());
        second.initialize()?;
        assert_ne!(
            second.tls_config()?.fingerprint(),
            generator::fingerprint(&foreign.certificate)?
        );
        let server_pem = std::fs::read_to_string(dir.path().join("certs/server.crt"))?;
        generator::verify_chain(&server_pem, &second.ca_cert_pem()?)?;
        Ok(())
    }

    #[test]
    fn renewal() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let manager = manager(dir.path());
        manager.initialize()?;
        assert!(!manager.check_renewal()?);

        // With a threshold longer than the validity, every check renews.
        let mut config = config(dir.path());
        config.renewal_threshold_days = 400;
        let eager = CertificateManager::new(config, Zeroizing::new(IDENTITY.to_vec()));
        eager.initialize()?;
        let before = eager.tls_config()?;
        assert!(eager.check_renewal()?);
        let after = eager.tls_config()?;
        assert_ne!(before.fingerprint(), after.fingerprint());
        assert_eq!(eager.lifecycle(), Lifecycle::Ready);
        assert_eq!(
            generator::fingerprint(&std::fs::read_to_string(
                eager.paths().server_cert()
            )?)?,
            after.fingerprint()
        );
        // The configuration handed out before the renewal is still usable.
        assert!(before.acceptor().context().certificate().is_some());
        Ok(())
    }

    #[test]
    fn client_certificates() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let manager = manager(dir.path());
        manager.initialize()?;

        let issued = manager.generate_client_cert("alice", Some("1001"), Some("SHA256:abc"))?;
        assert_eq!(issued.ca_certificate, manager.ca_cert_pem()?);
        let parsed = manager.verify_client_cert(&issued.certificate)?;
        assert_eq!(parsed.fingerprint, issued.fingerprint);
        assert_eq!(parsed.user_id.as_deref(), Some("1001"));
        assert_eq!(parsed.ssh_fingerprint.as_deref(), Some("SHA256:abc"));
        assert!(!format!("{issued:?}").contains("PRIVATE KEY"));

        // Names aren't unique.
        let again = manager.generate_client_cert("alice", None, None)?;
        assert_ne!(again.fingerprint, issued.fingerprint);

        let directory = manager.save_client_cert("alice", &issued)?;
        assert_eq!(directory, dir.path().join("client_certs/alice"));
        assert_eq!(
            std::fs::read_to_string(directory.join("client.crt"))?,
            issued.certificate
        );
        assert_eq!(
            std::fs::read_to_string(directory.join("client.key"))?,
            issued.private_key.as_str()
        );
        assert_eq!(
            std::fs::read_to_string(directory.join("ca.crt"))?,
            issued.ca_certificate
        );
        Ok(())
    }

    #[traced_test]
    #[test]
    fn verify_client_cert_checks_revocation() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let manager = manager(dir.path());
        manager.initialize()?;
        let issued = manager.generate_client_cert("bob", None, None)?;
        let parsed = manager.verify_client_cert(&issued.certificate)?;

        manager.revocations()?.revoke(RevokedCertificate::from_certificate(
            &parsed,
            RevocationReason::KeyCompromise,
            "admin",
        ))?;
        let result = manager.verify_client_cert(&issued.certificate);
        assert!(
            matches!(result, Err(Error::Revoked { fingerprint }) if fingerprint == issued.fingerprint)
        );
        assert!(logs_contain("Rejected revoked client certificate"));
        Ok(())
    }

    #[test]
    fn verify_client_cert_rejects_foreign_and_malformed() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let manager = manager(dir.path());
        manager.initialize()?;

        let foreign_ca = generator::test_utils::ca("Foreign CA");
        let foreign = generator::generate_client_cert(
            &foreign_ca.certificate,
            &foreign_ca.private_key,
            &generator::test_utils::config("mallory"),
        )?;
        assert!(matches!(
            manager.verify_client_cert(&foreign.certificate),
            Err(Error::ChainVerification(_))
        ));
        assert!(matches!(
            manager.verify_client_cert("garbage"),
            Err(Error::CertificateParse(_))
        ));

        let ca = manager.ca_cert_pem()?;
        let expired = generator::test_utils::issue_with_window(
            &generator::GeneratedCertificate {
                certificate: ca,
                private_key: keystore::load_encrypted_key(
                    &manager.paths().encrypted_ca_key(),
                    IDENTITY,
                )?,
            },
            CertificateKind::Client,
            Utc::now().timestamp() - 7200,
            Utc::now().timestamp() - 3600,
        );
        assert!(matches!(
            manager.verify_client_cert(&expired.certificate),
            Err(Error::ChainVerification(_))
        ));
        Ok(())
    }

    #[test]
    fn close() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let manager = manager(dir.path());
        manager.initialize()?;
        let tls = manager.tls_config()?;
        manager.close();

        assert_eq!(manager.lifecycle(), Lifecycle::Closed);
        assert!(matches!(
            manager.tls_config(),
            Err(Error::NotReady(Lifecycle::Closed))
        ));
        assert!(matches!(
            manager.generate_client_cert("carol", None, None),
            Err(Error::NotReady(Lifecycle::Closed))
        ));
        assert!(matches!(
            manager.check_renewal(),
            Err(Error::NotReady(Lifecycle::Closed))
        ));
        assert!(matches!(
            manager.initialize(),
            Err(Error::NotReady(Lifecycle::Closed))
        ));
        // Closing never removes state from disk, and outstanding TLS configs keep working.
        assert!(manager.paths().encrypted_ca_key().exists());
        assert!(tls.acceptor().context().certificate().is_some());
        Ok(())
    }

    #[test]
    fn unusable_directory() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let file = dir.path().join("not-a-directory");
        std::fs::write(&file, "")?;
        let result = manager(&file).initialize();
        assert!(matches!(result, Err(Error::ConfigDirectory { .. })));
        Ok(())
    }
}
