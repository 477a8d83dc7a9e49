// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Stateless key and certificate operations.
//!
//! OpenSSL is used to generate keys, build and sign certificates, and verify chains. Reading
//! extensions back out of a certificate is done with `x509-parser`, since OpenSSL's bindings
//! don't expose basic constraints, SANs, or extended key usages.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
    time::Duration,
};

use chrono::{DateTime, Utc};
use openssl::{
    asn1::{Asn1Integer, Asn1Time},
    bn::BigNum,
    ec::{EcGroup, EcKey},
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    rsa::Rsa,
    stack::Stack,
    x509::{
        self, extension, store::X509StoreBuilder, X509Builder, X509Name, X509NameBuilder,
        X509StoreContext, X509,
    },
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{config::X509SubjectName, error::Error, Result};

/// Certificates are backdated by this much to tolerate modest clock skew between peers.
const CLOCK_SKEW_SECS: i64 = 5 * 60;

/// Organizational unit prefix binding a client certificate to a user account.
pub const USER_OU_PREFIX: &str = "user:";

/// Subject serial-number prefix binding a client certificate to an SSH key.
pub const SSH_FINGERPRINT_PREFIX: &str = "ssh-fp:";

/// The algorithm used for newly generated keys.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    /// ECDSA over NIST P-256.
    #[default]
    P256,
    Rsa2048,
    Rsa4096,
}

impl FromStr for KeyAlgorithm {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "p256" => Ok(Self::P256),
            "rsa2048" => Ok(Self::Rsa2048),
            "rsa4096" => Ok(Self::Rsa4096),
            other => Err(Error::InvalidConfig(format!(
                "unknown key algorithm '{other}'"
            ))),
        }
    }
}

/// Parameters for a generated certificate.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// The subject's common name.
    pub common_name: String,
    /// The remainder of the subject.
    pub subject: X509SubjectName,
    /// How long the certificate is valid for, starting now. Must not be zero.
    pub validity: Duration,
    pub key_algorithm: KeyAlgorithm,
    /// DNS subject alternative names; only used for server certificates.
    pub dns_names: Vec<String>,
    /// IP subject alternative names; only used for server certificates.
    pub ip_addresses: Vec<IpAddr>,
    /// The user a client certificate belongs to, embedded as a `user:<id>` organizational unit.
    pub user_id: Option<String>,
    /// An SSH key fingerprint a client certificate is bound to, embedded as a `ssh-fp:<fp>`
    /// subject serial number.
    pub ssh_fingerprint: Option<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            common_name: String::new(),
            subject: X509SubjectName::default(),
            validity: Duration::from_secs(365 * 24 * 60 * 60),
            key_algorithm: KeyAlgorithm::default(),
            dns_names: vec![],
            ip_addresses: vec![],
            user_id: None,
            ssh_fingerprint: None,
        }
    }
}

/// A freshly generated certificate and its private key, both PEM-encoded.
pub struct GeneratedCertificate {
    pub certificate: String,
    /// The PKCS#8 private key. It is zeroed when dropped.
    pub private_key: Zeroizing<String>,
}

impl std::fmt::Debug for GeneratedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedCertificate")
            .field("certificate", &self.certificate)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// An extended key usage purpose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPurpose {
    Any,
    ServerAuth,
    ClientAuth,
    CodeSigning,
    EmailProtection,
    TimeStamping,
    OcspSigning,
    /// Any other purpose, by dotted OID.
    Other(String),
}

/// The interesting parts of a certificate, read from its PEM encoding.
///
/// This is derived data; it's never persisted and is recomputed whenever needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCertificate {
    /// Lowercase hex SHA-256 of the DER encoding.
    pub fingerprint: String,
    pub subject: String,
    pub issuer: String,
    pub common_name: Option<String>,
    /// Lowercase hex serial number.
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_ca: bool,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub extended_key_usages: Vec<KeyPurpose>,
    /// The bound user ID from a `user:<id>` organizational unit, if any.
    pub user_id: Option<String>,
    /// The bound SSH key fingerprint from a `ssh-fp:<fp>` subject serial number, if any.
    pub ssh_fingerprint: Option<String>,
}

impl ParsedCertificate {
    fn from_x509(cert: &X509) -> Result<Self> {
        let der = cert.to_der()?;
        let fingerprint = fingerprint_der(&der);
        let common_name = name_entries(cert.subject_name(), Nid::COMMONNAME)?
            .into_iter()
            .next();
        let user_id = name_entries(cert.subject_name(), Nid::ORGANIZATIONALUNITNAME)?
            .into_iter()
            .find_map(|ou| ou.strip_prefix(USER_OU_PREFIX).map(str::to_string));
        let ssh_fingerprint = name_entries(cert.subject_name(), Nid::SERIALNUMBER)?
            .into_iter()
            .find_map(|sn| sn.strip_prefix(SSH_FINGERPRINT_PREFIX).map(str::to_string));

        let (_, parsed) = x509_parser::parse_x509_certificate(&der)
            .map_err(|error| Error::CertificateParse(error.to_string()))?;
        let is_ca = parsed
            .basic_constraints()
            .map_err(|error| Error::CertificateParse(error.to_string()))?
            .is_some_and(|constraints| constraints.value.ca);

        let mut dns_names = vec![];
        let mut ip_addresses = vec![];
        if let Some(san) = parsed
            .subject_alternative_name()
            .map_err(|error| Error::CertificateParse(error.to_string()))?
        {
            for name in &san.value.general_names {
                match name {
                    x509_parser::extensions::GeneralName::DNSName(dns) => {
                        dns_names.push(dns.to_string())
                    }
                    x509_parser::extensions::GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_bytes(bytes) {
                            ip_addresses.push(ip);
                        }
                    }
                    _ => {}
                }
            }
        }

        let mut extended_key_usages = vec![];
        if let Some(eku) = parsed
            .extended_key_usage()
            .map_err(|error| Error::CertificateParse(error.to_string()))?
        {
            let eku = eku.value;
            for (present, purpose) in [
                (eku.any, KeyPurpose::Any),
                (eku.server_auth, KeyPurpose::ServerAuth),
                (eku.client_auth, KeyPurpose::ClientAuth),
                (eku.code_signing, KeyPurpose::CodeSigning),
                (eku.email_protection, KeyPurpose::EmailProtection),
                (eku.time_stamping, KeyPurpose::TimeStamping),
                (eku.ocsp_signing, KeyPurpose::OcspSigning),
            ] {
                if present {
                    extended_key_usages.push(purpose);
                }
            }
            extended_key_usages.extend(
                eku.other
                    .iter()
                    .map(|oid| KeyPurpose::Other(oid.to_id_string())),
            );
        }

        Ok(Self {
            fingerprint,
            subject: parsed.subject().to_string(),
            issuer: parsed.issuer().to_string(),
            common_name,
            serial: hex::encode(parsed.raw_serial()),
            not_before: timestamp(parsed.validity().not_before.timestamp())?,
            not_after: timestamp(parsed.validity().not_after.timestamp())?,
            is_ca,
            dns_names,
            ip_addresses,
            extended_key_usages,
            user_id,
            ssh_fingerprint,
        })
    }

    /// Whether `now` falls within the certificate's validity window.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// Whether the certificate expires within `threshold` of `now`.
    ///
    /// A threshold reaching past the representable time range always asks for renewal.
    pub fn needs_renewal_at(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        now.checked_add_signed(threshold)
            .is_none_or(|deadline| deadline >= self.not_after)
    }
}

fn name_entries(name: &x509::X509NameRef, nid: Nid) -> Result<Vec<String>> {
    name.entries_by_nid(nid)
        .map(|entry| {
            entry
                .data()
                .as_utf8()
                .map(|value| value.to_string())
                .map_err(Error::from)
        })
        .collect()
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes)
            .ok()
            .map(|octets| IpAddr::V4(Ipv4Addr::from(octets))),
        16 => <[u8; 16]>::try_from(bytes)
            .ok()
            .map(|octets| IpAddr::V6(Ipv6Addr::from(octets))),
        _ => None,
    }
}

fn timestamp(seconds: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(seconds, 0).ok_or_else(|| {
        Error::CertificateParse(format!("timestamp {seconds} is out of range"))
    })
}

/// Compute the lowercase hex SHA-256 fingerprint of DER-encoded bytes.
pub fn fingerprint_der(der: &[u8]) -> String {
    hex::encode(openssl::sha::sha256(der))
}

/// Compute the fingerprint of a PEM-encoded certificate.
///
/// The fingerprint is the SHA-256 of the certificate's DER encoding, so it is stable for a given
/// certificate and is the identity key used by the revocation list and the trust store.
pub fn fingerprint(cert_pem: &str) -> Result<String> {
    let cert = load_certificate(cert_pem)?;
    Ok(fingerprint_der(&cert.to_der()?))
}

/// Bring a fingerprint typed by a human or produced by another tool into canonical form.
///
/// An optional `sha256:` prefix, colons, and whitespace are removed and hex digits are
/// lowercased, so "SHA256:AB:CD" and "abcd" compare equal.
pub fn normalize_fingerprint(fingerprint: &str) -> String {
    let trimmed = fingerprint.trim();
    let without_prefix = match trimmed.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("sha256:") => &trimmed[7..],
        _ => trimmed,
    };
    without_prefix
        .chars()
        .filter(|c| *c != ':' && !c.is_whitespace())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Parse a PEM-encoded certificate.
///
/// # Errors
///
/// [`Error::CertificateParse`] is returned for malformed PEM or a PEM block that isn't a
/// certificate.
pub fn parse_certificate(cert_pem: &str) -> Result<ParsedCertificate> {
    let cert = load_certificate(cert_pem)?;
    ParsedCertificate::from_x509(&cert)
}

pub(crate) fn load_certificate(cert_pem: &str) -> Result<X509> {
    X509::from_pem(cert_pem.as_bytes()).map_err(|error| Error::CertificateParse(error.to_string()))
}

pub(crate) fn load_private_key(key_pem: &str) -> Result<PKey<Private>> {
    PKey::private_key_from_pem(key_pem.as_bytes())
        .map_err(|error| Error::CertificateParse(format!("invalid private key: {error}")))
}

/// Verify that `cert_pem` is signed by the CA in `ca_cert_pem` and is currently valid.
pub fn verify_chain(cert_pem: &str, ca_cert_pem: &str) -> Result<()> {
    let cert = load_certificate(cert_pem)?;
    let ca_cert = load_certificate(ca_cert_pem)?;
    verify_x509_chain(&cert, &ca_cert)
}

pub(crate) fn verify_x509_chain(cert: &X509, ca_cert: &X509) -> Result<()> {
    let mut store = X509StoreBuilder::new()?;
    store.add_cert(ca_cert.clone())?;
    let store = store.build();
    let chain = Stack::new()?;
    let mut context = X509StoreContext::new()?;
    let result = context.init(&store, cert, &chain, |context| {
        if context.verify_cert()? {
            Ok(Ok(()))
        } else {
            Ok(Err(context.error()))
        }
    })?;
    result.map_err(|error| Error::ChainVerification(error.error_string().to_string()))
}

/// Report whether the certificate expires within `threshold` from now.
///
/// This is the only renewal policy; there is no grace period beyond the threshold.
pub fn needs_renewal(cert_pem: &str, threshold: chrono::Duration) -> Result<bool> {
    Ok(parse_certificate(cert_pem)?.needs_renewal_at(Utc::now(), threshold))
}

/// Create a new self-signed CA certificate and private key.
///
/// # Errors
///
/// [`Error::InvalidConfig`] is returned if the validity is zero; key generation failures are
/// returned as [`Error::Ssl`].
pub fn generate_ca(config: &GeneratorConfig) -> Result<GeneratedCertificate> {
    let (not_before, not_after) = validity_window(config.validity)?;
    let key = generate_key(config.key_algorithm)?;
    issue(CertificateKind::Authority, &key, None, config, not_before, not_after)
}

/// Issue a server certificate signed by the given CA.
///
/// The certificate carries the configured DNS and IP subject alternative names and is usable
/// for both server and client authentication, since nodes dial each other too.
pub fn generate_server_cert(
    ca_cert_pem: &str,
    ca_key_pem: &str,
    config: &GeneratorConfig,
) -> Result<GeneratedCertificate> {
    let issuer = Issuer::from_pem(ca_cert_pem, ca_key_pem)?;
    issuer.issue(CertificateKind::Server, config)
}

/// Issue a client certificate signed by the given CA.
pub fn generate_client_cert(
    ca_cert_pem: &str,
    ca_key_pem: &str,
    config: &GeneratorConfig,
) -> Result<GeneratedCertificate> {
    let issuer = Issuer::from_pem(ca_cert_pem, ca_key_pem)?;
    issuer.issue(CertificateKind::Client, config)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CertificateKind {
    Authority,
    Server,
    Client,
}

/// A CA certificate paired with its private key.
pub(crate) struct Issuer {
    pub(crate) cert: X509,
    pub(crate) key: PKey<Private>,
}

impl Issuer {
    /// Pair a CA certificate with its key, failing if the key doesn't belong to the certificate.
    pub(crate) fn new(cert: X509, key: PKey<Private>) -> Result<Self> {
        if !cert.public_key()?.public_eq(&key) {
            return Err(Error::KeyDecryption(
                "the CA private key does not match the CA certificate".to_string(),
            ));
        }
        Ok(Self { cert, key })
    }

    pub(crate) fn from_pem(ca_cert_pem: &str, ca_key_pem: &str) -> Result<Self> {
        Self::new(load_certificate(ca_cert_pem)?, load_private_key(ca_key_pem)?)
    }

    pub(crate) fn issue(
        &self,
        kind: CertificateKind,
        config: &GeneratorConfig,
    ) -> Result<GeneratedCertificate> {
        let (not_before, not_after) = validity_window(config.validity)?;
        let key = generate_key(config.key_algorithm)?;
        issue(kind, &key, Some(self), config, not_before, not_after)
    }
}

fn validity_window(validity: Duration) -> Result<(i64, i64)> {
    if validity.is_zero() {
        return Err(Error::InvalidConfig(
            "certificate validity must be greater than zero".to_string(),
        ));
    }
    let validity = i64::try_from(validity.as_secs())
        .map_err(|_| Error::InvalidConfig("certificate validity is too long".to_string()))?;
    let now = Utc::now().timestamp();
    let not_after = now
        .checked_add(validity)
        .ok_or_else(|| Error::InvalidConfig("certificate validity is too long".to_string()))?;
    Ok((now - CLOCK_SKEW_SECS, not_after))
}

fn generate_key(algorithm: KeyAlgorithm) -> Result<PKey<Private>> {
    let key = match algorithm {
        KeyAlgorithm::P256 => PKey::from_ec_key(EcKey::generate(
            EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?.as_ref(),
        )?)?,
        KeyAlgorithm::Rsa2048 => PKey::from_rsa(Rsa::generate(2048)?)?,
        KeyAlgorithm::Rsa4096 => PKey::from_rsa(Rsa::generate(4096)?)?,
    };
    Ok(key)
}

fn asn1_time(unix: i64) -> Result<Asn1Time> {
    let time = unix
        .try_into()
        .map_err(|_| Error::InvalidConfig(format!("timestamp {unix} is out of range")))?;
    Ok(Asn1Time::from_unix(time)?)
}

fn subject_name(kind: CertificateKind, config: &GeneratorConfig) -> Result<X509Name> {
    let subject = &config.subject;
    let mut name = X509NameBuilder::new()?;
    for (nid, value) in [
        (Nid::COUNTRYNAME, &subject.country),
        (Nid::STATEORPROVINCENAME, &subject.state_or_province),
        (Nid::LOCALITYNAME, &subject.locality),
        (Nid::ORGANIZATIONNAME, &subject.organization),
    ] {
        if !value.is_empty() {
            name.append_entry_by_nid(nid, value)?;
        }
    }

    let user_ou = match (kind, &config.user_id) {
        (CertificateKind::Client, Some(user_id)) => Some(format!("{USER_OU_PREFIX}{user_id}")),
        _ => None,
    };
    if let Some(ou) = user_ou {
        name.append_entry_by_nid(Nid::ORGANIZATIONALUNITNAME, &ou)?;
    } else if !subject.organizational_unit.is_empty() {
        name.append_entry_by_nid(Nid::ORGANIZATIONALUNITNAME, &subject.organizational_unit)?;
    }
    if let (CertificateKind::Client, Some(ssh_fingerprint)) = (kind, &config.ssh_fingerprint) {
        name.append_entry_by_nid(
            Nid::SERIALNUMBER,
            &format!("{SSH_FINGERPRINT_PREFIX}{ssh_fingerprint}"),
        )?;
    }

    if config.common_name.is_empty() {
        return Err(Error::InvalidConfig(
            "certificates require a common name".to_string(),
        ));
    }
    name.append_entry_by_nid(Nid::COMMONNAME, &config.common_name)?;
    Ok(name.build())
}

// Build and sign a certificate for `key`. Without an issuer, the certificate is self-signed.
fn issue(
    kind: CertificateKind,
    key: &PKey<Private>,
    issuer: Option<&Issuer>,
    config: &GeneratorConfig,
    not_before: i64,
    not_after: i64,
) -> Result<GeneratedCertificate> {
    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;

    let mut serial_number = [0; 20];
    openssl::rand::rand_bytes(&mut serial_number)?;
    let mut serial_number = BigNum::from_slice(&serial_number)?;
    serial_number.set_negative(false);
    builder.set_serial_number(Asn1Integer::from_bn(&serial_number)?.as_ref())?;

    let subject = subject_name(kind, config)?;
    builder.set_subject_name(&subject)?;
    let issuer_name = issuer.map_or(subject.as_ref(), |issuer| issuer.cert.subject_name());
    builder.set_issuer_name(issuer_name)?;
    builder.set_pubkey(key)?;
    builder.set_not_before(asn1_time(not_before)?.as_ref())?;
    builder.set_not_after(asn1_time(not_after)?.as_ref())?;

    let mut basic_constraints = extension::BasicConstraints::new();
    basic_constraints.critical();
    if kind == CertificateKind::Authority {
        basic_constraints.ca();
    }
    builder.append_extension(basic_constraints.build()?)?;

    match kind {
        CertificateKind::Authority => {
            builder.append_extension(
                extension::KeyUsage::new()
                    .critical()
                    .digital_signature()
                    .key_cert_sign()
                    .crl_sign()
                    .build()?,
            )?;
        }
        CertificateKind::Server => {
            builder.append_extension(
                extension::KeyUsage::new()
                    .critical()
                    .digital_signature()
                    .key_encipherment()
                    .build()?,
            )?;
            builder.append_extension(
                extension::ExtendedKeyUsage::new()
                    .server_auth()
                    .client_auth()
                    .build()?,
            )?;
        }
        CertificateKind::Client => {
            builder.append_extension(
                extension::KeyUsage::new()
                    .critical()
                    .digital_signature()
                    .key_encipherment()
                    .build()?,
            )?;
            builder.append_extension(extension::ExtendedKeyUsage::new().client_auth().build()?)?;
        }
    }

    let extensions = {
        let context = builder.x509v3_context(issuer.map(|issuer| issuer.cert.as_ref()), None);
        let mut extensions = vec![extension::SubjectKeyIdentifier::new().build(&context)?];
        if issuer.is_some() {
            extensions.push(
                extension::AuthorityKeyIdentifier::new()
                    .keyid(false)
                    .build(&context)?,
            );
        }
        if kind == CertificateKind::Server
            && !(config.dns_names.is_empty() && config.ip_addresses.is_empty())
        {
            let mut san = extension::SubjectAlternativeName::new();
            for dns in &config.dns_names {
                san.dns(dns);
            }
            for ip in &config.ip_addresses {
                san.ip(&ip.to_string());
            }
            extensions.push(san.build(&context)?);
        }
        extensions
    };
    for extension in extensions {
        builder.append_extension(extension)?;
    }

    let signing_key = issuer.map_or(key, |issuer| &issuer.key);
    builder.sign(signing_key, MessageDigest::sha256())?;
    let cert = builder.build();

    let certificate = String::from_utf8(cert.to_pem()?)
        .map_err(|error| Error::CertificateParse(error.to_string()))?;
    let private_key = Zeroizing::new(
        String::from_utf8(key.private_key_to_pem_pkcs8()?)
            .map_err(|error| Error::CertificateParse(error.to_string()))?,
    );
    Ok(GeneratedCertificate {
        certificate,
        private_key,
    })
}
