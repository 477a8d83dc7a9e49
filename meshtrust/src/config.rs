// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    num::NonZeroU32,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{
    generator::{GeneratorConfig, KeyAlgorithm},
    persist,
};

const SECONDS_PER_DAY: u64 = 60 * 60 * 24;

/// Configuration for the node's trust core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The location where the node stores its certificates, secrets, and trust records.
    ///
    /// To back up the node's identity, back up this directory along with the identity key.
    ///
    /// Defaults to "/var/lib/meshtrust" if not set.
    pub config_directory: PathBuf,

    /// The node's P2P identity private key.
    ///
    /// The CA private key is encrypted at rest with a key derived from this file, so moving the
    /// configuration directory to a node with a different identity key renders the CA unusable.
    /// Relative paths are relative to `config_directory`.
    pub identity_key: PathBuf,

    /// The common name to use in the server certificate.
    pub node_name: String,

    /// DNS names to include in the server certificate's subject alternative names.
    pub server_dns_names: Vec<String>,

    /// IP addresses to include in the server certificate's subject alternative names.
    pub server_ip_addresses: Vec<IpAddr>,

    /// How long the CA certificate is valid for; the default is ten years.
    pub ca_validity_days: NonZeroU32,

    /// How long server certificates are valid for; the default is one year.
    pub server_validity_days: NonZeroU32,

    /// How long client certificates are valid for; the default is one year.
    pub client_validity_days: NonZeroU32,

    /// The server certificate is regenerated once it expires within this many days.
    pub renewal_threshold_days: u32,

    /// The key algorithm to use for new keys.
    pub key_algorithm: KeyAlgorithm,

    /// Certificates created here let the caller specify the subject's common name.
    ///
    /// The rest of the certificate's subject is specified here.
    pub certificate_subject: X509SubjectName,

    /// Trust-On-First-Use settings for outbound connections.
    pub tofu: TofuConfig,

    /// Revocation entries for certificates that expired more than this many days ago are
    /// eligible for pruning.
    pub revocation_prune_after_days: u32,
}

/// The values to use when creating x509 certificates in subject names.
///
/// The caller provides the common name to use, all other values are defined here. Empty values
/// are left out of the subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct X509SubjectName {
    pub country: String,
    pub state_or_province: String,
    pub locality: String,
    pub organization: String,
    pub organizational_unit: String,
}

impl Default for X509SubjectName {
    fn default() -> Self {
        Self {
            country: String::new(),
            state_or_province: String::new(),
            locality: String::new(),
            organization: "Meshtrust".to_string(),
            organizational_unit: String::new(),
        }
    }
}

/// Trust-On-First-Use behavior.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TofuConfig {
    /// Trust unknown peers without asking.
    ///
    /// When disabled, the operator is prompted to accept or reject each new peer certificate.
    pub auto_trust: bool,

    /// How long to wait for the operator to answer the trust prompt.
    ///
    /// If unset, the prompt waits indefinitely. An unanswered prompt is treated as a rejection.
    pub prompt_timeout_secs: Option<u64>,
}

impl TofuConfig {
    pub fn prompt_timeout(&self) -> Option<Duration> {
        self.prompt_timeout_secs.map(Duration::from_secs)
    }
}

impl Config {
    /// The file layout rooted at the configuration directory.
    pub fn paths(&self) -> Paths {
        Paths::new(&self.config_directory)
    }

    /// The absolute path of the identity key.
    pub fn identity_key_path(&self) -> PathBuf {
        if self.identity_key.is_absolute() {
            self.identity_key.clone()
        } else {
            self.config_directory.join(&self.identity_key)
        }
    }

    /// Read the node's identity key, which seeds the CA key encryption.
    pub fn read_identity_secret(&self) -> anyhow::Result<Zeroizing<Vec<u8>>> {
        let path = self.identity_key_path();
        let secret = Zeroizing::new(
            std::fs::read(&path)
                .with_context(|| format!("failed to read identity key from {path:?}"))?,
        );
        if secret.is_empty() {
            return Err(anyhow::anyhow!("The identity key at {path:?} is empty"));
        }
        Ok(secret)
    }

    pub fn renewal_threshold(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.renewal_threshold_days))
    }

    pub fn revocation_prune_after(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.revocation_prune_after_days))
    }

    /// Generator settings for the self-signed CA.
    pub fn ca_generator(&self) -> GeneratorConfig {
        self.generator(format!("{} CA", self.node_name), self.ca_validity_days)
    }

    /// Generator settings for the node's server certificate.
    pub fn server_generator(&self) -> GeneratorConfig {
        let mut config = self.generator(self.node_name.clone(), self.server_validity_days);
        config.dns_names = self.server_dns_names.clone();
        config.ip_addresses = self.server_ip_addresses.clone();
        config
    }

    /// Generator settings for a client certificate.
    pub fn client_generator(
        &self,
        common_name: &str,
        user_id: Option<&str>,
        ssh_fingerprint: Option<&str>,
    ) -> GeneratorConfig {
        let mut config = self.generator(common_name.to_string(), self.client_validity_days);
        config.user_id = user_id.map(str::to_string);
        config.ssh_fingerprint = ssh_fingerprint.map(str::to_string);
        config
    }

    fn generator(&self, common_name: String, validity_days: NonZeroU32) -> GeneratorConfig {
        GeneratorConfig {
            common_name,
            subject: self.certificate_subject.clone(),
            validity: Duration::from_secs(u64::from(validity_days.get()) * SECONDS_PER_DAY),
            key_algorithm: self.key_algorithm,
            ..Default::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_directory: default_config_directory(),
            identity_key: PathBuf::from("identity.key"),
            node_name: "meshtrust-node".to_string(),
            server_dns_names: vec!["localhost".to_string()],
            server_ip_addresses: vec![
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(Ipv6Addr::LOCALHOST),
            ],
            ca_validity_days: NonZeroU32::new(3650).unwrap_or(NonZeroU32::MIN),
            server_validity_days: NonZeroU32::new(365).unwrap_or(NonZeroU32::MIN),
            client_validity_days: NonZeroU32::new(365).unwrap_or(NonZeroU32::MIN),
            renewal_threshold_days: 30,
            key_algorithm: KeyAlgorithm::default(),
            certificate_subject: X509SubjectName::default(),
            tofu: TofuConfig::default(),
            revocation_prune_after_days: 30,
        }
    }
}

impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            toml::ser::to_string_pretty(&self).unwrap_or_default()
        )
    }
}

fn default_config_directory() -> PathBuf {
    PathBuf::from("/var/lib/meshtrust/")
}

/// Locations of every file the trust core reads or writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.root.join("certs")
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.root.join("secrets")
    }

    pub fn trusted_nodes_dir(&self) -> PathBuf {
        self.root.join("trusted_nodes")
    }

    pub fn client_certs_dir(&self) -> PathBuf {
        self.root.join("client_certs")
    }

    pub fn ca_cert(&self) -> PathBuf {
        self.certs_dir().join("ca.crt")
    }

    /// Where older installations kept the CA key unencrypted.
    pub fn legacy_ca_key(&self) -> PathBuf {
        self.certs_dir().join("ca.key")
    }

    pub fn encrypted_ca_key(&self) -> PathBuf {
        self.secrets_dir().join("ca.key.enc")
    }

    pub fn server_cert(&self) -> PathBuf {
        self.certs_dir().join("server.crt")
    }

    pub fn server_key(&self) -> PathBuf {
        self.certs_dir().join("server.key")
    }

    pub fn revocation_list(&self) -> PathBuf {
        self.certs_dir().join("revocation.json")
    }

    /// The directory holding a named client certificate bundle.
    pub fn client_cert_dir(&self, name: &str) -> PathBuf {
        self.client_certs_dir()
            .join(persist::sanitize_file_name(name))
    }
}

#[cfg(feature = "cli")]
fn read_config_file<T>(path: &Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration from {path:?}"))?;
    toml::from_str(&contents)
        .inspect_err(|error| {
            eprintln!("Invalid configuration in {path:?}:\n{error}");
            eprintln!("A valid configuration looks like:\n\n{}", T::default());
        })
        .context("configuration file is invalid")
}

/// Find and load the node's configuration.
///
/// An explicit `path` must exist. Otherwise `default` is looked up under the service's
/// configuration directory (`$CONFIGURATION_DIRECTORY`, as provided by systemd), and if there's
/// no file there the built-in defaults are used.
///
/// # Errors
///
/// An error is returned if the chosen file can't be read or isn't valid TOML for `T`.
#[cfg(feature = "cli")]
pub fn load_config<T>(path: Option<PathBuf>, default: &Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    let path = path.or_else(|| {
        let directory = std::env::var_os("CONFIGURATION_DIRECTORY")?;
        let candidate = PathBuf::from(directory).join(default);
        if candidate.is_file() {
            Some(candidate)
        } else {
            tracing::debug!(
                path = %candidate.display(),
                "No configuration file at the default path"
            );
            None
        }
    });
    match path {
        Some(path) => {
            let config = read_config_file(&path)?;
            tracing::info!(path = %path.display(), "Loaded configuration");
            Ok(config)
        }
        None => {
            tracing::warn!("No configuration file found; using defaults");
            Ok(T::default())
        }
    }
}
