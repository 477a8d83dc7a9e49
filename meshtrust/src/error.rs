// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Error types for the certificate manager, revocation list, and trust store.

use std::path::PathBuf;

use crate::manager::Lifecycle;

/// A convenience alias for results returned by this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors the trust core may return.
///
/// The variants fall into three groups. Startup errors ([`Error::ConfigDirectory`],
/// [`Error::KeyNotFound`], [`Error::KeyDecryption`]) are fatal: a node must not start without
/// working trust material. Per-connection errors ([`Error::CertificateParse`],
/// [`Error::ChainVerification`], [`Error::Revoked`], [`Error::FingerprintMismatch`]) reject a
/// single operation and leave everything else untouched. The remainder are operator-facing and
/// recoverable by issuing a different command.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A required directory could not be created or accessed.
    #[error("unable to prepare directory {path:?}: {source}")]
    ConfigDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The encrypted key envelope does not exist.
    ///
    /// This is distinct from [`Error::KeyDecryption`]: an absent key may mean the node needs to be
    /// bootstrapped, whereas a key that fails to decrypt must never be silently replaced.
    #[error("no encrypted key found at {0:?}")]
    KeyNotFound(PathBuf),

    /// The key envelope exists but could not be decrypted.
    ///
    /// Either the node's identity key differs from the one the envelope was sealed with, or the
    /// envelope is corrupted.
    #[error("the CA key could not be decrypted: {0}")]
    KeyDecryption(String),

    /// The input was not a well-formed PEM-encoded X.509 certificate.
    #[error("failed to parse certificate: {0}")]
    CertificateParse(String),

    /// The certificate was not issued by the expected CA or is outside its validity window.
    #[error("certificate chain verification failed: {0}")]
    ChainVerification(String),

    /// The certificate chains to the CA, but its fingerprint has been revoked.
    #[error("certificate {fingerprint} has been revoked")]
    Revoked { fingerprint: String },

    /// The peer presented a certificate that differs from the one previously trusted for it.
    ///
    /// This may indicate a man-in-the-middle attack. It is never resolved automatically; the
    /// stored trust record must be removed by an operator before the node can be trusted again.
    #[error(
        "POSSIBLE MAN-IN-THE-MIDDLE ATTACK: node {node_id} presented certificate {presented} \
        but {expected} is trusted{}",
        pinned_note(.pinned)
    )]
    FingerprintMismatch {
        node_id: String,
        expected: String,
        presented: String,
        /// Whether the operator had pinned the trusted certificate.
        pinned: bool,
    },

    #[error("node {0} is not in the trust store")]
    NodeNotFound(String),

    #[error("node {0} is already trusted")]
    AlreadyTrusted(String),

    #[error("certificate {0} is already revoked")]
    AlreadyRevoked(String),

    #[error("certificate {0} is not in the revocation list")]
    NotRevoked(String),

    /// The configuration or a generator parameter is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The certificate manager was used outside of its ready state.
    #[error("the certificate manager is not ready (currently {0:?})")]
    NotReady(Lifecycle),

    #[error("an I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    /// An OpenSSL error occurred.
    ///
    /// This is possibly a bug in this crate or the OpenSSL bindings, or because the
    /// system-provided OpenSSL library does not support an operation this crate needs.
    #[error("one or more openssl errors occurred: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),

    #[error("failed to serialize or deserialize JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn pinned_note(pinned: &bool) -> &'static str {
    if *pinned {
        "; the trusted certificate was pinned by an operator"
    } else {
        ""
    }
}

impl Error {
    /// Returns true if this error signals a TOFU fingerprint mismatch.
    pub fn is_fingerprint_mismatch(&self) -> bool {
        matches!(self, Error::FingerprintMismatch { .. })
    }

    /// Returns true for lookups of things that do not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::KeyNotFound(_) | Error::NodeNotFound(_) | Error::NotRevoked(_)
        )
    }
}
