// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Persistent Trust-On-First-Use records, one per peer node.
//!
//! Each record binds a node ID to the fingerprint of the certificate it presented when it was
//! first trusted. That binding is never silently replaced: a peer presenting a different
//! certificate is reported as a possible man-in-the-middle attack until an operator removes the
//! record.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::{error::Error, generator::normalize_fingerprint, persist, Result};

/// How trust in a node was established.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustMethod {
    /// Accepted on first contact.
    #[default]
    Tofu,
    /// Added by an operator.
    Manual,
    /// Pinned by an operator after trust was established.
    Pinned,
}

impl std::fmt::Display for TrustMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrustMethod::Tofu => f.write_str("tofu"),
            TrustMethod::Manual => f.write_str("manual"),
            TrustMethod::Pinned => f.write_str("pinned"),
        }
    }
}

/// A trusted peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedNode {
    pub node_id: String,
    /// The fingerprint of the certificate this node is expected to present.
    pub fingerprint: String,
    /// The PEM-encoded certificate, if it was available when trust was established.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub alias: String,
    /// The last address the node was reached at.
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub trust_method: TrustMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_at: Option<DateTime<Utc>>,
    /// Set once an operator has confirmed the fingerprint out of band.
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub notes: String,
}

impl TrustedNode {
    pub fn new(node_id: &str, fingerprint: &str, trust_method: TrustMethod) -> Self {
        let now = Utc::now();
        Self {
            node_id: node_id.to_string(),
            fingerprint: normalize_fingerprint(fingerprint),
            certificate: None,
            first_seen: now,
            last_seen: now,
            alias: String::new(),
            address: String::new(),
            pinned_at: (trust_method == TrustMethod::Pinned).then_some(now),
            trust_method,
            verified: false,
            notes: String::new(),
        }
    }

    pub fn with_certificate(mut self, certificate_pem: &str) -> Self {
        self.certificate = Some(certificate_pem.to_string());
        self
    }

    pub fn with_address(mut self, address: &str) -> Self {
        self.address = address.to_string();
        self
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = alias.to_string();
        self
    }

    pub fn is_pinned(&self) -> bool {
        self.trust_method == TrustMethod::Pinned
    }

    fn matches(&self, fingerprint: &str) -> bool {
        self.fingerprint
            .as_bytes()
            .ct_eq(fingerprint.as_bytes())
            .into()
    }

    fn mismatch(&self, presented: &str) -> Error {
        Error::FingerprintMismatch {
            node_id: self.node_id.clone(),
            expected: self.fingerprint.clone(),
            presented: presented.to_string(),
            pinned: self.is_pinned(),
        }
    }
}

/// The collection of trusted nodes, stored as one JSON file per node.
#[derive(Debug)]
pub struct TrustStore {
    directory: PathBuf,
    nodes: RwLock<HashMap<String, TrustedNode>>,
}

impl TrustStore {
    /// Load every trust record in `directory`.
    ///
    /// Records that can't be read are logged and skipped rather than failing the whole store;
    /// a node whose record was skipped is treated as unknown.
    pub fn open(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        let mut nodes = HashMap::new();
        let entries = match std::fs::read_dir(&directory) {
            Ok(entries) => Some(entries),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
            Err(error) => {
                return Err(Error::ConfigDirectory {
                    path: directory,
                    source: error,
                })
            }
        };
        for entry in entries.into_iter().flatten() {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match persist::read_json_if_exists::<TrustedNode>(&path) {
                Ok(Some(mut node)) => {
                    node.fingerprint = normalize_fingerprint(&node.fingerprint);
                    nodes.insert(node.node_id.clone(), node);
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(
                        path = %path.display(),
                        %error,
                        "Skipping unreadable trust record"
                    );
                }
            }
        }
        tracing::debug!(
            directory = %directory.display(),
            nodes = nodes.len(),
            "Loaded trust store"
        );
        Ok(Self {
            directory,
            nodes: RwLock::new(nodes),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn record_path(&self, node_id: &str) -> PathBuf {
        self.directory
            .join(format!("{}.json", persist::sanitize_file_name(node_id)))
    }

    fn write(&self, node: &TrustedNode) -> Result<()> {
        persist::write_json_atomic(
            &self.record_path(&node.node_id),
            node,
            persist::PUBLIC_FILE_MODE,
        )
    }

    /// Insert or update the record for a node.
    ///
    /// An existing record keeps its `first_seen` timestamp, and a pinned or verified record stays
    /// that way. Replacing the fingerprint bound to an existing node is refused with
    /// [`Error::FingerprintMismatch`]; the record has to be removed first.
    pub fn add(&self, mut node: TrustedNode) -> Result<()> {
        normalize(&mut node)?;
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = nodes.get(&node.node_id) {
            if !existing.matches(&node.fingerprint) {
                return Err(existing.mismatch(&node.fingerprint));
            }
            node.first_seen = existing.first_seen;
            if existing.is_pinned() {
                node.trust_method = TrustMethod::Pinned;
                node.pinned_at = existing.pinned_at;
            }
            node.verified |= existing.verified;
        }
        self.write(&node)?;
        tracing::info!(
            node_id = %node.node_id,
            fingerprint = %node.fingerprint,
            trust_method = %node.trust_method,
            "Trusted node"
        );
        nodes.insert(node.node_id.clone(), node);
        Ok(())
    }

    /// Insert a record for a node that has none.
    ///
    /// Returns `false` without touching the existing record if the node is already trusted with
    /// the same fingerprint. The check and the insert happen under one lock, so of several
    /// concurrent first contacts exactly one reports the insert.
    pub fn add_if_absent(&self, mut node: TrustedNode) -> Result<bool> {
        normalize(&mut node)?;
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = nodes.get(&node.node_id) {
            return if existing.matches(&node.fingerprint) {
                Ok(false)
            } else {
                Err(existing.mismatch(&node.fingerprint))
            };
        }
        self.write(&node)?;
        tracing::info!(
            node_id = %node.node_id,
            fingerprint = %node.fingerprint,
            trust_method = %node.trust_method,
            "Trusted node"
        );
        nodes.insert(node.node_id.clone(), node);
        Ok(true)
    }

    /// Add a node an operator vouches for, failing with [`Error::AlreadyTrusted`] if the node
    /// already has a record.
    pub fn add_manual(&self, mut node: TrustedNode) -> Result<()> {
        let node_id = node.node_id.clone();
        node.trust_method = TrustMethod::Manual;
        match self.add_if_absent(node) {
            Ok(true) => Ok(()),
            Ok(false) | Err(Error::FingerprintMismatch { .. }) => {
                Err(Error::AlreadyTrusted(node_id))
            }
            Err(error) => Err(error),
        }
    }

    pub fn get(&self, node_id: &str) -> Option<TrustedNode> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_id)
            .cloned()
    }

    pub fn get_by_fingerprint(&self, fingerprint: &str) -> Option<TrustedNode> {
        let fingerprint = normalize_fingerprint(fingerprint);
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|node| node.matches(&fingerprint))
            .cloned()
    }

    /// Decide whether `fingerprint` is the one trusted for `node_id`.
    ///
    /// Returns `Ok(false)` for an unknown node, `Ok(true)` for a match, and
    /// [`Error::FingerprintMismatch`] when the node is known but presented something else. The
    /// mismatch is not a "no": the caller must refuse the connection.
    pub fn is_trusted(&self, node_id: &str, fingerprint: &str) -> Result<bool> {
        let fingerprint = normalize_fingerprint(fingerprint);
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        match nodes.get(node_id) {
            None => Ok(false),
            Some(node) if node.matches(&fingerprint) => Ok(true),
            Some(node) => Err(node.mismatch(&fingerprint)),
        }
    }

    fn modify(&self, node_id: &str, change: impl FnOnce(&mut TrustedNode)) -> Result<TrustedNode> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        let mut node = nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
        change(&mut node);
        self.write(&node)?;
        nodes.insert(node.node_id.clone(), node.clone());
        Ok(node)
    }

    /// Record that a node was just seen, optionally at a new address.
    pub fn touch(&self, node_id: &str, address: Option<&str>) -> Result<TrustedNode> {
        self.modify(node_id, |node| {
            node.last_seen = Utc::now();
            if let Some(address) = address.filter(|address| !address.is_empty()) {
                node.address = address.to_string();
            }
        })
    }

    /// Pin a node's certificate.
    ///
    /// The bound fingerprint doesn't change; a later mismatch is reported the same way, with a
    /// stronger warning.
    pub fn pin(&self, node_id: &str) -> Result<TrustedNode> {
        let node = self.modify(node_id, |node| {
            node.trust_method = TrustMethod::Pinned;
            node.pinned_at = Some(Utc::now());
        })?;
        tracing::info!(node_id, fingerprint = %node.fingerprint, "Pinned node certificate");
        Ok(node)
    }

    /// Mark a node's fingerprint as confirmed out of band.
    pub fn verify(&self, node_id: &str) -> Result<TrustedNode> {
        let node = self.modify(node_id, |node| node.verified = true)?;
        tracing::info!(node_id, fingerprint = %node.fingerprint, "Marked node as verified");
        Ok(node)
    }

    /// Forget a node.
    ///
    /// This is how trust is reset after a fingerprint mismatch; the next contact is treated as a
    /// first contact.
    pub fn remove(&self, node_id: &str) -> Result<TrustedNode> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        if !nodes.contains_key(node_id) {
            return Err(Error::NodeNotFound(node_id.to_string()));
        }
        match std::fs::remove_file(self.record_path(node_id)) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }
        let node = nodes
            .remove(node_id)
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
        tracing::info!(node_id, fingerprint = %node.fingerprint, "Removed trusted node");
        Ok(node)
    }

    /// All trusted nodes, ordered by node ID.
    pub fn list(&self) -> Vec<TrustedNode> {
        let mut nodes: Vec<_> = self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    pub fn len(&self) -> usize {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn normalize(node: &mut TrustedNode) -> Result<()> {
    node.fingerprint = normalize_fingerprint(&node.fingerprint);
    if node.node_id.is_empty() || node.fingerprint.is_empty() {
        return Err(Error::InvalidConfig(
            "a trusted node needs both a node ID and a fingerprint".to_string(),
        ));
    }
    Ok(())
}
