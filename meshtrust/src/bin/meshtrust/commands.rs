// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Implements the commands for the meshtrust CLI.

use std::path::Path;

use anyhow::Context;
use meshtrust::{
    config::Config,
    generator::{self, normalize_fingerprint},
    manager::CertificateManager,
    revocation::{RevocationList, RevokedCertificate},
    truststore::{TrustMethod, TrustStore, TrustedNode},
    Error,
};
use tracing::instrument;

use crate::cli::{ClientCertCommands, RevokeCommands, TrustCommands};

/// Explain the errors an operator can do something about.
fn explain(error: Error) -> anyhow::Error {
    let hint = match &error {
        Error::KeyDecryption(_) => Some(
            "The CA key is encrypted with a different identity key. Check that `identity_key` \
            points at this node's identity key; never delete the CA to work around this.",
        ),
        Error::KeyNotFound(_) => Some(
            "The CA certificate exists but its encrypted key is missing. Restore the `secrets` \
            directory from a backup.",
        ),
        Error::ConfigDirectory { .. } => Some(
            "Check that the configuration directory exists and is writable by this user.",
        ),
        Error::AlreadyRevoked(_) => {
            Some("Use `revoke list` to see the existing entry, or `revoke remove` it first.")
        }
        Error::AlreadyTrusted(_) => Some(
            "Use `trust show` to see the existing record, or `trust remove` it first.",
        ),
        Error::NodeNotFound(_) => Some("Use `trust list` to see trusted nodes."),
        Error::FingerprintMismatch { .. } => Some(
            "Do not proceed until the node's operator has confirmed its certificate changed. \
            Then remove the record with `trust remove` and add it again.",
        ),
        _ => None,
    };
    match hint {
        Some(hint) => anyhow::Error::new(error).context(hint),
        None => anyhow::Error::new(error),
    }
}

fn manager(config: Config) -> anyhow::Result<CertificateManager> {
    let identity_secret = config.read_identity_secret()?;
    let manager = CertificateManager::new(config, identity_secret);
    manager.initialize().map_err(explain)?;
    Ok(manager)
}

#[instrument(skip_all)]
pub fn init(config: Config) -> anyhow::Result<()> {
    let manager = manager(config)?;
    let server = manager.server_certificate()?;
    println!("Configuration directory: {}", manager.paths().root().display());
    println!("CA fingerprint:          SHA256:{}", manager.ca_fingerprint()?);
    println!("Server fingerprint:      SHA256:{}", server.fingerprint);
    println!("Server certificate expires {}", server.not_after.to_rfc3339());
    manager.close();
    Ok(())
}

pub fn fingerprint(certificate: &Path) -> anyhow::Result<()> {
    let pem = std::fs::read_to_string(certificate)
        .with_context(|| format!("failed to read {certificate:?}"))?;
    println!("SHA256:{}", generator::fingerprint(&pem)?);
    Ok(())
}

#[instrument(skip_all)]
pub fn client_cert(command: ClientCertCommands, config: Config) -> anyhow::Result<()> {
    match command {
        ClientCertCommands::Issue {
            name,
            user,
            ssh_fingerprint,
        } => {
            let manager = manager(config)?;
            let issued =
                manager.generate_client_cert(&name, user.as_deref(), ssh_fingerprint.as_deref())?;
            let directory = manager.save_client_cert(&name, &issued)?;
            println!("Issued client certificate SHA256:{}", issued.fingerprint);
            println!("Expires {}", issued.not_after.to_rfc3339());
            println!("Written to {}", directory.display());
            manager.close();
        }
    }
    Ok(())
}

#[instrument(skip_all)]
pub fn revoke(command: RevokeCommands, config: &Config) -> anyhow::Result<()> {
    let revocations = RevocationList::open(config.paths().revocation_list())?;
    match command {
        RevokeCommands::Add {
            certificate,
            reason,
            revoked_by,
            notes,
        } => {
            let path = Path::new(&certificate);
            let mut entry = if path.is_file() {
                let pem = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {path:?}"))?;
                let parsed = generator::parse_certificate(&pem)?;
                RevokedCertificate::from_certificate(&parsed, reason, &revoked_by)
            } else {
                RevokedCertificate::new(&certificate, reason, &revoked_by)
            };
            entry.notes = notes;
            let fingerprint = entry.fingerprint.clone();
            revocations.revoke_new(entry).map_err(explain)?;
            println!("Revoked SHA256:{fingerprint} ({reason})");
        }
        RevokeCommands::Remove { fingerprint } => {
            let removed = revocations.remove(&fingerprint).map_err(explain)?;
            println!("Reinstated SHA256:{}", removed.fingerprint);
        }
        RevokeCommands::List {} => {
            println!(
                "Revocation list version {} ({} entries)",
                revocations.version(),
                revocations.len()
            );
            for entry in revocations.list() {
                println!(
                    "SHA256:{}\t{}\t{}\t{}\t{}",
                    entry.fingerprint,
                    entry.reason,
                    entry.revoked_at.to_rfc3339(),
                    entry.revoked_by,
                    entry.subject
                );
            }
        }
        RevokeCommands::Prune { older_than_days } => {
            let older_than = older_than_days
                .map(|days| chrono::Duration::days(i64::from(days)))
                .unwrap_or_else(|| config.revocation_prune_after());
            let removed = revocations.prune(older_than)?;
            println!("Pruned {removed} entries");
        }
    }
    Ok(())
}

#[instrument(skip_all)]
pub fn trust(command: TrustCommands, config: &Config) -> anyhow::Result<()> {
    let store = TrustStore::open(config.paths().trusted_nodes_dir())?;
    match command {
        TrustCommands::List {} => {
            for node in store.list() {
                println!(
                    "{}\t{}\t{}{}\tSHA256:{}\t{}",
                    node.node_id,
                    node.alias,
                    node.trust_method,
                    if node.verified { ", verified" } else { "" },
                    node.fingerprint,
                    node.last_seen.to_rfc3339()
                );
            }
        }
        TrustCommands::Add {
            node_id,
            certificate,
            alias,
            address,
        } => {
            let pem = std::fs::read_to_string(&certificate)
                .with_context(|| format!("failed to read {certificate:?}"))?;
            let fingerprint = generator::fingerprint(&pem)?;
            let node = TrustedNode::new(&node_id, &fingerprint, TrustMethod::Manual)
                .with_certificate(&pem)
                .with_alias(alias.as_deref().unwrap_or_default())
                .with_address(address.as_deref().unwrap_or_default());
            store.add_manual(node).map_err(explain)?;
            println!("Trusted {node_id} with SHA256:{fingerprint}");
        }
        TrustCommands::Remove { node_id } => {
            let node = store.remove(&node_id).map_err(explain)?;
            println!("Removed {} (was SHA256:{})", node.node_id, node.fingerprint);
        }
        TrustCommands::Pin { node_id } => {
            let node = store.pin(&node_id).map_err(explain)?;
            println!("Pinned {} to SHA256:{}", node.node_id, node.fingerprint);
        }
        TrustCommands::Verify {
            node_id,
            fingerprint,
        } => {
            if let Some(reported) = fingerprint {
                let trusted = store
                    .get(&node_id)
                    .ok_or_else(|| explain(Error::NodeNotFound(node_id.clone())))?;
                let reported = normalize_fingerprint(&reported);
                if reported != trusted.fingerprint {
                    return Err(explain(Error::FingerprintMismatch {
                        node_id,
                        expected: trusted.fingerprint,
                        presented: reported,
                        pinned: trusted.is_pinned(),
                    }));
                }
            }
            let node = store.verify(&node_id).map_err(explain)?;
            println!("Verified {} with SHA256:{}", node.node_id, node.fingerprint);
        }
        TrustCommands::Show { node_id } => {
            let node = store
                .get(&node_id)
                .ok_or_else(|| explain(Error::NodeNotFound(node_id)))?;
            println!("Node ID:      {}", node.node_id);
            println!("Alias:        {}", node.alias);
            println!("Address:      {}", node.address);
            println!("Fingerprint:  SHA256:{}", node.fingerprint);
            println!("Trust method: {}", node.trust_method);
            if let Some(pinned_at) = node.pinned_at {
                println!("Pinned at:    {}", pinned_at.to_rfc3339());
            }
            println!("Verified:     {}", node.verified);
            println!("First seen:   {}", node.first_seen.to_rfc3339());
            println!("Last seen:    {}", node.last_seen.to_rfc3339());
            if let Some(certificate) = node
                .certificate
                .as_deref()
                .and_then(|pem| generator::parse_certificate(pem).ok())
            {
                println!("Subject:      {}", certificate.subject);
                println!("Issuer:       {}", certificate.issuer);
                println!("Expires:      {}", certificate.not_after.to_rfc3339());
            }
            if !node.notes.is_empty() {
                println!("Notes:        {}", node.notes);
            }
        }
    }
    Ok(())
}

#[instrument(skip_all)]
pub fn check_renewal(config: Config) -> anyhow::Result<()> {
    // Loading the manager already replaces a certificate that's due, so compare against disk.
    let previous = std::fs::read_to_string(config.paths().server_cert())
        .ok()
        .and_then(|pem| generator::fingerprint(&pem).ok());
    let manager = manager(config)?;
    let renewed = manager.check_renewal()?;
    if renewed || previous.as_deref() != Some(manager.server_certificate()?.fingerprint.as_str()) {
        let server = manager.server_certificate()?;
        println!(
            "Renewed the server certificate; SHA256:{} expires {}",
            server.fingerprint,
            server.not_after.to_rfc3339()
        );
    } else {
        println!("The server certificate does not need renewal");
    }
    manager.close();
    Ok(())
}
