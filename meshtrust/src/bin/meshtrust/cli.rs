// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Define the command-line interface.
//!
//! This is where subcommands, the arguments, and their types are defined.

use std::path::PathBuf;

use clap::Parser;
use meshtrust::revocation::RevocationReason;

/// Manage a node's certificate authority, revocation list, and trusted peers.
///
/// To begin, you'll need a configuration file. For an example of the current format, consult
/// the `config` subcommand. Then run `init` to create the certificate authority and the server
/// certificate. The node's identity key must exist before `init` is run; the CA private key is
/// encrypted with a key derived from it.
///
/// Be aware that these commands should be run with the same user the node runs as. Changes to
/// the revocation list and trusted nodes are picked up by a running node when it restarts.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// The path to the node's configuration file.
    ///
    /// If no path is provided, the defaults are used. To view the configuration,
    /// run the `config` subcommand.
    #[arg(long, short, env = "MESHTRUST_CONFIG")]
    pub config: Option<PathBuf>,

    /// A set of one or more comma-separated directives to filter logs.
    ///
    /// The general format is "target_name[span_name{field=value}]=level" where level is
    /// one of TRACE, DEBUG, INFO, WARN, ERROR.
    ///
    /// Details: https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[arg(long, env = "MESHTRUST_LOG", default_value = "WARN,meshtrust=INFO")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// See the current configuration.
    Config {},

    /// Create or load the certificate authority and server certificate.
    ///
    /// This is safe to run repeatedly. An existing certificate authority is never replaced, and
    /// the server certificate is only replaced if it is missing, doesn't belong to the
    /// certificate authority, or is due for renewal.
    Init {},

    /// Print the SHA-256 fingerprint of a PEM-encoded certificate.
    Fingerprint {
        /// The path to the certificate.
        certificate: PathBuf,
    },

    /// Issue client certificates.
    #[command(subcommand)]
    ClientCert(ClientCertCommands),

    /// Manage the revocation list.
    #[command(subcommand)]
    Revoke(RevokeCommands),

    /// Manage trusted peer nodes.
    #[command(subcommand)]
    Trust(TrustCommands),

    /// Renew the server certificate if it is within the renewal threshold of expiring.
    CheckRenewal {},
}

#[derive(clap::Subcommand, Debug)]
pub enum ClientCertCommands {
    /// Issue a client certificate signed by this node's certificate authority.
    ///
    /// The certificate, its private key, and the CA certificate are written to
    /// `client_certs/<name>/` in the configuration directory.
    Issue {
        /// The common name of the certificate; this need not be unique.
        name: String,
        /// Bind the certificate to this user ID.
        #[arg(long)]
        user: Option<String>,
        /// Bind the certificate to the SSH key with this fingerprint.
        #[arg(long)]
        ssh_fingerprint: Option<String>,
    },
}

#[derive(clap::Subcommand, Debug)]
pub enum RevokeCommands {
    /// Revoke a certificate.
    Add {
        /// The fingerprint of the certificate, or the path to the PEM-encoded certificate.
        ///
        /// When a certificate is provided, its serial number, subject, and expiry are recorded
        /// too. Entries are only eligible for pruning if their expiry is known.
        certificate: String,
        /// Why the certificate is being revoked.
        #[arg(long, default_value = "unspecified")]
        reason: RevocationReason,
        /// Who is revoking the certificate.
        #[arg(long, env = "USER", default_value = "operator")]
        revoked_by: String,
        /// Free-form notes to store with the entry.
        #[arg(long)]
        notes: Option<String>,
    },
    /// Reinstate a revoked certificate.
    Remove {
        /// The fingerprint of the certificate.
        fingerprint: String,
    },
    /// List revoked certificates.
    List {},
    /// Remove entries for certificates that expired long ago.
    Prune {
        /// Remove entries for certificates that expired more than this many days ago.
        ///
        /// Defaults to `revocation_prune_after_days` from the configuration.
        #[arg(long)]
        older_than_days: Option<u32>,
    },
}

#[derive(clap::Subcommand, Debug)]
pub enum TrustCommands {
    /// List trusted nodes.
    List {},
    /// Trust a node's certificate without waiting for first contact.
    Add {
        /// The node's peer ID.
        node_id: String,
        /// The path to the node's PEM-encoded certificate.
        certificate: PathBuf,
        /// A friendly name for the node.
        #[arg(long)]
        alias: Option<String>,
        /// The address the node can be reached at.
        #[arg(long)]
        address: Option<String>,
    },
    /// Forget a node.
    ///
    /// This is the only way to recover after a node's certificate changes. Confirm the change
    /// with the node's operator first; an unexpected change may be a man-in-the-middle attack.
    Remove {
        /// The node's peer ID.
        node_id: String,
    },
    /// Pin a node's certificate, escalating warnings if it ever changes.
    Pin {
        /// The node's peer ID.
        node_id: String,
    },
    /// Record that a node's fingerprint was confirmed out of band.
    Verify {
        /// The node's peer ID.
        node_id: String,
        /// The fingerprint the node's operator reported; it must match the trusted one.
        #[arg(long)]
        fingerprint: Option<String>,
    },
    /// Show everything known about a trusted node.
    Show {
        /// The node's peer ID.
        node_id: String,
    },
}
