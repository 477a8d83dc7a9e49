// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

/*!
# Meshtrust

Meshtrust is the trust and identity core of a peer-to-peer cluster node. It issues, stores,
renews, revokes, and verifies the X.509 certificates nodes and users authenticate with over
mutual TLS, and it implements Trust-On-First-Use (TOFU) so a node can bootstrap trust with
peers whose certificate authority it has never seen.

## Components

The [`manager::CertificateManager`] owns the node's certificate authority and server
certificate. On startup it loads (or creates) the CA, decrypting the CA private key with a key
derived from the node's P2P identity key, makes sure the server certificate is present and not
about to expire, and builds the TLS acceptor the transport layer serves connections with.
Inbound client certificates are authorized through
[`manager::CertificateManager::verify_client_cert`], which checks the chain against the local CA
and consults the revocation list.

The [`revocation::RevocationList`] is a versioned set of revoked certificate fingerprints. It is
designed to be gossiped: [`revocation::RevocationList::export`] produces a snapshot and
[`revocation::RevocationList::merge`] folds a remote snapshot in. Merging is a commutative,
idempotent union, so nodes converge regardless of the order in which they hear about
revocations.

The [`truststore::TrustStore`] records, per peer node ID, the certificate fingerprint the
peer presented the first time it was trusted. The [`tofu::TofuVerifier`] uses it to decide
whether an outbound connection's peer certificate is trusted, newly trusted, or a possible
man-in-the-middle.

None of these components perform a TLS handshake; they produce configuration and make trust
decisions for the transport layer.

## On-disk layout

All state lives under a per-node configuration directory (see [`config::Paths`]):

```text
certs/ca.crt                              CA certificate
certs/server.crt, certs/server.key        server certificate and key (0600)
certs/revocation.json                     revocation list
secrets/ca.key.enc                        encrypted CA private key
trusted_nodes/<node-id>.json              one trust record per peer
client_certs/<name>/{client.crt,client.key,ca.crt}
```

## Crate features

* **cli** -
  Build the `meshtrust` operator CLI. This is not enabled by default.
*/

pub mod config;
pub mod error;
pub mod generator;
pub mod keystore;
pub mod manager;
pub(crate) mod persist;
pub mod revocation;
pub mod tofu;
pub mod truststore;

pub use error::{Error, Result};
