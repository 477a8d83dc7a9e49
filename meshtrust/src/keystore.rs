// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Encryption at rest for the CA private key.
//!
//! The key is sealed with AES-256-GCM under a key derived with HKDF-SHA256 from the node's P2P
//! identity private key, so the plaintext CA key only ever exists in memory. The envelope is a
//! small JSON document carrying the random salt and nonce alongside the ciphertext.

use std::path::Path;

use openssl::{
    md::Md,
    pkey::Id,
    pkey_ctx::PkeyCtx,
    symm::{self, Cipher},
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{error::Error, persist, Result};

const ENVELOPE_VERSION: u32 = 1;
const KDF: &str = "hkdf-sha256";
const CIPHER: &str = "aes-256-gcm";
const HKDF_INFO: &[u8] = b"meshtrust ca key v1";
// Authenticated, but not encrypted, so an envelope can't be replayed as some other kind of data.
const AAD: &[u8] = b"meshtrust-ca-key-v1";

const KEY_LEN: usize = 32;
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Encrypted key material stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    kdf: String,
    cipher: String,
    /// Base64-encoded HKDF salt.
    salt: String,
    /// Base64-encoded AES-GCM nonce.
    nonce: String,
    /// Base64-encoded AES-GCM authentication tag.
    tag: String,
    /// Base64-encoded ciphertext.
    ciphertext: String,
}

fn derive_key(secret: &[u8], salt: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    if secret.is_empty() {
        return Err(Error::KeyDecryption(
            "the key derivation secret is empty".to_string(),
        ));
    }
    let mut context = PkeyCtx::new_id(Id::HKDF)?;
    context.derive_init()?;
    context.set_hkdf_md(Md::sha256())?;
    context.set_hkdf_key(secret)?;
    context.set_hkdf_salt(salt)?;
    context.add_hkdf_info(HKDF_INFO)?;
    let mut key = Zeroizing::new([0; KEY_LEN]);
    context.derive(Some(key.as_mut_slice()))?;
    Ok(key)
}

/// Encrypt a PEM-encoded private key and write it to `path`.
///
/// The envelope is written to a temporary file and renamed into place, so a crash never leaves
/// a partially written key behind. The file is only readable by its owner.
pub fn save_encrypted_key(path: &Path, plaintext_key_pem: &str, secret: &[u8]) -> Result<()> {
    let mut salt = [0; SALT_LEN];
    openssl::rand::rand_bytes(&mut salt)?;
    let mut nonce = [0; NONCE_LEN];
    openssl::rand::rand_bytes(&mut nonce)?;
    let key = derive_key(secret, &salt)?;

    let mut tag = [0; TAG_LEN];
    let ciphertext = symm::encrypt_aead(
        Cipher::aes_256_gcm(),
        key.as_slice(),
        Some(&nonce),
        AAD,
        plaintext_key_pem.as_bytes(),
        &mut tag,
    )?;

    let envelope = Envelope {
        version: ENVELOPE_VERSION,
        kdf: KDF.to_string(),
        cipher: CIPHER.to_string(),
        salt: openssl::base64::encode_block(&salt),
        nonce: openssl::base64::encode_block(&nonce),
        tag: openssl::base64::encode_block(&tag),
        ciphertext: openssl::base64::encode_block(&ciphertext),
    };
    persist::write_json_atomic(path, &envelope, persist::PRIVATE_FILE_MODE)?;
    tracing::debug!(path = %path.display(), "Wrote encrypted key");
    Ok(())
}

/// Read and decrypt a key written by [`save_encrypted_key`].
///
/// The caller owns the returned plaintext; it is zeroed when dropped. Nothing is cached here.
///
/// # Errors
///
/// [`Error::KeyNotFound`] if there's no file at `path`, and [`Error::KeyDecryption`] if the
/// envelope is corrupted or was sealed with a different secret.
pub fn load_encrypted_key(path: &Path, secret: &[u8]) -> Result<Zeroizing<String>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::KeyNotFound(path.to_path_buf()))
        }
        Err(error) => return Err(error.into()),
    };
    let envelope: Envelope = serde_json::from_slice(&bytes)
        .map_err(|error| Error::KeyDecryption(format!("the key envelope is malformed: {error}")))?;
    if envelope.version != ENVELOPE_VERSION || envelope.kdf != KDF || envelope.cipher != CIPHER {
        return Err(Error::KeyDecryption(format!(
            "unsupported key envelope (version {}, {}, {})",
            envelope.version, envelope.kdf, envelope.cipher
        )));
    }

    let salt = decode_field("salt", &envelope.salt, Some(SALT_LEN))?;
    let nonce = decode_field("nonce", &envelope.nonce, Some(NONCE_LEN))?;
    let tag = decode_field("tag", &envelope.tag, Some(TAG_LEN))?;
    let ciphertext = decode_field("ciphertext", &envelope.ciphertext, None)?;

    let key = derive_key(secret, &salt)?;
    let plaintext = Zeroizing::new(
        symm::decrypt_aead(
            Cipher::aes_256_gcm(),
            key.as_slice(),
            Some(&nonce),
            AAD,
            &ciphertext,
            &tag,
        )
        .map_err(|_| {
            Error::KeyDecryption(
                "authentication failed; the identity key is wrong or the envelope is corrupted"
                    .to_string(),
            )
        })?,
    );
    let plaintext = std::str::from_utf8(&plaintext)
        .map_err(|_| Error::KeyDecryption("the decrypted key is not valid PEM".to_string()))?;
    Ok(Zeroizing::new(plaintext.to_string()))
}

fn decode_field(name: &str, value: &str, expected_len: Option<usize>) -> Result<Vec<u8>> {
    let decoded = openssl::base64::decode_block(value)
        .map_err(|_| Error::KeyDecryption(format!("the envelope {name} is not valid base64")))?;
    match expected_len {
        Some(len) if decoded.len() != len => Err(Error::KeyDecryption(format!(
            "the envelope {name} is {} bytes, expected {len}",
            decoded.len()
        ))),
        _ => Ok(decoded),
    }
}
