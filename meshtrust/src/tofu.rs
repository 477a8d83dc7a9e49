// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The Trust-On-First-Use decision made for each outbound connection.
//!
//! A peer presenting a certificate for the first time is either trusted automatically, or after
//! the operator (or a caller-supplied policy) agrees. From then on the peer must present a
//! certificate with the same fingerprint. Anything else is reported as
//! [`Error::FingerprintMismatch`] and the trust store is left untouched.

use std::{
    io::{BufRead, Write},
    sync::{mpsc, Arc},
    time::Duration,
};

use chrono::{DateTime, Utc};

use crate::{
    config::TofuConfig,
    error::Error,
    generator::{self, ParsedCertificate},
    truststore::{TrustMethod, TrustStore, TrustedNode},
    Result,
};

/// How to decide about peers the trust store has never seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TofuMode {
    /// Trust every new peer.
    AutoTrust,
    /// Ask the operator on the terminal.
    ///
    /// With no timeout the prompt blocks until answered. An unanswered prompt is a rejection.
    Interactive { timeout: Option<Duration> },
}

impl From<&TofuConfig> for TofuMode {
    fn from(config: &TofuConfig) -> Self {
        if config.auto_trust {
            TofuMode::AutoTrust
        } else {
            TofuMode::Interactive {
                timeout: config.prompt_timeout(),
            }
        }
    }
}

/// What the operator or policy is shown when asked to trust a new peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustPrompt {
    pub node_id: String,
    pub address: String,
    pub fingerprint: String,
    pub subject: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl TrustPrompt {
    fn new(node_id: &str, address: &str, certificate: &ParsedCertificate) -> Self {
        Self {
            node_id: node_id.to_string(),
            address: address.to_string(),
            fingerprint: certificate.fingerprint.clone(),
            subject: certificate.subject.clone(),
            issuer: certificate.issuer.clone(),
            not_before: certificate.not_before,
            not_after: certificate.not_after,
        }
    }
}

/// The outcome of a trust decision.
///
/// A fingerprint mismatch is not a `VerifyResult`; it is returned as
/// [`Error::FingerprintMismatch`] so it can't be mistaken for an ordinary rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyResult {
    /// Whether the connection may proceed.
    pub trusted: bool,
    /// Whether trust was established by this call.
    pub new_trust: bool,
    /// The trust record, if the peer is trusted.
    pub node: Option<TrustedNode>,
    /// The fingerprint of the presented certificate.
    pub fingerprint: String,
}

/// Makes TOFU decisions against a shared [`TrustStore`].
#[derive(Debug, Clone)]
pub struct TofuVerifier {
    store: Arc<TrustStore>,
    mode: TofuMode,
}

impl TofuVerifier {
    pub fn new(store: Arc<TrustStore>, mode: TofuMode) -> Self {
        Self { store, mode }
    }

    pub fn mode(&self) -> TofuMode {
        self.mode
    }

    pub fn store(&self) -> &Arc<TrustStore> {
        &self.store
    }

    /// Decide whether to trust `certificate_pem`, presented by `node_id` at `address`.
    ///
    /// # Errors
    ///
    /// [`Error::CertificateParse`] if the certificate can't be read, and
    /// [`Error::FingerprintMismatch`] if the node is known by a different certificate. Either
    /// way the connection must be refused.
    pub fn verify(
        &self,
        node_id: &str,
        address: &str,
        certificate_pem: &str,
    ) -> Result<VerifyResult> {
        match self.mode {
            TofuMode::AutoTrust => {
                self.verify_with_callback(node_id, address, certificate_pem, |_| true)
            }
            TofuMode::Interactive { timeout } => {
                self.verify_with_callback(node_id, address, certificate_pem, |prompt| {
                    prompt_operator(prompt, timeout)
                })
            }
        }
    }

    /// Like [`TofuVerifier::verify`], but `decide` is asked about unknown peers instead of the
    /// configured mode.
    pub fn verify_with_callback<F>(
        &self,
        node_id: &str,
        address: &str,
        certificate_pem: &str,
        decide: F,
    ) -> Result<VerifyResult>
    where
        F: FnOnce(&TrustPrompt) -> bool,
    {
        let certificate = generator::parse_certificate(certificate_pem)?;
        let fingerprint = certificate.fingerprint.clone();

        match self.store.is_trusted(node_id, &fingerprint) {
            Ok(true) => {
                let node = match self.store.touch(node_id, Some(address)) {
                    Ok(node) => Some(node),
                    Err(error) => {
                        tracing::warn!(node_id, %error, "Failed to record trusted node activity");
                        self.store.get(node_id)
                    }
                };
                tracing::debug!(node_id, %fingerprint, "Peer certificate matches the trust store");
                Ok(VerifyResult {
                    trusted: true,
                    new_trust: false,
                    node,
                    fingerprint,
                })
            }
            Ok(false) => {
                let prompt = TrustPrompt::new(node_id, address, &certificate);
                if !decide(&prompt) {
                    tracing::info!(node_id, address, %fingerprint, "Declined to trust new peer");
                    return Ok(VerifyResult {
                        trusted: false,
                        new_trust: false,
                        node: None,
                        fingerprint,
                    });
                }
                let node = TrustedNode::new(node_id, &fingerprint, TrustMethod::Tofu)
                    .with_certificate(certificate_pem)
                    .with_address(address);
                // Another connection from the same peer may have won the race to record it.
                let new_trust = self.store.add_if_absent(node.clone())?;
                Ok(VerifyResult {
                    trusted: true,
                    new_trust,
                    node: self.store.get(node_id).or(Some(node)),
                    fingerprint,
                })
            }
            Err(error @ Error::FingerprintMismatch { .. }) => {
                tracing::warn!(
                    node_id,
                    address,
                    presented = %fingerprint,
                    "Peer certificate does not match the trusted fingerprint; possible man-in-the-middle attack"
                );
                Err(error)
            }
            Err(error) => Err(error),
        }
    }
}

/// Format a hex fingerprint as colon-separated byte pairs.
fn format_fingerprint(fingerprint: &str) -> String {
    fingerprint
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).to_ascii_uppercase())
        .collect::<Vec<_>>()
        .join(":")
}

/// Render the question shown to the operator about a new peer.
pub fn render_prompt(prompt: &TrustPrompt) -> String {
    format!(
        "\nThe authenticity of node '{node_id}' ({address}) can't be established.\n\
        \n  Subject:     {subject}\
        \n  Issuer:      {issuer}\
        \n  Valid from:  {not_before}\
        \n  Valid until: {not_after}\
        \n  Fingerprint: SHA256:{fingerprint}\n\
        \nVerify the fingerprint with the node's operator before continuing.\n\
        Trust this node? [y/N]: ",
        node_id = prompt.node_id,
        address = prompt.address,
        subject = prompt.subject,
        issuer = prompt.issuer,
        not_before = prompt.not_before.to_rfc3339(),
        not_after = prompt.not_after.to_rfc3339(),
        fingerprint = format_fingerprint(&prompt.fingerprint),
    )
}

/// Interpret the operator's answer. Only an explicit "y" or "yes" is a yes.
pub fn parse_answer(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Ask about `prompt` on `output` and read the answer from `input`.
///
/// Any I/O error, including end of input, is a rejection.
pub fn ask<R: BufRead, W: Write>(prompt: &TrustPrompt, mut input: R, mut output: W) -> bool {
    if let Err(error) = output
        .write_all(render_prompt(prompt).as_bytes())
        .and_then(|_| output.flush())
    {
        tracing::warn!(%error, "Failed to display the trust prompt");
        return false;
    }
    let mut answer = String::new();
    match input.read_line(&mut answer) {
        Ok(0) => false,
        Ok(_) => parse_answer(&answer),
        Err(error) => {
            tracing::warn!(%error, "Failed to read the trust prompt answer");
            false
        }
    }
}

fn prompt_operator(prompt: &TrustPrompt, timeout: Option<Duration>) -> bool {
    match timeout {
        None => ask(prompt, std::io::stdin().lock(), std::io::stderr()),
        Some(timeout) => ask_with_timeout(prompt, || std::io::stdin().lock(), timeout),
    }
}

/// Ask on a background thread, rejecting the peer if no answer arrives within `timeout`.
fn ask_with_timeout<R, F>(prompt: &TrustPrompt, input: F, timeout: Duration) -> bool
where
    R: BufRead,
    F: FnOnce() -> R + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let background_prompt = prompt.clone();
    // The reader can't be interrupted; if the prompt times out it exits with the next line of
    // input, whose answer is discarded.
    std::thread::spawn(move || {
        let answer = ask(&background_prompt, input(), std::io::stderr());
        _ = tx.send(answer);
    });
    match rx.recv_timeout(timeout) {
        Ok(answer) => answer,
        Err(_) => {
            tracing::warn!(
                node_id = %prompt.node_id,
                timeout_secs = timeout.as_secs(),
                "Trust prompt timed out; rejecting peer"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use anyhow::Result;
    use tracing_test::traced_test;

    use super::*;
    use crate::generator::test_utils;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<TrustStore>,
        verifier: TofuVerifier,
        first: String,
        second: String,
    }

    fn fixture(mode: TofuMode) -> Result<Fixture> {
        let dir = tempfile::TempDir::new()?;
        let store = Arc::new(TrustStore::open(dir.path())?);
        Ok(Fixture {
            verifier: TofuVerifier::new(store.clone(), mode),
            store,
            _dir: dir,
            first: test_utils::ca("node-a").certificate,
            second: test_utils::ca("node-a").certificate,
        })
    }

    #[test]
    fn first_then_second_contact() -> Result<()> {
        let fixture = fixture(TofuMode::AutoTrust)?;

        let result = fixture.verifier.verify("node-a", "10.0.0.1:7070", &fixture.first)?;
        assert!(result.trusted);
        assert!(result.new_trust);
        let node = result.node.expect("new trust should carry the record");
        assert_eq!(node.trust_method, TrustMethod::Tofu);
        assert_eq!(node.certificate.as_deref(), Some(fixture.first.as_str()));
        assert_eq!(node.fingerprint, generator::fingerprint(&fixture.first)?);

        let result = fixture.verifier.verify("node-a", "10.0.0.2:7070", &fixture.first)?;
        assert!(result.trusted);
        assert!(!result.new_trust);
        assert_eq!(
            result.node.map(|node| node.address),
            Some("10.0.0.2:7070".to_string())
        );
        Ok(())
    }

    #[traced_test]
    #[test]
    fn mismatch_leaves_store_untouched() -> Result<()> {
        let fixture = fixture(TofuMode::AutoTrust)?;
        fixture.verifier.verify("node-a", "10.0.0.1:7070", &fixture.first)?;
        let before = fixture.store.get("node-a");

        let error = fixture
            .verifier
            .verify("node-a", "10.0.0.1:7070", &fixture.second)
            .unwrap_err();
        match &error {
            Error::FingerprintMismatch {
                expected,
                presented,
                pinned,
                ..
            } => {
                assert_eq!(expected, &generator::fingerprint(&fixture.first)?);
                assert_eq!(presented, &generator::fingerprint(&fixture.second)?);
                assert!(!pinned);
            }
            other => panic!("expected a mismatch, got {other:?}"),
        }
        assert_eq!(fixture.store.get("node-a"), before);
        assert!(logs_contain("possible man-in-the-middle attack"));
        Ok(())
    }

    // Pinning changes how a mismatch is reported, not whether it's detected.
    #[test]
    fn pinned_mismatch() -> Result<()> {
        let fixture = fixture(TofuMode::AutoTrust)?;
        fixture.verifier.verify("node-a", "10.0.0.1:7070", &fixture.first)?;
        fixture.store.pin("node-a")?;

        let error = fixture
            .verifier
            .verify("node-a", "10.0.0.1:7070", &fixture.second)
            .unwrap_err();
        assert!(matches!(error, Error::FingerprintMismatch { pinned: true, .. }));
        assert!(error.to_string().contains("pinned"));

        let result = fixture.verifier.verify("node-a", "10.0.0.1:7070", &fixture.first)?;
        assert!(result.trusted);
        Ok(())
    }

    #[test]
    fn callback_rejection_is_not_persisted() -> Result<()> {
        let fixture = fixture(TofuMode::AutoTrust)?;
        let mut shown = None;
        let result = fixture.verifier.verify_with_callback(
            "node-a",
            "10.0.0.1:7070",
            &fixture.first,
            |prompt| {
                shown = Some(prompt.clone());
                false
            },
        )?;
        assert!(!result.trusted);
        assert!(!result.new_trust);
        assert!(result.node.is_none());
        assert!(fixture.store.get("node-a").is_none());

        let shown = shown.expect("the callback should have been asked");
        assert_eq!(shown.node_id, "node-a");
        assert_eq!(shown.fingerprint, result.fingerprint);
        assert!(shown.subject.contains("node-a"));
        Ok(())
    }

    #[test]
    fn callback_not_asked_for_known_peers() -> Result<()> {
        let fixture = fixture(TofuMode::AutoTrust)?;
        let result = fixture.verifier.verify_with_callback(
            "node-a",
            "10.0.0.1:7070",
            &fixture.first,
            |_| true,
        )?;
        assert!(result.new_trust);

        let result = fixture.verifier.verify_with_callback(
            "node-a",
            "10.0.0.1:7070",
            &fixture.first,
            |_| panic!("known peers must not be prompted for"),
        )?;
        assert!(result.trusted);
        Ok(())
    }

    // Simultaneous first contacts from one peer report the new trust once.
    #[test]
    fn concurrent_first_contacts() -> Result<()> {
        let fixture = fixture(TofuMode::AutoTrust)?;
        let results = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        fixture
                            .verifier
                            .verify("node-a", "10.0.0.1:7070", &fixture.first)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("thread panicked"))
                .collect::<crate::Result<Vec<_>>>()
        })?;
        assert!(results.iter().all(|result| result.trusted));
        assert_eq!(results.iter().filter(|result| result.new_trust).count(), 1);
        assert_eq!(fixture.store.len(), 1);
        Ok(())
    }

    // An operator who doesn't answer in time has not agreed to trust the peer.
    #[test]
    fn interactive_timeout_rejects() -> Result<()> {
        let fixture = fixture(TofuMode::Interactive {
            timeout: Some(Duration::ZERO),
        })?;
        let result = fixture.verifier.verify("node-a", "10.0.0.1:7070", &fixture.first)?;
        assert!(!result.trusted);
        assert!(!result.new_trust);
        assert!(fixture.store.is_empty());
        Ok(())
    }

    // Reads nothing until long after the prompt has given up, then says yes.
    struct SlowOperator;

    impl std::io::Read for SlowOperator {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            std::thread::sleep(Duration::from_secs(2));
            let answer = b"yes\n";
            let len = answer.len().min(buf.len());
            buf[..len].copy_from_slice(&answer[..len]);
            Ok(len)
        }
    }

    #[test]
    #[traced_test]
    fn late_answer_is_discarded() {
        let input = || std::io::BufReader::new(SlowOperator);
        assert!(!ask_with_timeout(&prompt(), input, Duration::from_millis(50)));
        assert!(logs_contain("Trust prompt timed out; rejecting peer"));

        let input = || Cursor::new("y\n");
        assert!(ask_with_timeout(&prompt(), input, Duration::from_secs(10)));
    }

    #[test]
    fn unparsable_certificate() -> Result<()> {
        let fixture = fixture(TofuMode::AutoTrust)?;
        let result = fixture.verifier.verify("node-a", "10.0.0.1:7070", "not a certificate");
        assert!(matches!(result, Err(Error::CertificateParse(_))));
        assert!(fixture.store.is_empty());
        Ok(())
    }

    #[test]
    fn mode_from_config() {
        let mut config = TofuConfig::default();
        assert_eq!(
            TofuMode::from(&config),
            TofuMode::Interactive { timeout: None }
        );
        config.prompt_timeout_secs = Some(30);
        assert_eq!(
            TofuMode::from(&config),
            TofuMode::Interactive {
                timeout: Some(Duration::from_secs(30))
            }
        );
        config.auto_trust = true;
        assert_eq!(TofuMode::from(&config), TofuMode::AutoTrust);
    }

    fn prompt() -> TrustPrompt {
        TrustPrompt {
            node_id: "node-a".to_string(),
            address: "10.0.0.1:7070".to_string(),
            fingerprint: "aabbcc".to_string(),
            subject: "CN=node-a".to_string(),
            issuer: "CN=node-a CA".to_string(),
            not_before: DateTime::<Utc>::UNIX_EPOCH,
            not_after: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    #[test]
    fn prompt_contents() {
        let rendered = render_prompt(&prompt());
        assert!(rendered.contains("node 'node-a' (10.0.0.1:7070)"));
        assert!(rendered.contains("SHA256:AA:BB:CC"));
        assert!(rendered.contains("CN=node-a CA"));
        assert!(rendered.ends_with("[y/N]: "));
    }

    #[test]
    fn answers() {
        assert!(parse_answer("y\n"));
        assert!(parse_answer("  YES "));
        assert!(!parse_answer(""));
        assert!(!parse_answer("n"));
        assert!(!parse_answer("yep"));
    }

    #[test]
    fn ask_defaults_to_deny() {
        let mut output = Vec::new();
        assert!(ask(&prompt(), Cursor::new("yes\n"), &mut output));
        assert!(String::from_utf8_lossy(&output).contains("Trust this node?"));

        assert!(!ask(&prompt(), Cursor::new("no\n"), Vec::new()));
        assert!(!ask(&prompt(), Cursor::new(""), Vec::new()));
        assert!(!ask(&prompt(), Cursor::new(vec![0xff, 0xfe, b'\n']), Vec::new()));
    }
}
