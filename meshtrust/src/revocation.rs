// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! A persistent, versioned set of revoked certificate fingerprints.
//!
//! Nodes gossip their lists to one another with [`RevocationList::export`] and
//! [`RevocationList::merge`]. Merging is a union keyed by fingerprint that never overwrites or
//! removes a local entry, so every node converges on the same set regardless of the order in
//! which snapshots arrive or how often they're repeated.

use std::{
    collections::HashMap,
    fmt::Display,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{PoisonError, RwLock},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    generator::{normalize_fingerprint, ParsedCertificate},
    persist, Result,
};

/// Why a certificate was revoked, using the reason codes from RFC 5280.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    #[default]
    Unspecified,
    KeyCompromise,
    CaCompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
    CertificateHold,
    RemoveFromCrl,
    PrivilegeWithdrawn,
    AaCompromise,
}

impl RevocationReason {
    const NAMES: [(RevocationReason, &'static str); 10] = [
        (RevocationReason::Unspecified, "unspecified"),
        (RevocationReason::KeyCompromise, "key_compromise"),
        (RevocationReason::CaCompromise, "ca_compromise"),
        (RevocationReason::AffiliationChanged, "affiliation_changed"),
        (RevocationReason::Superseded, "superseded"),
        (
            RevocationReason::CessationOfOperation,
            "cessation_of_operation",
        ),
        (RevocationReason::CertificateHold, "certificate_hold"),
        (RevocationReason::RemoveFromCrl, "remove_from_crl"),
        (RevocationReason::PrivilegeWithdrawn, "privilege_withdrawn"),
        (RevocationReason::AaCompromise, "aa_compromise"),
    ];

    /// The snake_case name used on disk and on the command line.
    pub fn as_str(&self) -> &'static str {
        Self::NAMES
            .iter()
            .find_map(|(reason, name)| (reason == self).then_some(*name))
            .unwrap_or("unspecified")
    }
}

impl Display for RevocationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RevocationReason {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().replace('-', "_").to_ascii_lowercase();
        Self::NAMES
            .iter()
            .find_map(|(reason, name)| (*name == wanted).then_some(*reason))
            .ok_or_else(|| {
                let names = Self::NAMES.map(|(_, name)| name).join(", ");
                Error::InvalidConfig(format!(
                    "unknown revocation reason '{s}'; expected one of {names}"
                ))
            })
    }
}

/// A single revoked certificate, keyed by its fingerprint.
///
/// Entries are immutable once created; the only way to reverse a revocation is
/// [`RevocationList::remove`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokedCertificate {
    pub fingerprint: String,
    #[serde(default)]
    pub serial_hex: String,
    #[serde(default)]
    pub subject: String,
    pub revoked_at: DateTime<Utc>,
    #[serde(default)]
    pub reason: RevocationReason,
    #[serde(default)]
    pub revoked_by: String,
    /// When the revoked certificate itself expires.
    ///
    /// This is only used to decide when the entry can be pruned; it never re-enables trust.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl RevokedCertificate {
    /// Create an entry for a bare fingerprint, revoked now.
    pub fn new(fingerprint: &str, reason: RevocationReason, revoked_by: &str) -> Self {
        Self {
            fingerprint: normalize_fingerprint(fingerprint),
            serial_hex: String::new(),
            subject: String::new(),
            revoked_at: Utc::now(),
            reason,
            revoked_by: revoked_by.to_string(),
            expires_at: None,
            notes: None,
        }
    }

    /// Create an entry for a certificate, copying its serial, subject, and expiry.
    pub fn from_certificate(
        certificate: &ParsedCertificate,
        reason: RevocationReason,
        revoked_by: &str,
    ) -> Self {
        Self {
            serial_hex: certificate.serial.clone(),
            subject: certificate.subject.clone(),
            expires_at: Some(certificate.not_after),
            ..Self::new(&certificate.fingerprint, reason, revoked_by)
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// The on-disk and wire form of a revocation list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationListData {
    /// Incremented on every local change; never decremented.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub entries: Vec<RevokedCertificate>,
}

#[derive(Debug, Clone, Default)]
struct State {
    version: u64,
    updated_at: DateTime<Utc>,
    entries: HashMap<String, RevokedCertificate>,
}

impl State {
    fn from_data(data: RevocationListData) -> Self {
        let mut entries = HashMap::with_capacity(data.entries.len());
        for mut entry in data.entries {
            entry.fingerprint = normalize_fingerprint(&entry.fingerprint);
            if entry.fingerprint.is_empty() {
                tracing::warn!("Skipping revocation entry without a fingerprint");
                continue;
            }
            entries.entry(entry.fingerprint.clone()).or_insert(entry);
        }
        Self {
            version: data.version,
            updated_at: data.updated_at,
            entries,
        }
    }

    fn to_data(&self) -> RevocationListData {
        let mut entries: Vec<_> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        RevocationListData {
            version: self.version,
            updated_at: self.updated_at,
            entries,
        }
    }

    fn bump(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

/// The node's revocation list, backed by a JSON file.
///
/// Every mutation writes the full list to disk before it returns, and the in-memory list is
/// only updated once that write succeeds. A revocation is therefore in effect, durably, as soon
/// as [`RevocationList::revoke`] returns.
#[derive(Debug)]
pub struct RevocationList {
    path: PathBuf,
    state: RwLock<State>,
}

impl RevocationList {
    /// Load the revocation list at `path`, or start an empty one if the file doesn't exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = persist::read_json_if_exists::<RevocationListData>(&path)?
            .map(State::from_data)
            .unwrap_or_default();
        tracing::debug!(
            path = %path.display(),
            version = state.version,
            entries = state.entries.len(),
            "Loaded revocation list"
        );
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` to a copy of the state, persist it if the change says so, and publish it.
    fn update<T>(&self, change: impl FnOnce(&mut State) -> Result<(T, bool)>) -> Result<T> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let mut updated = state.clone();
        let (value, changed) = change(&mut updated)?;
        if changed {
            persist::write_json_atomic(
                &self.path,
                &updated.to_data(),
                persist::PUBLIC_FILE_MODE,
            )?;
            *state = updated;
        }
        Ok(value)
    }

    /// Add or replace the entry for a fingerprint.
    ///
    /// Revoking an already revoked fingerprint replaces its metadata. Use
    /// [`RevocationList::revoke_new`] to refuse instead.
    pub fn revoke(&self, entry: RevokedCertificate) -> Result<()> {
        self.insert(entry, true)
    }

    /// Like [`RevocationList::revoke`], but fails with [`Error::AlreadyRevoked`] if the
    /// fingerprint is already present.
    pub fn revoke_new(&self, entry: RevokedCertificate) -> Result<()> {
        self.insert(entry, false)
    }

    fn insert(&self, mut entry: RevokedCertificate, replace: bool) -> Result<()> {
        entry.fingerprint = normalize_fingerprint(&entry.fingerprint);
        if entry.fingerprint.is_empty() {
            return Err(Error::InvalidConfig(
                "a revocation entry needs a fingerprint".to_string(),
            ));
        }
        let fingerprint = entry.fingerprint.clone();
        let reason = entry.reason;
        self.update(|state| {
            if !replace && state.entries.contains_key(&entry.fingerprint) {
                return Err(Error::AlreadyRevoked(entry.fingerprint.clone()));
            }
            state.entries.insert(entry.fingerprint.clone(), entry);
            state.bump();
            Ok(((), true))
        })?;
        tracing::info!(%fingerprint, %reason, "Revoked certificate");
        Ok(())
    }

    pub fn is_revoked(&self, fingerprint: &str) -> bool {
        let fingerprint = normalize_fingerprint(fingerprint);
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .contains_key(&fingerprint)
    }

    pub fn get(&self, fingerprint: &str) -> Option<RevokedCertificate> {
        let fingerprint = normalize_fingerprint(fingerprint);
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(&fingerprint)
            .cloned()
    }

    /// Reinstate a certificate by removing its revocation entry.
    ///
    /// This is the only way a fingerprint stops being revoked; merging never removes entries.
    pub fn remove(&self, fingerprint: &str) -> Result<RevokedCertificate> {
        let fingerprint = normalize_fingerprint(fingerprint);
        let removed = self.update(|state| {
            let removed = state
                .entries
                .remove(&fingerprint)
                .ok_or_else(|| Error::NotRevoked(fingerprint.clone()))?;
            state.bump();
            Ok((removed, true))
        })?;
        tracing::info!(%fingerprint, "Removed certificate from the revocation list");
        Ok(removed)
    }

    /// Drop entries for certificates that expired more than `older_than` ago.
    ///
    /// Returns the number of entries removed. Entries with no recorded expiry are kept, as is
    /// everything when `older_than` reaches back past the earliest representable time.
    pub fn prune(&self, older_than: chrono::Duration) -> Result<usize> {
        let cutoff = Utc::now()
            .checked_sub_signed(older_than)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.prune_expired_before(cutoff)
    }

    /// Drop entries whose certificate expired strictly before `cutoff`.
    pub fn prune_expired_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let removed = self.update(|state| {
            let before = state.entries.len();
            state
                .entries
                .retain(|_, entry| entry.expires_at.is_none_or(|expiry| expiry >= cutoff));
            let removed = before - state.entries.len();
            if removed > 0 {
                state.bump();
            }
            Ok((removed, removed > 0))
        })?;
        if removed > 0 {
            tracing::info!(removed, %cutoff, "Pruned expired revocation entries");
        }
        Ok(removed)
    }

    /// Snapshot the list for gossip.
    pub fn export(&self) -> RevocationListData {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .to_data()
    }

    /// Add every remote entry whose fingerprint isn't already present.
    ///
    /// Local entries always win, and nothing is ever removed. The version is incremented once if
    /// anything was added, regardless of how many entries were. Returns the number of entries
    /// added.
    pub fn merge(&self, remote: &RevocationListData) -> Result<usize> {
        let added = self.update(|state| {
            let mut added = 0;
            for entry in &remote.entries {
                let fingerprint = normalize_fingerprint(&entry.fingerprint);
                if fingerprint.is_empty() || state.entries.contains_key(&fingerprint) {
                    continue;
                }
                let mut entry = entry.clone();
                entry.fingerprint = fingerprint.clone();
                state.entries.insert(fingerprint, entry);
                added += 1;
            }
            if added > 0 {
                state.bump();
            }
            Ok((added, added > 0))
        })?;
        if added > 0 {
            tracing::info!(
                added,
                remote_version = remote.version,
                "Merged remote revocation entries"
            );
        } else {
            tracing::debug!(
                remote_version = remote.version,
                "Remote revocation list had nothing new"
            );
        }
        Ok(added)
    }

    /// All entries, most recently revoked first.
    pub fn list(&self) -> Vec<RevokedCertificate> {
        let mut entries: Vec<_> = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .values()
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            b.revoked_at
                .cmp(&a.revoked_at)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        entries
    }

    pub fn version(&self) -> u64 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .version
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use anyhow::Result;
    use chrono::Duration;
    use proptest::prelude::*;

    use super::*;

    fn entry(fingerprint: &str) -> RevokedCertificate {
        RevokedCertificate::new(fingerprint, RevocationReason::KeyCompromise, "tester")
    }

    fn expiring(fingerprint: &str, expires_at: DateTime<Utc>) -> RevokedCertificate {
        RevokedCertificate {
            expires_at: Some(expires_at),
            ..entry(fingerprint)
        }
    }

    fn open(dir: &tempfile::TempDir) -> Result<RevocationList> {
        Ok(RevocationList::open(dir.path().join("revocation.json"))?)
    }

    #[test]
    fn revoke_is_idempotent() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let list = open(&dir)?;

        list.revoke(entry("aa"))?;
        list.revoke(entry("aa"))?;
        assert!(list.is_revoked("aa"));
        assert_eq!(list.len(), 1);
        assert_eq!(list.version(), 2);

        let on_disk: RevocationListData =
            serde_json::from_slice(&std::fs::read(list.path())?)?;
        assert_eq!(on_disk.entries.len(), 1);
        assert_eq!(on_disk.version, 2);
        Ok(())
    }

    #[test]
    fn revoke_new_refuses_duplicates() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let list = open(&dir)?;

        list.revoke_new(entry("aa"))?;
        let result = list.revoke_new(entry("AA"));
        assert!(matches!(result, Err(Error::AlreadyRevoked(fp)) if fp == "aa"));
        assert_eq!(list.version(), 1);
        Ok(())
    }

    #[test]
    fn empty_fingerprint_rejected() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let list = open(&dir)?;
        assert!(matches!(
            list.revoke(entry("  ")),
            Err(Error::InvalidConfig(_))
        ));
        assert!(!list.path().exists());
        Ok(())
    }

    #[test]
    fn persistence_round_trip() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let list = open(&dir)?;
        list.revoke(entry("sha256:AB:CD").with_notes("lost laptop"))?;
        drop(list);

        let reloaded = open(&dir)?;
        assert!(reloaded.is_revoked("abcd"));
        assert_eq!(reloaded.version(), 1);
        let stored = reloaded.get("ABCD").expect("entry should survive a reload");
        assert_eq!(stored.reason, RevocationReason::KeyCompromise);
        assert_eq!(stored.notes.as_deref(), Some("lost laptop"));
        Ok(())
    }

    // The on-disk format uses snake_case reasons and RFC 3339 timestamps.
    #[test]
    fn json_format() -> Result<()> {
        let json = r#"{
            "version": 7,
            "updated_at": "2024-05-01T12:00:00Z",
            "entries": [{
                "fingerprint": "abcd",
                "serial_hex": "01",
                "subject": "CN=node",
                "revoked_at": "2024-05-01T11:00:00Z",
                "reason": "cessation_of_operation",
                "revoked_by": "admin",
                "expires_at": "2025-05-01T11:00:00Z"
            }]
        }"#;
        let data: RevocationListData = serde_json::from_str(json)?;
        assert_eq!(data.version, 7);
        assert_eq!(
            data.entries[0].reason,
            RevocationReason::CessationOfOperation
        );
        assert!(data.entries[0].notes.is_none());
        Ok(())
    }

    #[test]
    fn remove() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let list = open(&dir)?;
        list.revoke(entry("aa"))?;

        let removed = list.remove("aa")?;
        assert_eq!(removed.fingerprint, "aa");
        assert!(!list.is_revoked("aa"));
        assert_eq!(list.version(), 2);

        let result = list.remove("aa");
        assert!(matches!(result, Err(Error::NotRevoked(_))));
        assert_eq!(list.version(), 2);
        Ok(())
    }

    #[test]
    fn merge_adds_only_missing_entries() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let list = open(&dir)?;
        list.revoke(entry("aa"))?;
        list.revoke(entry("bb"))?;

        let mut local_wins = entry("aa");
        local_wins.reason = RevocationReason::Superseded;
        let remote = RevocationListData {
            version: 40,
            updated_at: Utc::now(),
            entries: vec![local_wins, entry("CC"), entry("dd"), entry("")],
        };
        let added = list.merge(&remote)?;
        assert_eq!(added, 2);
        assert_eq!(list.version(), 3);
        for fingerprint in ["aa", "bb", "cc", "dd"] {
            assert!(list.is_revoked(fingerprint), "{fingerprint} should be revoked");
        }
        assert_eq!(
            list.get("aa").map(|e| e.reason),
            Some(RevocationReason::KeyCompromise)
        );

        // Replaying the same snapshot changes nothing.
        assert_eq!(list.merge(&remote)?, 0);
        assert_eq!(list.version(), 3);
        Ok(())
    }

    #[test]
    fn prune_boundary() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let list = open(&dir)?;
        let cutoff = Utc::now() - Duration::days(30);

        list.revoke(expiring("old", cutoff - Duration::seconds(1)))?;
        list.revoke(expiring("edge", cutoff))?;
        list.revoke(expiring("new", cutoff + Duration::days(1)))?;
        list.revoke(entry("forever"))?;

        let removed = list.prune_expired_before(cutoff)?;
        assert_eq!(removed, 1);
        assert!(!list.is_revoked("old"));
        assert!(list.is_revoked("edge"));
        assert!(list.is_revoked("new"));
        assert!(list.is_revoked("forever"));
        assert_eq!(list.version(), 5);

        assert_eq!(list.prune_expired_before(cutoff)?, 0);
        assert_eq!(list.version(), 5);
        Ok(())
    }

    #[test]
    fn prune_relative_to_now() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let list = open(&dir)?;
        list.revoke(expiring("ancient", Utc::now() - Duration::days(90)))?;
        list.revoke(expiring("recent", Utc::now() - Duration::days(1)))?;
        assert_eq!(list.prune(Duration::days(30))?, 1);
        assert!(list.is_revoked("recent"));
        Ok(())
    }

    #[test]
    fn prune_window_out_of_range() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let list = open(&dir)?;
        list.revoke(expiring("ancient", Utc::now() - Duration::days(365 * 100)))?;
        list.revoke(expiring("recent", Utc::now() - Duration::days(1)))?;
        assert_eq!(list.prune(Duration::days(u32::MAX.into()))?, 0);
        assert_eq!(list.prune(Duration::MAX)?, 0);
        assert_eq!(list.len(), 2);
        assert_eq!(list.version(), 2);
        Ok(())
    }

    // Readers run alongside revokes and merges, and a revocation once observed never disappears.
    #[test]
    fn concurrent_readers_and_writers() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let list = open(&dir)?;
        let fingerprints: Vec<String> = (0..40).map(|n| format!("{n:064x}")).collect();
        let (direct, gossiped) = fingerprints.split_at(20);
        let remote = RevocationListData {
            version: 7,
            updated_at: Utc::now(),
            entries: gossiped.iter().map(|fp| entry(fp)).collect(),
        };

        std::thread::scope(|scope| {
            for chunk in direct.chunks(5) {
                let list = &list;
                scope.spawn(move || {
                    for fingerprint in chunk {
                        list.revoke(entry(fingerprint)).expect("revoke should succeed");
                    }
                });
            }
            for _ in 0..2 {
                let (list, remote) = (&list, &remote);
                scope.spawn(move || list.merge(remote).expect("merge should succeed"));
            }
            for _ in 0..4 {
                let (list, fingerprints) = (&list, &fingerprints);
                scope.spawn(move || {
                    let mut seen = vec![false; fingerprints.len()];
                    for _ in 0..200 {
                        for (seen, fingerprint) in seen.iter_mut().zip(fingerprints) {
                            let revoked = list.is_revoked(fingerprint);
                            assert!(revoked || !*seen, "{fingerprint} was un-revoked");
                            *seen = revoked;
                        }
                    }
                });
            }
        });

        assert_eq!(list.len(), 40);
        assert!(fingerprints.iter().all(|fp| list.is_revoked(fp)));
        // 20 revokes plus exactly one merge that added something.
        assert_eq!(list.version(), 21);
        let reloaded = RevocationList::open(list.path())?;
        assert_eq!(reloaded.len(), 40);
        assert_eq!(reloaded.version(), 21);
        Ok(())
    }

    // A failed write must not leave a revocation that only exists in memory.
    #[test]
    fn failed_write_leaves_state_unchanged() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let list = RevocationList::open(dir.path().join("missing").join("revocation.json"))?;
        assert!(list.revoke(entry("aa")).is_err());
        assert!(!list.is_revoked("aa"));
        assert_eq!(list.version(), 0);
        Ok(())
    }

    #[test]
    fn list_orders_newest_first() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let list = open(&dir)?;
        let mut older = entry("aa");
        older.revoked_at = Utc::now() - Duration::hours(1);
        list.revoke(older)?;
        list.revoke(entry("bb"))?;
        let fingerprints: Vec<_> = list.list().into_iter().map(|e| e.fingerprint).collect();
        assert_eq!(fingerprints, ["bb", "aa"]);
        Ok(())
    }

    #[test]
    fn reason_names() -> Result<()> {
        for (reason, name) in RevocationReason::NAMES {
            assert_eq!(reason.to_string(), name);
            assert_eq!(name.parse::<RevocationReason>()?, reason);
            assert_eq!(serde_json::to_string(&reason)?, format!("\"{name}\""));
        }
        assert_eq!(
            "Key-Compromise".parse::<RevocationReason>()?,
            RevocationReason::KeyCompromise
        );
        assert!("stolen".parse::<RevocationReason>().is_err());
        Ok(())
    }

    fn snapshot(fingerprints: &BTreeSet<String>) -> RevocationListData {
        RevocationListData {
            version: 1,
            updated_at: Utc::now(),
            entries: fingerprints.iter().map(|fp| entry(fp)).collect(),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        // Merge order doesn't matter, and the count is the size of the set difference.
        #[test]
        fn merge_is_commutative(
            local in prop::collection::btree_set("[0-9a-f]{4}", 0..8),
            first in prop::collection::btree_set("[0-9a-f]{4}", 0..8),
            second in prop::collection::btree_set("[0-9a-f]{4}", 0..8),
        ) {
            let dir = tempfile::TempDir::new().unwrap();
            let forward = RevocationList::open(dir.path().join("forward.json")).unwrap();
            let backward = RevocationList::open(dir.path().join("backward.json")).unwrap();
            for fingerprint in &local {
                forward.revoke(entry(fingerprint)).unwrap();
                backward.revoke(entry(fingerprint)).unwrap();
            }

            let added = forward.merge(&snapshot(&first)).unwrap();
            prop_assert_eq!(added, first.difference(&local).count());
            forward.merge(&snapshot(&second)).unwrap();
            backward.merge(&snapshot(&second)).unwrap();
            backward.merge(&snapshot(&first)).unwrap();
            backward.merge(&snapshot(&first)).unwrap();

            let fingerprints = |list: &RevocationList| -> BTreeSet<String> {
                list.export().entries.into_iter().map(|e| e.fingerprint).collect()
            };
            let expected: BTreeSet<String> =
                local.iter().chain(&first).chain(&second).cloned().collect();
            prop_assert_eq!(fingerprints(&forward), expected.clone());
            prop_assert_eq!(fingerprints(&backward), expected);
        }
    }
}
