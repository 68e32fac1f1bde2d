//! Seen-set store: per-scope mapping of listing key → last-seen unix timestamp.
//!
//! On disk each scope is one JSON object `{"<id>:<price>": <unix_ts>, ...}` under
//! `seen_dir/<scope>.json`, replaced atomically on every persist.

use crate::error::WatchError;
use crate::models::{ListingIdentity, ScopeId};
use crate::utils::atomic_write;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// How long a seen entry suppresses re-delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlPolicy {
    /// Entries older than the duration are pruned and their listings become new again.
    Expire(Duration),
    /// Entries are never pruned.
    Never,
}

// ── SeenSet ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeenSet {
    entries: BTreeMap<String, f64>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy without entries where `now - last_seen > ttl`.
    pub fn pruned(&self, ttl: TtlPolicy, now: f64) -> SeenSet {
        let TtlPolicy::Expire(ttl) = ttl else {
            return self.clone();
        };
        let max_age = ttl.as_secs_f64();
        let entries = self
            .entries
            .iter()
            .filter(|(_, ts)| now - **ts <= max_age)
            .map(|(k, ts)| (k.clone(), *ts))
            .collect();
        SeenSet { entries }
    }

    pub fn is_new(&self, identity: &ListingIdentity) -> bool {
        !self.entries.contains_key(&identity.key())
    }

    /// Insert or refresh the identity's timestamp.
    pub fn record(&mut self, identity: &ListingIdentity, now: f64) {
        self.entries.insert(identity.key(), now);
    }

    pub fn last_seen(&self, identity: &ListingIdentity) -> Option<f64> {
        self.entries.get(&identity.key()).copied()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── SeenStore ─────────────────────────────────────────────────────────────────

/// File-backed durable form of the seen-sets, one file per scope.
#[derive(Debug, Clone)]
pub struct SeenStore {
    dir: PathBuf,
}

impl SeenStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, scope: &ScopeId) -> PathBuf {
        self.dir.join(format!("{}.json", scope))
    }

    /// Empty set when the scope has no state yet; `StoreCorrupt` when it cannot be parsed.
    pub fn load(&self, scope: &ScopeId) -> Result<SeenSet, WatchError> {
        let path = self.path_for(scope);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{}: no seen-set at {:?}, starting empty", scope, path);
                return Ok(SeenSet::new());
            }
            Err(e) => return Err(WatchError::io(path, e)),
        };

        let set: SeenSet =
            serde_json::from_str(&raw).map_err(|e| WatchError::StoreCorrupt {
                scope: scope.to_string(),
                message: format!("{:?}: {}", path, e),
            })?;
        debug!("{}: loaded {} seen entries", scope, set.len());
        Ok(set)
    }

    pub fn persist(&self, scope: &ScopeId, set: &SeenSet) -> Result<(), WatchError> {
        let path = self.path_for(scope);
        let body = serde_json::to_vec_pretty(set).map_err(|e| WatchError::StoreCorrupt {
            scope: scope.to_string(),
            message: e.to_string(),
        })?;
        atomic_write(&path, &body).map_err(|e| WatchError::io(&path, e))?;
        debug!("{}: persisted {} seen entries", scope, set.len());
        Ok(())
    }

    /// Number of entries currently persisted for `scope`, if readable.
    pub fn persisted_len(&self, scope: &ScopeId) -> Option<usize> {
        self.load(scope).ok().map(|s| s.len())
    }
}
