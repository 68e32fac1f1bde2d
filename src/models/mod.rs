use crate::error::WatchError;
use crate::scraper::cleaner::strip_cache_buster;
use crate::utils::fnv1a64;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

// ── Listing identity ──────────────────────────────────────────────────────────

/// `(external_id, price)`. A price change yields a different identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListingIdentity {
    external_id: String,
    price: Option<i64>,
}

impl ListingIdentity {
    pub fn new(external_id: impl Into<String>, price: Option<i64>) -> Result<Self, WatchError> {
        let external_id = external_id.into().trim().to_string();
        if external_id.is_empty() {
            return Err(WatchError::Parse("listing id is empty".into()));
        }
        Ok(Self { external_id, price })
    }

    pub fn external_id(&self) -> &str {
        &self.external_id
    }

    pub fn price(&self) -> Option<i64> {
        self.price
    }

    /// Seen-set key: `"{id}:{price}"`, or the bare id when the price is unknown.
    pub fn key(&self) -> String {
        match self.price {
            Some(p) => format!("{}:{}", self.external_id, p),
            None => self.external_id.clone(),
        }
    }
}

impl fmt::Display for ListingIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

// ── Search page candidates ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub identity: ListingIdentity,
    pub url: String,
    pub title: String,
}

/// Candidates in page order (most recent first) plus the page's total link count.
#[derive(Debug, Clone, Default)]
pub struct CandidatePage {
    pub candidates: Vec<Candidate>,
    pub total_found: usize,
}

// ── Listing record ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListingRecord {
    pub identity: ListingIdentity,
    pub url: String,
    pub title: String,
    pub price_czk: Option<i64>,
    pub area_m2: Option<f64>,
    pub dispo: Option<String>,
    pub locality: Option<String>,
    pub price_per_m2: Option<i64>,
    pub type_text: Option<String>,
    pub address: Option<String>,
    pub description: Option<String>,
    pub features: Vec<String>,
    pub images: Vec<String>,
    pub scraped_at: NaiveDateTime,
}

impl ListingRecord {
    /// Record carrying only what the search page told us.
    pub fn from_candidate(candidate: &Candidate) -> Self {
        Self {
            identity: candidate.identity.clone(),
            url: candidate.url.clone(),
            title: candidate.title.clone(),
            price_czk: candidate.identity.price(),
            area_m2: None,
            dispo: None,
            locality: None,
            price_per_m2: None,
            type_text: None,
            address: None,
            description: None,
            features: Vec::new(),
            images: Vec::new(),
            scraped_at: Utc::now().naive_utc(),
        }
    }

    pub fn id(&self) -> &str {
        self.identity.external_id()
    }
}

// ── Scope ─────────────────────────────────────────────────────────────────────

/// Name of an isolated tracking context; doubles as the seen-set file stem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScopeId(String);

impl ScopeId {
    pub fn new(raw: &str) -> Result<Self, WatchError> {
        let valid = !raw.is_empty()
            && raw.len() <= 80
            && raw
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if !valid {
            return Err(WatchError::InvalidConfig(format!(
                "scope `{}` must match [a-z0-9_-]{{1,80}}",
                raw
            )));
        }
        Ok(Self(raw.to_string()))
    }

    /// Lowercases and replaces anything outside `[a-z0-9_-]` with `-`.
    pub fn sanitized(raw: &str) -> Result<Self, WatchError> {
        let cleaned: String = raw
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '-' })
            .take(80)
            .collect();
        Self::new(&cleaned)
    }

    /// Stable scope derived from the search URL, so the same search maps to the same seen-set.
    /// A leftover `_ts` cache-buster does not change the scope.
    pub fn for_url(url: &str) -> Self {
        let canonical = strip_cache_buster(url);
        Self(format!("scope-{:016x}", fnv1a64(canonical.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ScopeId {
    type Error = WatchError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<ScopeId> for String {
    fn from(value: ScopeId) -> Self {
        value.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Watcher configuration ─────────────────────────────────────────────────────

/// Per-watcher overrides; unset fields fall back to `[watcher]` config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatcherOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announce: Option<bool>,
    /// Platform-specific passthrough (e.g. a chat channel id).
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatcherConfig {
    pub name: String,
    pub url: String,
    pub interval: Duration,
    pub scope: ScopeId,
    pub options: WatcherOptions,
    pub created_at: DateTime<Utc>,
}

pub fn validate_name(name: &str) -> Result<(), WatchError> {
    let ok = (2..=32).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(WatchError::InvalidConfig(format!(
            "watcher name `{}` must match [a-z0-9_-]{{2,32}}",
            name
        )))
    }
}

pub fn validate_interval(interval: Duration) -> Result<(), WatchError> {
    if interval < Duration::from_secs(1) {
        return Err(WatchError::InvalidConfig(
            "poll interval must be at least 1 second".into(),
        ));
    }
    Ok(())
}
