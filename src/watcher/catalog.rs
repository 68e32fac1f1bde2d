use crate::error::WatchError;
use crate::models::{ScopeId, WatcherConfig, WatcherOptions};
use crate::utils::atomic_write;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// On-disk form of one watcher, keyed by name in the catalog object.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogEntry {
    scope_ref: ScopeId,
    url: String,
    interval_sec: u64,
    #[serde(default)]
    options: WatcherOptions,
    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
}

/// JSON file `{ "<name>": { scope_ref, url, interval_sec, options, created_at }, ... }`.
/// Key order is the watchers' insertion order.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    path: PathBuf,
}

impl CatalogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Vec<WatcherConfig>, WatchError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(WatchError::io(&self.path, e)),
        };
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }

        let object: Map<String, Value> = serde_json::from_str(&raw).map_err(|e| {
            WatchError::InvalidConfig(format!("catalog {:?}: {}", self.path, e))
        })?;

        let mut configs = Vec::with_capacity(object.len());
        for (name, value) in object {
            let entry: CatalogEntry = serde_json::from_value(value).map_err(|e| {
                WatchError::InvalidConfig(format!("catalog entry `{}`: {}", name, e))
            })?;
            configs.push(WatcherConfig {
                name,
                url: entry.url,
                interval: Duration::from_secs(entry.interval_sec),
                scope: entry.scope_ref,
                options: entry.options,
                created_at: entry.created_at,
            });
        }
        debug!("Loaded {} watchers from {:?}", configs.len(), self.path);
        Ok(configs)
    }

    pub fn save(&self, configs: &[WatcherConfig]) -> Result<(), WatchError> {
        let mut object = Map::new();
        for c in configs {
            let entry = CatalogEntry {
                scope_ref: c.scope.clone(),
                url: c.url.clone(),
                interval_sec: c.interval.as_secs(),
                options: c.options.clone(),
                created_at: c.created_at,
            };
            let value = serde_json::to_value(entry)
                .map_err(|e| WatchError::InvalidConfig(e.to_string()))?;
            object.insert(c.name.clone(), value);
        }

        let body = serde_json::to_vec_pretty(&object)
            .map_err(|e| WatchError::InvalidConfig(e.to_string()))?;
        atomic_write(&self.path, &body).map_err(|e| WatchError::io(&self.path, e))
    }
}
