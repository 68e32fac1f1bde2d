//! Registry actor: owns every watcher handle and the persisted catalog. Lifecycle
//! operations arrive as commands on one channel and are applied one at a time.

use crate::error::WatchError;
use crate::models::{ScopeId, WatcherConfig, WatcherOptions, validate_interval, validate_name};
use crate::scraper::cleaner::unwrap_url_token;
use crate::watcher::catalog::CatalogStore;
use crate::watcher::{WatcherContext, WatcherFailure, WatcherHandle, WatcherStatus, spawn};
use chrono::Utc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use url::Url;

/// Parameters of a new watcher. Unset fields fall back to config defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddRequest {
    pub name: String,
    pub url: String,
    pub interval: Option<Duration>,
    pub options: WatcherOptions,
}

#[derive(Debug, Clone)]
pub struct WatcherSummary {
    pub config: WatcherConfig,
    pub status: WatcherStatus,
}

enum RegistryCommand {
    Add {
        request: AddRequest,
        reply: oneshot::Sender<Result<WatcherConfig, WatchError>>,
    },
    Remove {
        name: String,
        reply: oneshot::Sender<Result<WatcherConfig, WatchError>>,
    },
    SetInterval {
        name: String,
        interval: Duration,
        reply: oneshot::Sender<Result<WatcherConfig, WatchError>>,
    },
    Rename {
        from: String,
        to: String,
        reply: oneshot::Sender<Result<WatcherConfig, WatchError>>,
    },
    List {
        reply: oneshot::Sender<Vec<WatcherSummary>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cloneable front door to the registry task.
#[derive(Clone)]
pub struct RegistryHandle {
    commands: mpsc::Sender<RegistryCommand>,
    ctx: WatcherContext,
}

impl RegistryHandle {
    /// Validate, optionally probe the URL, then register and start the watcher.
    pub async fn add(&self, mut request: AddRequest) -> Result<WatcherConfig, WatchError> {
        request.url = unwrap_url_token(&request.url);
        validate_name(&request.name)?;
        check_url(&request.url)?;
        if self.ctx.defaults.verify_url_on_add {
            // outside the actor so a slow site does not hold up other lifecycle calls
            self.ctx.source.probe(&request.url).await?;
        }
        self.call(|reply| RegistryCommand::Add { request, reply }).await?
    }

    /// Stop the watcher (after its in-flight cycle) and drop it from the catalog.
    /// Its seen-set file is kept.
    pub async fn remove(&self, name: &str) -> Result<WatcherConfig, WatchError> {
        let name = name.to_string();
        self.call(|reply| RegistryCommand::Remove { name, reply }).await?
    }

    pub async fn set_interval(
        &self,
        name: &str,
        interval: Duration,
    ) -> Result<WatcherConfig, WatchError> {
        let name = name.to_string();
        self.call(|reply| RegistryCommand::SetInterval {
            name,
            interval,
            reply,
        })
        .await?
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<WatcherConfig, WatchError> {
        let (from, to) = (from.to_string(), to.to_string());
        self.call(|reply| RegistryCommand::Rename { from, to, reply }).await?
    }

    /// Watchers in insertion order with their live status.
    pub async fn list(&self) -> Result<Vec<WatcherSummary>, WatchError> {
        self.call(|reply| RegistryCommand::List { reply }).await
    }

    /// Stop every watcher and end the registry task. The catalog is kept for the next start.
    pub async fn shutdown(&self) -> Result<(), WatchError> {
        self.call(|reply| RegistryCommand::Shutdown { reply }).await
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, WatchError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| WatchError::RegistryClosed)?;
        rx.await.map_err(|_| WatchError::RegistryClosed)
    }
}

fn check_url(raw: &str) -> Result<(), WatchError> {
    let url = Url::parse(raw)
        .map_err(|e| WatchError::InvalidConfig(format!("bad URL `{}`: {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(WatchError::InvalidConfig(format!(
            "URL `{}` must be http or https",
            raw
        )));
    }
    Ok(())
}

// ── Actor ─────────────────────────────────────────────────────────────────────

struct Entry {
    config: WatcherConfig,
    handle: WatcherHandle,
}

fn check_scope_free(entries: &[Entry], scope: &ScopeId) -> Result<(), WatchError> {
    match entries.iter().find(|e| e.config.scope == *scope) {
        Some(owner) => Err(WatchError::ScopeInUse {
            scope: scope.to_string(),
            owner: owner.config.name.clone(),
        }),
        None => Ok(()),
    }
}

/// A hand-edited catalog gets the same checks as `add`.
fn check_resumed(config: &WatcherConfig, resumed: &[Entry]) -> Result<(), WatchError> {
    validate_name(&config.name)?;
    validate_interval(config.interval)?;
    check_url(&config.url)?;
    check_scope_free(resumed, &config.scope)
}

struct Registry {
    ctx: WatcherContext,
    catalog: CatalogStore,
    entries: Vec<Entry>,
    commands: mpsc::Receiver<RegistryCommand>,
    failures_tx: mpsc::UnboundedSender<WatcherFailure>,
    failures_rx: mpsc::UnboundedReceiver<WatcherFailure>,
    reports: mpsc::UnboundedSender<WatcherFailure>,
}

/// Start the registry, resuming every watcher found in the catalog.
/// Fatal watcher failures are forwarded to `reports`.
pub fn start(
    ctx: WatcherContext,
    catalog: CatalogStore,
    reports: mpsc::UnboundedSender<WatcherFailure>,
) -> Result<RegistryHandle, WatchError> {
    let configs = catalog.load()?;
    let (commands_tx, commands_rx) = mpsc::channel(32);
    let (failures_tx, failures_rx) = mpsc::unbounded_channel();

    let mut entries: Vec<Entry> = Vec::with_capacity(configs.len());
    for config in configs {
        if let Err(e) = check_resumed(&config, &entries) {
            error!("Not resuming watcher {}: {}", config.name, e);
            continue;
        }
        info!("Resuming watcher {}", config.name);
        let handle = spawn(&config, ctx.clone(), failures_tx.clone());
        entries.push(Entry { config, handle });
    }

    let registry = Registry {
        ctx: ctx.clone(),
        catalog,
        entries,
        commands: commands_rx,
        failures_tx,
        failures_rx,
        reports,
    };
    tokio::spawn(registry.run());

    Ok(RegistryHandle {
        commands: commands_tx,
        ctx,
    })
}

impl Registry {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(RegistryCommand::Shutdown { reply }) => {
                        self.stop_all().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        self.stop_all().await;
                        break;
                    }
                },
                Some(failure) = self.failures_rx.recv() => {
                    error!("Watcher {} failed: {}", failure.name, failure.error);
                    let _ = self.reports.send(failure);
                }
            }
        }
        info!("Registry stopped");
    }

    async fn handle(&mut self, command: RegistryCommand) {
        match command {
            RegistryCommand::Add { request, reply } => {
                let _ = reply.send(self.add(request));
            }
            RegistryCommand::Remove { name, reply } => {
                let _ = reply.send(self.remove(&name).await);
            }
            RegistryCommand::SetInterval {
                name,
                interval,
                reply,
            } => {
                let _ = reply.send(self.set_interval(&name, interval));
            }
            RegistryCommand::Rename { from, to, reply } => {
                let _ = reply.send(self.rename(&from, &to));
            }
            RegistryCommand::List { reply } => {
                let _ = reply.send(self.list());
            }
            RegistryCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn position(&self, name: &str) -> Result<usize, WatchError> {
        self.entries
            .iter()
            .position(|e| e.config.name == name)
            .ok_or_else(|| WatchError::NotFound(name.to_string()))
    }

    fn configs(&self) -> Vec<WatcherConfig> {
        self.entries.iter().map(|e| e.config.clone()).collect()
    }

    fn add(&mut self, request: AddRequest) -> Result<WatcherConfig, WatchError> {
        if self.entries.iter().any(|e| e.config.name == request.name) {
            return Err(WatchError::DuplicateName(request.name));
        }
        let interval = request
            .interval
            .unwrap_or_else(|| self.ctx.defaults.default_interval());
        validate_interval(interval)?;

        let scope = match request.options.scope.as_deref() {
            Some(explicit) => ScopeId::sanitized(explicit)?,
            None => ScopeId::for_url(&request.url),
        };
        check_scope_free(&self.entries, &scope)?;

        let config = WatcherConfig {
            name: request.name,
            url: request.url,
            interval,
            scope,
            options: request.options,
            created_at: Utc::now(),
        };
        let mut configs = self.configs();
        configs.push(config.clone());
        self.catalog.save(&configs)?;

        let handle = spawn(&config, self.ctx.clone(), self.failures_tx.clone());
        info!("Added watcher {} ({})", config.name, config.url);
        self.entries.push(Entry {
            config: config.clone(),
            handle,
        });
        Ok(config)
    }

    async fn remove(&mut self, name: &str) -> Result<WatcherConfig, WatchError> {
        let idx = self.position(name)?;
        let mut configs = self.configs();
        configs.remove(idx);
        if let Err(e) = self.catalog.save(&configs) {
            warn!("Catalog not updated, watcher {} keeps running: {}", name, e);
            return Err(e);
        }

        let entry = self.entries.remove(idx);
        let status = entry.handle.stop().await;
        info!(
            "Removed watcher {} after {} cycles (seen-set kept for scope {})",
            name, status.cycles, entry.config.scope
        );
        Ok(entry.config)
    }

    fn set_interval(
        &mut self,
        name: &str,
        interval: Duration,
    ) -> Result<WatcherConfig, WatchError> {
        validate_interval(interval)?;
        let idx = self.position(name)?;

        let mut configs = self.configs();
        configs[idx].interval = interval;
        self.catalog.save(&configs)?;

        let entry = &mut self.entries[idx];
        entry.config.interval = interval;
        entry.handle.set_interval(interval);
        info!("Watcher {} now polls every {:?}", name, interval);
        Ok(entry.config.clone())
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<WatcherConfig, WatchError> {
        validate_name(to)?;
        let idx = self.position(from)?;
        if from == to {
            return Ok(self.entries[idx].config.clone());
        }
        if self.entries.iter().any(|e| e.config.name == to) {
            return Err(WatchError::DuplicateName(to.to_string()));
        }

        let mut configs = self.configs();
        configs[idx].name = to.to_string();
        self.catalog.save(&configs)?;

        let entry = &mut self.entries[idx];
        entry.config.name = to.to_string();
        entry.handle.rename(to);
        info!("Renamed watcher {} to {}", from, to);
        Ok(entry.config.clone())
    }

    fn list(&self) -> Vec<WatcherSummary> {
        self.entries
            .iter()
            .map(|e| WatcherSummary {
                config: e.config.clone(),
                status: e.handle.status(),
            })
            .collect()
    }

    async fn stop_all(&mut self) {
        for entry in &self.entries {
            entry.handle.request_stop();
        }
        for entry in self.entries.drain(..) {
            entry.handle.stop().await;
        }
    }
}
