//! Line-oriented operator commands for a running registry.

use crate::analysis::{Analyzer, format_analysis};
use crate::delivery::TsvLogDelivery;
use crate::error::WatchError;
use crate::models::{ScopeId, WatcherOptions};
use crate::stats;
use crate::scraper::cleaner::unwrap_url_token;
use crate::scraper::{ListingSource, candidate_for_url};
use crate::watcher::WatcherState;
use crate::watcher::registry::{AddRequest, RegistryHandle, WatcherSummary};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const HELP: &str = "\
Commands:
  add <name> <url> [--interval SECS] [--take N] [--scan N] [--scope S]
  remove <name>
  interval <name> <secs>
  rename <old> <new>
  list
  analyze <listing-url>
  stats <name|scope> [N]
  help
  quit";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Add(AddRequest),
    Remove(String),
    Interval { name: String, secs: u64 },
    Rename { from: String, to: String },
    List,
    Analyze(String),
    Stats {
        target: String,
        last: Option<usize>,
    },
    Help,
    Quit,
}

fn usage(text: &str) -> WatchError {
    WatchError::InvalidConfig(format!("usage: {}", text))
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: Option<&str>) -> Result<T, WatchError> {
    value
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| WatchError::InvalidConfig(format!("{} expects a number", flag)))
}

/// `Ok(None)` for blank lines and `#` comments.
pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>, WatchError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let mut words = line.split_whitespace();
    let verb = words.next().unwrap_or_default().to_lowercase();
    let args: Vec<&str> = words.collect();

    let command = match (verb.as_str(), args.as_slice()) {
        ("add", [name, url, rest @ ..]) => {
            let mut request = AddRequest {
                name: name.to_lowercase(),
                url: unwrap_url_token(url),
                interval: None,
                options: WatcherOptions::default(),
            };
            let mut flags = rest.iter().copied();
            while let Some(flag) = flags.next() {
                match flag {
                    "--interval" => {
                        request.interval =
                            Some(Duration::from_secs(parse_number(flag, flags.next())?))
                    }
                    "--take" => {
                        request.options.take_limit = Some(parse_number(flag, flags.next())?)
                    }
                    "--scan" => {
                        request.options.scan_limit = Some(parse_number(flag, flags.next())?)
                    }
                    "--scope" => {
                        request.options.scope = Some(
                            flags
                                .next()
                                .ok_or_else(|| usage("--scope <scope>"))?
                                .to_string(),
                        )
                    }
                    other => {
                        return Err(WatchError::InvalidConfig(format!("unknown flag {}", other)));
                    }
                }
            }
            ConsoleCommand::Add(request)
        }
        ("add", _) => {
            return Err(usage(
                "add <name> <url> [--interval SECS] [--take N] [--scan N] [--scope S]",
            ));
        }
        ("remove" | "rm", [name]) => ConsoleCommand::Remove(name.to_string()),
        ("remove" | "rm", _) => return Err(usage("remove <name>")),
        ("interval", [name, secs]) => ConsoleCommand::Interval {
            name: name.to_string(),
            secs: parse_number("interval", Some(*secs))?,
        },
        ("interval", _) => return Err(usage("interval <name> <secs>")),
        ("rename", [from, to]) => ConsoleCommand::Rename {
            from: from.to_string(),
            to: to.to_lowercase(),
        },
        ("rename", _) => return Err(usage("rename <old> <new>")),
        ("list" | "ls", []) => ConsoleCommand::List,
        ("analyze", [url]) => ConsoleCommand::Analyze(unwrap_url_token(url)),
        ("analyze", _) => return Err(usage("analyze <listing-url>")),
        ("stats", [target]) => ConsoleCommand::Stats {
            target: target.to_string(),
            last: None,
        },
        ("stats", [target, n]) => ConsoleCommand::Stats {
            target: target.to_string(),
            last: Some(parse_number("stats", Some(*n))?),
        },
        ("stats", _) => return Err(usage("stats <name|scope> [N]")),
        ("help" | "?", _) => ConsoleCommand::Help,
        ("quit" | "exit", _) => ConsoleCommand::Quit,
        _ => {
            return Err(WatchError::InvalidConfig(format!(
                "unknown command `{}`, try `help`",
                line
            )));
        }
    };
    Ok(Some(command))
}

// ── Execution ─────────────────────────────────────────────────────────────────

pub fn format_summaries(summaries: &[WatcherSummary]) -> String {
    if summaries.is_empty() {
        return "No watchers.".to_string();
    }
    summaries
        .iter()
        .map(|s| {
            let mut line = format!(
                "{:<16} every {:>5}s  {:<8} cycles {:<4} scope {}  {}",
                s.config.name,
                s.config.interval.as_secs(),
                format!("{:?}", s.status.state),
                s.status.cycles,
                s.config.scope,
                s.config.url
            );
            if let Some(c) = &s.status.last_cycle {
                line.push_str(&format!(
                    "\n{:<16} last: {} new of {}, {} deferred, {} seen",
                    "", c.emitted, c.total_found, c.deferred, c.seen_size
                ));
            }
            if let Some(e) = &s.status.last_error {
                let label = if s.status.state == WatcherState::Failed {
                    "FAILED"
                } else {
                    "error"
                };
                line.push_str(&format!("\n{:<16} {}: {}", "", label, e));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct Console {
    registry: RegistryHandle,
    source: Arc<dyn ListingSource>,
    analyzer: Option<Arc<dyn Analyzer>>,
    log_dir: PathBuf,
}

impl Console {
    pub fn new(
        registry: RegistryHandle,
        source: Arc<dyn ListingSource>,
        analyzer: Option<Arc<dyn Analyzer>>,
        log_dir: PathBuf,
    ) -> Self {
        Self {
            registry,
            source,
            analyzer,
            log_dir,
        }
    }

    /// A watcher name resolves to its scope; anything else must be a scope id.
    async fn scope_for(&self, target: &str) -> Result<ScopeId, WatchError> {
        let watchers = self.registry.list().await?;
        match watchers.into_iter().find(|s| s.config.name == target) {
            Some(s) => Ok(s.config.scope),
            None => ScopeId::new(target),
        }
    }

    /// Run one command and return the reply text. `Quit` is left to the caller.
    pub async fn execute(&self, command: ConsoleCommand) -> Result<String, WatchError> {
        match command {
            ConsoleCommand::Add(request) => {
                let c = self.registry.add(request).await?;
                Ok(format!(
                    "Watcher `{}` added: every {}s, scope {}",
                    c.name,
                    c.interval.as_secs(),
                    c.scope
                ))
            }
            ConsoleCommand::Remove(name) => {
                let c = self.registry.remove(&name).await?;
                Ok(format!("Watcher `{}` removed (seen history of {} kept)", c.name, c.scope))
            }
            ConsoleCommand::Interval { name, secs } => {
                let c = self
                    .registry
                    .set_interval(&name, Duration::from_secs(secs))
                    .await?;
                Ok(format!("Watcher `{}` now polls every {}s", c.name, c.interval.as_secs()))
            }
            ConsoleCommand::Rename { from, to } => {
                let c = self.registry.rename(&from, &to).await?;
                Ok(format!("Watcher `{}` renamed to `{}`", from, c.name))
            }
            ConsoleCommand::List => Ok(format_summaries(&self.registry.list().await?)),
            ConsoleCommand::Analyze(url) => {
                let Some(analyzer) = &self.analyzer else {
                    return Err(WatchError::Analysis("no API key configured".into()));
                };
                let record = self.source.detail(&candidate_for_url(&url)?).await?;
                let result = analyzer.analyze(&record).await?;
                Ok(format_analysis(&result, &record))
            }
            ConsoleCommand::Stats { target, last } => {
                let scope = self.scope_for(&target).await?;
                let path = TsvLogDelivery::path_for(&self.log_dir, &scope);
                let rows = stats::read_log(&path)
                    .map_err(|e| WatchError::Parse(format!("{:#}", e)))?;
                let rows = match last {
                    Some(n) => stats::last(&rows, n),
                    None => &rows[..],
                };
                Ok(stats::format_summary(&target, &stats::summarize(rows)))
            }
            ConsoleCommand::Help | ConsoleCommand::Quit => Ok(HELP.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatcherDefaults;
    use crate::seen::SeenStore;
    use crate::watcher::WatcherContext;
    use crate::watcher::catalog::CatalogStore;
    use crate::watcher::fakes::{FakeSource, RecordingDelivery, cand};
    use crate::watcher::registry;
    use tokio::sync::mpsc;

    #[test]
    fn test_parse_add_with_flags() {
        let cmd = parse_command(
            "add Praha-2kk <https://www.sreality.cz/hledani/pronajem/byty?a=1&amp;b=2|hledání> --interval 120 --take 5 --scope praha",
        )
        .unwrap()
        .unwrap();
        let ConsoleCommand::Add(req) = cmd else {
            panic!("expected add, got {:?}", cmd);
        };
        assert_eq!(req.name, "praha-2kk");
        assert_eq!(req.url, "https://www.sreality.cz/hledani/pronajem/byty?a=1&b=2");
        assert_eq!(req.interval, Some(Duration::from_secs(120)));
        assert_eq!(req.options.take_limit, Some(5));
        assert_eq!(req.options.scope.as_deref(), Some("praha"));
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(parse_command("  ").unwrap(), None);
        assert_eq!(parse_command("# note").unwrap(), None);
        assert_eq!(parse_command("list").unwrap(), Some(ConsoleCommand::List));
        assert_eq!(
            parse_command("interval byty 300").unwrap(),
            Some(ConsoleCommand::Interval {
                name: "byty".into(),
                secs: 300
            })
        );
        assert_eq!(
            parse_command("rename byty Byty-Praha").unwrap(),
            Some(ConsoleCommand::Rename {
                from: "byty".into(),
                to: "byty-praha".into()
            })
        );
        assert_eq!(
            parse_command("stats byty 20").unwrap(),
            Some(ConsoleCommand::Stats {
                target: "byty".into(),
                last: Some(20)
            })
        );
        assert_eq!(parse_command("QUIT").unwrap(), Some(ConsoleCommand::Quit));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_command("add onlyname").is_err());
        assert!(parse_command("interval byty soon").is_err());
        assert!(parse_command("add x https://x.cz --take").is_err());
        assert!(parse_command("add x https://x.cz --bogus 1").is_err());
        assert!(parse_command("stats").is_err());
        assert!(parse_command("stats byty many").is_err());
        assert!(parse_command("frobnicate").is_err());
    }

    #[tokio::test]
    async fn test_execute_against_registry() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::with_page(vec![cand("1", Some(1))]));
        let ctx = WatcherContext {
            source: source.clone(),
            delivery: Arc::new(RecordingDelivery::default()),
            store: SeenStore::new(dir.path().join("seen")),
            defaults: WatcherDefaults {
                announce: false,
                ..WatcherDefaults::default()
            },
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let catalog = CatalogStore::new(dir.path().join("w.json"));
        let handle = registry::start(ctx, catalog, tx).unwrap();
        let log_dir = dir.path().join("logs");
        let console = Console::new(handle.clone(), source, None, log_dir.clone());

        let run = |line: &str| parse_command(line).unwrap().unwrap();
        let added = console
            .execute(run("add byty https://www.sreality.cz/hledani/pronajem/byty"))
            .await
            .unwrap();
        assert!(added.starts_with("Watcher `byty` added: every 60s"));

        let scope = ScopeId::for_url("https://www.sreality.cz/hledani/pronajem/byty");
        std::fs::create_dir_all(&log_dir).unwrap();
        std::fs::write(
            TsvLogDelivery::path_for(&log_dir, &scope),
            "dt\tid\ttitle\turl\tdispo\tlocality\tarea_m2\tprice_czk\tprice_per_m2\n\
             2026-10-19 10:00:00\t1\tByt A\thttps://x.cz/1\t2+kk\tPraha 9\t50\t20000\t400\n\
             2026-10-19 10:05:00\t2\tByt B\thttps://x.cz/2\t1+kk\tPraha 8\t30\t15000\t500\n\
             2026-10-19 10:10:00\t3\tByt C\thttps://x.cz/3\t3+kk\tPraha 3\t70\t35000\t500\n",
        )
        .unwrap();
        let all = console.execute(run("stats byty")).await.unwrap();
        assert!(all.starts_with("Scope byty: 3 listings"));
        let recent = console.execute(run("stats byty 2")).await.unwrap();
        assert!(recent.contains("Price   : min 15,000  median 25,000"));
        let by_scope = console.execute(run(&format!("stats {}", scope))).await.unwrap();
        assert!(by_scope.contains("3 listings"));
        let empty = console.execute(run("stats elsewhere")).await.unwrap();
        assert!(empty.starts_with("Scope elsewhere: 0 listings"));
        assert!(console.execute(run("stats Not-A-Scope")).await.is_err());

        assert!(console.execute(run("interval nope 60")).await.is_err());
        console.execute(run("rename byty flats")).await.unwrap();
        let listing = console.execute(run("list")).await.unwrap();
        assert!(listing.starts_with("flats"));

        let err = console
            .execute(run("analyze https://www.sreality.cz/detail/x/1234567"))
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::Analysis(_)));

        console.execute(run("remove flats")).await.unwrap();
        assert_eq!(console.execute(run("list")).await.unwrap(), "No watchers.");
        handle.shutdown().await.unwrap();
    }
}
