pub mod cleaner;
pub mod http_client;
pub mod parsers;

use crate::config::{ScraperConfig, WatcherDefaults};
use crate::error::WatchError;
use crate::models::{Candidate, CandidatePage, ListingIdentity, ListingRecord};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, info};

use self::cleaner::{id_from_url, normalize_search_url, parse_title_fields, price_per_m2};
use self::http_client::HttpClient;
use self::parsers::{SiteProfile, extract_candidates, parse_detail};

// ── Collaborator traits ───────────────────────────────────────────────────────

/// Raw page retrieval.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<String, WatchError>;
}

#[async_trait]
impl Fetcher for HttpClient {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<String, WatchError> {
        self.get_text(url, timeout).await
    }
}

/// What a poll cycle needs from the outside world: candidates from a search page and
/// full records for the ones it decides to emit.
#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn candidates(
        &self,
        url: &str,
        scan_limit: usize,
    ) -> Result<CandidatePage, WatchError>;

    async fn detail(&self, candidate: &Candidate) -> Result<ListingRecord, WatchError>;

    /// Reachability check used before a watcher is registered.
    async fn probe(&self, _url: &str) -> Result<(), WatchError> {
        Ok(())
    }
}

// ── HTML-scraping source ──────────────────────────────────────────────────────

pub struct ScrapingSource<F> {
    fetcher: F,
    search_timeout: Duration,
    detail_timeout: Duration,
    force_first_page: bool,
    cache_bust: bool,
}

impl ScrapingSource<HttpClient> {
    pub fn from_config(scraper: &ScraperConfig, watcher: &WatcherDefaults) -> anyhow::Result<Self> {
        Ok(Self::new(HttpClient::new(scraper)?, scraper, watcher))
    }
}

impl<F: Fetcher> ScrapingSource<F> {
    pub fn new(fetcher: F, scraper: &ScraperConfig, watcher: &WatcherDefaults) -> Self {
        Self {
            fetcher,
            search_timeout: Duration::from_secs(scraper.timeout_secs),
            detail_timeout: Duration::from_secs(scraper.detail_timeout_secs),
            force_first_page: watcher.force_first_page,
            cache_bust: watcher.cache_bust,
        }
    }

    fn search_url(&self, url: &str) -> String {
        let ts = self.cache_bust.then(|| Utc::now().timestamp());
        normalize_search_url(url, self.force_first_page, ts)
    }
}

/// Candidate for an arbitrary detail URL (used by on-demand analysis).
pub fn candidate_for_url(url: &str) -> Result<Candidate, WatchError> {
    Ok(Candidate {
        identity: ListingIdentity::new(id_from_url(url), None)?,
        url: url.to_string(),
        title: url.to_string(),
    })
}

#[async_trait]
impl<F: Fetcher> ListingSource for ScrapingSource<F> {
    async fn candidates(&self, url: &str, scan_limit: usize) -> Result<CandidatePage, WatchError> {
        let work = self.search_url(url);
        let html = self.fetcher.fetch(&work, self.search_timeout).await?;
        let page = extract_candidates(&html, &work, SiteProfile::for_url(url), scan_limit)?;
        debug!(
            "{}: {} candidates ({} on page)",
            url,
            page.candidates.len(),
            page.total_found
        );
        Ok(page)
    }

    async fn detail(&self, candidate: &Candidate) -> Result<ListingRecord, WatchError> {
        let html = self.fetcher.fetch(&candidate.url, self.detail_timeout).await?;
        let detail = parse_detail(&html, &candidate.url);
        let title = parse_title_fields(&candidate.title);

        let mut record = ListingRecord::from_candidate(candidate);
        record.price_czk = title.price_czk.or(detail.price_czk);
        record.area_m2 = title.area_m2.or(detail.area_m2);
        record.dispo = title.dispo.or(detail.dispo);
        record.locality = title.locality;
        record.price_per_m2 = detail
            .price_per_m2
            .or_else(|| price_per_m2(record.price_czk, record.area_m2));
        record.type_text = detail.type_text;
        record.address = detail.address;
        record.description = detail.description;
        record.features = detail.features;
        record.images = detail.images;
        Ok(record)
    }

    async fn probe(&self, url: &str) -> Result<(), WatchError> {
        self.fetcher
            .fetch(&self.search_url(url), self.search_timeout)
            .await?;
        info!("Reachable: {}", url);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serves canned pages by URL prefix and records what was requested.
    struct CannedFetcher {
        pages: HashMap<&'static str, &'static str>,
        requested: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Fetcher for CannedFetcher {
        async fn fetch(&self, url: &str, _timeout: Duration) -> Result<String, WatchError> {
            self.requested.lock().unwrap().push(url.to_string());
            self.pages
                .iter()
                .find(|(prefix, _)| url.starts_with(**prefix))
                .map(|(_, body)| body.to_string())
                .ok_or_else(|| WatchError::permanent_fetch(url, "HTTP 404 Not Found"))
        }
    }

    fn source(pages: HashMap<&'static str, &'static str>) -> ScrapingSource<CannedFetcher> {
        let watcher = WatcherDefaults {
            cache_bust: false,
            ..WatcherDefaults::default()
        };
        ScrapingSource::new(
            CannedFetcher {
                pages,
                requested: Mutex::new(Vec::new()),
            },
            &ScraperConfig::default(),
            &watcher,
        )
    }

    const SEARCH: &str = r#"<a href="/detail/pronajem/byt/2+kk/praha/3713540940"
        aria-label="Pronájem bytu 2+kk 54 m², Praha 9 - Kyje 25 000 Kč">x</a>"#;
    const DETAIL: &str = r#"<html><body><h1>Pronájem bytu 2+kk</h1>
        <div itemprop="description">Byt s balkónem, 3. patro.</div></body></html>"#;

    #[tokio::test]
    async fn test_candidates_fetch_normalized_url() {
        let src = source(HashMap::from([("https://www.sreality.cz/hledani", SEARCH)]));
        let page = src
            .candidates("https://www.sreality.cz/hledani/pronajem/byty", 300)
            .await
            .unwrap();

        assert_eq!(page.candidates.len(), 1);
        assert_eq!(page.candidates[0].identity.key(), "3713540940:25000");
        assert_eq!(
            src.fetcher.requested.lock().unwrap()[0],
            "https://www.sreality.cz/hledani/pronajem/byty?page=1"
        );
    }

    #[tokio::test]
    async fn test_detail_merges_title_and_page_fields() {
        let src = source(HashMap::from([
            ("https://www.sreality.cz/hledani", SEARCH),
            ("https://www.sreality.cz/detail", DETAIL),
        ]));
        let page = src
            .candidates("https://www.sreality.cz/hledani/pronajem/byty", 300)
            .await
            .unwrap();
        let record = src.detail(&page.candidates[0]).await.unwrap();

        assert_eq!(record.price_czk, Some(25_000));
        assert_eq!(record.dispo.as_deref(), Some("2+kk"));
        assert_eq!(record.locality.as_deref(), Some("Praha 9 - Kyje"));
        assert_eq!(record.price_per_m2, Some(463));
        assert_eq!(record.description.as_deref(), Some("Byt s balkónem, 3. patro."));
    }

    #[tokio::test]
    async fn test_missing_detail_is_an_error() {
        let src = source(HashMap::from([("https://www.sreality.cz/hledani", SEARCH)]));
        let page = src
            .candidates("https://www.sreality.cz/hledani/pronajem/byty", 300)
            .await
            .unwrap();
        assert!(src.detail(&page.candidates[0]).await.is_err());
    }

    #[test]
    fn test_candidate_for_url() {
        let url = "https://www.sreality.cz/detail/prodej/byt/3+1/brno/1234567";
        let c = candidate_for_url(url).unwrap();
        assert_eq!(c.identity.key(), "1234567");
    }
}
