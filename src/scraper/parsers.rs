use crate::error::WatchError;
use crate::models::{Candidate, CandidatePage, ListingIdentity};
use crate::scraper::cleaner::{
    absolutize, find_area, find_dispo, find_price, find_price_per_m2, id_from_url,
    parse_title_fields,
};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::debug;
use url::Url;

// ── Site profiles ─────────────────────────────────────────────────────────────

static SREALITY_DETAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)/detail/").expect("sreality detail regex"));

static BEZREALITKY_DETAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)/nemovitosti-byty-domy/\d{6,}-").expect("bezrealitky detail regex")
});

/// Which portal a search URL belongs to; decides what counts as a detail link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteProfile {
    Sreality,
    Bezrealitky,
}

impl SiteProfile {
    pub fn for_url(url: &str) -> Self {
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_lowercase))
            .unwrap_or_default();
        if host.contains("bezrealitky") {
            Self::Bezrealitky
        } else {
            Self::Sreality
        }
    }

    pub fn is_detail_href(&self, href: &str) -> bool {
        match self {
            Self::Sreality => SREALITY_DETAIL.is_match(href),
            Self::Bezrealitky => BEZREALITKY_DETAIL.is_match(href),
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn element_text(el: &ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// First non-empty text among `selectors`, tried in order.
fn first_text(doc: &Html, selectors: &[&str]) -> Option<String> {
    selectors.iter().find_map(|css| {
        let sel = selector(css)?;
        doc.select(&sel)
            .map(|el| element_text(&el))
            .find(|t| !t.is_empty())
    })
}

/// First non-empty attribute value among `selectors`, tried in order.
fn first_attr(doc: &Html, selectors: &[&str], attr: &str) -> Option<String> {
    selectors.iter().find_map(|css| {
        let sel = selector(css)?;
        doc.select(&sel)
            .filter_map(|el| el.value().attr(attr))
            .map(str::trim)
            .find(|v| !v.is_empty())
            .map(str::to_string)
    })
}

// ── Search page ───────────────────────────────────────────────────────────────

/// Detail links on a search page, in page order, deduplicated by listing id.
/// `total_found` counts every unique detail link; at most `scan_limit` are returned.
pub fn extract_candidates(
    html: &str,
    base_url: &str,
    site: SiteProfile,
    scan_limit: usize,
) -> Result<CandidatePage, WatchError> {
    let base = Url::parse(base_url)
        .map_err(|e| WatchError::Parse(format!("bad base url {}: {}", base_url, e)))?;
    let doc = Html::parse_document(html);
    let a_sel = selector("a[href]")
        .ok_or_else(|| WatchError::Parse("anchor selector".into()))?;

    let mut seen_ids = HashSet::new();
    let mut page = CandidatePage::default();

    for a in doc.select(&a_sel) {
        let Some(href) = a.value().attr("href") else { continue };
        if !site.is_detail_href(href) {
            continue;
        }
        let Some(url) = absolutize(href, &base) else { continue };

        let id = id_from_url(&url);
        if !seen_ids.insert(id.clone()) {
            continue;
        }
        page.total_found += 1;
        if page.candidates.len() >= scan_limit {
            continue;
        }

        let title = a
            .value()
            .attr("aria-label")
            .or_else(|| a.value().attr("title"))
            .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| element_text(&a));
        let title = if title.is_empty() { url.clone() } else { title };

        let price = parse_title_fields(&title).price_czk;
        match ListingIdentity::new(id, price) {
            Ok(identity) => page.candidates.push(Candidate { identity, url, title }),
            Err(e) => debug!("Skipping anchor {}: {}", href, e),
        }
    }

    Ok(page)
}

// ── Detail page ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetailFields {
    pub type_text: Option<String>,
    pub address: Option<String>,
    pub description: Option<String>,
    pub features: Vec<String>,
    pub images: Vec<String>,
    pub price_czk: Option<i64>,
    pub area_m2: Option<f64>,
    pub dispo: Option<String>,
    pub price_per_m2: Option<i64>,
}

const MAX_FEATURES: usize = 10;
const MAX_IMAGES: usize = 15;
const IMAGE_NOISE: &[&str] = &["icon", "logo", "favicon", "placeholder", "spinner", "avatar"];
const IMAGE_EXTS: &[&str] = &[".jpg", ".jpeg", ".png", ".webp"];

/// Best-effort field extraction; every field is an ordered chain of strategies.
pub fn parse_detail(html: &str, page_url: &str) -> DetailFields {
    let doc = Html::parse_document(html);
    let body_text = selector("body")
        .and_then(|s| doc.select(&s).next().map(|b| element_text(&b)))
        .unwrap_or_default();

    let type_text = first_text(&doc, &["h1", "header h1", "[class*=title]", "[class*=badge]"]);
    let address = first_text(
        &doc,
        &[
            "[itemprop=address]",
            "[class*=address]",
            "[class*=location]",
            "[data-testid*=address]",
            "h2",
        ],
    );

    let description = first_text(&doc, &["[itemprop=description]", "[class*=description]"])
        .or_else(|| {
            first_attr(
                &doc,
                &["meta[property='og:description']", "meta[name=description]"],
                "content",
            )
        });

    DetailFields {
        type_text,
        address,
        description,
        features: parse_features(&doc),
        images: Url::parse(page_url)
            .map(|base| parse_images(&doc, &base))
            .unwrap_or_default(),
        price_czk: find_price(&body_text),
        area_m2: find_area(&body_text),
        dispo: find_dispo(&body_text),
        price_per_m2: find_price_per_m2(&body_text),
    }
}

fn parse_features(doc: &Html) -> Vec<String> {
    let strategies = [
        "[class*=amenit] li",
        "[class*=benefit] li",
        "[data-testid*=feature] li",
        "ul li",
    ];
    for css in strategies {
        let Some(sel) = selector(css) else { continue };
        let mut feats: Vec<String> = Vec::new();
        for li in doc.select(&sel) {
            let txt = element_text(&li);
            if txt.is_empty() || txt.chars().count() > 60 {
                continue;
            }
            if feats.iter().any(|f| f.eq_ignore_ascii_case(&txt)) {
                continue;
            }
            feats.push(txt);
        }
        if !feats.is_empty() {
            feats.truncate(MAX_FEATURES);
            return feats;
        }
    }
    Vec::new()
}

fn parse_images(doc: &Html, base: &Url) -> Vec<String> {
    let mut images: Vec<String> = Vec::new();

    if let Some(og) = first_attr(doc, &["meta[property='og:image']"], "content") {
        images.push(og);
    }

    let Some(img_sel) = selector("img") else { return images };
    for img in doc.select(&img_sel) {
        if images.len() >= MAX_IMAGES {
            break;
        }
        let attrs = img.value();
        let src = attrs
            .attr("src")
            .or_else(|| attrs.attr("data-src"))
            .or_else(|| attrs.attr("data-lazy-src"))
            .map(str::to_string)
            .or_else(|| {
                attrs
                    .attr("srcset")
                    .and_then(|s| s.split(',').next())
                    .and_then(|first| first.split_whitespace().next())
                    .map(str::to_string)
            });
        let Some(src) = src.filter(|s| !s.is_empty() && !s.starts_with("data:")) else {
            continue;
        };
        let Some(abs) = absolutize(&src, base) else { continue };

        let low = abs.to_lowercase();
        if IMAGE_NOISE.iter().any(|n| low.contains(n)) {
            continue;
        }
        if !IMAGE_EXTS.iter().any(|ext| low.contains(ext)) {
            continue;
        }
        if !images.contains(&abs) {
            images.push(abs);
        }
    }

    images
}

// ── Tests ─────────────────────────────────────────────────────────────────────
