use regex::Regex;
use std::sync::LazyLock;
use url::Url;

// ── Patterns ──────────────────────────────────────────────────────────────────

/// "2 000 000 Kč", "1\u{a0}500\u{a0}000 Kč", "25000 Kč". Separator groups must be exactly
/// three digits so "Praha 5 2 000 000 Kč" yields 2 000 000 rather than 52 000 000.
static PRICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d{1,3}(?:[ \u{a0}\u{202f}]\d{3})+|\d{4,})\s*Kč")
        .expect("price regex")
});

static PRICE_PER_M2_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d{1,3}(?:[ \u{a0}\u{202f}]\d{3})+|\d{4,})\s*Kč\s*/\s*m[²2]")
        .expect("price per m2 regex")
});

static AREA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+(?:[.,]\d+)?)\s*m[²2]").expect("area regex"));

static DISPO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d+\s*\+\s*(?:kk|\d))\b").expect("disposition regex")
});

static LISTING_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/(\d{6,})(?:$|[/?#-])").expect("listing id regex"));

// ── Numbers ───────────────────────────────────────────────────────────────────

fn strip_separators(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, ' ' | '\u{a0}' | '\u{202f}' | '\u{200b}'))
        .collect()
}

/// "1 234 567" → 1234567
pub fn clean_int(s: &str) -> Option<i64> {
    let cleaned = strip_separators(s).replace(',', "");
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

/// "54,5" → 54.5
pub fn clean_float(s: &str) -> Option<f64> {
    let cleaned = strip_separators(s).replace(',', ".");
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

pub fn find_price(text: &str) -> Option<i64> {
    PRICE_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| clean_int(m.as_str()))
}

pub fn find_price_per_m2(text: &str) -> Option<i64> {
    PRICE_PER_M2_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| clean_int(m.as_str()))
}

pub fn find_area(text: &str) -> Option<f64> {
    AREA_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| clean_float(m.as_str()))
}

pub fn find_dispo(text: &str) -> Option<String> {
    DISPO_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().chars().filter(|c| !c.is_whitespace()).collect())
}

pub fn price_per_m2(price: Option<i64>, area: Option<f64>) -> Option<i64> {
    match (price, area) {
        (Some(p), Some(a)) if p > 0 && a > 0.0 => Some((p as f64 / a).round() as i64),
        _ => None,
    }
}

// ── Title fields ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TitleFields {
    pub price_czk: Option<i64>,
    pub area_m2: Option<f64>,
    pub dispo: Option<String>,
    pub locality: Option<String>,
    pub price_per_m2: Option<i64>,
}

const TRIM_CHARS: &[char] = &[' ', ',', '–', '-', '\u{a0}'];

/// Best-effort parse of a search-result title such as
/// "Pronájem bytu 2+kk 54 m², Praha 9 - Kyje 25 000 Kč".
pub fn parse_title_fields(title: &str) -> TitleFields {
    let price_match = PRICE_RE.captures(title).and_then(|c| c.get(1));
    let price_czk = price_match.and_then(|m| clean_int(m.as_str()));
    let area_m2 = find_area(title);
    let dispo = find_dispo(title);

    let mut locality = None;
    if let Some(m) = price_match {
        let before_price = title[..m.start()].trim_matches(TRIM_CHARS);
        // locality sits between "<dispo> <area>" and the price
        if let Some(found) = DISPO_RE.find(before_price) {
            let after = before_price[found.end()..].trim_matches(TRIM_CHARS);
            let rest = match AREA_RE.find(after) {
                Some(area) => &after[area.end()..],
                None => after,
            };
            let rest = rest.trim_matches(TRIM_CHARS);
            if !rest.is_empty() {
                locality = Some(rest.to_string());
            }
        }
        if locality.is_none() {
            let parts: Vec<&str> = before_price.split(',').map(str::trim).collect();
            locality = if parts.len() >= 2 {
                Some(parts[1..].join(", "))
            } else if !before_price.is_empty() {
                Some(before_price.to_string())
            } else {
                None
            };
        }
    }

    TitleFields {
        price_czk,
        area_m2,
        dispo,
        locality,
        price_per_m2: price_per_m2(price_czk, area_m2),
    }
}

// ── URLs ──────────────────────────────────────────────────────────────────────

/// Numeric listing id from a detail URL (`.../123456789` or `/123456789-slug`).
/// Falls back to the whole URL so the id is never empty.
pub fn id_from_url(url: &str) -> String {
    LISTING_ID_RE
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| url.to_string())
}

/// Resolve `href` against `base` and drop the fragment.
pub fn absolutize(href: &str, base: &Url) -> Option<String> {
    let mut joined = base.join(href.trim()).ok()?;
    joined.set_fragment(None);
    Some(joined.to_string())
}

/// Add `page=1` when no page is selected and a `_ts` cache-buster, leaving existing
/// query keys (e.g. `plocha-do`) untouched.
/// Drops `_ts` cache-buster pairs from the query; everything else is kept byte for byte.
pub fn strip_cache_buster(url: &str) -> String {
    let url = url.trim();
    let (base, fragment) = match url.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (url, None),
    };
    let Some((path, query)) = base.split_once('?') else {
        return url.to_string();
    };

    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| *pair != "_ts" && !pair.starts_with("_ts="))
        .collect();
    let mut out = path.to_string();
    if !kept.is_empty() {
        out.push('?');
        out.push_str(&kept.join("&"));
    }
    if let Some(fragment) = fragment {
        out.push('#');
        out.push_str(fragment);
    }
    out
}

pub fn normalize_search_url(
    url: &str,
    force_first_page: bool,
    cache_bust_ts: Option<i64>,
) -> String {
    let url = strip_cache_buster(url);
    let url = url.as_str();
    let has_page = Url::parse(url)
        .map(|u| u.query_pairs().any(|(k, _)| k == "page"))
        .unwrap_or_else(|_| url.contains("page="));

    let mut out = url.to_string();
    let mut sep = if url.contains('?') { '&' } else { '?' };
    if force_first_page && !has_page {
        out.push(sep);
        out.push_str("page=1");
        sep = '&';
    }
    if let Some(ts) = cache_bust_ts {
        out.push(sep);
        out.push_str(&format!("_ts={}", ts));
    }
    out
}

/// Chat-pasted URL token → plain URL: `<https://x|label>`, `&amp;`, quotes, backticks.
pub fn unwrap_url_token(token: &str) -> String {
    let mut u = token.trim();
    if u.starts_with('<') && u.ends_with('>') && u.len() >= 2 {
        u = &u[1..u.len() - 1];
    }
    if let Some((head, _)) = u.split_once('|') {
        u = head;
    }
    let mut owned = u.replace("&amp;", "&");
    for quote in ['"', '\'', '`'] {
        if owned.len() >= 2 && owned.starts_with(quote) && owned.ends_with(quote) {
            owned = owned[1..owned.len() - 1].to_string();
        }
    }
    owned
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_numbers() {
        assert_eq!(clean_int("1 234\u{a0}567"), Some(1_234_567));
        assert_eq!(clean_int(""), None);
        assert_eq!(clean_float("54,5"), Some(54.5));
        assert_eq!(clean_float("abc"), None);
    }

    #[test]
    fn test_price_ignores_preceding_district_number() {
        assert_eq!(find_price("Praha 5 2 000 000 Kč"), Some(2_000_000));
        assert_eq!(find_price("25000 Kč/měsíc"), Some(25_000));
        assert_eq!(find_price("Cena na vyžádání"), None);
    }

    #[test]
    fn test_parse_title_fields() {
        let f = parse_title_fields("Pronájem bytu 2+kk 54 m², Praha 9 - Kyje 25 000 Kč");
        assert_eq!(f.price_czk, Some(25_000));
        assert_eq!(f.area_m2, Some(54.0));
        assert_eq!(f.dispo.as_deref(), Some("2+kk"));
        assert_eq!(f.locality.as_deref(), Some("Praha 9 - Kyje"));
        assert_eq!(f.price_per_m2, Some(463));
    }

    #[test]
    fn test_parse_title_without_price() {
        let f = parse_title_fields("Prodej bytu 3+1 78 m²");
        assert_eq!(f.price_czk, None);
        assert_eq!(f.dispo.as_deref(), Some("3+1"));
        assert_eq!(f.locality, None);
        assert_eq!(f.price_per_m2, None);
    }

    #[test]
    fn test_price_per_m2_from_text() {
        assert_eq!(find_price_per_m2("cena 120 500 Kč / m²"), Some(120_500));
    }

    #[test]
    fn test_id_from_url() {
        assert_eq!(
            id_from_url("https://www.sreality.cz/detail/pronajem/byt/2+kk/praha/3713540940"),
            "3713540940"
        );
        let bez = "https://www.bezrealitky.cz/nemovitosti-byty-domy/912345-nabidka-pronajem-bytu";
        assert_eq!(id_from_url(bez), "912345");
        assert_eq!(id_from_url("https://x.cz/a/b"), "https://x.cz/a/b");
    }

    #[test]
    fn test_normalize_search_url() {
        let u = "https://www.sreality.cz/hledani/pronajem/byty?plocha-do=60";
        assert_eq!(
            normalize_search_url(u, true, Some(1700000000)),
            "https://www.sreality.cz/hledani/pronajem/byty?plocha-do=60&page=1&_ts=1700000000"
        );
        assert_eq!(
            normalize_search_url("https://x.cz/s?page=3", true, None),
            "https://x.cz/s?page=3"
        );
        assert_eq!(normalize_search_url("https://x.cz/s", false, Some(5)), "https://x.cz/s?_ts=5");
        // a pasted URL that still carries an old buster gets a single fresh one
        assert_eq!(
            normalize_search_url("https://x.cz/s?_ts=1&a=1", false, Some(5)),
            "https://x.cz/s?a=1&_ts=5"
        );
    }

    #[test]
    fn test_strip_cache_buster() {
        assert_eq!(
            strip_cache_buster("https://x.cz/s?a=1&_ts=1700000000&b=2,3"),
            "https://x.cz/s?a=1&b=2,3"
        );
        assert_eq!(strip_cache_buster(" https://x.cz/s?_ts=1 "), "https://x.cz/s");
        assert_eq!(strip_cache_buster("https://x.cz/s?a=1#mapa"), "https://x.cz/s?a=1#mapa");
        assert_eq!(strip_cache_buster("https://x.cz/s?_tsx=1"), "https://x.cz/s?_tsx=1");
        assert_eq!(strip_cache_buster("https://x.cz/s"), "https://x.cz/s");
    }

    #[test]
    fn test_unwrap_url_token() {
        assert_eq!(
            unwrap_url_token("<https://x.cz/s?a=1&amp;b=2|Hledání>"),
            "https://x.cz/s?a=1&b=2"
        );
        assert_eq!(unwrap_url_token("`https://x.cz`"), "https://x.cz");
        assert_eq!(unwrap_url_token("\"https://x.cz\""), "https://x.cz");
    }

    #[test]
    fn test_absolutize_drops_fragment() {
        let base = Url::parse("https://www.sreality.cz/hledani/byty?page=1").unwrap();
        assert_eq!(
            absolutize("/detail/prodej/byt/1234567#foto", &base).as_deref(),
            Some("https://www.sreality.cz/detail/prodej/byt/1234567")
        );
    }
}
