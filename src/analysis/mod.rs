//! On-demand AI commentary on a single listing via an OpenAI-compatible chat API.

use crate::config::AnalysisConfig;
use crate::error::WatchError;
use crate::models::ListingRecord;
use crate::utils::fmt_number;
use anyhow::{Context, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

// ── Result schema ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisResult {
    pub overall_comment: String,
    pub price_assessment: PriceAssessment,
    pub red_flags: Vec<RedFlag>,
    pub missing_critical_info: Vec<MissingInfo>,
    pub comparison: Comparison,
    pub checklist_for_viewing: Vec<String>,
    /// Set when the model's reply was not the expected JSON.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceAssessment {
    /// `underpriced | fair | overpriced | unknown`
    pub verdict: String,
    pub comment: String,
    pub confidence: Option<f64>,
    pub price_per_m2_estimate: PricePerM2Estimate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricePerM2Estimate {
    pub listing_price_per_m2: Option<f64>,
    pub expected_range_min: Option<f64>,
    pub expected_range_max: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedFlag {
    pub label: String,
    pub severity: Option<f64>,
    pub source: String,
    pub comment: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MissingInfo {
    pub label: String,
    pub importance: Option<f64>,
    pub comment: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Comparison {
    pub segment: String,
    pub position: String,
    pub comment: String,
    pub key_pros: Vec<String>,
    pub key_cons: Vec<String>,
}

/// Parse a model reply; anything that is not the expected object is kept as `raw_output`.
pub fn parse_model_output(text: &str) -> AnalysisResult {
    match serde_json::from_str::<AnalysisResult>(text.trim()) {
        Ok(result) => result,
        Err(e) => {
            warn!("Model reply is not valid analysis JSON: {}", e);
            AnalysisResult {
                overall_comment: "The model reply could not be parsed.".to_string(),
                raw_output: Some(text.to_string()),
                ..AnalysisResult::default()
            }
        }
    }
}

// ── Analyzer ──────────────────────────────────────────────────────────────────

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(
        &self,
        record: &ListingRecord,
    ) -> Result<AnalysisResult, WatchError>;
}

const SYSTEM_PROMPT: &str = r#"You are an expert on the Czech residential property market.
You receive one apartment listing as JSON under `listing` and return a strict, technical,
realistic assessment. Use `description` and `raw_text` as the main text sources and infer
floor, building type, lift, cellar, balcony or terrace, furnishing, move-in date and
location quality from them. Do not list information as missing if the text states it.

Reply with valid JSON of exactly this shape:
{
  "overall_comment": "1-3 sentence summary",
  "price_assessment": {
    "verdict": "underpriced | fair | overpriced | unknown",
    "comment": "why",
    "confidence": 1-5,
    "price_per_m2_estimate": {
      "listing_price_per_m2": number or null,
      "expected_range_min": number or null,
      "expected_range_max": number or null
    }
  },
  "red_flags": [{"label": "", "severity": 1-5, "source": "listing_text | location_estimate | missing_info", "comment": ""}],
  "missing_critical_info": [{"label": "", "importance": 1-5, "comment": ""}],
  "comparison": {"segment": "", "position": "pricier | typical | cheaper | unknown", "comment": "", "key_pros": [], "key_cons": []},
  "checklist_for_viewing": ["short points to check at the viewing"]
}
Use null for numbers you cannot estimate and explain why in the comment."#;

#[derive(Serialize)]
struct ListingPayload<'a> {
    title: &'a str,
    url: &'a str,
    locality: Option<&'a str>,
    address: Option<&'a str>,
    price_czk: Option<i64>,
    area_m2: Option<f64>,
    dispo: Option<&'a str>,
    price_per_m2: Option<i64>,
    description: Option<&'a str>,
    raw_text: String,
}

impl<'a> ListingPayload<'a> {
    fn from_record(r: &'a ListingRecord) -> Self {
        let mut text = Vec::new();
        if let Some(d) = &r.description {
            text.push(d.clone());
        }
        if !r.features.is_empty() {
            text.push(r.features.join("\n"));
        }
        Self {
            title: &r.title,
            url: &r.url,
            locality: r.locality.as_deref(),
            address: r.address.as_deref(),
            price_czk: r.price_czk,
            area_m2: r.area_m2,
            dispo: r.dispo.as_deref(),
            price_per_m2: r.price_per_m2,
            description: r.description.as_deref(),
            raw_text: text.join("\n\n"),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiAnalyzer {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    timeout: Duration,
}

impl OpenAiAnalyzer {
    pub fn new(config: &AnalysisConfig) -> anyhow::Result<Self> {
        let Some(api_key) = config.api_key.clone() else {
            bail!("No API key found. Set OPENAI_API_KEY or analysis.api_key");
        };
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build analysis client")?;
        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    async fn complete(&self, record: &ListingRecord) -> Result<String, WatchError> {
        let user = serde_json::json!({ "listing": ListingPayload::from_record(record) });
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user.to_string(),
                },
            ],
            temperature: self.temperature,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| WatchError::Analysis(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WatchError::Analysis(format!("HTTP {}: {}", status, body)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| WatchError::Analysis(format!("unexpected response: {}", e)))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| WatchError::Analysis("empty completion".into()))
    }
}

#[async_trait]
impl Analyzer for OpenAiAnalyzer {
    async fn analyze(&self, record: &ListingRecord) -> Result<AnalysisResult, WatchError> {
        debug!("Analyzing {} with {}", record.url, self.model);
        let text = timeout(self.timeout, self.complete(record))
            .await
            .map_err(|_| WatchError::Timeout(self.timeout))??;
        Ok(parse_model_output(&text))
    }
}

// ── Formatting ────────────────────────────────────────────────────────────────

fn score(v: Option<f64>) -> String {
    v.map(|n| format!("{}", n)).unwrap_or_else(|| "?".into())
}

/// Plain-text report: summary, price verdict, worst three red flags, important gaps, checklist.
pub fn format_analysis(result: &AnalysisResult, record: &ListingRecord) -> String {
    let mut lines = vec![format!("Analysis: {} <{}>", record.title, record.url), String::new()];

    if !result.overall_comment.is_empty() {
        lines.push(format!("Summary: {}", result.overall_comment));
        lines.push(String::new());
    }

    let pa = &result.price_assessment;
    let verdict = if pa.verdict.is_empty() { "unknown" } else { &pa.verdict };
    lines.push(format!("Price: {} (confidence {}/5)", verdict, score(pa.confidence)));
    if !pa.comment.is_empty() {
        lines.push(format!("  {}", pa.comment));
    }
    let est = &pa.price_per_m2_estimate;
    if let (Some(min), Some(max)) = (est.expected_range_min, est.expected_range_max) {
        lines.push(format!(
            "  Expected {} to {} Kč/m²",
            fmt_number(min.round() as i64),
            fmt_number(max.round() as i64)
        ));
    }
    lines.push(String::new());

    if !result.red_flags.is_empty() {
        let mut flags: Vec<&RedFlag> = result.red_flags.iter().collect();
        flags.sort_by(|a, b| {
            b.severity
                .unwrap_or(0.0)
                .total_cmp(&a.severity.unwrap_or(0.0))
        });
        lines.push("Red flags:".into());
        for f in flags.into_iter().take(3) {
            lines.push(format!("• ({}/5) {}: {}", score(f.severity), f.label, f.comment));
        }
        lines.push(String::new());
    }

    let missing: Vec<&MissingInfo> = result
        .missing_critical_info
        .iter()
        .filter(|m| m.importance.unwrap_or(0.0) >= 3.0)
        .collect();
    if !missing.is_empty() {
        lines.push("Missing information:".into());
        for m in missing {
            lines.push(format!("• ({}/5) {}: {}", score(m.importance), m.label, m.comment));
        }
        lines.push(String::new());
    }

    if !result.checklist_for_viewing.is_empty() {
        lines.push("Viewing checklist:".into());
        for item in &result.checklist_for_viewing {
            lines.push(format!("• {}", item));
        }
    }

    if let Some(raw) = &result.raw_output {
        lines.push(format!("Raw model output:\n{}", raw));
    }

    lines.join("\n").trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::tests::record;

    const REPLY: &str = r#"{
        "overall_comment": "Solid flat, slightly pricey.",
        "price_assessment": {"verdict": "overpriced", "comment": "Above Kyje average.", "confidence": 4,
            "price_per_m2_estimate": {"listing_price_per_m2": 463, "expected_range_min": 380, "expected_range_max": 430}},
        "red_flags": [
            {"label": "Noise", "severity": 2, "source": "location_estimate", "comment": "Near rail"},
            {"label": "No lift", "severity": 4, "source": "listing_text", "comment": "5th floor"},
            {"label": "Deposit", "severity": 3, "source": "listing_text", "comment": "3 months"},
            {"label": "Old windows", "severity": 5, "source": "listing_text", "comment": "Single glazing"}
        ],
        "missing_critical_info": [
            {"label": "Energy class", "importance": 4, "comment": "Ask for PENB"},
            {"label": "Pets", "importance": 2, "comment": "Minor"}
        ],
        "comparison": {"segment": "2+kk Praha 9", "position": "pricier", "comment": "", "key_pros": [], "key_cons": []},
        "checklist_for_viewing": ["Check windows", "Ask about utilities"]
    }"#;

    #[test]
    fn test_parse_model_output() {
        let result = parse_model_output(REPLY);
        assert_eq!(result.price_assessment.verdict, "overpriced");
        assert_eq!(result.price_assessment.confidence, Some(4.0));
        assert_eq!(result.red_flags.len(), 4);
        assert!(result.raw_output.is_none());
    }

    #[test]
    fn test_unparseable_output_is_kept_raw() {
        let result = parse_model_output("Sorry, I cannot help with that.");
        assert_eq!(result.raw_output.as_deref(), Some("Sorry, I cannot help with that."));
        assert!(result.red_flags.is_empty());
    }

    #[test]
    fn test_partial_output_fills_defaults() {
        let result = parse_model_output(r#"{"overall_comment": "Fine."}"#);
        assert_eq!(result.overall_comment, "Fine.");
        assert!(result.checklist_for_viewing.is_empty());
        assert_eq!(result.price_assessment.confidence, None);
    }

    #[test]
    fn test_format_analysis_picks_worst_flags_and_important_gaps() {
        let text = format_analysis(&parse_model_output(REPLY), &record("1", Some(25_000)));

        assert!(text.contains("Price: overpriced (confidence 4/5)"));
        assert!(text.contains("Expected 380 to 430 Kč/m²"));
        assert!(text.contains("(5/5) Old windows"));
        assert!(text.contains("(4/5) No lift"));
        assert!(text.contains("(3/5) Deposit"));
        assert!(!text.contains("Noise"));
        assert!(text.contains("(4/5) Energy class"));
        assert!(!text.contains("Pets"));
        assert!(text.ends_with("• Ask about utilities"));

        let worst = text.find("Old windows").unwrap();
        let second = text.find("No lift").unwrap();
        assert!(worst < second);
    }

    #[test]
    fn test_analyzer_requires_api_key() {
        let config = AnalysisConfig {
            api_key: None,
            ..AnalysisConfig::default()
        };
        assert!(OpenAiAnalyzer::new(&config).is_err());
    }
}
