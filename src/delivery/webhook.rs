use super::{Delivery, DeliveryTarget, format_listing};
use crate::error::WatchError;
use crate::models::ListingRecord;
use crate::watcher::cycle::CycleSummary;
use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    kind: &'static str,
    watcher: &'a str,
    scope: &'a str,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    listing: Option<&'a ListingRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<&'a CycleSummary>,
}

/// POSTs a JSON message per listing (and per notice) to a chat or automation endpoint.
pub struct WebhookDelivery {
    client: reqwest::Client,
    url: String,
}

impl WebhookDelivery {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build webhook client")?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    async fn post(&self, payload: &WebhookPayload<'_>) -> Result<(), WatchError> {
        let resp = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|e| WatchError::Delivery(format!("webhook: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(WatchError::Delivery(format!("webhook returned HTTP {}", status)));
        }
        debug!("webhook {} accepted {}", self.url, payload.kind);
        Ok(())
    }
}

#[async_trait]
impl Delivery for WebhookDelivery {
    async fn deliver(
        &self,
        target: &DeliveryTarget,
        record: &ListingRecord,
    ) -> Result<(), WatchError> {
        self.post(&WebhookPayload {
            kind: "listing",
            watcher: &target.watcher,
            scope: target.scope.as_str(),
            text: format_listing(record),
            listing: Some(record),
            summary: None,
        })
        .await
    }

    async fn deliver_summary(
        &self,
        target: &DeliveryTarget,
        summary: &CycleSummary,
    ) -> Result<(), WatchError> {
        if summary.emitted == 0 {
            return Ok(());
        }
        self.post(&WebhookPayload {
            kind: "summary",
            watcher: &target.watcher,
            scope: target.scope.as_str(),
            text: format!(
                "{} new of {} on the page ({} deferred)",
                summary.emitted, summary.total_found, summary.deferred
            ),
            listing: None,
            summary: Some(summary),
        })
        .await
    }

    async fn notice(&self, target: &DeliveryTarget, text: &str) -> Result<(), WatchError> {
        self.post(&WebhookPayload {
            kind: "notice",
            watcher: &target.watcher,
            scope: target.scope.as_str(),
            text: text.to_string(),
            listing: None,
            summary: None,
        })
        .await
    }
}
