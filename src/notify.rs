//! Notification gateway: templated publish-outcome emails.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use tracing::{info, warn};

use crate::config;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceSummary {
    pub id: i64,
    pub site_id: i64,
    pub title: String,
}

/// One publish-outcome message for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishNotice {
    pub recipient_email: String,
    pub is_scheduled: bool,
    pub resource: ResourceSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
}

impl Outcome {
    pub fn template(&self, is_scheduled: bool) -> &'static str {
        match (self, is_scheduled) {
            (Outcome::Succeeded, true) => "scheduled-publish-succeeded",
            (Outcome::Succeeded, false) => "publish-succeeded",
            (Outcome::Failed, true) => "scheduled-publish-failed",
            (Outcome::Failed, false) => "publish-failed",
        }
    }
}

/// Resolves on delivery acceptance, errors otherwise. Callers treat an error
/// as "not sent".
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_success(&self, notice: &PublishNotice) -> Result<()>;
    async fn send_failure(&self, notice: &PublishNotice) -> Result<()>;
}

#[derive(Clone)]
pub struct MailClient {
    http: Client,
    base_url: Url,
    token: String,
    from: String,
}

impl fmt::Debug for MailClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailClient")
            .field("base_url", &self.base_url)
            .field("from", &self.from)
            .finish_non_exhaustive()
    }
}

impl MailClient {
    pub fn new(base_url: Url, token: String, from: String) -> Result<Self> {
        let http = Client::builder()
            .user_agent("site-publisher/0.1")
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token,
            from,
        })
    }

    pub fn from_config(cfg: &config::Notifications) -> Result<Self> {
        let base_url = Url::parse(&cfg.base_url).context("invalid notifications.base_url")?;
        Self::new(base_url, cfg.token.clone(), cfg.from.clone())
    }

    pub fn build_request(&self, body: &Value) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join("v1/messages")
            .context("invalid notification gateway base URL")?;
        self.http
            .post(endpoint)
            .bearer_auth(&self.token)
            .json(body)
            .build()
            .context("failed to build notification request")
    }

    async fn send(&self, outcome: Outcome, notice: &PublishNotice) -> Result<()> {
        let body = build_message(&self.from, outcome, notice);
        let request = self.build_request(&body)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach notification gateway")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("notification gateway error {}: {}", status, body));
        }
        info!(
            resource_id = notice.resource.id,
            template = outcome.template(notice.is_scheduled),
            "notification accepted"
        );
        Ok(())
    }
}

pub fn build_message(from: &str, outcome: Outcome, notice: &PublishNotice) -> Value {
    json!({
        "from": from,
        "to": notice.recipient_email,
        "template": outcome.template(notice.is_scheduled),
        "variables": {
            "resourceId": notice.resource.id,
            "siteId": notice.resource.site_id,
            "title": notice.resource.title,
            "isScheduled": notice.is_scheduled,
        },
    })
}

#[async_trait]
impl Notifier for MailClient {
    async fn send_success(&self, notice: &PublishNotice) -> Result<()> {
        self.send(Outcome::Succeeded, notice).await
    }

    async fn send_failure(&self, notice: &PublishNotice) -> Result<()> {
        self.send(Outcome::Failed, notice).await
    }
}

/// Send a failure notice and swallow any error after logging it. Returns
/// whether the gateway accepted the message.
pub async fn send_failure_logged(notifier: &dyn Notifier, notice: &PublishNotice) -> bool {
    match notifier.send_failure(notice).await {
        Ok(()) => true,
        Err(err) => {
            warn!(
                ?err,
                resource_id = notice.resource.id,
                "failed to send failure notification"
            );
            false
        }
    }
}
