//! Client for the external static-site build system.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use tracing::{info, warn};

use crate::config;

/// What the build system needs to start a site build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteForBuild {
    pub site_id: i64,
    pub project: String,
}

#[async_trait]
pub trait BuildService: Send + Sync {
    /// Start a build and return the build system's id for it, if it assigned
    /// one synchronously.
    async fn start_build(&self, site: &SiteForBuild) -> Result<Option<String>>;
}

#[derive(Clone)]
pub struct BuildClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for BuildClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartBuildResponse {
    #[serde(default)]
    build_id: Option<String>,
}

impl BuildClient {
    pub fn new(base_url: Url, token: String) -> Result<Self> {
        let http = Client::builder()
            .user_agent("site-publisher/0.1")
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    pub fn from_config(cfg: &config::Build) -> Result<Self> {
        let base_url = Url::parse(&cfg.base_url).context("invalid build.base_url")?;
        Self::new(base_url, cfg.token.clone())
    }

    pub fn build_request(&self, site: &SiteForBuild) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(&format!("v1/projects/{}/builds", site.project))
            .context("invalid build system base URL")?;
        self.http
            .post(endpoint)
            .bearer_auth(&self.token)
            .json(&start_build_body(site))
            .build()
            .context("failed to build start-build request")
    }
}

pub fn start_build_body(site: &SiteForBuild) -> Value {
    json!({
        "siteId": site.site_id,
        "project": site.project,
    })
}

#[async_trait]
impl BuildService for BuildClient {
    async fn start_build(&self, site: &SiteForBuild) -> Result<Option<String>> {
        let request = self.build_request(site)?;
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach build system")?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            warn!(site_id = site.site_id, %status, "build system rejected start request");
            return Err(anyhow!("build system error {}: {}", status, body));
        }

        let payload: StartBuildResponse = res
            .json()
            .await
            .context("invalid build system response JSON")?;
        info!(
            site_id = site.site_id,
            project = %site.project,
            build_id = ?payload.build_id,
            "started site build"
        );
        Ok(payload.build_id.filter(|id| !id.trim().is_empty()))
    }
}
