//! One external build per site for a set of freshly published resources.

use anyhow::{anyhow, Result};
use futures::future::join_all;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::build::SiteForBuild;
use crate::context::PipelineContext;
use crate::db::{self, CoveredResource, RecordedBuild};
use crate::model::Version;
use crate::notify::{self, PublishNotice, ResourceSummary};

/// A resource that got a new Version in this run, with whoever published it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedResource {
    pub resource_id: i64,
    pub site_id: i64,
    pub title: String,
    pub user_id: i64,
    pub recipient_email: Option<String>,
    pub version: Version,
}

impl PublishedResource {
    pub fn summary(&self) -> ResourceSummary {
        ResourceSummary {
            id: self.resource_id,
            site_id: self.site_id,
            title: self.title.clone(),
        }
    }
}

#[derive(Debug)]
pub enum SiteBuildOutcome {
    Started {
        build_id: Option<String>,
        recorded: RecordedBuild,
    },
    /// The build never started; every bundled resource was sent a failure
    /// notice (when enabled).
    StartFailed,
}

#[instrument(skip_all, fields(site_id = site_id, resources = resources.len(), is_scheduled = is_scheduled))]
pub async fn publish_site(
    ctx: &PipelineContext,
    site_id: i64,
    resources: &[PublishedResource],
    is_scheduled: bool,
) -> Result<SiteBuildOutcome> {
    if resources.is_empty() {
        return Err(anyhow!("site {} has no published resources to build", site_id));
    }

    let project = db::fetch_site(&ctx.pool, site_id)
        .await?
        .and_then(|site| site.build_project);
    let started = match project {
        Some(project) => {
            ctx.builds
                .start_build(&SiteForBuild { site_id, project })
                .await
        }
        None => Err(anyhow!("site {} has no build project", site_id)),
    };

    let build_id = match started {
        Ok(build_id) => build_id,
        Err(err) => {
            error!(?err, "failed to start site build");
            notify_start_failure(ctx, resources, is_scheduled).await;
            return Ok(SiteBuildOutcome::StartFailed);
        }
    };

    if build_id.is_none() {
        warn!("build system assigned no build id; rows cannot be reconciled by webhook");
    }

    let covered: Vec<CoveredResource> = resources
        .iter()
        .map(|r| CoveredResource {
            resource_id: r.resource_id,
            user_id: r.user_id,
        })
        .collect();
    let recorded =
        db::record_build(&ctx.pool, site_id, build_id.as_deref(), is_scheduled, &covered).await?;
    info!(
        build_id = ?build_id,
        rows = recorded.row_ids.len(),
        superseded = recorded.superseded,
        "recorded site build"
    );

    Ok(SiteBuildOutcome::Started { build_id, recorded })
}

async fn notify_start_failure(
    ctx: &PipelineContext,
    resources: &[PublishedResource],
    is_scheduled: bool,
) {
    if !ctx.emails_enabled(is_scheduled) {
        return;
    }
    let notices: Vec<PublishNotice> = resources
        .iter()
        .filter_map(|r| {
            r.recipient_email.as_ref().map(|email| PublishNotice {
                recipient_email: email.clone(),
                is_scheduled,
                resource: r.summary(),
            })
        })
        .collect();
    let sent = join_all(
        notices
            .iter()
            .map(|notice| notify::send_failure_logged(ctx.notifier.as_ref(), notice)),
    )
    .await;
    info!(
        attempted = sent.len(),
        accepted = sent.iter().filter(|ok| **ok).count(),
        "sent build-start failure notifications"
    );
}
