use anyhow::{anyhow, Result};
use std::slice;
use tracing::{info, instrument, warn};

use crate::context::PipelineContext;
use crate::db::{self, Pool, PublishError};
use crate::model::Version;
use crate::site_build::{self, PublishedResource};

/// Result of one publish attempt. Batch callers branch on this instead of
/// handling errors.
#[derive(Debug)]
pub enum PublishOutcome {
    Published(Version),
    Failed(PublishError),
}

impl PublishOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, PublishOutcome::Published(_))
    }
}

#[instrument(skip_all, fields(resource_id = resource_id, user_id = user_id))]
pub async fn execute(pool: &Pool, resource_id: i64, user_id: i64) -> PublishOutcome {
    match db::publish_resource(pool, resource_id, user_id).await {
        Ok(version) => {
            info!(
                version_id = version.id,
                version_num = version.version_num,
                "published resource"
            );
            PublishOutcome::Published(version)
        }
        Err(err) => {
            match &err {
                PublishError::AlreadyPublished(_) => {
                    info!("resource has nothing to publish")
                }
                PublishError::NotFound(_) | PublishError::Database(_) => {
                    warn!(?err, "publish failed")
                }
            }
            PublishOutcome::Failed(err)
        }
    }
}

/// Editor-initiated publish: publish one resource now and, when a version was
/// created, start a non-scheduled build for its site.
#[instrument(skip_all, fields(resource_id = resource_id, user_id = user_id))]
pub async fn publish_now(
    ctx: &PipelineContext,
    resource_id: i64,
    user_id: i64,
) -> Result<PublishOutcome> {
    let outcome = execute(&ctx.pool, resource_id, user_id).await;
    if let PublishOutcome::Published(version) = &outcome {
        let resource = db::fetch_resource(&ctx.pool, resource_id)
            .await?
            .ok_or_else(|| anyhow!("resource {} vanished after publish", resource_id))?;
        let published = PublishedResource {
            resource_id,
            site_id: resource.site_id,
            title: resource.title,
            user_id,
            recipient_email: db::user_email(&ctx.pool, user_id).await?,
            version: version.clone(),
        };
        site_build::publish_site(ctx, published.site_id, slice::from_ref(&published), false)
            .await?;
    }
    Ok(outcome)
}
