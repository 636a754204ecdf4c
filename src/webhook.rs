//! Build-status webhook.
//!
//! The build system calls back with `(buildId, status)`. The status update is
//! propagated to every row of that build and to every row it superseded; a
//! failure there is returned as a 500 so the build system retries delivery.
//! Notifications are best-effort: each eligible row gets at most one email,
//! tracked by `email_sent`, and a send failure only leaves the row unsent.

use anyhow::Result;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::context::PipelineContext;
use crate::db::{self, UnnotifiedBuild};
use crate::model::{BuildStatus, ReportedStatus};
use crate::notify::{PublishNotice, ResourceSummary};

pub const SECRET_HEADER: &str = "x-webhook-secret";

/// State shared with the webhook handler.
#[derive(Clone)]
pub struct WebhookState {
    pub ctx: PipelineContext,
    pub secret: Option<Arc<str>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatusPayload {
    pub build_id: String,
    pub status: ReportedStatus,
    /// Identifies the site's build project; only used for logging.
    #[serde(default)]
    pub project_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    /// Build rows whose status was written.
    pub updated: u64,
    /// Rows whose notification was accepted and marked sent.
    pub notified: usize,
    /// Rows whose notification was rejected and left unsent.
    pub failed: usize,
}

/// Build the axum router for webhook endpoints.
pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhooks/builds", post(handle_build_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_secret))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Rejects requests without the configured secret before the body is read.
async fn require_secret(
    State(state): State<WebhookState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.secret {
        let given = request
            .headers()
            .get(SECRET_HEADER)
            .map(|v| v.as_bytes())
            .unwrap_or_default();
        if !constant_time_eq(given, expected.as_bytes()) {
            warn!(path = %request.uri().path(), "webhook secret mismatch");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    next.run(request).await
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

async fn handle_build_status(
    State(state): State<WebhookState>,
    Json(payload): Json<BuildStatusPayload>,
) -> Response {
    info!(
        build_id = %payload.build_id,
        status = payload.status.as_str(),
        project = ?payload.project_name,
        "build status webhook received"
    );

    match reconcile(&state.ctx, &payload.build_id, payload.status).await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(err) => {
            error!(?err, build_id = %payload.build_id, "failed to update build status");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Write `status` onto the build (and what it superseded), then send the
/// outstanding notifications. Only the status write can fail the call.
pub async fn reconcile_build_status(
    ctx: &PipelineContext,
    build_id: &str,
    status: impl Into<ReportedStatus>,
) -> Result<ReconcileSummary> {
    reconcile(ctx, build_id, status.into()).await
}

#[instrument(skip_all, fields(build_id = %build_id, status = status.as_str()))]
async fn reconcile(
    ctx: &PipelineContext,
    build_id: &str,
    status: ReportedStatus,
) -> Result<ReconcileSummary> {
    if let ReportedStatus::Other(raw) = &status {
        info!(status = %raw, "storing unrecognised build status; no notification");
    }
    let updated = db::update_build_status(&ctx.pool, build_id, &status).await?;
    if updated == 0 {
        warn!("no build rows matched webhook");
    }

    let (notified, failed) = match notify_outcomes(ctx, build_id).await {
        Ok(counts) => counts,
        Err(err) => {
            error!(?err, "failed to send build notifications");
            (0, 0)
        }
    };

    Ok(ReconcileSummary {
        updated,
        notified,
        failed,
    })
}

enum Email {
    Success,
    Failure,
}

/// Which email, if any, a row in `status` is owed.
fn email_for(status: &ReportedStatus) -> Option<Email> {
    let ReportedStatus::Known(status) = status else {
        return None;
    };
    match status {
        BuildStatus::Succeeded => Some(Email::Success),
        BuildStatus::Failed => Some(Email::Failure),
        BuildStatus::Pending
        | BuildStatus::InProgress
        | BuildStatus::Fault
        | BuildStatus::TimedOut
        | BuildStatus::Stopped => None,
    }
}

async fn notify_outcomes(ctx: &PipelineContext, build_id: &str) -> Result<(usize, usize)> {
    let candidates = db::find_unnotified_builds(&ctx.pool, build_id).await?;

    let sends = candidates
        .iter()
        .filter(|row| ctx.emails_enabled(row.is_scheduled))
        .filter_map(|row| email_for(&row.status).map(|email| (row, email)))
        .map(|(row, email)| async move {
            let notice = notice_for(row);
            let sent = match email {
                Email::Success => ctx.notifier.send_success(&notice).await,
                Email::Failure => ctx.notifier.send_failure(&notice).await,
            };
            (row.id, sent)
        });

    let results = join_all(sends).await;

    let mut sent_ids = Vec::new();
    let mut failed = 0;
    for (row_id, sent) in results {
        match sent {
            Ok(()) => sent_ids.push(row_id),
            Err(err) => {
                failed += 1;
                warn!(?err, row_id, "build notification rejected; leaving unsent");
            }
        }
    }

    db::mark_emails_sent(&ctx.pool, &sent_ids).await?;
    Ok((sent_ids.len(), failed))
}

fn notice_for(row: &UnnotifiedBuild) -> PublishNotice {
    PublishNotice {
        recipient_email: row.recipient_email.clone(),
        is_scheduled: row.is_scheduled,
        resource: ResourceSummary {
            id: row.resource_id,
            site_id: row.site_id,
            title: row.resource_title.clone(),
        },
    }
}
