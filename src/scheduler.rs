//! Scheduled publishing: the recurring job that publishes every resource whose
//! publish time has arrived and starts one build per affected site.
//!
//! ```text
//! cron tick
//!   └─► take lease (job_locks)         skipped if another instance holds it
//!         └─► find_due_resources(cutoff)
//!               ├─► publish::execute   one resource at a time
//!               ├─► site_build::publish_site   once per site with a new version
//!               └─► clear_schedule(cutoff)     always
//!         └─► release lease, ping heartbeat
//! ```

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Url};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config;
use crate::context::PipelineContext;
use crate::db::{self, DueResource, PublishError};
use crate::notify::{self, PublishNotice, ResourceSummary};
use crate::publish::{self, PublishOutcome};
use crate::site_build::{self, PublishedResource};

/// Lease key guaranteeing one running tick across every process sharing the
/// database.
pub const JOB_KEY: &str = "scheduled-publishing";

/// Resources that got a new Version in one tick, keyed by site.
pub type PublishedBySite = BTreeMap<i64, Vec<PublishedResource>>;

#[derive(Debug, Clone)]
pub struct Heartbeat {
    http: Client,
    url: Url,
}

impl Heartbeat {
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url).context("invalid heartbeat url")?;
        let http = Client::builder()
            .user_agent("site-publisher/0.1")
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, url })
    }

    async fn ping(&self) {
        match self.http.get(self.url.clone()).send().await {
            Ok(res) if res.status().is_success() => {}
            Ok(res) => warn!(status = %res.status(), "heartbeat ping rejected"),
            Err(err) => warn!(?err, "heartbeat ping failed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobOptions {
    pub lock_ttl: Duration,
    pub heartbeat: Option<Heartbeat>,
}

impl JobOptions {
    pub fn from_config(cfg: &config::Scheduler) -> Result<Self> {
        let heartbeat = cfg
            .heartbeat_url
            .as_deref()
            .map(Heartbeat::new)
            .transpose()?;
        let lock_ttl = i64::try_from(cfg.lock_ttl_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .ok_or_else(|| anyhow!("scheduler.lock_ttl_seconds out of range"))?;
        Ok(Self {
            lock_ttl,
            heartbeat,
        })
    }
}

/// Register the scheduled publishing job and start the cron scheduler.
pub async fn start_scheduler(ctx: PipelineContext, cfg: &config::Scheduler) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;
    let opts = Arc::new(JobOptions::from_config(cfg)?);

    let job = Job::new_async(cfg.cron.as_str(), move |_uuid, _lock| {
        let ctx = ctx.clone();
        let opts = opts.clone();
        Box::pin(async move {
            if let Err(err) = run_scheduled_publishing(&ctx, &opts).await {
                error!(?err, "scheduled publishing tick failed");
            }
        })
    })?;

    scheduler.add(job).await?;
    scheduler.start().await?;

    info!(cron = %cfg.cron, "scheduled publishing started");
    Ok(scheduler)
}

/// One guarded tick: take the lease, run, release, ping the heartbeat.
/// Returns `None` when another instance held the lease.
#[instrument(skip_all, fields(run_id = %Uuid::new_v4()))]
pub async fn run_scheduled_publishing(
    ctx: &PipelineContext,
    opts: &JobOptions,
) -> Result<Option<PublishedBySite>> {
    let holder = Uuid::new_v4().to_string();
    let cutoff = Utc::now();
    if !db::try_acquire_job_lock(&ctx.pool, JOB_KEY, &holder, opts.lock_ttl, cutoff).await? {
        info!("another instance holds the scheduled publishing lease; skipping tick");
        return Ok(None);
    }

    let result = run_tick(ctx, cutoff).await;

    if let Err(err) = db::release_job_lock(&ctx.pool, JOB_KEY, &holder).await {
        warn!(?err, "failed to release scheduled publishing lease");
    }

    let published = result?;
    if let Some(heartbeat) = &opts.heartbeat {
        heartbeat.ping().await;
    }
    Ok(Some(published))
}

/// Publish everything due at `cutoff`, build each affected site once, then
/// clear the schedule of every resource that was attempted.
#[instrument(skip_all, fields(cutoff = %cutoff))]
pub async fn run_tick(ctx: &PipelineContext, cutoff: DateTime<Utc>) -> Result<PublishedBySite> {
    let due = db::find_due_resources(&ctx.pool, cutoff).await?;

    let mut by_site: PublishedBySite = BTreeMap::new();
    for resource in &due {
        match publish::execute(&ctx.pool, resource.id, resource.scheduled_by).await {
            PublishOutcome::Published(version) => {
                by_site
                    .entry(resource.site_id)
                    .or_default()
                    .push(PublishedResource {
                        resource_id: resource.id,
                        site_id: resource.site_id,
                        title: resource.title.clone(),
                        user_id: resource.scheduled_by,
                        recipient_email: resource.scheduler_email.clone(),
                        version,
                    });
            }
            // Already live, e.g. published by a tick that died before
            // clearing the schedule.
            PublishOutcome::Failed(PublishError::AlreadyPublished(_)) => {
                info!(
                    resource_id = resource.id,
                    site_id = resource.site_id,
                    "scheduled resource already published; clearing schedule without notice"
                );
            }
            PublishOutcome::Failed(err) => {
                warn!(
                    ?err,
                    resource_id = resource.id,
                    site_id = resource.site_id,
                    "scheduled publish failed"
                );
                notify_publish_failure(ctx, resource).await;
            }
        }
    }

    for (site_id, resources) in &by_site {
        if let Err(err) = site_build::publish_site(ctx, *site_id, resources, true).await {
            error!(?err, site_id, "site build for scheduled publish failed");
        }
    }

    let cleared = db::clear_schedule(&ctx.pool, cutoff).await?;
    info!(
        due = due.len(),
        published = by_site.values().map(Vec::len).sum::<usize>(),
        sites = by_site.len(),
        cleared,
        "scheduled publishing tick complete"
    );
    Ok(by_site)
}

async fn notify_publish_failure(ctx: &PipelineContext, resource: &DueResource) {
    if !ctx.emails_enabled(true) {
        return;
    }
    let Some(email) = &resource.scheduler_email else {
        return;
    };
    let notice = PublishNotice {
        recipient_email: email.clone(),
        is_scheduled: true,
        resource: ResourceSummary {
            id: resource.id,
            site_id: resource.site_id,
            title: resource.title.clone(),
        },
    };
    notify::send_failure_logged(ctx.notifier.as_ref(), &notice).await;
}
