#![allow(dead_code)]

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

use site_publisher::build::{BuildService, SiteForBuild};
use site_publisher::context::PipelineContext;
use site_publisher::db;
use site_publisher::flags::{FeatureFlags, EMAILS_FOR_PUBLISHES, EMAILS_FOR_SCHEDULED_PUBLISHES};
use site_publisher::model::ResourceType;
use site_publisher::notify::{Notifier, PublishNotice};

pub async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

#[derive(Default)]
pub struct FixedFlags {
    flags: std::sync::Mutex<BTreeMap<String, bool>>,
}

impl FixedFlags {
    pub fn all_on() -> Self {
        let flags = FixedFlags::default();
        flags.set(EMAILS_FOR_SCHEDULED_PUBLISHES, true);
        flags.set(EMAILS_FOR_PUBLISHES, true);
        flags
    }

    pub fn set(&self, key: &str, on: bool) {
        self.flags.lock().unwrap().insert(key.to_string(), on);
    }
}

impl FeatureFlags for FixedFlags {
    fn is_on(&self, key: &str) -> bool {
        self.flags.lock().unwrap().get(key).copied().unwrap_or(false)
    }
}

/// Build system fake. Pops queued responses; once empty, assigns
/// `build-1`, `build-2`, ...
#[derive(Clone, Default)]
pub struct RecordingBuilds {
    responses: Arc<Mutex<VecDeque<Result<Option<String>>>>>,
    calls: Arc<Mutex<Vec<SiteForBuild>>>,
}

impl RecordingBuilds {
    pub async fn push_response(&self, response: Result<Option<String>>) {
        self.responses.lock().await.push_back(response);
    }

    pub async fn calls(&self) -> Vec<SiteForBuild> {
        self.calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl BuildService for RecordingBuilds {
    async fn start_build(&self, site: &SiteForBuild) -> Result<Option<String>> {
        let mut calls = self.calls.lock().await;
        calls.push(site.clone());
        let n = calls.len();
        drop(calls);
        let mut responses = self.responses.lock().await;
        responses
            .pop_front()
            .unwrap_or_else(|| Ok(Some(format!("build-{}", n))))
    }
}

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    successes: Arc<Mutex<Vec<PublishNotice>>>,
    failures: Arc<Mutex<Vec<PublishNotice>>>,
    reject_for: Arc<Mutex<HashSet<i64>>>,
}

impl RecordingNotifier {
    /// Reject every send about `resource_id` until `accept` is called.
    pub async fn reject(&self, resource_id: i64) {
        self.reject_for.lock().await.insert(resource_id);
    }

    pub async fn accept(&self, resource_id: i64) {
        self.reject_for.lock().await.remove(&resource_id);
    }

    pub async fn successes(&self) -> Vec<PublishNotice> {
        self.successes.lock().await.clone()
    }

    pub async fn failures(&self) -> Vec<PublishNotice> {
        self.failures.lock().await.clone()
    }

    async fn record(
        &self,
        log: &Mutex<Vec<PublishNotice>>,
        notice: &PublishNotice,
    ) -> Result<()> {
        if self.reject_for.lock().await.contains(&notice.resource.id) {
            return Err(anyhow!("gateway rejected message"));
        }
        log.lock().await.push(notice.clone());
        Ok(())
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn send_success(&self, notice: &PublishNotice) -> Result<()> {
        self.record(&self.successes, notice).await
    }

    async fn send_failure(&self, notice: &PublishNotice) -> Result<()> {
        self.record(&self.failures, notice).await
    }
}

pub struct Harness {
    pub ctx: PipelineContext,
    pub flags: Arc<FixedFlags>,
    pub builds: RecordingBuilds,
    pub notifier: RecordingNotifier,
}

impl Harness {
    pub async fn new() -> Self {
        let pool = setup_pool().await;
        let flags = Arc::new(FixedFlags::all_on());
        let builds = RecordingBuilds::default();
        let notifier = RecordingNotifier::default();
        let ctx = PipelineContext::new(
            pool,
            flags.clone(),
            Arc::new(builds.clone()),
            Arc::new(notifier.clone()),
        );
        Self {
            ctx,
            flags,
            builds,
            notifier,
        }
    }

    pub fn pool(&self) -> &sqlx::SqlitePool {
        &self.ctx.pool
    }

    pub async fn user(&self, email: Option<&str>) -> i64 {
        db::insert_user(self.pool(), email).await.unwrap()
    }

    pub async fn site(&self, name: &str) -> i64 {
        db::insert_site(self.pool(), name, Some(&format!("{}-build", name)))
            .await
            .unwrap()
    }

    pub async fn page(&self, site_id: i64, title: &str) -> i64 {
        self.resource(site_id, title, ResourceType::Page).await
    }

    pub async fn resource(&self, site_id: i64, title: &str, kind: ResourceType) -> i64 {
        db::insert_draft_resource(
            self.pool(),
            site_id,
            None,
            title,
            kind,
            &json!({ "title": title, "content": [] }),
        )
        .await
        .unwrap()
    }

    /// Make every publish of `resource_id` fail inside the store transaction.
    pub async fn break_publishing_of(&self, resource_id: i64) {
        sqlx::query(&format!(
            "CREATE TRIGGER reject_version_{id} BEFORE INSERT ON versions \
             WHEN NEW.resource_id = {id} \
             BEGIN SELECT RAISE(ABORT, 'storage unavailable'); END",
            id = resource_id
        ))
        .execute(self.pool())
        .await
        .unwrap();
    }

    pub async fn version_count(&self, resource_id: i64) -> usize {
        db::list_versions(self.pool(), resource_id)
            .await
            .unwrap()
            .len()
    }
}
