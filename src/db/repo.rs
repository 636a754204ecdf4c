use super::error::PublishError;
use super::model::{CoveredResource, DueResource, RecordedBuild, UnnotifiedBuild};
use crate::model::{
    Build, BuildStatus, ReportedStatus, Resource, ResourceState, ResourceType, Site, Version,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow, SqliteSynchronous};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::str::FromStr;
use tracing::{error, instrument};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {}", normalized))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    let pool = SqlitePool::connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{}", expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Editor-side writes
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn insert_user(pool: &Pool, email: Option<&str>) -> Result<i64> {
    let id: i64 = sqlx::query("INSERT INTO users (email) VALUES (?) RETURNING id")
        .bind(email)
        .fetch_one(pool)
        .await?
        .get("id");
    Ok(id)
}

#[instrument(skip_all)]
pub async fn insert_site(pool: &Pool, name: &str, build_project: Option<&str>) -> Result<i64> {
    let id: i64 = sqlx::query("INSERT INTO sites (name, build_project) VALUES (?, ?) RETURNING id")
        .bind(name)
        .bind(build_project)
        .fetch_one(pool)
        .await?
        .get("id");
    Ok(id)
}

/// Create a Draft resource together with its first draft blob.
#[instrument(skip_all)]
pub async fn insert_draft_resource(
    pool: &Pool,
    site_id: i64,
    parent_id: Option<i64>,
    title: &str,
    kind: ResourceType,
    content: &Value,
) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let blob_id: i64 = sqlx::query("INSERT INTO blobs (content) VALUES (?) RETURNING id")
        .bind(content.to_string())
        .fetch_one(&mut *tx)
        .await?
        .get("id");
    let id: i64 = sqlx::query(
        "INSERT INTO resources (site_id, parent_id, title, type, state, draft_blob_id) VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(site_id)
    .bind(parent_id)
    .bind(title)
    .bind(kind.as_str())
    .bind(ResourceState::Draft.as_str())
    .bind(blob_id)
    .fetch_one(&mut *tx)
    .await?
    .get("id");
    tx.commit().await?;
    Ok(id)
}

/// Attach a fresh draft blob and move the resource back to Draft. The
/// published version stays in place until the draft is published.
#[instrument(skip_all)]
pub async fn save_draft(pool: &Pool, resource_id: i64, content: &Value) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let blob_id: i64 = sqlx::query("INSERT INTO blobs (content) VALUES (?) RETURNING id")
        .bind(content.to_string())
        .fetch_one(&mut *tx)
        .await?
        .get("id");
    let updated = sqlx::query("UPDATE resources SET draft_blob_id = ?, state = ? WHERE id = ?")
        .bind(blob_id)
        .bind(ResourceState::Draft.as_str())
        .bind(resource_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if updated == 0 {
        return Err(anyhow!("resource {} not found", resource_id));
    }
    tx.commit().await?;
    Ok(blob_id)
}

#[instrument(skip_all)]
pub async fn schedule_resource(
    pool: &Pool,
    resource_id: i64,
    at: DateTime<Utc>,
    user_id: i64,
) -> Result<()> {
    let updated =
        sqlx::query("UPDATE resources SET scheduled_at = ?, scheduled_by = ? WHERE id = ?")
            .bind(at)
            .bind(user_id)
            .bind(resource_id)
            .execute(pool)
            .await?
            .rows_affected();
    if updated == 0 {
        return Err(anyhow!("resource {} not found", resource_id));
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn cancel_schedule(pool: &Pool, resource_id: i64) -> Result<()> {
    sqlx::query("UPDATE resources SET scheduled_at = NULL, scheduled_by = NULL WHERE id = ?")
        .bind(resource_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

pub async fn fetch_site(pool: &Pool, site_id: i64) -> Result<Option<Site>> {
    let row = sqlx::query("SELECT id, name, build_project FROM sites WHERE id = ?")
        .bind(site_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|row| Site {
        id: row.get("id"),
        name: row.get("name"),
        build_project: row
            .get::<Option<String>, _>("build_project")
            .filter(|s| !s.trim().is_empty()),
    }))
}

pub async fn fetch_resource(pool: &Pool, resource_id: i64) -> Result<Option<Resource>> {
    let row = sqlx::query(
        "SELECT id, site_id, parent_id, title, type, state, draft_blob_id, published_version_id, \
                scheduled_at, scheduled_by \
         FROM resources WHERE id = ?",
    )
    .bind(resource_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let kind_str: String = row.get("type");
    let kind = ResourceType::parse_type(&kind_str)
        .ok_or_else(|| anyhow!("resource {} has unknown type {}", resource_id, kind_str))?;
    let state_str: String = row.get("state");
    let state = ResourceState::parse_state(&state_str)
        .ok_or_else(|| anyhow!("resource {} has unknown state {}", resource_id, state_str))?;

    Ok(Some(Resource {
        id: row.get("id"),
        site_id: row.get("site_id"),
        parent_id: row.get("parent_id"),
        title: row.get("title"),
        kind,
        state,
        draft_blob_id: row.get("draft_blob_id"),
        published_version_id: row.get("published_version_id"),
        scheduled_at: row.get("scheduled_at"),
        scheduled_by: row.get("scheduled_by"),
    }))
}

pub async fn user_email(pool: &Pool, user_id: i64) -> Result<Option<String>> {
    let email: Option<Option<String>> =
        sqlx::query_scalar("SELECT email FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(pool)
            .await?;
    Ok(email.flatten())
}

pub async fn list_versions(pool: &Pool, resource_id: i64) -> Result<Vec<Version>> {
    let rows = sqlx::query(
        "SELECT id, resource_id, blob_id, version_num, published_at, published_by \
         FROM versions WHERE resource_id = ? ORDER BY version_num",
    )
    .bind(resource_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(version_from_row).collect())
}

pub async fn fetch_builds_for_site(pool: &Pool, site_id: i64) -> Result<Vec<Build>> {
    let rows = sqlx::query(
        "SELECT id, site_id, build_id, status, superseded_by_build_id, email_sent, is_scheduled, \
                resource_id, user_id, created_at \
         FROM code_build_jobs WHERE site_id = ? ORDER BY id",
    )
    .bind(site_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| Build {
            id: row.get("id"),
            site_id: row.get("site_id"),
            build_id: row.get("build_id"),
            status: ReportedStatus::from_stored(row.get("status")),
            superseded_by_build_id: row.get("superseded_by_build_id"),
            email_sent: row.get("email_sent"),
            is_scheduled: row.get("is_scheduled"),
            resource_id: row.get("resource_id"),
            user_id: row.get("user_id"),
            created_at: row.get("created_at"),
        })
        .collect())
}

fn version_from_row(row: &SqliteRow) -> Version {
    Version {
        id: row.get("id"),
        resource_id: row.get("resource_id"),
        blob_id: row.get("blob_id"),
        version_num: row.get("version_num"),
        published_at: row.get("published_at"),
        published_by: row.get("published_by"),
    }
}

// ---------------------------------------------------------------------------
// Scheduled publishing
// ---------------------------------------------------------------------------

/// Resources due at `cutoff`, oldest schedule first. Rows whose scheduler no
/// longer exists are logged and left out.
#[instrument(skip_all)]
pub async fn find_due_resources(pool: &Pool, cutoff: DateTime<Utc>) -> Result<Vec<DueResource>> {
    let rows = sqlx::query(
        "SELECT r.id, r.site_id, r.title, r.scheduled_at, r.scheduled_by, \
                u.id AS user_id, u.email \
         FROM resources r \
         LEFT JOIN users u ON u.id = r.scheduled_by \
         WHERE r.scheduled_at IS NOT NULL AND julianday(r.scheduled_at) <= julianday(?) \
         ORDER BY julianday(r.scheduled_at) ASC, r.id ASC",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    let mut due = Vec::with_capacity(rows.len());
    for row in rows {
        let id: i64 = row.get("id");
        let scheduled_by: Option<i64> = row.get("scheduled_by");
        let user_id: Option<i64> = row.get("user_id");
        let (Some(scheduled_by), Some(_)) = (scheduled_by, user_id) else {
            error!(
                resource_id = id,
                ?scheduled_by,
                "scheduled resource has no resolvable scheduling user; skipping"
            );
            continue;
        };
        due.push(DueResource {
            id,
            site_id: row.get("site_id"),
            title: row.get("title"),
            scheduled_at: row.get("scheduled_at"),
            scheduled_by,
            scheduler_email: row.get("email"),
        });
    }
    Ok(due)
}

/// Freeze the current draft into a new Version and flip the resource to
/// Published, all in one transaction.
#[instrument(skip_all, fields(resource_id = resource_id, user_id = user_id))]
pub async fn publish_resource(
    pool: &Pool,
    resource_id: i64,
    user_id: i64,
) -> Result<Version, PublishError> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query("SELECT state, draft_blob_id FROM resources WHERE id = ?")
        .bind(resource_id)
        .fetch_optional(&mut *tx)
        .await?;
    let Some(row) = row else {
        return Err(PublishError::NotFound(resource_id));
    };

    let state: String = row.try_get("state")?;
    let draft_blob_id: Option<i64> = row.try_get("draft_blob_id")?;
    let blob_id = match (ResourceState::parse_state(&state), draft_blob_id) {
        (Some(ResourceState::Published), _) | (_, None) => {
            return Err(PublishError::AlreadyPublished(resource_id));
        }
        (_, Some(blob_id)) => blob_id,
    };

    let version_num: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(version_num), 0) + 1 FROM versions WHERE resource_id = ?",
    )
    .bind(resource_id)
    .fetch_one(&mut *tx)
    .await?;

    let published_at = Utc::now();
    let row = sqlx::query(
        "INSERT INTO versions (resource_id, blob_id, version_num, published_at, published_by) \
         VALUES (?, ?, ?, ?, ?) \
         RETURNING id, resource_id, blob_id, version_num, published_at, published_by",
    )
    .bind(resource_id)
    .bind(blob_id)
    .bind(version_num)
    .bind(published_at)
    .bind(user_id)
    .fetch_one(&mut *tx)
    .await?;
    let version = version_from_row(&row);

    sqlx::query(
        "UPDATE resources SET state = ?, draft_blob_id = NULL, published_version_id = ? WHERE id = ?",
    )
    .bind(ResourceState::Published.as_str())
    .bind(version.id)
    .bind(resource_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(version)
}

/// Clear the scheduling pair of every resource due at `cutoff` whose
/// scheduler resolves to a user, i.e. every resource `find_due_resources`
/// handed out for this cutoff.
#[instrument(skip_all)]
pub async fn clear_schedule(pool: &Pool, cutoff: DateTime<Utc>) -> Result<u64> {
    let cleared = sqlx::query(
        "UPDATE resources SET scheduled_at = NULL, scheduled_by = NULL \
         WHERE scheduled_at IS NOT NULL AND julianday(scheduled_at) <= julianday(?) \
           AND scheduled_by IN (SELECT id FROM users)",
    )
    .bind(cutoff)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(cleared)
}

// ---------------------------------------------------------------------------
// Builds
// ---------------------------------------------------------------------------

/// Record a started build: supersede every other pending row of the site and
/// insert one pending row per covered resource.
#[instrument(skip_all, fields(site_id = site_id, build_id = ?build_id))]
pub async fn record_build(
    pool: &Pool,
    site_id: i64,
    build_id: Option<&str>,
    is_scheduled: bool,
    covered: &[CoveredResource],
) -> Result<RecordedBuild> {
    let mut tx = pool.begin().await?;

    let superseded = match build_id {
        Some(build_id) => sqlx::query(
            "UPDATE code_build_jobs SET superseded_by_build_id = ? \
             WHERE site_id = ? AND status = ? AND (build_id IS NULL OR build_id != ?)",
        )
        .bind(build_id)
        .bind(site_id)
        .bind(BuildStatus::Pending.as_str())
        .bind(build_id)
        .execute(&mut *tx)
        .await?
        .rows_affected(),
        None => 0,
    };

    let mut row_ids = Vec::with_capacity(covered.len());
    for c in covered {
        let id: i64 = sqlx::query(
            "INSERT INTO code_build_jobs (site_id, build_id, status, email_sent, is_scheduled, resource_id, user_id) \
             VALUES (?, ?, ?, 0, ?, ?, ?) RETURNING id",
        )
        .bind(site_id)
        .bind(build_id)
        .bind(BuildStatus::Pending.as_str())
        .bind(is_scheduled)
        .bind(c.resource_id)
        .bind(c.user_id)
        .fetch_one(&mut *tx)
        .await?
        .get("id");
        row_ids.push(id);
    }

    tx.commit().await?;
    Ok(RecordedBuild {
        row_ids,
        superseded,
    })
}

/// Set `status` on every row of `build_id` and on every row superseded by it.
/// Unmodelled statuses are stored as reported.
#[instrument(skip_all, fields(build_id = %build_id, status = status.as_str()))]
pub async fn update_build_status(
    pool: &Pool,
    build_id: &str,
    status: &ReportedStatus,
) -> Result<u64> {
    let updated = sqlx::query(
        "UPDATE code_build_jobs SET status = ? WHERE build_id = ? OR superseded_by_build_id = ?",
    )
    .bind(status.as_str())
    .bind(build_id)
    .bind(build_id)
    .execute(pool)
    .await
    .context("failed to update build status")?
    .rows_affected();
    Ok(updated)
}

/// Rows of `build_id` (or superseded by it) that still owe a notification:
/// not yet emailed, covering a Page, for a user with an email address.
#[instrument(skip_all, fields(build_id = %build_id))]
pub async fn find_unnotified_builds(pool: &Pool, build_id: &str) -> Result<Vec<UnnotifiedBuild>> {
    let rows = sqlx::query(
        "SELECT j.id, j.status, j.is_scheduled, j.resource_id, j.site_id, \
                r.title AS resource_title, u.email \
         FROM code_build_jobs j \
         JOIN resources r ON r.id = j.resource_id \
         JOIN users u ON u.id = j.user_id \
         WHERE (j.build_id = ? OR j.superseded_by_build_id = ?) \
           AND j.email_sent = 0 \
           AND r.type = ? \
           AND u.email IS NOT NULL \
         ORDER BY j.id",
    )
    .bind(build_id)
    .bind(build_id)
    .bind(ResourceType::Page.as_str())
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| UnnotifiedBuild {
            id: row.get("id"),
            status: ReportedStatus::from_stored(row.get("status")),
            is_scheduled: row.get("is_scheduled"),
            recipient_email: row.get("email"),
            resource_id: row.get("resource_id"),
            site_id: row.get("site_id"),
            resource_title: row.get("resource_title"),
        })
        .collect())
}

#[instrument(skip_all)]
pub async fn mark_emails_sent(pool: &Pool, row_ids: &[i64]) -> Result<u64> {
    if row_ids.is_empty() {
        return Ok(0);
    }
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new("UPDATE code_build_jobs SET email_sent = 1 WHERE id IN (");
    let mut separated = qb.separated(", ");
    for id in row_ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
    let updated = qb.build().execute(pool).await?.rows_affected();
    Ok(updated)
}

// ---------------------------------------------------------------------------
// Single-flight lease
// ---------------------------------------------------------------------------

/// Take the lease for `key` if it is free or expired. Returns whether
/// `holder` now owns it.
#[instrument(skip_all, fields(key = %key, holder = %holder))]
pub async fn try_acquire_job_lock(
    pool: &Pool,
    key: &str,
    holder: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<bool> {
    let expires_at = now
        .checked_add_signed(ttl)
        .ok_or_else(|| anyhow!("lease ttl {} overflows expiry for {}", ttl, key))?;
    let acquired = sqlx::query(
        "INSERT INTO job_locks (key, holder, expires_at) VALUES (?, ?, ?) \
         ON CONFLICT(key) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at \
         WHERE julianday(job_locks.expires_at) <= julianday(?)",
    )
    .bind(key)
    .bind(holder)
    .bind(expires_at)
    .bind(now)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(acquired == 1)
}

#[instrument(skip_all, fields(key = %key, holder = %holder))]
pub async fn release_job_lock(pool: &Pool, key: &str, holder: &str) -> Result<()> {
    sqlx::query("DELETE FROM job_locks WHERE key = ? AND holder = ?")
        .bind(key)
        .bind(holder)
        .execute(pool)
        .await?;
    Ok(())
}
