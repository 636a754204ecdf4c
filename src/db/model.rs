//! View models returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use crate::model::ReportedStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A resource whose publish time has arrived, joined to the user who
/// scheduled it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DueResource {
    pub id: i64,
    pub site_id: i64,
    pub title: String,
    pub scheduled_at: DateTime<Utc>,
    pub scheduled_by: i64,
    pub scheduler_email: Option<String>,
}

/// One (resource, user) pair a build row is recorded for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoveredResource {
    pub resource_id: i64,
    pub user_id: i64,
}

/// Build row that has not produced a notification yet, with everything
/// needed to address one.
#[derive(Debug, Clone)]
pub struct UnnotifiedBuild {
    pub id: i64,
    pub status: ReportedStatus,
    pub is_scheduled: bool,
    pub recipient_email: String,
    pub resource_id: i64,
    pub site_id: i64,
    pub resource_title: String,
}

/// Outcome of recording a started build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedBuild {
    pub row_ids: Vec<i64>,
    pub superseded: u64,
}
