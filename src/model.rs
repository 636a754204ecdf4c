use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResourceState {
    Draft,
    Published,
}

impl ResourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::Draft => "Draft",
            ResourceState::Published => "Published",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "Draft" => Some(ResourceState::Draft),
            "Published" => Some(ResourceState::Published),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResourceType {
    RootPage,
    Page,
    Folder,
    Collection,
    CollectionPage,
    CollectionLink,
    IndexPage,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::RootPage => "RootPage",
            ResourceType::Page => "Page",
            ResourceType::Folder => "Folder",
            ResourceType::Collection => "Collection",
            ResourceType::CollectionPage => "CollectionPage",
            ResourceType::CollectionLink => "CollectionLink",
            ResourceType::IndexPage => "IndexPage",
        }
    }

    pub fn parse_type(s: &str) -> Option<Self> {
        match s {
            "RootPage" => Some(ResourceType::RootPage),
            "Page" => Some(ResourceType::Page),
            "Folder" => Some(ResourceType::Folder),
            "Collection" => Some(ResourceType::Collection),
            "CollectionPage" => Some(ResourceType::CollectionPage),
            "CollectionLink" => Some(ResourceType::CollectionLink),
            "IndexPage" => Some(ResourceType::IndexPage),
            _ => None,
        }
    }
}

/// Status reported by the external build system. Stored verbatim in
/// `code_build_jobs.status`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Fault,
    TimedOut,
    Stopped,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "PENDING",
            BuildStatus::InProgress => "IN_PROGRESS",
            BuildStatus::Succeeded => "SUCCEEDED",
            BuildStatus::Failed => "FAILED",
            BuildStatus::Fault => "FAULT",
            BuildStatus::TimedOut => "TIMED_OUT",
            BuildStatus::Stopped => "STOPPED",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(BuildStatus::Pending),
            "IN_PROGRESS" => Some(BuildStatus::InProgress),
            "SUCCEEDED" => Some(BuildStatus::Succeeded),
            "FAILED" => Some(BuildStatus::Failed),
            "FAULT" => Some(BuildStatus::Fault),
            "TIMED_OUT" => Some(BuildStatus::TimedOut),
            "STOPPED" => Some(BuildStatus::Stopped),
            _ => None,
        }
    }
}

/// A status as delivered by the build system. Values outside [`BuildStatus`]
/// are kept verbatim so the row still records what the build system said.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReportedStatus {
    Known(BuildStatus),
    Other(String),
}

impl ReportedStatus {
    pub fn from_stored(s: &str) -> Self {
        match BuildStatus::parse_status(s) {
            Some(status) => ReportedStatus::Known(status),
            None => ReportedStatus::Other(s.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ReportedStatus::Known(status) => status.as_str(),
            ReportedStatus::Other(raw) => raw,
        }
    }
}

impl From<BuildStatus> for ReportedStatus {
    fn from(status: BuildStatus) -> Self {
        ReportedStatus::Known(status)
    }
}

impl PartialEq<BuildStatus> for ReportedStatus {
    fn eq(&self, other: &BuildStatus) -> bool {
        matches!(self, ReportedStatus::Known(status) if status == other)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: i64,
    pub name: String,
    pub build_project: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: i64,
    pub site_id: i64,
    pub parent_id: Option<i64>,
    pub title: String,
    pub kind: ResourceType,
    pub state: ResourceState,
    pub draft_blob_id: Option<i64>,
    pub published_version_id: Option<i64>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub scheduled_by: Option<i64>,
}

/// Immutable publish record. One per successful publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub id: i64,
    pub resource_id: i64,
    pub blob_id: i64,
    pub version_num: i64,
    pub published_at: DateTime<Utc>,
    pub published_by: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: i64,
    pub site_id: i64,
    pub build_id: Option<String>,
    pub status: ReportedStatus,
    pub superseded_by_build_id: Option<String>,
    pub email_sent: bool,
    pub is_scheduled: bool,
    pub resource_id: i64,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
}
