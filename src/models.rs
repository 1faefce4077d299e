use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A posting as returned by a scrape source, before deduplication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawPosting {
    pub source_url: Option<String>,
    pub title: String,
    pub company: String,
    pub location: Option<String>,
    pub site: String,
    pub description: Option<String>,
    pub job_type: Option<String>,
    pub is_remote: Option<bool>,
    pub min_amount: Option<f64>,
    pub max_amount: Option<f64>,
    pub salary_interval: Option<String>, // "yearly", "monthly", "hourly"
    pub date_posted: Option<DateTime<Utc>>,
}

/// A canonical stored posting. Immutable after insertion except `is_active`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Posting {
    pub id: i64,
    pub fingerprint: String,
    pub source_url: Option<String>,
    pub title: String,
    pub company: String,
    pub location: Option<String>,
    pub site: String,
    pub description: Option<String>,
    pub job_type: Option<String>,
    pub is_remote: Option<bool>,
    pub min_amount: Option<f64>,
    pub max_amount: Option<f64>,
    pub salary_interval: Option<String>,
    pub min_experience_years: Option<i64>,
    pub max_experience_years: Option<i64>,
    pub date_posted: Option<DateTime<Utc>>,
    pub date_scraped: DateTime<Utc>,
    pub is_active: bool,
}

/// A company or search scope that gets scraped on a recurring basis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: i64,
    pub name: String,
    pub preferred_sites: Vec<String>,
    pub search_terms: Vec<String>,
    pub location_filters: Vec<String>,
    pub last_scraped: Option<DateTime<Utc>>,
    pub total_jobs_found: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Scheduled,
    Manual,
    Targeted,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Scheduled => "scheduled",
            RunType::Manual => "manual",
            RunType::Targeted => "targeted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(RunType::Scheduled),
            "manual" => Some(RunType::Manual),
            "targeted" => Some(RunType::Targeted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

/// One fetch failure inside a run, kept so partial failures stay visible
/// after the run completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetFailure {
    pub target: String,
    pub error: String,
}

/// One scheduled, manual, or targeted scraping session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapingRun {
    pub id: i64,
    pub run_type: RunType,
    pub status: RunStatus,
    pub targets: Vec<String>,
    pub search_terms: Vec<String>,
    pub sites: Vec<String>,
    pub total_fetched: i64,
    pub new_added: i64,
    pub duplicates_skipped: i64,
    pub targets_succeeded: i64,
    pub targets_failed: i64,
    pub target_errors: Vec<TargetFailure>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ScrapingRun {
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Outcome of a single insert attempt. A duplicate is a normal, reportable
/// outcome, not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    DuplicateSkipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkInsertStats {
    pub inserted: usize,
    pub duplicates: usize,
    /// Postings dropped because they had nothing to fingerprint.
    pub invalid: usize,
}

/// Filters for searching the local store. All fields optional; the default
/// returns active postings only, newest scrape first.
#[derive(Debug, Clone, Default)]
pub struct PostingFilters {
    pub company: Option<String>,
    pub location: Option<String>,
    pub site: Option<String>,
    pub is_remote: Option<bool>,
    pub min_salary: Option<f64>,
    pub max_salary: Option<f64>,
    pub max_experience_years: Option<i64>,
    pub days_old: Option<i64>,
    pub include_inactive: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub enabled: bool,
    pub running: bool,
    pub schedule_time: String,
    pub active_targets: usize,
    pub default_search_terms: Vec<String>,
}
