use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use rusqlite::{Connection, params};

use crate::error::{Error, Result};
use crate::fingerprint;
use crate::models::{
    BulkInsertStats, InsertOutcome, Posting, PostingFilters, RawPosting, RunStatus, RunType,
    ScrapingRun, Target, TargetFailure,
};

/// Local store for postings, scrape targets, and scraping runs.
///
/// The connection sits behind a mutex so a scheduled run and a manual run can
/// share one handle; every operation takes the lock for its own duration only.
/// The UNIQUE constraint on `postings.fingerprint` is the storage-layer
/// backstop against duplicate inserts under concurrent writers.
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Database {
    pub fn open() -> Result<Self> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(&path)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
            path: None,
        };
        db.init()?;
        Ok(db)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn default_path() -> PathBuf {
        // Use XDG data directory or fallback
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "jobhound") {
            proj_dirs.data_dir().join("jobhound.db")
        } else {
            PathBuf::from("jobhound.db")
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    pub fn init(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS postings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                fingerprint TEXT NOT NULL UNIQUE,
                source_url TEXT,
                title TEXT NOT NULL,
                company TEXT NOT NULL,
                location TEXT,
                site TEXT NOT NULL,
                description TEXT,
                job_type TEXT,
                is_remote INTEGER,
                min_amount REAL,
                max_amount REAL,
                salary_interval TEXT,
                min_experience_years INTEGER,
                max_experience_years INTEGER,
                date_posted TEXT,
                date_scraped TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS targets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE COLLATE NOCASE,
                preferred_sites TEXT NOT NULL DEFAULT '[]',
                search_terms TEXT NOT NULL DEFAULT '[]',
                location_filters TEXT NOT NULL DEFAULT '[]',
                last_scraped TEXT,
                total_jobs_found INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS scraping_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                targets TEXT NOT NULL DEFAULT '[]',
                search_terms TEXT NOT NULL DEFAULT '[]',
                sites TEXT NOT NULL DEFAULT '[]',
                total_fetched INTEGER NOT NULL DEFAULT 0,
                new_added INTEGER NOT NULL DEFAULT 0,
                duplicates_skipped INTEGER NOT NULL DEFAULT 0,
                targets_succeeded INTEGER NOT NULL DEFAULT 0,
                targets_failed INTEGER NOT NULL DEFAULT 0,
                target_errors TEXT NOT NULL DEFAULT '[]',
                error TEXT,
                started_at TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_postings_company ON postings(company);
            CREATE INDEX IF NOT EXISTS idx_postings_scraped ON postings(date_scraped);
            CREATE INDEX IF NOT EXISTS idx_postings_active ON postings(is_active);
            CREATE INDEX IF NOT EXISTS idx_runs_status ON scraping_runs(status);
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='postings'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(Error::Config(
                "database not initialized, run 'jobhound init' first".to_string(),
            ));
        }
        Ok(())
    }

    // --- Posting operations ---

    /// Insert one raw posting, deduplicating by fingerprint. A duplicate is
    /// silently discarded, never merged into the stored record.
    pub fn insert_posting(&self, raw: &RawPosting) -> Result<InsertOutcome> {
        let fingerprint = fingerprint::fingerprint(raw)?;
        let (min_exp, max_exp) = raw
            .description
            .as_deref()
            .map(extract_experience_years)
            .unwrap_or((None, None));

        let changed = self.conn().execute(
            "INSERT OR IGNORE INTO postings (
                fingerprint, source_url, title, company, location, site,
                description, job_type, is_remote, min_amount, max_amount,
                salary_interval, min_experience_years, max_experience_years,
                date_posted, date_scraped
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                fingerprint,
                raw.source_url,
                raw.title,
                raw.company,
                raw.location,
                raw.site,
                raw.description,
                raw.job_type,
                raw.is_remote,
                raw.min_amount,
                raw.max_amount,
                raw.salary_interval,
                min_exp,
                max_exp,
                raw.date_posted,
                Utc::now(),
            ],
        )?;

        if changed == 0 {
            Ok(InsertOutcome::DuplicateSkipped)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    /// Insert a batch with partial-success semantics: an invalid posting is
    /// dropped and counted, and a storage failure surfaces without rolling
    /// back the inserts that already landed.
    pub fn bulk_insert(&self, raws: &[RawPosting]) -> Result<BulkInsertStats> {
        let mut stats = BulkInsertStats::default();
        for raw in raws {
            match self.insert_posting(raw) {
                Ok(InsertOutcome::Inserted) => stats.inserted += 1,
                Ok(InsertOutcome::DuplicateSkipped) => stats.duplicates += 1,
                Err(Error::InvalidPosting) => {
                    stats.invalid += 1;
                    tracing::warn!(
                        company = %raw.company,
                        title = %raw.title,
                        "dropping posting with nothing to fingerprint"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(stats)
    }

    /// Search stored postings. Returns the page plus the total match count.
    pub fn search_postings(&self, filters: &PostingFilters) -> Result<(Vec<Posting>, usize)> {
        let mut where_sql = String::from(" WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if !filters.include_inactive {
            where_sql.push_str(" AND is_active = 1");
        }
        if let Some(company) = &filters.company {
            where_sql.push_str(" AND company LIKE ?");
            args.push(Box::new(format!("%{}%", company)));
        }
        if let Some(location) = &filters.location {
            where_sql.push_str(" AND location LIKE ?");
            args.push(Box::new(format!("%{}%", location)));
        }
        if let Some(site) = &filters.site {
            where_sql.push_str(" AND site = ?");
            args.push(Box::new(site.clone()));
        }
        if let Some(remote) = filters.is_remote {
            where_sql.push_str(" AND is_remote = ?");
            args.push(Box::new(remote));
        }
        if let Some(min) = filters.min_salary {
            // A posting matches a bound if either stored amount satisfies it.
            where_sql.push_str(" AND (min_amount >= ? OR max_amount >= ?)");
            args.push(Box::new(min));
            args.push(Box::new(min));
        }
        if let Some(max) = filters.max_salary {
            where_sql.push_str(" AND (min_amount <= ? OR max_amount <= ?)");
            args.push(Box::new(max));
            args.push(Box::new(max));
        }
        if let Some(years) = filters.max_experience_years {
            where_sql.push_str(" AND (min_experience_years IS NULL OR min_experience_years <= ?)");
            args.push(Box::new(years));
        }
        if let Some(days) = filters.days_old {
            // Postings without a source-reported date stay included.
            where_sql.push_str(" AND (date_posted IS NULL OR date_posted >= ?)");
            args.push(Box::new(Utc::now() - Duration::days(days)));
        }

        let conn = self.conn();
        let total: usize = conn.query_row(
            &format!("SELECT COUNT(*) FROM postings{}", where_sql),
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |row| row.get::<_, i64>(0).map(|n| n as usize),
        )?;

        let limit = filters.limit.map(|l| l as i64).unwrap_or(-1);
        let sql = format!(
            "SELECT id, fingerprint, source_url, title, company, location, site,
                    description, job_type, is_remote, min_amount, max_amount,
                    salary_interval, min_experience_years, max_experience_years,
                    date_posted, date_scraped, is_active
             FROM postings{}
             ORDER BY date_scraped DESC, id ASC
             LIMIT {} OFFSET {}",
            where_sql, limit, filters.offset
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            Self::row_to_posting,
        )?;
        let postings = rows.collect::<std::result::Result<Vec<_>, _>>()?;

        Ok((postings, total))
    }

    pub fn get_posting_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Posting>> {
        let conn = self.conn();
        let result = conn.query_row(
            "SELECT id, fingerprint, source_url, title, company, location, site,
                    description, job_type, is_remote, min_amount, max_amount,
                    salary_interval, min_experience_years, max_experience_years,
                    date_posted, date_scraped, is_active
             FROM postings WHERE fingerprint = ?1",
            [fingerprint],
            Self::row_to_posting,
        );
        match result {
            Ok(posting) => Ok(Some(posting)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Soft-delete postings scraped before the cutoff. Idempotent: a second
    /// run with the same cutoff changes nothing.
    pub fn deactivate_older_than(&self, days: i64) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(days);
        let changed = self.conn().execute(
            "UPDATE postings SET is_active = 0 WHERE is_active = 1 AND date_scraped < ?1",
            params![cutoff],
        )?;
        Ok(changed)
    }

    fn row_to_posting(row: &rusqlite::Row) -> rusqlite::Result<Posting> {
        Ok(Posting {
            id: row.get(0)?,
            fingerprint: row.get(1)?,
            source_url: row.get(2)?,
            title: row.get(3)?,
            company: row.get(4)?,
            location: row.get(5)?,
            site: row.get(6)?,
            description: row.get(7)?,
            job_type: row.get(8)?,
            is_remote: row.get(9)?,
            min_amount: row.get(10)?,
            max_amount: row.get(11)?,
            salary_interval: row.get(12)?,
            min_experience_years: row.get(13)?,
            max_experience_years: row.get(14)?,
            date_posted: row.get(15)?,
            date_scraped: row.get(16)?,
            is_active: row.get(17)?,
        })
    }

    // --- Target operations ---

    pub fn register_target(
        &self,
        name: &str,
        sites: &[String],
        terms: &[String],
        locations: &[String],
    ) -> Result<Target> {
        let conn = self.conn();
        // The NOCASE collation on targets.name makes this case-insensitive.
        let existing: Option<i64> = conn
            .query_row("SELECT id FROM targets WHERE name = ?1", [name], |row| {
                row.get(0)
            })
            .ok();
        if existing.is_some() {
            return Err(Error::DuplicateTarget(name.to_string()));
        }

        conn.execute(
            "INSERT INTO targets (name, preferred_sites, search_terms, location_filters, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                name,
                serde_json::to_string(sites)?,
                serde_json::to_string(terms)?,
                serde_json::to_string(locations)?,
                Utc::now(),
            ],
        )?;
        drop(conn);

        self.get_target(name)?
            .ok_or_else(|| Error::UnknownTarget(name.to_string()))
    }

    pub fn get_target(&self, name: &str) -> Result<Option<Target>> {
        let conn = self.conn();
        let result = conn.query_row(
            "SELECT id, name, preferred_sites, search_terms, location_filters,
                    last_scraped, total_jobs_found, is_active, created_at
             FROM targets WHERE name = ?1",
            [name],
            Self::row_to_target,
        );
        match result {
            Ok(target) => Ok(Some(target)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_targets(&self, active_only: bool) -> Result<Vec<Target>> {
        let mut sql = String::from(
            "SELECT id, name, preferred_sites, search_terms, location_filters,
                    last_scraped, total_jobs_found, is_active, created_at
             FROM targets",
        );
        if active_only {
            sql.push_str(" WHERE is_active = 1");
        }
        sql.push_str(" ORDER BY name");

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::row_to_target)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Active targets that have never been scraped or whose last scrape is
    /// older than the staleness threshold. Never-scraped targets come first:
    /// NULL sorts before any value in ascending order.
    pub fn due_targets(&self, staleness_hours: i64) -> Result<Vec<Target>> {
        let cutoff = Utc::now() - Duration::hours(staleness_hours);
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, preferred_sites, search_terms, location_filters,
                    last_scraped, total_jobs_found, is_active, created_at
             FROM targets
             WHERE is_active = 1 AND (last_scraped IS NULL OR last_scraped < ?1)
             ORDER BY last_scraped ASC",
        )?;
        let rows = stmt.query_map(params![cutoff], Self::row_to_target)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Record a completed scrape for a target: bump `last_scraped` and add
    /// `found` to its running total.
    pub fn mark_scraped(&self, name: &str, found: i64, when: DateTime<Utc>) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE targets
             SET last_scraped = ?1, total_jobs_found = total_jobs_found + ?2
             WHERE name = ?3",
            params![when, found, name],
        )?;
        if changed == 0 {
            return Err(Error::UnknownTarget(name.to_string()));
        }
        Ok(())
    }

    /// Flip participation in scheduled runs. Never deletes, so history and
    /// counters survive deactivation.
    pub fn set_target_active(&self, name: &str, active: bool) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE targets SET is_active = ?1 WHERE name = ?2",
            params![active, name],
        )?;
        if changed == 0 {
            return Err(Error::UnknownTarget(name.to_string()));
        }
        Ok(())
    }

    pub fn count_active_targets(&self) -> Result<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM targets WHERE is_active = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn row_to_target(row: &rusqlite::Row) -> rusqlite::Result<Target> {
        Ok(Target {
            id: row.get(0)?,
            name: row.get(1)?,
            preferred_sites: json_list(row, 2)?,
            search_terms: json_list(row, 3)?,
            location_filters: json_list(row, 4)?,
            last_scraped: row.get(5)?,
            total_jobs_found: row.get(6)?,
            is_active: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    // --- Scraping run operations ---

    pub fn create_run(
        &self,
        run_type: RunType,
        targets: &[String],
        search_terms: &[String],
        sites: &[String],
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO scraping_runs (run_type, status, targets, search_terms, sites, created_at)
             VALUES (?1, 'pending', ?2, ?3, ?4, ?5)",
            params![
                run_type.as_str(),
                serde_json::to_string(targets)?,
                serde_json::to_string(search_terms)?,
                serde_json::to_string(sites)?,
                Utc::now(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Transition pending -> running and stamp `started_at`.
    pub fn start_run(&self, run_id: i64) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let status = run_status(&tx, run_id)?;
        if status != RunStatus::Pending {
            return Err(Error::AlreadyTerminal(run_id));
        }
        tx.execute(
            "UPDATE scraping_runs SET status = 'running', started_at = ?1 WHERE id = ?2",
            params![Utc::now(), run_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Fold one target's counters into the run aggregates. A present error
    /// marks that target's contribution as failed without failing the run.
    pub fn record_progress(
        &self,
        run_id: i64,
        target: &str,
        fetched: i64,
        inserted: i64,
        duplicates: i64,
        error: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let status = run_status(&tx, run_id)?;
        if status.is_terminal() {
            return Err(Error::AlreadyTerminal(run_id));
        }

        let errors_json: String =
            tx.query_row("SELECT target_errors FROM scraping_runs WHERE id = ?1", [run_id], |row| {
                row.get(0)
            })?;
        let mut errors: Vec<TargetFailure> = serde_json::from_str(&errors_json)?;

        let (succeeded, failed) = match error {
            Some(message) => {
                errors.push(TargetFailure {
                    target: target.to_string(),
                    error: message.to_string(),
                });
                (0, 1)
            }
            None => (1, 0),
        };

        tx.execute(
            "UPDATE scraping_runs
             SET total_fetched = total_fetched + ?1,
                 new_added = new_added + ?2,
                 duplicates_skipped = duplicates_skipped + ?3,
                 targets_succeeded = targets_succeeded + ?4,
                 targets_failed = targets_failed + ?5,
                 target_errors = ?6
             WHERE id = ?7",
            params![
                fetched,
                inserted,
                duplicates,
                succeeded,
                failed,
                serde_json::to_string(&errors)?,
                run_id
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Set the terminal status exactly once. A run is never reopened.
    pub fn finish_run(&self, run_id: i64, status: RunStatus, error: Option<&str>) -> Result<()> {
        debug_assert!(status.is_terminal());
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let current = run_status(&tx, run_id)?;
        if current.is_terminal() {
            return Err(Error::AlreadyTerminal(run_id));
        }
        tx.execute(
            "UPDATE scraping_runs SET status = ?1, completed_at = ?2, error = ?3 WHERE id = ?4",
            params![status.as_str(), Utc::now(), error, run_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_run(&self, run_id: i64) -> Result<ScrapingRun> {
        let conn = self.conn();
        let result = conn.query_row(
            "SELECT id, run_type, status, targets, search_terms, sites,
                    total_fetched, new_added, duplicates_skipped,
                    targets_succeeded, targets_failed, target_errors, error,
                    started_at, completed_at, created_at
             FROM scraping_runs WHERE id = ?1",
            [run_id],
            Self::row_to_run,
        );
        match result {
            Ok(run) => Ok(run),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(Error::UnknownRun(run_id)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_runs(&self, limit: usize) -> Result<Vec<ScrapingRun>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, run_type, status, targets, search_terms, sites,
                    total_fetched, new_added, duplicates_skipped,
                    targets_succeeded, targets_failed, target_errors, error,
                    started_at, completed_at, created_at
             FROM scraping_runs ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], Self::row_to_run)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<ScrapingRun> {
        let run_type: String = row.get(1)?;
        let status: String = row.get(2)?;
        Ok(ScrapingRun {
            id: row.get(0)?,
            run_type: RunType::parse(&run_type).unwrap_or(RunType::Manual),
            status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
            targets: json_list(row, 3)?,
            search_terms: json_list(row, 4)?,
            sites: json_list(row, 5)?,
            total_fetched: row.get(6)?,
            new_added: row.get(7)?,
            duplicates_skipped: row.get(8)?,
            targets_succeeded: row.get(9)?,
            targets_failed: row.get(10)?,
            target_errors: json_value(row, 11)?,
            error: row.get(12)?,
            started_at: row.get(13)?,
            completed_at: row.get(14)?,
            created_at: row.get(15)?,
        })
    }
}

fn run_status(conn: &Connection, run_id: i64) -> Result<RunStatus> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM scraping_runs WHERE id = ?1",
            [run_id],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    let status = status.ok_or(Error::UnknownRun(run_id))?;
    RunStatus::parse(&status).ok_or(Error::UnknownRun(run_id))
}

fn json_list(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Vec<String>> {
    json_value(row, idx)
}

fn json_value<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

// --- Helper functions for parsing descriptions ---

/// Best-effort extraction of required experience years from a description.
/// Returns (min, max); either side may be unknown.
pub(crate) fn extract_experience_years(description: &str) -> (Option<i64>, Option<i64>) {
    static RANGE_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    static SINGLE_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();

    let ranges = RANGE_PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"(?i)(\d+)\s*[-\x{2013}]\s*(\d+)\s*(?:years?|yrs?)").expect("range regex"),
            Regex::new(r"(?i)(\d+)\s*to\s*(\d+)\s*(?:years?|yrs?)").expect("range regex"),
        ]
    });
    let singles = SINGLE_PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"(?i)(\d+)\s*\+?\s*(?:years?|yrs?)(?:\s+of)?(?:\s+relevant)?\s+(?:experience|exp)")
                .expect("experience regex"),
            Regex::new(r"(?i)minimum\s+(?:of\s+)?(\d+)\s*(?:years?|yrs?)").expect("experience regex"),
            Regex::new(r"(?i)at\s+least\s+(\d+)\s*(?:years?|yrs?)").expect("experience regex"),
        ]
    });

    let mut min_years: Option<i64> = None;
    let mut max_years: Option<i64> = None;

    for re in ranges {
        for caps in re.captures_iter(description) {
            let lo = caps.get(1).and_then(|m| m.as_str().parse::<i64>().ok());
            let hi = caps.get(2).and_then(|m| m.as_str().parse::<i64>().ok());
            if let (Some(lo), Some(hi)) = (lo, hi) {
                let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
                min_years = Some(min_years.map_or(lo, |m| m.min(lo)));
                max_years = Some(max_years.map_or(hi, |m| m.max(hi)));
            }
        }
    }
    for re in singles {
        for caps in re.captures_iter(description) {
            if let Some(years) = caps.get(1).and_then(|m| m.as_str().parse::<i64>().ok()) {
                min_years = Some(min_years.map_or(years, |m| m.min(years)));
            }
        }
    }

    (min_years, max_years)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(url: Option<&str>, title: &str, company: &str) -> RawPosting {
        RawPosting {
            source_url: url.map(String::from),
            title: title.to_string(),
            company: company.to_string(),
            location: Some("Boston, MA".to_string()),
            site: "indeed".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn insert_then_duplicate() {
        let db = Database::open_in_memory().unwrap();
        let mut first = raw(Some("https://x/job/1"), "Engineer", "Acme");
        first.description = Some("original description".to_string());
        let mut second = first.clone();
        second.description = Some("different description".to_string());

        assert_eq!(db.insert_posting(&first).unwrap(), InsertOutcome::Inserted);
        assert_eq!(
            db.insert_posting(&second).unwrap(),
            InsertOutcome::DuplicateSkipped
        );

        let (postings, total) = db.search_postings(&PostingFilters::default()).unwrap();
        assert_eq!(total, 1);
        // The duplicate never touches the stored record.
        assert_eq!(
            postings[0].description.as_deref(),
            Some("original description")
        );
    }

    #[test]
    fn bulk_insert_drops_invalid_and_keeps_going() {
        let db = Database::open_in_memory().unwrap();
        let batch = vec![
            raw(None, "Engineer", "Acme"),
            RawPosting::default(), // nothing to fingerprint
            raw(None, "Analyst", "Globex"),
            raw(None, "Engineer", "Acme"), // duplicate of the first
        ];
        let stats = db.bulk_insert(&batch).unwrap();
        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.invalid, 1);
    }

    #[test]
    fn search_filters_and_pagination() {
        let db = Database::open_in_memory().unwrap();
        let mut remote = raw(None, "Remote Engineer", "Acme");
        remote.is_remote = Some(true);
        remote.min_amount = Some(120_000.0);
        remote.max_amount = Some(150_000.0);
        let mut onsite = raw(None, "Office Engineer", "Globex");
        onsite.is_remote = Some(false);
        onsite.min_amount = Some(80_000.0);
        onsite.max_amount = Some(95_000.0);
        db.insert_posting(&remote).unwrap();
        db.insert_posting(&onsite).unwrap();

        let (hits, total) = db
            .search_postings(&PostingFilters {
                is_remote: Some(true),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(hits[0].company, "Acme");

        let (hits, _) = db
            .search_postings(&PostingFilters {
                min_salary: Some(100_000.0),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].company, "Acme");

        let (hits, total) = db
            .search_postings(&PostingFilters {
                company: Some("glob".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!((hits.len(), total), (1, 1));

        let (page, total) = db
            .search_postings(&PostingFilters {
                limit: Some(1),
                offset: 1,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(page.len(), 1);
    }

    #[test]
    fn deactivate_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.insert_posting(&raw(None, "Engineer", "Acme")).unwrap();

        // Cutoff in the future relative to the scrape, so the row qualifies.
        assert_eq!(db.deactivate_older_than(-1).unwrap(), 1);
        assert_eq!(db.deactivate_older_than(-1).unwrap(), 0);

        let (active, _) = db.search_postings(&PostingFilters::default()).unwrap();
        assert!(active.is_empty());
        let (all, _) = db
            .search_postings(&PostingFilters {
                include_inactive: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn register_target_is_case_insensitive() {
        let db = Database::open_in_memory().unwrap();
        db.register_target("Google", &[], &[], &[]).unwrap();
        let err = db.register_target("google", &[], &[], &[]).unwrap_err();
        assert!(matches!(err, Error::DuplicateTarget(_)));
    }

    #[test]
    fn due_targets_orders_never_scraped_first() {
        let db = Database::open_in_memory().unwrap();
        db.register_target("A", &[], &[], &[]).unwrap();
        db.register_target("B", &[], &[], &[]).unwrap();
        db.register_target("C", &[], &[], &[]).unwrap();
        db.mark_scraped("B", 5, Utc::now() - Duration::hours(30))
            .unwrap();
        db.mark_scraped("C", 2, Utc::now() - Duration::hours(1))
            .unwrap();

        let due = db.due_targets(23).unwrap();
        let names: Vec<&str> = due.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[test]
    fn mark_scraped_accumulates_and_rejects_unknown() {
        let db = Database::open_in_memory().unwrap();
        db.register_target("Acme", &[], &[], &[]).unwrap();
        db.mark_scraped("Acme", 3, Utc::now()).unwrap();
        db.mark_scraped("Acme", 4, Utc::now()).unwrap();
        let target = db.get_target("Acme").unwrap().unwrap();
        assert_eq!(target.total_jobs_found, 7);
        assert!(target.last_scraped.is_some());

        let err = db.mark_scraped("Nobody", 1, Utc::now()).unwrap_err();
        assert!(matches!(err, Error::UnknownTarget(_)));
    }

    #[test]
    fn deactivated_target_leaves_schedule_but_keeps_history() {
        let db = Database::open_in_memory().unwrap();
        db.register_target("Acme", &[], &[], &[]).unwrap();
        db.mark_scraped("Acme", 9, Utc::now() - Duration::hours(48))
            .unwrap();
        db.set_target_active("Acme", false).unwrap();

        assert!(db.due_targets(23).unwrap().is_empty());
        let target = db.get_target("Acme").unwrap().unwrap();
        assert_eq!(target.total_jobs_found, 9);
        assert!(!target.is_active);
    }

    #[test]
    fn run_lifecycle_and_terminal_guard() {
        let db = Database::open_in_memory().unwrap();
        let targets = vec!["Acme".to_string()];
        let run_id = db
            .create_run(RunType::Manual, &targets, &[], &[])
            .unwrap();
        assert_eq!(db.get_run(run_id).unwrap().status, RunStatus::Pending);

        db.start_run(run_id).unwrap();
        assert_eq!(db.get_run(run_id).unwrap().status, RunStatus::Running);

        db.record_progress(run_id, "Acme", 10, 7, 3, None).unwrap();
        db.record_progress(run_id, "Globex", 0, 0, 0, Some("connection reset"))
            .unwrap();

        let run = db.get_run(run_id).unwrap();
        assert_eq!(run.total_fetched, 10);
        assert_eq!(run.new_added, 7);
        assert_eq!(run.duplicates_skipped, 3);
        assert_eq!(run.targets_succeeded, 1);
        assert_eq!(run.targets_failed, 1);
        assert_eq!(run.target_errors[0].target, "Globex");

        db.finish_run(run_id, RunStatus::Completed, None).unwrap();
        let run = db.get_run(run_id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.completed_at.is_some());
        assert!(run.duration().is_some());

        // Terminal is terminal: no second finish, no late progress.
        assert!(matches!(
            db.finish_run(run_id, RunStatus::Failed, None),
            Err(Error::AlreadyTerminal(_))
        ));
        assert!(matches!(
            db.record_progress(run_id, "Acme", 1, 1, 0, None),
            Err(Error::AlreadyTerminal(_))
        ));

        assert!(matches!(db.get_run(9999), Err(Error::UnknownRun(9999))));
    }

    #[test]
    fn experience_extraction() {
        assert_eq!(
            extract_experience_years("Requires 5+ years of experience in Rust"),
            (Some(5), None)
        );
        assert_eq!(
            extract_experience_years("3-5 years experience preferred"),
            (Some(3), Some(5))
        );
        assert_eq!(
            extract_experience_years("minimum 7 years in the field"),
            (Some(7), None)
        );
        assert_eq!(
            extract_experience_years("at least 2 yrs with SQL; 2 to 4 years total"),
            (Some(2), Some(4))
        );
        assert_eq!(extract_experience_years("no requirements listed"), (None, None));
    }

    #[test]
    fn experience_lands_on_inserted_posting() {
        let db = Database::open_in_memory().unwrap();
        let mut posting = raw(None, "Engineer", "Acme");
        posting.description = Some("We want 4-6 years of experience.".to_string());
        db.insert_posting(&posting).unwrap();

        let (hits, _) = db.search_postings(&PostingFilters::default()).unwrap();
        assert_eq!(hits[0].min_experience_years, Some(4));
        assert_eq!(hits[0].max_experience_years, Some(6));

        // max_experience filter keeps low-requirement and unknown postings
        let (hits, _) = db
            .search_postings(&PostingFilters {
                max_experience_years: Some(3),
                ..Default::default()
            })
            .unwrap();
        assert!(hits.is_empty());
    }
}
