use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{Local, NaiveTime, Timelike, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{BulkInsertStats, RunStatus, RunType, SchedulerStatus, Target};
use crate::source::{ScrapeQuery, ScrapeSource};

/// Independent concurrency slot for runs. The daily cadence owns the
/// scheduled lane; on-demand and targeted triggers share the manual lane and
/// may overlap with a scheduled run, but never with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Scheduled,
    Manual,
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lane::Scheduled => write!(f, "scheduled"),
            Lane::Manual => write!(f, "manual"),
        }
    }
}

/// Per-trigger overrides. When set, these replace both target preferences and
/// process defaults for the run.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub search_terms: Option<Vec<String>>,
    pub sites: Option<Vec<String>>,
    pub locations: Option<Vec<String>>,
    pub max_results: Option<usize>,
}

/// A started run: the id is available immediately, completion is observable
/// by awaiting the task or polling run status.
pub struct RunHandle {
    pub run_id: i64,
    pub task: JoinHandle<()>,
}

pub struct Scheduler {
    db: Arc<Database>,
    source: Arc<dyn ScrapeSource>,
    config: Config,
    scheduled_lane: Arc<Mutex<()>>,
    manual_lane: Arc<Mutex<()>>,
}

impl Scheduler {
    pub fn new(db: Arc<Database>, source: Arc<dyn ScrapeSource>, config: Config) -> Self {
        Self {
            db,
            source,
            config,
            scheduled_lane: Arc::new(Mutex::new(())),
            manual_lane: Arc::new(Mutex::new(())),
        }
    }

    /// Cadence loop: wake up every tick, start a scheduled run when the
    /// configured time of day comes around. Flipping the shutdown channel
    /// stops future ticks; an in-flight run keeps its own task and finishes.
    pub async fn run_loop(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let schedule_time = self.config.schedule_time()?;
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.config.tick_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            schedule_time = %self.config.schedule_time,
            enabled = self.config.enabled,
            "scheduler loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.config.enabled {
                        continue;
                    }
                    if !tick_matches(Local::now().time(), schedule_time, self.config.tick_seconds) {
                        continue;
                    }
                    match self.trigger(Lane::Scheduled, None, RunOverrides::default()) {
                        Ok(handle) => info!(run_id = handle.run_id, "scheduled run started"),
                        Err(Error::RunInProgress(_)) => {
                            warn!("previous scheduled run still in progress, skipping this tick");
                        }
                        Err(e) => error!(error = %e, "could not start scheduled run"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("scheduler loop stopped");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Start a run on the given lane and return its id immediately.
    ///
    /// Rejected with `RunInProgress` (never queued) when the lane is busy.
    /// Target resolution: due targets for the scheduled lane, all active
    /// targets for a bare manual trigger, and the explicit list (staleness
    /// ignored) for a targeted trigger.
    pub fn trigger(
        &self,
        lane: Lane,
        explicit_targets: Option<Vec<String>>,
        overrides: RunOverrides,
    ) -> Result<RunHandle> {
        let guard = self
            .lane(lane)
            .clone()
            .try_lock_owned()
            .map_err(|_| Error::RunInProgress(lane))?;

        let run_type = match (lane, &explicit_targets) {
            (Lane::Scheduled, _) => RunType::Scheduled,
            (Lane::Manual, Some(_)) => RunType::Targeted,
            (Lane::Manual, None) => RunType::Manual,
        };

        let targets = match &explicit_targets {
            Some(names) => self.resolve_explicit(names)?,
            None if lane == Lane::Scheduled => self.db.due_targets(self.config.staleness_hours)?,
            None => self.db.list_targets(true)?,
        };
        let names: Vec<String> = targets.iter().map(|t| t.name.clone()).collect();

        let scope_terms = overrides
            .search_terms
            .clone()
            .unwrap_or_else(|| self.config.default_search_terms.clone());
        let scope_sites = overrides
            .sites
            .clone()
            .unwrap_or_else(|| self.config.default_sites.clone());

        let run_id = self
            .db
            .create_run(run_type, &names, &scope_terms, &scope_sites)?;
        self.db.start_run(run_id)?;

        info!(
            run_id,
            run_type = run_type.as_str(),
            targets = names.len(),
            "scraping run started"
        );

        let db = Arc::clone(&self.db);
        let source = Arc::clone(&self.source);
        let config = self.config.clone();
        let task =
            tokio::spawn(
                async move { execute_run(db, source, config, run_id, targets, overrides, guard).await },
            );

        Ok(RunHandle { run_id, task })
    }

    pub fn status(&self) -> Result<SchedulerStatus> {
        Ok(SchedulerStatus {
            enabled: self.config.enabled,
            running: self.scheduled_lane.try_lock().is_err()
                || self.manual_lane.try_lock().is_err(),
            schedule_time: self.config.schedule_time.clone(),
            active_targets: self.db.count_active_targets()?,
            default_search_terms: self.config.default_search_terms.clone(),
        })
    }

    fn lane(&self, lane: Lane) -> &Arc<Mutex<()>> {
        match lane {
            Lane::Scheduled => &self.scheduled_lane,
            Lane::Manual => &self.manual_lane,
        }
    }

    /// Look up explicitly requested targets. Names that are unknown or
    /// deactivated are skipped with a warning rather than failing the
    /// trigger, matching how a bulk request over a stale list should behave.
    fn resolve_explicit(&self, names: &[String]) -> Result<Vec<Target>> {
        let mut targets = Vec::new();
        for name in names {
            match self.db.get_target(name)? {
                Some(target) if target.is_active => targets.push(target),
                Some(_) => warn!(target = %name, "target is deactivated, skipping"),
                None => warn!(target = %name, "target not registered, skipping"),
            }
        }
        Ok(targets)
    }
}

/// True when `now` falls inside the tick window starting at `at`.
fn tick_matches(now: NaiveTime, at: NaiveTime, tick_seconds: u64) -> bool {
    let diff =
        now.num_seconds_from_midnight() as i64 - at.num_seconds_from_midnight() as i64;
    diff >= 0 && diff < tick_seconds as i64
}

/// Process one run to completion: every target is attempted, one failing
/// fetch never aborts the rest. The run fails only when targets were
/// attempted and none succeeded.
async fn execute_run(
    db: Arc<Database>,
    source: Arc<dyn ScrapeSource>,
    config: Config,
    run_id: i64,
    targets: Vec<Target>,
    overrides: RunOverrides,
    _guard: OwnedMutexGuard<()>,
) {
    let mut attempted = 0usize;
    let mut succeeded = 0usize;

    for target in &targets {
        attempted += 1;
        match scrape_target(&db, source.as_ref(), &config, target, &overrides).await {
            Ok((fetched, stats)) => {
                succeeded += 1;
                info!(
                    run_id,
                    target = %target.name,
                    fetched,
                    inserted = stats.inserted,
                    duplicates = stats.duplicates,
                    "target scraped"
                );
                if let Err(e) = db.record_progress(
                    run_id,
                    &target.name,
                    fetched as i64,
                    stats.inserted as i64,
                    stats.duplicates as i64,
                    None,
                ) {
                    error!(run_id, error = %e, "could not record progress");
                }
                if let Err(e) = db.mark_scraped(&target.name, stats.inserted as i64, Utc::now()) {
                    error!(run_id, target = %target.name, error = %e, "could not mark target scraped");
                }
            }
            Err(e) => {
                warn!(run_id, target = %target.name, error = %e, "target scrape failed, continuing");
                if let Err(e) =
                    db.record_progress(run_id, &target.name, 0, 0, 0, Some(&e.to_string()))
                {
                    error!(run_id, error = %e, "could not record failure");
                }
            }
        }
    }

    let (status, summary) = if attempted > 0 && succeeded == 0 {
        (RunStatus::Failed, Some("all targets failed"))
    } else {
        (RunStatus::Completed, None)
    };
    if let Err(e) = db.finish_run(run_id, status, summary) {
        error!(run_id, error = %e, "could not finish run");
        return;
    }
    info!(
        run_id,
        status = status.as_str(),
        targets = attempted,
        succeeded,
        "scraping run finished"
    );
}

/// Fetch and ingest everything for one target. Any fetch error surfaces to
/// the caller, which records it against the target and moves on.
async fn scrape_target(
    db: &Database,
    source: &dyn ScrapeSource,
    config: &Config,
    target: &Target,
    overrides: &RunOverrides,
) -> Result<(usize, BulkInsertStats)> {
    let terms = effective_terms(target, overrides, config);
    let sites = effective_list(
        overrides.sites.as_deref(),
        &target.preferred_sites,
        &config.default_sites,
    );
    let locations = effective_list(
        overrides.locations.as_deref(),
        &target.location_filters,
        &config.default_locations,
    );
    let max_results = overrides.max_results.unwrap_or(config.results_per_target);

    let mut batch = Vec::new();
    for location in &locations {
        for term in &terms {
            let query = ScrapeQuery {
                company: target.name.clone(),
                search_term: term.clone(),
                sites: sites.clone(),
                location: location.clone(),
                max_results,
                hours_old: config.hours_old,
            };
            let postings = source.fetch(&query).await?;
            batch.extend(postings);
        }
    }

    let fetched = batch.len();
    let stats = db.bulk_insert(&batch)?;
    Ok((fetched, stats))
}

/// Effective search terms: an override replaces everything; otherwise the
/// target's own terms unioned with the process defaults, first occurrence
/// wins, case-insensitively deduplicated.
fn effective_terms(target: &Target, overrides: &RunOverrides, config: &Config) -> Vec<String> {
    if let Some(terms) = &overrides.search_terms {
        if !terms.is_empty() {
            return terms.clone();
        }
    }
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for term in target
        .search_terms
        .iter()
        .chain(config.default_search_terms.iter())
    {
        if seen.insert(term.to_lowercase()) {
            out.push(term.clone());
        }
    }
    out
}

/// Sites and locations fall back rather than union: override, else the
/// target's own preference, else the process default.
fn effective_list(
    overridden: Option<&[String]>,
    own: &[String],
    default: &[String],
) -> Vec<String> {
    if let Some(list) = overridden {
        if !list.is_empty() {
            return list.to_vec();
        }
    }
    if !own.is_empty() {
        return own.to_vec();
    }
    default.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RawPosting;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::collections::HashMap;

    /// Scrape source stub: canned postings per company, optional failures,
    /// optional gate that holds every fetch until opened.
    struct StubSource {
        by_company: HashMap<String, Vec<RawPosting>>,
        failing: HashSet<String>,
        gate: Option<watch::Receiver<bool>>,
    }

    impl StubSource {
        fn new() -> Self {
            Self {
                by_company: HashMap::new(),
                failing: HashSet::new(),
                gate: None,
            }
        }

        fn with_postings(mut self, company: &str, count: usize) -> Self {
            let postings = (0..count)
                .map(|i| RawPosting {
                    source_url: Some(format!("https://jobs.example/{}/{}", company, i)),
                    title: format!("Engineer {}", i),
                    company: company.to_string(),
                    location: Some("Boston, MA".to_string()),
                    site: "indeed".to_string(),
                    ..Default::default()
                })
                .collect();
            self.by_company.insert(company.to_string(), postings);
            self
        }

        fn with_failure(mut self, company: &str) -> Self {
            self.failing.insert(company.to_string());
            self
        }

        fn with_gate(mut self, gate: watch::Receiver<bool>) -> Self {
            self.gate = Some(gate);
            self
        }
    }

    #[async_trait]
    impl ScrapeSource for StubSource {
        async fn fetch(&self, query: &ScrapeQuery) -> Result<Vec<RawPosting>> {
            if let Some(gate) = &self.gate {
                let mut gate = gate.clone();
                while !*gate.borrow() {
                    gate.changed().await.map_err(|_| Error::Source("gate dropped".into()))?;
                }
            }
            if self.failing.contains(&query.company) {
                return Err(Error::Source(format!("{} unreachable", query.company)));
            }
            Ok(self
                .by_company
                .get(&query.company)
                .cloned()
                .unwrap_or_default())
        }
    }

    fn test_config() -> Config {
        Config {
            default_search_terms: vec!["engineer".to_string()],
            default_sites: vec!["indeed".to_string()],
            default_locations: vec!["USA".to_string()],
            ..Default::default()
        }
    }

    fn scheduler(source: StubSource) -> Scheduler {
        let db = Arc::new(Database::open_in_memory().unwrap());
        Scheduler::new(db, Arc::new(source), test_config())
    }

    #[tokio::test]
    async fn partial_failure_still_completes() {
        let source = StubSource::new()
            .with_postings("A", 3)
            .with_failure("B")
            .with_postings("C", 2);
        let sched = scheduler(source);
        for name in ["A", "B", "C"] {
            sched.db.register_target(name, &[], &[], &[]).unwrap();
        }

        let handle = sched
            .trigger(Lane::Manual, None, RunOverrides::default())
            .unwrap();
        handle.task.await.unwrap();

        let run = sched.db.get_run(handle.run_id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.targets_succeeded, 2);
        assert_eq!(run.targets_failed, 1);
        assert_eq!(run.total_fetched, 5);
        assert_eq!(run.new_added, 5);
        assert_eq!(run.target_errors.len(), 1);
        assert_eq!(run.target_errors[0].target, "B");

        // Successful targets are marked scraped, the failed one is not.
        assert!(sched.db.get_target("A").unwrap().unwrap().last_scraped.is_some());
        assert!(sched.db.get_target("B").unwrap().unwrap().last_scraped.is_none());
        assert_eq!(sched.db.get_target("C").unwrap().unwrap().total_jobs_found, 2);
    }

    #[tokio::test]
    async fn run_fails_only_when_every_target_fails() {
        let source = StubSource::new().with_failure("A").with_failure("B");
        let sched = scheduler(source);
        sched.db.register_target("A", &[], &[], &[]).unwrap();
        sched.db.register_target("B", &[], &[], &[]).unwrap();

        let handle = sched
            .trigger(Lane::Manual, None, RunOverrides::default())
            .unwrap();
        handle.task.await.unwrap();

        let run = sched.db.get_run(handle.run_id).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.targets_failed, 2);
        assert!(run.error.is_some());
    }

    #[tokio::test]
    async fn second_trigger_on_same_lane_is_rejected() {
        let (gate_tx, gate_rx) = watch::channel(false);
        let source = StubSource::new().with_postings("A", 1).with_gate(gate_rx);
        let sched = scheduler(source);
        sched.db.register_target("A", &[], &[], &[]).unwrap();

        let first = sched
            .trigger(Lane::Manual, None, RunOverrides::default())
            .unwrap();
        let second = sched.trigger(Lane::Manual, None, RunOverrides::default());
        assert!(matches!(second, Err(Error::RunInProgress(Lane::Manual))));

        // The scheduled lane is independent and may run concurrently.
        let scheduled = sched
            .trigger(Lane::Scheduled, None, RunOverrides::default())
            .unwrap();

        gate_tx.send(true).unwrap();
        first.task.await.unwrap();
        scheduled.task.await.unwrap();

        assert_eq!(
            sched.db.get_run(first.run_id).unwrap().status,
            RunStatus::Completed
        );
        // Lane free again once the run finished.
        assert!(sched
            .trigger(Lane::Manual, None, RunOverrides::default())
            .is_ok());
    }

    #[tokio::test]
    async fn scheduled_run_only_touches_due_targets() {
        let source = StubSource::new()
            .with_postings("Fresh", 1)
            .with_postings("Stale", 1)
            .with_postings("Never", 1);
        let sched = scheduler(source);
        for name in ["Fresh", "Stale", "Never"] {
            sched.db.register_target(name, &[], &[], &[]).unwrap();
        }
        sched
            .db
            .mark_scraped("Fresh", 0, Utc::now() - Duration::hours(1))
            .unwrap();
        sched
            .db
            .mark_scraped("Stale", 0, Utc::now() - Duration::hours(30))
            .unwrap();

        let handle = sched
            .trigger(Lane::Scheduled, None, RunOverrides::default())
            .unwrap();
        handle.task.await.unwrap();

        let run = sched.db.get_run(handle.run_id).unwrap();
        assert_eq!(run.run_type, RunType::Scheduled);
        // Never-scraped first, then the stale one; the fresh one is skipped.
        assert_eq!(run.targets, vec!["Never".to_string(), "Stale".to_string()]);
    }

    #[tokio::test]
    async fn targeted_run_ignores_staleness() {
        let source = StubSource::new().with_postings("Acme", 2);
        let sched = scheduler(source);
        sched.db.register_target("Acme", &[], &[], &[]).unwrap();
        sched
            .db
            .mark_scraped("Acme", 0, Utc::now() - Duration::hours(1))
            .unwrap();

        let handle = sched
            .trigger(
                Lane::Manual,
                Some(vec!["Acme".to_string(), "Ghost".to_string()]),
                RunOverrides::default(),
            )
            .unwrap();
        handle.task.await.unwrap();

        let run = sched.db.get_run(handle.run_id).unwrap();
        assert_eq!(run.run_type, RunType::Targeted);
        // The unknown name is skipped rather than failing the trigger.
        assert_eq!(run.targets, vec!["Acme".to_string()]);
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.new_added, 2);
    }

    #[tokio::test]
    async fn repeat_run_reports_duplicates() {
        let source = StubSource::new().with_postings("Acme", 3);
        let sched = scheduler(source);
        sched.db.register_target("Acme", &[], &[], &[]).unwrap();

        let first = sched
            .trigger(Lane::Manual, None, RunOverrides::default())
            .unwrap();
        first.task.await.unwrap();
        let second = sched
            .trigger(Lane::Manual, None, RunOverrides::default())
            .unwrap();
        second.task.await.unwrap();

        let run = sched.db.get_run(second.run_id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.new_added, 0);
        assert_eq!(run.duplicates_skipped, 3);

        // Store did not grow on the second pass.
        let (_, total) = sched
            .db
            .search_postings(&crate::models::PostingFilters::default())
            .unwrap();
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn empty_target_set_completes_immediately() {
        let sched = scheduler(StubSource::new());
        let handle = sched
            .trigger(Lane::Manual, None, RunOverrides::default())
            .unwrap();
        handle.task.await.unwrap();

        let run = sched.db.get_run(handle.run_id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.targets_succeeded, 0);
        assert_eq!(run.targets_failed, 0);
    }

    #[test]
    fn term_union_dedupes_case_insensitively() {
        let target = Target {
            id: 1,
            name: "Acme".to_string(),
            preferred_sites: vec![],
            search_terms: vec!["Clinical".to_string(), "engineer".to_string()],
            location_filters: vec![],
            last_scraped: None,
            total_jobs_found: 0,
            is_active: true,
            created_at: Utc::now(),
        };
        let terms = effective_terms(&target, &RunOverrides::default(), &test_config());
        assert_eq!(terms, vec!["Clinical".to_string(), "engineer".to_string()]);

        let overridden = effective_terms(
            &target,
            &RunOverrides {
                search_terms: Some(vec!["quality".to_string()]),
                ..Default::default()
            },
            &test_config(),
        );
        assert_eq!(overridden, vec!["quality".to_string()]);
    }

    #[test]
    fn sites_and_locations_fall_back() {
        let own = vec!["linkedin".to_string()];
        let default = vec!["indeed".to_string()];
        assert_eq!(effective_list(None, &own, &default), own);
        assert_eq!(effective_list(None, &[], &default), default);
        let overridden = vec!["glassdoor".to_string()];
        assert_eq!(
            effective_list(Some(&overridden), &own, &default),
            overridden
        );
    }

    #[test]
    fn tick_window() {
        let at = NaiveTime::from_hms_opt(2, 0, 0).unwrap();
        assert!(tick_matches(NaiveTime::from_hms_opt(2, 0, 0).unwrap(), at, 60));
        assert!(tick_matches(NaiveTime::from_hms_opt(2, 0, 59).unwrap(), at, 60));
        assert!(!tick_matches(NaiveTime::from_hms_opt(2, 1, 0).unwrap(), at, 60));
        assert!(!tick_matches(NaiveTime::from_hms_opt(1, 59, 59).unwrap(), at, 60));
    }
}
