mod config;
mod db;
mod error;
mod fingerprint;
mod models;
mod scheduler;
mod source;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use db::Database;
use models::PostingFilters;
use scheduler::{Lane, RunOverrides, Scheduler};
use source::HttpScrapeSource;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "jobhound")]
#[command(about = "Job posting aggregator - scrape targets on a schedule, dedupe, search locally")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Manage scrape targets
    Target {
        #[command(subcommand)]
        command: TargetCommands,
    },

    /// Run a scrape now
    Scrape {
        /// Target names to scrape (default: all active targets)
        #[arg(short, long)]
        targets: Vec<String>,

        /// Search terms to use instead of target/default terms
        #[arg(long)]
        terms: Vec<String>,

        /// Job boards to query instead of target/default sites
        #[arg(long)]
        sites: Vec<String>,

        /// Locations to search instead of target/default locations
        #[arg(long)]
        locations: Vec<String>,

        /// Cap on results per query
        #[arg(long)]
        max_results: Option<usize>,
    },

    /// Run the scheduler in the foreground until interrupted
    Daemon,

    /// Search stored postings
    Search {
        /// Filter by company (substring match)
        #[arg(short, long)]
        company: Option<String>,

        /// Filter by location (substring match)
        #[arg(short, long)]
        location: Option<String>,

        /// Filter by source site
        #[arg(long)]
        site: Option<String>,

        /// Only remote postings
        #[arg(long)]
        remote: bool,

        /// Minimum salary
        #[arg(long)]
        min_salary: Option<f64>,

        /// Maximum salary
        #[arg(long)]
        max_salary: Option<f64>,

        /// Exclude postings requiring more than this many years
        #[arg(long)]
        max_experience: Option<i64>,

        /// Only postings published within this many days
        #[arg(long)]
        days_old: Option<i64>,

        /// Include deactivated postings
        #[arg(long)]
        all: bool,

        /// Number of postings to show
        #[arg(short = 'n', long, default_value = "25")]
        limit: usize,

        /// Offset into the result set
        #[arg(long, default_value = "0")]
        offset: usize,
    },

    /// Inspect scraping runs
    Runs {
        #[command(subcommand)]
        command: RunCommands,
    },

    /// Show scheduler status
    Status,

    /// Deactivate postings older than a cutoff
    Cleanup {
        /// Deactivate postings scraped more than this many days ago
        #[arg(long, default_value = "30")]
        older_than_days: i64,
    },
}

#[derive(Subcommand)]
enum TargetCommands {
    /// Register a new target
    Add {
        /// Company name
        name: String,

        /// Preferred job boards for this target
        #[arg(long)]
        sites: Vec<String>,

        /// Search terms for this target
        #[arg(long)]
        terms: Vec<String>,

        /// Location filters for this target
        #[arg(long)]
        locations: Vec<String>,
    },

    /// List targets
    List {
        /// Include deactivated targets
        #[arg(long)]
        all: bool,
    },

    /// Show target details
    Show {
        /// Target name
        name: String,
    },

    /// Re-enable a target for scheduled runs
    Enable {
        /// Target name
        name: String,
    },

    /// Exclude a target from scheduled runs (history is kept)
    Disable {
        /// Target name
        name: String,
    },
}

#[derive(Subcommand)]
enum RunCommands {
    /// List recent runs
    List {
        /// Number of runs to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Show run details
    Show {
        /// Run ID
        id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobhound=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("loading config")?;
    let db = Arc::new(Database::open()?);

    match cli.command {
        Commands::Init => {
            db.init()?;
            match db.path() {
                Some(path) => println!("Database initialized at {}", path.display()),
                None => println!("Database initialized."),
            }
        }

        Commands::Target { command } => {
            db.ensure_initialized()?;
            match command {
                TargetCommands::Add {
                    name,
                    sites,
                    terms,
                    locations,
                } => {
                    let target = db.register_target(&name, &sites, &terms, &locations)?;
                    println!("Registered target '{}' (#{})", target.name, target.id);
                }

                TargetCommands::List { all } => {
                    let targets = db.list_targets(!all)?;
                    if targets.is_empty() {
                        println!("No targets found.");
                    } else {
                        println!(
                            "{:<6} {:<24} {:<8} {:>10} {:<20}",
                            "ID", "NAME", "ACTIVE", "FOUND", "LAST SCRAPED"
                        );
                        println!("{}", "-".repeat(72));
                        for target in targets {
                            let last = target
                                .last_scraped
                                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                                .unwrap_or_else(|| "never".to_string());
                            println!(
                                "{:<6} {:<24} {:<8} {:>10} {:<20}",
                                target.id,
                                truncate(&target.name, 22),
                                if target.is_active { "yes" } else { "no" },
                                target.total_jobs_found,
                                last
                            );
                        }
                    }
                }

                TargetCommands::Show { name } => match db.get_target(&name)? {
                    Some(target) => {
                        println!("Target #{}: {}", target.id, target.name);
                        println!("Active: {}", target.is_active);
                        if !target.preferred_sites.is_empty() {
                            println!("Sites: {}", target.preferred_sites.join(", "));
                        }
                        if !target.search_terms.is_empty() {
                            println!("Terms: {}", target.search_terms.join(", "));
                        }
                        if !target.location_filters.is_empty() {
                            println!("Locations: {}", target.location_filters.join(", "));
                        }
                        match target.last_scraped {
                            Some(t) => println!("Last scraped: {}", t),
                            None => println!("Last scraped: never"),
                        }
                        println!("Total jobs found: {}", target.total_jobs_found);
                        println!("Registered: {}", target.created_at);
                    }
                    None => println!("Target '{}' not found.", name),
                },

                TargetCommands::Enable { name } => {
                    db.set_target_active(&name, true)?;
                    println!("Target '{}' enabled.", name);
                }

                TargetCommands::Disable { name } => {
                    db.set_target_active(&name, false)?;
                    println!("Target '{}' disabled.", name);
                }
            }
        }

        Commands::Scrape {
            targets,
            terms,
            sites,
            locations,
            max_results,
        } => {
            db.ensure_initialized()?;
            let source = Arc::new(HttpScrapeSource::new(config.scrape_endpoint.clone()));
            let scheduler = Scheduler::new(Arc::clone(&db), source, config);

            let explicit = if targets.is_empty() { None } else { Some(targets) };
            let overrides = RunOverrides {
                search_terms: if terms.is_empty() { None } else { Some(terms) },
                sites: if sites.is_empty() { None } else { Some(sites) },
                locations: if locations.is_empty() {
                    None
                } else {
                    Some(locations)
                },
                max_results,
            };

            let handle = scheduler.trigger(Lane::Manual, explicit, overrides)?;
            println!("Run #{} started...", handle.run_id);
            handle.task.await.context("run task panicked")?;

            let run = db.get_run(handle.run_id)?;
            println!("Run #{} {}", run.id, run.status.as_str());
            println!(
                "Targets: {} succeeded, {} failed",
                run.targets_succeeded, run.targets_failed
            );
            println!(
                "Postings: {} fetched, {} new, {} duplicates skipped",
                run.total_fetched, run.new_added, run.duplicates_skipped
            );
            for failure in &run.target_errors {
                println!("  failed: {} ({})", failure.target, failure.error);
            }
        }

        Commands::Daemon => {
            db.ensure_initialized()?;
            let source = Arc::new(HttpScrapeSource::new(config.scrape_endpoint.clone()));
            let scheduler = Scheduler::new(Arc::clone(&db), source, config);

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = shutdown_tx.send(true);
                }
            });
            scheduler.run_loop(shutdown_rx).await?;
        }

        Commands::Search {
            company,
            location,
            site,
            remote,
            min_salary,
            max_salary,
            max_experience,
            days_old,
            all,
            limit,
            offset,
        } => {
            db.ensure_initialized()?;
            let filters = PostingFilters {
                company,
                location,
                site,
                is_remote: if remote { Some(true) } else { None },
                min_salary,
                max_salary,
                max_experience_years: max_experience,
                days_old,
                include_inactive: all,
                limit: Some(limit),
                offset,
            };
            let (postings, total) = db.search_postings(&filters)?;
            if postings.is_empty() {
                println!("No postings found.");
            } else {
                println!(
                    "{:<6} {:<30} {:<20} {:<18} {:<10} {:>14}",
                    "ID", "TITLE", "COMPANY", "LOCATION", "SITE", "SALARY"
                );
                println!("{}", "-".repeat(102));
                for posting in &postings {
                    let salary = match (posting.min_amount, posting.max_amount) {
                        (Some(min), Some(max)) => {
                            format!("${:.0}k-${:.0}k", min / 1000.0, max / 1000.0)
                        }
                        (Some(min), None) => format!("${:.0}k+", min / 1000.0),
                        (None, Some(max)) => format!("<${:.0}k", max / 1000.0),
                        (None, None) => "-".to_string(),
                    };
                    println!(
                        "{:<6} {:<30} {:<20} {:<18} {:<10} {:>14}",
                        posting.id,
                        truncate(&posting.title, 28),
                        truncate(&posting.company, 18),
                        truncate(posting.location.as_deref().unwrap_or("-"), 16),
                        posting.site,
                        salary
                    );
                }
                println!(
                    "\nShowing {} of {} matching postings.",
                    postings.len(),
                    total
                );
            }
        }

        Commands::Runs { command } => {
            db.ensure_initialized()?;
            match command {
                RunCommands::List { limit } => {
                    let runs = db.list_runs(limit)?;
                    if runs.is_empty() {
                        println!("No runs yet.");
                    } else {
                        println!(
                            "{:<6} {:<10} {:<10} {:>8} {:>6} {:>6} {:<20}",
                            "ID", "TYPE", "STATUS", "FETCHED", "NEW", "DUP", "STARTED"
                        );
                        println!("{}", "-".repeat(72));
                        for run in runs {
                            let started = run
                                .started_at
                                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                                .unwrap_or_else(|| "-".to_string());
                            println!(
                                "{:<6} {:<10} {:<10} {:>8} {:>6} {:>6} {:<20}",
                                run.id,
                                run.run_type.as_str(),
                                run.status.as_str(),
                                run.total_fetched,
                                run.new_added,
                                run.duplicates_skipped,
                                started
                            );
                        }
                    }
                }

                RunCommands::Show { id } => {
                    let run = db.get_run(id)?;
                    println!("Run #{} ({})", run.id, run.run_type.as_str());
                    println!("Status: {}", run.status.as_str());
                    if !run.targets.is_empty() {
                        println!("Targets: {}", run.targets.join(", "));
                    }
                    if !run.search_terms.is_empty() {
                        println!("Terms: {}", run.search_terms.join(", "));
                    }
                    if !run.sites.is_empty() {
                        println!("Sites: {}", run.sites.join(", "));
                    }
                    println!(
                        "Postings: {} fetched, {} new, {} duplicates skipped",
                        run.total_fetched, run.new_added, run.duplicates_skipped
                    );
                    println!(
                        "Targets: {} succeeded, {} failed",
                        run.targets_succeeded, run.targets_failed
                    );
                    for failure in &run.target_errors {
                        println!("  failed: {} ({})", failure.target, failure.error);
                    }
                    if let Some(error) = &run.error {
                        println!("Error: {}", error);
                    }
                    if let Some(started) = run.started_at {
                        println!("Started: {}", started);
                    }
                    if let Some(completed) = run.completed_at {
                        println!("Completed: {}", completed);
                    }
                    if let Some(duration) = run.duration() {
                        println!("Duration: {}s", duration.num_seconds());
                    }
                }
            }
        }

        Commands::Status => {
            db.ensure_initialized()?;
            let source = Arc::new(HttpScrapeSource::new(config.scrape_endpoint.clone()));
            let scheduler = Scheduler::new(Arc::clone(&db), source, config);
            let status = scheduler.status()?;
            println!(
                "Scheduler: {}",
                if status.enabled { "enabled" } else { "disabled" }
            );
            println!("Daily run at: {}", status.schedule_time);
            println!(
                "Run in progress: {}",
                if status.running { "yes" } else { "no" }
            );
            println!("Active targets: {}", status.active_targets);
            println!(
                "Default search terms: {}",
                status.default_search_terms.join(", ")
            );
        }

        Commands::Cleanup { older_than_days } => {
            db.ensure_initialized()?;
            let deactivated = db.deactivate_older_than(older_than_days)?;
            println!(
                "Deactivated {} postings older than {} days.",
                deactivated, older_than_days
            );
        }
    }

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}...", &s[..max.saturating_sub(3)])
    }
}
