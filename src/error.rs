use thiserror::Error;

use crate::scheduler::Lane;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The posting has no URL and no title/company/location to hash, so it
    /// cannot be deduplicated and must not be stored.
    #[error("posting has no url and no title/company/location to fingerprint")]
    InvalidPosting,

    #[error("target '{0}' is already registered")]
    DuplicateTarget(String),

    #[error("no target named '{0}'")]
    UnknownTarget(String),

    #[error("no scraping run with id {0}")]
    UnknownRun(i64),

    #[error("scraping run {0} has already finished")]
    AlreadyTerminal(i64),

    #[error("a scraping run is already in progress on the {0} lane")]
    RunInProgress(Lane),

    #[error("scrape source error: {0}")]
    Source(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("invalid stored data: {0}")]
    BadRecord(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}
