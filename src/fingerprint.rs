use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::models::RawPosting;

/// Derive the deduplication identity for a raw posting.
///
/// A posting with a source URL is identified by that URL alone; anything else
/// falls back to the normalized (title, company, location) triple. The hash is
/// computed once at ingestion and never recomputed for a stored record.
pub fn fingerprint(raw: &RawPosting) -> Result<String> {
    if let Some(url) = raw.source_url.as_deref() {
        if !url.trim().is_empty() {
            return Ok(sha256_hex(&normalize_url(url)));
        }
    }

    let title = collapse(&raw.title);
    let company = collapse(&raw.company);
    let location = collapse(raw.location.as_deref().unwrap_or(""));

    if title.is_empty() && company.is_empty() && location.is_empty() {
        return Err(Error::InvalidPosting);
    }

    Ok(sha256_hex(&format!("{}|{}|{}", title, company, location)))
}

fn normalize_url(url: &str) -> String {
    url.trim().to_lowercase().trim_end_matches('/').to_string()
}

/// Lower-case and collapse runs of whitespace to single spaces.
fn collapse(s: &str) -> String {
    s.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}
