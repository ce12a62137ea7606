//! `fetch_and_ingest_url`: downloads an MRF (or index) file over
//! HTTP into a content-addressed disk cache keyed by SHA-256 of the URL,
//! then hands the cached path to the same extraction path a local file
//! would use. Transient server errors are retried with exponential
//! backoff.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

fn cache_key(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Result of a successful `fetch_and_ingest_url` download: the local path
/// the bytes landed at, and whether that path was already populated by an
/// earlier fetch of the same URL.
pub struct FetchedFile {
    pub path: PathBuf,
    pub from_cache: bool,
}

fn looks_expired(body: &str, status: reqwest::StatusCode) -> bool {
    if status.as_u16() != 403 && status.as_u16() != 401 {
        return false;
    }
    let lower = body.to_lowercase();
    lower.contains("accessdenied") || lower.contains("expired") || lower.contains("access denied")
}

/// Fetch `url` into the content-addressed cache, retrying transient
/// server errors with exponential backoff. Returns `ExpiredLink` when the
/// response is an access-denied/expired signature rather than a normal
/// error, so callers can distinguish "gone" from "broken".
pub async fn fetch_and_cache(client: &reqwest::Client, config: &Config, url: &str) -> CoreResult<FetchedFile> {
    let path = config.fetch_cache_path(&cache_key(url));
    if path.exists() {
        return Ok(FetchedFile { path, from_cache: true });
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CoreError::IoError { path: parent.display().to_string(), source: e })?;
    }

    let max_retries = 3u32;
    let mut attempt = 0u32;
    let response = loop {
        match client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => break resp,
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                if looks_expired(&body, status) {
                    return Err(CoreError::ExpiredLink(url.to_string()));
                }
                if attempt < max_retries && status.is_server_error() {
                    warn!(url, %status, attempt, "fetch_and_ingest_url: server error, retrying");
                    attempt += 1;
                    tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                    continue;
                }
                return Err(CoreError::IoError {
                    path: url.to_string(),
                    source: std::io::Error::other(format!("http status {status}")),
                });
            }
            Err(e) if attempt < max_retries => {
                warn!(url, error = %e, attempt, "fetch_and_ingest_url: request failed, retrying");
                attempt += 1;
                tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                continue;
            }
            Err(e) => {
                return Err(CoreError::IoError {
                    path: url.to_string(),
                    source: std::io::Error::other(e.to_string()),
                })
            }
        }
    };

    let bytes = response
        .bytes()
        .await
        .map_err(|e| CoreError::IoError { path: url.to_string(), source: std::io::Error::other(e.to_string()) })?;
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| CoreError::IoError { path: path.display().to_string(), source: e })?;

    Ok(FetchedFile { path, from_cache: false })
}

pub fn cache_path_for(config: &Config, url: &str) -> PathBuf {
    config.fetch_cache_path(&cache_key(url))
}

/// Name the cached file would need on disk to be gzip-detected by the
/// `StreamReader` (which keys off a literal `.gz` suffix); the cache key
/// alone carries no extension, so a symlink/copy with the right suffix is
/// made when the URL itself looks gzipped.
pub fn ensure_extension_hint(path: &Path, url: &str) -> PathBuf {
    if url.to_lowercase().ends_with(".gz") && path.extension().and_then(|e| e.to_str()) != Some("gz") {
        let hinted = path.with_extension("gz");
        if !hinted.exists() {
            let _ = std::fs::hard_link(path, &hinted).or_else(|_| std::fs::copy(path, &hinted).map(|_| ()));
        }
        return hinted;
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_deterministic_sha256_of_url() {
        let a = cache_key("https://example.com/a.json");
        let b = cache_key("https://example.com/a.json");
        let c = cache_key("https://example.com/b.json");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn looks_expired_requires_denial_status_and_signature() {
        assert!(looks_expired("AccessDenied: link expired", reqwest::StatusCode::FORBIDDEN));
        assert!(!looks_expired("AccessDenied: link expired", reqwest::StatusCode::OK));
        assert!(!looks_expired("just a 403", reqwest::StatusCode::FORBIDDEN));
    }
}
