//! Retrieval of Turtle exports from the dated export index.
//!
//! The index is a plain HTML directory listing. Each link is one export
//! version; versions sort chronologically by name.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use reqwest::Url;
use std::path::Path;
use std::time::Duration;

/// Version names from a directory listing, oldest first.
pub fn parse_versions(html: &str) -> Result<Vec<String>> {
    let href = Regex::new(r#"href\s*=\s*"([^"]+)""#)?;
    let mut versions: Vec<String> = href
        .captures_iter(html)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .filter(|link| !link.starts_with('.') && !link.starts_with('?') && !link.starts_with('/'))
        .filter(|link| !link.contains("://"))
        .map(|link| link.trim_end_matches('/').to_string())
        .filter(|link| !link.is_empty())
        .collect();
    versions.sort();
    versions.dedup();
    Ok(versions)
}

/// Pick a version by offset from the latest: 0 is the latest, -1 the one before.
pub fn select_version(versions: &[String], offset: i32) -> Result<&str> {
    if offset > 0 {
        return Err(anyhow!("version offset must be 0 or negative, got {}", offset));
    }
    let back = offset.unsigned_abs() as usize;
    if back >= versions.len() {
        return Err(anyhow!(
            "version offset {} out of range ({} versions available)",
            offset,
            versions.len()
        ));
    }
    Ok(&versions[versions.len() - 1 - back])
}

/// URL of the export file inside one version directory.
pub fn export_url(base_url: &str, version: &str, file_name: &str) -> Result<Url> {
    let base = if base_url.ends_with('/') {
        Url::parse(base_url)
    } else {
        Url::parse(&format!("{}/", base_url))
    }
    .with_context(|| format!("Invalid export base URL {}", base_url))?;
    let url = base
        .join(&format!("{}/", version))?
        .join(file_name)?;
    Ok(url)
}

pub struct ExportFetcher {
    base_url: String,
    file_name: String,
    http: reqwest::Client,
}

impl ExportFetcher {
    pub fn new(base_url: &str, file_name: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            base_url: base_url.to_string(),
            file_name: file_name.to_string(),
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .context("Failed to create HTTP client")?,
        })
    }

    /// GET the index and list its versions.
    pub async fn versions(&self) -> Result<Vec<String>> {
        let resp = self
            .http
            .get(&self.base_url)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", self.base_url))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("GET {} failed ({}): {}", self.base_url, status, body));
        }
        let html = resp.text().await.context("Failed to read export index")?;
        parse_versions(&html)
    }

    /// Download the export `offset` versions back from the latest into `dest`.
    /// Returns the version name.
    pub async fn download(&self, offset: i32, dest: &Path) -> Result<String> {
        let versions = self.versions().await?;
        let version = select_version(&versions, offset)?.to_string();
        let url = export_url(&self.base_url, &version, &self.file_name)?;
        tracing::info!("Downloading {} ({})", url, version);

        let resp = self
            .http
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", url))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("GET {} failed ({}): {}", url, status, body));
        }
        let bytes = resp.bytes().await.context("Failed to read export body")?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = dest.with_extension("tmp");
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, dest).await?;
        tracing::info!("Saved {} bytes to {}", bytes.len(), dest.display());
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"
<html><body><h1>Index of /sparc/archive/exports</h1>
<a href="?C=N;O=D">Name</a>
<a href="/sparc/archive/">Parent Directory</a>
<a href="2024-03-01T10%3A00%3A00%2C000000-08%3A00/">2024-03-01T10:00:00/</a>
<a href="2024-01-15T09%3A30%3A00%2C000000-08%3A00/">2024-01-15T09:30:00/</a>
<a href=".hidden/">.hidden/</a>
<a href="2024-02-20T11%3A00%3A00%2C000000-08%3A00/">2024-02-20T11:00:00/</a>
</body></html>
"#;

    #[test]
    fn test_parse_versions_sorted() {
        let versions = parse_versions(LISTING).unwrap();
        assert_eq!(versions.len(), 3);
        assert!(versions[0].starts_with("2024-01-15"));
        assert!(versions[2].starts_with("2024-03-01"));
    }

    #[test]
    fn test_select_version() {
        let versions = parse_versions(LISTING).unwrap();
        assert!(select_version(&versions, 0).unwrap().starts_with("2024-03-01"));
        assert!(select_version(&versions, -1).unwrap().starts_with("2024-02-20"));
        assert!(select_version(&versions, -2).unwrap().starts_with("2024-01-15"));
        assert!(select_version(&versions, -3).is_err());
        assert!(select_version(&versions, 1).is_err());
        assert!(select_version(&[], 0).is_err());
    }

    #[test]
    fn test_export_url() {
        let url = export_url(
            "https://cassava.ucsd.edu/sparc/archive/exports",
            "2024-03-01T10%3A00%3A00",
            "curation-export.ttl",
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://cassava.ucsd.edu/sparc/archive/exports/2024-03-01T10%3A00%3A00/curation-export.ttl"
        );
    }
}
