use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use rollway_core::{Channel, ReleaseRecord};
use semver::Version;
use tracing::{debug, info};

use crate::source::{UpdateSource, VersionListResponse};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Client for the update server's `/api/v1` JSON endpoints.
#[derive(Debug, Clone)]
pub struct HttpUpdateSource {
    base_url: String,
    client: Client,
}

impl HttpUpdateSource {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            anyhow::bail!("update server must be an http(s) URL: '{base_url}'");
        }
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed building HTTP client")?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn absolute_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            return url.to_string();
        }
        if url.starts_with('/') {
            format!("{}{}", self.base_url, url)
        } else {
            format!("{}/{}", self.base_url, url)
        }
    }

    fn get_optional(&self, url: &str) -> Result<Option<Response>> {
        debug!(url, "requesting update source");
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("request failed: GET {url}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .with_context(|| format!("unexpected response: GET {url}"))?;
        Ok(Some(response))
    }
}

impl UpdateSource for HttpUpdateSource {
    fn describe(&self) -> String {
        self.base_url.clone()
    }

    fn list_versions(&self, channel: Channel) -> Result<Vec<ReleaseRecord>> {
        let url = format!("{}/api/v1/versions", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("channel", channel.as_str())])
            .send()
            .with_context(|| format!("request failed: GET {url}?channel={channel}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let listing: VersionListResponse = response
            .error_for_status()
            .with_context(|| format!("unexpected response: GET {url}?channel={channel}"))?
            .json()
            .with_context(|| format!("invalid version list from {url}"))?;
        Ok(listing.versions)
    }

    fn package_info(&self, version: &Version) -> Result<Option<ReleaseRecord>> {
        let url = format!("{}/api/v1/package/{version}", self.base_url);
        let Some(response) = self.get_optional(&url)? else {
            return Ok(None);
        };
        let record = response
            .json()
            .with_context(|| format!("invalid package info from {url}"))?;
        Ok(Some(record))
    }

    fn changelog(&self, version: &Version) -> Result<Option<String>> {
        let url = format!("{}/api/v1/changelog/{version}", self.base_url);
        let Some(response) = self.get_optional(&url)? else {
            return Ok(None);
        };
        let text = response
            .text()
            .with_context(|| format!("invalid changelog body from {url}"))?;
        Ok(Some(text))
    }

    fn download(&self, release: &ReleaseRecord, destination: &Path) -> Result<u64> {
        let url = self.absolute_url(&release.download_url);
        info!(url = %url, destination = %destination.display(), "downloading package");
        let mut response = self
            .client
            .get(&url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .with_context(|| format!("download failed: GET {url}"))?
            .error_for_status()
            .with_context(|| format!("download rejected: GET {url}"))?;

        let file = File::create(destination)
            .with_context(|| format!("failed to create {}", destination.display()))?;
        let mut writer = BufWriter::new(file);
        let written = response
            .copy_to(&mut writer)
            .with_context(|| format!("failed streaming {url} to {}", destination.display()))?;
        writer
            .flush()
            .with_context(|| format!("failed to flush {}", destination.display()))?;
        Ok(written)
    }
}
