use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use rollway_core::UpdateError;
use tracing::{debug, info, warn};

pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_HEALTH_WINDOW: Duration = Duration::from_secs(30);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One liveness check against the managed service. `Err` carries the reason
/// the probe failed; a pass is `Ok(())`.
pub trait HealthProbe: Send + Sync {
    fn probe(&self) -> Result<()>;
}

pub struct HttpHealthProbe {
    url: String,
    client: Client,
}

impl HttpHealthProbe {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = url.trim().to_string();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            anyhow::bail!("health url must be an http(s) URL: '{url}'");
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed building health check client")?;
        Ok(Self { url, client })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl HealthProbe for HttpHealthProbe {
    fn probe(&self) -> Result<()> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .with_context(|| format!("health request failed: GET {}", self.url))?;
        let status = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        evaluate_health_response(status, &body)
    }
}

/// A 2xx response passes unless its body is a JSON object whose `status`
/// field is something other than `"healthy"`.
pub fn evaluate_health_response(status: u16, body: &str) -> Result<()> {
    if !(200..300).contains(&status) {
        anyhow::bail!("health endpoint returned HTTP {status}");
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return Ok(());
    };
    match value.get("status") {
        None => Ok(()),
        Some(serde_json::Value::String(reported)) if reported == "healthy" => Ok(()),
        Some(reported) => anyhow::bail!("service reported status {reported}"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthVerifier {
    pub interval: Duration,
    pub window: Duration,
}

impl Default for HealthVerifier {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEALTH_INTERVAL,
            window: DEFAULT_HEALTH_WINDOW,
        }
    }
}

impl HealthVerifier {
    pub fn new(interval: Duration, window: Duration) -> Self {
        Self { interval, window }
    }

    /// Polls `probe` until it passes or the window closes. Returns the number
    /// of probes issued.
    pub fn verify(&self, probe: &dyn HealthProbe) -> Result<u32> {
        let started = Instant::now();
        let deadline = started + self.window;
        let mut attempts = 0_u32;

        loop {
            attempts += 1;
            match probe.probe() {
                Ok(()) => {
                    info!(
                        attempts,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "health check passed"
                    );
                    return Ok(attempts);
                }
                Err(err) => debug!(attempt = attempts, error = %format!("{err:#}"), "health probe failed"),
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(self.interval.min(deadline - now));
        }

        warn!(attempts, window_ms = self.window.as_millis() as u64, "health check timed out");
        Err(UpdateError::HealthCheckTimeout {
            window_ms: self.window.as_millis() as u64,
            attempts,
        }
        .into())
    }
}
