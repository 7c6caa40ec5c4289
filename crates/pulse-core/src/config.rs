//! Run configuration: the structured input that selects a protocol adapter
//! and shapes one load-generation session.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::progress::ConsumerServiceConfig;
use crate::runner::{RunnerOptions, DEFAULT_NUM_THREADS, DEFAULT_QPS, DEFAULT_RESOLUTION};
use crate::stats::parse_percentiles;

/// Configuration for one run (matches the TOML layout; short field names
/// mirror the flag names).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Protocol adapter: `mock`, `http`, `tcp` or `udp`.
    pub runner: String,
    /// Target; `tcp://` / `udp://` scheme prefixes select the address form.
    pub url: String,
    /// Target calls/sec across the whole run; <= 0 runs unpaced.
    pub qps: f64,
    /// Worker ("connection") count.
    pub c: usize,
    /// Duration in seconds; negative runs until `n` completes or abort.
    pub t: f64,
    /// Exact total number of calls; > 0 overrides `t`.
    pub n: i64,
    /// Comma-separated percentiles, each in (0, 100).
    pub p: String,
    /// Histogram resolution in seconds.
    pub r: f64,
    pub labels: String,
    pub jitter: bool,
    pub uniform: bool,
    pub nocatchup: bool,
    #[serde(rename = "sequential-warmup")]
    pub sequential_warmup: bool,
    /// Persist the JSON result to the data directory.
    pub save: bool,
    /// Caller-supplied run ID; allocated from the registry when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runid: Option<i64>,
    /// Fixed request payload (POST body for http, echo payload for
    /// tcp/udp); generated per call when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    /// Per-call timeout in milliseconds.
    pub timeout_ms: u64,
    /// Metrics endpoints scraped alongside the run.
    pub consumer_services: Vec<ConsumerServiceConfig>,
}

impl Default for RunConfig {
    fn default() -> RunConfig {
        RunConfig {
            runner: "http".to_string(),
            url: String::new(),
            qps: DEFAULT_QPS,
            c: DEFAULT_NUM_THREADS,
            t: 5.,
            n: 0,
            p: String::new(),
            r: DEFAULT_RESOLUTION,
            labels: String::new(),
            jitter: false,
            uniform: false,
            nocatchup: false,
            sequential_warmup: false,
            save: false,
            runid: None,
            payload: None,
            timeout_ms: 3000,
            consumer_services: Vec::new(),
        }
    }
}

impl RunConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<RunConfig> {
        let contents = std::fs::read_to_string(path)?;
        let config: RunConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// The `host:port` form of the target for the socket adapters,
    /// stripping any scheme prefix.
    pub fn target_address(&self) -> anyhow::Result<String> {
        let addr = self
            .url
            .strip_prefix("tcp://")
            .or_else(|| self.url.strip_prefix("udp://"))
            .unwrap_or(&self.url);
        if addr.is_empty() {
            anyhow::bail!("target url is required for runner {:?}", self.runner);
        }
        Ok(addr.to_string())
    }

    /// Normalizes into runner options. All validation that must happen
    /// before a run ID exists lives here or in the runner constructor.
    pub fn to_runner_options(&self, run_id: i64) -> anyhow::Result<RunnerOptions> {
        let percentiles = if self.p.trim().is_empty() {
            Vec::new()
        } else {
            parse_percentiles(&self.p)?
        };
        let duration = if self.t < 0. {
            None
        } else if self.t == 0. {
            anyhow::bail!("duration 0 would end the run before the first call");
        } else {
            Some(Duration::from_secs_f64(self.t))
        };
        Ok(RunnerOptions {
            run_type: self.runner.clone(),
            labels: self.labels.clone(),
            qps: self.qps,
            duration,
            num_threads: self.c,
            exactly: self.n,
            resolution: self.r,
            percentiles,
            jitter: self.jitter,
            uniform: self.uniform,
            no_catch_up: self.nocatchup,
            sequential_warmup: self.sequential_warmup,
            run_id,
        })
    }

    /// Expected run length for progress display: computed from the exact
    /// call budget and rate when set, else the requested duration.
    pub fn expected_seconds(&self) -> f64 {
        if self.n > 0 && self.qps > 0. {
            return self.n as f64 / self.qps;
        }
        if self.t > 0. {
            self.t
        } else {
            0.
        }
    }
}
