//! The periodic runner: open-loop rate pacing across parallel workers.
//!
//! One pacing clock is captured at run start; worker `k`'s i-th call targets
//! `t0 + k*dt/N + i*dt` where `dt` is the per-thread inter-call interval.
//! Workers sleep until their target (interruptible by abort), invoke the
//! pluggable [`Runnable`] call, and record the latency into a worker-private
//! histogram, so the hot loop never crosses a lock.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::abort::{AbortWatch, Aborter};
use crate::live::LiveStatsHandle;
use crate::stats::{merge_result_codes, Histogram, HistogramData, ResultCodeMap};

/// Status key recorded when a call panics instead of returning.
pub const PANIC_STATUS: &str = "panic";

pub type RunFuture<'a> = Pin<Box<dyn Future<Output = (bool, String)> + Send + 'a>>;

/// The per-call workload contract. One instance per worker; the instance
/// owns whatever stateful client the protocol needs.
///
/// `run` returns whether the call succeeded and an opaque status key used
/// to aggregate outcomes ("OK", an HTTP code, an error string).
pub trait Runnable: Send {
    fn run(&mut self, thread_id: usize) -> RunFuture<'_>;

    /// Adapter-specific totals harvested after the run (sockets, bytes,
    /// messages). The default is all zeroes.
    fn counters(&self) -> AdapterCounters {
        AdapterCounters::default()
    }
}

/// Protocol-level totals merged across workers into the final result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AdapterCounters {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub socket_count: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub bytes_sent: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub bytes_received: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub messages_sent: i64,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl AdapterCounters {
    pub fn add(&mut self, other: &AdapterCounters) {
        self.socket_count += other.socket_count;
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.messages_sent += other.messages_sent;
    }
}

/// Options for one load-generation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerOptions {
    /// Protocol tag carried into the results ("http", "tcp", ...).
    pub run_type: String,
    /// Opaque label string attached to the result.
    pub labels: String,
    /// Target calls/sec across the whole run; <= 0 disables pacing.
    pub qps: f64,
    /// Wall-clock budget. None runs until `exactly` completes or abort.
    pub duration: Option<Duration>,
    pub num_threads: usize,
    /// Total calls across all threads; > 0 overrides `duration`.
    pub exactly: i64,
    /// Histogram divider for latencies, in seconds.
    pub resolution: f64,
    pub percentiles: Vec<f64>,
    /// Randomize each target by up to half the inter-call interval.
    pub jitter: bool,
    /// Round-robin formulation of the thread-staggered schedule.
    pub uniform: bool,
    /// Skip missed slots instead of issuing back-to-back catch-up calls.
    pub no_catch_up: bool,
    /// Run the per-thread first hits serially instead of in parallel.
    pub sequential_warmup: bool,
    pub run_id: i64,
}

pub const DEFAULT_QPS: f64 = 8.;
pub const DEFAULT_DURATION: Duration = Duration::from_secs(5);
pub const DEFAULT_NUM_THREADS: usize = 4;
pub const DEFAULT_RESOLUTION: f64 = 0.001;

impl Default for RunnerOptions {
    fn default() -> RunnerOptions {
        RunnerOptions {
            run_type: String::new(),
            labels: String::new(),
            qps: DEFAULT_QPS,
            duration: Some(DEFAULT_DURATION),
            num_threads: DEFAULT_NUM_THREADS,
            exactly: 0,
            resolution: DEFAULT_RESOLUTION,
            percentiles: Vec::new(),
            jitter: false,
            uniform: false,
            no_catch_up: false,
            sequential_warmup: false,
            run_id: 0,
        }
    }
}

/// Aggregated outcome of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunnerResults {
    /// Stable identifier: labels (or run type) plus the start timestamp.
    pub id: String,
    pub run_type: String,
    pub labels: String,
    pub start_time: DateTime<Utc>,
    pub run_id: i64,
    pub requested_qps: String,
    pub requested_duration: String,
    pub actual_qps: f64,
    /// Seconds from pacing start to the last worker exit.
    pub actual_duration: f64,
    pub num_threads: usize,
    pub exactly: i64,
    pub jitter: bool,
    pub uniform: bool,
    pub no_catch_up: bool,
    pub duration_histogram: HistogramData,
    pub errors_duration_histogram: HistogramData,
    pub ret_codes: ResultCodeMap,
    #[serde(flatten)]
    pub counters: AdapterCounters,
}

impl RunnerResults {
    pub fn total_calls(&self) -> i64 {
        self.duration_histogram.count
    }

    pub fn error_calls(&self) -> i64 {
        self.errors_duration_histogram.count
    }
}

fn fmt_qps(qps: f64) -> String {
    if qps > 0. {
        format!("{qps}")
    } else {
        "max".to_string()
    }
}

fn fmt_requested_duration(opts: &RunnerOptions) -> String {
    if opts.exactly > 0 {
        return format!("exactly {} calls", opts.exactly);
    }
    match opts.duration {
        Some(d) => format!("{}s", d.as_secs_f64()),
        None => "until aborted".to_string(),
    }
}

/// Normalized runner, ready to drive a set of workers.
pub struct PeriodicRunner {
    opts: RunnerOptions,
    aborter: Arc<Aborter>,
    live: Option<Arc<LiveStatsHandle>>,
}

impl PeriodicRunner {
    /// Validates and normalizes options. Fails before any run state exists:
    /// bad percentiles, non-positive resolution.
    pub fn new(mut opts: RunnerOptions) -> anyhow::Result<PeriodicRunner> {
        if opts.resolution <= 0. {
            anyhow::bail!("resolution must be positive, got {}", opts.resolution);
        }
        for &p in &opts.percentiles {
            if p <= 0. || p >= 100. {
                anyhow::bail!("percentile {p} must be > 0 and < 100");
            }
        }
        if opts.num_threads < 1 {
            opts.num_threads = DEFAULT_NUM_THREADS;
        }
        if opts.exactly > 0 {
            // an exact call budget overrides the wall-clock budget, and
            // never spreads thinner than one call per worker
            opts.duration = None;
            if (opts.num_threads as i64) > opts.exactly {
                info!(
                    exactly = opts.exactly,
                    num_threads = opts.num_threads,
                    "reducing thread count to the exact call budget"
                );
                opts.num_threads = opts.exactly as usize;
            }
        }
        Ok(PeriodicRunner {
            opts,
            aborter: Arc::new(Aborter::new()),
            live: None,
        })
    }

    pub fn with_aborter(mut self, aborter: Arc<Aborter>) -> PeriodicRunner {
        self.aborter = aborter;
        self
    }

    pub fn with_live_stats(mut self, live: Arc<LiveStatsHandle>) -> PeriodicRunner {
        self.live = Some(live);
        self
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.opts
    }

    pub fn aborter(&self) -> Arc<Aborter> {
        self.aborter.clone()
    }

    /// Drives `workers` (one per thread) until the duration elapses, the
    /// exact call budget is spent, or the run is aborted. Merges per-worker
    /// statistics into the final results.
    pub async fn run(self, mut workers: Vec<Box<dyn Runnable>>) -> anyhow::Result<RunnerResults> {
        let opts = &self.opts;
        if workers.len() != opts.num_threads {
            anyhow::bail!(
                "need {} workers (one per thread), got {}",
                opts.num_threads,
                workers.len()
            );
        }
        let start_time = Utc::now();
        info!(
            run_id = opts.run_id,
            run_type = %opts.run_type,
            qps = opts.qps,
            num_threads = opts.num_threads,
            exactly = opts.exactly,
            "starting run"
        );

        // First hits establish connections outside the measured window.
        // An exact call budget skips them: every call must count.
        if opts.exactly <= 0 {
            self.warmup(&mut workers).await;
        }

        let exact_counter = (opts.exactly > 0).then(|| Arc::new(AtomicI64::new(0)));
        let pacing = Pacing::new(opts);
        let t0 = Instant::now();

        let mut tasks = Vec::with_capacity(workers.len());
        for (k, callee) in workers.drain(..).enumerate() {
            let mut state = WorkerState {
                k,
                callee,
                hist: Histogram::new(0., opts.resolution)?,
                err_hist: Histogram::new(0., opts.resolution)?,
                codes: ResultCodeMap::new(),
                watch: self.aborter.watch(),
                live: self.live.clone(),
                exact: exact_counter.clone(),
                exactly: opts.exactly,
                duration: opts.duration,
                pacing,
                no_catch_up: opts.no_catch_up,
                jitter: opts.jitter,
                exit: t0,
            };
            tasks.push(tokio::spawn(async move {
                state.run_loop(t0).await;
                state
            }));
        }

        let mut total = Histogram::new(0., opts.resolution)?;
        let mut errors = Histogram::new(0., opts.resolution)?;
        let mut codes = ResultCodeMap::new();
        let mut counters = AdapterCounters::default();
        let mut last_exit = t0;
        for task in tasks {
            let mut state = task
                .await
                .map_err(|e| anyhow::anyhow!("worker task failed: {e}"))?;
            total.transfer(&mut state.hist);
            errors.transfer(&mut state.err_hist);
            merge_result_codes(&mut codes, &state.codes);
            counters.add(&state.callee.counters());
            if state.exit > last_exit {
                last_exit = state.exit;
            }
        }

        let actual_duration = (last_exit - t0).as_secs_f64();
        let total_count = total.counter.count;
        let actual_qps = if actual_duration > 0. {
            total_count as f64 / actual_duration
        } else {
            0.
        };
        info!(
            run_id = opts.run_id,
            total = total_count,
            actual_qps,
            actual_duration,
            "run complete"
        );

        Ok(RunnerResults {
            id: make_result_id(&opts.labels, &opts.run_type, &start_time),
            run_type: opts.run_type.clone(),
            labels: opts.labels.clone(),
            start_time,
            run_id: opts.run_id,
            requested_qps: fmt_qps(opts.qps),
            requested_duration: fmt_requested_duration(opts),
            actual_qps,
            actual_duration,
            num_threads: opts.num_threads,
            exactly: opts.exactly,
            jitter: opts.jitter,
            uniform: opts.uniform,
            no_catch_up: opts.no_catch_up,
            duration_histogram: total.export().calc_percentiles(&opts.percentiles),
            errors_duration_histogram: errors.export().calc_percentiles(&opts.percentiles),
            ret_codes: codes,
            counters,
        })
    }

    async fn warmup(&self, workers: &mut [Box<dyn Runnable>]) {
        debug!(
            sequential = self.opts.sequential_warmup,
            "warming up {} workers",
            workers.len()
        );
        if self.opts.sequential_warmup {
            for (k, w) in workers.iter_mut().enumerate() {
                let _ = w.run(k).await;
            }
        } else {
            futures::future::join_all(
                workers.iter_mut().enumerate().map(|(k, w)| w.run(k)),
            )
            .await;
        }
    }
}

/// Stable result identifier: `<labels-or-runtype>_<timestamp>`, safe for
/// use as a file-name stem.
pub fn make_result_id(labels: &str, run_type: &str, start: &DateTime<Utc>) -> String {
    let base = if labels.is_empty() { run_type } else { labels };
    let base: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let base = if base.is_empty() { "run".to_string() } else { base };
    format!("{}_{}", base, start.format("%Y%m%d_%H%M%S"))
}

/// Immutable per-run pacing parameters.
#[derive(Debug, Clone, Copy)]
struct Pacing {
    paced: bool,
    /// Per-thread inter-call interval, seconds.
    dt: f64,
    num_threads: usize,
}

impl Pacing {
    fn new(opts: &RunnerOptions) -> Pacing {
        let paced = opts.qps > 0.;
        let dt = if paced {
            opts.num_threads as f64 / opts.qps
        } else {
            0.
        };
        Pacing {
            paced,
            dt,
            num_threads: opts.num_threads,
        }
    }

    /// Seconds from t0 to thread k's i-th target. The staggered and the
    /// round-robin formulations produce the same schedule:
    /// `k*dt/N + i*dt == (k + N*i)*dt/N`.
    fn target_offset(&self, k: usize, i: u64) -> f64 {
        k as f64 * self.dt / self.num_threads as f64 + i as f64 * self.dt
    }
}

struct WorkerState {
    k: usize,
    callee: Box<dyn Runnable>,
    hist: Histogram,
    err_hist: Histogram,
    codes: ResultCodeMap,
    watch: AbortWatch,
    live: Option<Arc<LiveStatsHandle>>,
    exact: Option<Arc<AtomicI64>>,
    exactly: i64,
    duration: Option<Duration>,
    pacing: Pacing,
    no_catch_up: bool,
    jitter: bool,
    /// When the worker's loop ended; drives actual-duration accounting.
    exit: Instant,
}

impl WorkerState {
    async fn run_loop(&mut self, t0: Instant) {
        let mut i: u64 = 0;
        let deadline = self.duration.map(|d| t0 + d);
        loop {
            if self.watch.is_aborted() {
                debug!(thread = self.k, "aborted");
                break;
            }
            if let Some(dl) = deadline {
                if Instant::now() >= dl {
                    break;
                }
            }
            if self.pacing.paced {
                let mut offset = self.pacing.target_offset(self.k, i);
                if self.jitter {
                    offset += rand::thread_rng()
                        .gen_range(-self.pacing.dt / 2. ..self.pacing.dt / 2.);
                }
                let target = t0 + Duration::from_secs_f64(offset.max(0.));
                let now = Instant::now();
                if now < target {
                    let sleep_to = match deadline {
                        Some(dl) if dl < target => dl,
                        _ => target,
                    };
                    tokio::select! {
                        _ = tokio::time::sleep_until(sleep_to) => {}
                        _ = self.watch.aborted() => break,
                    }
                    if sleep_to != target {
                        // woke on the run deadline, not the call target
                        break;
                    }
                } else if self.no_catch_up
                    && (now - target).as_secs_f64() >= self.pacing.dt
                {
                    // Skip every missed slot: jump to the first target
                    // still in the future, without compensating.
                    let behind = (now - t0).as_secs_f64()
                        - self.pacing.target_offset(self.k, 0);
                    let skipped_to = (behind / self.pacing.dt).floor() as u64 + 1;
                    debug!(
                        thread = self.k,
                        from = i,
                        to = skipped_to,
                        "behind schedule, skipping slots"
                    );
                    i = skipped_to;
                    continue;
                }
            } else {
                // Unpaced spin: keep the scheduler breathing even when the
                // callee completes without ever awaiting.
                tokio::task::yield_now().await;
            }
            // Under an exact budget, reserve the slot before dispatch so the
            // global total lands on the dot under concurrency.
            if let Some(exact) = &self.exact {
                if exact.fetch_add(1, Ordering::Relaxed) >= self.exactly {
                    break;
                }
            }
            self.one_call().await;
            i += 1;
        }
        self.exit = Instant::now();
    }

    async fn one_call(&mut self) {
        let start = Instant::now();
        let outcome = AssertUnwindSafe(self.callee.run(self.k))
            .catch_unwind()
            .await;
        let elapsed = start.elapsed().as_secs_f64();
        let (ok, status) = match outcome {
            Ok(res) => res,
            Err(_) => {
                error!(thread = self.k, "call panicked; counting as error");
                (false, PANIC_STATUS.to_string())
            }
        };
        self.hist.record(elapsed);
        if !ok {
            self.err_hist.record(elapsed);
        }
        *self.codes.entry(status).or_insert(0) += 1;
        if let Some(live) = &self.live {
            live.record(ok, elapsed * 1000.);
        }
    }
}
