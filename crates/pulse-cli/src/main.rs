use anyhow::{Context, Result};
use clap::Parser;
use pulse_core::progress::{start_monitor, MonitorConfig, RunStatus};
use pulse_core::registry::Registry;
use pulse_core::runner::PeriodicRunner;
use pulse_core::{new_workers, LiveProgress, RunConfig, RunnerResults};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "pulse")]
#[command(about = "Multi-protocol load generator with live progress")]
struct Args {
    /// Path to a TOML run configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Protocol adapter: mock, http, tcp or udp
    #[arg(long)]
    runner: Option<String>,

    /// Target URL (tcp:// and udp:// prefixes select the socket adapters)
    #[arg(long)]
    url: Option<String>,

    /// Target calls/sec across the whole run; <= 0 runs unpaced
    #[arg(long)]
    qps: Option<f64>,

    /// Worker count
    #[arg(short = 'c', long)]
    connections: Option<usize>,

    /// Duration in seconds; negative runs until -n completes or ctrl-c
    #[arg(short = 't', long)]
    duration: Option<f64>,

    /// Exact total number of calls (overrides duration)
    #[arg(short = 'n', long)]
    exactly: Option<i64>,

    /// Comma-separated percentiles to report, each in (0,100)
    #[arg(short = 'p', long)]
    percentiles: Option<String>,

    /// Label string attached to the result
    #[arg(long)]
    labels: Option<String>,

    #[arg(long)]
    jitter: bool,

    #[arg(long)]
    uniform: bool,

    #[arg(long)]
    nocatchup: bool,

    /// Persist the JSON result to the data directory
    #[arg(long)]
    save: bool,

    /// Directory for persisted JSON results
    #[arg(long, default_value = "results")]
    data_dir: PathBuf,

    /// Print a progress line every N milliseconds
    #[arg(long, default_value = "1000")]
    print_every_ms: u64,
}

impl Args {
    fn into_config(self) -> Result<(RunConfig, PathBuf, u64)> {
        let mut cfg = match &self.config {
            Some(path) => RunConfig::from_file(path)
                .with_context(|| format!("Failed to load config from {:?}", path))?,
            None => RunConfig::default(),
        };
        if let Some(runner) = self.runner {
            cfg.runner = runner;
        }
        if let Some(url) = self.url {
            cfg.url = url;
        }
        if let Some(qps) = self.qps {
            cfg.qps = qps;
        }
        if let Some(c) = self.connections {
            cfg.c = c;
        }
        if let Some(t) = self.duration {
            cfg.t = t;
        }
        if let Some(n) = self.exactly {
            cfg.n = n;
        }
        if let Some(p) = self.percentiles {
            cfg.p = p;
        }
        if let Some(labels) = self.labels {
            cfg.labels = labels;
        }
        cfg.jitter |= self.jitter;
        cfg.uniform |= self.uniform;
        cfg.nocatchup |= self.nocatchup;
        cfg.save |= self.save;
        Ok((cfg, self.data_dir, self.print_every_ms))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let (cfg, data_dir, print_every_ms) = args.into_config()?;

    let registry = Arc::new(Registry::new(data_dir));
    let run_id = match cfg.runid {
        Some(id) => id,
        None => registry.next_run_id(),
    };
    info!(
        "Starting {} run {} against {:?} at {} qps with {} workers",
        cfg.runner, run_id, cfg.url, cfg.qps, cfg.c
    );

    let result = execute_run(&cfg, run_id, &registry, print_every_ms).await?;

    if cfg.save {
        let path = registry.save_result(&result)?;
        info!("Results written to {}", path.display());
    }
    print_summary(&result);
    Ok(())
}

async fn execute_run(
    cfg: &RunConfig,
    run_id: i64,
    registry: &Arc<Registry>,
    print_every_ms: u64,
) -> Result<RunnerResults> {
    // Configuration errors surface before any run state exists.
    let opts = cfg.to_runner_options(run_id)?;
    let runner = PeriodicRunner::new(opts)?;
    let num_threads = runner.options().num_threads;

    let (aborter, live) = registry.register(run_id, &cfg.runner, &cfg.labels);
    let runner = runner.with_aborter(aborter).with_live_stats(live.clone());

    // ctrl-c aborts the run; the run then winds down gracefully
    {
        let registry = registry.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping run {run_id}");
                registry.stop_by_run_id(run_id);
            }
        });
    }

    let broker = registry.broker();
    let monitor = start_monitor(
        broker.clone(),
        live,
        MonitorConfig {
            run_id,
            target_qps: cfg.qps,
            expected_seconds: cfg.expected_seconds(),
            run_type: cfg.runner.clone(),
            kafka_topic: None,
            consumer_services: cfg.consumer_services.clone(),
        },
    );

    // Pre-flight: client construction. The run exists by now, so a failure
    // here still publishes a terminal error snapshot.
    let workers = match new_workers(cfg, num_threads) {
        Ok(workers) => workers,
        Err(e) => {
            monitor
                .stop(RunStatus::Error, Some(e.to_string()), None)
                .await;
            registry.finish(run_id);
            return Err(e);
        }
    };

    // terminal progress printing rides the same subscription observers use
    let progress_printer = {
        let mut rx = broker.subscribe(run_id);
        tokio::spawn(async move {
            let interval = Duration::from_millis(print_every_ms);
            let mut last_print: Option<tokio::time::Instant> = None;
            while let Some(p) = rx.recv().await {
                if last_print.map_or(true, |t| t.elapsed() >= interval) {
                    print_progress(&p);
                    last_print = Some(tokio::time::Instant::now());
                }
            }
        })
    };

    let outcome = runner.run(workers).await;
    match &outcome {
        Ok(results) => {
            monitor
                .stop(RunStatus::Completed, None, Some(results))
                .await;
        }
        Err(e) => {
            monitor
                .stop(RunStatus::Error, Some(e.to_string()), None)
                .await;
        }
    }
    registry.finish(run_id);
    progress_printer.abort();
    outcome
}

fn print_progress(p: &LiveProgress) {
    info!(
        "Progress: {:.0}% total={} success={} errors={} qps={:.1} avg={:.2}ms min={:.2}ms max={:.2}ms",
        p.progress_percent,
        p.requests_total,
        p.requests_success,
        p.requests_error,
        p.current_qps,
        p.latency_avg,
        p.latency_min,
        p.latency_max
    );
}

fn print_summary(res: &RunnerResults) {
    let hist = &res.duration_histogram;
    println!("\n=== Run {} ({}) Summary ===", res.run_id, res.run_type);
    println!("Requested: {} qps for {}", res.requested_qps, res.requested_duration);
    println!("Calls: {}", res.total_calls());
    println!("Errors: {}", res.error_calls());
    println!("Actual duration: {:.3}s", res.actual_duration);
    println!("Actual QPS: {:.1}", res.actual_qps);
    if hist.count > 0 {
        println!(
            "Latency: avg {:.3}ms min {:.3}ms max {:.3}ms",
            hist.avg * 1000.,
            hist.min * 1000.,
            hist.max * 1000.
        );
        for p in &hist.percentiles {
            println!("  p{} = {:.3}ms", p.percentile, p.value * 1000.);
        }
    }
    let total = hist.count.max(1) as f64;
    let mut keys: Vec<&String> = res.ret_codes.keys().collect();
    keys.sort();
    for k in keys {
        let count = res.ret_codes[k];
        println!("{} {} : {} ({:.1} %)", res.run_type, k, count, 100. * count as f64 / total);
    }
    if res.counters.socket_count > 0 {
        println!(
            "Sockets used: {} (for perfect no error run, would be {})",
            res.counters.socket_count, res.num_threads
        );
    }
    if res.counters.bytes_sent > 0 || res.counters.bytes_received > 0 {
        println!(
            "Total Bytes sent: {}, received: {}",
            res.counters.bytes_sent, res.counters.bytes_received
        );
    }
    println!();
}
