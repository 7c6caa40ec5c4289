//! Core engine shared by the loadpulse binaries: a rate-paced multi-worker
//! call runner, the latency histogram it aggregates into, and the live
//! progress channel observers subscribe to.
//!
//! Hard rules:
//! - Workers own their statistics; nothing in the hot loop takes a lock
//! - Cancellation is broadcast and idempotent; every sleep selects on it
//! - Publishing progress never blocks on a slow observer

pub mod abort;
pub mod caller;
pub mod config;
pub mod live;
pub mod progress;
pub mod promtext;
pub mod registry;
pub mod runner;
pub mod socket;
pub mod stats;

pub use abort::{AbortWatch, Aborter};
pub use caller::{new_workers, HttpCaller, MockCaller};
pub use config::RunConfig;
pub use live::{LiveSnapshot, LiveStatsHandle};
pub use progress::{
    start_monitor, ConsumerServiceConfig, LiveProgress, MetricTimeSeries, MonitorConfig,
    ProgressBroker, RunMonitor, RunStatus, TimeSeriesPoint,
};
pub use promtext::{fetch_consumer_metrics, parse_prometheus_metrics, PromMetric};
pub use registry::{Registry, RunSummary};
pub use runner::{
    AdapterCounters, PeriodicRunner, RunFuture, Runnable, RunnerOptions, RunnerResults,
};
pub use socket::{TcpCaller, UdpCaller};
pub use stats::{
    merge_histograms, parse_percentiles, Bucket, Counter, Histogram, HistogramData, Percentile,
    ResultCodeMap,
};
