//! Live run progress: the published snapshot schema, the lossy pub/sub
//! broker, and the per-run monitor that samples [`LiveStatsHandle`] into
//! snapshots.
//!
//! Publishing never blocks on a subscriber: each subscriber has a small
//! bounded buffer and a full buffer just drops that update. Snapshots are
//! cumulative, so a late or lossy observer catches up on the next one.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::live::LiveStatsHandle;
use crate::promtext;
use crate::runner::RunnerResults;

/// Per-subscriber in-flight buffer; a publish that would overflow it is
/// dropped for that subscriber.
pub const SUBSCRIBER_BUFFER: usize = 10;

/// Sliding window length for every time series.
pub const MAX_SERIES_POINTS: usize = 200;

/// How long a terminal snapshot stays queryable before eviction.
pub const EVICTION_GRACE: Duration = Duration::from_secs(10);

const FAST_TICK: Duration = Duration::from_millis(300);
const CONSUMER_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    /// Seconds since run start.
    pub t: f64,
    pub v: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricTimeSeries {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unit: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub color: String,
    #[serde(
        rename = "serviceName",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub service_name: String,
    pub points: Vec<TimeSeriesPoint>,
}

/// A metrics endpoint scraped alongside the run (e.g. the consumer side of
/// a produced topic).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumerServiceConfig {
    #[serde(rename = "type", default)]
    pub service_type: String,
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerServiceInfo {
    #[serde(rename = "type", default)]
    pub service_type: String,
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    pub metrics: Vec<MetricTimeSeries>,
}

/// One published observation of a run, cumulative since start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveProgress {
    pub run_id: i64,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub elapsed_seconds: f64,
    pub expected_seconds: f64,
    pub progress_percent: f64,

    pub requests_total: i64,
    pub requests_success: i64,
    pub requests_error: i64,
    pub current_qps: f64,
    pub target_qps: f64,

    // Latencies in milliseconds. The percentiles are only known once the
    // worker histograms merge, so they stay 0 until the terminal snapshot.
    pub latency_min: f64,
    pub latency_avg: f64,
    pub latency_max: f64,
    pub latency_p50: f64,
    pub latency_p90: f64,
    pub latency_p99: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kafka_messages_sent: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kafka_bytes_sent: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kafka_topic: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kafka_metrics: Vec<MetricTimeSeries>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consumer_metrics: Vec<MetricTimeSeries>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consumer_services: Vec<ConsumerServiceInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl LiveProgress {
    fn new(cfg: &MonitorConfig, start_time: DateTime<Utc>) -> LiveProgress {
        LiveProgress {
            run_id: cfg.run_id,
            status: RunStatus::Running,
            start_time,
            elapsed_seconds: 0.,
            expected_seconds: cfg.expected_seconds,
            progress_percent: 0.,
            requests_total: 0,
            requests_success: 0,
            requests_error: 0,
            current_qps: 0.,
            target_qps: cfg.target_qps,
            latency_min: 0.,
            latency_avg: 0.,
            latency_max: 0.,
            latency_p50: 0.,
            latency_p90: 0.,
            latency_p99: 0.,
            kafka_messages_sent: None,
            kafka_bytes_sent: None,
            kafka_topic: cfg.kafka_topic.clone(),
            kafka_metrics: Vec::new(),
            consumer_metrics: Vec::new(),
            consumer_services: cfg
                .consumer_services
                .iter()
                .map(|svc| ConsumerServiceInfo {
                    service_type: svc.service_type.clone(),
                    name: svc.name.clone(),
                    url: svc.url.clone(),
                    function: svc.function.clone(),
                    metrics: Vec::new(),
                })
                .collect(),
            last_error: None,
        }
    }
}

/// Returned by the polling fallback when no entry exists for a run ID.
pub fn not_found_sentinel() -> serde_json::Value {
    serde_json::json!({ "status": "not_found" })
}

#[derive(Default)]
struct BrokerInner {
    runs: HashMap<i64, LiveProgress>,
    subs: HashMap<i64, Vec<mpsc::Sender<LiveProgress>>>,
}

/// Fan-out of [`LiveProgress`] snapshots keyed by run ID, with a
/// latest-snapshot store for polling observers.
#[derive(Default)]
pub struct ProgressBroker {
    inner: RwLock<BrokerInner>,
}

impl ProgressBroker {
    pub fn new() -> ProgressBroker {
        ProgressBroker::default()
    }

    /// Stores the snapshot as the run's latest and offers it to every
    /// subscriber, dropping it for any whose buffer is full.
    pub fn publish(&self, progress: LiveProgress) {
        let mut inner = match self.inner.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let run_id = progress.run_id;
        if let Some(subs) = inner.subs.get_mut(&run_id) {
            subs.retain(|tx| !tx.is_closed());
            for tx in subs.iter() {
                if tx.try_send(progress.clone()).is_err() {
                    debug!(run_id, "subscriber buffer full, dropping snapshot");
                }
            }
            if subs.is_empty() {
                inner.subs.remove(&run_id);
            }
        }
        inner.runs.insert(run_id, progress);
    }

    /// One-way snapshot stream for a run. Dropping the receiver
    /// unsubscribes; the current snapshot (if any) is delivered first.
    pub fn subscribe(&self, run_id: i64) -> mpsc::Receiver<LiveProgress> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut inner = match self.inner.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(current) = inner.runs.get(&run_id) {
            let _ = tx.try_send(current.clone());
        }
        inner.subs.entry(run_id).or_default().push(tx);
        rx
    }

    /// Latest snapshot for the polling fallback.
    pub fn latest(&self, run_id: i64) -> Option<LiveProgress> {
        let inner = match self.inner.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.runs.get(&run_id).cloned()
    }

    /// Polling response: the latest snapshot, or the not-found sentinel.
    pub fn poll(&self, run_id: i64) -> serde_json::Value {
        match self.latest(run_id) {
            Some(p) => serde_json::to_value(&p).unwrap_or_else(|_| not_found_sentinel()),
            None => not_found_sentinel(),
        }
    }

    /// Drops the run's snapshot and closes all of its subscriber streams.
    pub fn clear(&self, run_id: i64) {
        let mut inner = match self.inner.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.runs.remove(&run_id);
        inner.subs.remove(&run_id);
    }

    /// Clears the run after a grace period so late observers still see the
    /// terminal snapshot.
    pub fn schedule_eviction(self: &Arc<ProgressBroker>, run_id: i64, grace: Duration) {
        let broker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            debug!(run_id, "evicting progress entry");
            broker.clear(run_id);
        });
    }
}

/// Configuration for one run's monitor loop.
#[derive(Debug, Clone, Default)]
pub struct MonitorConfig {
    pub run_id: i64,
    pub target_qps: f64,
    pub expected_seconds: f64,
    pub run_type: String,
    pub kafka_topic: Option<String>,
    pub consumer_services: Vec<ConsumerServiceConfig>,
}

// Fixed palette and ordering for the per-run series charts.
const RUN_SERIES: [(&str, &str, &str, &str); 6] = [
    ("qps", "QPS", "req/s", "#10b981"),
    ("latency_avg", "Avg Latency", "ms", "#3b82f6"),
    ("latency_max", "Max Latency", "ms", "#ef4444"),
    ("messages_total", "Messages Total", "count", "#8b5cf6"),
    ("success", "Success", "count", "#22c55e"),
    ("errors", "Errors", "count", "#dc2626"),
];

const CONSUMER_COLORS: [&str; 7] = [
    "#10b981", "#3b82f6", "#8b5cf6", "#f59e0b", "#ef4444", "#06b6d4", "#ec4899",
];

fn append_point(points: &mut Vec<TimeSeriesPoint>, p: TimeSeriesPoint) {
    points.push(p);
    if points.len() > MAX_SERIES_POINTS {
        points.remove(0);
    }
}

struct SeriesStore {
    run: Vec<MetricTimeSeries>,
    // one map per configured consumer service, in config order
    consumer: Vec<HashMap<String, MetricTimeSeries>>,
    last_total: i64,
    last_total_at: f64,
}

impl SeriesStore {
    fn new(num_services: usize) -> SeriesStore {
        SeriesStore {
            run: RUN_SERIES
                .iter()
                .map(|(name, label, unit, color)| MetricTimeSeries {
                    name: (*name).to_string(),
                    label: (*label).to_string(),
                    unit: (*unit).to_string(),
                    color: (*color).to_string(),
                    service_name: String::new(),
                    points: Vec::new(),
                })
                .collect(),
            consumer: (0..num_services).map(|_| HashMap::new()).collect(),
            last_total: 0,
            last_total_at: 0.,
        }
    }

    fn record_fast_tick(&mut self, elapsed: f64, snap: &crate::live::LiveSnapshot, current_qps: f64) {
        // instantaneous QPS from the delta since the previous tick, falling
        // back to the cumulative rate on the first point
        let instant_qps = if elapsed > self.last_total_at {
            (snap.total - self.last_total) as f64 / (elapsed - self.last_total_at)
        } else {
            current_qps
        };
        let values = [
            instant_qps,
            snap.avg_ms,
            snap.max_ms,
            snap.total as f64,
            snap.success as f64,
            snap.errors as f64,
        ];
        for (series, v) in self.run.iter_mut().zip(values) {
            append_point(&mut series.points, TimeSeriesPoint { t: elapsed, v });
        }
        self.last_total = snap.total;
        self.last_total_at = elapsed;
    }

    fn record_scrape(&mut self, idx: usize, svc: &ConsumerServiceConfig, elapsed: f64, metrics: &[promtext::PromMetric]) {
        let store = &mut self.consumer[idx];
        for m in metrics {
            let next_color = CONSUMER_COLORS[store.len() % CONSUMER_COLORS.len()];
            let series = store.entry(m.name.clone()).or_insert_with(|| MetricTimeSeries {
                name: m.name.clone(),
                label: m.name.clone(),
                unit: String::new(),
                color: next_color.to_string(),
                service_name: svc.name.clone(),
                points: Vec::new(),
            });
            append_point(&mut series.points, TimeSeriesPoint { t: elapsed, v: m.value });
        }
    }

    fn consumer_info(&self, services: &[ConsumerServiceConfig]) -> Vec<ConsumerServiceInfo> {
        services
            .iter()
            .enumerate()
            .map(|(i, svc)| {
                let mut metrics: Vec<MetricTimeSeries> =
                    self.consumer[i].values().cloned().collect();
                metrics.sort_by(|a, b| a.name.cmp(&b.name));
                ConsumerServiceInfo {
                    service_type: svc.service_type.clone(),
                    name: svc.name.clone(),
                    url: svc.url.clone(),
                    function: svc.function.clone(),
                    metrics,
                }
            })
            .collect()
    }
}

/// Handle to a running monitor; [`RunMonitor::stop`] publishes the terminal
/// snapshot and schedules eviction.
pub struct RunMonitor {
    broker: Arc<ProgressBroker>,
    cfg: MonitorConfig,
    start_wall: DateTime<Utc>,
    start: Instant,
    live: Arc<LiveStatsHandle>,
    stop_tx: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<SeriesStore>,
}

/// Spawns the monitor loop for one run: a fast tick samples the live stats
/// into a snapshot, a slow tick scrapes any configured consumer services.
/// An initial `running` snapshot publishes immediately.
pub fn start_monitor(
    broker: Arc<ProgressBroker>,
    live: Arc<LiveStatsHandle>,
    cfg: MonitorConfig,
) -> RunMonitor {
    let start_wall = Utc::now();
    let start = Instant::now();
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    info!(
        run_id = cfg.run_id,
        run_type = %cfg.run_type,
        expected_seconds = cfg.expected_seconds,
        consumer_services = cfg.consumer_services.len(),
        "starting progress monitor"
    );
    broker.publish(LiveProgress::new(&cfg, start_wall));

    let task = {
        let broker = broker.clone();
        let live = live.clone();
        let cfg = cfg.clone();
        tokio::spawn(async move {
            let mut store = SeriesStore::new(cfg.consumer_services.len());
            let mut fast = tokio::time::interval(FAST_TICK);
            let mut slow = tokio::time::interval(CONSUMER_TICK);
            // consume the immediate first tick of each interval
            fast.tick().await;
            slow.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => return store,
                    _ = slow.tick() => {
                        let elapsed = start.elapsed().as_secs_f64();
                        for (i, svc) in cfg.consumer_services.iter().enumerate() {
                            match promtext::fetch_consumer_metrics(&svc.url).await {
                                Ok(metrics) => store.record_scrape(i, svc, elapsed, &metrics),
                                Err(e) => {
                                    debug!(service = %svc.name, "consumer scrape failed: {e}");
                                }
                            }
                        }
                    }
                    _ = fast.tick() => {
                        let elapsed = start.elapsed().as_secs_f64();
                        let snap = live.snapshot();
                        let current_qps = if elapsed > 0.1 {
                            snap.total as f64 / elapsed
                        } else {
                            0.
                        };
                        store.record_fast_tick(elapsed, &snap, current_qps);

                        let mut p = LiveProgress::new(&cfg, start_wall);
                        p.elapsed_seconds = elapsed;
                        // held at 99 while running; only the terminal
                        // snapshot reads 100
                        if cfg.expected_seconds > 0. {
                            p.progress_percent =
                                (elapsed / cfg.expected_seconds * 100.).min(99.);
                        }
                        p.requests_total = snap.total;
                        p.requests_success = snap.success;
                        p.requests_error = snap.errors;
                        p.current_qps = current_qps;
                        p.latency_min = snap.min_ms;
                        p.latency_avg = snap.avg_ms;
                        p.latency_max = snap.max_ms;
                        p.kafka_metrics = store.run.clone();
                        p.consumer_services = store.consumer_info(&cfg.consumer_services);
                        broker.publish(p);
                    }
                }
            }
        })
    };

    RunMonitor {
        broker,
        cfg,
        start_wall,
        start,
        live,
        stop_tx,
        task,
    }
}

impl RunMonitor {
    /// Stops the loop, publishes the terminal snapshot (progress 100,
    /// final percentiles and adapter totals when `results` are available)
    /// and schedules the run's eviction from the broker.
    pub async fn stop(
        self,
        status: RunStatus,
        last_error: Option<String>,
        results: Option<&RunnerResults>,
    ) {
        let _ = self.stop_tx.send(());
        let store = match self.task.await {
            Ok(store) => store,
            Err(e) => {
                warn!(run_id = self.cfg.run_id, "monitor task failed: {e}");
                SeriesStore::new(self.cfg.consumer_services.len())
            }
        };

        let elapsed = self.start.elapsed().as_secs_f64();
        let snap = self.live.snapshot();
        let mut p = LiveProgress::new(&self.cfg, self.start_wall);
        p.status = status;
        p.elapsed_seconds = elapsed;
        p.progress_percent = 100.;
        p.requests_total = snap.total;
        p.requests_success = snap.success;
        p.requests_error = snap.errors;
        p.current_qps = if elapsed > 0. {
            snap.total as f64 / elapsed
        } else {
            0.
        };
        p.latency_min = snap.min_ms;
        p.latency_avg = snap.avg_ms;
        p.latency_max = snap.max_ms;
        p.kafka_metrics = store.run.clone();
        p.consumer_services = store.consumer_info(&self.cfg.consumer_services);
        p.last_error = last_error;
        if let Some(res) = results {
            let hist = &res.duration_histogram;
            if hist.count > 0 {
                p.latency_p50 = hist.calc_percentile(50.) * 1000.;
                p.latency_p90 = hist.calc_percentile(90.) * 1000.;
                p.latency_p99 = hist.calc_percentile(99.) * 1000.;
            }
            if res.counters.messages_sent > 0 {
                p.kafka_messages_sent = Some(res.counters.messages_sent);
                p.kafka_bytes_sent = Some(res.counters.bytes_sent);
            }
        }
        info!(
            run_id = self.cfg.run_id,
            total = p.requests_total,
            qps = p.current_qps,
            status = ?status,
            "progress monitor completed"
        );
        self.broker.publish(p);
        self.broker.schedule_eviction(self.cfg.run_id, EVICTION_GRACE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(run_id: i64, elapsed: f64) -> LiveProgress {
        let mut p = LiveProgress::new(
            &MonitorConfig {
                run_id,
                ..MonitorConfig::default()
            },
            Utc::now(),
        );
        p.elapsed_seconds = elapsed;
        p
    }

    #[tokio::test]
    async fn publish_subscribe_and_latest() {
        let broker = ProgressBroker::new();
        let mut rx = broker.subscribe(7);
        broker.publish(snapshot(7, 0.3));
        broker.publish(snapshot(7, 0.6));
        assert_eq!(rx.recv().await.unwrap().elapsed_seconds, 0.3);
        assert_eq!(rx.recv().await.unwrap().elapsed_seconds, 0.6);
        assert_eq!(broker.latest(7).unwrap().elapsed_seconds, 0.6);
        assert!(broker.latest(8).is_none());
    }

    #[tokio::test]
    async fn subscriber_gets_current_state_on_subscribe() {
        let broker = ProgressBroker::new();
        broker.publish(snapshot(1, 1.0));
        let mut rx = broker.subscribe(1);
        assert_eq!(rx.recv().await.unwrap().elapsed_seconds, 1.0);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_but_keeps_order() {
        let broker = ProgressBroker::new();
        let mut rx = broker.subscribe(1);
        for i in 0..25 {
            broker.publish(snapshot(1, i as f64));
        }
        let mut seen = Vec::new();
        while let Ok(p) = rx.try_recv() {
            seen.push(p.elapsed_seconds);
        }
        // buffer holds the first SUBSCRIBER_BUFFER snapshots; later ones
        // were dropped, and order is preserved
        assert_eq!(seen.len(), SUBSCRIBER_BUFFER);
        let mut sorted = seen.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(seen, sorted);
    }

    #[tokio::test]
    async fn clear_closes_streams() {
        let broker = ProgressBroker::new();
        let mut rx = broker.subscribe(1);
        broker.publish(snapshot(1, 0.5));
        broker.clear(1);
        assert_eq!(rx.recv().await.unwrap().elapsed_seconds, 0.5);
        assert!(rx.recv().await.is_none());
        assert!(broker.latest(1).is_none());
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let broker = ProgressBroker::new();
        let rx = broker.subscribe(1);
        drop(rx);
        broker.publish(snapshot(1, 0.1));
        let inner = broker.inner.read().unwrap();
        assert!(!inner.subs.contains_key(&1));
    }

    #[test]
    fn poll_returns_sentinel_when_missing() {
        let broker = ProgressBroker::new();
        assert_eq!(broker.poll(42), serde_json::json!({"status": "not_found"}));
    }

    #[test]
    fn wire_schema_field_names() {
        let mut p = snapshot(3, 1.5);
        p.last_error = Some("boom".to_string());
        p.kafka_topic = Some("t".to_string());
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["runId"], 3);
        assert_eq!(v["status"], "running");
        assert_eq!(v["elapsedSeconds"], 1.5);
        assert!(v["startTime"].as_str().unwrap().contains('T'));
        assert_eq!(v["lastError"], "boom");
        assert_eq!(v["kafkaTopic"], "t");
        assert!(v.get("kafkaMessagesSent").is_none());
        assert!(v.get("progressPercent").is_some());
        assert!(v.get("latencyP50").is_some());
    }

    #[test]
    fn series_window_is_bounded() {
        let mut points = Vec::new();
        for i in 0..(MAX_SERIES_POINTS + 50) {
            append_point(&mut points, TimeSeriesPoint { t: i as f64, v: 0. });
        }
        assert_eq!(points.len(), MAX_SERIES_POINTS);
        assert_eq!(points[0].t, 50.);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_publishes_and_terminates() {
        let broker = Arc::new(ProgressBroker::new());
        let live = Arc::new(LiveStatsHandle::new());
        let mut rx = broker.subscribe(9);
        let monitor = start_monitor(
            broker.clone(),
            live.clone(),
            MonitorConfig {
                run_id: 9,
                target_qps: 10.,
                expected_seconds: 60.,
                run_type: "mock".to_string(),
                ..MonitorConfig::default()
            },
        );
        live.record(true, 5.);
        live.record(false, 15.);
        tokio::time::sleep(Duration::from_millis(950)).await;
        monitor.stop(RunStatus::Completed, None, None).await;

        // terminal snapshot is queryable right after stop
        let terminal = broker.latest(9).expect("terminal snapshot");
        assert_eq!(terminal.status, RunStatus::Completed);
        assert_eq!(terminal.progress_percent, 100.);
        assert_eq!(terminal.requests_total, 2);
        assert_eq!(terminal.requests_success, 1);
        assert_eq!(terminal.requests_error, 1);

        // the stream delivered snapshots in elapsed order, running ones
        // held under 100, and ends with the terminal one
        let mut last = None;
        let mut prev_elapsed = -1.;
        while let Some(p) = rx.recv().await {
            assert!(p.elapsed_seconds >= prev_elapsed, "snapshots out of order");
            prev_elapsed = p.elapsed_seconds;
            if p.status == RunStatus::Running {
                assert!(p.progress_percent <= 99.);
            }
            last = Some(p);
        }
        assert_eq!(last.expect("snapshots").status, RunStatus::Completed);

        // draining the stream rode through the eviction grace period; the
        // run entry is gone now
        tokio::time::sleep(EVICTION_GRACE + Duration::from_secs(1)).await;
        assert!(broker.latest(9).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_error_status_carries_message() {
        let broker = Arc::new(ProgressBroker::new());
        let live = Arc::new(LiveStatsHandle::new());
        let monitor = start_monitor(
            broker.clone(),
            live,
            MonitorConfig {
                run_id: 4,
                ..MonitorConfig::default()
            },
        );
        monitor
            .stop(RunStatus::Error, Some("connect refused".to_string()), None)
            .await;
        let last = broker.latest(4).unwrap();
        assert_eq!(last.status, RunStatus::Error);
        assert_eq!(last.last_error.as_deref(), Some("connect refused"));
    }
}
