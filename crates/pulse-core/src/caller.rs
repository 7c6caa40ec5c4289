//! Call adapters: the workload implementations behind the [`Runnable`]
//! contract, plus the factory that builds one worker per thread from a run
//! configuration.

use std::time::Duration;

use tracing::debug;

use crate::config::RunConfig;
use crate::runner::{AdapterCounters, RunFuture, Runnable};
use crate::socket::{TcpCaller, UdpCaller};

pub const STATUS_OK: &str = "OK";
pub const STATUS_TIMEOUT: &str = "timeout";

/// Simulated workload: fixed latency, optionally failing every n-th call.
/// Useful as a pacing target with no network in the way.
pub struct MockCaller {
    delay: Duration,
    fail_every: u64,
    calls: u64,
}

impl MockCaller {
    /// `fail_every == 0` never fails.
    pub fn new(delay: Duration, fail_every: u64) -> MockCaller {
        MockCaller {
            delay,
            fail_every,
            calls: 0,
        }
    }
}

impl Runnable for MockCaller {
    fn run(&mut self, _thread_id: usize) -> RunFuture<'_> {
        self.calls += 1;
        let fail = self.fail_every > 0 && self.calls % self.fail_every == 0;
        let delay = self.delay;
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if fail {
                (false, "E1".to_string())
            } else {
                (true, STATUS_OK.to_string())
            }
        })
    }
}

/// HTTP workload: GET (or POST when a payload is set) against a fixed URL,
/// classifying each call by status code.
pub struct HttpCaller {
    client: reqwest::Client,
    url: String,
    payload: Option<String>,
    bytes_sent: i64,
    bytes_received: i64,
}

impl HttpCaller {
    pub fn new(url: &str, timeout: Duration, payload: Option<String>) -> anyhow::Result<HttpCaller> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpCaller {
            client,
            url: url.to_string(),
            payload,
            bytes_sent: 0,
            bytes_received: 0,
        })
    }
}

impl Runnable for HttpCaller {
    fn run(&mut self, thread_id: usize) -> RunFuture<'_> {
        Box::pin(async move {
            debug!(thread = thread_id, url = %self.url, "http call");
            let req = match &self.payload {
                Some(body) => {
                    self.bytes_sent += body.len() as i64;
                    self.client.post(&self.url).body(body.clone())
                }
                None => self.client.get(&self.url),
            };
            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    match resp.bytes().await {
                        Ok(body) => {
                            self.bytes_received += body.len() as i64;
                            (status.is_success(), status.as_u16().to_string())
                        }
                        Err(_) => (false, "read error".to_string()),
                    }
                }
                Err(e) if e.is_timeout() => (false, STATUS_TIMEOUT.to_string()),
                Err(e) if e.is_connect() => (false, "connection refused".to_string()),
                Err(e) => {
                    debug!("http call failed: {e}");
                    (false, "http error".to_string())
                }
            }
        })
    }

    fn counters(&self) -> AdapterCounters {
        AdapterCounters {
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            ..AdapterCounters::default()
        }
    }
}

/// Builds one worker per thread for the configured protocol. Fails before
/// the run starts when the protocol is unsupported or a client cannot be
/// created.
pub fn new_workers(cfg: &RunConfig, num_threads: usize) -> anyhow::Result<Vec<Box<dyn Runnable>>> {
    let timeout = Duration::from_millis(cfg.timeout_ms);
    let mut workers: Vec<Box<dyn Runnable>> = Vec::with_capacity(num_threads);
    for i in 0..num_threads {
        let worker: Box<dyn Runnable> = match cfg.runner.as_str() {
            "mock" => Box::new(MockCaller::new(Duration::from_millis(5), 0)),
            "http" => {
                if cfg.url.is_empty() {
                    anyhow::bail!("target url is required for runner \"http\"");
                }
                Box::new(HttpCaller::new(&cfg.url, timeout, cfg.payload.clone())?)
            }
            "tcp" => Box::new(TcpCaller::new(
                cfg.target_address()?,
                i,
                timeout,
                cfg.payload.as_deref(),
            )),
            "udp" => Box::new(UdpCaller::new(
                cfg.target_address()?,
                i,
                timeout,
                cfg.payload.as_deref(),
            )),
            "grpc" | "kafka" => {
                anyhow::bail!("runner {:?} is not supported in this build", cfg.runner)
            }
            other => anyhow::bail!("unknown runner {other:?}"),
        };
        workers.push(worker);
    }
    Ok(workers)
}
