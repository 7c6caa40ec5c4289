//! TCP and UDP echo workloads.
//!
//! Each worker owns one client; the client connects lazily, reuses its
//! socket across calls, and reconnects once when a previously-idle socket
//! turns out dead. A call writes a payload and expects it echoed back
//! verbatim within the request timeout.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info};

use crate::runner::{AdapterCounters, RunFuture, Runnable};

pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_millis(750);

const STATUS_OK: &str = "OK";
const ERR_TIMEOUT: &str = "timeout";
const ERR_SHORT_READ: &str = "short read";
const ERR_MISMATCH: &str = "read not echoing writes";
const ERR_CONNECT: &str = "connection error";

/// Self-describing payload so mixed-up echoes are detectable: the
/// connection id and the message sequence number are baked in.
pub fn generate_payload(conn_id: usize, n: i64) -> Vec<u8> {
    format!("pulse{:04}x{:012}\n", conn_id % 10_000, n).into_bytes()
}

pub struct TcpCaller {
    dest: String,
    conn_id: usize,
    timeout: Duration,
    payload: Option<Vec<u8>>,
    socket: Option<TcpStream>,
    message_count: i64,
    socket_count: i64,
    bytes_sent: i64,
    bytes_received: i64,
}

impl TcpCaller {
    pub fn new(dest: String, conn_id: usize, timeout: Duration, payload: Option<&str>) -> TcpCaller {
        let timeout = if timeout.is_zero() {
            DEFAULT_SOCKET_TIMEOUT
        } else {
            timeout
        };
        TcpCaller {
            dest,
            conn_id,
            timeout,
            payload: payload.map(|p| p.as_bytes().to_vec()),
            socket: None,
            message_count: 0,
            socket_count: 0,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    async fn fetch(&mut self) -> Result<(), &'static str> {
        self.message_count += 1;
        let req = match &self.payload {
            Some(p) => p.clone(),
            None => generate_payload(self.conn_id, self.message_count),
        };
        // one retry when a reused socket died while idle
        let mut reused = self.socket.is_some();
        loop {
            let mut conn = match self.socket.take() {
                Some(c) => c,
                None => {
                    self.socket_count += 1;
                    match TcpStream::connect(&self.dest).await {
                        Ok(c) => c,
                        Err(e) => {
                            debug!(dest = %self.dest, "connect failed: {e}");
                            return Err(ERR_CONNECT);
                        }
                    }
                }
            };
            match self.exchange(&mut conn, &req).await {
                Ok(()) => {
                    self.socket = Some(conn);
                    return Ok(());
                }
                Err(e) if e == ERR_CONNECT && reused => {
                    info!(dest = %self.dest, "closing dead socket, reconnecting");
                    reused = false;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn exchange(&mut self, conn: &mut TcpStream, req: &[u8]) -> Result<(), &'static str> {
        match conn.write_all(req).await {
            Ok(()) => self.bytes_sent += req.len() as i64,
            Err(_) => return Err(ERR_CONNECT),
        }
        let mut buf = vec![0u8; req.len()];
        let mut read = 0usize;
        while read < buf.len() {
            let n = match tokio::time::timeout(self.timeout, conn.read(&mut buf[read..])).await {
                Ok(Ok(0)) => {
                    self.bytes_received += read as i64;
                    return Err(ERR_SHORT_READ);
                }
                Ok(Ok(n)) => n,
                Ok(Err(_)) => return Err(ERR_CONNECT),
                Err(_) => {
                    self.bytes_received += read as i64;
                    return Err(ERR_TIMEOUT);
                }
            };
            read += n;
        }
        self.bytes_received += read as i64;
        if buf != req {
            debug!("echo mismatch: sent {req:?} received {buf:?}");
            return Err(ERR_MISMATCH);
        }
        Ok(())
    }
}

impl Runnable for TcpCaller {
    fn run(&mut self, _thread_id: usize) -> RunFuture<'_> {
        Box::pin(async move {
            match self.fetch().await {
                Ok(()) => (true, STATUS_OK.to_string()),
                Err(e) => (false, e.to_string()),
            }
        })
    }

    fn counters(&self) -> AdapterCounters {
        AdapterCounters {
            socket_count: self.socket_count,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            ..AdapterCounters::default()
        }
    }
}

pub struct UdpCaller {
    dest: String,
    conn_id: usize,
    timeout: Duration,
    payload: Option<Vec<u8>>,
    socket: Option<UdpSocket>,
    message_count: i64,
    socket_count: i64,
    bytes_sent: i64,
    bytes_received: i64,
}

impl UdpCaller {
    pub fn new(dest: String, conn_id: usize, timeout: Duration, payload: Option<&str>) -> UdpCaller {
        let timeout = if timeout.is_zero() {
            DEFAULT_SOCKET_TIMEOUT
        } else {
            timeout
        };
        UdpCaller {
            dest,
            conn_id,
            timeout,
            payload: payload.map(|p| p.as_bytes().to_vec()),
            socket: None,
            message_count: 0,
            socket_count: 0,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    async fn fetch(&mut self) -> Result<(), &'static str> {
        self.message_count += 1;
        let req = match &self.payload {
            Some(p) => p.clone(),
            None => generate_payload(self.conn_id, self.message_count),
        };
        if self.socket.is_none() {
            self.socket_count += 1;
            let sock = match UdpSocket::bind("0.0.0.0:0").await {
                Ok(s) => s,
                Err(_) => return Err(ERR_CONNECT),
            };
            if sock.connect(&self.dest).await.is_err() {
                return Err(ERR_CONNECT);
            }
            self.socket = Some(sock);
        }
        let sock = self.socket.as_ref().ok_or(ERR_CONNECT)?;
        match sock.send(&req).await {
            Ok(n) => self.bytes_sent += n as i64,
            Err(_) => {
                self.socket = None;
                return Err(ERR_CONNECT);
            }
        }
        let mut buf = vec![0u8; req.len() + 1];
        let n = match tokio::time::timeout(self.timeout, sock.recv(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(_)) => {
                self.socket = None;
                return Err(ERR_CONNECT);
            }
            Err(_) => return Err(ERR_TIMEOUT),
        };
        self.bytes_received += n as i64;
        if n < req.len() {
            return Err(ERR_SHORT_READ);
        }
        if buf[..n] != req[..] {
            return Err(ERR_MISMATCH);
        }
        Ok(())
    }
}

impl Runnable for UdpCaller {
    fn run(&mut self, _thread_id: usize) -> RunFuture<'_> {
        Box::pin(async move {
            match self.fetch().await {
                Ok(()) => (true, STATUS_OK.to_string()),
                Err(e) => (false, e.to_string()),
            }
        })
    }

    fn counters(&self) -> AdapterCounters {
        AdapterCounters {
            socket_count: self.socket_count,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            ..AdapterCounters::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn spawn_tcp_echo() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    while let Ok(n) = sock.read(&mut buf).await {
                        if n == 0 || sock.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    async fn spawn_udp_echo() -> String {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            while let Ok((n, peer)) = sock.recv_from(&mut buf).await {
                let _ = sock.send_to(&buf[..n], peer).await;
            }
        });
        addr
    }

    #[test]
    fn payload_encodes_ids() {
        let p = generate_payload(3, 42);
        let s = String::from_utf8(p.clone()).unwrap();
        assert!(s.starts_with("pulse0003x"));
        assert!(s.contains("42"));
        assert_ne!(p, generate_payload(3, 43));
    }

    #[tokio::test]
    async fn tcp_echo_roundtrip_reuses_socket() {
        let addr = spawn_tcp_echo().await;
        let mut c = TcpCaller::new(addr, 0, Duration::from_secs(1), None);
        for _ in 0..3 {
            let (ok, status) = c.run(0).await;
            assert!(ok, "status {status}");
            assert_eq!(status, STATUS_OK);
        }
        let counters = c.counters();
        assert_eq!(counters.socket_count, 1);
        assert!(counters.bytes_sent > 0);
        assert_eq!(counters.bytes_sent, counters.bytes_received);
    }

    #[tokio::test]
    async fn tcp_connect_failure_is_an_error_key() {
        let mut c = TcpCaller::new(
            "127.0.0.1:9".to_string(),
            0,
            Duration::from_millis(300),
            None,
        );
        let (ok, status) = c.run(0).await;
        assert!(!ok);
        assert_eq!(status, ERR_CONNECT);
    }

    #[tokio::test]
    async fn udp_echo_roundtrip() {
        let addr = spawn_udp_echo().await;
        let mut c = UdpCaller::new(addr, 1, Duration::from_secs(1), Some("hello"));
        let (ok, status) = c.run(0).await;
        assert!(ok, "status {status}");
        let counters = c.counters();
        assert_eq!(counters.socket_count, 1);
        assert_eq!(counters.bytes_sent, 5);
        assert_eq!(counters.bytes_received, 5);
    }

    #[tokio::test]
    async fn udp_times_out_without_a_peer() {
        // bind a socket that never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap().to_string();
        let mut c = UdpCaller::new(addr, 0, Duration::from_millis(100), None);
        let (ok, status) = c.run(0).await;
        assert!(!ok);
        assert_eq!(status, ERR_TIMEOUT);
    }
}
