//! Simple HTTP health and metrics server (synchronous)
//!
//! Connections are accepted on the calling thread and answered by tasks on a
//! small [`Executor`].

use crate::concurrency::Executor;
use crate::config::MetricsConfig;
use crate::error::SubmitError;
use crate::metrics::Metrics;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long the accept loop sleeps when no connection is pending
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Health server state
pub struct HealthServer {
    metrics: Arc<Metrics>,
    pool: Executor,
    ready: AtomicBool,
    running: AtomicBool,
}

impl HealthServer {
    /// Create a new health server answering requests on `pool`
    pub fn new(metrics: Arc<Metrics>, pool: Executor) -> Self {
        Self {
            metrics,
            pool,
            ready: AtomicBool::new(false),
            running: AtomicBool::new(true),
        }
    }

    /// Set the ready state
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Check if the server is ready
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Stop the server
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Bind the configured address
    pub fn bind(config: &MetricsConfig) -> std::io::Result<TcpListener> {
        let listener = TcpListener::bind(&config.listen_addr)?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    }

    /// Serve until [`stop`](Self::stop) (blocking, run in separate thread)
    pub fn run(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        self.pool
            .start()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        info!("Health server listening on {}", listener.local_addr()?);

        while self.running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _)) => self.dispatch(stream),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    error!("Health server accept error: {}", e);
                }
            }
        }

        self.pool.stop(true);
        info!("Health server stopped");
        Ok(())
    }

    fn dispatch(self: &Arc<Self>, stream: TcpStream) {
        let server = Arc::clone(self);
        let fallback = stream.try_clone();
        let submitted = self.pool.execute(move || {
            if let Err(e) = server.handle_connection(stream) {
                debug!("Health connection error: {}", e);
            }
        });

        if let Err(SubmitError::QueueFull) = submitted {
            warn!("Health server overloaded, rejecting request");
            if let Ok(mut stream) = fallback {
                let _ = self.send_response(&mut stream, 503, "text/plain", "Service Unavailable");
            }
        }
    }

    /// Handle a single HTTP connection
    fn handle_connection(&self, mut stream: TcpStream) -> std::io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;

        let mut reader = BufReader::new(&stream);
        let mut request_line = String::new();
        reader.read_line(&mut request_line)?;

        // Parse simple HTTP request: "GET /path HTTP/1.1"
        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() < 2 {
            return self.send_response(&mut stream, 400, "text/plain", "Bad Request");
        }

        let method = parts[0];
        let path = parts[1];

        if method != "GET" {
            return self.send_response(&mut stream, 405, "text/plain", "Method Not Allowed");
        }

        match path {
            "/health" | "/healthz" => {
                let body = format!(
                    r#"{{"status":"healthy","active_connections":{},"health_pool":{{"threads":{},"queued":{}}}}}"#,
                    self.metrics.active_connections.get(),
                    self.pool.threads(),
                    self.pool.queue_len(),
                );
                self.send_response(&mut stream, 200, "application/json", &body)
            }
            "/ready" | "/readyz" => {
                if self.is_ready() {
                    self.send_response(&mut stream, 200, "application/json", r#"{"status":"ready"}"#)
                } else {
                    self.send_response(&mut stream, 503, "application/json", r#"{"status":"not ready"}"#)
                }
            }
            "/metrics" => {
                let metrics = self.metrics.gather();
                self.send_response(&mut stream, 200, "text/plain; version=0.0.4", &metrics)
            }
            _ => self.send_response(&mut stream, 404, "text/plain", "Not Found"),
        }
    }

    /// Send HTTP response
    fn send_response(
        &self,
        stream: &mut TcpStream,
        status: u16,
        content_type: &str,
        body: &str,
    ) -> std::io::Result<()> {
        let status_text = match status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            405 => "Method Not Allowed",
            503 => "Service Unavailable",
            _ => "Unknown",
        };

        let response = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            status_text,
            content_type,
            body.len(),
            body
        );

        stream.write_all(response.as_bytes())?;
        stream.flush()
    }
}
