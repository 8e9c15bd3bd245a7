//! SSE broadcaster — the outbound half of server-sent events.
//!
//! The inbound half (parsing an upstream provider's SSE stream) lives on
//! each `Adapter::execute_stream`, reusing `eventsource-stream`'s line
//! state machine. This module is the client-facing fan-out: one bounded
//! channel per registered client, a heartbeat janitor, and a hard cap on
//! concurrent clients.

use crate::config::SseConfig;
use crate::metrics::GatewayMetrics;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn data(data: impl Into<String>) -> Self {
        Self { event: None, data: data.into() }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self { event: Some(event.into()), data: data.into() }
    }

    /// Renders the wire form: `event: <name>\ndata: <line>\n...\n\n`, one
    /// `data:` line per newline in the payload per the SSE spec.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

struct Client {
    sender: mpsc::Sender<SseFrame>,
    last_seen: std::sync::Mutex<Instant>,
}

/// Tracks per-client backpressure drops so an admin surface can alert on a
/// client that's falling behind instead of silently losing events.
pub struct Broadcaster {
    config: SseConfig,
    clients: DashMap<String, Client>,
    dropped_total: AtomicU64,
    metrics: Arc<GatewayMetrics>,
}

impl Broadcaster {
    pub fn new(config: SseConfig, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            config,
            clients: DashMap::new(),
            dropped_total: AtomicU64::new(0),
            metrics,
        }
    }

    /// Registers a new client, returning the receiving half it should poll.
    /// Returns `None` if `max_clients` is already at capacity.
    pub fn register(&self, client_id: impl Into<String>) -> Option<mpsc::Receiver<SseFrame>> {
        if self.clients.len() >= self.config.max_clients {
            warn!("sse client cap reached ({}); rejecting new connection", self.config.max_clients);
            return None;
        }
        let (tx, rx) = mpsc::channel(self.config.outbound_buffer);
        self.clients.insert(
            client_id.into(),
            Client { sender: tx, last_seen: std::sync::Mutex::new(Instant::now()) },
        );
        Some(rx)
    }

    pub fn unregister(&self, client_id: &str) {
        self.clients.remove(client_id);
    }

    /// Sends to one client. A full outbound buffer is dropped, not
    /// awaited-for-space: a slow client must never stall the pipeline
    /// feeding it.
    pub fn send(&self, client_id: &str, frame: SseFrame) {
        let Some(client) = self.clients.get(client_id) else { return };
        *client.last_seen.lock().unwrap() = Instant::now();
        if client.sender.try_send(frame).is_err() {
            self.dropped_total.fetch_add(1, Ordering::SeqCst);
            self.metrics.sse_dropped.fetch_add(1, Ordering::Relaxed);
            debug!("dropped sse frame for client {client_id}: outbound buffer full");
        }
    }

    pub fn broadcast(&self, frame: SseFrame) {
        for entry in self.clients.iter() {
            *entry.value().last_seen.lock().unwrap() = Instant::now();
            if entry.value().sender.try_send(frame.clone()).is_err() {
                self.dropped_total.fetch_add(1, Ordering::SeqCst);
                self.metrics.sse_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::SeqCst)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Sends a heartbeat comment frame to every client and evicts anyone
    /// silent past `client_timeout_secs`. Meant to run on its own ticker.
    pub fn heartbeat_sweep(&self) {
        let timeout = Duration::from_secs(self.config.client_timeout_secs);
        let now = Instant::now();
        let mut stale = Vec::new();
        for entry in self.clients.iter() {
            let last_seen = *entry.value().last_seen.lock().unwrap();
            if now.duration_since(last_seen) > timeout {
                stale.push(entry.key().clone());
                continue;
            }
            let _ = entry.value().sender.try_send(SseFrame::data(": heartbeat"));
        }
        for id in stale {
            debug!("evicting idle sse client {id}");
            self.clients.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_wire_format_has_trailing_blank_line() {
        let frame = SseFrame::named("message", "hello\nworld");
        let wire = frame.to_wire();
        assert_eq!(wire, "event: message\ndata: hello\ndata: world\n\n");
    }

    #[tokio::test]
    async fn register_respects_max_clients() {
        let mut cfg = SseConfig::default();
        cfg.max_clients = 1;
        let broadcaster = Broadcaster::new(cfg, Arc::new(GatewayMetrics::new()));
        assert!(broadcaster.register("a").is_some());
        assert!(broadcaster.register("b").is_none());
    }

    #[tokio::test]
    async fn send_delivers_to_registered_client() {
        let broadcaster = Broadcaster::new(SseConfig::default(), Arc::new(GatewayMetrics::new()));
        let mut rx = broadcaster.register("a").unwrap();
        broadcaster.send("a", SseFrame::data("payload"));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.data, "payload");
    }

    #[tokio::test]
    async fn full_buffer_drops_and_counts() {
        let mut cfg = SseConfig::default();
        cfg.outbound_buffer = 1;
        let metrics = Arc::new(GatewayMetrics::new());
        let broadcaster = Broadcaster::new(cfg, metrics.clone());
        let _rx = broadcaster.register("a").unwrap();
        broadcaster.send("a", SseFrame::data("first"));
        broadcaster.send("a", SseFrame::data("second"));
        assert_eq!(broadcaster.dropped_total(), 1);
        assert_eq!(metrics.snapshot().sse_dropped, 1);
    }

    #[tokio::test]
    async fn unregister_removes_client() {
        let broadcaster = Broadcaster::new(SseConfig::default(), Arc::new(GatewayMetrics::new()));
        broadcaster.register("a").unwrap();
        broadcaster.unregister("a");
        assert_eq!(broadcaster.client_count(), 0);
    }
}
