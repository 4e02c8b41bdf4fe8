//! In-process WebSocket fan-out hub. Lives in the API process, not the
//! worker: it subscribes to the substrate's progress channels and forwards
//! each payload to the matching per-job and global subscriber buckets.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

pub type Sink = mpsc::UnboundedSender<String>;

#[derive(Default)]
struct Buckets {
    scan: HashMap<String, Vec<Sink>>,
    firmware: HashMap<String, Vec<Sink>>,
    global: Vec<Sink>,
}

/// Subscriber registry plus delivery. A background task (spawned by the API
/// collaborator, not started here) drains the substrate's pub/sub stream and
/// calls `deliver` for each `(channel, payload)` pair.
pub struct BroadcastHub {
    buckets: Mutex<Buckets>,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self {
            buckets: Mutex::new(Buckets::default()),
        }
    }
}

impl BroadcastHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn connect_scan(&self, scan_id: &str, sink: Sink) {
        let mut b = self.buckets.lock().await;
        b.scan.entry(scan_id.to_string()).or_default().push(sink);
    }

    pub async fn connect_firmware(&self, analysis_id: &str, sink: Sink) {
        let mut b = self.buckets.lock().await;
        b.firmware.entry(analysis_id.to_string()).or_default().push(sink);
    }

    pub async fn connect_global(&self, sink: Sink) {
        let mut b = self.buckets.lock().await;
        b.global.push(sink);
    }

    /// Drop closed sinks for a scan/firmware id; called by the disconnect
    /// handler of the external WebSocket collaborator.
    pub async fn disconnect_scan(&self, scan_id: &str) {
        let mut b = self.buckets.lock().await;
        if let Some(v) = b.scan.get_mut(scan_id) {
            v.retain(|s| !s.is_closed());
        }
    }

    pub async fn disconnect_firmware(&self, analysis_id: &str) {
        let mut b = self.buckets.lock().await;
        if let Some(v) = b.firmware.get_mut(analysis_id) {
            v.retain(|s| !s.is_closed());
        }
    }

    /// Parse `channel` as `soc:scan:<id>` or `soc:firmware:<id>` and deliver
    /// `payload` to that bucket plus the global bucket. Delivery errors on
    /// any single sink are swallowed; there is no back-pressure, so a slow
    /// subscriber may simply miss a message.
    pub async fn deliver(&self, channel: &str, payload: &str) {
        let mut b = self.buckets.lock().await;

        if let Some(id) = channel.strip_prefix("soc:scan:") {
            if let Some(sinks) = b.scan.get_mut(id) {
                sinks.retain(|s| s.send(payload.to_string()).is_ok());
            }
        } else if let Some(id) = channel.strip_prefix("soc:firmware:") {
            if let Some(sinks) = b.firmware.get_mut(id) {
                sinks.retain(|s| s.send(payload.to_string()).is_ok());
            }
        }

        b.global.retain(|s| s.send(payload.to_string()).is_ok());
    }
}

/// Pure keep-alive logic: a client's `"ping"` text frame gets `{"type":"pong"}`
/// back; anything else yields no reply. Kept as a standalone function so it
/// can be unit-tested without a real socket.
pub fn handle_client_text(text: &str) -> Option<Value> {
    if text == "ping" {
        Some(serde_json::json!({"type": "pong"}))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_yields_pong() {
        let reply = handle_client_text("ping");
        assert_eq!(reply, Some(serde_json::json!({"type": "pong"})));
    }

    #[test]
    fn non_ping_yields_no_reply() {
        assert_eq!(handle_client_text("hello"), None);
    }

    #[tokio::test]
    async fn deliver_reaches_matching_scan_bucket_and_global() {
        let hub = BroadcastHub::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        hub.connect_scan("job-1", tx1).await;
        hub.connect_global(tx2).await;

        hub.deliver("soc:scan:job-1", r#"{"type":"scan_progress"}"#).await;

        assert_eq!(rx1.recv().await.unwrap(), r#"{"type":"scan_progress"}"#);
        assert_eq!(rx2.recv().await.unwrap(), r#"{"type":"scan_progress"}"#);
    }

    #[tokio::test]
    async fn deliver_does_not_cross_scan_ids() {
        let hub = BroadcastHub::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        hub.connect_scan("job-1", tx1).await;

        hub.deliver("soc:scan:job-2", r#"{"type":"scan_progress"}"#).await;

        assert!(rx1.try_recv().is_err());
    }
}
