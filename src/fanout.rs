//! Push fan-out to subscriber sockets.
//!
//! The hub serializes each message once and hands it to every connected
//! socket through a broadcast channel; the per-socket send loops live in
//! the API layer. A closed or slow client only loses its own messages.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::CHANNEL_CAPACITY;
use crate::listener::SuspicionReport;
use crate::types::RoundPhase;

// ---------------------------------------------------------------------------
// Wire envelopes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct BetPayload {
    pub epoch: u64,
    pub bet_ts: String,
    pub wallet_address: String,
    pub bet_direction: String,
    pub amount: f64,
    pub tx_hash: String,
    pub block_number: u64,
}

#[derive(Serialize)]
struct BetEnvelope<'a> {
    channel: &'static str,
    data: BetData<'a>,
}

#[derive(Serialize)]
struct BetData<'a> {
    #[serde(flatten)]
    bet: &'a BetPayload,
    suspicious: &'a SuspicionReport,
}

#[derive(Serialize)]
struct RoundEnvelope {
    channel: &'static str,
    #[serde(rename = "type")]
    kind: String,
    data: RoundEventData,
}

#[derive(Serialize)]
struct RoundEventData {
    epoch: u64,
}

#[derive(Serialize)]
struct ConnectionAck {
    #[serde(rename = "type")]
    kind: &'static str,
    status: &'static str,
    timestamp: u64,
}

/// First message every subscriber receives after the upgrade.
pub fn connection_ack() -> String {
    serde_json::to_string(&ConnectionAck {
        kind: "connection",
        status: "connected",
        timestamp: now_millis(),
    })
    .unwrap_or_default()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

pub struct Hub {
    tx: broadcast::Sender<String>,
    clients: AtomicUsize,
    messages_sent: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            clients: AtomicUsize::new(0),
            messages_sent: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn client_connected(&self) -> usize {
        self.clients.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn client_disconnected(&self) -> usize {
        self.clients.fetch_sub(1, Ordering::Relaxed).saturating_sub(1)
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn broadcast_bet(&self, bet: &BetPayload, suspicious: &SuspicionReport) {
        self.send(&BetEnvelope {
            channel: "new_bet_data",
            data: BetData { bet, suspicious },
        });
    }

    pub fn broadcast_round_event(&self, phase: RoundPhase, epoch: u64) {
        self.send(&RoundEnvelope {
            channel: "round_event",
            kind: phase.to_string(),
            data: RoundEventData { epoch },
        });
    }

    fn send<T: Serialize>(&self, message: &T) {
        let text = match serde_json::to_string(message) {
            Ok(t) => t,
            Err(e) => {
                debug!("unserializable fan-out message: {e}");
                return;
            }
        };
        // A send error just means nobody is subscribed right now.
        if self.tx.send(text).is_ok() {
            self.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> BetPayload {
        BetPayload {
            epoch: 100,
            bet_ts: "2024-01-01 00:01:00".to_string(),
            wallet_address: "0xaaa".to_string(),
            bet_direction: "UP".to_string(),
            amount: 1.5,
            tx_hash: "0xdead".to_string(),
            block_number: 42,
        }
    }

    #[test]
    fn bet_envelope_carries_channel_and_suspicion() {
        let hub = Hub::new();
        let mut rx = hub.subscribe();
        let report = SuspicionReport {
            is_suspicious: true,
            flags: vec!["High frequency betting: 11 bets in the last minute.".to_string()],
        };

        hub.broadcast_bet(&payload(), &report);

        let text = rx.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["channel"], "new_bet_data");
        assert_eq!(value["data"]["epoch"], 100);
        assert_eq!(value["data"]["bet_direction"], "UP");
        assert_eq!(value["data"]["suspicious"]["isSuspicious"], true);
        assert_eq!(hub.messages_sent(), 1);
    }

    #[test]
    fn round_envelope_carries_phase_as_type() {
        let hub = Hub::new();
        let mut rx = hub.subscribe();

        hub.broadcast_round_event(RoundPhase::Lock, 101);

        let value: serde_json::Value =
            serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(value["channel"], "round_event");
        assert_eq!(value["type"], "lock");
        assert_eq!(value["data"]["epoch"], 101);
    }

    #[test]
    fn broadcast_without_subscribers_is_a_noop() {
        let hub = Hub::new();
        hub.broadcast_round_event(RoundPhase::Start, 1);
        assert_eq!(hub.messages_sent(), 0);
    }

    #[test]
    fn client_counter_tracks_connects_and_disconnects() {
        let hub = Hub::new();
        assert_eq!(hub.client_connected(), 1);
        assert_eq!(hub.client_connected(), 2);
        assert_eq!(hub.client_disconnected(), 1);
        assert_eq!(hub.client_count(), 1);
    }

    #[test]
    fn connection_ack_is_well_formed() {
        let value: serde_json::Value = serde_json::from_str(&connection_ack()).unwrap();
        assert_eq!(value["type"], "connection");
        assert_eq!(value["status"], "connected");
        assert!(value["timestamp"].as_u64().unwrap() > 0);
    }
}
