//! Supervised streaming connection to a BSC node.
//!
//! One task owns the socket for its whole life. Every accepted connection
//! gets a fresh broadcast channel; dropping the sender on disconnect closes
//! all outstanding receivers, which is how consumers learn the stream died.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{broadcast, watch};
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::{
    CHANNEL_CAPACITY, WS_ACTIVITY_CHECK_INTERVAL, WS_ACTIVITY_TIMEOUT, WS_MAX_RECONNECT_ATTEMPTS,
    WS_RECONNECT_BASE_DELAY, WS_RECONNECT_MAX_DELAY,
};
use crate::error::{AppError, Result};
use crate::rpc::codec::{decode_log, LogEntry, SUBSCRIBED_TOPICS};
use crate::types::ContractEvent;

// ---------------------------------------------------------------------------
// Shared state between the supervisor task and the manager's accessors
// ---------------------------------------------------------------------------

pub struct WsShared {
    /// Sender for the current connection generation; None while down.
    sender: Mutex<Option<broadcast::Sender<ContractEvent>>>,
    connected: AtomicBool,
    /// Unix seconds of the last inbound frame, for the silence watchdog.
    last_activity: AtomicU64,
    reconnect_count: AtomicU64,
    events_decoded: AtomicU64,
    /// Bumped once per completed (re)connect, so waiting tasks can re-attach.
    generation_tx: watch::Sender<u64>,
}

impl WsShared {
    fn new() -> Self {
        let (generation_tx, _) = watch::channel(0u64);
        Self {
            sender: Mutex::new(None),
            connected: AtomicBool::new(false),
            last_activity: AtomicU64::new(now_secs()),
            reconnect_count: AtomicU64::new(0),
            events_decoded: AtomicU64::new(0),
            generation_tx,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnect_count.load(Ordering::Relaxed)
    }

    pub fn events_decoded(&self) -> u64 {
        self.events_decoded.load(Ordering::Relaxed)
    }

    pub fn seconds_since_activity(&self) -> u64 {
        now_secs().saturating_sub(self.last_activity.load(Ordering::Relaxed))
    }

    /// Receiver bound to the live connection. Fails fast while the stream is
    /// down rather than handing out a channel that will never carry anything.
    pub fn subscribe(&self) -> Result<broadcast::Receiver<ContractEvent>> {
        let guard = self.sender.lock().unwrap_or_else(|p| p.into_inner());
        match guard.as_ref() {
            Some(tx) => Ok(tx.subscribe()),
            None => Err(AppError::Connection(
                "streaming connection is not established".to_string(),
            )),
        }
    }

    /// Watch channel that ticks every time a fresh connection comes up.
    pub fn generation_watch(&self) -> watch::Receiver<u64> {
        self.generation_tx.subscribe()
    }

    fn install_sender(&self, tx: broadcast::Sender<ContractEvent>) {
        *self.sender.lock().unwrap_or_else(|p| p.into_inner()) = Some(tx);
        self.connected.store(true, Ordering::Relaxed);
        self.last_activity.store(now_secs(), Ordering::Relaxed);
        self.generation_tx.send_modify(|g| *g += 1);
    }

    fn drop_sender(&self) {
        self.connected.store(false, Ordering::Relaxed);
        *self.sender.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    fn touch(&self) {
        self.last_activity.store(now_secs(), Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Reconnect re-entrancy guard
// ---------------------------------------------------------------------------

/// Only one reconnect sequence may run at a time. The supervisor claims the
/// guard before tearing down and releases it once the cycle finishes, so a
/// watchdog firing mid-reconnect cannot start a second overlapping sequence.
pub struct ReconnectGuard {
    busy: AtomicBool,
}

impl ReconnectGuard {
    pub fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
        }
    }

    pub fn try_begin(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn finish(&self) {
        self.busy.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Reconnect backoff
// ---------------------------------------------------------------------------

/// Attempt bookkeeping for the reconnect loop. A successful open zeroes the
/// counter, so only consecutive failed opens advance toward node rotation;
/// a session that ran for hours and then errored out starts the next cycle
/// from attempt 1.
struct ReconnectBackoff {
    attempts: u32,
}

impl ReconnectBackoff {
    fn new() -> Self {
        Self { attempts: 0 }
    }

    /// Called once the subscription is installed on a fresh socket.
    fn connection_opened(&mut self) {
        self.attempts = 0;
    }

    /// Advances the counter; returns the pre-attempt delay and whether the
    /// supervisor should rotate to the next configured node.
    fn next_attempt(&mut self) -> (Duration, bool) {
        self.attempts += 1;
        let rotate = self.attempts > WS_MAX_RECONNECT_ATTEMPTS;
        if rotate {
            self.attempts = 1;
        }
        let delay = (WS_RECONNECT_BASE_DELAY * self.attempts).min(WS_RECONNECT_MAX_DELAY);
        (delay, rotate)
    }

    fn attempts(&self) -> u32 {
        self.attempts
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct WsSupervisor {
    urls: Vec<String>,
    active_url: AtomicUsize,
    contract_address: String,
    shared: Arc<WsShared>,
    guard: ReconnectGuard,
}

impl WsSupervisor {
    pub fn new(urls: Vec<String>, contract_address: String) -> Result<Self> {
        if urls.is_empty() {
            return Err(AppError::Config(
                "at least one streaming RPC URL is required".to_string(),
            ));
        }
        Ok(Self {
            urls,
            active_url: AtomicUsize::new(0),
            contract_address,
            shared: Arc::new(WsShared::new()),
            guard: ReconnectGuard::new(),
        })
    }

    pub fn shared(&self) -> Arc<WsShared> {
        Arc::clone(&self.shared)
    }

    fn current_url(&self) -> &str {
        &self.urls[self.active_url.load(Ordering::Relaxed) % self.urls.len()]
    }

    fn rotate_url(&self) {
        let next = (self.active_url.load(Ordering::Relaxed) + 1) % self.urls.len();
        self.active_url.store(next, Ordering::Relaxed);
        warn!("rotating streaming node to {}", self.urls[next]);
    }

    /// Runs forever. Each pass through the loop is one connection lifetime;
    /// a return from `connect_once` (clean close, error, or watchdog force)
    /// triggers one reconnect cycle under the re-entrancy guard.
    pub async fn run(self) {
        let mut backoff = ReconnectBackoff::new();

        loop {
            let url = self.current_url().to_string();
            info!("streaming connection attempt to {url}");

            match self.connect_once(&url, &mut backoff).await {
                Ok(()) => info!("streaming connection to {url} closed"),
                Err(e) => error!("streaming connection to {url} failed: {e}"),
            }

            if !self.guard.try_begin() {
                // Another cycle is already tearing down; let it own the delay.
                tokio::time::sleep(WS_RECONNECT_BASE_DELAY).await;
                continue;
            }

            self.shared.drop_sender();
            self.shared.reconnect_count.fetch_add(1, Ordering::Relaxed);

            let (delay, rotate) = backoff.next_attempt();
            if rotate {
                self.rotate_url();
            }
            warn!(
                "streaming reconnect attempt {} in {}s",
                backoff.attempts(),
                delay.as_secs()
            );
            tokio::time::sleep(delay).await;
            self.guard.finish();
        }
    }

    async fn connect_once(&self, url: &str, backoff: &mut ReconnectBackoff) -> Result<()> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        // One subscription covers all contract events we care about: topic0
        // is an OR-list, so bets and round phase transitions share a stream.
        let sub = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_subscribe",
            "params": ["logs", {
                "address": self.contract_address,
                "topics": [SUBSCRIBED_TOPICS]
            }]
        });
        write.send(Message::Text(sub.to_string().into())).await?;

        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        self.shared.install_sender(tx.clone());
        backoff.connection_opened();
        info!("streaming connection established, subscription sent");

        let mut watchdog = interval(WS_ACTIVITY_CHECK_INTERVAL);
        watchdog.tick().await; // consume immediate first tick

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.shared.touch();
                            self.handle_frame(&text, &tx);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            self.shared.touch();
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Ok(());
                        }
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(_)) => {
                            self.shared.touch();
                        }
                    }
                }

                _ = watchdog.tick() => {
                    let quiet = self.shared.seconds_since_activity();
                    if quiet >= WS_ACTIVITY_TIMEOUT.as_secs() {
                        // Node went silent without closing the socket.
                        warn!("no streaming activity for {quiet}s, forcing reconnect");
                        return Ok(());
                    }
                    debug!("streaming watchdog: last activity {quiet}s ago");
                }
            }
        }
    }

    fn handle_frame(&self, text: &str, tx: &broadcast::Sender<ContractEvent>) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!("unparseable streaming frame: {e}");
                return;
            }
        };

        // Subscription ack and other id-bearing responses carry no log.
        if value.get("method").and_then(|m| m.as_str()) != Some("eth_subscription") {
            if let Some(result) = value.get("result") {
                debug!("subscription confirmed: {result}");
            }
            return;
        }

        let Some(log_value) = value.pointer("/params/result") else {
            return;
        };
        let log: LogEntry = match serde_json::from_value(log_value.clone()) {
            Ok(l) => l,
            Err(e) => {
                warn!("malformed log in subscription frame: {e}");
                return;
            }
        };

        match decode_log(&log) {
            Ok(event) => {
                self.shared.events_decoded.fetch_add(1, Ordering::Relaxed);
                // A send error just means no consumer is attached right now.
                let _ = tx.send(event);
            }
            Err(e) => {
                warn!("undeciphered contract log {}: {e}", log.transaction_hash);
            }
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
