// =============================================================================
// Market-Status Feed — streaming market-open cache over WebSocket
// =============================================================================
//
// Auxiliary to the market-hours oracle: keeps a live `code -> status` view
// for every exchange the upstream feed covers. Frames are JSON arrays
// `[channel, payload]`; only the "markets" channel is consumed.
//
// Runs until stopped: any read error launches a reconnect loop with
// exponential delay (base 5 s, cap 5 min) that continues indefinitely —
// past the soft attempt limit only the logging escalates.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::events::{EventBus, EventKind};

/// Reconnect attempts beyond this count log at error level.
const SOFT_RECONNECT_LIMIT: u32 = 10;

/// Live status of one market as reported by the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketStatusData {
    pub name: String,
    pub code: String,
    /// One of `open`, `closed`, `pre_open`, `post_close`.
    pub status: String,
    pub open_time: String,
    pub close_time: String,
    pub date: String,
    /// Unix seconds of the frame that last touched this entry.
    pub updated_at: i64,
}

#[derive(Debug, Deserialize)]
struct MarketsPayload {
    #[allow(dead_code)]
    #[serde(default)]
    t: i64,
    #[serde(default)]
    m: Vec<RawMarket>,
}

#[derive(Debug, Deserialize)]
struct RawMarket {
    /// Market name.
    #[serde(default)]
    n: String,
    /// Market code.
    #[serde(default)]
    n2: String,
    /// Status string.
    #[serde(default)]
    s: String,
    /// Local open time, e.g. "09:30".
    #[serde(default)]
    o: String,
    /// Local close time.
    #[serde(default)]
    c: String,
    /// Trading date.
    #[serde(default)]
    dt: String,
}

pub struct MarketStatusFeed {
    url: String,
    bus: EventBus,
    cache: RwLock<HashMap<String, MarketStatusData>>,
    last_update: RwLock<Option<Instant>>,
    stale_threshold: Duration,
    base_reconnect_delay: Duration,
    max_reconnect_delay: Duration,
    pong_wait: Duration,
    shutdown_tx: watch::Sender<bool>,
    /// Consecutive failed (re)connections; resets once a subscription
    /// succeeds.
    reconnect_attempts: std::sync::atomic::AtomicU32,
}

impl MarketStatusFeed {
    pub fn new(
        url: impl Into<String>,
        bus: EventBus,
        stale_threshold: Duration,
        base_reconnect_delay: Duration,
        max_reconnect_delay: Duration,
        pong_wait: Duration,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            url: url.into(),
            bus,
            cache: RwLock::new(HashMap::new()),
            last_update: RwLock::new(None),
            stale_threshold,
            base_reconnect_delay,
            max_reconnect_delay,
            pong_wait,
            shutdown_tx,
            reconnect_attempts: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Spawn the connect/receive/reconnect loop.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let feed = self.clone();
        tokio::spawn(async move { feed.run().await })
    }

    /// Idempotent: closes the socket (a close frame is sent from inside the
    /// receive loop) and ends the reconnect loop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    // ── Readers (all return copies, never live references) ──────────────

    pub fn get_market_status(&self, code: &str) -> Option<MarketStatusData> {
        self.cache.read().get(code).cloned()
    }

    pub fn get_all_market_statuses(&self) -> HashMap<String, MarketStatusData> {
        self.cache.read().clone()
    }

    /// True when no frame has been merged within the stale threshold.
    pub fn is_cache_stale(&self) -> bool {
        match *self.last_update.read() {
            Some(at) => at.elapsed() > self.stale_threshold,
            None => true,
        }
    }

    // ── Connection loop ─────────────────────────────────────────────────

    async fn run(&self) {
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.connect_and_receive(&mut shutdown).await {
                Ok(()) => break, // clean stop
                Err(e) => {
                    if *shutdown.borrow() {
                        break;
                    }
                    let attempts = self
                        .reconnect_attempts
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                        + 1;
                    let exponent = attempts.saturating_sub(1).min(16);
                    let delay = std::cmp::min(
                        self.base_reconnect_delay * 2u32.saturating_pow(exponent),
                        self.max_reconnect_delay,
                    );
                    if attempts > SOFT_RECONNECT_LIMIT {
                        error!(attempts, delay_secs = delay.as_secs(), error = %e,
                               "market status feed still down, reconnecting");
                    } else {
                        warn!(attempts, delay_secs = delay.as_secs(), error = %e,
                              "market status feed disconnected, reconnecting");
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        info!("market status feed stopped");
    }

    /// One connection lifetime: dial, subscribe, receive until an error or
    /// a stop signal. Any received frame (pongs included) extends the read
    /// deadline by the pong-wait window.
    async fn connect_and_receive(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!(url = %self.url, "connecting to market status WebSocket");
        let (ws_stream, _response) = connect_async(&self.url).await?;
        let (mut write, mut read) = ws_stream.split();

        write
            .send(Message::Text(json!(["markets"]).to_string()))
            .await?;
        info!("market status WebSocket connected, subscribed to markets");
        self.reconnect_attempts.store(0, std::sync::atomic::Ordering::Relaxed);

        let mut ping = tokio::time::interval(self.pong_wait / 2);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut deadline = tokio::time::Instant::now() + self.pong_wait;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
                _ = ping.tick() => {
                    write.send(Message::Ping(Vec::new())).await?;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    anyhow::bail!("read deadline exceeded ({}s)", self.pong_wait.as_secs());
                }
                frame = read.next() => {
                    deadline = tokio::time::Instant::now() + self.pong_wait;
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Err(e) = self.handle_frame(&text) {
                                warn!(error = %e, "dropped malformed frame");
                            }
                        }
                        Some(Ok(Message::Close(_))) => anyhow::bail!("server closed the stream"),
                        Some(Ok(_)) => {} // pings, pongs, binary: deadline already extended
                        Some(Err(e)) => return Err(e.into()),
                        None => anyhow::bail!("stream ended"),
                    }
                }
            }
        }
    }

    // ── Frame handling ──────────────────────────────────────────────────

    /// Parse one `[channel, payload]` frame. Returns how many markets were
    /// merged; frames on other channels merge zero.
    pub fn handle_frame(&self, text: &str) -> anyhow::Result<usize> {
        let frame: serde_json::Value = serde_json::from_str(text)?;
        let parts = frame
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("frame is not an array"))?;
        let channel = parts
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("frame has no channel"))?;

        if channel != "markets" {
            debug!(channel, "ignoring frame on unsubscribed channel");
            return Ok(0);
        }

        let payload = parts
            .get(1)
            .ok_or_else(|| anyhow::anyhow!("markets frame has no payload"))?;
        let payload: MarketsPayload = serde_json::from_value(payload.clone())?;

        let now = Utc::now().timestamp();
        let mut batch = Vec::with_capacity(payload.m.len());
        for raw in payload.m {
            match transform_market(raw, now) {
                Ok(market) => batch.push(market),
                // One bad market never aborts the batch.
                Err(e) => warn!(error = %e, "skipping malformed market entry"),
            }
        }

        if batch.is_empty() {
            return Ok(0);
        }

        let merged = batch.len();
        let (open_count, closed_count, snapshot) = {
            let mut cache = self.cache.write();
            for market in batch {
                cache.insert(market.code.clone(), market);
            }
            let open = cache.values().filter(|m| m.status == "open").count();
            let closed = cache.values().filter(|m| m.status == "closed").count();
            (open, closed, cache.clone())
        };
        *self.last_update.write() = Some(Instant::now());

        self.bus.emit(
            EventKind::MarketsStatusChanged,
            "market-status-feed",
            json!({
                "markets": snapshot,
                "open_count": open_count,
                "closed_count": closed_count,
            }),
        );

        Ok(merged)
    }
}

/// Validate and normalise one raw market entry. `close` normalises to
/// `closed`; anything outside the known status set is rejected.
fn transform_market(raw: RawMarket, now: i64) -> anyhow::Result<MarketStatusData> {
    if raw.n2.is_empty() {
        anyhow::bail!("market entry has no code");
    }
    if raw.n.is_empty() {
        anyhow::bail!("market entry '{}' has no name", raw.n2);
    }

    let status = match raw.s.as_str() {
        "open" => "open",
        "close" | "closed" => "closed",
        "pre_open" => "pre_open",
        "post_close" => "post_close",
        other => anyhow::bail!("market '{}' has unknown status '{}'", raw.n2, other),
    };

    Ok(MarketStatusData {
        name: raw.n,
        code: raw.n2,
        status: status.to_string(),
        open_time: raw.o,
        close_time: raw.c,
        date: raw.dt,
        updated_at: now,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn feed() -> (Arc<MarketStatusFeed>, EventBus) {
        let bus = EventBus::new();
        let feed = Arc::new(MarketStatusFeed::new(
            "wss://unused.invalid/socket",
            bus.clone(),
            Duration::from_secs(300),
            Duration::from_secs(5),
            Duration::from_secs(300),
            Duration::from_secs(60),
        ));
        (feed, bus)
    }

    const FRAME: &str = r#"["markets", {"t": 1700000000, "m": [
        {"n": "Nasdaq", "n2": "nasdaq", "s": "open", "o": "09:30", "c": "16:00", "dt": "2026-06-02"},
        {"n": "Hong Kong", "n2": "hkse", "s": "close", "o": "09:30", "c": "16:00", "dt": "2026-06-02"}
    ]}]"#;

    #[tokio::test]
    async fn markets_frame_merges_and_normalises_close() {
        let (feed, _bus) = feed();
        assert!(feed.is_cache_stale());

        assert_eq!(feed.handle_frame(FRAME).unwrap(), 2);
        assert!(!feed.is_cache_stale());

        let hk = feed.get_market_status("hkse").unwrap();
        assert_eq!(hk.status, "closed");
        let nasdaq = feed.get_market_status("nasdaq").unwrap();
        assert_eq!(nasdaq.status, "open");
        assert_eq!(nasdaq.open_time, "09:30");
    }

    #[tokio::test]
    async fn malformed_market_does_not_abort_the_batch() {
        let (feed, _bus) = feed();
        let frame = r#"["markets", {"t": 1, "m": [
            {"n": "Bad", "n2": "bad", "s": "sideways", "o": "", "c": "", "dt": ""},
            {"n": "", "n2": "anon", "s": "open", "o": "", "c": "", "dt": ""},
            {"n": "Tokyo", "n2": "tse", "s": "pre_open", "o": "09:00", "c": "15:00", "dt": "2026-06-02"}
        ]}]"#;

        assert_eq!(feed.handle_frame(frame).unwrap(), 1);
        assert_eq!(feed.get_market_status("tse").unwrap().status, "pre_open");
        assert!(feed.get_market_status("bad").is_none());
        assert!(feed.get_market_status("anon").is_none());
    }

    #[tokio::test]
    async fn other_channels_are_ignored() {
        let (feed, bus) = feed();
        let (_id, mut rx) = bus.subscribe(&[EventKind::MarketsStatusChanged]);

        assert_eq!(feed.handle_frame(r#"["trades", {"t": 1, "m": []}]"#).unwrap(), 0);
        assert!(feed.get_all_market_statuses().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn batch_emits_snapshot_with_counts() {
        let (feed, bus) = feed();
        let (_id, mut rx) = bus.subscribe(&[EventKind::MarketsStatusChanged]);

        feed.handle_frame(FRAME).unwrap();
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.data["open_count"], 1);
        assert_eq!(ev.data["closed_count"], 1);
        assert_eq!(ev.data["markets"]["nasdaq"]["status"], "open");
    }

    #[tokio::test]
    async fn identical_frames_leave_cache_equal() {
        let (feed, _bus) = feed();
        feed.handle_frame(FRAME).unwrap();
        let first: HashMap<String, (String, String)> = feed
            .get_all_market_statuses()
            .into_iter()
            .map(|(code, m)| (code, (m.status, m.date)))
            .collect();

        feed.handle_frame(FRAME).unwrap();
        let second: HashMap<String, (String, String)> = feed
            .get_all_market_statuses()
            .into_iter()
            .map(|(code, m)| (code, (m.status, m.date)))
            .collect();

        assert_eq!(first, second);
        assert!(!feed.is_cache_stale());
    }

    #[tokio::test]
    async fn readers_get_copies() {
        let (feed, _bus) = feed();
        feed.handle_frame(FRAME).unwrap();

        let mut snapshot = feed.get_all_market_statuses();
        snapshot.remove("nasdaq");
        // Mutating the snapshot must not touch the live cache.
        assert!(feed.get_market_status("nasdaq").is_some());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (feed, _bus) = feed();
        feed.stop();
        feed.stop();
    }
}
