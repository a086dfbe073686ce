// =============================================================================
// Market-Hours Oracle — weekend shortcut, cached status, HTTP, calendar
// =============================================================================
//
// Decision ladder for "is this exchange open right now":
//
//   1. weekend in the exchange's local time zone  -> closed, no I/O
//   2. 6-hour TTL cache (cache.db)                -> cached answer
//   3. external status endpoint                   -> cache + answer
//   4. hard-coded calendar                        -> computed answer
//
// Network failures never poison the cache and never surface as errors;
// they just drop through to the calendar.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use super::calendar::{resolve_or_default, MarketCalendar};
use crate::db::cache::CacheStore;
use crate::types::Side;

#[derive(Debug, Deserialize)]
struct StatusResponse {
    success: bool,
    #[serde(default)]
    data: Option<StatusData>,
}

#[derive(Debug, Deserialize)]
struct StatusData {
    #[serde(default)]
    markets: Vec<MarketEntry>,
}

#[derive(Debug, Deserialize)]
struct MarketEntry {
    id: String,
    #[serde(default, rename = "isOpen")]
    is_open: bool,
    #[serde(default)]
    status: Option<MarketEntryStatus>,
}

#[derive(Debug, Deserialize)]
struct MarketEntryStatus {
    #[serde(default, rename = "isOpen")]
    is_open: bool,
}

pub struct MarketHoursOracle {
    cache: Arc<CacheStore>,
    http: reqwest::Client,
    status_url: String,
    cache_ttl: Duration,
}

impl MarketHoursOracle {
    pub fn new(
        cache: Arc<CacheStore>,
        status_url: impl Into<String>,
        cache_ttl: Duration,
        http_timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            cache,
            http,
            status_url: status_url.into(),
            cache_ttl,
        }
    }

    pub async fn is_market_open(&self, exchange: &str) -> bool {
        self.is_market_open_at(exchange, Utc::now()).await
    }

    /// The full decision ladder at a specific instant. Split out so the
    /// weekend, holiday, and lunch-break branches are testable.
    pub async fn is_market_open_at(&self, exchange: &str, at: DateTime<Utc>) -> bool {
        let calendar = self.calendar_for(exchange);

        // 1. Weekend shortcut: no cache read, no HTTP.
        if calendar.is_weekend_at(at) {
            return false;
        }

        // 2. External cache.
        let now = at.timestamp();
        let cache_key = format!("market_status:{}", calendar.api_id);
        match self.cache.cache_get(&cache_key, now) {
            Ok(Some(cached)) => return cached == "open",
            Ok(None) => {}
            Err(e) => debug!(exchange, error = %e, "market status cache read failed"),
        }

        // 3. External fetch. Failures fall through to the calendar.
        if let Some(open) = self.fetch_status(calendar, now).await {
            return open;
        }

        // 4. Local calendar fallback.
        calendar.is_open_at(at)
    }

    pub fn requires_strict_hours(&self, exchange: &str) -> bool {
        self.calendar_for(exchange).strict_hours
    }

    /// Sells are always gated on market hours; buys only on strict-hours
    /// exchanges, where out-of-session orders are rejected outright.
    pub fn should_check_market_hours(&self, exchange: &str, side: Side) -> bool {
        match side {
            Side::Sell => true,
            Side::Buy => self.requires_strict_hours(exchange),
        }
    }

    fn calendar_for(&self, exchange: &str) -> &'static MarketCalendar {
        let (calendar, known) = resolve_or_default(exchange);
        if !known {
            warn!(exchange, "unknown exchange, assuming US equity calendar");
        }
        calendar
    }

    /// One GET against the status endpoint. On success every market in the
    /// response is cached, and the answer for `calendar` is returned if it
    /// appeared.
    async fn fetch_status(&self, calendar: &MarketCalendar, now: i64) -> Option<bool> {
        let response = match self.http.get(&self.status_url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %self.status_url, error = %e, "market status fetch failed");
                return None;
            }
        };

        if !response.status().is_success() {
            debug!(status = %response.status(), "market status endpoint unhealthy");
            return None;
        }

        let body: StatusResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                debug!(error = %e, "market status response unparsable");
                return None;
            }
        };

        if !body.success {
            return None;
        }

        let markets = body.data.map(|d| d.markets).unwrap_or_default();
        let expires_at = now + self.cache_ttl.as_secs() as i64;
        let mut answer = None;

        for market in &markets {
            let open = market.is_open || market.status.as_ref().is_some_and(|s| s.is_open);
            let key = format!("market_status:{}", market.id.to_lowercase());
            let value = if open { "open" } else { "closed" };
            if let Err(e) = self.cache.cache_put(&key, value, expires_at, now) {
                debug!(market = %market.id, error = %e, "market status cache write failed");
            }
            if market.id.eq_ignore_ascii_case(calendar.api_id) {
                answer = Some(open);
            }
        }

        answer
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Tz;

    /// Oracle whose HTTP endpoint refuses connections, exercising the
    /// cache-then-calendar path without a network.
    fn offline_oracle() -> (tempfile::TempDir, MarketHoursOracle) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(CacheStore::open(dir.path().join("cache.db")).unwrap());
        let oracle = MarketHoursOracle::new(
            cache,
            "http://127.0.0.1:1/markets/status",
            Duration::from_secs(6 * 60 * 60),
            Duration::from_millis(200),
        );
        (dir, oracle)
    }

    fn new_york(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Tz::America__New_York
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn weekend_is_closed_without_io() {
        let (_dir, oracle) = offline_oracle();
        // Saturday 2026-06-06. The 200 ms HTTP timeout would dominate the
        // runtime if any request were issued; the shortcut answers first.
        let begun = std::time::Instant::now();
        assert!(!oracle.is_market_open_at("NASDAQ", new_york(2026, 6, 6, 11, 0)).await);
        assert!(begun.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn endpoint_failure_falls_back_to_calendar() {
        let (_dir, oracle) = offline_oracle();
        // Tuesday 11:00 New York: open per the hard-coded calendar.
        assert!(oracle.is_market_open_at("NASDAQ", new_york(2026, 6, 2, 11, 0)).await);
        // Thanksgiving Thursday 11:00: holiday, closed.
        assert!(!oracle.is_market_open_at("NASDAQ", new_york(2026, 11, 26, 11, 0)).await);
    }

    #[tokio::test]
    async fn hkse_lunch_break_via_fallback() {
        let (_dir, oracle) = offline_oracle();
        let hk = |h: u32, m: u32| {
            Tz::Asia__Hong_Kong
                .with_ymd_and_hms(2026, 6, 2, h, m, 0)
                .unwrap()
                .with_timezone(&Utc)
        };
        assert!(oracle.is_market_open_at("HKSE", hk(10, 30)).await);
        assert!(!oracle.is_market_open_at("HKSE", hk(12, 0)).await);
        assert!(oracle.is_market_open_at("HKSE", hk(14, 0)).await);
    }

    #[tokio::test]
    async fn cached_status_short_circuits_the_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(CacheStore::open(dir.path().join("cache.db")).unwrap());
        let oracle = MarketHoursOracle::new(
            cache.clone(),
            "http://127.0.0.1:1/markets/status",
            Duration::from_secs(6 * 60 * 60),
            Duration::from_millis(200),
        );

        // Tuesday 11:00 NY would be open by calendar; the cache overrides.
        let at = new_york(2026, 6, 2, 11, 0);
        cache
            .cache_put("market_status:nasdaq", "closed", at.timestamp() + 60, at.timestamp())
            .unwrap();
        assert!(!oracle.is_market_open_at("NASDAQ", at).await);

        // An expired entry is ignored and the calendar answers.
        cache
            .cache_put("market_status:nasdaq", "closed", at.timestamp() - 1, at.timestamp() - 60)
            .unwrap();
        assert!(oracle.is_market_open_at("NASDAQ", at).await);
    }

    #[tokio::test]
    async fn sell_always_checks_buy_only_on_strict_exchanges() {
        let (_dir, oracle) = offline_oracle();
        assert!(oracle.should_check_market_hours("NASDAQ", Side::Sell));
        assert!(!oracle.should_check_market_hours("NASDAQ", Side::Buy));
        assert!(oracle.should_check_market_hours("HKSE", Side::Buy));
        assert!(oracle.should_check_market_hours("HKSE", Side::Sell));
    }
}
