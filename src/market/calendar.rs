// =============================================================================
// Market Calendars — per-exchange trading windows, holidays, and aliases
// =============================================================================
//
// The hard-coded fallback behind the market-hours oracle. Windows are local
// exchange time; holiday sets are computed per year. Lunar-calendar
// holidays (HK) are not modelled; the live status feed covers those.
// =============================================================================

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc, Weekday};
use chrono_tz::Tz;

/// One trading window in exchange-local time, `(hour, minute)` inclusive
/// open to exclusive close.
pub type TradingWindow = ((u32, u32), (u32, u32));

pub struct MarketCalendar {
    /// Canonical exchange name.
    pub name: &'static str,
    /// Identifier used by the external status API and the cache key.
    pub api_id: &'static str,
    pub timezone: Tz,
    /// Non-overlapping windows ordered by open; close > open within each.
    pub windows: &'static [TradingWindow],
    holidays: fn(i32) -> Vec<NaiveDate>,
    /// Trades must only be submitted while open (Asian markets).
    pub strict_hours: bool,
}

impl MarketCalendar {
    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        (self.holidays)(date.year()).contains(&date)
    }

    /// Calendar verdict for an instant: weekday, not a holiday, and inside
    /// some trading window, all in the exchange's local time.
    pub fn is_open_at(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.timezone);
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        if self.is_holiday(local.date_naive()) {
            return false;
        }

        let minute_of_day = local.hour() * 60 + local.minute();
        self.windows.iter().any(|((oh, om), (ch, cm))| {
            let open = oh * 60 + om;
            let close = ch * 60 + cm;
            minute_of_day >= open && minute_of_day < close
        })
    }

    pub fn is_weekend_at(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.timezone);
        matches!(local.weekday(), Weekday::Sat | Weekday::Sun)
    }
}

// =============================================================================
// Holiday math
// =============================================================================

fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid calendar date")
}

/// The n-th (1-based) given weekday of a month.
fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u32) -> NaiveDate {
    let first = date(year, month, 1);
    let offset = (7 + weekday.num_days_from_monday() - first.weekday().num_days_from_monday()) % 7;
    first + chrono::Duration::days(i64::from(offset + (n - 1) * 7))
}

/// The last given weekday of a month.
fn last_weekday(year: i32, month: u32, weekday: Weekday) -> NaiveDate {
    let next_month = if month == 12 {
        date(year + 1, 1, 1)
    } else {
        date(year, month + 1, 1)
    };
    let last = next_month - chrono::Duration::days(1);
    let offset = (7 + last.weekday().num_days_from_monday() - weekday.num_days_from_monday()) % 7;
    last - chrono::Duration::days(i64::from(offset))
}

/// Gregorian Easter Sunday (Meeus/Jones/Butcher).
fn easter_sunday(year: i32) -> NaiveDate {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    date(year, month as u32, day as u32)
}

fn us_holidays(year: i32) -> Vec<NaiveDate> {
    vec![
        date(year, 1, 1),
        nth_weekday(year, 1, Weekday::Mon, 3),  // Martin Luther King Jr. Day
        nth_weekday(year, 2, Weekday::Mon, 3),  // Presidents' Day
        easter_sunday(year) - chrono::Duration::days(2), // Good Friday
        last_weekday(year, 5, Weekday::Mon),    // Memorial Day
        date(year, 6, 19),                      // Juneteenth
        date(year, 7, 4),                       // Independence Day
        nth_weekday(year, 9, Weekday::Mon, 1),  // Labor Day
        nth_weekday(year, 11, Weekday::Thu, 4), // Thanksgiving
        date(year, 12, 25),
    ]
}

fn uk_holidays(year: i32) -> Vec<NaiveDate> {
    let easter = easter_sunday(year);
    vec![
        date(year, 1, 1),
        easter - chrono::Duration::days(2), // Good Friday
        easter + chrono::Duration::days(1), // Easter Monday
        nth_weekday(year, 5, Weekday::Mon, 1),
        last_weekday(year, 5, Weekday::Mon),
        last_weekday(year, 8, Weekday::Mon),
        date(year, 12, 25),
        date(year, 12, 26),
    ]
}

fn de_holidays(year: i32) -> Vec<NaiveDate> {
    let easter = easter_sunday(year);
    vec![
        date(year, 1, 1),
        easter - chrono::Duration::days(2),
        easter + chrono::Duration::days(1),
        date(year, 5, 1),
        date(year, 10, 3),
        date(year, 12, 24),
        date(year, 12, 25),
        date(year, 12, 26),
        date(year, 12, 31),
    ]
}

fn hk_holidays(year: i32) -> Vec<NaiveDate> {
    let easter = easter_sunday(year);
    vec![
        date(year, 1, 1),
        easter - chrono::Duration::days(2),
        easter + chrono::Duration::days(1),
        date(year, 5, 1),
        date(year, 7, 1),
        date(year, 10, 1),
        date(year, 12, 25),
        date(year, 12, 26),
    ]
}

fn jp_holidays(year: i32) -> Vec<NaiveDate> {
    vec![
        date(year, 1, 1),
        date(year, 1, 2),
        date(year, 1, 3),
        date(year, 2, 11),
        date(year, 2, 23),
        date(year, 4, 29),
        date(year, 5, 3),
        date(year, 5, 4),
        date(year, 5, 5),
        date(year, 11, 3),
        date(year, 11, 23),
        date(year, 12, 31),
    ]
}

fn au_holidays(year: i32) -> Vec<NaiveDate> {
    let easter = easter_sunday(year);
    vec![
        date(year, 1, 1),
        date(year, 1, 26),
        easter - chrono::Duration::days(2),
        easter + chrono::Duration::days(1),
        date(year, 4, 25),
        date(year, 12, 25),
        date(year, 12, 26),
    ]
}

// =============================================================================
// Calendar table and aliases
// =============================================================================

static NYSE: MarketCalendar = MarketCalendar {
    name: "NYSE",
    api_id: "nyse",
    timezone: Tz::America__New_York,
    windows: &[((9, 30), (16, 0))],
    holidays: us_holidays,
    strict_hours: false,
};

static NASDAQ: MarketCalendar = MarketCalendar {
    name: "NASDAQ",
    api_id: "nasdaq",
    timezone: Tz::America__New_York,
    windows: &[((9, 30), (16, 0))],
    holidays: us_holidays,
    strict_hours: false,
};

static LSE: MarketCalendar = MarketCalendar {
    name: "LSE",
    api_id: "lse",
    timezone: Tz::Europe__London,
    windows: &[((8, 0), (16, 30))],
    holidays: uk_holidays,
    strict_hours: false,
};

static XETRA: MarketCalendar = MarketCalendar {
    name: "XETRA",
    api_id: "xetra",
    timezone: Tz::Europe__Berlin,
    windows: &[((9, 0), (17, 30))],
    holidays: de_holidays,
    strict_hours: false,
};

static HKSE: MarketCalendar = MarketCalendar {
    name: "HKSE",
    api_id: "hkse",
    timezone: Tz::Asia__Hong_Kong,
    windows: &[((9, 30), (12, 0)), ((13, 0), (16, 0))],
    holidays: hk_holidays,
    strict_hours: true,
};

static TSE: MarketCalendar = MarketCalendar {
    name: "TSE",
    api_id: "tse",
    timezone: Tz::Asia__Tokyo,
    windows: &[((9, 0), (11, 30)), ((12, 30), (15, 0))],
    holidays: jp_holidays,
    strict_hours: true,
};

static ASX: MarketCalendar = MarketCalendar {
    name: "ASX",
    api_id: "asx",
    timezone: Tz::Australia__Sydney,
    windows: &[((10, 0), (16, 0))],
    holidays: au_holidays,
    strict_hours: true,
};

/// `(alias, calendar)` pairs; matching is case-insensitive.
static ALIASES: &[(&str, &MarketCalendar)] = &[
    ("nyse", &NYSE),
    ("xnys", &NYSE),
    ("new york stock exchange", &NYSE),
    ("nasdaq", &NASDAQ),
    ("nasdaqgs", &NASDAQ),
    ("nasdaqgm", &NASDAQ),
    ("nasdaqcm", &NASDAQ),
    ("xnas", &NASDAQ),
    ("lse", &LSE),
    ("xlon", &LSE),
    ("london stock exchange", &LSE),
    ("xetra", &XETRA),
    ("xetr", &XETRA),
    ("frankfurt", &XETRA),
    ("hkse", &HKSE),
    ("xhkg", &HKSE),
    ("hkex", &HKSE),
    ("hong kong stock exchange", &HKSE),
    ("tse", &TSE),
    ("xtks", &TSE),
    ("tokyo stock exchange", &TSE),
    ("asx", &ASX),
    ("xasx", &ASX),
];

/// Resolve an exchange name through the alias table.
pub fn resolve(exchange: &str) -> Option<&'static MarketCalendar> {
    let needle = exchange.trim().to_lowercase();
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == needle)
        .map(|(_, calendar)| *calendar)
}

/// Resolve, defaulting unknown exchanges to a US-equity-like calendar.
/// The bool reports whether the name was known.
pub fn resolve_or_default(exchange: &str) -> (&'static MarketCalendar, bool) {
    match resolve(exchange) {
        Some(calendar) => (calendar, true),
        None => (&NYSE, false),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn new_york(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Tz::America__New_York
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn hong_kong(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Tz::Asia__Hong_Kong
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn aliases_are_case_insensitive_and_shared() {
        let a = resolve("NASDAQ").unwrap();
        let b = resolve("NasdaqGS").unwrap();
        let c = resolve("XNAS").unwrap();
        assert!(std::ptr::eq(a, b));
        assert!(std::ptr::eq(b, c));
        assert!(resolve("MOON-EXCHANGE").is_none());
    }

    #[test]
    fn unknown_exchange_defaults_to_us_calendar() {
        let (calendar, known) = resolve_or_default("MOON-EXCHANGE");
        assert!(!known);
        assert_eq!(calendar.name, "NYSE");
    }

    #[test]
    fn weekday_trading_hours() {
        let calendar = resolve("NASDAQ").unwrap();
        // Tuesday 2026-06-02.
        assert!(calendar.is_open_at(new_york(2026, 6, 2, 11, 0)));
        assert!(!calendar.is_open_at(new_york(2026, 6, 2, 9, 29)));
        assert!(!calendar.is_open_at(new_york(2026, 6, 2, 16, 0)));
    }

    #[test]
    fn weekends_are_closed() {
        let calendar = resolve("NASDAQ").unwrap();
        // Saturday 2026-06-06.
        assert!(calendar.is_weekend_at(new_york(2026, 6, 6, 11, 0)));
        assert!(!calendar.is_open_at(new_york(2026, 6, 6, 11, 0)));
    }

    #[test]
    fn thanksgiving_is_closed_inside_the_window() {
        let calendar = resolve("NYSE").unwrap();
        // Thanksgiving 2026 falls on Thursday November 26.
        assert!(calendar.is_holiday(NaiveDate::from_ymd_opt(2026, 11, 26).unwrap()));
        assert!(!calendar.is_open_at(new_york(2026, 11, 26, 11, 0)));
        // The following Monday trades normally.
        assert!(calendar.is_open_at(new_york(2026, 11, 30, 11, 0)));
    }

    #[test]
    fn hkse_lunch_break() {
        let calendar = resolve("HKSE").unwrap();
        // Tuesday 2026-06-02.
        assert!(calendar.is_open_at(hong_kong(2026, 6, 2, 10, 30)));
        assert!(!calendar.is_open_at(hong_kong(2026, 6, 2, 12, 0)));
        assert!(calendar.is_open_at(hong_kong(2026, 6, 2, 14, 0)));
    }

    #[test]
    fn strict_hours_marks_asian_markets() {
        assert!(resolve("HKSE").unwrap().strict_hours);
        assert!(resolve("TSE").unwrap().strict_hours);
        assert!(!resolve("NASDAQ").unwrap().strict_hours);
        assert!(!resolve("LSE").unwrap().strict_hours);
    }

    #[test]
    fn easter_reference_dates() {
        assert_eq!(easter_sunday(2024), date(2024, 3, 31));
        assert_eq!(easter_sunday(2025), date(2025, 4, 20));
        assert_eq!(easter_sunday(2026), date(2026, 4, 5));
    }

    #[test]
    fn moveable_us_holidays() {
        let holidays = us_holidays(2026);
        // Thanksgiving 2026: fourth Thursday of November.
        assert!(holidays.contains(&date(2026, 11, 26)));
        // Memorial Day 2026: last Monday of May.
        assert!(holidays.contains(&date(2026, 5, 25)));
        // MLK 2026: third Monday of January.
        assert!(holidays.contains(&date(2026, 1, 19)));
    }
}
