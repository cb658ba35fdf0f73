use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc, Weekday};

/// Wall-clock in the service's configured timezone. Daily rollover, baseline
/// freshness and the `hour` virtual field all use this offset, never UTC.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    offset: FixedOffset,
}

impl Clock {
    /// Accepts a handful of IANA names plus explicit `+HH:MM` / `-HH:MM`
    /// offsets. Unknown values fall back to KST (+09:00), matching the
    /// deployment this system ships with.
    pub fn from_tz(tz: &str) -> Self {
        let offset = match tz {
            "UTC" | "Etc/UTC" => FixedOffset::east_opt(0),
            "Asia/Seoul" | "Asia/Tokyo" => FixedOffset::east_opt(9 * 3600),
            "Asia/Shanghai" | "Asia/Singapore" => FixedOffset::east_opt(8 * 3600),
            other => parse_offset(other),
        };
        Clock {
            offset: offset.unwrap_or_else(|| FixedOffset::east_opt(9 * 3600).unwrap()),
        }
    }

    pub fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.offset)
    }

    /// `YYYY-MM-DD` in local time, used for date-rollover checks and range
    /// queries.
    pub fn today(&self) -> String {
        self.now().format("%Y-%m-%d").to_string()
    }

    /// `YYYY.MM.DD` in local time, used as the daily index suffix.
    pub fn today_index_day(&self) -> String {
        self.now().format("%Y.%m.%d").to_string()
    }

    pub fn hour_label(&self) -> String {
        self.now().format("%H").to_string()
    }

    pub fn rfc3339(&self) -> String {
        self.now().to_rfc3339()
    }

    pub fn day_offset(&self, days: i64) -> String {
        (self.now() + chrono::Duration::days(days))
            .format("%Y-%m-%d")
            .to_string()
    }

    /// Local hour of an RFC3339 event timestamp. None when unparseable.
    pub fn hour_of(&self, ts: &str) -> Option<u32> {
        DateTime::parse_from_rfc3339(ts)
            .ok()
            .map(|t| t.with_timezone(&self.offset).hour())
    }

    /// Local day-of-week (1 = Monday .. 7 = Sunday) of an RFC3339 timestamp.
    pub fn day_of_week_of(&self, ts: &str) -> Option<u32> {
        DateTime::parse_from_rfc3339(ts)
            .ok()
            .map(|t| t.with_timezone(&self.offset).weekday().number_from_monday())
    }

    /// Whole days elapsed since `ts`, floored at 1. Used to seed
    /// `daysSinceLast` from the most recent historical score document.
    pub fn days_since(&self, ts: &str) -> i64 {
        let Ok(t) = DateTime::parse_from_rfc3339(ts) else {
            return 1;
        };
        let days = (self.now() - t.with_timezone(&self.offset)).num_hours() / 24 + 1;
        days.max(1)
    }

    /// Number of non-weekend days among the `gap` days preceding today.
    /// Floored at 1 so decay always advances.
    pub fn weekdays_in_gap(&self, gap: i64) -> i64 {
        weekdays_in_gap_before(self.now().date_naive(), gap)
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }
}

/// Weekend-skip decay counts only Mon–Fri among the `gap` days before
/// `reference`, floored at 1.
pub fn weekdays_in_gap_before(reference: chrono::NaiveDate, gap: i64) -> i64 {
    let mut count = 0;
    for i in 1..=gap {
        let d = reference - chrono::Duration::days(i);
        if d.weekday() != Weekday::Sat && d.weekday() != Weekday::Sun {
            count += 1;
        }
    }
    count.max(1)
}

fn parse_offset(s: &str) -> Option<FixedOffset> {
    let s = s.trim();
    let (sign, rest) = match s.as_bytes().first() {
        Some(b'+') => (1, &s[1..]),
        Some(b'-') => (-1, &s[1..]),
        _ => return None,
    };
    let (h, m) = match rest.split_once(':') {
        Some((h, m)) => (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?),
        None => (rest.parse::<i32>().ok()?, 0),
    };
    FixedOffset::east_opt(sign * (h * 3600 + m * 60))
}

/// Offset string (e.g. `+09:00`) for script predicates pushed down to the
/// search engine.
pub fn offset_string(offset: FixedOffset) -> String {
    let secs = offset.local_minus_utc();
    let sign = if secs < 0 { '-' } else { '+' };
    let secs = secs.abs();
    format!("{}{:02}:{:02}", sign, secs / 3600, (secs % 3600) / 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tz_parsing() {
        assert_eq!(Clock::from_tz("UTC").offset.local_minus_utc(), 0);
        assert_eq!(Clock::from_tz("Asia/Seoul").offset.local_minus_utc(), 9 * 3600);
        assert_eq!(Clock::from_tz("+05:30").offset.local_minus_utc(), 5 * 3600 + 1800);
        assert_eq!(Clock::from_tz("-03:00").offset.local_minus_utc(), -3 * 3600);
        // unknown name falls back to KST
        assert_eq!(Clock::from_tz("Mars/Olympus").offset.local_minus_utc(), 9 * 3600);
    }

    #[test]
    fn hour_respects_offset() {
        let clock = Clock::from_tz("UTC");
        assert_eq!(clock.hour_of("2025-03-01T22:30:00+00:00"), Some(22));
        let kst = Clock::from_tz("Asia/Seoul");
        assert_eq!(kst.hour_of("2025-03-01T22:30:00+00:00"), Some(7));
    }

    #[test]
    fn offset_string_format() {
        assert_eq!(offset_string(FixedOffset::east_opt(9 * 3600).unwrap()), "+09:00");
        assert_eq!(offset_string(FixedOffset::west_opt(3 * 3600 + 1800).unwrap()), "-03:30");
    }

    #[test]
    fn weekend_gap_counting() {
        // Tuesday 2025-03-04; the 3 preceding days are Mon, Sun, Sat → 1
        let tue = chrono::NaiveDate::from_ymd_opt(2025, 3, 4).unwrap();
        assert_eq!(weekdays_in_gap_before(tue, 3), 1);
        // Friday 2025-03-07; 3 preceding days are Thu, Wed, Tue → 3
        let fri = chrono::NaiveDate::from_ymd_opt(2025, 3, 7).unwrap();
        assert_eq!(weekdays_in_gap_before(fri, 3), 3);
        // Monday 2025-03-03; preceding day is Sunday → floored at 1
        let mon = chrono::NaiveDate::from_ymd_opt(2025, 3, 3).unwrap();
        assert_eq!(weekdays_in_gap_before(mon, 1), 1);
    }
}
