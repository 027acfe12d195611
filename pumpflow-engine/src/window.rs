use chrono::{DateTime, Utc};

/// Parses a granularity spec like `30m`/`1h` into seconds, per
/// `_parse_granularity`: minutes are floored at 60s, hours at 3600s, and
/// anything unrecognized (including an empty spec) falls back to 1h.
pub fn parse_granularity(spec: &str) -> i64 {
    let s = spec.trim().to_lowercase();
    if let Some(digits) = s.strip_suffix('m') {
        if let Ok(minutes) = digits.parse::<i64>() {
            return (minutes * 60).max(60);
        }
    } else if let Some(digits) = s.strip_suffix('h') {
        if let Ok(hours) = digits.parse::<i64>() {
            return (hours * 3600).max(3600);
        }
    }
    3600
}

/// Splits `[start, end)` into consecutive `step_seconds`-wide segments; the
/// final segment is clipped to `end` rather than overshooting it.
pub fn split_window(start: DateTime<Utc>, end: DateTime<Utc>, step_seconds: i64) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut out = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let next = (cursor + chrono::Duration::seconds(step_seconds)).min(end);
        out.push((cursor, next));
        cursor = next;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_minute_and_hour_granularities() {
        assert_eq!(parse_granularity("30m"), 1800);
        assert_eq!(parse_granularity("1h"), 3600);
        assert_eq!(parse_granularity("2h"), 7200);
        assert_eq!(parse_granularity("0m"), 60);
    }

    #[test]
    fn unrecognized_granularity_defaults_to_one_hour() {
        assert_eq!(parse_granularity(""), 3600);
        assert_eq!(parse_granularity("weekly"), 3600);
    }

    #[test]
    fn splits_two_hour_window_into_one_hour_segments() {
        let start = Utc.with_ymd_and_hms(2025, 2, 28, 2, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 2, 28, 4, 0, 0).unwrap();
        let segments = split_window(start, end, 3600);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0], (start, start + chrono::Duration::hours(1)));
        assert_eq!(segments[1].1, end);
    }

    #[test]
    fn final_segment_is_clipped_to_end() {
        let start = Utc.with_ymd_and_hms(2025, 2, 28, 2, 0, 0).unwrap();
        let end = start + chrono::Duration::minutes(90);
        let segments = split_window(start, end, 3600);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].1, end);
    }
}
