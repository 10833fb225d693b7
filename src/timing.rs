//! Timestamp helpers: "now", and lenient parsing of FHIR's `dateTime` type.

use chrono::{DateTime, NaiveDate, Utc};

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Parse a FHIR `dateTime` value into a UTC timestamp, comparison-oriented
/// rather than precision-preserving: FHIR allows bare `YYYY` and `YYYY-MM`,
/// which we pad out to the first day/month so every value can be compared.
/// Naive values (no offset) are assumed UTC — we mostly care about ordering,
/// and a local-timezone guess would just make tests flaky.
pub fn parse_datetime(value: Option<&str>) -> Option<DateTime<Utc>> {
    let value = value?;
    if value.is_empty() {
        return None;
    }

    let padded = match value.len() {
        4 => format!("{value}-01-01"),
        7 => format!("{value}-01"),
        _ => value.to_string(),
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(&padded) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(&padded, "%Y-%m-%d") {
        return Some(DateTime::from_naive_utc_and_offset(date.and_hms_opt(0, 0, 0)?, Utc));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_year_only() {
        let dt = parse_datetime(Some("2022")).unwrap();
        assert_eq!(dt.to_rfc3339(), "2022-01-01T00:00:00+00:00");
    }

    #[test]
    fn pads_year_month() {
        let dt = parse_datetime(Some("2022-07")).unwrap();
        assert_eq!(dt.to_rfc3339(), "2022-07-01T00:00:00+00:00");
    }

    #[test]
    fn parses_full_instant() {
        let dt = parse_datetime(Some("2022-07-15T12:30:00Z")).unwrap();
        assert_eq!(dt.to_rfc3339(), "2022-07-15T12:30:00+00:00");
    }

    #[test]
    fn none_on_empty() {
        assert_eq!(parse_datetime(Some("")), None);
        assert_eq!(parse_datetime(None), None);
    }
}
