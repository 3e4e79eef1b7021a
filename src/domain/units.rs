use chrono::{DateTime, SecondsFormat, Utc};

const MILES_TO_KM: f64 = 1.60934;

/// Converts a distance reported in miles to kilometres.
pub fn miles_to_km(miles: f64) -> f64 {
    miles * MILES_TO_KM
}

/// Converts a speed reported in mph to km/h.
pub fn mph_to_kmh(mph: f64) -> f64 {
    mph * MILES_TO_KM
}

/// Formats a timestamp the way it is stored in the database: RFC3339 with
/// millisecond precision and a `Z` suffix.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses a stored timestamp back into a `DateTime<Utc>`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
