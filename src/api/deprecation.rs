//! Deprecation and sunset headers for retiring API versions

use chrono::{DateTime, Months, NaiveDate, Utc};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

use super::version::ApiVersion;

/// Months between server start and the default sunset date
pub const DEFAULT_SUNSET_MONTHS: u32 = 6;

/// Format a timestamp as an HTTP-date (RFC 7231 IMF-fixdate)
pub fn http_date(date: DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// `months` months after `from`, clamped to the end of shorter months
pub fn calculate_sunset(from: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    from.checked_add_months(Months::new(months)).unwrap_or(from)
}

/// Parse a configured sunset date (`2026-06-01` or RFC 3339)
pub fn parse_sunset_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(date) = DateTime::parse_from_rfc3339(value) {
        return Some(date.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Sunset for `configured`, or six months from `now` when absent or invalid
pub fn resolve_sunset(configured: Option<&str>, now: DateTime<Utc>) -> DateTime<Utc> {
    match configured {
        Some(value) => parse_sunset_date(value).unwrap_or_else(|| {
            warn!(value, "Invalid sunset date, using default");
            calculate_sunset(now, DEFAULT_SUNSET_MONTHS)
        }),
        None => calculate_sunset(now, DEFAULT_SUNSET_MONTHS),
    }
}

/// Headers announcing that a version is deprecated
///
/// Built once at startup and copied onto every matching response.
#[derive(Debug, Clone)]
pub struct DeprecationNotice {
    pub version: ApiVersion,
    pub sunset: DateTime<Utc>,
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl DeprecationNotice {
    pub fn new(version: ApiVersion, sunset: DateTime<Utc>, migration_url: &str, message: &str) -> Self {
        let mut headers = vec![
            (HeaderName::from_static("deprecation"), HeaderValue::from_static("true")),
        ];

        match HeaderValue::from_str(&http_date(sunset)) {
            Ok(value) => headers.push((HeaderName::from_static("sunset"), value)),
            Err(e) => warn!(error = %e, "Sunset date is not a valid header value"),
        }

        match HeaderValue::from_str(&format!("<{}>; rel=\"deprecation\"", migration_url)) {
            Ok(value) => headers.push((hyper::header::LINK, value)),
            Err(e) => warn!(error = %e, url = migration_url, "Migration guide URL is not a valid header value"),
        }

        match HeaderValue::from_str(&format!("299 - \"{}\"", message.replace('"', "'"))) {
            Ok(value) => headers.push((hyper::header::WARNING, value)),
            Err(e) => warn!(error = %e, "Deprecation message is not a valid header value"),
        }

        Self {
            version,
            sunset,
            headers,
        }
    }

    /// Notice for v1, pointing clients at v2
    pub fn for_v1(configured_sunset: Option<&str>, migration_url: &str) -> Self {
        let sunset = resolve_sunset(configured_sunset, Utc::now());
        Self::new(
            ApiVersion::V1,
            sunset,
            migration_url,
            "API v1 is deprecated and will be retired; migrate to /api/v2",
        )
    }

    pub fn applies_to(&self, version: ApiVersion) -> bool {
        self.version == version
    }

    pub fn apply(&self, headers: &mut HeaderMap) {
        for (name, value) in &self.headers {
            headers.insert(name.clone(), value.clone());
        }
    }
}
