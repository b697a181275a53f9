//! Core domain model for the detail loader: report rows, fetch windows and credentials.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "tdl-core";

/// Date format used by the reporting API for `since` / `until`.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Epoch values at or above this magnitude are read as milliseconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// API key plus the default workspace, read once at startup.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    pub api_key: String,
    pub workspace_id: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &if self.api_key.is_empty() { "<unset>" } else { "<redacted>" })
            .field("workspace_id", &self.workspace_id)
            .finish()
    }
}

/// Inclusive date range bounding one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub since: NaiveDate,
    pub until: NaiveDate,
}

impl TimeWindow {
    pub fn new(since: NaiveDate, until: NaiveDate) -> Self {
        Self { since, until }
    }

    pub fn single_day(day: NaiveDate) -> Self {
        Self::new(day, day)
    }

    /// The calendar day before `today`.
    pub fn yesterday_from(today: NaiveDate) -> Self {
        Self::single_day(today.checked_sub_days(Days::new(1)).unwrap_or(today))
    }

    /// Both bounds or yesterday: a half-specified window falls back entirely.
    pub fn resolve(since: Option<NaiveDate>, until: Option<NaiveDate>, today: NaiveDate) -> Self {
        match (since, until) {
            (Some(since), Some(until)) => Self::new(since, until),
            _ => Self::yesterday_from(today),
        }
    }

    pub fn since_param(&self) -> String {
        self.since.format(DATE_FORMAT).to_string()
    }

    pub fn until_param(&self) -> String {
        self.until.format(DATE_FORMAT).to_string()
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.since_param(), self.until_param())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum NormalizeError {
    #[error("record {index} is not a JSON object")]
    NotAnObject { index: usize },
    #[error("record {index} has no integer `id`")]
    MissingId { index: usize },
    #[error("record {id}: required timestamp `{field}` is missing")]
    MissingTimestamp { id: i64, field: &'static str },
    #[error("record {id}: `{field}` is not a timestamp: {raw}")]
    InvalidTimestamp {
        id: i64,
        field: &'static str,
        raw: String,
    },
}

/// One normalized time entry. `fields` carries every descriptive key untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub id: i64,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub fields: Map<String, JsonValue>,
}

impl ReportRecord {
    /// Pulls `id` and the three timestamp columns out of a raw API record.
    pub fn from_raw(index: usize, raw: JsonValue) -> Result<Self, NormalizeError> {
        let JsonValue::Object(mut fields) = raw else {
            return Err(NormalizeError::NotAnObject { index });
        };
        let id = fields
            .remove("id")
            .and_then(|v| v.as_i64())
            .ok_or(NormalizeError::MissingId { index })?;

        let start = take_timestamp(&mut fields, id, "start")?
            .ok_or(NormalizeError::MissingTimestamp { id, field: "start" })?;
        let end = take_timestamp(&mut fields, id, "end")?;
        let updated = take_timestamp(&mut fields, id, "updated")?;

        Ok(Self {
            id,
            start,
            end,
            updated,
            fields,
        })
    }
}

fn take_timestamp(
    fields: &mut Map<String, JsonValue>,
    id: i64,
    field: &'static str,
) -> Result<Option<DateTime<Utc>>, NormalizeError> {
    let raw = fields.remove(field).unwrap_or(JsonValue::Null);
    coerce_timestamp(&raw).ok_or_else(|| NormalizeError::InvalidTimestamp {
        id,
        field,
        raw: raw.to_string(),
    })
}

/// Coerces an API timestamp into UTC.
///
/// Accepts RFC 3339 strings, naive `T`/space separated datetimes and bare
/// dates (read as UTC, dates at midnight), and epoch numbers (seconds, or
/// milliseconds past [`EPOCH_MILLIS_THRESHOLD`]; fractions are kept).
/// `Some(None)` means the value was null; `None` means it could not be read.
pub fn coerce_timestamp(raw: &JsonValue) -> Option<Option<DateTime<Utc>>> {
    match raw {
        JsonValue::Null => Some(None),
        JsonValue::String(s) => parse_timestamp_str(s).map(Some),
        JsonValue::Number(n) => match n.as_i64() {
            Some(v) => epoch_to_utc(v).map(Some),
            None => n.as_f64().and_then(float_epoch_to_utc).map(Some),
        },
        _ => None,
    }
}

fn parse_timestamp_str(input: &str) -> Option<DateTime<Utc>> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, DATE_FORMAT)
                .ok()
                .and_then(|day| day.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}

fn epoch_to_utc(value: i64) -> Option<DateTime<Utc>> {
    if value.unsigned_abs() >= EPOCH_MILLIS_THRESHOLD.unsigned_abs() {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}

/// Fractional epochs keep their sub-second part. Values beyond the `i64`
/// second range are unreadable rather than saturated.
fn float_epoch_to_utc(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }
    let seconds = if value.abs() >= EPOCH_MILLIS_THRESHOLD as f64 {
        value / 1000.0
    } else {
        value
    };
    if seconds.abs() >= i64::MAX as f64 {
        return None;
    }
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9).round() as u32;
    let (secs, nanos) = if nanos >= 1_000_000_000 {
        ((whole as i64).checked_add(1)?, nanos - 1_000_000_000)
    } else {
        (whole as i64, nanos)
    };
    DateTime::from_timestamp(secs, nanos)
}

/// Rows produced by one fetch, in API order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DetailTable {
    pub rows: Vec<ReportRecord>,
}

impl DetailTable {
    pub fn from_raw_records(raw: Vec<JsonValue>) -> Result<Self, NormalizeError> {
        let rows = raw
            .into_iter()
            .enumerate()
            .map(|(index, value)| ReportRecord::from_raw(index, value))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn ids(&self) -> BTreeSet<i64> {
        self.rows.iter().map(|r| r.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn window_defaults_to_previous_calendar_day() {
        let w = TimeWindow::resolve(None, None, ymd(2022, 3, 1));
        assert_eq!(w, TimeWindow::single_day(ymd(2022, 2, 28)));
    }

    #[test]
    fn half_specified_window_falls_back_to_yesterday() {
        let w = TimeWindow::resolve(Some(ymd(2022, 1, 1)), None, ymd(2022, 1, 30));
        assert_eq!(w, TimeWindow::single_day(ymd(2022, 1, 29)));
    }

    #[test]
    fn window_params_use_api_date_format() {
        let w = TimeWindow::resolve(Some(ymd(2022, 1, 29)), Some(ymd(2022, 1, 29)), ymd(2030, 1, 1));
        assert_eq!(w.since_param(), "2022-01-29");
        assert_eq!(w.until_param(), "2022-01-29");
    }

    #[test]
    fn coerces_offset_strings_to_utc() {
        let ts = coerce_timestamp(&json!("2022-01-29T09:15:00+01:00")).unwrap().unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2022, 1, 29, 8, 15, 0).unwrap());
    }

    #[test]
    fn coerces_naive_strings_and_epochs() {
        let expected = Utc.with_ymd_and_hms(2022, 1, 29, 8, 0, 0).unwrap();
        assert_eq!(coerce_timestamp(&json!("2022-01-29 08:00:00")), Some(Some(expected)));
        assert_eq!(coerce_timestamp(&json!("2022-01-29T08:00:00")), Some(Some(expected)));
        assert_eq!(coerce_timestamp(&json!(expected.timestamp())), Some(Some(expected)));
        assert_eq!(coerce_timestamp(&json!(expected.timestamp_millis())), Some(Some(expected)));
        assert_eq!(coerce_timestamp(&JsonValue::Null), Some(None));
        assert_eq!(coerce_timestamp(&json!("yesterday-ish")), None);
        assert_eq!(coerce_timestamp(&json!(true)), None);
    }

    #[test]
    fn extreme_epochs_are_unreadable_not_panics() {
        assert_eq!(coerce_timestamp(&json!(i64::MIN)), None);
        assert_eq!(coerce_timestamp(&json!(i64::MAX)), None);
        assert_eq!(coerce_timestamp(&json!(u64::MAX)), None);
        assert_eq!(coerce_timestamp(&json!(-1e300)), None);
        assert_eq!(coerce_timestamp(&json!(1e300)), None);
        assert!(matches!(
            ReportRecord::from_raw(0, json!({"id": 1, "start": -1e300})).unwrap_err(),
            NormalizeError::InvalidTimestamp { id: 1, field: "start", .. }
        ));
    }

    #[test]
    fn fractional_epochs_keep_sub_seconds() {
        let base = Utc.with_ymd_and_hms(2022, 1, 29, 8, 0, 0).unwrap();
        let half = base + chrono::Duration::milliseconds(500);
        assert_eq!(coerce_timestamp(&json!(1643443200.5)), Some(Some(half)));
        assert_eq!(coerce_timestamp(&json!(1643443200500.0)), Some(Some(half)));
        assert_eq!(coerce_timestamp(&json!(-0.25)), Some(DateTime::from_timestamp(-1, 750_000_000)));
    }

    #[test]
    fn date_only_strings_are_midnight_utc() {
        assert_eq!(
            coerce_timestamp(&json!("2022-01-29")),
            Some(Some(Utc.with_ymd_and_hms(2022, 1, 29, 0, 0, 0).unwrap()))
        );
    }

    #[test]
    fn record_keeps_descriptive_fields_untouched() {
        let raw = json!({
            "id": 2345678901_i64,
            "pid": 170_000_001,
            "description": "Standup",
            "start": "2022-01-29T09:00:00+00:00",
            "end": "2022-01-29T09:15:00+00:00",
            "updated": "2022-01-29T09:16:02+00:00",
            "dur": 900000,
            "tags": ["meeting"]
        });
        let record = ReportRecord::from_raw(0, raw).unwrap();
        assert_eq!(record.id, 2345678901);
        assert!(record.end.is_some() && record.updated.is_some());
        assert_eq!(record.fields.get("description"), Some(&json!("Standup")));
        assert_eq!(record.fields.get("tags"), Some(&json!(["meeting"])));
        assert!(!record.fields.contains_key("start"));
        assert!(!record.fields.contains_key("id"));
    }

    #[test]
    fn running_entry_has_no_end() {
        let raw = json!({"id": 1, "start": "2022-01-29T09:00:00Z", "end": null, "updated": "2022-01-29T09:00:00Z"});
        let record = ReportRecord::from_raw(0, raw).unwrap();
        assert_eq!(record.end, None);
    }

    #[test]
    fn malformed_records_are_rejected() {
        assert_eq!(
            DetailTable::from_raw_records(vec![json!([1, 2])]).unwrap_err(),
            NormalizeError::NotAnObject { index: 0 }
        );
        assert_eq!(
            DetailTable::from_raw_records(vec![json!({"start": "2022-01-29T09:00:00Z"})]).unwrap_err(),
            NormalizeError::MissingId { index: 0 }
        );
        assert_eq!(
            DetailTable::from_raw_records(vec![json!({"id": 7})]).unwrap_err(),
            NormalizeError::MissingTimestamp { id: 7, field: "start" }
        );
        assert!(matches!(
            DetailTable::from_raw_records(vec![json!({"id": 7, "start": "soon"})]).unwrap_err(),
            NormalizeError::InvalidTimestamp { id: 7, field: "start", .. }
        ));
    }

    #[test]
    fn credentials_debug_hides_key() {
        let creds = Credentials {
            api_key: "secret-token".into(),
            workspace_id: "5997219".into(),
        };
        let shown = format!("{creds:?}");
        assert!(!shown.contains("secret-token"));
        assert!(shown.contains("5997219"));
    }
}
