// Timestamps and the conversions the pipeline needs between accounting times, sample times (float
// seconds since the epoch) and the textual forms used in paths and on merge-tool command lines.

use anyhow::{bail, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::prelude::{DateTime, TimeZone, Utc};

pub type Timestamp = DateTime<Utc>;

pub fn epoch() -> Timestamp {
    DateTime::UNIX_EPOCH
}

pub fn now() -> Timestamp {
    Utc::now()
}

pub fn timestamp_from_ymdhms(
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
) -> Result<Timestamp> {
    match Utc.with_ymd_and_hms(year, month, day, hour, minute, second).single() {
        Some(t) => Ok(t),
        None => bail!("Invalid date {year}-{month}-{day} {hour}:{minute}:{second}"),
    }
}

pub fn timestamp_from_epoch(secs: i64) -> Result<Timestamp> {
    match DateTime::from_timestamp(secs, 0) {
        Some(t) => Ok(t),
        None => bail!("Epoch time out of range: {secs}"),
    }
}

/// Float seconds as they appear in samples.  Sub-second precision is kept to the nanosecond.

pub fn timestamp_from_epoch_f64(secs: f64) -> Result<Timestamp> {
    if !secs.is_finite() {
        bail!("Non-finite epoch time");
    }
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
    match DateTime::from_timestamp(whole as i64, nanos) {
        Some(t) => Ok(t),
        None => bail!("Epoch time out of range: {secs}"),
    }
}

pub fn epoch_secs(t: Timestamp) -> i64 {
    t.timestamp()
}

pub fn epoch_secs_f64(t: Timestamp) -> f64 {
    t.timestamp() as f64 + t.timestamp_subsec_nanos() as f64 / 1e9
}

/// Accepts RFC 3339 ("2020-06-01T00:00:00Z"), "YYYY-MM-DD HH:MM:SS" taken as UTC, or an integer
/// number of seconds since the epoch.

pub fn parse_timestamp(s: &str) -> Result<Timestamp> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(t) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(t.and_utc());
    }
    if let Ok(secs) = s.parse::<i64>() {
        return timestamp_from_epoch(secs);
    }
    bail!("Unrecognized timestamp '{s}'")
}

// Time syntax understood by the external archive merge tool's -S and -T options.

pub fn merge_tool_time(t: Timestamp) -> String {
    t.format("@%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Expand a directory template: `%r` becomes the resource name, `%j` the local job id, and what
/// remains is handed to strftime with `t`.  A malformed strftime directive is an error rather than
/// a panic at format time.

pub fn expand_path_template(template: &str, resource: &str, jobid: &str, t: Timestamp) -> Result<String> {
    let substituted = template.replace("%r", resource).replace("%j", jobid);
    let items = StrftimeItems::new(&substituted).collect::<Vec<Item>>();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        bail!("Bad time format in path template '{template}'");
    }
    Ok(t.format_with_items(items.into_iter()).to_string())
}

#[test]
fn test_parse_timestamp() {
    let t = timestamp_from_ymdhms(2020, 6, 1, 0, 10, 0).unwrap();
    assert!(parse_timestamp("2020-06-01T00:10:00Z").unwrap() == t);
    assert!(parse_timestamp("2020-06-01 00:10:00").unwrap() == t);
    assert!(parse_timestamp("1590970200").unwrap() == t);
    assert!(parse_timestamp("yesterday").is_err());
    assert!(epoch_secs(t) == 1590970200);
}

#[test]
fn test_fractional_epoch() {
    let t = timestamp_from_epoch_f64(1590969603.25).unwrap();
    assert!(epoch_secs(t) == 1590969603);
    assert!(epoch_secs_f64(t) == 1590969603.25);
}

#[test]
fn test_merge_tool_time() {
    let t = timestamp_from_ymdhms(2020, 6, 1, 0, 0, 3).unwrap();
    assert!(merge_tool_time(t) == "@2020-06-01 00:00:03 UTC");
}

#[test]
fn test_expand_path_template() {
    let t = timestamp_from_ymdhms(2020, 6, 1, 0, 10, 0).unwrap();
    assert!(expand_path_template("%r/%Y%m%d/%j", "ub-hpc", "1001", t).unwrap() == "ub-hpc/20200601/1001");
    assert!(expand_path_template("%r/%Q", "ub-hpc", "1001", t).is_err());
}
