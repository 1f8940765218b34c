//! Dimension schema: routes a converted record to its partition path.
//!
//! The schema is an ordered list of dimension rules loaded from JSON.
//! Order defines the on-disk layout; the separator before the final
//! dimension is `.` rather than `/`, giving paths like `a/b/c/d.e`.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::metrics::SchemaMetrics;

/// Token emitted for values a dimension does not accept.
const OTHER: &str = "other";

/// Matching rule for one dimension.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AllowedValues {
    /// `"*"` accepts anything; otherwise exact match.
    Value(String),
    /// Membership in a fixed set.
    Set(HashSet<String>),
    /// Inclusive numeric range.
    Range { min: f64, max: f64 },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Dimension {
    pub field_name: String,
    pub allowed_values: AllowedValues,
}

#[derive(Debug, Deserialize)]
struct SchemaFile {
    version: i64,
    dimensions: Vec<Dimension>,
}

/// Ordered dimension rules plus the schema version.
#[derive(Debug)]
pub struct DimensionSchema {
    version: i64,
    dimensions: Vec<Dimension>,
    pub metrics: SchemaMetrics,
}

impl DimensionSchema {
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read(path)
            .with_context(|| format!("file open failed: {}", path.display()))?;
        Self::parse(&json)
    }

    pub fn parse(json: &[u8]) -> Result<Self> {
        let file: SchemaFile =
            serde_json::from_slice(json).context("invalid dimension schema")?;
        Ok(DimensionSchema {
            version: file.version,
            dimensions: file.dimensions,
            metrics: SchemaMetrics::default(),
        })
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    /// Compute the partition path for a record's `info` object.
    ///
    /// `submission_date` is a virtual dimension derived from the record
    /// timestamp. Values a dimension rejects map to `other`; type
    /// mismatches are counted and contribute nothing to the path.
    pub fn dimension_path(&mut self, info: &Value, timestamp_ms: u64) -> String {
        let mut path = String::new();
        let count = self.dimensions.len();
        let mut separator = "";

        for (i, dim) in self.dimensions.iter().enumerate() {
            if i + 1 == count {
                separator = ".";
            } else if !path.is_empty() {
                separator = "/";
            }

            if dim.field_name == "submission_date" {
                let date = format_submission_date(timestamp_ms);
                process_string_dimension(
                    dim,
                    &date,
                    separator,
                    &mut path,
                    &mut self.metrics,
                );
                continue;
            }

            match info.get(&dim.field_name) {
                Some(Value::String(s)) => {
                    process_string_dimension(dim, s, separator, &mut path, &mut self.metrics);
                }
                Some(v) if v.is_number() => {
                    let n = v.as_f64().unwrap_or_default();
                    match dim.allowed_values {
                        AllowedValues::Range { min, max } => {
                            if n >= min && n <= max {
                                path.push_str(separator);
                                path.push_str(&n.to_string());
                            } else {
                                path.push_str(separator);
                                path.push_str(OTHER);
                            }
                        }
                        _ => {
                            // string comparison not allowed on numbers
                            self.metrics.invalid_numeric_dimension += 1;
                        }
                    }
                }
                _ => {}
            }
        }

        path
    }
}

fn process_string_dimension(
    dim: &Dimension,
    value: &str,
    separator: &str,
    path: &mut String,
    metrics: &mut SchemaMetrics,
) {
    match &dim.allowed_values {
        AllowedValues::Value(allowed) => {
            path.push_str(separator);
            if allowed == "*" || allowed == value {
                path.push_str(&safe_path(value));
            } else {
                path.push_str(OTHER);
            }
        }
        AllowedValues::Set(set) => {
            path.push_str(separator);
            if set.contains(value) {
                path.push_str(&safe_path(value));
            } else {
                path.push_str(OTHER);
            }
        }
        AllowedValues::Range { .. } => {
            // range comparison not allowed on a string
            metrics.invalid_string_dimension += 1;
        }
    }
}

/// UTC `%Y%m%d` rendering of a millisecond timestamp; empty on overflow.
fn format_submission_date(timestamp_ms: u64) -> String {
    match Utc.timestamp_opt((timestamp_ms / 1000) as i64, 0).single() {
        Some(dt) => dt.format("%Y%m%d").to_string(),
        None => String::new(),
    }
}

/// Replace every character outside `[A-Za-z0-9_/.]` with `_`.
pub fn safe_path(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '/' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn test_schema() -> DimensionSchema {
        let json = r#"{
          "version": 1,
          "dimensions": [
            {"field_name": "reason", "allowed_values": ["idle-daily", "saved-session"]},
            {"field_name": "appName", "allowed_values": "*"},
            {"field_name": "appUpdateChannel", "allowed_values": ["release", "beta", "nightly"]},
            {"field_name": "appVersion", "allowed_values": "*"},
            {"field_name": "appBuildID", "allowed_values": "*"},
            {"field_name": "cpucount", "allowed_values": {"min": 1, "max": 64}}
          ]
        }"#;
        DimensionSchema::parse(json.as_bytes()).unwrap()
    }

    fn canonical_info() -> Value {
        json!({
            "reason": "idle-daily",
            "appName": "Firefox",
            "appUpdateChannel": "release",
            "appVersion": "23.0.1",
            "appBuildID": "20130814063812",
            "cpucount": 1
        })
    }

    #[test]
    fn test_canonical_path() {
        let mut schema = test_schema();
        assert_eq!(schema.version(), 1);
        let path = schema.dimension_path(&canonical_info(), 0);
        assert_eq!(path, "idle_daily/Firefox/release/23.0.1/20130814063812.1");
    }

    #[test]
    fn test_range_out_of_bounds_is_other() {
        let mut schema = test_schema();
        let mut info = canonical_info();
        info["cpucount"] = json!(128);
        let path = schema.dimension_path(&info, 0);
        assert!(path.ends_with(".other"), "{}", path);
    }

    #[test]
    fn test_set_miss_is_other() {
        let mut schema = test_schema();
        let mut info = canonical_info();
        info["appUpdateChannel"] = json!("esr");
        let path = schema.dimension_path(&info, 0);
        assert_eq!(path, "idle_daily/Firefox/other/23.0.1/20130814063812.1");
    }

    #[test]
    fn test_string_against_range_is_skipped_and_counted() {
        let mut schema = test_schema();
        let mut info = canonical_info();
        info["cpucount"] = json!("four");
        let path = schema.dimension_path(&info, 0);
        // Last dimension contributed nothing; no trailing "." token
        assert_eq!(path, "idle_daily/Firefox/release/23.0.1/20130814063812");
        assert_eq!(schema.metrics.invalid_string_dimension, 1);
    }

    #[test]
    fn test_number_against_set_is_skipped_and_counted() {
        let mut schema = test_schema();
        let mut info = canonical_info();
        info["reason"] = json!(7);
        let path = schema.dimension_path(&info, 0);
        assert_eq!(path, "Firefox/release/23.0.1/20130814063812.1");
        assert_eq!(schema.metrics.invalid_numeric_dimension, 1);
    }

    #[test]
    fn test_missing_field_is_skipped_silently() {
        let mut schema = test_schema();
        let mut info = canonical_info();
        info.as_object_mut().unwrap().remove("appName");
        let path = schema.dimension_path(&info, 0);
        assert_eq!(path, "idle_daily/release/23.0.1/20130814063812.1");
        assert_eq!(schema.metrics.invalid_string_dimension, 0);
        assert_eq!(schema.metrics.invalid_numeric_dimension, 0);
    }

    #[test]
    fn test_submission_date_dimension() {
        let json = r#"{
          "version": 1,
          "dimensions": [
            {"field_name": "appName", "allowed_values": "*"},
            {"field_name": "submission_date", "allowed_values": "*"}
          ]
        }"#;
        let mut schema = DimensionSchema::parse(json.as_bytes()).unwrap();
        // 2013-08-14 00:00:00 UTC
        let ts_ms = 1_376_438_400_000u64;
        let path = schema.dimension_path(&json!({"appName": "Firefox"}), ts_ms);
        assert_eq!(path, "Firefox.20130814");
    }

    #[test]
    fn test_submission_date_follows_dimension_rules() {
        // the derived date is matched against the dimension's rule like
        // any other string value
        let json = r#"{
          "version": 1,
          "dimensions": [
            {"field_name": "submission_date", "allowed_values": ["20130814"]},
            {"field_name": "appName", "allowed_values": "*"}
          ]
        }"#;
        let mut schema = DimensionSchema::parse(json.as_bytes()).unwrap();
        let info = json!({"appName": "Firefox"});

        let ts_ms = 1_376_438_400_000u64; // 2013-08-14 UTC
        assert_eq!(schema.dimension_path(&info, ts_ms), "20130814.Firefox");

        let next_day = ts_ms + 86_400_000;
        assert_eq!(schema.dimension_path(&info, next_day), "other.Firefox");
    }

    #[test]
    fn test_safe_path() {
        assert_eq!(safe_path("idle-daily"), "idle_daily");
        assert_eq!(safe_path("a b/c.d_e:f"), "a_b/c.d_e_f");
        let cleaned = safe_path("x\u{e9}y%40z");
        assert!(cleaned
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '/' || c == '.'));
    }

    #[test]
    fn test_invalid_allowed_values_rejected() {
        let json = r#"{
          "version": 1,
          "dimensions": [{"field_name": "x", "allowed_values": [1, 2]}]
        }"#;
        assert!(DimensionSchema::parse(json.as_bytes()).is_err());
    }

    #[test]
    fn test_missing_version_rejected() {
        let json = r#"{"dimensions": []}"#;
        assert!(DimensionSchema::parse(json.as_bytes()).is_err());
    }
}
