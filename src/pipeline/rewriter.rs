//! Sparse→dense histogram rewrite.
//!
//! Version-1 documents carry each histogram as an object with a sparse
//! `values` map keyed by bucket lower bound. The rewrite replaces each
//! entry with a dense positional array in the revision spec's bucket
//! order, followed by five summary statistics, and bumps `ver` to 2.

use serde_json::{json, Map, Value};

use crate::cache::HistogramCache;
use crate::histogram::{HistogramDefinition, HistogramSpec};

/// Summary statistics appended after the dense counts, in order.
pub const SUMMARY_KEYS: [&str; 5] = [
    "sum",
    "log_sum",
    "log_sum_squares",
    "sum_squares_lo",
    "sum_squares_hi",
];

/// Rewrite every histogram in `doc` against its revision's spec.
///
/// Returns `false` when the record should be discarded. A `ver == 2`
/// document is already converted and passes through untouched. On a
/// failed rewrite `ver` is set to -1; on a cache miss `ver` is left
/// alone so the failure is attributable to the missing revision.
pub fn rewrite_histograms(cache: &mut HistogramCache, doc: &mut Value) -> bool {
    let revision = match doc
        .get("info")
        .filter(|i| i.is_object())
        .and_then(|i| i.get("revision"))
        .and_then(Value::as_str)
    {
        Some(r) => r.to_string(),
        None => {
            tracing::warn!("missing info.revision");
            return false;
        }
    };

    if !doc.get("histograms").is_some_and(Value::is_object) {
        tracing::warn!("missing histograms object");
        return false;
    }

    let ver = match doc.get("ver").and_then(Value::as_i64) {
        Some(v) => v,
        None => {
            tracing::warn!("missing ver");
            return false;
        }
    };

    match ver {
        // already converted
        2 => true,
        1 => {
            let spec = match cache.find(&revision) {
                Some(s) => s,
                None => {
                    tracing::warn!(%revision, "histogram spec not found");
                    return false;
                }
            };
            let histograms = match doc.get_mut("histograms").and_then(Value::as_object_mut) {
                Some(h) => h,
                None => return false,
            };
            let ok = rewrite_all(&spec, histograms);
            doc["ver"] = json!(if ok { 2 } else { -1 });
            ok
        }
        _ => {
            tracing::warn!(ver, "invalid document version");
            false
        }
    }
}

fn rewrite_all(spec: &HistogramSpec, histograms: &mut Map<String, Value>) -> bool {
    let names: Vec<String> = histograms.keys().cloned().collect();

    for name in names {
        match histograms.get(&name) {
            Some(entry) if entry.is_object() => {}
            Some(_) => {
                tracing::warn!(%name, "not a histogram object");
                continue;
            }
            None => continue,
        }

        let mut final_name = name.clone();
        let mut definition = spec.definition(&name);
        if definition.is_none() {
            if let Some(stripped) = name.strip_prefix("STARTUP_") {
                definition = spec.definition(stripped);
                if definition.is_some() {
                    // aggregated under the non-startup name downstream
                    if let Some(entry) = histograms.remove(&name) {
                        histograms.insert(stripped.to_string(), entry);
                    }
                    final_name = stripped.to_string();
                }
            }
        }

        let definition = match definition {
            Some(d) => d,
            None => {
                tracing::warn!(%name, "histogram definition lookup failed");
                continue;
            }
        };

        let entry = match histograms.get(&final_name) {
            Some(e) => e,
            None => continue,
        };
        let rewritten = match rewrite_entry(definition, entry) {
            Some(array) => array,
            None => return false,
        };
        histograms.insert(final_name, Value::Array(rewritten));
    }

    true
}

/// Build the dense-counts-plus-summary array for one histogram entry.
fn rewrite_entry(definition: &HistogramDefinition, entry: &Value) -> Option<Vec<Value>> {
    let values = match entry.get("values").and_then(Value::as_object) {
        Some(v) => v,
        None => {
            tracing::warn!("values object not found");
            return None;
        }
    };

    let mut dense = vec![0i64; definition.bucket_count()];
    for (key, count) in values {
        let count = match count.as_i64() {
            Some(c) => c,
            None => {
                tracing::warn!(%key, "invalid value object");
                return None;
            }
        };
        let lower_bound: i64 = match key.parse() {
            Ok(lb) => lb,
            Err(_) => {
                tracing::warn!(%key, "invalid bucket lower bound");
                return None;
            }
        };
        match definition.bucket_index(lower_bound) {
            Some(index) => dense[index] = count,
            None => {
                tracing::warn!(lower_bound, "invalid bucket lower bound");
                return None;
            }
        }
    }

    let mut array: Vec<Value> = dense.into_iter().map(Value::from).collect();
    for key in SUMMARY_KEYS {
        let value = entry
            .get(key)
            .filter(|v| v.is_number())
            .cloned()
            .unwrap_or_else(|| json!(-1));
        array.push(value);
    }
    Some(array)
}
