//! Histogram bucket-map specification.
//!
//! A specification is the JSON document served per source revision: a
//! top-level `histograms` object mapping histogram names to definitions.
//! Parsed once, shared read-only by every record carrying that revision.

use std::collections::HashMap;

use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("json parse failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("histograms element must be an object")]
    NotAnObject,
    #[error("Key: '{key}' {message}")]
    Definition { key: String, message: String },
}

/// One histogram's bucket layout.
///
/// `buckets` maps a bucket's lower bound to its index in the declared
/// bucket order; indices are a dense permutation of `0..bucket_count`.
#[derive(Debug)]
pub struct HistogramDefinition {
    kind: i64,
    min: i64,
    max: i64,
    bucket_count: usize,
    buckets: HashMap<i64, usize>,
}

impl HistogramDefinition {
    fn from_json(value: &Value) -> Result<Self, String> {
        // kind arrives as a stringified integer
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .ok_or("missing kind element")?
            .parse::<i64>()
            .map_err(|_| "kind element is not an integer".to_string())?;

        let min = value
            .get("min")
            .and_then(Value::as_i64)
            .ok_or("missing min element")?;
        let max = value
            .get("max")
            .and_then(Value::as_i64)
            .ok_or("missing max element")?;
        let bucket_count = value
            .get("bucket_count")
            .and_then(Value::as_i64)
            .ok_or("missing bucket_count element")?;

        let array = value
            .get("buckets")
            .and_then(Value::as_array)
            .ok_or("missing bucket array element")?;

        let mut buckets = HashMap::with_capacity(array.len());
        for (index, lower) in array.iter().enumerate() {
            let lower = lower
                .as_i64()
                .ok_or("buckets array must contain integer elements")?;
            buckets.insert(lower, index);
        }
        if buckets.len() as i64 != bucket_count {
            return Err(format!(
                "buckets array should contain: {} elements;  {} were specified",
                bucket_count,
                buckets.len()
            ));
        }

        Ok(HistogramDefinition {
            kind,
            min,
            max,
            bucket_count: bucket_count as usize,
            buckets,
        })
    }

    /// Index of the bucket with the given lower bound, if any.
    pub fn bucket_index(&self, lower_bound: i64) -> Option<usize> {
        self.buckets.get(&lower_bound).copied()
    }

    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    pub fn kind(&self) -> i64 {
        self.kind
    }

    pub fn range(&self) -> (i64, i64) {
        (self.min, self.max)
    }
}

/// The full set of histogram definitions for one revision.
#[derive(Debug)]
pub struct HistogramSpec {
    definitions: HashMap<String, HistogramDefinition>,
}

impl HistogramSpec {
    /// Parse a specification from raw JSON bytes.
    pub fn parse(json: &[u8]) -> Result<Self, SpecError> {
        let doc: Value = serde_json::from_slice(json)?;
        let histograms = doc
            .get("histograms")
            .and_then(Value::as_object)
            .ok_or(SpecError::NotAnObject)?;

        let mut definitions = HashMap::with_capacity(histograms.len());
        for (name, entry) in histograms {
            if !entry.is_object() {
                return Err(SpecError::Definition {
                    key: name.clone(),
                    message: "is not a histogram definition".to_string(),
                });
            }
            let def = HistogramDefinition::from_json(entry).map_err(|message| {
                SpecError::Definition {
                    key: name.clone(),
                    message,
                }
            })?;
            definitions.insert(name.clone(), def);
        }

        Ok(HistogramSpec { definitions })
    }

    /// Look up a histogram definition by name.
    pub fn definition(&self, name: &str) -> Option<&HistogramDefinition> {
        self.definitions.get(name)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
