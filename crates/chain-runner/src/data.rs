//! Writers for sampler data and inits files.
//!
//! Variables are numbers or rectangular nested arrays of numbers. Anything
//! else (strings, booleans, nulls, ragged arrays) is rejected up front so the
//! sampler never sees a file it cannot read.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde_json::Value;

use crate::error::DataError;

pub type DataMap = BTreeMap<String, Value>;

/// Writes `data` as a JSON object.
pub fn write_json_data(path: &Path, data: &DataMap) -> Result<(), DataError> {
    for (name, value) in data {
        shape(name, value)?;
    }
    let bytes = serde_json::to_vec_pretty(data)?;
    fs::write(path, bytes).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes `data` in R dump format; arrays of rank two or more become
/// `structure(c(...), .Dim = c(...))` with values in column-major order.
pub fn write_rdump(path: &Path, data: &DataMap) -> Result<(), DataError> {
    let mut out = String::new();
    for (name, value) in data {
        let dims = shape(name, value)?;
        let mut flat = Vec::new();
        flatten(value, &mut flat);
        let rendered = match dims.len() {
            0 => flat.first().cloned().unwrap_or_default(),
            1 if flat.is_empty() => "integer(0)".to_string(),
            1 => format!("c({})", flat.join(", ")),
            _ => format!(
                "structure({}, .Dim = c({}))",
                if flat.is_empty() {
                    "integer(0)".to_string()
                } else {
                    format!("c({})", column_major(&flat, &dims).join(", "))
                },
                dims.iter()
                    .map(usize::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        };
        out.push_str(&format!("{} <- {}\n", name, rendered));
    }
    fs::write(path, out).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn shape(name: &str, value: &Value) -> Result<Vec<usize>, DataError> {
    let unsupported = |reason: &str| DataError::Unsupported {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    match value {
        Value::Number(_) => Ok(Vec::new()),
        Value::Array(items) => {
            let Some(first) = items.first() else {
                return Ok(vec![0]);
            };
            let inner = shape(name, first)?;
            for item in &items[1..] {
                if shape(name, item)? != inner {
                    return Err(unsupported("ragged array"));
                }
            }
            let mut dims = vec![items.len()];
            dims.extend(inner);
            Ok(dims)
        }
        Value::Bool(_) => Err(unsupported("booleans are not numeric")),
        Value::String(_) => Err(unsupported("strings are not numeric")),
        Value::Null => Err(unsupported("null value")),
        Value::Object(_) => Err(unsupported("nested objects are not supported")),
    }
}

fn flatten(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Array(items) => items.iter().for_each(|item| flatten(item, out)),
        other => out.push(other.to_string()),
    }
}

/// Reorders row-major `flat` so the first index varies fastest.
fn column_major(flat: &[String], dims: &[usize]) -> Vec<String> {
    let mut strides = vec![1usize; dims.len()];
    for d in (0..dims.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * dims[d + 1];
    }
    (0..flat.len())
        .map(|k| {
            let mut rem = k;
            let mut offset = 0;
            for (dim, stride) in dims.iter().zip(&strides) {
                offset += (rem % dim) * stride;
                rem /= dim;
            }
            flat[offset].clone()
        })
        .collect()
}
