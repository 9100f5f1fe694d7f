//! Merging of per-shard statistics directories.
//!
//! Every file name found in any shard directory appears in the result.
//! `*.json` files holding numbers, numeric arrays or objects of those are
//! summed element-wise (counts, sums, sums of squares). Any other file is
//! concatenated in shard order.

use crate::errors::{AggregationMismatchError, ShardflowResult};
use serde_json::{Number, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Merges shard stat directories into `dest`, returning the written files.
pub fn merge_stats(sources: &[(usize, PathBuf)], dest: &Path) -> ShardflowResult<Vec<PathBuf>> {
    let mut names = BTreeSet::new();
    for (shard, dir) in sources {
        if !dir.is_dir() {
            return Err(AggregationMismatchError::missing_output(*shard, dir).into());
        }
        let before = names.len();
        let mut found = false;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                found = true;
                names.insert(entry.file_name().to_string_lossy().into_owned());
            }
        }
        if !found {
            return Err(AggregationMismatchError::new("shard produced no stat files")
                .for_shard(*shard)
                .with_path(dir)
                .into());
        }
        debug!(shard, new_files = names.len() - before, "Scanned stat dir");
    }

    std::fs::create_dir_all(dest)?;
    let mut written = Vec::with_capacity(names.len());
    for name in names {
        let parts: Vec<(usize, PathBuf)> = sources
            .iter()
            .map(|(shard, dir)| (*shard, dir.join(&name)))
            .filter(|(_, path)| path.is_file())
            .collect();

        let target = dest.join(&name);
        if Path::new(&name).extension().is_some_and(|ext| ext == "json") {
            let merged = sum_json_files(&parts)?;
            let mut text = serde_json::to_string_pretty(&merged)?;
            text.push('\n');
            std::fs::write(&target, text)?;
        } else {
            let mut bytes = Vec::new();
            for (_, path) in &parts {
                bytes.extend(std::fs::read(path)?);
            }
            std::fs::write(&target, bytes)?;
        }
        written.push(target);
    }

    Ok(written)
}

fn sum_json_files(parts: &[(usize, PathBuf)]) -> ShardflowResult<Value> {
    let mut total: Option<Value> = None;
    for (shard, path) in parts {
        let value: Value = serde_json::from_str(&std::fs::read_to_string(path)?).map_err(|e| {
            AggregationMismatchError::new(format!("invalid stats JSON: {e}"))
                .for_shard(*shard)
                .with_path(path)
        })?;
        total = Some(match total {
            None => value,
            Some(acc) => add_values(&acc, &value).map_err(|message| {
                AggregationMismatchError::new(message)
                    .for_shard(*shard)
                    .with_path(path)
            })?,
        });
    }
    Ok(total.unwrap_or(Value::Null))
}

/// Adds two stat values of the same shape.
pub fn add_values(a: &Value, b: &Value) -> Result<Value, String> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => Ok(Value::Number(add_numbers(x, y)?)),
        (Value::Array(xs), Value::Array(ys)) => {
            if xs.len() != ys.len() {
                return Err(format!(
                    "array length mismatch ({} vs {})",
                    xs.len(),
                    ys.len()
                ));
            }
            xs.iter()
                .zip(ys)
                .map(|(x, y)| add_values(x, y))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array)
        }
        (Value::Object(xs), Value::Object(ys)) => {
            let mut out = xs.clone();
            for (key, y) in ys {
                let merged = match xs.get(key) {
                    Some(x) => add_values(x, y).map_err(|e| format!("{key}: {e}"))?,
                    None => y.clone(),
                };
                out.insert(key.clone(), merged);
            }
            Ok(Value::Object(out))
        }
        _ => Err(format!("cannot add {} and {}", kind(a), kind(b))),
    }
}

fn add_numbers(x: &Number, y: &Number) -> Result<Number, String> {
    if let (Some(i), Some(j)) = (x.as_i64(), y.as_i64()) {
        if let Some(sum) = i.checked_add(j) {
            return Ok(Number::from(sum));
        }
    }
    let sum = x.as_f64().unwrap_or_default() + y.as_f64().unwrap_or_default();
    Number::from_f64(sum).ok_or_else(|| format!("non-finite sum {sum}"))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
