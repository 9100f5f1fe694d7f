//! Merging of per-shard line-record files.
//!
//! Records are handled as raw bytes. Transcripts in legacy encodings merge
//! the same way as UTF-8 ones.

use crate::errors::{AggregationMismatchError, ShardflowResult};
use crate::manifest::WorkManifest;
use std::collections::HashMap;
use std::path::PathBuf;

/// Concatenates per-shard record files and sorts the lines by item id.
///
/// The item id is the first whitespace-separated field; ids compare
/// byte-wise and the sort is stable, so the result does not depend on how
/// the items were sharded. Blank lines are dropped and the output always
/// ends with a newline unless it is empty.
///
/// `sources` pairs each file with its shard index, for error reporting.
pub fn merge_stream(sources: &[(usize, PathBuf)]) -> ShardflowResult<Vec<u8>> {
    let mut texts = Vec::with_capacity(sources.len());
    for (shard, path) in sources {
        if !path.is_file() {
            return Err(AggregationMismatchError::missing_output(*shard, path).into());
        }
        texts.push(std::fs::read(path)?);
    }
    Ok(merge_texts(texts.iter().map(Vec::as_slice)))
}

/// Sorts the records of several texts into one canonical text.
pub fn merge_texts<'a>(texts: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut lines: Vec<&[u8]> = texts
        .into_iter()
        .flat_map(record_lines)
        .filter(|line| !line.trim_ascii().is_empty())
        .collect();
    lines.sort_by(|a, b| record_key(a).cmp(record_key(b)));

    let mut out = Vec::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
    for line in lines {
        out.extend_from_slice(line);
        out.push(b'\n');
    }
    out
}

/// Splits a text into lines, dropping the terminator (`\n` or `\r\n`).
pub fn record_lines(text: &[u8]) -> impl Iterator<Item = &[u8]> {
    let text = text.strip_suffix(b"\n").unwrap_or(text);
    text.split(|b| *b == b'\n')
        .filter(move |_| !text.is_empty())
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}

/// The item id of a record line.
#[must_use]
pub fn record_key(line: &[u8]) -> &[u8] {
    line.split(u8::is_ascii_whitespace)
        .find(|field| !field.is_empty())
        .unwrap_or_default()
}

/// Checks that every manifest id appears exactly once and nothing else does.
pub fn check_coverage(merged: &[u8], manifest: &WorkManifest) -> ShardflowResult<()> {
    let mut counts: HashMap<&[u8], usize> = HashMap::new();
    for line in record_lines(merged) {
        *counts.entry(record_key(line)).or_default() += 1;
    }

    let missing: Vec<&str> = manifest
        .ids()
        .filter(|id| !counts.contains_key(id.as_bytes()))
        .collect();
    if !missing.is_empty() {
        return Err(AggregationMismatchError::new(format!(
            "{} of {} items missing from merged output (first: {})",
            missing.len(),
            manifest.len(),
            missing[0]
        ))
        .into());
    }

    let mut duplicated: Vec<&[u8]> = counts
        .iter()
        .filter(|(_, n)| **n > 1)
        .map(|(id, _)| *id)
        .collect();
    duplicated.sort_unstable();
    if let Some(first) = duplicated.first() {
        return Err(AggregationMismatchError::new(format!(
            "{} items appear more than once in merged output (first: {})",
            duplicated.len(),
            String::from_utf8_lossy(first)
        ))
        .into());
    }

    if counts.len() > manifest.len() {
        let mut extra: Vec<&[u8]> = counts
            .keys()
            .copied()
            .filter(|id| {
                std::str::from_utf8(id)
                    .ok()
                    .and_then(|id| manifest.get(id))
                    .is_none()
            })
            .collect();
        extra.sort_unstable();
        return Err(AggregationMismatchError::new(format!(
            "{} unexpected items in merged output (first: {})",
            extra.len(),
            String::from_utf8_lossy(extra.first().copied().unwrap_or_default())
        ))
        .into());
    }

    Ok(())
}
