//! Header-level scan of a chain result file.
//!
//! A result file starts with `#` comment lines echoing the sampler
//! configuration as an indented tree (`# method = sample`, `#   sample`,
//! `#     num_samples = 1000`), followed by one comma-separated column header
//! and then one row per draw. Comment lines may be interleaved with the rows
//! (adaptation results, timing) and are skipped.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{ParseError, ValidationError};

/// Record keys that legitimately differ between chains of one run.
pub const PER_CHAIN_KEYS: &[&str] = &["id", "output.file", "output.diagnostic_file"];

/// Schema facts extracted from one chain's result file, keyed by dotted
/// configuration path plus the synthetic keys `column_names`, `dims.<param>`
/// and `draws`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationRecord {
    entries: BTreeMap<String, String>,
}

impl ValidationRecord {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Header column names in file order.
    pub fn column_names(&self) -> Vec<&str> {
        self.get("column_names")
            .map(|s| s.split(',').collect())
            .unwrap_or_default()
    }

    pub fn draws(&self) -> Option<usize> {
        self.get("draws").and_then(|s| s.parse().ok())
    }

    /// First key, in sorted order, on which `other` disagrees with `self`,
    /// ignoring `excluded`. Keys present on only one side count as a
    /// disagreement.
    pub fn first_mismatch<'a>(
        &'a self,
        other: &'a ValidationRecord,
        excluded: &[&str],
    ) -> Option<&'a str> {
        self.entries
            .keys()
            .chain(other.entries.keys())
            .map(String::as_str)
            .filter(|k| !excluded.contains(k))
            .find(|k| self.get(k) != other.get(k))
    }

    fn insert(&mut self, key: String, value: String) {
        self.entries.insert(key, value);
    }
}

/// Reads `path` and returns its schema record. Draw rows are counted and
/// width-checked, never stored.
pub fn scan_stan_csv(path: &Path) -> Result<ValidationRecord, ParseError> {
    let io_err = |source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    };
    let reader = BufReader::new(File::open(path).map_err(io_err)?);

    let mut record = ValidationRecord::default();
    let mut sections: Vec<String> = Vec::new();
    let mut columns: Option<Vec<String>> = None;
    let mut draws = 0usize;
    let mut saw_content = false;

    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(io_err)?;
        let lineno = idx + 1;
        if line.trim().is_empty() {
            continue;
        }
        saw_content = true;
        if let Some(comment) = line.strip_prefix('#') {
            if columns.is_none() {
                scan_config_line(comment, &mut sections, &mut record);
            }
            continue;
        }
        match &columns {
            None => columns = Some(parse_header(path, lineno, &line)?),
            Some(names) => {
                let found = line.split(',').count();
                if found != names.len() {
                    return Err(ParseError::RowWidth {
                        path: path.to_path_buf(),
                        line: lineno,
                        expected: names.len(),
                        found,
                    });
                }
                draws += 1;
            }
        }
    }

    if !saw_content {
        return Err(ParseError::Empty {
            path: path.to_path_buf(),
        });
    }
    let columns = columns.ok_or_else(|| ParseError::MissingHeader {
        path: path.to_path_buf(),
    })?;
    for (name, dims) in parameter_dims(&columns) {
        record.insert(format!("dims.{}", name), dims);
    }
    record.insert("column_names".to_string(), columns.join(","));
    record.insert("draws".to_string(), draws.to_string());
    Ok(record)
}

fn scan_config_line(comment: &str, sections: &mut Vec<String>, record: &mut ValidationRecord) {
    let body = comment.trim_start_matches(' ');
    if body.is_empty() {
        return;
    }
    let indent = comment.len() - body.len();
    let level = indent.saturating_sub(1) / 2;
    sections.truncate(level);

    let (name, value) = match body.split_once('=') {
        Some((name, value)) => (name.trim(), Some(value)),
        None => (body.trim(), None),
    };
    // Free-text comments ("Adaptation terminated") are not tree nodes.
    if name.is_empty() || name.contains(char::is_whitespace) {
        return;
    }
    if let Some(value) = value {
        let value = value.trim();
        let value = value.strip_suffix("(Default)").unwrap_or(value).trim_end();
        let key = if sections.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", sections.join("."), name)
        };
        record.insert(key, value.to_string());
    }
    if sections.len() == level {
        sections.push(name.to_string());
    }
}

fn parse_header(path: &Path, lineno: usize, line: &str) -> Result<Vec<String>, ParseError> {
    let names: Vec<String> = line.split(',').map(|s| s.trim().to_string()).collect();
    if names.iter().any(String::is_empty) {
        return Err(ParseError::EmptyColumn {
            path: path.to_path_buf(),
            line: lineno,
        });
    }
    Ok(names)
}

/// `theta.2.3` contributes to base `theta` with extents `[2, 3]`; scalars
/// map to an empty string.
fn parameter_dims(columns: &[String]) -> Vec<(String, String)> {
    let mut order: Vec<String> = Vec::new();
    let mut extents: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for column in columns {
        let mut parts = column.split('.');
        let base = parts.next().unwrap_or_default().to_string();
        let indices: Vec<usize> = parts.filter_map(|p| p.parse().ok()).collect();
        let entry = extents.entry(base.clone()).or_insert_with(|| {
            order.push(base);
            Vec::new()
        });
        if entry.len() < indices.len() {
            entry.resize(indices.len(), 0);
        }
        for (slot, idx) in entry.iter_mut().zip(&indices) {
            *slot = (*slot).max(*idx);
        }
    }
    order
        .into_iter()
        .map(|name| {
            let dims = extents
                .get(&name)
                .map(|d| {
                    d.iter()
                        .map(usize::to_string)
                        .collect::<Vec<_>>()
                        .join(",")
                })
                .unwrap_or_default();
            (name, dims)
        })
        .collect()
}

/// Scans every file and compares each against the first, ignoring
/// [`PER_CHAIN_KEYS`]. Chains are numbered from 1 in `paths` order.
pub fn check_chain_files(paths: &[PathBuf]) -> Result<(), ValidationError> {
    let Some(first) = paths.first() else {
        return Ok(());
    };
    let reference =
        scan_stan_csv(first).map_err(|source| ValidationError::Parse { chain: 1, source })?;
    for (idx, path) in paths.iter().enumerate().skip(1) {
        let record = scan_stan_csv(path).map_err(|source| ValidationError::Parse {
            chain: idx + 1,
            source,
        })?;
        if let Some(key) = reference.first_mismatch(&record, PER_CHAIN_KEYS) {
            return Err(ValidationError::Mismatch {
                chain: idx + 1,
                key: key.to_string(),
                reference: reference.get(key).map(str::to_string),
                found: record.get(key).map(str::to_string),
            });
        }
    }
    Ok(())
}
