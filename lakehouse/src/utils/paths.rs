use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

pub const PART_FILE_NAME: &str = "part.parquet";

/// A `(year, month)` partition of the master trip table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PartitionKey {
    pub year: i32,
    pub month: u32,
}

impl PartitionKey {
    pub fn new(year: i32, month: u32) -> Self {
        Self { year, month }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "year={:04}/month={:02}", self.year, self.month)
    }
}

pub struct PathBuilder {
    prefix: String,
    key: PartitionKey,
}

impl PathBuilder {
    pub fn new(prefix: &str, key: PartitionKey) -> Self {
        Self {
            prefix: prefix.trim_matches('/').to_string(),
            key,
        }
    }

    pub fn build_storage_path(&self) -> String {
        join_key(&self.prefix, &self.key.to_string())
    }

    pub fn build_file_path(&self) -> String {
        format!("{}/{}", self.build_storage_path(), PART_FILE_NAME)
    }
}

/// Joins a possibly empty prefix and a relative key with a single `/`.
pub fn join_key(prefix: &str, rest: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let rest = rest.trim_start_matches('/');
    if prefix.is_empty() {
        rest.to_string()
    } else {
        format!("{}/{}", prefix, rest)
    }
}

/// Parses the `year=`/`month=` segments of a stored key. Keys with missing
/// or malformed segments yield `None`.
pub fn parse_partition_key(key: &str) -> Option<PartitionKey> {
    let mut year = None;
    let mut month = None;

    for segment in key.split('/') {
        if let Some(value) = segment.strip_prefix("year=") {
            year = value.parse::<i32>().ok();
        } else if let Some(value) = segment.strip_prefix("month=") {
            month = value.parse::<u32>().ok().filter(|m| (1..=12).contains(m));
        }
    }

    Some(PartitionKey::new(year?, month?))
}

pub fn partitions_from_keys<I, S>(keys: I) -> BTreeSet<PartitionKey>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    keys.into_iter()
        .filter_map(|key| parse_partition_key(key.as_ref()))
        .collect()
}

/// File stem of an object key: `raw/202105.csv` -> `202105`.
pub fn key_stem(key: &str) -> &str {
    let file_name = key.rsplit('/').next().unwrap_or(key);
    match file_name.rfind('.') {
        Some(idx) if idx > 0 => &file_name[..idx],
        _ => file_name,
    }
}

pub fn key_extension(key: &str) -> Option<String> {
    let file_name = key.rsplit('/').next().unwrap_or(key);
    file_name
        .rfind('.')
        .filter(|idx| *idx > 0)
        .map(|idx| file_name[idx + 1..].to_ascii_lowercase())
}
