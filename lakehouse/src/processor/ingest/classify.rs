use crate::utils::paths::{PartitionKey, key_extension, key_stem};
use once_cell::sync::Lazy;
use regex::Regex;

static MONTHLY_STEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{4})(\d{2})$").unwrap());
static BULK_STEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{4})$").unwrap());

const RAW_EXTENSIONS: [&str; 2] = ["csv", "parquet"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawFileFormat {
    Csv,
    Parquet,
}

/// What a raw object contributes to the master table, decided from its name alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawFileKind {
    /// `YYYYMM.csv`: exactly one partition.
    Monthly(PartitionKey),
    /// `YYYY.csv`: up to twelve partitions of one year.
    Bulk(i32),
    Ignore,
}

pub fn raw_format(key: &str) -> Option<RawFileFormat> {
    match key_extension(key)?.as_str() {
        "csv" => Some(RawFileFormat::Csv),
        "parquet" => Some(RawFileFormat::Parquet),
        _ => None,
    }
}

pub fn classify(key: &str) -> RawFileKind {
    let supported = key_extension(key).is_some_and(|ext| RAW_EXTENSIONS.contains(&ext.as_str()));
    if !supported {
        return RawFileKind::Ignore;
    }

    let stem = key_stem(key);
    if let Some(caps) = MONTHLY_STEM.captures(stem) {
        let year = caps[1].parse::<i32>();
        let month = caps[2].parse::<u32>();
        return match (year, month) {
            (Ok(year), Ok(month)) if (1..=12).contains(&month) => {
                RawFileKind::Monthly(PartitionKey::new(year, month))
            }
            _ => RawFileKind::Ignore,
        };
    }

    match BULK_STEM.captures(stem).map(|caps| caps[1].parse::<i32>()) {
        Some(Ok(year)) => RawFileKind::Bulk(year),
        _ => RawFileKind::Ignore,
    }
}
