use arrow::datatypes::Schema;
use common::{Error, Result};

/// Column layout family of a raw trip file, detected once per file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEra {
    /// Title-case headers (`Start date`, `Start station number`, ...) used before 2020.
    Pre,
    /// Snake-case headers (`started_at`, `member_casual`, ...) used from 2020 on.
    Post,
}

// (raw column, canonical column). Earlier entries win when several aliases are present.
const PRE_ERA_COLUMNS: &[(&str, &str)] = &[
    ("Start date", "started_at"),
    ("End date", "ended_at"),
    ("Duration", "duration_sec"),
    ("Start station number", "start_station_id"),
    ("End station number", "end_station_id"),
    ("Start station", "start_station_name"),
    ("End station", "end_station_name"),
    ("Bike number", "bike_number"),
    ("Bike#", "bike_number"),
    ("Member type", "member_type"),
    ("Member Type", "member_type"),
];

const POST_ERA_COLUMNS: &[(&str, &str)] = &[
    ("started_at", "started_at"),
    ("start_time", "started_at"),
    ("ended_at", "ended_at"),
    ("end_time", "ended_at"),
    ("member_casual", "member_type"),
];

const PRE_ERA_MARKERS: [&str; 2] = ["Start date", "End date"];
const POST_ERA_MARKERS: [&str; 4] = ["started_at", "ended_at", "start_time", "end_time"];

impl SourceEra {
    pub fn detect(schema: &Schema) -> Result<Self> {
        let has = |name: &str| schema.index_of(name).is_ok();

        if PRE_ERA_MARKERS.into_iter().any(|c| has(c)) {
            Ok(SourceEra::Pre)
        } else if POST_ERA_MARKERS.into_iter().any(|c| has(c)) {
            Ok(SourceEra::Post)
        } else {
            let found: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
            Err(Error::SchemaMismatch(format!(
                "no start/end date columns found; columns were {:?}",
                found
            )))
        }
    }

    pub fn column_map(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            SourceEra::Pre => PRE_ERA_COLUMNS,
            SourceEra::Post => POST_ERA_COLUMNS,
        }
    }

    /// Index of the raw column feeding `canonical`: a mapped alias if one is
    /// present, otherwise a column already carrying the canonical name.
    pub fn source_index(&self, schema: &Schema, canonical: &str) -> Option<usize> {
        self.column_map()
            .iter()
            .filter(|(_, target)| *target == canonical)
            .find_map(|(raw, _)| schema.index_of(raw).ok())
            .or_else(|| schema.index_of(canonical).ok())
    }
}
