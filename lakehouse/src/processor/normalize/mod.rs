pub mod columns;
pub mod era;
pub mod parse;

use crate::processor::stations::StationReference;
use crate::schema::{TableSchema, get_schema};
use arrow::array::{
    Array, ArrayRef, Float64Array, Int8Array, Int64Array, StringArray, TimestampMillisecondArray,
};
use arrow::record_batch::RecordBatch;
use common::Result;
use std::sync::Arc;
use tracing::debug;

use columns::{float_or_null, integer_or_null, text_or_null, timestamp_or_null};
pub use era::SourceEra;
use parse::{calendar_fields, normalize_member_type, normalize_rideable_type};

/// Station columns for one role (start or end) of a trip.
struct StationColumns {
    ids: Int64Array,
    names: StringArray,
    lats: Float64Array,
    lngs: Float64Array,
}

impl StationColumns {
    /// Fills missing names and coordinates from the station reference, keyed by id.
    fn backfill(self, stations: &StationReference) -> Self {
        if stations.is_empty() {
            return self;
        }

        let rows = self.ids.len();
        let mut names: Vec<Option<&str>> = Vec::with_capacity(rows);
        let mut lats: Vec<Option<f64>> = Vec::with_capacity(rows);
        let mut lngs: Vec<Option<f64>> = Vec::with_capacity(rows);

        for i in 0..rows {
            let known = if self.ids.is_valid(i) {
                stations.get(self.ids.value(i))
            } else {
                None
            };

            names.push(if self.names.is_valid(i) {
                Some(self.names.value(i))
            } else {
                known.and_then(|s| s.name.as_deref())
            });
            lats.push(if self.lats.is_valid(i) {
                Some(self.lats.value(i))
            } else {
                known.and_then(|s| s.lat)
            });
            lngs.push(if self.lngs.is_valid(i) {
                Some(self.lngs.value(i))
            } else {
                known.and_then(|s| s.lng)
            });
        }

        let names = StringArray::from(names);
        Self {
            ids: self.ids,
            names,
            lats: Float64Array::from(lats),
            lngs: Float64Array::from(lngs),
        }
    }
}

/// Maps raw trip tables of either source era onto the canonical trip schema.
pub struct TripNormalizer<'a> {
    stations: &'a StationReference,
}

impl<'a> TripNormalizer<'a> {
    pub fn new(stations: &'a StationReference) -> Self {
        Self { stations }
    }

    /// Normalizes one raw batch. Fails only when the batch has no start/end
    /// date columns at all; bad values become nulls.
    pub fn normalize(&self, raw: &RecordBatch) -> Result<RecordBatch> {
        let schema = raw.schema();
        let era = SourceEra::detect(&schema)?;
        let rows = raw.num_rows();
        let source = |canonical: &str| era.source_index(&schema, canonical).map(|idx| raw.column(idx));

        let started_at = timestamp_or_null(source("started_at"), rows)?;
        let ended_at = timestamp_or_null(source("ended_at"), rows)?;

        // A duration already present in the source is kept as-is.
        let duration_sec = match source("duration_sec") {
            Some(array) => columns::integer_column(array)?,
            None => derive_duration(&started_at, &ended_at),
        };

        let start = StationColumns {
            ids: integer_or_null(source("start_station_id"), rows)?,
            names: text_or_null(source("start_station_name"), rows)?,
            lats: float_or_null(source("start_lat"), rows)?,
            lngs: float_or_null(source("start_lng"), rows)?,
        }
        .backfill(self.stations);

        let end = StationColumns {
            ids: integer_or_null(source("end_station_id"), rows)?,
            names: text_or_null(source("end_station_name"), rows)?,
            lats: float_or_null(source("end_lat"), rows)?,
            lngs: float_or_null(source("end_lng"), rows)?,
        }
        .backfill(self.stations);

        let member_type: StringArray = text_or_null(source("member_type"), rows)?
            .iter()
            .map(|v| v.map(normalize_member_type))
            .collect();
        let rideable_type: StringArray = text_or_null(source("rideable_type"), rows)?
            .iter()
            .map(|v| v.and_then(normalize_rideable_type))
            .collect();

        let (day, hour, weekday) = calendar_columns(&started_at);

        let columns: Vec<ArrayRef> = vec![
            Arc::new(text_or_null(source("ride_id"), rows)?),
            Arc::new(rideable_type),
            Arc::new(started_at),
            Arc::new(ended_at),
            Arc::new(duration_sec),
            Arc::new(start.ids),
            Arc::new(start.names),
            Arc::new(end.ids),
            Arc::new(end.names),
            Arc::new(start.lats),
            Arc::new(start.lngs),
            Arc::new(end.lats),
            Arc::new(end.lngs),
            Arc::new(text_or_null(source("bike_number"), rows)?),
            Arc::new(member_type),
            Arc::new(day),
            Arc::new(hour),
            Arc::new(weekday),
        ];

        debug!(era = ?era, rows, "Normalized raw trip batch");
        Ok(RecordBatch::try_new(get_schema(TableSchema::Trips), columns)?)
    }
}

pub fn normalize(raw: &RecordBatch, stations: &StationReference) -> Result<RecordBatch> {
    TripNormalizer::new(stations).normalize(raw)
}

fn derive_duration(started: &TimestampMillisecondArray, ended: &TimestampMillisecondArray) -> Int64Array {
    started
        .iter()
        .zip(ended.iter())
        .map(|(start, end)| match (start, end) {
            (Some(start), Some(end)) => Some((end - start) / 1000),
            _ => None,
        })
        .collect()
}

fn calendar_columns(started: &TimestampMillisecondArray) -> (Int8Array, Int8Array, Int8Array) {
    let rows = started.len();
    let mut days = Vec::with_capacity(rows);
    let mut hours = Vec::with_capacity(rows);
    let mut weekdays = Vec::with_capacity(rows);

    for fields in started.iter().map(|v| v.and_then(calendar_fields)) {
        days.push(fields.map(|f| f.0));
        hours.push(fields.map(|f| f.1));
        weekdays.push(fields.map(|f| f.2));
    }

    (
        Int8Array::from(days),
        Int8Array::from(hours),
        Int8Array::from(weekdays),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::stations::StationInfo;
    use crate::schema::CANONICAL_COLUMNS;
    use crate::utils::arrow::{column, read_csv_as_text};
    use arrow::array::AsArray;
    use arrow::datatypes::{Float64Type, Int8Type, Int64Type, TimestampMillisecondType};
    use common::Error;

    fn raw(csv: &str) -> RecordBatch {
        let (schema, batches) = read_csv_as_text(csv.as_bytes()).unwrap();
        crate::utils::arrow::concat(&schema, &batches).unwrap()
    }

    fn ids(batch: &RecordBatch, name: &str) -> Vec<Option<i64>> {
        column(batch, name).unwrap().as_primitive::<Int64Type>().iter().collect()
    }

    fn texts(batch: &RecordBatch, name: &str) -> Vec<Option<String>> {
        column(batch, name)
            .unwrap()
            .as_string::<i32>()
            .iter()
            .map(|v| v.map(str::to_string))
            .collect()
    }

    const PRE_ERA: &str = "Duration,Start date,End date,Start station number,Start station,\
End station number,End station,Bike number,Member type\n\
842,2019-05-01 08:00:00,2019-05-01 08:14:02,31000.0,Eads St & 15th St S,31001,18th St & S Eads St,W21474,Registered\n\
300,2019-05-04 17:30:00,2019-05-04 17:35:00,31002,Crystal Dr & 20th St S,,,W01000,Casual\n";

    const POST_ERA: &str = "ride_id,rideable_type,started_at,ended_at,start_station_name,\
start_station_id,end_station_name,end_station_id,start_lat,start_lng,end_lat,end_lng,member_casual\n\
A1B2,electric_bike,2021-05-03 09:15:00,2021-05-03 09:25:30,Eads St & 15th St S,31000,,,38.858,-77.053,38.86,-77.05,member\n\
C3D4,scooter,2021-05-03 10:00:00,2021-05-03 10:05:00,,31001,,,,,,,casual\n";

    #[test]
    fn test_pre_era_row() {
        let batch = normalize(&raw(PRE_ERA), &StationReference::empty()).unwrap();

        assert_eq!(ids(&batch, "start_station_id"), vec![Some(31000), Some(31002)]);
        assert_eq!(ids(&batch, "end_station_id"), vec![Some(31001), None]);
        assert_eq!(ids(&batch, "duration_sec"), vec![Some(842), Some(300)]);
        assert_eq!(
            texts(&batch, "member_type"),
            vec![Some("Member".to_string()), Some("Casual".to_string())]
        );
        assert_eq!(texts(&batch, "ride_id"), vec![None, None]);
        assert_eq!(texts(&batch, "bike_number")[0].as_deref(), Some("W21474"));

        // 2019-05-01 was a Wednesday, 2019-05-04 a Saturday.
        let weekday = column(&batch, "weekday").unwrap().as_primitive::<Int8Type>();
        assert_eq!(weekday.values().to_vec(), vec![3, 6]);
        let hour = column(&batch, "hour").unwrap().as_primitive::<Int8Type>();
        assert_eq!(hour.values().to_vec(), vec![8, 17]);
        let day = column(&batch, "day").unwrap().as_primitive::<Int8Type>();
        assert_eq!(day.values().to_vec(), vec![1, 4]);
    }

    #[test]
    fn test_post_era_row_derives_duration() {
        let batch = normalize(&raw(POST_ERA), &StationReference::empty()).unwrap();

        assert_eq!(ids(&batch, "duration_sec"), vec![Some(630), Some(300)]);
        assert_eq!(
            texts(&batch, "rideable_type"),
            vec![Some("electric_bike".to_string()), None]
        );
        assert_eq!(
            texts(&batch, "member_type"),
            vec![Some("member".to_string()), Some("casual".to_string())]
        );
        assert_eq!(texts(&batch, "bike_number"), vec![None, None]);
        let lat = column(&batch, "start_lat").unwrap().as_primitive::<Float64Type>();
        assert!((lat.value(0) - 38.858).abs() < 1e-9);
        assert!(lat.is_null(1));
    }

    #[test]
    fn test_supplied_duration_beats_timestamps() {
        // Both rows span 700 seconds but carry a recorded duration of 600.
        let pre = "Duration,Start date,End date,Start station number,Member type\n\
600,2015-03-01 10:00:00,2015-03-01 10:11:40,31000.0,Subscriber\n";
        let post = "ride_id,started_at,ended_at,start_station_id,duration_sec,member_casual\n\
R9,2021-05-03 09:00:00,2021-05-03 09:11:40,31000,600,member\n";

        let pre = normalize(&raw(pre), &StationReference::empty()).unwrap();
        assert_eq!(ids(&pre, "duration_sec"), vec![Some(600)]);
        assert_eq!(ids(&pre, "start_station_id"), vec![Some(31000)]);
        assert_eq!(texts(&pre, "member_type"), vec![Some("Member".to_string())]);

        let post = normalize(&raw(post), &StationReference::empty()).unwrap();
        assert_eq!(ids(&post, "duration_sec"), vec![Some(600)]);
    }

    #[test]
    fn test_both_eras_share_one_schema() {
        let pre = normalize(&raw(PRE_ERA), &StationReference::empty()).unwrap();
        let post = normalize(&raw(POST_ERA), &StationReference::empty()).unwrap();

        assert_eq!(pre.schema(), post.schema());
        let names: Vec<&str> = pre.schema_ref().fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, CANONICAL_COLUMNS.to_vec());
    }

    #[test]
    fn test_malformed_timestamp_becomes_null() {
        let csv = "Duration,Start date,End date,Member type\n60,not a date,2019-05-01 08:01:00,Casual\n";
        let batch = normalize(&raw(csv), &StationReference::empty()).unwrap();

        let started = column(&batch, "started_at")
            .unwrap()
            .as_primitive::<TimestampMillisecondType>();
        assert!(started.is_null(0));
        assert!(column(&batch, "weekday").unwrap().is_null(0));
        assert_eq!(ids(&batch, "duration_sec"), vec![Some(60)]);
    }

    #[test]
    fn test_missing_date_columns_is_an_error() {
        let csv = "Duration,Bike number\n60,W1\n";
        let err = normalize(&raw(csv), &StationReference::empty()).unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch(_)));
    }

    #[test]
    fn test_backfills_names_and_coordinates() {
        let mut stations = StationReference::empty();
        stations.insert(
            31001,
            StationInfo {
                name: Some("18th St & S Eads St".to_string()),
                lat: Some(38.857),
                lng: Some(-77.053),
            },
        );

        let batch = normalize(&raw(POST_ERA), &stations).unwrap();

        assert_eq!(texts(&batch, "start_station_name")[1].as_deref(), Some("18th St & S Eads St"));
        let lat = column(&batch, "start_lat").unwrap().as_primitive::<Float64Type>();
        assert!((lat.value(0) - 38.858).abs() < 1e-9, "present coordinates are kept");
        assert!((lat.value(1) - 38.857).abs() < 1e-9);
        // Unknown ids stay null.
        assert_eq!(texts(&batch, "end_station_name"), vec![None, None]);
    }
}
