//! DataFusion SQL for the aggregate tables. `trips` is the master table and
//! `stations` the station dimension.

use common::config::SummaryConfig;

// Trips that can be placed on a calendar day, with null categories made explicit.
const DATED_TRIPS: &str = r#"
    SELECT
        CAST(started_at AS DATE) AS "date",
        CAST(date_part('year', started_at) AS INT) AS trip_year,
        CAST(date_part('month', started_at) AS INT) AS trip_month,
        CAST("day" AS INT) AS trip_day,
        "hour",
        weekday,
        start_station_id,
        end_station_id,
        duration_sec,
        bike_number,
        COALESCE(member_type, 'unknown') AS member_type,
        COALESCE(rideable_type, 'unknown') AS rideable_type
    FROM trips
    WHERE started_at IS NOT NULL
"#;

pub fn system_daily() -> String {
    format!(
        r#"
WITH dated AS ({DATED_TRIPS})
SELECT "date", COUNT(*) AS trips, AVG(duration_sec) AS avg_duration_sec
FROM dated
WHERE duration_sec > 0
GROUP BY "date"
ORDER BY "date"
"#
    )
}

pub fn system_daily_detailed() -> String {
    format!(
        r#"
WITH dated AS ({DATED_TRIPS})
SELECT "date", member_type, rideable_type,
       COUNT(*) AS trips, AVG(duration_sec) AS avg_duration_sec
FROM dated
WHERE duration_sec > 0
GROUP BY "date", member_type, rideable_type
ORDER BY "date", member_type, rideable_type
"#
    )
}

pub fn station_daily() -> String {
    format!(
        r#"
WITH dated AS ({DATED_TRIPS}),
departures AS (
    SELECT start_station_id AS station_id, "date",
           COUNT(*) AS num_checkouts,
           AVG(duration_sec) AS avg_duration_sec,
           COUNT(DISTINCT bike_number) AS distinct_bikes_out
    FROM dated
    WHERE duration_sec > 0 AND start_station_id IS NOT NULL
    GROUP BY start_station_id, "date"
),
arrivals AS (
    SELECT end_station_id AS station_id, "date", COUNT(*) AS num_returns
    FROM dated
    WHERE end_station_id IS NOT NULL
    GROUP BY end_station_id, "date"
),
flows AS (
    SELECT COALESCE(d.station_id, a.station_id) AS station_id,
           COALESCE(d."date", a."date") AS "date",
           COALESCE(d.num_checkouts, 0) AS num_checkouts,
           d.avg_duration_sec,
           COALESCE(d.distinct_bikes_out, 0) AS distinct_bikes_out,
           COALESCE(a.num_returns, 0) AS num_returns
    FROM departures d
    FULL OUTER JOIN arrivals a ON d.station_id = a.station_id AND d."date" = a."date"
)
SELECT f."date", f.station_id, s.station_name, s.lat, s.lng,
       f.num_checkouts, f.avg_duration_sec, f.distinct_bikes_out, f.num_returns,
       f.num_checkouts - f.num_returns AS net_flow
FROM flows f
LEFT JOIN stations s ON f.station_id = s.station_id
ORDER BY f."date", f.station_id
"#
    )
}

pub fn station_daily_detailed() -> String {
    format!(
        r#"
WITH dated AS ({DATED_TRIPS}),
departures AS (
    SELECT start_station_id AS station_id, "date", member_type, rideable_type,
           COUNT(*) AS num_checkouts,
           AVG(duration_sec) AS avg_duration_checkout_sec,
           COUNT(DISTINCT bike_number) AS distinct_bikes_out
    FROM dated
    WHERE duration_sec > 0 AND start_station_id IS NOT NULL
    GROUP BY start_station_id, "date", member_type, rideable_type
),
arrivals AS (
    SELECT end_station_id AS station_id, "date", member_type, rideable_type,
           COUNT(*) AS num_returns,
           AVG(duration_sec) AS avg_duration_return_sec
    FROM dated
    WHERE duration_sec > 0 AND end_station_id IS NOT NULL
    GROUP BY end_station_id, "date", member_type, rideable_type
),
flows AS (
    SELECT COALESCE(d.station_id, a.station_id) AS station_id,
           COALESCE(d."date", a."date") AS "date",
           COALESCE(d.member_type, a.member_type) AS member_type,
           COALESCE(d.rideable_type, a.rideable_type) AS rideable_type,
           COALESCE(d.num_checkouts, 0) AS num_checkouts,
           COALESCE(a.num_returns, 0) AS num_returns,
           d.avg_duration_checkout_sec,
           a.avg_duration_return_sec,
           COALESCE(d.distinct_bikes_out, 0) AS distinct_bikes_out
    FROM departures d
    FULL OUTER JOIN arrivals a
      ON d.station_id = a.station_id
     AND d."date" = a."date"
     AND d.member_type = a.member_type
     AND d.rideable_type = a.rideable_type
)
SELECT f."date", f.station_id, s.station_name, s.lat, s.lng,
       f.member_type, f.rideable_type,
       f.num_checkouts, f.num_returns,
       f.avg_duration_checkout_sec, f.avg_duration_return_sec,
       f.distinct_bikes_out,
       f.num_checkouts - f.num_returns AS net_flow
FROM flows f
LEFT JOIN stations s ON f.station_id = s.station_id
ORDER BY f."date", f.station_id, f.member_type, f.rideable_type
"#
    )
}

pub fn station_hourly() -> String {
    format!(
        r#"
WITH dated AS ({DATED_TRIPS}),
hourly AS (
    SELECT "date", "hour", start_station_id AS station_id, COUNT(*) AS num_checkouts
    FROM dated
    WHERE start_station_id IS NOT NULL
    GROUP BY "date", "hour", start_station_id
)
SELECT h."date", h."hour", h.station_id, s.station_name, s.lat, s.lng, h.num_checkouts
FROM hourly h
LEFT JOIN stations s ON h.station_id = s.station_id
ORDER BY h."date", h."hour", h.station_id
"#
    )
}

/// Busiest start/end pairs, round trips excluded.
pub fn station_routes(config: &SummaryConfig) -> String {
    format!(
        r#"
WITH pairs AS (
    SELECT start_station_id, end_station_id,
           COUNT(*) AS trip_count,
           AVG(duration_sec) AS avg_duration_sec
    FROM trips
    WHERE start_station_id IS NOT NULL
      AND end_station_id IS NOT NULL
      AND start_station_id <> end_station_id
    GROUP BY start_station_id, end_station_id
    HAVING COUNT(*) >= {min_trips}
    ORDER BY trip_count DESC, start_station_id, end_station_id
    LIMIT {max_routes}
)
SELECT p.start_station_id,
       ss.station_name AS start_station_name, ss.lat AS start_lat, ss.lng AS start_lng,
       p.end_station_id,
       es.station_name AS end_station_name, es.lat AS end_lat, es.lng AS end_lng,
       p.trip_count, p.avg_duration_sec
FROM pairs p
LEFT JOIN stations ss ON p.start_station_id = ss.station_id
LEFT JOIN stations es ON p.end_station_id = es.station_id
ORDER BY p.trip_count DESC, p.start_station_id, p.end_station_id
"#,
        min_trips = config.min_route_trips,
        max_routes = config.max_routes,
    )
}

/// Trip counts at day, day_of_week, month and year granularity in one long table.
pub fn time_aggregated() -> String {
    const TOTALS: &str = "member_type, rideable_type, \
        COUNT(*) AS total_checkouts, COUNT(*) AS total_returns, CAST(0 AS BIGINT) AS net_flow, \
        COUNT(*) AS total_trips, AVG(duration_sec) AS avg_duration_sec";

    format!(
        r#"
WITH dated AS ({DATED_TRIPS}),
timed AS (SELECT * FROM dated WHERE duration_sec > 0)
SELECT * FROM (
    SELECT 'day' AS agg_level,
           CAST("date" AS VARCHAR) AS agg_value,
           CAST(trip_year * 10000 + trip_month * 100 + trip_day AS INT) AS agg_sort_key,
           {TOTALS}
    FROM timed
    GROUP BY "date", trip_year, trip_month, trip_day, member_type, rideable_type

    UNION ALL

    SELECT 'day_of_week' AS agg_level,
           CASE CAST(weekday AS INT)
               WHEN 1 THEN 'Monday' WHEN 2 THEN 'Tuesday' WHEN 3 THEN 'Wednesday'
               WHEN 4 THEN 'Thursday' WHEN 5 THEN 'Friday' WHEN 6 THEN 'Saturday'
               ELSE 'Sunday'
           END AS agg_value,
           CAST(weekday AS INT) AS agg_sort_key,
           {TOTALS}
    FROM timed
    WHERE weekday IS NOT NULL
    GROUP BY weekday, member_type, rideable_type

    UNION ALL

    SELECT 'month' AS agg_level,
           CASE trip_month
               WHEN 1 THEN 'January' WHEN 2 THEN 'February' WHEN 3 THEN 'March'
               WHEN 4 THEN 'April' WHEN 5 THEN 'May' WHEN 6 THEN 'June'
               WHEN 7 THEN 'July' WHEN 8 THEN 'August' WHEN 9 THEN 'September'
               WHEN 10 THEN 'October' WHEN 11 THEN 'November' ELSE 'December'
           END AS agg_value,
           trip_month AS agg_sort_key,
           {TOTALS}
    FROM timed
    GROUP BY trip_month, member_type, rideable_type

    UNION ALL

    SELECT 'year' AS agg_level,
           CAST(trip_year AS VARCHAR) AS agg_value,
           trip_year AS agg_sort_key,
           {TOTALS}
    FROM timed
    GROUP BY trip_year, member_type, rideable_type
) levels
ORDER BY agg_level, agg_sort_key, member_type, rideable_type
"#
    )
}
