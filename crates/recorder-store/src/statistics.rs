use chrono::{DateTime, Duration, Utc};
use recorder_types::JsonMap;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::models::{
    StatisticMetadata, StatisticRow, StatisticsPeriod, StatisticsTable, from_micros, to_micros,
};
use crate::StoreResult;

/// Upper bound on hours compiled after downtime.
pub const MAX_STATISTICS_CATCH_UP_HOURS: usize = 240;

const SHORT_TERM_BUCKETS: i32 = 12;
const SOURCE: &str = "recorder";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetRule {
    /// A new `last_reset` attribute starts a new cycle.
    LastResetAttribute,
    /// Any decrease is a counter reset.
    AnyDecrease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatisticKind {
    Mean,
    Sum(ResetRule),
}

/// Picks the aggregation from `state_class` and `device_class`.
pub fn statistic_kind(attributes: &JsonMap) -> Option<StatisticKind> {
    let state_class = attributes.get("state_class").and_then(Value::as_str)?;
    match state_class {
        "measurement" => {
            let device_class = attributes.get("device_class").and_then(Value::as_str);
            let legacy_meter = matches!(device_class, Some("energy" | "gas" | "monetary"))
                && attributes.get("last_reset").is_some_and(|v| !v.is_null());
            if legacy_meter {
                Some(StatisticKind::Sum(ResetRule::LastResetAttribute))
            } else {
                Some(StatisticKind::Mean)
            }
        }
        "total" => Some(StatisticKind::Sum(ResetRule::LastResetAttribute)),
        "total_increasing" => Some(StatisticKind::Sum(ResetRule::AnyDecrease)),
        _ => None,
    }
}

#[derive(Debug, Clone)]
struct Reading {
    at: DateTime<Utc>,
    value: Option<f64>,
    last_reset: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct SumState {
    sum: f64,
    state: f64,
    last_reset: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileReport {
    pub start: DateTime<Utc>,
    pub statistic_ids: Vec<String>,
    pub short_term_rows: usize,
}

pub fn floor_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(3600), 0).unwrap_or_default()
}

/// Compiles the hour starting at `start`: twelve five-minute rows per
/// statistic, then one hourly row built from them. Safe to run again for
/// the same hour.
#[tracing::instrument(skip_all, fields(start = %start))]
pub fn compile_statistics(conn: &Connection, start: DateTime<Utc>) -> StoreResult<CompileReport> {
    let start = floor_hour(start);
    let end = start + Duration::hours(1);
    let tx = conn.unchecked_transaction()?;

    let mut report = CompileReport {
        start,
        statistic_ids: Vec::new(),
        short_term_rows: 0,
    };
    for (entity_id, attributes) in measurable_entities(&tx, end)? {
        let Some(kind) = statistic_kind(&attributes) else {
            continue;
        };
        let (prior, readings) = load_readings(&tx, &entity_id, start, end)?;
        let short_term = match kind {
            StatisticKind::Mean => mean_rows(&entity_id, start, prior.as_ref(), &readings),
            StatisticKind::Sum(rule) => {
                let previous = previous_sum(&tx, &entity_id, start)?;
                sum_rows(&entity_id, start, previous, prior.as_ref(), &readings, rule)
            }
        };
        if short_term.is_empty() {
            continue;
        }
        for row in &short_term {
            upsert_row(&tx, StatisticsTable::ShortTerm, row)?;
        }
        report.short_term_rows += short_term.len();

        let hour_rows = rows_between(&tx, StatisticsTable::ShortTerm, &entity_id, start, end)?;
        if let Some(long_term) = hourly_row(&entity_id, start, &hour_rows) {
            upsert_row(&tx, StatisticsTable::LongTerm, &long_term)?;
        }
        upsert_metadata(
            &tx,
            &StatisticMetadata {
                statistic_id: entity_id.clone(),
                source: SOURCE.to_string(),
                unit_of_measurement: attributes
                    .get("unit_of_measurement")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                has_mean: kind == StatisticKind::Mean,
                has_sum: kind != StatisticKind::Mean,
            },
        )?;
        report.statistic_ids.push(entity_id);
    }
    record_run(&tx, start)?;
    tx.commit()?;

    tracing::debug!(
        statistics = report.statistic_ids.len(),
        rows = report.short_term_rows,
        "compiled statistics"
    );
    Ok(report)
}

/// Latest attributes of every entity whose newest row before `end` carries
/// a `state_class`.
fn measurable_entities(conn: &Connection, end: DateTime<Utc>) -> StoreResult<Vec<(String, JsonMap)>> {
    let mut stmt = conn.prepare(
        "SELECT s.entity_id, s.attributes FROM states s
         WHERE s.last_updated < ?1
         AND NOT EXISTS (
             SELECT 1 FROM states n
             WHERE n.entity_id = s.entity_id AND n.last_updated < ?1
             AND (n.last_updated > s.last_updated
                  OR (n.last_updated = s.last_updated AND n.state_id > s.state_id))
         )
         AND json_extract(s.attributes, '$.state_class') IS NOT NULL
         ORDER BY s.entity_id",
    )?;
    let rows = stmt.query_map([to_micros(end)], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut entities = Vec::new();
    for row in rows {
        let (entity_id, attributes) = row?;
        match serde_json::from_str::<JsonMap>(&attributes) {
            Ok(attributes) => entities.push((entity_id, attributes)),
            Err(err) => {
                tracing::warn!(entity_id, error = %err, "skipping statistics for unreadable attributes");
            }
        }
    }
    Ok(entities)
}

/// The reading in force at `start` and every reading inside the hour.
fn load_readings(
    conn: &Connection,
    entity_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> StoreResult<(Option<Reading>, Vec<Reading>)> {
    let prior = conn
        .query_row(
            "SELECT state, attributes, last_updated FROM states
             WHERE entity_id = ?1 AND last_updated < ?2
             ORDER BY last_updated DESC, state_id DESC LIMIT 1",
            params![entity_id, to_micros(start)],
            reading_from_row,
        )
        .optional()?;

    let mut stmt = conn.prepare(
        "SELECT state, attributes, last_updated FROM states
         WHERE entity_id = ?1 AND last_updated >= ?2 AND last_updated < ?3
         ORDER BY last_updated, state_id",
    )?;
    let rows = stmt.query_map(
        params![entity_id, to_micros(start), to_micros(end)],
        reading_from_row,
    )?;
    Ok((prior, rows.collect::<Result<Vec<_>, _>>()?))
}

fn reading_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reading> {
    let state: String = row.get(0)?;
    let attributes: String = row.get(1)?;
    let last_reset = serde_json::from_str::<JsonMap>(&attributes)
        .ok()
        .and_then(|attrs| {
            attrs
                .get("last_reset")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|ts| ts.with_timezone(&Utc))
        });
    Ok(Reading {
        at: from_micros(row.get(2)?),
        value: state.parse::<f64>().ok().filter(|v| v.is_finite()),
        last_reset,
    })
}

fn bucket_bounds(start: DateTime<Utc>, index: i32) -> (DateTime<Utc>, DateTime<Utc>) {
    let width = StatisticsTable::ShortTerm.bucket();
    let b0 = start + width * index;
    (b0, b0 + width)
}

fn mean_rows(
    statistic_id: &str,
    start: DateTime<Utc>,
    prior: Option<&Reading>,
    readings: &[Reading],
) -> Vec<StatisticRow> {
    let timeline: Vec<&Reading> = prior.into_iter().chain(readings.iter()).collect();
    let mut rows = Vec::new();
    for index in 0..SHORT_TERM_BUCKETS {
        let (b0, b1) = bucket_bounds(start, index);
        let mut weighted = 0.0;
        let mut covered = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for (i, reading) in timeline.iter().enumerate() {
            let seg_start = reading.at.max(b0);
            let seg_end = timeline.get(i + 1).map_or(b1, |next| next.at).min(b1);
            if seg_end <= seg_start {
                continue;
            }
            let Some(value) = reading.value else {
                continue;
            };
            let weight = (seg_end - seg_start).num_microseconds().unwrap_or(0) as f64;
            weighted += value * weight;
            covered += weight;
            min = min.min(value);
            max = max.max(value);
        }
        if covered > 0.0 {
            rows.push(StatisticRow {
                statistic_id: statistic_id.to_string(),
                start: b0,
                mean: Some(weighted / covered),
                min: Some(min),
                max: Some(max),
                ..StatisticRow::default()
            });
        }
    }
    rows
}

fn sum_rows(
    statistic_id: &str,
    start: DateTime<Utc>,
    previous: Option<SumState>,
    prior: Option<&Reading>,
    readings: &[Reading],
    rule: ResetRule,
) -> Vec<StatisticRow> {
    let mut acc = previous;
    let mut rows = Vec::new();
    for index in 0..SHORT_TERM_BUCKETS {
        let (b0, b1) = bucket_bounds(start, index);
        let in_bucket = readings.iter().filter(|r| r.at >= b0 && r.at < b1);
        if acc.is_none() {
            // No history yet: the reading in force at the bucket start is the baseline.
            let in_force = prior
                .into_iter()
                .chain(readings.iter())
                .filter(|r| r.at <= b0)
                .last();
            for reading in in_force.into_iter().chain(in_bucket) {
                acc = accumulate(acc, reading, rule);
            }
        } else {
            for reading in in_bucket {
                acc = accumulate(acc, reading, rule);
            }
        }
        if let Some(state) = acc {
            rows.push(StatisticRow {
                statistic_id: statistic_id.to_string(),
                start: b0,
                sum: Some(state.sum),
                state: Some(state.state),
                last_reset: state.last_reset,
                ..StatisticRow::default()
            });
        }
    }
    rows
}

fn accumulate(acc: Option<SumState>, reading: &Reading, rule: ResetRule) -> Option<SumState> {
    let Some(value) = reading.value else {
        return acc;
    };
    let Some(mut current) = acc else {
        return Some(SumState {
            sum: 0.0,
            state: value,
            last_reset: reading.last_reset,
        });
    };
    let reset = match rule {
        ResetRule::LastResetAttribute => {
            reading.last_reset.is_some() && reading.last_reset != current.last_reset
        }
        ResetRule::AnyDecrease => value < current.state,
    };
    if reset {
        current.sum += match rule {
            // a counter restarts from zero and only counts up
            ResetRule::AnyDecrease => value.max(0.0),
            ResetRule::LastResetAttribute => value,
        };
    } else {
        current.sum += value - current.state;
    }
    current.state = value;
    if reading.last_reset.is_some() {
        current.last_reset = reading.last_reset;
    }
    Some(current)
}

fn hourly_row(statistic_id: &str, start: DateTime<Utc>, rows: &[StatisticRow]) -> Option<StatisticRow> {
    let last = rows.last()?;
    let means: Vec<f64> = rows.iter().filter_map(|r| r.mean).collect();
    let mean = (!means.is_empty()).then(|| means.iter().sum::<f64>() / means.len() as f64);
    let min = rows.iter().filter_map(|r| r.min).reduce(f64::min);
    let max = rows.iter().filter_map(|r| r.max).reduce(f64::max);
    Some(StatisticRow {
        statistic_id: statistic_id.to_string(),
        start,
        mean,
        min,
        max,
        sum: last.sum,
        state: last.state,
        last_reset: last.last_reset,
    })
}

fn previous_sum(
    conn: &Connection,
    statistic_id: &str,
    before: DateTime<Utc>,
) -> StoreResult<Option<SumState>> {
    let row = conn
        .query_row(
            "SELECT sum, state, last_reset FROM statistics_short_term
             WHERE statistic_id = ?1 AND start < ?2 AND sum IS NOT NULL
             ORDER BY start DESC LIMIT 1",
            params![statistic_id, to_micros(before)],
            |row| {
                Ok((
                    row.get::<_, f64>(0)?,
                    row.get::<_, Option<f64>>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                ))
            },
        )
        .optional()?;
    Ok(row.and_then(|(sum, state, last_reset)| {
        state.map(|state| SumState {
            sum,
            state,
            last_reset: last_reset.map(from_micros),
        })
    }))
}

fn upsert_row(conn: &Connection, table: StatisticsTable, row: &StatisticRow) -> StoreResult<()> {
    let sql = format!(
        "INSERT INTO {} (statistic_id, start, mean, min, max, sum, state, last_reset, created)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(statistic_id, start) DO UPDATE SET
             mean = excluded.mean,
             min = excluded.min,
             max = excluded.max,
             sum = excluded.sum,
             state = excluded.state,
             last_reset = excluded.last_reset",
        table.table_name()
    );
    conn.prepare_cached(&sql)?.execute(params![
        row.statistic_id,
        to_micros(row.start),
        row.mean,
        row.min,
        row.max,
        row.sum,
        row.state,
        row.last_reset.map(to_micros),
        to_micros(Utc::now()),
    ])?;
    Ok(())
}

fn upsert_metadata(conn: &Connection, meta: &StatisticMetadata) -> StoreResult<()> {
    conn.prepare_cached(
        "INSERT INTO statistics_meta (statistic_id, source, unit_of_measurement, has_mean, has_sum)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(statistic_id) DO UPDATE SET
             source = excluded.source,
             unit_of_measurement = excluded.unit_of_measurement,
             has_mean = excluded.has_mean,
             has_sum = excluded.has_sum",
    )?
    .execute(params![
        meta.statistic_id,
        meta.source,
        meta.unit_of_measurement,
        meta.has_mean,
        meta.has_sum,
    ])?;
    Ok(())
}

fn record_run(conn: &Connection, start: DateTime<Utc>) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO statistics_runs (start)
         SELECT ?1 WHERE NOT EXISTS (SELECT 1 FROM statistics_runs WHERE start = ?1)",
        [to_micros(start)],
    )?;
    Ok(())
}

pub fn last_run(conn: &Connection) -> StoreResult<Option<DateTime<Utc>>> {
    let start: Option<i64> = conn.query_row("SELECT MAX(start) FROM statistics_runs", [], |row| {
        row.get(0)
    })?;
    Ok(start.map(from_micros))
}

/// Hours that still need compiling, oldest first. A database that has never
/// compiled anything is stamped with the last completed hour instead, so
/// old history is not rebuilt.
pub fn hours_to_catch_up(conn: &Connection, now: DateTime<Utc>) -> StoreResult<Vec<DateTime<Utc>>> {
    let last_completed = floor_hour(now) - Duration::hours(1);
    let Some(last) = last_run(conn)? else {
        record_run(conn, last_completed)?;
        return Ok(Vec::new());
    };
    let mut hours = Vec::new();
    let mut hour = floor_hour(last) + Duration::hours(1);
    while hour <= last_completed {
        hours.push(hour);
        hour += Duration::hours(1);
    }
    if hours.len() > MAX_STATISTICS_CATCH_UP_HOURS {
        let skipped = hours.len() - MAX_STATISTICS_CATCH_UP_HOURS;
        tracing::warn!(skipped, "statistics catch-up capped, oldest hours skipped");
        hours.drain(..skipped);
    }
    Ok(hours)
}

fn rows_between(
    conn: &Connection,
    table: StatisticsTable,
    statistic_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> StoreResult<Vec<StatisticRow>> {
    let sql = format!(
        "SELECT statistic_id, start, mean, min, max, sum, state, last_reset FROM {}
         WHERE statistic_id = ?1 AND start >= ?2 AND start < ?3 ORDER BY start",
        table.table_name()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![statistic_id, to_micros(start), to_micros(end)],
        StatisticRow::from_row,
    )?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// The newest `limit` rows of one statistic, oldest first.
pub fn last_statistics(
    conn: &Connection,
    table: StatisticsTable,
    statistic_id: &str,
    limit: usize,
) -> StoreResult<Vec<StatisticRow>> {
    let sql = format!(
        "SELECT statistic_id, start, mean, min, max, sum, state, last_reset FROM {}
         WHERE statistic_id = ?1 ORDER BY start DESC LIMIT ?2",
        table.table_name()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![statistic_id, limit as i64], StatisticRow::from_row)?;
    let mut rows = rows.collect::<Result<Vec<_>, _>>()?;
    rows.reverse();
    Ok(rows)
}

pub fn statistics_during_period(
    conn: &Connection,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    statistic_ids: Option<&[String]>,
    period: StatisticsPeriod,
) -> StoreResult<BTreeMap<String, Vec<StatisticRow>>> {
    let mut sql = format!(
        "SELECT statistic_id, start, mean, min, max, sum, state, last_reset FROM {}
         WHERE start >= ?",
        period.table().table_name()
    );
    let mut values = vec![SqlValue::Integer(to_micros(start))];
    if let Some(end) = end {
        sql.push_str(" AND start < ?");
        values.push(SqlValue::Integer(to_micros(end)));
    }
    if let Some(ids) = statistic_ids {
        if ids.is_empty() {
            return Ok(BTreeMap::new());
        }
        sql.push_str(&format!(
            " AND statistic_id IN ({})",
            vec!["?"; ids.len()].join(", ")
        ));
        values.extend(ids.iter().map(|id| SqlValue::Text(id.clone())));
    }
    sql.push_str(" ORDER BY statistic_id, start");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values), StatisticRow::from_row)?;
    let mut grouped: BTreeMap<String, Vec<StatisticRow>> = BTreeMap::new();
    for row in rows {
        let row = row?;
        grouped.entry(row.statistic_id.clone()).or_default().push(row);
    }
    Ok(grouped)
}

pub fn list_statistic_ids(conn: &Connection) -> StoreResult<Vec<StatisticMetadata>> {
    let mut stmt = conn.prepare(
        "SELECT statistic_id, source, unit_of_measurement, has_mean, has_sum
         FROM statistics_meta ORDER BY statistic_id",
    )?;
    let rows = stmt.query_map([], StatisticMetadata::from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DatabaseLocation;
    use crate::migration::migrate;
    use crate::session::Session;
    use chrono::TimeZone;
    use recorder_types::{Event, State};
    use serde_json::json;

    fn hour() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
    }

    fn session() -> Session {
        let location = DatabaseLocation::parse("sqlite://").unwrap();
        let session = Session::open(&location, 100).unwrap();
        migrate(session.connection()).unwrap();
        session
    }

    fn record(session: &mut Session, state: State) {
        let entity_id = state.entity_id.clone();
        session
            .record(Event::state_changed(entity_id, None, Some(state)))
            .unwrap();
    }

    fn sensor(entity_id: &str, value: &str, at: DateTime<Utc>, class: &str) -> State {
        State::new(entity_id, value)
            .with_attribute("state_class", class)
            .with_attribute("unit_of_measurement", "W")
            .at(at)
    }

    #[test]
    fn kind_from_attributes() {
        let mut attrs = JsonMap::new();
        assert_eq!(statistic_kind(&attrs), None);
        attrs.insert("state_class".into(), json!("measurement"));
        assert_eq!(statistic_kind(&attrs), Some(StatisticKind::Mean));
        attrs.insert("device_class".into(), json!("energy"));
        attrs.insert("last_reset".into(), json!("2024-01-01T00:00:00+00:00"));
        assert_eq!(
            statistic_kind(&attrs),
            Some(StatisticKind::Sum(ResetRule::LastResetAttribute))
        );
        attrs.insert("state_class".into(), json!("total_increasing"));
        assert_eq!(
            statistic_kind(&attrs),
            Some(StatisticKind::Sum(ResetRule::AnyDecrease))
        );
    }

    #[test]
    fn time_weighted_mean() {
        let mut session = session();
        let start = hour();
        record(&mut session, sensor("sensor.power", "10", start - Duration::minutes(10), "measurement"));
        record(
            &mut session,
            sensor("sensor.power", "20", start + Duration::seconds(150), "measurement"),
        );
        record(
            &mut session,
            State::new("sensor.plain", "5").at(start + Duration::minutes(1)),
        );
        session.commit().unwrap();

        let report = compile_statistics(session.connection(), start).unwrap();
        assert_eq!(report.statistic_ids, vec!["sensor.power".to_string()]);
        assert_eq!(report.short_term_rows, 12);

        let conn = session.connection();
        let short = last_statistics(conn, StatisticsTable::ShortTerm, "sensor.power", 12).unwrap();
        assert_eq!(short.len(), 12);
        assert_eq!(short[0].mean, Some(15.0));
        assert_eq!(short[0].min, Some(10.0));
        assert_eq!(short[0].max, Some(20.0));
        assert_eq!(short[1].mean, Some(20.0));

        let long = last_statistics(conn, StatisticsTable::LongTerm, "sensor.power", 1).unwrap();
        let mean = long[0].mean.unwrap();
        assert!((mean - 235.0 / 12.0).abs() < 1e-9);
        assert_eq!(long[0].min, Some(10.0));
        assert_eq!(long[0].start, start);

        let meta = list_statistic_ids(conn).unwrap();
        assert_eq!(meta.len(), 1);
        assert!(meta[0].has_mean);
        assert_eq!(meta[0].unit_of_measurement.as_deref(), Some("W"));
    }

    #[test]
    fn rebuilding_an_hour_is_idempotent() {
        let mut session = session();
        let start = hour();
        record(&mut session, sensor("sensor.power", "10", start + Duration::minutes(1), "measurement"));
        session.commit().unwrap();
        let conn = session.connection();

        compile_statistics(conn, start).unwrap();
        let first = statistics_during_period(conn, start, None, None, StatisticsPeriod::FiveMinute)
            .unwrap();
        compile_statistics(conn, start).unwrap();
        let second = statistics_during_period(conn, start, None, None, StatisticsPeriod::FiveMinute)
            .unwrap();
        assert_eq!(first, second);

        let long_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM statistics_long_term", [], |row| row.get(0))
            .unwrap();
        assert_eq!(long_rows, 1);
        let runs: i64 = conn
            .query_row("SELECT COUNT(*) FROM statistics_runs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(runs, 1);
    }

    #[test]
    fn counter_reset_never_goes_negative() {
        let mut session = session();
        let start = hour();
        let meter = "sensor.energy";
        for (offset, value) in [(-5, "100"), (1, "110"), (10, "5"), (20, "8"), (30, "unavailable"), (40, "9")] {
            record(
                &mut session,
                sensor(meter, value, start + Duration::minutes(offset), "total_increasing"),
            );
        }
        session.commit().unwrap();

        compile_statistics(session.connection(), start).unwrap();
        let short = last_statistics(session.connection(), StatisticsTable::ShortTerm, meter, 12)
            .unwrap();
        let sums: Vec<f64> = short.iter().filter_map(|r| r.sum).collect();
        assert!(sums.iter().all(|s| *s >= 0.0));
        assert!(sums.windows(2).all(|w| w[1] >= w[0]));

        let long = last_statistics(session.connection(), StatisticsTable::LongTerm, meter, 1)
            .unwrap();
        assert_eq!(long[0].sum, Some(19.0));
        assert_eq!(long[0].state, Some(9.0));
    }

    #[test]
    fn sum_continues_across_hours() {
        let mut session = session();
        let start = hour();
        let meter = "sensor.gas";
        record(&mut session, sensor(meter, "1", start + Duration::minutes(1), "total_increasing"));
        record(
            &mut session,
            sensor(meter, "4", start + Duration::minutes(61), "total_increasing"),
        );
        session.commit().unwrap();
        let conn = session.connection();

        compile_statistics(conn, start).unwrap();
        compile_statistics(conn, start + Duration::hours(1)).unwrap();
        let long = last_statistics(conn, StatisticsTable::LongTerm, meter, 2).unwrap();
        assert_eq!(long[0].sum, Some(0.0));
        assert_eq!(long[1].sum, Some(3.0));
    }

    #[test]
    fn total_resets_on_new_last_reset() {
        let mut session = session();
        let start = hour();
        let meter = "sensor.cost";
        let cycle_a = "2024-01-01T00:00:00+00:00";
        let cycle_b = "2024-01-01T10:15:00+00:00";
        for (offset, value, cycle) in [(1, "50", cycle_a), (16, "3", cycle_b), (30, "7", cycle_b)] {
            record(
                &mut session,
                sensor(meter, value, start + Duration::minutes(offset), "total")
                    .with_attribute("last_reset", cycle),
            );
        }
        session.commit().unwrap();

        compile_statistics(session.connection(), start).unwrap();
        let long = last_statistics(session.connection(), StatisticsTable::LongTerm, meter, 1)
            .unwrap();
        assert_eq!(long[0].sum, Some(7.0));
        assert_eq!(
            long[0].last_reset,
            Some(DateTime::parse_from_rfc3339(cycle_b).unwrap().with_timezone(&Utc))
        );
    }

    #[test]
    fn total_keeps_negative_values_after_reset() {
        let mut session = session();
        let start = hour();
        let meter = "sensor.net_energy";
        let cycle_a = "2024-01-01T00:00:00+00:00";
        let cycle_b = "2024-01-01T10:15:00+00:00";
        for (offset, value, cycle) in [(1, "2", cycle_a), (16, "-4", cycle_b), (30, "-1", cycle_b)] {
            record(
                &mut session,
                sensor(meter, value, start + Duration::minutes(offset), "total")
                    .with_attribute("last_reset", cycle),
            );
        }
        session.commit().unwrap();

        compile_statistics(session.connection(), start).unwrap();
        let long = last_statistics(session.connection(), StatisticsTable::LongTerm, meter, 1)
            .unwrap();
        assert_eq!(long[0].sum, Some(-1.0));
        assert_eq!(long[0].state, Some(-1.0));
    }

    #[test]
    fn measurable_entities_use_the_newest_reading() {
        let mut session = session();
        let start = hour();
        record(&mut session, sensor("sensor.power", "5", start + Duration::minutes(20), "measurement"));
        // older reading inserted later, without a state_class
        record(
            &mut session,
            State::new("sensor.power", "4").at(start + Duration::minutes(5)),
        );
        session.commit().unwrap();

        let entities = measurable_entities(session.connection(), start + Duration::hours(1)).unwrap();
        let ids: Vec<&str> = entities.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["sensor.power"]);
    }

    #[test]
    fn catch_up_after_downtime() {
        let session = session();
        let conn = session.connection();
        let now = hour() + Duration::minutes(30);

        assert!(hours_to_catch_up(conn, now).unwrap().is_empty());
        assert_eq!(last_run(conn).unwrap(), Some(hour() - Duration::hours(1)));

        let later = now + Duration::hours(3);
        let hours = hours_to_catch_up(conn, later).unwrap();
        assert_eq!(hours, vec![hour(), hour() + Duration::hours(1), hour() + Duration::hours(2)]);

        let much_later = now + Duration::days(30);
        assert_eq!(
            hours_to_catch_up(conn, much_later).unwrap().len(),
            MAX_STATISTICS_CATCH_UP_HOURS
        );
    }

    #[test]
    fn period_query_filters_ids() {
        let mut session = session();
        let start = hour();
        record(&mut session, sensor("sensor.a", "1", start, "measurement"));
        record(&mut session, sensor("sensor.b", "2", start, "measurement"));
        session.commit().unwrap();
        let conn = session.connection();
        compile_statistics(conn, start).unwrap();

        let only_b = statistics_during_period(
            conn,
            start,
            Some(start + Duration::hours(1)),
            Some(&["sensor.b".to_string()]),
            StatisticsPeriod::Hour,
        )
        .unwrap();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b["sensor.b"][0].mean, Some(2.0));
    }
}
