use chrono::{DateTime, Utc};
use recorder_types::{Context, State};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, Row, params_from_iter};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::connection::ReadPool;
use crate::filter::EntityFilter;
use crate::models::{
    RecordingRun, StateRow, StatisticMetadata, StatisticRow, StatisticsPeriod, StatisticsTable,
    to_micros,
};
use crate::{StoreResult, runs, statistics};

/// Domains where every update counts, not only changes of the state value.
pub const SIGNIFICANT_DOMAINS: &[&str] = &[
    "climate",
    "device_tracker",
    "humidifier",
    "thermostat",
    "water_heater",
];

#[derive(Debug, Clone, Default)]
pub struct SignificantStatesQuery {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub entity_ids: Option<Vec<String>>,
    pub filter: Option<EntityFilter>,
    /// Also return the state each entity had at `start`.
    pub include_start_time_state: bool,
}

impl SignificantStatesQuery {
    pub fn since(start: DateTime<Utc>) -> Self {
        Self {
            start,
            ..Self::default()
        }
    }
}

/// Read-only access to recorded history, safe to use from any thread while
/// the writer is running.
#[derive(Debug, Clone)]
pub struct HistoryReader {
    pool: Arc<ReadPool>,
}

impl HistoryReader {
    pub fn new(pool: Arc<ReadPool>) -> Self {
        Self { pool }
    }

    pub fn with_connection<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T>,
    {
        let conn = self.pool.get()?;
        f(&conn)
    }

    /// States per entity in time order.
    pub fn get_significant_states(
        &self,
        query: &SignificantStatesQuery,
    ) -> StoreResult<BTreeMap<String, Vec<State>>> {
        self.with_connection(|conn| significant_states(conn, query))
    }

    pub fn get_last_statistics(
        &self,
        statistic_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<StatisticRow>> {
        self.with_connection(|conn| {
            statistics::last_statistics(conn, StatisticsTable::LongTerm, statistic_id, limit)
        })
    }

    pub fn get_last_short_term_statistics(
        &self,
        statistic_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<StatisticRow>> {
        self.with_connection(|conn| {
            statistics::last_statistics(conn, StatisticsTable::ShortTerm, statistic_id, limit)
        })
    }

    pub fn statistics_during_period(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        statistic_ids: Option<&[String]>,
        period: StatisticsPeriod,
    ) -> StoreResult<BTreeMap<String, Vec<StatisticRow>>> {
        self.with_connection(|conn| {
            statistics::statistics_during_period(conn, start, end, statistic_ids, period)
        })
    }

    pub fn list_statistic_ids(&self) -> StoreResult<Vec<StatisticMetadata>> {
        self.with_connection(statistics::list_statistic_ids)
    }

    pub fn recording_runs(&self) -> StoreResult<Vec<RecordingRun>> {
        self.with_connection(runs::load_runs)
    }
}

const STATE_COLUMNS: &str = "s.state_id, s.entity_id, s.domain, s.state, s.attributes,
     s.last_changed, s.last_updated, s.event_id, s.old_state_id,
     e.context_id, e.context_user_id, e.context_parent_id";

fn significant_states(
    conn: &Connection,
    query: &SignificantStatesQuery,
) -> StoreResult<BTreeMap<String, Vec<State>>> {
    let mut grouped: BTreeMap<String, Vec<State>> = BTreeMap::new();
    let wanted = |entity_id: &str| {
        query
            .filter
            .as_ref()
            .is_none_or(|filter| filter.matches(entity_id))
    };

    if query.include_start_time_state {
        // newest row by last_updated, state_id breaks ties
        let mut sql = format!(
            "SELECT {STATE_COLUMNS} FROM states s
             LEFT JOIN events e ON e.event_id = s.event_id
             WHERE s.last_updated <= ?
             AND NOT EXISTS (
                 SELECT 1 FROM states n
                 WHERE n.entity_id = s.entity_id AND n.last_updated <= ?
                 AND (n.last_updated > s.last_updated
                      OR (n.last_updated = s.last_updated AND n.state_id > s.state_id))
             ) AND s.state != ''"
        );
        let start = to_micros(query.start);
        let mut values = vec![SqlValue::Integer(start), SqlValue::Integer(start)];
        push_entity_clause(&mut sql, &mut values, query.entity_ids.as_deref());
        sql.push_str(" ORDER BY s.entity_id");
        for (row, context) in query_states(conn, &sql, values)? {
            if wanted(&row.entity_id) {
                grouped
                    .entry(row.entity_id.clone())
                    .or_default()
                    .push(row.to_native(context)?);
            }
        }
    }

    let domains = SIGNIFICANT_DOMAINS
        .iter()
        .map(|d| format!("'{d}'"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!(
        "SELECT {STATE_COLUMNS} FROM states s
         LEFT JOIN events e ON e.event_id = s.event_id
         WHERE s.last_updated > ?
         AND (s.domain IN ({domains}) OR s.last_changed = s.last_updated)"
    );
    let mut values = vec![SqlValue::Integer(to_micros(query.start))];
    if let Some(end) = query.end {
        sql.push_str(" AND s.last_updated < ?");
        values.push(SqlValue::Integer(to_micros(end)));
    }
    push_entity_clause(&mut sql, &mut values, query.entity_ids.as_deref());
    sql.push_str(" ORDER BY s.entity_id, s.last_updated, s.state_id");

    for (row, context) in query_states(conn, &sql, values)? {
        if wanted(&row.entity_id) {
            grouped
                .entry(row.entity_id.clone())
                .or_default()
                .push(row.to_native(context)?);
        }
    }
    Ok(grouped)
}

fn push_entity_clause(sql: &mut String, values: &mut Vec<SqlValue>, entity_ids: Option<&[String]>) {
    let Some(ids) = entity_ids else {
        return;
    };
    if ids.is_empty() {
        sql.push_str(" AND 0");
        return;
    }
    sql.push_str(&format!(
        " AND s.entity_id IN ({})",
        vec!["?"; ids.len()].join(", ")
    ));
    values.extend(ids.iter().map(|id| SqlValue::Text(id.clone())));
}

fn query_states(
    conn: &Connection,
    sql: &str,
    values: Vec<SqlValue>,
) -> StoreResult<Vec<(StateRow, Context)>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(values), |row| {
        Ok((StateRow::from_row(row)?, context_from_row(row)?))
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn context_from_row(row: &Row<'_>) -> rusqlite::Result<Context> {
    Ok(Context {
        id: row.get::<_, Option<String>>("context_id")?.unwrap_or_default(),
        user_id: row.get("context_user_id")?,
        parent_id: row.get("context_parent_id")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DatabaseLocation;
    use crate::migration::migrate;
    use crate::session::Session;
    use chrono::{Duration, TimeZone};
    use recorder_types::Event;

    fn setup() -> (Session, HistoryReader) {
        let location = DatabaseLocation::parse("sqlite://").unwrap();
        let session = Session::open(&location, 100).unwrap();
        migrate(session.connection()).unwrap();
        let reader = HistoryReader::new(Arc::new(ReadPool::with_size(location, 2)));
        (session, reader)
    }

    fn record(session: &mut Session, state: State) {
        let entity_id = state.entity_id.clone();
        session
            .record(Event::state_changed(entity_id, None, Some(state)))
            .unwrap();
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn attribute_only_updates_are_skipped_outside_significant_domains() {
        let (mut session, reader) = setup();
        let t0 = t0();
        record(&mut session, State::new("light.hall", "on").at(t0 + Duration::minutes(1)));
        record(
            &mut session,
            State::new("light.hall", "on")
                .with_attribute("brightness", 10)
                .at(t0 + Duration::minutes(2))
                .with_last_changed(t0 + Duration::minutes(1)),
        );
        record(
            &mut session,
            State::new("climate.hall", "heat")
                .with_attribute("temperature", 20)
                .at(t0 + Duration::minutes(2))
                .with_last_changed(t0 + Duration::minutes(1)),
        );
        session.commit().unwrap();

        let states = reader
            .get_significant_states(&SignificantStatesQuery::since(t0))
            .unwrap();
        assert_eq!(states["light.hall"].len(), 1);
        assert_eq!(states["climate.hall"].len(), 1);
        assert!(!states["light.hall"][0].context.id.is_empty());
    }

    #[test]
    fn start_time_state_and_entity_selection() {
        let (mut session, reader) = setup();
        let t0 = t0();
        record(&mut session, State::new("sensor.a", "1").at(t0 - Duration::hours(1)));
        record(&mut session, State::new("sensor.a", "2").at(t0 + Duration::minutes(5)));
        record(&mut session, State::new("sensor.b", "7").at(t0 + Duration::minutes(5)));
        session.commit().unwrap();

        let query = SignificantStatesQuery {
            start: t0,
            end: Some(t0 + Duration::hours(1)),
            entity_ids: Some(vec!["sensor.a".to_string()]),
            include_start_time_state: true,
            ..SignificantStatesQuery::default()
        };
        let states = reader.get_significant_states(&query).unwrap();
        assert_eq!(states.len(), 1);
        let values: Vec<&str> = states["sensor.a"].iter().map(|s| s.state.as_str()).collect();
        assert_eq!(values, vec!["1", "2"]);

        let filtered = reader
            .get_significant_states(&SignificantStatesQuery {
                start: t0,
                filter: Some(EntityFilter::include_only(&[], &[], &["sensor.b".to_string()]).unwrap()),
                ..SignificantStatesQuery::default()
            })
            .unwrap();
        assert_eq!(filtered.keys().collect::<Vec<_>>(), vec!["sensor.b"]);
    }

    #[test]
    fn start_time_state_follows_last_updated_not_insert_order() {
        let (mut session, reader) = setup();
        let t0 = t0();
        record(&mut session, State::new("sensor.late", "newer").at(t0 - Duration::minutes(10)));
        record(&mut session, State::new("sensor.late", "older").at(t0 - Duration::minutes(50)));
        session.commit().unwrap();

        let query = SignificantStatesQuery {
            start: t0,
            entity_ids: Some(vec!["sensor.late".to_string()]),
            include_start_time_state: true,
            ..SignificantStatesQuery::default()
        };
        let states = reader.get_significant_states(&query).unwrap();
        let values: Vec<&str> = states["sensor.late"].iter().map(|s| s.state.as_str()).collect();
        assert_eq!(values, vec!["newer"]);
    }

    #[test]
    fn runs_and_statistics_through_pool() {
        let (session, reader) = setup();
        let mut runs = crate::runs::RunHistory::new();
        runs.start(session.connection(), t0()).unwrap();

        let recorded = reader.recording_runs().unwrap();
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].is_open());
        assert!(reader.list_statistic_ids().unwrap().is_empty());
        assert!(reader.get_last_statistics("sensor.none", 5).unwrap().is_empty());
    }
}
