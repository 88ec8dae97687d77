use chrono::{DateTime, Duration, Utc};
use recorder_types::{Context, Event, EventOrigin, JsonMap, State, StateChangedData};
use rusqlite::types::Type;
use rusqlite::Row;
use serde_json::Value;

use crate::{StoreError, StoreResult};

/// Row of the `events` table.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRow {
    pub event_id: Option<i64>,
    pub event_type: String,
    pub event_data: String,
    pub origin: EventOrigin,
    pub time_fired: DateTime<Utc>,
    pub context_id: Option<String>,
    pub context_user_id: Option<String>,
    pub context_parent_id: Option<String>,
}

impl EventRow {
    /// Builds a row carrying the full event payload. The payload must be a
    /// JSON object or null.
    pub fn from_event(event: &Event) -> StoreResult<Self> {
        match &event.data {
            Value::Object(_) | Value::Null => {}
            other => {
                return Err(StoreError::InvalidPayload(format!(
                    "event data for {} must be an object, got {}",
                    event.event_type,
                    json_kind(other)
                )));
            }
        }
        let mut row = Self::for_state_changed(event);
        row.event_data = serde_json::to_string(&event.data)?;
        Ok(row)
    }

    /// Row for a `state_changed` event. The payload lives in the state row,
    /// so the event keeps an empty object.
    pub fn for_state_changed(event: &Event) -> Self {
        Self {
            event_id: None,
            event_type: event.event_type.clone(),
            event_data: "{}".to_string(),
            origin: event.origin,
            time_fired: event.time_fired,
            context_id: Some(event.context.id.clone()),
            context_user_id: event.context.user_id.clone(),
            context_parent_id: event.context.parent_id.clone(),
        }
    }

    pub fn to_native(&self) -> StoreResult<Event> {
        let data: Value = serde_json::from_str(&self.event_data)?;
        Ok(Event {
            event_type: self.event_type.clone(),
            data,
            origin: self.origin,
            time_fired: self.time_fired,
            context: self.context(),
        })
    }

    pub fn context(&self) -> Context {
        Context {
            id: self.context_id.clone().unwrap_or_default(),
            user_id: self.context_user_id.clone(),
            parent_id: self.context_parent_id.clone(),
        }
    }

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let origin: String = row.get("origin")?;
        Ok(Self {
            event_id: row.get("event_id")?,
            event_type: row.get("event_type")?,
            event_data: row.get("event_data")?,
            origin: parse_enum(&origin, EventOrigin::parse)?,
            time_fired: from_micros(row.get("time_fired")?),
            context_id: row.get("context_id")?,
            context_user_id: row.get("context_user_id")?,
            context_parent_id: row.get("context_parent_id")?,
        })
    }
}

/// Row of the `states` table. Rows of one entity form a chain through
/// `old_state_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct StateRow {
    pub state_id: Option<i64>,
    pub entity_id: String,
    pub domain: String,
    pub state: String,
    pub attributes: String,
    pub last_changed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub event_id: Option<i64>,
    pub old_state_id: Option<i64>,
}

impl StateRow {
    /// A removed entity (`new_state` absent) is stored as an empty state
    /// stamped with the firing time.
    pub fn from_state_changed(
        data: &StateChangedData,
        time_fired: DateTime<Utc>,
    ) -> StoreResult<Self> {
        let domain = recorder_types::split_entity_id(&data.entity_id)
            .map(|(domain, _)| domain.to_string())
            .unwrap_or_default();
        let row = match &data.new_state {
            Some(state) => Self {
                state_id: None,
                entity_id: data.entity_id.clone(),
                domain,
                state: state.state.clone(),
                attributes: serde_json::to_string(&state.attributes)?,
                last_changed: state.last_changed,
                last_updated: state.last_updated,
                event_id: None,
                old_state_id: None,
            },
            None => Self {
                state_id: None,
                entity_id: data.entity_id.clone(),
                domain,
                state: String::new(),
                attributes: "{}".to_string(),
                last_changed: time_fired,
                last_updated: time_fired,
                event_id: None,
                old_state_id: None,
            },
        };
        Ok(row)
    }

    pub fn to_native(&self, context: Context) -> StoreResult<State> {
        let attributes: JsonMap = serde_json::from_str(&self.attributes)?;
        Ok(State {
            entity_id: self.entity_id.clone(),
            state: self.state.clone(),
            attributes,
            last_changed: self.last_changed,
            last_updated: self.last_updated,
            context,
        })
    }

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            state_id: row.get("state_id")?,
            entity_id: row.get("entity_id")?,
            domain: row.get("domain")?,
            state: row.get("state")?,
            attributes: row.get("attributes")?,
            last_changed: from_micros(row.get("last_changed")?),
            last_updated: from_micros(row.get("last_updated")?),
            event_id: row.get("event_id")?,
            old_state_id: row.get("old_state_id")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordingRun {
    pub run_id: i64,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub closed_incorrect: bool,
    pub created: DateTime<Utc>,
}

impl RecordingRun {
    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get("run_id")?,
            start: from_micros(row.get("start")?),
            end: row.get::<_, Option<i64>>("end")?.map(from_micros),
            closed_incorrect: row.get("closed_incorrect")?,
            created: from_micros(row.get("created")?),
        })
    }
}

/// One compiled bucket, short-term or long-term.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatisticRow {
    pub statistic_id: String,
    pub start: DateTime<Utc>,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub sum: Option<f64>,
    pub state: Option<f64>,
    pub last_reset: Option<DateTime<Utc>>,
}

impl StatisticRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            statistic_id: row.get("statistic_id")?,
            start: from_micros(row.get("start")?),
            mean: row.get("mean")?,
            min: row.get("min")?,
            max: row.get("max")?,
            sum: row.get("sum")?,
            state: row.get("state")?,
            last_reset: row.get::<_, Option<i64>>("last_reset")?.map(from_micros),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatisticMetadata {
    pub statistic_id: String,
    pub source: String,
    pub unit_of_measurement: Option<String>,
    pub has_mean: bool,
    pub has_sum: bool,
}

impl StatisticMetadata {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            statistic_id: row.get("statistic_id")?,
            source: row.get("source")?,
            unit_of_measurement: row.get("unit_of_measurement")?,
            has_mean: row.get("has_mean")?,
            has_sum: row.get("has_sum")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatisticsTable {
    ShortTerm,
    LongTerm,
}

impl StatisticsTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            StatisticsTable::ShortTerm => "statistics_short_term",
            StatisticsTable::LongTerm => "statistics_long_term",
        }
    }

    pub fn bucket(&self) -> Duration {
        match self {
            StatisticsTable::ShortTerm => Duration::minutes(5),
            StatisticsTable::LongTerm => Duration::hours(1),
        }
    }
}

/// Resolution requested from `statistics_during_period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatisticsPeriod {
    FiveMinute,
    Hour,
}

impl StatisticsPeriod {
    pub fn table(&self) -> StatisticsTable {
        match self {
            StatisticsPeriod::FiveMinute => StatisticsTable::ShortTerm,
            StatisticsPeriod::Hour => StatisticsTable::LongTerm,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "5minute" => Some(StatisticsPeriod::FiveMinute),
            "hour" => Some(StatisticsPeriod::Hour),
            _ => None,
        }
    }
}

pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn parse_enum<T>(value: &str, parser: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    parser(value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid enum value {value}"),
            )),
        )
    })
}
