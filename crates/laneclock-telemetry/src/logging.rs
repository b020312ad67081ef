//! Persistent record of WARN+ events: refused commands, dropped frames and
//! full send queues. Events are indexed by the connection that caused them,
//! the role it held, the wire event and the lane involved.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 1_000;

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    CREATE TABLE IF NOT EXISTS logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        level TEXT NOT NULL,
        target TEXT NOT NULL,
        message TEXT NOT NULL,
        connection_id TEXT,
        role TEXT,
        event TEXT,
        lane INTEGER,
        fields TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_logs_connection ON logs(connection_id);
    CREATE INDEX IF NOT EXISTS idx_logs_role ON logs(role);
";

/// One persisted event, as returned by `GET /logs`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub connection_id: Option<String>,
    pub role: Option<String>,
    pub event: Option<String>,
    pub lane: Option<u8>,
    /// Remaining structured fields of the event.
    pub fields: Option<Value>,
}

impl LogRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let fields: Option<String> = row.get("fields")?;
        Ok(Self {
            id: row.get("id")?,
            timestamp: row.get("timestamp")?,
            level: row.get("level")?,
            target: row.get("target")?,
            message: row.get("message")?,
            connection_id: row.get("connection_id")?,
            role: row.get("role")?,
            event: row.get("event")?,
            lane: row.get("lane")?,
            fields: fields.and_then(|raw| serde_json::from_str(&raw).ok()),
        })
    }
}

/// Filters for `SqliteLogSink::query`. Deserializes from a camelCase query
/// string (`?role=lane-2&limit=20`).
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogQuery {
    /// Exact level, case-insensitive (`warn`, `ERROR`).
    pub level: Option<String>,
    pub connection_id: Option<String>,
    pub role: Option<String>,
    pub event: Option<String>,
    pub lane: Option<u8>,
    /// RFC 3339 lower bound on the timestamp.
    pub since: Option<String>,
    /// Capped at 1000; defaults to 100.
    pub limit: Option<u32>,
}

impl LogQuery {
    fn to_sql(&self) -> (String, Vec<SqlValue>) {
        let text = |v: &Option<String>| v.clone().map(SqlValue::Text);
        let filters = [
            ("level =", self.level.as_ref().map(|l| SqlValue::Text(l.to_uppercase()))),
            ("connection_id =", text(&self.connection_id)),
            ("role =", text(&self.role)),
            ("event =", text(&self.event)),
            ("lane =", self.lane.map(|l| SqlValue::Integer(l.into()))),
            ("timestamp >=", text(&self.since)),
        ];

        let mut sql = String::from("SELECT * FROM logs");
        let mut values = Vec::new();
        for (clause, value) in filters {
            let Some(value) = value else { continue };
            sql.push_str(if values.is_empty() { " WHERE " } else { " AND " });
            values.push(value);
            sql.push_str(&format!("{clause} ?{}", values.len()));
        }
        let limit = self.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {limit}"));
        (sql, values)
    }
}

/// SQLite store behind the log layer.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    /// Open or create the store. `":memory:"` gives a throwaway database.
    pub fn new(db_path: &Path) -> rusqlite::Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Newest first.
    pub fn query(&self, query: &LogQuery) -> rusqlite::Result<Vec<LogRecord>> {
        let (sql, values) = query.to_sql();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), LogRecord::from_row)?;
        rows.collect()
    }

    fn insert(&self, entry: &CapturedEvent, level: Level, target: &str) -> rusqlite::Result<()> {
        let fields = (!entry.fields.is_empty())
            .then(|| serde_json::to_string(&entry.fields).ok())
            .flatten();
        self.conn.lock().execute(
            "INSERT INTO logs (timestamp, level, target, message, connection_id, role, event, lane, fields)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                Utc::now().to_rfc3339(),
                level.as_str(),
                target,
                entry.message,
                entry.connection_id,
                entry.role,
                entry.event,
                entry.lane,
                fields,
            ],
        )?;
        Ok(())
    }
}

/// `tracing` layer that writes every WARN or ERROR event to a sink.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

impl<S: Subscriber> Layer<S> for SqliteLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > Level::WARN {
            return;
        }
        let mut captured = CapturedEvent::default();
        event.record(&mut captured);
        if let Err(e) = self.sink.insert(&captured, *meta.level(), meta.target()) {
            eprintln!("laneclock-telemetry: failed to persist log event: {e}");
        }
    }
}

/// Field names with their own column; the rest go into `fields`.
#[derive(Default)]
struct CapturedEvent {
    message: String,
    connection_id: Option<String>,
    role: Option<String>,
    event: Option<String>,
    lane: Option<u8>,
    fields: Map<String, Value>,
}

impl CapturedEvent {
    fn put(&mut self, field: &Field, value: Value) {
        let name = field.name();
        match (name, value) {
            ("message", Value::String(s)) => self.message = s,
            ("connection_id", Value::String(s)) => self.connection_id = Some(s),
            ("role", Value::String(s)) => self.role = Some(s),
            ("event", Value::String(s)) => self.event = Some(s),
            ("lane", Value::Number(n)) if n.as_u64().is_some_and(|l| l <= u8::MAX as u64) => {
                self.lane = n.as_u64().map(|l| l as u8);
            }
            (_, value) => {
                self.fields.insert(name.to_string(), value);
            }
        }
    }
}

impl Visit for CapturedEvent {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::String(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        // `%x` fields arrive here already formatted with Display.
        self.put(field, Value::String(format!("{value:?}")));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn capture(emit: impl FnOnce()) -> Arc<SqliteLogSink> {
        let sink = Arc::new(SqliteLogSink::new(Path::new(":memory:")).unwrap());
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));
        tracing::subscriber::with_default(subscriber, emit);
        sink
    }

    fn all(sink: &SqliteLogSink) -> Vec<LogRecord> {
        sink.query(&LogQuery::default()).unwrap()
    }

    #[test]
    fn info_and_below_are_not_persisted() {
        let sink = capture(|| {
            tracing::debug!("noise");
            tracing::info!(connection_id = "conn_a", role = "admin", "Role assigned");
        });
        assert!(all(&sink).is_empty());
    }

    #[test]
    fn known_fields_get_their_own_columns() {
        let sink = capture(|| {
            tracing::warn!(
                connection_id = "conn_a",
                role = "lane-2",
                event = "start-timer",
                required = "admin",
                "Unauthorized attempt"
            );
            tracing::error!(lane = 7u64, elapsed = 1_250u64, "Lane write failed");
        });

        let rows = all(&sink);
        assert_eq!(rows.len(), 2);

        let lane_error = &rows[0];
        assert_eq!(lane_error.level, "ERROR");
        assert_eq!(lane_error.lane, Some(7));
        assert_eq!(lane_error.fields, Some(serde_json::json!({"elapsed": 1250})));

        let refusal = &rows[1];
        assert_eq!(refusal.level, "WARN");
        assert_eq!(refusal.message, "Unauthorized attempt");
        assert_eq!(refusal.connection_id.as_deref(), Some("conn_a"));
        assert_eq!(refusal.role.as_deref(), Some("lane-2"));
        assert_eq!(refusal.event.as_deref(), Some("start-timer"));
        assert_eq!(refusal.fields, Some(serde_json::json!({"required": "admin"})));
    }

    #[test]
    fn display_fields_are_stored_unquoted() {
        let id = String::from("conn_b");
        let sink = capture(|| tracing::warn!(connection_id = %id, "Send queue full"));
        assert_eq!(all(&sink)[0].connection_id.as_deref(), Some("conn_b"));
        assert_eq!(all(&sink)[0].fields, None);
    }

    #[test]
    fn absent_optional_field_leaves_column_null() {
        let role: Option<&str> = None;
        let sink = capture(|| tracing::warn!(connection_id = "conn_c", role, "Unauthorized attempt"));
        let rows = all(&sink);
        assert_eq!(rows[0].role, None);
        assert_eq!(rows[0].connection_id.as_deref(), Some("conn_c"));
    }

    #[test]
    fn query_filters_combine() {
        let sink = capture(|| {
            tracing::warn!(connection_id = "conn_a", role = "lane-3", event = "stop-timer", lane = 3u64, "a");
            tracing::warn!(connection_id = "conn_b", role = "lane-3", event = "start-timer", "b");
            tracing::warn!(connection_id = "conn_c", role = "admin", event = "stop-timer", lane = 3u64, "c");
            tracing::error!(connection_id = "conn_a", "d");
        });

        let lane3_stops = sink
            .query(&LogQuery {
                role: Some("lane-3".into()),
                event: Some("stop-timer".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(lane3_stops.len(), 1);
        assert_eq!(lane3_stops[0].message, "a");

        let by_lane = sink.query(&LogQuery { lane: Some(3), ..Default::default() }).unwrap();
        let messages: Vec<_> = by_lane.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, ["c", "a"]);

        let errors = sink
            .query(&LogQuery {
                level: Some("error".into()),
                connection_id: Some("conn_a".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "d");
    }

    #[test]
    fn query_since_and_limit() {
        let sink = capture(|| {
            for i in 0..5 {
                tracing::warn!(attempt = i, "retry");
            }
        });
        let newest = sink.query(&LogQuery { limit: Some(2), ..Default::default() }).unwrap();
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].fields, Some(serde_json::json!({"attempt": 4})));

        let future = sink
            .query(&LogQuery {
                since: Some("2999-01-01T00:00:00Z".into()),
                ..Default::default()
            })
            .unwrap();
        assert!(future.is_empty());
    }

    #[test]
    fn query_string_deserializes_camel_case() {
        let query: LogQuery =
            serde_json::from_value(serde_json::json!({"connectionId": "conn_a", "lane": 4})).unwrap();
        assert_eq!(query.connection_id.as_deref(), Some("conn_a"));
        assert_eq!(query.lane, Some(4));
        assert_eq!(query.role, None);
    }

    #[test]
    fn file_backed_store_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("laneclock-logs-{}", std::process::id()));
        let path = dir.join("nested").join("logs.db");
        {
            let sink = Arc::new(SqliteLogSink::new(&path).unwrap());
            let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink));
            tracing::subscriber::with_default(subscriber, || tracing::warn!("kept"));
        }
        let reopened = SqliteLogSink::new(&path).unwrap();
        assert_eq!(all(&reopened)[0].message, "kept");
        let _ = std::fs::remove_dir_all(dir);
    }
}
