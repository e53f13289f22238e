use super::{Filter, Storage};
use crate::anonymize::VisitorKey;
use crate::enrich::{DeviceClass, EnrichedEvent, NameAndVersion};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, params_from_iter, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Ordered schema migrations. Entry `n` moves the database from version `n`
/// to `n + 1`; applied versions are recorded in `hindsight_schema`.
const MIGRATIONS: &[&str] = &[r#"
    CREATE TABLE hindsight_events (
        id INTEGER PRIMARY KEY,
        time INTEGER NOT NULL,
        unique_visitor TEXT NOT NULL,
        req_host TEXT NOT NULL,
        req_path TEXT NOT NULL,
        req_method TEXT NOT NULL,
        res_status INTEGER NOT NULL,
        res_duration_ms INTEGER NOT NULL,
        res_bytes_written INTEGER NOT NULL,
        browser_kind TEXT NOT NULL,
        browser_name TEXT NOT NULL,
        browser_version TEXT NOT NULL,
        os_name TEXT NOT NULL,
        os_version TEXT NOT NULL,
        location_country_code TEXT NOT NULL,
        location_time_zone TEXT NOT NULL
    );
    CREATE INDEX idx_events_time ON hindsight_events(time);
    "#];

const SELECT_COLUMNS: &str = r#"
    SELECT time, unique_visitor,
           req_host, req_path, req_method,
           res_status, res_duration_ms, res_bytes_written,
           browser_kind, browser_name, browser_version,
           os_name, os_version,
           location_country_code, location_time_zone
    FROM hindsight_events
    WHERE time BETWEEN ?1 AND ?2
"#;

/// Event storage backed by SQLite.
///
/// # Thread Safety
/// - One connection behind a Mutex: all writers are serialized
/// - Queries run on the blocking thread pool so async tasks are not stalled
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Opens (or creates) the database and applies pending migrations.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open database")?;
        Self::init(conn)
    }

    /// Private in-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        // journal_mode returns a row, so it can't go through execute()
        let _mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .context("Failed to set journal mode")?;

        migrate(&mut conn, MIGRATIONS)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Current schema version
    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.conn.lock().map_err(|_| anyhow!("storage mutex poisoned"))?;
        conn.query_row("SELECT MAX(version) FROM hindsight_schema", [], |row| row.get(0))
            .context("Failed to read schema version")
    }
}

/// Brings the database up to `migrations.len()`. Each step and its version
/// row commit together, so a failed step leaves the previous version intact.
fn migrate(conn: &mut Connection, migrations: &[&str]) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS hindsight_schema (version INTEGER NOT NULL, time INTEGER NOT NULL)",
        [],
    )
    .context("Failed to create schema table")?;

    let mut version: usize = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM hindsight_schema",
            [],
            |row| row.get::<_, i64>(0),
        )
        .context("Failed to read schema version")? as usize;

    while version < migrations.len() {
        let tx = conn.transaction().context("Failed to begin migration")?;
        tx.execute_batch(migrations[version])
            .with_context(|| format!("Failed to migrate from schema version {}", version))?;
        tx.execute(
            "INSERT INTO hindsight_schema (version, time) VALUES (?1, ?2)",
            params![(version + 1) as i64, Utc::now().timestamp()],
        )
        .with_context(|| format!("Failed to record schema version {}", version + 1))?;
        tx.commit()
            .with_context(|| format!("Failed to commit schema version {}", version + 1))?;
        version += 1;
        tracing::info!(version, "Applied storage migration");
    }
    Ok(())
}

fn insert_all(conn: &Connection, events: &[EnrichedEvent]) -> Result<()> {
    let mut stmt = conn
        .prepare_cached(
            r#"
            INSERT INTO hindsight_events (
                time, unique_visitor,
                req_host, req_path, req_method,
                res_status, res_duration_ms, res_bytes_written,
                browser_kind, browser_name, browser_version,
                os_name, os_version,
                location_country_code, location_time_zone
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .context("Failed to prepare insert")?;

    for (i, ev) in events.iter().enumerate() {
        stmt.execute(params![
            ev.time.timestamp(),
            ev.key.as_str(),
            ev.host,
            ev.path,
            ev.method,
            ev.status_code,
            i64::try_from(ev.duration_ms).unwrap_or(i64::MAX),
            i64::try_from(ev.bytes_written).unwrap_or(i64::MAX),
            ev.device.as_str(),
            ev.browser.name,
            ev.browser.version,
            ev.os.name,
            ev.os.version,
            ev.country_code,
            ev.time_zone,
        ])
        .with_context(|| format!("failed to store event {}/{}", i + 1, events.len()))?;
    }
    Ok(())
}

fn select(
    conn: &Connection,
    from: i64,
    until: i64,
    filter: &Filter,
) -> Result<Vec<EnrichedEvent>> {
    let mut query = SELECT_COLUMNS.to_string();
    if !filter.hosts.is_empty() {
        let placeholders: Vec<String> = (0..filter.hosts.len())
            .map(|i| format!("?{}", i + 3))
            .collect();
        query.push_str(&format!(" AND req_host IN ({})", placeholders.join(", ")));
    }
    query.push_str(" ORDER BY time, id");

    let mut values: Vec<rusqlite::types::Value> = vec![from.into(), until.into()];
    values.extend(filter.hosts.iter().cloned().map(rusqlite::types::Value::from));

    let mut stmt = conn.prepare(&query).context("Failed to prepare query")?;
    let rows = stmt
        .query_map(params_from_iter(values), |row| {
            let unix: i64 = row.get(0)?;
            let device: String = row.get(8)?;
            Ok(EnrichedEvent {
                key: VisitorKey::from(row.get::<_, String>(1)?),
                time: Utc.timestamp_opt(unix, 0).single().unwrap_or_default(),
                host: row.get(2)?,
                path: row.get(3)?,
                method: row.get(4)?,
                status_code: row.get(5)?,
                duration_ms: row.get::<_, i64>(6)?.max(0) as u64,
                bytes_written: row.get::<_, i64>(7)?.max(0) as u64,
                device: DeviceClass::parse(&device),
                browser: NameAndVersion::new(row.get::<_, String>(9)?, row.get::<_, String>(10)?),
                os: NameAndVersion::new(row.get::<_, String>(11)?, row.get::<_, String>(12)?),
                country_code: row.get(13)?,
                time_zone: row.get(14)?,
            })
        })
        .context("Failed to execute query")?;

    rows.collect::<rusqlite::Result<Vec<_>>>()
        .context("error while scanning rows")
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn store(&self, events: &[EnrichedEvent]) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let events = events.to_vec();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| anyhow!("storage mutex poisoned"))?;
            insert_all(&conn, &events)
        })
        .await
        .context("storage task panicked")?
    }

    async fn fetch(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
        filter: &Filter,
    ) -> Result<Vec<EnrichedEvent>> {
        let conn = Arc::clone(&self.conn);
        let filter = filter.clone();
        let (from, until) = (from.timestamp(), until.timestamp());
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| anyhow!("storage mutex poisoned"))?;
            select(&conn, from, until, &filter)
        })
        .await
        .context("storage task panicked")?
    }
}
