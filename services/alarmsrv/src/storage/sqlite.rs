//! SQLite alarm store

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use super::{AlarmLogEntry, AlarmPersistence, StoredAlarm};
use crate::domain::{Alarm, AlarmKey, AlarmState};
use crate::error::{AlarmError, Result};

#[derive(Clone)]
pub struct SqliteAlarmStore {
    pool: SqlitePool,
}

impl SqliteAlarmStore {
    /// Open (creating if missing) the database at `url`, e.g. `sqlite://data/alarms.db`
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        info!("Alarm store opened: {}", url);
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alarms (
                id INTEGER PRIMARY KEY,
                alarm_id TEXT NOT NULL,
                alarm_name TEXT NOT NULL,
                alarm_source TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                alarm_state TEXT NOT NULL DEFAULT 'LOWERED',
                last_raised TEXT,
                last_lowered TEXT,
                last_disabled TEXT,
                UNIQUE (alarm_source, alarm_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alarm_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                alarm_id INTEGER NOT NULL,
                alarm_state TEXT NOT NULL,
                alarm_message TEXT NOT NULL DEFAULT '',
                alarm_code INTEGER NOT NULL,
                created TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Log rows for one alarm, oldest first
    pub async fn log_for(&self, alarm_id: i64) -> Result<Vec<AlarmLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT alarm_id, alarm_state, alarm_message, alarm_code, created
            FROM alarm_log
            WHERE alarm_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(alarm_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(hydrate_log).collect()
    }
}

fn parse_state(raw: &str) -> Result<AlarmState> {
    AlarmState::from_str(raw)
        .map_err(|_| AlarmError::internal(format!("bad alarm_state in store: {}", raw)))
}

fn hydrate_alarm(row: &SqliteRow) -> Result<StoredAlarm> {
    let state: String = row.try_get("alarm_state")?;
    let active: i64 = row.try_get("active")?;
    Ok(StoredAlarm {
        id: row.try_get("id")?,
        sid: row.try_get("alarm_id")?,
        name: row.try_get("alarm_name")?,
        source: row.try_get("alarm_source")?,
        active: active != 0,
        state: parse_state(&state)?,
        last_raised: row.try_get::<Option<DateTime<Utc>>, _>("last_raised")?,
        last_lowered: row.try_get::<Option<DateTime<Utc>>, _>("last_lowered")?,
        last_disabled: row.try_get::<Option<DateTime<Utc>>, _>("last_disabled")?,
    })
}

fn hydrate_log(row: &SqliteRow) -> Result<AlarmLogEntry> {
    let state: String = row.try_get("alarm_state")?;
    Ok(AlarmLogEntry {
        alarm_id: row.try_get("alarm_id")?,
        state: parse_state(&state)?,
        message: row.try_get("alarm_message")?,
        code: row.try_get("alarm_code")?,
        created: row.try_get("created")?,
    })
}

#[async_trait]
impl AlarmPersistence for SqliteAlarmStore {
    async fn load_alarms(&self) -> Result<Vec<StoredAlarm>> {
        let rows = sqlx::query(
            r#"
            SELECT id, alarm_id, alarm_name, alarm_source, active, alarm_state,
                   last_raised, last_lowered, last_disabled
            FROM alarms
            WHERE active = 1
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(hydrate_alarm).collect()
    }

    async fn known_ids(&self) -> Result<Vec<(AlarmKey, i64)>> {
        let rows = sqlx::query("SELECT id, alarm_id, alarm_source FROM alarms ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<(AlarmKey, i64)> {
                let sid: String = row.try_get("alarm_id")?;
                let source: String = row.try_get("alarm_source")?;
                Ok((AlarmKey::new(&source, &sid), row.try_get("id")?))
            })
            .collect()
    }

    async fn update_alarm(&self, alarm: &Alarm) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO alarms (id, alarm_id, alarm_name, alarm_source, active, alarm_state,
                                last_raised, last_lowered, last_disabled)
            VALUES (?, ?, ?, ?, 1, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                alarm_name = excluded.alarm_name,
                alarm_state = excluded.alarm_state,
                active = 1,
                last_raised = excluded.last_raised,
                last_lowered = excluded.last_lowered,
                last_disabled = excluded.last_disabled
            "#,
        )
        .bind(alarm.id)
        .bind(&alarm.sid)
        .bind(&alarm.name)
        .bind(&alarm.source)
        .bind(alarm.state.as_str())
        .bind(alarm.last_raised)
        .bind(alarm.last_lowered)
        .bind(alarm.last_disabled)
        .execute(&self.pool)
        .await?;

        debug!("Stored alarm {} ({})", alarm.id, alarm.key());
        Ok(())
    }

    async fn log_alarm(&self, entry: &AlarmLogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO alarm_log (alarm_id, alarm_state, alarm_message, alarm_code, created)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.alarm_id)
        .bind(entry.state.as_str())
        .bind(&entry.message)
        .bind(entry.code)
        .bind(entry.created)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
