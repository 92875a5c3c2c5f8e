//! Relational storage for the networked backend.
//!
//! One row per task. `timer` and `children` are JSON text columns, and
//! `parent_id` is a self-reference with `ON DELETE SET NULL`: removing a
//! row never cascades here, subtree deletion is the task store's job.

use crate::error::BackendError;
use crate::model::{AppSettings, Category, Difficulty, PriorityUpdate, Task, TaskPatch, TriageStatus, UserSettings};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS tasks (
    id                  TEXT PRIMARY KEY NOT NULL,
    parent_id           TEXT REFERENCES tasks(id) ON DELETE SET NULL,
    children            TEXT NOT NULL DEFAULT '[]' CHECK (json_valid(children)),
    title               TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    triage_status       TEXT NOT NULL,
    urgent              INTEGER NOT NULL DEFAULT 0,
    impact              INTEGER NOT NULL DEFAULT 0,
    major_incident      INTEGER NOT NULL DEFAULT 0,
    difficulty          REAL NOT NULL DEFAULT 1,
    timer               TEXT NOT NULL DEFAULT '[]' CHECK (json_valid(timer)),
    category            TEXT NOT NULL,
    termination_date    TEXT,
    comment             TEXT NOT NULL DEFAULT '',
    duration_in_minutes INTEGER,
    priority            INTEGER,
    user_id             TEXT
);

CREATE INDEX IF NOT EXISTS tasks_parent ON tasks(parent_id);
CREATE INDEX IF NOT EXISTS tasks_user ON tasks(user_id);

CREATE TABLE IF NOT EXISTS settings (
    key   TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
"#;

const COLUMNS: &str = "id, parent_id, children, title, created_at, triage_status, urgent, impact, \
    major_incident, difficulty, timer, category, termination_date, comment, duration_in_minutes, \
    priority, user_id";

const UPSERT: &str = r#"
INSERT INTO tasks (id, parent_id, children, title, created_at, triage_status, urgent, impact,
                   major_incident, difficulty, timer, category, termination_date, comment,
                   duration_in_minutes, priority, user_id)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
ON CONFLICT(id) DO UPDATE SET
    parent_id = excluded.parent_id,
    children = excluded.children,
    title = excluded.title,
    triage_status = excluded.triage_status,
    urgent = excluded.urgent,
    impact = excluded.impact,
    major_incident = excluded.major_incident,
    difficulty = excluded.difficulty,
    timer = excluded.timer,
    category = excluded.category,
    termination_date = excluded.termination_date,
    comment = excluded.comment,
    duration_in_minutes = excluded.duration_in_minutes,
    priority = excluded.priority,
    user_id = excluded.user_id
"#;

const USER_SETTINGS: &str = "user";
const APP_SETTINGS: &str = "app";

/// The `tasks` table behind one SQLite connection.
pub struct TaskTable {
    conn: Mutex<Connection>,
}

impl TaskTable {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, BackendError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, BackendError> {
        conn.execute_batch(SCHEMA)?;
        Ok(TaskTable { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, BackendError> {
        self.conn.lock().map_err(|_| BackendError::Poisoned)
    }

    pub fn list(&self, user: Option<Uuid>) -> Result<Vec<Task>, BackendError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM tasks \
             WHERE (?1 IS NULL OR user_id = ?1) \
             ORDER BY priority DESC NULLS LAST, created_at ASC"
        ))?;
        let rows = stmt.query_map(params![user.map(|u| u.to_string())], task_from_row)?;
        let tasks = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Task>, BackendError> {
        let conn = self.conn()?;
        let task = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    pub fn upsert(&self, task: &Task) -> Result<Task, BackendError> {
        let conn = self.conn()?;
        write_task(&conn, task)?;
        Ok(task.clone())
    }

    pub fn update(&self, id: Uuid, patch: &TaskPatch) -> Result<Task, BackendError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut task = tx
            .query_row(
                &format!("SELECT {COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
                task_from_row,
            )
            .optional()?
            .ok_or(BackendError::NotFound(id))?;
        patch.apply_to(&mut task);
        write_task(&tx, &task)?;
        tx.commit()?;
        Ok(task)
    }

    /// Returns false when no row had that id.
    pub fn delete(&self, id: Uuid) -> Result<bool, BackendError> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])?;
        Ok(n > 0)
    }

    pub fn set_priorities(&self, items: &[PriorityUpdate]) -> Result<(), BackendError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE tasks SET priority = ?2 WHERE id = ?1")?;
            for item in items {
                stmt.execute(params![item.id.to_string(), item.priority])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Upsert a batch. Foreign keys are checked at commit so rows may
    /// arrive children-first.
    pub fn import(&self, tasks: &[Task]) -> Result<(), BackendError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute_batch("PRAGMA defer_foreign_keys = ON;")?;
        for task in tasks {
            write_task(&tx, task)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn clear(&self) -> Result<(), BackendError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM tasks", [])?;
        Ok(())
    }

    fn setting<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T, BackendError> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |r| r.get(0))
            .optional()?;
        match raw {
            Some(json) => serde_json::from_str(&json).map_err(|e| BackendError::Decode(e.to_string())),
            None => Ok(T::default()),
        }
    }

    fn put_setting<T: Serialize>(&self, key: &str, value: &T) -> Result<(), BackendError> {
        let json = serde_json::to_string(value).map_err(|e| BackendError::Encode(e.to_string()))?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, json],
        )?;
        Ok(())
    }

    pub fn user_settings(&self) -> Result<UserSettings, BackendError> {
        self.setting(USER_SETTINGS)
    }

    pub fn set_user_settings(&self, settings: &UserSettings) -> Result<(), BackendError> {
        self.put_setting(USER_SETTINGS, settings)
    }

    pub fn app_settings(&self) -> Result<AppSettings, BackendError> {
        self.setting(APP_SETTINGS)
    }

    pub fn set_app_settings(&self, settings: &AppSettings) -> Result<(), BackendError> {
        self.put_setting(APP_SETTINGS, settings)
    }
}

// ── Row mapping ────────────────────────────────────────────────

fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn write_task(conn: &Connection, task: &Task) -> Result<(), BackendError> {
    let children = serde_json::to_string(&task.children).map_err(|e| BackendError::Encode(e.to_string()))?;
    let timer = serde_json::to_string(&task.timer).map_err(|e| BackendError::Encode(e.to_string()))?;
    conn.execute(
        UPSERT,
        params![
            task.id.to_string(),
            task.parent_id.map(|p| p.to_string()),
            children,
            task.title,
            timestamp(&task.created_at),
            task.triage_status.as_str(),
            task.urgent,
            task.impact,
            task.major_incident,
            task.difficulty.points(),
            timer,
            task.category.as_str(),
            task.termination_date.as_ref().map(timestamp),
            task.comment,
            task.duration_in_minutes,
            task.priority,
            task.user_id.map(|u| u.to_string()),
        ],
    )?;
    Ok(())
}

fn bad_column(idx: usize, reason: impl Into<String>) -> rusqlite::Error {
    let reason: Box<dyn std::error::Error + Send + Sync> = reason.into().into();
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, reason)
}

fn uuid_at(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| bad_column(idx, e.to_string()))
}

fn opt_uuid_at(row: &Row, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| Uuid::parse_str(&s).map_err(|e| bad_column(idx, e.to_string())))
        .transpose()
}

fn time_at(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| bad_column(idx, e.to_string()))
    })
    .transpose()
}

fn json_at<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| bad_column(idx, e.to_string()))
}

fn task_from_row(row: &Row) -> rusqlite::Result<Task> {
    let status: String = row.get(5)?;
    let category: String = row.get(11)?;
    let points: f64 = row.get(9)?;

    Ok(Task {
        id: uuid_at(row, 0)?,
        parent_id: opt_uuid_at(row, 1)?,
        children: json_at(row, 2)?,
        title: row.get(3)?,
        created_at: time_at(row, 4)?.ok_or_else(|| bad_column(4, "created_at is null"))?,
        triage_status: TriageStatus::parse(&status).ok_or_else(|| bad_column(5, status.clone()))?,
        urgent: row.get(6)?,
        impact: row.get(7)?,
        major_incident: row.get(8)?,
        difficulty: Difficulty::try_from(points).map_err(|e| bad_column(9, e))?,
        timer: json_at(row, 10)?,
        category: Category::parse(&category).ok_or_else(|| bad_column(11, category.clone()))?,
        termination_date: time_at(row, 12)?,
        comment: row.get(13)?,
        duration_in_minutes: row.get(14)?,
        priority: row.get(15)?,
        user_id: opt_uuid_at(row, 16)?,
    })
}

// ── Tests ──────────────────────────────────────────────────────
