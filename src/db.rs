use crate::calc::{GradeEntry, Period};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

pub const DB_FILE_NAME: &str = "grades.sqlite3";

/// A consistent read of one account's stored grade set.
#[derive(Debug, Clone)]
pub struct GradeSnapshot {
    pub revision: i64,
    pub entries: Vec<GradeEntry>,
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS accounts(
            id TEXT PRIMARY KEY,
            revision INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            entry_id TEXT NOT NULL,
            subject_code TEXT NOT NULL,
            subject_label TEXT NOT NULL,
            period_code TEXT NOT NULL,
            value TEXT,
            scale REAL,
            coefficient REAL,
            date TEXT NOT NULL,
            subgroup_id TEXT,
            class_value TEXT,
            optional INTEGER NOT NULL DEFAULT 0,
            bonus INTEGER NOT NULL DEFAULT 0,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(account_id) REFERENCES accounts(id),
            UNIQUE(account_id, entry_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_account ON grades(account_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_account_period ON grades(account_id, period_code)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS periods(
            account_id TEXT NOT NULL,
            code TEXT NOT NULL,
            label TEXT NOT NULL,
            start_date TEXT,
            end_date TEXT,
            sort_order INTEGER NOT NULL,
            PRIMARY KEY(account_id, code),
            FOREIGN KEY(account_id) REFERENCES accounts(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_coefficients(
            account_id TEXT NOT NULL,
            subject_code TEXT NOT NULL,
            coefficient REAL NOT NULL,
            PRIMARY KEY(account_id, subject_code),
            FOREIGN KEY(account_id) REFERENCES accounts(id)
        )",
        [],
    )?;

    Ok(conn)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

fn ensure_account(conn: &Connection, account_id: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO accounts(id, revision) VALUES(?, 0)",
        [account_id],
    )?;
    Ok(())
}

pub fn account_revision(conn: &Connection, account_id: &str) -> anyhow::Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT revision FROM accounts WHERE id = ?",
            [account_id],
            |r| r.get(0),
        )
        .optional()?)
}

/// SQLite has no NaN; unusable numbers are stored as NULL and read back as NaN.
fn finite(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

/// Swaps the whole grade set of an account and bumps its revision, in one
/// transaction. Returns the new revision.
pub fn replace_grades(
    conn: &mut Connection,
    account_id: &str,
    entries: &[GradeEntry],
) -> anyhow::Result<i64> {
    let tx = conn.transaction()?;
    ensure_account(&tx, account_id)?;
    tx.execute("DELETE FROM grades WHERE account_id = ?", [account_id])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO grades(
                id, account_id, entry_id, subject_code, subject_label, period_code,
                value, scale, coefficient, date, subgroup_id, class_value,
                optional, bonus, sort_order
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for (i, e) in entries.iter().enumerate() {
            stmt.execute(rusqlite::params![
                Uuid::new_v4().to_string(),
                account_id,
                e.id,
                e.subject_code,
                e.subject_label,
                e.period_code,
                e.value,
                finite(e.scale),
                finite(e.coefficient),
                e.date,
                e.subgroup_id,
                e.class_value,
                e.optional as i64,
                e.bonus as i64,
                i as i64,
            ])?;
        }
    }
    tx.execute(
        "UPDATE accounts SET revision = revision + 1, updated_at = ? WHERE id = ?",
        (chrono::Utc::now().to_rfc3339(), account_id),
    )?;
    let revision: i64 = tx.query_row(
        "SELECT revision FROM accounts WHERE id = ?",
        [account_id],
        |r| r.get(0),
    )?;
    tx.commit()?;
    Ok(revision)
}

/// `None` when the account has never been written.
pub fn load_snapshot(conn: &Connection, account_id: &str) -> anyhow::Result<Option<GradeSnapshot>> {
    let Some(revision) = account_revision(conn, account_id)? else {
        return Ok(None);
    };
    let mut stmt = conn.prepare(
        "SELECT entry_id, subject_code, subject_label, period_code, value, scale,
                coefficient, date, subgroup_id, class_value, optional, bonus
         FROM grades
         WHERE account_id = ?
         ORDER BY sort_order",
    )?;
    let entries = stmt
        .query_map([account_id], |r| {
            Ok(GradeEntry {
                id: r.get(0)?,
                subject_code: r.get(1)?,
                subject_label: r.get(2)?,
                period_code: r.get(3)?,
                value: r.get(4)?,
                scale: r.get::<_, Option<f64>>(5)?.unwrap_or(f64::NAN),
                coefficient: r.get::<_, Option<f64>>(6)?.unwrap_or(f64::NAN),
                date: r.get(7)?,
                subgroup_id: r.get(8)?,
                class_value: r.get(9)?,
                optional: r.get::<_, i64>(10)? != 0,
                bonus: r.get::<_, i64>(11)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(GradeSnapshot { revision, entries }))
}

pub fn replace_periods(conn: &mut Connection, account_id: &str, periods: &[Period]) -> anyhow::Result<()> {
    let tx = conn.transaction()?;
    ensure_account(&tx, account_id)?;
    tx.execute("DELETE FROM periods WHERE account_id = ?", [account_id])?;
    for (i, p) in periods.iter().enumerate() {
        tx.execute(
            "INSERT INTO periods(account_id, code, label, start_date, end_date, sort_order)
             VALUES(?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                account_id,
                p.code,
                p.label,
                p.start_date.map(|d| d.format("%Y-%m-%d").to_string()),
                p.end_date.map(|d| d.format("%Y-%m-%d").to_string()),
                i as i64,
            ],
        )?;
    }
    tx.commit()?;
    Ok(())
}

fn parse_stored_date(raw: Option<String>) -> Option<NaiveDate> {
    raw.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok())
}

pub fn list_periods(conn: &Connection, account_id: &str) -> anyhow::Result<Vec<Period>> {
    let mut stmt = conn.prepare(
        "SELECT code, label, start_date, end_date
         FROM periods
         WHERE account_id = ?
         ORDER BY sort_order",
    )?;
    let periods = stmt
        .query_map([account_id], |r| {
            Ok(Period {
                code: r.get(0)?,
                label: r.get(1)?,
                start_date: parse_stored_date(r.get(2)?),
                end_date: parse_stored_date(r.get(3)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(periods)
}

pub fn replace_subject_coefficients(
    conn: &mut Connection,
    account_id: &str,
    coefficients: &[(String, f64)],
) -> anyhow::Result<()> {
    let tx = conn.transaction()?;
    ensure_account(&tx, account_id)?;
    tx.execute(
        "DELETE FROM subject_coefficients WHERE account_id = ?",
        [account_id],
    )?;
    for (code, coef) in coefficients {
        tx.execute(
            "INSERT INTO subject_coefficients(account_id, subject_code, coefficient)
             VALUES(?, ?, ?)",
            (account_id, code, coef),
        )?;
    }
    tx.commit()?;
    Ok(())
}

pub fn list_subject_coefficients(
    conn: &Connection,
    account_id: &str,
) -> anyhow::Result<HashMap<String, f64>> {
    let mut stmt = conn.prepare(
        "SELECT subject_code, coefficient FROM subject_coefficients WHERE account_id = ?",
    )?;
    let rows = stmt
        .query_map([account_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?)))?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}
