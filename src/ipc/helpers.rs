use crate::calc::{GradeEntry, Period, Policy, Warning};
use crate::db;
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::json;
use std::collections::{HashMap, HashSet};

pub const POLICY_KEY: &str = "policy";

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn optional_str(req: &Request, key: &str) -> Result<Option<String>, serde_json::Value> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.trim().to_string()))
            .ok_or_else(|| err(&req.id, "bad_params", format!("{} must be string", key), None)),
    }
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn db_conn_mut<'a>(
    state: &'a mut AppState,
    req: &Request,
) -> Result<&'a mut Connection, serde_json::Value> {
    state
        .db
        .as_mut()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn load_policy(conn: Option<&Connection>) -> anyhow::Result<Policy> {
    let Some(conn) = conn else {
        return Ok(Policy::default());
    };
    let saved = db::settings_get_json(conn, POLICY_KEY)?;
    Ok(Policy::from_saved(saved.as_ref()))
}

/// Stored policy (or defaults without a workspace), overlaid with an optional
/// per-request `params.policy` patch. The stored policy is never changed here.
pub fn resolve_policy(state: &AppState, req: &Request) -> Result<Policy, serde_json::Value> {
    let mut policy = load_policy(state.db.as_ref())
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    match req.params.get("policy") {
        None => {}
        Some(v) if v.is_null() => {}
        Some(v) => {
            let Some(patch) = v.as_object() else {
                return Err(err(&req.id, "bad_params", "policy must be an object", None));
            };
            policy
                .apply_patch(patch)
                .map_err(|msg| err(&req.id, "bad_params", msg, None))?;
        }
    }
    Ok(policy)
}

pub fn parse_today(req: &Request) -> Result<NaiveDate, serde_json::Value> {
    match req.params.get("today").and_then(|v| v.as_str()) {
        None => Ok(chrono::Local::now().date_naive()),
        Some(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| {
            err(&req.id, "bad_params", "today must be YYYY-MM-DD", None)
        }),
    }
}

/// Entries that survived parsing, plus a warning for each element that could
/// not be read as a grade record at all.
#[derive(Debug, Clone, Default)]
pub struct ParsedEntries {
    pub entries: Vec<GradeEntry>,
    pub rejected: Vec<Warning>,
}

/// Parses element by element so one malformed record never sinks the batch.
/// Only a missing, empty or duplicate `id` is fatal: there is nothing to report
/// the problem against.
pub fn parse_entries(v: &serde_json::Value) -> Result<ParsedEntries, String> {
    let Some(items) = v.as_array() else {
        return Err("entries must be an array".to_string());
    };
    let mut out = ParsedEntries::default();
    let mut seen: HashSet<String> = HashSet::new();
    for (i, item) in items.iter().enumerate() {
        let id = item
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("entries[{}]: id must be a non-empty string", i))?;
        if !seen.insert(id.to_string()) {
            return Err(format!("duplicate entry id: {}", id));
        }
        match serde_json::from_value::<GradeEntry>(item.clone()) {
            Ok(entry) => out.entries.push(entry),
            Err(e) => {
                tracing::warn!(entry_id = %id, "rejecting malformed grade record: {}", e);
                out.rejected.push(Warning {
                    entry_id: id.to_string(),
                    period_code: item
                        .get("periodCode")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    code: "malformed_entry".to_string(),
                    message: format!("grade {}: {}", id, e),
                });
            }
        }
    }
    Ok(out)
}

pub fn parse_periods(v: &serde_json::Value) -> Result<Vec<Period>, String> {
    if !v.is_array() {
        return Err("periods must be an array".to_string());
    }
    let periods: Vec<Period> =
        serde_json::from_value(v.clone()).map_err(|e| format!("invalid periods: {}", e))?;
    let mut seen: HashSet<&str> = HashSet::new();
    for p in &periods {
        if p.code.trim().is_empty() {
            return Err("period code must not be empty".to_string());
        }
        if !seen.insert(p.code.as_str()) {
            return Err(format!("duplicate period code: {}", p.code));
        }
        if let (Some(start), Some(end)) = (p.start_date, p.end_date) {
            if end < start {
                return Err(format!("period {} ends before it starts", p.code));
            }
        }
    }
    Ok(periods)
}

/// Subject code → coefficient. Zero is allowed (subject shown but not
/// counted); negative or non-numeric values are rejected.
pub fn parse_coefficients(v: &serde_json::Value) -> Result<Vec<(String, f64)>, String> {
    let Some(obj) = v.as_object() else {
        return Err("coefficients must be an object".to_string());
    };
    let mut out = Vec::with_capacity(obj.len());
    for (code, raw) in obj {
        let Some(n) = raw.as_f64() else {
            return Err(format!("coefficient for {} must be a number", code));
        };
        if !n.is_finite() || n < 0.0 {
            return Err(format!("coefficient for {} must be >= 0", code));
        }
        out.push((code.clone(), n));
    }
    Ok(out)
}

/// Everything a calc request needs, read once.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub revision: Option<i64>,
    pub entries: Vec<GradeEntry>,
    pub periods: Vec<Period>,
    pub subject_coefficients: HashMap<String, f64>,
    pub rejected: Vec<Warning>,
}

/// Inline `params.entries` wins; otherwise the stored snapshot of
/// `params.accountId`, checked against `params.expectedRevision`.
pub fn resolve_snapshot(state: &AppState, req: &Request) -> Result<Snapshot, serde_json::Value> {
    if let Some(raw) = req.params.get("entries") {
        let ParsedEntries { entries, rejected } =
            parse_entries(raw).map_err(|msg| err(&req.id, "bad_params", msg, None))?;
        let periods = match req.params.get("periods") {
            None => Vec::new(),
            Some(v) => parse_periods(v).map_err(|msg| err(&req.id, "bad_params", msg, None))?,
        };
        let subject_coefficients = match req.params.get("subjectCoefficients") {
            None => HashMap::new(),
            Some(v) => parse_coefficients(v)
                .map_err(|msg| err(&req.id, "bad_params", msg, None))?
                .into_iter()
                .collect(),
        };
        return Ok(Snapshot {
            revision: None,
            entries,
            periods,
            subject_coefficients,
            rejected,
        });
    }

    let account_id = required_str(req, "accountId")?;
    let expected_revision = match req.params.get("expectedRevision") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => Some(v.as_i64().ok_or_else(|| {
            err(&req.id, "bad_params", "expectedRevision must be an integer", None)
        })?),
    };
    let conn = db_conn(state, req)?;
    let snapshot = db::load_snapshot(conn, &account_id)
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let Some(snapshot) = snapshot else {
        return Err(err(&req.id, "not_found", "account not found", None));
    };
    if let Some(expected) = expected_revision {
        if expected != snapshot.revision {
            return Err(err(
                &req.id,
                "stale_snapshot",
                "grade set changed since the requested revision",
                Some(json!({ "expected": expected, "current": snapshot.revision })),
            ));
        }
    }
    let periods = db::list_periods(conn, &account_id)
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let subject_coefficients = db::list_subject_coefficients(conn, &account_id)
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    Ok(Snapshot {
        revision: Some(snapshot.revision),
        entries: snapshot.entries,
        periods,
        subject_coefficients,
        rejected: Vec::new(),
    })
}
