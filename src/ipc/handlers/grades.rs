use crate::calc::{self, normalize::ungraded_reason};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, db_conn_mut, load_policy, optional_str, parse_coefficients, parse_entries,
    parse_periods, required_str, ParsedEntries,
};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::collections::BTreeMap;

fn handle_grades_replace(state: &mut AppState, req: &Request) -> serde_json::Value {
    let account_id = match required_str(req, "accountId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(raw) = req.params.get("entries") else {
        return err(&req.id, "bad_params", "missing entries", None);
    };
    let ParsedEntries { entries, rejected } = match parse_entries(raw) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let conn = match db_conn_mut(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let revision = match db::replace_grades(conn, &account_id, &entries) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    let policy = match load_policy(Some(&*conn)) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let batch = calc::normalize_batch(&entries, &policy);
    let entries_rejected = rejected.len();
    let mut warnings = rejected;
    warnings.extend(batch.warnings);
    tracing::info!(
        account = %account_id,
        revision,
        entries = entries.len(),
        warnings = warnings.len(),
        "grade set replaced"
    );

    ok(
        &req.id,
        json!({
            "accountId": account_id,
            "revision": revision,
            "entryCount": entries.len(),
            "gradedCount": batch.grades.len(),
            "ungradedCount": batch.ungraded.len(),
            "rejectedCount": entries_rejected,
            "warnings": warnings,
        }),
    )
}

fn handle_grades_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let account_id = match required_str(req, "accountId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let period_code = match optional_str(req, "periodCode") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let snapshot = match db::load_snapshot(conn, &account_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "account not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let policy = match load_policy(Some(conn)) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut rows = Vec::new();
    for entry in &snapshot.entries {
        if let Some(p) = period_code.as_deref() {
            if entry.period_code != p {
                continue;
            }
        }
        let mut row = json!({ "entry": entry });
        match calc::normalize(entry, &policy) {
            Ok(Some(g)) => {
                row["status"] = json!("graded");
                row["valueOnBasis"] = json!(calc::round_to(g.value_on_basis(), policy.rounding_digits));
            }
            Ok(None) => {
                row["status"] = json!("ungraded");
                row["reason"] = json!(ungraded_reason(entry).unwrap_or(calc::Ungraded::Missing));
            }
            Err(e) => {
                row["status"] = json!("invalid");
                row["error"] = json!(calc::Warning::for_entry(entry, &e));
            }
        }
        rows.push(row);
    }

    ok(
        &req.id,
        json!({
            "accountId": account_id,
            "revision": snapshot.revision,
            "entries": rows,
        }),
    )
}

fn handle_periods_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let account_id = match required_str(req, "accountId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(raw) = req.params.get("periods") else {
        return err(&req.id, "bad_params", "missing periods", None);
    };
    let periods = match parse_periods(raw) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let conn = match db_conn_mut(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = db::replace_periods(conn, &account_id, &periods) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "count": periods.len() }))
}

fn handle_periods_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let account_id = match required_str(req, "accountId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match db::list_periods(conn, &account_id) {
        Ok(periods) => ok(&req.id, json!({ "periods": periods })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_coefficients_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let account_id = match required_str(req, "accountId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(raw) = req.params.get("coefficients") else {
        return err(&req.id, "bad_params", "missing coefficients", None);
    };
    let coefficients = match parse_coefficients(raw) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let conn = match db_conn_mut(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = db::replace_subject_coefficients(conn, &account_id, &coefficients) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "count": coefficients.len() }))
}

fn handle_coefficients_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let account_id = match required_str(req, "accountId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match db::list_subject_coefficients(conn, &account_id) {
        Ok(map) => {
            let sorted: BTreeMap<String, f64> = map.into_iter().collect();
            ok(&req.id, json!({ "coefficients": sorted }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.replace" => Some(handle_grades_replace(state, req)),
        "grades.list" => Some(handle_grades_list(state, req)),
        "periods.set" => Some(handle_periods_set(state, req)),
        "periods.list" => Some(handle_periods_list(state, req)),
        "subjects.coefficients.set" => Some(handle_coefficients_set(state, req)),
        "subjects.coefficients.list" => Some(handle_coefficients_list(state, req)),
        _ => None,
    }
}
