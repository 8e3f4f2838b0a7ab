use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, load_policy, POLICY_KEY};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_policy_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match load_policy(Some(conn)) {
        Ok(policy) => ok(&req.id, json!({ "policy": policy })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_policy_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_policy(Some(conn)) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = current.apply_patch(patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, POLICY_KEY, &current.to_json()) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    tracing::info!(?current, "policy updated");
    ok(&req.id, json!({ "policy": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "policy.get" => Some(handle_policy_get(state, req)),
        "policy.update" => Some(handle_policy_update(state, req)),
        _ => None,
    }
}
