use crate::calc::{self, report::PeriodReport, GradeEntry, Policy};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    optional_str, parse_today, resolve_policy, resolve_snapshot, Snapshot,
};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

struct Computed {
    revision: Option<i64>,
    policy: Policy,
    report: Option<PeriodReport>,
}

/// Shared front half of every calc method: one snapshot, one policy, one run.
fn run_report(state: &AppState, req: &Request) -> Result<Computed, serde_json::Value> {
    let Snapshot {
        revision,
        entries,
        periods,
        subject_coefficients,
        rejected,
    } = resolve_snapshot(state, req)?;
    let policy = resolve_policy(state, req)?;
    let period_code = optional_str(req, "periodCode")?.filter(|s| !s.is_empty());
    if period_code.is_none() && !policy.auto_period_selection {
        return Err(err(
            &req.id,
            "bad_params",
            "missing periodCode (auto period selection is off)",
            None,
        ));
    }
    let today = parse_today(req)?;

    let input = calc::report::ReportInput {
        entries: &entries,
        periods: &periods,
        subject_coefficients: &subject_coefficients,
        policy: &policy,
        period_code: period_code.as_deref(),
        today,
    };
    let mut report = calc::report::build_period_report(&input);
    if let Some(r) = report.as_mut() {
        let code = r.period_code.clone();
        r.warnings.extend(
            rejected
                .into_iter()
                .filter(|w| w.period_code.as_deref().map_or(true, |p| p == code)),
        );
    }
    Ok(Computed {
        revision,
        policy,
        report,
    })
}

fn handle_normalize(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(raw) = req.params.get("entry") else {
        return err(&req.id, "bad_params", "missing entry", None);
    };
    let entry: GradeEntry = match serde_json::from_value(raw.clone()) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "bad_params", format!("invalid entry: {}", e), None),
    };
    let policy = match resolve_policy(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let result = match calc::normalize(&entry, &policy) {
        Ok(Some(grade)) => json!({ "status": "graded", "grade": grade }),
        Ok(None) => json!({
            "status": "ungraded",
            "reason": calc::normalize::ungraded_reason(&entry).unwrap_or(calc::Ungraded::Missing)
        }),
        Err(e) => json!({ "status": "invalid", "error": calc::Warning::for_entry(&entry, &e) }),
    };
    ok(&req.id, result)
}

fn handle_subject_averages(state: &mut AppState, req: &Request) -> serde_json::Value {
    let computed = match run_report(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(report) = computed.report else {
        return ok(
            &req.id,
            json!({
                "revision": computed.revision,
                "periodCode": null,
                "subjects": [],
                "ungraded": [],
                "warnings": [],
            }),
        );
    };
    let subjects: Vec<_> = report.period.subject_averages.values().collect();
    ok(
        &req.id,
        json!({
            "revision": computed.revision,
            "periodCode": report.period_code,
            "subjects": subjects,
            "ungraded": report.ungraded,
            "warnings": report.warnings,
        }),
    )
}

fn handle_period_average(state: &mut AppState, req: &Request) -> serde_json::Value {
    let computed = match run_report(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(report) = computed.report else {
        return ok(
            &req.id,
            json!({
                "revision": computed.revision,
                "periodCode": null,
                "period": null,
                "generalAverageDisplay": calc::format_average(None),
                "ungraded": [],
                "warnings": [],
            }),
        );
    };
    ok(
        &req.id,
        json!({
            "revision": computed.revision,
            "periodCode": report.period_code,
            "generalAverageDisplay": calc::format_average(report.period.general_average),
            "period": report.period,
            "ungraded": report.ungraded,
            "warnings": report.warnings,
        }),
    )
}

fn handle_evolution(state: &mut AppState, req: &Request) -> serde_json::Value {
    let computed = match run_report(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let granularity = computed.policy.evolution_granularity;
    let (period_code, points, trend) = match computed.report {
        Some(r) => (Some(r.period_code), r.evolution, r.trend),
        None => (None, Vec::new(), None),
    };
    ok(
        &req.id,
        json!({
            "revision": computed.revision,
            "periodCode": period_code,
            "granularity": granularity,
            "points": points,
            "trend": trend,
        }),
    )
}

fn handle_widget_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let computed = match run_report(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let period_code = computed.report.as_ref().map(|r| r.period_code.clone());
    let general = computed
        .report
        .as_ref()
        .and_then(|r| r.period.general_average);
    let class = computed.report.as_ref().and_then(|r| r.period.class_average);
    let trend = computed.report.as_ref().and_then(|r| r.trend);
    ok(
        &req.id,
        json!({
            "revision": computed.revision,
            "periodCode": period_code,
            "generalAverage": general,
            "display": calc::format_average(general),
            "classDisplay": calc::format_average(class),
            "trend": trend,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "calc.normalize" => Some(handle_normalize(state, req)),
        "calc.subjectAverages" => Some(handle_subject_averages(state, req)),
        "calc.periodAverage" => Some(handle_period_average(state, req)),
        "calc.evolution" => Some(handle_evolution(state, req)),
        "widget.summary" => Some(handle_widget_summary(state, req)),
        _ => None,
    }
}
