use super::evolution::{compute_evolution, trend, Trend};
use super::normalize::{normalize_batch, NormalizedBatch, UngradedEntry};
use super::period::aggregate_period;
use super::policy::{select_period, Period, Policy};
use super::{EvolutionPoint, GradeEntry, PeriodAverage, Warning};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::HashMap;

/// One immutable snapshot plus the configuration to read it with.
#[derive(Debug, Clone)]
pub struct ReportInput<'a> {
    pub entries: &'a [GradeEntry],
    pub periods: &'a [Period],
    pub subject_coefficients: &'a HashMap<String, f64>,
    pub policy: &'a Policy,
    pub period_code: Option<&'a str>,
    pub today: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodReport {
    pub period_code: String,
    pub period: PeriodAverage,
    pub evolution: Vec<EvolutionPoint>,
    pub trend: Option<Trend>,
    pub ungraded: Vec<UngradedEntry>,
    pub warnings: Vec<Warning>,
}

/// Explicit code first; otherwise auto selection when the policy allows it.
pub fn resolve_period(input: &ReportInput<'_>, batch: &NormalizedBatch) -> Option<String> {
    if let Some(code) = input.period_code {
        return Some(code.to_string());
    }
    if input.policy.auto_period_selection {
        return select_period(input.periods, &batch.grades, input.today);
    }
    None
}

/// Full pipeline: normalize, pick the period, aggregate, replay history.
/// `None` only when no period can be resolved.
pub fn build_period_report(input: &ReportInput<'_>) -> Option<PeriodReport> {
    let batch = normalize_batch(input.entries, input.policy);
    let period_code = resolve_period(input, &batch)?;
    let scoped = batch.for_period(&period_code);

    let period = aggregate_period(&scoped, &period_code, input.subject_coefficients, input.policy);
    let evolution = compute_evolution(&scoped.grades, input.subject_coefficients, input.policy);
    let trend = trend(&evolution, input.policy.rounding_digits);
    tracing::debug!(
        period = %period_code,
        grades = scoped.grades.len(),
        points = evolution.len(),
        "built period report"
    );

    Some(PeriodReport {
        period_code,
        period,
        evolution,
        trend,
        ungraded: scoped.ungraded,
        warnings: scoped.warnings,
    })
}
