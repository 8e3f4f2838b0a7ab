use super::display::round_to;
use super::{NormalizedBatch, PeriodAverage, Policy, SubjectAverage};
use std::collections::{BTreeMap, HashMap};

/// Coefficient used for subjects absent from the configuration.
pub const DEFAULT_SUBJECT_COEFFICIENT: f64 = 1.0;

fn subject_coefficient(coefficients: &HashMap<String, f64>, subject_code: &str) -> f64 {
    coefficients
        .get(subject_code)
        .copied()
        .filter(|c| c.is_finite() && *c >= 0.0)
        .unwrap_or(DEFAULT_SUBJECT_COEFFICIENT)
}

fn weighted_mean<'a, I, F>(subjects: I, coefficients: &HashMap<String, f64>, pick: F) -> Option<f64>
where
    I: IntoIterator<Item = &'a SubjectAverage>,
    F: Fn(&SubjectAverage) -> Option<f64>,
{
    let mut sum = 0.0_f64;
    let mut denom = 0.0_f64;
    for s in subjects {
        let Some(avg) = pick(s) else {
            continue;
        };
        let coef = subject_coefficient(coefficients, &s.subject_code);
        if coef <= 0.0 {
            continue;
        }
        sum += avg * coef;
        denom += coef;
    }
    if denom > 0.0 {
        Some(sum / denom)
    } else {
        None
    }
}

fn rounded(s: &SubjectAverage, digits: u32) -> SubjectAverage {
    SubjectAverage {
        average: s.average.map(|v| round_to(v, digits)),
        class_average: s.class_average.map(|v| round_to(v, digits)),
        ..s.clone()
    }
}

/// General and class averages for one period.
///
/// Subjects with a null average drop out of both numerator and denominator.
/// Rounding applies to the returned values only; the means are taken over the
/// unrounded subject averages.
pub fn compute_period_average(
    subject_averages: &BTreeMap<String, SubjectAverage>,
    subject_coefficients: &HashMap<String, f64>,
    policy: &Policy,
) -> PeriodAverage {
    let digits = policy.rounding_digits;
    let general = weighted_mean(subject_averages.values(), subject_coefficients, |s| s.average);
    let class = weighted_mean(subject_averages.values(), subject_coefficients, |s| {
        s.class_average
    });
    let period_code = subject_averages
        .values()
        .next()
        .map(|s| s.period_code.clone())
        .unwrap_or_default();

    PeriodAverage {
        period_code,
        general_average: general.map(|v| round_to(v, digits)),
        class_average: class.map(|v| round_to(v, digits)),
        subject_averages: subject_averages
            .iter()
            .map(|(code, s)| (code.clone(), rounded(s, digits)))
            .collect(),
    }
}

/// Runs the subject and period stages over one period's slice of a batch.
/// Subjects that only hold ungraded entries stay listed with a null average.
pub fn aggregate_period(
    batch: &NormalizedBatch,
    period_code: &str,
    subject_coefficients: &HashMap<String, f64>,
    policy: &Policy,
) -> PeriodAverage {
    let mut subjects = super::compute_subject_averages(
        batch.grades.iter().filter(|g| g.period_code == period_code),
    );
    for u in batch.ungraded.iter().filter(|u| u.period_code == period_code) {
        subjects
            .entry(u.subject_code.clone())
            .or_insert_with(|| SubjectAverage::empty(&u.subject_code, period_code));
    }
    let mut out = compute_period_average(&subjects, subject_coefficients, policy);
    out.period_code = period_code.to_string();
    out
}
