use super::display::round_to;
use super::{
    compute_period_average, compute_subject_averages, EvolutionGranularity, EvolutionPoint,
    NormalizedGrade, Policy,
};
use serde::Serialize;
use std::collections::HashMap;

/// Replays the period pipeline over growing date cutoffs.
///
/// Each cutoff is recomputed from scratch over every grade at or before it, so
/// subgroup and coefficient hierarchies stay exact. Cost is quadratic in the
/// number of cutoffs; grade sets per period are small.
pub fn compute_evolution(
    entries: &[NormalizedGrade],
    subject_coefficients: &HashMap<String, f64>,
    policy: &Policy,
) -> Vec<EvolutionPoint> {
    if entries.len() < 2 {
        return Vec::new();
    }

    let mut ordered: Vec<&NormalizedGrade> = entries.iter().collect();
    ordered.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));

    // (exclusive end index into `ordered`, grade that produced the cutoff)
    let cutoffs: Vec<(usize, Option<&str>)> = match policy.evolution_granularity {
        EvolutionGranularity::PerGrade => ordered
            .iter()
            .enumerate()
            .map(|(i, g)| (i + 1, Some(g.id.as_str())))
            .collect(),
        EvolutionGranularity::PerDay => (0..ordered.len())
            .filter(|&i| i + 1 == ordered.len() || ordered[i + 1].date != ordered[i].date)
            .map(|i| (i + 1, None))
            .collect(),
    };

    let mut points = Vec::with_capacity(cutoffs.len());
    for (end, grade_id) in cutoffs {
        let subjects = compute_subject_averages(ordered[..end].iter().copied());
        let period = compute_period_average(&subjects, subject_coefficients, policy);
        let Some(student_value) = period.general_average else {
            continue;
        };
        points.push(EvolutionPoint {
            date: ordered[end - 1].date,
            student_value,
            class_value: period.class_average,
            grade_id: grade_id.map(str::to_string),
        });
    }
    points
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TrendDirection {
    Up,
    Down,
    Flat,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trend {
    pub direction: TrendDirection,
    pub delta: f64,
}

/// Direction of the last move in an evolution series; `None` without two points.
pub fn trend(points: &[EvolutionPoint], digits: u32) -> Option<Trend> {
    let [.., prev, last] = points else {
        return None;
    };
    let delta = round_to(last.student_value - prev.student_value, digits);
    let direction = if delta > 0.0 {
        TrendDirection::Up
    } else if delta < 0.0 {
        TrendDirection::Down
    } else {
        TrendDirection::Flat
    };
    Some(Trend { direction, delta })
}
