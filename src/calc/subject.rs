use super::{NormalizedGrade, SubjectAverage, BASIS};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Subgroup tree for one subject. Grades without a subgroup sit at the root.
#[derive(Debug, Default)]
struct Level<'a> {
    grades: Vec<&'a NormalizedGrade>,
    children: BTreeMap<&'a str, Level<'a>>,
}

impl<'a> Level<'a> {
    fn build<I>(grades: I) -> Self
    where
        I: IntoIterator<Item = &'a NormalizedGrade>,
    {
        let mut root = Level::default();
        for g in grades {
            let mut node = &mut root;
            for seg in g.subgroup_path() {
                node = node.children.entry(seg).or_default();
            }
            node.grades.push(g);
        }
        root
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Student,
    Class,
}

impl Side {
    fn value(self, g: &NormalizedGrade) -> Option<f64> {
        match self {
            Side::Student => Some(g.value_on_basis()),
            Side::Class => g.class_value_on_basis(),
        }
    }
}

/// A mean on the /20 basis, the coefficient it carries into its parent and the
/// number of entries that went into it.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Part {
    value: f64,
    weight: f64,
    count: usize,
}

/// Result of one level. A level without any regular grade has no mean of its
/// own; its optional grades and bonus points are handed to the parent.
#[derive(Debug, Default)]
struct Eval {
    part: Option<Part>,
    optional: Vec<Part>,
    bonus_points: f64,
    bonus_count: usize,
}

fn evaluate(level: &Level<'_>, side: Side, root: bool) -> Eval {
    let mut regular: Vec<Part> = Vec::new();
    let mut optional: Vec<Part> = Vec::new();
    let mut bonus_points = 0.0_f64;
    let mut bonus_count = 0_usize;

    for g in &level.grades {
        let Some(value) = side.value(g) else {
            continue;
        };
        if g.bonus {
            let above = value - BASIS / 2.0;
            if above > 0.0 {
                bonus_points += above * g.coefficient;
                bonus_count += 1;
            }
            continue;
        }
        let part = Part {
            value,
            weight: g.coefficient,
            count: 1,
        };
        if g.optional {
            optional.push(part);
        } else {
            regular.push(part);
        }
    }
    for child in level.children.values() {
        let sub = evaluate(child, side, false);
        regular.extend(sub.part);
        optional.extend(sub.optional);
        bonus_points += sub.bonus_points;
        bonus_count += sub.bonus_count;
    }

    let mut sum: f64 = regular.iter().map(|p| p.value * p.weight).sum();
    let mut weight: f64 = regular.iter().map(|p| p.weight).sum();
    let mut count: usize = regular.iter().map(|p| p.count).sum();

    if weight <= 0.0 && !root {
        return Eval {
            part: None,
            optional,
            bonus_points,
            bonus_count,
        };
    }

    // Best optional grades first; stop at the first one that would not help.
    optional.sort_by(|a, b| b.value.partial_cmp(&a.value).unwrap_or(Ordering::Equal));
    for p in optional {
        if weight > 0.0 && p.value <= sum / weight {
            break;
        }
        sum += p.value * p.weight;
        weight += p.weight;
        count += p.count;
    }

    if weight <= 0.0 {
        return Eval::default();
    }
    Eval {
        part: Some(Part {
            value: ((sum + bonus_points) / weight).min(BASIS),
            weight,
            count: count + bonus_count,
        }),
        ..Eval::default()
    }
}

/// Coefficient-weighted mean of one subject's grades within one period, on a
/// /20 basis. All entries are expected to share the same subject and period;
/// the codes of the first one label the result. `grade_count` counts the
/// entries that went into the student average: skipped optional grades and
/// bonus grades that added nothing are left out.
pub fn compute_subject_average(entries: &[NormalizedGrade]) -> SubjectAverage {
    let (subject_code, period_code) = entries
        .first()
        .map(|g| (g.subject_code.as_str(), g.period_code.as_str()))
        .unwrap_or(("", ""));
    let tree = Level::build(entries);
    let student = evaluate(&tree, Side::Student, true).part;
    SubjectAverage {
        subject_code: subject_code.to_string(),
        period_code: period_code.to_string(),
        average: student.map(|p| p.value),
        class_average: evaluate(&tree, Side::Class, true).part.map(|p| p.value),
        grade_count: student.map_or(0, |p| p.count),
    }
}

/// Groups grades by subject and aggregates each group.
pub fn compute_subject_averages<'a, I>(grades: I) -> BTreeMap<String, SubjectAverage>
where
    I: IntoIterator<Item = &'a NormalizedGrade>,
{
    let mut by_subject: BTreeMap<String, Vec<NormalizedGrade>> = BTreeMap::new();
    for g in grades {
        by_subject
            .entry(g.subject_code.clone())
            .or_default()
            .push(g.clone());
    }
    by_subject
        .into_iter()
        .map(|(code, group)| (code, compute_subject_average(&group)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn g(id: &str, value: f64, scale: f64, coefficient: f64) -> NormalizedGrade {
        NormalizedGrade {
            id: id.to_string(),
            subject_code: "MATHS".to_string(),
            period_code: "T1".to_string(),
            numeric_value: value,
            scale,
            coefficient,
            date: NaiveDate::from_ymd_opt(2026, 1, 10).expect("date"),
            subgroup_id: None,
            class_value: None,
            optional: false,
            bonus: false,
        }
    }

    fn in_group(mut grade: NormalizedGrade, subgroup: &str) -> NormalizedGrade {
        grade.subgroup_id = Some(subgroup.to_string());
        grade
    }

    fn assert_close(actual: Option<f64>, expected: f64) {
        let a = actual.expect("average present");
        assert!((a - expected).abs() < 1e-9, "expected {}, got {}", expected, a);
    }

    #[test]
    fn weighted_mean_of_plain_grades() {
        let avg = compute_subject_average(&[g("a", 16.5, 20.0, 4.0), g("b", 12.0, 20.0, 2.0)]);
        assert_close(avg.average, 15.0);
        assert_eq!(avg.grade_count, 2);
        assert_eq!(avg.subject_code, "MATHS");
    }

    #[test]
    fn equal_coefficients_reduce_to_arithmetic_mean() {
        let values = [7.0, 11.5, 18.0, 13.25];
        let grades: Vec<_> = values
            .iter()
            .enumerate()
            .map(|(i, v)| g(&i.to_string(), *v, 20.0, 3.0))
            .collect();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        assert_close(compute_subject_average(&grades).average, mean);
    }

    #[test]
    fn mixed_scales_are_rescaled_before_weighting() {
        let avg = compute_subject_average(&[g("a", 8.0, 10.0, 1.0), g("b", 16.0, 20.0, 1.0)]);
        assert_close(avg.average, 16.0);
    }

    #[test]
    fn empty_subject_is_null_not_zero() {
        let avg = compute_subject_average(&[]);
        assert_eq!(avg.average, None);
        assert_eq!(avg.class_average, None);
        assert_eq!(avg.grade_count, 0);
    }

    #[test]
    fn subgroup_is_averaged_first_with_summed_coefficient() {
        // oral: (10*1 + 14*1)/2 = 12, weight 2; written: 18, weight 1.
        let grades = vec![
            in_group(g("o1", 10.0, 20.0, 1.0), "oral"),
            in_group(g("o2", 14.0, 20.0, 1.0), "oral"),
            g("w1", 18.0, 20.0, 1.0),
        ];
        assert_close(compute_subject_average(&grades).average, (12.0 * 2.0 + 18.0) / 3.0);
    }

    #[test]
    fn nested_subgroups_recurse() {
        // essays = (20*1 + 10*3)/4 = 12.5 weight 4; written = (12.5*4 + 5*1)/5 = 11 weight 5.
        let grades = vec![
            in_group(g("e1", 20.0, 20.0, 1.0), "written/essays"),
            in_group(g("e2", 10.0, 20.0, 3.0), "written/essays"),
            in_group(g("w1", 5.0, 20.0, 1.0), "written"),
            g("x", 16.0, 20.0, 5.0),
        ];
        assert_close(compute_subject_average(&grades).average, (11.0 * 5.0 + 16.0 * 5.0) / 10.0);
    }

    #[test]
    fn class_average_ignores_entries_without_class_value() {
        let mut a = g("a", 12.0, 20.0, 1.0);
        a.class_value = Some(5.0);
        let b = g("b", 16.0, 20.0, 1.0);
        let mut c = g("c", 4.0, 10.0, 1.0);
        c.class_value = Some(6.0);
        let avg = compute_subject_average(&[a, b, c]);
        assert_close(avg.average, (12.0 + 16.0 + 8.0) / 3.0);
        assert_close(avg.class_average, (5.0 + 12.0) / 2.0);
    }

    #[test]
    fn optional_grade_counts_only_when_it_helps() {
        let mut good = g("opt-good", 18.0, 20.0, 1.0);
        good.optional = true;
        let mut bad = g("opt-bad", 6.0, 20.0, 1.0);
        bad.optional = true;
        let avg = compute_subject_average(&[g("a", 10.0, 20.0, 1.0), good, bad]);
        assert_close(avg.average, 14.0);
        assert_eq!(avg.grade_count, 2);
    }

    #[test]
    fn bonus_adds_points_above_half_without_weight() {
        let mut bonus = g("bonus", 16.0, 20.0, 1.0);
        bonus.bonus = true;
        let avg = compute_subject_average(&[g("a", 12.0, 20.0, 2.0), bonus.clone()]);
        // (12*2 + (16-10)*1) / 2
        assert_close(avg.average, 15.0);

        let only_bonus = compute_subject_average(&[bonus]);
        assert_eq!(only_bonus.average, None);
        assert_eq!(only_bonus.grade_count, 0);
    }

    #[test]
    fn optional_grade_alone_in_a_subgroup_is_tested_against_the_parent() {
        let mut weak = in_group(g("o1", 4.0, 20.0, 1.0), "oral");
        weak.optional = true;
        let avg = compute_subject_average(&[g("w1", 16.0, 20.0, 1.0), weak.clone()]);
        assert_close(avg.average, 16.0);
        assert_eq!(avg.grade_count, 1);

        let mut strong = in_group(g("o2", 18.0, 20.0, 1.0), "oral/debate");
        strong.optional = true;
        let avg = compute_subject_average(&[g("w1", 10.0, 20.0, 1.0), weak, strong]);
        assert_close(avg.average, 14.0);
        assert_eq!(avg.grade_count, 2);
    }

    #[test]
    fn subject_of_only_optional_grades_keeps_the_best_ones() {
        let mut a = g("a", 12.0, 20.0, 1.0);
        a.optional = true;
        let mut b = in_group(g("b", 8.0, 20.0, 1.0), "oral");
        b.optional = true;
        let avg = compute_subject_average(&[a, b]);
        assert_close(avg.average, 12.0);
        assert_eq!(avg.grade_count, 1);
    }

    #[test]
    fn grade_count_matches_entries_used() {
        let mut bonus = g("bonus", 14.0, 20.0, 1.0);
        bonus.bonus = true;
        let mut useless_bonus = g("bonus-low", 6.0, 20.0, 1.0);
        useless_bonus.bonus = true;
        let avg = compute_subject_average(&[
            in_group(g("o1", 10.0, 20.0, 1.0), "oral"),
            in_group(g("o2", 12.0, 20.0, 1.0), "oral"),
            g("w1", 14.0, 20.0, 2.0),
            bonus,
            useless_bonus,
        ]);
        // oral 11 weight 2, w1 14 weight 2 -> 12.5, plus (14 - 10) / 4 = 13.5.
        assert_close(avg.average, 13.5);
        assert_eq!(avg.grade_count, 4);
    }

    #[test]
    fn groups_by_subject_in_code_order() {
        let mut hist = g("h", 9.0, 20.0, 1.0);
        hist.subject_code = "HIST".to_string();
        let out = compute_subject_averages(&[g("m", 12.0, 20.0, 1.0), hist]);
        let codes: Vec<&str> = out.keys().map(String::as_str).collect();
        assert_eq!(codes, vec!["HIST", "MATHS"]);
        assert_close(out["HIST"].average, 9.0);
    }
}
