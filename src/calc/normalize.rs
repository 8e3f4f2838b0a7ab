use super::{GradeEntry, NormalizedGrade, Policy, ValidationError, Warning};
use chrono::NaiveDate;
use serde::Serialize;

/// Why an entry carries no numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Ungraded {
    Missing,
    Absent,
    Exempt,
    NotGraded,
    NotReturned,
    Unfit,
}

impl Ungraded {
    /// Whether `includeUngradedAsZero` turns this entry into a zero. Exemptions
    /// and "not graded" marks never count.
    pub fn counts_as_zero(self) -> bool {
        matches!(self, Self::Missing | Self::Absent | Self::NotReturned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParsedValue {
    Number(f64),
    Ungraded(Ungraded),
}

fn fold_sentinel(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '.' | '-' | '_' | '/'))
        .map(|c| match c {
            'é' | 'è' | 'ê' | 'É' | 'È' | 'Ê' => 'e',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

fn sentinel(raw: &str) -> Option<Ungraded> {
    match fold_sentinel(raw).as_str() {
        "" => Some(Ungraded::Missing),
        "abs" | "absent" => Some(Ungraded::Absent),
        "disp" | "dispense" => Some(Ungraded::Exempt),
        "nonnote" | "nnot" | "nn" => Some(Ungraded::NotGraded),
        "nonrendu" | "nr" => Some(Ungraded::NotReturned),
        "inapte" | "inap" => Some(Ungraded::Unfit),
        _ => None,
    }
}

/// `None` means the text is neither a number nor a known sentinel.
fn parse_value(raw: Option<&str>) -> Option<ParsedValue> {
    let Some(raw) = raw else {
        return Some(ParsedValue::Ungraded(Ungraded::Missing));
    };
    let t = raw.trim();
    if let Ok(v) = t.replace(',', ".").parse::<f64>() {
        return v.is_finite().then_some(ParsedValue::Number(v));
    }
    sentinel(t).map(ParsedValue::Ungraded)
}

/// ISO `YYYY-MM-DD` (a `T` or space separated time part is ignored) or
/// `DD/MM/YYYY`.
pub fn parse_grade_date(raw: &str) -> Option<NaiveDate> {
    let t = raw.trim();
    if let (Some(prefix), Some(rest)) = (t.get(..10), t.get(10..)) {
        if rest.is_empty() || rest.starts_with('T') || rest.starts_with(' ') {
            if let Ok(d) = NaiveDate::parse_from_str(prefix, "%Y-%m-%d") {
                return Some(d);
            }
        }
    }
    NaiveDate::parse_from_str(t, "%d/%m/%Y").ok()
}

/// Reason an entry is left out of averaging, if it is a recognized sentinel.
pub fn ungraded_reason(entry: &GradeEntry) -> Option<Ungraded> {
    match parse_value(entry.value.as_deref()) {
        Some(ParsedValue::Ungraded(reason)) => Some(reason),
        _ => None,
    }
}

fn in_range(v: f64, scale: f64) -> bool {
    (0.0..=scale).contains(&v)
}

/// Class value on the entry's own scale. `Err(())` when the text is present but
/// unusable; only the class side is dropped in that case.
fn parse_class_value(entry: &GradeEntry) -> Result<Option<f64>, ()> {
    if entry.class_value.is_none() {
        return Ok(None);
    }
    match parse_value(entry.class_value.as_deref()) {
        Some(ParsedValue::Number(v)) if in_range(v, entry.scale) => Ok(Some(v)),
        Some(ParsedValue::Ungraded(_)) => Ok(None),
        _ => Err(()),
    }
}

pub fn normalize(
    entry: &GradeEntry,
    policy: &Policy,
) -> Result<Option<NormalizedGrade>, ValidationError> {
    let raw = entry.value.clone().unwrap_or_default();
    let numeric_value = match parse_value(entry.value.as_deref()) {
        None => {
            return Err(ValidationError::MalformedValue {
                entry_id: entry.id.clone(),
                raw,
            })
        }
        Some(ParsedValue::Ungraded(reason)) => {
            if policy.include_ungraded_as_zero && reason.counts_as_zero() {
                0.0
            } else {
                return Ok(None);
            }
        }
        Some(ParsedValue::Number(v)) => v,
    };

    if !(entry.scale.is_finite() && entry.scale > 0.0) {
        return Err(ValidationError::InvalidScale {
            entry_id: entry.id.clone(),
            scale: entry.scale,
        });
    }
    if !(entry.coefficient.is_finite() && entry.coefficient > 0.0) {
        return Err(ValidationError::InvalidCoefficient {
            entry_id: entry.id.clone(),
            coefficient: entry.coefficient,
        });
    }
    if !in_range(numeric_value, entry.scale) {
        return Err(ValidationError::InvalidRange {
            entry_id: entry.id.clone(),
            value: numeric_value,
            scale: entry.scale,
        });
    }
    let Some(date) = parse_grade_date(&entry.date) else {
        return Err(ValidationError::MalformedDate {
            entry_id: entry.id.clone(),
            raw: entry.date.clone(),
        });
    };

    Ok(Some(NormalizedGrade {
        id: entry.id.clone(),
        subject_code: entry.subject_code.clone(),
        period_code: entry.period_code.clone(),
        numeric_value,
        scale: entry.scale,
        coefficient: entry.coefficient,
        date,
        subgroup_id: entry.subgroup_id.clone(),
        class_value: parse_class_value(entry).unwrap_or(None),
        optional: entry.optional,
        bonus: entry.bonus,
    }))
}

/// An entry kept for display but excluded from every average.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UngradedEntry {
    pub entry_id: String,
    pub subject_code: String,
    pub period_code: String,
    pub reason: Ungraded,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedBatch {
    pub grades: Vec<NormalizedGrade>,
    pub ungraded: Vec<UngradedEntry>,
    pub warnings: Vec<Warning>,
}

impl NormalizedBatch {
    pub fn for_period(&self, period_code: &str) -> NormalizedBatch {
        NormalizedBatch {
            grades: self
                .grades
                .iter()
                .filter(|g| g.period_code == period_code)
                .cloned()
                .collect(),
            ungraded: self
                .ungraded
                .iter()
                .filter(|u| u.period_code == period_code)
                .cloned()
                .collect(),
            warnings: self
                .warnings
                .iter()
                .filter(|w| w.period_code.as_deref().map_or(true, |p| p == period_code))
                .cloned()
                .collect(),
        }
    }
}

/// Normalizes a whole snapshot. Bad entries are dropped with a warning, they
/// never abort the batch.
pub fn normalize_batch(entries: &[GradeEntry], policy: &Policy) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    for entry in entries {
        match normalize(entry, policy) {
            Ok(Some(grade)) => {
                if entry.class_value.is_some() && parse_class_value(entry).is_err() {
                    tracing::warn!(entry_id = %entry.id, "dropping unusable class value");
                    batch.warnings.push(Warning {
                        entry_id: entry.id.clone(),
                        period_code: Some(entry.period_code.clone()),
                        code: "class_value_dropped".to_string(),
                        message: format!(
                            "grade {}: class value {:?} ignored",
                            entry.id,
                            entry.class_value.as_deref().unwrap_or_default()
                        ),
                    });
                }
                batch.grades.push(grade);
            }
            Ok(None) => batch.ungraded.push(UngradedEntry {
                entry_id: entry.id.clone(),
                subject_code: entry.subject_code.clone(),
                period_code: entry.period_code.clone(),
                reason: ungraded_reason(entry).unwrap_or(Ungraded::Missing),
            }),
            Err(e) => {
                tracing::warn!(entry_id = %entry.id, code = e.code(), "excluding grade: {}", e);
                batch.warnings.push(Warning::for_entry(entry, &e));
            }
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, value: Option<&str>, scale: f64, coefficient: f64) -> GradeEntry {
        GradeEntry {
            id: id.to_string(),
            subject_code: "FRAN".to_string(),
            subject_label: "Français".to_string(),
            period_code: "T1".to_string(),
            value: value.map(str::to_string),
            scale,
            coefficient,
            date: "2026-01-10".to_string(),
            subgroup_id: None,
            class_value: None,
            optional: false,
            bonus: false,
        }
    }

    #[test]
    fn accepts_both_decimal_separators() {
        let p = Policy::default();
        let comma = normalize(&entry("a", Some("16,5"), 20.0, 4.0), &p)
            .expect("valid")
            .expect("graded");
        let dot = normalize(&entry("b", Some(" 16.5 "), 20.0, 4.0), &p)
            .expect("valid")
            .expect("graded");
        assert_eq!(comma.numeric_value, 16.5);
        assert_eq!(dot.numeric_value, 16.5);
    }

    #[test]
    fn does_not_rescale_non_twenty_scales() {
        let g = normalize(&entry("a", Some("8"), 10.0, 1.0), &Policy::default())
            .expect("valid")
            .expect("graded");
        assert_eq!(g.numeric_value, 8.0);
        assert_eq!(g.scale, 10.0);
        assert_eq!(g.value_on_basis(), 16.0);
    }

    #[test]
    fn sentinels_are_excluded_not_errors() {
        let p = Policy::default();
        for raw in [None, Some(""), Some("Abs"), Some("Dispensé"), Some("N.Not"), Some("Non rendu"), Some("inapte")] {
            let res = normalize(&entry("a", raw, 20.0, 1.0), &p).expect("not an error");
            assert!(res.is_none(), "expected {:?} to be ungraded", raw);
        }
    }

    #[test]
    fn ungraded_as_zero_only_for_accountable_reasons() {
        let p = Policy {
            include_ungraded_as_zero: true,
            ..Policy::default()
        };
        let absent = normalize(&entry("a", Some("ABS"), 20.0, 1.0), &p)
            .expect("valid")
            .expect("counted as zero");
        assert_eq!(absent.numeric_value, 0.0);
        let exempt = normalize(&entry("b", Some("Disp"), 20.0, 1.0), &p).expect("valid");
        assert!(exempt.is_none());
    }

    #[test]
    fn rejects_out_of_range_and_bad_coefficients() {
        let p = Policy::default();
        assert!(matches!(
            normalize(&entry("a", Some("21"), 20.0, 1.0), &p),
            Err(ValidationError::InvalidRange { .. })
        ));
        assert!(matches!(
            normalize(&entry("a", Some("-1"), 20.0, 1.0), &p),
            Err(ValidationError::InvalidRange { .. })
        ));
        assert!(matches!(
            normalize(&entry("a", Some("12"), 20.0, 0.0), &p),
            Err(ValidationError::InvalidCoefficient { .. })
        ));
        assert!(matches!(
            normalize(&entry("a", Some("12"), 20.0, -2.0), &p),
            Err(ValidationError::InvalidCoefficient { .. })
        ));
        assert!(matches!(
            normalize(&entry("a", Some("12"), 0.0, 1.0), &p),
            Err(ValidationError::InvalidScale { .. })
        ));
        assert!(matches!(
            normalize(&entry("a", Some("douze"), 20.0, 1.0), &p),
            Err(ValidationError::MalformedValue { .. })
        ));
    }

    #[test]
    fn parses_iso_and_french_dates() {
        assert_eq!(
            parse_grade_date("2026-01-10T08:30:00Z"),
            NaiveDate::from_ymd_opt(2026, 1, 10)
        );
        assert_eq!(parse_grade_date("10/01/2026"), NaiveDate::from_ymd_opt(2026, 1, 10));
        assert_eq!(
            parse_grade_date("2026-01-10 08:30"),
            NaiveDate::from_ymd_opt(2026, 1, 10)
        );
        assert_eq!(parse_grade_date("yesterday"), None);
        assert_eq!(parse_grade_date("2026-01-10garbage"), None);
        assert_eq!(parse_grade_date("2026-01-1"), None);

        let mut e = entry("a", Some("12"), 20.0, 1.0);
        e.date = "31/02/2026".to_string();
        assert!(matches!(
            normalize(&e, &Policy::default()),
            Err(ValidationError::MalformedDate { .. })
        ));
    }

    #[test]
    fn batch_recovers_from_bad_entries() {
        let mut with_bad_class = entry("c", Some("12"), 20.0, 1.0);
        with_bad_class.class_value = Some("n/a".to_string());
        let entries = vec![
            entry("a", Some("14"), 20.0, 1.0),
            entry("b", Some("abc"), 20.0, 1.0),
            entry("d", None, 20.0, 1.0),
            with_bad_class,
        ];
        let batch = normalize_batch(&entries, &Policy::default());
        assert_eq!(batch.grades.len(), 2);
        assert_eq!(batch.ungraded.len(), 1);
        assert_eq!(batch.ungraded[0].reason, Ungraded::Missing);
        let codes: Vec<&str> = batch.warnings.iter().map(|w| w.code.as_str()).collect();
        assert_eq!(codes, vec!["malformed_value", "class_value_dropped"]);
        assert_eq!(batch.grades[1].class_value, None);
    }

    #[test]
    fn period_slice_keeps_only_its_own_warnings() {
        let mut t2_bad = entry("t2bad", Some("abc"), 20.0, 1.0);
        t2_bad.period_code = "T2".to_string();
        let entries = vec![
            entry("t1ok", Some("14"), 20.0, 1.0),
            entry("t1bad", Some("abc"), 20.0, 1.0),
            t2_bad,
        ];
        let batch = normalize_batch(&entries, &Policy::default());
        assert_eq!(batch.warnings.len(), 2);

        let t2 = batch.for_period("T2");
        let ids: Vec<&str> = t2.warnings.iter().map(|w| w.entry_id.as_str()).collect();
        assert_eq!(ids, vec!["t2bad"]);
        assert_eq!(t2.warnings[0].period_code.as_deref(), Some("T2"));
        assert!(batch.for_period("T3").warnings.is_empty());
    }

    #[test]
    fn loosely_typed_scale_and_coefficient() {
        let parse = |raw: serde_json::Value| -> GradeEntry {
            serde_json::from_value(raw).expect("entry deserializes")
        };
        let base = serde_json::json!({
            "id": "a", "subjectCode": "FRAN", "periodCode": "T1",
            "value": "12", "date": "2026-01-10"
        });

        let mut raw = base.clone();
        raw["scale"] = serde_json::json!("20");
        raw["coefficient"] = serde_json::json!("2,5");
        let e = parse(raw);
        assert_eq!(e.scale, 20.0);
        assert_eq!(e.coefficient, 2.5);

        let mut raw = base.clone();
        raw["coefficient"] = serde_json::Value::Null;
        assert_eq!(parse(raw).coefficient, 1.0);

        let mut raw = base.clone();
        raw["coefficient"] = serde_json::json!("beaucoup");
        let e = parse(raw);
        assert!(e.coefficient.is_nan());
        assert!(matches!(
            normalize(&e, &Policy::default()),
            Err(ValidationError::InvalidCoefficient { .. })
        ));

        let mut raw = base;
        raw["scale"] = serde_json::json!(true);
        assert!(matches!(
            normalize(&parse(raw), &Policy::default()),
            Err(ValidationError::InvalidScale { .. })
        ));
    }
}
