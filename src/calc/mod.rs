//! Grade-averaging engine.
//!
//! Everything under `calc` is pure: functions take an immutable snapshot of
//! grade records and return freshly built aggregates. Nothing here touches the
//! database or the IPC channel.

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

pub mod display;
pub mod evolution;
pub mod normalize;
pub mod period;
pub mod policy;
pub mod report;
pub mod subject;

pub use display::{format_average, round_to};
pub use normalize::{normalize, normalize_batch, NormalizedBatch, Ungraded};
pub use period::compute_period_average;
pub use policy::{EvolutionGranularity, Period, Policy};
pub use subject::compute_subject_averages;

/// Every entry is brought to this basis before weighting.
pub const BASIS: f64 = 20.0;

fn default_scale() -> f64 {
    BASIS
}

fn default_coefficient() -> f64 {
    1.0
}

/// Accepts a string, a bare JSON number or null. Numbers are kept as their
/// textual form so the normalizer sees a single input shape.
fn de_lenient_value<'de, D>(d: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(d)?;
    Ok(match raw {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(other) => Some(other.to_string()),
    })
}

/// Numbers, numeric strings with either decimal separator, or null (the field
/// default). Anything else becomes NaN so the normalizer reports it against the
/// entry instead of failing the whole batch.
fn lenient_f64<'de, D>(d: D, fallback: f64) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(d)?;
    Ok(match raw {
        None | Some(serde_json::Value::Null) => fallback,
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(f64::NAN),
        Some(serde_json::Value::String(s)) => {
            s.trim().replace(',', ".").parse::<f64>().unwrap_or(f64::NAN)
        }
        Some(_) => f64::NAN,
    })
}

fn de_scale<'de, D>(d: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    lenient_f64(d, default_scale())
}

fn de_coefficient<'de, D>(d: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    lenient_f64(d, default_coefficient())
}

/// Raw grade record as supplied by the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeEntry {
    pub id: String,
    pub subject_code: String,
    #[serde(default)]
    pub subject_label: String,
    pub period_code: String,
    #[serde(default, deserialize_with = "de_lenient_value")]
    pub value: Option<String>,
    #[serde(default = "default_scale", deserialize_with = "de_scale")]
    pub scale: f64,
    #[serde(default = "default_coefficient", deserialize_with = "de_coefficient")]
    pub coefficient: f64,
    pub date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subgroup_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "de_lenient_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub class_value: Option<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub bonus: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedGrade {
    pub id: String,
    pub subject_code: String,
    pub period_code: String,
    pub numeric_value: f64,
    pub scale: f64,
    pub coefficient: f64,
    pub date: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subgroup_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_value: Option<f64>,
    pub optional: bool,
    pub bonus: bool,
}

impl NormalizedGrade {
    pub fn value_on_basis(&self) -> f64 {
        self.numeric_value * BASIS / self.scale
    }

    pub fn class_value_on_basis(&self) -> Option<f64> {
        self.class_value.map(|v| v * BASIS / self.scale)
    }

    /// Subgroup path segments, outermost first. `"written/essays"` nests
    /// `essays` inside `written`.
    pub fn subgroup_path(&self) -> Vec<&str> {
        self.subgroup_id
            .as_deref()
            .map(|s| {
                s.split('/')
                    .map(str::trim)
                    .filter(|seg| !seg.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAverage {
    pub subject_code: String,
    pub period_code: String,
    pub average: Option<f64>,
    pub class_average: Option<f64>,
    pub grade_count: usize,
}

impl SubjectAverage {
    pub fn empty(subject_code: &str, period_code: &str) -> Self {
        Self {
            subject_code: subject_code.to_string(),
            period_code: period_code.to_string(),
            average: None,
            class_average: None,
            grade_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodAverage {
    pub period_code: String,
    pub general_average: Option<f64>,
    pub class_average: Option<f64>,
    pub subject_averages: BTreeMap<String, SubjectAverage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionPoint {
    pub date: NaiveDate,
    pub student_value: f64,
    pub class_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grade_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("grade {entry_id}: value {raw:?} is not a number")]
    MalformedValue { entry_id: String, raw: String },
    #[error("grade {entry_id}: value {value} is outside [0, {scale}]")]
    InvalidRange {
        entry_id: String,
        value: f64,
        scale: f64,
    },
    #[error("grade {entry_id}: coefficient {coefficient} must be greater than 0")]
    InvalidCoefficient { entry_id: String, coefficient: f64 },
    #[error("grade {entry_id}: scale {scale} must be greater than 0")]
    InvalidScale { entry_id: String, scale: f64 },
    #[error("grade {entry_id}: date {raw:?} is not a recognized date")]
    MalformedDate { entry_id: String, raw: String },
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedValue { .. } => "malformed_value",
            Self::InvalidRange { .. } => "invalid_range",
            Self::InvalidCoefficient { .. } => "invalid_coefficient",
            Self::InvalidScale { .. } => "invalid_scale",
            Self::MalformedDate { .. } => "malformed_date",
        }
    }

    pub fn entry_id(&self) -> &str {
        match self {
            Self::MalformedValue { entry_id, .. }
            | Self::InvalidRange { entry_id, .. }
            | Self::InvalidCoefficient { entry_id, .. }
            | Self::InvalidScale { entry_id, .. }
            | Self::MalformedDate { entry_id, .. } => entry_id,
        }
    }
}

/// Non-fatal problem surfaced next to a result. `period_code` is `None` when
/// the entry was too broken to tell which period it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Warning {
    pub entry_id: String,
    pub period_code: Option<String>,
    pub code: String,
    pub message: String,
}

impl Warning {
    pub fn for_entry(entry: &GradeEntry, e: &ValidationError) -> Self {
        Self {
            entry_id: e.entry_id().to_string(),
            period_code: Some(entry.period_code.clone()),
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}
