use super::NormalizedGrade;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const MAX_ROUNDING_DIGITS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EvolutionGranularity {
    PerGrade,
    #[default]
    PerDay,
}

impl EvolutionGranularity {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "perGrade" => Some(Self::PerGrade),
            "perDay" => Some(Self::PerDay),
            _ => None,
        }
    }
}

/// Read-only switches consulted by the aggregation stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub auto_period_selection: bool,
    pub include_ungraded_as_zero: bool,
    pub evolution_granularity: EvolutionGranularity,
    pub rounding_digits: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            auto_period_selection: true,
            include_ungraded_as_zero: false,
            evolution_granularity: EvolutionGranularity::PerDay,
            rounding_digits: 2,
        }
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

impl Policy {
    /// Applies a camelCase patch field by field. Either every field is valid
    /// and applied, or `self` is left untouched.
    pub fn apply_patch(&mut self, patch: &Map<String, Value>) -> Result<(), String> {
        let mut next = self.clone();
        for (k, v) in patch {
            match k.as_str() {
                "autoPeriodSelection" => next.auto_period_selection = parse_bool(v, k)?,
                "includeUngradedAsZero" => next.include_ungraded_as_zero = parse_bool(v, k)?,
                "evolutionGranularity" => {
                    let s = v
                        .as_str()
                        .ok_or_else(|| format!("{} must be string", k))?;
                    next.evolution_granularity = EvolutionGranularity::parse(s.trim())
                        .ok_or_else(|| {
                            "evolutionGranularity must be one of: perGrade, perDay".to_string()
                        })?;
                }
                "roundingDigits" => {
                    let n = v
                        .as_u64()
                        .ok_or_else(|| format!("{} must be a non-negative integer", k))?;
                    if n > MAX_ROUNDING_DIGITS as u64 {
                        return Err(format!(
                            "{} must be in 0..={}",
                            k, MAX_ROUNDING_DIGITS
                        ));
                    }
                    next.rounding_digits = n as u32;
                }
                _ => return Err(format!("unknown policy field: {}", k)),
            }
        }
        *self = next;
        Ok(())
    }

    /// Defaults overlaid with whatever saved fields still validate.
    pub fn from_saved(saved: Option<&Value>) -> Self {
        let mut policy = Self::default();
        let Some(obj) = saved.and_then(|v| v.as_object()) else {
            return policy;
        };
        for (k, v) in obj {
            let mut single = Map::new();
            single.insert(k.clone(), v.clone());
            if let Err(msg) = policy.apply_patch(&single) {
                tracing::warn!(field = %k, "ignoring saved policy field: {}", msg);
            }
        }
        policy
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A grading term declared by the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Period {
    pub code: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
}

impl Period {
    fn contains(&self, day: NaiveDate) -> bool {
        match (self.start_date, self.end_date) {
            (Some(start), Some(end)) => start <= day && day <= end,
            (Some(start), None) => start <= day,
            (None, Some(end)) => day <= end,
            (None, None) => false,
        }
    }
}

/// Picks the period to display when the caller did not name one.
///
/// The period whose range holds `today` wins. Otherwise the period of the most
/// recent gradable grade, then the last declared period.
pub fn select_period(
    periods: &[Period],
    grades: &[NormalizedGrade],
    today: NaiveDate,
) -> Option<String> {
    if let Some(p) = periods.iter().find(|p| p.contains(today)) {
        return Some(p.code.clone());
    }
    let latest = grades
        .iter()
        .max_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
    if let Some(g) = latest {
        return Some(g.period_code.clone());
    }
    periods.last().map(|p| p.code.clone())
}
