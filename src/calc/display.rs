/// Half-up rounding to `digits` decimals: `floor(x * 10^d + 0.5) / 10^d`.
pub fn round_to(x: f64, digits: u32) -> f64 {
    let factor = 10_f64.powi(digits as i32);
    ((x * factor) + 0.5).floor() / factor
}

/// Widget formatting: two decimals, `"--"` when there is no average.
pub fn format_average(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{:.2}", round_to(v, 2)),
        _ => "--".to_string(),
    }
}
