//! Parsing of raw usage quantities such as "250m" or "512Mi"

use crate::error::PredictionError;
use crate::models::ResourceName;

/// Parse a quantity string into a base-unit number (cores, bytes, ...).
///
/// Accepts a non-negative decimal followed by an optional suffix:
/// `n`, `u`, `m` (decimal fractions), `k`, `M`, `G`, `T` (decimal
/// multiples), `Ki`, `Mi`, `Gi`, `Ti` (binary multiples), `B` (bytes) or a
/// decimal exponent such as `e3` or `E-07`.
pub fn parse_usage(raw: &str, resource: ResourceName) -> Result<f64, PredictionError> {
    let trimmed = raw.trim();
    let split = trimmed
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);

    if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Err(PredictionError::parse(
            raw,
            format!("expected a non-negative number for {resource}"),
        ));
    }
    let base: f64 = number
        .parse()
        .map_err(|e| PredictionError::parse(raw, format!("{e}")))?;

    let value = match suffix {
        "" | "B" => base,
        "n" => base / 1e9,
        "u" => base / 1e6,
        "m" => base / 1e3,
        "k" => base * 1e3,
        "M" => base * 1e6,
        "G" => base * 1e9,
        "T" => base * 1e12,
        "Ki" => base * 1024.0,
        "Mi" => base * 1024.0 * 1024.0,
        "Gi" => base * 1024.0 * 1024.0 * 1024.0,
        "Ti" => base * 1024.0 * 1024.0 * 1024.0 * 1024.0,
        other => match decimal_exponent(other) {
            Some(exponent) => base * 10f64.powi(exponent),
            None => {
                return Err(PredictionError::parse(
                    raw,
                    format!("unknown suffix {other:?}"),
                ))
            }
        },
    };

    if !value.is_finite() {
        return Err(PredictionError::parse(raw, "value is not finite"));
    }
    Ok(value)
}

fn decimal_exponent(suffix: &str) -> Option<i32> {
    let digits = suffix
        .strip_prefix('e')
        .or_else(|| suffix.strip_prefix('E'))?;
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Validate an already numeric usage value
pub fn check_value(value: f64, resource: ResourceName) -> Result<f64, PredictionError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(PredictionError::parse(
            &value.to_string(),
            format!("invalid {resource} usage"),
        ))
    }
}
