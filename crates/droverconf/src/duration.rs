//! Suffixed duration parsing.
//!
//! Durations are written as concatenated `<int><unit>` pairs that sum up:
//! `"1m30s"` is 90000 ms, `"2h"` is 7200000 ms. Units are `ms`, `s`, `m`,
//! `h`, `d`. A bare trailing integer counts as milliseconds, so `"1s500"`
//! equals `"1500ms"`.

use crate::ConfigError;
use serde_json::Value;

fn unit_ms(unit: &str) -> Option<u64> {
    match unit {
        "ms" => Some(1),
        "s" => Some(1_000),
        "m" => Some(60_000),
        "h" => Some(3_600_000),
        "d" => Some(86_400_000),
        _ => None,
    }
}

/// Parse a suffixed duration string into milliseconds.
pub fn parse_duration_ms(input: &str) -> Result<u64, ConfigError> {
    let err = |message: &str| ConfigError::Duration {
        input: input.to_string(),
        message: message.to_string(),
    };

    let s = input.trim();
    if s.is_empty() {
        return Err(err("empty string"));
    }

    let mut total: u64 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits_end == 0 {
            return Err(err("expected a number"));
        }
        let magnitude: u64 = rest[..digits_end]
            .parse()
            .map_err(|_| err("number too large"))?;
        rest = &rest[digits_end..];

        let unit_end = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_end];
        rest = &rest[unit_end..];

        // no unit is only allowed at the very end, and means milliseconds
        let scale = if unit.is_empty() {
            if !rest.is_empty() {
                return Err(err("expected a unit"));
            }
            1
        } else {
            unit_ms(unit).ok_or_else(|| err("unknown unit"))?
        };

        let part = magnitude.checked_mul(scale).ok_or_else(|| err("overflow"))?;
        total = total.checked_add(part).ok_or_else(|| err("overflow"))?;
    }

    Ok(total)
}

/// Parse a JSON value holding a duration: either a suffixed string or a
/// bare integer (milliseconds).
pub fn duration_value_ms(v: &Value) -> Result<u64, ConfigError> {
    match v {
        Value::String(s) => parse_duration_ms(s),
        Value::Number(n) => n.as_u64().ok_or_else(|| ConfigError::Duration {
            input: n.to_string(),
            message: "expected a non-negative integer".to_string(),
        }),
        other => Err(ConfigError::Duration {
            input: other.to_string(),
            message: "expected a string or integer".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_units() {
        assert_eq!(parse_duration_ms("250ms").unwrap(), 250);
        assert_eq!(parse_duration_ms("3s").unwrap(), 3_000);
        assert_eq!(parse_duration_ms("2m").unwrap(), 120_000);
        assert_eq!(parse_duration_ms("1h").unwrap(), 3_600_000);
        assert_eq!(parse_duration_ms("1d").unwrap(), 86_400_000);
    }

    #[test]
    fn test_composed() {
        assert_eq!(parse_duration_ms("1m30s").unwrap(), 90_000);
        assert_eq!(parse_duration_ms("1h30m10s").unwrap(), 5_410_000);
        assert_eq!(parse_duration_ms("1s500").unwrap(), 1_500);
    }

    #[test]
    fn test_bare_integer_is_ms() {
        assert_eq!(parse_duration_ms("42").unwrap(), 42);
        assert_eq!(parse_duration_ms("0").unwrap(), 0);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_duration_ms("").is_err());
        assert!(parse_duration_ms("ms").is_err());
        assert!(parse_duration_ms("1x").is_err());
        assert!(parse_duration_ms("1m30").is_ok()); // trailing bare ms
        assert!(parse_duration_ms("30 s").is_err());
        assert!(parse_duration_ms("-5s").is_err());
    }

    #[test]
    fn test_overflow() {
        assert!(parse_duration_ms("99999999999999999999d").is_err());
        assert!(parse_duration_ms("999999999999999999d").is_err());
    }

    #[test]
    fn test_json_value_forms() {
        assert_eq!(duration_value_ms(&json!("5s")).unwrap(), 5_000);
        assert_eq!(duration_value_ms(&json!(75)).unwrap(), 75);
        assert!(duration_value_ms(&json!(-1)).is_err());
        assert!(duration_value_ms(&json!({})).is_err());
    }
}
