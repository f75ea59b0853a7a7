//! Sensor line grammar
//!
//! Each reading is one text line of `key:value` segments separated by `;`:
//! - Dual beam pair: `A:<0|1>;B:<0|1>`
//! - Environmental: `M:<0|1>;S:<dB>;C:<ppm>`
//!
//! Absent keys default to 0. Binary keys take integers and are clamped
//! into {0, 1}; `S` and `C` accept integers or decimals.

use super::types::{EnvironmentSample, Reading, SensorSample};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,

    #[error("segment {segment:?} is missing ':'")]
    MissingColon { segment: String },

    #[error("unknown key {key:?}")]
    UnknownKey { key: String },

    #[error("duplicate key {key:?}")]
    DuplicateKey { key: String },

    #[error("invalid value {value:?} for key {key:?}")]
    InvalidValue { key: String, value: String },

    #[error("line mixes A/B keys with M/S/C keys")]
    MixedKinds,
}

/// Key slots in a fixed order; index doubles as a duplicate-detection bit
#[derive(Debug, Clone, Copy)]
enum Key {
    A,
    B,
    M,
    S,
    C,
}

impl Key {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "A" => Some(Key::A),
            "B" => Some(Key::B),
            "M" => Some(Key::M),
            "S" => Some(Key::S),
            "C" => Some(Key::C),
            _ => None,
        }
    }

    #[inline]
    fn bit(self) -> u8 {
        1 << (self as u8)
    }

    #[inline]
    fn is_dual(self) -> bool {
        matches!(self, Key::A | Key::B)
    }
}

fn parse_binary(key: &str, value: &str) -> Result<bool, ParseError> {
    value
        .parse::<i64>()
        .map(|v| v.clamp(0, 1) == 1)
        .map_err(|_| ParseError::InvalidValue { key: key.to_string(), value: value.to_string() })
}

fn parse_level(key: &str, value: &str) -> Result<f64, ParseError> {
    match value.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(ParseError::InvalidValue { key: key.to_string(), value: value.to_string() }),
    }
}

/// Parse one raw sensor line, stamping the result with `timestamp_ms`
///
/// No side effects; callers skip lines that fail and keep reading.
pub fn parse_line(raw: &str, timestamp_ms: u64) -> Result<Reading, ParseError> {
    let line = raw.trim();
    if line.is_empty() {
        return Err(ParseError::Empty);
    }

    let mut seen = 0u8;
    let mut has_dual = false;
    let mut has_env = false;

    let mut a = false;
    let mut b = false;
    let mut m = false;
    let mut s = 0.0;
    let mut c = 0.0;

    // A single trailing ';' is tolerated, empty segments elsewhere are not
    let body = line.strip_suffix(';').unwrap_or(line);

    for segment in body.split(';') {
        let segment = segment.trim();
        let (token, value) = segment
            .split_once(':')
            .ok_or_else(|| ParseError::MissingColon { segment: segment.to_string() })?;
        let (token, value) = (token.trim(), value.trim());

        let key = Key::from_token(token)
            .ok_or_else(|| ParseError::UnknownKey { key: token.to_string() })?;

        if seen & key.bit() != 0 {
            return Err(ParseError::DuplicateKey { key: token.to_string() });
        }
        seen |= key.bit();

        if key.is_dual() {
            has_dual = true;
        } else {
            has_env = true;
        }

        match key {
            Key::A => a = parse_binary(token, value)?,
            Key::B => b = parse_binary(token, value)?,
            Key::M => m = parse_binary(token, value)?,
            Key::S => s = parse_level(token, value)?,
            Key::C => c = parse_level(token, value)?,
        }
    }

    if has_dual && has_env {
        return Err(ParseError::MixedKinds);
    }

    if has_dual {
        Ok(Reading::Sensor(SensorSample { sensor_a_active: a, sensor_b_active: b, timestamp_ms }))
    } else {
        Ok(Reading::Environment(EnvironmentSample {
            motion_active: m,
            sound_level_db: s,
            co2_ppm: c,
            timestamp_ms,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensor(a: bool, b: bool) -> Reading {
        Reading::Sensor(SensorSample { sensor_a_active: a, sensor_b_active: b, timestamp_ms: 7 })
    }

    #[test]
    fn test_parse_dual_line() {
        assert_eq!(parse_line("A:1;B:0", 7), Ok(sensor(true, false)));
        assert_eq!(parse_line("A:0;B:1\r\n", 7), Ok(sensor(false, true)));
    }

    #[test]
    fn test_parse_single_sensor_line_defaults_other_to_zero() {
        // Older boards report each beam on its own line
        assert_eq!(parse_line("A:1", 7), Ok(sensor(true, false)));
        assert_eq!(parse_line("B:1", 7), Ok(sensor(false, true)));
    }

    #[test]
    fn test_parse_environment_line() {
        let reading = parse_line("M:1;S:58.4;C:951.2", 42).unwrap();
        match reading {
            Reading::Environment(e) => {
                assert!(e.motion_active);
                assert!((e.sound_level_db - 58.4).abs() < 1e-9);
                assert!((e.co2_ppm - 951.2).abs() < 1e-9);
                assert_eq!(e.timestamp_ms, 42);
            }
            other => panic!("expected environment reading, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_environment_missing_key_defaults_to_zero() {
        match parse_line("M:0;C:410", 0).unwrap() {
            Reading::Environment(e) => {
                assert!(!e.motion_active);
                assert_eq!(e.sound_level_db, 0.0);
                assert_eq!(e.co2_ppm, 410.0);
            }
            other => panic!("expected environment reading, got {other:?}"),
        }
    }

    #[test]
    fn test_binary_values_are_clamped() {
        assert_eq!(parse_line("A:2;B:-3", 7), Ok(sensor(true, false)));
    }

    #[test]
    fn test_non_numeric_value_rejected() {
        assert_eq!(
            parse_line("A:2;B:x", 0),
            Err(ParseError::InvalidValue { key: "B".to_string(), value: "x".to_string() })
        );
        assert!(matches!(parse_line("M:1;S:loud;C:500", 0), Err(ParseError::InvalidValue { .. })));
        assert!(matches!(parse_line("M:1;S:NaN;C:500", 0), Err(ParseError::InvalidValue { .. })));
        assert!(matches!(parse_line("A:1.0", 0), Err(ParseError::InvalidValue { .. })));
    }

    #[test]
    fn test_empty_line_rejected() {
        assert_eq!(parse_line("", 0), Err(ParseError::Empty));
        assert_eq!(parse_line("   \r\n", 0), Err(ParseError::Empty));
    }

    #[test]
    fn test_missing_colon_rejected() {
        assert!(matches!(parse_line("A1;B:0", 0), Err(ParseError::MissingColon { .. })));
        assert!(matches!(parse_line("A:1;;B:0", 0), Err(ParseError::MissingColon { .. })));
    }

    #[test]
    fn test_trailing_separator_tolerated() {
        assert_eq!(parse_line("A:1;B:1;", 7), Ok(sensor(true, true)));
    }

    #[test]
    fn test_unknown_duplicate_and_mixed_keys_rejected() {
        assert!(matches!(parse_line("X:1", 0), Err(ParseError::UnknownKey { .. })));
        assert!(matches!(parse_line("A:1;A:0", 0), Err(ParseError::DuplicateKey { .. })));
        assert_eq!(parse_line("A:1;M:1", 0), Err(ParseError::MixedKinds));
    }
}
