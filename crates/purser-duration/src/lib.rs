//! Timedelta-phrase parsing.
//!
//! The control plane stores log-purge ages as loose English phrases such as
//! `"12 hours"` or `"3 days 6 hours"`. This crate turns those phrases into
//! [`std::time::Duration`] values.
//!
//! Accepted units are `day(s)`, `hour(s)`, `minute(s)` and `second(s)`,
//! matched case-insensitively by prefix, so `"2 hr"` is rejected but
//! `"2 Hours"` is accepted. Values and units alternate: `"1 day 12 hours"`.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty timedelta phrase")]
    Empty,
    #[error("dangling value with no unit: {0}")]
    DanglingValue(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("unknown unit: {0}")]
    UnknownUnit(String),
}

const DAY: u64 = 86_400;
const HOUR: u64 = 3_600;
const MINUTE: u64 = 60;

/// Parse a phrase like `"3 days 6 hours"` into a [`Duration`].
pub fn parse_timedelta(phrase: &str) -> Result<Duration, ParseError> {
    let parts: Vec<&str> = phrase.split_whitespace().collect();
    if parts.is_empty() {
        return Err(ParseError::Empty);
    }

    let mut total = 0u64;
    let mut matched_any = false;

    for chunk in parts.chunks(2) {
        let [value, unit] = chunk else {
            return Err(ParseError::DanglingValue(chunk[0].to_string()));
        };

        let value: u64 = value
            .parse()
            .map_err(|_| ParseError::InvalidValue(value.to_string()))?;

        let unit_lc = unit.to_lowercase();
        let seconds = if unit_lc.contains("day") {
            DAY
        } else if unit_lc.contains("hour") {
            HOUR
        } else if unit_lc.contains("minute") {
            MINUTE
        } else if unit_lc.contains("second") {
            1
        } else {
            return Err(ParseError::UnknownUnit(unit.to_string()));
        };

        total += value * seconds;
        matched_any = true;
    }

    if !matched_any {
        return Err(ParseError::Empty);
    }

    Ok(Duration::from_secs(total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_unit_phrases() {
        assert_eq!(parse_timedelta("12 hours"), Ok(Duration::from_secs(12 * HOUR)));
        assert_eq!(parse_timedelta("1 day"), Ok(Duration::from_secs(DAY)));
        assert_eq!(parse_timedelta("45 minutes"), Ok(Duration::from_secs(45 * 60)));
        assert_eq!(parse_timedelta("90 seconds"), Ok(Duration::from_secs(90)));
    }

    #[test]
    fn compound_phrase() {
        assert_eq!(
            parse_timedelta("3 days 6 hours"),
            Ok(Duration::from_secs(3 * DAY + 6 * HOUR))
        );
    }

    #[test]
    fn case_insensitive_units() {
        assert_eq!(parse_timedelta("2 Hours"), Ok(Duration::from_secs(2 * HOUR)));
    }

    #[test]
    fn rejects_unknown_unit() {
        assert_eq!(
            parse_timedelta("5 fortnights"),
            Err(ParseError::UnknownUnit("fortnights".into()))
        );
    }

    #[test]
    fn rejects_empty_and_dangling() {
        assert_eq!(parse_timedelta(""), Err(ParseError::Empty));
        assert_eq!(parse_timedelta("   "), Err(ParseError::Empty));
        assert_eq!(
            parse_timedelta("3 days 6"),
            Err(ParseError::DanglingValue("6".into()))
        );
    }

    #[test]
    fn rejects_non_numeric_value() {
        assert_eq!(
            parse_timedelta("some hours"),
            Err(ParseError::InvalidValue("some".into()))
        );
    }

    proptest::proptest! {
        #[test]
        fn scales_linearly_per_unit(value in 0u64..100_000) {
            proptest::prop_assert_eq!(
                parse_timedelta(&format!("{value} seconds")),
                Ok(Duration::from_secs(value))
            );
            proptest::prop_assert_eq!(
                parse_timedelta(&format!("{value} minutes")),
                Ok(Duration::from_secs(value * MINUTE))
            );
        }
    }
}
