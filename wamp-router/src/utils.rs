//! Small shared helpers: RFC 3339 timestamps with configurable subsecond
//! precision, and the router agent string.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Agent string advertised in WELCOME details.
pub fn server_agent() -> String {
    format!("wamp-router/{}", env!("CARGO_PKG_VERSION"))
}

/// Subsecond digit count for meta-API timestamps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TimestampPrecision {
    Seconds,
    #[default]
    Milliseconds,
    Microseconds,
    Nanoseconds,
}

impl TimestampPrecision {
    pub fn digits(self) -> u8 {
        match self {
            TimestampPrecision::Seconds => 0,
            TimestampPrecision::Milliseconds => 3,
            TimestampPrecision::Microseconds => 6,
            TimestampPrecision::Nanoseconds => 9,
        }
    }
}

impl From<TimestampPrecision> for u8 {
    fn from(value: TimestampPrecision) -> u8 {
        value.digits()
    }
}

impl TryFrom<u8> for TimestampPrecision {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TimestampPrecision::Seconds),
            3 => Ok(TimestampPrecision::Milliseconds),
            6 => Ok(TimestampPrecision::Microseconds),
            9 => Ok(TimestampPrecision::Nanoseconds),
            other => Err(format!("invalid subsecond precision {other}, expected 0, 3, 6 or 9")),
        }
    }
}

/// Formats a timestamp as RFC 3339 in UTC, always `Z`-terminated.
pub fn format_rfc3339_utc(when: OffsetDateTime, precision: TimestampPrecision) -> String {
    let when = when.to_offset(time::UtcOffset::UTC);
    let mut out = format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
        when.year(),
        u8::from(when.month()),
        when.day(),
        when.hour(),
        when.minute(),
        when.second(),
    );

    match precision {
        TimestampPrecision::Seconds => {}
        TimestampPrecision::Milliseconds => {
            out.push_str(&format!(".{:03}", when.millisecond()));
        }
        TimestampPrecision::Microseconds => {
            out.push_str(&format!(".{:06}", when.microsecond()));
        }
        TimestampPrecision::Nanoseconds => {
            out.push_str(&format!(".{:09}", when.nanosecond()));
        }
    }

    out.push('Z');
    out
}

/// Parses an RFC 3339 timestamp.
pub fn parse_rfc3339(input: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(input, &Rfc3339).ok()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use time::macros::datetime;

    use super::*;

    #[rstest]
    #[case(TimestampPrecision::Seconds, "2023-04-05T06:07:08Z")]
    #[case(TimestampPrecision::Milliseconds, "2023-04-05T06:07:08.123Z")]
    #[case(TimestampPrecision::Microseconds, "2023-04-05T06:07:08.123456Z")]
    #[case(TimestampPrecision::Nanoseconds, "2023-04-05T06:07:08.123456789Z")]
    fn formats_with_requested_precision(#[case] precision: TimestampPrecision, #[case] expected: &str) {
        let when = datetime!(2023-04-05 06:07:08.123456789 UTC);
        assert_eq!(format_rfc3339_utc(when, precision), expected);
    }

    #[rstest]
    #[case("2023-04-05T06:07:08Z", TimestampPrecision::Seconds)]
    #[case("2023-04-05T06:07:08.123Z", TimestampPrecision::Milliseconds)]
    #[case("2023-04-05T06:07:08.123456Z", TimestampPrecision::Microseconds)]
    #[case("2023-04-05T06:07:08.123456789Z", TimestampPrecision::Nanoseconds)]
    fn canonical_round_trip(#[case] canonical: &str, #[case] precision: TimestampPrecision) {
        let parsed = parse_rfc3339(canonical).expect("parse");
        assert_eq!(format_rfc3339_utc(parsed, precision), canonical);
    }

    #[test]
    fn non_utc_input_is_normalized_to_utc() {
        let when = datetime!(2023-04-05 08:07:08 +2);
        assert_eq!(
            format_rfc3339_utc(when, TimestampPrecision::Seconds),
            "2023-04-05T06:07:08Z"
        );
    }

    #[test]
    fn garbage_does_not_parse() {
        assert!(parse_rfc3339("2023-04-05 06:07:08").is_none());
    }
}
