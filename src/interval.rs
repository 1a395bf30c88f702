//! Parsing of human-entered sampling intervals like `"10ms"` or `"1 s"`.

use std::time::Duration;

use crate::error::{Error, Result};

/// Parse an interval string into a duration.
///
/// Accepted units: `ns`, `us`, `ms`, `s`, `min`, `h`, `hr`. Whitespace
/// between the number and the unit is tolerated. A bare number uses
/// `default_unit`; an unknown unit fails.
pub fn parse_interval(input: &str, default_unit: &str) -> Result<Duration> {
    let trimmed = input.trim();
    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(digits_end);
    let value: u64 = digits
        .parse()
        .map_err(|_| Error::InvalidInterval(input.to_string()))?;
    let unit = unit.trim();
    let unit = if unit.is_empty() { default_unit } else { unit };
    let nanos_per_unit: u64 = match unit {
        "ns" => 1,
        "us" => 1_000,
        "ms" => 1_000_000,
        "s" => 1_000_000_000,
        "min" => 60 * 1_000_000_000,
        "h" | "hr" => 3_600 * 1_000_000_000,
        _ => return Err(Error::InvalidInterval(input.to_string())),
    };
    let nanos = value
        .checked_mul(nanos_per_unit)
        .ok_or_else(|| Error::InvalidInterval(input.to_string()))?;
    Ok(Duration::from_nanos(nanos))
}
