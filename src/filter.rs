//! Amount Range Filtering
//!
//! Parses the per-address range expressions (`"5-10, 20"`) and decides whether
//! an outflow amount should raise an alert.

use std::fmt;

/// Inclusive amount interval in display units
///
/// `min <= max` is not enforced; an inverted range simply matches nothing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmountRange {
    pub min: f64,
    pub max: f64,
}

impl AmountRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Range covering exactly one amount
    pub fn single(value: f64) -> Self {
        Self::new(value, value)
    }

    pub fn contains(&self, amount: f64) -> bool {
        amount >= self.min && amount <= self.max
    }
}

impl fmt::Display for AmountRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{}", self.min)
        } else {
            write!(f, "{}-{}", self.min, self.max)
        }
    }
}

/// Parse a comma-separated list of ranges
///
/// Each token is either `N` (the range `[N, N]`) or `A-B`. Empty tokens and
/// tokens that do not parse as finite numbers are dropped.
///
/// # Returns
/// The parsed ranges in input order; empty for empty input
pub fn parse_ranges(text: &str) -> Vec<AmountRange> {
    text.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .filter_map(parse_range)
        .collect()
}

/// Parse a single `N` or `A-B` token
pub fn parse_range(token: &str) -> Option<AmountRange> {
    match token.split_once('-') {
        Some((min, max)) => Some(AmountRange::new(parse_amount(min)?, parse_amount(max)?)),
        None => parse_amount(token).map(AmountRange::single),
    }
}

fn parse_amount(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Check whether `amount` falls inside any of `ranges` (bounds inclusive)
///
/// An empty range list matches nothing.
pub fn matches(amount: f64, ranges: &[AmountRange]) -> bool {
    ranges.iter().any(|range| range.contains(amount))
}

/// Render ranges back to their expression form, for logs
pub fn format_ranges(ranges: &[AmountRange]) -> String {
    ranges
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
