//! Comparisons over raw query output that fail with a structured mismatch.
//!
//! Each function returns `Ok(())` when the observation matches and an
//! [`AssertionMismatch`] otherwise, so the same check can be used once or
//! wrapped in a [`Poller`](super::poll::Poller).

use std::fmt;

use serde::Serialize;
use tracing::debug;

/// How much of a long `actual` value to keep in a mismatch.
const EXCERPT_LIMIT: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssertionMismatch {
    /// Which comparison failed (`equals`, `contains`, ...).
    pub assertion: &'static str,
    pub expected: String,
    pub actual: String,
    pub context: String,
}

impl fmt::Display for AssertionMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} expected {}, got {}",
            self.context, self.assertion, self.expected, self.actual
        )
    }
}

impl std::error::Error for AssertionMismatch {}

impl AssertionMismatch {
    fn new(
        assertion: &'static str,
        expected: impl Into<String>,
        actual: impl Into<String>,
        context: &str,
    ) -> Self {
        let mismatch = Self {
            assertion,
            expected: expected.into(),
            actual: actual.into(),
            context: context.to_string(),
        };
        debug!(
            assertion,
            context,
            expected = %mismatch.expected,
            actual = %mismatch.actual,
            "assertion mismatch"
        );
        mismatch
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NumericOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl NumericOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        }
    }

    pub fn holds(self, actual: i64, expected: i64) -> bool {
        match self {
            Self::Eq => actual == expected,
            Self::Ne => actual != expected,
            Self::Gt => actual > expected,
            Self::Ge => actual >= expected,
            Self::Lt => actual < expected,
            Self::Le => actual <= expected,
        }
    }
}

pub fn assert_equals<T: PartialEq + fmt::Debug>(
    actual: &T,
    expected: &T,
    context: &str,
) -> Result<(), AssertionMismatch> {
    if actual == expected {
        return Ok(());
    }
    Err(AssertionMismatch::new(
        "equals",
        format!("{expected:?}"),
        format!("{actual:?}"),
        context,
    ))
}

/// `haystack` must contain `needle`. An empty needle always matches.
pub fn assert_contains(haystack: &str, needle: &str, context: &str) -> Result<(), AssertionMismatch> {
    if haystack.contains(needle) {
        return Ok(());
    }
    Err(AssertionMismatch::new(
        "contains",
        format!("{needle:?}"),
        format!("{:?}", excerpt(haystack)),
        context,
    ))
}

pub fn assert_count_equals<T: fmt::Debug>(
    items: &[T],
    expected: usize,
    context: &str,
) -> Result<(), AssertionMismatch> {
    if items.len() == expected {
        return Ok(());
    }
    Err(AssertionMismatch::new(
        "count",
        expected.to_string(),
        format!("{} {:?}", items.len(), items),
        context,
    ))
}

pub fn assert_numeric(
    actual: i64,
    op: NumericOp,
    expected: i64,
    context: &str,
) -> Result<(), AssertionMismatch> {
    if op.holds(actual, expected) {
        return Ok(());
    }
    Err(AssertionMismatch::new(
        "numeric",
        format!("{} {expected}", op.symbol()),
        actual.to_string(),
        context,
    ))
}

/// Split query output into trimmed, non-empty lines.
pub fn non_empty_lines(output: &str) -> Vec<&str> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect()
}

/// Parse trimmed query output as an integer.
pub fn parse_integer(output: &str, context: &str) -> Result<i64, AssertionMismatch> {
    let trimmed = output.trim();
    trimmed
        .parse::<i64>()
        .map_err(|_| AssertionMismatch::new("integer", "an integer", format!("{trimmed:?}"), context))
}

fn excerpt(text: &str) -> &str {
    if text.len() <= EXCERPT_LIMIT {
        return text;
    }
    let mut start = text.len() - EXCERPT_LIMIT;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
