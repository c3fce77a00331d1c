//! Comparison of an acquired pulse train against the experiment's reference pattern.

use serde::Serialize;
use thiserror::Error;

/// Pattern text that is not `[v1,v2,...]`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatternParseError {
    #[error("pattern must be enclosed in brackets: '{0}'")]
    MissingBrackets(String),

    #[error("invalid step value '{token}' in pattern '{pattern}'")]
    InvalidValue {
        /// Whole pattern text.
        pattern: String,
        /// Element that is not a step value.
        token: String,
    },
}

/// Parse a bracketed, comma separated pattern such as `[1, 3,2]`.
///
/// Whitespace around values is ignored and `[]` is the empty pattern.
pub fn parse_pattern(text: &str) -> Result<Vec<u32>, PatternParseError> {
    let inner = text
        .trim()
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(|| PatternParseError::MissingBrackets(text.to_string()))?;

    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }

    inner
        .split(',')
        .map(|token| {
            token
                .trim()
                .parse::<u32>()
                .map_err(|_| PatternParseError::InvalidValue {
                    pattern: text.to_string(),
                    token: token.trim().to_string(),
                })
        })
        .collect()
}

/// Result of comparing an acquired pattern with a reference one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatternComparison {
    /// Both patterns are identical.
    pub matches: bool,
    /// First index where the patterns differ (including one running out first).
    pub first_divergence: Option<usize>,
    /// Steps acquired.
    pub acquired_len: usize,
    /// Steps in the reference.
    pub reference_len: usize,
}

/// Compare `acquired` against `reference`, step by step.
pub fn compare(acquired: &[u32], reference: &[u32]) -> PatternComparison {
    let first_divergence = acquired
        .iter()
        .zip(reference)
        .position(|(a, r)| a != r)
        .or_else(|| (acquired.len() != reference.len()).then(|| acquired.len().min(reference.len())));

    PatternComparison {
        matches: first_divergence.is_none(),
        first_divergence,
        acquired_len: acquired.len(),
        reference_len: reference.len(),
    }
}

impl std::fmt::Display for PatternComparison {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.first_divergence {
            None => write!(f, "match ({} steps)", self.acquired_len),
            Some(index) => write!(
                f,
                "mismatch at step {} (acquired {} steps, reference {} steps)",
                index, self.acquired_len, self.reference_len
            ),
        }
    }
}
