//! Log positions, checkpoint tokens and start positions.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Width of a persisted checkpoint token.
pub const CHECKPOINT_TOKEN_WIDTH: usize = 19;

/// Log-wide position assigned at insertion (the cross-stream replay order key).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalPosition(u64);

impl GlobalPosition {
    pub const ZERO: GlobalPosition = GlobalPosition(0);

    /// Largest position storage can hold (`BIGINT`), and the largest that fits
    /// a checkpoint token.
    pub const MAX: GlobalPosition = GlobalPosition(i64::MAX as u64);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    /// Encode as a zero-padded token whose lexical order equals numeric order.
    ///
    /// Fails above [`GlobalPosition::MAX`], which would need a wider token.
    pub fn to_token(self) -> Result<CheckpointToken, CoreError> {
        if self > Self::MAX {
            return Err(CoreError::invalid_checkpoint(format!(
                "position {} exceeds {}",
                self.0,
                Self::MAX.0
            )));
        }
        Ok(CheckpointToken(format!("{:0width$}", self.0, width = CHECKPOINT_TOKEN_WIDTH)))
    }
}

impl core::fmt::Display for GlobalPosition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<u64> for GlobalPosition {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<GlobalPosition> for u64 {
    fn from(value: GlobalPosition) -> Self {
        value.0
    }
}

/// Persisted checkpoint: a 19-character zero-padded decimal string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointToken(String);

impl CheckpointToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn position(&self) -> GlobalPosition {
        // Construction guarantees a valid token.
        GlobalPosition(self.0.parse().unwrap_or_default())
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl FromStr for CheckpointToken {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != CHECKPOINT_TOKEN_WIDTH || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CoreError::invalid_checkpoint(format!(
                "expected {CHECKPOINT_TOKEN_WIDTH} decimal digits, got '{s}'"
            )));
        }
        // Digits only, so `i64` bounds it to `GlobalPosition::MAX`.
        s.parse::<i64>()
            .map_err(|e| CoreError::invalid_checkpoint(format!("{s}: {e}")))?;
        Ok(Self(s.to_string()))
    }
}

impl core::fmt::Display for CheckpointToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a puller begins reading the log.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "position")]
pub enum StartFrom {
    /// From the first message in the partition.
    Beginning,
    /// From the current tail (only messages appended after start).
    End,
    /// Strictly after the given position.
    Position(GlobalPosition),
}

/// Where a processor asks to resume.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "position")]
pub enum ProcessorStartFrom {
    Beginning,
    End,
    Position(GlobalPosition),
    /// Resume from the stored checkpoint, or the beginning when there is none.
    Current,
}

impl Default for ProcessorStartFrom {
    fn default() -> Self {
        Self::Current
    }
}

impl StartFrom {
    /// Position after which reading starts, given the current tail.
    pub fn resolve(self, tail: Option<GlobalPosition>) -> GlobalPosition {
        match self {
            StartFrom::Beginning => GlobalPosition::ZERO,
            StartFrom::End => tail.unwrap_or(GlobalPosition::ZERO),
            StartFrom::Position(p) => p,
        }
    }

    /// The most conservative of two start positions (the one that replays more).
    pub fn most_conservative(self, other: StartFrom) -> StartFrom {
        match (self, other) {
            (StartFrom::Beginning, _) | (_, StartFrom::Beginning) => StartFrom::Beginning,
            (StartFrom::Position(a), StartFrom::Position(b)) => StartFrom::Position(a.min(b)),
            (StartFrom::Position(p), StartFrom::End) | (StartFrom::End, StartFrom::Position(p)) => {
                StartFrom::Position(p)
            }
            (StartFrom::End, StartFrom::End) => StartFrom::End,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn token_is_zero_padded() {
        let token = GlobalPosition::new(42).to_token().unwrap();
        assert_eq!(token.as_str(), "0000000000000000042");
        assert_eq!(token.position(), GlobalPosition::new(42));
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert!("42".parse::<CheckpointToken>().is_err());
        assert!("00000000000000000x2".parse::<CheckpointToken>().is_err());
        assert!("0000000000000000042".parse::<CheckpointToken>().is_ok());
        assert!("9999999999999999999".parse::<CheckpointToken>().is_err());
    }

    #[test]
    fn positions_past_bigint_have_no_token() {
        let max = GlobalPosition::MAX.to_token().unwrap();
        assert_eq!(max.as_str(), "9223372036854775807");
        assert_eq!(max.as_str().len(), CHECKPOINT_TOKEN_WIDTH);
        assert_eq!(max.position(), GlobalPosition::MAX);

        assert!(GlobalPosition::new(i64::MAX as u64 + 1).to_token().is_err());
        assert!(GlobalPosition::new(u64::MAX).to_token().is_err());
    }

    #[test]
    fn beginning_wins_reduction() {
        let p = StartFrom::Position(GlobalPosition::new(10));
        assert_eq!(p.most_conservative(StartFrom::Beginning), StartFrom::Beginning);
        assert_eq!(StartFrom::End.most_conservative(p), p);
        assert_eq!(
            p.most_conservative(StartFrom::Position(GlobalPosition::new(3))),
            StartFrom::Position(GlobalPosition::new(3))
        );
        assert_eq!(StartFrom::End.most_conservative(StartFrom::End), StartFrom::End);
    }

    #[test]
    fn resolve_uses_tail_for_end() {
        assert_eq!(StartFrom::End.resolve(None), GlobalPosition::ZERO);
        assert_eq!(
            StartFrom::End.resolve(Some(GlobalPosition::new(9))),
            GlobalPosition::new(9)
        );
        assert_eq!(StartFrom::Beginning.resolve(Some(GlobalPosition::new(9))), GlobalPosition::ZERO);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        #[test]
        fn lexical_order_equals_numeric_order(a in 0..=i64::MAX as u64, b in 0..=i64::MAX as u64) {
            let ta = GlobalPosition::new(a).to_token().unwrap();
            let tb = GlobalPosition::new(b).to_token().unwrap();
            prop_assert_eq!(ta.as_str().len(), CHECKPOINT_TOKEN_WIDTH);
            prop_assert_eq!(ta.as_str().cmp(tb.as_str()), a.cmp(&b));
        }

        #[test]
        fn tokens_parse_back(a in 0..=i64::MAX as u64) {
            let token = GlobalPosition::new(a).to_token().unwrap();
            let parsed: CheckpointToken = token.as_str().parse().unwrap();
            prop_assert_eq!(parsed.position(), GlobalPosition::new(a));
        }
    }
}
