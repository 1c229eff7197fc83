//! Per-layer review status and workflow statistics

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Review outcome of one layer
///
/// `Error` is the default and means "not yet reviewed". Any status may
/// move to any other, including itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    #[default]
    Error,
    Correct,
    Incorrect,
    Unsure,
}

impl Classification {
    pub const ALL: [Classification; 4] = [
        Classification::Correct,
        Classification::Incorrect,
        Classification::Unsure,
        Classification::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Error => "error",
            Classification::Correct => "correct",
            Classification::Incorrect => "incorrect",
            Classification::Unsure => "unsure",
        }
    }

    pub fn is_reviewed(&self) -> bool {
        *self != Classification::Error
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = eht_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Classification::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| {
                let allowed: Vec<&str> = Classification::ALL.iter().map(|c| c.as_str()).collect();
                eht_common::Error::InvalidInput(format!(
                    "Invalid classification. Must be one of: {}",
                    allowed.join(", ")
                ))
            })
    }
}

/// Classification counts for one session
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct DetectionStats {
    pub correct: i64,
    pub incorrect: i64,
    pub unsure: i64,
    pub error: i64,
    pub total: i64,
    pub reviewed: i64,
    pub progress_percent: f64,
}

impl DetectionStats {
    /// Aggregate from per-status counts
    pub fn from_counts(counts: impl IntoIterator<Item = (Classification, i64)>) -> Self {
        let mut stats = DetectionStats::default();
        for (classification, count) in counts {
            match classification {
                Classification::Correct => stats.correct += count,
                Classification::Incorrect => stats.incorrect += count,
                Classification::Unsure => stats.unsure += count,
                Classification::Error => stats.error += count,
            }
        }

        stats.total = stats.correct + stats.incorrect + stats.unsure + stats.error;
        stats.reviewed = stats.total - stats.error;
        stats.progress_percent = if stats.total > 0 {
            round2(stats.reviewed as f64 / stats.total as f64 * 100.0)
        } else {
            0.0
        };
        stats
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
