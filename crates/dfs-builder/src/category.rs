//! Content categories and the sampling classifier.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Entropy (bits per byte) above which a sample is treated as already
/// compressed.
const INCOMPRESSIBLE_ENTROPY: f64 = 7.2;
/// Smallest sample the entropy estimate is trusted on.
const MIN_ENTROPY_SAMPLE: usize = 512;
/// Share of text-like bytes required to call a sample text.
const TEXT_RATIO: f64 = 0.95;

/// Content class of a regular file; each class packs into its own blocks
/// and has its own compression setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Binary,
    Text,
    Incompressible,
}

impl Category {
    pub const ALL: [Self; 3] = [Self::Binary, Self::Text, Self::Incompressible];

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Binary => 0,
            Self::Text => 1,
            Self::Incompressible => 2,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Text => "text",
            Self::Incompressible => "incompressible",
        }
    }

    /// Classify content from a leading sample.
    #[must_use]
    pub fn classify(sample: &[u8]) -> Self {
        if sample.len() >= MIN_ENTROPY_SAMPLE && shannon_entropy(sample) > INCOMPRESSIBLE_ENTROPY {
            return Self::Incompressible;
        }
        if !sample.is_empty() && looks_like_text(sample) {
            return Self::Text;
        }
        Self::Binary
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    let to_f64 = |n: usize| f64::from(u32::try_from(n).unwrap_or(u32::MAX));
    to_f64(part) / to_f64(whole)
}

/// Shannon entropy of `data` in bits per byte (0.0 ..= 8.0).
#[must_use]
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut counts = [0_usize; 256];
    for &b in data {
        counts[usize::from(b)] += 1;
    }
    counts
        .iter()
        .filter(|&&n| n > 0)
        .map(|&n| {
            let p = ratio(n, data.len());
            -p * p.log2()
        })
        .sum()
}

fn looks_like_text(sample: &[u8]) -> bool {
    if sample.contains(&0) {
        return false;
    }
    // Bytes >= 0x80 count as text so UTF-8 content qualifies.
    let texty = sample
        .iter()
        .filter(|&&b| b.is_ascii_graphic() || b.is_ascii_whitespace() || b >= 0x80)
        .count();
    ratio(texty, sample.len()) >= TEXT_RATIO
}
