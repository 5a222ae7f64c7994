//! Walker's alias method for O(1) draws from a discrete distribution.
//!
//! Built once over a weight vector, an [`AliasTable`] answers
//! `draw() -> index` with two uniform variates and a single comparison,
//! independent of the number of categories. The sampling hot path builds
//! one per query over the per-range candidate counts; weighted runs
//! carry a persistent one over their record weights.
//!
//! Construction is the classic overfull/underfull pairing: scale each
//! probability by `n`, then repeatedly move mass from an overfull cell
//! into an underfull cell until every cell holds exactly 1.

use rand::Rng;

use crate::encoding::{self, Decode, Encode, EncodingError};

/// Alias table over `n` categories.
pub struct AliasTable {
    alias: Vec<u32>,
    probability: Vec<f64>,
}

impl AliasTable {
    /// Builds a table from non-negative weights.
    ///
    /// Weights need not be normalized; they are scaled by their sum.
    /// An empty or all-zero weight vector yields an empty table from
    /// which [`Self::draw`] always returns 0.
    pub fn build(weights: &[f64]) -> Self {
        let n = weights.len();
        let total: f64 = weights.iter().sum();
        if n == 0 || total <= 0.0 {
            return Self {
                alias: Vec::new(),
                probability: Vec::new(),
            };
        }

        let mut alias = vec![0u32; n];
        let mut probability = vec![0.0f64; n];

        let mut overfull = Vec::new();
        let mut underfull = Vec::new();

        for (i, w) in weights.iter().enumerate() {
            probability[i] = n as f64 * (w / total);
            if probability[i] > 1.0 {
                overfull.push(i);
            } else if probability[i] < 1.0 {
                underfull.push(i);
            } else {
                alias[i] = i as u32;
            }
        }

        while let (Some(i), Some(j)) = (overfull.pop(), underfull.pop()) {
            alias[j] = i as u32;
            probability[i] = probability[i] + probability[j] - 1.0;

            if probability[i] > 1.0 {
                overfull.push(i);
            } else if probability[i] < 1.0 {
                underfull.push(i);
            }
        }

        Self { alias, probability }
    }

    /// Draws one category index.
    ///
    /// Generates both variates rather than deriving the second from the
    /// first; the coupled single-call variant is faster but biases the
    /// low-order bits of some generators.
    pub fn draw<R: Rng>(&self, rng: &mut R) -> usize {
        if self.probability.is_empty() {
            return 0;
        }

        let i = rng.random_range(0..self.probability.len());
        let y: f64 = rng.random();

        if y < self.probability[i] {
            i
        } else {
            self.alias[i] as usize
        }
    }

    /// Number of categories.
    pub fn len(&self) -> usize {
        self.probability.len()
    }

    /// True for the degenerate empty table.
    pub fn is_empty(&self) -> bool {
        self.probability.is_empty()
    }

    /// Heap footprint in bytes.
    pub fn memory_utilization(&self) -> usize {
        self.alias.len() * std::mem::size_of::<u32>()
            + self.probability.len() * std::mem::size_of::<f64>()
    }
}

// ------------------------------------------------------------------------------------------------
// Encoding — weighted runs persist their alias table alongside the data
// ------------------------------------------------------------------------------------------------

impl Encode for AliasTable {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::encode_vec(&self.alias, buf)?;
        encoding::encode_vec(&self.probability, buf)?;
        Ok(())
    }
}

impl Decode for AliasTable {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (alias, n) = encoding::decode_vec::<u32>(&buf[off..])?;
        off += n;
        let (probability, n) = encoding::decode_vec::<f64>(&buf[off..])?;
        off += n;
        if alias.len() != probability.len() {
            return Err(EncodingError::Custom(
                "alias table arrays disagree on length".into(),
            ));
        }
        Ok((Self { alias, probability }, off))
    }
}
