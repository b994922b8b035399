use qc_columnar::BitMask;
use qc_expr::{EvalContext, Expr, evaluate};
use qc_index::TimeIndex;

use crate::QcError;

/// Rows to evaluate: `true` keeps a timestamp in the tests, `false`
/// excludes it.
///
/// The filter carries its own timestamps so it survives re-indexing of the
/// session data; timestamps it does not know about are kept.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeFilter {
    index: TimeIndex,
    keep: BitMask,
}

impl TimeFilter {
    pub fn new(index: TimeIndex, keep: BitMask) -> Result<Self, QcError> {
        if index.len() != keep.len() {
            return Err(QcError::Configuration(format!(
                "time filter has {} values for {} timestamps",
                keep.len(),
                index.len()
            )));
        }
        Ok(Self { index, keep })
    }

    pub fn from_bools(index: TimeIndex, keep: &[bool]) -> Result<Self, QcError> {
        Self::new(index, BitMask::from_bools(keep))
    }

    /// Keep a row only when every output column of a boolean expression
    /// is true there.
    pub fn from_expr(expr: &Expr, context: &EvalContext<'_>, index: &TimeIndex) -> Result<Self, QcError> {
        let masks = evaluate(expr, context)?.into_masks()?;
        let mut keep = BitMask::all_true(index.len());
        for mask in &masks {
            if mask.len() != keep.len() {
                return Err(QcError::Configuration(format!(
                    "time filter expression produced {} rows for {} timestamps",
                    mask.len(),
                    keep.len()
                )));
            }
            keep = keep.and_mask(mask);
        }
        Self::new(index.clone(), keep)
    }

    #[must_use]
    pub fn index(&self) -> &TimeIndex {
        &self.index
    }

    #[must_use]
    pub fn keep(&self) -> &BitMask {
        &self.keep
    }

    /// The filter as seen from `index`.
    #[must_use]
    pub fn aligned(&self, index: &TimeIndex) -> BitMask {
        if &self.index == index {
            return self.keep.clone();
        }
        let positions = self.index.get_indexer(index);
        self.keep.take(&positions, true)
    }
}
