#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Packed boolean vector, one bit per row.
///
/// Used for per-column pass/fail flags and for the validity of numeric
/// columns. Bits past `len` in the last word are always zero.
#[derive(Debug, Clone, Eq)]
pub struct BitMask {
    words: Vec<u64>,
    len: usize,
}

impl BitMask {
    #[must_use]
    pub fn from_bools(values: &[bool]) -> Self {
        let mut mask = Self::all_false(values.len());
        for (idx, &value) in values.iter().enumerate() {
            if value {
                mask.words[idx / 64] |= 1_u64 << (idx % 64);
            }
        }
        mask
    }

    #[must_use]
    pub fn all_true(len: usize) -> Self {
        let word_count = len.div_ceil(64);
        let mut words = vec![u64::MAX; word_count];
        let remainder = len % 64;
        if remainder > 0 && !words.is_empty() {
            let last = words.len() - 1;
            words[last] = (1_u64 << remainder) - 1;
        }
        Self { words, len }
    }

    #[must_use]
    pub fn all_false(len: usize) -> Self {
        let word_count = len.div_ceil(64);
        Self {
            words: vec![0_u64; word_count],
            len,
        }
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> bool {
        if idx >= self.len {
            return false;
        }
        (self.words[idx / 64] >> (idx % 64)) & 1 == 1
    }

    pub fn set(&mut self, idx: usize, value: bool) {
        if idx >= self.len {
            return;
        }
        if value {
            self.words[idx / 64] |= 1_u64 << (idx % 64);
        } else {
            self.words[idx / 64] &= !(1_u64 << (idx % 64));
        }
    }

    /// Set every bit in `start..=end` (clamped to the mask length).
    pub fn set_range(&mut self, start: usize, end: usize, value: bool) {
        if self.len == 0 {
            return;
        }
        let end = end.min(self.len - 1);
        for idx in start..=end {
            self.set(idx, value);
        }
    }

    #[must_use]
    pub fn count_true(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[must_use]
    pub fn any(&self) -> bool {
        self.words.iter().any(|w| *w != 0)
    }

    #[must_use]
    pub fn all(&self) -> bool {
        self.count_true() == self.len
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn and_mask(&self, other: &Self) -> Self {
        let len = self.len.min(other.len);
        let word_count = len.div_ceil(64);
        let words = self.words[..word_count]
            .iter()
            .zip(&other.words[..word_count])
            .map(|(a, b)| a & b)
            .collect();
        Self::trimmed(words, len)
    }

    #[must_use]
    pub fn or_mask(&self, other: &Self) -> Self {
        let len = self.len.min(other.len);
        let word_count = len.div_ceil(64);
        let words = self.words[..word_count]
            .iter()
            .zip(&other.words[..word_count])
            .map(|(a, b)| a | b)
            .collect();
        Self::trimmed(words, len)
    }

    #[must_use]
    pub fn not_mask(&self) -> Self {
        let words = self.words.iter().map(|w| !w).collect();
        Self::trimmed(words, self.len)
    }

    /// Gather bits by position; `None` positions become `fill`.
    #[must_use]
    pub fn take(&self, positions: &[Option<usize>], fill: bool) -> Self {
        let mut out = Self::all_false(positions.len());
        for (idx, position) in positions.iter().enumerate() {
            let value = position.map_or(fill, |pos| self.get(pos));
            out.set(idx, value);
        }
        out
    }

    pub fn bits(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.len).map(|idx| self.get(idx))
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<bool> {
        self.bits().collect()
    }

    fn trimmed(mut words: Vec<u64>, len: usize) -> Self {
        let remainder = len % 64;
        if remainder > 0 && !words.is_empty() {
            let last = words.len() - 1;
            words[last] &= (1_u64 << remainder) - 1;
        }
        Self { words, len }
    }
}

impl PartialEq for BitMask {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.bits().eq(other.bits())
    }
}

impl Serialize for BitMask {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let bits: Vec<bool> = self.bits().collect();
        let mut state = serializer.serialize_struct("BitMask", 1)?;
        state.serialize_field("bits", &bits)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for BitMask {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            bits: Vec<bool>,
        }
        let raw = Raw::deserialize(deserializer)?;
        Ok(Self::from_bools(&raw.bits))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithmeticOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithmeticOp {
    #[must_use]
    pub fn apply(self, left: f64, right: f64) -> f64 {
        match self {
            Self::Add => left + right,
            Self::Sub => left - right,
            Self::Mul => left * right,
            Self::Div => left / right,
        }
    }
}

/// Element-wise comparisons. A missing operand always compares false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOp {
    Gt,
    Lt,
    Eq,
    Ne,
    Ge,
    Le,
}

impl ComparisonOp {
    #[must_use]
    pub fn apply(self, left: f64, right: f64) -> bool {
        if left.is_nan() || right.is_nan() {
            return false;
        }
        match self {
            Self::Gt => left > right,
            Self::Lt => left < right,
            Self::Eq => left == right,
            Self::Ne => left != right,
            Self::Ge => left >= right,
            Self::Le => left <= right,
        }
    }

    /// The operator that gives the same answer with operands swapped.
    #[must_use]
    pub fn reversed(self) -> Self {
        match self {
            Self::Gt => Self::Lt,
            Self::Lt => Self::Gt,
            Self::Eq => Self::Eq,
            Self::Ne => Self::Ne,
            Self::Ge => Self::Le,
            Self::Le => Self::Ge,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ColumnError {
    #[error("column length mismatch: left={left}, right={right}")]
    LengthMismatch { left: usize, right: usize },
}

/// Float column where NaN is the missing-value sentinel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    values: Vec<f64>,
    #[serde(skip)]
    validity: Option<BitMask>,
}

impl PartialEq for Column {
    fn eq(&self, other: &Self) -> bool {
        self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(a, b)| (a.is_nan() && b.is_nan()) || a == b)
    }
}

impl Column {
    /// Infinite values are stored as missing.
    #[must_use]
    pub fn new(values: Vec<f64>) -> Self {
        let values: Vec<f64> = values
            .into_iter()
            .map(|v| if v.is_infinite() { f64::NAN } else { v })
            .collect();
        let validity = BitMask::from_bools(&values.iter().map(|v| !v.is_nan()).collect::<Vec<_>>());
        Self {
            values,
            validity: Some(validity),
        }
    }

    #[must_use]
    pub fn missing(len: usize) -> Self {
        Self::new(vec![f64::NAN; len])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    #[must_use]
    pub fn value(&self, idx: usize) -> Option<f64> {
        self.values.get(idx).copied()
    }

    #[must_use]
    pub fn is_missing(&self, idx: usize) -> bool {
        self.values.get(idx).is_none_or(|v| v.is_nan())
    }

    /// Bit set where the value is present.
    #[must_use]
    pub fn validity(&self) -> BitMask {
        match &self.validity {
            Some(mask) => mask.clone(),
            None => BitMask::from_bools(&self.values.iter().map(|v| !v.is_nan()).collect::<Vec<_>>()),
        }
    }

    #[must_use]
    pub fn count_valid(&self) -> usize {
        self.values.iter().filter(|v| !v.is_nan()).count()
    }

    pub fn set_missing(&mut self, idx: usize) {
        if let Some(slot) = self.values.get_mut(idx) {
            *slot = f64::NAN;
            if let Some(mask) = &mut self.validity {
                mask.set(idx, false);
            }
        }
    }

    /// Keep values where `keep` is set, missing elsewhere.
    #[must_use]
    pub fn where_mask(&self, keep: &BitMask) -> Self {
        Self::new(
            self.values
                .iter()
                .enumerate()
                .map(|(idx, v)| if keep.get(idx) { *v } else { f64::NAN })
                .collect(),
        )
    }

    #[must_use]
    pub fn map(&self, func: impl Fn(f64) -> f64) -> Self {
        Self::new(self.values.iter().map(|v| func(*v)).collect())
    }

    pub fn binary_op(&self, other: &Self, op: ArithmeticOp) -> Result<Self, ColumnError> {
        if self.len() != other.len() {
            return Err(ColumnError::LengthMismatch {
                left: self.len(),
                right: other.len(),
            });
        }
        Ok(Self::new(
            self.values
                .iter()
                .zip(&other.values)
                .map(|(l, r)| op.apply(*l, *r))
                .collect(),
        ))
    }

    /// `self op scalar`, or `scalar op self` when `scalar_on_left`.
    #[must_use]
    pub fn scalar_op(&self, scalar: f64, op: ArithmeticOp, scalar_on_left: bool) -> Self {
        self.map(|v| {
            if scalar_on_left {
                op.apply(scalar, v)
            } else {
                op.apply(v, scalar)
            }
        })
    }

    pub fn compare(&self, other: &Self, op: ComparisonOp) -> Result<BitMask, ColumnError> {
        if self.len() != other.len() {
            return Err(ColumnError::LengthMismatch {
                left: self.len(),
                right: other.len(),
            });
        }
        let bits: Vec<bool> = self
            .values
            .iter()
            .zip(&other.values)
            .map(|(l, r)| op.apply(*l, *r))
            .collect();
        Ok(BitMask::from_bools(&bits))
    }

    #[must_use]
    pub fn compare_scalar(&self, scalar: f64, op: ComparisonOp) -> BitMask {
        let bits: Vec<bool> = self.values.iter().map(|v| op.apply(*v, scalar)).collect();
        BitMask::from_bools(&bits)
    }

    /// Bit set where the value equals one of `candidates`.
    #[must_use]
    pub fn isin(&self, candidates: &[f64]) -> BitMask {
        let bits: Vec<bool> = self
            .values
            .iter()
            .map(|v| !v.is_nan() && candidates.iter().any(|c| c == v))
            .collect();
        BitMask::from_bools(&bits)
    }

    /// `value[i] - value[i - periods]`; the first `periods` rows are missing.
    #[must_use]
    pub fn diff(&self, periods: usize) -> Self {
        let out = (0..self.len())
            .map(|idx| {
                if idx < periods {
                    f64::NAN
                } else {
                    self.values[idx] - self.values[idx - periods]
                }
            })
            .collect();
        Self::new(out)
    }

    #[must_use]
    pub fn abs(&self) -> Self {
        self.map(f64::abs)
    }

    /// Gather values by position; `None` positions become missing.
    #[must_use]
    pub fn take(&self, positions: &[Option<usize>]) -> Self {
        Self::new(
            positions
                .iter()
                .map(|pos| pos.and_then(|p| self.value(p)).unwrap_or(f64::NAN))
                .collect(),
        )
    }

    #[must_use]
    pub fn slice(&self, start: usize, end: usize) -> &[f64] {
        let end = end.min(self.values.len());
        let start = start.min(end);
        &self.values[start..end]
    }
}

impl From<Vec<f64>> for Column {
    fn from(values: Vec<f64>) -> Self {
        Self::new(values)
    }
}
