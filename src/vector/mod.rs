//! Vector value type: construction, validation, arithmetic, and aggregates.
//!
//! A [`Vector`] is a fixed-dimension sequence of finite `f32` components.
//! Construction rejects non-finite elements and out-of-range dimensions, so
//! the distance kernels never have to branch on input quality.

/// Distance kernels and the [`Distance`](distance::Distance) dispatch enum.
pub mod distance;
/// Text literal and binary wire codecs.
pub mod text;

use crate::config;
use crate::error::{Result, VexError};
use serde::{Deserialize, Serialize};

/// A finite-dimension vector of finite `f32` components.
///
/// Equality is bitwise over elements; ordering is intentionally not defined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vector {
    data: Vec<f32>,
}

impl Vector {
    /// Construct from owned components, validating dimension and finiteness.
    pub fn new(data: Vec<f32>) -> Result<Self> {
        check_dim(data.len())?;
        for (i, &x) in data.iter().enumerate() {
            if !x.is_finite() {
                return Err(VexError::bad_input(format!(
                    "vector component {i} is not finite"
                )));
            }
        }
        Ok(Self { data })
    }

    /// Construct from a slice, validating dimension and finiteness.
    pub fn from_slice(data: &[f32]) -> Result<Self> {
        Self::new(data.to_vec())
    }

    /// Construct from components already known to be valid (decoded from the
    /// index's own pages). Debug builds still assert the invariant.
    pub(crate) fn from_trusted(data: Vec<f32>) -> Self {
        debug_assert!(!data.is_empty() && data.iter().all(|x| x.is_finite()));
        Self { data }
    }

    /// Number of components.
    #[inline]
    pub fn dims(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Consume the vector, returning its components.
    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Euclidean norm, accumulated in `f64` like all user-facing results.
    pub fn norm(&self) -> f64 {
        distance::norm_sq(&self.data).sqrt()
    }

    /// L2-normalize. Returns `None` for the zero vector, whose direction is
    /// undefined.
    pub fn l2_normalize(&self) -> Option<Vector> {
        let norm = distance::norm_sq(&self.data).sqrt();
        if norm == 0.0 {
            return None;
        }
        let inv = (1.0 / norm) as f32;
        Some(Vector {
            data: self.data.iter().map(|&x| x * inv).collect(),
        })
    }

    /// Element-wise sum. Fails with `Overflow` when any output component is
    /// non-finite.
    pub fn checked_add(&self, other: &Vector) -> Result<Vector> {
        self.zip_map(other, "vector addition", |a, b| a + b)
    }

    /// Element-wise difference.
    pub fn checked_sub(&self, other: &Vector) -> Result<Vector> {
        self.zip_map(other, "vector subtraction", |a, b| a - b)
    }

    /// Element-wise product.
    pub fn checked_mul(&self, other: &Vector) -> Result<Vector> {
        self.zip_map(other, "vector multiplication", |a, b| a * b)
    }

    fn zip_map(
        &self,
        other: &Vector,
        op: &'static str,
        f: impl Fn(f32, f32) -> f32,
    ) -> Result<Vector> {
        check_same_dim(self, other)?;
        let data: Vec<f32> = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(&a, &b)| f(a, b))
            .collect();
        if data.iter().any(|x| !x.is_finite()) {
            return Err(VexError::Overflow(op));
        }
        Ok(Vector { data })
    }
}

impl PartialEq for Vector {
    /// Bitwise equality over components.
    fn eq(&self, other: &Self) -> bool {
        self.data.len() == other.data.len()
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

impl Eq for Vector {}

/// Validate a dimension against the storage limit.
pub(crate) fn check_dim(dims: usize) -> Result<()> {
    if dims == 0 {
        return Err(VexError::bad_input("vector must have at least 1 dimension"));
    }
    if dims > config::MAX_DIM {
        return Err(VexError::bad_input(format!(
            "vector cannot have more than {} dimensions",
            config::MAX_DIM
        )));
    }
    Ok(())
}

/// Validate that two vectors share a dimension.
#[inline]
pub(crate) fn check_same_dim(a: &Vector, b: &Vector) -> Result<()> {
    if a.dims() != b.dims() {
        return Err(VexError::DimensionMismatch {
            expected: a.dims(),
            actual: b.dims(),
        });
    }
    Ok(())
}

/// Running aggregate state for `sum(vector)` / `avg(vector)`.
///
/// Keeps one `f32` accumulator per component plus an integer count. Both
/// finishers fail with `Overflow` when any accumulator has gone non-finite.
#[derive(Debug, Clone, Default)]
pub struct VectorAggregate {
    count: u64,
    sums: Vec<f32>,
}

impl VectorAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one vector into the aggregate. The first vector fixes the
    /// dimension; later mismatches fail.
    pub fn accumulate(&mut self, v: &Vector) -> Result<()> {
        if self.count == 0 {
            self.sums = v.as_slice().to_vec();
            self.count = 1;
            return Ok(());
        }
        if self.sums.len() != v.dims() {
            return Err(VexError::DimensionMismatch {
                expected: self.sums.len(),
                actual: v.dims(),
            });
        }
        for (acc, &x) in self.sums.iter_mut().zip(v.as_slice()) {
            *acc += x;
        }
        self.count += 1;
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Final `sum`. `None` over an empty input.
    pub fn sum(self) -> Result<Option<Vector>> {
        if self.count == 0 {
            return Ok(None);
        }
        if self.sums.iter().any(|x| !x.is_finite()) {
            return Err(VexError::Overflow("vector sum"));
        }
        Ok(Some(Vector { data: self.sums }))
    }

    /// Final `avg`. `None` over an empty input.
    pub fn avg(self) -> Result<Option<Vector>> {
        if self.count == 0 {
            return Ok(None);
        }
        if self.sums.iter().any(|x| !x.is_finite()) {
            return Err(VexError::Overflow("vector average"));
        }
        let inv = 1.0 / self.count as f32;
        Ok(Some(Vector {
            data: self.sums.iter().map(|&x| x * inv).collect(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_nan_and_infinity() {
        assert!(Vector::new(vec![1.0, f32::NAN]).is_err());
        assert!(Vector::new(vec![f32::INFINITY]).is_err());
        assert!(Vector::new(vec![1.0, -2.5]).is_ok());
    }

    #[test]
    fn test_new_rejects_bad_dimensions() {
        assert!(Vector::new(vec![]).is_err());
        assert!(Vector::new(vec![0.0; config::MAX_DIM + 1]).is_err());
        assert!(Vector::new(vec![0.0; config::MAX_DIM]).is_ok());
    }

    #[test]
    fn test_bitwise_equality() {
        let a = Vector::new(vec![1.0, 2.0]).unwrap();
        let b = Vector::new(vec![1.0, 2.0]).unwrap();
        assert_eq!(a, b);
        // -0.0 == 0.0 numerically but the bit patterns differ
        let neg = Vector::new(vec![-0.0, 2.0]).unwrap();
        assert_ne!(a, neg);
    }

    #[test]
    fn test_checked_add_overflow() {
        let a = Vector::new(vec![f32::MAX]).unwrap();
        let b = Vector::new(vec![f32::MAX]).unwrap();
        assert!(matches!(a.checked_add(&b), Err(VexError::Overflow(_))));
    }

    #[test]
    fn test_checked_ops() {
        let a = Vector::new(vec![1.0, 2.0, 3.0]).unwrap();
        let b = Vector::new(vec![4.0, 5.0, 6.0]).unwrap();
        assert_eq!(
            a.checked_add(&b).unwrap().as_slice(),
            &[5.0, 7.0, 9.0][..]
        );
        assert_eq!(
            b.checked_sub(&a).unwrap().as_slice(),
            &[3.0, 3.0, 3.0][..]
        );
        assert_eq!(
            a.checked_mul(&b).unwrap().as_slice(),
            &[4.0, 10.0, 18.0][..]
        );
    }

    #[test]
    fn test_dimension_mismatch() {
        let a = Vector::new(vec![1.0, 2.0]).unwrap();
        let b = Vector::new(vec![1.0, 2.0, 3.0]).unwrap();
        assert!(matches!(
            a.checked_add(&b),
            Err(VexError::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_norm() {
        let v = Vector::new(vec![3.0, 4.0]).unwrap();
        assert!((v.norm() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_l2_normalize() {
        let v = Vector::new(vec![3.0, 4.0]).unwrap();
        let n = v.l2_normalize().unwrap();
        assert!((n.norm() - 1.0).abs() < 1e-6);
        let zero = Vector::new(vec![0.0, 0.0]).unwrap();
        assert!(zero.l2_normalize().is_none());
    }

    #[test]
    fn test_aggregate_sum_and_avg() {
        let mut agg = VectorAggregate::new();
        agg.accumulate(&Vector::new(vec![1.0, 2.0]).unwrap()).unwrap();
        agg.accumulate(&Vector::new(vec![3.0, 4.0]).unwrap()).unwrap();
        let avg = agg.clone().avg().unwrap().unwrap();
        assert_eq!(avg.as_slice(), &[2.0, 3.0][..]);
        let sum = agg.sum().unwrap().unwrap();
        assert_eq!(sum.as_slice(), &[4.0, 6.0][..]);
    }

    #[test]
    fn test_aggregate_empty() {
        assert!(VectorAggregate::new().avg().unwrap().is_none());
        assert!(VectorAggregate::new().sum().unwrap().is_none());
    }

    #[test]
    fn test_aggregate_overflow() {
        let mut agg = VectorAggregate::new();
        agg.accumulate(&Vector::new(vec![f32::MAX]).unwrap()).unwrap();
        agg.accumulate(&Vector::new(vec![f32::MAX]).unwrap()).unwrap();
        assert!(matches!(agg.avg(), Err(VexError::Overflow(_))));
    }

    #[test]
    fn test_aggregate_dimension_mismatch() {
        let mut agg = VectorAggregate::new();
        agg.accumulate(&Vector::new(vec![1.0, 2.0]).unwrap()).unwrap();
        assert!(agg
            .accumulate(&Vector::new(vec![1.0]).unwrap())
            .is_err());
    }
}
