//! Tensor shapes.

use std::fmt;

/// Dimensions of a tensor. Negative entries stand for symbolic dimensions
/// that are only known at run time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TensorShape {
    dims: Vec<i64>,
}

impl TensorShape {
    pub fn new(dims: impl Into<Vec<i64>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn dims(&self) -> &[i64] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Number of elements, or `None` when a dimension is symbolic or the
    /// product overflows. A scalar holds one element.
    pub fn element_count(&self) -> Option<usize> {
        self.dims.iter().try_fold(1usize, |acc, &d| {
            let d = usize::try_from(d).ok()?;
            acc.checked_mul(d)
        })
    }

    /// True iff the rank and every dimension equal `expected`.
    pub fn matches_dims(&self, expected: &[i64]) -> bool {
        self.dims.len() == expected.len() && self.dims.iter().zip(expected).all(|(a, b)| a == b)
    }
}

impl From<&[i64]> for TensorShape {
    fn from(dims: &[i64]) -> Self {
        Self::new(dims.to_vec())
    }
}

impl<const N: usize> From<[i64; N]> for TensorShape {
    fn from(dims: [i64; N]) -> Self {
        Self::new(dims.to_vec())
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            if *d < 0 {
                f.write_str("?")?;
            } else {
                write!(f, "{d}")?;
            }
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn scalar_has_one_element() {
        assert_eq!(TensorShape::scalar().element_count(), Some(1));
        assert_eq!(TensorShape::scalar().rank(), 0);
    }

    #[test]
    fn symbolic_dims_have_no_count() {
        assert_eq!(TensorShape::from([2, -1, 3]).element_count(), None);
    }

    #[test]
    fn overflow_has_no_count() {
        assert_eq!(TensorShape::from([i64::MAX, i64::MAX]).element_count(), None);
    }

    #[test]
    fn matches_dims_checks_rank_and_every_dim() {
        let shape = TensorShape::from([4, 2, 8]);
        assert!(shape.matches_dims(&[4, 2, 8]));
        assert!(!shape.matches_dims(&[4, 2]));
        assert!(!shape.matches_dims(&[4, 3, 8]));
        assert!(!shape.matches_dims(&[4, 2, 8, 1]));
        // A single agreeing dimension is not enough.
        assert!(!shape.matches_dims(&[4, 0, 0]));
    }

    #[test]
    fn display_marks_symbolic_dims() {
        assert_eq!(TensorShape::from([1, -1, 3]).to_string(), "[1, ?, 3]");
    }

    proptest! {
        #[test]
        fn shape_matches_its_own_dims(dims in proptest::collection::vec(-4i64..16, 0..6)) {
            let shape = TensorShape::new(dims.clone());
            prop_assert!(shape.matches_dims(&dims));
        }

        #[test]
        fn element_count_is_product_of_known_dims(dims in proptest::collection::vec(0i64..8, 0..5)) {
            let expected: usize = dims.iter().map(|&d| d as usize).product();
            prop_assert_eq!(TensorShape::new(dims).element_count(), Some(expected));
        }
    }
}
