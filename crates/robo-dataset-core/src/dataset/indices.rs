//! Row index arguments accepted by batch access and selection.

use std::ops::Range;

/// A set of row positions: a half-open range or an explicit list.
///
/// Lists may repeat and reorder positions; results follow the list exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Indices {
    /// Contiguous positions `start..end`.
    Range(Range<usize>),
    /// Explicit positions in output order.
    List(Vec<usize>),
}

impl Indices {
    /// Number of requested positions.
    pub fn len(&self) -> usize {
        match self {
            Indices::Range(r) => r.len(),
            Indices::List(v) => v.len(),
        }
    }

    /// True if no position is requested.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Positions in output order.
    pub fn to_vec(&self) -> Vec<usize> {
        match self {
            Indices::Range(r) => r.clone().collect(),
            Indices::List(v) => v.clone(),
        }
    }
}

impl From<Range<usize>> for Indices {
    fn from(r: Range<usize>) -> Self {
        Indices::Range(r)
    }
}

impl From<Vec<usize>> for Indices {
    fn from(v: Vec<usize>) -> Self {
        Indices::List(v)
    }
}

impl From<&[usize]> for Indices {
    fn from(v: &[usize]) -> Self {
        Indices::List(v.to_vec())
    }
}

impl From<&Vec<usize>> for Indices {
    fn from(v: &Vec<usize>) -> Self {
        Indices::List(v.clone())
    }
}

impl<const N: usize> From<[usize; N]> for Indices {
    fn from(v: [usize; N]) -> Self {
        Indices::List(v.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_and_lists_expand_in_order() {
        assert_eq!(Indices::from(2..5).to_vec(), vec![2, 3, 4]);
        assert_eq!(Indices::from([3, 1, 3]).to_vec(), vec![3, 1, 3]);
        assert!(Indices::from(4..4).is_empty());
        assert_eq!(Indices::from(&[7usize][..]).len(), 1);
    }
}
