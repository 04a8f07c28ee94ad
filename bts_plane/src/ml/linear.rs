use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    ml::{LayerValues, NodeValue},
    Error, Result,
};

/// Row-major 2D block of values: `count` rows of `stride` columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Linear {
    inner: LayerValues,
    stride: usize,
    count: usize,
}

impl Linear {
    pub fn new(count: usize, stride: usize) -> Self {
        Self::with_value(count, stride, 0.0)
    }

    pub fn with_dimensions(other: &Self) -> Self {
        Self::with_value(other.count, other.stride, 0.0)
    }

    pub fn with_value(count: usize, stride: usize, value: NodeValue) -> Self {
        let size = count * stride;
        Self {
            inner: LayerValues::new(vec![value; size]),
            stride,
            count,
        }
    }

    pub fn from_iter<I: Iterator<Item = NodeValue>>(stride: usize, values: I) -> Result<Self> {
        let inner: LayerValues = values.collect();
        if stride == 0 {
            return if inner.is_empty() {
                Ok(Self::new(0, 0))
            } else {
                Err(Error::Shape("non-empty values with zero stride".to_string()))
            };
        }
        let count = inner.len() / stride;

        if inner.len() != stride * count {
            return Err(Error::Shape(format!(
                "mismatched values length/stride: len={}, stride={stride}",
                inner.len()
            )));
        }

        Ok(Self {
            inner,
            stride,
            count,
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.count, self.stride)
    }

    pub fn values(&self) -> &[NodeValue] {
        &self.inner
    }

    pub fn values_mut(&mut self) -> &mut [NodeValue] {
        &mut self.inner
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeValue> + '_ {
        self.inner.iter().copied()
    }

    pub fn row(&self, idx: usize) -> &[NodeValue] {
        &self.inner[idx * self.stride..(idx + 1) * self.stride]
    }

    pub fn row_mut(&mut self, idx: usize) -> &mut [NodeValue] {
        let stride = self.stride;
        &mut self.inner[idx * stride..(idx + 1) * stride]
    }

    pub fn rows_iter(&self) -> impl Iterator<Item = &[NodeValue]> {
        // chunks_exact panics on a zero stride
        self.inner.chunks_exact(self.stride.max(1)).take(self.count)
    }

    pub fn get(&self, row: usize, col: usize) -> NodeValue {
        self.inner[row * self.stride + col]
    }

    pub fn zero(&mut self) {
        self.inner.iter_mut().for_each(|x| *x = 0.0);
    }

    pub fn is_finite(&self) -> bool {
        self.inner.is_finite()
    }

    pub fn squared_norm(&self) -> NodeValue {
        self.inner.squared_norm()
    }

    pub fn scale(&mut self, factor: NodeValue) {
        self.inner.iter_mut().for_each(|x| *x *= factor);
    }

    pub fn add_scaled(&mut self, rhs: &Linear, factor: NodeValue) -> Result<()> {
        if self.shape() != rhs.shape() {
            return Err(Error::Shape(format!(
                "cannot add {:?} to {:?}",
                rhs.shape(),
                self.shape()
            )));
        }
        self.inner
            .iter_mut()
            .zip(rhs.inner.iter())
            .for_each(|(x, y)| *x += y * factor);
        Ok(())
    }

    /// Copies this block into `count` rows, padding with `value` or truncating.
    pub fn padded_rows(&self, count: usize, value: NodeValue) -> Self {
        let mut padded = Self::with_value(count, self.stride, value);
        let copied = self.count.min(count) * self.stride;
        padded.inner[..copied].copy_from_slice(&self.inner[..copied]);
        padded
    }

    pub fn slice_rows(&self, start: usize, end: usize) -> Self {
        let end = end.min(self.count);
        let start = start.min(end);
        Self {
            inner: LayerValues::from(&self.inner[start * self.stride..end * self.stride]),
            stride: self.stride,
            count: end - start,
        }
    }

    pub fn to_nested(&self) -> Vec<Vec<NodeValue>> {
        self.rows_iter().map(|row| row.to_vec()).collect_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_rejects_mismatched_stride() {
        assert!(Linear::from_iter(3, [1.0, 2.0].into_iter()).is_err());
        let linear = Linear::from_iter(2, [1.0, 2.0, 3.0, 4.0].into_iter()).unwrap();
        assert_eq!(linear.shape(), (2, 2));
        assert_eq!(linear.row(1), &[3.0, 4.0]);
    }

    #[test]
    fn linear_can_pad_and_slice_rows() {
        let linear = Linear::from_iter(2, [1.0, 2.0, 3.0, 4.0].into_iter()).unwrap();
        let padded = linear.padded_rows(3, 0.0);
        assert_eq!(padded.to_nested(), vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![0.0, 0.0]]);

        let sliced = padded.slice_rows(1, 3);
        assert_eq!(sliced.to_nested(), vec![vec![3.0, 4.0], vec![0.0, 0.0]]);
    }
}
