//! NF-020: Minimal dense `f32` tensor used by the reference modules and by
//! the persistence helpers. Row-major, owned storage.

use crate::core::error::{Error, Result};
use std::fmt;

/// Largest element count a tensor built from config or CLI input may have.
pub const MAX_NUMEL: usize = 1 << 28;

/// Element count of `shape`, or None if it overflows or exceeds [`MAX_NUMEL`].
pub fn checked_numel(shape: &[usize]) -> Option<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .filter(|&n| n <= MAX_NUMEL)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Tensor of the given shape filled with `value`. Shapes from untrusted
    /// input go through [`checked_numel`] first.
    pub fn full(shape: &[usize], value: f32) -> Self {
        let numel = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![value; numel],
        }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, 1.0)
    }

    /// Build from raw row-major data. The element count must match the shape.
    pub fn from_vec(shape: &[usize], data: Vec<f32>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(Error::Forward(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                numel,
                data.len()
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Same data under a new shape with equal element count.
    pub fn reshape(&self, shape: &[usize]) -> Result<Self> {
        Self::from_vec(shape, self.data.clone())
    }

    /// Elementwise map.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        Self {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&x| f(x)).collect(),
        }
    }

    /// Elementwise combination of two tensors with identical shapes.
    pub fn zip_with(&self, other: &Tensor, f: impl Fn(f32, f32) -> f32) -> Result<Self> {
        if self.shape != other.shape {
            return Err(Error::Forward(format!(
                "shape mismatch: {:?} vs {:?}",
                self.shape, other.shape
            )));
        }
        Ok(Self {
            shape: self.shape.clone(),
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect(),
        })
    }

    /// Normalize a possibly negative axis against `ndim`.
    pub fn axis(&self, dim: i64) -> Result<usize> {
        let ndim = self.ndim() as i64;
        let axis = if dim < 0 { ndim + dim } else { dim };
        if axis < 0 || axis >= ndim {
            return Err(Error::Forward(format!(
                "dimension {} out of range for {}-d tensor",
                dim, ndim
            )));
        }
        Ok(axis as usize)
    }

    /// Concatenate along `dim`. All other dimensions must agree.
    pub fn concat(tensors: &[&Tensor], dim: i64) -> Result<Self> {
        let first = tensors
            .first()
            .ok_or_else(|| Error::Forward("concat needs at least one tensor".to_string()))?;
        let axis = first.axis(dim)?;
        for t in &tensors[1..] {
            let compatible = t.ndim() == first.ndim()
                && t.shape
                    .iter()
                    .zip(&first.shape)
                    .enumerate()
                    .all(|(i, (a, b))| i == axis || a == b);
            if !compatible {
                return Err(Error::Forward(format!(
                    "cannot concat {:?} with {:?} along {}",
                    first.shape, t.shape, axis
                )));
            }
        }

        let outer: usize = first.shape[..axis].iter().product();
        let inner: usize = first.shape[axis + 1..].iter().product();
        let mut shape = first.shape.clone();
        shape[axis] = tensors.iter().map(|t| t.shape[axis]).sum();

        let mut data = Vec::with_capacity(shape.iter().product());
        for o in 0..outer {
            for t in tensors {
                let chunk = t.shape[axis] * inner;
                data.extend_from_slice(&t.data[o * chunk..(o + 1) * chunk]);
            }
        }
        Ok(Self { shape, data })
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor(shape={:?})", self.shape)
    }
}
