// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Strided host tensors used as the operand, scale and output buffers of the
//! grouped GEMM. Values are held in `f32` regardless of the logical dtype; the
//! dtype only feeds resource estimates and the output layout.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SgmmError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F8E4M3,
    F8E5M2,
    BF16,
    F16,
    F32,
    I32,
}

impl DType {
    pub fn size_bytes(self) -> usize {
        match self {
            DType::F8E4M3 | DType::F8E5M2 => 1,
            DType::BF16 | DType::F16 => 2,
            DType::F32 | DType::I32 => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::F8E4M3 => "float8_e4m3fn",
            DType::F8E5M2 => "float8_e5m2",
            DType::BF16 => "bfloat16",
            DType::F16 => "float16",
            DType::F32 => "float32",
            DType::I32 => "int32",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Row-major strides for `sizes`.
pub fn contiguous_strides(sizes: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; sizes.len()];
    for dim in (0..sizes.len().saturating_sub(1)).rev() {
        strides[dim] = strides[dim + 1] * sizes[dim + 1].max(1);
    }
    strides
}

#[derive(Clone, Debug, PartialEq)]
pub struct HostTensor {
    dtype: DType,
    sizes: Vec<usize>,
    strides: Vec<usize>,
    data: Vec<f32>,
}

impl HostTensor {
    /// Contiguous tensor over `data`.
    pub fn from_vec(dtype: DType, sizes: &[usize], data: Vec<f32>) -> Result<Self> {
        Self::with_strides(dtype, sizes, &contiguous_strides(sizes), data)
    }

    /// Tensor over `data` with explicit element strides. The storage must
    /// cover the largest reachable element.
    pub fn with_strides(
        dtype: DType,
        sizes: &[usize],
        strides: &[usize],
        data: Vec<f32>,
    ) -> Result<Self> {
        let storage_error = || SgmmError::Storage {
            sizes: sizes.to_vec(),
            strides: strides.to_vec(),
            len: data.len(),
        };
        if sizes.len() != strides.len() {
            return Err(storage_error());
        }
        if sizes.iter().any(|&size| size == 0) {
            return Ok(Self {
                dtype,
                sizes: sizes.to_vec(),
                strides: strides.to_vec(),
                data,
            });
        }
        let last = sizes
            .iter()
            .zip(strides)
            .map(|(&size, &stride)| (size - 1) * stride)
            .sum::<usize>();
        if last >= data.len() {
            return Err(storage_error());
        }
        Ok(Self {
            dtype,
            sizes: sizes.to_vec(),
            strides: strides.to_vec(),
            data,
        })
    }

    pub fn zeros(dtype: DType, sizes: &[usize]) -> Self {
        let numel = sizes.iter().product();
        Self {
            dtype,
            sizes: sizes.to_vec(),
            strides: contiguous_strides(sizes),
            data: vec![0.0; numel],
        }
    }

    /// Same storage viewed with the last two dimensions swapped. A `[.., N, K]`
    /// contiguous buffer becomes a logical `[.., K, N]` operand stored
    /// transposed.
    pub fn transpose_last_two(self) -> Self {
        let mut sizes = self.sizes;
        let mut strides = self.strides;
        let rank = sizes.len();
        if rank >= 2 {
            sizes.swap(rank - 1, rank - 2);
            strides.swap(rank - 1, rank - 2);
        }
        Self {
            dtype: self.dtype,
            sizes,
            strides,
            data: self.data,
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn rank(&self) -> usize {
        self.sizes.len()
    }

    pub fn numel(&self) -> usize {
        self.sizes.iter().product()
    }

    /// Backing storage, in storage order.
    pub fn storage(&self) -> &[f32] {
        &self.data
    }

    /// Element at a flat storage offset.
    #[inline]
    pub fn at_offset(&self, offset: usize) -> f32 {
        self.data[offset]
    }

    pub fn offset_of(&self, index: &[usize]) -> usize {
        debug_assert_eq!(index.len(), self.sizes.len());
        index
            .iter()
            .zip(&self.strides)
            .map(|(&i, &stride)| i * stride)
            .sum()
    }

    pub fn get(&self, index: &[usize]) -> f32 {
        self.data[self.offset_of(index)]
    }

    pub fn set(&mut self, index: &[usize], value: f32) {
        let offset = self.offset_of(index);
        self.data[offset] = value;
    }

    /// Elements in logical row-major order.
    pub fn to_vec(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.numel());
        if self.numel() == 0 {
            return out;
        }
        let mut index = vec![0usize; self.sizes.len()];
        loop {
            out.push(self.get(&index));
            let mut dim = self.sizes.len();
            loop {
                if dim == 0 {
                    return out;
                }
                dim -= 1;
                index[dim] += 1;
                if index[dim] < self.sizes[dim] {
                    break;
                }
                index[dim] = 0;
            }
        }
    }

    /// Largest absolute element-wise difference, `None` when shapes differ.
    pub fn max_abs_diff(&self, other: &HostTensor) -> Option<f32> {
        if self.sizes != other.sizes {
            return None;
        }
        Some(
            self.to_vec()
                .iter()
                .zip(other.to_vec())
                .map(|(a, b)| (a - b).abs())
                .fold(0.0f32, f32::max),
        )
    }
}
