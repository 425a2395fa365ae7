// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

/// Smallest contraction or output extent a generated kernel accepts.
pub const MIN_GENERATED_EXTENT: usize = 32;

/// Decides whether generated kernels may join the round at all.
///
/// `a_sizes` is A's shape; `b_sizes` is B's logical `[.., K, N]` shape.
pub fn can_use_generated_kernel(
    a_sizes: &[usize],
    b_sizes: &[usize],
    offsets_present: bool,
    bias_present: bool,
    device_supports_descriptors: bool,
) -> bool {
    if !device_supports_descriptors || bias_present {
        return false;
    }
    let last = |sizes: &[usize]| sizes[sizes.len() - 1];
    let second_last = |sizes: &[usize]| sizes[sizes.len() - 2];
    match (a_sizes.len(), b_sizes.len()) {
        (2, 2) => offsets_present && last(b_sizes) >= MIN_GENERATED_EXTENT,
        (2, 3) => {
            offsets_present
                && last(a_sizes) >= MIN_GENERATED_EXTENT
                && second_last(b_sizes) >= MIN_GENERATED_EXTENT
        }
        (3, 2) => offsets_present && second_last(b_sizes) >= MIN_GENERATED_EXTENT,
        (3, 3) => {
            !offsets_present
                && last(a_sizes) >= MIN_GENERATED_EXTENT
                && last(b_sizes) >= MIN_GENERATED_EXTENT
        }
        _ => false,
    }
}
