// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

// Installs the process-wide tuning configuration, so this binary holds a
// single test.

use spiral_config::{tuning, TuningConfig};
use st_sgmm::autotune::CandidateStatus;
use st_sgmm::reference::REFERENCE_NAME;
use st_sgmm::{
    scaled_grouped_mm, DType, GroupedMmInputs, HardwareFamily, HostScratchAllocator, HostTensor,
    ScaledGroupedMmRequest, StaticDevice,
};

fn ones(sizes: &[usize]) -> HostTensor {
    let numel = sizes.iter().product();
    HostTensor::from_vec(DType::F8E4M3, sizes, vec![1.0; numel]).unwrap()
}

fn b_operand(logical: &[usize]) -> HostTensor {
    let mut stored = logical.to_vec();
    let rank = stored.len();
    stored.swap(rank - 1, rank - 2);
    ones(&stored).transpose_last_two()
}

#[test]
fn default_entry_point_uses_installed_tuning() {
    let installed = tuning::configure(TuningConfig {
        warmup: 0,
        repeats: 2,
        include_reference: false,
        num_units: Some(4),
        ..TuningConfig::default()
    });
    assert!(!installed.include_reference);
    assert_eq!(tuning::config(), installed);

    let inputs = GroupedMmInputs {
        mat_a: ones(&[2, 64, 32]),
        mat_b: b_operand(&[2, 32, 64]),
        scale_a: ones(&[2, 64]),
        scale_b: ones(&[2, 64]),
        offsets: None,
        bias: None,
        use_fast_accum: false,
    };
    let device = StaticDevice {
        shared_memory_bytes: 65_536,
        compute_units: 304,
        tensor_descriptors: true,
        family: HardwareFamily::Alternate,
    };
    let allocator = HostScratchAllocator::new();
    let selection =
        scaled_grouped_mm(&ScaledGroupedMmRequest::new(inputs), &device, &allocator).unwrap();

    assert_ne!(selection.winner, REFERENCE_NAME);
    assert!(selection.timing(REFERENCE_NAME).is_none());
    // Only BLOCK_N=32 survives pruning here, across every BLOCK_M, BLOCK_K,
    // stage and warp choice.
    assert!(selection.timings.len() > 1);
    let winner = selection.timing(&selection.winner).unwrap();
    assert_eq!(winner.status, CandidateStatus::Timed);
    assert_eq!(winner.samples, 2);
    assert!(selection.output.to_vec().iter().all(|&v| v == 32.0));
}
