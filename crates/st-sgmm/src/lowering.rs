// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Entry point for scaled grouped GEMM: resolves the output layout, gathers
//! candidates and runs one autotuning round.

use spiral_config::TuningConfig;
use tracing::{debug, info, warn};

use crate::autotune::{autotune_select, BenchmarkSettings, Choice, GroupedMmInputs, Selection};
use crate::codegen::KernelOptions;
use crate::config_space::{generate_configs, HardwareFamily};
use crate::device::DeviceQuery;
use crate::eligibility::can_use_generated_kernel;
use crate::error::Result;
use crate::kernel::{GeneratedKernel, DESCRIPTOR_ALIGNMENT, DESCRIPTOR_SCRATCH_BYTES};
use crate::problem::{check_supported_striding, resolve_output_layout, OutputLayout, ProblemShape};
use crate::prune::prune;
use crate::reference::ReferenceChoice;
use crate::scratch::{RoundScratch, ScratchAllocator};
use crate::telemetry::{counters, MM_INFO_GROUP, SCALED_GROUPED_MM_KEY};
use crate::tensor::DType;

pub const OP_NAME: &str = "scaled_grouped_mm";

#[derive(Clone, Debug)]
pub struct ScaledGroupedMmRequest {
    pub inputs: GroupedMmInputs,
    pub out_dtype: Option<DType>,
    pub layout: Option<OutputLayout>,
    /// Stream handed to the scratch allocator.
    pub stream: Option<u64>,
}

impl ScaledGroupedMmRequest {
    pub fn new(inputs: GroupedMmInputs) -> Self {
        Self {
            inputs,
            out_dtype: None,
            layout: None,
            stream: None,
        }
    }
}

/// Builds one generated candidate per surviving configuration.
pub fn generated_candidates(
    problem: &ProblemShape,
    layout: &OutputLayout,
    device: &dyn DeviceQuery,
    tuning: &TuningConfig,
    fast_accum: bool,
) -> Result<Vec<GeneratedKernel>> {
    let family = tuning
        .family
        .map(HardwareFamily::from)
        .unwrap_or_else(|| device.family());
    let configs = generate_configs(family);
    let generated = configs.len();
    let survivors = prune(configs, problem, &device.limits());
    debug!(?family, generated, kept = survivors.len(), "kernel configs after pruning");

    let options = KernelOptions {
        use_descriptor_loads: true,
        fast_accum,
        num_units: tuning.num_units.unwrap_or_else(|| device.num_compute_units()),
    };
    survivors
        .iter()
        .map(|config| GeneratedKernel::new(problem, config, options, layout))
        .collect()
}

/// [`tuned_scaled_grouped_mm`] with the process-wide tuning configuration
/// (`SPIRAL_SGMM_*`, or whatever [`spiral_config::tuning::configure`] installed).
pub fn scaled_grouped_mm(
    request: &ScaledGroupedMmRequest,
    device: &dyn DeviceQuery,
    allocator: &dyn ScratchAllocator,
) -> Result<Selection> {
    tuned_scaled_grouped_mm(request, device, allocator, spiral_config::tuning::config())
}

/// Runs scaled grouped GEMM, tuning over the reference and every feasible
/// generated kernel.
pub fn tuned_scaled_grouped_mm(
    request: &ScaledGroupedMmRequest,
    device: &dyn DeviceQuery,
    allocator: &dyn ScratchAllocator,
    tuning: &TuningConfig,
) -> Result<Selection> {
    let inputs = &request.inputs;
    let offsets_len = inputs.offsets.as_ref().map(Vec::len);
    let layout = resolve_output_layout(
        &inputs.mat_a,
        &inputs.mat_b,
        offsets_len,
        request.out_dtype,
        request.layout.clone(),
    )?;
    counters().increment(MM_INFO_GROUP, SCALED_GROUPED_MM_KEY);
    info!(
        mat1_shape = ?inputs.mat_a.sizes(),
        mat2_shape = ?inputs.mat_b.sizes(),
        mat1_dtype = %inputs.mat_a.dtype(),
        mat2_dtype = %inputs.mat_b.dtype(),
        output_layout = %layout,
        "tuned aten._scaled_grouped_mm.default"
    );
    check_supported_striding(&inputs.mat_a, &inputs.mat_b)?;

    let mut choices: Vec<Box<dyn Choice>> = Vec::new();
    if tuning.include_reference {
        choices.push(Box::new(ReferenceChoice::new(&layout)));
    }

    let eligible = layout.is_nonzero()
        && can_use_generated_kernel(
            inputs.mat_a.sizes(),
            inputs.mat_b.sizes(),
            inputs.offsets.is_some(),
            inputs.bias.is_some(),
            device.supports_tensor_descriptors(),
        );
    let mut generated = Vec::new();
    if eligible {
        let problem = ProblemShape::from_operands(&inputs.mat_a, &inputs.mat_b, offsets_len)?
            .with_scales(&inputs.scale_a, &inputs.scale_b)?;
        generated = generated_candidates(&problem, &layout, device, tuning, inputs.use_fast_accum)?;
    }

    let mut scratch = RoundScratch::new(allocator, request.stream);
    if !generated.is_empty() && device.supports_tensor_descriptors() {
        if let Err(err) = scratch.reserve(DESCRIPTOR_SCRATCH_BYTES, DESCRIPTOR_ALIGNMENT) {
            if choices.is_empty() {
                return Err(err);
            }
            warn!(error = %err, dropped = generated.len(), "descriptor scratch unavailable, using reference only");
            generated.clear();
        }
    }
    choices.extend(
        generated
            .into_iter()
            .map(|kernel| Box::new(kernel) as Box<dyn Choice>),
    );

    let settings = BenchmarkSettings::from(tuning);
    autotune_select(OP_NAME, &choices, inputs, &layout, &settings, &mut scratch)
}
