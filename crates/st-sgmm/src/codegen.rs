// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Source generation for the persistent grouped GEMM kernel.
//!
//! Rendering is a pure function of the problem, the configuration and the
//! launch options. Every operand-rank and split-dimension variant is an
//! explicit branch in [`render_kernel`]; the rendered text is what a device
//! compiler would receive, and its blake3 fingerprint names the kernel.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::config_space::KernelConfig;
use crate::error::{Result, SgmmError};
use crate::problem::{ProblemShape, ShapeClass};

pub const KERNEL_ID: &str = "spiral.sgmm.kernel.persistent_scaled_grouped_mm.v1";
pub const KERNEL_SYMBOL_PREFIX: &str = "spiral_scaled_grouped_mm";

/// Launch-level switches baked into the generated source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelOptions {
    /// Load A and B tiles through tensor descriptors instead of pointer math.
    pub use_descriptor_loads: bool,
    /// Accumulate straight into the running tile instead of through a
    /// per-chunk partial.
    pub fast_accum: bool,
    pub num_units: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSource {
    pub id: String,
    pub name: String,
    pub symbol: String,
    pub source: String,
    pub fingerprint: String,
    pub class: ShapeClass,
    pub config: KernelConfig,
    pub options: KernelOptions,
}

#[derive(Serialize)]
struct KernelMetadata<'a> {
    id: &'a str,
    class: ShapeClass,
    config: &'a KernelConfig,
    options: &'a KernelOptions,
    problem: &'a ProblemShape,
}

/// Indentation-aware line buffer.
struct SourceWriter {
    out: String,
    depth: usize,
}

impl SourceWriter {
    fn new() -> Self {
        Self {
            out: String::new(),
            depth: 0,
        }
    }

    fn line(&mut self, text: impl AsRef<str>) {
        for _ in 0..self.depth {
            self.out.push_str("    ");
        }
        self.out.push_str(text.as_ref());
        self.out.push('\n');
    }

    fn open(&mut self, text: impl AsRef<str>) {
        self.line(text);
        self.depth += 1;
    }

    fn close(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn blank(&mut self) {
        self.out.push('\n');
    }

    fn finish(self) -> String {
        self.out
    }
}

pub fn render_kernel(
    problem: &ProblemShape,
    config: &KernelConfig,
    options: &KernelOptions,
) -> Result<KernelSource> {
    let mut w = SourceWriter::new();
    render_constants(&mut w, problem, config, options);
    w.blank();
    render_signature(&mut w, problem);
    if options.use_descriptor_loads {
        render_descriptors(&mut w, problem);
    }
    render_body(&mut w, problem, options);
    let source = w.finish();

    let metadata = KernelMetadata {
        id: KERNEL_ID,
        class: problem.class,
        config,
        options,
        problem,
    };
    let mut hasher = blake3::Hasher::new();
    hasher.update(&serde_json::to_vec(&metadata).map_err(|err| SgmmError::Codegen(err.to_string()))?);
    hasher.update(source.as_bytes());
    let fingerprint = hasher.finalize().to_hex().to_string();

    let name = format!("scaled_grouped_mm_{}_{}", config.label(), &fingerprint[..12]);
    let symbol = format!("{KERNEL_SYMBOL_PREFIX}_{}", &fingerprint[..16]);
    Ok(KernelSource {
        id: KERNEL_ID.to_string(),
        name,
        symbol,
        source,
        fingerprint,
        class: problem.class,
        config: config.clone(),
        options: *options,
    })
}

fn render_constants(
    w: &mut SourceWriter,
    problem: &ProblemShape,
    config: &KernelConfig,
    options: &KernelOptions,
) {
    let flag = |value: bool| if value { "True" } else { "False" };
    w.line(format!("# {KERNEL_ID}"));
    w.line(format!("G = {}", problem.g));
    w.line(format!("M = {}", problem.m));
    w.line(format!("N = {}", problem.n));
    w.line(format!("K = {}", problem.k));
    w.line(format!("A_IS_2D = {}", flag(problem.a_is_2d())));
    w.line(format!("B_IS_2D = {}", flag(problem.b_is_2d())));
    w.line(format!("M_IS_DYNAMIC = {}", flag(problem.m_dynamic())));
    w.line(format!("N_IS_DYNAMIC = {}", flag(problem.n_dynamic())));
    w.line(format!("K_IS_DYNAMIC = {}", flag(problem.k_dynamic())));
    w.line(format!("A_SIZE_M = {}", problem.m));
    w.line(format!("A_SIZE_K = {}", problem.k));
    w.line(format!("A_STRIDE_M = {}", problem.strides_a.outer));
    w.line(format!("A_STRIDE_K = {}", problem.strides_a.k));
    if !problem.a_is_2d() {
        // Fall back to a contiguous [G, M, K] operand and a [G, M] scale.
        let group_stride = problem.strides_a.group.unwrap_or(problem.m * problem.strides_a.outer);
        w.line(format!("A_SIZE_G = {}", problem.g));
        w.line(format!("A_STRIDE_G = {group_stride}"));
        w.line(format!("SCALE_A_STRIDE_G = {}", problem.scale_a_stride_g.unwrap_or(problem.m)));
    }
    w.line(format!("B_SIZE_N = {}", problem.n));
    w.line(format!("B_SIZE_K = {}", problem.k));
    w.line(format!("B_STRIDE_N = {}", problem.strides_b.outer));
    w.line(format!("B_STRIDE_K = {}", problem.strides_b.k));
    if !problem.b_is_2d() {
        let group_stride = problem.strides_b.group.unwrap_or(problem.n * problem.strides_b.outer);
        w.line(format!("B_SIZE_G = {}", problem.g));
        w.line(format!("B_STRIDE_G = {group_stride}"));
        w.line(format!("SCALE_B_STRIDE_G = {}", problem.scale_b_stride_g.unwrap_or(problem.n)));
    }
    // Row pitch of the flat [M, N] output used when a dimension is split.
    w.line(format!("N_OUT = {}", problem.n));
    w.line(format!("NUM_UNITS = {}", options.num_units));
    w.line(format!("USE_TMA_LOAD = {}", flag(options.use_descriptor_loads)));
    w.line(format!("USE_FAST_ACCUM = {}", flag(options.fast_accum)));
    w.line(format!("BLOCK_M = {}", config.block_m));
    w.line(format!("BLOCK_N = {}", config.block_n));
    w.line(format!("BLOCK_K = {}", config.block_k));
    w.line(format!("NUM_CONSUMER_GROUPS = {}", config.kernel_consumer_groups()));
    let mut launch = format!(
        "# launch: grid=({}, 1, 1) num_warps={} num_stages={}",
        options.num_units, config.num_warps, config.num_stages
    );
    for (key, value) in &config.vendor_extra {
        let _ = write!(launch, " {key}={value}");
    }
    w.line(launch);
}

fn render_signature(w: &mut SourceWriter, problem: &ProblemShape) {
    if problem.class.requires_offsets() {
        w.open("def kernel(a_ptr, b_ptr, scale_a_ptr, scale_b_ptr, offsets_ptr, out_ptr):");
    } else {
        w.open("def kernel(a_ptr, b_ptr, scale_a_ptr, scale_b_ptr, out_ptr):");
    }
    w.line("tidx = tl.program_id(0)");
}

fn render_descriptors(w: &mut SourceWriter, problem: &ProblemShape) {
    match problem.class {
        ShapeClass::TwoDTwoD | ShapeClass::TwoDThreeD => {
            w.line("a_desc = make_tensor_descriptor(a_ptr, shape=[A_SIZE_M, A_SIZE_K], strides=[A_STRIDE_M, A_STRIDE_K], block_shape=[BLOCK_M, BLOCK_K])");
        }
        ShapeClass::ThreeDTwoD | ShapeClass::ThreeDThreeD => {
            w.line("a_desc = make_tensor_descriptor(a_ptr, shape=[A_SIZE_G, A_SIZE_M, A_SIZE_K], strides=[A_STRIDE_G, A_STRIDE_M, A_STRIDE_K], block_shape=[1, BLOCK_M, BLOCK_K])");
        }
    }
    match problem.class {
        ShapeClass::TwoDTwoD | ShapeClass::ThreeDTwoD => {
            w.line("b_desc = make_tensor_descriptor(b_ptr, shape=[B_SIZE_N, B_SIZE_K], strides=[B_STRIDE_N, B_STRIDE_K], block_shape=[BLOCK_N, BLOCK_K])");
        }
        ShapeClass::TwoDThreeD | ShapeClass::ThreeDThreeD => {
            w.line("b_desc = make_tensor_descriptor(b_ptr, shape=[B_SIZE_G, B_SIZE_N, B_SIZE_K], strides=[B_STRIDE_G, B_STRIDE_N, B_STRIDE_K], block_shape=[1, BLOCK_N, BLOCK_K])");
        }
    }
    w.blank();
}

fn render_body(w: &mut SourceWriter, problem: &ProblemShape, options: &KernelOptions) {
    match problem.class {
        ShapeClass::TwoDThreeD => w.line("m_end_offset = 0"),
        ShapeClass::ThreeDTwoD => w.line("n_end_offset = 0"),
        ShapeClass::TwoDTwoD => w.line("k_end_offset = 0"),
        ShapeClass::ThreeDThreeD => {}
    }
    w.line("iterated_tiles = 0");
    w.open("for g in tl.range(G):");

    if problem.m_dynamic() {
        w.line("m_start_offset = m_end_offset");
        w.line("m_end_offset = tl.load(offsets_ptr + g)");
        w.line("m_size = m_end_offset - m_start_offset");
        w.line("m_scale_start_offset = m_start_offset");
    } else {
        w.line("m_start_offset = 0");
        w.line("m_size = M");
        if problem.a_is_2d() {
            w.line("m_scale_start_offset = g.to(tl.int64) * M");
        }
    }
    w.blank();
    w.open("if m_size > 0:");
    if problem.n_dynamic() {
        w.line("n_start_offset = n_end_offset");
        w.line("n_end_offset = tl.load(offsets_ptr + g)");
        w.line("n_size = n_end_offset - n_start_offset");
        w.line("n_scale_start_offset = n_start_offset");
    } else {
        w.line("n_start_offset = 0");
        w.line("n_size = N");
        if problem.b_is_2d() {
            w.line("n_scale_start_offset = g.to(tl.int64) * N");
        }
    }
    if problem.k_dynamic() {
        w.line("k_start_offset = k_end_offset");
        w.line("k_end_offset = tl.load(offsets_ptr + g)");
        w.line("k_size = k_end_offset - k_start_offset");
    } else {
        w.line("k_start_offset = 0");
        w.line("k_size = K");
    }
    w.blank();
    w.line("num_m_tiles = tl.cdiv(m_size, BLOCK_M)");
    w.line("num_n_tiles = tl.cdiv(n_size, BLOCK_N)");
    w.line("num_tiles = num_m_tiles * num_n_tiles");
    w.blank();
    w.open("while tidx >= iterated_tiles and tidx < iterated_tiles + num_tiles:");
    w.line("gidx = tidx - iterated_tiles");
    w.line("tile_m_idx = gidx % num_m_tiles");
    w.line("tile_n_idx = gidx // num_m_tiles");
    w.line("accumulator = tl.zeros((BLOCK_M, BLOCK_N), dtype=tl.float32)");
    w.blank();
    if options.use_descriptor_loads {
        render_descriptor_mainloop(w, problem, options);
    } else {
        render_pointer_mainloop(w, problem, options);
    }
    w.blank();
    render_epilogue(w, problem);
    w.line("tidx += NUM_UNITS");
    w.close();
    w.blank();
    w.line("iterated_tiles += num_tiles");
    w.close();
    w.close();
    w.close();
}

fn accumulate_line(options: &KernelOptions) -> &'static str {
    if options.fast_accum {
        "accumulator = tl.dot(a, b.T, accumulator)"
    } else {
        "accumulator += tl.dot(a, b.T)"
    }
}

fn render_descriptor_mainloop(w: &mut SourceWriter, problem: &ProblemShape, options: &KernelOptions) {
    w.line("m_offset = (m_start_offset + tile_m_idx * BLOCK_M).to(tl.int32)");
    w.line("n_offset = (n_start_offset + tile_n_idx * BLOCK_N).to(tl.int32)");
    w.open("for k_offset in range(0, k_size, BLOCK_K):");
    if problem.a_is_2d() {
        w.line("a = a_desc.load([m_offset, k_start_offset + k_offset])");
    } else {
        w.line("a = a_desc.load([g, m_offset, k_start_offset + k_offset]).reshape(BLOCK_M, BLOCK_K)");
    }
    if problem.b_is_2d() {
        w.line("b = b_desc.load([n_offset, k_start_offset + k_offset])");
    } else {
        w.line("b = b_desc.load([g, n_offset, k_start_offset + k_offset]).reshape(BLOCK_N, BLOCK_K)");
    }
    if problem.k_dynamic() {
        render_k_tail_mask(w);
    }
    w.line(accumulate_line(options));
    w.close();
}

fn render_pointer_mainloop(w: &mut SourceWriter, problem: &ProblemShape, options: &KernelOptions) {
    w.line("offs_am = tile_m_idx * BLOCK_M + tl.arange(0, BLOCK_M)");
    w.line("offs_bn = tile_n_idx * BLOCK_N + tl.arange(0, BLOCK_N)");
    w.line("offs_k = k_start_offset + tl.arange(0, BLOCK_K)");
    if problem.a_is_2d() {
        w.line("a_ptrs = a_ptr + (m_start_offset + offs_am[:, None]) * A_STRIDE_M + offs_k[None, :] * A_STRIDE_K");
    } else {
        w.line("a_ptrs = a_ptr + g * A_STRIDE_G + (m_start_offset + offs_am[:, None]) * A_STRIDE_M + offs_k[None, :] * A_STRIDE_K");
    }
    if problem.b_is_2d() {
        w.line("b_ptrs = b_ptr + (n_start_offset + offs_bn[:, None]) * B_STRIDE_N + offs_k[None, :] * B_STRIDE_K");
    } else {
        w.line("b_ptrs = b_ptr + g * B_STRIDE_G + (n_start_offset + offs_bn[:, None]) * B_STRIDE_N + offs_k[None, :] * B_STRIDE_K");
    }
    w.open("for k_offset in range(0, k_size, BLOCK_K):");
    w.line("a = tl.load(a_ptrs, mask=offs_am[:, None] < m_size)");
    w.line("b = tl.load(b_ptrs, mask=offs_bn[:, None] < n_size)");
    render_k_tail_mask(w);
    w.line(accumulate_line(options));
    w.line("a_ptrs += BLOCK_K");
    w.line("b_ptrs += BLOCK_K");
    w.close();
}

fn render_k_tail_mask(w: &mut SourceWriter) {
    w.open("if k_offset + BLOCK_K > k_size:");
    w.line("group_offs_k = k_offset + tl.arange(0, BLOCK_K)");
    w.line("a = tl.where(group_offs_k < k_size, a, 0)");
    w.line("b = tl.where(group_offs_k < k_size, b, 0)");
    w.close();
}

fn render_epilogue(w: &mut SourceWriter, problem: &ProblemShape) {
    w.line("offs_am = tile_m_idx * BLOCK_M + tl.arange(0, BLOCK_M)");
    w.line("offs_bn = tile_n_idx * BLOCK_N + tl.arange(0, BLOCK_N)");
    if problem.a_is_2d() {
        w.line("scale_a = tl.load(scale_a_ptr + m_scale_start_offset + offs_am[:, None], mask=offs_am[:, None] < m_size)");
    } else {
        w.line("scale_a = tl.load(scale_a_ptr + g * SCALE_A_STRIDE_G + offs_am[:, None], mask=offs_am[:, None] < m_size)");
    }
    if problem.b_is_2d() {
        w.line("scale_b = tl.load(scale_b_ptr + n_scale_start_offset + offs_bn[None, :], mask=offs_bn[None, :] < n_size)");
    } else {
        w.line("scale_b = tl.load(scale_b_ptr + g * SCALE_B_STRIDE_G + offs_bn[None, :], mask=offs_bn[None, :] < n_size)");
    }
    w.line("c = accumulator.to(tl.float32) * scale_a * scale_b");
    if problem.m_dynamic() {
        w.line("idx_m = m_start_offset + offs_am[:, None]");
    } else {
        w.line("idx_m = offs_am[:, None]");
    }
    if problem.n_dynamic() {
        w.line("idx_n = n_start_offset + offs_bn[None, :]");
    } else {
        w.line("idx_n = offs_bn[None, :]");
    }
    w.line("mask = (offs_am[:, None] < m_size) & (offs_bn[None, :] < n_size)");
    if problem.m_dynamic() || problem.n_dynamic() {
        w.line("tl.store(out_ptr + idx_m * N_OUT + idx_n, c, mask=mask)");
    } else {
        w.line("tl.store(out_ptr + g * M * N + idx_m * N + idx_n, c, mask=mask)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use crate::config_space::{generate_configs, HardwareFamily};
    use crate::problem::OperandStrides;
    use crate::tensor::DType;

    fn problem(class: ShapeClass) -> ProblemShape {
        let strides = OperandStrides {
            group: None,
            outer: 64,
            k: 1,
        };
        ProblemShape {
            class,
            g: 4,
            m: 128,
            n: 256,
            k: 64,
            strides_a: strides,
            strides_b: strides,
            scale_a_stride_g: None,
            scale_b_stride_g: None,
            dtype: DType::F8E4M3,
        }
    }

    fn options() -> KernelOptions {
        KernelOptions {
            use_descriptor_loads: true,
            fast_accum: false,
            num_units: 132,
        }
    }

    #[test]
    fn rendering_is_deterministic() {
        let config = &generate_configs(HardwareFamily::Generic)[5];
        let p = problem(ShapeClass::TwoDThreeD);
        let a = render_kernel(&p, config, &options()).unwrap();
        let b = render_kernel(&p, config, &options()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.fingerprint.len(), 64);
        assert!(a.name.contains(&config.label()));
    }

    #[test]
    fn branches_follow_shape_class() {
        let config = &generate_configs(HardwareFamily::Generic)[0];
        let m_split = render_kernel(&problem(ShapeClass::TwoDThreeD), config, &options()).unwrap();
        assert!(m_split.source.contains("m_end_offset = tl.load(offsets_ptr + g)"));
        assert!(m_split.source.contains("offsets_ptr, out_ptr"));
        assert!(!m_split.source.contains("k_end_offset"));

        let static_problem =
            render_kernel(&problem(ShapeClass::ThreeDThreeD), config, &options()).unwrap();
        assert!(!static_problem.source.contains("offsets_ptr"));
        assert!(static_problem.source.contains("a_desc.load([g, m_offset"));
        assert!(static_problem.source.contains("g * M * N"));
        assert_ne!(m_split.fingerprint, static_problem.fingerprint);
    }

    /// Upper-case identifiers referenced outside the constants block, skipping
    /// attribute accesses such as `b.T`.
    fn referenced_constants(body: &str) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for line in body.lines().filter(|l| !l.trim_start().starts_with('#')) {
            let mut previous = ' ';
            let mut current = String::new();
            let mut after_dot = false;
            for ch in line.chars().chain(std::iter::once(' ')) {
                if ch.is_ascii_alphanumeric() || ch == '_' {
                    if current.is_empty() {
                        after_dot = previous == '.';
                    }
                    current.push(ch);
                } else {
                    let is_constant = current.starts_with(|c: char| c.is_ascii_uppercase())
                        && current
                            .chars()
                            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
                    if is_constant && !after_dot {
                        names.insert(std::mem::take(&mut current));
                    }
                    current.clear();
                }
                previous = ch;
            }
        }
        names
    }

    #[test]
    fn every_referenced_constant_is_defined() {
        let configs = [
            generate_configs(HardwareFamily::Generic)[0].clone(),
            generate_configs(HardwareFamily::Alternate)[0].clone(),
        ];
        for class in [
            ShapeClass::TwoDTwoD,
            ShapeClass::TwoDThreeD,
            ShapeClass::ThreeDTwoD,
            ShapeClass::ThreeDThreeD,
        ] {
            for config in &configs {
                for (use_descriptor_loads, fast_accum) in
                    [(true, false), (false, true), (false, false)]
                {
                    let options = KernelOptions {
                        use_descriptor_loads,
                        fast_accum,
                        num_units: 8,
                    };
                    let kernel = render_kernel(&problem(class), config, &options).unwrap();
                    let (constants, body) = kernel
                        .source
                        .split_once("def kernel(")
                        .expect("kernel signature");
                    let defined: BTreeSet<&str> = constants
                        .lines()
                        .filter_map(|line| line.split_once(" = ").map(|(name, _)| name))
                        .collect();
                    for name in referenced_constants(body) {
                        assert!(
                            defined.contains(name.as_str()),
                            "{class:?} descriptors={use_descriptor_loads}: {name} is not defined"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn descriptor_shapes_come_from_the_problem() {
        let config = &generate_configs(HardwareFamily::Generic)[0];
        let kernel = render_kernel(&problem(ShapeClass::ThreeDTwoD), config, &options()).unwrap();
        for line in [
            "A_SIZE_G = 4",
            "A_SIZE_M = 128",
            "A_SIZE_K = 64",
            "B_SIZE_N = 256",
            "B_SIZE_K = 64",
            "N_OUT = 256",
        ] {
            assert!(kernel.source.lines().any(|l| l == line), "missing {line}");
        }
        assert!(!kernel.source.contains("B_SIZE_G"));
        assert!(kernel.source.contains("NUM_CONSUMER_GROUPS = 1"));
    }

    #[test]
    fn options_change_the_fingerprint() {
        let config = &generate_configs(HardwareFamily::Alternate)[0];
        let p = problem(ShapeClass::TwoDTwoD);
        let tma = render_kernel(&p, config, &options()).unwrap();
        let pointers = render_kernel(
            &p,
            config,
            &KernelOptions {
                use_descriptor_loads: false,
                fast_accum: true,
                num_units: 132,
            },
        )
        .unwrap();
        assert!(pointers.source.contains("accumulator = tl.dot(a, b.T, accumulator)"));
        assert!(pointers.source.contains("a_ptrs += BLOCK_K"));
        assert!(tma.source.contains("waves_per_eu=1"));
        assert_ne!(tma.symbol, pointers.symbol);
    }
}
