// gpu/extract.rs — keypoint candidate extraction from the DoG pyramid.
//
// One dispatch per octave. Each invocation owns one pixel column of the
// octave and loops over the interior DoG layers, testing the 26-neighbor
// extremum condition, then runs sub-pixel refinement (quadratic fit of
// the local DoG, up to five relocation steps), the contrast test on the
// refined value and the edge-response test on the spatial Hessian.
// Survivors are appended to a shared candidate buffer through an atomic
// counter.
//
// DETERMINISM:
// The atomic append order varies run to run. The readback path restores
// a canonical order by sorting on (octave, scale_idx, iy, ix) — the
// integer lattice position of the originating extremum, which is unique
// per candidate. Every downstream stage preserves this order, so detect
// output is bitwise reproducible for identical input and configuration.
// The candidate buffer carries headroom beyond the feature-buffer
// capacity so the ranked truncation at write time sees every raw
// candidate; overflowing the headroom is a recoverable error, never a
// scheduler-dependent partial result.

use wgpu::util::DeviceExt;

use crate::config::Config;
use crate::error::{DeviceError, InputError, Result};
use crate::gpu::device::GpuDevice;
use crate::gpu::scale_space::ScaleSpace;

/// Refinement steps before a wandering extremum is discarded.
pub const MAX_REFINEMENT_STEPS: u32 = 5;

/// Candidate slots allocated for a given feature-buffer capacity. Raw
/// extrema legitimately outnumber the surviving features (the ranked
/// truncation happens on the CPU), so the candidate buffer gets a fixed
/// multiple of the capacity with a generous floor for small configs.
pub(crate) fn candidate_capacity(max_per_buffer: u32) -> u32 {
    max_per_buffer.saturating_mul(4).max(1 << 17)
}

/// One refined keypoint candidate, as written by `extract.wgsl`.
/// Orientation assignment and descriptor computation happen later.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Candidate {
    /// Octave array index (0-based, not the reported index).
    pub octave: u32,
    /// DoG layer of the refined extremum, in 1..=nb_scales.
    pub scale_idx: u32,
    /// Integer lattice position of the originating extremum. Only used
    /// for canonical ordering.
    pub ix: u32,
    pub iy: u32,
    /// Refined sub-pixel position in octave coordinates.
    pub x: f32,
    pub y: f32,
    /// Refined scale offset from `scale_idx`, in (−0.5, 0.5].
    pub delta_scale: f32,
    /// Interpolated DoG value at the refined position.
    pub response: f32,
}

/// Canonical candidate order: octave, then scale, then row, then column.
/// Extrema at adjacent scales of the same pixel can refine into the same
/// layer, so the refined geometry joins the key to keep the order total.
pub fn canonical_sort(candidates: &mut [Candidate]) {
    candidates.sort_unstable_by_key(|c| {
        (
            c.octave,
            c.scale_idx,
            c.iy,
            c.ix,
            c.delta_scale.to_bits(),
            c.response.to_bits(),
        )
    });
}

/// Edge test constant: a candidate passes when
/// `tr(H)² · r < (r + 1)² · det(H)` with r = `edge_threshold`.
pub fn edge_factor(edge_threshold: f32) -> f32 {
    (edge_threshold + 1.0) * (edge_threshold + 1.0) / edge_threshold
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct ExtractParams {
    width: u32,
    height: u32,
    octave: u32,
    dog_layers: u32,
    /// `intensity_threshold / nb_scales_per_octave`.
    contrast_threshold: f32,
    /// `(r + 1)² / r`.
    edge_factor: f32,
    max_candidates: u32,
    _pad: u32,
}

/// Extraction pipeline plus the candidate and counter buffers, sized at
/// instance creation and reused across detect calls.
pub struct ExtractStage {
    pipeline: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
    candidates: wgpu::Buffer,
    counter: wgpu::Buffer,
    candidates_readback: wgpu::Buffer,
    counter_readback: wgpu::Buffer,
    max_candidates: u32,
}

impl ExtractStage {
    pub fn new(gpu: &GpuDevice, config: &Config) -> Self {
        let shader_src = include_str!("../shaders/extract.wgsl")
            .replace("{{WG_X}}", &gpu.workgroup_size.x.to_string())
            .replace("{{WG_Y}}", &gpu.workgroup_size.y.to_string());
        let shader = gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("extract.wgsl"),
            source: wgpu::ShaderSource::Wgsl(shader_src.into()),
        });

        let bgl = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("extract BGL"),
            entries: &[
                // DoG layers of the octave.
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        multisampled: false,
                        view_dimension: wgpu::TextureViewDimension::D2Array,
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    },
                    count: None,
                },
                // Candidate output.
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Atomic append counter.
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let layout = gpu
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("extract"),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });
        let pipeline = gpu
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("extract"),
                layout: Some(&layout),
                module: &shader,
                entry_point: "extract",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });

        let max_candidates = candidate_capacity(config.max_nb_sift_per_buffer);
        let cand_size = (max_candidates as u64) * std::mem::size_of::<Candidate>() as u64;
        let candidates = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("candidates"),
            size: cand_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let counter = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("candidate counter"),
            size: 4,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let candidates_readback = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("candidates readback"),
            size: cand_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let counter_readback = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("counter readback"),
            size: 4,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        ExtractStage {
            pipeline,
            bgl,
            candidates,
            counter,
            candidates_readback,
            counter_readback,
            max_candidates,
        }
    }

    /// Run extraction over every octave and read the candidates back in
    /// canonical order. The candidate headroom overflowing is reported
    /// as a recoverable error rather than returning a partial set whose
    /// membership would depend on GPU scheduling.
    pub fn run(
        &self,
        gpu: &GpuDevice,
        scale_space: &ScaleSpace,
        config: &Config,
    ) -> Result<Vec<Candidate>> {
        let contrast_threshold =
            config.intensity_threshold / config.nb_scales_per_octave as f32;
        let edge = edge_factor(config.edge_threshold);
        let dog_layers = scale_space.schedule.dog_per_octave();

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("extract"),
            });
        encoder.clear_buffer(&self.counter, 0, None);

        for (o, oct) in scale_space.octaves.iter().enumerate() {
            let params = ExtractParams {
                width: oct.width,
                height: oct.height,
                octave: o as u32,
                dog_layers,
                contrast_threshold,
                edge_factor: edge,
                max_candidates: self.max_candidates,
                _pad: 0,
            };
            let params_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("extract params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
            let bind = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("extract BG"),
                layout: &self.bgl,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(&oct.dog_array),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: self.candidates.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: self.counter.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: params_buf.as_entire_binding(),
                    },
                ],
            });

            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("extract"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind, &[]);
            let (dx, dy) = gpu.dispatch_size(oct.width, oct.height);
            pass.dispatch_workgroups(dx, dy, 1);
        }

        encoder.copy_buffer_to_buffer(&self.counter, 0, &self.counter_readback, 0, 4);
        encoder.copy_buffer_to_buffer(
            &self.candidates,
            0,
            &self.candidates_readback,
            0,
            self.candidates.size(),
        );
        gpu.queue.submit(std::iter::once(encoder.finish()));

        let appended = read_u32(gpu, &self.counter_readback)?;
        if appended > self.max_candidates {
            // The counter counts every attempted append, so this trips
            // deterministically for a given input and configuration.
            log::warn!(
                "candidate overflow: {appended} extrema for {} slots",
                self.max_candidates
            );
            return Err(InputError::CandidateOverflow {
                found: appended,
                capacity: self.max_candidates,
            }
            .into());
        }

        let mut out = read_candidates(gpu, &self.candidates_readback, appended as usize)?;
        canonical_sort(&mut out);
        Ok(out)
    }
}

fn map_readback(gpu: &GpuDevice, slice: wgpu::BufferSlice<'_>) -> Result<(), DeviceError> {
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |r| {
        let _ = tx.send(r);
    });
    gpu.device.poll(wgpu::Maintain::Wait);
    rx.recv()
        .map_err(|_| DeviceError::MapFailed("readback channel closed".into()))?
        .map_err(|e| DeviceError::MapFailed(e.to_string()))
}

fn read_u32(gpu: &GpuDevice, buffer: &wgpu::Buffer) -> Result<u32> {
    let slice = buffer.slice(..);
    map_readback(gpu, slice)?;
    let value = {
        let mapped = slice.get_mapped_range();
        u32::from_le_bytes([mapped[0], mapped[1], mapped[2], mapped[3]])
    };
    buffer.unmap();
    Ok(value)
}

fn read_candidates(
    gpu: &GpuDevice,
    buffer: &wgpu::Buffer,
    count: usize,
) -> Result<Vec<Candidate>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let bytes = count * std::mem::size_of::<Candidate>();
    let slice = buffer.slice(..bytes as u64);
    map_readback(gpu, slice)?;
    let out = {
        let mapped = slice.get_mapped_range();
        bytemuck::cast_slice::<u8, Candidate>(&mapped).to_vec()
    };
    buffer.unmap();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(octave: u32, scale_idx: u32, ix: u32, iy: u32) -> Candidate {
        Candidate {
            octave,
            scale_idx,
            ix,
            iy,
            x: ix as f32,
            y: iy as f32,
            delta_scale: 0.0,
            response: 0.1,
        }
    }

    #[test]
    fn candidate_layout_matches_shader_struct() {
        assert_eq!(std::mem::size_of::<Candidate>(), 32);
        assert_eq!(std::mem::offset_of!(Candidate, x), 16);
        assert_eq!(std::mem::offset_of!(Candidate, response), 28);
    }

    #[test]
    fn canonical_sort_is_octave_scale_row_column() {
        let mut v = vec![
            cand(1, 1, 5, 5),
            cand(0, 2, 0, 0),
            cand(0, 1, 9, 2),
            cand(0, 1, 3, 2),
            cand(0, 1, 3, 1),
        ];
        canonical_sort(&mut v);
        let keys: Vec<_> = v.iter().map(|c| (c.octave, c.scale_idx, c.iy, c.ix)).collect();
        assert_eq!(
            keys,
            vec![(0, 1, 1, 3), (0, 1, 2, 3), (0, 1, 2, 9), (0, 2, 0, 0), (1, 1, 5, 5)]
        );
    }

    #[test]
    fn canonical_sort_is_deterministic_across_permutations() {
        let base = vec![
            cand(0, 1, 1, 1),
            cand(0, 1, 2, 1),
            cand(1, 2, 7, 3),
            cand(2, 1, 0, 0),
        ];
        let mut a = base.clone();
        let mut b: Vec<_> = base.into_iter().rev().collect();
        canonical_sort(&mut a);
        canonical_sort(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn candidate_headroom_exceeds_buffer_capacity() {
        // Small configured capacities still get the full floor, so raw
        // extrema are not silently dropped in GPU append order.
        assert_eq!(candidate_capacity(10), 1 << 17);
        assert_eq!(candidate_capacity(100_000), 400_000);
        assert!(candidate_capacity(u32::MAX) == u32::MAX);
    }

    #[test]
    fn edge_factor_matches_curvature_bound() {
        // r = 10: (11²)/10 = 12.1
        assert!((edge_factor(10.0) - 12.1).abs() < 1e-6);
        // r = 1 (strictest): 4.0
        assert!((edge_factor(1.0) - 4.0).abs() < 1e-6);
    }
}
