// gpu/descriptor.rs — 128-byte gradient-histogram descriptors.
//
// The instance writes the metadata of every final feature (position,
// scale, sigma, orientation, response) straight into the target feature
// buffer before this stage runs; the descriptor kernel then fills in
// only the 128 descriptor bytes, in place, at the fixed word offsets of
// its assigned feature record. Each invocation owns exactly one
// feature, so there are no write conflicts and the buffer content is
// deterministic.
//
// Each job carries the octave-space geometry of one feature. The 4×4×8
// histogram is accumulated with trilinear interpolation over a rotated
// window, normalized, clamped at 0.2, renormalized and quantized to
// bytes as round(512·v) clamped to 255. The bin-to-byte index order is
// selected by the configured descriptor format (UBC or VLFeat).

use wgpu::util::DeviceExt;

use crate::config::{Config, DescriptorFormat};
use crate::feature::Feature;
use crate::gpu::device::GpuDevice;
use crate::gpu::scale_space::ScaleSpace;

/// Threads per workgroup for the 1-D per-feature dispatch.
const WG_LINEAR: u32 = 64;

/// Feature record stride in 32-bit words, and the word offset of the
/// descriptor within a record. Pinned against `Feature` by a test below.
pub const FEATURE_STRIDE_WORDS: u32 = (std::mem::size_of::<Feature>() / 4) as u32;
pub const DESCRIPTOR_WORD_OFFSET: u32 = 9;

/// One descriptor computation, bound to the feature record it fills.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DescriptorJob {
    /// Keypoint position in octave coordinates.
    pub x: f32,
    pub y: f32,
    /// Blur level at the refined scale, in octave pixel units.
    pub sigma: f32,
    /// Assigned orientation in radians.
    pub orientation: f32,
    /// Octave array index (selects the dispatch's texture binding).
    pub octave: u32,
    /// Gaussian layer to sample gradients from.
    pub scale_idx: u32,
    /// Index of the feature record this job writes.
    pub feature_index: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct DescriptorParams {
    first: u32,
    count: u32,
    width: u32,
    height: u32,
    /// 0 = UBC bin order, 1 = VLFeat bin order.
    vlfeat: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

pub struct DescriptorStage {
    pipeline: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
    jobs: wgpu::Buffer,
    max_jobs: u32,
    vlfeat: bool,
}

impl DescriptorStage {
    pub fn new(gpu: &GpuDevice, config: &Config) -> Self {
        let shader_src = include_str!("../shaders/descriptor.wgsl")
            .replace("{{WG_LINEAR}}", &WG_LINEAR.to_string());
        let shader = gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("descriptor.wgsl"),
            source: wgpu::ShaderSource::Wgsl(shader_src.into()),
        });

        let bgl = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("descriptor BGL"),
            entries: &[
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
                // Jobs (read-only).
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Target feature buffer, written in place.
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
                label: Some("descriptor"),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });
        let pipeline = gpu
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("descriptor"),
                layout: Some(&layout),
                module: &shader,
                entry_point: "describe",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });

        let max_jobs = config.max_nb_sift_per_buffer;
        let jobs = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("descriptor jobs"),
            size: (max_jobs as u64) * std::mem::size_of::<DescriptorJob>() as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        DescriptorStage {
            pipeline,
            bgl,
            jobs,
            max_jobs,
            vlfeat: config.descriptor_format == DescriptorFormat::VlFeat,
        }
    }

    /// Run the descriptor kernel for every job, writing descriptors in
    /// place into `target`. Jobs must be grouped by octave (they are,
    /// since the feature list preserves candidate order).
    pub fn run(
        &self,
        gpu: &GpuDevice,
        scale_space: &ScaleSpace,
        jobs: &[DescriptorJob],
        target: &wgpu::Buffer,
    ) {
        debug_assert!(jobs.len() <= self.max_jobs as usize);
        if jobs.is_empty() {
            return;
        }

        gpu.queue
            .write_buffer(&self.jobs, 0, bytemuck::cast_slice(jobs));

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("descriptor"),
            });

        for (octave, first, count) in octave_ranges(jobs) {
            let oct = &scale_space.octaves[octave as usize];
            let params = DescriptorParams {
                first,
                count,
                width: oct.width,
                height: oct.height,
                vlfeat: self.vlfeat as u32,
                _pad0: 0,
                _pad1: 0,
                _pad2: 0,
            };
            let params_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("descriptor params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
            let bind = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("descriptor BG"),
                layout: &self.bgl,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(&oct.gauss_array),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: self.jobs.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: target.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: params_buf.as_entire_binding(),
                    },
                ],
            });

            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("descriptor"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind, &[]);
            pass.dispatch_workgroups((count + WG_LINEAR - 1) / WG_LINEAR, 1, 1);
        }

        gpu.queue.submit(std::iter::once(encoder.finish()));
    }
}

/// Contiguous (octave, first, count) ranges of an octave-grouped job list.
fn octave_ranges(jobs: &[DescriptorJob]) -> Vec<(u32, u32, u32)> {
    let mut ranges = Vec::new();
    let mut start = 0usize;
    while start < jobs.len() {
        let octave = jobs[start].octave;
        let mut end = start + 1;
        while end < jobs.len() && jobs[end].octave == octave {
            end += 1;
        }
        ranges.push((octave, start as u32, (end - start) as u32));
        start = end;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::DESCRIPTOR_SIZE;

    #[test]
    fn word_offsets_match_feature_layout() {
        // 164 bytes = 41 words; descriptor at byte 36 = word 9.
        assert_eq!(FEATURE_STRIDE_WORDS, 41);
        assert_eq!(std::mem::size_of::<Feature>() % 4, 0);
        assert_eq!(
            DESCRIPTOR_WORD_OFFSET as usize * 4,
            std::mem::offset_of!(Feature, descriptor)
        );
        // The descriptor occupies exactly the remaining words.
        assert_eq!(
            (FEATURE_STRIDE_WORDS - DESCRIPTOR_WORD_OFFSET) as usize * 4,
            DESCRIPTOR_SIZE
        );
    }

    #[test]
    fn job_layout_matches_shader_struct() {
        assert_eq!(std::mem::size_of::<DescriptorJob>(), 32);
        assert_eq!(std::mem::offset_of!(DescriptorJob, octave), 16);
        assert_eq!(std::mem::offset_of!(DescriptorJob, feature_index), 24);
    }

    #[test]
    fn octave_ranges_group_consecutive_jobs() {
        let job = |octave| DescriptorJob {
            x: 0.0,
            y: 0.0,
            sigma: 1.6,
            orientation: 0.0,
            octave,
            scale_idx: 1,
            feature_index: 0,
            _pad: 0,
        };
        let jobs = vec![job(0), job(0), job(1), job(4), job(4), job(4)];
        assert_eq!(
            octave_ranges(&jobs),
            vec![(0, 0, 2), (1, 2, 1), (4, 3, 3)]
        );
    }
}
