// gpu/matcher.rs — brute-force two-nearest-neighbor descriptor matching.
//
// One invocation per query feature (1-D dispatch), scanning every target
// descriptor and tracking the two smallest L2 distances. Ties keep the
// lower target index: the scan runs in index order and only a strictly
// smaller distance displaces the current best, so the result is
// deterministic. With a single target feature the second-neighbor slot
// keeps its f32::MAX sentinel and downstream ratio tests reject the
// match naturally.

use wgpu::util::DeviceExt;

use crate::config::Config;
use crate::error::{DeviceError, Result};
use crate::feature::Match2Nn;
use crate::gpu::device::GpuDevice;

/// Threads per workgroup for the 1-D per-query dispatch.
const WG_LINEAR: u32 = 64;

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct MatchParams {
    count_a: u32,
    count_b: u32,
    _pad0: u32,
    _pad1: u32,
}

pub struct MatchStage {
    pipeline: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
    matches: wgpu::Buffer,
    readback: wgpu::Buffer,
    max_matches: u32,
}

impl MatchStage {
    pub fn new(gpu: &GpuDevice, config: &Config) -> Self {
        let shader_src = include_str!("../shaders/matcher.wgsl")
            .replace("{{WG_LINEAR}}", &WG_LINEAR.to_string());
        let shader = gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("matcher.wgsl"),
            source: wgpu::ShaderSource::Wgsl(shader_src.into()),
        });

        let storage = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let bgl = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("matcher BGL"),
            entries: &[
                storage(0, true),  // query features A
                storage(1, true),  // target features B
                storage(2, false), // matches out
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
                label: Some("matcher"),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });
        let pipeline = gpu
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("matcher"),
                layout: Some(&layout),
                module: &shader,
                entry_point: "match_2nn",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });

        let max_matches = config.max_nb_sift_per_buffer;
        let size = (max_matches as u64) * std::mem::size_of::<Match2Nn>() as u64;
        let matches = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("matches"),
            size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let readback = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("matches readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        MatchStage {
            pipeline,
            bgl,
            matches,
            readback,
            max_matches,
        }
    }

    /// Match every feature of `buffer_a` against `buffer_b` and read the
    /// results back. Either side being empty yields zero matches.
    pub fn run(
        &self,
        gpu: &GpuDevice,
        buffer_a: &wgpu::Buffer,
        count_a: u32,
        buffer_b: &wgpu::Buffer,
        count_b: u32,
    ) -> Result<Vec<Match2Nn>> {
        if count_a == 0 || count_b == 0 {
            return Ok(Vec::new());
        }
        debug_assert!(count_a <= self.max_matches);

        let params = MatchParams {
            count_a,
            count_b,
            _pad0: 0,
            _pad1: 0,
        };
        let params_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("matcher params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let bind = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("matcher BG"),
            layout: &self.bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: buffer_a.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: buffer_b.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.matches.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: params_buf.as_entire_binding(),
                },
            ],
        });

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("matcher"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("matcher"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind, &[]);
            pass.dispatch_workgroups((count_a + WG_LINEAR - 1) / WG_LINEAR, 1, 1);
        }

        let bytes = (count_a as u64) * std::mem::size_of::<Match2Nn>() as u64;
        encoder.copy_buffer_to_buffer(&self.matches, 0, &self.readback, 0, bytes);
        gpu.queue.submit(std::iter::once(encoder.finish()));

        let slice = self.readback.slice(..bytes);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        gpu.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| DeviceError::MapFailed("readback channel closed".into()))?
            .map_err(|e| DeviceError::MapFailed(e.to_string()))?;

        let out = {
            let mapped = slice.get_mapped_range();
            bytemuck::cast_slice::<u8, Match2Nn>(&mapped).to_vec()
        };
        self.readback.unmap();
        Ok(out)
    }
}
