// gpu/orientation.rs — dominant-orientation assignment.
//
// One dispatch per octave over the contiguous candidate range that
// belongs to it (the canonical sort groups candidates by octave). Each
// invocation accumulates a 36-bin gradient-orientation histogram over a
// circular window around its keypoint, smooths it, and emits every peak
// within 80% of the histogram maximum, each refined by a parabolic fit
// over the peak bin and its neighbors.
//
// Peaks land in FIXED per-candidate output slots (slot k of candidate i
// at index i·max_slots + k) with a separate per-candidate peak count —
// no atomics, so the output is deterministic. Slots are filled in
// descending peak magnitude (ties keep the earlier bin), so a slot cap
// drops the weakest orientations; the CPU expansion preserves the slot
// order, so a keypoint with several orientations always yields its
// duplicated features in the same sequence, strongest first.

use wgpu::util::DeviceExt;

use crate::config::Config;
use crate::error::{DeviceError, Result};
use crate::gpu::device::GpuDevice;
use crate::gpu::extract::Candidate;
use crate::gpu::scale_space::ScaleSpace;

/// Orientation histogram bins.
pub const NB_ORIENTATION_BINS: u32 = 36;

/// Threads per workgroup for the 1-D per-candidate dispatch.
const WG_LINEAR: u32 = 64;

/// Output slots per candidate: the configured cap, or every possible
/// peak when uncapped (a 36-bin histogram cannot have more than 36).
pub fn orientation_slots(config: &Config) -> u32 {
    match config.max_nb_orientation_per_keypoint {
        0 => NB_ORIENTATION_BINS,
        cap => cap.min(NB_ORIENTATION_BINS),
    }
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct OrientationParams {
    /// First candidate index of this octave's range.
    first: u32,
    /// Number of candidates in the range.
    count: u32,
    width: u32,
    height: u32,
    seed_sigma: f32,
    nb_scales: u32,
    max_slots: u32,
    _pad: u32,
}

/// Orientation pipeline plus candidate/peak buffers, sized once at
/// instance creation.
pub struct OrientationStage {
    pipeline: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
    /// Canonically sorted candidates, uploaded per detect call.
    candidates: wgpu::Buffer,
    peaks: wgpu::Buffer,
    counts: wgpu::Buffer,
    peaks_readback: wgpu::Buffer,
    counts_readback: wgpu::Buffer,
    max_candidates: u32,
    max_slots: u32,
}

impl OrientationStage {
    pub fn new(gpu: &GpuDevice, config: &Config) -> Self {
        let shader_src = include_str!("../shaders/orientation.wgsl")
            .replace("{{WG_LINEAR}}", &WG_LINEAR.to_string());
        let shader = gpu.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("orientation.wgsl"),
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
            label: Some("orientation BGL"),
            entries: &[
                // Gaussian layers of the octave.
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
                storage(1, true),  // candidates
                storage(2, false), // peak angles
                storage(3, false), // peak counts
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
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
                label: Some("orientation"),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });
        let pipeline = gpu
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("orientation"),
                layout: Some(&layout),
                module: &shader,
                entry_point: "orient",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });

        // Sized to the extraction headroom: orientation runs before the
        // ranked truncation, so it can see more candidates than the
        // feature buffers hold.
        let max_candidates = crate::gpu::extract::candidate_capacity(config.max_nb_sift_per_buffer);
        let max_slots = orientation_slots(config);
        let cand_size = (max_candidates as u64) * std::mem::size_of::<Candidate>() as u64;
        let peaks_size = (max_candidates as u64) * (max_slots as u64) * 4;
        let counts_size = (max_candidates as u64) * 4;

        let mk = |label: &str, size, usage| {
            gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage,
                mapped_at_creation: false,
            })
        };
        let rw = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC;
        let map = wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST;

        OrientationStage {
            pipeline,
            bgl,
            candidates: mk(
                "orientation candidates",
                cand_size,
                wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            ),
            peaks: mk("orientation peaks", peaks_size, rw),
            counts: mk("orientation counts", counts_size, rw),
            peaks_readback: mk("peaks readback", peaks_size, map),
            counts_readback: mk("counts readback", counts_size, map),
            max_candidates,
            max_slots,
        }
    }

    /// Upload the sorted candidates, run the per-octave dispatches and
    /// expand (candidate index, orientation) pairs in canonical order.
    pub fn run(
        &self,
        gpu: &GpuDevice,
        scale_space: &ScaleSpace,
        candidates: &[Candidate],
    ) -> Result<Vec<(usize, f32)>> {
        debug_assert!(candidates.len() <= self.max_candidates as usize);
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        gpu.queue
            .write_buffer(&self.candidates, 0, bytemuck::cast_slice(candidates));

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("orientation"),
            });

        for (octave, first, count) in octave_ranges(candidates) {
            let oct = &scale_space.octaves[octave as usize];
            let params = OrientationParams {
                first,
                count,
                width: oct.width,
                height: oct.height,
                seed_sigma: scale_space.schedule.seed_sigma,
                nb_scales: scale_space.schedule.nb_scales,
                max_slots: self.max_slots,
                _pad: 0,
            };
            let params_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("orientation params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
            let bind = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("orientation BG"),
                layout: &self.bgl,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(&oct.gauss_array),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: self.candidates.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: self.peaks.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: self.counts.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: params_buf.as_entire_binding(),
                    },
                ],
            });

            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("orientation"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind, &[]);
            pass.dispatch_workgroups((count + WG_LINEAR - 1) / WG_LINEAR, 1, 1);
        }

        let n = candidates.len() as u64;
        encoder.copy_buffer_to_buffer(
            &self.peaks,
            0,
            &self.peaks_readback,
            0,
            n * self.max_slots as u64 * 4,
        );
        encoder.copy_buffer_to_buffer(&self.counts, 0, &self.counts_readback, 0, n * 4);
        gpu.queue.submit(std::iter::once(encoder.finish()));

        let counts = read_u32s(gpu, &self.counts_readback, candidates.len())?;
        let peaks = read_f32s(
            gpu,
            &self.peaks_readback,
            candidates.len() * self.max_slots as usize,
        )?;

        let mut out = Vec::new();
        for (i, &count) in counts.iter().enumerate() {
            let count = count.min(self.max_slots) as usize;
            for k in 0..count {
                out.push((i, peaks[i * self.max_slots as usize + k]));
            }
        }
        Ok(out)
    }
}

/// Contiguous (octave, first, count) ranges of a canonically sorted
/// candidate list.
fn octave_ranges(candidates: &[Candidate]) -> Vec<(u32, u32, u32)> {
    let mut ranges = Vec::new();
    let mut start = 0usize;
    while start < candidates.len() {
        let octave = candidates[start].octave;
        let mut end = start + 1;
        while end < candidates.len() && candidates[end].octave == octave {
            end += 1;
        }
        ranges.push((octave, start as u32, (end - start) as u32));
        start = end;
    }
    ranges
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

fn read_f32s(gpu: &GpuDevice, buffer: &wgpu::Buffer, count: usize) -> Result<Vec<f32>> {
    let slice = buffer.slice(..(count * 4) as u64);
    map_readback(gpu, slice)?;
    let out = {
        let mapped = slice.get_mapped_range();
        bytemuck::cast_slice::<u8, f32>(&mapped).to_vec()
    };
    buffer.unmap();
    Ok(out)
}

fn read_u32s(gpu: &GpuDevice, buffer: &wgpu::Buffer, count: usize) -> Result<Vec<u32>> {
    let slice = buffer.slice(..(count * 4) as u64);
    map_readback(gpu, slice)?;
    let out = {
        let mapped = slice.get_mapped_range();
        bytemuck::cast_slice::<u8, u32>(&mapped).to_vec()
    };
    buffer.unmap();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn cand(octave: u32) -> Candidate {
        Candidate {
            octave,
            scale_idx: 1,
            ix: 0,
            iy: 0,
            x: 0.0,
            y: 0.0,
            delta_scale: 0.0,
            response: 0.1,
        }
    }

    #[test]
    fn slots_follow_configured_cap() {
        let cfg = Config::default();
        assert_eq!(orientation_slots(&cfg), 4);

        let cfg = Config::builder()
            .max_nb_orientation_per_keypoint(0)
            .build()
            .unwrap();
        assert_eq!(orientation_slots(&cfg), NB_ORIENTATION_BINS);

        let cfg = Config::builder()
            .max_nb_orientation_per_keypoint(100)
            .build()
            .unwrap();
        assert_eq!(orientation_slots(&cfg), NB_ORIENTATION_BINS);
    }

    #[test]
    fn octave_ranges_partition_sorted_candidates() {
        let cands = vec![cand(0), cand(0), cand(0), cand(2), cand(3), cand(3)];
        let ranges = octave_ranges(&cands);
        assert_eq!(ranges, vec![(0, 0, 3), (2, 3, 1), (3, 4, 2)]);
    }

    #[test]
    fn octave_ranges_of_empty_list_is_empty() {
        assert!(octave_ranges(&[]).is_empty());
    }
}
